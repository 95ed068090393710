pub mod bus;
pub mod coordinator;
pub mod device;
pub mod download;
pub mod error;
pub mod flash;
pub mod jobs;
pub mod metrics;
pub mod notifier;
pub mod policy;
pub mod registry;
pub mod status;
pub mod xconf;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use nix::fcntl::{Flock, FlockArg};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::router::api_router;
use crate::bus::{Signal, SignalBus};
use crate::coordinator::Coordinator;
use crate::device::{DeviceInfo, Paths};
use crate::download::DownloadManager;
use crate::flash::{FlashManager, RebootDelays, Scripts};
use crate::jobs::JobTable;
use crate::metrics::router::metrics_router;
use crate::notifier::{Notifier, TlsConfig};
use crate::policy::Policy;
use crate::registry::Registry;
use crate::status::StatusWriter;
use crate::xconf::cache::XconfCache;
use crate::xconf::XconfClient;

/// Outbound signal fan-out capacity; slow subscribers lag rather than
/// block the workers.
const SIGNAL_CAPACITY: usize = 64;
/// Initial backoff delay for MQTT reconnection attempts (in milliseconds).
const MQTT_INITIAL_BACKOFF_MS: u64 = 100;
/// Maximum backoff delay for MQTT reconnection attempts (in milliseconds).
/// Caps the exponential growth to prevent excessively long waits.
const MQTT_MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Firmware catalog (XConf) endpoint.
    #[clap(long, env)]
    pub xconf_url: String,
    #[clap(long, env, default_value = "/etc/device.properties")]
    pub device_properties: PathBuf,
    #[clap(long, env, default_value = "/version.txt")]
    pub version_file: PathBuf,
    #[clap(long, env, default_value = "/opt/fwdnld")]
    pub persistent_dir: PathBuf,
    #[clap(long, env, default_value = "/tmp")]
    pub tmp_dir: PathBuf,
    /// Catalog cache time-to-live in seconds; 0 refreshes once per daemon
    /// start.
    #[clap(long, env, default_value_t = 0)]
    pub xconf_cache_ttl_secs: u64,
    #[clap(long, env, default_value = "/lib/rdk/imageFlasher.sh")]
    pub flasher_script: PathBuf,
    #[clap(long, env, default_value = "/rebootNow.sh")]
    pub reboot_script: PathBuf,
    #[clap(long, env, default_value = "/etc/rdm/rdmBundleMgr.sh")]
    pub rdm_script: PathBuf,
    /// Canary reboots upload a report here before rebooting.
    #[clap(long, env)]
    pub telemetry_url: Option<String>,
    #[clap(long, env, default_value = "127.0.0.1:50050")]
    pub listen_addr: String,
    #[clap(long, env, default_value = "127.0.0.1:50051")]
    pub metrics_listen_addr: String,
    #[clap(long, env)]
    pub mqtt_url: Option<String>,
    #[clap(long, env, default_value = "")]
    pub mqtt_username: String,
    #[clap(long, env, default_value = "")]
    pub mqtt_password: String,
    #[clap(long, env, default_value = "rdkfwupdater/signals")]
    pub mqtt_topic: String,
    /// Path to MQTT CA certificate file (enables TLS if provided)
    #[clap(long, env)]
    pub mqtt_ca_cert_path: Option<String>,
    /// Path to MQTT client certificate file
    #[clap(long, env)]
    pub mqtt_client_cert_path: Option<String>,
    /// Path to MQTT client key file
    #[clap(long, env)]
    pub mqtt_client_key_path: Option<String>,
    #[clap(long, env, default_value = "info")]
    log_level: LevelFilter,
}

/// Everything the engine needs, independent of the serving surface.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub xconf_url: String,
    pub device_properties: PathBuf,
    pub version_file: PathBuf,
    pub persistent_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub xconf_cache_ttl: Duration,
    pub flasher_script: PathBuf,
    pub reboot_script: PathBuf,
    pub rdm_script: Option<PathBuf>,
    pub telemetry_url: Option<String>,
    pub reboot_delays: RebootDelays,
}

impl DaemonConfig {
    fn from_cli(cli: &Cli) -> Self {
        DaemonConfig {
            xconf_url: cli.xconf_url.clone(),
            device_properties: cli.device_properties.clone(),
            version_file: cli.version_file.clone(),
            persistent_dir: cli.persistent_dir.clone(),
            tmp_dir: cli.tmp_dir.clone(),
            xconf_cache_ttl: Duration::from_secs(cli.xconf_cache_ttl_secs),
            flasher_script: cli.flasher_script.clone(),
            reboot_script: cli.reboot_script.clone(),
            rdm_script: Some(cli.rdm_script.clone()),
            telemetry_url: cli.telemetry_url.clone(),
            reboot_delays: RebootDelays::default(),
        }
    }
}

/// The lifetime-owning root of every subsystem. There are no ambient
/// singletons; all state hangs off this struct and is torn down with it.
pub struct Daemon {
    pub device: Arc<DeviceInfo>,
    pub paths: Arc<Paths>,
    pub policy: Arc<Policy>,
    pub status: Arc<StatusWriter>,
    pub registry: Arc<Registry>,
    pub jobs: Arc<JobTable>,
    pub signals: SignalBus,
    pub cache: Arc<XconfCache>,
    pub coordinator: Arc<Coordinator>,
    pub downloads: Arc<DownloadManager>,
    pub flashes: Arc<FlashManager>,
    pub shutdown: CancellationToken,
}

impl Daemon {
    /// Builds every subsystem. Fails on unreadable device properties or an
    /// uncreatable persistent directory (the daemon then exits 1).
    pub fn new(config: DaemonConfig, shutdown: CancellationToken) -> Result<Arc<Self>> {
        let device = Arc::new(
            DeviceInfo::load(&config.device_properties, &config.version_file)
                .context("loading device information failed")?,
        );
        std::fs::create_dir_all(&config.persistent_dir)
            .with_context(|| format!("creating {:?} failed", config.persistent_dir))?;
        let paths = Arc::new(Paths::new(&config.persistent_dir, &config.tmp_dir));

        let signals = SignalBus::new(SIGNAL_CAPACITY);
        let policy = Arc::new(Policy::new(
            Arc::clone(&device),
            Arc::clone(&paths),
            shutdown.clone(),
        ));
        let status = Arc::new(StatusWriter::new(&paths));
        let registry = Arc::new(Registry::new());
        let jobs = Arc::new(JobTable::new());
        let cache = Arc::new(XconfCache::new(
            paths.xconf_cache.clone(),
            paths.xconf_cache_lock.clone(),
            config.xconf_cache_ttl,
        ));
        let client = XconfClient::new(
            config.xconf_url.clone(),
            Arc::clone(&device),
            Arc::clone(&paths),
        )?;
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&cache),
            client,
            Arc::clone(&device),
            Arc::clone(&paths),
            Arc::clone(&policy),
            signals.clone(),
            Arc::clone(&status),
            config.rdm_script.clone(),
        ));
        let downloads = Arc::new(DownloadManager::new(
            Arc::clone(&device),
            Arc::clone(&paths),
            Arc::clone(&policy),
            Arc::clone(&cache),
            Arc::clone(&jobs),
            signals.clone(),
            Arc::clone(&status),
        )?);
        let flashes = Arc::new(FlashManager::new(
            Arc::clone(&device),
            Arc::clone(&paths),
            Arc::clone(&policy),
            Arc::clone(&cache),
            Arc::clone(&jobs),
            signals.clone(),
            Arc::clone(&status),
            Scripts {
                flasher: config.flasher_script.clone(),
                reboot: config.reboot_script.clone(),
            },
            config.reboot_delays.clone(),
            config.telemetry_url.clone(),
        )?);

        Ok(Arc::new(Daemon {
            device,
            paths,
            policy,
            status,
            registry,
            jobs,
            signals,
            cache,
            coordinator,
            downloads,
            flashes,
            shutdown,
        }))
    }

    /// The bus method surface for this daemon.
    pub fn router(self: &Arc<Self>) -> axum::Router {
        api_router(Arc::clone(self))
    }

    pub fn subscribe_signals(&self) -> tokio::sync::broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    /// Peer presence lost: sweep its registrations and cancel their jobs.
    pub fn peer_disconnected(&self, caller: &str) {
        for handle_id in self.registry.on_peer_disconnect(caller) {
            self.jobs.cancel_for_handle(handle_id);
        }
    }
}

/// Runs the daemon with the provided CLI configuration.
///
/// Initializes logging, takes the single-instance lock, builds the engine,
/// then serves the bus and metrics surfaces until shutdown. Exits with an
/// error (process code 1) on startup failure or after entering state red.
pub async fn run(cli: Cli) -> Result<()> {
    tracing_subscriber::registry()
        .with(cli.log_level)
        .with(fmt::layer())
        .init();

    // Graceful shutdown setup
    let cancel_token = CancellationToken::new();

    let ctrl_c_listener_task = tokio::spawn({
        let cancel_token_clone = cancel_token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, proceeding with graceful shutdown...");
            }
            cancel_token_clone.cancel();
        }
    });

    let config = DaemonConfig::from_cli(&cli);
    let daemon = Daemon::new(config, cancel_token.clone())?;

    // Refuse to run twice on the same device.
    let _instance_lock = acquire_instance_lock(&daemon.paths.instance_lock)?;

    info!(
        model = %daemon.device.model,
        running = %daemon.device.running_version,
        "firmware updater ready"
    );

    // MQTT signal mirror setup
    if let Some(mqtt_url) = cli.mqtt_url {
        let tls_config = load_mqtt_tls(
            cli.mqtt_ca_cert_path.as_deref(),
            cli.mqtt_client_cert_path.as_deref(),
            cli.mqtt_client_key_path.as_deref(),
        )?;
        let (notifier, mut eventloop) = Notifier::new(
            mqtt_url,
            cli.mqtt_username,
            cli.mqtt_password,
            cli.mqtt_topic,
            tls_config,
        )
        .context("Failed to initialize notifier")?;

        let mqtt_cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            use rumqttc::{Event, Packet};
            let mut consecutive_errors: u32 = 0;
            loop {
                tokio::select! {
                    () = mqtt_cancel_token.cancelled() => {
                        info!("MQTT event loop shutting down");
                        break;
                    }
                    result = eventloop.poll() => {
                        match result {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                if consecutive_errors > 0 {
                                    info!(
                                        previous_errors = consecutive_errors,
                                        "MQTT connection restored"
                                    );
                                }
                                consecutive_errors = 0;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                consecutive_errors = consecutive_errors.saturating_add(1);

                                if consecutive_errors == 1 {
                                    error!(error = ?e, "MQTT connection error");
                                } else {
                                    debug!(
                                        error = ?e,
                                        consecutive_errors,
                                        "MQTT still disconnected"
                                    );
                                }

                                let backoff_ms = MQTT_INITIAL_BACKOFF_MS
                                    .saturating_mul(2_u64.saturating_pow(consecutive_errors.saturating_sub(1)))
                                    .min(MQTT_MAX_BACKOFF_MS);

                                // Use select to allow cancellation during backoff sleep
                                tokio::select! {
                                    () = mqtt_cancel_token.cancelled() => {
                                        info!("MQTT event loop shutting down during backoff");
                                        break;
                                    }
                                    () = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                                }
                            }
                        }
                    }
                }
            }
        });

        // Mirror every outbound signal to the broker.
        let mut rx = daemon.subscribe_signals();
        let mirror_cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = mirror_cancel_token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(signal) => {
                            if let Err(e) = notifier.publish(&signal).await {
                                warn!(error = ?e, "Failed to mirror signal over MQTT");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "signal mirror lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    tokio::try_join!(
        start_bus_server(&cli.listen_addr, Arc::clone(&daemon), cancel_token.clone()),
        start_metrics_server(&cli.metrics_listen_addr, cancel_token.clone()),
    )?;

    ctrl_c_listener_task.abort();

    if daemon.policy.state_red_exit_requested() {
        bail!("daemon entered state red; exiting for recovery");
    }

    info!("All services shut down gracefully.");
    Ok(())
}

async fn start_bus_server(
    listen_address: &str,
    daemon: Arc<Daemon>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen_address).await?;
    info!("bus surface listening on {}", listener.local_addr()?);

    let shutdown_future = async move {
        cancel_token.cancelled().await;
    };

    axum::serve(listener, daemon.router())
        .with_graceful_shutdown(shutdown_future)
        .await?;
    info!("Bus server shut down gracefully");
    Ok(())
}

async fn start_metrics_server(listen_address: &str, cancel_token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(listen_address).await?;
    info!("Metrics server listening on {}", listener.local_addr()?);

    let shutdown_future = async move {
        cancel_token.cancelled().await;
    };

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(shutdown_future)
        .await?;
    info!("Metrics server shut down gracefully");
    Ok(())
}

/// Exclusive flock on the instance lock file; holds until the daemon
/// exits. A second instance fails here and exits 1.
fn acquire_instance_lock(path: &Path) -> Result<Flock<std::fs::File>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("opening instance lock {path:?} failed"))?;
    let mut lock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
        .map_err(|(_, errno)| anyhow!("another updater instance holds {path:?}: {errno}"))?;
    let _ = lock.write_all(std::process::id().to_string().as_bytes());
    Ok(lock)
}

fn load_mqtt_tls(
    ca_path: Option<&str>,
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> Result<Option<TlsConfig>> {
    let Some(ca_path) = ca_path else {
        return Ok(None);
    };
    let ca_cert =
        std::fs::read(ca_path).map_err(|e| anyhow!("Failed to read MQTT CA cert: {e}"))?;

    // Client auth is optional - only if both cert and key are provided
    let client_auth = match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let client_cert = std::fs::read(cert_path)
                .map_err(|e| anyhow!("Failed to read MQTT client cert: {e}"))?;
            let client_key = std::fs::read(key_path)
                .map_err(|e| anyhow!("Failed to read MQTT client key: {e}"))?;
            Some((client_cert, client_key))
        }
        (None, None) => None,
        _ => {
            warn!(
                "Incomplete MQTT client auth configuration: both mqtt_client_cert_path and \
                 mqtt_client_key_path must be provided for client authentication. \
                 Continuing without client auth."
            );
            None
        }
    };

    Ok(Some(TlsConfig {
        ca_cert,
        client_auth,
    }))
}
