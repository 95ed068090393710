//! Shared test utilities for the updater integration tests.
//!
//! Builds a daemon rooted in a temp directory, with stub platform scripts
//! and a relocatable flag-file surface, and drives the bus surface with
//! in-process requests.

// Allow dead code since not all test files use all helpers
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use rdkfwupdater::bus::{Signal, PEER_HEADER};
use rdkfwupdater::flash::RebootDelays;
use rdkfwupdater::xconf::cache::unix_now;
use rdkfwupdater::xconf::models::{CachedResponse, XconfResponse};
use rdkfwupdater::{Daemon, DaemonConfig};
use serde_json::Value;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const PEER_A: &str = ":1.101";
pub const PEER_B: &str = ":1.202";
pub const PEER_C: &str = ":1.303";

pub const MODEL: &str = "AX061AEI";
pub const RUNNING_VERSION: &str = "AX061AEI_4.1.0.0";
pub const NEW_VERSION: &str = "AX061AEI_4.2.0.0";
pub const NEW_IMAGE: &str = "AX061AEI_4.2.0.0-signed.bin";

pub struct TestDaemonBuilder {
    device_type: String,
    xconf_url: String,
    cache_ttl_secs: u64,
    flasher_exit: i32,
}

impl TestDaemonBuilder {
    pub fn new() -> Self {
        TestDaemonBuilder {
            device_type: "hybrid".into(),
            // Unroutable by default; tests that fetch point this at a mock.
            xconf_url: "http://127.0.0.1:9/xconf/swu/stb".into(),
            cache_ttl_secs: 3600,
            flasher_exit: 0,
        }
    }

    pub fn device_type(mut self, device_type: &str) -> Self {
        self.device_type = device_type.into();
        self
    }

    pub fn xconf_url(mut self, url: &str) -> Self {
        self.xconf_url = url.into();
        self
    }

    pub fn flasher_exit(mut self, code: i32) -> Self {
        self.flasher_exit = code;
        self
    }

    pub fn build(self) -> TestDaemon {
        let root = TempDir::new().expect("create temp root");
        let persistent = root.path().join("persistent");
        let tmp = root.path().join("tmp");
        let difw = root.path().join("difw");
        for dir in [&persistent, &tmp, &difw] {
            std::fs::create_dir_all(dir).expect("create test dir");
        }

        let properties = root.path().join("device.properties");
        std::fs::write(
            &properties,
            format!(
                "MODEL_NUM={MODEL}\nDIFW_PATH={}\nDEVICE_TYPE={}\nDEVICE_NAME=PLATFORM\nCPU_ARCH=ARM\n",
                difw.display(),
                self.device_type,
            ),
        )
        .expect("write device properties");

        let version_file = root.path().join("version.txt");
        std::fs::write(&version_file, format!("imagename:{RUNNING_VERSION}\n"))
            .expect("write version file");

        // The device is online: default route learned, system time set.
        std::fs::write(tmp.join("route_available"), b"").expect("write route flag");
        std::fs::write(tmp.join("stt_received"), b"").expect("write stt flag");

        let flasher_marker = root.path().join("flasher_invoked");
        let flasher = write_script(
            root.path().join("imageFlasher.sh"),
            &format!(
                "#!/bin/sh\necho \"$@\" > \"{}\"\nexit {}\n",
                flasher_marker.display(),
                self.flasher_exit
            ),
        );
        let reboot_marker = root.path().join("reboot_invoked");
        let reboot = write_script(
            root.path().join("rebootNow.sh"),
            &format!(
                "#!/bin/sh\necho \"$@\" > \"{}\"\nexit 0\n",
                reboot_marker.display()
            ),
        );

        let config = DaemonConfig {
            xconf_url: self.xconf_url,
            device_properties: properties,
            version_file,
            persistent_dir: persistent,
            tmp_dir: tmp,
            xconf_cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            flasher_script: flasher,
            reboot_script: reboot,
            rdm_script: None,
            telemetry_url: None,
            reboot_delays: RebootDelays {
                critical: Duration::from_millis(10),
                pending: Duration::from_millis(10),
            },
        };
        let shutdown = CancellationToken::new();
        let daemon = Daemon::new(config, shutdown.clone()).expect("build daemon");

        TestDaemon {
            daemon,
            shutdown,
            difw,
            flasher_marker,
            reboot_marker,
            _root: root,
        }
    }
}

fn write_script(path: PathBuf, content: &str) -> PathBuf {
    std::fs::write(&path, content).expect("write stub script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("make stub executable");
    path
}

pub struct TestDaemon {
    pub daemon: Arc<Daemon>,
    pub shutdown: CancellationToken,
    pub difw: PathBuf,
    pub flasher_marker: PathBuf,
    pub reboot_marker: PathBuf,
    _root: TempDir,
}

impl TestDaemon {
    /// Posts one bus method call and returns (status, parsed body).
    pub async fn call(&self, method_name: &str, peer: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .uri(format!("/bus/{method_name}"))
            .method("POST")
            .header("content-type", "application/json")
            .header(PEER_HEADER, peer)
            .body(Body::from(body.to_string()))
            .expect("build request");
        let response = self
            .daemon
            .router()
            .oneshot(request)
            .await
            .expect("send request");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    pub async fn register(&self, process_name: &str, peer: &str) -> u64 {
        let (status, body) = self
            .call(
                "RegisterProcess",
                peer,
                serde_json::json!({ "processName": process_name, "libVersion": "1.0.0" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "register failed: {body}");
        body["handleId"].as_u64().expect("handle id")
    }

    pub fn subscribe(&self) -> Receiver<Signal> {
        self.daemon.subscribe_signals()
    }

    /// Seeds the on-disk catalog artifact as if a fetch just completed.
    pub fn seed_catalog(&self, response: XconfResponse) {
        let record = CachedResponse {
            response,
            fetched_at: unix_now(),
            http_status: 200,
        };
        std::fs::write(
            &self.daemon.paths.xconf_cache,
            serde_json::to_vec_pretty(&record).expect("serialize catalog"),
        )
        .expect("seed catalog cache");
    }

    /// Drops a firmware image into the staging directory.
    pub fn stage_image(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.difw.join(name);
        std::fs::write(&path, bytes).expect("stage image");
        path
    }

    pub fn status_file_text(&self) -> String {
        std::fs::read_to_string(&self.daemon.paths.status_file).unwrap_or_default()
    }

    pub fn system_events_text(&self) -> String {
        std::fs::read_to_string(&self.daemon.paths.system_events).unwrap_or_default()
    }
}

/// A catalog answer advertising `NEW_IMAGE` at the given base URL.
pub fn catalog_answer(location: &str) -> XconfResponse {
    XconfResponse {
        firmware_filename: NEW_IMAGE.into(),
        firmware_location: location.into(),
        firmware_version: NEW_VERSION.into(),
        firmware_download_protocol: "http".into(),
        reboot_immediately: "false".into(),
        ..Default::default()
    }
}

/// Mounts the catalog endpoint on a fresh mock server.
pub async fn mock_xconf(answer: &XconfResponse, delay: Duration, expected_hits: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/xconf/swu/stb"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(answer)
                .set_delay(delay),
        )
        .expect(expected_hits)
        .mount(&server)
        .await;
    server
}

/// Waits for the first signal matching the predicate, failing the test on
/// timeout. Non-matching signals are collected and returned alongside.
pub async fn wait_for_signal<F>(
    rx: &mut Receiver<Signal>,
    timeout: Duration,
    mut pred: F,
) -> (Signal, Vec<Signal>)
where
    F: FnMut(&Signal) -> bool,
{
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for signal");
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(signal)) if pred(&signal) => return (signal, seen),
            Ok(Ok(signal)) => seen.push(signal),
            Ok(Err(err)) => panic!("signal bus closed: {err}"),
            Err(_) => panic!("timed out waiting for signal; saw {seen:?}"),
        }
    }
}

/// Asserts that no further signal arrives within the window.
pub async fn assert_no_signal(rx: &mut Receiver<Signal>, window: Duration) {
    match tokio::time::timeout(window, rx.recv()).await {
        Err(_) => {}
        Ok(received) => panic!("unexpected signal: {received:?}"),
    }
}

/// Initialize tracing for tests (only once).
///
/// Defaults to `warn` level to reduce noise. Use `RUST_LOG=debug` for verbose output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .with_test_writer()
        .try_init();
}
