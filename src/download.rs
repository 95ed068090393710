use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::bus::signals::{Signal, SignalBus};
use crate::device::{DeviceInfo, Paths};
use crate::error::{NetworkError, UpdaterError};
use crate::jobs::{JobGuard, JobTable, ProgressMonitor};
use crate::policy::{Policy, TransferPath};
use crate::status::{FwDownloadStatus, FwUpdateState, StatusChannel, StatusWriter};
use crate::xconf::cache::{CacheLookup, XconfCache};

/// Staging paths beyond this length would truncate on the platform's
/// fixed-size property buffers downstream.
const MAX_STAGING_PATH: usize = 256;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub const DOWNLOAD_IN_PROGRESS: &str = "IN_PROGRESS";
pub const DOWNLOAD_COMPLETED: &str = "COMPLETED";
pub const DOWNLOAD_FAILURE: &str = "FAILURE";
pub const DOWNLOAD_CANCELLED: &str = "CANCELLED";

/// Firmware image classes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageKind {
    Pci,
    Pdri,
    Peripheral,
}

impl FromStr for ImageKind {
    type Err = UpdaterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PCI" => Ok(ImageKind::Pci),
            "PDRI" => Ok(ImageKind::Pdri),
            "PERIPHERAL" => Ok(ImageKind::Peripheral),
            other => Err(UpdaterError::invalid_args(format!(
                "unknown firmware type {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageKind::Pci => "PCI",
            ImageKind::Pdri => "PDRI",
            ImageKind::Peripheral => "PERIPHERAL",
        })
    }
}

impl ImageKind {
    pub fn status_channel(self) -> StatusChannel {
        match self {
            ImageKind::Pdri => StatusChannel::Pdri,
            _ => StatusChannel::Normal,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub handle_id: u64,
    pub firmware_name: String,
    /// `None` means resolve from the freshest catalog answer; an empty
    /// string supplied by the caller is an error.
    pub url: Option<String>,
    pub kind: ImageKind,
}

/// Download state machine: Validating → Resolving → Downloading →
/// Completed | Error.
///
/// Validation runs synchronously on the dispatch path; everything after
/// the job is accepted happens on a worker task and is reported through
/// signals.
pub struct DownloadManager {
    device: Arc<DeviceInfo>,
    paths: Arc<Paths>,
    policy: Arc<Policy>,
    cache: Arc<XconfCache>,
    jobs: Arc<JobTable>,
    signals: SignalBus,
    status: Arc<StatusWriter>,
    http: reqwest::Client,
}

impl DownloadManager {
    pub fn new(
        device: Arc<DeviceInfo>,
        paths: Arc<Paths>,
        policy: Arc<Policy>,
        cache: Arc<XconfCache>,
        jobs: Arc<JobTable>,
        signals: SignalBus,
        status: Arc<StatusWriter>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("rdkfwupdater")
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("building download HTTP client failed")?;
        Ok(DownloadManager {
            device,
            paths,
            policy,
            cache,
            jobs,
            signals,
            status,
            http,
        })
    }

    /// Validates the request and accepts the job, spawning the transfer
    /// worker. Returns once the job is accepted; progress and the terminal
    /// outcome arrive via signals.
    #[instrument(skip(self, request), fields(handle_id = request.handle_id, firmware = %request.firmware_name))]
    pub fn start(self: &Arc<Self>, request: DownloadRequest) -> Result<(), UpdaterError> {
        // Validating
        if request.firmware_name.is_empty() {
            return Err(UpdaterError::invalid_args("firmware name must not be empty"));
        }
        if request.firmware_name.contains('/') {
            return Err(UpdaterError::invalid_args("firmware name must be a bare file name"));
        }
        if matches!(request.url.as_deref(), Some("")) {
            return Err(UpdaterError::invalid_args(
                "download URL must not be empty when supplied",
            ));
        }
        let staging = self.device.difw_path.join(&request.firmware_name);
        if staging.as_os_str().len() >= MAX_STAGING_PATH {
            return Err(UpdaterError::invalid_args("staging path too long"));
        }
        if self.policy.is_in_state_red() {
            return Err(UpdaterError::platform(
                "device is in state red; downloads are blocked until recovery",
            ));
        }
        if self.policy.is_external_download_active() {
            return Err(UpdaterError::AlreadyInProgress(
                "an externally triggered download is".into(),
            ));
        }

        let source = self.resolve_source(&request)?;

        let guard = self.jobs.begin_download(request.handle_id, &request.firmware_name)?;
        self.status
            .write_update_state(FwUpdateState::DownloadInProgress);
        metrics::counter!("fwupdater_downloads_total", "result" => "started").increment(1);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_transfer(request, source, staging, guard).await;
        });
        Ok(())
    }

    /// Resolving: explicit URL wins; otherwise the freshest catalog answer
    /// supplies it.
    fn resolve_source(&self, request: &DownloadRequest) -> Result<Url, UpdaterError> {
        let raw = match &request.url {
            Some(explicit) => explicit.clone(),
            None => {
                let CacheLookup::Hit(record) = self.cache.read() else {
                    return Err(UpdaterError::invalid_args(
                        "no download URL supplied and no catalog answer available",
                    ));
                };
                match request.kind {
                    ImageKind::Peripheral => {
                        let peripheral = record
                            .response
                            .peripheral(&request.firmware_name)
                            .ok_or_else(|| {
                                UpdaterError::invalid_args(format!(
                                    "peripheral {:?} not advertised by the catalog",
                                    request.firmware_name
                                ))
                            })?;
                        peripheral.location.clone()
                    }
                    _ => {
                        let prefer_ipv6 = self.paths.ip_route_flag.exists()
                            && record.response.ipv6_firmware_location.starts_with("http");
                        record.response.firmware_url(prefer_ipv6).ok_or_else(|| {
                            UpdaterError::invalid_args(
                                "catalog answer carries no firmware location",
                            )
                        })?
                    }
                }
            }
        };
        Url::parse(&raw)
            .map_err(|err| UpdaterError::invalid_args(format!("bad download URL {raw:?}: {err}")))
    }

    /// Picks the transfer path for this attempt. Direct is preferred;
    /// block files divert to codebig or refuse outright.
    fn pick_transfer_path(&self) -> Result<TransferPath, UpdaterError> {
        if !self.policy.is_download_blocked(TransferPath::Direct) {
            Ok(TransferPath::Direct)
        } else if !self.policy.is_download_blocked(TransferPath::Codebig) {
            Ok(TransferPath::Codebig)
        } else {
            Err(UpdaterError::Network(NetworkError::Connection(
                "both direct and codebig transfer paths are blocked".into(),
            )))
        }
    }

    async fn run_transfer(
        self: Arc<Self>,
        request: DownloadRequest,
        source: Url,
        staging: PathBuf,
        guard: JobGuard,
    ) {
        let handle_id = guard.handle_id;
        let name = guard.firmware_name.clone();

        let signals = self.signals.clone();
        let monitor_name = name.clone();
        let monitor = ProgressMonitor::spawn(
            Arc::clone(&guard.progress),
            guard.cancel.clone(),
            move |boundary, raw| {
                signals.publish(Signal::DownloadProgress {
                    handle_id,
                    firmware_name: monitor_name.clone(),
                    progress: u32::from(boundary),
                    status: DOWNLOAD_IN_PROGRESS.into(),
                    message: format!("{raw}% received"),
                });
            },
        );

        let outcome = match self.pick_transfer_path() {
            Ok(path) => match self.transfer(&source, &staging, &guard).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    // Open the block window for the path that failed.
                    if !is_cancelled(&err) {
                        self.policy.block_download_path(path);
                    }
                    Err(err)
                }
            },
            Err(err) => Err(err),
        };

        // The monitor never outlives the worker; join it before the
        // terminal signal so nothing trails it.
        monitor.stop().await;

        match outcome {
            Ok(()) => {
                info!(firmware = %name, "download complete");
                metrics::counter!("fwupdater_downloads_total", "result" => "completed")
                    .increment(1);
                self.signals.publish(Signal::DownloadProgress {
                    handle_id,
                    firmware_name: name.clone(),
                    progress: 100,
                    status: DOWNLOAD_COMPLETED.into(),
                    message: format!("{name} downloaded"),
                });
                self.record(&request, &source, FwUpdateState::DownloadComplete, "Success", "");
            }
            Err(err) => {
                let cancelled = is_cancelled(&err);
                let status = if cancelled {
                    DOWNLOAD_CANCELLED
                } else {
                    DOWNLOAD_FAILURE
                };
                warn!(firmware = %name, %err, "download failed");
                metrics::counter!("fwupdater_downloads_total", "result" => if cancelled { "cancelled" } else { "failed" })
                    .increment(1);
                if let Some(code) = err.tls_code() {
                    self.policy.enter_state_red_on_tls_error(code);
                }
                let _ = tokio::fs::remove_file(part_path(&staging)).await;
                self.signals.publish(Signal::DownloadError {
                    handle_id,
                    firmware_name: name.clone(),
                    status: status.into(),
                    error_message: err.to_string(),
                });
                self.record(
                    &request,
                    &source,
                    FwUpdateState::DownloadFailed,
                    status,
                    &err.to_string(),
                );
            }
        }
        // Job record is freed only now, after the terminal signal.
        drop(guard);
    }

    /// Downloading: streams the body to `<staging>.part`, then verifies
    /// the checksum sidecar and renames into place.
    async fn transfer(
        &self,
        source: &Url,
        staging: &Path,
        guard: &JobGuard,
    ) -> Result<(), UpdaterError> {
        // Cancellation is observed before the blocking request and at
        // every chunk boundary after it.
        let response = tokio::select! {
            () = guard.cancel.cancelled() => {
                return Err(UpdaterError::platform("download cancelled"));
            }
            sent = self.http.get(source.clone()).send() => {
                sent.map_err(|err| UpdaterError::Network(NetworkError::from_reqwest(&err)))?
            }
        };
        let status = response.status();
        if !status.is_success() {
            return Err(UpdaterError::Network(NetworkError::Http {
                status: status.as_u16(),
            }));
        }

        let total = response.content_length().unwrap_or(0);
        if total > 0 {
            ensure_free_space(staging, total)?;
        }
        debug!(total, "transfer started");

        let part = part_path(staging);
        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|err| UpdaterError::platform(format!("cannot create {part:?}: {err}")))?;

        let mut response = response;
        let mut received: u64 = 0;
        loop {
            let chunk = tokio::select! {
                () = guard.cancel.cancelled() => {
                    return Err(UpdaterError::platform("download cancelled"));
                }
                chunk = response.chunk() => chunk
                    .map_err(|err| UpdaterError::Network(NetworkError::from_reqwest(&err)))?,
            };
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk)
                .await
                .map_err(|err| UpdaterError::platform(format!("write to {part:?} failed: {err}")))?;
            received += chunk.len() as u64;
            if total > 0 {
                guard.progress.set(((received * 100) / total).min(99) as u8);
            }
        }
        file.flush()
            .await
            .map_err(|err| UpdaterError::platform(format!("flush of {part:?} failed: {err}")))?;
        drop(file);

        verify_checksum_sidecar(staging, &part).await?;

        tokio::fs::rename(&part, staging)
            .await
            .map_err(|err| UpdaterError::platform(format!("rename to {staging:?} failed: {err}")))?;
        guard.progress.set(100);
        Ok(())
    }

    fn record(
        &self,
        request: &DownloadRequest,
        source: &Url,
        state: FwUpdateState,
        status: &str,
        failure_reason: &str,
    ) {
        self.status.write_update_state(state);
        let (version, delay) = match self.cache.read() {
            CacheLookup::Hit(rec) => (
                rec.response.firmware_version.clone(),
                rec.response.delay_download.to_string(),
            ),
            _ => (String::new(), String::new()),
        };
        let record = FwDownloadStatus {
            proto: source.scheme().to_string(),
            status: status.to_string(),
            failure_reason: failure_reason.to_string(),
            dnld_versn: version,
            dnld_file: request.firmware_name.clone(),
            dnld_url: source.to_string(),
            delay_download: delay,
            ..FwDownloadStatus::new(state)
        };
        if let Err(err) = self.status.append(request.kind.status_channel(), &record) {
            warn!(%err, "could not append download status record");
        }
    }
}

fn part_path(staging: &Path) -> PathBuf {
    let mut name = staging.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn is_cancelled(err: &UpdaterError) -> bool {
    matches!(err, UpdaterError::Platform(msg) if msg.contains("cancelled"))
}

/// Free-space gate before committing to a transfer.
fn ensure_free_space(staging: &Path, needed: u64) -> Result<(), UpdaterError> {
    let dir = staging.parent().unwrap_or(Path::new("/"));
    let stat = nix::sys::statvfs::statvfs(dir)
        .map_err(|err| UpdaterError::platform(format!("statvfs on {dir:?} failed: {err}")))?;
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    if available < needed {
        return Err(UpdaterError::platform(format!(
            "not enough space in {dir:?}: {available} bytes free, {needed} needed"
        )));
    }
    Ok(())
}

/// When `<name>.header` exists it carries a `crc = <hex>` line for the
/// image; a mismatch fails the download.
async fn verify_checksum_sidecar(staging: &Path, part: &Path) -> Result<(), UpdaterError> {
    let mut header = staging.as_os_str().to_os_string();
    header.push(".header");
    let header = PathBuf::from(header);

    let Ok(text) = tokio::fs::read_to_string(&header).await else {
        return Ok(());
    };
    let Some(expected) = text.lines().find_map(|line| {
        let value = line.trim().strip_prefix("crc")?.trim_start().strip_prefix('=')?;
        u32::from_str_radix(value.trim(), 16).ok()
    }) else {
        warn!(?header, "checksum sidecar present but carries no crc line");
        return Ok(());
    };

    let bytes = tokio::fs::read(part)
        .await
        .map_err(|err| UpdaterError::platform(format!("cannot read back {part:?}: {err}")))?;
    let actual = crc32fast::hash(&bytes);
    if actual != expected {
        return Err(UpdaterError::platform(format!(
            "checksum mismatch: sidecar says {expected:08x}, image hashes to {actual:08x}"
        )));
    }
    Ok(())
}
