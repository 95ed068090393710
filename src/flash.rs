use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::bus::signals::{Signal, SignalBus};
use crate::device::{DeviceInfo, Paths};
use crate::download::ImageKind;
use crate::error::UpdaterError;
use crate::jobs::{JobGuard, JobTable, ProgressMonitor};
use crate::policy::{Policy, TriggerType};
use crate::status::{FwDownloadStatus, FwUpdateState, StatusWriter};
use crate::xconf::cache::{CacheLookup, XconfCache};
use crate::xconf::models::XconfResponse;

/// Wire status codes carried by `UpdateProgress`.
pub const UPDATE_COMPLETED: i32 = 0;
pub const NO_UPGRADE_REQUIRED: i32 = 1;
pub const UPDATE_DEFERRED: i32 = 2;
pub const UPDATE_FAILED: i32 = 3;
pub const UPDATE_NOT_ALLOWED: i32 = 4;

/// Terminal error signals carry a negative progress.
pub const PROGRESS_ERROR: i32 = -1;

#[derive(Clone, Debug)]
pub struct FlashRequest {
    pub handle_id: u64,
    pub firmware_name: String,
    pub kind: ImageKind,
    /// Directory holding the image; defaults to the staging directory.
    pub location: Option<String>,
    pub reboot_immediately: bool,
}

/// Helper programs the flasher invokes. All children are spawned with an
/// argument vector; caller-supplied strings never pass through a shell.
#[derive(Clone, Debug)]
pub struct Scripts {
    pub flasher: PathBuf,
    pub reboot: PathBuf,
}

/// Waits applied before policy-driven reboots.
#[derive(Clone, Debug)]
pub struct RebootDelays {
    pub critical: Duration,
    pub pending: Duration,
}

impl Default for RebootDelays {
    fn default() -> Self {
        RebootDelays {
            critical: Duration::from_secs(600),
            pending: Duration::from_secs(2),
        }
    }
}

/// Outcome of the gating stage.
enum Gate {
    Proceed,
    /// Successful no-op: the device already runs (or holds) the image.
    NoUpgrade(String),
    /// Flash deferred by the throttle policy.
    Deferred(String),
    /// Hard refusal (state red, wrong model): terminal UPDATE_NOT_ALLOWED.
    Refused(String),
}

/// Flash state machine: Validating → Gating → Flashing → PostFlash →
/// RebootPolicy → Completed | Error.
pub struct FlashManager {
    device: Arc<DeviceInfo>,
    paths: Arc<Paths>,
    policy: Arc<Policy>,
    cache: Arc<XconfCache>,
    jobs: Arc<JobTable>,
    signals: SignalBus,
    status: Arc<StatusWriter>,
    scripts: Scripts,
    delays: RebootDelays,
    /// Canary reboots are gated on a successful telemetry upload when an
    /// endpoint is configured.
    telemetry_url: Option<String>,
    http: reqwest::Client,
}

impl FlashManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<DeviceInfo>,
        paths: Arc<Paths>,
        policy: Arc<Policy>,
        cache: Arc<XconfCache>,
        jobs: Arc<JobTable>,
        signals: SignalBus,
        status: Arc<StatusWriter>,
        scripts: Scripts,
        delays: RebootDelays,
        telemetry_url: Option<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("rdkfwupdater")
            .timeout(Duration::from_secs(30))
            .build()
            .context("building telemetry HTTP client failed")?;
        Ok(FlashManager {
            device,
            paths,
            policy,
            cache,
            jobs,
            signals,
            status,
            scripts,
            delays,
            telemetry_url,
            http,
        })
    }

    /// Validates the request and accepts the flash job. Progress and the
    /// terminal outcome arrive via `UpdateProgress` signals.
    #[instrument(skip(self, request), fields(handle_id = request.handle_id, firmware = %request.firmware_name))]
    pub fn start(self: &Arc<Self>, request: FlashRequest) -> Result<(), UpdaterError> {
        // Validating
        if request.firmware_name.is_empty() {
            return Err(UpdaterError::invalid_args("firmware name must not be empty"));
        }
        if matches!(request.location.as_deref(), Some("")) {
            return Err(UpdaterError::invalid_args(
                "location must not be empty when supplied",
            ));
        }
        let image_dir = request
            .location
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.device.difw_path.clone());
        let image_path = image_dir.join(&request.firmware_name);
        if !image_path.is_file() {
            return Err(UpdaterError::invalid_args(format!(
                "firmware image {image_path:?} not found"
            )));
        }
        if request.kind == ImageKind::Pdri && !self.policy.is_pdri_enabled() {
            return Err(UpdaterError::platform("PDRI updates are not enabled on this device"));
        }

        // Also refuses while any download is active, device-wide.
        let guard = self
            .jobs
            .begin_flash(request.handle_id, &request.firmware_name)?;
        self.status.write_update_state(FwUpdateState::FlashInProgress);
        metrics::counter!("fwupdater_flashes_total", "result" => "started").increment(1);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_flash(request, image_path, guard).await;
        });
        Ok(())
    }

    async fn run_flash(self: Arc<Self>, request: FlashRequest, image_path: PathBuf, guard: JobGuard) {
        let handle_id = guard.handle_id;
        let name = guard.firmware_name.clone();

        let signals = self.signals.clone();
        let monitor_name = name.clone();
        let monitor = ProgressMonitor::spawn(
            Arc::clone(&guard.progress),
            guard.cancel.clone(),
            move |boundary, raw| {
                signals.publish(Signal::UpdateProgress {
                    handle_id,
                    firmware_name: monitor_name.clone(),
                    progress: i32::from(boundary),
                    status_code: UPDATE_COMPLETED,
                    message: format!("flashing, {raw}%"),
                });
            },
        );

        let catalog = match self.cache.read() {
            CacheLookup::Hit(record) => Some(record.response),
            _ => None,
        };

        let gate = self.gate(&request, catalog.as_ref());
        let outcome = match gate {
            Gate::Proceed => {
                if self.device.is_media_client() {
                    self.status.emit_system_event("IMAGE_FWDNLD_FLASH_INPROGRESS");
                }
                self.invoke_flasher(&request, &image_path, catalog.as_ref(), &guard)
                    .await
            }
            Gate::NoUpgrade(message) => {
                self.record(&request, FwUpdateState::NoUpgradeRequired, &message);
                monitor.stop().await;
                self.terminal(handle_id, &name, 100, NO_UPGRADE_REQUIRED, &message);
                metrics::counter!("fwupdater_flashes_total", "result" => "no_upgrade").increment(1);
                drop(guard);
                return;
            }
            Gate::Deferred(message) => {
                self.record(&request, FwUpdateState::PostponedMaintenance, &message);
                monitor.stop().await;
                self.terminal(handle_id, &name, 100, UPDATE_DEFERRED, &message);
                metrics::counter!("fwupdater_flashes_total", "result" => "deferred").increment(1);
                drop(guard);
                return;
            }
            Gate::Refused(message) => {
                warn!(firmware = %name, %message, "flash not allowed");
                self.record(&request, FwUpdateState::FlashFailed, &message);
                monitor.stop().await;
                metrics::counter!("fwupdater_flashes_total", "result" => "not_allowed").increment(1);
                self.terminal(handle_id, &name, PROGRESS_ERROR, UPDATE_NOT_ALLOWED, &message);
                drop(guard);
                return;
            }
        };

        match outcome {
            Ok(()) => {
                guard.progress.set(100);
                if request.kind == ImageKind::Pci {
                    self.post_flash(&request, &image_path).await;
                }
                self.record(&request, FwUpdateState::ValidationComplete, "Success");
                monitor.stop().await;
                info!(firmware = %name, "flash complete");
                metrics::counter!("fwupdater_flashes_total", "result" => "completed").increment(1);
                self.terminal(
                    handle_id,
                    &name,
                    100,
                    UPDATE_COMPLETED,
                    &format!("{name} flashed"),
                );
                drop(guard);

                if request.kind == ImageKind::Pci && request.reboot_immediately {
                    self.reboot_policy(&name).await;
                }
            }
            Err(err) => {
                // Straight-line cleanup: record, join the monitor, emit the
                // one terminal error, release the job. Nothing retries.
                warn!(firmware = %name, %err, "flash failed");
                self.record(&request, FwUpdateState::FlashFailed, &err.to_string());
                monitor.stop().await;
                metrics::counter!("fwupdater_flashes_total", "result" => "failed").increment(1);
                self.terminal(handle_id, &name, PROGRESS_ERROR, UPDATE_FAILED, &err.to_string());
                drop(guard);
            }
        }
    }

    /// Gating: state red, model match, same-version suppression, stand-by
    /// image check, throttle.
    fn gate(&self, request: &FlashRequest, catalog: Option<&XconfResponse>) -> Gate {
        // While in state red only the recovery flow may flash: a main-image
        // reflash that reboots straight into it. Everything else stays
        // blocked until the device recovers.
        if self.policy.is_in_state_red()
            && !(request.kind == ImageKind::Pci && request.reboot_immediately)
        {
            return Gate::Refused(
                "device is in state red, only a recovery reflash is allowed".into(),
            );
        }

        match request.kind {
            ImageKind::Pci => {
                if !request.firmware_name.contains(&self.device.model) {
                    return Gate::Refused(format!(
                        "image {:?} is not valid for model {}",
                        request.firmware_name, self.device.model
                    ));
                }
                let cloud_version = catalog.map(|c| c.firmware_version.as_str()).unwrap_or("");
                if !cloud_version.is_empty() && cloud_version == self.device.running_version {
                    return Gate::NoUpgrade("No upgrade needed, running version is current".into());
                }
                if request.firmware_name.contains(&self.device.running_version) {
                    return Gate::NoUpgrade("No upgrade needed, image is already running".into());
                }
                let standby = fs::read_to_string(&self.paths.cdl_flashed_file_name)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                if !standby.is_empty() && standby == request.firmware_name {
                    return Gate::NoUpgrade(
                        "No upgrade needed, image already on the stand-by bank".into(),
                    );
                }
            }
            ImageKind::Pdri => {
                let cloud_pdri = catalog
                    .map(|c| c.additional_fw_ver_info.as_str())
                    .unwrap_or("");
                if !cloud_pdri.is_empty() && cloud_pdri == self.device.running_pdri_version {
                    return Gate::NoUpgrade("No upgrade needed, PDRI is current".into());
                }
            }
            ImageKind::Peripheral => {}
        }

        let app_mode = fs::read_to_string(self.paths.tmp_dir.join("app_mode"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "foreground".into());
        if self.policy.is_throttle_enabled(
            &self.device.device_name,
            request.reboot_immediately,
            &app_mode,
        ) {
            return Gate::Deferred("On-Hold for Optout/Throttle".into());
        }

        Gate::Proceed
    }

    /// Flashing: hand the image to the platform flasher and map its exit
    /// status. Coarse progress only: 50 when the child is running, 100 on
    /// success.
    async fn invoke_flasher(
        &self,
        request: &FlashRequest,
        image_path: &Path,
        catalog: Option<&XconfResponse>,
        guard: &JobGuard,
    ) -> Result<(), UpdaterError> {
        let proto = catalog
            .map(|c| c.firmware_download_protocol.clone())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "https".into());
        let server = catalog
            .map(|c| c.firmware_location.clone())
            .unwrap_or_default();
        let image_dir = image_path
            .parent()
            .unwrap_or(Path::new("/"))
            .to_string_lossy()
            .into_owned();
        let reboot_flag = if request.reboot_immediately {
            "true"
        } else {
            "false"
        };
        let kind_arg = match request.kind {
            ImageKind::Pdri => "pdri",
            _ => "pci",
        };

        debug!(flasher = ?self.scripts.flasher, "invoking platform flasher");
        let mut child = Command::new(&self.scripts.flasher)
            .arg(&proto)
            .arg(&server)
            .arg(&image_dir)
            .arg(&request.firmware_name)
            .arg(reboot_flag)
            .arg(kind_arg)
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                UpdaterError::platform(format!(
                    "could not start flasher {:?}: {err}",
                    self.scripts.flasher
                ))
            })?;
        guard.progress.set(50);

        let status = tokio::select! {
            () = guard.cancel.cancelled() => {
                // Dropping the child kills it (kill_on_drop).
                return Err(UpdaterError::platform("flash cancelled"));
            }
            status = child.wait() => status
                .map_err(|err| UpdaterError::platform(format!("flasher wait failed: {err}")))?,
        };
        if !status.success() {
            return Err(UpdaterError::platform(format!(
                "flasher exited with {status}"
            )));
        }
        Ok(())
    }

    /// PostFlash side effects for a successful PCI flash.
    async fn post_flash(&self, request: &FlashRequest, image_path: &Path) {
        self.status.emit_system_event("IMAGE_FWDNLD_FLASH_COMPLETE");

        // Remember what reached the stand-by bank, keeping the old record
        // as the previously flashed image.
        if let Ok(previous) = fs::read_to_string(&self.paths.cdl_flashed_file_name) {
            let _ = fs::write(&self.paths.previously_flashed_image, previous);
        }
        if let Err(err) = fs::write(
            &self.paths.cdl_flashed_file_name,
            format!("{}\n", request.firmware_name),
        ) {
            warn!(%err, "could not record flashed image name");
        }

        // The staged artifact and its checksum sidecar are spent.
        let _ = tokio::fs::remove_file(image_path).await;
        let mut header = image_path.as_os_str().to_os_string();
        header.push(".header");
        let _ = tokio::fs::remove_file(PathBuf::from(header)).await;

        // PLATCO devices program the stage-2 security artifact.
        if self.device.is_platco() {
            if let Some(lock) = &self.device.stage2_lock_file {
                if let Err(err) = fs::write(lock, b"") {
                    warn!(?lock, %err, "could not program stage-2 lock");
                }
            }
        }

        if self.policy.is_in_state_red() {
            // Mark the recovery so the next boot can report it, then leave
            // state red.
            let _ = fs::write(&self.paths.red_state_reboot, b"");
            self.policy.clear_state_red();
        }
    }

    /// RebootPolicy: canary deferral, maintenance-manager hand-off, or the
    /// default notify-and-reboot.
    async fn reboot_policy(&self, firmware_name: &str) {
        let canary = self
            .policy
            .check_now_value()
            .map(|v| v.eq_ignore_ascii_case("CANARY"))
            .unwrap_or(false);

        if canary && self.policy.current_trigger() == TriggerType::CheckNow {
            if self.power_state() == "ON" {
                info!("canary device is in active use, deferring reboot");
                self.status.emit_system_event("DEFER_CANARY_REBOOT");
                return;
            }
            if !self.upload_canary_report(firmware_name).await {
                warn!("canary telemetry upload failed, aborting reboot");
                return;
            }
            self.reboot("CANARY_Update", "rebooting into canary image").await;
            return;
        }

        if self.paths.maint_optout.exists() {
            if self.device.is_platco() {
                self.status.emit_system_event("FW_STATE_CRITICAL_REBOOT");
                tokio::time::sleep(self.delays.critical).await;
                self.reboot("MAINTENANCE_REBOOT", "critical update reboot").await;
            } else {
                self.status.emit_system_event("MAINT_REBOOT_REQUIRED");
                self.policy.enforce_optout_after_bypass();
            }
            return;
        }

        self.status.emit_system_event("RebootPendingNotification");
        let _ = fs::write(&self.paths.preparing_to_reboot, b"");
        tokio::time::sleep(self.delays.pending).await;
        self.reboot("FIRMWARE_UPDATE", "rebooting into new image").await;
    }

    fn power_state(&self) -> String {
        fs::read_to_string(&self.paths.power_state)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "ON".into())
    }

    async fn upload_canary_report(&self, firmware_name: &str) -> bool {
        let Some(url) = &self.telemetry_url else {
            return true;
        };
        let report = serde_json::json!({
            "reason": "CANARY_Update",
            "firmware": firmware_name,
            "mac": self.device.estb_mac,
        });
        match self.http.post(url).json(&report).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!(%err, "canary telemetry request failed");
                false
            }
        }
    }

    async fn reboot(&self, reason: &str, message: &str) {
        info!(reason, "invoking reboot helper");
        let status = Command::new("sh")
            .arg(&self.scripts.reboot)
            .arg("-s")
            .arg(reason)
            .arg("-o")
            .arg(message)
            .status()
            .await;
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(?status, "reboot helper failed"),
            Err(err) => warn!(%err, "could not run reboot helper"),
        }
    }

    fn terminal(&self, handle_id: u64, name: &str, progress: i32, status_code: i32, message: &str) {
        self.signals.publish(Signal::UpdateProgress {
            handle_id,
            firmware_name: name.to_string(),
            progress,
            status_code,
            message: message.to_string(),
        });
    }

    fn record(&self, request: &FlashRequest, state: FwUpdateState, detail: &str) {
        self.status.write_update_state(state);
        let record = FwDownloadStatus {
            status: detail.to_string(),
            reboot: request.reboot_immediately.to_string(),
            dnld_file: request.firmware_name.clone(),
            failure_reason: if state == FwUpdateState::FlashFailed {
                detail.to_string()
            } else {
                String::new()
            },
            ..FwDownloadStatus::new(state)
        };
        if let Err(err) = self.status.append(request.kind.status_channel(), &record) {
            warn!(%err, "could not append flash status record");
        }
    }
}
