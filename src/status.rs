use parking_lot::Mutex;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;
use tracing::warn;

use crate::device::Paths;

/// Firmware-update-state transitions consumed by external agents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FwUpdateState {
    Uninitialized,
    CheckInProgress,
    CheckComplete,
    DownloadInProgress,
    DownloadComplete,
    DownloadFailed,
    FlashInProgress,
    FlashFailed,
    ValidationComplete,
    PostponedMaintenance,
    NoUpgradeRequired,
}

impl fmt::Display for FwUpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FwUpdateState::Uninitialized => "Uninitialized",
            FwUpdateState::CheckInProgress => "Check in progress",
            FwUpdateState::CheckComplete => "Check complete",
            FwUpdateState::DownloadInProgress => "Download in progress",
            FwUpdateState::DownloadComplete => "Download complete",
            FwUpdateState::DownloadFailed => "Download failed",
            FwUpdateState::FlashInProgress => "Flashing in progress",
            FwUpdateState::FlashFailed => "Flashing failed",
            FwUpdateState::ValidationComplete => "Validation complete",
            FwUpdateState::PostponedMaintenance => "On-hold for maintenance",
            FwUpdateState::NoUpgradeRequired => "No upgrade needed",
        };
        f.write_str(text)
    }
}

/// One append-only status record, written as `Key|Value` lines.
#[derive(Clone, Debug, Default)]
pub struct FwDownloadStatus {
    pub method: String,
    pub proto: String,
    pub status: String,
    pub reboot: String,
    pub failure_reason: String,
    pub dnld_versn: String,
    pub dnld_file: String,
    pub dnld_url: String,
    pub fw_update_state: String,
    pub delay_download: String,
}

impl FwDownloadStatus {
    pub fn new(state: FwUpdateState) -> Self {
        FwDownloadStatus {
            method: "xconf".into(),
            fw_update_state: state.to_string(),
            ..Default::default()
        }
    }
}

/// Which status path a record belongs to: PDRI records go to the alternate
/// file, everything else to the normal one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusChannel {
    Normal,
    Pdri,
}

/// Appends status records and update-state transitions for external
/// consumers. Writes are serialized so concurrent jobs never interleave
/// inside a record group.
pub struct StatusWriter {
    status_file: PathBuf,
    pdri_status_file: PathBuf,
    update_state_file: PathBuf,
    system_events: PathBuf,
    lock: Mutex<()>,
}

impl StatusWriter {
    pub fn new(paths: &Arc<Paths>) -> Self {
        StatusWriter {
            status_file: paths.status_file.clone(),
            pdri_status_file: paths.pdri_status_file.clone(),
            update_state_file: paths.update_state_file.clone(),
            system_events: paths.system_events.clone(),
            lock: Mutex::new(()),
        }
    }

    /// Appends one record group, newline-terminated, flushed as a unit.
    /// Records are never rewritten.
    pub fn append(&self, channel: StatusChannel, record: &FwDownloadStatus) -> std::io::Result<()> {
        let path = match channel {
            StatusChannel::Normal => &self.status_file,
            StatusChannel::Pdri => &self.pdri_status_file,
        };
        let last_run = OffsetDateTime::now_utc()
            .format(&Rfc2822)
            .unwrap_or_default();

        let _guard = self.lock.lock();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        write!(
            file,
            "Method|{}\nProto|{}\nStatus|{}\nReboot|{}\nFailureReason|{}\nDnldVersn|{}\nDnldFile|{}\nDnldURL|{}\nLastRun|{}\nFwUpdateState|{}\nDelayDownload|{}\n",
            record.method,
            record.proto,
            record.status,
            record.reboot,
            record.failure_reason,
            record.dnld_versn,
            record.dnld_file,
            record.dnld_url,
            last_run,
            record.fw_update_state,
            record.delay_download,
        )?;
        file.flush()
    }

    /// Rewrites the single-line update-state file.
    pub fn write_update_state(&self, state: FwUpdateState) {
        let _guard = self.lock.lock();
        if let Err(err) = std::fs::write(&self.update_state_file, format!("{state}\n")) {
            warn!(%err, "could not write update-state file");
        }
    }

    /// Publishes a platform system-state event code (`IMAGE_*`, `MAINT_*`,
    /// `FW_STATE_*`). The platform bus is represented by an append-only
    /// event file observed by the orchestrators.
    pub fn emit_system_event(&self, code: &str) {
        let _guard = self.lock.lock();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.system_events)
            .and_then(|mut f| writeln!(f, "{code}"));
        if let Err(err) = result {
            warn!(code, %err, "could not publish system event");
        }
    }
}
