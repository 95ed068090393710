use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::device::{DeviceInfo, Paths};
use crate::error::STATE_RED_TLS_CODES;

/// Direct-path downloads stay blocked for this long after a direct failure.
pub const DIRECT_BLOCK_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Codebig-path downloads stay blocked for 30 minutes after a codebig failure.
pub const CB_BLOCK_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Which transfer path a download wants to take.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferPath {
    Direct,
    Codebig,
}

/// Software opt-out stance recorded by the maintenance manager.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SoftwareOptout {
    None,
    Enforce,
    Bypass,
}

/// Why a check-for-update cycle was started. Canary reboot deferral only
/// applies to cycles forced through the check-now channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TriggerType {
    Boot = 1,
    Scheduled = 2,
    CheckNow = 3,
}

/// Stateless predicates over the flag-file surface and device properties.
///
/// Each call probes the filesystem at the moment it is asked; nothing is
/// memoized, so external agents can flip flags between calls.
pub struct Policy {
    device: Arc<DeviceInfo>,
    paths: Arc<Paths>,
    shutdown: CancellationToken,
    state_red_exit: AtomicBool,
}

impl Policy {
    pub fn new(device: Arc<DeviceInfo>, paths: Arc<Paths>, shutdown: CancellationToken) -> Self {
        Policy {
            device,
            paths,
            shutdown,
            state_red_exit: AtomicBool::new(false),
        }
    }

    pub fn is_pdri_enabled(&self) -> bool {
        self.device.pdri_enabled
    }

    /// State red is only meaningful on devices that ship the recovery
    /// image machinery (signalled through the build type).
    pub fn is_state_red_supported(&self) -> bool {
        !self.device.build_type.eq_ignore_ascii_case("vbn")
    }

    pub fn is_in_state_red(&self) -> bool {
        self.is_state_red_supported() && self.paths.state_red_flag.exists()
    }

    pub fn is_ocsp_enabled(&self) -> bool {
        self.paths.tmp_dir.join(".EnableOCSPStapling").exists()
            || self.paths.tmp_dir.join(".EnableOCSPCA").exists()
    }

    /// Download throttle: media clients defer a flash while video is
    /// playing unless the caller asked for an immediate reboot.
    pub fn is_throttle_enabled(&self, device_name: &str, reboot_now: bool, app_mode: &str) -> bool {
        if reboot_now {
            return false;
        }
        let _ = device_name;
        self.device.is_media_client() && !app_mode.eq_ignore_ascii_case("background")
    }

    /// Connectivity gate: a default route must have been learned and the
    /// system time must have been set (STT received).
    pub fn is_connected_to_internet(&self) -> bool {
        self.paths.ip_route_flag.exists() && self.paths.stt_received.exists()
    }

    /// Whether another download channel (SNMP/ECM/HTTP triggered) holds the
    /// device.
    pub fn is_external_download_active(&self) -> bool {
        self.paths.http_cdl_flag.exists()
            || self.paths.snmp_cdl_flag.exists()
            || self.paths.ecm_cdl_flag.exists()
    }

    /// A transfer path is blocked while its block file is younger than the
    /// path's window (24 h direct, 30 min codebig).
    pub fn is_download_blocked(&self, path: TransferPath) -> bool {
        match path {
            TransferPath::Direct => {
                file_younger_than(&self.paths.direct_block, DIRECT_BLOCK_WINDOW)
            }
            TransferPath::Codebig => file_younger_than(&self.paths.cb_block, CB_BLOCK_WINDOW),
        }
    }

    /// Records a failure on the given path, opening its block window.
    pub fn block_download_path(&self, path: TransferPath) {
        let flag = match path {
            TransferPath::Direct => &self.paths.direct_block,
            TransferPath::Codebig => &self.paths.cb_block,
        };
        if let Err(err) = fs::write(flag, b"") {
            warn!(?flag, %err, "could not write block file");
        }
    }

    /// XConf may ask the device to hold a download for `delay_minutes`.
    /// The window applies to scheduled boots only; maintenance-manager
    /// driven cycles and operator-forced checks run immediately.
    pub fn is_delay_window_required(
        &self,
        delay_minutes: u32,
        maintenance_managed: bool,
        trigger: TriggerType,
    ) -> bool {
        delay_minutes > 0 && !maintenance_managed && trigger == TriggerType::Boot
    }

    /// Trigger type of the current cycle, derived from the check-now flag.
    pub fn current_trigger(&self) -> TriggerType {
        if self.paths.xconf_check_now.exists() {
            TriggerType::CheckNow
        } else {
            TriggerType::Boot
        }
    }

    /// Contents of the check-now flag (e.g. `CANARY`), when present.
    pub fn check_now_value(&self) -> Option<String> {
        fs::read_to_string(&self.paths.xconf_check_now)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Current `softwareoptout` stance from the maintenance record.
    pub fn software_optout(&self) -> SoftwareOptout {
        let Ok(text) = fs::read_to_string(&self.paths.maint_optout) else {
            return SoftwareOptout::None;
        };
        for line in text.lines() {
            if let Some(value) = line.trim().strip_prefix("softwareoptout=") {
                return match value.trim() {
                    "ENFORCE_OPTOUT" => SoftwareOptout::Enforce,
                    "BYPASS_OPTOUT" => SoftwareOptout::Bypass,
                    _ => SoftwareOptout::None,
                };
            }
        }
        SoftwareOptout::None
    }

    /// Rewrites a bypass stance back to enforce once the bypassed update
    /// has been applied.
    pub fn enforce_optout_after_bypass(&self) {
        let Ok(text) = fs::read_to_string(&self.paths.maint_optout) else {
            return;
        };
        if !text.contains("softwareoptout=BYPASS_OPTOUT") {
            return;
        }
        let rewritten = text.replace(
            "softwareoptout=BYPASS_OPTOUT",
            "softwareoptout=ENFORCE_OPTOUT",
        );
        if let Err(err) = fs::write(&self.paths.maint_optout, rewritten) {
            warn!(%err, "could not rewrite opt-out record");
        }
    }

    /// Enters state red if `code` is in the TLS class set and the device
    /// supports it. Persists the flag file and requests daemon shutdown;
    /// the process exits 1 once the current cycle unwinds.
    ///
    /// Returns true when state red was entered.
    pub fn enter_state_red_on_tls_error(&self, code: u32) -> bool {
        if !STATE_RED_TLS_CODES.contains(&code) || !self.is_state_red_supported() {
            return false;
        }
        if let Err(err) = fs::write(&self.paths.state_red_flag, code.to_string()) {
            error!(%err, "could not persist state-red flag");
            return false;
        }
        info!(code, "entering state red; requesting shutdown");
        self.state_red_exit.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        true
    }

    /// Clears the state-red flag after a successful recovery flash.
    pub fn clear_state_red(&self) {
        if self.paths.state_red_flag.exists() {
            if let Err(err) = fs::remove_file(&self.paths.state_red_flag) {
                warn!(%err, "could not clear state-red flag");
            } else {
                info!("state red cleared");
            }
        }
    }

    /// Whether a state-red shutdown has been requested this run.
    pub fn state_red_exit_requested(&self) -> bool {
        self.state_red_exit.load(Ordering::SeqCst)
    }
}

fn file_younger_than(path: &Path, window: Duration) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age < window,
        // Clock skew puts the file in the future; treat as fresh.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInfo;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn test_device(device_type: &str, build_type: &str) -> Arc<DeviceInfo> {
        Arc::new(DeviceInfo {
            model: "AX061AEI".into(),
            device_name: "PLATFORM".into(),
            device_type: device_type.into(),
            cpu_arch: "ARM".into(),
            difw_path: PathBuf::from("/tmp"),
            pdri_enabled: true,
            stage2_lock_file: None,
            running_version: "AX061AEI_4.1.0.0".into(),
            running_pdri_version: "unknown".into(),
            estb_mac: "AA:BB:CC:DD:EE:FF".into(),
            partner_id: "global".into(),
            os_class: "unknown".into(),
            account_id: "unknown".into(),
            experience: "unknown".into(),
            serial_number: "unknown".into(),
            build_type: build_type.into(),
        })
    }

    fn setup(device_type: &str, build_type: &str) -> (tempfile::TempDir, Policy) {
        let dir = tempdir().unwrap();
        let paths = Arc::new(Paths::new(dir.path(), dir.path()));
        let policy = Policy::new(
            test_device(device_type, build_type),
            paths,
            CancellationToken::new(),
        );
        (dir, policy)
    }

    #[test]
    fn block_windows_open_and_expire() {
        let (_dir, policy) = setup("mediaclient", "prod");
        assert!(!policy.is_download_blocked(TransferPath::Direct));
        assert!(!policy.is_download_blocked(TransferPath::Codebig));

        policy.block_download_path(TransferPath::Direct);
        assert!(policy.is_download_blocked(TransferPath::Direct));
        // The direct window does not leak into the codebig path.
        assert!(!policy.is_download_blocked(TransferPath::Codebig));
    }

    #[test]
    fn state_red_entry_persists_flag_and_requests_shutdown() {
        let (_dir, policy) = setup("mediaclient", "prod");
        assert!(!policy.is_in_state_red());

        assert!(!policy.enter_state_red_on_tls_error(28)); // timeout class, not TLS
        assert!(!policy.is_in_state_red());

        assert!(policy.enter_state_red_on_tls_error(60));
        assert!(policy.is_in_state_red());
        assert!(policy.state_red_exit_requested());

        policy.clear_state_red();
        assert!(!policy.is_in_state_red());
    }

    #[test]
    fn vbn_builds_never_enter_state_red() {
        let (_dir, policy) = setup("mediaclient", "VBN");
        assert!(!policy.enter_state_red_on_tls_error(60));
        assert!(!policy.is_in_state_red());
    }

    #[test]
    fn throttle_requires_media_client_foreground() {
        let (_dir, policy) = setup("mediaclient", "prod");
        assert!(policy.is_throttle_enabled("PLATFORM", false, "foreground"));
        assert!(!policy.is_throttle_enabled("PLATFORM", true, "foreground"));
        assert!(!policy.is_throttle_enabled("PLATFORM", false, "background"));

        let (_dir, policy) = setup("hybrid", "prod");
        assert!(!policy.is_throttle_enabled("PLATFORM", false, "foreground"));
    }

    #[test]
    fn connectivity_needs_route_and_time() {
        let (dir, policy) = setup("mediaclient", "prod");
        assert!(!policy.is_connected_to_internet());
        fs::write(dir.path().join("route_available"), b"").unwrap();
        assert!(!policy.is_connected_to_internet());
        fs::write(dir.path().join("stt_received"), b"").unwrap();
        assert!(policy.is_connected_to_internet());
    }

    #[test]
    fn ocsp_follows_its_flag_files() {
        let (dir, policy) = setup("mediaclient", "prod");
        assert!(!policy.is_ocsp_enabled());
        fs::write(dir.path().join(".EnableOCSPStapling"), b"").unwrap();
        assert!(policy.is_ocsp_enabled());
    }

    #[test]
    fn external_cdl_flags_block_the_device() {
        let (dir, policy) = setup("mediaclient", "prod");
        assert!(!policy.is_external_download_active());
        fs::write(dir.path().join("snmp_cdl_in_progress"), b"").unwrap();
        assert!(policy.is_external_download_active());
    }

    #[test]
    fn optout_stance_follows_the_maintenance_record() {
        let (dir, policy) = setup("mediaclient", "prod");
        assert_eq!(policy.software_optout(), SoftwareOptout::None);

        let record = dir.path().join("maintenance_mgr_record.conf");
        fs::write(&record, "softwareoptout=BYPASS_OPTOUT\n").unwrap();
        assert_eq!(policy.software_optout(), SoftwareOptout::Bypass);

        policy.enforce_optout_after_bypass();
        assert_eq!(policy.software_optout(), SoftwareOptout::Enforce);
    }

    #[test]
    fn delay_window_only_for_plain_boot_triggers() {
        let (_dir, policy) = setup("mediaclient", "prod");
        assert!(policy.is_delay_window_required(10, false, TriggerType::Boot));
        assert!(!policy.is_delay_window_required(0, false, TriggerType::Boot));
        assert!(!policy.is_delay_window_required(10, true, TriggerType::Boot));
        assert!(!policy.is_delay_window_required(10, false, TriggerType::CheckNow));
    }
}
