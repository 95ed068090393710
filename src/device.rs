use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Read-only view of the device property store plus the running image
/// version. Loaded once at startup; the daemon never writes properties.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub model: String,
    pub device_name: String,
    pub device_type: String,
    pub cpu_arch: String,
    pub difw_path: PathBuf,
    pub pdri_enabled: bool,
    pub stage2_lock_file: Option<PathBuf>,
    /// Version string of the currently running PCI image.
    pub running_version: String,
    /// Version string of the currently running PDRI image, when flashed.
    pub running_pdri_version: String,
    pub estb_mac: String,
    pub partner_id: String,
    pub os_class: String,
    pub account_id: String,
    pub experience: String,
    pub serial_number: String,
    pub build_type: String,
}

impl DeviceInfo {
    /// Loads `KEY=VALUE` properties and the version file.
    ///
    /// Missing optional keys fall back to `"unknown"`; `DIFW_PATH` and
    /// `MODEL_NUM` are required.
    pub fn load(properties_path: &Path, version_path: &Path) -> Result<Self> {
        let props = read_properties(properties_path)
            .with_context(|| format!("reading device properties {properties_path:?}"))?;

        let required = |key: &str| -> Result<String> {
            props
                .get(key)
                .cloned()
                .with_context(|| format!("device property {key} missing in {properties_path:?}"))
        };
        let optional = |key: &str| props.get(key).cloned().unwrap_or_else(|| "unknown".into());

        let running_version = read_version_file(version_path)
            .with_context(|| format!("reading version file {version_path:?}"))?;

        Ok(DeviceInfo {
            model: required("MODEL_NUM")?,
            device_name: optional("DEVICE_NAME"),
            device_type: optional("DEVICE_TYPE"),
            cpu_arch: optional("CPU_ARCH"),
            difw_path: PathBuf::from(required("DIFW_PATH")?),
            pdri_enabled: props
                .get("PDRI_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            stage2_lock_file: props.get("STAGE2LOCKFILE").map(PathBuf::from),
            running_version,
            running_pdri_version: optional("PDRI_VERSION"),
            estb_mac: optional("ESTB_MAC"),
            partner_id: optional("PARTNER_ID"),
            os_class: optional("OS_CLASS"),
            account_id: optional("ACCOUNT_ID"),
            experience: optional("EXPERIENCE"),
            serial_number: optional("SERIAL_NUMBER"),
            build_type: optional("BUILD_TYPE"),
        })
    }

    /// Whether the device is a media client (drives the flash-in-progress
    /// system event and the throttle gate).
    pub fn is_media_client(&self) -> bool {
        self.device_type.eq_ignore_ascii_case("mediaclient")
    }

    /// PLATCO devices take the critical-reboot maintenance path and program
    /// the stage-2 security artifact after a flash.
    pub fn is_platco(&self) -> bool {
        self.os_class.eq_ignore_ascii_case("platco")
    }
}

fn read_properties(path: &Path) -> Result<HashMap<String, String>> {
    let text = fs::read_to_string(path)?;
    let mut props = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                props.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => warn!(line, "skipping malformed device property"),
        }
    }
    Ok(props)
}

/// The version file carries `imagename:<IMAGE>` among other fields; the
/// image name doubles as the running firmware version token.
fn read_version_file(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path)?;
    for line in text.lines() {
        if let Some(rest) = line.trim().strip_prefix("imagename:") {
            return Ok(rest.trim().to_string());
        }
    }
    // Older images carry a bare version string on the first line.
    Ok(text.lines().next().unwrap_or_default().trim().to_string())
}

/// Well-known filesystem surface of the daemon. Everything is rooted at
/// two configurable directories so tests can relocate the whole surface.
#[derive(Clone, Debug)]
pub struct Paths {
    pub persistent_dir: PathBuf,
    pub tmp_dir: PathBuf,

    pub xconf_cache: PathBuf,
    pub xconf_cache_lock: PathBuf,
    pub status_file: PathBuf,
    pub pdri_status_file: PathBuf,
    pub update_state_file: PathBuf,

    pub direct_block: PathBuf,
    pub cb_block: PathBuf,
    pub state_red_flag: PathBuf,
    pub red_state_reboot: PathBuf,

    pub cdl_flashed_file_name: PathBuf,
    pub previously_flashed_image: PathBuf,
    pub rdm_catalogue_version: PathBuf,
    pub maint_optout: PathBuf,

    pub xconf_check_now: PathBuf,
    pub stt_received: PathBuf,
    pub preparing_to_reboot: PathBuf,
    pub ip_route_flag: PathBuf,
    pub http_cdl_flag: PathBuf,
    pub snmp_cdl_flag: PathBuf,
    pub ecm_cdl_flag: PathBuf,
    pub power_state: PathBuf,
    pub system_events: PathBuf,

    pub instance_lock: PathBuf,
}

impl Paths {
    pub fn new(persistent_dir: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> Self {
        let persistent_dir = persistent_dir.into();
        let tmp_dir = tmp_dir.into();
        Paths {
            xconf_cache: persistent_dir.join("xconf_response.json"),
            xconf_cache_lock: persistent_dir.join("xconf_response.lock"),
            status_file: persistent_dir.join("fwdnldstatus.txt"),
            pdri_status_file: persistent_dir.join("pdrifwdnldstatus.txt"),
            update_state_file: tmp_dir.join("fw_update_state"),

            direct_block: tmp_dir.join("direct.block"),
            cb_block: tmp_dir.join("cb.block"),
            state_red_flag: persistent_dir.join("state_red"),
            red_state_reboot: persistent_dir.join("red_state_reboot"),

            cdl_flashed_file_name: persistent_dir.join("cdl_flashed_file_name"),
            previously_flashed_image: persistent_dir.join("previous_flashed_file_name"),
            rdm_catalogue_version: persistent_dir.join("rdm_catalogue_version"),
            maint_optout: persistent_dir.join("maintenance_mgr_record.conf"),

            xconf_check_now: tmp_dir.join("xconfchecknow_val"),
            stt_received: tmp_dir.join("stt_received"),
            preparing_to_reboot: tmp_dir.join("fw_preparing_to_reboot"),
            ip_route_flag: tmp_dir.join("route_available"),
            http_cdl_flag: tmp_dir.join("http_cdl_in_progress"),
            snmp_cdl_flag: tmp_dir.join("snmp_cdl_in_progress"),
            ecm_cdl_flag: tmp_dir.join("ecm_cdl_in_progress"),
            power_state: tmp_dir.join("power_state"),
            system_events: tmp_dir.join("fw_events"),

            instance_lock: tmp_dir.join("rdkfwupdater.lock"),
            persistent_dir,
            tmp_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_properties_and_version() {
        let dir = tempdir().unwrap();
        let props = write_file(
            dir.path(),
            "device.properties",
            "MODEL_NUM=AX061AEI\nDIFW_PATH=/opt/CDL\nDEVICE_TYPE=mediaclient\n# comment\nbadline\n",
        );
        let version = write_file(
            dir.path(),
            "version.txt",
            "imagename:AX061AEI_4.1.0.0\nBRANCH=stable\n",
        );

        let info = DeviceInfo::load(&props, &version).unwrap();
        assert_eq!(info.model, "AX061AEI");
        assert_eq!(info.difw_path, PathBuf::from("/opt/CDL"));
        assert_eq!(info.running_version, "AX061AEI_4.1.0.0");
        assert!(info.is_media_client());
        assert!(!info.pdri_enabled);
        assert_eq!(info.partner_id, "unknown");
    }

    #[test]
    fn missing_required_property_fails() {
        let dir = tempdir().unwrap();
        let props = write_file(dir.path(), "device.properties", "DEVICE_NAME=X\n");
        let version = write_file(dir.path(), "version.txt", "imagename:IMG_1\n");
        assert!(DeviceInfo::load(&props, &version).is_err());
    }

    #[test]
    fn bare_version_file_is_accepted() {
        let dir = tempdir().unwrap();
        let props = write_file(
            dir.path(),
            "device.properties",
            "MODEL_NUM=M\nDIFW_PATH=/tmp\n",
        );
        let version = write_file(dir.path(), "version.txt", "M_1.2.3\n");
        let info = DeviceInfo::load(&props, &version).unwrap();
        assert_eq!(info.running_version, "M_1.2.3");
    }
}
