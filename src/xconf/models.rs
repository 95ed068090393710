use serde::{Deserialize, Serialize};

/// A peripheral image advertised alongside the main firmware.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralFirmware {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub location: String,
}

/// One catalog answer from XConf. Field names mirror the wire protocol.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct XconfResponse {
    #[serde(default)]
    pub firmware_filename: String,
    #[serde(default)]
    pub firmware_location: String,
    #[serde(default, rename = "ipv6FirmwareLocation")]
    pub ipv6_firmware_location: String,
    #[serde(default)]
    pub firmware_version: String,
    #[serde(default)]
    pub firmware_download_protocol: String,
    /// Wire value is the string "true" or "false".
    #[serde(default)]
    pub reboot_immediately: String,
    /// Minutes the device should hold the download after a scheduled check.
    #[serde(default)]
    pub delay_download: u32,
    /// PDRI image version rider.
    #[serde(default)]
    pub additional_fw_ver_info: String,
    #[serde(default)]
    pub peripheral_firmwares: Vec<PeripheralFirmware>,
    #[serde(default)]
    pub dl_cert_bundle: String,
    #[serde(default)]
    pub rdm_catalogue_version: String,
}

impl XconfResponse {
    pub fn reboot_immediately(&self) -> bool {
        self.reboot_immediately.eq_ignore_ascii_case("true")
    }

    /// Download URL for the main image: location + "/" + filename.
    pub fn firmware_url(&self, prefer_ipv6: bool) -> Option<String> {
        let location = if prefer_ipv6 && !self.ipv6_firmware_location.is_empty() {
            &self.ipv6_firmware_location
        } else {
            &self.firmware_location
        };
        if location.is_empty() || self.firmware_filename.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}",
            location.trim_end_matches('/'),
            self.firmware_filename
        ))
    }

    pub fn peripheral(&self, name: &str) -> Option<&PeripheralFirmware> {
        self.peripheral_firmwares.iter().find(|p| p.name == name)
    }
}

/// The on-disk cache artifact: the response plus a fetch envelope.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    #[serde(flatten)]
    pub response: XconfResponse,
    /// Unix seconds at which the fetch completed.
    pub fetched_at: u64,
    pub http_status: u16,
}
