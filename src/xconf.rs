pub mod cache;
pub mod models;

use anyhow::{Context, Result};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::device::{DeviceInfo, Paths};
use crate::error::{NetworkError, UpdaterError};
use models::XconfResponse;

/// XConf requests time out after 30 seconds.
const XCONF_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote catalog client. One instance per daemon; the coordinator's
/// single-flight guard guarantees at most one outbound request at a time.
pub struct XconfClient {
    http: reqwest::Client,
    url: String,
    device: Arc<DeviceInfo>,
    paths: Arc<Paths>,
}

impl XconfClient {
    pub fn new(url: String, device: Arc<DeviceInfo>, paths: Arc<Paths>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("rdkfwupdater")
            .timeout(XCONF_TIMEOUT)
            .build()
            .context("building XConf HTTP client failed")?;
        Ok(XconfClient {
            http,
            url,
            device,
            paths,
        })
    }

    /// Queries the catalog with the device's metadata.
    ///
    /// Returns the parsed answer and the HTTP status for the cache
    /// envelope.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn fetch(&self) -> Result<(XconfResponse, u16), UpdaterError> {
        let form = self.query_form();
        debug!(params = form.len(), "querying firmware catalog");

        let response = self
            .http
            .post(&self.url)
            .form(&form)
            .send()
            .await
            .map_err(|err| UpdaterError::Network(NetworkError::from_reqwest(&err)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdaterError::Network(NetworkError::Http {
                status: status.as_u16(),
            }));
        }

        let parsed: XconfResponse = response
            .json()
            .await
            .map_err(|err| UpdaterError::Platform(format!("catalog answer unparseable: {err}")))?;
        Ok((parsed, status.as_u16()))
    }

    /// Device metadata sent with every catalog query, form-encoded.
    fn query_form(&self) -> Vec<(&'static str, String)> {
        let d = &self.device;
        let localtime = OffsetDateTime::now_utc()
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .unwrap_or_default();
        let timezone = fs::read_to_string(self.paths.persistent_dir.join("timezone"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "UTC".into());
        let rdm_catalogue = fs::read_to_string(&self.paths.rdm_catalogue_version)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        vec![
            ("eStbMac", d.estb_mac.clone()),
            ("firmwareVersion", d.running_version.clone()),
            ("additionalFwVerInfo", d.running_pdri_version.clone()),
            ("model", d.model.clone()),
            ("partnerId", d.partner_id.clone()),
            ("osClass", d.os_class.clone()),
            ("accountId", d.account_id.clone()),
            ("experience", d.experience.clone()),
            ("serialNum", d.serial_number.clone()),
            ("localtime", localtime),
            ("timezone", timezone),
            ("rdmCatalogueVersion", rdm_catalogue),
            ("capabilities", "RCDL,supportsFullHttpUrl".into()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Paths;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn device() -> Arc<DeviceInfo> {
        Arc::new(DeviceInfo {
            model: "AX061AEI".into(),
            device_name: "PLATFORM".into(),
            device_type: "mediaclient".into(),
            cpu_arch: "ARM".into(),
            difw_path: PathBuf::from("/tmp"),
            pdri_enabled: false,
            stage2_lock_file: None,
            running_version: "AX061AEI_4.1.0.0".into(),
            running_pdri_version: "unknown".into(),
            estb_mac: "AA:BB:CC:DD:EE:FF".into(),
            partner_id: "global".into(),
            os_class: "unknown".into(),
            account_id: "acct-1".into(),
            experience: "unknown".into(),
            serial_number: "SN123".into(),
            build_type: "prod".into(),
        })
    }

    #[test]
    fn query_form_carries_identity_and_version() {
        let dir = tempdir().unwrap();
        let paths = Arc::new(Paths::new(dir.path(), dir.path()));
        fs::write(&paths.rdm_catalogue_version, "7\n").unwrap();

        let client = XconfClient::new("http://xconf.local/query".into(), device(), paths).unwrap();
        let form = client.query_form();

        let get = |key: &str| {
            form.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("eStbMac"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(get("firmwareVersion"), "AX061AEI_4.1.0.0");
        assert_eq!(get("model"), "AX061AEI");
        assert_eq!(get("rdmCatalogueVersion"), "7");
        assert!(!get("localtime").is_empty());
    }
}
