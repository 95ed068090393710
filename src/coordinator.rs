use parking_lot::Mutex;
use std::fs;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::bus::signals::{Signal, SignalBus};
use crate::device::{DeviceInfo, Paths};
use crate::policy::{Policy, SoftwareOptout};
use crate::status::{FwUpdateState, StatusWriter};
use crate::xconf::cache::{unix_now, CacheLookup, XconfCache};
use crate::xconf::models::{CachedResponse, XconfResponse};
use crate::xconf::XconfClient;

/// Wire status codes for check-for-update replies and signals.
pub const FIRMWARE_AVAILABLE: i32 = 0;
pub const FIRMWARE_NOT_AVAILABLE: i32 = 1;
pub const FIRMWARE_CHECK_ERROR: i32 = 2;
pub const UPDATE_NOT_ALLOWED: i32 = 3;
pub const IGNORE_OPTOUT: i32 = 4;
pub const BYPASS_OPTOUT: i32 = 5;

/// Immediate reply to a check-for-update method call.
#[derive(Clone, Debug)]
pub struct CheckReply {
    pub current_version: String,
    pub available_version: String,
    pub update_details: String,
    pub status_message: String,
    pub status_code: i32,
    /// Whether the caller should expect a `CheckForUpdateComplete` signal.
    pub terminal_signal_pending: bool,
}

/// Single-flight fetch state. `in_flight` implies `waiters` is exactly the
/// set of clients to notify on the next completion, in arrival order.
struct FlightState {
    in_flight: bool,
    waiters: Vec<u64>,
    fetch_token: u64,
}

/// Check-for-update coordinator layered over the catalog cache.
///
/// Concurrent callers during a cache miss piggyback on the one in-flight
/// fetch and all receive the same terminal signal. The in-flight flag is
/// only ever read or written under the state lock.
pub struct Coordinator {
    state: Mutex<FlightState>,
    cache: Arc<XconfCache>,
    client: XconfClient,
    device: Arc<DeviceInfo>,
    paths: Arc<Paths>,
    policy: Arc<Policy>,
    signals: SignalBus,
    status: Arc<StatusWriter>,
    /// Bundle-manager helper invoked when the catalog advertises a new RDM
    /// catalogue version. Absent in minimal deployments.
    rdm_script: Option<std::path::PathBuf>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<XconfCache>,
        client: XconfClient,
        device: Arc<DeviceInfo>,
        paths: Arc<Paths>,
        policy: Arc<Policy>,
        signals: SignalBus,
        status: Arc<StatusWriter>,
        rdm_script: Option<std::path::PathBuf>,
    ) -> Self {
        Coordinator {
            state: Mutex::new(FlightState {
                in_flight: false,
                waiters: Vec::new(),
                fetch_token: 0,
            }),
            cache,
            client,
            device,
            paths,
            policy,
            signals,
            status,
            rdm_script,
        }
    }

    /// Handles one check-for-update call for an already-validated handle.
    ///
    /// Cache hit: the answer is derived locally and no signal follows.
    /// Cache miss: the caller joins the waiter list (starting the fetch if
    /// none is running) and gets a pending reply.
    #[instrument(skip(self))]
    pub fn check_for_update(self: &Arc<Self>, handle_id: u64) -> CheckReply {
        // Cache I/O happens outside the coordinator lock; readers are safe
        // against the writer through the atomic rename.
        let lookup = self.cache.read();
        if let CacheLookup::Corrupt = lookup {
            // Corrupt counts as a miss; drop the artifact before refetching.
            self.cache.invalidate();
        }
        if let CacheLookup::Hit(record) = lookup {
            metrics::counter!("fwupdater_check_cache_hit_total").increment(1);
            debug!("catalog cache hit");
            return self.evaluate(&record.response);
        }
        metrics::counter!("fwupdater_check_cache_miss_total").increment(1);

        let started = {
            let mut state = self.state.lock();
            state.waiters.push(handle_id);
            if state.in_flight {
                None
            } else {
                state.in_flight = true;
                state.fetch_token += 1;
                Some(state.fetch_token)
            }
        };
        match started {
            Some(token) => {
                info!(token, "starting catalog fetch cycle");
                self.status.write_update_state(FwUpdateState::CheckInProgress);
                let coordinator = Arc::clone(self);
                tokio::spawn(async move { coordinator.run_fetch(token).await });
            }
            None => debug!("catalog fetch already in flight, piggybacking"),
        }

        CheckReply {
            current_version: self.device.running_version.clone(),
            available_version: String::new(),
            update_details: String::new(),
            status_message: "ERROR: check in progress, result follows via signal".into(),
            status_code: FIRMWARE_CHECK_ERROR,
            terminal_signal_pending: true,
        }
    }

    /// The fetch worker: one per cycle, never more than one outbound
    /// catalog request at a time.
    async fn run_fetch(self: Arc<Self>, token: u64) {
        // The catalog is unreachable until the device has a route and its
        // clock; fail the cycle instead of burning the request timeout.
        let outcome = if self.policy.is_connected_to_internet() {
            self.client.fetch().await
        } else {
            Err(crate::error::UpdaterError::platform(
                "device is not connected to the internet",
            ))
        };

        let reply = match outcome {
            Ok((response, http_status)) => {
                metrics::counter!("fwupdater_xconf_fetch_total", "result" => "ok").increment(1);
                let record = CachedResponse {
                    response,
                    fetched_at: unix_now(),
                    http_status,
                };
                // A write failure downgrades to the in-memory answer.
                if let Err(err) = self.cache.store(&record) {
                    warn!(%err, "catalog cache write failed, continuing with in-memory answer");
                }
                self.postprocess_catalog(&record.response).await;
                self.status.write_update_state(FwUpdateState::CheckComplete);
                self.evaluate(&record.response)
            }
            Err(err) => {
                metrics::counter!("fwupdater_xconf_fetch_total", "result" => "error").increment(1);
                warn!(%err, "catalog fetch failed");
                if let Some(code) = err.tls_code() {
                    self.policy.enter_state_red_on_tls_error(code);
                }
                CheckReply {
                    current_version: self.device.running_version.clone(),
                    available_version: String::new(),
                    update_details: String::new(),
                    status_message: format!("ERROR: {err}"),
                    status_code: FIRMWARE_CHECK_ERROR,
                    terminal_signal_pending: false,
                }
            }
        };

        // Fan out one identical terminal signal per waiter, arrival order.
        let waiters = {
            let mut state = self.state.lock();
            debug_assert_eq!(state.fetch_token, token);
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        let result = if reply.status_code == FIRMWARE_CHECK_ERROR {
            -1
        } else {
            0
        };
        info!(waiters = waiters.len(), status_code = reply.status_code, "fetch cycle complete");
        for handle_id in waiters {
            self.signals.publish(Signal::CheckForUpdateComplete {
                handle_id,
                result,
                status_code: reply.status_code,
                current_version: reply.current_version.clone(),
                available_version: reply.available_version.clone(),
                update_details: reply.update_details.clone(),
                status_message: reply.status_message.clone(),
            });
        }
    }

    /// Side effects of a fresh catalog answer that are independent of any
    /// client: RDM catalogue version persistence and bundle refresh.
    async fn postprocess_catalog(&self, response: &XconfResponse) {
        if response.rdm_catalogue_version.is_empty() {
            return;
        }
        let previous = fs::read_to_string(&self.paths.rdm_catalogue_version)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if previous == response.rdm_catalogue_version {
            return;
        }
        if let Err(err) = fs::write(
            &self.paths.rdm_catalogue_version,
            format!("{}\n", response.rdm_catalogue_version),
        ) {
            warn!(%err, "could not persist RDM catalogue version");
        }
        if let Some(script) = &self.rdm_script {
            let status = Command::new("sh")
                .arg(script)
                .arg(&response.rdm_catalogue_version)
                .arg(&response.firmware_location)
                .status()
                .await;
            match status {
                Ok(status) if status.success() => {
                    info!(version = %response.rdm_catalogue_version, "RDM bundle refresh complete");
                }
                Ok(status) => warn!(?status, "RDM bundle refresh failed"),
                Err(err) => warn!(%err, "could not run RDM bundle refresh"),
            }
        }
    }

    /// Derives the reply from a catalog answer and local device state.
    fn evaluate(&self, response: &XconfResponse) -> CheckReply {
        let current = self.device.running_version.clone();
        let available = response.firmware_version.clone();
        let details = serde_json::to_string(response).unwrap_or_default();

        let status_code = self.classify(response);
        let status_message = match status_code {
            FIRMWARE_AVAILABLE => "Firmware update available",
            FIRMWARE_NOT_AVAILABLE => "No firmware update available",
            UPDATE_NOT_ALLOWED => "Image not valid for this model",
            IGNORE_OPTOUT => "Update held by software opt-out",
            BYPASS_OPTOUT => "Update bypasses software opt-out",
            _ => "Firmware check failed",
        };

        CheckReply {
            current_version: current,
            available_version: available,
            update_details: details,
            status_message: status_message.into(),
            status_code,
            terminal_signal_pending: false,
        }
    }

    fn classify(&self, response: &XconfResponse) -> i32 {
        if response.firmware_version.is_empty() {
            return FIRMWARE_NOT_AVAILABLE;
        }
        if !response.firmware_filename.contains(&self.device.model) {
            return UPDATE_NOT_ALLOWED;
        }
        if response.firmware_version == self.device.running_version {
            return FIRMWARE_NOT_AVAILABLE;
        }
        // A version equal to the image already flashed to the stand-by bank
        // is not offered again.
        let flashed = fs::read_to_string(&self.paths.cdl_flashed_file_name)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if !flashed.is_empty() && flashed == response.firmware_filename {
            return FIRMWARE_NOT_AVAILABLE;
        }
        match self.policy.software_optout() {
            SoftwareOptout::Enforce => IGNORE_OPTOUT,
            SoftwareOptout::Bypass => BYPASS_OPTOUT,
            SoftwareOptout::None => FIRMWARE_AVAILABLE,
        }
    }
}
