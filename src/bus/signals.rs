use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Outbound event signals, one variant per wire signal.
///
/// Handle ids are numeric end-to-end; the wire layer serializes the
/// variant name as the signal name and the fields as the payload.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "signal", content = "args")]
pub enum Signal {
    CheckForUpdateComplete {
        handle_id: u64,
        result: i32,
        status_code: i32,
        current_version: String,
        available_version: String,
        update_details: String,
        status_message: String,
    },
    DownloadProgress {
        handle_id: u64,
        firmware_name: String,
        progress: u32,
        status: String,
        message: String,
    },
    DownloadError {
        handle_id: u64,
        firmware_name: String,
        status: String,
        error_message: String,
    },
    UpdateProgress {
        handle_id: u64,
        firmware_name: String,
        /// Negative progress marks a terminal error.
        progress: i32,
        status_code: i32,
        message: String,
    },
}

impl Signal {
    pub fn handle_id(&self) -> u64 {
        match self {
            Signal::CheckForUpdateComplete { handle_id, .. }
            | Signal::DownloadProgress { handle_id, .. }
            | Signal::DownloadError { handle_id, .. }
            | Signal::UpdateProgress { handle_id, .. } => *handle_id,
        }
    }

    /// Wire name of the signal.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::CheckForUpdateComplete { .. } => "CheckForUpdateComplete",
            Signal::DownloadProgress { .. } => "DownloadProgress",
            Signal::DownloadError { .. } => "DownloadError",
            Signal::UpdateProgress { .. } => "UpdateProgress",
        }
    }
}

/// One-way event sink handed to the job engines; the adapter owns the
/// receiving side. Components never resolve handles through it, keeping
/// the router → registry dependency one-directional.
#[derive(Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<Signal>,
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        SignalBus { tx }
    }

    /// Publishes a signal to every subscriber. Lossy when nobody listens,
    /// which is fine: delivery guarantees are per-subscriber.
    pub fn publish(&self, signal: Signal) {
        trace!(signal = signal.name(), handle_id = signal.handle_id(), "signal");
        match self.tx.send(signal) {
            Ok(receivers) => debug!(receivers, "signal delivered"),
            Err(_) => debug!("signal dropped, no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }
}
