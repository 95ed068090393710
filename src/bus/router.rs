use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::bus::handlers::{
    check_for_update, download_firmware, health_handler, register_process, signal_stream,
    unregister_process, update_firmware,
};
use crate::metrics::middleware::track_metrics;
use crate::Daemon;

/// The bus method surface. One route per method, the signal stream, and a
/// watchdog health probe.
pub fn api_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/bus/RegisterProcess", post(register_process))
        .route("/bus/UnregisterProcess", post(unregister_process))
        .route("/bus/CheckForUpdate", post(check_for_update))
        .route("/bus/DownloadFirmware", post(download_firmware))
        .route("/bus/UpdateFirmware", post(update_firmware))
        .route("/bus/signals", get(signal_stream))
        .route("/health", get(health_handler))
        .layer(middleware::from_fn(track_metrics))
        .with_state(daemon)
        .layer(TraceLayer::new_for_http())
}
