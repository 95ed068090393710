use axum::{routing::get, Router};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::future::ready;

// Prometheus exporter on its own listener, away from the bus surface.
pub fn metrics_router() -> Router {
    let recorder_handle = setup_metrics_recorder();
    Router::new().route("/metrics", get(move || ready(recorder_handle.render())))
}

fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("fwupdater_bus_request_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )
        .expect("histogram buckets are non-empty")
        .install_recorder()
        .expect("metrics recorder installs once")
}
