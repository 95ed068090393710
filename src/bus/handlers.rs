use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, instrument};

use crate::bus::PEER_HEADER;
use crate::download::DownloadRequest;
use crate::error::UpdaterError;
use crate::flash::FlashRequest;
use crate::Daemon;

/// Bounded wait for a cancelled worker to emit its terminal signal before
/// the handle disappears from the registry.
const CANCEL_DRAIN: Duration = Duration::from_secs(2);

impl IntoResponse for UpdaterError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            UpdaterError::InvalidArgs(_) => StatusCode::BAD_REQUEST,
            UpdaterError::NotRegistered(_) => StatusCode::FORBIDDEN,
            UpdaterError::AlreadyRegistered { .. } | UpdaterError::AlreadyInProgress(_) => {
                StatusCode::CONFLICT
            }
            UpdaterError::Network(_) => StatusCode::BAD_GATEWAY,
            UpdaterError::Platform(_) | UpdaterError::Cache(_) | UpdaterError::Fatal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({
            "result": "FAILURE",
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

fn peer_id(headers: &HeaderMap) -> Result<String, UpdaterError> {
    headers
        .get(PEER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| UpdaterError::invalid_args("missing bus peer identity"))
}

fn parse_handle(raw: &str) -> Result<u64, UpdaterError> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .ok_or_else(|| UpdaterError::invalid_args(format!("bad handle id {raw:?}")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterArgs {
    process_name: String,
    lib_version: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterReply {
    handle_id: u64,
}

/// `RegisterProcess(ss) → (t)`
pub async fn register_process(
    State(daemon): State<Arc<Daemon>>,
    headers: HeaderMap,
    Json(args): Json<RegisterArgs>,
) -> Result<Json<RegisterReply>, UpdaterError> {
    let peer = peer_id(&headers)?;
    let handle_id = daemon
        .registry
        .register(&args.process_name, &args.lib_version, &peer)?;
    Ok(Json(RegisterReply { handle_id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterArgs {
    handle_id: u64,
}

#[derive(Serialize)]
pub struct UnregisterReply {
    ok: bool,
}

/// `UnregisterProcess(t) → (b)`
///
/// Cancels the handle's jobs first and gives the workers a bounded window
/// to emit their terminal signals while the handle still resolves.
#[instrument(skip_all, fields(handle_id = args.handle_id))]
pub async fn unregister_process(
    State(daemon): State<Arc<Daemon>>,
    headers: HeaderMap,
    Json(args): Json<UnregisterArgs>,
) -> Result<Json<UnregisterReply>, UpdaterError> {
    let peer = peer_id(&headers)?;
    match daemon.registry.lookup(args.handle_id) {
        None => return Ok(Json(UnregisterReply { ok: false })),
        Some(handle) if handle.caller != peer => {
            return Err(UpdaterError::NotRegistered(args.handle_id));
        }
        Some(_) => {}
    }

    if daemon.jobs.cancel_for_handle(args.handle_id) > 0 {
        drain_cancelled_jobs(&daemon, args.handle_id).await;
    }
    let ok = daemon.registry.unregister(args.handle_id);
    Ok(Json(UnregisterReply { ok }))
}

/// Waits (bounded) for the cancelled workers to observe the flag, emit
/// their terminal error and release the job slots.
async fn drain_cancelled_jobs(daemon: &Arc<Daemon>, handle_id: u64) {
    let deadline = tokio::time::Instant::now() + CANCEL_DRAIN;
    while tokio::time::Instant::now() < deadline {
        if daemon.jobs.cancel_for_handle(handle_id) == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    debug!(handle_id, "cancelled job did not drain within the bound");
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckArgs {
    handle_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReplyWire {
    current_version: String,
    available_version: String,
    update_details: String,
    status_message: String,
    status_code: i32,
}

/// `CheckForUpdate(s) → (ssssi)`
///
/// The reply is immediate; on a cache miss the terminal answer follows as
/// a `CheckForUpdateComplete` signal, emitted from the fetch worker after
/// this reply is on the wire.
pub async fn check_for_update(
    State(daemon): State<Arc<Daemon>>,
    headers: HeaderMap,
    Json(args): Json<CheckArgs>,
) -> Result<Json<CheckReplyWire>, UpdaterError> {
    let peer = peer_id(&headers)?;
    let handle_id = parse_handle(&args.handle_id)?;
    daemon.registry.authorize(handle_id, &peer)?;

    let reply = daemon.coordinator.check_for_update(handle_id);
    Ok(Json(CheckReplyWire {
        current_version: reply.current_version,
        available_version: reply.available_version,
        update_details: reply.update_details,
        status_message: reply.status_message,
        status_code: reply.status_code,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadArgs {
    handle_id: String,
    firmware_name: String,
    /// Omitted means "resolve from the catalog"; present-but-empty is an
    /// error.
    #[serde(default)]
    url: Option<String>,
    firmware_type: String,
}

#[derive(Serialize)]
pub struct AcceptReply {
    result: String,
    status: String,
    message: String,
}

/// `DownloadFirmware(ssss) → (sss)`
pub async fn download_firmware(
    State(daemon): State<Arc<Daemon>>,
    headers: HeaderMap,
    Json(args): Json<DownloadArgs>,
) -> Result<Json<AcceptReply>, UpdaterError> {
    let peer = peer_id(&headers)?;
    let handle_id = parse_handle(&args.handle_id)?;
    daemon.registry.authorize(handle_id, &peer)?;

    let kind = args.firmware_type.parse()?;
    daemon.downloads.start(DownloadRequest {
        handle_id,
        firmware_name: args.firmware_name.clone(),
        url: args.url,
        kind,
    })?;
    Ok(Json(AcceptReply {
        result: "SUCCESS".into(),
        status: "Download In Progress".into(),
        message: format!("download of {} accepted", args.firmware_name),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateArgs {
    handle_id: String,
    firmware_name: String,
    firmware_type: String,
    #[serde(default)]
    location: Option<String>,
    reboot_immediately: String,
}

/// `UpdateFirmware(sssss) → (sss)`
pub async fn update_firmware(
    State(daemon): State<Arc<Daemon>>,
    headers: HeaderMap,
    Json(args): Json<UpdateArgs>,
) -> Result<Json<AcceptReply>, UpdaterError> {
    let peer = peer_id(&headers)?;
    let handle_id = parse_handle(&args.handle_id)?;
    daemon.registry.authorize(handle_id, &peer)?;

    let kind = args.firmware_type.parse()?;
    let reboot_immediately = match args.reboot_immediately.to_ascii_lowercase().as_str() {
        "true" => true,
        "false" => false,
        other => {
            return Err(UpdaterError::invalid_args(format!(
                "bad reboot flag {other:?}"
            )))
        }
    };
    daemon.flashes.start(FlashRequest {
        handle_id,
        firmware_name: args.firmware_name.clone(),
        kind,
        location: args.location,
        reboot_immediately,
    })?;
    Ok(Json(AcceptReply {
        result: "SUCCESS".into(),
        status: "Flashing In Progress".into(),
        message: format!("flash of {} accepted", args.firmware_name),
    }))
}

/// Sweeps a peer's registrations when its signal stream drops.
struct PeerPresence {
    daemon: Arc<Daemon>,
    peer: String,
}

impl Drop for PeerPresence {
    fn drop(&mut self) {
        self.daemon.peer_disconnected(&self.peer);
    }
}

/// `GET /bus/signals` — the peer's signal stream.
///
/// Events are named after the wire signal and carry the serialized args.
/// Only signals for handles owned by the peer are delivered. The stream's
/// lifetime is the peer's presence on the bus.
pub async fn signal_stream(
    State(daemon): State<Arc<Daemon>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, UpdaterError> {
    let peer = peer_id(&headers)?;
    let rx = daemon.signals.subscribe();
    let presence = PeerPresence {
        daemon: Arc::clone(&daemon),
        peer: peer.clone(),
    };

    let stream = futures::stream::unfold(
        (rx, daemon, peer, presence),
        |(mut rx, daemon, peer, presence)| async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => {
                        let owned = daemon
                            .registry
                            .lookup(signal.handle_id())
                            .map(|h| h.caller == peer)
                            .unwrap_or(false);
                        if !owned {
                            continue;
                        }
                        let event = Event::default()
                            .event(signal.name())
                            .data(serde_json::to_string(&signal).unwrap_or_default());
                        return Some((Ok(event), (rx, daemon, peer, presence)));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "signal stream lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        },
    );
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}
