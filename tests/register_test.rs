//! Registration and handle-lifecycle integration tests.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{init_tracing, TestDaemonBuilder, PEER_A, PEER_B};

#[tokio::test]
async fn register_returns_unique_nonzero_handles() {
    init_tracing();
    let td = TestDaemonBuilder::new().build();

    let a = td.register("epg-app", PEER_A).await;
    let b = td.register("diagnostics", PEER_B).await;

    assert_ne!(a, 0);
    assert_ne!(b, 0);
    assert_ne!(a, b);
}

#[tokio::test]
async fn re_registration_by_the_same_caller_is_idempotent() {
    init_tracing();
    let td = TestDaemonBuilder::new().build();

    let first = td.register("epg-app", PEER_A).await;
    let second = td.register("epg-app", PEER_A).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn duplicate_process_name_from_another_caller_is_rejected() {
    init_tracing();
    let td = TestDaemonBuilder::new().build();

    td.register("epg-app", PEER_A).await;
    let (status, body) = td
        .call(
            "RegisterProcess",
            PEER_B,
            json!({ "processName": "epg-app", "libVersion": "1.0.0" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT, "body: {body}");
    assert_eq!(body["result"], "FAILURE");
}

#[tokio::test]
async fn empty_process_name_is_invalid() {
    init_tracing();
    let td = TestDaemonBuilder::new().build();

    let (status, _) = td
        .call(
            "RegisterProcess",
            PEER_A,
            json!({ "processName": "", "libVersion": "1.0.0" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_peer_identity_is_invalid() {
    init_tracing();
    let td = TestDaemonBuilder::new().build();

    // The peer header is the transport's identity; an empty one is as bad
    // as a missing one.
    let (status, _) = td
        .call(
            "RegisterProcess",
            "",
            json!({ "processName": "epg-app", "libVersion": "1.0.0" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unregister_removes_the_handle() {
    init_tracing();
    let td = TestDaemonBuilder::new().build();

    let handle = td.register("epg-app", PEER_A).await;

    let (status, body) = td
        .call("UnregisterProcess", PEER_A, json!({ "handleId": handle }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    // Methods with the dead handle fail with NotRegistered.
    let (status, _) = td
        .call(
            "CheckForUpdate",
            PEER_A,
            json!({ "handleId": handle.to_string() }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // A second unregister reports the handle as unknown.
    let (status, body) = td
        .call("UnregisterProcess", PEER_A, json!({ "handleId": handle }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn unregister_by_a_foreign_caller_is_rejected() {
    init_tracing();
    let td = TestDaemonBuilder::new().build();

    let handle = td.register("epg-app", PEER_A).await;
    let (status, _) = td
        .call("UnregisterProcess", PEER_B, json!({ "handleId": handle }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The handle survives the failed attempt.
    let (status, body) = td
        .call("UnregisterProcess", PEER_A, json!({ "handleId": handle }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}
