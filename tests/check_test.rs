//! Check-for-update integration tests: cache hit, single-flight fan-out,
//! fetch failure.

mod common;

use axum::http::StatusCode;
use rdkfwupdater::bus::Signal;
use serde_json::json;
use std::time::Duration;

use common::{
    assert_no_signal, catalog_answer, init_tracing, mock_xconf, wait_for_signal,
    TestDaemonBuilder, NEW_VERSION, PEER_A, PEER_B, PEER_C, RUNNING_VERSION,
};

#[tokio::test]
async fn cache_hit_answers_immediately_without_a_signal() {
    init_tracing();
    let td = TestDaemonBuilder::new().build();
    td.seed_catalog(catalog_answer("http://cdn.local/images"));

    let handle = td.register("epg-app", PEER_A).await;
    let mut rx = td.subscribe();

    let (status, body) = td
        .call(
            "CheckForUpdate",
            PEER_A,
            json!({ "handleId": handle.to_string() }),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["currentVersion"], RUNNING_VERSION);
    assert_eq!(body["availableVersion"], NEW_VERSION);
    assert_eq!(body["statusCode"], 0);
    assert!(!body["updateDetails"].as_str().unwrap().is_empty());

    // The caller already has the answer; no terminal signal follows.
    assert_no_signal(&mut rx, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn cold_miss_fans_out_one_fetch_to_all_waiters() {
    init_tracing();
    let answer = catalog_answer("http://cdn.local/images");
    // The delayed answer keeps the fetch in flight while the other
    // clients call; exactly one catalog request is expected.
    let server = mock_xconf(&answer, Duration::from_millis(400), 1).await;
    let td = TestDaemonBuilder::new()
        .xconf_url(&format!("{}/xconf/swu/stb", server.uri()))
        .build();

    let h1 = td.register("epg-app", PEER_A).await;
    let h2 = td.register("diagnostics", PEER_B).await;
    let h3 = td.register("settings-ui", PEER_C).await;
    let mut rx = td.subscribe();

    for (handle, peer) in [(h1, PEER_A), (h2, PEER_B), (h3, PEER_C)] {
        let (status, body) = td
            .call(
                "CheckForUpdate",
                peer,
                json!({ "handleId": handle.to_string() }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["statusCode"], 2, "pending reply expected: {body}");
    }

    let mut completions = Vec::new();
    for _ in 0..3 {
        let (signal, _) = wait_for_signal(&mut rx, Duration::from_secs(5), |s| {
            matches!(s, Signal::CheckForUpdateComplete { .. })
        })
        .await;
        completions.push(signal);
    }

    let mut handles = Vec::new();
    for signal in &completions {
        let Signal::CheckForUpdateComplete {
            handle_id,
            result,
            status_code,
            current_version,
            available_version,
            ..
        } = signal
        else {
            unreachable!()
        };
        assert_eq!(*result, 0);
        assert_eq!(*status_code, 0);
        assert_eq!(current_version, RUNNING_VERSION);
        assert_eq!(available_version, NEW_VERSION);
        handles.push(*handle_id);
    }
    // Every waiter got exactly one completion, in arrival order.
    assert_eq!(handles, vec![h1, h2, h3]);

    // A later check hits the freshly written cache, no second fetch.
    let (status, body) = td
        .call(
            "CheckForUpdate",
            PEER_A,
            json!({ "handleId": h1.to_string() }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["statusCode"], 0);

    server.verify().await;
}

#[tokio::test]
async fn fetch_failure_signals_update_error() {
    init_tracing();
    // Nothing listens on the default unroutable endpoint.
    let td = TestDaemonBuilder::new().build();

    let handle = td.register("epg-app", PEER_A).await;
    let mut rx = td.subscribe();

    let (status, body) = td
        .call(
            "CheckForUpdate",
            PEER_A,
            json!({ "handleId": handle.to_string() }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["statusCode"], 2);

    let (signal, _) = wait_for_signal(&mut rx, Duration::from_secs(10), |s| {
        matches!(s, Signal::CheckForUpdateComplete { .. })
    })
    .await;
    let Signal::CheckForUpdateComplete {
        handle_id,
        result,
        status_code,
        status_message,
        ..
    } = signal
    else {
        unreachable!()
    };
    assert_eq!(handle_id, handle);
    assert_eq!(result, -1);
    assert_eq!(status_code, 2);
    assert!(status_message.starts_with("ERROR"), "got {status_message:?}");
}

#[tokio::test]
async fn http_error_from_the_catalog_is_a_check_error() {
    init_tracing();
    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/xconf/swu/stb"))
        .respond_with(wiremock::ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let td = TestDaemonBuilder::new()
        .xconf_url(&format!("{}/xconf/swu/stb", server.uri()))
        .build();

    let handle = td.register("epg-app", PEER_A).await;
    let mut rx = td.subscribe();
    td.call(
        "CheckForUpdate",
        PEER_A,
        json!({ "handleId": handle.to_string() }),
    )
    .await;

    let (signal, _) = wait_for_signal(&mut rx, Duration::from_secs(5), |s| {
        matches!(s, Signal::CheckForUpdateComplete { .. })
    })
    .await;
    let Signal::CheckForUpdateComplete { status_code, .. } = signal else {
        unreachable!()
    };
    assert_eq!(status_code, 2);
}

#[tokio::test]
async fn unknown_handle_is_not_registered() {
    init_tracing();
    let td = TestDaemonBuilder::new().build();
    let (status, _) = td
        .call("CheckForUpdate", PEER_A, json!({ "handleId": "424242" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_handle_is_invalid() {
    init_tracing();
    let td = TestDaemonBuilder::new().build();
    for bad in ["", "0", "not-a-number"] {
        let (status, _) = td
            .call("CheckForUpdate", PEER_A, json!({ "handleId": bad }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "handle {bad:?}");
    }
}
