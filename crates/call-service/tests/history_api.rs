//! Call history API tests against the full router.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use call_protocol::CallType;
use call_test_utils::TestHarness;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::util::ServiceExt;

async fn get_json(harness: &TestHarness, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("Failed to build request");

    let response = harness
        .router()
        .oneshot(request)
        .await
        .expect("Failed to execute request");

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_history_lists_calls_for_both_sides() {
    let harness = TestHarness::new();
    let mut alice = harness.session("alice").await;
    let mut bob = harness.session("bob").await;

    alice.initiate_typed("c1", CallType::Audio, &["bob"]).await;
    bob.expect("incoming-call").await;
    bob.reject("c1").await;
    alice.expect("call-rejected").await;

    for user in ["alice", "bob"] {
        let (status, body) = get_json(&harness, &format!("/api/v1/users/{user}/calls")).await;
        assert_eq!(status, StatusCode::OK);

        let calls = body["calls"].as_array().unwrap();
        assert_eq!(calls.len(), 1, "{user} sees the call");
        assert_eq!(calls[0]["callId"], "c1");
        assert_eq!(calls[0]["status"], "rejected");
        assert_eq!(calls[0]["type"], "audio");
        assert_eq!(calls[0]["duration"], 0);
        assert_eq!(calls[0]["initiatorId"], "alice");
        assert!(body["nextBefore"].is_null());
    }

    let (_, body) = get_json(&harness, "/api/v1/users/carol/calls").await;
    assert!(body["calls"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_history_filters_by_type_and_status() {
    let harness = TestHarness::new();
    let mut alice = harness.session("alice").await;
    let mut bob = harness.session("bob").await;

    alice.initiate_typed("audio-1", CallType::Audio, &["bob"]).await;
    bob.expect("incoming-call").await;
    alice.cancel("audio-1").await;
    bob.expect("call-cancelled").await;

    alice.initiate_typed("video-1", CallType::Video, &["bob"]).await;
    bob.expect("incoming-call").await;

    let (_, body) = get_json(&harness, "/api/v1/users/alice/calls?type=video").await;
    let calls = body["calls"].as_array().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["callId"], "video-1");
    assert_eq!(calls[0]["status"], "initiated");
    assert!(calls[0]["duration"].is_null());

    let (_, body) = get_json(&harness, "/api/v1/users/bob/calls?status=missed").await;
    let calls = body["calls"].as_array().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["callId"], "audio-1");
}

#[tokio::test]
async fn test_history_rejects_bad_filters() {
    let harness = TestHarness::new();

    let (status, body) = get_json(&harness, "/api/v1/users/alice/calls?type=hologram").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");

    let (status, _) = get_json(&harness, "/api/v1/users/alice/calls?before=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
