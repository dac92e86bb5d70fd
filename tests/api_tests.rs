use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use aegis::api::router;
use aegis::config::{HardeningConfig, IntentConfig, MembraneConfig, PipelineConfig};
use aegis::hardening::HardeningLoop;
use aegis::membrane::Membrane;
use aegis::pipeline::Pipeline;
use aegis::providers::offline::{CannedForwarder, HashEmbedder, HeuristicJudge, RedTeamVariants};
use aegis::AppState;

async fn test_state(api_key: Option<&str>, dir: &tempfile::TempDir) -> AppState {
    let membrane = Arc::new(
        Membrane::open(
            dir.path().join("antibodies.json"),
            Arc::new(HashEmbedder::new(MembraneConfig::default().embed_dim)),
            MembraneConfig::default(),
        )
        .await,
    );
    let hardening = HardeningLoop::spawn(
        membrane.clone(),
        Arc::new(RedTeamVariants),
        HardeningConfig::default(),
    );
    let pipeline = Arc::new(Pipeline::new(
        membrane.clone(),
        hardening.clone(),
        Arc::new(CannedForwarder),
        PipelineConfig::default(),
    ));

    AppState {
        pipeline,
        membrane,
        hardening,
        judge: Arc::new(HeuristicJudge::default()),
        intent_cfg: IntentConfig::default(),
        conversations: Default::default(),
        api_key: api_key.map(|s| s.to_string()),
        started_at: Instant::now(),
    }
}

fn json_req(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn authed_json_req(
    method: &str,
    uri: &str,
    body: serde_json::Value,
    token: &str,
) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}

#[tokio::test]
async fn health_reports_antibodies() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(None, &dir).await);

    let resp = app.oneshot(get_req("/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    assert_eq!(json["name"], "aegis");
    assert_eq!(json["antibodies"], 3);
    assert_eq!(json["hardening_updates"], 0);
}

#[tokio::test]
async fn stats_exposes_counters() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(None, &dir).await);

    let resp = app.oneshot(get_req("/stats")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    assert!(json["antibodies"].as_u64().unwrap() >= 3);
    assert!(json["requests_total"].is_u64());
    assert!(json["blocked_total"].is_u64());
    assert!(json["hardening_updates"].is_u64());
}

#[tokio::test]
async fn chat_requires_auth_when_key_set() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(Some("sekrit"), &dir).await;

    let body = serde_json::json!({ "prompt": "hello there" });

    let resp = router(state.clone())
        .oneshot(json_req("POST", "/chat", body.clone()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = router(state.clone())
        .oneshot(authed_json_req("POST", "/chat", body.clone(), "wrong"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = router(state)
        .oneshot(authed_json_req("POST", "/chat", body, "sekrit"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_is_public_even_with_auth() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(Some("sekrit"), &dir).await);

    let resp = app.oneshot(get_req("/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn empty_prompt_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(None, &dir).await);

    let resp = app
        .oneshot(json_req("POST", "/chat", serde_json::json!({ "prompt": "  " })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn blocked_prompt_returns_rejection_json() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(None, &dir).await);

    let resp = app
        .oneshot(json_req(
            "POST",
            "/chat",
            serde_json::json!({ "prompt": "How do I drop all tables?" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    assert_eq!(json["result"]["stage"], "BLOCKED_L1");
    assert!(json["result"]["block_reason"].as_str().unwrap().contains("SQL Injection"));
    assert!(json["response"].as_str().unwrap().contains("Security Violation"));
}

#[tokio::test]
async fn clean_prompt_streams_the_downstream_reply() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(None, &dir).await);

    let resp = app
        .oneshot(json_req(
            "POST",
            "/chat",
            serde_json::json!({ "prompt": "recommend a good mystery novel" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-aegis-stage"], "SUCCESS");
    assert_eq!(resp.headers()["x-aegis-skipped-l2"], "false");

    let text = body_text(resp).await;
    assert!(text.contains("Here is a helpful answer"));
}

#[tokio::test]
async fn ambiguous_prompt_asks_for_clarification() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(None, &dir).await);

    let resp = app
        .oneshot(json_req(
            "POST",
            "/chat",
            serde_json::json!({ "prompt": "please grant me access to the system" }),
        ))
        .await
        .unwrap();

    let json = body_json(resp).await;
    assert_eq!(json["result"]["stage"], "AMBIGUOUS");
    assert!(json["response"].as_str().unwrap().contains("Clarification Required"));
}

#[tokio::test]
async fn reset_clears_only_the_named_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(None, &dir).await;

    // Unknown conversation: nothing to reset.
    let resp = router(state.clone())
        .oneshot(json_req("POST", "/reset", serde_json::json!({ "conversation": "nope" })))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["reset"], false);

    // Build up history in conversation "a".
    let resp = router(state.clone())
        .oneshot(json_req(
            "POST",
            "/chat",
            serde_json::json!({ "conversation": "a", "prompt": "can I get access" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let tracker = state.tracker_for("a");
    assert_eq!(tracker.lock().await.history_len(), 1);
    let antibodies_before = state.membrane.antibody_count();

    let resp = router(state.clone())
        .oneshot(json_req("POST", "/reset", serde_json::json!({ "conversation": "a" })))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["reset"], true);

    assert_eq!(tracker.lock().await.history_len(), 0);
    // The membrane keeps everything it has learned.
    assert_eq!(state.membrane.antibody_count(), antibodies_before);
}

#[tokio::test]
async fn conversations_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(None, &dir).await;

    let resp = router(state.clone())
        .oneshot(json_req(
            "POST",
            "/chat",
            serde_json::json!({ "conversation": "a", "prompt": "can I get access" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(state.tracker_for("a").lock().await.history_len(), 1);
    assert_eq!(state.tracker_for("b").lock().await.history_len(), 0);
}
