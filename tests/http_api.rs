//! HTTP surface against a live engine task.

mod support;

use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

use companion_broker::{
    adapter::PromptChannel,
    engine::{Engine, EngineEvent},
    server::router,
};
use support::{engine_config, Recorder, RecordingFactory};

fn start(auto_edit: bool) -> (Router, mpsc::Sender<EngineEvent>) {
    let mut engine = Engine::new(
        engine_config(2, auto_edit),
        Box::new(RecordingFactory {
            recorder: Recorder::default(),
            channel: PromptChannel::Stream,
        }),
    );
    let (tx, mut rx) = mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            engine.handle(event);
        }
    });
    (router(tx.clone(), Duration::from_secs(30)), tx)
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    serde_json::from_slice(&body).expect("response body should be json")
}

fn post(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(path)
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

async fn health(app: &Router) -> Value {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request should build"),
        )
        .await
        .expect("health should respond");
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn health_describes_an_idle_broker() {
    let (app, _tx) = start(false);
    let snapshot = health(&app).await;
    assert_eq!(snapshot["status"], "ok");
    assert_eq!(snapshot["slots"], 2);
    assert_eq!(snapshot["autoEdit"], false);
    assert_eq!(snapshot["wsClients"], 0);
    assert_eq!(snapshot["sessions"], json!([]));
    assert_eq!(snapshot["pendingPermissions"], json!([]));

    let agents = snapshot["agents"].as_array().expect("per-slot statuses");
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0]["name"], "claude");
    assert_eq!(agents[1]["name"], "agent-1");
    assert_eq!(agents[1]["slot"], 1);
    assert_eq!(agents[0]["state"], "idle");
    assert_eq!(agents[0]["message"], "Waiting for activity...");
    assert_eq!(agents[0]["active"], false);
    assert_eq!(agents[0]["contextPercent"], 0);
}

#[tokio::test]
async fn health_reflects_a_waiting_slot() {
    let (app, tx) = start(false);
    tx.send(EngineEvent::ClientMessage {
        id: 9,
        text: json!({"type": "spawn_request", "slot": 1}).to_string(),
    })
    .await
    .expect("engine is running");
    tx.send(EngineEvent::AgentOutput {
        slot: 1,
        epoch: 1,
        line: support::can_use_tool("req-1", "Bash", json!({"command": "make"})).to_string(),
    })
    .await
    .expect("engine is running");

    let snapshot = health(&app).await;
    let agent = &snapshot["agents"][1];
    assert_eq!(agent["state"], "waiting");
    assert_eq!(agent["active"], true);
    assert_eq!(agent["promptToolType"], "Bash");
    assert_eq!(agent["promptToolDetail"], "make");
    assert_eq!(snapshot["sessions"][0]["slot"], 1);
}

#[tokio::test]
async fn auto_edit_pre_tool_is_approved_without_a_client() {
    let (app, _tx) = start(true);
    let response = app
        .oneshot(post(
            "/hook/pre-tool",
            json!({"tool_name": "Edit", "tool_input": {"file_path": "src/lib.rs"}}),
        ))
        .await
        .expect("hook should respond");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"decision": "approve"}));
}

#[tokio::test]
async fn lifecycle_hooks_are_acknowledged_with_an_empty_object() {
    let (app, _tx) = start(false);
    for event in ["session-start", "user-prompt", "stop", "post-tool"] {
        let response = app
            .clone()
            .oneshot(post(&format!("/hook/{event}"), json!({"session_id": "abc"})))
            .await
            .expect("hook should respond");
        assert_eq!(response.status(), StatusCode::OK, "{event}");
        assert_eq!(body_json(response).await, json!({}), "{event}");
    }
}

#[tokio::test]
async fn client_denial_reaches_the_blocked_hook() {
    let (app, tx) = start(false);
    let pending = tokio::spawn(app.clone().oneshot(post(
        "/hook/pre-tool",
        json!({"tool_name": "Bash", "tool_input": {"command": "rm -rf /tmp/x"}}),
    )));

    let mut waiting = false;
    for _ in 0..50 {
        let snapshot = health(&app).await;
        if let Some(first) = snapshot["pendingPermissions"].as_array().and_then(|p| p.first()) {
            assert_eq!(first["toolName"], "Bash");
            assert_eq!(first["source"], "hook");
            waiting = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(waiting, "hook request never became pending");

    tx.send(EngineEvent::ClientMessage {
        id: 9,
        text: json!({"type": "action", "action": "no", "slot": 0}).to_string(),
    })
    .await
    .expect("engine is running");

    let response = pending
        .await
        .expect("hook task should finish")
        .expect("hook should respond");
    assert_eq!(
        body_json(response).await,
        json!({"decision": "block", "reason": "Denied by user"})
    );
    assert_eq!(health(&app).await["pendingPermissions"], json!([]));
}
