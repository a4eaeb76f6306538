//! HTTP surface: control-client WebSocket, hook callbacks and health.
//!
//! Handlers never touch broker state; they forward an `EngineEvent` and
//! await the engine's reply on a oneshot channel.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::ws::{Message, WebSocket},
    http::StatusCode,
    routing, Router,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::{
    engine::{EngineEvent, HookReply},
    protocol::{HookKind, HookPayload, HookVerdict},
};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const CANCELLED_REASON: &str = "Permission request cancelled";

#[derive(Clone)]
struct ServerState {
    tx: mpsc::Sender<EngineEvent>,
    hook_timeout: Duration,
    next_client: Arc<AtomicU64>,
}

pub fn router(tx: mpsc::Sender<EngineEvent>, hook_timeout: Duration) -> Router {
    let state = ServerState {
        tx,
        hook_timeout,
        next_client: Arc::new(AtomicU64::new(1)),
    };

    Router::new()
        .route("/health", routing::get(health))
        .route("/", routing::get(control_ws))
        .route("/ws", routing::get(control_ws))
        .route("/hook/{event}", routing::post(hook))
        .with_state(state)
}

fn unavailable() -> (StatusCode, axum::Json<Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(json!({ "error": "broker shutting down" })),
    )
}

async fn health(
    axum::extract::State(state): axum::extract::State<ServerState>,
) -> (StatusCode, axum::Json<Value>) {
    let (reply_tx, reply_rx) = oneshot::channel();
    if state
        .tx
        .send(EngineEvent::Health { reply: reply_tx })
        .await
        .is_err()
    {
        return unavailable();
    }
    match reply_rx.await {
        Ok(snapshot) => (StatusCode::OK, axum::Json(snapshot)),
        Err(_) => unavailable(),
    }
}

async fn hook(
    axum::extract::State(state): axum::extract::State<ServerState>,
    axum::extract::Path(event): axum::extract::Path<String>,
    body: axum::body::Bytes,
) -> (StatusCode, axum::Json<Value>) {
    let Some(kind) = HookKind::from_path(&event) else {
        return (
            StatusCode::NOT_FOUND,
            axum::Json(json!({ "error": format!("unknown hook event: {event}") })),
        );
    };

    // Hook bodies come from a shell pipeline; a broken one still counts as
    // the event happening.
    let payload = if body.is_empty() {
        HookPayload::default()
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|error| {
            tracing::warn!(target = "companion_broker::server", hook = %event, error = %error, "unreadable hook body");
            HookPayload::default()
        })
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if state
        .tx
        .send(EngineEvent::Hook {
            kind,
            payload,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return unavailable();
    }
    let Ok(reply) = reply_rx.await else {
        return unavailable();
    };

    let verdict = match reply {
        HookReply::Ack => return (StatusCode::OK, axum::Json(json!({}))),
        HookReply::Verdict(verdict) => verdict,
        HookReply::Await {
            slot,
            request_id,
            verdict,
        } => match tokio::time::timeout(state.hook_timeout, verdict).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(_)) => HookVerdict::Block {
                reason: CANCELLED_REASON.to_string(),
            },
            Err(_) => {
                let _ = state
                    .tx
                    .send(EngineEvent::HookTimedOut { slot, request_id })
                    .await;
                HookVerdict::Approve
            }
        },
    };
    (StatusCode::OK, axum::Json(verdict.to_json()))
}

async fn control_ws(
    ws: axum::extract::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<ServerState>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_control_ws(socket, state))
}

async fn handle_control_ws(mut socket: WebSocket, state: ServerState) {
    let id = state.next_client.fetch_add(1, Ordering::Relaxed);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    if state
        .tx
        .send(EngineEvent::ClientConnected { id, tx: out_tx })
        .await
        .is_err()
    {
        return;
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(text) = outbound else { break };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let event = EngineEvent::ClientMessage {
                        id,
                        text: text.as_str().to_owned(),
                    };
                    if state.tx.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(target = "companion_broker::server", client = id, error = %error, "control socket error");
                    break;
                }
            },

            _ = ping_interval.tick() => {
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = state.tx.send(EngineEvent::ClientDisconnected { id }).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::router;
    use crate::{
        engine::{EngineEvent, HookReply},
        protocol::{HookKind, HookVerdict},
    };

    async fn response_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        serde_json::from_slice(&body).expect("response body should be json")
    }

    fn hook_request(event: &str, body: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("/hook/{event}"))
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build")
    }

    #[tokio::test]
    async fn unknown_hook_event_is_not_found() {
        let (tx, _rx) = mpsc::channel(8);
        let response = router(tx, Duration::from_secs(1))
            .oneshot(hook_request("pre-compact", "{}"))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn informational_hook_is_acknowledged() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            if let Some(EngineEvent::Hook { kind, payload, reply }) = rx.recv().await {
                assert_eq!(kind, HookKind::PostTool);
                assert_eq!(payload.tool_name(), "Bash");
                let _ = reply.send(HookReply::Ack);
            }
        });
        let response = router(tx, Duration::from_secs(1))
            .oneshot(hook_request("post-tool", r#"{"tool_name":"Bash","session_id":"s1"}"#))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, json!({}));
    }

    #[tokio::test]
    async fn malformed_body_still_reaches_the_engine() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            if let Some(EngineEvent::Hook { payload, reply, .. }) = rx.recv().await {
                assert_eq!(payload.tool_name(), "Tool");
                let _ = reply.send(HookReply::Ack);
            }
        });
        let response = router(tx, Duration::from_secs(1))
            .oneshot(hook_request("stop", "not json"))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn blocked_pre_tool_returns_the_client_decision() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            if let Some(EngineEvent::Hook { reply, .. }) = rx.recv().await {
                let (verdict_tx, verdict_rx) = tokio::sync::oneshot::channel();
                let _ = reply.send(HookReply::Await {
                    slot: 0,
                    request_id: "r1".into(),
                    verdict: verdict_rx,
                });
                let _ = verdict_tx.send(HookVerdict::Block {
                    reason: "Denied by user".into(),
                });
            }
        });
        let response = router(tx, Duration::from_secs(5))
            .oneshot(hook_request("pre-tool", r#"{"tool_name":"Bash"}"#))
            .await
            .expect("request should succeed");
        assert_eq!(
            response_json(response).await,
            json!({"decision": "block", "reason": "Denied by user"})
        );
    }

    #[tokio::test]
    async fn blocked_pre_tool_approves_after_timeout() {
        let (tx, mut rx) = mpsc::channel(8);
        let engine = tokio::spawn(async move {
            let mut verdict_tx = None;
            if let Some(EngineEvent::Hook { reply, .. }) = rx.recv().await {
                let (tx, verdict_rx) = tokio::sync::oneshot::channel();
                verdict_tx = Some(tx);
                let _ = reply.send(HookReply::Await {
                    slot: 2,
                    request_id: "r2".into(),
                    verdict: verdict_rx,
                });
            }
            let timed_out = rx.recv().await;
            drop(verdict_tx);
            timed_out
        });
        let response = router(tx, Duration::from_millis(50))
            .oneshot(hook_request("pre-tool", r#"{"tool_name":"Bash"}"#))
            .await
            .expect("request should succeed");
        assert_eq!(response_json(response).await, json!({"decision": "approve"}));

        let event = engine.await.expect("engine task");
        assert!(matches!(
            event,
            Some(EngineEvent::HookTimedOut { slot: 2, ref request_id }) if request_id == "r2"
        ));
    }

    #[tokio::test]
    async fn cancelled_wait_blocks_the_tool() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            if let Some(EngineEvent::Hook { reply, .. }) = rx.recv().await {
                let (verdict_tx, verdict_rx) = tokio::sync::oneshot::channel::<HookVerdict>();
                let _ = reply.send(HookReply::Await {
                    slot: 0,
                    request_id: "r3".into(),
                    verdict: verdict_rx,
                });
                drop(verdict_tx);
            }
        });
        let response = router(tx, Duration::from_secs(5))
            .oneshot(hook_request("pre-tool", "{}"))
            .await
            .expect("request should succeed");
        assert_eq!(response_json(response).await["decision"], "block");
    }

    #[tokio::test]
    async fn health_reports_engine_snapshot() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            if let Some(EngineEvent::Health { reply }) = rx.recv().await {
                let _ = reply.send(json!({"status": "ok", "slots": 4}));
            }
        });
        let response = router(tx, Duration::from_secs(1))
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["slots"], 4);
    }

    #[tokio::test]
    async fn health_without_engine_is_unavailable() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let response = router(tx, Duration::from_secs(1))
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
