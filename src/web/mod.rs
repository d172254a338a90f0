//! Optional HTTP wrapper around the gateway
//!
//! `POST /message` accepts the same JSON-RPC bodies as the streaming
//! binding. Payment challenges materialize as `HTTP 402` with an
//! `X-Accept-Payment` header and the requirements as the JSON body (both
//! are emitted for client compatibility). `GET /sse` streams every
//! response for clients that listen asynchronously.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::mcp::McpGateway;
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse, PAYMENT_REQUIRED};
use crate::x402::HeaderBag;

/// Header carrying the serialized payment requirements on a 402.
const X_ACCEPT_PAYMENT: &str = "X-Accept-Payment";

#[derive(Clone)]
struct AppState {
    gateway: Arc<McpGateway>,
    events: broadcast::Sender<String>,
}

pub fn router(gateway: Arc<McpGateway>) -> Router {
    let (events, _) = broadcast::channel(256);
    let state = AppState { gateway, events };

    Router::new()
        .route("/message", post(post_message))
        .route("/sse", get(get_sse))
        .with_state(state)
}

/// Serve the wrapper until the process is stopped.
pub async fn serve(gateway: Arc<McpGateway>, addr: SocketAddr) -> Result<()> {
    let app = router(gateway);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, "HTTP wrapper listening");
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}

async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    let bag = header_bag(&headers);
    let response = state.gateway.handle_request(request, Some(bag)).await;

    // Fan responses out to SSE listeners regardless of transport outcome.
    if let Ok(line) = serde_json::to_string(&response) {
        let _ = state.events.send(line);
    }

    render_response(response)
}

/// A payment challenge becomes a real HTTP 402; everything else is a
/// plain JSON-RPC body.
fn render_response(response: JsonRpcResponse) -> Response {
    let is_challenge = response
        .error
        .as_ref()
        .is_some_and(|e| e.code == PAYMENT_REQUIRED);

    if !is_challenge {
        return Json(response).into_response();
    }

    let requirements = response
        .error
        .as_ref()
        .and_then(|e| e.data.clone())
        .unwrap_or(serde_json::Value::Null);
    let serialized = requirements.to_string();

    let mut http_response = (
        StatusCode::PAYMENT_REQUIRED,
        [(header::CONTENT_TYPE, "application/json")],
        serialized.clone(),
    )
        .into_response();

    if let Ok(value) = header::HeaderValue::from_str(&serialized) {
        http_response
            .headers_mut()
            .insert(X_ACCEPT_PAYMENT, value);
    }
    http_response
}

async fn get_sse(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let receiver = state.events.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(line) => Some(Ok(Event::default().data(line))),
            // A lagged receiver just skips; the stream stays up.
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn header_bag(headers: &HeaderMap) -> HeaderBag {
    let entries = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    HeaderBag::new(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{JsonRpcError, JsonRpcId};

    #[test]
    fn challenge_renders_as_http_402_with_header_and_body() {
        let requirements = serde_json::json!({
            "x402Version": 1,
            "accepts": [{"scheme": "exact", "network": "base-sepolia"}]
        });
        let response = JsonRpcResponse::error(
            Some(JsonRpcId::Number(1)),
            JsonRpcError::payment_required("Payment required", Some(requirements.clone())),
        );

        let http = render_response(response);
        assert_eq!(http.status(), StatusCode::PAYMENT_REQUIRED);

        let accept = http.headers().get(X_ACCEPT_PAYMENT).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(accept.to_str().unwrap()).unwrap();
        assert_eq!(parsed, requirements);
        assert_eq!(
            http.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn success_renders_as_plain_json() {
        let response = JsonRpcResponse::success(
            Some(JsonRpcId::Number(1)),
            serde_json::json!({"ok": true}),
        );
        let http = render_response(response);
        assert_eq!(http.status(), StatusCode::OK);
        assert!(http.headers().get(X_ACCEPT_PAYMENT).is_none());
    }

    #[test]
    fn non_payment_errors_stay_json_rpc() {
        let response = JsonRpcResponse::error(
            Some(JsonRpcId::Number(1)),
            JsonRpcError::internal("boom"),
        );
        let http = render_response(response);
        // JSON-RPC errors other than 402 ride a 200 with an error body.
        assert_eq!(http.status(), StatusCode::OK);
    }
}
