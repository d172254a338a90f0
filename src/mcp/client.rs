//! MCP client for connecting to upstream MCP servers
//!
//! Supports stdio, HTTP, SSE, and WebSocket transports behind one verb
//! surface. The HTTP-family transports react to downstream x402
//! challenges with an explicit two-send state machine driven by the
//! gateway's outbound wallet.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::x402::{OutboundWallet, WalletError};

use super::protocol::{
    JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, PromptInfo,
    PromptsListResult, ResourceInfo, ResourcesListResult, ToolInfo, ToolsListResult,
};
use super::transport::TransportDescriptor;

/// Name of the x-payment header sent on the signed retry.
const X_PAYMENT: &str = "X-PAYMENT";

// ============================================================================
// Error type
// ============================================================================

/// Unified failure surface for every upstream verb. `transient` hints that
/// a retry or reconnect may help.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub transient: bool,
    pub message: String,
}

impl UpstreamError {
    pub fn transient(message: impl Into<String>) -> Self {
        UpstreamError { transient: true, message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        UpstreamError { transient: false, message: message.into() }
    }

    fn from_rpc(error: JsonRpcError) -> Self {
        UpstreamError::fatal(format!("upstream error [{}]: {}", error.code, error.message))
    }

    fn from_wallet(error: WalletError) -> Self {
        match error {
            WalletError::ExceedsCap => UpstreamError::fatal("downstream payment exceeds cap"),
            other => UpstreamError::fatal(format!("outbound payment failed: {other}")),
        }
    }
}

// ============================================================================
// Per-call forwarding options
// ============================================================================

/// How one forwarded request is augmented, as decided by the payment
/// mediator for that call. The wallet is armed per request: a call whose
/// upstream mode is not markup/absorb carries `wallet: None` and a
/// downstream 402 surfaces as an error instead of being paid.
#[derive(Debug, Clone, Default)]
pub struct Forward {
    /// Extra headers to attach (passthrough mode).
    pub headers: Vec<(String, String)>,

    /// Wallet allowed to answer a downstream 402 on this call only.
    pub wallet: Option<Arc<OutboundWallet>>,
}

impl Forward {
    pub fn plain() -> Self {
        Forward::default()
    }

    pub fn passthrough(headers: Vec<(String, String)>) -> Self {
        Forward { headers, wallet: None }
    }

    pub fn paying(wallet: Arc<OutboundWallet>) -> Self {
        Forward { headers: Vec::new(), wallet: Some(wallet) }
    }
}

// ============================================================================
// Outbound payment state machine
// ============================================================================

/// States of the 402-retry machine on the HTTP/SSE request path. A request
/// is sent at most twice; the cap is checked between `SentOnce` and
/// `Signed`, before anything is signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayState {
    Idle,
    SentOnce,
    Signed,
    SentTwice,
}

// ============================================================================
// Per-transport connection state
// ============================================================================

struct StdioState {
    child: Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct SseState {
    stream: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseDecoder,
    /// Responses that arrived for other request ids.
    pending: Vec<JsonRpcResponse>,
}

enum TransportState {
    Idle,
    Stdio(StdioState),
    Websocket(Box<WsStream>),
    Sse(SseState),
}

// ============================================================================
// Client
// ============================================================================

/// MCP client bound to one upstream server. Whether the gateway may pay a
/// downstream challenge is decided per call via [`Forward`], not here.
pub struct McpClient {
    descriptor: TransportDescriptor,
    request_id: AtomicU64,
    http: reqwest::Client,
    state: Mutex<TransportState>,
}

impl McpClient {
    pub fn new(descriptor: TransportDescriptor) -> Self {
        McpClient {
            descriptor,
            request_id: AtomicU64::new(1),
            http: reqwest::Client::new(),
            state: Mutex::new(TransportState::Idle),
        }
    }

    pub fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Verbs
    // ------------------------------------------------------------------------

    /// Initialize the MCP session (required before any other verb).
    pub async fn initialize(&self) -> Result<Value, UpstreamError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });

        let result = self.request("initialize", Some(params), &Forward::plain()).await?;
        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// Cheap liveness check.
    pub async fn ping(&self) -> Result<(), UpstreamError> {
        self.request("ping", None, &Forward::plain()).await.map(|_| ())
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, UpstreamError> {
        let result = self.request("tools/list", None, &Forward::plain()).await?;
        let list: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| UpstreamError::fatal(format!("invalid tools/list result: {e}")))?;
        Ok(list.tools)
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>, UpstreamError> {
        let result = self.request("resources/list", None, &Forward::plain()).await?;
        let list: ResourcesListResult = serde_json::from_value(result)
            .map_err(|e| UpstreamError::fatal(format!("invalid resources/list result: {e}")))?;
        Ok(list.resources)
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptInfo>, UpstreamError> {
        let result = self.request("prompts/list", None, &Forward::plain()).await?;
        let list: PromptsListResult = serde_json::from_value(result)
            .map_err(|e| UpstreamError::fatal(format!("invalid prompts/list result: {e}")))?;
        Ok(list.prompts)
    }

    /// Call a tool by its upstream name. The result is returned verbatim.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        forward: &Forward,
    ) -> Result<Value, UpstreamError> {
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| json!({})),
        });
        self.request("tools/call", Some(params), forward).await
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        forward: &Forward,
    ) -> Result<Value, UpstreamError> {
        let params = json!({ "uri": uri });
        self.request("resources/read", Some(params), forward).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
        forward: &Forward,
    ) -> Result<Value, UpstreamError> {
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.request("prompts/get", Some(params), forward).await
    }

    /// Close the connection. Safe to call repeatedly.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, TransportState::Idle) {
            TransportState::Stdio(mut stdio) => {
                let _ = stdio.child.kill().await;
            }
            TransportState::Websocket(mut ws) => {
                let _ = ws.close().await;
            }
            TransportState::Sse(_) | TransportState::Idle => {}
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        forward: &Forward,
    ) -> Result<Value, UpstreamError> {
        let id = self.next_id();

        match &self.descriptor {
            TransportDescriptor::Http { url, .. } => {
                let request = JsonRpcRequest::new(id, method, params);
                let response = self.post_rpc(url, &request, forward).await?;
                unwrap_response(response)
            }
            TransportDescriptor::Sse { post_url, .. } => {
                let request = JsonRpcRequest::new(id, method, params);
                let response = self.sse_rpc(post_url, &request, forward).await?;
                unwrap_response(response)
            }
            TransportDescriptor::Stdio { .. } => {
                let request =
                    JsonRpcRequest::new(id, method, fold_headers(params, &forward.headers));
                let response = self.stdio_rpc(&request).await?;
                unwrap_response(response)
            }
            TransportDescriptor::Websocket { .. } => {
                let request =
                    JsonRpcRequest::new(id, method, fold_headers(params, &forward.headers));
                let response = self.ws_rpc(&request).await?;
                unwrap_response(response)
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), UpstreamError> {
        let request = JsonRpcRequest::notification(method, params);
        match &self.descriptor {
            TransportDescriptor::Http { url, .. } => {
                let mut req = self.http.post(url).json(&request);
                for (name, value) in self.descriptor.request_headers() {
                    req = req.header(name, value);
                }
                let _ = req.send().await;
                Ok(())
            }
            TransportDescriptor::Sse { post_url, .. } => {
                let mut req = self.http.post(post_url).json(&request);
                for (name, value) in self.descriptor.request_headers() {
                    req = req.header(name, value);
                }
                let _ = req.send().await;
                Ok(())
            }
            TransportDescriptor::Stdio { .. } => {
                let line = serde_json::to_string(&request)
                    .map_err(|e| UpstreamError::fatal(format!("encode failed: {e}")))?;
                let mut state = self.state.lock().await;
                self.ensure_stdio(&mut state).await?;
                let TransportState::Stdio(stdio) = &mut *state else {
                    return Err(UpstreamError::fatal("not a stdio transport"));
                };
                write_line(&mut stdio.stdin, &line).await
            }
            TransportDescriptor::Websocket { .. } => {
                let text = serde_json::to_string(&request)
                    .map_err(|e| UpstreamError::fatal(format!("encode failed: {e}")))?;
                let mut state = self.state.lock().await;
                self.ensure_ws(&mut state).await?;
                let TransportState::Websocket(ws) = &mut *state else {
                    return Err(UpstreamError::fatal("not a websocket transport"));
                };
                ws.send(Message::Text(text))
                    .await
                    .map_err(|e| UpstreamError::transient(format!("websocket send failed: {e}")))
            }
        }
    }

    // ------------------------------------------------------------------------
    // HTTP transport (with 402 state machine)
    // ------------------------------------------------------------------------

    async fn post_rpc(
        &self,
        url: &str,
        request: &JsonRpcRequest,
        forward: &Forward,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        match self.post_rpc_inner(url, request, forward, false).await? {
            Some(response) => Ok(response),
            None => Err(UpstreamError::transient("empty response body")),
        }
    }

    /// One logical POST, sent at most twice under the 402 machine. The
    /// machine only runs when this call's [`Forward`] armed a wallet;
    /// otherwise a downstream 402 surfaces as an error. With
    /// `allow_empty`, a success status without a JSON-RPC body yields
    /// `None` (the SSE transport answers on its stream instead).
    async fn post_rpc_inner(
        &self,
        url: &str,
        request: &JsonRpcRequest,
        forward: &Forward,
        allow_empty: bool,
    ) -> Result<Option<JsonRpcResponse>, UpstreamError> {
        let mut pay_state = PayState::Idle;
        let mut payment_header: Option<String> = None;

        loop {
            pay_state = match pay_state {
                PayState::Idle => PayState::SentOnce,
                PayState::Signed => PayState::SentTwice,
                // Only Idle and Signed are send states.
                other => other,
            };

            let mut req = self.http.post(url).json(request);
            for (name, value) in self.descriptor.request_headers() {
                req = req.header(name, value);
            }
            for (name, value) in &forward.headers {
                req = req.header(name, value);
            }
            if let Some(header) = &payment_header {
                req = req.header(X_PAYMENT, header);
            }

            let response = req
                .send()
                .await
                .map_err(|e| UpstreamError::transient(format!("HTTP request failed: {e}")))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| UpstreamError::transient(format!("failed to read response: {e}")))?;

            // HTTP-level 402: body is the challenge itself.
            if status.as_u16() == 402 {
                let Some(wallet) = &forward.wallet else {
                    return Err(UpstreamError::fatal(
                        "upstream requires payment and none was authorized for this call",
                    ));
                };
                let challenge: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                payment_header = Some(sign_challenge(wallet, &challenge, &mut pay_state)?);
                continue;
            }

            if !status.is_success() {
                return Err(UpstreamError::transient(format!(
                    "upstream returned HTTP {}",
                    status.as_u16()
                )));
            }

            let rpc: JsonRpcResponse = match serde_json::from_str(&body) {
                Ok(rpc) => rpc,
                Err(_) if allow_empty => return Ok(None),
                Err(e) => {
                    return Err(UpstreamError::transient(format!(
                        "invalid JSON-RPC response: {e}"
                    )));
                }
            };

            // JSON-RPC-level 402: challenge travels in error.data. Without
            // an armed wallet it propagates like any other upstream error.
            if let Some(error) = &rpc.error
                && error.is_payment_required()
                && let Some(wallet) = &forward.wallet
            {
                let challenge = error.data.clone().unwrap_or(Value::Null);
                payment_header = Some(sign_challenge(wallet, &challenge, &mut pay_state)?);
                continue;
            }

            return Ok(Some(rpc));
        }
    }

    // ------------------------------------------------------------------------
    // SSE transport
    // ------------------------------------------------------------------------

    async fn ensure_sse(&self, state: &mut TransportState) -> Result<(), UpstreamError> {
        if matches!(state, TransportState::Sse(_)) {
            return Ok(());
        }
        let TransportDescriptor::Sse { sse_url, .. } = &self.descriptor else {
            return Err(UpstreamError::fatal("not an sse transport"));
        };

        let mut req = self
            .http
            .get(sse_url)
            .header("Accept", "text/event-stream");
        for (name, value) in self.descriptor.request_headers() {
            req = req.header(name, value);
        }

        let response = req
            .send()
            .await
            .map_err(|e| UpstreamError::transient(format!("SSE connect failed: {e}")))?;
        if !response.status().is_success() {
            return Err(UpstreamError::transient(format!(
                "SSE connect returned HTTP {}",
                response.status().as_u16()
            )));
        }

        *state = TransportState::Sse(SseState {
            stream: response.bytes_stream().boxed(),
            decoder: SseDecoder::default(),
            pending: Vec::new(),
        });
        Ok(())
    }

    async fn sse_rpc(
        &self,
        post_url: &str,
        request: &JsonRpcRequest,
        forward: &Forward,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let mut state = self.state.lock().await;
        self.ensure_sse(&mut state).await?;

        // The POST side shares the 402 machine with the HTTP transport.
        match self.post_rpc_inner(post_url, request, forward, true).await? {
            Some(rpc) => Ok(rpc),
            // Accepted without a body: the answer arrives on the stream.
            None => {
                let TransportState::Sse(sse) = &mut *state else {
                    return Err(UpstreamError::fatal("not an sse transport"));
                };
                wait_for_sse_response(sse, &request.id).await
            }
        }
    }

    // ------------------------------------------------------------------------
    // Stdio transport
    // ------------------------------------------------------------------------

    async fn ensure_stdio(&self, state: &mut TransportState) -> Result<(), UpstreamError> {
        if matches!(state, TransportState::Stdio(_)) {
            return Ok(());
        }
        let TransportDescriptor::Stdio { command, args, env, cwd } = &self.descriptor else {
            return Err(UpstreamError::fatal("not a stdio transport"));
        };

        tracing::debug!(command = %command, "Spawning stdio upstream");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| UpstreamError::transient(format!("failed to spawn {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| UpstreamError::fatal("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UpstreamError::fatal("child stdout unavailable"))?;

        *state = TransportState::Stdio(StdioState {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        });
        Ok(())
    }

    async fn stdio_rpc(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, UpstreamError> {
        let line = serde_json::to_string(request)
            .map_err(|e| UpstreamError::fatal(format!("encode failed: {e}")))?;

        let mut state = self.state.lock().await;
        self.ensure_stdio(&mut state).await?;
        let TransportState::Stdio(stdio) = &mut *state else {
            return Err(UpstreamError::fatal("not a stdio transport"));
        };

        write_line(&mut stdio.stdin, &line).await?;

        // Read until the matching response; skip notifications and noise.
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = stdio
                .stdout
                .read_line(&mut buf)
                .await
                .map_err(|e| UpstreamError::transient(format!("read failed: {e}")))?;
            if n == 0 {
                return Err(UpstreamError::transient("upstream closed its stdout"));
            }
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(response) if response.id == request.id => return Ok(response),
                Ok(_) => continue,
                Err(_) => {
                    tracing::debug!(line = %trimmed, "Skipping non-response line from upstream");
                    continue;
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // WebSocket transport
    // ------------------------------------------------------------------------

    async fn ensure_ws(&self, state: &mut TransportState) -> Result<(), UpstreamError> {
        if matches!(state, TransportState::Websocket(_)) {
            return Ok(());
        }
        let TransportDescriptor::Websocket { url, .. } = &self.descriptor else {
            return Err(UpstreamError::fatal("not a websocket transport"));
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| UpstreamError::fatal(format!("invalid websocket URL: {e}")))?;
        for (name, value) in self.descriptor.request_headers() {
            let name = http::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| UpstreamError::fatal(format!("invalid header name: {e}")))?;
            let value = http::header::HeaderValue::from_str(&value)
                .map_err(|e| UpstreamError::fatal(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| UpstreamError::transient(format!("websocket connect failed: {e}")))?;

        *state = TransportState::Websocket(Box::new(stream));
        Ok(())
    }

    async fn ws_rpc(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, UpstreamError> {
        let text = serde_json::to_string(request)
            .map_err(|e| UpstreamError::fatal(format!("encode failed: {e}")))?;

        let mut state = self.state.lock().await;
        self.ensure_ws(&mut state).await?;
        let TransportState::Websocket(ws) = &mut *state else {
            return Err(UpstreamError::fatal("not a websocket transport"));
        };

        ws.send(Message::Text(text))
            .await
            .map_err(|e| UpstreamError::transient(format!("websocket send failed: {e}")))?;

        loop {
            let message = ws
                .next()
                .await
                .ok_or_else(|| UpstreamError::transient("websocket closed"))?
                .map_err(|e| UpstreamError::transient(format!("websocket read failed: {e}")))?;

            let text = match message {
                Message::Text(text) => text,
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => {
                    return Err(UpstreamError::transient("websocket closed by upstream"));
                }
                _ => continue,
            };

            match serde_json::from_str::<JsonRpcResponse>(&text) {
                Ok(response) if response.id == request.id => return Ok(response),
                _ => continue,
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Advance the pay machine through the cap check and signing. Fails when
/// the challenge is malformed, the amount exceeds the cap, or a signed
/// retry was already consumed.
fn sign_challenge(
    wallet: &OutboundWallet,
    challenge: &Value,
    pay_state: &mut PayState,
) -> Result<String, UpstreamError> {
    if *pay_state != PayState::SentOnce {
        return Err(UpstreamError::fatal(
            "upstream demanded payment again after a signed retry",
        ));
    }

    let requirements =
        OutboundWallet::parse_challenge(challenge).map_err(UpstreamError::from_wallet)?;
    // Cap check happens inside payment_header, before signing.
    let header = wallet
        .payment_header(&requirements)
        .map_err(UpstreamError::from_wallet)?;
    *pay_state = PayState::Signed;
    tracing::debug!(payer = %wallet.payer_ref(), "Signed downstream payment retry");
    Ok(header)
}

/// Fold extra headers into `params._meta.headers` for transports with no
/// header channel of their own.
fn fold_headers(params: Option<Value>, headers: &[(String, String)]) -> Option<Value> {
    if headers.is_empty() {
        return params;
    }
    let mut params = params.unwrap_or_else(|| json!({}));
    let header_map: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    params["_meta"]["headers"] = Value::Object(header_map);
    Some(params)
}

fn unwrap_response(response: JsonRpcResponse) -> Result<Value, UpstreamError> {
    if let Some(error) = response.error {
        return Err(UpstreamError::from_rpc(error));
    }
    response
        .result
        .ok_or_else(|| UpstreamError::transient("response has neither result nor error"))
}

async fn write_line(
    stdin: &mut tokio::process::ChildStdin,
    line: &str,
) -> Result<(), UpstreamError> {
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| UpstreamError::transient(format!("write failed: {e}")))?;
    stdin
        .write_all(b"\n")
        .await
        .map_err(|e| UpstreamError::transient(format!("write failed: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| UpstreamError::transient(format!("flush failed: {e}")))?;
    Ok(())
}

async fn wait_for_sse_response(
    sse: &mut SseState,
    wanted: &Option<JsonRpcId>,
) -> Result<JsonRpcResponse, UpstreamError> {
    if let Some(pos) = sse.pending.iter().position(|r| &r.id == wanted) {
        return Ok(sse.pending.remove(pos));
    }

    while let Some(chunk) = sse.stream.next().await {
        let chunk =
            chunk.map_err(|e| UpstreamError::transient(format!("SSE stream failed: {e}")))?;
        for data in sse.decoder.push(&chunk) {
            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&data) else {
                continue;
            };
            if &response.id == wanted {
                return Ok(response);
            }
            sse.pending.push(response);
        }
    }

    Err(UpstreamError::transient("SSE stream ended"))
}

/// Incremental decoder for `text/event-stream` payloads. Collects `data:`
/// lines and emits one string per complete event.
#[derive(Default)]
struct SseDecoder {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseDecoder {
    /// Feed a chunk of bytes; returns the data payloads of any events that
    /// completed within it.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
            // Comments, event names, and ids are ignored.
        }

        events
    }
}
