//! Gateway front-end: the downstream-facing MCP endpoint
//!
//! Reads JSON-RPC requests (stdio binding), resolves exposed names through
//! the registry snapshot, runs payment admission, and dispatches to the
//! owning upstream session. Each inbound request runs as its own task;
//! responses are serialized through a single stdout writer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::config::GatewayConfig;
use crate::x402::{
    EntryKind, FacilitatorClient, ForwardDirective, HeaderBag, InboundAuth, PaymentMediator,
    PaymentOutcome,
};

use super::client::Forward;
use super::manager::ConnectionManager;
use super::protocol::*;
use super::registry::CapabilityRegistry;
use super::session::UpstreamSession;

pub struct McpGateway {
    config: Arc<GatewayConfig>,
    manager: Arc<ConnectionManager>,
    registry: Arc<CapabilityRegistry>,
    mediator: Arc<PaymentMediator<FacilitatorClient>>,
}

impl McpGateway {
    /// Build the gateway, connect every upstream, publish the first
    /// registry snapshot, and start the health loop.
    pub async fn start(config: GatewayConfig) -> Result<Arc<Self>> {
        let config = Arc::new(config);

        let facilitator = match (config.payment.enabled, &config.payment.facilitator_url) {
            (true, Some(url)) => Some(FacilitatorClient::try_new(url)?),
            (true, None) => {
                tracing::warn!("Payment policy enabled without facilitatorUrl; x402 payments will be rejected");
                None
            }
            _ => None,
        };
        let mediator = Arc::new(PaymentMediator::new(config.payment.clone(), facilitator));

        let manager = Arc::new(ConnectionManager::new(
            config.settings.max_concurrent_connections,
        ));
        let registry = Arc::new(CapabilityRegistry::new(&config.settings));

        tracing::info!(
            name = %config.name,
            version = %config.version,
            upstreams = config.servers.len(),
            "Gateway starting"
        );

        manager.initialize(&config.servers).await;
        registry.refresh(&manager.get_connected().await).await;

        let gateway = Arc::new(McpGateway {
            config,
            manager: Arc::clone(&manager),
            registry: Arc::clone(&registry),
            mediator,
        });

        // Registry rebuilds follow every health pass.
        let mut health_events = manager.subscribe();
        {
            let manager = Arc::clone(&manager);
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                while health_events.changed().await.is_ok() {
                    registry.refresh(&manager.get_connected().await).await;
                }
            });
        }

        let period = Duration::from_secs(gateway.config.settings.health_check_interval);
        tokio::spawn(Arc::clone(&manager).run_health_loop(period));

        Ok(gateway)
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Administrative rebuild from the current connected set.
    pub async fn refresh_registry(&self) {
        self.registry.refresh(&self.manager.get_connected().await).await;
    }

    /// Graceful shutdown: close every upstream session.
    pub async fn stop(&self) {
        self.manager.close_all().await;
        tracing::info!("Gateway stopped");
    }

    // ------------------------------------------------------------------------
    // Stdio binding
    // ------------------------------------------------------------------------

    /// Main event loop: read JSON-RPC lines from stdin, answer on stdout.
    /// Requests run concurrently; the writer task keeps output framed.
    pub async fn run_stdio(self: Arc<Self>) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut line = String::new();

        let (tx, mut rx) = mpsc::channel::<JsonRpcResponse>(64);
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(response) = rx.recv().await {
                let Ok(mut out) = serde_json::to_vec(&response) else {
                    continue;
                };
                out.push(b'\n');
                if stdout.write_all(&out).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        });

        tracing::info!("Gateway listening on stdio");

        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                tracing::info!("EOF on stdin, shutting down");
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                Ok(request) => request,
                Err(e) => {
                    let _ = tx.send(JsonRpcResponse::parse_error(&e.to_string())).await;
                    continue;
                }
            };

            if request.is_notification() {
                self.handle_notification(&request);
                continue;
            }

            let gateway = Arc::clone(&self);
            let tx = tx.clone();
            tokio::spawn(async move {
                let response = gateway.handle_request(request, None).await;
                let _ = tx.send(response).await;
            });
        }

        drop(tx);
        let _ = writer.await;
        self.stop().await;
        Ok(())
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        match request.method.as_str() {
            "notifications/initialized" => tracing::debug!("Client initialized"),
            "notifications/cancelled" => tracing::debug!("Client cancelled a request"),
            other => tracing::debug!(method = %other, "Ignoring unknown notification"),
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Handle one request. `external_headers` carries transport headers on
    /// the HTTP wrapper binding; on stdio, headers ride in `_meta.headers`.
    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
        external_headers: Option<HeaderBag>,
    ) -> JsonRpcResponse {
        let id = request.id.clone();
        tracing::debug!(method = %request.method, id = ?id, "Inbound request");

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.handle_tools_list()),
            "resources/list" => Ok(self.handle_resources_list()),
            "prompts/list" => Ok(self.handle_prompts_list()),
            "tools/call" => self.handle_tools_call(request.params, external_headers).await,
            "resources/read" => self.handle_resources_read(request.params, external_headers).await,
            "prompts/get" => self.handle_prompts_get(request.params, external_headers).await,
            "registry/refresh" => {
                self.refresh_registry().await;
                let stats = self.registry.stats();
                Ok(json!({
                    "tools": stats.tools,
                    "resources": stats.resources,
                    "prompts": stats.prompts,
                }))
            }
            method => Err(JsonRpcError::method_not_found(method)),
        };

        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => {
                tracing::debug!(code = error.code, message = %error.message, "Request failed");
                JsonRpcResponse::error(id, error)
            }
        }
    }

    fn handle_initialize(&self) -> Result<Value, JsonRpcError> {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(json!({"listChanged": false})),
                resources: Some(json!({"subscribe": false, "listChanged": false})),
                prompts: Some(json!({"listChanged": false})),
            },
            server_info: ServerInfo {
                name: self.config.name.clone(),
                version: self.config.version.clone(),
            },
        };
        serde_json::to_value(result).map_err(|e| JsonRpcError::internal(e.to_string()))
    }

    // ------------------------------------------------------------------------
    // Listings
    // ------------------------------------------------------------------------

    fn handle_tools_list(&self) -> Value {
        let snapshot = self.registry.snapshot();
        let tools: Vec<ToolInfo> = snapshot
            .tools
            .iter()
            .map(|tool| {
                let mut description = tool.description.clone().unwrap_or_else(|| {
                    default_description(EntryKind::Tool, &tool.upstream_id, tool.namespace.as_deref())
                });
                // Priced tools advertise their client-facing price.
                if let Some(server) = self.config.server(&tool.upstream_id)
                    && let Some(price) =
                        self.mediator.published_price(&server.payment, &tool.original_name)
                {
                    description.push_str(&format!(" [{price}/call]"));
                }
                ToolInfo {
                    name: tool.exposed_name.clone(),
                    description: Some(description),
                    input_schema: tool.input_schema.clone(),
                }
            })
            .collect();
        json!({ "tools": tools })
    }

    fn handle_resources_list(&self) -> Value {
        let snapshot = self.registry.snapshot();
        let resources: Vec<ResourceInfo> = snapshot
            .resources
            .iter()
            .map(|resource| ResourceInfo {
                uri: resource.exposed_name.clone(),
                name: resource.name.clone(),
                description: Some(resource.description.clone().unwrap_or_else(|| {
                    default_description(
                        EntryKind::Resource,
                        &resource.upstream_id,
                        resource.namespace.as_deref(),
                    )
                })),
                mime_type: resource.mime_type.clone(),
            })
            .collect();
        json!({ "resources": resources })
    }

    fn handle_prompts_list(&self) -> Value {
        let snapshot = self.registry.snapshot();
        let prompts: Vec<PromptInfo> = snapshot
            .prompts
            .iter()
            .map(|prompt| PromptInfo {
                name: prompt.exposed_name.clone(),
                description: Some(prompt.description.clone().unwrap_or_else(|| {
                    default_description(
                        EntryKind::Prompt,
                        &prompt.upstream_id,
                        prompt.namespace.as_deref(),
                    )
                })),
                arguments: prompt.arguments.clone(),
            })
            .collect();
        json!({ "prompts": prompts })
    }

    // ------------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------------

    async fn handle_tools_call(
        &self,
        params: Option<Value>,
        external_headers: Option<HeaderBag>,
    ) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
        let call: ToolCallParams = serde_json::from_value(params)
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {e}")))?;

        let entry = self
            .registry
            .find_tool(&call.name)
            .ok_or_else(|| JsonRpcError::method_not_found(&call.name))?;

        let headers = headers_for(external_headers, call.meta.as_ref());
        let session = self.connected_session(&entry.upstream_id).await?;
        let forward = self
            .admit(EntryKind::Tool, &entry.exposed_name, &entry.original_name, &session, &headers)
            .await?;

        session
            .client()
            .call_tool(&entry.original_name, call.arguments, &forward)
            .await
            .map_err(|e| JsonRpcError::internal(format!("tool execution failed: {}", e.message)))
    }

    async fn handle_resources_read(
        &self,
        params: Option<Value>,
        external_headers: Option<HeaderBag>,
    ) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
        let read: ReadResourceParams = serde_json::from_value(params)
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {e}")))?;

        let entry = self
            .registry
            .find_resource(&read.uri)
            .ok_or_else(|| JsonRpcError::method_not_found(&read.uri))?;

        let headers = headers_for(external_headers, read.meta.as_ref());
        let session = self.connected_session(&entry.upstream_id).await?;
        // Resources are priced by their original URI.
        let forward = self
            .admit(
                EntryKind::Resource,
                &entry.exposed_name,
                &entry.original_uri,
                &session,
                &headers,
            )
            .await?;

        session
            .client()
            .read_resource(&entry.original_uri, &forward)
            .await
            .map_err(|e| JsonRpcError::internal(format!("resource read failed: {}", e.message)))
    }

    async fn handle_prompts_get(
        &self,
        params: Option<Value>,
        external_headers: Option<HeaderBag>,
    ) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
        let get: GetPromptParams = serde_json::from_value(params)
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {e}")))?;

        let entry = self
            .registry
            .find_prompt(&get.name)
            .ok_or_else(|| JsonRpcError::method_not_found(&get.name))?;

        let headers = headers_for(external_headers, get.meta.as_ref());
        let session = self.connected_session(&entry.upstream_id).await?;
        let forward = self
            .admit(
                EntryKind::Prompt,
                &entry.exposed_name,
                &entry.original_name,
                &session,
                &headers,
            )
            .await?;

        session
            .client()
            .get_prompt(&entry.original_name, get.arguments, &forward)
            .await
            .map_err(|e| JsonRpcError::internal(format!("prompt fetch failed: {}", e.message)))
    }

    async fn connected_session(
        &self,
        upstream_id: &str,
    ) -> Result<Arc<UpstreamSession>, JsonRpcError> {
        self.manager
            .find_connected(upstream_id)
            .await
            .ok_or_else(|| JsonRpcError::internal("server not connected"))
    }

    /// Run admission for one call. On success, returns this call's
    /// forwarding options: which headers to attach and whether the
    /// gateway's wallet may answer a downstream 402.
    async fn admit(
        &self,
        kind: EntryKind,
        exposed_name: &str,
        pricing_key: &str,
        session: &Arc<UpstreamSession>,
        headers: &HeaderBag,
    ) -> Result<Forward, JsonRpcError> {
        let upstream_policy = &session.spec().payment;
        let auth = InboundAuth::from_headers(headers);

        let outcome = self
            .mediator
            .admit(kind, exposed_name, upstream_policy, pricing_key, &auth)
            .await;

        match outcome {
            PaymentOutcome::AllowFree => {}
            PaymentOutcome::AllowPaid { method, amount } => {
                tracing::info!(
                    %exposed_name,
                    method = ?method,
                    amount = %amount,
                    "Paid call admitted"
                );
            }
            PaymentOutcome::Challenge { requirements } => {
                let data = serde_json::to_value(&requirements)
                    .map_err(|e| JsonRpcError::internal(e.to_string()))?;
                return Err(JsonRpcError::payment_required(
                    format!("Payment required for {}: {}", kind.label(), exposed_name),
                    Some(data),
                ));
            }
            PaymentOutcome::Reject { reason, requirements } => {
                let data = serde_json::to_value(&requirements)
                    .map_err(|e| JsonRpcError::internal(e.to_string()))?;
                return Err(JsonRpcError::payment_required(reason, Some(data)));
            }
        }

        // The directive computed here is what arms (or withholds) the
        // wallet for this specific call.
        match self.mediator.forward_directive(upstream_policy, headers) {
            ForwardDirective::Plain => Ok(Forward::plain()),
            ForwardDirective::Passthrough(copied) => Ok(Forward::passthrough(copied)),
            ForwardDirective::Pay(wallet) => Ok(Forward::paying(wallet)),
        }
    }
}

/// HTTP wrapper headers win; the streaming binding falls back to
/// `_meta.headers`.
fn headers_for(external: Option<HeaderBag>, meta: Option<&Value>) -> HeaderBag {
    if let Some(external) = external {
        return external;
    }
    meta.and_then(|meta| meta.get("headers"))
        .map(HeaderBag::from_json)
        .unwrap_or_default()
}

fn default_description(kind: EntryKind, upstream_id: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{} from {} ({})", kind.title(), upstream_id, ns),
        None => format!("{} from {}", kind.title(), upstream_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json as AxumJson, Router, http::HeaderMap, routing::post as axum_post};
    use std::net::SocketAddr;

    async fn gateway(config_json: &str) -> Arc<McpGateway> {
        let config = GatewayConfig::from_json(config_json).unwrap();
        McpGateway::start(config).await.unwrap()
    }

    /// Minimal MCP server over HTTP: one tool `ls` whose call result
    /// echoes the tool name it was invoked with.
    async fn upstream_handler(
        AxumJson(request): AxumJson<JsonRpcRequest>,
    ) -> AxumJson<JsonRpcResponse> {
        let id = request.id.clone();
        let result = match request.method.as_str() {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "stub-upstream", "version": "0.0.1"}
            }),
            "ping" => json!({}),
            "tools/list" => json!({
                "tools": [
                    {"name": "ls", "description": "List files", "inputSchema": {"type": "object"}}
                ]
            }),
            "tools/call" => {
                let name = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("?")
                    .to_string();
                json!({"content": [{"type": "text", "text": name}]})
            }
            other => {
                return AxumJson(JsonRpcResponse::error(
                    id,
                    JsonRpcError::method_not_found(other),
                ));
            }
        };
        AxumJson(JsonRpcResponse::success(id, result))
    }

    async fn spawn_upstream() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/mcp", axum_post(upstream_handler));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Like `upstream_handler`, but tool calls answer a JSON-RPC 402 until
    /// an `X-PAYMENT` header arrives; a paid call returns "paid".
    async fn paid_upstream_handler(
        headers: HeaderMap,
        AxumJson(request): AxumJson<JsonRpcRequest>,
    ) -> AxumJson<JsonRpcResponse> {
        let id = request.id.clone();
        let result = match request.method.as_str() {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "paid-upstream", "version": "0.0.1"}
            }),
            "ping" => json!({}),
            "tools/list" => json!({
                "tools": [{"name": "ls", "inputSchema": {"type": "object"}}]
            }),
            "tools/call" if headers.contains_key("x-payment") => {
                json!({"content": [{"type": "text", "text": "paid"}]})
            }
            "tools/call" => {
                let challenge = crate::x402::PaymentRequirements::exact(
                    crate::x402::Network::Base,
                    "$0.01",
                    "0xfeed",
                    "/tools/ls".to_string(),
                    "Payment for MCP tool: ls".to_string(),
                );
                return AxumJson(JsonRpcResponse::error(
                    id,
                    JsonRpcError::payment_required(
                        "Payment required",
                        Some(serde_json::to_value(&challenge).unwrap()),
                    ),
                ));
            }
            other => {
                return AxumJson(JsonRpcResponse::error(
                    id,
                    JsonRpcError::method_not_found(other),
                ));
            }
        };
        AxumJson(JsonRpcResponse::success(id, result))
    }

    async fn spawn_paid_upstream() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/mcp", axum_post(paid_upstream_handler));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn free_tool_call_forwards_original_name() {
        let addr = spawn_upstream().await;
        let config = format!(
            r#"{{"name":"gw","servers":[{{"id":"files","namespace":"fs",
                "transport":{{"type":"http","url":"http://{addr}/mcp"}}}}]}}"#
        );
        let gw = gateway(&config).await;

        // The probe marked resources/prompts unsupported; only the tool
        // is aggregated, under its namespace.
        let list = gw
            .handle_request(JsonRpcRequest::new(1, "tools/list", None), None)
            .await;
        let tools = list.result.unwrap()["tools"].clone();
        assert_eq!(tools.as_array().unwrap().len(), 1);
        assert_eq!(tools[0]["name"], "fs:ls");

        let response = gw
            .handle_request(
                JsonRpcRequest::new(
                    2,
                    "tools/call",
                    Some(json!({"name": "fs:ls", "arguments": {}})),
                ),
                None,
            )
            .await;
        // The upstream saw the original name, not the namespaced one.
        let result = response.result.unwrap();
        assert_eq!(result["content"][0]["text"], "ls");
    }

    #[tokio::test]
    async fn paid_tool_challenges_without_payment() {
        let addr = spawn_upstream().await;
        let config = format!(
            r#"{{
                "name": "gw",
                "payment": {{
                    "enabled": true,
                    "recipient": "0xAB01",
                    "network": "base-sepolia",
                    "facilitatorUrl": "http://127.0.0.1:9/"
                }},
                "servers": [{{
                    "id": "api",
                    "transport": {{"type": "http", "url": "http://{addr}/mcp"}},
                    "payment": {{"defaultPricing": {{"x402": "$0.01"}}}}
                }}]
            }}"#
        );
        let gw = gateway(&config).await;

        let response = gw
            .handle_request(
                JsonRpcRequest::new(1, "tools/call", Some(json!({"name": "ls"}))),
                None,
            )
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, PAYMENT_REQUIRED);
        let data = error.data.unwrap();
        assert_eq!(data["x402Version"], 1);
        assert_eq!(data["accepts"][0]["scheme"], "exact");
        assert_eq!(data["accepts"][0]["network"], "base-sepolia");
        assert_eq!(data["accepts"][0]["maxAmountRequired"], "10000");
        assert_eq!(data["accepts"][0]["payTo"], "0xAB01");
        assert_eq!(data["accepts"][0]["resource"], "/tools/ls");
        assert_eq!(data["accepts"][0]["description"], "Payment for MCP tool: ls");
    }

    #[tokio::test]
    async fn priced_tool_advertises_price_in_listing() {
        let addr = spawn_upstream().await;
        let config = format!(
            r#"{{
                "name": "gw",
                "payment": {{"enabled": true, "recipient": "0xAB01",
                             "facilitatorUrl": "http://127.0.0.1:9/"}},
                "servers": [{{
                    "id": "api",
                    "transport": {{"type": "http", "url": "http://{addr}/mcp"}},
                    "payment": {{
                        "mode": "markup",
                        "markup": "20%",
                        "defaultPricing": {{"x402": "$0.10"}}
                    }}
                }}]
            }}"#
        );
        let gw = gateway(&config).await;

        let list = gw
            .handle_request(JsonRpcRequest::new(1, "tools/list", None), None)
            .await;
        let description = list.result.unwrap()["tools"][0]["description"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(description.contains("[$0.120000/call]"), "{description}");
    }

    #[tokio::test]
    async fn api_key_free_tier_bypasses_facilitator_and_forwards() {
        let addr = spawn_upstream().await;
        // The facilitator URL is unreachable, so a successful call proves
        // the API key path never touched it.
        let config = format!(
            r#"{{
                "name": "gw",
                "payment": {{
                    "enabled": true,
                    "recipient": "0xAB01",
                    "facilitatorUrl": "http://127.0.0.1:9/",
                    "apiKeys": [{{"key": "K", "tier": "premium"}}]
                }},
                "servers": [{{
                    "id": "api",
                    "transport": {{"type": "http", "url": "http://{addr}/mcp"}},
                    "payment": {{"defaultPricing": {{
                        "x402": "$0.10",
                        "apiKeyTiers": {{"premium": "free"}}
                    }}}}
                }}]
            }}"#
        );
        let gw = gateway(&config).await;

        let params = json!({
            "name": "ls",
            "arguments": {},
            "_meta": {"headers": {"X-ELIZA-API-KEY": "K"}}
        });
        let response = gw
            .handle_request(JsonRpcRequest::new(1, "tools/call", Some(params)), None)
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["content"][0]["text"], "ls");
    }

    #[tokio::test]
    async fn duplicate_tool_names_resolve_and_dispatch() {
        let addr = spawn_upstream().await;
        let url = format!("http://{addr}/mcp");
        let config = format!(
            r#"{{"name":"gw","servers":[
                {{"id":"first","transport":{{"type":"http","url":"{url}"}}}},
                {{"id":"second","transport":{{"type":"http","url":"{url}"}}}}
            ]}}"#
        );
        let gw = gateway(&config).await;

        let list = gw
            .handle_request(JsonRpcRequest::new(1, "tools/list", None), None)
            .await;
        let tools = list.result.unwrap()["tools"].clone();
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["ls", "ls@second"]);

        // The renamed entry dispatches to the second upstream under the
        // original tool name.
        let response = gw
            .handle_request(
                JsonRpcRequest::new(2, "tools/call", Some(json!({"name": "ls@second"}))),
                None,
            )
            .await;
        assert_eq!(response.result.unwrap()["content"][0]["text"], "ls");
    }

    #[tokio::test]
    async fn mode_none_upstream_is_never_paid_by_gateway() {
        let addr = spawn_paid_upstream().await;
        // An outbound credential is configured gateway-wide, but this
        // upstream's mode is the default (none): its 402 must surface as
        // an error, not be paid from gateway funds.
        let config = format!(
            r#"{{
                "name": "gw",
                "payment": {{"outboundCredential": "cred-abc"}},
                "servers": [{{
                    "id": "strict",
                    "transport": {{"type": "http", "url": "http://{addr}/mcp"}}
                }}]
            }}"#
        );
        let gw = gateway(&config).await;

        let response = gw
            .handle_request(
                JsonRpcRequest::new(1, "tools/call", Some(json!({"name": "ls"}))),
                None,
            )
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, INTERNAL_ERROR);
        assert!(error.message.contains("402"), "{}", error.message);
    }

    #[tokio::test]
    async fn absorb_mode_pays_downstream_with_gateway_wallet() {
        let addr = spawn_paid_upstream().await;
        let config = format!(
            r#"{{
                "name": "gw",
                "payment": {{"outboundCredential": "cred-abc"}},
                "servers": [{{
                    "id": "paid",
                    "transport": {{"type": "http", "url": "http://{addr}/mcp"}},
                    "payment": {{"mode": "absorb"}}
                }}]
            }}"#
        );
        let gw = gateway(&config).await;

        // The 402 is answered with a signed retry from the gateway wallet.
        let response = gw
            .handle_request(
                JsonRpcRequest::new(1, "tools/call", Some(json!({"name": "ls"}))),
                None,
            )
            .await;
        assert_eq!(response.result.unwrap()["content"][0]["text"], "paid");
    }

    #[tokio::test]
    async fn passthrough_forwards_client_payment_header() {
        let addr = spawn_paid_upstream().await;
        let config = format!(
            r#"{{
                "name": "gw",
                "payment": {{"outboundCredential": "cred-abc"}},
                "servers": [{{
                    "id": "relay",
                    "transport": {{"type": "http", "url": "http://{addr}/mcp"}},
                    "payment": {{"mode": "passthrough"}}
                }}]
            }}"#
        );
        let gw = gateway(&config).await;

        // The client's own proof satisfies the upstream; the gateway's
        // wallet is not armed in passthrough mode.
        let params = json!({
            "name": "ls",
            "arguments": {},
            "_meta": {"headers": {"X-PAYMENT": "client-proof"}}
        });
        let response = gw
            .handle_request(JsonRpcRequest::new(1, "tools/call", Some(params)), None)
            .await;
        assert_eq!(response.result.unwrap()["content"][0]["text"], "paid");
    }

    #[tokio::test]
    async fn health_pass_reconnects_and_registry_recovers() {
        // Bind the port but don't serve yet: the first connect times out.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = format!(
            r#"{{"name":"gw","servers":[{{"id":"late",
                "transport":{{"type":"http","url":"http://{addr}/mcp"}},
                "connectTimeoutMs":300,"retryAttempts":1,"retryDelayMs":10}}]}}"#
        );
        let gw = gateway(&config).await;
        assert!(gw.manager().get_connected().await.is_empty());
        assert!(gw.registry().snapshot().tools.is_empty());

        // The upstream comes up; the next health pass reconnects it.
        let app = Router::new().route("/mcp", axum_post(upstream_handler));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        gw.manager().health_check().await;
        gw.refresh_registry().await;

        assert_eq!(gw.manager().get_connected().await.len(), 1);
        assert!(gw.registry().find_tool("ls").is_some());
    }

    #[tokio::test]
    async fn initialize_reports_gateway_identity() {
        let gw = gateway(r#"{"name": "test-gw", "version": "2.0"}"#).await;
        let response = gw
            .handle_request(
                JsonRpcRequest::new(1, "initialize", None),
                None,
            )
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "test-gw");
        assert_eq!(result["serverInfo"]["version"], "2.0");
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn empty_registry_is_a_valid_steady_state() {
        let gw = gateway(r#"{"name": "gw"}"#).await;

        let response = gw
            .handle_request(JsonRpcRequest::new(1, "tools/list", None), None)
            .await;
        assert_eq!(response.result.unwrap()["tools"], json!([]));

        let response = gw
            .handle_request(JsonRpcRequest::new(2, "resources/list", None), None)
            .await;
        assert_eq!(response.result.unwrap()["resources"], json!([]));
    }

    #[tokio::test]
    async fn unknown_tool_is_method_not_found() {
        let gw = gateway(r#"{"name": "gw"}"#).await;
        let response = gw
            .handle_request(
                JsonRpcRequest::new(1, "tools/call", Some(json!({"name": "nope"}))),
                None,
            )
            .await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let gw = gateway(r#"{"name": "gw"}"#).await;
        let response = gw
            .handle_request(JsonRpcRequest::new(1, "tools/destroy", None), None)
            .await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn ping_answers_empty_object() {
        let gw = gateway(r#"{"name": "gw"}"#).await;
        let response = gw
            .handle_request(JsonRpcRequest::new(1, "ping", None), None)
            .await;
        assert_eq!(response.result.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn registry_refresh_reports_stats() {
        let gw = gateway(r#"{"name": "gw"}"#).await;
        let response = gw
            .handle_request(JsonRpcRequest::new(1, "registry/refresh", None), None)
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["tools"], 0);
        assert_eq!(result["prompts"], 0);
    }

    #[test]
    fn default_descriptions() {
        assert_eq!(
            default_description(EntryKind::Tool, "fs", None),
            "Tool from fs"
        );
        assert_eq!(
            default_description(EntryKind::Resource, "fs", Some("files")),
            "Resource from fs (files)"
        );
    }

    #[test]
    fn meta_headers_are_extracted_on_streaming_binding() {
        let meta = json!({"headers": {"X-ELIZA-API-KEY": "K"}});
        let headers = headers_for(None, Some(&meta));
        assert_eq!(headers.get("x-eliza-api-key"), Some("K"));
    }

    #[test]
    fn external_headers_win_over_meta() {
        let meta = json!({"headers": {"X-PAYMENT": "from-meta"}});
        let external = HeaderBag::new(vec![("X-PAYMENT".to_string(), "from-http".to_string())]);
        let headers = headers_for(Some(external), Some(&meta));
        assert_eq!(headers.get("x-payment"), Some("from-http"));
    }
}
