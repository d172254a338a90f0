//! Upstream session: one live MCP client plus its runtime status
//!
//! Sessions are owned by the connection manager. Status and capabilities
//! are interior-mutable so the manager can drive lifecycle while readers
//! hold `Arc` snapshots.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use crate::config::ServerConfig;

use super::client::{McpClient, UpstreamError};
use super::transport;

/// Connection status of one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Which capability families the upstream supports, discovered eagerly at
/// connect time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCapabilities {
    pub has_tools: bool,
    pub has_resources: bool,
    pub has_prompts: bool,
}

#[derive(Debug, Clone)]
struct SessionState {
    status: SessionStatus,
    last_error: Option<String>,
    last_health_check_at: Option<SystemTime>,
}

/// A live MCP client bound to one upstream.
pub struct UpstreamSession {
    spec: Arc<ServerConfig>,
    client: McpClient,
    state: RwLock<SessionState>,
    capabilities: RwLock<SessionCapabilities>,
}

impl UpstreamSession {
    /// Build a session in `Connecting` state. Fails only on transport
    /// configuration errors.
    pub fn new(spec: Arc<ServerConfig>) -> Result<Self, transport::ConfigError> {
        let client = transport::make(&spec.transport)?;
        Ok(UpstreamSession {
            spec,
            client,
            state: RwLock::new(SessionState {
                status: SessionStatus::Connecting,
                last_error: None,
                last_health_check_at: None,
            }),
            capabilities: RwLock::new(SessionCapabilities::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &Arc<ServerConfig> {
        &self.spec
    }

    pub fn client(&self) -> &McpClient {
        &self.client
    }

    pub fn status(&self) -> SessionStatus {
        self.state.read().map(|s| s.status).unwrap_or(SessionStatus::Error)
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().ok().and_then(|s| s.last_error.clone())
    }

    pub fn last_health_check_at(&self) -> Option<SystemTime> {
        self.state.read().ok().and_then(|s| s.last_health_check_at)
    }

    pub fn capabilities(&self) -> SessionCapabilities {
        self.capabilities
            .read()
            .map(|c| *c)
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    fn set_status(&self, status: SessionStatus, error: Option<String>) {
        if let Ok(mut state) = self.state.write() {
            state.status = status;
            if status == SessionStatus::Error && error.is_none() && state.last_error.is_none() {
                state.last_error = Some("unknown error".to_string());
            }
            if let Some(error) = error {
                state.last_error = Some(error);
            }
        }
    }

    pub fn mark_health_checked(&self) {
        if let Ok(mut state) = self.state.write() {
            state.last_health_check_at = Some(SystemTime::now());
        }
    }

    /// Connect (or reconnect): initialize the MCP handshake under the
    /// configured timeout, then probe capabilities eagerly. A timeout or
    /// handshake failure parks the session in `Error`.
    pub async fn connect(&self) -> Result<(), UpstreamError> {
        self.set_status(SessionStatus::Connecting, None);
        // Drop any stale child/socket from a previous life.
        self.client.close().await;

        let timeout = Duration::from_millis(self.spec.connect_timeout_ms);
        let handshake = tokio::time::timeout(timeout, self.client.initialize()).await;

        match handshake {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.set_status(SessionStatus::Error, Some(e.message.clone()));
                return Err(e);
            }
            Err(_) => {
                let error = UpstreamError::transient(format!(
                    "connect timed out after {}ms",
                    self.spec.connect_timeout_ms
                ));
                self.set_status(SessionStatus::Error, Some(error.message.clone()));
                return Err(error);
            }
        }

        self.probe_capabilities().await;
        self.set_status(SessionStatus::Connected, None);

        let caps = self.capabilities();
        tracing::info!(
            upstream = %self.spec.id,
            tools = caps.has_tools,
            resources = caps.has_resources,
            prompts = caps.has_prompts,
            "Upstream connected"
        );
        Ok(())
    }

    /// Attempt each list verb once; a failure marks that capability false
    /// without failing the session. An upstream that only serves tools is
    /// perfectly valid.
    async fn probe_capabilities(&self) {
        let caps = SessionCapabilities {
            has_tools: self.client.list_tools().await.is_ok(),
            has_resources: self.client.list_resources().await.is_ok(),
            has_prompts: self.client.list_prompts().await.is_ok(),
        };
        if let Ok(mut slot) = self.capabilities.write() {
            *slot = caps;
        }
    }

    /// Cheap health probe: ping, falling back to the cheapest supported
    /// list call for servers that don't implement ping.
    pub async fn probe(&self) -> Result<(), UpstreamError> {
        self.mark_health_checked();

        if self.client.ping().await.is_ok() {
            return Ok(());
        }

        let caps = self.capabilities();
        let result = if caps.has_tools {
            self.client.list_tools().await.map(|_| ())
        } else if caps.has_resources {
            self.client.list_resources().await.map(|_| ())
        } else if caps.has_prompts {
            self.client.list_prompts().await.map(|_| ())
        } else {
            self.client.ping().await
        };

        if let Err(e) = &result {
            let status = if e.transient {
                SessionStatus::Disconnected
            } else {
                SessionStatus::Error
            };
            self.set_status(status, Some(e.message.clone()));
        }
        result
    }

    /// Best-effort close; the session ends up `Disconnected`.
    pub async fn close(&self) {
        self.client.close().await;
        self.set_status(SessionStatus::Disconnected, None);
    }
}

impl std::fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("id", &self.spec.id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn spec(json: &str) -> Arc<ServerConfig> {
        let config = GatewayConfig::from_json(json).unwrap();
        Arc::new(config.servers[0].clone())
    }

    #[test]
    fn new_session_starts_connecting() {
        let spec = spec(r#"{"name":"gw","servers":[{"id":"a","command":"true"}]}"#);
        let session = UpstreamSession::new(spec).unwrap();
        assert_eq!(session.status(), SessionStatus::Connecting);
        assert!(!session.is_connected());
        assert!(session.last_health_check_at().is_none());
    }

    #[test]
    fn invalid_transport_fails_construction() {
        let spec = spec(
            r#"{"name":"gw","servers":[{"id":"a","transport":{"type":"http","url":"nope"}}]}"#,
        );
        assert!(UpstreamSession::new(spec).is_err());
    }

    #[tokio::test]
    async fn connect_timeout_parks_in_error() {
        // `sleep` never speaks MCP, so the handshake must time out.
        let spec = spec(
            r#"{"name":"gw","servers":[{"id":"slow","command":"sleep","args":["5"],"connectTimeoutMs":50}]}"#,
        );
        let session = UpstreamSession::new(spec).unwrap();
        let error = session.connect().await.unwrap_err();
        assert!(error.transient);
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session.last_error().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn connect_failure_records_error() {
        let spec = spec(
            r#"{"name":"gw","servers":[{"id":"x","command":"mux402-definitely-not-a-binary","connectTimeoutMs":2000}]}"#,
        );
        let session = UpstreamSession::new(spec).unwrap();
        assert!(session.connect().await.is_err());
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session.last_error().is_some());
    }

    #[tokio::test]
    async fn probe_stamps_health_check_time() {
        let spec = spec(
            r#"{"name":"gw","servers":[{"id":"x","command":"mux402-definitely-not-a-binary"}]}"#,
        );
        let session = UpstreamSession::new(spec).unwrap();
        let _ = session.probe().await;
        assert!(session.last_health_check_at().is_some());
    }
}
