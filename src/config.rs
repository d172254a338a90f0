//! Gateway configuration
//!
//! Configuration is loaded from a JSON file path or an inline JSON string.
//! Legacy server entries that carry top-level `command`/`args` (with no
//! tagged `transport`) are coerced into a stdio descriptor here, once; the
//! rest of the gateway only ever sees the tagged form.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::logging::LogLevel;
use crate::mcp::transport::{ConfigError, TransportDescriptor};
use crate::x402::{PaymentPolicy, UpstreamPaymentPolicy};

// ============================================================================
// Server (upstream) configuration
// ============================================================================

/// Immutable configuration for one upstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawServerConfig")]
pub struct ServerConfig {
    pub id: String,

    /// Prefixed onto exposed names; must match `[A-Za-z][A-Za-z0-9_-]*`.
    pub namespace: Option<String>,

    pub enabled: bool,

    pub transport: TransportDescriptor,

    #[serde(rename = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,

    #[serde(rename = "retryAttempts")]
    pub retry_attempts: u32,

    #[serde(rename = "retryDelayMs")]
    pub retry_delay_ms: u64,

    pub payment: UpstreamPaymentPolicy,
}

/// Wire form of a server entry, including the legacy untagged stdio shape.
#[derive(Debug, Deserialize)]
struct RawServerConfig {
    id: String,

    #[serde(default)]
    namespace: Option<String>,

    #[serde(default = "default_true")]
    enabled: bool,

    #[serde(default)]
    transport: Option<TransportDescriptor>,

    // Legacy top-level stdio fields
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,

    #[serde(default = "default_connect_timeout", rename = "connectTimeoutMs")]
    connect_timeout_ms: u64,

    #[serde(default = "default_retry_attempts", rename = "retryAttempts")]
    retry_attempts: u32,

    #[serde(default = "default_retry_delay", rename = "retryDelayMs")]
    retry_delay_ms: u64,

    #[serde(default)]
    payment: UpstreamPaymentPolicy,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1_000
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = ConfigError;

    fn try_from(raw: RawServerConfig) -> Result<Self, Self::Error> {
        let transport = match (raw.transport, raw.command) {
            (Some(transport), _) => transport,
            (None, Some(command)) => TransportDescriptor::Stdio {
                command,
                args: raw.args,
                env: raw.env,
                cwd: raw.cwd,
            },
            (None, None) => {
                return Err(ConfigError::MissingTransport { id: raw.id });
            }
        };

        if let Some(namespace) = &raw.namespace
            && !valid_namespace(namespace)
        {
            return Err(ConfigError::InvalidNamespace {
                namespace: namespace.clone(),
            });
        }

        Ok(ServerConfig {
            id: raw.id,
            namespace: raw.namespace,
            enabled: raw.enabled,
            transport,
            connect_timeout_ms: raw.connect_timeout_ms,
            retry_attempts: raw.retry_attempts,
            retry_delay_ms: raw.retry_delay_ms,
            payment: raw.payment,
        })
    }
}

/// `[A-Za-z][A-Za-z0-9_-]*`
fn valid_namespace(namespace: &str) -> bool {
    let mut chars = namespace.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ============================================================================
// Gateway settings
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "enableToolConflictResolution")]
    pub enable_tool_conflict_resolution: bool,

    #[serde(rename = "enableResourceConflictResolution")]
    pub enable_resource_conflict_resolution: bool,

    #[serde(rename = "enablePromptConflictResolution")]
    pub enable_prompt_conflict_resolution: bool,

    #[serde(rename = "logLevel")]
    pub log_level: LogLevel,

    /// Fan-out cap for connect and probe tasks.
    #[serde(rename = "maxConcurrentConnections")]
    pub max_concurrent_connections: usize,

    /// Seconds between health-check passes.
    #[serde(rename = "healthCheckInterval")]
    pub health_check_interval: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            enable_tool_conflict_resolution: true,
            enable_resource_conflict_resolution: true,
            enable_prompt_conflict_resolution: true,
            log_level: LogLevel::default(),
            max_concurrent_connections: 10,
            health_check_interval: 60,
        }
    }
}

// ============================================================================
// Gateway configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub name: String,

    #[serde(default = "default_config_version")]
    pub version: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub payment: PaymentPolicy,
}

fn default_config_version() -> String {
    "1.0".to_string()
}

impl GatewayConfig {
    /// Load from a file path or an inline JSON string.
    pub fn load(input: &str) -> Result<Self> {
        let json = load_json_string(input)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_json::from_str(json).context("Failed to parse gateway config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Gateway-level validation. Per-upstream transport problems are
    /// reported (and the upstream skipped) at connect time instead.
    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen.insert(&server.id) {
                return Err(ConfigError::DuplicateServerId {
                    id: server.id.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn server(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.id == id)
    }
}

/// Accept either a path to a JSON file or an inline JSON string.
fn load_json_string(input: &str) -> Result<String> {
    if input.trim_start().starts_with('{') {
        return Ok(input.to_string());
    }
    let path = std::path::Path::new(input);
    if path.exists() {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))
    } else {
        // Not a file; let the JSON parser produce the error message.
        Ok(input.to_string())
    }
}
