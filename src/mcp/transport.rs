//! Transport descriptors and the client factory
//!
//! An upstream is reachable over one of four transports. The descriptor is
//! pure configuration; `validate` reports per-field problems without
//! constructing anything, and `make` wires a ready [`McpClient`].

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::client::McpClient;

/// Errors in upstream configuration. These abort startup of the affected
/// upstream only; the gateway continues without it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("{transport} transport: missing required field `{field}`")]
    MissingField {
        transport: &'static str,
        field: &'static str,
    },

    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("URL `{url}` has unsupported scheme `{scheme}`")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("invalid namespace `{namespace}`: must match [A-Za-z][A-Za-z0-9_-]*")]
    InvalidNamespace { namespace: String },

    #[error("duplicate server id `{id}`")]
    DuplicateServerId { id: String },

    #[error("server `{id}`: no transport configured (and no legacy command)")]
    MissingTransport { id: String },
}

/// How to reach one upstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportDescriptor {
    /// Child process speaking line-delimited JSON-RPC on its pipes.
    Stdio {
        command: String,

        #[serde(default)]
        args: Vec<String>,

        /// Merged over the parent environment.
        #[serde(default)]
        env: HashMap<String, String>,

        /// Overrides the parent working directory only when present.
        #[serde(default)]
        cwd: Option<PathBuf>,
    },

    /// Streamable HTTP: each JSON-RPC request is one POST.
    Http {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,

        #[serde(rename = "apiKey", default)]
        api_key: Option<String>,
    },

    /// HTTP POST for requests, responses correlated off an SSE stream.
    Sse {
        #[serde(rename = "sseUrl")]
        sse_url: String,

        #[serde(rename = "postUrl")]
        post_url: String,

        #[serde(default)]
        headers: HashMap<String, String>,

        #[serde(rename = "apiKey", default)]
        api_key: Option<String>,
    },

    /// JSON-RPC frames over a WebSocket connection.
    Websocket {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,

        #[serde(rename = "apiKey", default)]
        api_key: Option<String>,
    },
}

impl TransportDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportDescriptor::Stdio { .. } => "stdio",
            TransportDescriptor::Http { .. } => "http",
            TransportDescriptor::Sse { .. } => "sse",
            TransportDescriptor::Websocket { .. } => "websocket",
        }
    }

    /// Per-field validation; returns every problem found.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        match self {
            TransportDescriptor::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    errors.push(ConfigError::MissingField {
                        transport: "stdio",
                        field: "command",
                    });
                }
            }
            TransportDescriptor::Http { url, .. } => {
                check_url(url, "http", "url", &["http", "https"], &mut errors);
            }
            TransportDescriptor::Sse { sse_url, post_url, .. } => {
                check_url(sse_url, "sse", "sseUrl", &["http", "https"], &mut errors);
                check_url(post_url, "sse", "postUrl", &["http", "https"], &mut errors);
            }
            TransportDescriptor::Websocket { url, .. } => {
                check_url(url, "websocket", "url", &["ws", "wss"], &mut errors);
            }
        }

        errors
    }

    /// Request headers for the HTTP-family transports: configured headers
    /// merged, with `apiKey` inserted as a bearer Authorization.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let (headers, api_key) = match self {
            TransportDescriptor::Stdio { .. } => return Vec::new(),
            TransportDescriptor::Http { headers, api_key, .. }
            | TransportDescriptor::Sse { headers, api_key, .. }
            | TransportDescriptor::Websocket { headers, api_key, .. } => (headers, api_key),
        };

        let mut out: Vec<(String, String)> = headers
            .iter()
            .filter(|(k, _)| {
                api_key.is_none() || !k.eq_ignore_ascii_case("authorization")
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));

        if let Some(key) = api_key {
            out.push(("Authorization".to_string(), format!("Bearer {key}")));
        }

        out
    }
}

fn check_url(
    url: &str,
    transport: &'static str,
    field: &'static str,
    schemes: &[&str],
    errors: &mut Vec<ConfigError>,
) {
    if url.trim().is_empty() {
        errors.push(ConfigError::MissingField { transport, field });
        return;
    }
    match url::Url::parse(url) {
        Ok(parsed) => {
            if !schemes.contains(&parsed.scheme()) {
                errors.push(ConfigError::UnsupportedScheme {
                    url: url.to_string(),
                    scheme: parsed.scheme().to_string(),
                });
            }
        }
        Err(e) => errors.push(ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Construct a wired MCP client for a descriptor. Fails with the first
/// validation error rather than producing a client that cannot connect.
pub fn make(descriptor: &TransportDescriptor) -> Result<McpClient, ConfigError> {
    if let Some(error) = descriptor.validate().into_iter().next() {
        return Err(error);
    }
    Ok(McpClient::new(descriptor.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_requires_command() {
        let descriptor = TransportDescriptor::Stdio {
            command: "".to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
        };
        let errors = descriptor.validate();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            ConfigError::MissingField { transport: "stdio", field: "command" }
        ));
    }

    #[test]
    fn sse_requires_both_urls() {
        let descriptor = TransportDescriptor::Sse {
            sse_url: "".to_string(),
            post_url: "".to_string(),
            headers: HashMap::new(),
            api_key: None,
        };
        assert_eq!(descriptor.validate().len(), 2);
    }

    #[test]
    fn websocket_scheme_is_checked() {
        let descriptor = TransportDescriptor::Websocket {
            url: "https://example.com/mcp".to_string(),
            headers: HashMap::new(),
            api_key: None,
        };
        let errors = descriptor.validate();
        assert!(matches!(errors[0], ConfigError::UnsupportedScheme { .. }));

        let descriptor = TransportDescriptor::Websocket {
            url: "wss://example.com/mcp".to_string(),
            headers: HashMap::new(),
            api_key: None,
        };
        assert!(descriptor.validate().is_empty());
    }

    #[test]
    fn http_descriptor_parses_from_config_json() {
        let json = r#"{"type":"http","url":"https://mcp.example.com/v1","apiKey":"secret"}"#;
        let descriptor: TransportDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.kind(), "http");
        assert!(descriptor.validate().is_empty());
    }

    #[test]
    fn api_key_becomes_bearer_header() {
        let descriptor = TransportDescriptor::Http {
            url: "https://mcp.example.com".to_string(),
            headers: HashMap::from([("X-Custom".to_string(), "1".to_string())]),
            api_key: Some("secret".to_string()),
        };
        let headers = descriptor.request_headers();
        assert!(headers.contains(&("X-Custom".to_string(), "1".to_string())));
        assert!(headers.contains(&("Authorization".to_string(), "Bearer secret".to_string())));
    }

    #[test]
    fn api_key_wins_over_configured_authorization() {
        let descriptor = TransportDescriptor::Http {
            url: "https://mcp.example.com".to_string(),
            headers: HashMap::from([("Authorization".to_string(), "Basic old".to_string())]),
            api_key: Some("secret".to_string()),
        };
        let headers = descriptor.request_headers();
        assert_eq!(
            headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case("authorization"))
                .count(),
            1
        );
        assert!(headers.contains(&("Authorization".to_string(), "Bearer secret".to_string())));
    }

    #[test]
    fn make_rejects_invalid_descriptor() {
        let descriptor = TransportDescriptor::Http {
            url: "not a url".to_string(),
            headers: HashMap::new(),
            api_key: None,
        };
        assert!(make(&descriptor).is_err());
    }
}
