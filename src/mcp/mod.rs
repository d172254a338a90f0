//! MCP plumbing: wire types, transports, upstream sessions, the
//! connection manager, the capability registry, and the downstream-facing
//! gateway.

pub mod client;
pub mod gateway;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use client::{Forward, McpClient, UpstreamError};
pub use gateway::McpGateway;
pub use manager::ConnectionManager;
pub use registry::CapabilityRegistry;
pub use session::{SessionCapabilities, SessionStatus, UpstreamSession};
pub use transport::{ConfigError, TransportDescriptor};
