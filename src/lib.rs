// Library interface for mux402
// This allows the binary crate and integration tests to import the modules

pub mod config;
pub mod logging;
pub mod mcp;
pub mod web;
pub mod x402;
