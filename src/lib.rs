//! # MCP Harbor
//!
//! A gateway that manages containerized MCP (Model Context Protocol) servers.
//!
//! This library provides the components for registering MCP servers, driving
//! the lifecycle of their backing containers, discovering them, and relaying
//! JSON-RPC traffic between external clients and the running backends.

pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod lifecycle;
pub mod mcp;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod runtime;

// Re-export main types for convenience
pub use config::Config;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;

/// Current version of the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// MCP Protocol version supported
pub const MCP_VERSION: &str = "2024-11-05";
