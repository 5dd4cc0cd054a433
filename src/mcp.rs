//! JSON-RPC 2.0 envelope types for MCP traffic.
//!
//! The relay treats payloads as opaque frames; these types cover the small
//! surface the gateway itself speaks — capability introspection requests and
//! the inline rate-limit rejection notice.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 version
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC / MCP error codes
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Sent inline on the relay stream when a message is dropped.
    pub const RATE_LIMITED: i32 = -32005;
}

/// MCP method names the gateway issues itself
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const RESOURCES_LIST: &str = "resources/list";
}

/// Rejection notice written to the external side of a relay session when the
/// rate limiter denies a message. The message itself is dropped.
pub const RATE_LIMIT_NOTICE: &str =
    r#"{"jsonrpc":"2.0","error":{"code":-32005,"message":"Rate limit exceeded"},"id":null}"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn rate_limited() -> Self {
        Self::new(error_codes::RATE_LIMITED, "Rate limit exceeded")
    }
}
