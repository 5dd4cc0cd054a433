use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Container lifecycle phase in which an adapter operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerPhase {
    Pull,
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
}

impl fmt::Display for ContainerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            ContainerPhase::Pull => "pull",
            ContainerPhase::Create => "create",
            ContainerPhase::Start => "start",
            ContainerPhase::Stop => "stop",
            ContainerPhase::Remove => "remove",
            ContainerPhase::Inspect => "inspect",
        };
        f.write_str(phase)
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Container runtime not available")]
    ContainerRuntimeUnavailable,

    #[error("Backend container not available")]
    ContainerNotAvailable,

    #[error("Container {phase} failed: {message}")]
    ContainerOperation {
        phase: ContainerPhase,
        message: String,
    },

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Server is running; stop it before removal")]
    ServerRunning,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Wrap a container adapter failure with the phase that produced it.
    pub fn container(phase: ContainerPhase, err: impl fmt::Display) -> Self {
        GatewayError::ContainerOperation {
            phase,
            message: err.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ContainerRuntimeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ContainerNotAvailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ContainerOperation { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::BackendUnreachable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ServerRunning => StatusCode::CONFLICT,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Serialization(_) => StatusCode::BAD_REQUEST,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Server(_) => "SERVER_ERROR",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::ContainerRuntimeUnavailable => "CONTAINER_RUNTIME_UNAVAILABLE",
            GatewayError::ContainerNotAvailable => "CONTAINER_NOT_AVAILABLE",
            GatewayError::ContainerOperation { .. } => "CONTAINER_OPERATION_FAILED",
            GatewayError::BackendUnreachable(_) => "BACKEND_UNREACHABLE",
            GatewayError::Persistence(_) => "PERSISTENCE_ERROR",
            GatewayError::ServerRunning => "SERVER_RUNNING",
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::Serialization(_) => "SERIALIZATION_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        tracing::error!("Gateway error: {}", self);

        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (self.status_code(), body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
