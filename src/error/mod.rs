use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("api_name not found")]
    MissingApiName,

    #[error("API not exist: {0}")]
    UnknownApi(String),

    #[error("API not released: {0}")]
    ApiNotReleased(String),

    #[error("Access blocked: {0}")]
    Blocked(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Policy store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Stable error codes returned in the `error_code` field of failure responses
pub mod codes {
    pub const PARAM_EMPTY: u32 = 1001;
    pub const API_NOT_EXIST: u32 = 1002;
    pub const FORBIDDEN: u32 = 1003;
    pub const PARAM_INVALID: u32 = 1004;
    pub const ACCESS_LIMITED: u32 = 1005;
    pub const NO_SERVER: u32 = 1006;
    pub const REQ_TIMEOUT: u32 = 1007;
    pub const REQ_FAILED: u32 = 1008;
    pub const API_OFFLINE: u32 = 1058;
    pub const INTERNAL: u32 = 1500;
}

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MissingApiName => StatusCode::BAD_REQUEST,
            GatewayError::UnknownApi(_) => StatusCode::NOT_FOUND,
            GatewayError::ApiNotReleased(_) => StatusCode::BAD_REQUEST,
            GatewayError::Blocked(_) => StatusCode::FORBIDDEN,
            GatewayError::InvalidParam(_) => StatusCode::BAD_REQUEST,
            GatewayError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Backend(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Config(_)
            | GatewayError::Rpc(_)
            | GatewayError::Store(_)
            | GatewayError::Serialization(_)
            | GatewayError::Io(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the stable error code for this error
    pub fn error_code(&self) -> u32 {
        match self {
            GatewayError::MissingApiName => codes::PARAM_EMPTY,
            GatewayError::UnknownApi(_) => codes::API_NOT_EXIST,
            GatewayError::ApiNotReleased(_) => codes::API_OFFLINE,
            GatewayError::Blocked(_) => codes::FORBIDDEN,
            GatewayError::InvalidParam(_) => codes::PARAM_INVALID,
            GatewayError::TooManyRequests(_) => codes::ACCESS_LIMITED,
            GatewayError::ServiceUnavailable(_) => codes::NO_SERVER,
            GatewayError::Timeout(_) => codes::REQ_TIMEOUT,
            GatewayError::Backend(_) => codes::REQ_FAILED,
            _ => codes::INTERNAL,
        }
    }

    /// Whether a backend attempt that failed with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Timeout(_) | GatewayError::Backend(_))
    }

    /// Attach the request id, producing the client-facing failure body
    pub fn with_rid(self, rid: i64) -> ErrorResponse {
        ErrorResponse {
            rid,
            status: self.status_code().as_u16(),
            error_code: self.error_code(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

/// Structured failure returned to HTTP clients
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub rid: i64,
    pub status: u16,
    pub error_code: u32,
    pub message: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.with_rid(0).into_response()
    }
}
