//! RPC-boundary errors
//!
//! Protocol-level failures map to JSON-RPC error objects; domain failures
//! (unknown session, session cap, debugger trouble) surface as successful
//! responses carrying a structured payload, because the gateway
//! deliberately does not distinguish "command failed in the debugger" from
//! "command printed an error-shaped string".

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 error codes used at the boundary.
pub const MALFORMED_REQUEST: i64 = -32600;
pub const UNKNOWN_OPERATION: i64 = -32601;
pub const INVALID_ARGUMENT: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> i64 {
        match self {
            Self::MalformedRequest(_) => MALFORMED_REQUEST,
            Self::UnknownOperation(_) => UNKNOWN_OPERATION,
            Self::InvalidArgument(_) => INVALID_ARGUMENT,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }
}

/// The error member of a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&ApiError> for RpcErrorObject {
    fn from(error: &ApiError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            data: None,
        }
    }
}
