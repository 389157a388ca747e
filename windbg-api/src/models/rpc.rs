//! JSON-RPC 2.0 wire types
//!
//! The envelope plus per-operation parameter and result payloads. Field
//! names are camelCase on the wire, timestamps are ISO-8601.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::command_queue::{CommandSnapshot, ResultView};
use crate::models::error::RpcErrorObject;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

// ---------- Operation parameters ----------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionParams {
    pub target: String,
    #[serde(default)]
    pub symbols_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRefParams {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCommandParams {
    pub session_id: String,
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRefParams {
    pub session_id: String,
    pub command_id: String,
}

// ---------- Operation results ----------

/// `commandStatus` payload: always actionable, never an exception.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatusResult {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandStatusResult {
    pub fn from_view(view: ResultView) -> Self {
        match view {
            ResultView::Pending => Self {
                state: "pending".into(),
                result: None,
                error: None,
            },
            ResultView::Executing => Self {
                state: "executing".into(),
                result: None,
                error: None,
            },
            ResultView::Completed(text) => Self {
                state: "completed".into(),
                result: Some(text),
                error: None,
            },
            ResultView::Cancelled(reason) => Self {
                state: "cancelled".into(),
                result: None,
                error: Some(reason),
            },
            ResultView::Failed(reason) => Self {
                state: "failed".into(),
                result: None,
                error: Some(reason),
            },
            ResultView::NotFound => Self {
                state: "notFound".into(),
                result: None,
                error: Some("Command not found or its result has been evicted".into()),
            },
        }
    }
}

/// One row of a `listCommands` response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandListEntry {
    pub id: String,
    pub command: String,
    pub queued_at: DateTime<Utc>,
    pub state: String,
}

impl From<CommandSnapshot> for CommandListEntry {
    fn from(snapshot: CommandSnapshot) -> Self {
        Self {
            id: snapshot.id.to_string(),
            command: snapshot.command,
            queued_at: snapshot.queued_at,
            state: snapshot.state.label().to_string(),
        }
    }
}
