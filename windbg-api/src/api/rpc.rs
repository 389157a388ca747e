//! JSON-RPC dispatch
//!
//! One POST endpoint routes the gateway operations to the session manager.
//! Protocol failures become JSON-RPC error objects; domain failures become
//! successful responses with structured payloads.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::core::command_queue::EnqueueError;
use crate::core::session_manager::{CreateSessionError, SessionManager};
use crate::models::error::{ApiError, RpcErrorObject};
use crate::models::rpc::{
    CommandListEntry, CommandRefParams, CommandStatusResult, ExecCommandParams, OpenSessionParams,
    RpcRequest, RpcResponse, SessionRefParams,
};

#[derive(Clone)]
pub struct RpcState {
    pub manager: Arc<SessionManager>,
}

/// Entry point for `POST /rpc`.
pub async fn dispatch(
    State(state): State<RpcState>,
    body: Json<Value>,
) -> Json<RpcResponse> {
    let request: RpcRequest = match serde_json::from_value(body.0) {
        Ok(request) => request,
        Err(e) => {
            let error = ApiError::MalformedRequest(e.to_string());
            return Json(RpcResponse::error(Value::Null, RpcErrorObject::from(&error)));
        },
    };

    let id = request.id.clone().unwrap_or(Value::Null);
    debug!("RPC {} (id {})", request.method, id);

    let outcome = route(&state, &request).await;
    Json(match outcome {
        Ok(result) => RpcResponse::result(id, result),
        Err(error) => RpcResponse::error(id, RpcErrorObject::from(&error)),
    })
}

fn parse_params<T: serde::de::DeserializeOwned>(request: &RpcRequest) -> Result<T, ApiError> {
    let params = request.params.clone().unwrap_or(Value::Null);
    serde_json::from_value(params).map_err(|e| ApiError::InvalidArgument(e.to_string()))
}

async fn route(state: &RpcState, request: &RpcRequest) -> Result<Value, ApiError> {
    match request.method.as_str() {
        "openSession" => open_session(state, parse_params(request)?).await,
        "closeSession" => close_session(state, parse_params(request)?).await,
        "execCommand" => exec_command(state, parse_params(request)?),
        "commandStatus" => command_status(state, parse_params(request)?),
        "cancelCommand" => cancel_command(state, parse_params(request)?),
        "listCommands" => list_commands(state, parse_params(request)?),
        "listSessions" => Ok(json!({ "sessions": state.manager.list() })),
        "sessionStats" => Ok(serde_json::to_value(state.manager.stats())
            .map_err(|e| ApiError::Internal(e.to_string()))?),
        other => Err(ApiError::UnknownOperation(other.to_string())),
    }
}

async fn open_session(state: &RpcState, params: OpenSessionParams) -> Result<Value, ApiError> {
    if params.target.trim().is_empty() {
        return Err(ApiError::InvalidArgument("target must not be empty".into()));
    }
    match state
        .manager
        .create(&params.target, params.symbols_path.as_deref())
        .await
    {
        Ok(session_id) => Ok(json!({ "sessionId": session_id })),
        Err(CreateSessionError::InvalidTarget) => {
            Err(ApiError::InvalidArgument("target must not be empty".into()))
        },
        Err(CreateSessionError::LimitExceeded { current, max }) => Ok(json!({
            "error": {
                "kind": "limitExceeded",
                "message": format!("session limit exceeded ({current}/{max})"),
                "current": current,
                "max": max,
            }
        })),
        Err(CreateSessionError::StartFailed(message)) => Ok(json!({
            "error": {
                "kind": "startFailed",
                "message": message,
            }
        })),
    }
}

async fn close_session(state: &RpcState, params: SessionRefParams) -> Result<Value, ApiError> {
    let closed = state.manager.close(&params.session_id).await;
    Ok(json!({ "success": closed }))
}

fn exec_command(state: &RpcState, params: ExecCommandParams) -> Result<Value, ApiError> {
    if params.command.trim().is_empty() {
        return Err(ApiError::InvalidArgument("command must not be empty".into()));
    }
    let Some(session) = state.manager.get(&params.session_id) else {
        return Ok(session_not_found(&params.session_id));
    };
    match session.queue.enqueue(&params.command) {
        Ok(command_id) => Ok(json!({ "commandId": command_id.to_string() })),
        Err(EnqueueError::EmptyCommand) => {
            Err(ApiError::InvalidArgument("command must not be empty".into()))
        },
        Err(e @ EnqueueError::TimeoutAboveCeiling { .. }) => {
            Err(ApiError::InvalidArgument(e.to_string()))
        },
        Err(EnqueueError::Disposed) => Ok(json!({
            "error": {
                "kind": "sessionClosing",
                "message": "session is shutting down and no longer accepts commands",
            }
        })),
    }
}

fn command_status(state: &RpcState, params: CommandRefParams) -> Result<Value, ApiError> {
    let command_id = parse_command_id(&params.command_id)?;
    let Some(session) = state.manager.get(&params.session_id) else {
        return Ok(session_not_found(&params.session_id));
    };
    let status = CommandStatusResult::from_view(session.queue.get_result(command_id));
    serde_json::to_value(status).map_err(|e| ApiError::Internal(e.to_string()))
}

fn cancel_command(state: &RpcState, params: CommandRefParams) -> Result<Value, ApiError> {
    let command_id = parse_command_id(&params.command_id)?;
    let Some(session) = state.manager.get(&params.session_id) else {
        return Ok(session_not_found(&params.session_id));
    };
    let cancelled = session
        .queue
        .cancel(command_id, "Command cancelled by client");
    Ok(json!({ "success": cancelled }))
}

fn list_commands(state: &RpcState, params: SessionRefParams) -> Result<Value, ApiError> {
    let Some(session) = state.manager.get(&params.session_id) else {
        return Ok(session_not_found(&params.session_id));
    };
    let commands: Vec<CommandListEntry> = session
        .queue
        .queue_status()
        .into_iter()
        .map(CommandListEntry::from)
        .collect();
    Ok(json!({ "commands": commands }))
}

fn parse_command_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::InvalidArgument(format!("malformed command id: {raw}")))
}

fn session_not_found(session_id: &str) -> Value {
    json!({
        "state": "notFound",
        "error": format!("session not found: {session_id}"),
    })
}
