//! Request handlers for control sessions.
//!
//! - Service methods (`activate`, `stop_service`, `prepare_service`, ...)
//! - Stream methods (`start_stream`, `stop_stream`, `get_log_stream`, ...)
//!
//! Every method except `activate` needs a verified session; stream methods
//! also need full access. `stop_service` is
//! additionally accepted from an unverified loopback peer.

mod service;
mod stream;

use serde::de::DeserializeOwned;
use serde_json::Value;
use streamd_rpc::{Message, Request, RequestId, Response};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{DaemonError, Result};
use crate::server::DaemonState;
use crate::session::{ClientSession, SessionId};

pub struct HandlerContext<'a> {
    pub state: &'a mut DaemonState,
    pub client_id: &'a SessionId,
    pub client_sender: Option<mpsc::UnboundedSender<Message>>,
}

impl HandlerContext<'_> {
    pub fn current_session(&self) -> Option<&ClientSession> {
        self.state.sessions.get(self.client_id)
    }

    pub fn current_session_mut(&mut self) -> Option<&mut ClientSession> {
        self.state.sessions.get_mut(self.client_id)
    }

    pub fn is_verified(&self) -> bool {
        self.current_session().is_some_and(|s| s.verified)
    }
}

/// What a handler produced for the caller.
enum Reply {
    Now(Value),
    /// The handler answers later through the session's sender
    Deferred,
}

/// Dispatch a request. Returns `None` when the answer is sent later.
pub fn handle_request(ctx: &mut HandlerContext<'_>, request: &Request) -> Option<Response> {
    let id = request.id.clone().unwrap_or(RequestId::Number(0));
    trace!("[{}] handle_request: {}", ctx.client_id, request.method);

    match dispatch(ctx, request, &id) {
        Ok(Reply::Now(value)) => Some(Response::success(id, value)),
        Ok(Reply::Deferred) => None,
        Err(e) => Some(Response::error(id, e.into())),
    }
}

fn dispatch(ctx: &mut HandlerContext<'_>, request: &Request, id: &RequestId) -> Result<Reply> {
    let params = request.params.as_ref();

    let value = match request.method.as_str() {
        "activate" => service::handle_activate(ctx, params)?,
        "stop_service" => {
            require_verified_or_loopback(ctx)?;
            service::handle_stop_service(ctx, params)?
        }
        "ping_service" => {
            require_verified(ctx)?;
            service::handle_ping_service()
        }
        "prepare_service" => {
            require_verified(ctx)?;
            service::handle_prepare_service(ctx, id, params)?;
            return Ok(Reply::Deferred);
        }
        "sync_service" => {
            require_verified(ctx)?;
            service::handle_sync_service(ctx, params)?
        }
        "get_log_service" => {
            require_verified(ctx)?;
            service::handle_get_log_service(ctx, id, params)?;
            return Ok(Reply::Deferred);
        }
        "start_stream" => {
            require_full_access(ctx)?;
            stream::handle_start_stream(ctx, params)?
        }
        "stop_stream" => {
            require_full_access(ctx)?;
            stream::handle_stop_stream(ctx, params)?
        }
        "restart_stream" => {
            require_full_access(ctx)?;
            stream::handle_restart_stream(ctx, params)?
        }
        "get_log_stream" => {
            require_full_access(ctx)?;
            stream::handle_get_log_stream(ctx, id, params)?;
            return Ok(Reply::Deferred);
        }
        "get_pipeline_stream" => {
            require_full_access(ctx)?;
            stream::handle_get_pipeline_stream(ctx, id, params)?;
            return Ok(Reply::Deferred);
        }
        method => return Err(DaemonError::MethodNotFound(method.to_string())),
    };
    Ok(Reply::Now(value))
}

fn require_verified(ctx: &HandlerContext<'_>) -> Result<()> {
    if !ctx.is_verified() {
        return Err(DaemonError::NotActivated);
    }
    Ok(())
}

fn require_full_access(ctx: &HandlerContext<'_>) -> Result<()> {
    require_verified(ctx)?;
    if ctx
        .current_session()
        .is_some_and(ClientSession::has_full_access)
    {
        Ok(())
    } else {
        Err(DaemonError::PermissionDenied)
    }
}

fn require_verified_or_loopback(ctx: &HandlerContext<'_>) -> Result<()> {
    let session = ctx.current_session().ok_or(DaemonError::NotActivated)?;
    if session.verified || session.is_loopback() {
        Ok(())
    } else {
        Err(DaemonError::NotActivated)
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<&Value>) -> Result<T> {
    params
        .ok_or_else(|| DaemonError::InvalidParams("Missing params".to_string()))
        .and_then(|v| {
            serde_json::from_value(v.clone()).map_err(|e| DaemonError::InvalidParams(e.to_string()))
        })
}

/// Upload `file` to `path` in the background and answer request `id` when
/// it finishes.
fn spawn_upload(
    ctx: &HandlerContext<'_>,
    id: &RequestId,
    file: std::path::PathBuf,
    path: &str,
) -> Result<()> {
    let target = crate::uploads::upload_target(path)?;
    let sender = ctx
        .client_sender
        .clone()
        .ok_or_else(|| DaemonError::Upload("Session closed".to_string()))?;
    let client = ctx.state.http_client.clone();
    let id = id.clone();
    let peer = ctx.client_id.clone();

    tokio::spawn(async move {
        let response = match crate::uploads::upload_file(&client, &file, target).await {
            Ok(()) => Response::success(id, serde_json::json!({})),
            Err(e) => {
                tracing::warn!("[{}] Upload of {} failed: {}", peer, file.display(), e);
                Response::error(id, e.into())
            }
        };
        if sender.send(Message::Response(response)).is_err() {
            trace!("[{}] Session gone before upload finished", peer);
        }
    });
    Ok(())
}
