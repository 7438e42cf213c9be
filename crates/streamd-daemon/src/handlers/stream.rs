//! Per-stream methods.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Value, json};
use streamd_core::stream::RawStreamSpec;
use streamd_rpc::RequestId;
use tracing::info;

use super::{HandlerContext, parse_params, spawn_upload};
use crate::error::{DaemonError, Result};
use crate::uploads::{self, LOG_FILE_NAME, PIPELINE_FILE_NAME};

#[derive(Debug, Deserialize)]
struct StreamIdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StreamFileParams {
    id: String,
    feedback_directory: PathBuf,
    path: String,
}

/// Accepts `{config: spec}` or the spec itself.
fn spec_from_params(params: Option<&Value>) -> Result<RawStreamSpec> {
    let value = params.ok_or_else(|| DaemonError::InvalidParams("Missing params".to_string()))?;
    let spec = value
        .get("config")
        .filter(|config| config.is_object())
        .unwrap_or(value);
    RawStreamSpec::from_value(spec.clone())
        .ok_or_else(|| DaemonError::InvalidParams("Stream config must be an object".to_string()))
}

pub fn handle_start_stream(ctx: &mut HandlerContext<'_>, params: Option<&Value>) -> Result<Value> {
    let spec = spec_from_params(params)?;
    info!("[{}] start_stream {:?}", ctx.client_id, spec.id());
    ctx.state.supervisor.create_child_stream(spec)?;
    Ok(json!({}))
}

pub fn handle_stop_stream(ctx: &mut HandlerContext<'_>, params: Option<&Value>) -> Result<Value> {
    let params: StreamIdParams = parse_params(params)?;
    info!("[{}] stop_stream {}", ctx.client_id, params.id);
    ctx.state.supervisor.stop_stream(&params.id)?;
    Ok(json!({}))
}

pub fn handle_restart_stream(
    ctx: &mut HandlerContext<'_>,
    params: Option<&Value>,
) -> Result<Value> {
    let params: StreamIdParams = parse_params(params)?;
    info!("[{}] restart_stream {}", ctx.client_id, params.id);
    ctx.state.supervisor.restart_stream(&params.id)?;
    Ok(json!({}))
}

fn upload_stream_file(
    ctx: &HandlerContext<'_>,
    id: &RequestId,
    params: Option<&Value>,
    name: &str,
) -> Result<()> {
    let params: StreamFileParams = parse_params(params)?;
    let file = uploads::stream_file(&params.feedback_directory, name);
    info!(
        "[{}] Uploading {} of stream {} to {}",
        ctx.client_id, name, params.id, params.path
    );
    spawn_upload(ctx, id, file, &params.path)
}

pub fn handle_get_log_stream(
    ctx: &mut HandlerContext<'_>,
    id: &RequestId,
    params: Option<&Value>,
) -> Result<()> {
    upload_stream_file(ctx, id, params, LOG_FILE_NAME)
}

pub fn handle_get_pipeline_stream(
    ctx: &mut HandlerContext<'_>,
    id: &RequestId,
    params: Option<&Value>,
) -> Result<()> {
    upload_stream_file(ctx, id, params, PIPELINE_FILE_NAME)
}
