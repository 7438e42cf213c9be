//! Node-level methods.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use streamd_core::license;
use streamd_core::stream::{self, RawStreamSpec, StreamInfo};
use streamd_rpc::{Message, RequestId, Response};
use tracing::{debug, info, warn};

use super::{HandlerContext, parse_params, spawn_upload};
use crate::command::{DaemonCommand, PreparedRoots};
use crate::error::{DaemonError, Result};
use crate::session::AccessLevel;
use crate::stats::now_ms;

const FEEDBACK_DIRECTORY: &str = "feedback_directory";
const TIMESHIFTS_DIRECTORY: &str = "timeshifts_directory";
const HLS_DIRECTORY: &str = "hls_directory";
const VODS_DIRECTORY: &str = "vods_directory";
const CODS_DIRECTORY: &str = "cods_directory";
const PROXY_DIRECTORY: &str = "proxy_directory";
const DATA_DIRECTORY: &str = "data_directory";

const PREPARED_DIRECTORIES: [&str; 7] = [
    FEEDBACK_DIRECTORY,
    TIMESHIFTS_DIRECTORY,
    HLS_DIRECTORY,
    VODS_DIRECTORY,
    CODS_DIRECTORY,
    PROXY_DIRECTORY,
    DATA_DIRECTORY,
];

#[derive(Debug, Deserialize)]
struct ActivateParams {
    license: String,
    #[serde(default)]
    access: Option<String>,
}

pub fn handle_activate(ctx: &mut HandlerContext<'_>, params: Option<&Value>) -> Result<Value> {
    let params: ActivateParams = parse_params(params)?;

    if ctx.state.node.license_key.as_deref() != Some(params.license.as_str()) {
        return Err(DaemonError::Activation(
            "Config not same activation key".to_string(),
        ));
    }
    let expiration = license::expire_time(&params.license)
        .ok_or_else(|| DaemonError::Activation("Invalid expire key".to_string()))?;
    if expiration <= now_ms() {
        return Err(DaemonError::Activation("License expired".to_string()));
    }

    let access = AccessLevel::from_request(params.access.as_deref());
    let session = ctx
        .current_session_mut()
        .ok_or(DaemonError::NotActivated)?;
    session.activate(expiration, access);
    info!(
        "[{}] Session activated from {} ({:?})",
        session.id, session.peer, access
    );

    let info = ctx.state.service_info(expiration);
    Ok(serde_json::to_value(info)?)
}

#[derive(Debug, Default, Deserialize)]
struct StopParams {
    /// Milliseconds before the workers are stopped
    #[serde(default)]
    delay: u64,
}

pub fn handle_stop_service(ctx: &mut HandlerContext<'_>, params: Option<&Value>) -> Result<Value> {
    let params: StopParams = match params {
        Some(Value::Null) | None => StopParams::default(),
        Some(value) => parse_params(Some(value))?,
    };
    info!("[{}] stop_service (delay {} ms)", ctx.client_id, params.delay);
    ctx.state
        .begin_shutdown(Duration::from_millis(params.delay))?;
    Ok(json!({}))
}

pub fn handle_ping_service() -> Value {
    json!({ "timestamp": now_ms() })
}

/// Create a directory and list what it holds.
fn prepare_directory(path: &Path) -> std::io::Result<Vec<String>> {
    std::fs::create_dir_all(path)?;
    let mut content: Vec<String> = std::fs::read_dir(path)?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    content.sort();
    Ok(content)
}

/// Create every requested directory. Returns the per-key report and the
/// roots to apply for the ones that succeeded.
fn prepare_directories(requested: &[(&'static str, PathBuf)]) -> (Vec<Value>, PreparedRoots) {
    let mut report = Vec::new();
    let mut prepared: HashMap<&str, PathBuf> = HashMap::new();
    for (key, path) in requested {
        let entry = match prepare_directory(path) {
            Ok(content) => {
                debug!("Prepared {} at {}", key, path.display());
                prepared.insert(*key, path.clone());
                json!({
                    "path": path.display().to_string(),
                    "result": "OK",
                    "content": content,
                })
            }
            Err(e) => {
                warn!("Failed to prepare {} at {}: {}", key, path.display(), e);
                json!({ "path": path.display().to_string(), "error": e.to_string() })
            }
        };
        let mut item = Map::new();
        item.insert((*key).to_string(), entry);
        report.push(Value::Object(item));
    }

    let roots = PreparedRoots {
        hls: prepared.get(HLS_DIRECTORY).cloned(),
        vods: prepared.get(VODS_DIRECTORY).cloned(),
        cods: prepared.get(CODS_DIRECTORY).cloned(),
        monitored: [
            HLS_DIRECTORY,
            VODS_DIRECTORY,
            CODS_DIRECTORY,
            TIMESHIFTS_DIRECTORY,
        ]
        .iter()
        .filter_map(|key| prepared.get(key).cloned())
        .collect(),
    };
    (report, roots)
}

/// Directories are created on the blocking pool; the command loop applies
/// the new roots before the reply is sent.
pub fn handle_prepare_service(
    ctx: &mut HandlerContext<'_>,
    id: &RequestId,
    params: Option<&Value>,
) -> Result<()> {
    let params = params
        .and_then(Value::as_object)
        .ok_or_else(|| DaemonError::InvalidParams("Expected directories object".to_string()))?;
    let requested: Vec<(&'static str, PathBuf)> = PREPARED_DIRECTORIES
        .into_iter()
        .filter_map(|key| {
            let path = params.get(key).and_then(Value::as_str)?;
            Some((key, PathBuf::from(path)))
        })
        .collect();

    let reply = ctx
        .client_sender
        .clone()
        .ok_or_else(|| DaemonError::Io(std::io::Error::other("Session closed")))?;
    let commands = ctx.state.command_sender();
    let id = id.clone();
    let peer = ctx.client_id.clone();

    tokio::spawn(async move {
        match tokio::task::spawn_blocking(move || prepare_directories(&requested)).await {
            Ok((report, roots)) => {
                let command = DaemonCommand::PreparedDirectories {
                    roots,
                    reply,
                    response: Response::success(id, Value::Array(report)),
                };
                if commands.send(command).is_err() {
                    warn!("[{}] Daemon stopped before prepare_service finished", peer);
                }
            }
            Err(e) => {
                warn!("[{}] prepare_service failed: {}", peer, e);
                let error = DaemonError::Io(std::io::Error::other(e.to_string()));
                let _ = reply.send(Message::Response(Response::error(id, error.into())));
            }
        }
    });
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SyncParams {
    #[serde(default)]
    streams: Vec<Value>,
}

pub fn handle_sync_service(ctx: &mut HandlerContext<'_>, params: Option<&Value>) -> Result<Value> {
    let params: SyncParams = parse_params(params)?;

    let mut vods = HashMap::new();
    let mut cods = HashMap::new();
    for value in params.streams {
        let Some(spec) = RawStreamSpec::from_value(value) else {
            warn!("sync_service: skipping non-object stream");
            continue;
        };
        if let Err(e) = stream::validate(&spec) {
            warn!("sync_service: skipping {:?}: {}", spec.id(), e);
            continue;
        }
        let info = match StreamInfo::derive(&spec) {
            Ok(info) => info,
            Err(e) => {
                warn!("sync_service: skipping {:?}: {}", spec.id(), e);
                continue;
            }
        };

        if info.stream_type.is_vod() {
            let linked = spec.with_field("cleanup_ts", Value::Bool(false));
            for root in info.served_roots() {
                vods.insert(root.to_path_buf(), linked.clone());
            }
        } else if info.stream_type.is_cod() {
            for root in info.served_roots() {
                cods.insert(root.to_path_buf(), spec.clone());
            }
        }
    }

    info!("Synced {} VOD and {} COD links", vods.len(), cods.len());
    ctx.state.vod_links.extend(vods);
    ctx.state.cod_links.extend(cods);
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct LogParams {
    path: String,
}

pub fn handle_get_log_service(
    ctx: &mut HandlerContext<'_>,
    id: &RequestId,
    params: Option<&Value>,
) -> Result<()> {
    let params: LogParams = parse_params(params)?;
    let file = ctx
        .state
        .node
        .log_file()
        .map(Path::to_path_buf)
        .ok_or_else(|| DaemonError::Upload("Node does not log to a file".to_string()))?;
    spawn_upload(ctx, id, file, &params.path)
}
