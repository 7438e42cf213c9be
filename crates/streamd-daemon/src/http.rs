//! HTTP sites (HLS, VOD, COD) and the lazy-start bridge behind them.
//!
//! Each site serves files under the root last set by `prepare_service`. Before
//! a VOD or COD file is served, [`LazyStart::on_http_trigger`] decides whether
//! the request may proceed, must wait for a worker (202), or is refused (403).

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::command::{CommandSender, DaemonCommand};
use crate::links::LinkIndex;
use crate::server::stopped;

const M3U8_EXTENSION: &str = "m3u8";
const TS_EXTENSION: &str = "ts";
const M3U8_HEADER: &str = "#EXTM3U";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    Hls,
    Vod,
    Cod,
}

impl std::fmt::Display for SiteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SiteKind::Hls => "http",
            SiteKind::Vod => "vods",
            SiteKind::Cod => "cods",
        };
        f.write_str(name)
    }
}

/// Served root and in-flight request count of one HTTP server.
#[derive(Debug)]
pub struct Site {
    pub kind: SiteKind,
    root: RwLock<Option<PathBuf>>,
    online: AtomicU64,
}

impl Site {
    #[must_use]
    pub fn new(kind: SiteKind) -> Self {
        Self {
            kind,
            root: RwLock::new(None),
            online: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn root(&self) -> Option<PathBuf> {
        self.root
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_root(&self, root: Option<PathBuf>) {
        *self.root.write().unwrap_or_else(PoisonError::into_inner) = root;
    }

    /// Requests currently being answered.
    #[must_use]
    pub fn online(&self) -> u64 {
        self.online.load(Ordering::Relaxed)
    }

    fn enter(&self) -> OnlineGuard<'_> {
        self.online.fetch_add(1, Ordering::Relaxed);
        OnlineGuard(&self.online)
    }
}

struct OnlineGuard<'a>(&'a AtomicU64);

impl Drop for OnlineGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The three sites of a node.
#[derive(Debug, Clone)]
pub struct Sites {
    pub hls: Arc<Site>,
    pub vod: Arc<Site>,
    pub cod: Arc<Site>,
}

impl Sites {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hls: Arc::new(Site::new(SiteKind::Hls)),
            vod: Arc::new(Site::new(SiteKind::Vod)),
            cod: Arc::new(Site::new(SiteKind::Cod)),
        }
    }
}

impl Default for Sites {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Serve the file as is
    Ok,
    /// A worker was asked to produce it
    Accepted,
    /// No link for the directory
    Forbidden,
}

/// Consults the link indexes for on-demand sites and queues worker starts.
#[derive(Debug, Clone)]
pub struct LazyStart {
    pub vod: Arc<LinkIndex>,
    pub cod: Arc<LinkIndex>,
    commands: CommandSender,
}

impl LazyStart {
    #[must_use]
    pub fn new(vod: Arc<LinkIndex>, cod: Arc<LinkIndex>, commands: CommandSender) -> Self {
        Self { vod, cod, commands }
    }

    /// Decide how a request for `path` on the `kind` site proceeds. Never
    /// waits for a worker; starts and timestamp refreshes go through the
    /// daemon command queue.
    pub async fn on_http_trigger(&self, kind: SiteKind, path: &Path) -> TriggerOutcome {
        let is_m3u8 = has_extension(path, M3U8_EXTENSION);
        let is_ts = has_extension(path, TS_EXTENSION);

        match kind {
            SiteKind::Vod if is_m3u8 => {
                let Some(spec) = path.parent().and_then(|dir| self.vod.find(dir)) else {
                    return TriggerOutcome::Forbidden;
                };
                if is_materialized(path).await {
                    return TriggerOutcome::Ok;
                }
                self.queue(DaemonCommand::StartStream(spec));
                TriggerOutcome::Accepted
            }
            SiteKind::Cod if is_m3u8 || is_ts => {
                let Some(spec) = path.parent().and_then(|dir| self.cod.find(dir)) else {
                    return TriggerOutcome::Forbidden;
                };
                let id = spec.id().map(str::to_string);
                if is_m3u8 {
                    self.queue(DaemonCommand::StartStream(spec));
                }
                if let Some(id) = id {
                    self.queue(DaemonCommand::TouchStream(id));
                }
                if is_m3u8 {
                    TriggerOutcome::Accepted
                } else {
                    TriggerOutcome::Ok
                }
            }
            _ => TriggerOutcome::Ok,
        }
    }

    fn queue(&self, command: DaemonCommand) {
        if self.commands.send(command).is_err() {
            warn!("Daemon command queue closed, dropping lazy-start request");
        }
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Whether a VOD manifest is complete: it reads, starts with `#EXTM3U`, and
/// every chunk it lists exists next to it.
pub async fn is_materialized(manifest: &Path) -> bool {
    let Ok(content) = tokio::fs::read_to_string(manifest).await else {
        return false;
    };
    if !content.trim_start().starts_with(M3U8_HEADER) {
        return false;
    }
    let Some(dir) = manifest.parent() else {
        return false;
    };
    let chunks = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'));
    for chunk in chunks {
        let Some(path) = resolve(dir, chunk) else {
            return false;
        };
        if !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
            return false;
        }
    }
    true
}

/// Join a request path onto `root`, refusing anything that escapes it.
#[must_use]
pub fn resolve(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(path)
}

#[must_use]
pub fn content_type(path: &Path) -> &'static str {
    if has_extension(path, M3U8_EXTENSION) {
        "application/vnd.apple.mpegurl"
    } else if has_extension(path, TS_EXTENSION) {
        "video/mp2t"
    } else {
        "application/octet-stream"
    }
}

#[derive(Clone)]
struct SiteState {
    site: Arc<Site>,
    bridge: Arc<LazyStart>,
}

/// Router answering `GET /<path>` from the site's root.
pub fn router(site: Arc<Site>, bridge: Arc<LazyStart>) -> Router {
    Router::new()
        .route("/{*path}", get(get_file))
        .with_state(SiteState { site, bridge })
}

async fn get_file(State(app): State<SiteState>, UrlPath(relative): UrlPath<String>) -> Response {
    let _online = app.site.enter();

    let Some(path) = app.site.root().and_then(|root| resolve(&root, &relative)) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    trace!("[{}] GET {}", app.site.kind, path.display());

    match app.bridge.on_http_trigger(app.site.kind, &path).await {
        TriggerOutcome::Forbidden => StatusCode::FORBIDDEN.into_response(),
        TriggerOutcome::Accepted => StatusCode::ACCEPTED.into_response(),
        TriggerOutcome::Ok => match tokio::fs::read(&path).await {
            Ok(bytes) => ([(header::CONTENT_TYPE, content_type(&path))], bytes).into_response(),
            Err(e) => {
                debug!("[{}] {}: {}", app.site.kind, path.display(), e);
                StatusCode::NOT_FOUND.into_response()
            }
        },
    }
}

/// Serve `site` on `listener` until `shutdown` turns true.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(
    listener: TcpListener,
    site: Arc<Site>,
    bridge: Arc<LazyStart>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let kind = site.kind;
    if let Ok(addr) = listener.local_addr() {
        info!("[{}] HTTP server listening on {}", kind, addr);
    }
    axum::serve(listener, router(site, bridge))
        .with_graceful_shutdown(async move { stopped(&mut shutdown).await })
        .await?;
    debug!("[{}] HTTP server stopped", kind);
    Ok(())
}
