//! Periodic tasks of the node: client pings, COD and chunk reaping, stats
//! broadcast and the license check.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use streamd_core::license;
use tokio::sync::{RwLock, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

use crate::outbound;
use crate::server::{DaemonState, stopped};
use crate::stats::now_ms;

pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);
pub const LICENSE_CHECK_INTERVAL: Duration = Duration::from_secs(300);
const MIN_PERIOD: Duration = Duration::from_secs(1);
/// Sessions that leave this many pings unanswered are dropped.
pub const MAX_UNANSWERED_PINGS: usize = 3;
const PING_CLIENT: &str = "ping_client";

const TS_EXTENSION: &str = "ts";

/// Start every periodic task. Each one ends when `shutdown` turns true.
pub async fn spawn_all(state: Arc<RwLock<DaemonState>>, shutdown: watch::Receiver<bool>) {
    let (cods_ttl, files_ttl) = {
        let state_guard = state.read().await;
        (state_guard.node.cods_ttl, state_guard.node.files_ttl)
    };

    let s = state.clone();
    spawn_periodic("client ping", PING_INTERVAL, shutdown.clone(), move || {
        let s = s.clone();
        async move { ping_clients(&mut *s.write().await) }
    });

    let s = state.clone();
    spawn_periodic(
        "COD reaper",
        (cods_ttl / 2).max(MIN_PERIOD),
        shutdown.clone(),
        move || {
            let s = s.clone();
            async move {
                reap_cods(&mut *s.write().await);
            }
        },
    );

    let s = state.clone();
    spawn_periodic(
        "chunk reaper",
        (files_ttl / 10).max(MIN_PERIOD),
        shutdown.clone(),
        move || {
            let s = s.clone();
            async move {
                let dirs = s.read().await.monitored.clone();
                let removed = tokio::task::spawn_blocking(move || {
                    dirs.iter()
                        .map(|dir| remove_stale_chunks(dir, files_ttl))
                        .sum::<usize>()
                })
                .await
                .unwrap_or(0);
                if removed > 0 {
                    debug!("Removed {} stale chunks", removed);
                }
            }
        },
    );

    let s = state.clone();
    spawn_periodic("stats broadcast", STATS_INTERVAL, shutdown.clone(), move || {
        let s = s.clone();
        async move { broadcast_stats(&mut *s.write().await) }
    });

    let s = state;
    spawn_periodic("license check", LICENSE_CHECK_INTERVAL, shutdown, move || {
        let s = s.clone();
        async move {
            check_license(&mut *s.write().await);
        }
    });
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                () = stopped(&mut shutdown) => break,
            }
        }
        debug!("{} task stopped", name);
    });
}

/// Send `ping_client` to every verified session. Sessions whose channel is
/// gone, or that left [`MAX_UNANSWERED_PINGS`] pings unanswered, are dropped.
pub fn ping_clients(state: &mut DaemonState) {
    let params = json!({ "timestamp": now_ms() });
    let mut dead = Vec::new();

    for (id, session) in &mut state.sessions {
        if !session.verified {
            continue;
        }
        if session.unanswered(PING_CLIENT) >= MAX_UNANSWERED_PINGS {
            info!("[{}] Client stopped answering pings", id);
            dead.push(id.clone());
            continue;
        }
        let sent = state.client_senders.get(id).and_then(|sender| {
            outbound::send_request(sender, &id.to_string(), PING_CLIENT, Some(params.clone()))
                .ok()
        });
        match sent {
            Some(request_id) => {
                session.pending.insert(request_id, PING_CLIENT.to_string());
            }
            None => dead.push(id.clone()),
        }
    }

    for id in dead {
        debug!("[{}] Dropping unreachable session", id);
        state.remove_client(&id);
    }
}

/// Stop COD workers nobody requested for half of `cods_ttl`. Returns how many
/// were asked to stop.
pub fn reap_cods(state: &mut DaemonState) -> usize {
    let idle_limit = state.node.cods_ttl / 2;
    let mut stopped = 0;

    for id in state.cod_links.stream_ids() {
        let Some(handle) = state.supervisor.registry().get(&id) else {
            continue;
        };
        let idle = handle.last_update.elapsed();
        if handle.is_stopping() || idle <= idle_limit {
            continue;
        }
        info!("[{}] COD idle for {:?}, stopping", id, idle);
        if state.supervisor.stop_stream(&id).is_ok() {
            stopped += 1;
        }
    }
    stopped
}

/// Delete `*.ts` files under `dir`, recursively, at least `max_age` old.
/// Symlinked directories are not followed.
pub fn remove_stale_chunks(dir: &Path, max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            removed += remove_stale_chunks(&path, max_age);
            continue;
        }
        let is_chunk = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(TS_EXTENSION));
        if !is_chunk {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                trace!("Removed {}", path.display());
                removed += 1;
            }
            Err(e) => debug!("Failed to remove {}: {}", path.display(), e),
        }
    }
    removed
}

pub fn broadcast_stats(state: &mut DaemonState) {
    let online = state.online_users();
    let info = state.stats.sample(online);
    match serde_json::to_value(info) {
        Ok(params) => state.broadcast("statistic_service", Some(params)),
        Err(e) => error!("Failed to serialize node stats: {}", e),
    }
}

/// Start a shutdown when the node's license is missing or expired. Returns
/// whether the license is still active.
pub fn check_license(state: &mut DaemonState) -> bool {
    let active = state
        .node
        .license_key
        .as_deref()
        .is_some_and(|key| license::is_active(key, now_ms()));
    if !active && !state.shutdown {
        error!("License is missing or expired, stopping service");
        let _ = state.begin_shutdown(Duration::ZERO);
    }
    active
}
