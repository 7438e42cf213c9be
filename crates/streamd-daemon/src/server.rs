//! Control server of the node daemon.
//!
//! One task per control connection reads frames and dispatches them against
//! the shared [`DaemonState`]. Worker events and lazy starts arrive on the
//! command queue and are applied by a single command loop, so every mutation
//! of the worker registry happens under the state lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use streamd_core::config::NodeConfig;
use streamd_core::license;
use streamd_rpc::{JsonRpcCodec, Message, Response};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use crate::command::{CommandReceiver, CommandSender, DaemonCommand, PreparedRoots};
use crate::error::{DaemonError, Result};
use crate::handlers::{HandlerContext, handle_request};
use crate::housekeeping;
use crate::http::{self, LazyStart, Site, SiteKind, Sites};
use crate::links::LinkIndex;
use crate::outbound;
use crate::session::{ClientSession, SessionId};
use crate::stats::{FullServiceInfo, NodeStats, OnlineUsers};
use crate::supervisor::Supervisor;
use crate::uploads;

/// Time between stopping the workers and closing the listeners.
pub const CLEANUP_DELAY: Duration = Duration::from_secs(5);

/// Resolves once the shutdown flag turns true or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub struct DaemonState {
    pub node: NodeConfig,
    pub sessions: HashMap<SessionId, ClientSession>,
    pub client_senders: HashMap<SessionId, mpsc::UnboundedSender<Message>>,
    pub supervisor: Supervisor,
    pub vod_links: Arc<LinkIndex>,
    pub cod_links: Arc<LinkIndex>,
    pub sites: Sites,
    /// Directories swept by the chunk reaper, set by `prepare_service`
    pub monitored: Vec<PathBuf>,
    pub stats: NodeStats,
    pub http_client: reqwest::Client,
    pub shutdown: bool,
    pub cleanup_delay: Duration,
    commands: CommandSender,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl DaemonState {
    /// # Errors
    ///
    /// Returns an error if the upload client cannot be built.
    pub fn new(node: NodeConfig, commands: CommandSender) -> Result<Self> {
        let supervisor = Supervisor::new(&node, commands.clone());
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            node,
            sessions: HashMap::new(),
            client_senders: HashMap::new(),
            supervisor,
            vod_links: Arc::new(LinkIndex::new()),
            cod_links: Arc::new(LinkIndex::new()),
            sites: Sites::new(),
            monitored: Vec::new(),
            stats: NodeStats::default(),
            http_client: uploads::client()?,
            shutdown: false,
            cleanup_delay: CLEANUP_DELAY,
            commands,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    /// Receiver that turns true once the listeners should close.
    #[must_use]
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn remove_client(&mut self, session_id: &SessionId) {
        self.sessions.remove(session_id);
        self.client_senders.remove(session_id);
    }

    pub(crate) fn create_handler_context<'a>(
        &'a mut self,
        session_id: &'a SessionId,
    ) -> HandlerContext<'a> {
        let client_sender = self.client_senders.get(session_id).cloned();
        HandlerContext {
            state: self,
            client_id: session_id,
            client_sender,
        }
    }

    /// Send the notification `method` to every verified session.
    pub fn broadcast(&self, method: &str, params: Option<Value>) {
        for (id, session) in &self.sessions {
            if !session.verified {
                continue;
            }
            if let Some(tx) = self.client_senders.get(id)
                && outbound::send_notification(tx, &id.to_string(), method, params.clone())
                    .is_err()
            {
                debug!("[{}] Broadcast to closed session", id);
            }
        }
    }

    /// Online users per server; control sessions count once activated.
    #[must_use]
    pub fn online_users(&self) -> OnlineUsers {
        let verified = self.sessions.values().filter(|s| s.verified).count();
        OnlineUsers {
            daemon: u64::try_from(verified).unwrap_or(u64::MAX),
            http: self.sites.hls.online(),
            vods: self.sites.vod.online(),
            cods: self.sites.cod.online(),
        }
    }

    pub fn service_info(&mut self, expiration_time: i64) -> FullServiceInfo {
        let online = self.online_users();
        FullServiceInfo {
            server: self.stats.sample(online),
            http_host: self.node.http_host.clone(),
            vods_host: self.node.vods_host.clone(),
            cods_host: self.node.cods_host.clone(),
            expiration_time,
            project: license::LICENSE_PROJECT.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Stop every worker after `delay`, then close the listeners once the
    /// cleanup delay has passed too.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownInProgress` if a shutdown was already started.
    pub fn begin_shutdown(&mut self, delay: Duration) -> Result<()> {
        if self.shutdown {
            return Err(DaemonError::ShutdownInProgress);
        }
        self.shutdown = true;
        info!(
            "Stopping service: {} workers, listeners close in {:?}",
            self.supervisor.registry().len(),
            delay + self.cleanup_delay
        );

        if delay.is_zero() {
            self.supervisor.stop_all();
        } else {
            let commands = self.commands.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = commands.send(DaemonCommand::StopWorkers);
            });
        }
        let tx = self.shutdown_tx.clone();
        let cleanup = self.cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay + cleanup).await;
            let _ = tx.send(true);
        });
        Ok(())
    }

    /// Apply one command from the queue.
    pub fn apply(&mut self, command: DaemonCommand) {
        match command {
            DaemonCommand::StartStream(spec) => match self.supervisor.create_child_stream(spec) {
                Ok(()) => {}
                Err(DaemonError::StreamExists(id)) => {
                    debug!("[{}] Lazy start: worker already running", id);
                }
                Err(e) => warn!("Lazy start failed: {}", e),
            },
            DaemonCommand::TouchStream(id) => self.supervisor.touch(&id),
            DaemonCommand::WorkerMessage {
                id,
                instance,
                message,
            } => {
                if let Some(notification) =
                    self.supervisor.on_worker_message(&id, instance, message)
                {
                    self.broadcast(&notification.method, notification.params);
                }
            }
            DaemonCommand::WorkerLinkClosed { id, instance } => {
                self.supervisor.on_link_closed(&id, instance);
            }
            DaemonCommand::WorkerExited {
                id,
                instance,
                code,
                signal,
            } => self.on_worker_exit(&id, instance, code, signal),
            DaemonCommand::ExpireStream { id, instance } => self.supervisor.expire(&id, instance),
            DaemonCommand::StopWorkers => self.supervisor.stop_all(),
            DaemonCommand::PreparedDirectories {
                roots,
                reply,
                response,
            } => {
                self.apply_prepared(roots);
                if reply.send(Message::Response(response)).is_err() {
                    debug!("Session closed before prepare_service finished");
                }
            }
        }
    }

    fn apply_prepared(&mut self, roots: PreparedRoots) {
        if let Some(root) = roots.hls {
            self.sites.hls.set_root(Some(root));
        }
        if let Some(root) = roots.vods {
            self.sites.vod.set_root(Some(root));
        }
        if let Some(root) = roots.cods {
            self.sites.cod.set_root(Some(root));
        }
        self.monitored = roots.monitored;
    }

    pub(crate) fn command_sender(&self) -> CommandSender {
        self.commands.clone()
    }

    fn on_worker_exit(&mut self, id: &str, instance: u64, code: Option<i32>, signal: Option<i32>) {
        let Some(handle) = self.supervisor.on_exit(id, instance) else {
            debug!("[{}] Exit of a stale worker instance {}", id, instance);
            return;
        };
        info!(
            "[{}] Worker exited (code {:?}, signal {:?})",
            id, code, signal
        );

        self.broadcast(
            "quit_status_stream",
            Some(json!({
                "id": id,
                "exit_status": code.unwrap_or(0),
                "signal": signal.unwrap_or(0),
            })),
        );

        if handle.config.cleanup_ts() && !handle.served_roots.is_empty() {
            let roots = handle.served_roots.clone();
            let stream_id = id.to_string();
            tokio::task::spawn_blocking(move || {
                for root in roots {
                    let removed = housekeeping::remove_stale_chunks(&root, Duration::ZERO);
                    debug!(
                        "[{}] Removed {} chunks from {}",
                        stream_id,
                        removed,
                        root.display()
                    );
                }
            });
        }

        if handle.restart {
            info!("[{}] Restarting worker", id);
            if let Err(e) = self.supervisor.create_child_stream(handle.spec) {
                error!("[{}] Restart failed: {}", id, e);
            }
        }
    }
}

/// Bound listeners of a node, ready to run.
pub struct Daemon {
    state: Arc<RwLock<DaemonState>>,
    commands: CommandReceiver,
    control: TcpListener,
    sites: Vec<(TcpListener, Arc<Site>)>,
    bridge: Arc<LazyStart>,
}

impl Daemon {
    /// Bind the control listener and the three HTTP listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if any listener cannot be bound.
    pub async fn bind(node: NodeConfig) -> Result<Self> {
        let control = TcpListener::bind(&node.host).await?;
        let hls = TcpListener::bind(&node.http_host).await?;
        let vods = TcpListener::bind(&node.vods_host).await?;
        let cods = TcpListener::bind(&node.cods_host).await?;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let state = DaemonState::new(node, commands_tx.clone())?;
        let bridge = Arc::new(LazyStart::new(
            state.vod_links.clone(),
            state.cod_links.clone(),
            commands_tx,
        ));
        let sites = vec![
            (hls, state.sites.hls.clone()),
            (vods, state.sites.vod.clone()),
            (cods, state.sites.cod.clone()),
        ];

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            commands,
            control,
            sites,
            bridge,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.control.local_addr()?)
    }

    #[must_use]
    pub fn http_addr(&self, kind: SiteKind) -> Option<SocketAddr> {
        self.sites
            .iter()
            .find(|(_, site)| site.kind == kind)
            .and_then(|(listener, _)| listener.local_addr().ok())
    }

    #[must_use]
    pub fn state(&self) -> Arc<RwLock<DaemonState>> {
        self.state.clone()
    }

    /// Serve until a shutdown completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the control listener fails irrecoverably.
    pub async fn run(self) -> Result<()> {
        let Self {
            state,
            commands,
            control,
            sites,
            bridge,
        } = self;
        let shutdown = state.read().await.subscribe_shutdown();

        let loop_state = state.clone();
        tokio::spawn(async move {
            run_commands(loop_state, commands).await;
        });

        for (listener, site) in sites {
            let bridge = bridge.clone();
            let rx = shutdown.clone();
            tokio::spawn(async move {
                let kind = site.kind;
                if let Err(e) = http::serve(listener, site, bridge, rx).await {
                    error!("[{}] HTTP server failed: {}", kind, e);
                }
            });
        }

        housekeeping::spawn_all(state.clone(), shutdown.clone()).await;

        if let Ok(addr) = control.local_addr() {
            info!("Control server listening on {}", addr);
        }
        let mut stop = shutdown.clone();
        loop {
            tokio::select! {
                accepted = control.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let state = state.clone();
                        let rx = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, state, rx).await {
                                error!("Connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                () = stopped(&mut stop) => {
                    info!("Shutdown complete, stopping server");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Bind and run a node daemon.
///
/// # Errors
///
/// Returns an error if the listeners cannot be bound or the server fails.
pub async fn run(node: NodeConfig) -> Result<()> {
    Daemon::bind(node).await?.run().await
}

async fn run_commands(state: Arc<RwLock<DaemonState>>, mut commands: CommandReceiver) {
    while let Some(command) = commands.recv().await {
        trace!("Applying command: {:?}", command);
        state.write().await.apply(command);
    }
    debug!("Command loop ended");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<RwLock<DaemonState>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let framed = Framed::new(stream, JsonRpcCodec::new());
    let (mut sink, mut frames) = framed.split();

    let session_id = SessionId::new();
    debug!("New connection {} from {}", session_id, peer);

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    {
        let mut state_guard = state.write().await;
        state_guard
            .sessions
            .insert(session_id.clone(), ClientSession::new(session_id.clone(), peer));
        state_guard.client_senders.insert(session_id.clone(), tx);
    }

    let session_id_clone = session_id.clone();
    let mut send_task = tokio::spawn(async move {
        trace!("[{}] send_task started", session_id_clone);
        while let Some(msg) = rx.recv().await {
            match &msg {
                Message::Request(r) => trace!(
                    "[{}] send_task: sending request method={}",
                    session_id_clone, r.method
                ),
                Message::Response(r) => trace!(
                    "[{}] send_task: sending response id={}",
                    session_id_clone, r.id
                ),
                Message::Notification(n) => trace!(
                    "[{}] send_task: sending notification method={}",
                    session_id_clone, n.method
                ),
            }
            if let Err(e) = sink.send(msg).await {
                warn!("Failed to send to {}: {}", session_id_clone, e);
                break;
            }
        }
        trace!("[{}] send_task ended", session_id_clone);
    });

    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            () = stopped(&mut shutdown) => break,
            // the session was dropped and its sender with it
            _ = &mut send_task => break,
        };
        let Some(result) = frame else {
            break;
        };
        match result {
            Ok(msg) => {
                if let Some(response) = process_message(&session_id, msg, &state).await {
                    let state_guard = state.read().await;
                    if let Some(tx) = state_guard.client_senders.get(&session_id)
                        && tx.send(Message::Response(response)).is_err()
                    {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("Read error from {}: {}", session_id, e);
                break;
            }
        }
    }

    debug!("Connection closed: {}", session_id);
    state.write().await.remove_client(&session_id);
    send_task.abort();
    Ok(())
}

async fn process_message(
    session_id: &SessionId,
    msg: Message,
    state: &Arc<RwLock<DaemonState>>,
) -> Option<Response> {
    match msg {
        Message::Request(request) if request.id.is_none() => {
            debug!(
                "[{}] Ignoring notification-style request: {}",
                session_id, request.method
            );
            None
        }
        Message::Request(request) => {
            trace!(
                "Processing request: method={}, id={:?}",
                request.method, request.id
            );
            let mut state_guard = state.write().await;
            let mut ctx = state_guard.create_handler_context(session_id);
            handle_request(&mut ctx, &request)
        }
        Message::Notification(notification) => {
            debug!(
                "[{}] Ignoring notification: {}",
                session_id, notification.method
            );
            None
        }
        Message::Response(response) => {
            let mut state_guard = state.write().await;
            let method = state_guard
                .sessions
                .get_mut(session_id)
                .and_then(|session| session.take_pending(&response.id));
            match method {
                Some(method) if response.is_error() => {
                    warn!(
                        "[{}] Client failed {}: {:?}",
                        session_id, method, response.error
                    );
                }
                Some(method) => trace!("[{}] Client answered {}", session_id, method),
                None => warn!("[{}] Unmatched response: {}", session_id, response.id),
            }
            None
        }
    }
}
