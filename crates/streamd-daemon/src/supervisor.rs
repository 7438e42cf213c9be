//! Worker process lifecycle.
//!
//! Each stream runs in its own worker executable, started as
//! `<worker_path> --stream-id <id> --config <json>`. The child's stdin and
//! stdout carry the same length-prefixed envelope as control connections.
//! Three tasks are attached to every worker: a writer draining the handle's
//! IPC sender, a reader turning frames into [`DaemonCommand::WorkerMessage`],
//! and a wait task that escalates a stop to a kill after [`STOP_GRACE`] and
//! reports [`DaemonCommand::WorkerExited`].

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::{Value, json};
use streamd_core::config::NodeConfig;
use streamd_core::stream::{self, RawStreamSpec, StreamInfo, TypedConfig};
use streamd_rpc::{JsonRpcCodec, Message, Notification, Response, RpcError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, trace, warn};

use crate::command::{CommandSender, DaemonCommand};
use crate::error::{DaemonError, Result};
use crate::outbound;
use crate::registry::{WorkerHandle, WorkerRegistry, WorkerState};

/// How long a worker may take to exit after `stop` before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Worker requests re-broadcast to verified sessions.
const FORWARDED_METHODS: &[&str] = &["changed_source_stream", "statistic_stream"];

fn is_forwarded(method: &str) -> bool {
    FORWARDED_METHODS.contains(&method)
}

#[derive(Debug)]
pub struct Supervisor {
    registry: WorkerRegistry,
    worker_path: String,
    streamlink_path: PathBuf,
    commands: CommandSender,
    next_instance: u64,
    accepting: bool,
}

impl Supervisor {
    #[must_use]
    pub fn new(node: &NodeConfig, commands: CommandSender) -> Self {
        Self {
            registry: WorkerRegistry::new(),
            worker_path: node.worker_path.clone(),
            streamlink_path: node.streamlink_path.clone(),
            commands,
            next_instance: 1,
            accepting: true,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut WorkerRegistry {
        &mut self.registry
    }

    /// Validate `spec`, prepare its directories, build its typed config and
    /// spawn a worker for it.
    ///
    /// # Errors
    ///
    /// Fails on a fatal validation error, a config the factory rejects, a
    /// directory that cannot be created, a duplicate id, or a spawn failure.
    pub fn create_child_stream(&mut self, spec: RawStreamSpec) -> Result<()> {
        if !self.accepting {
            return Err(DaemonError::ShutdownInProgress);
        }
        stream::validate(&spec).map_err(stream::ConfigError::from)?;
        let info = StreamInfo::prepare(&spec, true)?;
        let config = stream::build(&spec)?;

        if self.registry.contains(&info.id) {
            return Err(DaemonError::StreamExists(info.id));
        }

        let handle = self.spawn(&info, spec, config)?;
        info!(
            "[{}] Started {} worker (pid {:?})",
            handle.id, info.stream_type, handle.pid
        );
        self.registry.insert(handle)
    }

    fn spawn(
        &mut self,
        info: &StreamInfo,
        spec: RawStreamSpec,
        config: TypedConfig,
    ) -> Result<WorkerHandle> {
        let mut parts = self.worker_path.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| DaemonError::Spawn("Empty worker command".to_string()))?;

        let worker_spec = spec.with_field(
            "streamlink_path",
            Value::String(self.streamlink_path.display().to_string()),
        );
        let config_json = serde_json::to_string(&worker_spec.to_value())?;

        debug!("[{}] Spawning: {}", info.id, self.worker_path);
        let mut child = Command::new(program)
            .args(parts)
            .arg("--stream-id")
            .arg(&info.id)
            .arg("--config")
            .arg(config_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DaemonError::Spawn(e.to_string()))?;

        let instance = self.next_instance;
        self.next_instance += 1;

        let mut handle = WorkerHandle::new(info.id.clone(), instance, spec, config);
        handle.pid = child.id();
        handle.served_roots = info.served_roots().map(PathBuf::from).collect();

        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(info.id.clone(), stderr);
        }
        if let Some(stdin) = child.stdin.take() {
            handle.sender = Some(spawn_writer(info.id.clone(), stdin));
        }
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(info.id.clone(), instance, stdout, self.commands.clone());
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        handle.stop_signal = Some(stop_tx);
        spawn_waiter(
            info.id.clone(),
            instance,
            child,
            stop_rx,
            self.commands.clone(),
        );

        if let Some(ttl) = handle.config.base().ttl {
            spawn_expiry(info.id.clone(), instance, ttl, self.commands.clone());
        }

        Ok(handle)
    }

    /// Ask the worker for `id` to stop.
    ///
    /// # Errors
    ///
    /// Returns `StreamNotExist` if no worker runs under `id`.
    pub fn stop_stream(&mut self, id: &str) -> Result<()> {
        let handle = self
            .registry
            .get_mut(id)
            .ok_or_else(|| DaemonError::StreamNotExist(id.to_string()))?;
        handle.restart = false;
        request_stop(handle, "stop");
        Ok(())
    }

    /// Stop the worker for `id` and start it again from its spec once it exits.
    /// A worker already stopping keeps its pending stop or restart.
    ///
    /// # Errors
    ///
    /// Returns `StreamNotFound` if no worker runs under `id`.
    pub fn restart_stream(&mut self, id: &str) -> Result<()> {
        let handle = self
            .registry
            .get_mut(id)
            .ok_or(DaemonError::StreamNotFound)?;
        if handle.is_stopping() {
            debug!("[{}] Restart ignored, worker is already stopping", id);
            return Ok(());
        }
        handle.restart = true;
        request_stop(handle, "restart");
        Ok(())
    }

    /// Stop every worker and refuse new ones.
    pub fn stop_all(&mut self) {
        self.accepting = false;
        for handle in self.registry.iter_mut() {
            handle.restart = false;
            request_stop(handle, "stop");
        }
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn touch(&mut self, id: &str) {
        if let Some(handle) = self.registry.get_mut(id) {
            handle.touch();
        }
    }

    /// Handle one IPC message from a worker. Returns the notification to
    /// broadcast to verified sessions, if any.
    pub fn on_worker_message(
        &mut self,
        id: &str,
        instance: u64,
        message: Message,
    ) -> Option<Notification> {
        let Some(handle) = self.registry.get_instance_mut(id, instance) else {
            debug!("[{}] Dropping message from a stale worker", id);
            return None;
        };
        if handle.mark_running() {
            info!("[{}] Worker running", id);
        }

        match message {
            Message::Request(request) => {
                let forwarded = is_forwarded(&request.method);
                if let Some(request_id) = request.id.clone() {
                    let response = if forwarded {
                        Response::success(request_id, json!({}))
                    } else {
                        warn!("[{}] Unknown worker method: {}", id, request.method);
                        Response::error(request_id, RpcError::method_not_found())
                    };
                    if let Some(sender) = &handle.sender {
                        let _ = sender.send(Message::Response(response));
                    }
                }
                forwarded.then(|| Notification::new(request.method, request.params))
            }
            Message::Notification(notification) => {
                if is_forwarded(&notification.method) {
                    Some(notification)
                } else {
                    debug!(
                        "[{}] Ignoring worker notification: {}",
                        id, notification.method
                    );
                    None
                }
            }
            Message::Response(response) => {
                match handle.pending.remove(&response.id) {
                    Some(method) if response.is_error() => {
                        warn!("[{}] Worker failed {}: {:?}", id, method, response.error);
                    }
                    Some(method) => debug!("[{}] Worker acknowledged {}", id, method),
                    None => warn!("[{}] Unmatched worker response: {}", id, response.id),
                }
                None
            }
        }
    }

    pub fn on_link_closed(&mut self, id: &str, instance: u64) {
        if let Some(handle) = self.registry.get_instance_mut(id, instance) {
            debug!("[{}] Worker IPC link closed", id);
            handle.sender = None;
        }
    }

    /// Remove the handle of an exited worker.
    pub fn on_exit(&mut self, id: &str, instance: u64) -> Option<WorkerHandle> {
        self.registry.remove_instance(id, instance)
    }

    pub fn expire(&mut self, id: &str, instance: u64) {
        if let Some(handle) = self.registry.get_instance_mut(id, instance)
            && !handle.is_stopping()
        {
            info!("[{}] auto_exit_time reached, stopping", id);
            handle.restart = false;
            request_stop(handle, "stop");
        }
    }
}

/// Send `method` (`stop` or `restart`) to the worker, or SIGTERM when its IPC
/// link is gone, then arm the kill timer.
fn request_stop(handle: &mut WorkerHandle, method: &str) {
    if handle.state == WorkerState::StopRequested {
        debug!("[{}] Stop already requested", handle.id);
        return;
    }
    handle.state = WorkerState::StopRequested;

    let sent = handle
        .sender
        .as_ref()
        .and_then(|sender| outbound::send_request(sender, &handle.id, method, None).ok());
    match sent {
        Some(request_id) => {
            handle.pending.insert(request_id, method.to_string());
        }
        None => terminate(handle),
    }
    handle.arm_stop_timer();
}

fn terminate(handle: &WorkerHandle) {
    let Some(pid) = handle.pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    debug!("[{}] Sending SIGTERM to {}", handle.id, pid);
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!("[{}] SIGTERM to {} failed: {}", handle.id, pid, e);
    }
}

fn spawn_stderr_logger(stream_id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{}] worker stderr: {}", stream_id, line);
        }
    });
}

fn spawn_writer(stream_id: String, stdin: ChildStdin) -> mpsc::UnboundedSender<Message> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        let mut sink = FramedWrite::new(stdin, JsonRpcCodec::strict());
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                warn!("[{}] Failed to write to worker: {}", stream_id, e);
                break;
            }
        }
        trace!("[{}] worker writer ended", stream_id);
    });
    tx
}

fn spawn_reader(stream_id: String, instance: u64, stdout: ChildStdout, commands: CommandSender) {
    tokio::spawn(async move {
        let mut frames = FramedRead::new(stdout, JsonRpcCodec::strict());
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(message) => {
                    let command = DaemonCommand::WorkerMessage {
                        id: stream_id.clone(),
                        instance,
                        message,
                    };
                    if commands.send(command).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("[{}] Bad worker frame, closing link: {}", stream_id, e);
                    break;
                }
            }
        }
        let _ = commands.send(DaemonCommand::WorkerLinkClosed {
            id: stream_id,
            instance,
        });
    });
}

fn spawn_waiter(
    stream_id: String,
    instance: u64,
    mut child: Child,
    stop_requested: oneshot::Receiver<()>,
    commands: CommandSender,
) {
    tokio::spawn(async move {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = stop_requested => None,
        };
        let status = match exited {
            Some(status) => status,
            None => match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(
                        "[{}] Worker still running {:?} after stop, killing",
                        stream_id, STOP_GRACE
                    );
                    if let Err(e) = child.start_kill() {
                        error!("[{}] Kill failed: {}", stream_id, e);
                    }
                    child.wait().await
                }
            },
        };

        let (code, signal) = match status {
            Ok(status) => (status.code(), status.signal()),
            Err(e) => {
                error!("[{}] Failed to wait for worker: {}", stream_id, e);
                (None, None)
            }
        };
        let _ = commands.send(DaemonCommand::WorkerExited {
            id: stream_id,
            instance,
            code,
            signal,
        });
    });
}

fn spawn_expiry(stream_id: String, instance: u64, ttl: Duration, commands: CommandSender) {
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        let _ = commands.send(DaemonCommand::ExpireStream {
            id: stream_id,
            instance,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use streamd_rpc::{Request, RequestId};
    use tempfile::TempDir;

    use crate::command::CommandReceiver;

    const WAIT: Duration = Duration::from_secs(5);

    /// Shell worker that exits as soon as anything arrives on stdin.
    fn write_worker(dir: &Path, body: &str) -> String {
        let path = dir.join("worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn supervisor(dir: &Path, body: &str) -> (Supervisor, CommandReceiver) {
        let node = NodeConfig {
            worker_path: write_worker(dir, body),
            ..NodeConfig::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (Supervisor::new(&node, tx), rx)
    }

    fn relay_spec(dir: &Path, id: &str) -> RawStreamSpec {
        RawStreamSpec::from_value(json!({
            "id": id,
            "type": 2,
            "feedback_directory": dir.join("feedback").display().to_string(),
            "data_directory": dir.join("data").display().to_string(),
            "input": ["udp://239.0.0.1:1234"],
            "output": [],
        }))
        .unwrap()
    }

    async fn next_exit(rx: &mut CommandReceiver) -> (String, Option<i32>) {
        loop {
            let command = tokio::time::timeout(WAIT, rx.recv())
                .await
                .expect("timed out waiting for worker exit")
                .expect("command channel closed");
            if let DaemonCommand::WorkerExited { id, code, .. } = command {
                return (id, code);
            }
        }
    }

    #[tokio::test]
    async fn test_proxy_spec_creates_no_worker() {
        let dir = TempDir::new().unwrap();
        let (mut sup, _rx) = supervisor(dir.path(), "head -c 1 >/dev/null");
        let spec = relay_spec(dir.path(), "p1").with_field("type", json!(0));

        let err = sup.create_child_stream(spec).unwrap_err();
        assert!(matches!(
            err,
            DaemonError::Config(stream::ConfigError::ProxyUnsupported)
        ));
        assert!(sup.registry().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_validation_creates_no_worker() {
        let dir = TempDir::new().unwrap();
        let (mut sup, _rx) = supervisor(dir.path(), "head -c 1 >/dev/null");
        let spec = relay_spec(dir.path(), "v1").with_field("type", json!(99));

        let err = sup.create_child_stream(spec).unwrap_err();
        assert_eq!(err.to_string(), "Invalid value '99' of option 'type'");
        assert!(sup.registry().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_start_keeps_first_worker() {
        let dir = TempDir::new().unwrap();
        let (mut sup, mut rx) = supervisor(dir.path(), "head -c 1 >/dev/null");

        sup.create_child_stream(relay_spec(dir.path(), "s1")).unwrap();
        let first = sup.registry().get("s1").unwrap().instance;

        let err = sup
            .create_child_stream(relay_spec(dir.path(), "s1"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Stream with id: s1 exist, skip request.");
        assert_eq!(sup.registry().get("s1").unwrap().instance, first);

        sup.stop_stream("s1").unwrap();
        let (id, code) = next_exit(&mut rx).await;
        assert_eq!(id, "s1");
        assert_eq!(code, Some(0));
        assert!(sup.on_exit("s1", first).is_some());
        assert!(sup.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stop_sends_request_and_records_pending() {
        let dir = TempDir::new().unwrap();
        let (mut sup, mut rx) = supervisor(dir.path(), "head -c 1 >/dev/null");
        sup.create_child_stream(relay_spec(dir.path(), "s1")).unwrap();

        sup.stop_stream("s1").unwrap();
        let handle = sup.registry().get("s1").unwrap();
        assert_eq!(handle.state, WorkerState::StopRequested);
        assert_eq!(
            handle.pending.values().cloned().collect::<Vec<_>>(),
            vec!["stop".to_string()]
        );

        // second stop is a no-op
        sup.stop_stream("s1").unwrap();
        assert_eq!(sup.registry().get("s1").unwrap().pending.len(), 1);
        next_exit(&mut rx).await;
    }

    #[tokio::test]
    async fn test_restart_after_stop_keeps_stream_stopped() {
        let dir = TempDir::new().unwrap();
        let (mut sup, mut rx) = supervisor(dir.path(), "head -c 1 >/dev/null");
        sup.create_child_stream(relay_spec(dir.path(), "s1")).unwrap();

        sup.stop_stream("s1").unwrap();
        sup.restart_stream("s1").unwrap();

        let handle = sup.registry().get("s1").unwrap();
        assert!(!handle.restart);
        assert_eq!(
            handle.pending.values().cloned().collect::<Vec<_>>(),
            vec!["stop".to_string()]
        );
        next_exit(&mut rx).await;
    }

    #[tokio::test]
    async fn test_stop_and_restart_unknown_stream() {
        let dir = TempDir::new().unwrap();
        let (mut sup, _rx) = supervisor(dir.path(), "true");
        assert_eq!(
            sup.stop_stream("nope").unwrap_err().to_string(),
            "Stream with id: nope not exist, skip request."
        );
        assert!(matches!(
            sup.restart_stream("nope").unwrap_err(),
            DaemonError::StreamNotFound
        ));
    }

    #[tokio::test]
    async fn test_worker_without_link_gets_sigterm() {
        let dir = TempDir::new().unwrap();
        let (mut sup, mut rx) = supervisor(dir.path(), "exec sleep 30");
        sup.create_child_stream(relay_spec(dir.path(), "s1")).unwrap();
        let instance = sup.registry().get("s1").unwrap().instance;

        sup.on_link_closed("s1", instance);
        sup.stop_stream("s1").unwrap();

        let command = loop {
            let command = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            if matches!(command, DaemonCommand::WorkerExited { .. }) {
                break command;
            }
        };
        let DaemonCommand::WorkerExited { signal, .. } = command else {
            unreachable!();
        };
        assert_eq!(signal, Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_stop_all_refuses_new_streams() {
        let dir = TempDir::new().unwrap();
        let (mut sup, mut rx) = supervisor(dir.path(), "head -c 1 >/dev/null");
        sup.create_child_stream(relay_spec(dir.path(), "s1")).unwrap();

        sup.stop_all();
        assert!(!sup.is_accepting());
        assert!(matches!(
            sup.create_child_stream(relay_spec(dir.path(), "s2")),
            Err(DaemonError::ShutdownInProgress)
        ));
        next_exit(&mut rx).await;
    }

    #[tokio::test]
    async fn test_forwarded_worker_request_is_acknowledged() {
        let dir = TempDir::new().unwrap();
        let (mut sup, _rx) = supervisor(dir.path(), "head -c 1 >/dev/null");
        sup.create_child_stream(relay_spec(dir.path(), "s1")).unwrap();
        let instance = sup.registry().get("s1").unwrap().instance;

        let (tx, mut worker_rx) = mpsc::unbounded_channel();
        sup.registry_mut().get_mut("s1").unwrap().sender = Some(tx);

        let request = Request::new(
            "changed_source_stream",
            Some(json!({"id": "s1", "source": 1})),
            RequestId::Number(5),
        );
        let notification = sup
            .on_worker_message("s1", instance, Message::Request(request))
            .unwrap();
        assert_eq!(notification.method, "changed_source_stream");
        assert_eq!(
            sup.registry().get("s1").unwrap().state,
            WorkerState::Running
        );

        let Some(Message::Response(response)) = worker_rx.recv().await else {
            panic!("expected an acknowledgement");
        };
        assert_eq!(response.id, RequestId::Number(5));
        assert!(!response.is_error());
        sup.stop_all();
    }

    #[tokio::test]
    async fn test_unknown_worker_method_rejected() {
        let dir = TempDir::new().unwrap();
        let (mut sup, _rx) = supervisor(dir.path(), "head -c 1 >/dev/null");
        sup.create_child_stream(relay_spec(dir.path(), "s1")).unwrap();
        let instance = sup.registry().get("s1").unwrap().instance;

        let (tx, mut worker_rx) = mpsc::unbounded_channel();
        sup.registry_mut().get_mut("s1").unwrap().sender = Some(tx);

        let request = Request::new("format_disk", None, RequestId::Number(6));
        assert!(
            sup.on_worker_message("s1", instance, Message::Request(request))
                .is_none()
        );
        let Some(Message::Response(response)) = worker_rx.recv().await else {
            panic!("expected an error response");
        };
        assert_eq!(response.error.unwrap().code, streamd_rpc::METHOD_NOT_FOUND);
        sup.stop_all();
    }

    #[tokio::test]
    async fn test_stale_instance_messages_dropped() {
        let dir = TempDir::new().unwrap();
        let (mut sup, _rx) = supervisor(dir.path(), "head -c 1 >/dev/null");
        sup.create_child_stream(relay_spec(dir.path(), "s1")).unwrap();
        let instance = sup.registry().get("s1").unwrap().instance;

        let message = Message::notification("statistic_stream", None);
        assert!(sup.on_worker_message("s1", instance + 1, message).is_none());
        assert_eq!(
            sup.registry().get("s1").unwrap().state,
            WorkerState::Starting
        );
        sup.stop_all();
    }

    #[tokio::test]
    async fn test_auto_exit_time_expires_worker() {
        let dir = TempDir::new().unwrap();
        let (mut sup, mut rx) = supervisor(dir.path(), "head -c 1 >/dev/null");
        let spec = relay_spec(dir.path(), "s1").with_field("auto_exit_time", json!(1));
        sup.create_child_stream(spec).unwrap();

        let (id, instance) = loop {
            let command = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            if let DaemonCommand::ExpireStream { id, instance } = command {
                break (id, instance);
            }
        };
        sup.expire(&id, instance);
        assert!(sup.registry().get("s1").unwrap().is_stopping());
        next_exit(&mut rx).await;
    }
}
