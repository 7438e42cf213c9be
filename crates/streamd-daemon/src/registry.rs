//! Live workers, one per stream id.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::time::Instant;

use streamd_core::stream::{RawStreamSpec, TypedConfig};
use streamd_rpc::{Message, RequestId};
use tokio::sync::{mpsc, oneshot};

use crate::error::{DaemonError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, nothing heard yet
    Starting,
    Running,
    /// `stop` or `restart` sent, grace timer armed
    StopRequested,
}

#[derive(Debug)]
pub struct WorkerHandle {
    pub id: String,
    /// Distinguishes successive workers of the same stream id
    pub instance: u64,
    pub pid: Option<u32>,
    /// IPC channel to the worker's stdin, `None` once the link is gone
    pub sender: Option<mpsc::UnboundedSender<Message>>,
    pub last_update: Instant,
    pub state: WorkerState,
    /// Spec the worker was started from, reused on restart
    pub spec: RawStreamSpec,
    pub config: TypedConfig,
    pub served_roots: Vec<PathBuf>,
    pub pending: HashMap<RequestId, String>,
    /// Start again from `spec` once the process exits
    pub restart: bool,
    pub(crate) stop_signal: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    #[must_use]
    pub fn new(id: String, instance: u64, spec: RawStreamSpec, config: TypedConfig) -> Self {
        Self {
            id,
            instance,
            pid: None,
            sender: None,
            last_update: Instant::now(),
            state: WorkerState::Starting,
            spec,
            config,
            served_roots: Vec::new(),
            pending: HashMap::new(),
            restart: false,
            stop_signal: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_update = Instant::now();
    }

    /// Record that the worker spoke. Returns true on the `Starting` to
    /// `Running` transition.
    pub fn mark_running(&mut self) -> bool {
        if self.state == WorkerState::Starting {
            self.state = WorkerState::Running;
            return true;
        }
        false
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.state == WorkerState::StopRequested
    }

    /// Start the kill grace period in the worker's wait task.
    pub(crate) fn arm_stop_timer(&mut self) {
        if let Some(signal) = self.stop_signal.take() {
            let _ = signal.send(());
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerHandle>,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle.
    ///
    /// # Errors
    ///
    /// Returns `StreamExists` if a worker with the same id is registered; the
    /// existing handle is kept.
    pub fn insert(&mut self, handle: WorkerHandle) -> Result<()> {
        match self.workers.entry(handle.id.clone()) {
            Entry::Occupied(_) => Err(DaemonError::StreamExists(handle.id)),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.workers.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&WorkerHandle> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(id)
    }

    /// The handle for `id`, only if it is still the given worker instance.
    pub fn get_instance_mut(&mut self, id: &str, instance: u64) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(id).filter(|h| h.instance == instance)
    }

    pub fn remove_instance(&mut self, id: &str, instance: u64) -> Option<WorkerHandle> {
        if self.get(id)?.instance != instance {
            return None;
        }
        self.workers.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.workers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerHandle> {
        self.workers.values_mut()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
