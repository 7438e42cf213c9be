//! Work handed to the daemon's command loop from other tasks.

use std::path::PathBuf;

use streamd_core::stream::RawStreamSpec;
use streamd_rpc::{Message, Response};
use tokio::sync::mpsc;

/// Served roots and monitored folders produced by `prepare_service`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedRoots {
    pub hls: Option<PathBuf>,
    pub vods: Option<PathBuf>,
    pub cods: Option<PathBuf>,
    pub monitored: Vec<PathBuf>,
}

#[derive(Debug)]
pub enum DaemonCommand {
    /// Lazy start from an HTTP trigger
    StartStream(RawStreamSpec),
    /// A chunk or manifest of this stream was just requested
    TouchStream(String),
    WorkerMessage {
        id: String,
        instance: u64,
        message: Message,
    },
    WorkerLinkClosed {
        id: String,
        instance: u64,
    },
    WorkerExited {
        id: String,
        instance: u64,
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// `auto_exit_time` of the worker elapsed
    ExpireStream {
        id: String,
        instance: u64,
    },
    /// Delayed part of `stop_service`
    StopWorkers,
    /// Directories of `prepare_service` are ready; apply them, then answer
    PreparedDirectories {
        roots: PreparedRoots,
        reply: mpsc::UnboundedSender<Message>,
        response: Response,
    },
}

pub type CommandSender = mpsc::UnboundedSender<DaemonCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<DaemonCommand>;
