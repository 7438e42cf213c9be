//! Error types for the streamd daemon.

use streamd_core::stream::ConfigError;
use streamd_rpc::protocol::{self, RpcError, errno};

/// Errors that can occur in the daemon
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Session has not activated a license
    #[error("Not activated")]
    NotActivated,

    /// Session was activated for verification only
    #[error("Don't have permissions")]
    PermissionDenied,

    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Method not found
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Stream with id: {0} exist, skip request.")]
    StreamExists(String),

    #[error("Stream with id: {0} not exist, skip request.")]
    StreamNotExist(String),

    #[error("Stream not found")]
    StreamNotFound,

    /// Raw spec rejected by the configuration pipeline
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Activation(String),

    #[error("Stop service in progress...")]
    ShutdownInProgress,

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Not supported protocol")]
    UnsupportedProtocol,

    #[error("Upload failed: {0}")]
    Upload(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] streamd_core::Error),

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(#[from] streamd_rpc::CodecError),
}

impl From<DaemonError> for RpcError {
    fn from(err: DaemonError) -> Self {
        let message = err.to_string();
        match err {
            DaemonError::NotActivated => RpcError::not_activated(),
            DaemonError::PermissionDenied => RpcError::permission_denied(),
            DaemonError::InvalidParams(msg) => RpcError::invalid_params(msg),
            DaemonError::MethodNotFound(_) => {
                RpcError::new(protocol::METHOD_NOT_FOUND, message)
            }
            DaemonError::StreamExists(_) => {
                RpcError::with_errno(protocol::STREAM_EXISTS, message, errno::EEXIST)
            }
            DaemonError::StreamNotExist(_) | DaemonError::StreamNotFound => {
                RpcError::with_errno(protocol::STREAM_NOT_FOUND, message, errno::EINVAL)
            }
            DaemonError::Config(ConfigError::CreateDir { .. }) => {
                RpcError::with_errno(protocol::OPERATION_FAILED, message, errno::EINVAL)
            }
            DaemonError::Config(_) => {
                RpcError::with_errno(protocol::VALIDATION_FAILED, message, errno::EINVAL)
            }
            DaemonError::Activation(_) => {
                RpcError::with_errno(protocol::ACTIVATION_FAILED, message, errno::EINVAL)
            }
            DaemonError::ShutdownInProgress => {
                RpcError::with_errno(protocol::SHUTDOWN_IN_PROGRESS, message, errno::EAGAIN)
            }
            DaemonError::UnsupportedProtocol => {
                RpcError::with_errno(protocol::INVALID_PARAMS, message, errno::EINVAL)
            }
            DaemonError::Spawn(_) | DaemonError::Upload(_) | DaemonError::Io(_) => {
                RpcError::with_errno(protocol::OPERATION_FAILED, message, errno::EINTR)
            }
            DaemonError::Json(_) | DaemonError::Core(_) | DaemonError::Codec(_) => {
                RpcError::internal_error(message)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

impl From<RpcError> for DaemonError {
    fn from(err: RpcError) -> Self {
        match err.code {
            protocol::NOT_ACTIVATED => DaemonError::NotActivated,
            protocol::PERMISSION_DENIED => DaemonError::PermissionDenied,
            protocol::INVALID_PARAMS => DaemonError::InvalidParams(err.message),
            protocol::METHOD_NOT_FOUND => DaemonError::MethodNotFound(err.message),
            protocol::SHUTDOWN_IN_PROGRESS => DaemonError::ShutdownInProgress,
            protocol::ACTIVATION_FAILED => DaemonError::Activation(err.message),
            _ => DaemonError::Io(std::io::Error::other(err.message)),
        }
    }
}
