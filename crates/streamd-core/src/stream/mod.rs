//! Stream configuration pipeline: validation, identity and typed configs.

pub mod factory;
pub mod validator;

mod info;
mod types;

use std::path::PathBuf;

pub use factory::{
    AvConfig, BaseConfig, EncodeConfig, Logo, Ratio, RelayConfig, Size, TypedConfig, build,
};
pub use info::{DEFAULT_STREAM_LOG_LEVEL, StreamInfo};
pub use types::{InputUri, OutputUri, RawStreamSpec, StreamType, read_input, read_output};
pub use validator::{FieldRegistry, ValidationError, validate};

/// Why a raw spec could not become a runnable stream.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Define {0} variable and make it valid")]
    Missing(&'static str),

    #[error("Unknown stream type: {0}")]
    UnknownType(i64),

    #[error("Proxy streams not handled for now")]
    ProxyUnsupported,

    #[error("restart_attempts must be positive, got {0}")]
    InvalidRestartAttempts(i64),

    #[error("timeshift_chunk_duration must be positive, got {0}")]
    InvalidChunkDuration(i64),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
