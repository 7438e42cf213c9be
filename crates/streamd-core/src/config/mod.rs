mod dirs;
mod node;

pub use dirs::default_config_path;
pub use node::{
    DEFAULT_CODS_HOST, DEFAULT_CODS_TTL, DEFAULT_FILES_TTL, DEFAULT_HOST, DEFAULT_HTTP_HOST,
    DEFAULT_LOG_PATH, DEFAULT_VODS_HOST, DEFAULT_WORKER_PATH, LogLevel, NodeConfig,
};
