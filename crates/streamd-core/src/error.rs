use thiserror::Error;

use crate::stream::ConfigError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Stream config error: {0}")]
    Stream(#[from] ConfigError),

    #[error("License error: {0}")]
    License(String),
}

pub type Result<T> = std::result::Result<T, Error>;
