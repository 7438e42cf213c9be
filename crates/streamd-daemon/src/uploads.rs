//! Uploads of stream logs, pipeline dumps and the node log.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};
use url::Url;

use crate::error::{DaemonError, Result};

/// Stream log written by a worker into its feedback directory.
pub const LOG_FILE_NAME: &str = "logs.txt";
/// Pipeline graph dump written by a worker into its feedback directory.
pub const PIPELINE_FILE_NAME: &str = "dump.html";

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client shared by all uploads.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(UPLOAD_TIMEOUT)
        .build()
        .map_err(|e| DaemonError::Upload(e.to_string()))
}

/// Parse an upload destination; only http(s) is supported.
///
/// # Errors
///
/// `InvalidParams` for an unparsable URL, `UnsupportedProtocol` for any
/// other scheme.
pub fn upload_target(url: &str) -> Result<Url> {
    let target =
        Url::parse(url).map_err(|e| DaemonError::InvalidParams(format!("Invalid path: {e}")))?;
    match target.scheme() {
        "http" | "https" => Ok(target),
        _ => Err(DaemonError::UnsupportedProtocol),
    }
}

#[must_use]
pub fn stream_file(feedback_dir: &Path, name: &str) -> PathBuf {
    feedback_dir.join(name)
}

/// POST the raw contents of `file` to `target`.
///
/// # Errors
///
/// Fails if the file cannot be read or the server does not answer with a
/// success status.
pub async fn upload_file(client: &reqwest::Client, file: &Path, target: Url) -> Result<()> {
    let body = tokio::fs::read(file).await?;
    debug!("Uploading {} ({} bytes) to {}", file.display(), body.len(), target);

    client
        .post(target.clone())
        .body(body)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| DaemonError::Upload(e.to_string()))?;

    info!("Uploaded {} to {}", file.display(), target);
    Ok(())
}
