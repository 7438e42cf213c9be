//! streamd node daemon entry point.
//!
//! Without flags, loads the node config and serves until `stop_service` or an
//! expired license stops it. With `--stop`, asks the running daemon to stop.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use streamd_core::config::{NodeConfig, default_config_path};
use streamd_rpc::RpcClient;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// streamd - control-plane daemon of a media-streaming node
#[derive(Parser, Debug)]
#[command(name = "streamd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Node config file (defaults to `<config_dir>/streamd.conf`)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Ask the running daemon to stop and exit
    #[arg(long)]
    stop: bool,
}

/// Stderr logging plus a file layer when the node config names a log file.
/// `RUST_LOG` overrides the configured level; debug builds default to debug.
fn setup_logging(node: &NodeConfig) -> Option<WorkerGuard> {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        node.log_level.as_filter()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("streamd={default_level}")));

    let Some(log_file) = node.log_file() else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .with(filter)
            .init();
        return None;
    };

    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
    let file_name = log_file
        .file_name()
        .map_or_else(|| "streamd.log".into(), |n| n.to_os_string());
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .init();
    Some(guard)
}

async fn stop_running_daemon(node: &NodeConfig) -> anyhow::Result<()> {
    let client = RpcClient::connect(&node.host)
        .await
        .with_context(|| format!("Failed to connect to daemon at {}", node.host))?;
    client
        .request("stop_service", None)
        .await
        .context("stop_service failed")?;
    info!("Daemon at {} is stopping", node.host);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(default_config_path);
    let node = NodeConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    let _guard = setup_logging(&node);

    if args.stop {
        return stop_running_daemon(&node).await;
    }

    info!(
        "Starting streamd {} with {}",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );
    streamd_daemon::run(node).await?;
    info!("streamd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_writes_to_log_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let log_path = dir.path().join("streamd.log");
        let node = NodeConfig {
            log_path: log_path.clone(),
            ..NodeConfig::default()
        };

        let guard = setup_logging(&node);
        assert!(guard.is_some());
        tracing::warn!("log file ready");
        drop(guard);

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("log file ready"));
    }
}
