use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_LOG_PATH: &str = "/dev/null";
pub const DEFAULT_HOST: &str = "127.0.0.1:6317";
pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1:8000";
pub const DEFAULT_VODS_HOST: &str = "127.0.0.1:7000";
pub const DEFAULT_CODS_HOST: &str = "127.0.0.1:6001";
pub const DEFAULT_CODS_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_FILES_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_STREAMLINK_PATH: &str = "/usr/local/bin/streamlink";
pub const DEFAULT_WORKER_PATH: &str = "streamd-worker";

const KNOWN_KEYS: &[&str] = &[
    "log_path",
    "log_level",
    "host",
    "http_host",
    "vods_host",
    "cods_host",
    "cods_ttl",
    "files_ttl",
    "streamlink_path",
    "worker_path",
    "license_key",
];

/// Syslog-style severity names accepted in the node config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Emerg,
    Alert,
    Crit,
    Error,
    Warning,
    Notice,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Matching `tracing` level name for an `EnvFilter` directive.
    #[must_use]
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Emerg | LogLevel::Alert | LogLevel::Crit | LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Notice | LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let level = match s.trim().to_ascii_uppercase().as_str() {
            "EMERG" | "EMERGENCY" => LogLevel::Emerg,
            "ALERT" => LogLevel::Alert,
            "CRIT" | "CRITICAL" => LogLevel::Crit,
            "ERR" | "ERROR" => LogLevel::Error,
            "WARNING" | "WARN" => LogLevel::Warning,
            "NOTICE" => LogLevel::Notice,
            "INFO" => LogLevel::Info,
            "DEBUG" => LogLevel::Debug,
            other => return Err(Error::Config(format!("Unknown log level: {other}"))),
        };
        Ok(level)
    }
}

/// Node settings, read once at startup from a `key=value` file.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub log_path: PathBuf,
    pub log_level: LogLevel,
    /// Control listener `host:port`
    pub host: String,
    pub http_host: String,
    pub vods_host: String,
    pub cods_host: String,
    pub cods_ttl: Duration,
    pub files_ttl: Duration,
    pub streamlink_path: PathBuf,
    /// Worker executable, optionally followed by arguments
    pub worker_path: String,
    /// `None` when the configured key does not decode
    pub license_key: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            log_level: LogLevel::default(),
            host: DEFAULT_HOST.to_string(),
            http_host: DEFAULT_HTTP_HOST.to_string(),
            vods_host: DEFAULT_VODS_HOST.to_string(),
            cods_host: DEFAULT_CODS_HOST.to_string(),
            cods_ttl: DEFAULT_CODS_TTL,
            files_ttl: DEFAULT_FILES_TTL,
            streamlink_path: PathBuf::from(DEFAULT_STREAMLINK_PATH),
            worker_path: DEFAULT_WORKER_PATH.to_string(),
            license_key: None,
        }
    }
}

impl NodeConfig {
    /// Load the node config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or has no `license_key`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Parse `key=value` lines. Blank lines and `#` comments are skipped,
    /// unknown keys and unusable values are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `license_key` is missing.
    pub fn parse(content: &str, source: &str) -> Result<Self> {
        let mut config = Self::default();
        let mut license_seen = false;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').unwrap_or((line, ""));
            let (key, value) = (key.trim(), value.trim());

            match key {
                "log_path" => config.log_path = PathBuf::from(value),
                "log_level" => match value.parse() {
                    Ok(level) => config.log_level = level,
                    Err(e) => warn!("{source}: {e}, keeping {:?}", config.log_level),
                },
                "host" => set_host(&mut config.host, key, value, source),
                "http_host" => set_host(&mut config.http_host, key, value, source),
                "vods_host" => set_host(&mut config.vods_host, key, value, source),
                "cods_host" => set_host(&mut config.cods_host, key, value, source),
                "cods_ttl" => set_ttl(&mut config.cods_ttl, key, value, source),
                "files_ttl" => set_ttl(&mut config.files_ttl, key, value, source),
                "streamlink_path" => config.streamlink_path = PathBuf::from(value),
                "worker_path" if !value.is_empty() => config.worker_path = value.to_string(),
                "license_key" => {
                    license_seen = true;
                    if crate::license::expire_time(value).is_some() {
                        config.license_key = Some(value.to_string());
                    } else {
                        warn!("{source}: license_key does not decode");
                    }
                }
                _ if !KNOWN_KEYS.contains(&key) => {
                    warn!("Unknown config field in {source}: {key}");
                }
                _ => warn!("{source}: ignoring empty {key}"),
            }
        }

        if !license_seen {
            return Err(Error::Config(
                "license_key field in config required".to_string(),
            ));
        }
        Ok(config)
    }

    /// `Some(path)` when logs should also go to a file.
    #[must_use]
    pub fn log_file(&self) -> Option<&Path> {
        let path = self.log_path.as_path();
        (!path.as_os_str().is_empty() && path != Path::new(DEFAULT_LOG_PATH)).then_some(path)
    }
}

/// Accepts `host:port` with a numeric port.
fn is_host_and_port(value: &str) -> bool {
    value
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}

fn set_host(slot: &mut String, key: &str, value: &str, source: &str) {
    if is_host_and_port(value) {
        *slot = value.to_string();
    } else {
        warn!("{source}: invalid {key} '{value}', keeping {slot}");
    }
}

fn set_ttl(slot: &mut Duration, key: &str, value: &str, source: &str) {
    match value.parse::<u64>() {
        Ok(secs) if secs > 0 => *slot = Duration::from_secs(secs),
        _ => warn!("{source}: invalid {key} '{value}', keeping {}s", slot.as_secs()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::make_key;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn key() -> String {
        make_key(4_102_444_800_000)
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.cods_ttl, DEFAULT_CODS_TTL);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.log_file().is_none());
    }

    #[test]
    fn test_parse_full_file() {
        let content = format!(
            "# node settings\n\
             log_path=/var/log/streamd.log\n\
             log_level=DEBUG\n\
             host=0.0.0.0:6317\n\
             http_host=0.0.0.0:8000\n\
             vods_host=localhost:7000\n\
             cods_host=localhost:6001\n\
             cods_ttl=120\n\
             files_ttl=7200\n\
             streamlink_path=/opt/streamlink\n\
             worker_path=/usr/bin/streamd-worker --verbose\n\
             license_key={}\n",
            key()
        );
        let config = NodeConfig::parse(&content, "test").unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.host, "0.0.0.0:6317");
        assert_eq!(config.vods_host, "localhost:7000");
        assert_eq!(config.cods_ttl, Duration::from_secs(120));
        assert_eq!(config.files_ttl, Duration::from_secs(7200));
        assert_eq!(config.streamlink_path, PathBuf::from("/opt/streamlink"));
        assert_eq!(config.worker_path, "/usr/bin/streamd-worker --verbose");
        assert_eq!(config.license_key, Some(key()));
        assert_eq!(config.log_file(), Some(Path::new("/var/log/streamd.log")));
    }

    #[test]
    fn test_license_key_required() {
        let err = NodeConfig::parse("host=127.0.0.1:1\n", "test").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Config error: license_key field in config required"
        );
    }

    #[test]
    fn test_undecodable_license_kept_as_none() {
        let config = NodeConfig::parse("license_key=not-a-key\n", "test").unwrap();
        assert!(config.license_key.is_none());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let content = format!(
            "host=nonsense\ncods_ttl=-4\nfiles_ttl=0\nlog_level=LOUD\nmystery=1\nlicense_key={}\n",
            key()
        );
        let config = NodeConfig::parse(&content, "test").unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.cods_ttl, DEFAULT_CODS_TTL);
        assert_eq!(config.files_ttl, DEFAULT_FILES_TTL);
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_value_may_contain_equals() {
        let content = format!("streamlink_path=/opt/a=b\nlicense_key={}\n", key());
        let config = NodeConfig::parse(&content, "test").unwrap();
        assert_eq!(config.streamlink_path, PathBuf::from("/opt/a=b"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "cods_ttl=30").unwrap();
        writeln!(file, "license_key={}", key()).unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.cods_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_load_missing_file() {
        let err = NodeConfig::load(Path::new("/nonexistent/streamd.conf")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_log_level_names() {
        assert_eq!("err".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("Warning".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!(LogLevel::Crit.as_filter(), "error");
        assert_eq!(LogLevel::Notice.as_filter(), "info");
        assert!("verbose".parse::<LogLevel>().is_err());
    }
}
