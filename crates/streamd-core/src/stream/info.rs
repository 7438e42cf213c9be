use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::ConfigError;
use super::types::{InputUri, OutputUri, RawStreamSpec, StreamType, read_input, read_output};

/// Log level handed to workers when the spec omits one (debug).
pub const DEFAULT_STREAM_LOG_LEVEL: i64 = 7;

/// Identity and filesystem layout of a stream, derived from its raw spec.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub id: String,
    pub stream_type: StreamType,
    pub input: Vec<InputUri>,
    pub output: Vec<OutputUri>,
    pub feedback_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_level: i64,
}

impl StreamInfo {
    /// Derive the identity of `spec` without touching the filesystem.
    ///
    /// # Errors
    ///
    /// Fails when `id`, `type`, `feedback_directory`, `data_directory` or
    /// `input` is absent or malformed.
    pub fn derive(spec: &RawStreamSpec) -> Result<Self, ConfigError> {
        let id = spec.id().ok_or(ConfigError::Missing("id"))?.to_string();
        let raw_type = spec.get_i64("type").ok_or(ConfigError::Missing("type"))?;
        let stream_type =
            StreamType::from_i64(raw_type).ok_or(ConfigError::UnknownType(raw_type))?;

        let feedback_dir = required_dir(spec, "feedback_directory")?;
        let data_dir = required_dir(spec, "data_directory")?;
        let log_level = spec
            .get_i64("log_level")
            .unwrap_or(DEFAULT_STREAM_LOG_LEVEL);
        let input = read_input(spec).ok_or(ConfigError::Missing("input"))?;
        let output = read_output(spec).unwrap_or_default();

        Ok(Self {
            id,
            stream_type,
            input,
            output,
            feedback_dir,
            data_dir,
            log_level,
        })
    }

    /// Derive the identity of `spec` and create its directories.
    ///
    /// The feedback and data directories are always created. With
    /// `check_folders`, the output side is prepared too: `timeshift_dir` for
    /// recorders, otherwise each HTTP output's `http_root` and each file
    /// output's parent directory.
    ///
    /// # Errors
    ///
    /// Fails when a required field is absent or a directory cannot be created.
    pub fn prepare(spec: &RawStreamSpec, check_folders: bool) -> Result<Self, ConfigError> {
        let mut info = Self::derive(spec)?;
        create_dir(&info.feedback_dir)?;
        create_dir(&info.data_dir)?;

        if check_folders {
            if info.stream_type.records_timeshift() {
                let timeshift_dir = required_dir(spec, "timeshift_dir")?;
                create_dir(&timeshift_dir)?;
            } else {
                info.output = read_output(spec).ok_or(ConfigError::Missing("output"))?;
                for out in &info.output {
                    prepare_output(out)?;
                }
            }
        }
        Ok(info)
    }

    /// Served roots of the HTTP outputs.
    pub fn served_roots(&self) -> impl Iterator<Item = &Path> {
        self.output.iter().filter_map(OutputUri::served_root)
    }
}

fn required_dir(spec: &RawStreamSpec, key: &'static str) -> Result<PathBuf, ConfigError> {
    spec.get_str(key)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .ok_or(ConfigError::Missing(key))
}

fn create_dir(path: &Path) -> Result<(), ConfigError> {
    fs::create_dir_all(path).map_err(|source| ConfigError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn prepare_output(out: &OutputUri) -> Result<(), ConfigError> {
    if out.is_http() {
        let root = out
            .http_root
            .as_deref()
            .ok_or(ConfigError::Missing("http_root"))?;
        debug!("Preparing http root {}", root.display());
        return create_dir(root);
    }
    if let Some(file) = out.file_path()
        && let Some(parent) = file.parent()
    {
        return create_dir(parent);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    fn spec(value: Value) -> RawStreamSpec {
        RawStreamSpec::from_value(value).unwrap()
    }

    fn base(dir: &Path) -> Value {
        json!({
            "id": "s1",
            "type": 2,
            "feedback_directory": dir.join("feedback").to_str().unwrap(),
            "data_directory": dir.join("data").to_str().unwrap(),
            "input": ["udp://a"],
            "output": [],
        })
    }

    #[test]
    fn test_prepare_creates_feedback_and_data() {
        let dir = TempDir::new().unwrap();
        let info = StreamInfo::prepare(&spec(base(dir.path())), true).unwrap();
        assert_eq!(info.id, "s1");
        assert_eq!(info.stream_type, StreamType::Relay);
        assert_eq!(info.log_level, DEFAULT_STREAM_LOG_LEVEL);
        assert!(dir.path().join("feedback").is_dir());
        assert!(dir.path().join("data").is_dir());
    }

    #[test]
    fn test_prepare_requires_identity_fields() {
        let dir = TempDir::new().unwrap();
        for key in ["id", "type", "feedback_directory", "data_directory", "input"] {
            let mut value = base(dir.path());
            value.as_object_mut().unwrap().remove(key);
            let err = StreamInfo::prepare(&spec(value), false).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("Define {key} variable and make it valid")
            );
        }
    }

    #[test]
    fn test_derive_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let info = StreamInfo::derive(&spec(base(dir.path()))).unwrap();
        assert_eq!(info.id, "s1");
        assert_eq!(info.feedback_dir, dir.path().join("feedback"));
        assert!(!dir.path().join("feedback").exists());
        assert!(!dir.path().join("data").exists());
    }

    #[test]
    fn test_prepare_http_output_creates_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("vods/s1");
        let mut value = base(dir.path());
        value["type"] = json!(8);
        value["output"] = json!([{
            "id": 0,
            "uri": "http://localhost:7000/s1/master.m3u8",
            "http_root": root.to_str().unwrap(),
        }]);

        let info = StreamInfo::prepare(&spec(value), true).unwrap();
        assert!(root.is_dir());
        assert_eq!(
            info.served_roots().collect::<Vec<_>>(),
            vec![root.as_path()],
        );
    }

    #[test]
    fn test_prepare_http_output_without_root_fails() {
        let dir = TempDir::new().unwrap();
        let mut value = base(dir.path());
        value["output"] = json!([{"id": 0, "uri": "http://localhost/a.m3u8"}]);
        let err = StreamInfo::prepare(&spec(value), true).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("http_root")));
    }

    #[test]
    fn test_prepare_without_check_skips_output_dirs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("never");
        let mut value = base(dir.path());
        value["output"] = json!([{
            "id": 0,
            "uri": "http://localhost/a.m3u8",
            "http_root": root.to_str().unwrap(),
        }]);

        let info = StreamInfo::prepare(&spec(value), false).unwrap();
        assert_eq!(info.output.len(), 1);
        assert!(!root.exists());
    }

    #[test]
    fn test_prepare_file_output_creates_parent() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("rec/out.ts");
        let mut value = base(dir.path());
        value["output"] = json!([format!("file://{}", target.display())]);

        StreamInfo::prepare(&spec(value), true).unwrap();
        assert!(dir.path().join("rec").is_dir());
    }

    #[test]
    fn test_prepare_timeshift_recorder() {
        let dir = TempDir::new().unwrap();
        let mut value = base(dir.path());
        value["type"] = json!(5);
        value.as_object_mut().unwrap().remove("output");

        let err = StreamInfo::prepare(&spec(value.clone()), true).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("timeshift_dir")));

        let ts_dir = dir.path().join("timeshift");
        value["timeshift_dir"] = json!(ts_dir.to_str().unwrap());
        StreamInfo::prepare(&spec(value), true).unwrap();
        assert!(ts_dir.is_dir());
    }
}
