use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use url::Url;

/// Stream archetype, encoded on the wire as its integer discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Proxy = 0,
    VodProxy = 1,
    Relay = 2,
    Encode = 3,
    TimeshiftPlayer = 4,
    TimeshiftRecorder = 5,
    Catchup = 6,
    TestLife = 7,
    VodRelay = 8,
    VodEncode = 9,
    CodRelay = 10,
    CodEncode = 11,
    Event = 12,
    Screen = 13,
}

impl StreamType {
    pub const MIN: i64 = StreamType::Proxy as i64;
    pub const MAX: i64 = StreamType::Screen as i64;

    #[must_use]
    pub fn from_i64(value: i64) -> Option<Self> {
        let ty = match value {
            0 => Self::Proxy,
            1 => Self::VodProxy,
            2 => Self::Relay,
            3 => Self::Encode,
            4 => Self::TimeshiftPlayer,
            5 => Self::TimeshiftRecorder,
            6 => Self::Catchup,
            7 => Self::TestLife,
            8 => Self::VodRelay,
            9 => Self::VodEncode,
            10 => Self::CodRelay,
            11 => Self::CodEncode,
            12 => Self::Event,
            13 => Self::Screen,
            _ => return None,
        };
        Some(ty)
    }

    #[must_use]
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    #[must_use]
    pub fn is_proxy(self) -> bool {
        matches!(self, Self::Proxy | Self::VodProxy)
    }

    #[must_use]
    pub fn is_vod(self) -> bool {
        matches!(self, Self::VodRelay | Self::VodEncode)
    }

    #[must_use]
    pub fn is_cod(self) -> bool {
        matches!(self, Self::CodRelay | Self::CodEncode)
    }

    /// Recorder types write into `timeshift_dir` instead of outputs.
    #[must_use]
    pub fn records_timeshift(self) -> bool {
        matches!(self, Self::TimeshiftRecorder | Self::Catchup)
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Proxy => "PROXY",
            Self::VodProxy => "VOD_PROXY",
            Self::Relay => "RELAY",
            Self::Encode => "ENCODE",
            Self::TimeshiftPlayer => "TIMESHIFT_PLAYER",
            Self::TimeshiftRecorder => "TIMESHIFT_RECORDER",
            Self::Catchup => "CATCHUP",
            Self::TestLife => "TEST_LIFE",
            Self::VodRelay => "VOD_RELAY",
            Self::VodEncode => "VOD_ENCODE",
            Self::CodRelay => "COD_RELAY",
            Self::CodEncode => "COD_ENCODE",
            Self::Event => "EVENT",
            Self::Screen => "SCREEN",
        };
        f.write_str(name)
    }
}

/// Untyped stream description as received from the control connection.
///
/// The pipeline never mutates a spec in place; [`RawStreamSpec::with_field`]
/// returns a modified copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawStreamSpec(Map<String, Value>);

impl RawStreamSpec {
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Wrap a JSON value; `None` unless it is an object.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// The `id` field when it is a non-empty string.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.get_str("id").filter(|id| !id.is_empty())
    }

    #[must_use]
    pub fn stream_type(&self) -> Option<StreamType> {
        self.get_i64("type").and_then(StreamType::from_i64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    #[must_use]
    pub fn with_field(&self, key: impl Into<String>, value: Value) -> Self {
        let mut fields = self.0.clone();
        fields.insert(key.into(), value);
        Self(fields)
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// Input entries are objects; a bare string is accepted as a URI with the
/// entry's position as id.
#[derive(Deserialize)]
#[serde(untagged)]
enum UriEntry<T> {
    Full(T),
    Bare(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputUri {
    #[serde(default)]
    pub id: u64,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_link: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputUri {
    #[serde(default)]
    pub id: u64,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hls_type: Option<String>,
}

impl OutputUri {
    #[must_use]
    pub fn url(&self) -> Option<Url> {
        Url::parse(&self.uri).ok()
    }

    #[must_use]
    pub fn is_http(&self) -> bool {
        self.url()
            .is_some_and(|u| matches!(u.scheme(), "http" | "https"))
    }

    /// Local path for `file://` outputs.
    #[must_use]
    pub fn file_path(&self) -> Option<PathBuf> {
        self.url()
            .filter(|u| u.scheme() == "file")
            .and_then(|u| u.to_file_path().ok())
    }

    /// `http_root` of an HTTP output, the directory lazy-start triggers key on.
    #[must_use]
    pub fn served_root(&self) -> Option<&Path> {
        if self.is_http() {
            self.http_root.as_deref()
        } else {
            None
        }
    }
}

trait FromBareUri {
    fn from_bare(id: u64, uri: String) -> Self;
}

impl FromBareUri for InputUri {
    fn from_bare(id: u64, uri: String) -> Self {
        Self {
            id,
            uri,
            user_agent: None,
            stream_link: None,
            proxy: None,
        }
    }
}

impl FromBareUri for OutputUri {
    fn from_bare(id: u64, uri: String) -> Self {
        Self {
            id,
            uri,
            http_root: None,
            hls_type: None,
        }
    }
}

/// Parse an `input`/`output` array. `None` when the field is absent or not an
/// array; entries that are neither objects with a `uri` nor strings are skipped.
fn read_uris<T>(spec: &RawStreamSpec, key: &str) -> Option<Vec<T>>
where
    T: FromBareUri + serde::de::DeserializeOwned,
{
    let entries = spec.get(key)?.as_array()?;
    let uris = entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            match serde_json::from_value::<UriEntry<T>>(entry.clone()).ok()? {
                UriEntry::Full(uri) => Some(uri),
                UriEntry::Bare(uri) => Some(T::from_bare(index as u64, uri)),
            }
        })
        .collect();
    Some(uris)
}

#[must_use]
pub fn read_input(spec: &RawStreamSpec) -> Option<Vec<InputUri>> {
    read_uris(spec, "input")
}

#[must_use]
pub fn read_output(spec: &RawStreamSpec) -> Option<Vec<OutputUri>> {
    read_uris(spec, "output")
}
