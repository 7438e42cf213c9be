//! Raw spec to [`TypedConfig`].
//!
//! [`build`] is a pure function: it reads the spec, picks the variant for the
//! stream type and fills it. Optional fields of the wrong JSON type fall back
//! to their defaults; the validator has already warned about them.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::ConfigError;
use super::types::{InputUri, OutputUri, RawStreamSpec, StreamType, read_input, read_output};
use super::validator::{ENCODER_PARAM_PREFIXES, parse_pair};

pub const DEFAULT_RESTART_ATTEMPTS: NonZeroU32 = NonZeroU32::new(10).unwrap();
pub const DEFAULT_CHUNK_DURATION: NonZeroU32 = NonZeroU32::new(120).unwrap();
pub const DEFAULT_VIDEO_CODEC: &str = "x264enc";
pub const DEFAULT_AUDIO_CODEC: &str = "faac";

#[derive(Debug, Clone, PartialEq)]
pub struct BaseConfig {
    pub stream_type: StreamType,
    pub max_restart_attempts: NonZeroU32,
    pub input: Vec<InputUri>,
    pub output: Vec<OutputUri>,
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AvConfig {
    pub base: BaseConfig,
    pub have_video: bool,
    pub have_audio: bool,
    pub have_subtitle: bool,
    pub audio_select: Option<i64>,
    pub looped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub av: AvConfig,
    pub video_parser: Option<String>,
    pub audio_parser: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratio {
    pub num: u32,
    pub den: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Logo {
    pub path: String,
    #[serde(default)]
    pub position: Point,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: Option<Size>,
}

fn default_alpha() -> f64 {
    1.0
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<Option<Size>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Raw {
        width: u32,
        height: u32,
    }
    let raw = Option::<Raw>::deserialize(deserializer)?;
    Ok(raw.map(|r| Size {
        width: r.width,
        height: r.height,
    }))
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeConfig {
    pub av: AvConfig,
    pub relay_audio: bool,
    pub relay_video: bool,
    pub deinterlace: bool,
    pub frame_rate: Option<u32>,
    pub volume: Option<f64>,
    pub video_codec: String,
    pub audio_codec: String,
    pub audio_channels: Option<u32>,
    pub size: Option<Size>,
    pub video_bitrate: Option<u32>,
    pub audio_bitrate: Option<u32>,
    pub logo: Option<Logo>,
    pub rsvg_logo: Option<Logo>,
    pub aspect_ratio: Option<Ratio>,
    pub decklink_video_mode: Option<i64>,
    pub encoder_args: BTreeMap<String, i64>,
    pub encoder_str_args: BTreeMap<String, String>,
}

/// Immutable, pipeline-ready configuration of one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedConfig {
    Screen(AvConfig),
    Relay(RelayConfig),
    VodRelay {
        relay: RelayConfig,
        cleanup_ts: bool,
    },
    Encode(EncodeConfig),
    VodEncode {
        encode: EncodeConfig,
        cleanup_ts: bool,
    },
    Timeshift {
        relay: RelayConfig,
        chunk_duration: NonZeroU32,
    },
}

impl TypedConfig {
    #[must_use]
    pub fn av(&self) -> &AvConfig {
        match self {
            TypedConfig::Screen(av) => av,
            TypedConfig::Relay(relay)
            | TypedConfig::VodRelay { relay, .. }
            | TypedConfig::Timeshift { relay, .. } => &relay.av,
            TypedConfig::Encode(encode) | TypedConfig::VodEncode { encode, .. } => &encode.av,
        }
    }

    #[must_use]
    pub fn base(&self) -> &BaseConfig {
        &self.av().base
    }

    #[must_use]
    pub fn stream_type(&self) -> StreamType {
        self.base().stream_type
    }

    /// Whether stale chunks of an on-demand output are removed on exit.
    #[must_use]
    pub fn cleanup_ts(&self) -> bool {
        matches!(
            self,
            TypedConfig::VodRelay { cleanup_ts: true, .. }
                | TypedConfig::VodEncode { cleanup_ts: true, .. }
        )
    }
}

/// Build the typed configuration for `spec`.
///
/// # Errors
///
/// Fails when `type`, `input` or `output` is missing or malformed, for proxy
/// stream types, and for a non-positive `restart_attempts` or timeshift
/// chunk duration.
pub fn build(spec: &RawStreamSpec) -> Result<TypedConfig, ConfigError> {
    let raw_type = spec.get_i64("type").ok_or(ConfigError::Missing("type"))?;
    let stream_type = StreamType::from_i64(raw_type).ok_or(ConfigError::UnknownType(raw_type))?;
    if stream_type.is_proxy() {
        return Err(ConfigError::ProxyUnsupported);
    }

    let input = read_input(spec).ok_or(ConfigError::Missing("input"))?;
    let output = read_output(spec).ok_or(ConfigError::Missing("output"))?;

    let max_restart_attempts = match spec.get_i64("restart_attempts") {
        None => DEFAULT_RESTART_ATTEMPTS,
        Some(n) => u32::try_from(n)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or(ConfigError::InvalidRestartAttempts(n))?,
    };

    let ttl = spec
        .get("auto_exit_time")
        .and_then(Value::as_u64)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);

    let av = AvConfig {
        base: BaseConfig {
            stream_type,
            max_restart_attempts,
            input,
            output,
            ttl,
        },
        have_video: spec.get_bool("have_video").unwrap_or(true),
        have_audio: spec.get_bool("have_audio").unwrap_or(true),
        have_subtitle: spec.get_bool("have_subtitle").unwrap_or(false),
        audio_select: spec.get_i64("audio_select"),
        looped: spec.get_bool("loop").unwrap_or(false),
    };

    let config = match stream_type {
        StreamType::Screen => TypedConfig::Screen(av),
        StreamType::Relay
        | StreamType::TimeshiftPlayer
        | StreamType::TestLife
        | StreamType::CodRelay => TypedConfig::Relay(relay_config(spec, av)),
        StreamType::VodRelay => TypedConfig::VodRelay {
            relay: relay_config(spec, av),
            cleanup_ts: spec.get_bool("cleanup_ts").unwrap_or(false),
        },
        StreamType::Encode | StreamType::CodEncode | StreamType::Event => {
            TypedConfig::Encode(encode_config(spec, av))
        }
        StreamType::VodEncode => TypedConfig::VodEncode {
            encode: encode_config(spec, av),
            cleanup_ts: spec.get_bool("cleanup_ts").unwrap_or(false),
        },
        StreamType::TimeshiftRecorder | StreamType::Catchup => {
            let chunk_duration = match spec.get_i64("timeshift_chunk_duration") {
                None => DEFAULT_CHUNK_DURATION,
                Some(secs) => u32::try_from(secs)
                    .ok()
                    .and_then(NonZeroU32::new)
                    .ok_or(ConfigError::InvalidChunkDuration(secs))?,
            };
            TypedConfig::Timeshift {
                relay: relay_config(spec, av),
                chunk_duration,
            }
        }
        StreamType::Proxy | StreamType::VodProxy => return Err(ConfigError::ProxyUnsupported),
    };

    Ok(config)
}

fn relay_config(spec: &RawStreamSpec, av: AvConfig) -> RelayConfig {
    RelayConfig {
        av,
        video_parser: spec.get_str("video_parser").map(str::to_string),
        audio_parser: spec.get_str("audio_parser").map(str::to_string),
    }
}

fn get_u32(spec: &RawStreamSpec, key: &str) -> Option<u32> {
    spec.get_i64(key).and_then(|n| u32::try_from(n).ok())
}

fn get_logo(spec: &RawStreamSpec, key: &str) -> Option<Logo> {
    let value = spec.get(key)?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

fn encode_config(spec: &RawStreamSpec, av: AvConfig) -> EncodeConfig {
    let (encoder_args, encoder_str_args) = encoder_params(spec);
    EncodeConfig {
        av,
        relay_audio: spec.get_bool("relay_audio").unwrap_or(false),
        relay_video: spec.get_bool("relay_video").unwrap_or(false),
        deinterlace: spec.get_bool("deinterlace").unwrap_or(false),
        frame_rate: get_u32(spec, "framerate"),
        volume: spec.get_f64("volume"),
        video_codec: spec
            .get_str("video_codec")
            .unwrap_or(DEFAULT_VIDEO_CODEC)
            .to_string(),
        audio_codec: spec
            .get_str("audio_codec")
            .unwrap_or(DEFAULT_AUDIO_CODEC)
            .to_string(),
        audio_channels: get_u32(spec, "audio_channels"),
        size: spec
            .get_str("size")
            .and_then(|s| parse_pair(s, 'x'))
            .map(|(width, height)| Size { width, height }),
        video_bitrate: get_u32(spec, "video_bitrate"),
        audio_bitrate: get_u32(spec, "audio_bitrate"),
        logo: get_logo(spec, "logo"),
        rsvg_logo: get_logo(spec, "rsvg_logo"),
        aspect_ratio: spec
            .get_str("aspect_ratio")
            .and_then(|s| parse_pair(s, ':'))
            .filter(|(_, den)| *den != 0)
            .map(|(num, den)| Ratio { num, den }),
        decklink_video_mode: spec.get_i64("decklink_video_mode"),
        encoder_args,
        encoder_str_args,
    }
}

/// Copy every encoder-prefixed field: integers and `true` flags into the
/// integer bag, strings into the string bag.
fn encoder_params(spec: &RawStreamSpec) -> (BTreeMap<String, i64>, BTreeMap<String, String>) {
    let mut ints = BTreeMap::new();
    let mut strs = BTreeMap::new();

    let encoder_fields = spec
        .iter()
        .filter(|(key, _)| ENCODER_PARAM_PREFIXES.iter().any(|p| key.starts_with(p)));
    for (key, value) in encoder_fields {
        match value {
            Value::Number(n) => {
                if let Some(n) = n.as_i64() {
                    ints.insert(key.clone(), n);
                }
            }
            Value::Bool(true) => {
                ints.insert(key.clone(), 1);
            }
            Value::String(s) => {
                strs.insert(key.clone(), s.clone());
            }
            _ => {}
        }
    }

    (ints, strs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: Value) -> RawStreamSpec {
        RawStreamSpec::from_value(value).unwrap()
    }

    fn relay_spec() -> Value {
        json!({
            "id": "s1",
            "type": 2,
            "input": ["rtmp://a"],
            "output": [],
        })
    }

    #[test]
    fn test_relay_with_no_outputs_builds() {
        let config = build(&spec(relay_spec())).unwrap();
        let TypedConfig::Relay(relay) = &config else {
            panic!("Expected relay config, got {config:?}");
        };
        assert_eq!(relay.av.base.input.len(), 1);
        assert!(relay.av.base.output.is_empty());
        assert_eq!(config.stream_type(), StreamType::Relay);
        assert_eq!(config.base().max_restart_attempts, DEFAULT_RESTART_ATTEMPTS);
        assert!(config.av().have_video);
        assert!(!config.av().have_subtitle);
    }

    #[test]
    fn test_proxy_types_rejected() {
        for ty in [0, 1] {
            let mut value = relay_spec();
            value["type"] = json!(ty);
            let err = build(&spec(value)).unwrap_err();
            assert_eq!(err.to_string(), "Proxy streams not handled for now");
        }
    }

    #[test]
    fn test_missing_type() {
        let err = build(&spec(json!({"input": [], "output": []}))).unwrap_err();
        assert_eq!(err.to_string(), "Define type variable and make it valid");
    }

    #[test]
    fn test_unknown_type() {
        let mut value = relay_spec();
        value["type"] = json!(99);
        assert!(matches!(
            build(&spec(value)),
            Err(ConfigError::UnknownType(99))
        ));
    }

    #[test]
    fn test_missing_input_or_output() {
        let err = build(&spec(json!({"type": 2, "output": []}))).unwrap_err();
        assert_eq!(err.to_string(), "Define input variable and make it valid");

        let err = build(&spec(json!({"type": 2, "input": {}}))).unwrap_err();
        assert_eq!(err.to_string(), "Define input variable and make it valid");

        let err = build(&spec(json!({"type": 2, "input": []}))).unwrap_err();
        assert_eq!(err.to_string(), "Define output variable and make it valid");
    }

    #[test]
    fn test_explicit_restart_attempts_override_default() {
        let mut value = relay_spec();
        value["restart_attempts"] = json!(3);
        let config = build(&spec(value)).unwrap();
        assert_eq!(config.base().max_restart_attempts.get(), 3);
    }

    #[test]
    fn test_non_positive_restart_attempts_rejected() {
        for bad in [0, -5] {
            let mut value = relay_spec();
            value["restart_attempts"] = json!(bad);
            assert!(matches!(
                build(&spec(value)),
                Err(ConfigError::InvalidRestartAttempts(n)) if n == bad
            ));
        }
    }

    #[test]
    fn test_ttl_from_auto_exit_time() {
        let mut value = relay_spec();
        value["auto_exit_time"] = json!(90);
        let config = build(&spec(value)).unwrap();
        assert_eq!(config.base().ttl, Some(Duration::from_secs(90)));

        let mut value = relay_spec();
        value["auto_exit_time"] = json!(0);
        assert_eq!(build(&spec(value)).unwrap().base().ttl, None);
    }

    #[test]
    fn test_timeshift_chunk_duration_never_zero() {
        let base = json!({
            "type": 5,
            "input": ["udp://a"],
            "output": [],
            "timeshift_dir": "/tmp/ts",
        });

        let config = build(&spec(base.clone())).unwrap();
        match config {
            TypedConfig::Timeshift { chunk_duration, .. } => {
                assert_eq!(chunk_duration, DEFAULT_CHUNK_DURATION);
            }
            other => panic!("Expected timeshift config, got {other:?}"),
        }

        let mut zero = base.clone();
        zero["timeshift_chunk_duration"] = json!(0);
        assert!(matches!(
            build(&spec(zero)),
            Err(ConfigError::InvalidChunkDuration(0))
        ));

        let mut negative = base.clone();
        negative["timeshift_chunk_duration"] = json!(-5);
        let err = build(&spec(negative)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "timeshift_chunk_duration must be positive, got -5"
        );

        let mut catchup = base;
        catchup["type"] = json!(6);
        catchup["timeshift_chunk_duration"] = json!(30);
        match build(&spec(catchup)).unwrap() {
            TypedConfig::Timeshift { chunk_duration, .. } => assert_eq!(chunk_duration.get(), 30),
            other => panic!("Expected timeshift config, got {other:?}"),
        }
    }

    #[test]
    fn test_vod_relay_cleanup_flag() {
        let value = json!({
            "type": 8,
            "input": ["http://origin/a.m3u8"],
            "output": [],
            "cleanup_ts": true,
            "audio_parser": "aacparse",
        });
        let config = build(&spec(value)).unwrap();
        assert!(config.cleanup_ts());
        let TypedConfig::VodRelay { relay, .. } = config else {
            panic!("Expected VOD relay");
        };
        assert_eq!(relay.audio_parser.as_deref(), Some("aacparse"));
    }

    #[test]
    fn test_screen_config() {
        let value = json!({"type": 13, "input": [], "output": [], "loop": true});
        let config = build(&spec(value)).unwrap();
        assert!(matches!(config, TypedConfig::Screen(_)));
        assert!(config.av().looped);
    }

    #[test]
    fn test_encode_config_fields() {
        let value = json!({
            "type": 3,
            "input": ["udp://a"],
            "output": [],
            "video_codec": "nvh264enc",
            "size": "1280x720",
            "aspect_ratio": "16:9",
            "video_bitrate": 4_000_000,
            "volume": 1.5,
            "deinterlace": true,
            "logo": {"path": "file:///logo.png", "position": {"x": 10, "y": 20}, "alpha": 0.5},
            "rsvg_logo": "not-an-object",
        });
        let TypedConfig::Encode(encode) = build(&spec(value)).unwrap() else {
            panic!("Expected encode config");
        };
        assert_eq!(encode.video_codec, "nvh264enc");
        assert_eq!(encode.audio_codec, DEFAULT_AUDIO_CODEC);
        assert_eq!(encode.size, Some(Size { width: 1280, height: 720 }));
        assert_eq!(encode.aspect_ratio, Some(Ratio { num: 16, den: 9 }));
        assert_eq!(encode.video_bitrate, Some(4_000_000));
        assert_eq!(encode.volume, Some(1.5));
        assert!(encode.deinterlace);
        let logo = encode.logo.unwrap();
        assert_eq!(logo.position, Point { x: 10, y: 20 });
        assert!((logo.alpha - 0.5).abs() < f64::EPSILON);
        assert!(encode.rsvg_logo.is_none());
    }

    #[test]
    fn test_encoder_parameter_bag() {
        let value = json!({
            "type": 11,
            "input": ["udp://a"],
            "output": [],
            "x264enc.speed-preset": 3,
            "x264enc.profile": "high",
            "x264enc.interlaced": true,
            "x264enc.dct8x8": false,
            "eavcenc.gop-adaptive": true,
            "vaapih264enc.future-knob": 9,
            "tsdemux.program-number": 4,
        });
        let TypedConfig::Encode(encode) = build(&spec(value)).unwrap() else {
            panic!("Expected encode config");
        };
        assert_eq!(encode.encoder_args.get("x264enc.speed-preset"), Some(&3));
        assert_eq!(encode.encoder_args.get("x264enc.interlaced"), Some(&1));
        assert_eq!(encode.encoder_args.get("eavcenc.gop-adaptive"), Some(&1));
        assert_eq!(
            encode.encoder_args.get("vaapih264enc.future-knob"),
            Some(&9),
        );
        assert!(!encode.encoder_args.contains_key("x264enc.dct8x8"));
        assert!(!encode.encoder_args.contains_key("tsdemux.program-number"));
        assert_eq!(
            encode.encoder_str_args.get("x264enc.profile").map(String::as_str),
            Some("high")
        );
    }

    #[test]
    fn test_vod_encode_variant() {
        let value = json!({"type": 9, "input": [], "output": [], "cleanup_ts": false});
        let config = build(&spec(value)).unwrap();
        assert!(matches!(
            config,
            TypedConfig::VodEncode { cleanup_ts: false, .. }
        ));
        assert!(!config.cleanup_ts());
    }
}
