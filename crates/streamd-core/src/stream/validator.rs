//! Field registry and validation of raw stream specs.
//!
//! Every known field binds to exactly one [`Rule`] and a [`Severity`]. A field
//! that breaks a `Warn` rule is logged and kept; breaking a `Fatal` rule
//! rejects the whole spec. Unknown fields are logged and ignored.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde_json::Value;
use tracing::warn;

use super::types::{RawStreamSpec, StreamType};

const TWELVE_DAYS_SECS: i64 = 12 * 24 * 3600;

pub const VIDEO_PARSERS: &[&str] = &["h264parse", "h265parse", "mpegvideoparse"];
pub const AUDIO_PARSERS: &[&str] = &["aacparse", "ac3parse", "mpegaudioparse", "rawaudioparse"];
pub const VIDEO_ENCODERS: &[&str] = &[
    "eavcenc",
    "openh264enc",
    "x264enc",
    "nvh264enc",
    "nvh265enc",
    "vaapih264enc",
    "vaapimpeg2enc",
    "mfxh264enc",
    "x265enc",
    "msdkh264enc",
];
pub const AUDIO_ENCODERS: &[&str] = &["lamemp3enc", "faac", "voaacenc"];

/// Field-name prefixes whose values form the encoder parameter bag.
pub const ENCODER_PARAM_PREFIXES: &[&str] = &[
    "x264enc.",
    "nvh264enc.",
    "nvh265enc.",
    "mfxh264enc.",
    "vaapih264enc.",
    "openh264enc.",
    "eavcenc.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    Fatal,
}

/// Outcome of checking one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
    Fatal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    IntRange { min: i64, max: i64 },
    FloatRange { min: f64, max: f64 },
    IntSet(&'static [i64]),
    StrSet(&'static [&'static str]),
    Path,
    Integer,
    NonEmptyString,
    Array,
    Bool,
    /// `<width>x<height>`
    Size,
    /// `<num>:<den>`
    Ratio,
    Any,
}

impl Rule {
    /// Whether `value` satisfies this rule.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Rule::IntRange { min, max } => {
                value.as_i64().is_some_and(|n| (*min..=*max).contains(&n))
            }
            Rule::FloatRange { min, max } => {
                value.as_f64().is_some_and(|n| (*min..=*max).contains(&n))
            }
            Rule::IntSet(allowed) => value.as_i64().is_some_and(|n| allowed.contains(&n)),
            Rule::StrSet(allowed) => value.as_str().is_some_and(|s| allowed.contains(&s)),
            Rule::Path => value.as_str().is_some_and(is_valid_path),
            Rule::Integer => value.as_i64().is_some(),
            Rule::NonEmptyString => value.as_str().is_some_and(|s| !s.is_empty()),
            Rule::Array => value.is_array(),
            Rule::Bool => value.is_boolean(),
            Rule::Size => value.as_str().is_some_and(|s| parse_pair(s, 'x').is_some()),
            Rule::Ratio => value
                .as_str()
                .and_then(|s| parse_pair(s, ':'))
                .is_some_and(|(_, den)| den != 0),
            Rule::Any => true,
        }
    }
}

/// Absolute path without NUL bytes.
#[must_use]
pub fn is_valid_path(path: &str) -> bool {
    path.starts_with('/') && !path.contains('\0')
}

/// Split `"<a><sep><b>"` into two unsigned integers.
#[must_use]
pub fn parse_pair(s: &str, sep: char) -> Option<(u32, u32)> {
    let (a, b) = s.split_once(sep)?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub rule: Rule,
    pub severity: Severity,
}

impl FieldRule {
    #[must_use]
    pub fn evaluate(&self, value: &Value) -> Validity {
        if self.rule.accepts(value) {
            return Validity::Valid;
        }
        // A path of the wrong JSON type is only a warning even for fatal paths.
        if self.rule == Rule::Path && !value.is_string() {
            return Validity::Invalid;
        }
        match self.severity {
            Severity::Warn => Validity::Invalid,
            Severity::Fatal => Validity::Fatal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Field '{0}' registered twice")]
pub struct DuplicateField(pub &'static str);

/// A fatal field violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid value '{value}' of option '{key}'")]
pub struct ValidationError {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Default)]
pub struct FieldRegistryBuilder {
    fields: HashMap<&'static str, FieldRule>,
}

impl FieldRegistryBuilder {
    /// # Errors
    ///
    /// Returns `DuplicateField` if `name` is already registered.
    pub fn field(
        mut self,
        name: &'static str,
        rule: Rule,
        severity: Severity,
    ) -> Result<Self, DuplicateField> {
        if self.fields.contains_key(name) {
            return Err(DuplicateField(name));
        }
        self.fields.insert(name, FieldRule { rule, severity });
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns `DuplicateField` if `name` is already registered.
    pub fn warn(self, name: &'static str, rule: Rule) -> Result<Self, DuplicateField> {
        self.field(name, rule, Severity::Warn)
    }

    /// # Errors
    ///
    /// Returns `DuplicateField` if `name` is already registered.
    pub fn fatal(self, name: &'static str, rule: Rule) -> Result<Self, DuplicateField> {
        self.field(name, rule, Severity::Fatal)
    }

    #[must_use]
    pub fn build(self) -> FieldRegistry {
        FieldRegistry {
            fields: self.fields,
        }
    }
}

#[derive(Debug)]
pub struct FieldRegistry {
    fields: HashMap<&'static str, FieldRule>,
}

static BUILTIN: LazyLock<FieldRegistry> = LazyLock::new(|| {
    builtin_fields()
        .map(FieldRegistryBuilder::build)
        .expect("builtin field registry has a duplicate entry")
});

impl FieldRegistry {
    #[must_use]
    pub fn builder() -> FieldRegistryBuilder {
        FieldRegistryBuilder::default()
    }

    /// The registry of every field a stream spec may carry.
    ///
    /// # Panics
    ///
    /// Panics on first use if the builtin table registers a field twice.
    #[must_use]
    pub fn builtin() -> &'static FieldRegistry {
        &BUILTIN
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldRule> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check every field of `spec`, logging warnings for invalid and unknown
    /// fields.
    ///
    /// # Errors
    ///
    /// Returns the first field whose rule is violated with fatal severity.
    pub fn validate(&self, spec: &RawStreamSpec) -> Result<(), ValidationError> {
        for (key, value) in spec.iter() {
            let Some(rule) = self.get(key) else {
                warn!("Unknown option: {key}");
                continue;
            };
            match rule.evaluate(value) {
                Validity::Valid => {}
                Validity::Invalid => warn!("Invalid value '{}' of option '{key}'", display(value)),
                Validity::Fatal => {
                    return Err(ValidationError {
                        key: key.clone(),
                        value: display(value),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Validate against the builtin registry.
///
/// # Errors
///
/// Returns the first fatal field violation.
pub fn validate(spec: &RawStreamSpec) -> Result<(), ValidationError> {
    FieldRegistry::builtin().validate(spec)
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn builtin_fields() -> Result<FieldRegistryBuilder, DuplicateField> {
    let non_negative = || Rule::IntRange { min: 0, max: i64::MAX };
    let int_range = |min, max| Rule::IntRange { min, max };

    let builder = FieldRegistry::builder()
        .warn("id", Rule::NonEmptyString)?
        .fatal("type", int_range(StreamType::MIN, StreamType::MAX))?
        .warn("feedback_directory", Rule::Path)?
        .warn("data_directory", Rule::Path)?
        .warn("log_level", int_range(0, 7))?
        .warn("streamlink_path", Rule::Any)?
        .warn("input", Rule::Array)?
        .warn("output", Rule::Array)?
        .warn("restart_attempts", int_range(1, i64::from(i32::MAX)))?
        .warn("auto_exit_time", non_negative())?
        .fatal("timeshift_dir", Rule::Path)?
        .warn("timeshift_chunk_life_time", int_range(0, TWELVE_DAYS_SECS))?
        .warn("timeshift_delay", int_range(0, TWELVE_DAYS_SECS))?
        .warn("timeshift_chunk_duration", non_negative())?
        .warn("main_profile", Rule::Any)?
        .warn("main_profile_external", Rule::Any)?
        .warn("volume", Rule::FloatRange { min: 0.0, max: 10.0 })?
        .warn("delay_time", non_negative())?
        .warn("video_parser", Rule::StrSet(VIDEO_PARSERS))?
        .warn("audio_parser", Rule::StrSet(AUDIO_PARSERS))?
        .warn("video_codec", Rule::StrSet(VIDEO_ENCODERS))?
        .warn("audio_codec", Rule::StrSet(AUDIO_ENCODERS))?
        .warn("have_video", Rule::Any)?
        .warn("have_audio", Rule::Any)?
        .warn("have_subtitle", Rule::Any)?
        .warn("deinterlace", Rule::Any)?
        .warn("relay_audio", Rule::Any)?
        .warn("relay_video", Rule::Any)?
        .warn("loop", Rule::Any)?
        .warn("logo", Rule::Any)?
        .warn("rsvg_logo", Rule::Any)?
        .warn("size", Rule::Size)?
        .warn("aspect_ratio", Rule::Ratio)?
        .warn("cleanup_ts", Rule::Bool)?
        .warn("framerate", non_negative())?
        .warn("video_bitrate", non_negative())?
        .warn("audio_bitrate", non_negative())?
        .warn("audio_channels", non_negative())?
        .warn("audio_select", Rule::Integer)?
        .warn("decklink_video_mode", int_range(0, 30))?
        .warn("tsdemux.program-number", Rule::Any)?;

    encoder_fields(builder)
}

fn encoder_fields(builder: FieldRegistryBuilder) -> Result<FieldRegistryBuilder, DuplicateField> {
    let non_negative = || Rule::IntRange { min: 0, max: i64::MAX };
    let int_range = |min, max| Rule::IntRange { min, max };

    let mut builder = builder
        .warn("nvh264enc.preset", non_negative())?
        .warn("nvh265enc.preset", non_negative())?
        .warn("mfxh264enc.preset", int_range(0, 7))?
        .warn("mfxh264enc.gop-size", int_range(0, 65535))?
        .warn("x264enc.speed-preset", int_range(0, 10))?
        .warn("x264enc.threads", non_negative())?
        .warn("x264enc.tune", Rule::IntSet(&[0, 1, 2, 4]))?
        .warn("x264enc.key-int-max", non_negative())?
        .warn("x264enc.vbv-buf-capacity", int_range(0, 10000))?
        .warn("x264enc.rc-lookahead", int_range(0, 250))?
        .warn("x264enc.qp-max", int_range(0, 51))?
        .warn("x264enc.pass", Rule::IntSet(&[0, 4, 5, 17, 18, 19]))?
        .warn("x264enc.me", int_range(0, 4))?
        .warn("x264enc.profile", Rule::NonEmptyString)?
        .warn("x264enc.stream-format", Rule::NonEmptyString)?
        .warn("vaapih264enc.keyframe-period", int_range(0, 300))?
        .warn("vaapih264enc.tune", Rule::IntSet(&[0, 1, 3]))?
        .warn("vaapih264enc.max-bframes", int_range(0, 10))?
        .warn("vaapih264enc.num-slices", int_range(1, 200))?
        .warn("vaapih264enc.init-qp", int_range(1, 51))?
        .warn("vaapih264enc.min-qp", int_range(1, 51))?
        .warn("vaapih264enc.rate-control", Rule::IntSet(&[1, 2, 4, 5]))?
        .warn("vaapih264enc.cpb-length", int_range(0, 10000))?;

    for name in [
        "x264enc.option-string",
        "x264enc.interlaced",
        "x264enc.dct8x8",
        "x264enc.b-adapt",
        "x264enc.byte-stream",
        "x264enc.cabac",
        "x264enc.sliced-threads",
        "x264enc.quantizer",
        "vaapih264enc.cabac",
        "vaapih264enc.dct8x8",
        "openh264enc.multi-thread",
        "eavcenc.gop-adaptive",
    ] {
        builder = builder.warn(name, Rule::Any)?;
    }

    for name in [
        "openh264enc.complexity",
        "openh264enc.rate-control",
        "openh264enc.gop-size",
        "eavcenc.preset",
        "eavcenc.profile",
        "eavcenc.performance",
        "eavcenc.bitrate-mode",
        "eavcenc.bitrate-pass",
        "eavcenc.bitrate-max",
        "eavcenc.vbv-size",
        "eavcenc.picture-mode",
        "eavcenc.entropy-mode",
        "eavcenc.gop-max-bcount",
        "eavcenc.gop-max-length",
        "eavcenc.gop-min-length",
        "eavcenc.level",
        "eavcenc.deblock-mode",
        "eavcenc.deblock-alpha",
        "eavcenc.deblock-beta",
        "eavcenc.initial-delay",
        "eavcenc.field-order",
    ] {
        builder = builder.warn(name, Rule::Integer)?;
    }

    Ok(builder)
}
