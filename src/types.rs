//! Core data types shared by the registry, the dispatcher and the modules.
//!
//! - [`Sample`]: one timestamped measurement with an ordered list of [`Value`]s
//! - [`DataSet`] / [`DataSource`]: the schema a sample of a given type conforms to
//! - [`MetricDataPoint`]: a transient (name, value) pair used to derive samples
//! - [`Notification`] / [`CacheEvent`]: auxiliary broadcast payloads

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

// =============================================================================
// Constants
// =============================================================================

/// Maximum length of an identifier field, including the historical terminator slot.
pub const DATA_MAX_NAME_LEN: usize = 128;

/// Type name forced onto samples derived with percentage normalization.
pub const PERCENT_TYPE: &str = "percent";

/// Truncate `s` to at most `DATA_MAX_NAME_LEN - 1` bytes on a char boundary.
pub(crate) fn bounded(s: &str) -> String {
    let max = DATA_MAX_NAME_LEN - 1;
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// =============================================================================
// Values
// =============================================================================

/// Kind of a value slot in a [`DataSet`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[repr(u8)]
pub enum DsType {
    /// Monotonically increasing counter that may wrap.
    Counter = 0,
    /// Instantaneous reading.
    Gauge = 1,
    /// Signed rate-of-change source.
    Derive = 2,
    /// Counter reset on every read.
    Absolute = 3,
}

/// Error for a numeric store-kind code outside `0..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized store kind code {0}")]
pub struct UnknownDsType(pub u8);

impl TryFrom<u8> for DsType {
    type Error = UnknownDsType;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Counter),
            1 => Ok(Self::Gauge),
            2 => Ok(Self::Derive),
            3 => Ok(Self::Absolute),
            other => Err(UnknownDsType(other)),
        }
    }
}

/// One numeric value of a sample, tagged with its store kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    Counter(u64),
    Gauge(f64),
    Derive(i64),
    Absolute(u64),
}

impl Value {
    /// Store kind of this value.
    pub fn kind(&self) -> DsType {
        match self {
            Self::Counter(_) => DsType::Counter,
            Self::Gauge(_) => DsType::Gauge,
            Self::Derive(_) => DsType::Derive,
            Self::Absolute(_) => DsType::Absolute,
        }
    }

    /// Build a value of `kind` from a raw reading. Non-gauge kinds narrow the
    /// float with a saturating cast.
    pub fn from_raw(kind: DsType, raw: f64) -> Self {
        match kind {
            DsType::Gauge => Self::Gauge(raw),
            DsType::Counter => Self::Counter(raw as u64),
            DsType::Derive => Self::Derive(raw as i64),
            DsType::Absolute => Self::Absolute(raw as u64),
        }
    }

    /// Gauge reading, if this is a gauge.
    pub fn as_gauge(&self) -> Option<f64> {
        match self {
            Self::Gauge(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter(v) | Self::Absolute(v) => write!(f, "{v}"),
            Self::Derive(v) => write!(f, "{v}"),
            Self::Gauge(v) if v.is_nan() => f.write_str("nan"),
            Self::Gauge(v) => write!(f, "{v}"),
        }
    }
}

// =============================================================================
// Schema
// =============================================================================

/// One named, kinded slot of a [`DataSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    pub kind: DsType,
    /// Lower bound; `f64::NEG_INFINITY` when unbounded.
    pub min: f64,
    /// Upper bound; `f64::INFINITY` when unbounded.
    pub max: f64,
}

impl DataSource {
    pub fn new(name: impl Into<String>, kind: DsType, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            min,
            max,
        }
    }
}

/// Type definition: the ordered value slots a sample of `type_name` must carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSet {
    pub type_name: String,
    pub sources: Vec<DataSource>,
}

impl DataSet {
    pub fn new(type_name: impl Into<String>, sources: Vec<DataSource>) -> Self {
        Self {
            type_name: type_name.into(),
            sources,
        }
    }

    /// Number of value slots.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Resolves a type name to its schema.
pub trait SchemaLookup: Send + Sync {
    fn data_set(&self, type_name: &str) -> Option<Arc<DataSet>>;
}

// =============================================================================
// Samples
// =============================================================================

/// A timestamped measurement produced by a collector module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Producer (module) name, e.g. `"cpu"`.
    pub plugin: String,
    /// Producer instance label, e.g. `"0"`.
    pub plugin_instance: String,
    /// Type name used to resolve the schema.
    pub type_name: String,
    /// Type instance label, e.g. `"idle"`.
    pub type_instance: String,
    /// Measurement time; stamped by the dispatcher when unset.
    pub time: Option<DateTime<Utc>>,
    /// Sampling interval.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub values: Vec<Value>,
}

impl Sample {
    /// Create a sample for `plugin` of type `type_name` with no values.
    pub fn new(plugin: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            plugin_instance: String::new(),
            type_name: type_name.into(),
            type_instance: String::new(),
            time: None,
            interval: Duration::ZERO,
            values: Vec::new(),
        }
    }

    pub fn with_plugin_instance(mut self, instance: impl Into<String>) -> Self {
        self.plugin_instance = instance.into();
        self
    }

    pub fn with_type_instance(mut self, instance: impl Into<String>) -> Self {
        self.type_instance = instance.into();
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_values(mut self, values: Vec<Value>) -> Self {
        self.values = values;
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.values.push(value);
        self
    }

    /// Owned copy for the pipeline: identifiers bounded, time stamped if unset.
    pub(crate) fn clone_for_dispatch(&self, now: DateTime<Utc>) -> Self {
        Self {
            plugin: bounded(&self.plugin),
            plugin_instance: bounded(&self.plugin_instance),
            type_name: bounded(&self.type_name),
            type_instance: bounded(&self.type_instance),
            time: Some(self.time.unwrap_or(now)),
            interval: self.interval,
            values: self.values.clone(),
        }
    }

    /// Identifier in `plugin[-instance]/type[-instance]` form.
    pub fn identifier(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.plugin)?;
        if !self.plugin_instance.is_empty() {
            write!(f, "-{}", self.plugin_instance)?;
        }
        write!(f, "/{}", self.type_name)?;
        if !self.type_instance.is_empty() {
            write!(f, "-{}", self.type_instance)?;
        }
        Ok(())
    }
}

/// A (name, raw value) pair used to derive one single-value sample per point.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDataPoint {
    /// Becomes the derived sample's type instance.
    pub name: String,
    pub value: f64,
}

impl MetricDataPoint {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

// =============================================================================
// Notifications and cache events
// =============================================================================

/// Notification severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Failure,
    Warning,
    Okay,
}

/// Free-form notification broadcast to every module with the notify capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub severity: Severity,
    pub time: DateTime<Utc>,
    pub message: String,
    pub plugin: String,
    pub plugin_instance: String,
    pub type_name: String,
    pub type_instance: String,
}

impl Notification {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            time: Utc::now(),
            message: message.into(),
            plugin: String::new(),
            plugin_instance: String::new(),
            type_name: String::new(),
            type_instance: String::new(),
        }
    }

    /// Copy the identifier fields of `sample` into this notification.
    pub fn about(mut self, sample: &Sample) -> Self {
        self.plugin = sample.plugin.clone();
        self.plugin_instance = sample.plugin_instance.clone();
        self.type_name = sample.type_name.clone();
        self.type_instance = sample.type_instance.clone();
        self
    }
}

/// What happened to a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CacheEventKind {
    ValueNew,
    ValueUpdate,
    ValueExpired,
}

/// Cache event broadcast to every module with the notify capability.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    /// Cache key of the value.
    pub name: String,
    pub sample: Sample,
}
