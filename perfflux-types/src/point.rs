//! The metric point emitted by the perfdata parser.

use std::collections::BTreeMap;

/// Numeric fields of a point, keyed by slot name (`value`, `warn-min`, ...).
///
/// Values are kept as their textual form so that `4.50` stays `4.50`; the
/// parser guarantees each one carries a decimal point.
pub type FieldMap = BTreeMap<String, String>;

/// Free-form string tags attached to a point.
pub type TagMap = BTreeMap<String, String>;

/// One performance label of one check result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricPoint {
    /// Host the check ran against.
    pub hostname: String,

    /// Service description, empty for host checks.
    pub service: String,

    /// Check command name without arguments.
    pub command: String,

    /// Performance label, e.g. `rta` or `/var used`.
    pub label: String,

    /// Unit of measurement as reported by the plugin (may be empty).
    #[cfg_attr(feature = "serde", serde(default))]
    pub unit: String,

    /// Measurement time in milliseconds since the epoch.
    pub time_ms: u64,

    /// Numeric fields.
    #[cfg_attr(feature = "serde", serde(default))]
    pub fields: FieldMap,

    /// Tags such as `warn-fill`, `downtime` or custom record tags.
    #[cfg_attr(feature = "serde", serde(default))]
    pub tags: TagMap,
}

impl MetricPoint {
    /// Create a builder for a metric point.
    pub fn builder() -> MetricPointBuilder {
        MetricPointBuilder::default()
    }

    /// Look up a field value.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Look up a tag value.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    /// True for host-level points (no service).
    pub fn is_host_point(&self) -> bool {
        self.service.is_empty()
    }

    /// Measurement time in whole seconds.
    pub fn time_secs(&self) -> u64 {
        self.time_ms / 1000
    }
}

/// Builder for [`MetricPoint`].
#[derive(Debug, Default)]
pub struct MetricPointBuilder {
    point: MetricPoint,
}

impl MetricPointBuilder {
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.point.hostname = hostname.into();
        self
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.point.service = service.into();
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.point.command = command.into();
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.point.label = label.into();
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.point.unit = unit.into();
        self
    }

    pub fn time_ms(mut self, time_ms: u64) -> Self {
        self.point.time_ms = time_ms;
        self
    }

    /// Set a numeric field, replacing any previous value.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.point.fields.insert(name.into(), value.into());
        self
    }

    /// Set a tag, replacing any previous value.
    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.point.tags.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> MetricPoint {
        self.point
    }
}
