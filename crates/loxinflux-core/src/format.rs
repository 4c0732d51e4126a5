// ── Line-protocol formatting ──
//
// Turns a kept record plus its device metadata into one InfluxDB line:
//
//   loxone,uuid=..,subuuid=..,type=..,name=..,statstype=..,unit=..,
//   category=..,room=..,source=push|poll,visu=0|1,application=loxInFlux value=..[,<output>=..]
//
// Tag order is fixed. Optional tags are left out when unset or empty. Extra
// outputs of a block read follow `value` as additional fields.

use std::fmt::{self, Write as _};

use loxinflux_api::{DecodedRecord, RecordValue};

use crate::model::Resolved;

pub const MEASUREMENT: &str = "loxone";
pub const APPLICATION: &str = "loxInFlux";
const FIELD_KEY: &str = "value";

/// Highest supported rounding precision; `f64` carries ~15 significant digits.
pub const MAX_PRECISION: u32 = 15;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Text(String),
}

/// A single time-series point, ready to serialise.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputMetric {
    pub measurement: &'static str,
    pub tags: Vec<(&'static str, String)>,
    pub value: FieldValue,
    /// Additional fields after `value`, in order.
    pub extra: Vec<(String, FieldValue)>,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: Option<i64>,
}

impl fmt::Display for OutputMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_escaped(f, self.measurement, &[',', ' '])?;
        for (key, value) in &self.tags {
            f.write_char(',')?;
            write_escaped(f, key, &[',', '=', ' '])?;
            f.write_char('=')?;
            write_escaped(f, value, &[',', '=', ' '])?;
        }
        write!(f, " {FIELD_KEY}=")?;
        write_field(f, &self.value)?;
        for (key, value) in &self.extra {
            f.write_char(',')?;
            write_escaped(f, key, &[',', '=', ' '])?;
            f.write_char('=')?;
            write_field(f, value)?;
        }
        if let Some(ts) = self.timestamp {
            write!(f, " {ts}")?;
        }
        Ok(())
    }
}

fn write_field(f: &mut fmt::Formatter<'_>, value: &FieldValue) -> fmt::Result {
    match value {
        FieldValue::Float(v) => write!(f, "{v}"),
        FieldValue::Text(s) => {
            f.write_char('"')?;
            write_escaped(f, s, &['"', '\\'])?;
            f.write_char('"')
        }
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str, special: &[char]) -> fmt::Result {
    for c in s.chars() {
        match c {
            // Line breaks would split the record.
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            c if special.contains(&c) => {
                f.write_char('\\')?;
                f.write_char(c)?;
            }
            c => f.write_char(c)?,
        }
    }
    Ok(())
}

/// Rounding and timestamp settings for [`MetricFormatter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSettings {
    pub round_floats: bool,
    pub precision: u32,
    pub timestamps: bool,
}

impl Default for FormatSettings {
    fn default() -> Self {
        Self {
            round_floats: false,
            precision: 5,
            timestamps: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricFormatter {
    settings: FormatSettings,
}

impl MetricFormatter {
    pub fn new(settings: FormatSettings) -> Self {
        Self { settings }
    }

    /// Build the metric for a kept record. Returns `None` for values the
    /// line protocol cannot express (NaN, infinities).
    pub fn metric(&self, record: &DecodedRecord, resolved: &Resolved<'_>) -> Option<OutputMetric> {
        let value = self.field(&record.value)?;
        let extra = record
            .outputs
            .iter()
            .filter(|(key, _)| !key.is_empty() && key != FIELD_KEY)
            .filter_map(|(key, value)| Some((key.clone(), self.field(value)?)))
            .collect();

        let device = resolved.device;
        let name = display_name(resolved);
        let source = record.provenance.to_string();
        let mut tags: Vec<(&'static str, String)> = Vec::with_capacity(11);
        let mut tag = |key: &'static str, value: Option<&str>| {
            if let Some(v) = value.filter(|v| !v.is_empty()) {
                tags.push((key, v.to_owned()));
            }
        };

        tag("uuid", Some(&device.uuid));
        tag("subuuid", resolved.sub_field.map(|s| s.uuid.as_str()));
        tag("type", Some(&device.kind));
        tag("name", Some(&name));
        tag("statstype", device.stats_type.as_deref());
        tag("unit", device.unit.as_deref());
        tag("category", device.category.as_deref());
        tag("room", device.room.as_deref());
        tag("source", Some(&source));
        tag("visu", Some(if device.visible { "1" } else { "0" }));
        tag("application", Some(APPLICATION));

        Some(OutputMetric {
            measurement: MEASUREMENT,
            tags,
            value,
            extra,
            timestamp: self
                .settings
                .timestamps
                .then(|| record.received_at.timestamp_nanos_opt())
                .flatten(),
        })
    }

    /// Format one line, or `None` if the value cannot be expressed.
    pub fn format(&self, record: &DecodedRecord, resolved: &Resolved<'_>) -> Option<String> {
        self.metric(record, resolved).map(|m| m.to_string())
    }

    fn field(&self, value: &RecordValue) -> Option<FieldValue> {
        match value {
            RecordValue::Number(v) if !v.is_finite() => None,
            RecordValue::Number(v) => Some(FieldValue::Float(self.round(*v))),
            RecordValue::Text(s) => Some(FieldValue::Text(s.clone())),
        }
    }

    fn round(&self, v: f64) -> f64 {
        if !self.settings.round_floats {
            return v;
        }
        let exp = i32::try_from(self.settings.precision.min(MAX_PRECISION)).unwrap_or(0);
        let scale = 10f64.powi(exp);
        let scaled = (v * scale).round() / scale;
        if scaled.is_finite() { scaled } else { v }
    }
}

/// Sub-field values carry the sub-field name after the device name.
fn display_name(resolved: &Resolved<'_>) -> String {
    match resolved.sub_field {
        Some(sub) => format!("{} {}", resolved.device.name, sub.name),
        None => resolved.device.name.clone(),
    }
}
