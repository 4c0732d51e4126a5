use chrono::{DateTime, Utc};
use strum::{Display, EnumString};

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Provenance {
    /// Unsolicited status update on the event stream.
    Push,
    /// Answer to an explicit periodic read.
    Poll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Number(f64),
    Text(String),
}

impl RecordValue {
    /// Poll answers arrive as text; anything that reads as a finite
    /// number is one.
    pub fn coerce(raw: &str) -> Self {
        match raw.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Self::Number(n),
            _ => Self::Text(raw.to_owned()),
        }
    }
}

/// A single decoded device value, consumed exactly once downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    /// Device or sub-field identifier as rendered in the structure snapshot.
    pub uuid: String,
    pub value: RecordValue,
    pub received_at: DateTime<Utc>,
    pub provenance: Provenance,
    /// Extra named outputs of a multi-output block (poll answers only).
    pub outputs: Vec<(String, RecordValue)>,
}

impl DecodedRecord {
    pub fn new(uuid: impl Into<String>, value: RecordValue, provenance: Provenance) -> Self {
        Self {
            uuid: uuid.into(),
            value,
            received_at: Utc::now(),
            provenance,
            outputs: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<(String, RecordValue)>) -> Self {
        self.outputs = outputs;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn numeric_text_is_coerced() {
        assert_eq!(RecordValue::coerce("21.5"), RecordValue::Number(21.5));
        assert_eq!(RecordValue::coerce(" 3 "), RecordValue::Number(3.0));
        assert_eq!(RecordValue::coerce("on"), RecordValue::Text("on".into()));
    }

    #[test]
    fn non_finite_text_stays_text() {
        for raw in ["nan", "NaN", "inf", "-infinity", "1e999"] {
            assert_eq!(RecordValue::coerce(raw), RecordValue::Text(raw.into()), "{raw}");
        }
    }

    #[test]
    fn provenance_renders_lowercase() {
        assert_eq!(Provenance::Push.to_string(), "push");
        assert_eq!("poll".parse::<Provenance>().unwrap(), Provenance::Poll);
    }
}
