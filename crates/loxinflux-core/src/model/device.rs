// ── Device domain types ──

use serde::{Deserialize, Serialize};

/// A named value of a multi-valued device, addressed by its own identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubField {
    pub uuid: String,
    pub name: String,
}

/// One controllable or observable entity on the Miniserver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub uuid: String,
    pub name: String,
    /// Declared control type, upper case once indexed (`TEMPERATURE`, `METER`).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    /// Statistics class configured for the control, if any.
    #[serde(default)]
    pub stats_type: Option<String>,
    /// Shown in the visualisation. Visible devices are covered by push.
    #[serde(default)]
    pub visible: bool,
    /// Reads require the visualisation password.
    #[serde(default)]
    pub secured: bool,
    #[serde(default)]
    pub sub_fields: Vec<SubField>,
}

impl Device {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            kind: kind.into(),
            room: None,
            category: None,
            unit: None,
            stats_type: None,
            visible: false,
            secured: false,
            sub_fields: Vec::new(),
        }
    }

    pub fn sub_field(&self, uuid: &str) -> Option<&SubField> {
        self.sub_fields.iter().find(|s| s.uuid == uuid)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_snapshot_entry_with_defaults() {
        let device: Device = serde_json::from_value(serde_json::json!({
            "uuid": "A1",
            "name": "Meter",
            "type": "Meter",
            "statsType": "digital",
            "subFields": [{ "uuid": "A1-total", "name": "total" }]
        }))
        .unwrap();

        assert_eq!(device.kind, "Meter");
        assert_eq!(device.stats_type.as_deref(), Some("digital"));
        assert!(!device.visible);
        assert_eq!(device.room, None);
        assert_eq!(device.sub_field("A1-total").map(|s| s.name.as_str()), Some("total"));
    }
}
