// ── Text command responses ──
//
// Every command is answered with `{"LL": {"control": ..., "value": ..., "Code": ...}}`.
// Firmware versions disagree on `Code` vs `code` and on whether the code is
// a string or a number, so both are accepted. Block reads (`sps/io/<uuid>/all`)
// of multi-output blocks add `output0`, `output1`, ... next to `value`.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Error, ProtocolError};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "LL")]
    ll: RawResponse,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    control: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(rename = "Code", alias = "code", default)]
    code: serde_json::Value,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

/// A parsed command response.
#[derive(Debug, Clone, PartialEq)]
pub struct LoxResponse {
    pub control: String,
    pub code: u16,
    pub value: serde_json::Value,
    /// Additional outputs of a multi-output block, in output order.
    pub outputs: Vec<BlockOutput>,
}

/// One `outputN` entry of a block read.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockOutput {
    /// The output's `name`, else its `nr`, else the entry key.
    pub name: String,
    pub value: serde_json::Value,
}

impl BlockOutput {
    pub fn value_text(&self) -> String {
        json_text(&self.value)
    }
}

impl LoxResponse {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedResponse(e.to_string()))?;
        let raw = envelope.ll;
        let code = match &raw.code {
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| ProtocolError::MalformedResponse(format!("bad code {}", raw.code)))?;

        Ok(Self {
            control: raw.control,
            code,
            value: raw.value,
            outputs: block_outputs(&raw.rest),
        })
    }

    pub fn is_success(&self) -> bool {
        self.code == 200
    }

    /// Fail with the code unless it is 200.
    pub fn require_success(self, command: &str) -> Result<Self, Error> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::from_auth_code(command, self.code))
        }
    }

    /// The value rendered as plain text; strings are returned unquoted.
    pub fn value_text(&self) -> String {
        json_text(&self.value)
    }

    /// Deserialize a structured value.
    ///
    /// Some firmware sends the object JSON-encoded inside a string.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let result = match &self.value {
            serde_json::Value::String(s) => serde_json::from_str(s),
            other => serde_json::from_value(other.clone()),
        };
        result.map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: self.value.to_string(),
        })
    }

    /// Control path without the `j` prefix the Miniserver sometimes echoes.
    pub fn path(&self) -> &str {
        self.control.strip_prefix('j').unwrap_or(&self.control)
    }

    /// The device addressed by an `sps/io` or `sps/ios` response.
    pub fn io_target(&self) -> Option<&str> {
        let path = self.path();
        if !(path.starts_with("dev/sps/io/") || path.starts_with("dev/sps/ios/")) {
            return None;
        }
        path.rsplit('/').nth(1)
    }

    /// `true` for responses to `jdev/sys/enc/...` whose payload is opaque.
    pub fn is_encrypted_echo(&self) -> bool {
        let path = self.path();
        path.starts_with("dev/sys/enc/") || path.starts_with("dev/sys/fenc/")
    }
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Only blocks with an `output0` carry extra outputs.
fn block_outputs(rest: &Map<String, Value>) -> Vec<BlockOutput> {
    if !rest.contains_key("output0") {
        return Vec::new();
    }
    let mut outputs: Vec<(u32, BlockOutput)> = rest
        .iter()
        .filter_map(|(key, entry)| {
            let index = key.strip_prefix("output")?.parse::<u32>().ok()?;
            let value = entry.get("value")?.clone();
            let name = label(entry.get("name"))
                .or_else(|| label(entry.get("nr")))
                .unwrap_or_else(|| key.clone());
            Some((index, BlockOutput { name, value }))
        })
        .collect();
    outputs.sort_by_key(|(index, _)| *index);
    outputs.into_iter().map(|(_, output)| output).collect()
}

fn label(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    use super::*;

    #[test]
    fn parses_string_code() {
        let r = LoxResponse::parse(
            r#"{"LL":{"control":"dev/sps/io/0f1e2d3c-0123-4567-ffff8899aabbccdd/all","value":"21.5","Code":"200"}}"#,
        )
        .unwrap();
        assert!(r.is_success());
        assert_eq!(r.value_text(), "21.5");
        assert_eq!(r.io_target(), Some("0f1e2d3c-0123-4567-ffff8899aabbccdd"));
    }

    #[test]
    fn collects_block_outputs_in_order() {
        let r = LoxResponse::parse(
            r#"{"LL":{"control":"dev/sps/io/0f1e2d3c-0123-4567-ffff8899aabbccdd/all","value":"1","Code":"200",
                "output10":{"nr":11,"value":"7"},
                "output1":{"name":"","nr":2,"value":"on"},
                "output0":{"name":"AQ1","nr":1,"value":"3.5"},
                "output2":{"value":"x"},
                "output3":"no value"}}"#,
        )
        .unwrap();
        let outputs: Vec<(&str, String)> = r
            .outputs
            .iter()
            .map(|o| (o.name.as_str(), o.value_text()))
            .collect();
        assert_eq!(
            outputs,
            vec![
                ("AQ1", "3.5".to_owned()),
                ("2", "on".to_owned()),
                ("output2", "x".to_owned()),
                ("11", "7".to_owned()),
            ]
        );
    }

    #[test]
    fn outputs_need_output0() {
        let r = LoxResponse::parse(
            r#"{"LL":{"control":"dev/sps/io/abc/all","value":"1","Code":"200","output1":{"value":"2"}}}"#,
        )
        .unwrap();
        assert!(r.outputs.is_empty());
    }

    #[test]
    fn parses_lowercase_numeric_code() {
        let r = LoxResponse::parse(r#"{"LL":{"control":"jdev/sys/getkey","value":"abcd","code":401}}"#)
            .unwrap();
        assert_eq!(r.code, 401);
        assert_eq!(r.path(), "dev/sys/getkey");
        assert!(r.io_target().is_none());
    }

    #[test]
    fn structured_value() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Salt {
            key: String,
            salt: String,
        }

        let r = LoxResponse::parse(
            r#"{"LL":{"control":"jdev/sys/getkey2/admin","value":{"key":"4142","salt":"73616c74"},"Code":"200"}}"#,
        )
        .unwrap();
        let salt: Salt = r.value_as().unwrap();
        assert_eq!(
            salt,
            Salt {
                key: "4142".into(),
                salt: "73616c74".into()
            }
        );
    }

    #[test]
    fn secured_io_target() {
        let r = LoxResponse::parse(
            r#"{"LL":{"control":"dev/sps/ios/deadbeef/0f1e2d3c-0123-4567-ffff8899aabbccdd/all","value":"1","Code":"200"}}"#,
        )
        .unwrap();
        assert_eq!(r.io_target(), Some("0f1e2d3c-0123-4567-ffff8899aabbccdd"));
    }

    #[test]
    fn rejected_command_maps_to_auth_error() {
        let r = LoxResponse::parse(r#"{"LL":{"control":"jdev/sys/getjwt","Code":"401"}}"#).unwrap();
        let err = r.require_success("getjwt").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn missing_envelope_is_malformed() {
        assert!(matches!(
            LoxResponse::parse(r#"{"foo":1}"#),
            Err(ProtocolError::MalformedResponse(_))
        ));
    }
}
