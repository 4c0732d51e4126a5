// ── Event table decoding ──
//
// Value table: back-to-back 24-byte records (uuid + f64 LE).
// Text table: uuid, icon uuid, u32 LE text length, text bytes padded to a
// 4-byte boundary.

use crate::error::ProtocolError;

use super::uuid::{LoxUuid, UUID_LEN};

pub const VALUE_RECORD_LEN: usize = UUID_LEN + 8;

const TEXT_FIXED_LEN: usize = UUID_LEN * 2 + 4;
const TEXT_ALIGN: usize = 4;

/// One entry of a value-states table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueState {
    pub uuid: LoxUuid,
    pub value: f64,
}

/// One entry of a text-states table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextState {
    pub uuid: LoxUuid,
    pub icon: LoxUuid,
    pub text: String,
}

fn uuid_at(payload: &[u8], offset: usize) -> Option<LoxUuid> {
    let bytes: &[u8; UUID_LEN] = payload.get(offset..offset + UUID_LEN)?.try_into().ok()?;
    Some(LoxUuid::from_wire(bytes))
}

/// Decode a value-states payload.
///
/// A payload that does not divide into whole records is rejected as a
/// whole; no partial result is returned.
pub fn decode_value_table(payload: &[u8]) -> Result<Vec<ValueState>, ProtocolError> {
    if payload.len() % VALUE_RECORD_LEN != 0 {
        return Err(ProtocolError::TrailingBytes {
            table: "value",
            len: payload.len(),
            record_size: VALUE_RECORD_LEN,
        });
    }

    let states = payload
        .chunks_exact(VALUE_RECORD_LEN)
        .filter_map(|record| {
            let (id, value) = record.split_at(UUID_LEN);
            let id: &[u8; UUID_LEN] = id.try_into().ok()?;
            let value: [u8; 8] = value.try_into().ok()?;
            Some(ValueState {
                uuid: LoxUuid::from_wire(id),
                value: f64::from_le_bytes(value),
            })
        })
        .collect();
    Ok(states)
}

/// Decode a text-states payload.
///
/// Text is taken exactly as long as declared; non-UTF-8 bytes are replaced.
pub fn decode_text_table(payload: &[u8]) -> Result<Vec<TextState>, ProtocolError> {
    let mut states = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        let available = payload.len() - offset;
        if available < TEXT_FIXED_LEN {
            return Err(ProtocolError::TruncatedRecord {
                table: "text",
                offset,
                needed: TEXT_FIXED_LEN,
                available,
            });
        }

        let truncated = |needed| ProtocolError::TruncatedRecord {
            table: "text",
            offset,
            needed,
            available,
        };
        let uuid = uuid_at(payload, offset).ok_or_else(|| truncated(TEXT_FIXED_LEN))?;
        let icon = uuid_at(payload, offset + UUID_LEN).ok_or_else(|| truncated(TEXT_FIXED_LEN))?;
        let len_at = offset + UUID_LEN * 2;
        let len_bytes: [u8; 4] = payload
            .get(len_at..len_at + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| truncated(TEXT_FIXED_LEN))?;
        let text_len = usize::try_from(u32::from_le_bytes(len_bytes)).unwrap_or(usize::MAX);

        let text_start = offset + TEXT_FIXED_LEN;
        let needed = TEXT_FIXED_LEN.saturating_add(text_len);
        let text = payload
            .get(text_start..text_start.saturating_add(text_len))
            .ok_or_else(|| truncated(needed))?;

        states.push(TextState {
            uuid,
            icon,
            text: String::from_utf8_lossy(text).into_owned(),
        });

        // The final record may omit its padding.
        let padded = text_len.div_ceil(TEXT_ALIGN) * TEXT_ALIGN;
        offset = text_start.saturating_add(padded).min(payload.len());
    }

    Ok(states)
}
