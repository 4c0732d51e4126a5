// ── Binary message header ──
//
// Every message from the Miniserver is announced by an 8-byte header:
//
//   byte 0     0x03 (binary marker)
//   byte 1     message kind
//   byte 2     info flags (bit 7 = length is only an estimate)
//   byte 3     reserved
//   bytes 4-7  payload length, u32 little-endian

use strum::Display;

use crate::error::ProtocolError;

pub const HEADER_LEN: usize = 8;

const HEADER_MARKER: u8 = 0x03;
const FLAG_ESTIMATED: u8 = 0x80;

/// What the payload following a header contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum MessageKind {
    Text,
    Binary,
    ValueStates,
    TextStates,
    DaytimerStates,
    OutOfService,
    Keepalive,
    WeatherStates,
}

impl MessageKind {
    fn from_wire(kind: u8) -> Option<Self> {
        Some(match kind {
            0 => Self::Text,
            1 => Self::Binary,
            2 => Self::ValueStates,
            3 => Self::TextStates,
            4 => Self::DaytimerStates,
            5 => Self::OutOfService,
            6 => Self::Keepalive,
            7 => Self::WeatherStates,
            _ => return None,
        })
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Text => 0,
            Self::Binary => 1,
            Self::ValueStates => 2,
            Self::TextStates => 3,
            Self::DaytimerStates => 4,
            Self::OutOfService => 5,
            Self::Keepalive => 6,
            Self::WeatherStates => 7,
        }
    }
}

/// A parsed message header.
///
/// `kind` stays raw until the payload has been consumed so that an unknown
/// kind can be skipped without losing the frame boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub raw_kind: u8,
    pub estimated: bool,
    pub payload_len: usize,
}

impl MessageHeader {
    /// Parse the first [`HEADER_LEN`] bytes of `bytes`.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let [marker, kind, info, _reserved, l0, l1, l2, l3] = *bytes;
        if marker != HEADER_MARKER {
            return Err(ProtocolError::InvalidHeader { first: marker });
        }
        let payload_len = u32::from_le_bytes([l0, l1, l2, l3]);
        Ok(Self {
            raw_kind: kind,
            estimated: info & FLAG_ESTIMATED != 0,
            payload_len: usize::try_from(payload_len).unwrap_or(usize::MAX),
        })
    }

    pub fn kind(&self) -> Result<MessageKind, ProtocolError> {
        MessageKind::from_wire(self.raw_kind)
            .ok_or(ProtocolError::UnexpectedKind { kind: self.raw_kind })
    }

    /// Encode a header (used by tests and fakes).
    pub fn encode(kind: MessageKind, payload_len: u32, estimated: bool) -> [u8; HEADER_LEN] {
        let len = payload_len.to_le_bytes();
        let info = if estimated { FLAG_ESTIMATED } else { 0 };
        [
            HEADER_MARKER,
            kind.to_wire(),
            info,
            0,
            len[0],
            len[1],
            len[2],
            len[3],
        ]
    }
}
