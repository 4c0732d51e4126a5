// ── Stream reassembly ──
//
// The Miniserver sends each header as its own WebSocket message followed by
// the payload in one or more further messages. The decoder treats the
// connection as a plain byte stream so that nothing depends on where the
// transport happens to split messages.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;

use super::header::{HEADER_LEN, MessageHeader, MessageKind};
use super::tables::{TextState, ValueState, decode_text_table, decode_value_table};

/// Upper bound for a single payload unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// A fully received and decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// JSON command response.
    Text(String),
    /// File contents (e.g. a structure download).
    Binary(Bytes),
    ValueStates(Vec<ValueState>),
    TextStates(Vec<TextState>),
    /// Day-timer and weather tables are received but not interpreted.
    Opaque { kind: MessageKind, len: usize },
    OutOfService,
    Keepalive,
}

#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    pending: Option<MessageHeader>,
    max_payload: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            pending: None,
            max_payload,
        }
    }

    /// Append bytes received from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// `true` while a header has been read and its payload is outstanding.
    pub fn awaiting_payload(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop all buffered state. Used after an unrecoverable error.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pending = None;
    }

    /// Pull the next complete frame out of the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A recoverable error
    /// means the offending payload has been consumed and the caller may keep
    /// calling; an unrecoverable one leaves the buffer untouched.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let header = if let Some(header) = self.pending {
                header
            } else {
                let Some(raw) = self.buf.get(..HEADER_LEN) else {
                    return Ok(None);
                };
                let raw: [u8; HEADER_LEN] = raw
                    .try_into()
                    .map_err(|_| ProtocolError::MalformedResponse("short header".into()))?;
                let header = MessageHeader::parse(&raw)?;
                if header.payload_len > self.max_payload {
                    return Err(ProtocolError::PayloadTooLarge {
                        declared: header.payload_len,
                        limit: self.max_payload,
                    });
                }
                self.buf.advance(HEADER_LEN);
                if header.estimated {
                    // An exact header follows.
                    tracing::trace!(len = header.payload_len, "skipping estimated header");
                    continue;
                }
                self.pending = Some(header);
                header
            };

            if self.buf.len() < header.payload_len {
                return Ok(None);
            }
            self.pending = None;
            let payload = self.buf.split_to(header.payload_len).freeze();
            return decode_payload(header, payload).map(Some);
        }
    }
}

fn decode_payload(header: MessageHeader, payload: Bytes) -> Result<Frame, ProtocolError> {
    let kind = header.kind()?;
    Ok(match kind {
        MessageKind::Text => Frame::Text(String::from_utf8_lossy(&payload).into_owned()),
        MessageKind::Binary => Frame::Binary(payload),
        MessageKind::ValueStates => Frame::ValueStates(decode_value_table(&payload)?),
        MessageKind::TextStates => Frame::TextStates(decode_text_table(&payload)?),
        MessageKind::DaytimerStates | MessageKind::WeatherStates => Frame::Opaque {
            kind,
            len: payload.len(),
        },
        MessageKind::OutOfService => Frame::OutOfService,
        MessageKind::Keepalive => Frame::Keepalive,
    })
}
