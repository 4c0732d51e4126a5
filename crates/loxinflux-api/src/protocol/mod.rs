//! Wire format of the Miniserver WebSocket protocol.
//!
//! Pure, I/O-free codec pieces: message headers, stream reassembly, event
//! table decoding, JSON command responses and command paths.

pub mod commands;
pub mod frame;
pub mod header;
pub mod response;
pub mod tables;
pub mod uuid;

pub use frame::{DEFAULT_MAX_PAYLOAD, Frame, FrameDecoder};
pub use header::{HEADER_LEN, MessageHeader, MessageKind};
pub use response::{BlockOutput, LoxResponse};
pub use tables::{TextState, ValueState, decode_text_table, decode_value_table};
pub use self::uuid::{LoxUuid, ParseUuidError};
