// loxinflux-api: Async client for the Loxone Miniserver WebSocket protocol

pub mod auth;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod record;
pub mod retry;
pub mod session;
pub mod transport;
mod websocket;

pub use auth::Credentials;
pub use error::{Error, ProtocolError};
pub use record::{DecodedRecord, Provenance, RecordValue};
pub use retry::{Backoff, ReconnectConfig};
pub use session::{
    PollTarget, SessionConfig, SessionHandle, SessionRequest, SessionRequester, SessionState,
};
pub use transport::{TlsMode, TransportConfig};
