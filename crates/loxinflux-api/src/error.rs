use thiserror::Error;

/// Frame- and record-level decoding failures.
///
/// Raised by [`FrameDecoder`](crate::protocol::FrameDecoder) and the table
/// decoders. Most variants describe a single bad frame whose bytes have
/// already been consumed; only [`InvalidHeader`](Self::InvalidHeader) and
/// [`PayloadTooLarge`](Self::PayloadTooLarge) mean the byte stream can no
/// longer be trusted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Header did not start with the binary-message marker.
    #[error("invalid message header (first byte 0x{first:02x})")]
    InvalidHeader { first: u8 },

    /// Declared payload exceeds the configured maximum.
    #[error("declared payload of {declared} bytes exceeds limit of {limit}")]
    PayloadTooLarge { declared: usize, limit: usize },

    /// Header carried a message kind this codec does not know.
    #[error("unexpected message kind {kind}")]
    UnexpectedKind { kind: u8 },

    /// Fixed-size table payload did not divide into whole records.
    #[error("{table} table payload of {len} bytes is not a multiple of {record_size}")]
    TrailingBytes {
        table: &'static str,
        len: usize,
        record_size: usize,
    },

    /// A variable-length record ran past the end of the payload.
    #[error("truncated {table} record at offset {offset}: need {needed} bytes, {available} left")]
    TruncatedRecord {
        table: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Text frame was not a valid `{"LL": {...}}` response.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ProtocolError {
    /// Returns `true` when decoding can resume at the next frame boundary.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidHeader { .. } | Self::PayloadTooLarge { .. }
        )
    }
}

/// Top-level error type for the `loxinflux-api` crate.
///
/// Covers every failure mode of a Miniserver session: HTTP bootstrap,
/// key exchange, authentication, WebSocket transport and framing.
/// `loxinflux-core` maps these into domain-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Credentials rejected by the Miniserver. Retrying will not help.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Token could not be refreshed (transient or expired).
    #[error("Token refresh failed: {message}")]
    TokenRefresh { message: String },

    // ── Key exchange / crypto ───────────────────────────────────────
    /// The Miniserver's public key could not be fetched or parsed.
    #[error("Invalid public key: {0}")]
    PublicKey(String),

    /// The session key was not acknowledged.
    #[error("Key exchange failed: {0}")]
    KeyExchange(String),

    /// Local cryptographic failure (bad key length, RSA error).
    #[error("Crypto error: {0}")]
    Crypto(String),

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A request or keepalive was not answered in time.
    #[error("Timed out after {timeout_secs}s waiting for {waiting_for}")]
    Timeout {
        timeout_secs: u64,
        waiting_for: &'static str,
    },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// Miniserver announced it is going out of service (reboot, update).
    #[error("Miniserver out of service")]
    OutOfService,

    // ── Protocol ────────────────────────────────────────────────────
    /// Framing could not be recovered; the connection must be rebuilt.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A command was answered with a non-success code.
    #[error("Command {command} failed with code {code}")]
    Command { command: String, code: u16 },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Lifecycle ───────────────────────────────────────────────────
    /// The reconnect budget was used up.
    #[error("Gave up after {attempts} consecutive connection attempts")]
    RetriesExhausted { attempts: u32 },
}

impl Error {
    /// Returns `true` if retrying cannot succeed without operator action.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::RetriesExhausted { .. }
        )
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            // A rebooting Miniserver answers with error pages before its API is up.
            Self::PublicKey(_)
            | Self::Timeout { .. }
            | Self::WebSocketConnect(_)
            | Self::WebSocketClosed { .. }
            | Self::OutOfService
            | Self::TokenRefresh { .. }
            | Self::KeyExchange(_)
            | Self::Protocol(_) => true,
            Self::Command { code, .. } => !matches!(code, 401 | 403),
            _ => false,
        }
    }

    /// Map a non-success response code during authentication.
    ///
    /// 401/403/404 mean the user or password is wrong; anything else is
    /// treated as the Miniserver being temporarily unable to answer.
    pub(crate) fn from_auth_code(command: &str, code: u16) -> Self {
        match code {
            401 | 403 | 404 => Self::Authentication {
                message: format!("{command} rejected with code {code}"),
            },
            _ => Self::Command {
                command: command.to_owned(),
                code,
            },
        }
    }
}
