// ── Core error types ──
//
// Bridge-level errors from loxinflux-core. Consumers never see WebSocket
// frames or HTTP failures directly; the `From<loxinflux_api::Error>` impl
// translates session errors into domain-appropriate variants.

use thiserror::Error;

/// Failures of a single delivery channel.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("I/O error on {channel}: {source}")]
    Io {
        channel: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot connect {channel} to {target}: {reason}")]
    Connect {
        channel: String,
        target: String,
        reason: String,
    },

    #[error("MQTT error on {channel}: {message}")]
    Mqtt { channel: String, message: String },

    #[error("Channel {channel} gave up after {attempts} attempts")]
    RetriesExhausted { channel: String, attempts: u32 },

    #[error("Channel {channel} is closed")]
    Closed { channel: String },
}

impl DeliveryError {
    pub(crate) fn io(channel: &str, source: std::io::Error) -> Self {
        Self::Io {
            channel: channel.to_owned(),
            source,
        }
    }
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Session errors ───────────────────────────────────────────────
    #[error("Cannot connect to Miniserver: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Miniserver unreachable after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Miniserver did not answer within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Delivery errors ──────────────────────────────────────────────
    #[error("All delivery channels failed")]
    DeliveryFailed {
        #[source]
        last: Option<DeliveryError>,
    },

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    // ── Structure snapshot ───────────────────────────────────────────
    #[error("Structure snapshot unavailable: {message}")]
    Structure { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from session-layer errors ─────────────────────────────

impl From<loxinflux_api::Error> for CoreError {
    fn from(err: loxinflux_api::Error) -> Self {
        use loxinflux_api::Error as Api;

        match err {
            Api::Authentication { message } => CoreError::AuthenticationFailed { message },
            Api::PublicKey(reason) => CoreError::ConnectionFailed {
                reason: format!("Miniserver public key unusable: {reason}"),
            },
            Api::RetriesExhausted { attempts } => CoreError::RetriesExhausted { attempts },
            Api::Timeout { timeout_secs, .. } => CoreError::Timeout { timeout_secs },
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid Miniserver URL: {e}"),
            },
            Api::Transport(ref e) if e.is_timeout() => CoreError::Timeout { timeout_secs: 0 },
            Api::Transport(e) => CoreError::ConnectionFailed {
                reason: e.to_string(),
            },
            Api::Tls(msg) => CoreError::ConnectionFailed {
                reason: format!("TLS error: {msg}"),
            },
            Api::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                reason: format!("WebSocket connection failed: {reason}"),
            },
            Api::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            Api::OutOfService => CoreError::ConnectionFailed {
                reason: "Miniserver out of service".into(),
            },
            Api::TokenRefresh { message } => CoreError::ConnectionFailed {
                reason: format!("token refresh failed: {message}"),
            },
            other @ (Api::KeyExchange(_)
            | Api::Crypto(_)
            | Api::Protocol(_)
            | Api::Command { .. }
            | Api::Deserialization { .. }) => CoreError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_domain_variants() {
        let auth = CoreError::from(loxinflux_api::Error::Authentication {
            message: "bad password".into(),
        });
        assert!(matches!(auth, CoreError::AuthenticationFailed { .. }));

        let exhausted = CoreError::from(loxinflux_api::Error::RetriesExhausted { attempts: 3 });
        assert!(matches!(exhausted, CoreError::RetriesExhausted { attempts: 3 }));

        let closed = CoreError::from(loxinflux_api::Error::WebSocketClosed {
            code: 1006,
            reason: "reset".into(),
        });
        assert_eq!(
            closed.to_string(),
            "Cannot connect to Miniserver: WebSocket closed (code 1006): reset"
        );
    }
}
