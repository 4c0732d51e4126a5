//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and a process exit code.

use miette::Diagnostic;
use thiserror::Error;

use loxinflux_config::ConfigError;
use loxinflux_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const CONFIG: i32 = 1;
    pub const AUTH: i32 = 2;
    pub const RETRIES_EXHAUSTED: i32 = 3;
    pub const DELIVERY: i32 = 4;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────

    #[error("Invalid configuration")]
    #[diagnostic(
        code(loxinflux::config),
        help(
            "Check {path} and any LOXINFLUX_* environment variables.\n\
             Sections use `__` in variable names, e.g. LOXINFLUX_MINISERVER__HOST."
        )
    )]
    Config {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("Structure snapshot unavailable: {message}")]
    #[diagnostic(
        code(loxinflux::structure),
        help(
            "Export the Miniserver structure to structure.json in the data directory\n\
             (see --data-dir or [paths].data_dir)."
        )
    )]
    Structure { message: String },

    // ── Miniserver ───────────────────────────────────────────────────

    #[error("Miniserver rejected the credentials: {message}")]
    #[diagnostic(
        code(loxinflux::auth_failed),
        help(
            "Verify [miniserver].user and [miniserver].password.\n\
             Retrying will not help until the credentials are fixed."
        )
    )]
    AuthFailed { message: String },

    #[error("Gave up reconnecting after {attempts} attempts")]
    #[diagnostic(
        code(loxinflux::retries_exhausted),
        help(
            "Check that the Miniserver is reachable, or set\n\
             [miniserver].max_reconnect_attempts = 0 to retry forever."
        )
    )]
    RetriesExhausted { attempts: u32 },

    #[error("Could not reach the Miniserver: {reason}")]
    #[diagnostic(code(loxinflux::connection_failed))]
    ConnectionFailed { reason: String },

    // ── Delivery ─────────────────────────────────────────────────────

    #[error("Every delivery target failed: {reason}")]
    #[diagnostic(
        code(loxinflux::delivery_failed),
        help(
            "Check that Telegraf is listening on the configured targets, or set\n\
             [telegraf].max_retries = 0 to retry forever."
        )
    )]
    DeliveryFailed { reason: String },

    // ── Internal ─────────────────────────────────────────────────────

    #[error("{0}")]
    #[diagnostic(code(loxinflux::internal))]
    Internal(String),
}

impl CliError {
    pub fn config(path: &std::path::Path, source: ConfigError) -> Self {
        Self::Config {
            path: path.display().to_string(),
            source,
        }
    }

    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AuthFailed { .. } => exit_code::AUTH,
            Self::RetriesExhausted { .. } | Self::ConnectionFailed { .. } => {
                exit_code::RETRIES_EXHAUSTED
            }
            Self::DeliveryFailed { .. } => exit_code::DELIVERY,
            Self::Config { .. } | Self::Structure { .. } | Self::Internal(_) => exit_code::CONFIG,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AuthenticationFailed { message } => Self::AuthFailed { message },
            CoreError::RetriesExhausted { attempts } => Self::RetriesExhausted { attempts },
            CoreError::ConnectionFailed { reason } => Self::ConnectionFailed { reason },
            CoreError::Timeout { timeout_secs } => Self::ConnectionFailed {
                reason: format!("timed out after {timeout_secs}s"),
            },
            CoreError::DeliveryFailed { last } => Self::DeliveryFailed {
                reason: last.map_or_else(|| "no channel left".into(), |e| e.to_string()),
            },
            CoreError::Delivery(e) => Self::DeliveryFailed {
                reason: e.to_string(),
            },
            CoreError::Structure { message } => Self::Structure { message },
            CoreError::Config { message } => Self::Config {
                path: "(runtime)".into(),
                source: ConfigError::Validation {
                    field: "bridge".into(),
                    reason: message,
                },
            },
            CoreError::Internal(message) => Self::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loxinflux_core::DeliveryError;

    #[test]
    fn exit_codes_follow_failure_kind() {
        let cases = [
            (
                CoreError::AuthenticationFailed {
                    message: "401".into(),
                },
                exit_code::AUTH,
            ),
            (CoreError::RetriesExhausted { attempts: 5 }, exit_code::RETRIES_EXHAUSTED),
            (
                CoreError::DeliveryFailed {
                    last: Some(DeliveryError::RetriesExhausted {
                        channel: "tcp://127.0.0.1:8094".into(),
                        attempts: 3,
                    }),
                },
                exit_code::DELIVERY,
            ),
            (
                CoreError::Structure {
                    message: "missing".into(),
                },
                exit_code::CONFIG,
            ),
        ];
        for (core, code) in cases {
            assert_eq!(CliError::from(core).exit_code(), code);
        }
    }

    #[test]
    fn delivery_failure_names_the_channel() {
        let err = CliError::from(CoreError::DeliveryFailed {
            last: Some(DeliveryError::RetriesExhausted {
                channel: "tcp://127.0.0.1:8094".into(),
                attempts: 3,
            }),
        });
        assert!(err.to_string().contains("tcp://127.0.0.1:8094"), "{err}");
    }
}
