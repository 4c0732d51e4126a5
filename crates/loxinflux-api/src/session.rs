//! Session lifecycle: one authenticated connection at a time, rebuilt with
//! backoff when it drops.
//!
//! The background task owns the connection exclusively. Other components
//! observe [`SessionState`] through a `watch` channel and hand it work via
//! [`SessionRequester`]; nobody else touches the connection.
//!
//! ```rust,ignore
//! let (records_tx, mut records_rx) = mpsc::channel(4096);
//! let handle = SessionHandle::spawn(config, records_tx, cancel.child_token());
//!
//! while let Some(record) = records_rx.recv().await {
//!     println!("{} = {:?}", record.uuid, record.value);
//! }
//! ```

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::Credentials;
use crate::error::Error;
use crate::protocol::DEFAULT_MAX_PAYLOAD;
use crate::record::DecodedRecord;
use crate::retry::{Backoff, ReconnectConfig};
use crate::transport::TransportConfig;
use crate::websocket::{Connection, Outcome};

const REQUEST_CHANNEL_CAPACITY: usize = 16;

// ── SessionState ─────────────────────────────────────────────────────

/// Lifecycle of the Miniserver session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    KeyExchange,
    Authenticating,
    Active,
    Reconnecting { attempt: u32 },
    /// Terminal: credentials rejected or reconnect budget exhausted.
    Failed,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        self == Self::Active
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Failed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::KeyExchange => f.write_str("key exchange"),
            Self::Authenticating => f.write_str("authenticating"),
            Self::Active => f.write_str("active"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

// ── SessionConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `http(s)://host[:port]/` of the Miniserver.
    pub base_url: Url,
    pub credentials: Credentials,
    pub transport: TransportConfig,
    pub reconnect: ReconnectConfig,
    pub keepalive_interval: Duration,
    /// Missing keepalive answers for this many intervals drop the connection.
    pub keepalive_timeout_factor: u32,
    /// Timeout for each handshake step.
    pub command_timeout: Duration,
    /// Refresh the token this long before it expires.
    pub token_refresh_margin: Duration,
    pub max_payload: usize,
    /// Stable identifier of this client, sent with the token request.
    pub client_uuid: uuid::Uuid,
    pub client_info: String,
}

impl SessionConfig {
    pub fn new(base_url: Url, credentials: Credentials) -> Self {
        Self {
            base_url,
            credentials,
            transport: TransportConfig::default(),
            reconnect: ReconnectConfig::default(),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout_factor: 3,
            command_timeout: Duration::from_secs(10),
            token_refresh_margin: Duration::from_secs(3600),
            max_payload: DEFAULT_MAX_PAYLOAD,
            client_uuid: uuid::Uuid::new_v4(),
            client_info: "loxinflux".into(),
        }
    }

    pub fn keepalive_timeout(&self) -> Duration {
        self.keepalive_interval
            .saturating_mul(self.keepalive_timeout_factor.max(1))
    }
}

// ── Requests ─────────────────────────────────────────────────────────

/// A device to read explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    pub uuid: String,
    /// Protected by a visualisation password.
    pub secured: bool,
}

/// Work handed to the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    /// Read the current value of every target. Answers arrive as records
    /// with [`Provenance::Poll`](crate::record::Provenance::Poll).
    Poll(Vec<PollTarget>),
}

/// Cloneable handle for submitting requests and observing state.
#[derive(Debug, Clone)]
pub struct SessionRequester {
    requests: mpsc::Sender<SessionRequest>,
    state: watch::Receiver<SessionState>,
}

impl SessionRequester {
    /// Wrap existing channels. [`SessionHandle::requester`] is the usual
    /// way to obtain one.
    pub fn new(
        requests: mpsc::Sender<SessionRequest>,
        state: watch::Receiver<SessionState>,
    ) -> Self {
        Self { requests, state }
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Queue a request. Returns `false` once the session task has stopped.
    pub async fn submit(&self, request: SessionRequest) -> bool {
        self.requests.send(request).await.is_ok()
    }
}

// ── SessionHandle ────────────────────────────────────────────────────

/// Handle to the background session task.
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    requests: mpsc::Sender<SessionRequest>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), Error>>,
}

impl SessionHandle {
    /// Spawn the session task. Decoded records are sent to `records`; a
    /// full queue pauses reading from the Miniserver.
    pub fn spawn(
        config: SessionConfig,
        records: mpsc::Sender<DecodedRecord>,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            session_loop(config, records, requests_rx, state_tx, task_cancel).await
        });

        Self {
            state: state_rx,
            requests: requests_tx,
            cancel,
            task,
        }
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn requester(&self) -> SessionRequester {
        SessionRequester::new(self.requests.clone(), self.state.clone())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to finish and return its terminal result.
    pub async fn join(self) -> Result<(), Error> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::WebSocketConnect(format!("session task aborted: {e}"))),
        }
    }
}

// ── Background loop ──────────────────────────────────────────────────

/// connect → authenticate → run → on failure back off → reconnect.
async fn session_loop(
    config: SessionConfig,
    records: mpsc::Sender<DecodedRecord>,
    mut requests: mpsc::Receiver<SessionRequest>,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let http = config.transport.build_client()?;
    let mut backoff = Backoff::new(config.reconnect.clone());

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = Connection::establish(&config, &http, &state) => result,
        };

        let error = match result {
            Ok(connection) => {
                backoff.reset();
                state.send_replace(SessionState::Active);
                tracing::info!("Miniserver session active");

                match connection.run(&config, &records, &mut requests, &cancel).await {
                    Ok(Outcome::Stopped) => break,
                    Ok(Outcome::ConsumerGone) => {
                        tracing::debug!("record consumer dropped, stopping session");
                        break;
                    }
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        if error.is_fatal() {
            tracing::error!(error = %error, "unrecoverable session error");
            state.send_replace(SessionState::Failed);
            return Err(error);
        }
        tracing::warn!(error = %error, failures = backoff.failures() + 1, "Miniserver session lost");

        let Some(delay) = backoff.record_failure() else {
            let attempts = backoff.failures();
            tracing::error!(attempts, "Miniserver reconnection limit reached, giving up");
            state.send_replace(SessionState::Failed);
            return Err(Error::RetriesExhausted { attempts });
        };

        state.send_replace(SessionState::Reconnecting {
            attempt: backoff.failures(),
        });
        tracing::info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = backoff.failures(),
            "Waiting before reconnect"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    state.send_replace(SessionState::Disconnected);
    tracing::debug!("session loop exiting");
    Ok(())
}
