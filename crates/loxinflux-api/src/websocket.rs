//! One authenticated WebSocket connection to the Miniserver.
//!
//! [`Connection::establish`] performs the handshake (public key, session key
//! exchange, token request, status-update subscription);
//! [`Connection::run`] then multiplexes inbound frames, keepalive, token
//! refresh and poll requests until the connection fails or is cancelled.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthToken, HashAlg, KeySalt, TokenGrant, TokenRenewal};
use crate::crypto::SessionCipher;
use crate::error::Error;
use crate::protocol::commands::{self, TokenPermission};
use crate::protocol::{Frame, FrameDecoder, LoxResponse};
use crate::record::{DecodedRecord, Provenance, RecordValue};
use crate::session::{PollTarget, SessionConfig, SessionRequest, SessionState};
use crate::transport::websocket_url;

const SUBPROTOCOL: &str = "remotecontrol";

/// Minimum spacing between two token refreshes.
const REFRESH_SPACING: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn timeout(after: Duration, waiting_for: &'static str) -> Error {
    Error::Timeout {
        timeout_secs: after.as_secs(),
        waiting_for,
    }
}

/// Why [`Connection::run`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Cancellation was requested.
    Stopped,
    /// The record receiver was dropped.
    ConsumerGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    ConsumerGone,
}

async fn emit(records: &mpsc::Sender<DecodedRecord>, record: DecodedRecord) -> Flow {
    // Awaiting capacity here is what pauses reads when downstream is slow.
    match records.send(record).await {
        Ok(()) => Flow::Continue,
        Err(_) => Flow::ConsumerGone,
    }
}

// ── Token refresh ────────────────────────────────────────────────────

/// Progress of the two-step refresh running alongside value traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    Idle,
    AwaitingKey { since: Instant },
    AwaitingRenewal { since: Instant },
}

impl Refresh {
    fn started(self) -> Option<Instant> {
        match self {
            Self::Idle => None,
            Self::AwaitingKey { since } | Self::AwaitingRenewal { since } => Some(since),
        }
    }
}

// ── Keepalive ────────────────────────────────────────────────────────

#[derive(Debug)]
struct Keepalive {
    last_ack: Instant,
    timeout: Duration,
}

impl Keepalive {
    fn new(timeout: Duration) -> Self {
        Self {
            last_ack: Instant::now(),
            timeout,
        }
    }

    fn acknowledge(&mut self) {
        self.last_ack = Instant::now();
    }

    fn overdue(&self) -> bool {
        self.last_ack.elapsed() > self.timeout
    }
}

// ── Link: socket + codec + cipher ────────────────────────────────────

struct Link {
    ws: WsStream,
    decoder: FrameDecoder,
    cipher: SessionCipher,
    rng: StdRng,
}

impl Link {
    async fn send(&mut self, command: &str, encrypt: bool) -> Result<(), Error> {
        let text = if encrypt {
            tracing::trace!(command, "sending encrypted command");
            self.cipher.encrypt_command(&mut self.rng, command)
        } else {
            tracing::trace!(command, "sending command");
            command.to_owned()
        };
        self.ws
            .send(Message::text(text))
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))
    }

    /// Feed one transport message into the decoder.
    fn ingest(
        &mut self,
        message: Option<Result<Message, tungstenite::Error>>,
    ) -> Result<(), Error> {
        match message {
            Some(Ok(Message::Binary(bytes))) => self.decoder.extend(&bytes),
            Some(Ok(Message::Text(text))) => self.decoder.extend(text.as_str().as_bytes()),
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame.map_or((1005, String::new()), |cf| {
                    (u16::from(cf.code), cf.reason.as_str().to_owned())
                });
                tracing::info!(code, reason = %reason, "WebSocket close frame received");
                return Err(Error::WebSocketClosed { code, reason });
            }
            Some(Ok(_)) => {
                // tungstenite answers pings itself
            }
            Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
            None => {
                return Err(Error::WebSocketClosed {
                    code: 1006,
                    reason: "stream ended".into(),
                });
            }
        }
        Ok(())
    }

    /// Next complete frame, skipping frames that failed to decode.
    fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            match self.decoder.next_frame() {
                Ok(frame) => return Ok(frame),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "discarding malformed frame");
                }
                Err(e) => {
                    self.decoder.reset();
                    return Err(e.into());
                }
            }
        }
    }

    /// Send a handshake command and wait for its text answer. Other frames
    /// received meanwhile are kept in `backlog`.
    async fn request(
        &mut self,
        command: &str,
        encrypt: bool,
        waiting_for: &'static str,
        within: Duration,
        backlog: &mut VecDeque<Frame>,
    ) -> Result<LoxResponse, Error> {
        self.send(command, encrypt).await?;
        tokio::time::timeout(within, self.await_response(backlog))
            .await
            .map_err(|_| timeout(within, waiting_for))?
    }

    async fn await_response(&mut self, backlog: &mut VecDeque<Frame>) -> Result<LoxResponse, Error> {
        loop {
            while let Some(frame) = self.next_frame()? {
                match frame {
                    Frame::Text(text) => return Ok(LoxResponse::parse(&text)?),
                    Frame::OutOfService => return Err(Error::OutOfService),
                    Frame::Keepalive => {}
                    other => backlog.push_back(other),
                }
            }
            let message = self.ws.next().await;
            self.ingest(message)?;
        }
    }
}

// ── Connection ───────────────────────────────────────────────────────

pub(crate) struct Connection {
    link: Link,
    token: AuthToken,
    hash_alg: HashAlg,
    /// Frames that arrived while a handshake step waited for its answer.
    backlog: VecDeque<Frame>,
    /// Secured poll targets waiting for their `getvisusalt` answer, in send order.
    visu_queue: VecDeque<String>,
    refresh: Refresh,
    last_refresh: Option<Instant>,
    keepalive: Keepalive,
}

impl Connection {
    /// Connect and authenticate. Publishes `KeyExchange` and
    /// `Authenticating` on `state` as it goes.
    pub(crate) async fn establish(
        config: &SessionConfig,
        http: &reqwest::Client,
        state: &watch::Sender<SessionState>,
    ) -> Result<Self, Error> {
        state.send_replace(SessionState::KeyExchange);
        let public_key = auth::fetch_public_key(http, &config.base_url).await?;

        let ws_url = websocket_url(&config.base_url)?;
        tracing::info!(url = %ws_url, "Connecting to Miniserver");
        let uri: tungstenite::http::Uri = ws_url.as_str().parse().map_err(
            |e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()),
        )?;
        let request = ClientRequestBuilder::new(uri).with_sub_protocol(SUBPROTOCOL);
        let connector = config.transport.websocket_connector(&ws_url)?;
        let (ws, _response) = tokio::time::timeout(
            config.command_timeout,
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector)),
        )
        .await
        .map_err(|_| timeout(config.command_timeout, "websocket upgrade"))?
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let mut rng = StdRng::from_entropy();
        let cipher = SessionCipher::generate(&mut rng);
        let session_key = cipher.wrap_session_key(&mut rng, &public_key)?;

        let mut link = Link {
            ws,
            decoder: FrameDecoder::new(config.max_payload),
            cipher,
            rng,
        };
        let mut backlog = VecDeque::new();
        let within = config.command_timeout;

        link.request(
            &commands::key_exchange(&session_key),
            false,
            "keyexchange",
            within,
            &mut backlog,
        )
        .await?
        .require_success("keyexchange")
        .map_err(|e| Error::KeyExchange(e.to_string()))?;
        tracing::debug!("session key accepted");

        state.send_replace(SessionState::Authenticating);
        let creds = &config.credentials;
        let key_salt: KeySalt = link
            .request(&commands::get_key2(&creds.user), true, "getkey2", within, &mut backlog)
            .await?
            .require_success("getkey2")?
            .value_as()?;
        let hash = key_salt.credential_hash(&creds.user, &creds.password)?;

        let get_jwt = commands::get_jwt(
            &hash,
            &creds.user,
            TokenPermission::App,
            &config.client_uuid,
            &config.client_info,
        );
        let grant: TokenGrant = link
            .request(&get_jwt, true, "getjwt", within, &mut backlog)
            .await?
            .require_success("getjwt")?
            .value_as()?;
        let token = AuthToken::from_grant(grant);
        tracing::info!(valid_until = %token.valid_until, "token acquired");

        link.request(
            commands::ENABLE_STATUS_UPDATES,
            false,
            "enablebinstatusupdate",
            within,
            &mut backlog,
        )
        .await?
        .require_success("enablebinstatusupdate")?;

        Ok(Self {
            link,
            token,
            hash_alg: key_salt.hash_alg,
            backlog,
            visu_queue: VecDeque::new(),
            refresh: Refresh::Idle,
            last_refresh: None,
            keepalive: Keepalive::new(config.keepalive_timeout()),
        })
    }

    /// Drive the connection until it fails or is cancelled.
    pub(crate) async fn run(
        mut self,
        config: &SessionConfig,
        records: &mpsc::Sender<DecodedRecord>,
        requests: &mut mpsc::Receiver<SessionRequest>,
        cancel: &CancellationToken,
    ) -> Result<Outcome, Error> {
        self.keepalive.acknowledge();
        while let Some(frame) = self.backlog.pop_front() {
            if self.handle_frame(config, frame, records).await? == Flow::ConsumerGone {
                return Ok(Outcome::ConsumerGone);
            }
        }
        if self.drain(config, records).await? == Flow::ConsumerGone {
            return Ok(Outcome::ConsumerGone);
        }

        let mut keepalive_tick = tokio::time::interval_at(
            Instant::now() + config.keepalive_interval,
            config.keepalive_interval,
        );
        let mut requests_open = true;

        loop {
            let refresh_at = self.refresh_deadline(config);

            let flow = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = self.link.ws.close(None).await;
                    return Ok(Outcome::Stopped);
                }
                message = self.link.ws.next() => {
                    self.link.ingest(message)?;
                    self.drain(config, records).await?
                }
                _ = keepalive_tick.tick() => {
                    self.on_keepalive_tick(config).await?;
                    Flow::Continue
                }
                () = tokio::time::sleep_until(refresh_at), if self.refresh == Refresh::Idle => {
                    tracing::debug!("refreshing token");
                    self.link.send(commands::GET_ONE_TIME_KEY, false).await?;
                    self.refresh = Refresh::AwaitingKey { since: Instant::now() };
                    Flow::Continue
                }
                request = requests.recv(), if requests_open => {
                    match request {
                        Some(SessionRequest::Poll(targets)) => self.poll(config, &targets).await?,
                        None => requests_open = false,
                    }
                    Flow::Continue
                }
            };

            if flow == Flow::ConsumerGone {
                return Ok(Outcome::ConsumerGone);
            }
        }
    }

    async fn drain(
        &mut self,
        config: &SessionConfig,
        records: &mpsc::Sender<DecodedRecord>,
    ) -> Result<Flow, Error> {
        while let Some(frame) = self.link.next_frame()? {
            if self.handle_frame(config, frame, records).await? == Flow::ConsumerGone {
                return Ok(Flow::ConsumerGone);
            }
        }
        Ok(Flow::Continue)
    }

    fn refresh_deadline(&self, config: &SessionConfig) -> Instant {
        let margin = TimeDelta::from_std(config.token_refresh_margin).unwrap_or(TimeDelta::hours(1));
        let until = (self.token.refresh_at(margin) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let due = Instant::now() + until;
        match self.last_refresh {
            Some(last) => due.max(last + REFRESH_SPACING),
            None => due,
        }
    }

    async fn on_keepalive_tick(&mut self, config: &SessionConfig) -> Result<(), Error> {
        if self.keepalive.overdue() {
            return Err(timeout(self.keepalive.timeout, "keepalive response"));
        }
        if let Some(since) = self.refresh.started() {
            if since.elapsed() > config.command_timeout {
                return Err(Error::TokenRefresh {
                    message: "refresh request was not answered".into(),
                });
            }
        }
        self.link.send(commands::KEEPALIVE, false).await
    }

    async fn handle_frame(
        &mut self,
        config: &SessionConfig,
        frame: Frame,
        records: &mpsc::Sender<DecodedRecord>,
    ) -> Result<Flow, Error> {
        match frame {
            Frame::ValueStates(states) => {
                tracing::trace!(count = states.len(), "value states");
                for state in states {
                    let value = RecordValue::Number(state.value);
                    let record = DecodedRecord::new(state.uuid.to_string(), value, Provenance::Push);
                    if emit(records, record).await == Flow::ConsumerGone {
                        return Ok(Flow::ConsumerGone);
                    }
                }
            }
            Frame::TextStates(states) => {
                tracing::trace!(count = states.len(), "text states");
                for state in states {
                    let value = RecordValue::Text(state.text);
                    let record = DecodedRecord::new(state.uuid.to_string(), value, Provenance::Push);
                    if emit(records, record).await == Flow::ConsumerGone {
                        return Ok(Flow::ConsumerGone);
                    }
                }
            }
            Frame::Text(text) => return self.on_response(config, &text, records).await,
            Frame::Keepalive => {
                tracing::trace!("keepalive acknowledged");
                self.keepalive.acknowledge();
            }
            Frame::OutOfService => return Err(Error::OutOfService),
            Frame::Binary(bytes) => tracing::debug!(len = bytes.len(), "ignoring binary file"),
            Frame::Opaque { kind, len } => tracing::trace!(%kind, len, "ignoring table"),
        }
        Ok(Flow::Continue)
    }

    async fn on_response(
        &mut self,
        config: &SessionConfig,
        text: &str,
        records: &mpsc::Sender<DecodedRecord>,
    ) -> Result<Flow, Error> {
        let response = match LoxResponse::parse(text) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed response");
                return Ok(Flow::Continue);
            }
        };

        if let Some(uuid) = response.io_target() {
            if !response.is_success() {
                tracing::warn!(uuid, code = response.code, "poll request rejected");
                return Ok(Flow::Continue);
            }
            let value = RecordValue::coerce(&response.value_text());
            let outputs = response
                .outputs
                .iter()
                .map(|o| (o.name.clone(), RecordValue::coerce(&o.value_text())))
                .collect();
            let record = DecodedRecord::new(uuid, value, Provenance::Poll).with_outputs(outputs);
            return Ok(emit(records, record).await);
        }

        let path = response.path();
        if path.starts_with("dev/sys/getvisusalt/") {
            self.on_visu_salt(config, &response).await?;
        } else if path == "dev/sys/getkey" {
            self.on_refresh_key(config, &response).await?;
        } else if path.starts_with("dev/sys/refreshjwt/")
            || (response.is_encrypted_echo()
                && matches!(self.refresh, Refresh::AwaitingRenewal { .. }))
        {
            self.on_renewal(&response)?;
        } else {
            tracing::debug!(control = %response.control, code = response.code, "unsolicited response");
        }
        Ok(Flow::Continue)
    }

    async fn on_refresh_key(
        &mut self,
        config: &SessionConfig,
        response: &LoxResponse,
    ) -> Result<(), Error> {
        if !matches!(self.refresh, Refresh::AwaitingKey { .. }) {
            tracing::debug!("ignoring unrequested one-time key");
            return Ok(());
        }
        if !response.is_success() {
            return Err(Error::TokenRefresh {
                message: format!("getkey answered {}", response.code),
            });
        }
        let hash = auth::token_hash(self.hash_alg, &response.value_text(), &self.token.token)?;
        let command = commands::refresh_jwt(&hash, &config.credentials.user);
        self.link.send(&command, true).await?;
        self.refresh = Refresh::AwaitingRenewal {
            since: Instant::now(),
        };
        Ok(())
    }

    fn on_renewal(&mut self, response: &LoxResponse) -> Result<(), Error> {
        if !response.is_success() {
            return Err(Error::TokenRefresh {
                message: format!("refreshjwt answered {}", response.code),
            });
        }
        let renewal: TokenRenewal = response.value_as()?;
        self.token.renew(&renewal);
        self.refresh = Refresh::Idle;
        self.last_refresh = Some(Instant::now());
        tracing::info!(valid_until = %self.token.valid_until, "token refreshed");
        Ok(())
    }

    async fn on_visu_salt(
        &mut self,
        config: &SessionConfig,
        response: &LoxResponse,
    ) -> Result<(), Error> {
        let Some(uuid) = self.visu_queue.pop_front() else {
            tracing::debug!("visualisation salt without pending request");
            return Ok(());
        };
        if !response.is_success() {
            tracing::warn!(uuid, code = response.code, "visualisation salt rejected");
            return Ok(());
        }
        let Some(visu_password) = &config.credentials.visu_password else {
            return Ok(());
        };
        let hash = match response
            .value_as::<KeySalt>()
            .and_then(|salt| salt.visu_hash(visu_password))
        {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(uuid, error = %e, "cannot hash visualisation password");
                return Ok(());
            }
        };
        self.link
            .send(&commands::secured_io_all(&hash, &uuid), false)
            .await
    }

    async fn poll(&mut self, config: &SessionConfig, targets: &[PollTarget]) -> Result<(), Error> {
        let creds = &config.credentials;
        let mut sent = 0usize;
        for target in targets {
            if target.secured {
                if creds.visu_password.is_none() {
                    tracing::warn!(
                        uuid = %target.uuid,
                        "skipping secured device: no visualisation password configured"
                    );
                    continue;
                }
                self.visu_queue.push_back(target.uuid.clone());
                self.link
                    .send(&commands::get_visu_salt(&creds.user), false)
                    .await?;
            } else {
                self.link.send(&commands::io_all(&target.uuid), false).await?;
            }
            sent += 1;
        }
        tracing::debug!(sent, requested = targets.len(), "poll requests sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn keepalive_goes_overdue_after_timeout() {
        let mut keepalive = Keepalive::new(Duration::from_secs(90));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!keepalive.overdue());

        keepalive.acknowledge();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(!keepalive.overdue());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(keepalive.overdue());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_tracks_start_time() {
        assert_eq!(Refresh::Idle.started(), None);
        let since = Instant::now();
        assert_eq!(Refresh::AwaitingRenewal { since }.started(), Some(since));
    }
}
