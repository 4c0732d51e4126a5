// ── Publish-subscribe transport ──
//
// Publishes each batch as one message to the configured topic. The broker
// session lives in a background task that polls the rumqttc event loop and
// reconnects with its own backoff; `send` fails fast while it is down so
// the channel's retry policy applies.

use std::time::Duration;

use async_trait::async_trait;
use loxinflux_api::{Backoff, ReconnectConfig};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use secrecy::ExposeSecret;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Transport;
use crate::config::MqttSettings;
use crate::error::DeliveryError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;

struct Session {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    poller: JoinHandle<()>,
}

pub struct MqttTransport {
    name: String,
    settings: MqttSettings,
    session: Option<Session>,
}

impl MqttTransport {
    pub fn new(name: impl Into<String>, settings: MqttSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            session: None,
        }
    }

    fn options(&self) -> MqttOptions {
        let s = &self.settings;
        let mut options = MqttOptions::new(&s.client_id, &s.host, s.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some(user) = &s.username {
            let password = s
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_owned())
                .unwrap_or_default();
            options.set_credentials(user, password);
        }
        options
    }

    fn error(&self, message: impl ToString) -> DeliveryError {
        DeliveryError::Mqtt {
            channel: self.name.clone(),
            message: message.to_string(),
        }
    }

    fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.poller.abort();
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.drop_session();
    }
}

/// Drive the event loop until the transport goes away.
fn spawn_poller(
    name: String,
    mut eventloop: rumqttc::EventLoop,
    connected: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(ReconnectConfig::default());
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    backoff.reset();
                    connected.send_replace(true);
                    tracing::debug!(channel = %name, "broker session established");
                }
                Ok(_) => {}
                Err(e) => {
                    connected.send_replace(false);
                    if connected.is_closed() {
                        break;
                    }
                    let delay = backoff.record_failure().unwrap_or(Duration::from_secs(60));
                    tracing::warn!(
                        channel = %name,
                        error = %e,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "broker connection lost"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    })
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<(), DeliveryError> {
        if let Some(session) = &self.session {
            if *session.connected.borrow() {
                return Ok(());
            }
        } else {
            let (client, eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);
            let (tx, rx) = watch::channel(false);
            let poller = spawn_poller(self.name.clone(), eventloop, tx);
            self.session = Some(Session {
                client,
                connected: rx,
                poller,
            });
        }

        let Some(session) = self.session.as_mut() else {
            return Err(self.error("no broker session"));
        };
        let established = tokio::time::timeout(CONNECT_TIMEOUT, async {
            session.connected.wait_for(|up| *up).await.is_ok()
        })
        .await;

        match established {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.drop_session();
                Err(self.error("broker session ended"))
            }
            Err(_) => Err(DeliveryError::Connect {
                channel: self.name.clone(),
                target: format!("{}:{}", self.settings.host, self.settings.port),
                reason: "no CONNACK from broker".into(),
            }),
        }
    }

    async fn send(&mut self, lines: &[String]) -> Result<(), DeliveryError> {
        let Some(session) = self.session.as_ref() else {
            return Err(DeliveryError::Closed {
                channel: self.name.clone(),
            });
        };
        if !*session.connected.borrow() {
            return Err(self.error("broker connection is down"));
        }

        let payload = lines.join("\n");
        session
            .client
            .publish(&self.settings.topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| self.error(e))
    }

    async fn close(&mut self) {
        if let Some(session) = &self.session {
            let _ = session.client.disconnect().await;
        }
        self.drop_session();
    }
}
