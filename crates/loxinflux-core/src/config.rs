// ── Runtime bridge configuration ──
//
// These types describe *what* to connect to and *where* to deliver.
// They carry credential data and tuning, but never touch disk. The
// config crate builds a `BridgeConfig` and hands it in.

use std::time::Duration;

use loxinflux_api::{Credentials, ReconnectConfig, SessionConfig, TlsMode};
use secrecy::SecretString;
use strum::{Display, EnumString};

use crate::error::CoreError;
use crate::filter::FilterRuleSet;
use crate::format::FormatSettings;

/// How to reach and authenticate with the Miniserver.
#[derive(Debug, Clone)]
pub struct MiniserverSettings {
    pub host: String,
    /// 443 selects HTTPS/WSS.
    pub port: u16,
    pub user: String,
    pub password: SecretString,
    pub visu_password: Option<SecretString>,
    pub tls: TlsMode,
    /// Consecutive reconnect failures before giving up. `0` = unlimited.
    pub max_reconnect_attempts: u32,
    pub keepalive_interval: Duration,
    pub keepalive_timeout_factor: u32,
    pub command_timeout: Duration,
    pub token_refresh_margin: Duration,
}

impl Default for MiniserverSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 80,
            user: "admin".into(),
            password: SecretString::from("admin"),
            visu_password: None,
            tls: TlsMode::DangerAcceptInvalid,
            max_reconnect_attempts: 0,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout_factor: 3,
            command_timeout: Duration::from_secs(10),
            token_refresh_margin: Duration::from_secs(3600),
        }
    }
}

/// Downstream protocol of one delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OutputProtocol {
    /// Datagrams; loss is acceptable.
    Udp,
    /// Persistent stream connection.
    Tcp,
    /// Publish to a broker topic.
    Mqtt,
    /// Lines on the process's standard output.
    #[strum(to_string = "stdout", serialize = "execd")]
    Stdout,
}

/// Broker settings for [`OutputProtocol::Mqtt`].
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub topic: String,
    pub client_id: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            topic: "loxone/metrics".into(),
            client_id: "loxinflux".into(),
        }
    }
}

/// One configured downstream target.
#[derive(Debug, Clone)]
pub struct OutputTarget {
    /// Label used in logs.
    pub name: String,
    pub protocol: OutputProtocol,
    pub host: String,
    pub port: u16,
    /// Backoff and attempt budget for stream and broker channels.
    pub retry: ReconnectConfig,
    /// Required for [`OutputProtocol::Mqtt`].
    pub mqtt: Option<MqttSettings>,
}

impl OutputTarget {
    pub fn new(protocol: OutputProtocol, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            name: format!("{protocol}://{host}:{port}"),
            protocol,
            host,
            port,
            retry: ReconnectConfig {
                max_attempts: 100,
                ..ReconnectConfig::default()
            },
            mqtt: None,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Poll scheduler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
        }
    }
}

/// Everything the bridge needs at runtime.
///
/// Built by the config crate or the binary, passed to
/// [`Bridge`](crate::Bridge). Core never reads config files.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub miniserver: MiniserverSettings,
    pub poll: PollSettings,
    pub format: FormatSettings,
    pub filters: FilterRuleSet,
    pub outputs: Vec<OutputTarget>,
    /// Capacity of the record queue between the session and the pipeline,
    /// and of each delivery channel's queue.
    pub queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            miniserver: MiniserverSettings::default(),
            poll: PollSettings::default(),
            format: FormatSettings::default(),
            filters: FilterRuleSet::default(),
            outputs: vec![OutputTarget::new(OutputProtocol::Udp, "0.0.0.0", 8086)],
            queue_capacity: 4096,
        }
    }
}

impl BridgeConfig {
    /// Session parameters for `loxinflux-api`.
    pub fn session_config(&self) -> Result<SessionConfig, CoreError> {
        let ms = &self.miniserver;
        let base_url = loxinflux_api::transport::base_url(&ms.host, ms.port)?;

        let mut config = SessionConfig::new(
            base_url,
            Credentials {
                user: ms.user.clone(),
                password: ms.password.clone(),
                visu_password: ms.visu_password.clone(),
            },
        );
        config.transport.tls = ms.tls;
        config.transport.timeout = ms.command_timeout;
        config.reconnect.max_attempts = ms.max_reconnect_attempts;
        config.keepalive_interval = ms.keepalive_interval;
        config.keepalive_timeout_factor = ms.keepalive_timeout_factor;
        config.command_timeout = ms.command_timeout;
        config.token_refresh_margin = ms.token_refresh_margin;
        Ok(config)
    }
}
