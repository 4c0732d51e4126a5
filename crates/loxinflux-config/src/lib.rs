//! Configuration for the loxinflux bridge.
//!
//! A `config.toml` in the config directory, overridden by `LOXINFLUX_`
//! environment variables, validated and translated to
//! `loxinflux_core::BridgeConfig`. The file-backed structure snapshot the
//! bridge reads on start and after every reconnect lives here too.

mod structure;

pub use structure::{FileStructureSource, STRUCTURE_FILE};

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use loxinflux_api::TlsMode;
use loxinflux_core::format::MAX_PRECISION;
use loxinflux_core::{
    BridgeConfig, FilterRuleSet, FilterRules, FormatSettings, MiniserverSettings, MqttSettings,
    OutputProtocol, OutputTarget, PollSettings,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE: &str = "config.toml";
/// Environment prefix; `__` separates sections (`LOXINFLUX_MINISERVER__HOST`).
pub const ENV_PREFIX: &str = "LOXINFLUX_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub general: General,
    pub logging: Logging,
    pub miniserver: Miniserver,
    pub paths: Paths,
    /// Primary delivery target.
    pub telegraf: Output,
    /// Additional delivery targets, same shape as `[telegraf]`.
    pub outputs: Vec<Output>,
    pub filters: Filters,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct General {
    /// Poll devices the event stream does not cover.
    pub grabber: bool,
    /// Seconds between polls.
    pub grabber_interval: u64,
    pub round_floats: bool,
    pub rounding_precision: u32,
    /// Append the receipt time (ns) to every line.
    pub timestamps: bool,
    pub queue_capacity: usize,
}

impl Default for General {
    fn default() -> Self {
        Self {
            grabber: true,
            grabber_interval: 300,
            round_floats: false,
            rounding_precision: 5,
            timestamps: false,
            queue_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// `DEBUG`, `INFO`, `WARNING`, `ERROR`, `CRITICAL` (or the `tracing`
    /// names), case-insensitive.
    pub level: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "INFO".into(),
        }
    }
}

impl Logging {
    /// The level as a `tracing` filter directive.
    pub fn directive(&self) -> Result<&'static str, ConfigError> {
        level_directive(&self.level)
    }
}

/// Map a configured level name to a `tracing` directive.
pub fn level_directive(level: &str) -> Result<&'static str, ConfigError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" | "critical" => Ok("error"),
        other => Err(invalid(
            "logging.level",
            format!("expected DEBUG, INFO, WARNING, ERROR or CRITICAL, got '{other}'"),
        )),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Miniserver {
    pub host: String,
    /// 443 selects HTTPS/WSS.
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Needed only for devices secured with a visualisation password.
    pub visu_password: Option<String>,
    /// Verify the Miniserver certificate (off: Miniservers are usually
    /// self-signed).
    pub verify_tls: bool,
    /// `0` = unlimited.
    pub max_reconnect_attempts: u32,
    pub keepalive_interval: u64,
    pub keepalive_timeout_factor: u32,
    pub command_timeout: u64,
    pub token_refresh_margin: u64,
}

impl Default for Miniserver {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 80,
            user: "admin".into(),
            password: "admin".into(),
            visu_password: None,
            verify_tls: false,
            max_reconnect_attempts: 0,
            keepalive_interval: 30,
            keepalive_timeout_factor: 3,
            command_timeout: 10,
            token_refresh_margin: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Paths {
    /// Holds `structure.json`.
    pub data_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

/// One delivery target.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Output {
    pub host: String,
    pub port: u16,
    /// `udp`, `tcp`, `mqtt`, `execd` or `stdout`.
    pub protocol: String,
    /// `0` = unlimited.
    pub max_retries: u32,
    pub mqtt: Mqtt,
}

impl Default for Output {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8086,
            protocol: "udp".into(),
            max_retries: 100,
            mqtt: Mqtt::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Mqtt {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub client_id: String,
}

impl Default for Mqtt {
    fn default() -> Self {
        let settings = MqttSettings::default();
        Self {
            host: settings.host,
            port: settings.port,
            username: None,
            password: None,
            topic: settings.topic,
            client_id: settings.client_id,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Filters {
    /// Types dropped from every source.
    pub type_blacklist: Vec<String>,
    /// Rules for pushed values.
    pub websocket: SourceFilters,
    /// Rules for polled values.
    pub grabber: SourceFilters,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceFilters {
    pub type_whitelist: Vec<String>,
    pub type_blacklist: Vec<String>,
    pub uuid_whitelist: Vec<String>,
    pub uuid_blacklist: Vec<String>,
}

impl SourceFilters {
    fn rules(&self) -> FilterRules {
        FilterRules::new(
            self.type_whitelist.iter().map(String::as_str),
            self.type_blacklist.iter().map(String::as_str),
            self.uuid_whitelist.iter().map(String::as_str),
            self.uuid_blacklist.iter().map(String::as_str),
        )
    }
}

// ── Config directory ────────────────────────────────────────────────

/// Platform config directory, or `./config` when none can be determined.
pub fn default_config_dir() -> PathBuf {
    ProjectDirs::from("", "", "loxinflux").map_or_else(
        || PathBuf::from("config"),
        |dirs| dirs.config_dir().to_path_buf(),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Defaults, then `<config_dir>/config.toml`, then the environment.
pub fn figment(config_dir: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(config_dir.join(CONFIG_FILE)))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load the configuration. A missing file leaves the defaults in place.
pub fn load_config(config_dir: &Path) -> Result<Config, ConfigError> {
    Ok(figment(config_dir).extract()?)
}

impl Config {
    /// Parse a TOML document on top of the defaults, ignoring the environment.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Ok(Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?)
    }

    pub fn structure_source(&self) -> FileStructureSource {
        FileStructureSource::in_dir(&self.paths.data_dir)
    }

    /// Validate and build the runtime configuration.
    pub fn to_bridge_config(&self) -> Result<BridgeConfig, ConfigError> {
        self.logging.directive()?;

        let general = &self.general;
        if general.grabber_interval == 0 {
            return Err(invalid("general.grabber_interval", "must be at least 1 second"));
        }
        if general.rounding_precision > MAX_PRECISION {
            return Err(invalid(
                "general.rounding_precision",
                format!("must be at most {MAX_PRECISION}"),
            ));
        }
        if general.queue_capacity == 0 {
            return Err(invalid("general.queue_capacity", "must be at least 1"));
        }

        let mut outputs = vec![self.telegraf.target("telegraf")?];
        for (i, output) in self.outputs.iter().enumerate() {
            outputs.push(output.target(&format!("outputs[{i}]"))?);
        }

        Ok(BridgeConfig {
            miniserver: self.miniserver.settings()?,
            poll: PollSettings {
                enabled: general.grabber,
                interval: Duration::from_secs(general.grabber_interval),
            },
            format: FormatSettings {
                round_floats: general.round_floats,
                precision: general.rounding_precision,
                timestamps: general.timestamps,
            },
            filters: FilterRuleSet::new(
                self.filters.type_blacklist.iter().map(String::as_str),
                self.filters.websocket.rules(),
                self.filters.grabber.rules(),
            ),
            outputs,
            queue_capacity: general.queue_capacity,
        })
    }
}

impl Miniserver {
    fn settings(&self) -> Result<MiniserverSettings, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(invalid("miniserver.host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("miniserver.port", "must not be 0"));
        }
        if self.user.is_empty() {
            return Err(invalid("miniserver.user", "must not be empty"));
        }
        if self.keepalive_interval == 0 {
            return Err(invalid("miniserver.keepalive_interval", "must be at least 1 second"));
        }
        if self.command_timeout == 0 {
            return Err(invalid("miniserver.command_timeout", "must be at least 1 second"));
        }

        Ok(MiniserverSettings {
            host: self.host.trim().to_owned(),
            port: self.port,
            user: self.user.clone(),
            password: SecretString::from(self.password.clone()),
            visu_password: self
                .visu_password
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(SecretString::from),
            tls: if self.verify_tls {
                TlsMode::System
            } else {
                TlsMode::DangerAcceptInvalid
            },
            max_reconnect_attempts: self.max_reconnect_attempts,
            keepalive_interval: Duration::from_secs(self.keepalive_interval),
            keepalive_timeout_factor: self.keepalive_timeout_factor.max(1),
            command_timeout: Duration::from_secs(self.command_timeout),
            token_refresh_margin: Duration::from_secs(self.token_refresh_margin),
        })
    }
}

impl Output {
    fn target(&self, section: &str) -> Result<OutputTarget, ConfigError> {
        let protocol = OutputProtocol::from_str(self.protocol.trim()).map_err(|_| {
            invalid(
                format!("{section}.protocol"),
                format!(
                    "expected udp, tcp, mqtt, execd or stdout, got '{}'",
                    self.protocol
                ),
            )
        })?;

        let mut target = match protocol {
            OutputProtocol::Stdout => {
                let mut target = OutputTarget::new(protocol, "-", 0);
                target.name = "stdout".into();
                target
            }
            OutputProtocol::Mqtt => {
                let mqtt = self.mqtt.settings(section)?;
                let mut target = OutputTarget::new(protocol, mqtt.host.clone(), mqtt.port);
                target.name = format!("mqtt://{}:{}/{}", mqtt.host, mqtt.port, mqtt.topic);
                target.mqtt = Some(mqtt);
                target
            }
            OutputProtocol::Udp | OutputProtocol::Tcp => {
                if self.host.trim().is_empty() {
                    return Err(invalid(format!("{section}.host"), "must not be empty"));
                }
                if self.port == 0 {
                    return Err(invalid(format!("{section}.port"), "must not be 0"));
                }
                OutputTarget::new(protocol, self.host.trim(), self.port)
            }
        };
        target.retry.max_attempts = self.max_retries;
        Ok(target)
    }
}

impl Mqtt {
    fn settings(&self, section: &str) -> Result<MqttSettings, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(invalid(format!("{section}.mqtt.host"), "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid(format!("{section}.mqtt.port"), "must not be 0"));
        }
        if self.topic.is_empty() {
            return Err(invalid(format!("{section}.mqtt.topic"), "must not be empty"));
        }
        Ok(MqttSettings {
            host: self.host.trim().to_owned(),
            port: self.port,
            username: self.username.clone().filter(|u| !u.is_empty()),
            password: self.password.clone().map(SecretString::from),
            topic: self.topic.clone(),
            client_id: self.client_id.clone(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    fn validation_field(err: ConfigError) -> String {
        match err {
            ConfigError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn defaults_describe_a_udp_bridge_with_polling() {
        let bridge = Config::default().to_bridge_config().unwrap();

        assert!(bridge.poll.enabled);
        assert_eq!(bridge.poll.interval, Duration::from_secs(300));
        assert_eq!(bridge.queue_capacity, 4096);
        assert!(!bridge.format.round_floats);
        assert_eq!(bridge.format.precision, 5);
        assert_eq!(bridge.miniserver.port, 80);
        assert_eq!(bridge.miniserver.tls, TlsMode::DangerAcceptInvalid);
        assert!(bridge.miniserver.visu_password.is_none());

        assert_eq!(bridge.outputs.len(), 1);
        let udp = &bridge.outputs[0];
        assert_eq!(udp.protocol, OutputProtocol::Udp);
        assert_eq!(udp.address(), "0.0.0.0:8086");
        assert_eq!(udp.retry.max_attempts, 100);
    }

    #[test]
    fn parses_every_section() {
        let config = Config::from_toml(
            r#"
            [general]
            grabber = false
            round_floats = true
            rounding_precision = 2
            timestamps = true

            [logging]
            level = "warning"

            [miniserver]
            host = "192.168.1.77"
            port = 443
            user = "grafana"
            password = "s3cret"
            visu_password = "1234"
            max_reconnect_attempts = 5

            [paths]
            data_dir = "/var/lib/loxinflux"

            [telegraf]
            protocol = "MQTT"
            max_retries = 0

            [telegraf.mqtt]
            host = "broker.lan"
            topic = "home/loxone"
            username = "lox"

            [[outputs]]
            host = "127.0.0.1"
            port = 8094
            protocol = "tcp"

            [[outputs]]
            protocol = "execd"

            [filters]
            type_blacklist = ["Pushbutton"]

            [filters.websocket]
            uuid_blacklist = ["0f1e2d3c-0123-4567-ffff8899aabbccdd"]

            [filters.grabber]
            type_whitelist = ["meter", "InfoOnlyAnalog"]
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.directive().unwrap(), "warn");
        assert_eq!(
            config.structure_source().path(),
            Path::new("/var/lib/loxinflux/structure.json")
        );

        let bridge = config.to_bridge_config().unwrap();
        assert!(!bridge.poll.enabled);
        assert!(bridge.format.round_floats);
        assert_eq!(bridge.format.precision, 2);
        assert!(bridge.format.timestamps);

        let ms = &bridge.miniserver;
        assert_eq!(ms.host, "192.168.1.77");
        assert_eq!(ms.user, "grafana");
        assert_eq!(ms.password.expose_secret(), "s3cret");
        assert_eq!(ms.visu_password.as_ref().unwrap().expose_secret(), "1234");
        assert_eq!(ms.max_reconnect_attempts, 5);

        let protocols: Vec<OutputProtocol> = bridge.outputs.iter().map(|o| o.protocol).collect();
        assert_eq!(
            protocols,
            vec![OutputProtocol::Mqtt, OutputProtocol::Tcp, OutputProtocol::Stdout]
        );
        let mqtt = bridge.outputs[0].mqtt.as_ref().unwrap();
        assert_eq!(mqtt.host, "broker.lan");
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.topic, "home/loxone");
        assert_eq!(mqtt.username.as_deref(), Some("lox"));
        assert_eq!(bridge.outputs[0].retry.max_attempts, 0);
        assert_eq!(bridge.outputs[1].address(), "127.0.0.1:8094");
        assert_eq!(bridge.outputs[2].name, "stdout");

        assert!(bridge.filters.global_type_deny.contains("PUSHBUTTON"));
        assert!(
            bridge
                .filters
                .push
                .id_deny
                .contains("0f1e2d3c-0123-4567-ffff8899aabbccdd")
        );
        assert!(bridge.filters.poll.type_allow.contains("METER"));
        assert!(bridge.filters.poll.type_allow.contains("INFOONLYANALOG"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cases = [
            ("[general]\nrounding_precision = 16", "general.rounding_precision"),
            ("[general]\ngrabber_interval = 0", "general.grabber_interval"),
            ("[general]\nqueue_capacity = 0", "general.queue_capacity"),
            ("[logging]\nlevel = \"loud\"", "logging.level"),
            ("[miniserver]\nhost = \"\"", "miniserver.host"),
            ("[telegraf]\nprotocol = \"carrier-pigeon\"", "telegraf.protocol"),
            ("[telegraf]\nport = 0", "telegraf.port"),
            (
                "[telegraf]\nprotocol = \"mqtt\"\n[telegraf.mqtt]\ntopic = \"\"",
                "telegraf.mqtt.topic",
            ),
            ("[[outputs]]\nprotocol = \"smtp\"", "outputs[0].protocol"),
        ];
        for (toml, field) in cases {
            let err = Config::from_toml(toml)
                .unwrap()
                .to_bridge_config()
                .unwrap_err();
            assert_eq!(validation_field(err), field, "{toml}");
        }
    }

    #[test]
    fn precision_fifteen_is_accepted() {
        let config = Config::from_toml("[general]\nrounding_precision = 15").unwrap();
        assert_eq!(config.to_bridge_config().unwrap().format.precision, 15);
    }

    #[test]
    fn level_names_map_to_tracing_directives() {
        assert_eq!(level_directive("DEBUG").unwrap(), "debug");
        assert_eq!(level_directive("Critical").unwrap(), "error");
        assert_eq!(level_directive(" info ").unwrap(), "info");
        assert!(level_directive("verbose").is_err());
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                [miniserver]
                host = "10.0.0.2"
                user = "reader"

                [telegraf]
                port = 8092
                "#,
            )?;
            jail.set_env("LOXINFLUX_MINISERVER__HOST", "10.0.0.9");
            jail.set_env("LOXINFLUX_GENERAL__GRABBER_INTERVAL", "60");

            let config = load_config(jail.directory()).map_err(|e| e.to_string())?;
            assert_eq!(config.miniserver.host, "10.0.0.9");
            assert_eq!(config.miniserver.user, "reader");
            assert_eq!(config.general.grabber_interval, 60);
            assert_eq!(config.telegraf.port, 8092);
            Ok(())
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            let config = load_config(jail.directory()).map_err(|e| e.to_string())?;
            assert_eq!(config.miniserver.port, 80);
            assert_eq!(config.telegraf.protocol, "udp");
            Ok(())
        });
    }
}
