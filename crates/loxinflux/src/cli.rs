//! Clap derive structures for the `loxinflux` binary.

use std::path::PathBuf;

use clap::Parser;

/// loxinflux -- stream Loxone Miniserver values to Telegraf
#[derive(Debug, Parser)]
#[command(
    name = "loxinflux",
    version,
    about = "Forward Loxone Miniserver state changes to Telegraf as InfluxDB line protocol",
    long_about = "Connects to a Loxone Miniserver over its encrypted WebSocket API, listens for\n\
        value and text updates, periodically polls devices the event stream does not\n\
        cover, and forwards every kept value to Telegraf over UDP, TCP, MQTT or stdout."
)]
pub struct Cli {
    /// Directory holding config.toml
    #[arg(long, env = "LOXINFLUX_CONFIG_DIR", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Directory holding structure.json (overrides [paths].data_dir)
    #[arg(long, env = "LOXINFLUX_DATA_DIR", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log level: DEBUG, INFO, WARNING, ERROR, CRITICAL (overrides [logging].level)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Validate the configuration and structure snapshot, then exit
    #[arg(long)]
    pub check: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::try_parse_from([
            "loxinflux",
            "--config-dir",
            "/etc/loxinflux",
            "--data-dir",
            "/var/lib/loxinflux",
            "--log-level",
            "DEBUG",
            "--check",
        ])
        .unwrap();

        assert_eq!(cli.config_dir.unwrap(), PathBuf::from("/etc/loxinflux"));
        assert_eq!(cli.data_dir.unwrap(), PathBuf::from("/var/lib/loxinflux"));
        assert_eq!(cli.log_level.as_deref(), Some("DEBUG"));
        assert!(cli.check);
    }
}
