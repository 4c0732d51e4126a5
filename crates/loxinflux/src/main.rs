mod cli;
mod error;
mod logging;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use loxinflux_config::{CONFIG_FILE, Config};
use loxinflux_core::{Bridge, OutputProtocol, StructureSource};

use crate::cli::Cli;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(loxinflux_config::default_config_dir);
    let config_path = config_dir.join(CONFIG_FILE);

    let config = load(&cli, &config_dir).map_err(|source| CliError::config(&config_path, source))?;
    let bridge_config = config
        .to_bridge_config()
        .map_err(|source| CliError::config(&config_path, source))?;
    let directive = config
        .logging
        .directive()
        .map_err(|source| CliError::config(&config_path, source))?;

    let on_stdout = bridge_config
        .outputs
        .iter()
        .any(|o| o.protocol == OutputProtocol::Stdout);
    logging::init(directive, on_stdout);
    if !config_path.exists() {
        warn!(path = %config_path.display(), "config file not found, using defaults and environment");
    }

    let source = config.structure_source();

    if cli.check {
        let index = source.load()?;
        let outputs: Vec<&str> = bridge_config.outputs.iter().map(|o| o.name.as_str()).collect();
        println!(
            "configuration ok: {} devices in {}, delivering to {}",
            index.len(),
            source.path().display(),
            outputs.join(", ")
        );
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        structure = %source.path().display(),
        "starting loxInFlux"
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let bridge = Bridge::new(bridge_config, Arc::new(source));
    bridge.run(cancel).await?;
    Ok(())
}

/// Config file + environment, then command-line overrides.
fn load(cli: &Cli, config_dir: &std::path::Path) -> Result<Config, loxinflux_config::ConfigError> {
    let mut config = loxinflux_config::load_config(config_dir)?;
    if let Some(dir) = &cli.data_dir {
        config.paths.data_dir.clone_from(dir);
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

/// Cancel on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) -> Result<(), CliError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())
            .map_err(|e| CliError::Internal(format!("cannot install SIGTERM handler: {e}")))?;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
                _ = terminate.recv() => info!("SIGTERM received, shutting down"),
            }
            cancel.cancel();
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        cancel.cancel();
    });

    Ok(())
}
