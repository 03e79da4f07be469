use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sesmon_core::{signal, Config, Supervisor};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sesmon")]
#[command(about = "SES monitoring and alerting daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Monitor target SES-capable devices using a configuration file
    Monitor { config: PathBuf },

    /// Check if a configuration file is syntactically parseable (YAML)
    Check { config: PathBuf },

    /// Test if enabled devices of a configuration file can be resolved
    Test { config: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Monitor { config } => {
            let config = load_config(&config)?;
            init_logging(config.disable_timestamps);

            let supervisor = Supervisor::new(&config, None, None)
                .context("failure establishing supervisor")?;

            let (trigger, shutdown) = signal::channel();
            spawn_signal_handler(trigger);

            supervisor.start(&shutdown);
            supervisor.wait_done().await;
        }
        Command::Check { config } => {
            load_config(&config)?;
        }
        Command::Test { config } => {
            let config = load_config(&config)?;
            init_logging(config.disable_timestamps);

            Supervisor::new(&config, None, None)
                .context("failure establishing supervisor")?;
        }
    }

    Ok(())
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let yaml = std::fs::read_to_string(path).context("failure reading configuration file")?;
    Config::from_yaml(&yaml).context("failure parsing configuration file")
}

fn init_logging(disable_timestamps: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact();

    if disable_timestamps {
        builder.without_time().init();
    } else {
        builder.init();
    }
}

/// Turns SIGINT or SIGTERM into the program-wide shutdown signal.
fn spawn_signal_handler(trigger: signal::Trigger) {
    tokio::spawn(async move {
        let mut sigterm = match unix_signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!("failure installing SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                trigger.trigger();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        warn!("received shutdown signal, stopping all monitors");
        trigger.trigger();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_reads_a_valid_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "devices:\n  - device: /dev/sg0\n    enabled: false\n")
            .expect("write config");

        let config = load_config(&path).expect("valid config");
        assert_eq!(config.devices.len(), 1);
    }

    #[test]
    fn load_config_rejects_unknown_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "devices: []\nnope: 1\n").expect("write config");

        assert!(load_config(&path).is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let path = PathBuf::from("/nonexistent/sesmon.yaml");
        assert!(load_config(&path).is_err());
    }
}
