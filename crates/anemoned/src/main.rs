//! anemoned: keeps share manifests current
//!
//! Usage:
//!   anemoned [--config /etc/anemone/config.toml] [--log info] [--log-format text|json]
//!
//! Runs the change watcher (debounced per-share rebuilds) and the periodic
//! regeneration sweep, and serves Prometheus metrics.

mod daemon;
mod metrics;

use anemone_core::config::AnemoneConfig;
use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "anemoned", version, about = "Anemone manifest daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "ANEMONE_CONFIG",
        default_value = "/etc/anemone/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to [daemon].log_level
    #[arg(long, env = "ANEMONE_LOG")]
    log: Option<String>,

    /// Log format; defaults to [daemon].log_format
    #[arg(long, env = "ANEMONE_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config is read before logging exists; report the fallback afterwards.
    let (config, found) = load_config(&cli.config)?;

    let level = cli.log.as_deref().unwrap_or(&config.daemon.log_level);
    let format = cli.log_format.clone().unwrap_or_else(|| {
        if config.daemon.log_format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    });
    init_logging(level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "anemoned starting"
    );
    if !found {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    daemon::run(config).await
}

fn load_config(path: &Path) -> Result<(AnemoneConfig, bool)> {
    if path.exists() {
        Ok((AnemoneConfig::from_file(path)?, true))
    } else {
        Ok((AnemoneConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (config, found) = load_config(&tmp.path().join("absent.toml")).unwrap();
        assert!(!found);
        assert_eq!(config.watcher.debounce_ms, 3000);
    }

    #[test]
    fn test_config_file_loaded() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[watcher]\nenabled = false\n").unwrap();
        let (config, found) = load_config(&path).unwrap();
        assert!(found);
        assert!(!config.watcher.enabled);
    }
}
