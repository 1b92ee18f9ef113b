//! meshd: meshstage node daemon
//!
//! Usage:
//!   meshd [--config ~/.config/meshstage/mesh.toml] [--log info] [--log-format text|json]

mod daemon;
mod offline;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "meshd", version, about = "meshstage node daemon")]
struct Cli {
    /// Path to mesh.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "MESHSTAGE_CONFIG",
        default_value = "~/.config/meshstage/mesh.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MESHSTAGE_LOG", default_value = "info")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "MESHSTAGE_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log, &cli.log_format);

    let config_path = expand_tilde(&cli.config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "meshd starting"
    );

    let mut config = load_config(&config_path).await?;
    config.daemon.data_dir = expand_tilde(&config.daemon.data_dir);
    if let Some(key_file) = config.crypto.key_file.take() {
        config.crypto.key_file = Some(expand_tilde(&key_file));
    }
    config.validate()?;

    daemon::run(config).await
}

async fn load_config(path: &Path) -> Result<mesh_core::config::MeshConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))
    } else {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            path.display()
        );
        Ok(mesh_core::config::MeshConfig::default())
    }
}

/// Expand a leading `~/` to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
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
