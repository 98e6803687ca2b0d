use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use matrix_bridge_qq::bridge::QqBridge;
use matrix_bridge_qq::config::{Config, LogFormat};
use matrix_bridge_qq::database::Database;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "matrix-bridge-qq")]
#[command(version)]
#[command(about = "A Matrix-QQ puppeting bridge")]
struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Generate example config and exit
    #[arg(long)]
    generate_config: bool,
}

const EXAMPLE_CONFIG: &str = include_str!("../example-config.yaml");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    if args.generate_config {
        println!("{}", EXAMPLE_CONFIG);
        return Ok(());
    }

    let config_path = args.config.to_string_lossy().to_string();
    let config = Config::load(&config_path).with_context(|| {
        format!(
            "Failed to load config at '{}'; use --generate-config to print a template",
            config_path
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.min_level.to_ascii_lowercase()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Pretty => subscriber.init(),
        LogFormat::Compact => subscriber.compact().init(),
    }

    info!("Starting Matrix-QQ bridge v{}", env!("CARGO_PKG_VERSION"));

    let database = &config.appservice.database;
    let db = Database::connect(
        &database.r#type,
        &database.uri,
        database.max_open_conns,
        database.max_idle_conns,
    )
    .await?;
    db.run_migrations().await?;

    let bridge = QqBridge::from_config(config, db.stores())?;

    tokio::select! {
        result = bridge.start() => {
            if let Err(err) = result {
                error!("Bridge stopped with error: {:#}", err);
                return Err(err);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Bridge stopped");
    Ok(())
}
