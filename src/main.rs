use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use keel::broker::{FillMode, PaperBroker};
use keel::config::AppConfig;
use keel::engine::TradingEngine;
use keel::sink::LogSink;

#[derive(Parser)]
#[command(name = "keel", about = "Rules-based equity core/trading momentum engine")]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config", env = "KEEL_CONFIG_DIR")]
    config_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine against the paper broker
    Run {
        /// Starting cash for the paper account
        #[arg(long, default_value = "100000")]
        cash: Decimal,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
}

fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keel=debug"));

    let log_dir = std::env::var("KEEL_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .unwrap_or_else(|_| "logs".to_string());

    // `tracing_appender::rolling::daily` aborts if it cannot create the
    // initial log file, so preflight writability before installing it.
    let file_layer = if std::fs::create_dir_all(&log_dir).is_ok() {
        let test_path = std::path::Path::new(&log_dir).join(".keel_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);
                let file_appender = tracing_appender::rolling::daily(&log_dir, "keel.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Keep the guard alive for the life of the process
                Box::leak(Box::new(guard));
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: log directory {log_dir} not writable ({e}); file logging disabled"
                );
                None
            }
        }
    } else {
        None
    };

    let console_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}

fn load_config(config_dir: &str) -> anyhow::Result<AppConfig> {
    let config = match AppConfig::load_from(config_dir) {
        Ok(config) => config,
        Err(e) => {
            info!("no usable config in {config_dir} ({e}); using built-in defaults");
            AppConfig::default_config()
        }
    };
    if let Err(errors) = config.validate() {
        for error in &errors {
            error!("config: {error}");
        }
        anyhow::bail!("configuration invalid ({} errors)", errors.len());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::CheckConfig => {
            let config = load_config(&cli.config_dir)?;
            info!(
                "configuration OK: {} symbols, RSI period {}",
                config.symbols.len(),
                config.signals.rsi_period
            );
            Ok(())
        }
        Command::Run { cash } => {
            let config = load_config(&cli.config_dir)?;
            let (broker, broker_events) = PaperBroker::new(FillMode::Immediate);
            let sink = Arc::new(LogSink);

            let engine = TradingEngine::start(
                &config,
                broker,
                cash,
                sink.clone(),
                sink,
            )?;
            engine.route_broker_events(broker_events);

            info!("engine running; feed bars via the market-data collaborator (Ctrl-C to stop)");
            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            engine.shutdown().await;
            Ok(())
        }
    }
}
