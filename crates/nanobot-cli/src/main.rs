use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nanobot_config::ConfigLoader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "nanobot",
    version,
    about = "nanobot - bridge gateway for the nanobot agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory (default: ~/.nanobot)
    #[arg(long, env = "NANOBOT_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and supervise all configured bridges
    Gateway {
        /// Host to bind to
        #[arg(long, env = "NANOBOT_GATEWAY_HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(long, env = "NANOBOT_GATEWAY_PORT")]
        port: Option<u16>,
    },
}

/// Configuration problems exit with 2, every other failure with 1.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<nanobot_common::Error>() {
        Some(nanobot_common::Error::Config(_)) => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loader = match &cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => match ConfigLoader::new() {
            Ok(loader) => loader,
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::from(2);
            }
        },
    };

    let config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet; the level may come from this very file.
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    init_tracing(&level, cli.log_format);

    match run(cli.command, &loader, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(
    command: Commands,
    loader: &ConfigLoader,
    mut config: nanobot_config::AppConfig,
) -> Result<()> {
    match command {
        Commands::Gateway { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            config.validate()?;
            loader
                .ensure_dirs(&config)
                .context("failed to prepare data directories")?;

            let data_dir = loader.data_dir(&config);
            info!(
                "config dir {}, data dir {}",
                loader.config_dir().display(),
                data_dir.display()
            );
            nanobot_gateway::GatewayServer::new(config, data_dir)
                .run()
                .await?;
        }
    }
    Ok(())
}
