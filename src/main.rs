use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_harbor::config::LogFormat;
use mcp_harbor::{Config, Gateway};

#[derive(Parser)]
#[command(name = "mcp-harbor")]
#[command(about = "A gateway for containerized MCP (Model Context Protocol) servers")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (overrides the config file)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable development mode (pretty console logging)
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).await.unwrap_or_else(|e| {
        eprintln!("Failed to load config file {}: {}; using defaults", cli.config, e);
        Config::default()
    });

    init_tracing(&cli, &config)?;

    info!("Starting MCP Harbor v{}", mcp_harbor::VERSION);
    info!(
        "Bind address: {}:{}",
        config.server.host, config.server.port
    );

    if let Err(e) = config.validate() {
        warn!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    let gateway = Gateway::new(config)?;
    gateway.start().await?;

    Ok(())
}

fn init_tracing(cli: &Cli, config: &Config) -> Result<()> {
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    level
        .parse::<tracing::Level>()
        .map_err(|_| anyhow::anyhow!("Invalid log level: {}", level))?;

    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| format!("mcp_harbor={},tower_http=debug", level).into()),
    );

    if cli.dev || config.logging.format == LogFormat::Pretty {
        // Pretty console output for development
        subscriber
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?;
    } else {
        // Structured JSON output for production
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(true),
            )
            .try_init()?;
    }

    Ok(())
}
