//! Autonomous ball chasing from the command line

use anyhow::Context;
use ballbot_eye::config::BotConfig;
use ballbot_eye::models::YoloDetector;
use ballbot_eye::pipeline::ChaseLoop;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ballbot")]
#[command(about = "Chase a ball with an ESP32 camera robot", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the MJPEG stream URL
    #[arg(long)]
    stream_url: Option<String>,

    /// Override the motor command endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Override the detector model path
    #[arg(long)]
    model: Option<PathBuf>,

    /// Disable online color calibration
    #[arg(long)]
    no_calibration: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = match &cli.config {
        Some(path) => BotConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => BotConfig::default(),
    };
    if let Some(url) = cli.stream_url {
        config.stream.url = url;
    }
    if let Some(endpoint) = cli.endpoint {
        config.dispatch.endpoint = endpoint;
    }
    if let Some(model) = cli.model {
        config.detector.model_path = model;
    }
    if cli.no_calibration {
        config.calibration.enabled = false;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let detector = YoloDetector::new(&config.detector).context("Failed to load detector")?;
    info!("Stream {} -> endpoint {}", config.stream.url, config.dispatch.endpoint);

    let mut chase = ChaseLoop::new(&config, Box::new(detector));
    chase.start().await.context("Failed to start chase loop")?;
    chase
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
