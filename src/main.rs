use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use webhook_gateway::{Gateway, JsonLinesPipeline, RestRegistrationApi, WebhookConfig};

/// Receive provider webhooks and emit them as JSON lines on stdout.
#[derive(Parser)]
#[command(name = "webhook-gateway")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WEBHOOK_GATEWAY_CONFIG", default_value = "gateway.toml")]
    config: PathBuf,

    /// Override the configured bind address
    #[arg(long)]
    bind: Option<String>,

    /// Serve without registering upstream
    #[arg(long)]
    no_register: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries callbacks, so logs go to stderr.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webhook_gateway=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .init();

    let cli = Cli::parse();
    let mut config = WebhookConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }
    if cli.no_register {
        config.auto_register = false;
    }

    let provider = config.provider.clone();
    let pipeline = Arc::new(JsonLinesPipeline::new(tokio::io::stdout()));
    let mut gateway = Gateway::new(config, pipeline)?;
    if let Some(provider) = provider {
        gateway = gateway.with_registration(Arc::new(RestRegistrationApi::new(&provider)?));
    }

    gateway.start().await?;
    if let Some(url) = gateway.callback_url().await {
        info!(%url, "gateway ready");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");

    if let Err(e) = gateway.stop().await {
        warn!(error = %e, "gateway stopped with errors");
    }
    Ok(())
}
