use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;

use chronoq::daemon::{system_clock, Engine};
use chronoq::executor::{ExecutionContext, JobLogic};
use chronoq::models::Job;
use chronoq::notify::LogSink;
use chronoq::CoreConfig;

/// chronoq - durable multi-tenant job scheduler daemon
#[derive(Parser, Debug)]
#[command(name = "chronoq", version, about = "Durable multi-tenant job scheduler daemon")]
struct Cli {
    /// Postgres connection string; in-memory backends when omitted
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Path to a JSON config file (defaults + env overlay otherwise)
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Placeholder job logic for the standalone daemon: logs the payload and
/// echoes it back. Deployments embed the crate and inject their own
/// `JobLogic` at wiring.
struct EchoLogic;

#[async_trait]
impl JobLogic for EchoLogic {
    async fn run(&self, job: &Job, ctx: &ExecutionContext) -> anyhow::Result<Option<Value>> {
        ctx.logger
            .log(
                chronoq::models::LogLevel::Info,
                "echoing payload",
                Some(job.payload.clone()),
            )
            .await;
        Ok(Some(job.payload.clone()))
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<CoreConfig> {
    let config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: CoreConfig =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            config.validate().context("Invalid config")?;
            config
        }
        None => CoreConfig::from_env().context("Invalid configuration environment")?,
    };
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(async {
        let config = load_config(cli.config.as_deref())?;
        let clock = system_clock();
        let logic = Arc::new(EchoLogic);
        let sink = Arc::new(LogSink);

        let engine = match cli.database_url.as_deref() {
            Some(url) => {
                tracing::info!("starting with Postgres backends");
                Engine::postgres(config, url, clock, logic, sink).await?
            }
            None => {
                tracing::warn!("no DATABASE_URL set, using in-memory backends");
                Engine::in_memory(config, clock, logic, sink)
            }
        };

        engine.run_until_signal().await
    })
}
