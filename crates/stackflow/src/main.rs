use anyhow::{Context, Result};
use colored::Colorize;
use stackflow::runner::{self, Command};
use stackflow::topology::{TopologyOptions, web_tier};
use stackflow_engine::{CancellationToken, Engine};
use stackflow_provider_memory::MemoryCloud;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let command = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<Command>()?,
        None => Command::Demo,
    };

    let (settings, settings_path) = stackflow_config::load_settings_or_default()
        .context("failed to load settings")?;
    match &settings_path {
        Some(path) => tracing::info!("Using settings from {}", path.display()),
        None => tracing::debug!("No settings file found, using defaults"),
    }

    let stack = web_tier(&TopologyOptions::from_settings(&settings.topology));
    let cloud = MemoryCloud::new().with_latency(Duration::from_millis(50));
    let engine = Engine::new(
        cloud.registry(),
        runner::state_manager(&settings, settings_path.as_deref())?,
    )
    .with_options(runner::reconcile_options(&settings));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!(
                    "{}",
                    "Interrupt received, finishing the current batch".yellow()
                );
                cancel.cancel();
            }
        });
    }

    runner::run(command, &engine, &stack, &cancel).await
}
