//! Wiring between settings, the engine and the terminal

use anyhow::{Context, Result, bail};
use colored::Colorize;
use serde_json::Value;
use stackflow_config::Settings;
use stackflow_engine::{
    ActionType, ApplyReport, CancellationToken, ChangePlan, Engine, EngineError, NodeOutcome,
    ReconcileOptions, RetryConfig, Stack, StateManager,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Show what an apply would do
    Plan,
    Apply,
    Destroy,
    /// Apply, apply again, then destroy
    Demo,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plan" => Ok(Command::Plan),
            "apply" => Ok(Command::Apply),
            "destroy" => Ok(Command::Destroy),
            "demo" => Ok(Command::Demo),
            other => bail!(
                "unknown command '{}' (expected plan, apply, destroy or demo)",
                other
            ),
        }
    }
}

pub fn reconcile_options(settings: &Settings) -> ReconcileOptions {
    ReconcileOptions {
        max_workers: settings.workers,
        retry: RetryConfig {
            max_attempts: settings.retry.max_attempts,
            initial_delay: Duration::from_millis(settings.retry.initial_delay_ms),
            max_delay: Duration::from_millis(settings.retry.max_delay_ms),
            backoff_multiplier: settings.retry.multiplier,
        },
    }
}

/// State location: `state_dir` from settings (relative to the settings
/// file), otherwise `.stackflow/` in the current directory
pub fn state_manager(settings: &Settings, settings_path: Option<&Path>) -> Result<StateManager> {
    let current_dir = std::env::current_dir()
        .context("cannot determine current directory")?;

    Ok(match &settings.state_dir {
        Some(dir) if dir.is_absolute() => StateManager::at(dir),
        Some(dir) => {
            let base = settings_path
                .and_then(Path::parent)
                .unwrap_or(current_dir.as_path());
            StateManager::at(base.join(dir))
        }
        None => StateManager::new(current_dir),
    })
}

pub fn print_plan(plan: &ChangePlan) {
    println!("{}", "Planned changes:".bold());
    for action in &plan.actions {
        let marker = match action.action_type {
            ActionType::Create => "+".green(),
            ActionType::Update => "~".yellow(),
            ActionType::Delete => "-".red(),
            ActionType::NoOp => " ".normal(),
        };
        println!("  {} {}", marker, action.description);
    }
    println!("{}", plan.summary().to_string().cyan());
}

pub fn print_report(report: &ApplyReport) {
    for result in &report.results {
        let line = format!(
            "[{}] {} {}",
            result.batch, result.resource_type, result.node_id
        );
        match &result.outcome {
            NodeOutcome::Created => println!("  {} {} created", "✓".green(), line),
            NodeOutcome::Updated => println!("  {} {} updated", "✓".green(), line),
            NodeOutcome::Recreated => println!("  {} {} recreated", "✓".yellow(), line),
            NodeOutcome::Deleted => println!("  {} {} deleted", "✓".green(), line),
            NodeOutcome::Unchanged => println!("  {} {} unchanged", "·".dimmed(), line),
            NodeOutcome::Failed { error } => {
                eprintln!("  {} {} failed: {}", "✗".red().bold(), line, error)
            }
            NodeOutcome::Blocked { reason } => {
                eprintln!("  {} {} blocked: {}", "!".yellow().bold(), line, reason)
            }
        }
    }
    println!(
        "{}",
        format!(
            "{} changed in {}ms",
            report.total_changes(),
            report.duration_ms
        )
        .dimmed()
    );
}

pub fn print_outputs(stack: &Stack, outputs: &BTreeMap<String, Value>) {
    if outputs.is_empty() {
        return;
    }
    println!("{}", "Outputs:".bold());
    for (name, value) in outputs {
        let rendered = value
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string());
        let description = stack
            .outputs
            .get(name)
            .and_then(|spec| spec.description.as_deref());
        match description {
            Some(description) => {
                let description = description.dimmed();
                println!("  {} = {}  ({})", name.cyan(), rendered, description);
            }
            None => println!("  {} = {}", name.cyan(), rendered),
        }
    }
}

/// Print whatever partial report an engine error carries
fn report_failure(err: &EngineError) {
    match err {
        EngineError::PartialApply(partial) => print_report(&partial.report),
        EngineError::Cancelled { pending, .. } => {
            let pending = pending.join(", ");
            eprintln!("{} not started: {}", "!".yellow().bold(), pending);
        }
        _ => {}
    }
}

async fn apply(engine: &Engine, stack: &Stack, cancel: &CancellationToken) -> Result<()> {
    println!("{}", format!("Applying {}", stack.name).blue().bold());
    match engine.apply(stack, cancel).await {
        Ok(deployment) => {
            print_report(&deployment.report);
            print_outputs(stack, &deployment.outputs);
            println!("{}", "✓ Apply complete".green().bold());
            Ok(())
        }
        Err(err) => {
            report_failure(&err);
            Err(err).context("apply failed")
        }
    }
}

async fn destroy(engine: &Engine, stack: &Stack, cancel: &CancellationToken) -> Result<()> {
    println!("{}", format!("Destroying {}", stack.name).blue().bold());
    match engine.destroy(stack, cancel).await {
        Ok(report) => {
            print_report(&report);
            println!("{}", "✓ Destroy complete".green().bold());
            Ok(())
        }
        Err(err) => {
            report_failure(&err);
            Err(err).context("destroy failed")
        }
    }
}

pub async fn run(
    command: Command,
    engine: &Engine,
    stack: &Stack,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        Command::Plan => {
            print_plan(&engine.plan(stack).await?);
            Ok(())
        }
        Command::Apply => {
            print_plan(&engine.plan(stack).await?);
            apply(engine, stack, cancel).await
        }
        Command::Destroy => destroy(engine, stack, cancel).await,
        Command::Demo => {
            print_plan(&engine.plan(stack).await?);
            apply(engine, stack, cancel).await?;

            let plan = engine.plan(stack).await?;
            print_plan(&plan);
            apply(engine, stack, cancel).await?;

            destroy(engine, stack, cancel).await
        }
    }
}
