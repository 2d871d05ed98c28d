mod artifact;
mod cli;
mod core;
mod execution;
mod graph;

use anyhow::{Context, Result};
use cli::output::*;
use cli::{Cli, Command};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::artifact::RetentionPolicy;
use crate::cli::commands::{PlanCommand, RunCommand, ValidateCommand};
use crate::core::config::PipelineConfig;
use crate::core::context::RunContext;
use crate::core::trigger::{self, TriggerDecision, TriggerRule};
use crate::core::{InstanceStatus, RunStatus};
use crate::execution::{ProcessExecutor, RunCoordinator, StartError};
use crate::graph::GraphBuilder;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Plan(cmd) => plan_pipeline(cmd)?,
    }

    Ok(())
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let mut config =
        PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline config")?;

    println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());

    // Apply variable overrides
    for (key, value) in &cmd.variable {
        config.set_variable(key, value);
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    let retention = match &cmd.artifacts_dir {
        Some(dir) => RetentionPolicy::Flush(dir.into()),
        None => RetentionPolicy::Discard,
    };
    let coordinator =
        RunCoordinator::with_retention(Arc::new(ProcessExecutor::default()), retention);

    let event = cmd.event.to_event();
    let run_id = match coordinator.start(&config, &event).await {
        Ok(run_id) => run_id,
        Err(StartError::Rejected { reason }) => {
            println!("{} No run started: {}", WARN, reason);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!("{} Run started: {}", ROCKET, style(&run_id[..8]).dim());
    println!();

    // Poll for progress until the run reaches a terminal status
    let total = coordinator.status(&run_id).await?.instances.len();
    let progress = create_progress_bar(total);
    let report = loop {
        let report = coordinator.status(&run_id).await?;
        let done = report.count_where(InstanceStatus::is_terminal);
        progress.set_position(done as u64);
        if report.status.is_terminal() {
            progress.finish_and_clear();
            break report;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for instance in &report.instances {
            println!("{}", format_instance_line(instance));
        }
        println!();
        println!("{}", format_run_summary(&report));
    }

    if report.status != RunStatus::Succeeded {
        anyhow::bail!("run {}", report.status);
    }
    Ok(())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => {
            if cmd.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "valid": true,
                        "pipeline": config.name,
                        "jobs": config.jobs.len(),
                    })
                );
            } else {
                println!(
                    "{} {} is valid ({} jobs)",
                    CHECK,
                    style(&config.name).bold(),
                    config.jobs.len()
                );
            }
            Ok(())
        }
        Err(e) => {
            if cmd.json {
                println!(
                    "{}",
                    serde_json::json!({ "valid": false, "error": e.to_string() })
                );
            } else {
                println!("{} Invalid pipeline: {}", CROSS, e);
            }
            Err(e.into())
        }
    }
}

fn plan_pipeline(cmd: &PlanCommand) -> Result<()> {
    let mut config =
        PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline config")?;
    for (key, value) in &cmd.variable {
        config.set_variable(key, value);
    }

    let event = cmd.event.to_event();
    let rules = TriggerRule::compile_all(&config.triggers)?;
    let decision = trigger::evaluate(&event, &rules);
    let ctx = RunContext::from_event(&event, config.variables_as_string_map());
    let graph = GraphBuilder::new(&config).build(&ctx)?;

    if cmd.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "accepted": decision.is_accepted(),
                "instances": graph.reports(),
            }))?
        );
        return Ok(());
    }

    match &decision {
        TriggerDecision::Accepted { .. } => {
            println!("{} Event accepted; {} instances:", INFO, graph.len())
        }
        TriggerDecision::Rejected { reason } => println!(
            "{} Event would be rejected ({}); plan shown anyway:",
            WARN, reason
        ),
    }
    for instance in graph.instances() {
        let needs = graph.dependencies_of(&instance.id);
        let needs = if needs.is_empty() {
            String::new()
        } else {
            format!("  needs: {}", needs.join(", "))
        };
        println!(
            "{}{}",
            format_instance_line(&instance.report()),
            style(&needs).dim()
        );
    }
    Ok(())
}
