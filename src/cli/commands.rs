//! CLI command definitions

use crate::core::trigger::{EventKind, TriggerEvent};
use chrono::Utc;
use clap::Args;

/// Run a pipeline for an event
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    #[command(flatten)]
    pub event: EventArgs,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,

    /// Directory to write artifacts into after the run
    #[arg(long)]
    pub artifacts_dir: Option<String>,

    /// Output the final run report in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Validate a pipeline document
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show the expanded job instances for an event
#[derive(Debug, Args, Clone)]
pub struct PlanCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    #[command(flatten)]
    pub event: EventArgs,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Synthetic trigger event described on the command line
#[derive(Debug, Args, Clone)]
pub struct EventArgs {
    /// Event kind
    #[arg(long, value_enum, default_value_t = EventKindArg::Push)]
    pub event: EventKindArg,

    /// Branch the event refers to
    #[arg(short, long)]
    pub branch: Option<String>,

    /// Tag the event refers to
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Commit SHA
    #[arg(long)]
    pub sha: Option<String>,

    /// Commit message
    #[arg(long)]
    pub message: Option<String>,

    /// User or system that caused the event
    #[arg(long)]
    pub actor: Option<String>,
}

impl EventArgs {
    pub fn to_event(&self) -> TriggerEvent {
        TriggerEvent {
            kind: self.event.into(),
            branch: self.branch.clone(),
            tag: self.tag.clone(),
            sha: self.sha.clone(),
            message: self.message.clone(),
            actor: self.actor.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Event kind argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EventKindArg {
    Push,
    #[clap(name = "pull-request")]
    PullRequest,
    Schedule,
    Tag,
}

impl From<EventKindArg> for EventKind {
    fn from(arg: EventKindArg) -> Self {
        match arg {
            EventKindArg::Push => EventKind::Push,
            EventKindArg::PullRequest => EventKind::PullRequest,
            EventKindArg::Schedule => EventKind::Schedule,
            EventKindArg::Tag => EventKind::Tag,
        }
    }
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}
