//! Trigger rules and event evaluation
//!
//! Decides whether an incoming event should start a pipeline run. Rules
//! are compiled once from configuration and are immutable afterwards;
//! each event is matched against the full rule set (OR-combined).

use crate::core::config::{ConfigError, TriggerRuleConfig};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Kind of event that can start a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Schedule,
    Tag,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
            EventKind::Schedule => "schedule",
            EventKind::Tag => "tag",
        }
    }
}

/// An incoming event, as handed over by the ingestion boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: EventKind,

    /// Branch ref for push / pull_request events
    #[serde(default)]
    pub branch: Option<String>,

    /// Tag name for tag events
    #[serde(default)]
    pub tag: Option<String>,

    /// Commit sha, when the event carries one
    #[serde(default)]
    pub sha: Option<String>,

    /// Head commit message, when the event carries one
    #[serde(default)]
    pub message: Option<String>,

    /// Who caused the event
    #[serde(default)]
    pub actor: Option<String>,

    /// Wall-clock time of the event (UTC); schedule rules match against this
    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    /// The ref this event points at, if any (branch or tag)
    pub fn git_ref(&self) -> Option<&str> {
        self.branch.as_deref().or(self.tag.as_deref())
    }
}

/// A compiled trigger rule
#[derive(Debug, Clone)]
pub struct TriggerRule {
    pub event: EventKind,
    branches: Vec<String>,
    tags: Vec<String>,
    schedule: Option<Schedule>,
}

impl TriggerRule {
    /// Compile a rule from its config form; cron expressions are parsed here
    pub fn compile(index: usize, config: &TriggerRuleConfig) -> Result<Self, ConfigError> {
        let schedule = match (&config.event, &config.cron) {
            (EventKind::Schedule, Some(expr)) => Some(Schedule::from_str(expr).map_err(|e| {
                ConfigError::BadCron {
                    index,
                    detail: e.to_string(),
                }
            })?),
            (EventKind::Schedule, None) => {
                return Err(ConfigError::BadCron {
                    index,
                    detail: "schedule trigger requires a cron expression".to_string(),
                })
            }
            _ => None,
        };

        Ok(TriggerRule {
            event: config.event,
            branches: config.branches.clone(),
            tags: config.tags.clone(),
            schedule,
        })
    }

    /// Compile all rules in a document
    pub fn compile_all(configs: &[TriggerRuleConfig]) -> Result<Vec<Self>, ConfigError> {
        configs
            .iter()
            .enumerate()
            .map(|(i, c)| Self::compile(i, c))
            .collect()
    }

    fn matches(&self, event: &TriggerEvent) -> bool {
        if self.event != event.kind {
            return false;
        }
        match event.kind {
            EventKind::Push | EventKind::PullRequest => {
                let branch = event.branch.as_deref().unwrap_or("");
                branch_matches(&self.branches, branch)
            }
            EventKind::Tag => {
                let tag = event.tag.as_deref().unwrap_or("");
                tag_matches(&self.tags, tag)
            }
            EventKind::Schedule => self
                .schedule
                .as_ref()
                .is_some_and(|s| s.includes(event.timestamp)),
        }
    }
}

/// Outcome of evaluating an event against the rule set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Some rule matched; the index identifies which
    Accepted { rule: usize },
    /// No rule matched; this is a normal outcome, not an error
    Rejected { reason: &'static str },
}

impl TriggerDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, TriggerDecision::Accepted { .. })
    }
}

/// Evaluate an event against a rule set.
///
/// Rules are OR-combined. An empty rule set accepts every event: a
/// document that declares no triggers has opted out of gating.
pub fn evaluate(event: &TriggerEvent, rules: &[TriggerRule]) -> TriggerDecision {
    if rules.is_empty() {
        return TriggerDecision::Accepted { rule: 0 };
    }

    match rules.iter().position(|r| r.matches(event)) {
        Some(rule) => TriggerDecision::Accepted { rule },
        None => TriggerDecision::Rejected {
            reason: "no-matching-rule",
        },
    }
}

fn branch_matches(patterns: &[String], branch: &str) -> bool {
    if patterns.is_empty() {
        return true; // Match all branches if no patterns specified
    }
    patterns.iter().any(|p| glob_match(p, branch))
}

fn tag_matches(patterns: &[String], tag: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|p| glob_match(p, tag))
}

/// Minimal glob matching for ref patterns: `*`, `**`, `prefix/*`,
/// `prefix/**` and single-`*` infix patterns.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return text.starts_with(prefix);
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        let prefix_slash = format!("{}/", prefix);
        if text.starts_with(&prefix_slash) {
            return !text[prefix_slash.len()..].contains('/');
        }
        return false;
    }
    if pattern.contains('*') {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 2 {
            return text.starts_with(parts[0]) && text.ends_with(parts[1]);
        }
    }
    pattern == text
}
