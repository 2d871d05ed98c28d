//! Run context - the fixed schema conditions are evaluated against

use crate::core::condition::Field;
use crate::core::trigger::{EventKind, TriggerEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Immutable snapshot of the triggering event plus document variables.
///
/// Built once per run at graph-build time; condition expressions and
/// step environments both read from it. Absent event fields are empty
/// strings so conditions can test them uniformly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub event: EventKind,
    pub branch: String,
    pub tag: String,
    pub sha: String,
    pub message: String,
    pub actor: String,
    pub triggered_at: DateTime<Utc>,

    /// Document-level variables, exported to step environments
    pub variables: HashMap<String, String>,
}

impl RunContext {
    /// Build a context from an accepted event and document variables
    pub fn from_event(event: &TriggerEvent, variables: HashMap<String, String>) -> Self {
        Self {
            event: event.kind,
            branch: event.branch.clone().unwrap_or_default(),
            tag: event.tag.clone().unwrap_or_default(),
            sha: event.sha.clone().unwrap_or_default(),
            message: event.message.clone().unwrap_or_default(),
            actor: event.actor.clone().unwrap_or_default(),
            triggered_at: event.timestamp,
            variables,
        }
    }

    /// Look up a condition field
    pub fn field(&self, field: Field) -> &str {
        match field {
            Field::Branch => &self.branch,
            Field::Event => self.event.as_str(),
            Field::Tag => &self.tag,
            Field::Sha => &self.sha,
            Field::Message => &self.message,
            Field::Actor => &self.actor,
        }
    }

    /// Environment exported to every step of the run.
    ///
    /// Document variables pass through as-is; event fields are prefixed
    /// to avoid collisions (`PIPELINE_BRANCH`, `PIPELINE_EVENT`, ...).
    pub fn base_environment(&self) -> HashMap<String, String> {
        let mut env = self.variables.clone();
        env.insert("PIPELINE_EVENT".to_string(), self.event.as_str().to_string());
        env.insert("PIPELINE_BRANCH".to_string(), self.branch.clone());
        env.insert("PIPELINE_TAG".to_string(), self.tag.clone());
        env.insert("PIPELINE_SHA".to_string(), self.sha.clone());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_event_fills_absent_fields() {
        let event = TriggerEvent {
            kind: EventKind::Push,
            branch: Some("main".to_string()),
            tag: None,
            sha: Some("abc".to_string()),
            message: None,
            actor: None,
            timestamp: Utc::now(),
        };

        let ctx = RunContext::from_event(&event, HashMap::new());
        assert_eq!(ctx.field(Field::Branch), "main");
        assert_eq!(ctx.field(Field::Event), "push");
        assert_eq!(ctx.field(Field::Tag), "");
        assert_eq!(ctx.field(Field::Message), "");
    }

    #[test]
    fn test_base_environment() {
        let event = TriggerEvent {
            kind: EventKind::Tag,
            branch: None,
            tag: Some("v1.0".to_string()),
            sha: Some("abc".to_string()),
            message: None,
            actor: None,
            timestamp: Utc::now(),
        };

        let mut vars = HashMap::new();
        vars.insert("REGISTRY".to_string(), "reg.example.com".to_string());

        let env = RunContext::from_event(&event, vars).base_environment();
        assert_eq!(env.get("PIPELINE_EVENT").map(String::as_str), Some("tag"));
        assert_eq!(env.get("PIPELINE_TAG").map(String::as_str), Some("v1.0"));
        assert_eq!(
            env.get("REGISTRY").map(String::as_str),
            Some("reg.example.com")
        );
    }
}
