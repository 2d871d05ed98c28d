//! Test utility functions for pipewright

use async_trait::async_trait;
use chrono::Utc;
use pipewright::core::trigger::{EventKind, TriggerEvent};
use pipewright::execution::{ExecContext, ExecOutcome, JobExecutor};
use pipewright::{ArtifactStore, JobInstance, PipelineConfig, RunCoordinator, RunStatus};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Executor that records dispatches and returns scripted outcomes.
///
/// Outputs declared on an instance are published as deterministic bytes
/// derived from the artifact name and producer id.
pub struct RecordingExecutor {
    fail: HashSet<String>,
    delay: Option<Duration>,
    executed: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            fail: HashSet::new(),
            delay: None,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(ids: &[&str]) -> Self {
        Self {
            fail: ids.iter().map(|s| s.to_string()).collect(),
            delay: None,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Instance ids in dispatch order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

pub fn payload_for(name: &str, producer: &str) -> Vec<u8> {
    format!("{} produced by {}", name, producer).into_bytes()
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    async fn execute(
        &self,
        instance: &JobInstance,
        ctx: &ExecContext,
        store: &ArtifactStore,
    ) -> ExecOutcome {
        self.executed.lock().unwrap().push(instance.id.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.contains(&instance.id) {
            return ExecOutcome::failed("exit 1");
        }
        for name in &instance.inputs {
            if let Err(e) = store.get(&ctx.run_id, &instance.id, name).await {
                return ExecOutcome::failed(e.to_string());
            }
        }
        for spec in &instance.outputs {
            let data = payload_for(&spec.name, &instance.id);
            if let Err(e) = store.put(&ctx.run_id, &instance.id, &spec.name, data).await {
                return ExecOutcome::failed(e.to_string());
            }
        }
        ExecOutcome::Success
    }
}

pub fn push_event(branch: &str) -> TriggerEvent {
    TriggerEvent {
        kind: EventKind::Push,
        branch: Some(branch.to_string()),
        tag: None,
        sha: Some("abc123def".to_string()),
        message: Some("commit message".to_string()),
        actor: Some("dev".to_string()),
        timestamp: Utc::now(),
    }
}

pub fn tag_event(tag: &str) -> TriggerEvent {
    TriggerEvent {
        kind: EventKind::Tag,
        branch: None,
        tag: Some(tag.to_string()),
        sha: Some("abc123def".to_string()),
        message: None,
        actor: Some("dev".to_string()),
        timestamp: Utc::now(),
    }
}

/// Start a run with the given executor and wait for its terminal status
pub async fn run_to_completion(
    yaml: &str,
    event: &TriggerEvent,
    executor: Arc<dyn JobExecutor>,
) -> (RunCoordinator, String, RunStatus) {
    let config = PipelineConfig::from_yaml(yaml).unwrap();
    let coordinator = RunCoordinator::with_retention(executor, pipewright::RetentionPolicy::Keep);
    let run_id = coordinator.start(&config, event).await.unwrap();
    let status = coordinator.wait(&run_id).await.unwrap();
    (coordinator, run_id, status)
}
