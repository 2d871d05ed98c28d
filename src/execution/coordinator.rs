//! Run lifecycle - trigger gate, run registry, cancellation

use crate::artifact::{ArtifactStore, RetentionPolicy};
use crate::core::config::{ConfigError, PipelineConfig};
use crate::core::context::RunContext;
use crate::core::state::{RunReport, RunStatus};
use crate::core::trigger::{self, TriggerDecision, TriggerEvent, TriggerRule};
use crate::execution::executor::{ExecContext, JobExecutor};
use crate::execution::scheduler::{Scheduler, DEFAULT_CONCURRENCY};
use crate::graph::{GraphBuilder, JobGraph};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Completed runs kept in the registry before the oldest are dropped
const DEFAULT_COMPLETED_CAP: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The event matched no trigger rule; no run was created
    #[error("Trigger rejected: {reason}")]
    Rejected { reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Unknown run: {0}")]
    UnknownRun(String),
}

/// One row of `list_runs`
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub pipeline: String,
    pub event: String,
    pub git_ref: Option<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct RunEntry {
    pipeline: String,
    event: String,
    git_ref: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    graph: Arc<Mutex<JobGraph>>,
    cancel: watch::Sender<bool>,
    status: watch::Sender<RunStatus>,
}

#[derive(Default)]
struct Registry {
    /// Insertion order; drives listing and pruning
    order: Vec<String>,
    runs: HashMap<String, RunEntry>,
}

struct Inner {
    executor: Arc<dyn JobExecutor>,
    store: Arc<ArtifactStore>,
    retention: RetentionPolicy,
    completed_cap: usize,
    registry: RwLock<Registry>,
}

/// Entry point for the run lifecycle.
///
/// `start` gates an event through the pipeline's trigger rules, builds
/// the job graph, and hands it to a background scheduler task. The
/// registry keeps finished runs around for status queries until the
/// completed-run cap evicts them.
#[derive(Clone)]
pub struct RunCoordinator {
    inner: Arc<Inner>,
}

impl RunCoordinator {
    pub fn new(executor: Arc<dyn JobExecutor>) -> Self {
        Self::with_options(executor, RetentionPolicy::Discard, DEFAULT_COMPLETED_CAP)
    }

    pub fn with_retention(executor: Arc<dyn JobExecutor>, retention: RetentionPolicy) -> Self {
        Self::with_options(executor, retention, DEFAULT_COMPLETED_CAP)
    }

    /// Full constructor: `completed_cap` bounds how many finished runs the
    /// registry retains before the oldest are evicted.
    pub fn with_options(
        executor: Arc<dyn JobExecutor>,
        retention: RetentionPolicy,
        completed_cap: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                store: Arc::new(ArtifactStore::new()),
                retention,
                completed_cap,
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.inner.store
    }

    /// Evaluate the event against the pipeline and, if accepted, launch a
    /// run. Returns the new run id; a trigger rejection creates nothing.
    pub async fn start(
        &self,
        config: &PipelineConfig,
        event: &TriggerEvent,
    ) -> Result<String, StartError> {
        config.validate()?;

        let rules = TriggerRule::compile_all(&config.triggers)?;
        match trigger::evaluate(event, &rules) {
            TriggerDecision::Accepted { rule } => {
                debug!(rule, "trigger accepted");
            }
            TriggerDecision::Rejected { reason } => {
                debug!(reason, "trigger rejected");
                return Err(StartError::Rejected {
                    reason: reason.to_string(),
                });
            }
        }

        let ctx = RunContext::from_event(event, config.variables_as_string_map());
        let graph = GraphBuilder::new(config).build(&ctx)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        info!(run_id = %run_id, pipeline = %config.name, instances = graph.len(), "run started");

        self.inner
            .store
            .register_run(&run_id, graph.upstream_sets())
            .await;

        let graph = Arc::new(Mutex::new(graph));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, _) = watch::channel(RunStatus::Running);

        {
            let mut registry = self.inner.registry.write().await;
            registry.order.push(run_id.clone());
            registry.runs.insert(
                run_id.clone(),
                RunEntry {
                    pipeline: config.name.clone(),
                    event: event.kind.as_str().to_string(),
                    git_ref: event.git_ref().map(str::to_string),
                    created_at: Utc::now(),
                    completed_at: None,
                    graph: Arc::clone(&graph),
                    cancel: cancel_tx,
                    status: status_tx.clone(),
                },
            );
        }

        let concurrency = config.max_concurrency.unwrap_or(DEFAULT_CONCURRENCY);
        let exec_ctx = Arc::new(ExecContext {
            run_id: run_id.clone(),
            environment: ctx.base_environment(),
        });
        let inner = Arc::clone(&self.inner);
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            let status = Scheduler::new(concurrency)
                .run(
                    graph,
                    Arc::clone(&inner.executor),
                    exec_ctx,
                    Arc::clone(&inner.store),
                    cancel_rx,
                )
                .await;
            inner.complete(&task_run_id, status, status_tx).await;
        });

        Ok(run_id)
    }

    /// Full snapshot of a run: overall status plus every instance status
    pub async fn status(&self, run_id: &str) -> Result<RunReport, CoordinatorError> {
        let registry = self.inner.registry.read().await;
        let entry = registry
            .runs
            .get(run_id)
            .ok_or_else(|| CoordinatorError::UnknownRun(run_id.to_string()))?;
        // The watch::Ref must drop before the registry read guard, so it
        // cannot live inside the tail expression below.
        let status = *entry.status.borrow();
        let instances = entry.graph.lock().await.reports();
        Ok(RunReport {
            run_id: run_id.to_string(),
            status,
            event: entry.event.clone(),
            git_ref: entry.git_ref.clone(),
            created_at: entry.created_at,
            completed_at: entry.completed_at,
            instances,
        })
    }

    /// Request cancellation. Idempotent; a terminal run is left as-is.
    pub async fn cancel(&self, run_id: &str) -> Result<(), CoordinatorError> {
        let registry = self.inner.registry.read().await;
        let entry = registry
            .runs
            .get(run_id)
            .ok_or_else(|| CoordinatorError::UnknownRun(run_id.to_string()))?;
        if entry.status.borrow().is_terminal() {
            debug!(run_id, "cancel ignored; run already terminal");
            return Ok(());
        }
        info!(run_id, "canceling run");
        let _ = entry.cancel.send(true);
        Ok(())
    }

    /// All known runs in start order
    pub async fn list_runs(&self) -> Vec<RunSummary> {
        let registry = self.inner.registry.read().await;
        registry
            .order
            .iter()
            .filter_map(|id| {
                registry.runs.get(id).map(|entry| RunSummary {
                    run_id: id.clone(),
                    pipeline: entry.pipeline.clone(),
                    event: entry.event.clone(),
                    git_ref: entry.git_ref.clone(),
                    status: *entry.status.borrow(),
                    created_at: entry.created_at,
                    completed_at: entry.completed_at,
                })
            })
            .collect()
    }

    /// Block until the run reaches a terminal status
    pub async fn wait(&self, run_id: &str) -> Result<RunStatus, CoordinatorError> {
        let mut rx = {
            let registry = self.inner.registry.read().await;
            let entry = registry
                .runs
                .get(run_id)
                .ok_or_else(|| CoordinatorError::UnknownRun(run_id.to_string()))?;
            entry.status.subscribe()
        };
        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                return Ok(status);
            }
            if rx.changed().await.is_err() {
                return Ok(*rx.borrow());
            }
        }
    }
}

impl Inner {
    async fn complete(&self, run_id: &str, status: RunStatus, status_tx: watch::Sender<RunStatus>) {
        info!(run_id, status = %status, "run completed");
        if let Err(e) = self.store.finish_run(run_id, &self.retention).await {
            warn!(run_id, error = %e, "artifact retention failed");
        }

        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.runs.get_mut(run_id) {
            entry.completed_at = Some(Utc::now());
        }
        let _ = status_tx.send(status);

        // Evict the oldest completed runs past the cap
        let completed: Vec<String> = registry
            .order
            .iter()
            .filter(|id| {
                registry
                    .runs
                    .get(*id)
                    .map(|e| e.status.borrow().is_terminal())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if completed.len() > self.completed_cap {
            for id in &completed[..completed.len() - self.completed_cap] {
                registry.runs.remove(id);
                registry.order.retain(|o| o != id);
                let _ = self.store.finish_run(id, &RetentionPolicy::Discard).await;
                debug!(run_id = %id, "evicted completed run");
            }
        }
    }
}
