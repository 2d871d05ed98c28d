//! Dependency-aware dispatch loop with a global concurrency limit

use crate::artifact::ArtifactStore;
use crate::core::state::RunStatus;
use crate::execution::executor::{ExecContext, ExecOutcome, JobExecutor};
use crate::graph::JobGraph;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Drives one run's `JobGraph` to a terminal status.
///
/// The scheduler is the only writer of instance statuses while the run
/// is live; executors report outcomes back through their join handles.
/// The graph mutex is held only for short, await-free sections, so
/// status reads from outside stay cheap.
pub struct Scheduler {
    concurrency: usize,
}

impl Scheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(
        &self,
        graph: Arc<Mutex<JobGraph>>,
        executor: Arc<dyn JobExecutor>,
        ctx: Arc<ExecContext>,
        store: Arc<ArtifactStore>,
        mut cancel: watch::Receiver<bool>,
    ) -> RunStatus {
        let mut inflight: JoinSet<(String, ExecOutcome)> = JoinSet::new();
        let mut canceled = *cancel.borrow();
        // Stop polling the channel once the sender side is gone
        let mut cancel_open = true;

        loop {
            // Dispatch in declaration order while capacity remains. The
            // runnable -> running transition happens under the same lock
            // as the pick, so an instance can never be dispatched twice.
            while !canceled && inflight.len() < self.concurrency {
                let next = {
                    let mut g = graph.lock().await;
                    g.resolve();
                    match g.next_runnable() {
                        Some(instance) => {
                            g.mark_running(&instance.id);
                            Some(instance)
                        }
                        None => None,
                    }
                };
                let Some(instance) = next else { break };

                info!(instance = %instance.id, "dispatching");
                let executor = Arc::clone(&executor);
                let ctx = Arc::clone(&ctx);
                let store = Arc::clone(&store);
                let deadline = Duration::from_secs(instance.timeout_secs);
                inflight.spawn(async move {
                    let outcome =
                        match timeout(deadline, executor.execute(&instance, &ctx, &store)).await {
                            Ok(outcome) => outcome,
                            Err(_) => ExecOutcome::failed(format!(
                                "timed out after {}s",
                                instance.timeout_secs
                            )),
                        };
                    (instance.id, outcome)
                });
            }

            if inflight.is_empty() {
                let mut g = graph.lock().await;
                if canceled {
                    g.cancel_undispatched();
                    break;
                }
                if g.all_terminal() {
                    break;
                }
                g.resolve();
                if g.next_runnable().is_some() {
                    continue;
                }
                // Nothing running, nothing runnable, not terminal. Should
                // be unreachable once the graph is acyclic.
                error!("run stalled with no runnable instances");
                g.skip_stranded("scheduler could not make progress");
                break;
            }

            tokio::select! {
                joined = inflight.join_next() => {
                    let Some(joined) = joined else { continue };
                    let mut g = graph.lock().await;
                    match joined {
                        Ok((id, ExecOutcome::Success)) => {
                            info!(instance = %id, "succeeded");
                            g.mark_succeeded(&id);
                        }
                        Ok((id, ExecOutcome::Failed { detail })) => {
                            warn!(instance = %id, detail = %detail, "failed");
                            g.mark_failed(&id, detail);
                        }
                        Err(e) => {
                            error!(error = %e, "executor task aborted");
                        }
                    }
                }
                changed = cancel.changed(), if !canceled && cancel_open => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            info!("cancellation requested; draining in-flight instances");
                            canceled = true;
                            graph.lock().await.cancel_undispatched();
                        }
                        Ok(()) => {}
                        Err(_) => cancel_open = false,
                    }
                }
            }
        }

        let g = graph.lock().await;
        if canceled {
            RunStatus::Canceled
        } else if g.any_failed() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PipelineConfig;
    use crate::core::context::RunContext;
    use crate::core::trigger::{EventKind, TriggerEvent};
    use crate::graph::{GraphBuilder, JobInstance};
    use crate::core::state::InstanceStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MockExecutor {
        fail: HashSet<String>,
        delay: Duration,
        log: StdMutex<Vec<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockExecutor {
        fn new(fail: &[&str], delay: Duration) -> Self {
            Self {
                fail: fail.iter().map(|s| s.to_string()).collect(),
                delay,
                log: StdMutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn executed(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobExecutor for MockExecutor {
        async fn execute(
            &self,
            instance: &JobInstance,
            _ctx: &ExecContext,
            _store: &ArtifactStore,
        ) -> ExecOutcome {
            self.log.lock().unwrap().push(instance.id.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail.contains(&instance.id) {
                ExecOutcome::failed("exit 1")
            } else {
                ExecOutcome::Success
            }
        }
    }

    fn graph_for(yaml: &str, branch: &str) -> Arc<Mutex<JobGraph>> {
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        let event = TriggerEvent {
            kind: EventKind::Push,
            branch: Some(branch.to_string()),
            tag: None,
            sha: Some("abc123".to_string()),
            message: None,
            actor: None,
            timestamp: Utc::now(),
        };
        let ctx = RunContext::from_event(&event, HashMap::new());
        Arc::new(Mutex::new(GraphBuilder::new(&config).build(&ctx).unwrap()))
    }

    fn fixtures(
        fail: &[&str],
        delay: Duration,
    ) -> (Arc<MockExecutor>, Arc<ExecContext>, Arc<ArtifactStore>, watch::Receiver<bool>) {
        let executor = Arc::new(MockExecutor::new(fail, delay));
        let ctx = Arc::new(ExecContext {
            run_id: "run-1".to_string(),
            environment: HashMap::new(),
        });
        let store = Arc::new(ArtifactStore::new());
        let (tx, rx) = watch::channel(false);
        drop(tx);
        (executor, ctx, store, rx)
    }

    const STAGED: &str = r#"
name: "CI"
jobs:
  - id: validate
    steps: ["true"]
  - id: test
    needs: [validate]
    matrix:
      os: [linux, macos, windows]
      node: ["18", "20"]
    steps: ["true"]
  - id: build
    needs: [test]
    steps: ["true"]
  - id: deploy
    needs: [build]
    condition: 'branch == "main"'
    steps: ["true"]
"#;

    #[tokio::test]
    async fn test_clean_run_succeeds() {
        let graph = graph_for(STAGED, "main");
        let (executor, ctx, store, cancel) = fixtures(&[], Duration::from_millis(1));

        let status = Scheduler::new(4)
            .run(graph.clone(), executor.clone(), ctx, store, cancel)
            .await;

        assert_eq!(status, RunStatus::Succeeded);
        assert_eq!(executor.executed().len(), 9);
        let g = graph.lock().await;
        assert!(g.instances().all(|i| i.status.is_succeeded()));
    }

    #[tokio::test]
    async fn test_each_instance_dispatched_at_most_once() {
        let graph = graph_for(STAGED, "main");
        let (executor, ctx, store, cancel) = fixtures(&[], Duration::from_millis(1));

        Scheduler::new(8).run(graph, executor.clone(), ctx, store, cancel).await;

        let executed = executor.executed();
        let unique: HashSet<_> = executed.iter().collect();
        assert_eq!(executed.len(), unique.len());
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let graph = graph_for(STAGED, "main");
        let (executor, ctx, store, cancel) = fixtures(&[], Duration::from_millis(20));

        Scheduler::new(2).run(graph, executor.clone(), ctx, store, cancel).await;

        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_matrix_failure_skips_downstream() {
        let graph = graph_for(STAGED, "main");
        let (executor, ctx, store, cancel) =
            fixtures(&["test[os=macos,node=18]"], Duration::from_millis(1));

        let status = Scheduler::new(4)
            .run(graph.clone(), executor.clone(), ctx, store, cancel)
            .await;

        assert_eq!(status, RunStatus::Failed);
        let g = graph.lock().await;
        assert!(matches!(
            g.instance("build").unwrap().status,
            InstanceStatus::Skipped { .. }
        ));
        assert!(matches!(
            g.instance("deploy").unwrap().status,
            InstanceStatus::Skipped { .. }
        ));
        assert!(!executor.executed().contains(&"build".to_string()));
    }

    #[tokio::test]
    async fn test_condition_skipped_instance_never_runs() {
        let graph = graph_for(STAGED, "develop");
        let (executor, ctx, store, cancel) = fixtures(&[], Duration::from_millis(1));

        let status = Scheduler::new(4)
            .run(graph.clone(), executor.clone(), ctx, store, cancel)
            .await;

        // A condition skip is not a failure
        assert_eq!(status, RunStatus::Succeeded);
        assert!(!executor.executed().contains(&"deploy".to_string()));
        let g = graph.lock().await;
        assert!(matches!(
            g.instance("deploy").unwrap().status,
            InstanceStatus::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_drains_in_flight_and_cancels_pending() {
        let graph = graph_for(STAGED, "main");
        let executor = Arc::new(MockExecutor::new(&[], Duration::from_millis(50)));
        let ctx = Arc::new(ExecContext {
            run_id: "run-1".to_string(),
            environment: HashMap::new(),
        });
        let store = Arc::new(ArtifactStore::new());
        let (tx, rx) = watch::channel(false);

        let handle = {
            let graph = graph.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                Scheduler::new(1).run(graph, executor, ctx, store, rx).await
            })
        };

        // Let the first instance start, then cancel mid-run
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        let status = handle.await.unwrap();

        assert_eq!(status, RunStatus::Canceled);
        let g = graph.lock().await;
        assert!(g.all_terminal());
        // The in-flight instance finished; nothing new started after it
        let executed = executor.executed();
        assert!(executed.len() < 9);
        for id in executed {
            assert!(g.instance(&id).unwrap().status.is_terminal());
        }
        assert!(g
            .instances()
            .any(|i| i.status == InstanceStatus::Canceled));
    }
}
