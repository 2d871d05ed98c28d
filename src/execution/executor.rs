//! Job executors - the seam between scheduling and actually running steps

use crate::artifact::ArtifactStore;
use crate::graph::JobInstance;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Terminal result of running one job instance's step sequence
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Success,
    Failed { detail: String },
}

impl ExecOutcome {
    pub fn failed(detail: impl Into<String>) -> Self {
        ExecOutcome::Failed {
            detail: detail.into(),
        }
    }
}

/// Per-run execution context shared by every instance
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub run_id: String,
    /// Base environment: pipeline variables plus event metadata
    pub environment: HashMap<String, String>,
}

/// Runs a single job instance to completion.
///
/// Implementations own input materialization and output publication;
/// the scheduler only sees the final outcome. Failures of any kind,
/// including artifact store rejections, come back as `Failed` rather
/// than errors so the run itself keeps going.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        instance: &JobInstance,
        ctx: &ExecContext,
        store: &ArtifactStore,
    ) -> ExecOutcome;
}

/// Executes steps as `sh -c` child processes in a per-instance workspace
pub struct ProcessExecutor {
    root: PathBuf,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("pipewright"),
        }
    }
}

impl ProcessExecutor {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn environment_for(&self, instance: &JobInstance, ctx: &ExecContext) -> HashMap<String, String> {
        let mut env = ctx.environment.clone();
        env.insert("PIPELINE_RUN_ID".to_string(), ctx.run_id.clone());
        env.insert("PIPELINE_JOB".to_string(), instance.job.clone());
        for (axis, value) in instance.coordinate.entries() {
            env.insert(format!("MATRIX_{}", axis.to_uppercase()), value.to_string());
        }
        env
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(
        &self,
        instance: &JobInstance,
        ctx: &ExecContext,
        store: &ArtifactStore,
    ) -> ExecOutcome {
        let workspace = self.root.join(&ctx.run_id).join(&instance.id);
        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            return ExecOutcome::failed(format!("failed to create workspace: {}", e));
        }

        // Materialize declared inputs before any step runs
        for name in &instance.inputs {
            let artifact = match store.get(&ctx.run_id, &instance.id, name).await {
                Ok(a) => a,
                Err(e) => return ExecOutcome::failed(e.to_string()),
            };
            if let Err(e) = tokio::fs::write(workspace.join(name), artifact.data.as_slice()).await {
                return ExecOutcome::failed(format!("failed to materialize '{}': {}", name, e));
            }
            debug!(instance = %instance.id, name = %name, "input materialized");
        }

        let env = self.environment_for(instance, ctx);
        for (index, step) in instance.steps.iter().enumerate() {
            info!(instance = %instance.id, step = index, command = %step, "running step");
            let output = Command::new("sh")
                .arg("-c")
                .arg(step)
                .current_dir(&workspace)
                .envs(&env)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await;
            let output = match output {
                Ok(o) => o,
                Err(e) => {
                    return ExecOutcome::failed(format!("step {} failed to start: {}", index + 1, e))
                }
            };
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail = stderr.lines().last().unwrap_or("").trim();
                let mut detail = format!("step {} exited with {}", index + 1, output.status);
                if !tail.is_empty() {
                    detail.push_str(&format!(": {}", tail));
                }
                // Fail fast; remaining steps never run
                return ExecOutcome::Failed { detail };
            }
        }

        // Publish declared outputs; a missing file or a name collision
        // fails the instance after its steps succeeded.
        for spec in &instance.outputs {
            let data = match tokio::fs::read(workspace.join(&spec.path)).await {
                Ok(d) => d,
                Err(e) => {
                    return ExecOutcome::failed(format!(
                        "output '{}' missing at '{}': {}",
                        spec.name, spec.path, e
                    ))
                }
            };
            if let Err(e) = store.put(&ctx.run_id, &instance.id, &spec.name, data).await {
                return ExecOutcome::failed(e.to_string());
            }
        }

        ExecOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::InstanceStatus;
    use crate::graph::MatrixCoordinate;
    use std::collections::{HashMap, HashSet};

    fn instance(id: &str, steps: &[&str]) -> JobInstance {
        JobInstance {
            id: id.to_string(),
            job: id.to_string(),
            coordinate: MatrixCoordinate::default(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 60,
            inputs: Vec::new(),
            outputs: Vec::new(),
            status: InstanceStatus::Runnable,
        }
    }

    fn ctx(run_id: &str) -> ExecContext {
        ExecContext {
            run_id: run_id.to_string(),
            environment: HashMap::new(),
        }
    }

    async fn registered_store(run_id: &str, ids: &[&str]) -> ArtifactStore {
        let store = ArtifactStore::new();
        let scope: HashMap<String, HashSet<String>> = ids
            .iter()
            .map(|id| (id.to_string(), HashSet::new()))
            .collect();
        store.register_run(run_id, scope).await;
        store
    }

    #[tokio::test]
    async fn test_steps_run_in_order_and_share_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(dir.path().to_path_buf());
        let store = registered_store("r1", &["echoes"]).await;

        let instance = instance(
            "echoes",
            &["echo one > log.txt", "echo two >> log.txt", "grep -q two log.txt"],
        );
        let outcome = executor.execute(&instance, &ctx("r1"), &store).await;
        assert_eq!(outcome, ExecOutcome::Success);

        let log = std::fs::read_to_string(dir.path().join("r1/echoes/log.txt")).unwrap();
        assert_eq!(log, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_fail_fast_skips_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(dir.path().to_path_buf());
        let store = registered_store("r1", &["bad"]).await;

        let instance = instance("bad", &["true", "exit 3", "touch never.txt"]);
        let outcome = executor.execute(&instance, &ctx("r1"), &store).await;
        assert!(matches!(outcome, ExecOutcome::Failed { ref detail } if detail.contains("step 2")));
        assert!(!dir.path().join("r1/bad/never.txt").exists());
    }

    #[tokio::test]
    async fn test_outputs_published_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(dir.path().to_path_buf());
        let store = registered_store("r1", &["build"]).await;

        let mut inst = instance("build", &["printf payload > dist.bin"]);
        inst.outputs.push(crate::core::config::ArtifactSpec {
            name: "dist".to_string(),
            path: "dist.bin".to_string(),
        });
        let outcome = executor.execute(&inst, &ctx("r1"), &store).await;
        assert_eq!(outcome, ExecOutcome::Success);

        let published = store.list("r1").await.unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].name, "dist");
        assert_eq!(*published[0].data, b"payload".to_vec());
    }

    #[tokio::test]
    async fn test_missing_output_fails_instance() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(dir.path().to_path_buf());
        let store = registered_store("r1", &["build"]).await;

        let mut inst = instance("build", &["true"]);
        inst.outputs.push(crate::core::config::ArtifactSpec {
            name: "dist".to_string(),
            path: "nope.bin".to_string(),
        });
        let outcome = executor.execute(&inst, &ctx("r1"), &store).await;
        assert!(matches!(outcome, ExecOutcome::Failed { ref detail } if detail.contains("dist")));
    }

    #[tokio::test]
    async fn test_matrix_environment_exposed() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(dir.path().to_path_buf());
        let store = registered_store("r1", &["check[os=linux]"]).await;

        let mut inst = instance("check", &["test \"$MATRIX_OS\" = linux"]);
        inst.id = "check[os=linux]".to_string();
        inst.coordinate =
            MatrixCoordinate::new(vec![("os".to_string(), "linux".to_string())]);
        let outcome = executor.execute(&inst, &ctx("r1"), &store).await;
        assert_eq!(outcome, ExecOutcome::Success);
    }
}
