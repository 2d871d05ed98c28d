//! End-to-end smoke test with real shell steps

mod common;

use common::push_event;
use pipewright::{
    PipelineConfig, ProcessExecutor, RetentionPolicy, RunCoordinator, RunStatus,
};
use std::sync::Arc;

#[tokio::test]
async fn test_shell_pipeline_end_to_end() {
    let workdir = tempfile::tempdir().unwrap();
    let flush_dir = tempfile::tempdir().unwrap();

    let yaml = r#"
name: "Smoke"
triggers:
  - event: push
    branches: ["main"]
jobs:
  - id: build
    steps:
      - "printf 'artifact payload' > dist.bin"
    outputs:
      - name: dist
        path: dist.bin
  - id: verify
    needs: [build]
    inputs: [dist]
    steps:
      - "grep -q 'artifact payload' dist"
      - "test \"$PIPELINE_EVENT\" = push"
"#;
    let config = PipelineConfig::from_yaml(yaml).unwrap();
    let executor = Arc::new(ProcessExecutor::new(workdir.path().to_path_buf()));
    let coordinator = RunCoordinator::with_retention(
        executor,
        RetentionPolicy::Flush(flush_dir.path().to_path_buf()),
    );

    let run_id = coordinator.start(&config, &push_event("main")).await.unwrap();
    let status = coordinator.wait(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    // Flush retention wrote the artifact bytes out unchanged
    let flushed = std::fs::read(flush_dir.path().join(&run_id).join("dist")).unwrap();
    assert_eq!(flushed, b"artifact payload");
}

#[tokio::test]
async fn test_failing_step_fails_run() {
    let workdir = tempfile::tempdir().unwrap();
    let yaml = r#"
name: "Smoke failure"
jobs:
  - id: broken
    steps: ["exit 7"]
  - id: after
    needs: [broken]
    steps: ["true"]
"#;
    let config = PipelineConfig::from_yaml(yaml).unwrap();
    let executor = Arc::new(ProcessExecutor::new(workdir.path().to_path_buf()));
    let coordinator = RunCoordinator::new(executor);

    let run_id = coordinator.start(&config, &push_event("main")).await.unwrap();
    assert_eq!(coordinator.wait(&run_id).await.unwrap(), RunStatus::Failed);

    let report = coordinator.status(&run_id).await.unwrap();
    let broken = report.instances.iter().find(|i| i.id == "broken").unwrap();
    assert!(matches!(
        &broken.status,
        pipewright::InstanceStatus::Failed { detail, .. } if detail.contains("step 1")
    ));
}

#[tokio::test]
async fn test_timeout_fails_instance() {
    let workdir = tempfile::tempdir().unwrap();
    let yaml = r#"
name: "Smoke timeout"
jobs:
  - id: slow
    timeout_secs: 1
    steps: ["sleep 30"]
"#;
    let config = PipelineConfig::from_yaml(yaml).unwrap();
    let executor = Arc::new(ProcessExecutor::new(workdir.path().to_path_buf()));
    let coordinator = RunCoordinator::new(executor);

    let run_id = coordinator.start(&config, &push_event("main")).await.unwrap();
    assert_eq!(coordinator.wait(&run_id).await.unwrap(), RunStatus::Failed);

    let report = coordinator.status(&run_id).await.unwrap();
    assert!(matches!(
        &report.instances[0].status,
        pipewright::InstanceStatus::Failed { detail, .. } if detail.contains("timed out")
    ));
}
