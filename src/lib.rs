//! pipewright - A CI/CD pipeline orchestration engine

pub mod artifact;
pub mod cli;
pub mod core;
pub mod execution;
pub mod graph;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactError, ArtifactStore, RetentionPolicy};
pub use core::{
    ConfigError, EventKind, InstanceReport, InstanceStatus, PipelineConfig, RunContext, RunReport,
    RunStatus, TriggerEvent,
};
pub use execution::{
    JobExecutor, ProcessExecutor, RunCoordinator, RunSummary, Scheduler, StartError,
};
pub use graph::{GraphBuilder, JobGraph, JobInstance};
