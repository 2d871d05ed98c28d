//! Core domain models
//!
//! This module defines the fundamental data structures that represent
//! pipeline documents, trigger rules, run context, and execution state.

pub mod condition;
pub mod config;
pub mod context;
pub mod state;
pub mod trigger;

pub use config::{ConfigError, MatrixEdgePolicy, PipelineConfig};
pub use context::RunContext;
pub use state::{InstanceReport, InstanceStatus, RunReport, RunStatus};
pub use trigger::{EventKind, TriggerDecision, TriggerEvent, TriggerRule};
