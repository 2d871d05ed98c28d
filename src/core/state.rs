//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Instances are being dispatched
    Running,
    /// Every instance reached a terminal state and none failed
    Succeeded,
    /// At least one instance failed
    Failed,
    /// Run was explicitly canceled
    Canceled,
}

impl RunStatus {
    /// Check if the run has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        };
        f.write_str(word)
    }
}

/// State of a single job instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum InstanceStatus {
    /// Instance created, dependencies not yet evaluated
    Pending,
    /// Waiting on unresolved dependencies
    Blocked,
    /// All dependencies succeeded; eligible for dispatch
    Runnable,
    /// Dispatched to an executor
    Running { started_at: DateTime<Utc> },
    /// Step sequence completed and artifacts are visible in the store
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    /// A step failed, timed out, or an artifact contract was violated
    Failed {
        detail: String,
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
    },
    /// Never dispatched: condition false or an upstream dependency did not succeed
    Skipped { reason: String },
    /// Overridden by an explicit cancellation before dispatch
    Canceled,
}

impl InstanceStatus {
    /// Check if the instance is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Succeeded { .. }
                | InstanceStatus::Failed { .. }
                | InstanceStatus::Skipped { .. }
                | InstanceStatus::Canceled
        )
    }

    /// Check if the instance succeeded
    pub fn is_succeeded(&self) -> bool {
        matches!(self, InstanceStatus::Succeeded { .. })
    }

    /// Terminal but not succeeded: dependents of this instance must be skipped
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Failed { .. }
                | InstanceStatus::Skipped { .. }
                | InstanceStatus::Canceled
        )
    }
}

/// Per-instance entry in a run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceReport {
    /// Full instance id (job id plus matrix coordinate)
    pub id: String,

    /// Job definition this instance was expanded from
    pub job: String,

    /// Matrix coordinate, empty string for non-matrix jobs
    pub coordinate: String,

    pub status: InstanceStatus,
}

/// Status snapshot of one run, consumable by external tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,

    pub status: RunStatus,

    /// Kind of the event that started this run
    pub event: String,

    /// Branch or tag ref the event carried, if any
    pub git_ref: Option<String>,

    pub created_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Full per-instance status table
    pub instances: Vec<InstanceReport>,
}

impl RunReport {
    /// Count instances matching a status predicate
    pub fn count_where(&self, pred: impl Fn(&InstanceStatus) -> bool) -> usize {
        self.instances.iter().filter(|i| pred(&i.status)).count()
    }
}
