pub mod coordinator;
pub mod executor;
pub mod scheduler;

pub use coordinator::{CoordinatorError, RunCoordinator, RunSummary, StartError};
pub use executor::{ExecContext, ExecOutcome, JobExecutor, ProcessExecutor};
pub use scheduler::{Scheduler, DEFAULT_CONCURRENCY};
