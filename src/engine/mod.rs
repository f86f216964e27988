//! Execution engine seam and the bundled engine.
//!
//! The attempt executor only knows [`TaskAttemptBuilder`] and
//! [`TaskAttempt`]. [`MultiTaskAttempt`] is the engine this crate ships: it
//! runs units one by one through a [`UnitRunner`] and commits a task state
//! for each.

pub mod attempt;
pub mod hook;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broker::ChildBroker;
use crate::error::Result;
use crate::model::{CommitPolicy, JobId, JobState, WorkUnit};

pub use attempt::{MultiTaskAttempt, MultiTaskAttemptBuilder};
pub use hook::HookRunner;

/// Everything an engine needs to run one attempt.
pub struct AttemptContext {
    /// Flattened units, in execution order.
    pub units: Vec<WorkUnit>,
    pub job_id: JobId,
    pub job_state: Arc<JobState>,
    /// Job-scoped broker; closed by the executor after the attempt.
    pub broker: ChildBroker,
    /// Cancelled when the executing thread is interrupted.
    pub interrupt: CancellationToken,
}

/// A running (or runnable) attempt.
///
/// `run_and_optionally_commit` is called on the executing thread while
/// `shutdown_tasks` may be called concurrently from another.
pub trait TaskAttempt: Send + Sync {
    /// Run every unit and commit under `policy`. Returns
    /// [`Error::Interrupted`](crate::error::Error::Interrupted) when shut
    /// down or interrupted before finishing.
    fn run_and_optionally_commit(&self, policy: CommitPolicy) -> Result<()>;

    /// Ask running units to stop and block until they have. Called before
    /// the run starts, it only has to make sure the run will not start any
    /// unit.
    fn shutdown_tasks(&self) -> Result<()>;
}

/// Creates the engine for one attempt.
pub trait TaskAttemptBuilder: Send + Sync {
    fn build(&self, ctx: AttemptContext) -> Result<Arc<dyn TaskAttempt>>;
}

/// What a unit runner gets to see while running one unit.
pub struct UnitContext<'a> {
    pub task_id: &'a str,
    pub job: &'a JobState,
    pub broker: &'a ChildBroker,
    /// Cancelled on shutdown or interrupt. Long-running work should poll it.
    pub cancel: &'a CancellationToken,
}

/// Runs a single work unit to completion.
pub trait UnitRunner: Send + Sync {
    /// `Err(Error::Interrupted)` means the unit was cancelled; any other
    /// error marks it failed.
    fn run(&self, unit: &WorkUnit, ctx: &UnitContext<'_>) -> Result<()>;
}
