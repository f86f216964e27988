//! Core data model.
//!
//! Work descriptors come from the planner, job state describes the job they
//! belong to, and an attempt is one try at running them on this worker.

pub mod attempt;
pub mod job;
pub mod task_state;
pub mod work;

pub use attempt::{AttemptState, CancelOutcome, CommitPolicy, TerminalResult};
pub use job::{JOB_ID_KEY, JOB_NAME_KEY, JobId, JobState};
pub use task_state::{TaskState, TaskStatus};
pub use work::{DescriptorLocation, Properties, WorkBundle, WorkDescriptor, WorkUnit};
