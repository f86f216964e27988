//! Per-unit execution record committed by the runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File extension of a committed task state.
pub const TASK_STATE_FILE_EXTENSION: &str = ".tst";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Outcome of running one unit, collected by the job launcher after the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub job_id: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Error message if the unit failed.
    pub error: Option<String>,
}

impl TaskState {
    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }

    /// File name under the job's task-state store.
    pub fn file_name(&self) -> String {
        format!("{}{TASK_STATE_FILE_EXTENSION}", self.task_id)
    }
}
