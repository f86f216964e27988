//! Attempt lifecycle, commit policy and results.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Constructed, `start` not yet called.
    Created,
    /// Reading job state and the work descriptor.
    Loading,
    /// Delegated to the execution engine.
    Executing,
    /// Every unit ran. Terminal.
    Completed,
    /// Interrupted or shut down. Terminal.
    Canceled,
    /// Anything else went wrong. Terminal.
    Failed,
}

impl AttemptState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, to),
            (Created, Loading)
                | (Loading, Executing)
                | (Loading, Canceled)
                | (Loading, Failed)
                | (Executing, Completed)
                | (Executing, Canceled)
                | (Executing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Completed | AttemptState::Canceled | AttemptState::Failed
        )
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttemptState::Created => "created",
            AttemptState::Loading => "loading",
            AttemptState::Executing => "executing",
            AttemptState::Completed => "completed",
            AttemptState::Canceled => "canceled",
            AttemptState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Commit policy
// ---------------------------------------------------------------------------

/// When a unit's output is made durable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Commit each unit as soon as it finishes.
    #[default]
    Immediate,
    /// Commit every unit together once the last one finishes.
    Deferred,
}

impl std::str::FromStr for CommitPolicy {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(CommitPolicy::Immediate),
            "deferred" => Ok(CommitPolicy::Deferred),
            other => Err(crate::error::Error::Config(format!(
                "unknown commit policy: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// The single outcome an attempt reports to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminalResult {
    Completed { units_run: usize },
    Canceled,
    Failed { trace: String },
}

impl TerminalResult {
    pub fn state(&self) -> AttemptState {
        match self {
            TerminalResult::Completed { .. } => AttemptState::Completed,
            TerminalResult::Canceled => AttemptState::Canceled,
            TerminalResult::Failed { .. } => AttemptState::Failed,
        }
    }
}

impl std::fmt::Display for TerminalResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalResult::Completed { units_run } => write!(f, "completed tasks: {units_run}"),
            TerminalResult::Canceled => write!(f, "canceled"),
            TerminalResult::Failed { trace } => write!(f, "failed: {trace}"),
        }
    }
}

/// What a `cancel` call found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The engine acknowledged shutdown.
    ShutdownComplete,
    /// No engine handle was published yet. The request is remembered and the
    /// attempt ends `Canceled` instead of running.
    NotStarted,
    /// The attempt had already finished; nothing to do.
    AlreadyTerminal(AttemptState),
}
