//! Attempt span helpers.
//!
//! The attempt span carries the job name and job key for everything logged
//! while an attempt runs. It is entered for the duration of `start` and the
//! guard drops on every exit path.

use tracing::Span;
use uuid::Uuid;

use crate::model::AttemptState;

/// Start a span for one task attempt.
///
/// The `attempt.state` field is declared empty and updated via
/// [`record_state_transition`].
pub fn start_attempt_span(job_name: &str, job_key: u64, attempt_id: &Uuid) -> Span {
    tracing::info_span!(
        "task.attempt",
        "job.name" = job_name,
        "job.key" = job_key,
        "attempt.id" = %attempt_id,
        "attempt.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the attempt span.
pub fn record_state_transition(span: &Span, from: AttemptState, to: AttemptState) {
    span.record("attempt.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}
