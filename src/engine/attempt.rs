//! Sequential multi-unit attempt with per-unit task-state commits.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{AttemptContext, TaskAttempt, TaskAttemptBuilder, UnitContext, UnitRunner};
use crate::error::{Error, Result};
use crate::model::work::TASK_ID_KEY;
use crate::model::{CommitPolicy, TaskState, TaskStatus, WorkUnit};
use crate::storage::StateStores;
use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Finished,
}

/// Runs the units of one attempt in order.
///
/// Every unit runs even if an earlier one failed; the attempt fails at the
/// end naming the failed tasks. Shutdown stops before the next unit and
/// cancels the one in flight.
pub struct MultiTaskAttempt {
    ctx: AttemptContext,
    runner: Arc<dyn UnitRunner>,
    stores: StateStores,
    /// Child of the interrupt token, so an interrupt also stops the units.
    cancel: CancellationToken,
    phase: Mutex<Phase>,
    finished: Condvar,
}

impl MultiTaskAttempt {
    pub fn new(ctx: AttemptContext, runner: Arc<dyn UnitRunner>, stores: StateStores) -> Self {
        let cancel = ctx.interrupt.child_token();
        Self {
            ctx,
            runner,
            stores,
            cancel,
            phase: Mutex::new(Phase::Idle),
            finished: Condvar::new(),
        }
    }

    /// Task id of the unit at `index`: the unit's own `task.id`, or one
    /// derived from the job.
    pub fn task_id(&self, index: usize, unit: &WorkUnit) -> String {
        match unit.get(TASK_ID_KEY) {
            Some(id) => id.to_string(),
            None => format!(
                "task_{}_{}_{index}",
                self.ctx.job_state.job_name,
                self.ctx.job_id.sequence()
            ),
        }
    }

    /// Task ids of every unit, in run order. Each one names a task-state file,
    /// so they must be distinct plain file names.
    fn task_ids(&self) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(self.ctx.units.len());
        for (index, unit) in self.ctx.units.iter().enumerate() {
            let id = self.task_id(index, unit);
            if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
                return Err(Error::Config(format!(
                    "task id {id:?} of unit {index} is not a plain file name"
                )));
            }
            if !seen.insert(id.clone()) {
                return Err(Error::Config(format!(
                    "task id {id:?} is used by more than one unit"
                )));
            }
            ids.push(id);
        }
        Ok(ids)
    }

    fn run_unit(&self, task_id: String, unit: &WorkUnit) -> TaskState {
        let started_at = Utc::now();
        let outcome = self.runner.run(
            unit,
            &UnitContext {
                task_id: &task_id,
                job: &self.ctx.job_state,
                broker: &self.ctx.broker,
                cancel: &self.cancel,
            },
        );
        let (status, error) = match outcome {
            Ok(()) => (TaskStatus::Succeeded, None),
            Err(Error::Interrupted) => (TaskStatus::Cancelled, None),
            Err(e) => (TaskStatus::Failed, Some(e.to_string())),
        };

        let state = TaskState {
            task_id,
            job_id: self.ctx.job_id.to_string(),
            status,
            started_at,
            ended_at: Utc::now(),
            error,
        };
        metrics::units_run().add(1, &[KeyValue::new("status", status.to_string())]);
        match status {
            TaskStatus::Failed => warn!(
                task_id = %state.task_id,
                duration_ms = state.duration_ms(),
                error = state.error.as_deref().unwrap_or_default(),
                "task failed"
            ),
            _ => info!(
                task_id = %state.task_id,
                status = %status,
                duration_ms = state.duration_ms(),
                "task finished"
            ),
        }
        state
    }

    fn run_all(&self, policy: CommitPolicy) -> Result<()> {
        let mut pending = Vec::new();
        let mut failed = Vec::new();
        let mut interrupted = false;

        let task_ids = self.task_ids()?;
        for (task_id, unit) in task_ids.into_iter().zip(&self.ctx.units) {
            if self.cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            let state = self.run_unit(task_id, unit);
            match state.status {
                TaskStatus::Succeeded => {}
                TaskStatus::Failed => failed.push(state.task_id.clone()),
                TaskStatus::Cancelled => interrupted = true,
            }
            match policy {
                CommitPolicy::Immediate => self
                    .stores
                    .commit_task_states(&self.ctx.job_id, std::slice::from_ref(&state))?,
                CommitPolicy::Deferred => pending.push(state),
            }
            if interrupted {
                break;
            }
        }

        // A deferred batch is only made durable when the attempt ran to the end.
        if policy == CommitPolicy::Deferred && !interrupted {
            self.stores.commit_task_states(&self.ctx.job_id, &pending)?;
        }

        if interrupted {
            Err(Error::Interrupted)
        } else if !failed.is_empty() {
            Err(Error::TasksFailed(failed))
        } else {
            Ok(())
        }
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
        if phase == Phase::Finished {
            self.finished.notify_all();
        }
    }
}

/// Marks the attempt finished however `run_all` exits, panics included.
struct FinishOnDrop<'a>(&'a MultiTaskAttempt);

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set_phase(Phase::Finished);
    }
}

impl TaskAttempt for MultiTaskAttempt {
    fn run_and_optionally_commit(&self, policy: CommitPolicy) -> Result<()> {
        {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if *phase != Phase::Idle {
                return Err(Error::Other("task attempt already ran".to_string()));
            }
            *phase = Phase::Running;
        }
        let _finish = FinishOnDrop(self);

        info!(
            job_id = %self.ctx.job_id,
            units = self.ctx.units.len(),
            policy = ?policy,
            "running tasks"
        );
        self.run_all(policy)
    }

    /// Cancel the units and wait for a run in progress to return. A run
    /// that has not begun yet returns immediately; it sees the cancellation
    /// before its first unit and ends `Interrupted` without running any.
    fn shutdown_tasks(&self) -> Result<()> {
        self.cancel.cancel();
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        while *phase == Phase::Running {
            phase = self
                .finished
                .wait(phase)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }
}

/// Builds a [`MultiTaskAttempt`] around a shared runner and task-state store.
#[derive(Clone)]
pub struct MultiTaskAttemptBuilder {
    runner: Arc<dyn UnitRunner>,
    stores: StateStores,
}

impl MultiTaskAttemptBuilder {
    pub fn new(runner: Arc<dyn UnitRunner>, stores: StateStores) -> Self {
        Self { runner, stores }
    }
}

impl TaskAttemptBuilder for MultiTaskAttemptBuilder {
    fn build(&self, ctx: AttemptContext) -> Result<Arc<dyn TaskAttempt>> {
        Ok(Arc::new(MultiTaskAttempt::new(
            ctx,
            Arc::clone(&self.runner),
            self.stores.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{JobScope, RootBroker};
    use crate::model::{JobId, JobState, Properties};
    use crate::storage::MemoryBlobStore;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Fails units whose `fail` property is set; blocks on `block` until cancelled.
    struct ScriptedRunner {
        started: Mutex<Option<mpsc::Sender<String>>>,
    }

    impl ScriptedRunner {
        fn new() -> Self {
            Self {
                started: Mutex::new(None),
            }
        }
    }

    impl UnitRunner for ScriptedRunner {
        fn run(&self, unit: &WorkUnit, ctx: &UnitContext<'_>) -> Result<()> {
            if let Some(tx) = self.started.lock().unwrap().as_ref() {
                let _ = tx.send(ctx.task_id.to_string());
            }
            if unit.get("block").is_some() {
                while !ctx.cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                return Err(Error::Interrupted);
            }
            if unit.get("fail").is_some() {
                return Err(Error::Other("boom".to_string()));
            }
            Ok(())
        }
    }

    fn context(units: Vec<WorkUnit>, root: &RootBroker) -> AttemptContext {
        let job_id = JobId::new("etl", 4);
        AttemptContext {
            units,
            job_id: job_id.clone(),
            job_state: Arc::new(JobState::new("etl", job_id.clone())),
            broker: root.new_child(JobScope::new("etl", job_id)).unwrap(),
            interrupt: CancellationToken::new(),
        }
    }

    fn stores() -> StateStores {
        StateStores::shared(Arc::new(MemoryBlobStore::new()))
    }

    #[test]
    fn commits_every_unit_and_derives_task_ids() {
        let root = RootBroker::new(Properties::new());
        let stores = stores();
        let units = vec![
            WorkUnit::new(),
            WorkUnit::new().with_property(TASK_ID_KEY, "custom"),
        ];
        let attempt = MultiTaskAttempt::new(
            context(units, &root),
            Arc::new(ScriptedRunner::new()),
            stores.clone(),
        );

        attempt
            .run_and_optionally_commit(CommitPolicy::Immediate)
            .unwrap();

        let mut ids: Vec<_> = stores
            .task_states(&JobId::new("etl", 4))
            .unwrap()
            .into_iter()
            .map(|s| s.task_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["custom", "task_etl_4_0"]);
    }

    #[test]
    fn duplicate_task_ids_are_rejected_before_any_unit_runs() {
        let root = RootBroker::new(Properties::new());
        let stores = stores();
        let runner = Arc::new(ScriptedRunner::new());
        let (tx, rx) = mpsc::channel();
        *runner.started.lock().unwrap() = Some(tx);
        let units = (0..3)
            .map(|_| WorkUnit::new().with_property(TASK_ID_KEY, "shared"))
            .collect();
        let attempt = MultiTaskAttempt::new(context(units, &root), runner, stores.clone());

        let err = attempt
            .run_and_optionally_commit(CommitPolicy::Immediate)
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("shared")), "{err}");
        assert!(rx.try_recv().is_err());
        assert!(stores.task_states(&JobId::new("etl", 4)).unwrap().is_empty());
    }

    #[test]
    fn task_ids_must_be_plain_file_names() {
        for bad in ["part/0", "../../escaped", "", ".hidden", "a\\b"] {
            let root = RootBroker::new(Properties::new());
            let runner = Arc::new(ScriptedRunner::new());
            let (tx, rx) = mpsc::channel();
            *runner.started.lock().unwrap() = Some(tx);
            let units = vec![WorkUnit::new(), WorkUnit::new().with_property(TASK_ID_KEY, bad)];
            let attempt = MultiTaskAttempt::new(context(units, &root), runner, stores());

            let err = attempt
                .run_and_optionally_commit(CommitPolicy::Immediate)
                .unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{bad:?}: {err}");
            assert!(rx.try_recv().is_err(), "{bad:?} ran a unit");
        }
    }

    #[test]
    fn failures_are_collected_after_all_units_ran() {
        let root = RootBroker::new(Properties::new());
        let stores = stores();
        let units = vec![
            WorkUnit::new().with_property("fail", "1"),
            WorkUnit::new(),
        ];
        let attempt = MultiTaskAttempt::new(
            context(units, &root),
            Arc::new(ScriptedRunner::new()),
            stores.clone(),
        );

        let err = attempt
            .run_and_optionally_commit(CommitPolicy::Immediate)
            .unwrap_err();
        assert!(matches!(err, Error::TasksFailed(ref ids) if ids == &["task_etl_4_0"]));

        let states = stores.task_states(&JobId::new("etl", 4)).unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].status, TaskStatus::Failed);
        assert_eq!(states[0].error.as_deref(), Some("boom"));
        assert_eq!(states[1].status, TaskStatus::Succeeded);
    }

    #[test]
    fn deferred_commit_waits_for_the_last_unit() {
        let root = RootBroker::new(Properties::new());
        let stores = stores();
        let attempt = MultiTaskAttempt::new(
            context(vec![WorkUnit::new(), WorkUnit::new()], &root),
            Arc::new(ScriptedRunner::new()),
            stores.clone(),
        );
        attempt
            .run_and_optionally_commit(CommitPolicy::Deferred)
            .unwrap();
        assert_eq!(stores.task_states(&JobId::new("etl", 4)).unwrap().len(), 2);
    }

    #[test]
    fn shutdown_stops_the_run_and_waits_for_it() {
        let root = RootBroker::new(Properties::new());
        let stores = stores();
        let runner = Arc::new(ScriptedRunner::new());
        let (tx, rx) = mpsc::channel();
        *runner.started.lock().unwrap() = Some(tx);

        let units = vec![
            WorkUnit::new(),
            WorkUnit::new().with_property("block", "1"),
            WorkUnit::new(),
        ];
        let attempt = Arc::new(MultiTaskAttempt::new(
            context(units, &root),
            runner,
            stores.clone(),
        ));

        let running = Arc::clone(&attempt);
        let handle =
            std::thread::spawn(move || running.run_and_optionally_commit(CommitPolicy::Deferred));

        // Wait until the blocking unit has started.
        assert_eq!(rx.recv().unwrap(), "task_etl_4_0");
        assert_eq!(rx.recv().unwrap(), "task_etl_4_1");

        attempt.shutdown_tasks().unwrap();
        assert!(matches!(handle.join().unwrap(), Err(Error::Interrupted)));

        // Third unit never ran, and the deferred batch was dropped.
        assert!(rx.try_recv().is_err());
        assert!(stores.task_states(&JobId::new("etl", 4)).unwrap().is_empty());
    }

    #[test]
    fn shutdown_before_run_prevents_it() {
        let root = RootBroker::new(Properties::new());
        let stores = stores();
        let runner = Arc::new(ScriptedRunner::new());
        let (tx, rx) = mpsc::channel();
        *runner.started.lock().unwrap() = Some(tx);
        let attempt = MultiTaskAttempt::new(
            context(vec![WorkUnit::new()], &root),
            runner,
            stores.clone(),
        );

        // Nothing is running yet, so this returns without waiting.
        attempt.shutdown_tasks().unwrap();
        assert!(matches!(
            attempt.run_and_optionally_commit(CommitPolicy::Immediate),
            Err(Error::Interrupted)
        ));
        assert!(rx.try_recv().is_err());
        assert!(stores.task_states(&JobId::new("etl", 4)).unwrap().is_empty());
    }

    #[test]
    fn interrupt_token_reaches_units() {
        let root = RootBroker::new(Properties::new());
        let ctx = context(vec![WorkUnit::new()], &root);
        ctx.interrupt.cancel();
        let attempt = MultiTaskAttempt::new(ctx, Arc::new(ScriptedRunner::new()), stores());
        assert!(matches!(
            attempt.run_and_optionally_commit(CommitPolicy::Immediate),
            Err(Error::Interrupted)
        ));
    }
}
