//! The task attempt executor: one scheduled work item, start to terminal result.
//!
//! `start` runs on the scheduler's worker thread and never returns an error;
//! every failure is folded into a [`TerminalResult`]. `cancel` may be called
//! from any other thread at any time.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Span, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerFactory, DefaultBrokerFactory, JobScope, RootBroker};
use crate::config::AttemptConfig;
use crate::engine::{AttemptContext, TaskAttempt, TaskAttemptBuilder};
use crate::error::{Error, Result};
use crate::flatten::{flatten, propagate_job_config};
use crate::job_state::JobStateLoader;
use crate::model::{
    AttemptState, CancelOutcome, DescriptorLocation, TerminalResult, WorkDescriptor,
};
use crate::storage::StateStores;
use crate::telemetry::attempt::{record_state_transition, start_attempt_span};
use crate::telemetry::metrics;

/// Where `start` publishes the engine handle for `cancel` to find.
///
/// Both fields sit behind one lock so a cancel that arrives before the handle
/// is either seen by `start` or finds the handle, never neither.
#[derive(Default)]
struct HandleSlot {
    attempt: Option<Arc<dyn TaskAttempt>>,
    cancel_requested: bool,
}

/// Runs one scheduled work item to a single [`TerminalResult`] and can be
/// cancelled from another thread while it does.
pub struct TaskAttemptExecutor {
    id: Uuid,
    config: AttemptConfig,
    stores: StateStores,
    job_states: JobStateLoader,
    builder: Arc<dyn TaskAttemptBuilder>,
    brokers: Arc<dyn BrokerFactory>,
    state: Mutex<AttemptState>,
    slot: Mutex<HandleSlot>,
    interrupt: CancellationToken,
}

impl TaskAttemptExecutor {
    pub fn new(
        config: AttemptConfig,
        stores: StateStores,
        job_states: JobStateLoader,
        builder: Arc<dyn TaskAttemptBuilder>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            stores,
            job_states,
            builder,
            brokers: Arc::new(DefaultBrokerFactory),
            state: Mutex::new(AttemptState::Created),
            slot: Mutex::new(HandleSlot::default()),
            interrupt: CancellationToken::new(),
        }
    }

    /// Use `brokers` to create the root broker.
    pub fn with_broker_factory(mut self, brokers: Arc<dyn BrokerFactory>) -> Self {
        self.brokers = brokers;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &AttemptConfig {
        &self.config
    }

    pub fn state(&self) -> AttemptState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token standing in for an interrupt of the thread running `start`.
    /// Cancelling it makes the attempt end `Canceled`.
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Run the attempt to a terminal result.
    pub fn start(&self) -> TerminalResult {
        let span = start_attempt_span(
            &self.config.job_name,
            self.config.job_id.sequence(),
            &self.id,
        );
        let _entered = span.enter();

        // A second start must not disturb the attempt already under way.
        if let Err(e) = self.transition(&span, AttemptState::Created, AttemptState::Loading) {
            warn!(error = %e, "start called twice");
            return TerminalResult::Failed {
                trace: render_trace(e),
            };
        }
        metrics::attempts_started().add(1, &[]);
        let started = Instant::now();

        let mut root = None;
        let result = match self.run(&span, &mut root) {
            Ok(units_run) => {
                info!(units_run, "task attempt completed");
                TerminalResult::Completed { units_run }
            }
            // An interrupt wins over whatever error it provoked on the way out.
            Err(e) if e.is_interruption() || self.interrupt.is_cancelled() => {
                info!("task attempt canceled");
                TerminalResult::Canceled
            }
            Err(e) => {
                error!(error = %e, "task attempt failed");
                TerminalResult::Failed {
                    trace: render_trace(e),
                }
            }
        };

        if let Some(root) = root {
            close_broker(root);
        }
        self.finish(&span, &result);

        let label = KeyValue::new("result", result.state().to_string());
        metrics::attempt_results().add(1, std::slice::from_ref(&label));
        metrics::attempt_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[label]);
        result
    }

    /// Ask a running attempt to stop and wait until it has.
    ///
    /// # Errors
    ///
    /// [`Error::ShutdownInterrupted`] when the engine's shutdown was itself
    /// interrupted, or whatever else the engine's shutdown reported.
    pub fn cancel(&self) -> Result<CancelOutcome> {
        let state = self.state();
        if state.is_terminal() {
            info!(job_id = %self.config.job_id, %state, "cancel after attempt finished, ignoring");
            return Ok(CancelOutcome::AlreadyTerminal(state));
        }

        let attempt = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            match &slot.attempt {
                Some(attempt) => Arc::clone(attempt),
                None => {
                    slot.cancel_requested = true;
                    error!(
                        job_id = %self.config.job_id,
                        %state,
                        "task cancelled before a task attempt was published"
                    );
                    return Ok(CancelOutcome::NotStarted);
                }
            }
        };

        info!(job_id = %self.config.job_id, "task cancelled: shutdown starting");
        match attempt.shutdown_tasks() {
            Ok(()) => {
                info!(job_id = %self.config.job_id, "task cancelled: shutdown complete");
                Ok(CancelOutcome::ShutdownComplete)
            }
            Err(Error::Interrupted) => Err(Error::ShutdownInterrupted {
                job_id: self.config.job_id.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    fn run(&self, span: &Span, root: &mut Option<RootBroker>) -> Result<usize> {
        self.check_interrupt()?;
        let location = DescriptorLocation::parse(&self.config.work_unit_path)?;
        let job_state = self.job_states.load(&self.config.job_id)?;
        if job_state.job_name != self.config.job_name {
            return Err(Error::Config(format!(
                "job state of {} names job {:?}, attempt was scheduled for {:?}",
                self.config.job_id, job_state.job_name, self.config.job_name
            )));
        }
        self.check_interrupt()?;

        let units = match self.stores.load_descriptor(&location)? {
            WorkDescriptor::Unit(unit) => vec![unit],
            bundle @ WorkDescriptor::Bundle(_) => {
                let mut units = flatten(&bundle);
                propagate_job_config(&mut units, &job_state);
                units
            }
        };
        let unit_count = units.len();
        info!(location = %location, units = unit_count, "work units loaded");
        self.check_interrupt()?;

        let broker = root.insert(self.brokers.create_root(&job_state.properties)?);
        let job_broker = broker.new_child(JobScope::new(
            job_state.job_name.clone(),
            job_state.job_id.clone(),
        ))?;

        let attempt = self.builder.build(AttemptContext {
            units,
            job_id: self.config.job_id.clone(),
            job_state: Arc::new(job_state),
            broker: job_broker,
            interrupt: self.interrupt.clone(),
        })?;
        self.publish(Arc::clone(&attempt))?;
        self.transition(span, AttemptState::Loading, AttemptState::Executing)?;

        attempt.run_and_optionally_commit(self.config.commit_policy)?;
        Ok(unit_count)
    }

    /// Make the engine visible to `cancel`, unless a cancel already came in.
    fn publish(&self, attempt: Arc<dyn TaskAttempt>) -> Result<()> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.cancel_requested {
            return Err(Error::Interrupted);
        }
        slot.attempt = Some(attempt);
        Ok(())
    }

    fn check_interrupt(&self) -> Result<()> {
        let early_cancel = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel_requested;
        if early_cancel || self.interrupt.is_cancelled() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    fn transition(&self, span: &Span, from: AttemptState, to: AttemptState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from || !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from: *state, to });
        }
        *state = to;
        record_state_transition(span, from, to);
        Ok(())
    }

    fn finish(&self, span: &Span, result: &TerminalResult) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let to = result.state();
        let from = *state;
        if from.can_transition_to(to) {
            record_state_transition(span, from, to);
            *state = to;
        } else {
            warn!(%from, %to, "unexpected terminal transition");
        }
    }
}

/// Close the root broker. Failures are logged and never change the result.
fn close_broker(root: RootBroker) {
    if let Err(e) = root.close() {
        error!(error = %e, "could not close shared resources broker");
        metrics::broker_close_failures().add(1, &[]);
    }
}

/// The error with its full cause chain, for operators reading the result.
fn render_trace(err: Error) -> String {
    format!("{:?}", anyhow::Error::new(err))
}
