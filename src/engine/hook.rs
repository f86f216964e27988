//! Runs a unit by executing the shell command in its `task.command` property.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use super::{UnitContext, UnitRunner};
use crate::error::{Error, Result};
use crate::model::{JOB_ID_KEY, JOB_NAME_KEY, WorkUnit};

/// Property holding the command line to run.
pub const TASK_COMMAND_KEY: &str = "task.command";

/// Runs `sh -c <task.command>` with the task identity exported as
/// `TASK_ID`, `JOB_ID` and `JOB_NAME`. The child is killed on cancel.
#[derive(Debug, Clone)]
pub struct HookRunner {
    poll_interval: Duration,
}

impl Default for HookRunner {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl HookRunner {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Poll the child until it exits or the task is cancelled.
    fn wait(&self, child: &mut Child, ctx: &UnitContext<'_>) -> Result<Option<ExitStatus>> {
        loop {
            if ctx.cancel.is_cancelled() {
                // The child may have exited on its own in the meantime.
                let _ = child.kill();
                child.wait()?;
                return Ok(None);
            }
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

impl UnitRunner for HookRunner {
    fn run(&self, unit: &WorkUnit, ctx: &UnitContext<'_>) -> Result<()> {
        let command = unit
            .get(TASK_COMMAND_KEY)
            .ok_or_else(|| Error::Config(format!("unit has no {TASK_COMMAND_KEY} property")))?;

        debug!(task_id = ctx.task_id, command, "running hook");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("TASK_ID", ctx.task_id)
            .env("JOB_ID", unit.get(JOB_ID_KEY).unwrap_or(ctx.job.job_id.as_str()))
            .env("JOB_NAME", unit.get(JOB_NAME_KEY).unwrap_or(ctx.job.job_name.as_str()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain pipes on their own threads so a chatty child cannot block.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        // Grandchildren may still hold the pipes after a kill, so the drain
        // threads are only joined when the child exited by itself.
        let Some(status) = self.wait(&mut child, ctx)? else {
            debug!(task_id = ctx.task_id, "hook killed on cancel");
            return Err(Error::Interrupted);
        };
        let stdout = join(stdout);
        let stderr = join(stderr);

        if !stdout.is_empty() {
            debug!(task_id = ctx.task_id, output = %stdout.trim_end(), "hook output");
        }

        if status.success() {
            Ok(())
        } else {
            let code = status.code().unwrap_or(-1);
            let stderr = stderr.trim();
            Err(Error::Other(if stderr.is_empty() {
                format!("command exited with status {code}")
            } else {
                format!("command exited with status {code}: {stderr}")
            }))
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{JobScope, RootBroker};
    use crate::model::{JobId, JobState, Properties};
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn run(unit: &WorkUnit, cancel: &CancellationToken) -> Result<()> {
        let job = JobState::new("etl", JobId::new("etl", 1));
        let root = RootBroker::new(Properties::new());
        let broker = root
            .new_child(JobScope::new("etl", job.job_id.clone()))
            .unwrap();
        HookRunner::new(Duration::from_millis(10)).run(
            unit,
            &UnitContext {
                task_id: "task_etl_1_0",
                job: &job,
                broker: &broker,
                cancel,
            },
        )
    }

    #[test]
    fn successful_command() {
        let unit = WorkUnit::new().with_property(TASK_COMMAND_KEY, "echo hello");
        run(&unit, &CancellationToken::new()).unwrap();
    }

    #[test]
    fn failing_command_reports_status_and_stderr() {
        let unit =
            WorkUnit::new().with_property(TASK_COMMAND_KEY, "echo 'no input' >&2; exit 3");
        let err = run(&unit, &CancellationToken::new()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("status 3"), "{msg}");
        assert!(msg.contains("no input"), "{msg}");
    }

    #[test]
    fn task_identity_is_exported() {
        let unit = WorkUnit::new().with_property(
            TASK_COMMAND_KEY,
            r#"test "$TASK_ID" = task_etl_1_0 && test "$JOB_ID" = job_etl_1 && test "$JOB_NAME" = etl"#,
        );
        run(&unit, &CancellationToken::new()).unwrap();
    }

    #[test]
    fn missing_command_is_a_config_error() {
        let err = run(&WorkUnit::new(), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn cancel_kills_the_child() {
        let unit = WorkUnit::new().with_property(TASK_COMMAND_KEY, "sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = Instant::now();
        let err = run(&unit, &cancel).unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
