//! End-to-end attempts through the bundled engine: file-backed stores, shell
//! hooks, committed task states.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use attempt_rs::TaskAttemptExecutor;
use attempt_rs::config::AttemptConfig;
use attempt_rs::engine::hook::TASK_COMMAND_KEY;
use attempt_rs::engine::{HookRunner, MultiTaskAttemptBuilder};
use attempt_rs::job_state::JobStateLoader;
use attempt_rs::model::{
    AttemptState, CancelOutcome, CommitPolicy, DescriptorLocation, JobId, JobState,
    TaskStatus, TerminalResult, WorkBundle, WorkDescriptor, WorkUnit,
};
use attempt_rs::storage::{FsBlobStore, StateStores};
use tempfile::TempDir;

struct Worker {
    dir: TempDir,
    stores: StateStores,
    job_id: JobId,
}

fn worker() -> Worker {
    let dir = tempfile::tempdir().unwrap();
    let stores = StateStores::shared(Arc::new(FsBlobStore::new(dir.path().join("state"))));
    let job_id = JobId::new("ingest", 3);
    JobStateLoader::new(dir.path().join("work"))
        .save(&JobState::new("ingest", job_id.clone()).with_property("region", "eu"))
        .unwrap();
    Worker { dir, stores, job_id }
}

impl Worker {
    fn executor(&self, bundle: WorkBundle, policy: CommitPolicy) -> TaskAttemptExecutor {
        let path = "units/ingest_3.mwu";
        self.stores
            .put_descriptor(
                &DescriptorLocation::parse(path).unwrap(),
                &WorkDescriptor::Bundle(bundle),
            )
            .unwrap();

        let builder = MultiTaskAttemptBuilder::new(
            Arc::new(HookRunner::new(Duration::from_millis(10))),
            self.stores.clone(),
        );
        TaskAttemptExecutor::new(
            AttemptConfig {
                job_name: "ingest".to_string(),
                job_id: self.job_id.clone(),
                work_unit_path: path.to_string(),
                commit_policy: policy,
            },
            self.stores.clone(),
            JobStateLoader::new(self.dir.path().join("work")),
            Arc::new(builder),
        )
    }
}

fn command(cmd: &str) -> WorkUnit {
    WorkUnit::new().with_property(TASK_COMMAND_KEY, cmd)
}

#[test]
fn bundle_runs_every_hook_and_commits_task_states() {
    let w = worker();
    let out = w.dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    let out = out.display();

    let bundle = WorkBundle::new()
        .unit(command(&format!("echo \"$JOB_ID\" > {out}/a")))
        .bundle(
            WorkBundle::new()
                .unit(command(&format!("echo \"$TASK_ID\" > {out}/b")))
                .unit(command(&format!("touch {out}/c"))),
        );
    let executor = w.executor(bundle, CommitPolicy::Immediate);

    assert_eq!(executor.start(), TerminalResult::Completed { units_run: 3 });

    let out = w.dir.path().join("out");
    assert_eq!(
        std::fs::read_to_string(out.join("a")).unwrap().trim(),
        "job_ingest_3"
    );
    assert_eq!(
        std::fs::read_to_string(out.join("b")).unwrap().trim(),
        "task_ingest_3_1"
    );
    assert!(out.join("c").exists());

    let states = w.stores.task_states(&w.job_id).unwrap();
    assert_eq!(states.len(), 3);
    assert!(states.iter().all(|s| s.status == TaskStatus::Succeeded));
}

#[test]
fn failing_hook_fails_the_attempt_but_runs_the_rest() {
    let w = worker();
    let bundle = WorkBundle::new()
        .unit(command("exit 4").with_property("task.id", "broken"))
        .unit(command("true").with_property("task.id", "fine"));
    let executor = w.executor(bundle, CommitPolicy::Immediate);

    let TerminalResult::Failed { trace } = executor.start() else {
        panic!("expected a failed result");
    };
    assert!(trace.contains("broken"), "{trace}");

    let states = w.stores.task_states(&w.job_id).unwrap();
    let status = |id: &str| states.iter().find(|s| s.task_id == id).map(|s| s.status);
    assert_eq!(status("broken"), Some(TaskStatus::Failed));
    assert_eq!(status("fine"), Some(TaskStatus::Succeeded));
}

#[test]
fn deferred_commit_writes_states_after_the_last_unit() {
    let w = worker();
    let bundle = WorkBundle::new().unit(command("true")).unit(command("true"));
    let executor = w.executor(bundle, CommitPolicy::Deferred);

    assert_eq!(executor.start(), TerminalResult::Completed { units_run: 2 });
    assert_eq!(w.stores.task_states(&w.job_id).unwrap().len(), 2);
}

#[test]
fn cancel_kills_a_running_hook() {
    let w = worker();
    let bundle = WorkBundle::new()
        .unit(command("sleep 30"))
        .unit(command("true"));
    let executor = Arc::new(w.executor(bundle, CommitPolicy::Immediate));

    let handle = {
        let executor = Arc::clone(&executor);
        thread::spawn(move || executor.start())
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while executor.state() != AttemptState::Executing {
        assert!(Instant::now() < deadline, "attempt never started executing");
        thread::sleep(Duration::from_millis(10));
    }

    let started = Instant::now();
    assert_eq!(executor.cancel().unwrap(), CancelOutcome::ShutdownComplete);
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(handle.join().unwrap(), TerminalResult::Canceled);
    assert_eq!(executor.state(), AttemptState::Canceled);
}

#[test]
fn bundle_task_id_does_not_collapse_task_states() {
    let w = worker();
    let bundle = WorkBundle::new()
        .with_property("task.id", "shared")
        .unit(command("true"))
        .unit(command("true"))
        .unit(command("true"));
    let executor = w.executor(bundle, CommitPolicy::Immediate);

    assert_eq!(executor.start(), TerminalResult::Completed { units_run: 3 });

    let ids: Vec<_> = w
        .stores
        .task_states(&w.job_id)
        .unwrap()
        .into_iter()
        .map(|s| s.task_id)
        .collect();
    assert_eq!(ids, ["task_ingest_3_0", "task_ingest_3_1", "task_ingest_3_2"]);
}

#[test]
fn task_id_with_a_path_fails_before_running_anything() {
    let w = worker();
    let marker = w.dir.path().join("ran");
    for bad in ["part/0", "../../escaped"] {
        let bundle = WorkBundle::new()
            .unit(command(&format!("touch {}", marker.display())).with_property("task.id", bad));
        let executor = w.executor(bundle, CommitPolicy::Immediate);

        let TerminalResult::Failed { trace } = executor.start() else {
            panic!("expected a failed result for {bad:?}");
        };
        assert!(trace.contains(bad), "{trace}");
        assert!(!marker.exists(), "{bad:?} ran its command");
        assert!(w.stores.task_states(&w.job_id).unwrap().is_empty());
    }
}
