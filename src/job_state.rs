//! Loads the job state the planner left in the application work directory.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{JobId, JobState};

/// Suffix of a serialized job state: `{job_id}.job.state`.
pub const JOB_STATE_FILE_NAME: &str = "job.state";

#[derive(Debug, Clone)]
pub struct JobStateLoader {
    app_work_dir: PathBuf,
}

impl JobStateLoader {
    pub fn new(app_work_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_work_dir: app_work_dir.into(),
        }
    }

    pub fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.app_work_dir
            .join(format!("{job_id}.{JOB_STATE_FILE_NAME}"))
    }

    pub fn app_work_dir(&self) -> &Path {
        &self.app_work_dir
    }

    /// Read and deserialize the state of `job_id`.
    pub fn load(&self, job_id: &JobId) -> Result<JobState> {
        let path = self.path_for(job_id);
        let data = std::fs::read(&path).map_err(|source| Error::DescriptorLoad {
            path: path.display().to_string(),
            source,
        })?;
        let state: JobState = serde_json::from_slice(&data)?;

        if &state.job_id != job_id {
            return Err(Error::Other(format!(
                "job state at {} belongs to {}, expected {job_id}",
                path.display(),
                state.job_id
            )));
        }

        debug!(
            job_id = %job_id,
            properties = state.properties.len(),
            "job state loaded"
        );
        Ok(state)
    }

    /// Write `state` where `load` will find it.
    pub fn save(&self, state: &JobState) -> Result<()> {
        std::fs::create_dir_all(&self.app_work_dir)?;
        let data = serde_json::to_vec_pretty(state)?;
        std::fs::write(self.path_for(&state.job_id), data)?;
        Ok(())
    }
}
