//! Job-level identity and state.

use serde::{Deserialize, Serialize};

use super::work::Properties;
use crate::error::{Error, Result};

pub const JOB_NAME_KEY: &str = "job.name";
pub const JOB_ID_KEY: &str = "job.id";

/// Identifier of a job run, formatted `job_{name}_{sequence}`.
///
/// The job name may itself contain underscores; the sequence is always the
/// last segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId {
    raw: String,
    sequence: u64,
}

impl JobId {
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix("job_")
            .ok_or_else(|| Error::InvalidJobId(format!("{raw:?} does not start with job_")))?;
        let (name, seq) = rest
            .rsplit_once('_')
            .ok_or_else(|| Error::InvalidJobId(format!("{raw:?} has no sequence")))?;
        if name.is_empty() {
            return Err(Error::InvalidJobId(format!("{raw:?} has an empty name")));
        }
        let sequence = seq
            .parse()
            .map_err(|_| Error::InvalidJobId(format!("{raw:?} has a non-numeric sequence")))?;
        Ok(Self {
            raw: raw.to_string(),
            sequence,
        })
    }

    /// Build an id from its parts.
    pub fn new(name: &str, sequence: u64) -> Self {
        Self {
            raw: format!("job_{name}_{sequence}"),
            sequence,
        }
    }

    /// The numeric job key used in diagnostic context.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for JobId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        JobId::parse(&value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.raw
    }
}

/// Job-scoped state, written by the planner and read by every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub job_name: String,
    pub job_id: JobId,
    #[serde(default)]
    pub properties: Properties,
}

impl JobState {
    pub fn new(job_name: impl Into<String>, job_id: JobId) -> Self {
        Self {
            job_name: job_name.into(),
            job_id,
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}
