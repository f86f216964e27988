//! Typed configuration.
//!
//! [`WorkerConfig`] comes from the environment once at startup and fails fast
//! if required vars are missing. [`AttemptConfig`] is the key/value map the
//! scheduler hands to each attempt.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::model::{CommitPolicy, JOB_ID_KEY, JOB_NAME_KEY, JobId, Properties};

/// Location of the descriptor an attempt runs.
pub const WORK_UNIT_FILE_PATH_KEY: &str = "work.unit.file.path";

/// Optional commit policy override (`immediate` | `deferred`).
pub const COMMIT_POLICY_KEY: &str = "commit.policy";

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root of the descriptor and task-state blob store.
    pub state_store_root: PathBuf,
    /// Application work directory holding `{job_id}.job.state` files.
    pub app_work_dir: PathBuf,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            state_store_root: PathBuf::from(required_var("STATE_STORE_ROOT")?),
            app_work_dir: PathBuf::from(required_var("APP_WORK_DIR")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

// ---------------------------------------------------------------------------
// Attempt
// ---------------------------------------------------------------------------

/// What the scheduler tells one attempt to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptConfig {
    pub job_name: String,
    pub job_id: JobId,
    pub work_unit_path: String,
    pub commit_policy: CommitPolicy,
}

impl AttemptConfig {
    pub fn from_map(map: &Properties) -> Result<Self> {
        let required = |key: &str| {
            map.get(key)
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .ok_or_else(|| Error::Config(format!("attempt configuration is missing {key}")))
        };

        let commit_policy = match map.get(COMMIT_POLICY_KEY) {
            Some(raw) => raw.parse()?,
            None => CommitPolicy::default(),
        };

        Ok(Self {
            job_name: required(JOB_NAME_KEY)?,
            job_id: JobId::parse(&required(JOB_ID_KEY)?)?,
            work_unit_path: required(WORK_UNIT_FILE_PATH_KEY)?,
            commit_policy,
        })
    }

    /// Parse a TOML attempt file. Nested tables flatten to dotted keys, so
    /// `job.name = "x"` and `"job.name" = "x"` mean the same thing.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(text)
            .map_err(|e| Error::Config(format!("bad attempt file: {e}")))?;
        let mut map = Properties::new();
        flatten_table("", &table, &mut map);
        Self::from_map(&map)
    }

    /// The map form, as the scheduler would send it.
    pub fn to_map(&self) -> Properties {
        let mut map = Properties::new();
        map.insert(JOB_NAME_KEY.to_string(), self.job_name.clone());
        map.insert(JOB_ID_KEY.to_string(), self.job_id.to_string());
        map.insert(WORK_UNIT_FILE_PATH_KEY.to_string(), self.work_unit_path.clone());
        let policy = match self.commit_policy {
            CommitPolicy::Immediate => "immediate",
            CommitPolicy::Deferred => "deferred",
        };
        map.insert(COMMIT_POLICY_KEY.to_string(), policy.to_string());
        map
    }
}

fn flatten_table(prefix: &str, table: &toml::Table, out: &mut Properties) {
    for (key, value) in table {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(inner) => flatten_table(&key, inner, out),
            toml::Value::String(s) => {
                out.insert(key, s.clone());
            }
            other => {
                out.insert(key, other.to_string());
            }
        }
    }
}
