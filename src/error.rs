//! Error types for attempt-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work descriptor not found: {store}/{file}")]
    DescriptorNotFound { store: String, file: String },

    #[error("work descriptor {store}/{file} holds no entries")]
    EmptyDescriptor { store: String, file: String },

    #[error("failed to load {path}")]
    DescriptorLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}")]
    BlobWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::model::AttemptState,
        to: crate::model::AttemptState,
    },

    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("attempt interrupted")]
    Interrupted,

    #[error("interrupted while shutting down tasks of job {job_id}")]
    ShutdownInterrupted { job_id: String },

    #[error("{} task(s) failed: {}", .0.len(), .0.join(", "))]
    TasksFailed(Vec<String>),

    #[error("resource broker already closed")]
    BrokerClosed,

    #[error("could not close shared resources: {0}")]
    Teardown(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the errors that mean "stop, someone asked us to".
    pub fn is_interruption(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
