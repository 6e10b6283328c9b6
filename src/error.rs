//! Error types shared across the crate.
//!
//! Each layer owns its own enum: the store reports persistence problems, the
//! adapters report external tool failures, and [`Error`] is what the service
//! surface (ingestion, queries, reports) hands back to callers.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::model::{JobId, JobStatus};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Job {0} does not exist")]
    MissingJob(JobId),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Corrupt row in {table}: {message}")]
    CorruptRow {
        table: &'static str,
        message: String,
    },

    #[error("Failed to create database directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    ExitStatus {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("Could not parse {tool} output: {message}")]
    Parse { tool: String, message: String },

    #[error("No video stream found")]
    NoVideoStream,

    #[error("{tool} produced no output")]
    EmptyOutput { tool: String },

    #[error("Transcription request failed: {0}")]
    Http(String),

    #[error("Transcription service is not configured")]
    NotConfigured,

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("Analysis not found")]
    NotFound,

    #[error("Access denied")]
    Forbidden,

    #[error("Analysis not completed")]
    NotCompleted,

    #[error("Job queue is shut down")]
    QueueClosed,

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
