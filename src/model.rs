//! Records that describe an analysis job and everything it produces.
//!
//! These structs are what the store reads and writes and what the API
//! serializes for polling clients, so field names follow the camelCase
//! contract the web client expects.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub type JobId = i64;

/// Lifecycle of a job.
///
/// `Completed` and `Failed` are terminal. The only legal moves are listed in
/// [`JobStatus::can_transition_to`]; the store refuses everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Transition table. A pending job may fail without ever being picked up
    /// (timeout while queued, restart recovery).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Where the video for a job comes from. Exactly one variant exists, so a job
/// can never carry both an upload and a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobSource {
    Local { path: PathBuf },
    Remote { url: Url },
}

impl JobSource {
    pub fn kind(&self) -> &'static str {
        match self {
            JobSource::Local { .. } => "local",
            JobSource::Remote { .. } => "remote",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub owner_id: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    pub source: JobSource,
    /// Local media the pipeline reads. Set at creation for uploads and after
    /// the download step for remote jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_path: Option<PathBuf>,
    pub status: JobStatus,
    pub duration: Option<i64>,
    pub resolution: Option<String>,
    pub format: Option<String>,
    pub key_frames_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub processing_started: Option<DateTime<Utc>>,
    pub processing_completed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to insert a job row in `pending` state.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: String,
    pub file_name: String,
    pub file_size: Option<i64>,
    pub source: JobSource,
}

impl NewJob {
    /// Local uploads already have their media on disk.
    pub fn media_path(&self) -> Option<&PathBuf> {
        match &self.source {
            JobSource::Local { path } => Some(path),
            JobSource::Remote { .. } => None,
        }
    }
}

/// Attributes derived by the probe step.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbedAttributes {
    pub duration: i64,
    pub resolution: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFrame {
    pub id: i64,
    pub analysis_id: JobId,
    pub timestamp: i64,
    pub image_path: PathBuf,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A key frame produced by the orchestrator that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewKeyFrame {
    pub timestamp: i64,
    pub image_path: PathBuf,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEntry {
    pub id: i64,
    pub analysis_id: JobId,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub id: i64,
    pub analysis_id: JobId,
    pub transcription_text: String,
    pub duration: f64,
    pub language: Option<String>,
    /// Integer percentage, 0 when transcription failed.
    pub confidence: i64,
    pub audio_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTranscript {
    pub text: String,
    pub duration: f64,
    pub language: Option<String>,
    pub confidence: i64,
    pub audio_path: Option<PathBuf>,
}

impl NewTranscript {
    /// Placeholder stored when audio extraction or transcription fails so
    /// the report shows that an attempt was made.
    pub fn failed(message: &str) -> Self {
        Self {
            text: format!("Audio transcription failed: {message}"),
            duration: 0.0,
            language: None,
            confidence: 0,
            audio_path: None,
        }
    }
}

/// Payload for the detail endpoint that clients poll.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    pub analysis: Job,
    pub key_frames: Vec<KeyFrame>,
    pub metadata: Vec<MetadataEntry>,
    pub transcript: Option<Transcript>,
}

impl JobDetail {
    pub fn metadata_map(&self) -> BTreeMap<&str, &str> {
        self.metadata
            .iter()
            .map(|entry| (entry.key.as_str(), entry.value.as_str()))
            .collect()
    }
}
