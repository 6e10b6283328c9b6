//! The processing orchestrator: drives one job from `pending` through
//! `processing` to a terminal state.
//!
//! Steps run sequentially except key-frame extraction, which fans out over a
//! bounded [`JoinSet`] and is joined before the job moves on. Any fatal error
//! is recorded on the job as `failed`; audio transcription problems and
//! individual frame failures are tolerated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterResult, Adapters, ProbeReport};
use crate::error::{AdapterError, StoreError};
use crate::model::{Job, JobId, JobSource, NewKeyFrame, NewTranscript, ProbedAttributes};
use crate::storage::StorageLayout;
use crate::store::JobRepository;

/// Upper bound on key frames sampled per video.
pub const TARGET_FRAME_COUNT: i64 = 20;
/// Used when the service does not report a confidence score.
pub const DEFAULT_TRANSCRIPT_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    /// The job was deleted or already left `pending` before this run.
    Skipped,
}

#[derive(Error, Debug)]
enum StepError {
    #[error("Failed to download video: {0}")]
    Fetch(#[source] AdapterError),

    #[error("Failed to read video metadata: {0}")]
    Probe(#[source] AdapterError),

    #[error("Failed to create '{path}': {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Attributes derived from a probe report.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFacts {
    pub duration: i64,
    pub resolution: String,
    pub format: String,
    pub frame_rate: f64,
    pub total_frames: i64,
}

impl VideoFacts {
    pub fn from_probe(report: &ProbeReport, media: &Path) -> Self {
        let duration = report.duration_seconds.trunc() as i64;
        let frame_rate = report.frame_rate();
        Self {
            duration,
            resolution: format!("{}x{}", report.width, report.height),
            format: container_format(media),
            frame_rate,
            total_frames: (duration as f64 * frame_rate).floor() as i64,
        }
    }

    fn attributes(&self) -> ProbedAttributes {
        ProbedAttributes {
            duration: self.duration,
            resolution: self.resolution.clone(),
            format: self.format.clone(),
        }
    }
}

/// Lowercase file extension without the dot.
fn container_format(media: &Path) -> String {
    media
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn sampling_interval(duration: i64) -> i64 {
    (duration / TARGET_FRAME_COUNT).max(1)
}

/// `0, interval, 2*interval, ...` strictly below `duration`.
pub fn sample_timestamps(duration: i64) -> Vec<i64> {
    if duration <= 0 {
        return Vec::new();
    }
    let interval = sampling_interval(duration);
    (0..duration).step_by(interval as usize).collect()
}

/// `m:ss`, minutes unbounded.
pub fn format_time(seconds: i64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

pub struct Orchestrator {
    store: Arc<dyn JobRepository>,
    adapters: Adapters,
    layout: StorageLayout,
    frame_concurrency: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobRepository>,
        adapters: Adapters,
        layout: StorageLayout,
        frame_concurrency: usize,
    ) -> Self {
        Self {
            store,
            adapters,
            layout,
            frame_concurrency: frame_concurrency.max(1),
        }
    }

    /// Runs the whole pipeline for `id`. Never returns an error: every failure
    /// ends up recorded on the job itself.
    pub async fn run(&self, id: JobId) -> JobOutcome {
        let job = match self.store.start_processing(id).await {
            Ok(job) => job,
            Err(StoreError::MissingJob(_)) => {
                debug!(job_id = id, "job vanished before processing");
                return JobOutcome::Skipped;
            }
            Err(StoreError::InvalidTransition { from, .. }) => {
                debug!(job_id = id, %from, "job is no longer pending");
                return JobOutcome::Skipped;
            }
            Err(err) => {
                let message = err.to_string();
                error!(job_id = id, "could not start processing: {message}");
                self.record_failure(id, &message).await;
                return JobOutcome::Failed(message);
            }
        };
        info!(job_id = id, source = job.source.kind(), "processing started");

        match self.process(&job).await {
            Ok(completed) => {
                info!(
                    job_id = id,
                    key_frames = completed.key_frames_count.unwrap_or_default(),
                    "processing completed"
                );
                JobOutcome::Completed
            }
            Err(err) => {
                let message = err.to_string();
                error!(job_id = id, "processing failed: {message}");
                self.record_failure(id, &message).await;
                JobOutcome::Failed(message)
            }
        }
    }

    /// Marks `id` failed. Returns quietly when the job is already terminal or
    /// gone.
    pub async fn record_failure(&self, id: JobId, message: &str) {
        match self.store.fail_job(id, message).await {
            Ok(true) => {}
            Ok(false) => debug!(job_id = id, "job already terminal, failure not recorded"),
            Err(StoreError::MissingJob(_)) => debug!(job_id = id, "job deleted during processing"),
            Err(err) => error!(job_id = id, "could not record failure: {err}"),
        }
    }

    async fn process(&self, job: &Job) -> Result<Job, StepError> {
        let media = self.resolve_media(job).await?;

        let report = self
            .adapters
            .probe
            .probe(&media)
            .await
            .map_err(StepError::Probe)?;
        let facts = VideoFacts::from_probe(&report, &media);
        self.store.record_probe(job.id, &facts.attributes()).await?;
        debug!(
            job_id = job.id,
            duration = facts.duration,
            resolution = %facts.resolution,
            "probed media"
        );

        let artifacts = self.layout.job_artifacts_dir(job.id);
        tokio::fs::create_dir_all(&artifacts)
            .await
            .map_err(|source| StepError::Workspace {
                path: artifacts.clone(),
                source,
            })?;

        let frames = self.extract_key_frames(job.id, &media, facts.duration).await;
        self.store.insert_key_frames(job.id, frames).await?;

        self.transcribe(job.id, &media).await;

        self.store
            .insert_metadata(
                job.id,
                vec![
                    ("total_frames".to_string(), facts.total_frames.to_string()),
                    ("frame_rate".to_string(), facts.frame_rate.to_string()),
                ],
            )
            .await?;

        Ok(self.store.complete_job(job.id).await?)
    }

    /// Local path of the media, downloading it first for remote jobs.
    async fn resolve_media(&self, job: &Job) -> Result<PathBuf, StepError> {
        match &job.source {
            JobSource::Local { path } => Ok(job.media_path.clone().unwrap_or_else(|| path.clone())),
            JobSource::Remote { url } => {
                if let Some(existing) = &job.media_path {
                    return Ok(existing.clone());
                }
                let dest = self.layout.job_download_dir(job.id);
                let stem = format!("video_{}", job.id);
                info!(job_id = job.id, %url, "downloading remote video");
                let path = self
                    .adapters
                    .fetcher
                    .fetch(url, &dest, &stem)
                    .await
                    .map_err(StepError::Fetch)?;
                self.store.set_media_path(job.id, &path).await?;
                Ok(path)
            }
        }
    }

    /// Extracts one still per sampled timestamp. Failed timestamps are
    /// dropped; the result is sorted by timestamp.
    async fn extract_key_frames(&self, id: JobId, media: &Path, duration: i64) -> Vec<NewKeyFrame> {
        let timestamps = sample_timestamps(duration);
        let attempts = timestamps.len();
        let permits = Arc::new(Semaphore::new(self.frame_concurrency));
        let mut tasks = JoinSet::new();

        for timestamp in timestamps {
            let permits = Arc::clone(&permits);
            let extractor = Arc::clone(&self.adapters.frames);
            let media = media.to_path_buf();
            let target = self.layout.frame_path(id, timestamp);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                match extract_one(extractor.as_ref(), &media, timestamp, &target).await {
                    Ok(()) => Some(NewKeyFrame {
                        timestamp,
                        image_path: target,
                        description: format!("Key frame at {}", format_time(timestamp)),
                    }),
                    Err(err) => {
                        warn!(job_id = id, timestamp, "dropping key frame: {err}");
                        None
                    }
                }
            });
        }

        let mut frames = Vec::with_capacity(attempts);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {}
                Err(err) => warn!(job_id = id, "frame task failed: {err}"),
            }
        }
        frames.sort_by_key(|frame| frame.timestamp);
        debug!(job_id = id, attempts, extracted = frames.len(), "key frames extracted");
        frames
    }

    /// Audio extraction plus transcription. Never fails the job: tool errors
    /// become a placeholder transcript and store errors are only logged.
    async fn transcribe(&self, id: JobId, media: &Path) {
        let pcm = match self.adapters.audio.extract_audio(media).await {
            Ok(pcm) => pcm,
            Err(err) => {
                warn!(job_id = id, "audio extraction failed: {err}");
                self.store_placeholder(id, &err.to_string()).await;
                return;
            }
        };
        if pcm.is_empty() {
            info!(job_id = id, "no audio track, skipping transcription");
            return;
        }

        let audio_path = self.layout.audio_path(id);
        let audio_path =
            match tokio::fs::write(&audio_path, crate::adapters::whisper::wav_from_pcm(&pcm)).await {
                Ok(()) => Some(audio_path),
                Err(err) => {
                    warn!(job_id = id, path = %audio_path.display(), "could not keep audio: {err}");
                    None
                }
            };

        let result = match self.adapters.transcriber.transcribe(pcm).await {
            Ok(result) => result,
            Err(err) => {
                warn!(job_id = id, "transcription failed: {err}");
                self.store_placeholder(id, &err.to_string()).await;
                return;
            }
        };
        let transcript = NewTranscript {
            text: result.text,
            duration: result.duration_seconds,
            language: result.language,
            confidence: confidence_percent(result.confidence),
            audio_path,
        };
        if let Err(err) = self.store.insert_transcript(id, transcript).await {
            warn!(job_id = id, "could not store transcript: {err}");
            self.store_placeholder(id, &err.to_string()).await;
        }
    }

    async fn store_placeholder(&self, id: JobId, message: &str) {
        if let Err(err) = self
            .store
            .insert_transcript(id, NewTranscript::failed(message))
            .await
        {
            warn!(job_id = id, "could not store failed transcription: {err}");
        }
    }
}

async fn extract_one(
    extractor: &dyn crate::adapters::FrameExtractor,
    media: &Path,
    timestamp: i64,
    target: &Path,
) -> AdapterResult<()> {
    let image = extractor.extract_frame(media, timestamp).await?;
    tokio::fs::write(target, image)
        .await
        .map_err(|source| AdapterError::Io {
            path: target.to_path_buf(),
            source,
        })
}

fn confidence_percent(confidence: Option<f64>) -> i64 {
    let value = confidence.unwrap_or(DEFAULT_TRANSCRIPT_CONFIDENCE).clamp(0.0, 1.0);
    (value * 100.0).round() as i64
}
