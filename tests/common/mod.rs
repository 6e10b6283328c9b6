//! Shared fixtures for the integration tests: in-process fake adapters and a
//! harness that wires them to an in-memory store and a live dispatcher.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use url::Url;

use videolens::adapters::{
    AdapterResult, Adapters, AudioExtractor, FrameExtractor, MetadataProbe, ProbeReport,
    RemoteFetcher, Transcriber, TranscriptionResult,
};
use videolens::dispatch::{DispatchConfig, Dispatcher};
use videolens::error::{AdapterError, StoreError};
use videolens::ingest::UploadRequest;
use videolens::model::{
    Job, JobId, KeyFrame, MetadataEntry, NewJob, NewKeyFrame, NewTranscript, ProbedAttributes,
    Transcript,
};
use videolens::pipeline::Orchestrator;
use videolens::service::VideoLens;
use videolens::storage::StorageLayout;
use videolens::store::{JobRepository, SqliteJobStore, StoreResult};

pub const FRAME_CONCURRENCY: usize = 3;
pub const JPEG_BYTES: &[u8] = b"\xFF\xD8\xFF\xE0fake-jpeg";

pub fn probe_report(duration_seconds: f64) -> ProbeReport {
    ProbeReport {
        duration_seconds,
        width: 1920,
        height: 1080,
        frame_rate_numerator: 30,
        frame_rate_denominator: 1,
    }
}

pub struct FakeProbe {
    result: Result<ProbeReport, String>,
    delay: Duration,
}

impl FakeProbe {
    pub fn returning(report: ProbeReport) -> Self {
        Self {
            result: Ok(report),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            result: Ok(probe_report(10.0)),
            delay,
        }
    }
}

#[async_trait]
impl MetadataProbe for FakeProbe {
    async fn probe(&self, _media: &Path) -> AdapterResult<ProbeReport> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.result {
            Ok(report) => Ok(report.clone()),
            Err(message) if message == "no video" => Err(AdapterError::NoVideoStream),
            Err(message) => Err(AdapterError::Parse {
                tool: "ffprobe".into(),
                message: message.clone(),
            }),
        }
    }
}

/// Returns a fixed image and tracks how many extractions run at once.
#[derive(Default)]
pub struct FakeFrames {
    pub fail_at: HashSet<i64>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeFrames {
    pub fn failing_at(timestamps: &[i64]) -> Self {
        Self {
            fail_at: timestamps.iter().copied().collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl FrameExtractor for FakeFrames {
    async fn extract_frame(&self, _media: &Path, offset_seconds: i64) -> AdapterResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_at.contains(&offset_seconds) {
            return Err(AdapterError::EmptyOutput {
                tool: "ffmpeg".into(),
            });
        }
        Ok(JPEG_BYTES.to_vec())
    }
}

pub struct FakeAudio {
    result: Result<Vec<u8>, String>,
}

impl FakeAudio {
    pub fn with_pcm(len: usize) -> Self {
        Self {
            result: Ok(vec![0u8; len]),
        }
    }

    pub fn silent() -> Self {
        Self::with_pcm(0)
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
        }
    }
}

#[async_trait]
impl AudioExtractor for FakeAudio {
    async fn extract_audio(&self, _media: &Path) -> AdapterResult<Vec<u8>> {
        self.result.clone().map_err(|message| AdapterError::Parse {
            tool: "ffmpeg".into(),
            message,
        })
    }
}

pub struct FakeTranscriber {
    result: Result<TranscriptionResult, String>,
}

impl FakeTranscriber {
    pub fn saying(text: &str) -> Self {
        Self {
            result: Ok(TranscriptionResult {
                text: text.to_string(),
                duration_seconds: 12.5,
                language: Some("english".into()),
                confidence: None,
            }),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
        }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _pcm: Vec<u8>) -> AdapterResult<TranscriptionResult> {
        self.result.clone().map_err(AdapterError::Http)
    }
}

/// Writes a small file where yt-dlp would have put the download.
pub struct FakeFetcher {
    failure: Option<String>,
}

impl FakeFetcher {
    pub fn working() -> Self {
        Self { failure: None }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl RemoteFetcher for FakeFetcher {
    async fn fetch(&self, _url: &Url, dest_dir: &Path, file_stem: &str) -> AdapterResult<PathBuf> {
        if let Some(message) = &self.failure {
            return Err(AdapterError::Parse {
                tool: "yt-dlp".into(),
                message: message.clone(),
            });
        }
        let path = dest_dir.join(format!("{file_stem}.mp4"));
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| AdapterError::Io {
                path: dest_dir.to_path_buf(),
                source,
            })?;
        tokio::fs::write(&path, b"remote video")
            .await
            .map_err(|source| AdapterError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

/// Adapters for a 125 second clip with audio where every step succeeds.
pub fn working_adapters() -> Adapters {
    Adapters {
        probe: Arc::new(FakeProbe::returning(probe_report(125.4))),
        frames: Arc::new(FakeFrames::default()),
        audio: Arc::new(FakeAudio::with_pcm(32_000)),
        transcriber: Arc::new(FakeTranscriber::saying("hello from the clip")),
        fetcher: Arc::new(FakeFetcher::working()),
    }
}

/// In-memory store whose transcript writes always fail.
pub struct TranscriptRejectingStore {
    inner: SqliteJobStore,
}

impl TranscriptRejectingStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteJobStore::open_in_memory().expect("in-memory store"),
        }
    }
}

#[async_trait]
impl JobRepository for TranscriptRejectingStore {
    async fn create_job(&self, job: NewJob) -> StoreResult<Job> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self, owner_id: &str) -> StoreResult<Vec<Job>> {
        self.inner.list_jobs(owner_id).await
    }

    async fn start_processing(&self, id: JobId) -> StoreResult<Job> {
        self.inner.start_processing(id).await
    }

    async fn set_media_path(&self, id: JobId, path: &Path) -> StoreResult<()> {
        self.inner.set_media_path(id, path).await
    }

    async fn record_probe(&self, id: JobId, attributes: &ProbedAttributes) -> StoreResult<()> {
        self.inner.record_probe(id, attributes).await
    }

    async fn insert_key_frames(&self, id: JobId, frames: Vec<NewKeyFrame>) -> StoreResult<usize> {
        self.inner.insert_key_frames(id, frames).await
    }

    async fn insert_metadata(&self, id: JobId, entries: Vec<(String, String)>) -> StoreResult<()> {
        self.inner.insert_metadata(id, entries).await
    }

    async fn insert_transcript(&self, _id: JobId, _transcript: NewTranscript) -> StoreResult<()> {
        Err(StoreError::CorruptRow {
            table: "transcripts",
            message: "disk full".into(),
        })
    }

    async fn complete_job(&self, id: JobId) -> StoreResult<Job> {
        self.inner.complete_job(id).await
    }

    async fn fail_job(&self, id: JobId, message: &str) -> StoreResult<bool> {
        self.inner.fail_job(id, message).await
    }

    async fn set_report_path(&self, id: JobId, path: &Path) -> StoreResult<()> {
        self.inner.set_report_path(id, path).await
    }

    async fn key_frames(&self, id: JobId) -> StoreResult<Vec<KeyFrame>> {
        self.inner.key_frames(id).await
    }

    async fn metadata(&self, id: JobId) -> StoreResult<Vec<MetadataEntry>> {
        self.inner.metadata(id).await
    }

    async fn transcript(&self, id: JobId) -> StoreResult<Option<Transcript>> {
        self.inner.transcript(id).await
    }

    async fn delete_job(&self, id: JobId) -> StoreResult<bool> {
        self.inner.delete_job(id).await
    }

    async fn media_references(&self, path: &Path) -> StoreResult<i64> {
        self.inner.media_references(path).await
    }

    async fn recover_interrupted(&self) -> StoreResult<Vec<JobId>> {
        self.inner.recover_interrupted().await
    }
}

pub struct Harness {
    _temp: TempDir,
    pub layout: StorageLayout,
    pub store: Arc<dyn JobRepository>,
    pub dispatcher: Arc<Dispatcher>,
    pub service: Arc<VideoLens>,
}

impl Harness {
    pub fn new(adapters: Adapters) -> Self {
        Self::with_timeout(adapters, Duration::from_secs(30))
    }

    pub fn with_timeout(adapters: Adapters, job_timeout: Duration) -> Self {
        let store = Arc::new(SqliteJobStore::open_in_memory().expect("in-memory store"));
        Self::build(adapters, store, job_timeout)
    }

    pub fn with_store(adapters: Adapters, store: Arc<dyn JobRepository>) -> Self {
        Self::build(adapters, store, Duration::from_secs(30))
    }

    /// Must be called from within a tokio runtime; workers start immediately.
    fn build(adapters: Adapters, store: Arc<dyn JobRepository>, job_timeout: Duration) -> Self {
        let temp = TempDir::new().expect("temp dir");
        let layout = StorageLayout::new(temp.path());
        layout.prepare().expect("prepare layout");
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            adapters,
            layout.clone(),
            FRAME_CONCURRENCY,
        ));
        let dispatcher = Arc::new(Dispatcher::start(
            orchestrator,
            DispatchConfig {
                worker_count: 2,
                queue_capacity: 8,
                job_timeout,
            },
        ));
        let service = Arc::new(VideoLens::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            layout.clone(),
        ));
        Self {
            _temp: temp,
            layout,
            store,
            dispatcher,
            service,
        }
    }

    pub async fn upload(&self, owner: &str, name: &str, bytes: &[u8]) -> videolens::Result<Job> {
        let mut sink = self
            .service
            .begin_upload(
                owner,
                UploadRequest {
                    original_name: name.to_string(),
                    content_type: Some("video/mp4".into()),
                    declared_size: Some(bytes.len() as u64),
                },
            )
            .await?;
        for chunk in bytes.chunks(7) {
            sink.write_chunk(chunk).await?;
        }
        self.service.finish_upload(sink).await
    }

    /// Polls until the job reaches a terminal state.
    pub async fn wait_for_terminal(&self, id: JobId) -> Job {
        for _ in 0..500 {
            let job = self
                .store
                .get_job(id)
                .await
                .expect("store read")
                .expect("job exists");
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {id} did not finish in time");
    }
}
