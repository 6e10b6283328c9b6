//! Contracts for the external tools the pipeline depends on.
//!
//! The orchestrator only sees these traits. The concrete implementations
//! shell out to ffprobe/ffmpeg/yt-dlp or call a Whisper-compatible HTTP
//! endpoint; tests substitute in-process fakes.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use url::Url;

use crate::error::AdapterError;

pub mod ffmpeg;
pub mod whisper;
pub mod ytdlp;

pub use ffmpeg::{FfmpegAudioExtractor, FfmpegFrameExtractor, FfprobeProbe};
pub use whisper::WhisperTranscriber;
pub use ytdlp::YtDlpFetcher;

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Raw stream facts reported by the probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub frame_rate_numerator: u32,
    pub frame_rate_denominator: u32,
}

impl ProbeReport {
    pub fn frame_rate(&self) -> f64 {
        f64::from(self.frame_rate_numerator) / f64::from(self.frame_rate_denominator)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionResult {
    pub text: String,
    pub duration_seconds: f64,
    pub language: Option<String>,
    /// 0.0 - 1.0 when the service reports one.
    pub confidence: Option<f64>,
}

#[async_trait]
pub trait MetadataProbe: Send + Sync {
    async fn probe(&self, media: &Path) -> AdapterResult<ProbeReport>;
}

#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// Returns one encoded still image taken `offset_seconds` into the media.
    async fn extract_frame(&self, media: &Path, offset_seconds: i64) -> AdapterResult<Vec<u8>>;
}

#[async_trait]
pub trait AudioExtractor: Send + Sync {
    /// Returns mono 16 kHz signed 16-bit little-endian PCM. An empty buffer
    /// means the media has no audio.
    async fn extract_audio(&self, media: &Path) -> AdapterResult<Vec<u8>>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, pcm: Vec<u8>) -> AdapterResult<TranscriptionResult>;
}

#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Downloads `url` into `dest_dir` using `file_stem` as the base name and
    /// returns the path of the resulting media file.
    async fn fetch(&self, url: &Url, dest_dir: &Path, file_stem: &str) -> AdapterResult<PathBuf>;
}

/// The full set of adapters handed to the orchestrator.
#[derive(Clone)]
pub struct Adapters {
    pub probe: Arc<dyn MetadataProbe>,
    pub frames: Arc<dyn FrameExtractor>,
    pub audio: Arc<dyn AudioExtractor>,
    pub transcriber: Arc<dyn Transcriber>,
    pub fetcher: Arc<dyn RemoteFetcher>,
}

impl Adapters {
    /// Wires the real tool-backed implementations.
    pub fn from_config(
        tools: &crate::config::ToolPaths,
        transcription: &crate::config::TranscriptionConfig,
    ) -> Self {
        Self {
            probe: Arc::new(FfprobeProbe::new(&tools.ffprobe)),
            frames: Arc::new(FfmpegFrameExtractor::new(&tools.ffmpeg)),
            audio: Arc::new(FfmpegAudioExtractor::new(&tools.ffmpeg)),
            transcriber: Arc::new(WhisperTranscriber::new(transcription.clone())),
            fetcher: Arc::new(YtDlpFetcher::new(&tools.ytdlp)),
        }
    }
}

/// Runs an external tool to completion and returns its output when it exits
/// successfully. The child is killed if the future is dropped, which is how
/// job timeouts stop runaway processes.
pub(crate) async fn run_tool(tool: &str, command: &mut Command) -> AdapterResult<Output> {
    debug!(tool, command = ?command.as_std(), "running external tool");
    let output = command
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| AdapterError::Spawn {
            tool: tool.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(AdapterError::ExitStatus {
            tool: tool.to_string(),
            status: output.status,
            stderr: stderr_tail(&output.stderr),
        });
    }
    Ok(output)
}

/// Keeps the last few lines of stderr; ffmpeg prints its actual complaint at
/// the end after pages of banner output.
pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}
