//! ffprobe / ffmpeg backed probe, frame and audio adapters.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{AdapterResult, AudioExtractor, FrameExtractor, MetadataProbe, ProbeReport, run_tool};
use crate::error::AdapterError;

const FFPROBE: &str = "ffprobe";
const FFMPEG: &str = "ffmpeg";

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

pub struct FfprobeProbe {
    program: String,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl MetadataProbe for FfprobeProbe {
    async fn probe(&self, media: &Path) -> AdapterResult<ProbeReport> {
        let mut command = Command::new(&self.program);
        command
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(media);
        let output = run_tool(FFPROBE, &mut command).await?;
        parse_probe_output(&output.stdout)
    }
}

fn parse_error(message: impl Into<String>) -> AdapterError {
    AdapterError::Parse {
        tool: FFPROBE.to_string(),
        message: message.into(),
    }
}

/// Turns `ffprobe -print_format json` output into a [`ProbeReport`] using the
/// first video stream.
pub(crate) fn parse_probe_output(raw: &[u8]) -> AdapterResult<ProbeReport> {
    let parsed: FfprobeOutput =
        serde_json::from_slice(raw).map_err(|err| parse_error(err.to_string()))?;

    let stream = parsed
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"))
        .ok_or(AdapterError::NoVideoStream)?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(width), Some(height)) => (width, height),
        _ => return Err(parse_error("video stream has no dimensions")),
    };

    let rate = stream
        .r_frame_rate
        .as_deref()
        .ok_or_else(|| parse_error("video stream has no frame rate"))?;
    let (numerator, denominator) = parse_frame_rate(rate)?;

    // Container duration is authoritative; some muxers only report it per stream.
    let duration_raw = parsed
        .format
        .as_ref()
        .and_then(|format| format.duration.as_deref())
        .or(stream.duration.as_deref())
        .ok_or_else(|| parse_error("no duration reported"))?;
    let duration_seconds: f64 = duration_raw
        .parse()
        .map_err(|_| parse_error(format!("invalid duration '{duration_raw}'")))?;
    if !duration_seconds.is_finite() || duration_seconds < 0.0 {
        return Err(parse_error(format!("invalid duration '{duration_raw}'")));
    }

    Ok(ProbeReport {
        duration_seconds,
        width,
        height,
        frame_rate_numerator: numerator,
        frame_rate_denominator: denominator,
    })
}

/// Parses `num/den` (e.g. `30000/1001`). A zero denominator is rejected.
fn parse_frame_rate(raw: &str) -> AdapterResult<(u32, u32)> {
    let (num, den) = raw
        .split_once('/')
        .ok_or_else(|| parse_error(format!("invalid frame rate '{raw}'")))?;
    let numerator: u32 = num
        .trim()
        .parse()
        .map_err(|_| parse_error(format!("invalid frame rate '{raw}'")))?;
    let denominator: u32 = den
        .trim()
        .parse()
        .map_err(|_| parse_error(format!("invalid frame rate '{raw}'")))?;
    if denominator == 0 {
        return Err(parse_error(format!("frame rate '{raw}' has a zero denominator")));
    }
    Ok((numerator, denominator))
}

pub struct FfmpegFrameExtractor {
    program: String,
}

impl FfmpegFrameExtractor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn extract_frame(&self, media: &Path, offset_seconds: i64) -> AdapterResult<Vec<u8>> {
        let mut command = Command::new(&self.program);
        command
            .args(["-hide_banner", "-loglevel", "error", "-ss"])
            .arg(offset_seconds.to_string())
            .arg("-i")
            .arg(media)
            .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "mjpeg", "pipe:1"]);
        let output = run_tool(FFMPEG, &mut command).await?;
        if output.stdout.is_empty() {
            return Err(AdapterError::EmptyOutput {
                tool: FFMPEG.to_string(),
            });
        }
        Ok(output.stdout)
    }
}

pub struct FfmpegAudioExtractor {
    program: String,
}

impl FfmpegAudioExtractor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl AudioExtractor for FfmpegAudioExtractor {
    async fn extract_audio(&self, media: &Path) -> AdapterResult<Vec<u8>> {
        let mut command = Command::new(&self.program);
        command
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(media)
            .args([
                "-vn", "-acodec", "pcm_s16le", "-ar", "16000", "-ac", "1", "-f", "s16le", "pipe:1",
            ]);
        match run_tool(FFMPEG, &mut command).await {
            Ok(output) => Ok(output.stdout),
            // ffmpeg exits non-zero when asked to map an audio track that is not there.
            Err(AdapterError::ExitStatus { stderr, .. }) if reports_missing_stream(&stderr) => {
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}

fn reports_missing_stream(stderr: &str) -> bool {
    stderr.contains("does not contain any stream")
        || stderr.contains("Output file is empty")
        || stderr.contains("matches no streams")
}
