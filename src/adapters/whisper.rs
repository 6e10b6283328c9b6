//! Client for an OpenAI Whisper compatible `/audio/transcriptions` endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{AdapterResult, Transcriber, TranscriptionResult};
use crate::config::TranscriptionConfig;
use crate::error::AdapterError;

pub const SAMPLE_RATE: u32 = 16_000;
const CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;
const BOUNDARY: &str = "videolens-audio-boundary";

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    text: String,
    language: Option<String>,
    duration: Option<f64>,
}

pub struct WhisperTranscriber {
    config: TranscriptionConfig,
}

impl WhisperTranscriber {
    pub fn new(config: TranscriptionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, pcm: Vec<u8>) -> AdapterResult<TranscriptionResult> {
        let api_key = self
            .config
            .api_key
            .clone()
            .ok_or(AdapterError::NotConfigured)?;
        let url = self.config.url.clone();
        let body = multipart_body(&self.config.model, &wav_from_pcm(&pcm));
        let fallback_duration = pcm_duration_seconds(pcm.len());
        debug!(%url, bytes = body.len(), "submitting audio for transcription");

        // ureq is blocking, so the request runs on the blocking pool.
        let parsed = tokio::task::spawn_blocking(move || -> AdapterResult<VerboseTranscription> {
            let response = ureq::post(&url)
                .set("Authorization", &format!("Bearer {api_key}"))
                .set(
                    "Content-Type",
                    &format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .send_bytes(&body)
                .map_err(describe_http_error)?;
            response
                .into_json::<VerboseTranscription>()
                .map_err(|err| AdapterError::Http(format!("invalid response body: {err}")))
        })
        .await
        .map_err(|err| AdapterError::Http(format!("transcription task failed: {err}")))??;

        Ok(TranscriptionResult {
            text: parsed.text.trim().to_string(),
            duration_seconds: parsed.duration.unwrap_or(fallback_duration),
            language: parsed.language.filter(|language| !language.is_empty()),
            // Whisper does not report a confidence score.
            confidence: None,
        })
    }
}

fn describe_http_error(err: ureq::Error) -> AdapterError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            AdapterError::Http(format!("status {code}: {}", body.trim()))
        }
        ureq::Error::Transport(transport) => AdapterError::Http(transport.to_string()),
    }
}

pub fn pcm_duration_seconds(len: usize) -> f64 {
    let bytes_per_second = SAMPLE_RATE as usize * usize::from(CHANNELS) * 2;
    len as f64 / bytes_per_second as f64
}

/// Wraps raw mono s16le PCM in a RIFF/WAVE header.
pub fn wav_from_pcm(pcm: &[u8]) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let byte_rate = SAMPLE_RATE * u32::from(block_align);

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&CHANNELS.to_le_bytes());
    wav.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

fn multipart_body(model: &str, wav: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(wav.len() + 512);
    for (name, value) in [("model", model), ("response_format", "verbose_json")] {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"audio.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(wav);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}
