use anyhow::{Context, Result, anyhow, bail};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/videolens-env";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_WORKER_COUNT: usize = 2;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_FRAME_CONCURRENCY: usize = 4;
pub const DEFAULT_TRANSCRIPTION_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Raw values read from the env file. Everything is optional here; defaults
/// and required keys are resolved by [`load_runtime_config_from`].
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub data_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub worker_count: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub job_timeout_secs: Option<u64>,
    pub frame_concurrency: Option<usize>,
    pub ffmpeg_bin: Option<String>,
    pub ffprobe_bin: Option<String>,
    pub ytdlp_bin: Option<String>,
    pub transcription_url: Option<String>,
    pub transcription_model: Option<String>,
    pub transcription_api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub ytdlp: String,
}

#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub job_timeout: Duration,
    pub frame_concurrency: usize,
    pub tools: ToolPaths,
    pub transcription: TranscriptionConfig,
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str, path: &Path) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Parsing {key} from {}", path.display()))
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            match key.trim() {
                "DATA_ROOT" => cfg.data_root = non_empty(value).map(PathBuf::from),
                "VIDEOLENS_HOST" => cfg.host = non_empty(value),
                "VIDEOLENS_PORT" => cfg.port = Some(parse_number(key, value, path)?),
                "WORKER_COUNT" => cfg.worker_count = Some(parse_number(key, value, path)?),
                "QUEUE_CAPACITY" => cfg.queue_capacity = Some(parse_number(key, value, path)?),
                "JOB_TIMEOUT_SECS" => cfg.job_timeout_secs = Some(parse_number(key, value, path)?),
                "FRAME_CONCURRENCY" => {
                    cfg.frame_concurrency = Some(parse_number(key, value, path)?)
                }
                "FFMPEG_BIN" => cfg.ffmpeg_bin = non_empty(value),
                "FFPROBE_BIN" => cfg.ffprobe_bin = non_empty(value),
                "YTDLP_BIN" => cfg.ytdlp_bin = non_empty(value),
                "TRANSCRIPTION_URL" => cfg.transcription_url = non_empty(value),
                "TRANSCRIPTION_MODEL" => cfg.transcription_model = non_empty(value),
                "TRANSCRIPTION_API_KEY" => cfg.transcription_api_key = non_empty(value),
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let cfg = read_env_config(path)?
        .ok_or_else(|| anyhow!("Missing config file at {}", path.display()))?;
    resolve(cfg, path)
}

fn resolve(cfg: EnvConfig, path: &Path) -> Result<RuntimeConfig> {
    let data_root = cfg
        .data_root
        .ok_or_else(|| anyhow!("DATA_ROOT not set in {}", path.display()))?;

    let worker_count = cfg.worker_count.unwrap_or(DEFAULT_WORKER_COUNT);
    let queue_capacity = cfg.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
    let frame_concurrency = cfg.frame_concurrency.unwrap_or(DEFAULT_FRAME_CONCURRENCY);
    let job_timeout_secs = cfg.job_timeout_secs.unwrap_or(DEFAULT_JOB_TIMEOUT_SECS);
    for (key, value) in [
        ("WORKER_COUNT", worker_count),
        ("QUEUE_CAPACITY", queue_capacity),
        ("FRAME_CONCURRENCY", frame_concurrency),
    ] {
        if value == 0 {
            bail!("{key} must be greater than zero in {}", path.display());
        }
    }
    if job_timeout_secs == 0 {
        bail!("JOB_TIMEOUT_SECS must be greater than zero in {}", path.display());
    }

    // The conventional OpenAI variable is honoured when the file has no key.
    let api_key = cfg
        .transcription_api_key
        .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|key| !key.is_empty()));

    Ok(RuntimeConfig {
        data_root,
        host: cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: cfg.port.unwrap_or(DEFAULT_PORT),
        worker_count,
        queue_capacity,
        job_timeout: Duration::from_secs(job_timeout_secs),
        frame_concurrency,
        tools: ToolPaths {
            ffmpeg: cfg.ffmpeg_bin.unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe: cfg.ffprobe_bin.unwrap_or_else(|| "ffprobe".to_string()),
            ytdlp: cfg.ytdlp_bin.unwrap_or_else(|| "yt-dlp".to_string()),
        },
        transcription: TranscriptionConfig {
            url: cfg
                .transcription_url
                .unwrap_or_else(|| DEFAULT_TRANSCRIPTION_URL.to_string()),
            model: cfg
                .transcription_model
                .unwrap_or_else(|| DEFAULT_TRANSCRIPTION_MODEL.to_string()),
            api_key,
        },
    })
}
