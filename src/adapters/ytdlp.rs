//! Remote video fetcher backed by yt-dlp.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use url::Url;

use super::{AdapterResult, RemoteFetcher, run_tool};
use crate::error::AdapterError;

const YTDLP: &str = "yt-dlp";

pub struct YtDlpFetcher {
    program: String,
}

impl YtDlpFetcher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl RemoteFetcher for YtDlpFetcher {
    async fn fetch(&self, url: &Url, dest_dir: &Path, file_stem: &str) -> AdapterResult<PathBuf> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| AdapterError::Io {
                path: dest_dir.to_path_buf(),
                source,
            })?;

        let template = dest_dir.join(format!("{file_stem}.%(ext)s"));
        let mut command = Command::new(&self.program);
        command
            .arg("--no-playlist")
            .arg("--no-progress")
            .arg("--no-warnings")
            .arg("--format")
            .arg("mp4/best")
            .arg("--output")
            .arg(&template)
            .arg("--print")
            .arg("after_move:filepath")
            .arg(url.as_str());

        let output = run_tool(YTDLP, &mut command).await?;
        let path = downloaded_path(&output.stdout).ok_or_else(|| AdapterError::EmptyOutput {
            tool: YTDLP.to_string(),
        })?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AdapterError::Parse {
                tool: YTDLP.to_string(),
                message: format!("reported file '{}' does not exist", path.display()),
            });
        }
        Ok(path)
    }
}

/// yt-dlp prints the final file path last; anything before it is chatter.
fn downloaded_path(stdout: &[u8]) -> Option<PathBuf> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(PathBuf::from)
}
