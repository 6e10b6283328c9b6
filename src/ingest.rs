//! The two ways a job comes into existence: an uploaded file or a remote URL.
//!
//! Both validate before touching the store, reserve a queue slot, create the
//! `pending` row and hand the id to the dispatcher without waiting for the
//! pipeline.

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use tempfile::{Builder, NamedTempFile};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::model::{Job, JobSource, NewJob};
use crate::service::VideoLens;
use crate::storage::{STAGING_PREFIX, remove_artifact};

pub const MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;

pub const ALLOWED_VIDEO_TYPES: [&str; 7] = [
    "video/mp4",
    "video/avi",
    "video/x-msvideo",
    "video/mov",
    "video/quicktime",
    "video/mkv",
    "video/x-matroska",
];

const INVALID_TYPE_MESSAGE: &str = "Invalid file type. Only MP4, AVI, MOV, and MKV files are allowed.";

/// What the client told us about an upload before any bytes arrive.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub original_name: String,
    pub content_type: Option<String>,
    pub declared_size: Option<u64>,
}

/// MIME type of the upload: the declared one, or a guess from the file name
/// when the client sent nothing useful.
pub fn resolve_mime(request: &UploadRequest) -> Option<String> {
    let declared = request
        .content_type
        .as_deref()
        .and_then(|raw| raw.split(';').next())
        .map(|essence| essence.trim().to_ascii_lowercase())
        .filter(|essence| !essence.is_empty() && essence != "application/octet-stream");
    declared.or_else(|| {
        mime_guess::from_path(&request.original_name)
            .first_raw()
            .map(str::to_string)
    })
}

/// Checks type and declared size, returning the extension the stored file
/// will carry.
pub fn validate_upload(request: &UploadRequest) -> Result<&'static str> {
    if request.original_name.trim().is_empty() {
        return Err(Error::Validation("No file uploaded".into()));
    }
    if let Some(size) = request.declared_size {
        if size > MAX_UPLOAD_BYTES {
            return Err(Error::TooLarge {
                limit: MAX_UPLOAD_BYTES,
            });
        }
    }
    let mime = resolve_mime(request)
        .filter(|mime| ALLOWED_VIDEO_TYPES.contains(&mime.as_str()))
        .ok_or_else(|| Error::Validation(INVALID_TYPE_MESSAGE.into()))?;
    extension_for(&mime).ok_or_else(|| Error::Validation(INVALID_TYPE_MESSAGE.into()))
}

fn extension_for(mime: &str) -> Option<&'static str> {
    match mime {
        "video/mp4" => Some("mp4"),
        "video/avi" | "video/x-msvideo" => Some("avi"),
        "video/mov" | "video/quicktime" => Some("mov"),
        "video/mkv" | "video/x-matroska" => Some("mkv"),
        _ => None,
    }
}

/// Accepts only absolute `http`/`https` URLs with a host.
pub fn parse_remote_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("A video URL is required".into()));
    }
    let url = Url::parse(trimmed)
        .map_err(|err| Error::Validation(format!("Invalid video URL: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Validation(format!(
            "Unsupported URL scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::Validation("Video URL has no host".into()));
    }
    Ok(url)
}

fn remote_display_name(url: &Url) -> String {
    let host = url.host_str().unwrap_or("remote");
    let host = host.strip_prefix("www.").unwrap_or(host);
    format!(
        "{host} video - {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// An upload being streamed to a staging file inside the uploads directory.
/// Dropping it discards the staged bytes.
pub struct UploadSink {
    owner_id: String,
    original_name: String,
    extension: &'static str,
    staged: NamedTempFile,
    file: tokio::fs::File,
    hasher: blake3::Hasher,
    written: u64,
    limit: u64,
}

impl UploadSink {
    /// Opens a staging file in `dir` that accepts at most `limit` bytes.
    pub(crate) async fn open(
        dir: &Path,
        owner_id: &str,
        original_name: String,
        extension: &'static str,
        limit: u64,
    ) -> Result<Self> {
        let dir = dir.to_path_buf();
        let staged = tokio::task::spawn_blocking(move || {
            Builder::new()
                .prefix(STAGING_PREFIX)
                .tempfile_in(&dir)
                .map_err(|err| Error::io(&dir, err))
        })
        .await
        .map_err(|err| Error::Store(err.into()))??;
        let file = staged
            .reopen()
            .map(tokio::fs::File::from_std)
            .map_err(|err| Error::io(staged.path(), err))?;

        Ok(Self {
            owner_id: owner_id.to_string(),
            original_name,
            extension,
            staged,
            file,
            hasher: blake3::Hasher::new(),
            written: 0,
            limit,
        })
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.written += chunk.len() as u64;
        if self.written > self.limit {
            return Err(Error::TooLarge { limit: self.limit });
        }
        self.hasher.update(chunk);
        self.file
            .write_all(chunk)
            .await
            .map_err(|err| Error::io(self.staged.path(), err))
    }
}

impl VideoLens {
    /// Validates an upload and opens its staging file.
    pub async fn begin_upload(&self, owner_id: &str, request: UploadRequest) -> Result<UploadSink> {
        let extension = validate_upload(&request)?;
        UploadSink::open(
            &self.layout.uploads,
            owner_id,
            request.original_name,
            extension,
            MAX_UPLOAD_BYTES,
        )
        .await
    }

    /// Moves the staged bytes to their content-addressed name and queues the
    /// job.
    pub async fn finish_upload(&self, mut sink: UploadSink) -> Result<Job> {
        if sink.written == 0 {
            return Err(Error::Validation("Uploaded file is empty".into()));
        }
        sink.file
            .flush()
            .await
            .map_err(|err| Error::io(sink.staged.path(), err))?;

        let slot = self.dispatcher.reserve().await?;

        let digest = sink.hasher.finalize().to_hex();
        let target = self.layout.uploads.join(format!("{digest}.{}", sink.extension));
        let UploadSink {
            owner_id,
            original_name,
            staged,
            file,
            written,
            ..
        } = sink;
        drop(file);
        let destination = target.clone();
        tokio::task::spawn_blocking(move || {
            staged
                .persist(&destination)
                .map(|_| ())
                .map_err(|err| Error::io(&destination, err.error))
        })
        .await
        .map_err(|err| Error::Store(err.into()))??;
        debug!(path = %target.display(), bytes = written, "upload stored");

        let created = self
            .store
            .create_job(NewJob {
                owner_id,
                file_name: original_name,
                file_size: i64::try_from(written).ok(),
                source: JobSource::Local {
                    path: target.clone(),
                },
            })
            .await;
        let job = match created {
            Ok(job) => job,
            Err(err) => {
                self.discard_unreferenced(&target).await;
                return Err(err.into());
            }
        };
        slot.submit(job.id);
        info!(job_id = job.id, file = %job.file_name, "upload queued for processing");
        Ok(job)
    }

    pub async fn submit_remote(&self, owner_id: &str, raw_url: &str) -> Result<Job> {
        let url = parse_remote_url(raw_url)?;
        let slot = self.dispatcher.reserve().await?;
        let job = self
            .store
            .create_job(NewJob {
                owner_id: owner_id.to_string(),
                file_name: remote_display_name(&url),
                file_size: None,
                source: JobSource::Remote { url },
            })
            .await?;
        slot.submit(job.id);
        info!(job_id = job.id, "remote video queued for processing");
        Ok(job)
    }

    async fn discard_unreferenced(&self, path: &Path) {
        match self.store.media_references(path).await {
            Ok(0) => {
                if let Err(err) = remove_artifact(path).await {
                    warn!(path = %path.display(), "could not discard upload: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(path = %path.display(), "could not check upload references: {err}"),
        }
    }
}
