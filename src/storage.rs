//! On-disk layout for everything a job produces.
//!
//! ```text
//! DATA_ROOT/
//!   videolens.db
//!   uploads/      content-addressed uploads plus in-flight staging files
//!   downloads/    job_<id>/ per remote job
//!   artifacts/    job_<id>/ key frames and extracted audio
//!   reports/      analysis_<id>_report.html
//! ```

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::model::JobId;

const DB_FILE: &str = "videolens.db";
const UPLOADS_SUBDIR: &str = "uploads";
const DOWNLOADS_SUBDIR: &str = "downloads";
const ARTIFACTS_SUBDIR: &str = "artifacts";
const REPORTS_SUBDIR: &str = "reports";

/// Prefix of the temporary files uploads are streamed into before they are
/// renamed to their content hash.
pub const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub root: PathBuf,
    pub uploads: PathBuf,
    pub downloads: PathBuf,
    pub artifacts: PathBuf,
    pub reports: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            uploads: root.join(UPLOADS_SUBDIR),
            downloads: root.join(DOWNLOADS_SUBDIR),
            artifacts: root.join(ARTIFACTS_SUBDIR),
            reports: root.join(REPORTS_SUBDIR),
            root,
        }
    }

    /// Creates every directory the service writes to so later steps can
    /// assume they exist.
    pub fn prepare(&self) -> io::Result<()> {
        for dir in [&self.uploads, &self.downloads, &self.artifacts, &self.reports] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    pub fn job_artifacts_dir(&self, id: JobId) -> PathBuf {
        self.artifacts.join(format!("job_{id}"))
    }

    pub fn job_download_dir(&self, id: JobId) -> PathBuf {
        self.downloads.join(format!("job_{id}"))
    }

    pub fn frame_path(&self, id: JobId, timestamp: i64) -> PathBuf {
        self.job_artifacts_dir(id).join(format!("frame_{timestamp}.jpg"))
    }

    pub fn audio_path(&self, id: JobId) -> PathBuf {
        self.job_artifacts_dir(id).join("audio.wav")
    }

    pub fn report_path(&self, id: JobId) -> PathBuf {
        self.reports.join(format!("analysis_{id}_report.html"))
    }

    /// Deletes staging files left behind by uploads that were interrupted by
    /// a crash. Returns how many were removed.
    pub fn sweep_staging(&self) -> usize {
        let mut removed = 0;
        for entry in WalkDir::new(&self.uploads)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            if !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %entry.path().display(), "could not remove staging file: {err}"),
            }
        }
        removed
    }
}

/// Removes a file, treating "already gone" as success.
pub async fn remove_artifact(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed artifact");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Removes a directory tree, treating "already gone" as success.
pub async fn remove_artifact_dir(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
