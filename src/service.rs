//! Owner-scoped job queries, deletion and report access.
//!
//! [`VideoLens`] is the one handle the HTTP layer talks to. Submission lives
//! in [`crate::ingest`]; this module covers everything that happens to a job
//! after it exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::model::{Job, JobDetail, JobId, JobSource};
use crate::report::ReportMaterializer;
use crate::storage::{StorageLayout, remove_artifact, remove_artifact_dir};
use crate::store::JobRepository;

pub struct VideoLens {
    pub(crate) store: Arc<dyn JobRepository>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) layout: StorageLayout,
    reports: ReportMaterializer,
}

impl VideoLens {
    pub fn new(
        store: Arc<dyn JobRepository>,
        dispatcher: Arc<Dispatcher>,
        layout: StorageLayout,
    ) -> Self {
        let reports = ReportMaterializer::new(Arc::clone(&store), layout.clone());
        Self {
            store,
            dispatcher,
            layout,
            reports,
        }
    }

    /// Fails jobs interrupted by a previous shutdown and queues the ones that
    /// never started. Queueing happens in the background so a long backlog
    /// does not hold up startup. Returns how many jobs will be re-queued.
    pub async fn recover(&self) -> Result<usize> {
        let pending = self.store.recover_interrupted().await?;
        let count = pending.len();
        if count > 0 {
            info!(count, "re-queueing pending jobs");
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                for id in pending {
                    if let Err(err) = dispatcher.enqueue(id).await {
                        warn!(job_id = id, "could not re-queue job: {err}");
                        break;
                    }
                }
            });
        }
        Ok(count)
    }

    pub async fn get_job(&self, id: JobId, owner_id: &str) -> Result<Job> {
        let job = self.store.get_job(id).await?.ok_or(Error::NotFound)?;
        if job.owner_id != owner_id {
            return Err(Error::Forbidden);
        }
        Ok(job)
    }

    pub async fn job_detail(&self, id: JobId, owner_id: &str) -> Result<JobDetail> {
        let analysis = self.get_job(id, owner_id).await?;
        Ok(JobDetail {
            key_frames: self.store.key_frames(id).await?,
            metadata: self.store.metadata(id).await?,
            transcript: self.store.transcript(id).await?,
            analysis,
        })
    }

    pub async fn list_jobs(&self, owner_id: &str) -> Result<Vec<Job>> {
        Ok(self.store.list_jobs(owner_id).await?)
    }

    /// Path of the job's HTML report, generating it if needed.
    pub async fn ensure_report(&self, id: JobId, owner_id: &str) -> Result<(Job, PathBuf)> {
        let job = self.get_job(id, owner_id).await?;
        let path = self.reports.ensure(&job).await?;
        Ok((job, path))
    }

    /// Removes the job's files and then its records. File removal tolerates
    /// missing files, so a delete that failed halfway can simply be retried.
    /// A shared upload is only removed once no remaining row references it.
    pub async fn delete_job(&self, id: JobId, owner_id: &str) -> Result<()> {
        let job = self.get_job(id, owner_id).await?;
        let frames = self.store.key_frames(id).await?;
        let transcript = self.store.transcript(id).await?;

        if let Some(report) = &job.report_path {
            remove_file(report).await?;
        }
        for frame in &frames {
            remove_file(&frame.image_path).await?;
        }
        if let Some(audio) = transcript.as_ref().and_then(|t| t.audio_path.as_ref()) {
            remove_file(audio).await?;
        }
        for dir in [self.layout.job_artifacts_dir(id), self.layout.job_download_dir(id)] {
            remove_artifact_dir(&dir)
                .await
                .map_err(|err| Error::io(&dir, err))?;
        }

        if !self.store.delete_job(id).await? {
            warn!(job_id = id, "job disappeared during delete");
        }
        self.reports.forget(id);

        if let (JobSource::Local { .. }, Some(media)) = (&job.source, &job.media_path) {
            // Identical uploads share one content-addressed file.
            let remaining = self.store.media_references(media).await?;
            if remaining == 0 {
                remove_file(media).await?;
            } else {
                debug!(job_id = id, remaining, "upload still referenced, keeping it");
            }
        }
        info!(job_id = id, "job deleted");
        Ok(())
    }
}

async fn remove_file(path: &Path) -> Result<()> {
    remove_artifact(path).await.map_err(|err| Error::io(path, err))
}
