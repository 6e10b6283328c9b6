//! Lazily generated HTML report for a completed job.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tempfile::Builder;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{Job, JobDetail, JobId, JobStatus};
use crate::pipeline::format_time;
use crate::storage::{STAGING_PREFIX, StorageLayout};
use crate::store::JobRepository;

pub struct ReportMaterializer {
    store: Arc<dyn JobRepository>,
    layout: StorageLayout,
    locks: Mutex<HashMap<JobId, Arc<AsyncMutex<()>>>>,
}

impl ReportMaterializer {
    pub fn new(store: Arc<dyn JobRepository>, layout: StorageLayout) -> Self {
        Self {
            store,
            layout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, id: JobId) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.locks.lock().entry(id).or_default())
    }

    /// Drops the lock entry of a deleted job.
    pub fn forget(&self, id: JobId) {
        self.locks.lock().remove(&id);
    }

    /// Returns the report for `job`, generating it on first use. The caller
    /// has already checked ownership.
    pub async fn ensure(&self, job: &Job) -> Result<PathBuf> {
        if job.status != JobStatus::Completed {
            return Err(Error::NotCompleted);
        }
        let lock = self.lock_for(job.id);
        let _guard = lock.lock().await;

        // Another request may have produced it while we waited.
        let job = self.store.get_job(job.id).await?.ok_or(Error::NotFound)?;
        if let Some(existing) = &job.report_path {
            if tokio::fs::try_exists(existing).await.unwrap_or(false) {
                debug!(job_id = job.id, "serving cached report");
                return Ok(existing.clone());
            }
        }

        let detail = JobDetail {
            key_frames: self.store.key_frames(job.id).await?,
            metadata: self.store.metadata(job.id).await?,
            transcript: self.store.transcript(job.id).await?,
            analysis: job,
        };
        let html = render_report(&detail);
        let id = detail.analysis.id;
        let target = self.layout.report_path(id);
        let reports_dir = self.layout.reports.clone();
        let written = target.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&reports_dir).map_err(|err| Error::io(&reports_dir, err))?;
            let mut staged = Builder::new()
                .prefix(STAGING_PREFIX)
                .suffix(".html")
                .tempfile_in(&reports_dir)
                .map_err(|err| Error::io(&reports_dir, err))?;
            staged
                .write_all(html.as_bytes())
                .map_err(|err| Error::io(staged.path(), err))?;
            staged
                .persist(&written)
                .map_err(|err| Error::io(&written, err.error))?;
            Ok(())
        })
        .await
        .map_err(|err| Error::Store(err.into()))??;

        self.store.set_report_path(id, &target).await?;
        info!(job_id = id, path = %target.display(), "report generated");
        Ok(target)
    }
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn or_na(value: Option<String>) -> String {
    value.map_or_else(|| "N/A".to_string(), |value| escape_html(&value))
}

pub fn render_report(detail: &JobDetail) -> String {
    let job = &detail.analysis;
    let metadata = detail.metadata_map();
    let mut html = String::new();

    // Writing into a String cannot fail.
    let _ = write!(
        html,
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="UTF-8">
<title>Video Analysis Report - {name}</title>
<style>
body {{ font-family: Arial, sans-serif; margin: 40px; line-height: 1.6; }}
table {{ border-collapse: collapse; }}
td, th {{ padding: 4px 12px; text-align: left; border-bottom: 1px solid #e5e7eb; }}
.keyframe {{ margin-bottom: 16px; }}
.transcript {{ white-space: pre-wrap; background: #f8fafc; padding: 16px; }}
</style>
</head>
<body>
<h1>Video Analysis Report</h1>
<p>Generated on {generated}</p>
<h2>Video Information</h2>
<table>
<tr><th>File Name</th><td>{name}</td></tr>
<tr><th>Duration</th><td>{duration}</td></tr>
<tr><th>Resolution</th><td>{resolution}</td></tr>
<tr><th>Format</th><td>{format}</td></tr>
<tr><th>File Size</th><td>{size}</td></tr>
<tr><th>Key Frames</th><td>{frames}</td></tr>
</table>
<h2>Analysis Summary</h2>
<ul>
<li>Total processing time: {elapsed}</li>
<li>Frame rate: {frame_rate}</li>
<li>Total frames: {total_frames}</li>
</ul>
"#,
        name = escape_html(&job.file_name),
        generated = Utc::now().format("%Y-%m-%d %H:%M UTC"),
        duration = or_na(job.duration.map(format_time)),
        resolution = or_na(job.resolution.clone()),
        format = or_na(job.format.clone()),
        size = or_na(
            job.file_size
                .map(|bytes| format!("{:.2} MB", bytes as f64 / 1024.0 / 1024.0))
        ),
        frames = job.key_frames_count.unwrap_or_default(),
        elapsed = or_na(match (job.processing_started, job.processing_completed) {
            (Some(start), Some(end)) => Some(format!("{} seconds", (end - start).num_seconds())),
            _ => None,
        }),
        frame_rate = or_na(
            metadata
                .get("frame_rate")
                .and_then(|rate| rate.parse::<f64>().ok())
                .map(|rate| format!("{rate:.2} fps"))
        ),
        total_frames = or_na(metadata.get("total_frames").map(|total| total.to_string())),
    );

    if !detail.key_frames.is_empty() {
        let _ = writeln!(
            html,
            "<h2>Key Frames ({} frames)</h2>",
            detail.key_frames.len()
        );
        for frame in &detail.key_frames {
            let file = frame
                .image_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let _ = writeln!(
                html,
                r#"<div class="keyframe"><strong>{}</strong> {} <code>{}</code></div>"#,
                format_time(frame.timestamp),
                escape_html(&frame.description),
                escape_html(&file),
            );
        }
    }

    if let Some(transcript) = &detail.transcript {
        let _ = write!(
            html,
            r#"<h2>Audio Transcript</h2>
<p>Language: {} | Confidence: {}% | Duration: {:.1} s</p>
<div class="transcript">{}</div>
"#,
            or_na(transcript.language.clone()),
            transcript.confidence,
            transcript.duration,
            escape_html(&transcript.transcription_text),
        );
    }

    html.push_str("</body>\n</html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobSource, KeyFrame, MetadataEntry, Transcript};

    fn detail() -> JobDetail {
        let now = Utc::now();
        JobDetail {
            analysis: Job {
                id: 4,
                owner_id: "alice".into(),
                file_name: "<script>clip.mp4".into(),
                file_size: Some(2 * 1024 * 1024),
                source: JobSource::Local {
                    path: PathBuf::from("/u/abc.mp4"),
                },
                media_path: Some(PathBuf::from("/u/abc.mp4")),
                status: JobStatus::Completed,
                duration: Some(125),
                resolution: Some("1920x1080".into()),
                format: Some("mp4".into()),
                key_frames_count: Some(1),
                report_path: None,
                error_message: None,
                processing_started: Some(now),
                processing_completed: Some(now),
                created_at: now,
                updated_at: now,
            },
            key_frames: vec![KeyFrame {
                id: 1,
                analysis_id: 4,
                timestamp: 66,
                image_path: PathBuf::from("/a/job_4/frame_66.jpg"),
                description: "Key frame at 1:06".into(),
                created_at: now,
            }],
            metadata: vec![MetadataEntry {
                id: 1,
                analysis_id: 4,
                key: "frame_rate".into(),
                value: "29.97002997002997".into(),
                created_at: now,
            }],
            transcript: Some(Transcript {
                id: 1,
                analysis_id: 4,
                transcription_text: "Tom & Jerry".into(),
                duration: 12.0,
                language: Some("english".into()),
                confidence: 80,
                audio_path: None,
                created_at: now,
            }),
        }
    }

    #[test]
    fn escape_html_covers_markup() {
        assert_eq!(
            escape_html(r#"<a href="x">'&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn report_escapes_user_strings() {
        let html = render_report(&detail());
        assert!(html.contains("&lt;script&gt;clip.mp4"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("Tom &amp; Jerry"));
    }

    #[test]
    fn report_lists_frames_and_metadata() {
        let html = render_report(&detail());
        assert!(html.contains("Key Frames (1 frames)"));
        assert!(html.contains("<strong>1:06</strong>"));
        assert!(html.contains("frame_66.jpg"));
        assert!(html.contains("29.97 fps"));
        assert!(html.contains("<td>2:05</td>"));
        assert!(html.contains("2.00 MB"));
        assert!(html.contains("Total frames: N/A"));
    }

    #[test]
    fn transcript_section_is_optional() {
        let mut detail = detail();
        detail.transcript = None;
        assert!(!render_report(&detail).contains("Audio Transcript"));
    }
}
