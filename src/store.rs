//! Job persistence layer.
//!
//! [`JobRepository`] is the interface the orchestrator, the ingestion paths
//! and the report materializer are written against. [`SqliteJobStore`] backs
//! it with a single SQLite connection guarded by a mutex; every method runs on
//! the blocking pool so async callers never stall the runtime.
//!
//! Status changes are validated against [`JobStatus::can_transition_to`]
//! while the connection lock is held, which makes each transition an atomic
//! read-validate-write even when several workers share the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tokio::task;
use url::Url;

use crate::error::StoreError;
use crate::model::{
    Job, JobId, JobSource, JobStatus, KeyFrame, MetadataEntry, NewJob, NewKeyFrame,
    NewTranscript, ProbedAttributes, Transcript,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Message recorded on jobs that were mid-pipeline when the process stopped.
pub const INTERRUPTED_MESSAGE: &str = "processing interrupted by server restart";

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, job: NewJob) -> StoreResult<Job>;
    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>>;
    /// Jobs owned by `owner_id`, newest first.
    async fn list_jobs(&self, owner_id: &str) -> StoreResult<Vec<Job>>;

    /// `pending -> processing`, stamping `processing_started`.
    async fn start_processing(&self, id: JobId) -> StoreResult<Job>;
    async fn set_media_path(&self, id: JobId, path: &Path) -> StoreResult<()>;
    async fn record_probe(&self, id: JobId, attributes: &ProbedAttributes) -> StoreResult<()>;
    /// Stores all frames in one transaction and returns how many were written.
    async fn insert_key_frames(&self, id: JobId, frames: Vec<NewKeyFrame>) -> StoreResult<usize>;
    async fn insert_metadata(&self, id: JobId, entries: Vec<(String, String)>) -> StoreResult<()>;
    async fn insert_transcript(&self, id: JobId, transcript: NewTranscript) -> StoreResult<()>;
    /// `processing -> completed`. The key frame count is taken from the
    /// stored key frames so the two can never disagree.
    async fn complete_job(&self, id: JobId) -> StoreResult<Job>;
    /// Moves a non-terminal job to `failed`. Returns `false` when the job had
    /// already reached a terminal state and was left untouched.
    async fn fail_job(&self, id: JobId, message: &str) -> StoreResult<bool>;
    async fn set_report_path(&self, id: JobId, path: &Path) -> StoreResult<()>;

    async fn key_frames(&self, id: JobId) -> StoreResult<Vec<KeyFrame>>;
    async fn metadata(&self, id: JobId) -> StoreResult<Vec<MetadataEntry>>;
    async fn transcript(&self, id: JobId) -> StoreResult<Option<Transcript>>;

    /// Removes the job row and every child record in one transaction.
    /// Returns `false` if the job did not exist.
    async fn delete_job(&self, id: JobId) -> StoreResult<bool>;
    /// Number of jobs whose media lives at `path`. Identical uploads share
    /// one content-addressed file.
    async fn media_references(&self, path: &Path) -> StoreResult<i64>;

    /// Fails jobs stuck in `processing` and returns the ids still `pending`,
    /// oldest first, so they can be queued again.
    async fn recover_interrupted(&self) -> StoreResult<Vec<JobId>>;
}

/// SQLite implementation of [`JobRepository`].
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Opens (and if necessary creates) the database file and ensures the
    /// schema exists. WAL mode keeps readers from blocking the writer.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        ensure_tables(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await?
    }
}

/// Creates the tables if they do not exist yet, inside one transaction so a
/// failure leaves the file untouched.
fn ensure_tables(conn: &mut Connection) -> StoreResult<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            file_size INTEGER,
            source_kind TEXT NOT NULL CHECK (source_kind IN ('local', 'remote')),
            source_value TEXT NOT NULL,
            media_path TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            duration INTEGER,
            resolution TEXT,
            format TEXT,
            key_frames_count INTEGER,
            report_path TEXT,
            error_message TEXT,
            processing_started TEXT,
            processing_completed TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS key_frames (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id INTEGER NOT NULL,
            timestamp INTEGER NOT NULL,
            image_path TEXT NOT NULL,
            description TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS job_metadata (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id INTEGER NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS transcripts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id INTEGER NOT NULL UNIQUE,
            text TEXT NOT NULL,
            duration REAL NOT NULL DEFAULT 0,
            language TEXT,
            confidence INTEGER NOT NULL DEFAULT 0,
            audio_path TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
        CREATE INDEX IF NOT EXISTS idx_key_frames_job ON key_frames(job_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_job_metadata_job ON job_metadata(job_id);
        "#,
    )?;
    tx.commit()?;
    Ok(())
}

const JOB_COLUMNS: &str = r#"
    id, owner_id, file_name, file_size, source_kind, source_value, media_path,
    status, duration, resolution, format, key_frames_count, report_path,
    error_message, processing_started, processing_completed, created_at, updated_at
"#;

#[async_trait]
impl JobRepository for SqliteJobStore {
    async fn create_job(&self, job: NewJob) -> StoreResult<Job> {
        self.run(move |conn| {
            let now = Utc::now();
            let (kind, value) = match &job.source {
                JobSource::Local { path } => ("local", path_string(path)),
                JobSource::Remote { url } => ("remote", url.to_string()),
            };
            let media_path = job.media_path().map(|path| path_string(path));

            conn.execute(
                r#"
                INSERT INTO jobs (
                    owner_id, file_name, file_size, source_kind, source_value,
                    media_path, status, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                "#,
                params![
                    job.owner_id,
                    job.file_name,
                    job.file_size,
                    kind,
                    value,
                    media_path,
                    JobStatus::Pending.as_str(),
                    now,
                ],
            )?;

            let id = conn.last_insert_rowid();
            fetch_job(conn, id)?.ok_or(StoreError::MissingJob(id))
        })
        .await
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        self.run(move |conn| fetch_job(conn, id)).await
    }

    async fn list_jobs(&self, owner_id: &str) -> StoreResult<Vec<Job>> {
        let owner_id = owner_id.to_owned();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE owner_id = ?1 ORDER BY created_at DESC, id DESC"
            ))?;
            let mut rows = stmt.query([&owner_id])?;
            let mut jobs = Vec::new();
            while let Some(row) = rows.next()? {
                jobs.push(row_to_job(row)?);
            }
            Ok(jobs)
        })
        .await
    }

    async fn start_processing(&self, id: JobId) -> StoreResult<Job> {
        self.run(move |conn| {
            check_transition(conn, id, JobStatus::Processing)?;
            let now = Utc::now();
            conn.execute(
                "UPDATE jobs SET status = ?2, processing_started = ?3, updated_at = ?3 WHERE id = ?1",
                params![id, JobStatus::Processing.as_str(), now],
            )?;
            fetch_job(conn, id)?.ok_or(StoreError::MissingJob(id))
        })
        .await
    }

    async fn set_media_path(&self, id: JobId, path: &Path) -> StoreResult<()> {
        let path = path_string(path);
        self.run(move |conn| {
            ensure_processing(conn, id)?;
            conn.execute(
                "UPDATE jobs SET media_path = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, path, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_probe(&self, id: JobId, attributes: &ProbedAttributes) -> StoreResult<()> {
        let attributes = attributes.clone();
        self.run(move |conn| {
            ensure_processing(conn, id)?;
            conn.execute(
                r#"
                UPDATE jobs
                SET duration = ?2, resolution = ?3, format = ?4, updated_at = ?5
                WHERE id = ?1
                "#,
                params![
                    id,
                    attributes.duration,
                    attributes.resolution,
                    attributes.format,
                    Utc::now(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_key_frames(&self, id: JobId, frames: Vec<NewKeyFrame>) -> StoreResult<usize> {
        self.run(move |conn| {
            ensure_processing(conn, id)?;
            let now = Utc::now();
            let tx = conn.transaction()?;
            for frame in &frames {
                tx.execute(
                    r#"
                    INSERT INTO key_frames (job_id, timestamp, image_path, description, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    params![
                        id,
                        frame.timestamp,
                        path_string(&frame.image_path),
                        frame.description,
                        now,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(frames.len())
        })
        .await
    }

    async fn insert_metadata(&self, id: JobId, entries: Vec<(String, String)>) -> StoreResult<()> {
        self.run(move |conn| {
            ensure_processing(conn, id)?;
            let now = Utc::now();
            let tx = conn.transaction()?;
            for (key, value) in &entries {
                tx.execute(
                    "INSERT INTO job_metadata (job_id, key, value, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![id, key, value, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn insert_transcript(&self, id: JobId, transcript: NewTranscript) -> StoreResult<()> {
        self.run(move |conn| {
            ensure_processing(conn, id)?;
            conn.execute(
                r#"
                INSERT INTO transcripts (job_id, text, duration, language, confidence, audio_path, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    id,
                    transcript.text,
                    transcript.duration,
                    transcript.language,
                    transcript.confidence,
                    transcript.audio_path.as_deref().map(path_string),
                    Utc::now(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn complete_job(&self, id: JobId) -> StoreResult<Job> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            check_transition(&tx, id, JobStatus::Completed)?;

            let (duration, started): (Option<i64>, Option<DateTime<Utc>>) = tx.query_row(
                "SELECT duration, processing_started FROM jobs WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if duration.is_none() {
                return Err(StoreError::CorruptRow {
                    table: "jobs",
                    message: format!("job {id} has no duration and cannot complete"),
                });
            }

            let now = Utc::now();
            let finished = started.map_or(now, |started| now.max(started));
            tx.execute(
                r#"
                UPDATE jobs
                SET status = ?2,
                    key_frames_count = (SELECT COUNT(*) FROM key_frames WHERE job_id = ?1),
                    processing_completed = ?3,
                    updated_at = ?4
                WHERE id = ?1
                "#,
                params![id, JobStatus::Completed.as_str(), finished, now],
            )?;
            tx.commit()?;
            fetch_job(conn, id)?.ok_or(StoreError::MissingJob(id))
        })
        .await
    }

    async fn fail_job(&self, id: JobId, message: &str) -> StoreResult<bool> {
        let message = message.to_owned();
        self.run(move |conn| {
            match check_transition(conn, id, JobStatus::Failed) {
                Ok(_) => {}
                Err(StoreError::InvalidTransition { .. }) => return Ok(false),
                Err(err) => return Err(err),
            }
            conn.execute(
                "UPDATE jobs SET status = ?2, error_message = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, JobStatus::Failed.as_str(), message, Utc::now()],
            )?;
            Ok(true)
        })
        .await
    }

    async fn set_report_path(&self, id: JobId, path: &Path) -> StoreResult<()> {
        let path = path_string(path);
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE jobs SET report_path = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, path, Utc::now()],
            )?;
            if updated == 0 {
                return Err(StoreError::MissingJob(id));
            }
            Ok(())
        })
        .await
    }

    async fn key_frames(&self, id: JobId) -> StoreResult<Vec<KeyFrame>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, job_id, timestamp, image_path, description, created_at
                FROM key_frames
                WHERE job_id = ?1
                ORDER BY timestamp ASC, id ASC
                "#,
            )?;
            let frames = stmt
                .query_map([id], |row| {
                    Ok(KeyFrame {
                        id: row.get("id")?,
                        analysis_id: row.get("job_id")?,
                        timestamp: row.get("timestamp")?,
                        image_path: PathBuf::from(row.get::<_, String>("image_path")?),
                        description: row.get("description")?,
                        created_at: row.get("created_at")?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(frames)
        })
        .await
    }

    async fn metadata(&self, id: JobId) -> StoreResult<Vec<MetadataEntry>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, job_id, key, value, created_at
                FROM job_metadata
                WHERE job_id = ?1
                ORDER BY id ASC
                "#,
            )?;
            let entries = stmt
                .query_map([id], |row| {
                    Ok(MetadataEntry {
                        id: row.get("id")?,
                        analysis_id: row.get("job_id")?,
                        key: row.get("key")?,
                        value: row.get("value")?,
                        created_at: row.get("created_at")?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }

    async fn transcript(&self, id: JobId) -> StoreResult<Option<Transcript>> {
        self.run(move |conn| {
            let transcript = conn
                .query_row(
                    r#"
                    SELECT id, job_id, text, duration, language, confidence, audio_path, created_at
                    FROM transcripts
                    WHERE job_id = ?1
                    "#,
                    [id],
                    |row| {
                        Ok(Transcript {
                            id: row.get("id")?,
                            analysis_id: row.get("job_id")?,
                            transcription_text: row.get("text")?,
                            duration: row.get("duration")?,
                            language: row.get("language")?,
                            confidence: row.get("confidence")?,
                            audio_path: row.get::<_, Option<String>>("audio_path")?.map(PathBuf::from),
                            created_at: row.get("created_at")?,
                        })
                    },
                )
                .optional()?;
            Ok(transcript)
        })
        .await
    }

    async fn delete_job(&self, id: JobId) -> StoreResult<bool> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM transcripts WHERE job_id = ?1", [id])?;
            tx.execute("DELETE FROM key_frames WHERE job_id = ?1", [id])?;
            tx.execute("DELETE FROM job_metadata WHERE job_id = ?1", [id])?;
            let removed = tx.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    async fn media_references(&self, path: &Path) -> StoreResult<i64> {
        let path = path_string(path);
        self.run(move |conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE media_path = ?1",
                [path],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    async fn recover_interrupted(&self) -> StoreResult<Vec<JobId>> {
        self.run(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE jobs SET status = ?1, error_message = ?2, updated_at = ?3 WHERE status = ?4",
                params![
                    JobStatus::Failed.as_str(),
                    INTERRUPTED_MESSAGE,
                    Utc::now(),
                    JobStatus::Processing.as_str(),
                ],
            )?;
            let pending = {
                let mut stmt = tx.prepare("SELECT id FROM jobs WHERE status = ?1 ORDER BY id ASC")?;
                let ids = stmt
                    .query_map([JobStatus::Pending.as_str()], |row| row.get(0))?
                    .collect::<Result<Vec<JobId>, _>>()?;
                ids
            };
            tx.commit()?;
            Ok(pending)
        })
        .await
    }
}

fn fetch_job(conn: &Connection, id: JobId) -> StoreResult<Option<Job>> {
    let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_job(row)?)),
        None => Ok(None),
    }
}

fn current_status(conn: &Connection, id: JobId) -> StoreResult<JobStatus> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM jobs WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    let status = status.ok_or(StoreError::MissingJob(id))?;
    parse_status(&status)
}

fn check_transition(conn: &Connection, id: JobId, next: JobStatus) -> StoreResult<JobStatus> {
    let current = current_status(conn, id)?;
    if !current.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            id,
            from: current,
            to: next,
        });
    }
    Ok(current)
}

/// Pipeline writes are only accepted while the job is being processed, so a
/// late write from a timed-out run cannot touch a terminal job.
fn ensure_processing(conn: &Connection, id: JobId) -> StoreResult<()> {
    match current_status(conn, id)? {
        JobStatus::Processing => Ok(()),
        other => Err(StoreError::InvalidTransition {
            id,
            from: other,
            to: JobStatus::Processing,
        }),
    }
}

fn parse_status(value: &str) -> StoreResult<JobStatus> {
    value.parse().map_err(|message| StoreError::CorruptRow {
        table: "jobs",
        message,
    })
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Converts a SQL row into a [`Job`], rebuilding the source union from the
/// kind/value column pair.
fn row_to_job(row: &Row<'_>) -> StoreResult<Job> {
    let kind: String = row.get("source_kind")?;
    let value: String = row.get("source_value")?;
    let source = match kind.as_str() {
        "local" => JobSource::Local {
            path: PathBuf::from(value),
        },
        "remote" => JobSource::Remote {
            url: Url::parse(&value).map_err(|err| StoreError::CorruptRow {
                table: "jobs",
                message: format!("invalid source url '{value}': {err}"),
            })?,
        },
        other => {
            return Err(StoreError::CorruptRow {
                table: "jobs",
                message: format!("unknown source kind '{other}'"),
            });
        }
    };
    let status: String = row.get("status")?;

    Ok(Job {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        file_name: row.get("file_name")?,
        file_size: row.get("file_size")?,
        source,
        media_path: row.get::<_, Option<String>>("media_path")?.map(PathBuf::from),
        status: parse_status(&status)?,
        duration: row.get("duration")?,
        resolution: row.get("resolution")?,
        format: row.get("format")?,
        key_frames_count: row.get("key_frames_count")?,
        report_path: row.get::<_, Option<String>>("report_path")?.map(PathBuf::from),
        error_message: row.get("error_message")?,
        processing_started: row.get("processing_started")?,
        processing_completed: row.get("processing_completed")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
