mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use videolens::Error;
use videolens::adapters::Adapters;
use videolens::ingest::UploadRequest;
use videolens::model::{JobSource, JobStatus, NewJob};
use videolens::store::INTERRUPTED_MESSAGE;

const CLIP: &[u8] = b"\x00\x00\x00\x18ftypmp42 pretend this is a video";

#[tokio::test]
async fn upload_runs_to_completion() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    let job = harness.upload("alice", "holiday.mp4", CLIP).await?;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.file_size, Some(CLIP.len() as i64));
    let expected_media = harness
        .layout
        .uploads
        .join(format!("{}.mp4", blake3::hash(CLIP).to_hex()));
    assert_eq!(job.media_path.as_ref(), Some(&expected_media));
    assert!(expected_media.exists());

    let done = harness.wait_for_terminal(job.id).await;
    assert_eq!(done.status, JobStatus::Completed, "{:?}", done.error_message);
    assert_eq!(done.duration, Some(125));
    assert_eq!(done.resolution.as_deref(), Some("1920x1080"));
    assert_eq!(done.format.as_deref(), Some("mp4"));
    assert_eq!(done.key_frames_count, Some(21));
    assert!(done.processing_completed >= done.processing_started);

    let detail = harness.service.job_detail(job.id, "alice").await?;
    let stamps: Vec<i64> = detail.key_frames.iter().map(|frame| frame.timestamp).collect();
    assert_eq!(stamps, (0..125).step_by(6).collect::<Vec<_>>());
    assert_eq!(detail.key_frames[11].description, "Key frame at 1:06");
    for frame in &detail.key_frames {
        assert_eq!(std::fs::read(&frame.image_path)?, JPEG_BYTES);
    }

    let metadata = detail.metadata_map();
    assert_eq!(metadata.get("total_frames"), Some(&"3750"));
    assert_eq!(metadata.get("frame_rate"), Some(&"30"));

    let transcript = detail.transcript.expect("transcript stored");
    assert_eq!(transcript.transcription_text, "hello from the clip");
    assert_eq!(transcript.confidence, 80);
    assert_eq!(transcript.language.as_deref(), Some("english"));
    assert!(transcript.audio_path.as_ref().is_some_and(|path| path.exists()));
    Ok(())
}

#[tokio::test]
async fn failed_frames_are_dropped() -> anyhow::Result<()> {
    let harness = Harness::new(Adapters {
        frames: Arc::new(FakeFrames::failing_at(&[6, 60, 120])),
        ..working_adapters()
    });
    let job = harness.upload("alice", "clip.mp4", CLIP).await?;
    let done = harness.wait_for_terminal(job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.key_frames_count, Some(18));
    let frames = harness.store.key_frames(job.id).await?;
    assert_eq!(frames.len(), 18);
    assert!(frames.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
    assert!(frames.iter().all(|frame| ![6, 60, 120].contains(&frame.timestamp)));
    Ok(())
}

#[tokio::test]
async fn frame_extraction_is_bounded() -> anyhow::Result<()> {
    let frames = Arc::new(FakeFrames::default());
    let harness = Harness::new(Adapters {
        frames: frames.clone(),
        ..working_adapters()
    });
    let job = harness.upload("alice", "clip.mp4", CLIP).await?;
    harness.wait_for_terminal(job.id).await;

    assert_eq!(frames.calls.load(Ordering::SeqCst), 21);
    let peak = frames.max_in_flight.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= FRAME_CONCURRENCY, "peak {peak}");
    Ok(())
}

#[tokio::test]
async fn remote_job_downloads_then_completes() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    let job = harness
        .service
        .submit_remote("alice", "https://www.youtube.com/watch?v=dQw4w9WgXcQ")
        .await?;
    assert!(job.media_path.is_none());
    assert!(matches!(job.source, JobSource::Remote { .. }));

    let done = harness.wait_for_terminal(job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    let media = done.media_path.expect("media recorded after download");
    assert_eq!(
        media,
        harness
            .layout
            .job_download_dir(job.id)
            .join(format!("video_{}.mp4", job.id))
    );
    Ok(())
}

#[tokio::test]
async fn failing_remote_fetch_fails_the_job() -> anyhow::Result<()> {
    let harness = Harness::new(Adapters {
        fetcher: Arc::new(FakeFetcher::failing("Video unavailable")),
        ..working_adapters()
    });
    let job = harness
        .service
        .submit_remote("alice", "https://www.youtube.com/watch?v=gone")
        .await?;
    let done = harness.wait_for_terminal(job.id).await;

    assert_eq!(done.status, JobStatus::Failed);
    let message = done.error_message.expect("failure message");
    assert!(message.contains("Video unavailable"), "{message}");
    assert!(done.duration.is_none());
    assert!(harness.store.key_frames(job.id).await?.is_empty());
    assert!(harness.store.metadata(job.id).await?.is_empty());
    assert!(harness.store.transcript(job.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn missing_video_stream_fails_the_job() -> anyhow::Result<()> {
    let harness = Harness::new(Adapters {
        probe: Arc::new(FakeProbe::failing("no video")),
        ..working_adapters()
    });
    let job = harness.upload("alice", "audio-only.mp4", CLIP).await?;
    let done = harness.wait_for_terminal(job.id).await;

    assert_eq!(done.status, JobStatus::Failed);
    assert!(
        done.error_message
            .as_deref()
            .is_some_and(|message| message.contains("No video stream found"))
    );
    assert!(done.key_frames_count.is_none());
    Ok(())
}

#[tokio::test]
async fn silent_video_has_no_transcript() -> anyhow::Result<()> {
    let harness = Harness::new(Adapters {
        audio: Arc::new(FakeAudio::silent()),
        ..working_adapters()
    });
    let job = harness.upload("alice", "silent.mp4", CLIP).await?;
    let done = harness.wait_for_terminal(job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert!(harness.store.transcript(job.id).await?.is_none());
    assert!(!harness.layout.audio_path(job.id).exists());
    Ok(())
}

#[tokio::test]
async fn transcription_failure_does_not_fail_the_job() -> anyhow::Result<()> {
    let harness = Harness::new(Adapters {
        transcriber: Arc::new(FakeTranscriber::failing("status 401: invalid api key")),
        ..working_adapters()
    });
    let job = harness.upload("alice", "clip.mp4", CLIP).await?;
    let done = harness.wait_for_terminal(job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    let transcript = harness.store.transcript(job.id).await?.expect("placeholder");
    assert!(
        transcript
            .transcription_text
            .starts_with("Audio transcription failed: ")
    );
    assert!(transcript.transcription_text.contains("invalid api key"));
    assert_eq!(transcript.confidence, 0);
    assert_eq!(transcript.duration, 0.0);
    Ok(())
}

#[tokio::test]
async fn audio_extraction_failure_records_placeholder() -> anyhow::Result<()> {
    let harness = Harness::new(Adapters {
        audio: Arc::new(FakeAudio::failing("Invalid data found when processing input")),
        ..working_adapters()
    });
    let job = harness.upload("alice", "clip.mp4", CLIP).await?;
    let done = harness.wait_for_terminal(job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    let transcript = harness.store.transcript(job.id).await?.expect("placeholder");
    assert!(transcript.transcription_text.contains("Invalid data found"));
    assert!(transcript.audio_path.is_none());
    Ok(())
}

#[tokio::test]
async fn transcript_store_failure_does_not_fail_the_job() -> anyhow::Result<()> {
    let harness = Harness::with_store(working_adapters(), Arc::new(TranscriptRejectingStore::new()));
    let job = harness.upload("alice", "clip.mp4", CLIP).await?;
    let done = harness.wait_for_terminal(job.id).await;

    assert_eq!(done.status, JobStatus::Completed, "{:?}", done.error_message);
    assert!(done.error_message.is_none());
    assert_eq!(done.key_frames_count, Some(21));
    assert!(harness.store.transcript(job.id).await?.is_none());
    assert_eq!(harness.store.metadata(job.id).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn unwritable_audio_is_not_recorded() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    let media = harness.layout.uploads.join("clip.mp4");
    std::fs::write(&media, CLIP)?;
    let job = harness
        .store
        .create_job(NewJob {
            owner_id: "alice".into(),
            file_name: "clip.mp4".into(),
            file_size: Some(CLIP.len() as i64),
            source: JobSource::Local { path: media },
        })
        .await?;
    // A directory where the WAV file should go makes the write fail.
    std::fs::create_dir_all(harness.layout.audio_path(job.id))?;
    harness.dispatcher.enqueue(job.id).await?;

    let done = harness.wait_for_terminal(job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    let transcript = harness.store.transcript(job.id).await?.expect("transcript");
    assert_eq!(transcript.transcription_text, "hello from the clip");
    assert!(transcript.audio_path.is_none());
    Ok(())
}

#[tokio::test]
async fn slow_jobs_time_out() -> anyhow::Result<()> {
    let harness = Harness::with_timeout(
        Adapters {
            probe: Arc::new(FakeProbe::slow(Duration::from_secs(5))),
            ..working_adapters()
        },
        Duration::from_millis(200),
    );
    let job = harness.upload("alice", "clip.mp4", CLIP).await?;
    let done = harness.wait_for_terminal(job.id).await;

    assert_eq!(done.status, JobStatus::Failed);
    assert!(
        done.error_message
            .as_deref()
            .is_some_and(|message| message.contains("timed out"))
    );

    // Terminal states stay put.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let later = harness.service.get_job(job.id, "alice").await?;
    assert_eq!(later.status, JobStatus::Failed);
    assert_eq!(later.updated_at, done.updated_at);
    Ok(())
}

#[tokio::test]
async fn report_is_generated_once() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    let job = harness.upload("alice", "Trip <1>.mp4", CLIP).await?;
    harness.wait_for_terminal(job.id).await;

    let (service_a, service_b) = (harness.service.clone(), harness.service.clone());
    let (first, second) = tokio::join!(
        service_a.ensure_report(job.id, "alice"),
        service_b.ensure_report(job.id, "alice"),
    );
    let (_, first) = first?;
    let (_, second) = second?;
    assert_eq!(first, second);
    assert_eq!(first, harness.layout.report_path(job.id));

    let html = std::fs::read_to_string(&first)?;
    assert!(html.contains("Trip &lt;1&gt;.mp4"));
    assert!(html.contains("hello from the clip"));

    let (job_after, third) = harness.service.ensure_report(job.id, "alice").await?;
    assert_eq!(third, first);
    assert_eq!(job_after.report_path, Some(first));
    assert_eq!(harness.store.key_frames(job.id).await?.len(), 21);
    Ok(())
}

#[tokio::test]
async fn report_is_rebuilt_when_file_is_missing() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    let job = harness.upload("alice", "clip.mp4", CLIP).await?;
    harness.wait_for_terminal(job.id).await;

    let (_, path) = harness.service.ensure_report(job.id, "alice").await?;
    std::fs::remove_file(&path)?;
    let (_, rebuilt) = harness.service.ensure_report(job.id, "alice").await?;
    assert_eq!(rebuilt, path);
    assert!(rebuilt.exists());
    Ok(())
}

#[tokio::test]
async fn report_requires_completion() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    let job = harness
        .store
        .create_job(NewJob {
            owner_id: "alice".into(),
            file_name: "queued.mp4".into(),
            file_size: Some(10),
            source: JobSource::Local {
                path: PathBuf::from("/nowhere/queued.mp4"),
            },
        })
        .await?;

    let err = harness.service.ensure_report(job.id, "alice").await.unwrap_err();
    assert!(matches!(err, Error::NotCompleted));
    Ok(())
}

#[tokio::test]
async fn delete_removes_records_and_files() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    let job = harness.upload("alice", "clip.mp4", CLIP).await?;
    harness.wait_for_terminal(job.id).await;
    let (_, report) = harness.service.ensure_report(job.id, "alice").await?;
    let media = job.media_path.clone().expect("media");
    let artifacts = harness.layout.job_artifacts_dir(job.id);
    assert!(artifacts.exists());

    harness.service.delete_job(job.id, "alice").await?;

    assert!(matches!(
        harness.service.get_job(job.id, "alice").await,
        Err(Error::NotFound)
    ));
    assert!(harness.store.key_frames(job.id).await?.is_empty());
    assert!(harness.store.metadata(job.id).await?.is_empty());
    assert!(harness.store.transcript(job.id).await?.is_none());
    assert!(!media.exists());
    assert!(!report.exists());
    assert!(!artifacts.exists());
    Ok(())
}

#[tokio::test]
async fn shared_upload_survives_deleting_one_job() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    let first = harness.upload("alice", "a.mp4", CLIP).await?;
    let second = harness.upload("bob", "b.mp4", CLIP).await?;
    assert_eq!(first.media_path, second.media_path);
    harness.wait_for_terminal(first.id).await;
    harness.wait_for_terminal(second.id).await;

    harness.service.delete_job(first.id, "alice").await?;
    assert!(second.media_path.as_ref().is_some_and(|path| path.exists()));

    harness.service.delete_job(second.id, "bob").await?;
    assert!(second.media_path.as_ref().is_some_and(|path| !path.exists()));
    Ok(())
}

#[tokio::test]
async fn upload_referenced_by_a_newer_row_is_kept() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    let job = harness.upload("alice", "a.mp4", CLIP).await?;
    harness.wait_for_terminal(job.id).await;
    let media = job.media_path.clone().expect("media");

    // An identical upload registered while the first one is being deleted.
    let late = harness
        .store
        .create_job(NewJob {
            owner_id: "bob".into(),
            file_name: "b.mp4".into(),
            file_size: Some(CLIP.len() as i64),
            source: JobSource::Local {
                path: media.clone(),
            },
        })
        .await?;

    harness.service.delete_job(job.id, "alice").await?;
    assert!(media.exists());
    assert_eq!(harness.store.media_references(&media).await?, 1);

    harness.store.delete_job(late.id).await?;
    Ok(())
}

#[tokio::test]
async fn other_owners_are_forbidden() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    let job = harness.upload("alice", "clip.mp4", CLIP).await?;
    harness.wait_for_terminal(job.id).await;

    assert!(matches!(
        harness.service.get_job(job.id, "mallory").await,
        Err(Error::Forbidden)
    ));
    assert!(matches!(
        harness.service.ensure_report(job.id, "mallory").await,
        Err(Error::Forbidden)
    ));
    assert!(matches!(
        harness.service.delete_job(job.id, "mallory").await,
        Err(Error::Forbidden)
    ));
    assert!(harness.service.list_jobs("mallory").await?.is_empty());
    assert!(harness.service.get_job(job.id, "alice").await.is_ok());
    assert!(matches!(
        harness.service.get_job(job.id + 100, "alice").await,
        Err(Error::NotFound)
    ));
    Ok(())
}

#[tokio::test]
async fn invalid_submissions_create_nothing() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());

    let err = harness
        .service
        .begin_upload(
            "alice",
            UploadRequest {
                original_name: "notes.pdf".into(),
                content_type: Some("application/pdf".into()),
                declared_size: Some(100),
            },
        )
        .await
        .err()
        .expect("pdf rejected");
    assert!(matches!(err, Error::Validation(_)));

    let err = harness.upload("alice", "empty.mp4", b"").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = harness
        .service
        .submit_remote("alice", "ftp://example.com/video.mp4")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    assert!(harness.service.list_jobs("alice").await?.is_empty());
    let leftovers = std::fs::read_dir(&harness.layout.uploads)?.count();
    assert_eq!(leftovers, 0);
    Ok(())
}

#[tokio::test]
async fn jobs_are_listed_newest_first() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    let older = harness.upload("alice", "one.mp4", CLIP).await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = harness
        .service
        .submit_remote("alice", "https://vimeo.com/12345")
        .await?;

    let listed: Vec<_> = harness
        .service
        .list_jobs("alice")
        .await?
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(listed, vec![newer.id, older.id]);
    Ok(())
}

#[tokio::test]
async fn recovery_fails_interrupted_and_requeues_pending() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    let new_job = |name: &str| NewJob {
        owner_id: "alice".into(),
        file_name: name.into(),
        file_size: None,
        source: JobSource::Remote {
            url: url::Url::parse("https://example.com/watch?v=1").expect("url"),
        },
    };
    let interrupted = harness.store.create_job(new_job("interrupted")).await?;
    harness.store.start_processing(interrupted.id).await?;
    let waiting = harness.store.create_job(new_job("waiting")).await?;

    assert_eq!(harness.service.recover().await?, 1);

    let interrupted = harness.wait_for_terminal(interrupted.id).await;
    assert_eq!(interrupted.status, JobStatus::Failed);
    assert_eq!(interrupted.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));

    let waiting = harness.wait_for_terminal(waiting.id).await;
    assert_eq!(waiting.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn closed_queue_rejects_without_orphans() -> anyhow::Result<()> {
    let harness = Harness::new(working_adapters());
    harness.dispatcher.shutdown().await;

    let err = harness
        .service
        .submit_remote("alice", "https://www.youtube.com/watch?v=late")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueClosed));
    assert!(matches!(
        harness.upload("alice", "late.mp4", CLIP).await,
        Err(Error::QueueClosed)
    ));
    assert!(harness.service.list_jobs("alice").await?.is_empty());
    Ok(())
}
