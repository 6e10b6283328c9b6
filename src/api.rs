//! HTTP surface.
//!
//! Every route requires the `x-user-id` header, which an upstream
//! authenticator sets. Errors are returned as `{ "error": message }`.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, FromRequestParts, Multipart, Path, State, multipart::MultipartError,
        rejection::JsonRejection,
    },
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::error;

use crate::error::Error;
use crate::ingest::{MAX_UPLOAD_BYTES, UploadRequest};
use crate::model::{Job, JobDetail, JobId};
use crate::service::VideoLens;

pub const OWNER_HEADER: &str = "x-user-id";
const UPLOAD_FIELD: &str = "video";
/// Room for the multipart framing around the file itself.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) | Error::NotCompleted => StatusCode::BAD_REQUEST,
            Error::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            Error::Store(_) | Error::Io { .. } => {
                error!("request failed: {err}");
                return Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::new(err.status(), err.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Caller identity taken from [`OWNER_HEADER`].
#[derive(Debug, Clone)]
pub struct Owner(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Owner(value.to_string()))
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized"))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionResponse {
    analysis_id: JobId,
    message: &'static str,
}

#[derive(Debug, Deserialize)]
struct RemoteSubmission {
    #[serde(alias = "youtubeUrl")]
    url: String,
}

pub fn router(service: Arc<VideoLens>) -> Router {
    let upload_limit = MAX_UPLOAD_BYTES as usize + MULTIPART_OVERHEAD;
    Router::new()
        .route(
            "/api/video/upload",
            post(upload_video).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/video/youtube", post(submit_remote))
        .route("/api/analysis", get(list_jobs))
        .route("/api/analysis/{id}", get(job_detail).delete(delete_job))
        .route("/api/analysis/{id}/download", get(download_report))
        .with_state(service)
}

async fn upload_video(
    State(service): State<Arc<VideoLens>>,
    Owner(owner): Owner,
    mut multipart: Multipart,
) -> ApiResult<Json<SubmissionResponse>> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let request = UploadRequest {
            original_name: field.file_name().unwrap_or_default().to_string(),
            content_type: field.content_type().map(str::to_string),
            declared_size: field
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok()),
        };
        let mut sink = service.begin_upload(&owner, request).await?;
        while let Some(chunk) = field.chunk().await? {
            sink.write_chunk(&chunk).await?;
        }
        let job = service.finish_upload(sink).await?;
        return Ok(Json(SubmissionResponse {
            analysis_id: job.id,
            message: "Video uploaded and processing started",
        }));
    }
    Err(ApiError::bad_request("No file uploaded"))
}

async fn submit_remote(
    State(service): State<Arc<VideoLens>>,
    Owner(owner): Owner,
    payload: Result<Json<RemoteSubmission>, JsonRejection>,
) -> ApiResult<Json<SubmissionResponse>> {
    let Json(payload) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let job = service.submit_remote(&owner, &payload.url).await?;
    Ok(Json(SubmissionResponse {
        analysis_id: job.id,
        message: "Remote video processing started",
    }))
}

async fn list_jobs(
    State(service): State<Arc<VideoLens>>,
    Owner(owner): Owner,
) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(service.list_jobs(&owner).await?))
}

async fn job_detail(
    State(service): State<Arc<VideoLens>>,
    Owner(owner): Owner,
    Path(id): Path<JobId>,
) -> ApiResult<Json<JobDetail>> {
    Ok(Json(service.job_detail(id, &owner).await?))
}

async fn delete_job(
    State(service): State<Arc<VideoLens>>,
    Owner(owner): Owner,
    Path(id): Path<JobId>,
) -> ApiResult<Json<serde_json::Value>> {
    service.delete_job(id, &owner).await?;
    Ok(Json(serde_json::json!({
        "message": "Analysis deleted successfully",
    })))
}

async fn download_report(
    State(service): State<Arc<VideoLens>>,
    Owner(owner): Owner,
    Path(id): Path<JobId>,
) -> ApiResult<Response> {
    let (job, path) = service.ensure_report(id, &owner).await?;
    let file = File::open(&path)
        .await
        .map_err(|err| ApiError::from(Error::io(&path, err)))?;

    let disposition = format!(
        "attachment; filename=\"{}_analysis.html\"",
        attachment_name(&job.file_name)
    );
    let disposition = HeaderValue::from_str(&disposition).map_err(|_| {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Invalid report file name")
    })?;

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

/// Strips characters that would break out of a quoted header parameter.
fn attachment_name(file_name: &str) -> String {
    file_name
        .chars()
        .map(|ch| match ch {
            '"' | '\\' | '/' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect()
}
