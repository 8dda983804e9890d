use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;

pub const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";
pub const JOB_RETENTION: Duration = Duration::from_secs(20 * 60);
pub const STALE_JOB_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// Temporary directory owning the tool output of one request.
#[derive(Debug)]
pub struct JobDir {
    path: PathBuf,
}

impl JobDir {
    pub async fn create(transfer_dir: &Path) -> Result<Self, ApiError> {
        let path = transfer_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&path).await.map_err(|error| {
            ApiError::internal(format!("Could not prepare the temporary download folder: {error}"))
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn discard(self) {
        remove_job_dir(&self.path).await;
    }

    /// Keeps the folder around long enough for the body to stream out.
    pub fn retain_then_remove(self, retention: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            remove_job_dir(&self.path).await;
        });
    }
}

async fn remove_job_dir(path: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(path).await
        && error.kind() != ErrorKind::NotFound
    {
        info!("Could not clean temporary folder {:?}: {error}", path);
    }
}

pub async fn file_response(path: &Path, max_bytes: u64) -> Result<Response, ApiError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| "download.bin".to_string());

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|error| ApiError::internal(format!("Could not read the temporary file: {error}")))?;
    if metadata.len() > max_bytes {
        let max_mb = max_bytes / 1_048_576;
        return Err(ApiError::payload_too_large(format!(
            "The file exceeds the {max_mb} MB limit."
        )));
    }

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|error| ApiError::internal(format!("Could not open the temporary file: {error}")))?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(&filename))
            .map_err(|_| ApiError::internal("Could not build the file name header."))?,
    );

    Ok((headers, body).into_response())
}

/// Removes anything under `transfer_dir` older than `max_age`.
pub async fn cleanup_stale_jobs(transfer_dir: &Path, max_age: Duration) {
    let mut entries = match tokio::fs::read_dir(transfer_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open transfer folder for cleanup: {error}");
            }
            return;
        }
    };

    let now = std::time::SystemTime::now();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate transfer folder for cleanup: {error}");
                break;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        if let Err(error) = result
            && error.kind() != ErrorKind::NotFound
        {
            warn!("Could not remove stale transfer entry {:?}: {error}", path);
        }
    }
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitize_ascii_filename(filename),
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}
