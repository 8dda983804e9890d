use std::path::PathBuf;

use axum::{Json, extract::State, response::Response};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{info, warn};
use url::Url;

use super::AppState;
use crate::{
    config::non_empty,
    error::ApiError,
    gate::Admission,
    identifier::{Identifier, parse_request_url},
    links::{DownloadLink, build_links, resolve_title},
    transcode::{AudioCodec, AudioTarget},
    transfer::{JOB_RETENTION, JobDir, STALE_JOB_AGE, cleanup_stale_jobs, file_response},
    ytdlp::{Selector, VideoInfo},
};

#[derive(Debug, Deserialize)]
pub struct UrlRequest {
    url: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    url: String,
    format_id: Option<String>,
    has_audio: Option<bool>,
    max_height: Option<u32>,
    #[serde(default)]
    audio_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConvertRequest {
    url: String,
    codec: Option<String>,
    bitrate_kbps: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    success: bool,
    identifier: String,
    #[serde(flatten)]
    info: VideoInfo,
}

#[derive(Debug, Serialize)]
pub struct LinksResponse {
    success: bool,
    identifier: String,
    title: Option<String>,
    links: Vec<DownloadLink>,
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "proxies": state.gate.proxy_pool().len(),
        "tracked_identifiers": state.gate.tracked_identifiers(),
    }))
}

pub async fn fetch_info(
    State(state): State<AppState>,
    Json(payload): Json<UrlRequest>,
) -> Result<Json<InfoResponse>, ApiError> {
    let url = parse_request_url(&payload.url)?;
    let identifier = Identifier::from_url(&url);

    let admission = state
        .gate
        .admit(identifier.as_str(), state.config.admission_mode)?;
    let proxy = state.gate.next_proxy();

    match state.ytdlp.fetch_info(&url, proxy).await {
        Ok(info) => {
            admission.succeeded();
            Ok(Json(InfoResponse {
                success: true,
                identifier: identifier.to_string(),
                info,
            }))
        }
        Err(error) => {
            warn!(%identifier, ?proxy, "metadata lookup failed: {error}");
            admission.failed();
            Err(error.into())
        }
    }
}

pub async fn download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Response, ApiError> {
    let url = parse_request_url(&payload.url)?;
    let identifier = Identifier::from_url(&url);
    let selector = selector_for(&payload);

    let (admission, _permit, job) = admit_job(&state, &identifier).await?;

    let path = match gated_download(&state, admission, &url, &identifier, &selector, &job).await {
        Ok(path) => path,
        Err(error) => {
            job.discard().await;
            return Err(error);
        }
    };

    respond_with_file(&state, job, path).await
}

pub async fn convert(
    State(state): State<AppState>,
    Json(payload): Json<ConvertRequest>,
) -> Result<Response, ApiError> {
    let url = parse_request_url(&payload.url)?;
    let identifier = Identifier::from_url(&url);
    let codec = payload
        .codec
        .as_deref()
        .and_then(non_empty)
        .map(AudioCodec::parse)
        .transpose()?
        .unwrap_or_default();
    let target = AudioTarget::new(codec, payload.bitrate_kbps)?;

    let (admission, _permit, job) = admit_job(&state, &identifier).await?;

    let converted = async {
        let source =
            gated_download(&state, admission, &url, &identifier, &Selector::BestAudio, &job).await?;
        let output = state.transcoder.convert(&source, &target).await?;
        info!(%identifier, codec = ?target.codec, bitrate_kbps = target.bitrate_kbps, "converted audio");
        Ok::<_, ApiError>(output)
    }
    .await;

    match converted {
        Ok(path) => respond_with_file(&state, job, path).await,
        Err(error) => {
            job.discard().await;
            Err(error)
        }
    }
}

pub async fn links(
    State(state): State<AppState>,
    Json(payload): Json<UrlRequest>,
) -> Result<Json<LinksResponse>, ApiError> {
    let url = parse_request_url(&payload.url)?;
    let identifier = Identifier::from_url(&url);

    let title = if state.config.resolve_link_titles {
        resolve_title(&state.http_client, &identifier).await
    } else {
        None
    };

    Ok(Json(LinksResponse {
        success: true,
        identifier: identifier.to_string(),
        title,
        links: build_links(&url, &identifier),
    }))
}

/// Runs the extraction tool for an admitted request. Only extraction
/// failures count against the identifier.
async fn gated_download(
    state: &AppState,
    admission: Admission<'_>,
    url: &Url,
    identifier: &Identifier,
    selector: &Selector,
    job: &JobDir,
) -> Result<PathBuf, ApiError> {
    let proxy = state.gate.next_proxy();

    match state.ytdlp.download(job.path(), url, selector, proxy).await {
        Ok(path) => {
            admission.succeeded();
            info!(%identifier, ?proxy, "download finished");
            Ok(path)
        }
        Err(error) => {
            warn!(%identifier, ?proxy, "download failed: {error}");
            admission.failed();
            Err(error.into())
        }
    }
}

/// Asks the gate first so a throttled identifier never waits for a download
/// slot or touches the transfer folder.
async fn admit_job<'a>(
    state: &'a AppState,
    identifier: &Identifier,
) -> Result<(Admission<'a>, OwnedSemaphorePermit, JobDir), ApiError> {
    let admission = state
        .gate
        .admit(identifier.as_str(), state.config.admission_mode)?;

    match prepare_job(state).await {
        Ok((permit, job)) => Ok((admission, permit, job)),
        Err(error) => {
            admission.withdrawn();
            Err(error)
        }
    }
}

async fn prepare_job(state: &AppState) -> Result<(OwnedSemaphorePermit, JobDir), ApiError> {
    let permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Could not reserve download capacity."))?;
    cleanup_stale_jobs(&state.config.transfer_dir, STALE_JOB_AGE).await;
    let job = JobDir::create(&state.config.transfer_dir).await?;
    Ok((permit, job))
}

async fn respond_with_file(state: &AppState, job: JobDir, path: PathBuf) -> Result<Response, ApiError> {
    match file_response(&path, state.config.max_download_bytes).await {
        Ok(response) => {
            job.retain_then_remove(JOB_RETENTION);
            Ok(response)
        }
        Err(error) => {
            job.discard().await;
            Err(error)
        }
    }
}

fn selector_for(payload: &DownloadRequest) -> Selector {
    let format_id = payload
        .format_id
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string);

    match (format_id, payload.audio_only) {
        (Some(format_id), audio_only) => Selector::Format {
            format_id,
            has_audio: audio_only || payload.has_audio.unwrap_or(false),
        },
        (None, true) => Selector::BestAudio,
        (None, false) => payload
            .max_height
            .filter(|height| *height > 0)
            .map(Selector::MaxHeight)
            .unwrap_or(Selector::BestVideo),
    }
}
