use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{gate::RateLimited, transcode::TranscodeError, ytdlp::YtDlpError};

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, code: Option<&'static str>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
            retry_after_seconds: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, None)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, None)
    }

    pub fn bad_gateway(message: impl Into<String>, code: &'static str) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message, Some(code))
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message, Some("FILE_TOO_LARGE"))
    }

    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: format!(
                "Too many failed attempts for this video. Try again in {retry_after_seconds} seconds."
            ),
            code: Some("RATE_LIMIT_EXCEEDED"),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }
}

impl From<RateLimited> for ApiError {
    fn from(limited: RateLimited) -> Self {
        let seconds = limited.retry_after.as_secs_f64().ceil() as u64;
        Self::rate_limited(seconds.max(1))
    }
}

impl From<YtDlpError> for ApiError {
    fn from(error: YtDlpError) -> Self {
        match error {
            YtDlpError::NotInstalled { .. } | YtDlpError::Spawn(_) => Self::internal(error.to_string()),
            YtDlpError::TimedOut(_) => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                error.to_string(),
                Some("EXTRACTION_TIMEOUT"),
            ),
            YtDlpError::Failed(_) | YtDlpError::InvalidOutput(_) | YtDlpError::MissingOutput => {
                Self::bad_gateway(error.to_string(), "EXTRACTION_FAILED")
            }
            YtDlpError::Io(_) => Self::internal(error.to_string()),
        }
    }
}

impl From<TranscodeError> for ApiError {
    fn from(error: TranscodeError) -> Self {
        match error {
            TranscodeError::UnsupportedCodec(_) | TranscodeError::InvalidBitrate(_) => {
                Self::bad_request(error.to_string())
            }
            TranscodeError::NotInstalled { .. } | TranscodeError::Spawn(_) => {
                Self::internal(error.to_string())
            }
            TranscodeError::TimedOut(_) | TranscodeError::Failed(_) => {
                Self::bad_gateway(error.to_string(), "CONVERSION_FAILED")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
            code: self.code,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}
