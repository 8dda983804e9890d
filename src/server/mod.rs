mod handlers;

use std::{collections::HashSet, sync::Arc};

use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION},
    routing::{get, post},
};
use tokio::sync::Semaphore;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::Config,
    error::ApiError,
    gate::AdmissionGate,
    transcode::Transcoder,
    transfer::DOWNLOAD_FILENAME_HEADER,
    ytdlp::YtDlp,
};

const HTTP_CLIENT_TIMEOUT_SECONDS: u64 = 10;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gate: Arc<AdmissionGate>,
    pub ytdlp: YtDlp,
    pub transcoder: Transcoder,
    pub download_semaphore: Arc<Semaphore>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn with_gate(config: Config, gate: Arc<AdmissionGate>) -> Result<Self, ApiError> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_CLIENT_TIMEOUT_SECONDS))
            .build()
            .map_err(|error| ApiError::internal(format!("Could not build HTTP client: {error}")))?;

        Ok(Self {
            ytdlp: YtDlp::new(config.ytdlp_bin.clone(), config.tool_timeout),
            transcoder: Transcoder::new(config.ffmpeg_bin.clone(), config.tool_timeout),
            download_semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            config: Arc::new(config),
            gate,
            http_client,
        })
    }
}

pub fn create_router(state: AppState) -> Result<Router, ApiError> {
    let cors = build_cors_layer(&state.config.allowed_origins)?;

    Ok(Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/info", post(handlers::fetch_info))
        .route("/api/download", post(handlers::download))
        .route("/api/convert", post(handlers::convert))
        .route("/api/links", post(handlers::links))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

const DEV_ORIGINS: [&str; 2] = ["http://127.0.0.1:5173", "http://localhost:5173"];

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Falling back to development origins.");
    }
    let origins: Vec<&str> = if configured.is_empty() {
        DEV_ORIGINS.to_vec()
    } else {
        configured.iter().map(String::as_str).collect()
    };

    let mut allowed = HashSet::with_capacity(origins.len());
    for origin in origins {
        let normalized = normalize_origin(origin).ok_or_else(|| {
            ApiError::internal(format!(
                "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
            ))
        })?;
        allowed.insert(normalized);
    }
    info!(origins = ?allowed, "CORS allow-list loaded");

    let allowed = Arc::new(allowed);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let permitted = origin
            .to_str()
            .ok()
            .and_then(normalize_origin)
            .is_some_and(|value| allowed.contains(&value));
        debug!(?origin, permitted, "CORS origin check");
        permitted
    });

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ]))
}

/// Reduces an http(s) origin to `scheme://host[:port]`. `Url` already
/// lowercases the host and drops default ports; anything carrying a path,
/// query or fragment is rejected.
fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let bare = parsed.path() == "/" && parsed.query().is_none() && parsed.fragment().is_none();
    let web = matches!(parsed.scheme(), "http" | "https");

    (bare && web && parsed.has_host()).then(|| parsed.origin().ascii_serialization())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{
        body::Body,
        http::{Request, StatusCode, header::RETRY_AFTER},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::gate::{GateSettings, tests::ManualClock};

    fn test_config(transfer_dir: &std::path::Path, extra: &[(&str, &str)]) -> Config {
        let mut vars: HashMap<String, String> = HashMap::from([
            ("YTDLP_BIN".to_string(), "ytgate-test-missing-yt-dlp".to_string()),
            ("FFMPEG_BIN".to_string(), "ytgate-test-missing-ffmpeg".to_string()),
            ("TRANSFER_DIR".to_string(), transfer_dir.display().to_string()),
            ("LINKS_RESOLVE_TITLES".to_string(), "false".to_string()),
        ]);
        for (key, value) in extra {
            vars.insert(key.to_string(), value.to_string());
        }
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    fn setup_state(extra: &[(&str, &str)]) -> (AppState, Arc<AdmissionGate>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), extra);
        let gate = Arc::new(AdmissionGate::with_clock(
            GateSettings::default(),
            &config.proxies,
            ManualClock::at_millis(0),
        ));
        let state = AppState::with_gate(config, gate.clone()).unwrap();
        (state, gate, dir)
    }

    fn setup(extra: &[(&str, &str)]) -> (Router, Arc<AdmissionGate>, tempfile::TempDir) {
        let (state, gate, dir) = setup_state(extra);
        (create_router(state).unwrap(), gate, dir)
    }

    /// Stand-in for yt-dlp: appends its arguments to `calls.log`, writes
    /// `clip.mp4` into the job directory and prints its path.
    #[cfg(unix)]
    fn fake_ytdlp(dir: &std::path::Path) -> (String, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let script = dir.join("yt-dlp");
        let body = format!(
            r#"#!/bin/sh
echo "$@" >> '{log}'
out=""
prev=""
for arg in "$@"; do
    if [ "$prev" = "-o" ]; then out="$arg"; fi
    prev="$arg"
done
job=$(dirname "$out")
printf 'media' > "$job/clip.mp4"
echo "$job/clip.mp4"
"#,
            log = log.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script.display().to_string(), log)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_pool_size() {
        let (app, _gate, _dir) = setup(&[("PROXY_URL_1", "http://p1:8080"), ("PROXY_URL_3", "http://p3:8080")]);

        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["proxies"], 2);
        assert_eq!(json["tracked_identifiers"], 0);
    }

    #[tokio::test]
    async fn test_info_rejects_unsupported_url() {
        let (app, gate, _dir) = setup(&[]);

        let response = app
            .oneshot(post_json("/api/info", serde_json::json!({"url": "https://example.com/v"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("Unsupported"));
        assert_eq!(gate.tracked_identifiers(), 0);
    }

    #[tokio::test]
    async fn test_info_refused_when_rate_limited() {
        let (app, gate, _dir) = setup(&[]);
        for _ in 0..5 {
            gate.record_attempt("dQw4w9WgXcQ");
        }

        let response = app
            .oneshot(post_json(
                "/api/info",
                serde_json::json!({"url": "https://youtu.be/dQw4w9WgXcQ"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "60");
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "RATE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn test_failed_extractions_throttle_identifier() {
        let (app, gate, _dir) = setup(&[("PROXY_URL_1", "http://p1:8080"), ("PROXY_URL_2", "http://p2:8080")]);
        let request = || {
            post_json(
                "/api/download",
                serde_json::json!({"url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ"}),
            )
        };

        for _ in 0..5 {
            let response = app.clone().oneshot(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body_json(response).await["success"], false);
        }
        assert!(gate.is_rate_limited("dQw4w9WgXcQ"));

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // Five gated calls advanced the two-entry rotation five times.
        assert_eq!(gate.next_proxy(), Some("http://p1:8080"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_downloads_use_rotated_proxy_and_successes_never_count() {
        let tools = tempfile::tempdir().unwrap();
        let (ytdlp, log) = fake_ytdlp(tools.path());
        let (app, gate, _dir) = setup(&[
            ("YTDLP_BIN", ytdlp.as_str()),
            ("PROXY_URL_1", "http://p1:8080"),
            ("PROXY_URL_2", "http://p2:8080"),
        ]);

        for _ in 0..6 {
            let response = app
                .clone()
                .oneshot(post_json(
                    "/api/download",
                    serde_json::json!({"url": "https://youtu.be/dQw4w9WgXcQ"}),
                ))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[DOWNLOAD_FILENAME_HEADER], "clip.mp4");
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            assert_eq!(&body[..], b"media");
        }
        assert!(!gate.is_rate_limited("dQw4w9WgXcQ"));

        let calls = std::fs::read_to_string(&log).unwrap();
        let proxies: Vec<_> = calls
            .lines()
            .map(|line| {
                line.split("--proxy ")
                    .nth(1)
                    .and_then(|rest| rest.split_whitespace().next())
                    .unwrap()
            })
            .collect();
        assert_eq!(
            proxies,
            [
                "http://p2:8080",
                "http://p1:8080",
                "http://p2:8080",
                "http://p1:8080",
                "http://p2:8080",
                "http://p1:8080",
            ]
        );
    }

    #[tokio::test]
    async fn test_throttled_requests_skip_download_slot_and_job_dir() {
        let (state, gate, dir) = setup_state(&[("MAX_CONCURRENT_DOWNLOADS", "1")]);
        let semaphore = state.download_semaphore.clone();
        let app = create_router(state).unwrap();
        for _ in 0..5 {
            gate.record_attempt("dQw4w9WgXcQ");
        }
        let _busy = semaphore.acquire_owned().await.unwrap();

        for uri in ["/api/download", "/api/convert"] {
            let request = post_json(uri, serde_json::json!({"url": "https://youtu.be/dQw4w9WgXcQ"}));
            let response = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                app.clone().oneshot(request),
            )
            .await
            .expect("a throttled request should not wait for a download slot")
            .unwrap();

            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_reserve_mode_counts_failures_once() {
        let (app, gate, _dir) = setup(&[("ADMISSION_MODE", "reserve")]);

        let response = app
            .oneshot(post_json(
                "/api/info",
                serde_json::json!({"url": "https://youtu.be/dQw4w9WgXcQ"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        for _ in 0..3 {
            gate.record_attempt("dQw4w9WgXcQ");
        }
        assert!(!gate.is_rate_limited("dQw4w9WgXcQ"));
        gate.record_attempt("dQw4w9WgXcQ");
        assert!(gate.is_rate_limited("dQw4w9WgXcQ"));
    }

    #[tokio::test]
    async fn test_convert_rejects_bad_codec_without_counting() {
        let (app, gate, _dir) = setup(&[]);

        let response = app
            .oneshot(post_json(
                "/api/convert",
                serde_json::json!({"url": "https://youtu.be/dQw4w9WgXcQ", "codec": "wma"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(gate.tracked_identifiers(), 0);
    }

    #[tokio::test]
    async fn test_links_for_youtube_video() {
        let (app, gate, _dir) = setup(&[]);

        let response = app
            .oneshot(post_json(
                "/api/links",
                serde_json::json!({"url": "https://www.youtube.com/shorts/dQw4w9WgXcQ"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["identifier"], "dQw4w9WgXcQ");
        assert!(json["title"].is_null());
        assert_eq!(json["links"].as_array().unwrap().len(), 5);
        assert_eq!(gate.tracked_identifiers(), 0);
    }

    #[test]
    fn test_origin_normalization() {
        assert_eq!(
            normalize_origin("HTTPS://Example.com:443"),
            Some("https://example.com".to_string())
        );
        assert_eq!(
            normalize_origin("http://localhost:5173"),
            Some("http://localhost:5173".to_string())
        );
        assert_eq!(normalize_origin("https://example.com/app"), None);
        assert_eq!(normalize_origin("ftp://example.com"), None);
        assert!(build_cors_layer(&["not an origin".to_string()]).is_err());
    }
}
