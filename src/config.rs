use std::{path::PathBuf, time::Duration};

use tracing::warn;

use crate::gate::{AdmissionMode, DEFAULT_THRESHOLD, DEFAULT_WINDOW, GateSettings};

pub const PROXY_VARIABLES: [&str; 3] = ["PROXY_URL_1", "PROXY_URL_2", "PROXY_URL_3"];

const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_YTDLP_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 250 * 1024 * 1024;
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
pub const MAX_WINDOW_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub proxies: Vec<String>,
    pub gate: GateSettings,
    pub admission_mode: AdmissionMode,
    pub max_concurrent_downloads: usize,
    pub ytdlp_bin: String,
    pub ffmpeg_bin: String,
    pub tool_timeout: Duration,
    pub transfer_dir: PathBuf,
    pub max_download_bytes: u64,
    pub allowed_origins: Vec<String>,
    pub resolve_link_titles: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source. Unparsable values
    /// fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| {
            lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string))
        };
        let number = |name: &str| -> Option<u64> {
            let raw = text(name)?;
            let parsed = raw.parse::<u64>().ok();
            if parsed.is_none() {
                warn!("ignoring {name}={raw:?}: not a non-negative integer");
            }
            parsed
        };

        let bind_addr = text("APP_ADDR")
            .or_else(|| {
                text("PORT")
                    .and_then(|port| port.parse::<u16>().ok())
                    .map(|port| format!("0.0.0.0:{port}"))
            })
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let proxies = PROXY_VARIABLES.iter().filter_map(|name| text(*name)).collect();

        let gate = GateSettings {
            window: number("RATE_LIMIT_WINDOW_SECS")
                .filter(|secs| *secs > 0)
                .map(|secs| {
                    if secs > MAX_WINDOW_SECONDS {
                        warn!("RATE_LIMIT_WINDOW_SECS={secs} is above {MAX_WINDOW_SECONDS}, capping it");
                    }
                    Duration::from_secs(secs.min(MAX_WINDOW_SECONDS))
                })
                .unwrap_or(DEFAULT_WINDOW),
            threshold: number("RATE_LIMIT_MAX_ATTEMPTS")
                .filter(|max| *max > 0)
                .map(|max| max as usize)
                .unwrap_or(DEFAULT_THRESHOLD),
        };

        let admission_mode = match text("ADMISSION_MODE") {
            Some(raw) => AdmissionMode::parse(&raw).unwrap_or_else(|| {
                warn!("unknown ADMISSION_MODE={raw:?}, using advisory");
                AdmissionMode::Advisory
            }),
            None => AdmissionMode::Advisory,
        };

        let allowed_origins = text("ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            bind_addr,
            proxies,
            gate,
            admission_mode,
            max_concurrent_downloads: number("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .map(|value| value as usize)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            ytdlp_bin: text("YTDLP_BIN").unwrap_or_else(|| "yt-dlp".to_string()),
            ffmpeg_bin: text("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
            tool_timeout: Duration::from_secs(
                number("YTDLP_TIMEOUT_SECS")
                    .filter(|secs| *secs > 0)
                    .unwrap_or(DEFAULT_YTDLP_TIMEOUT_SECONDS),
            ),
            transfer_dir: text("TRANSFER_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("temp_downloads")),
            max_download_bytes: number("MAX_DOWNLOAD_BYTES")
                .filter(|bytes| *bytes > 0)
                .unwrap_or(DEFAULT_MAX_DOWNLOAD_BYTES),
            allowed_origins,
            resolve_link_titles: text("LINKS_RESOLVE_TITLES")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(true),
        }
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
