use std::fmt;

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::ApiError;

const SUPPORTED_DOMAINS: [&str; 16] = [
    "youtube.com",
    "youtu.be",
    "m.youtube.com",
    "music.youtube.com",
    "youtube-nocookie.com",
    "x.com",
    "twitter.com",
    "facebook.com",
    "m.facebook.com",
    "fb.watch",
    "instagram.com",
    "bsky.app",
    "tiktok.com",
    "vm.tiktok.com",
    "vt.tiktok.com",
    "vimeo.com",
];

const YOUTUBE_ID_LEN: usize = 11;

/// Key used to bucket rate-limit history for a requested video.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    YouTube(String),
    Hashed(String),
}

impl Identifier {
    pub fn from_url(url: &Url) -> Self {
        if let Some(id) = youtube_video_id(url) {
            return Self::YouTube(id);
        }

        let mut normalized = url.clone();
        normalized.set_fragment(None);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_str().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self::Hashed(format!("url:{}", &digest[..32]))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::YouTube(id) | Self::Hashed(id) => id,
        }
    }

    pub fn youtube_id(&self) -> Option<&str> {
        match self {
            Self::YouTube(id) => Some(id),
            Self::Hashed(_) => None,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_request_url(input: &str) -> Result<Url, ApiError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request("Enter a video URL."));
    }

    let url = Url::parse(trimmed)
        .map_err(|_| ApiError::bad_request("The URL could not be parsed."))?;
    if !is_supported_url(&url) {
        return Err(ApiError::bad_request(
            "Unsupported URL. Use a YouTube, X, Facebook, Instagram, TikTok, Bluesky or Vimeo link.",
        ));
    }

    Ok(url)
}

pub fn is_supported_url(url: &Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }

    let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
        return false;
    };

    SUPPORTED_DOMAINS
        .iter()
        .any(|domain| is_domain_or_subdomain(&host, domain))
}

fn is_domain_or_subdomain(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn youtube_video_id(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();

    if is_domain_or_subdomain(&host, "youtu.be") {
        let candidate = url.path_segments()?.next()?;
        return valid_youtube_id(candidate);
    }

    if !is_domain_or_subdomain(&host, "youtube.com")
        && !is_domain_or_subdomain(&host, "youtube-nocookie.com")
    {
        return None;
    }

    if let Some((_, value)) = url.query_pairs().find(|(key, _)| key == "v") {
        return valid_youtube_id(&value);
    }

    let mut segments = url.path_segments()?;
    match segments.next()? {
        "shorts" | "embed" | "live" | "v" => valid_youtube_id(segments.next()?),
        _ => None,
    }
}

fn valid_youtube_id(candidate: &str) -> Option<String> {
    let valid = candidate.len() == YOUTUBE_ID_LEN
        && candidate
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || matches!(character, '-' | '_'));
    valid.then(|| candidate.to_string())
}
