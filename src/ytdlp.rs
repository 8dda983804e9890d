//! Thin wrapper over the `yt-dlp` command line tool.

use std::{
    cmp::Ordering,
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum YtDlpError {
    #[error("{binary} is not installed. Install it and restart the service.")]
    NotInstalled { binary: String },
    #[error("could not run yt-dlp: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("yt-dlp did not finish within {0} seconds")]
    TimedOut(u64),
    #[error("{0}")]
    Failed(String),
    #[error("yt-dlp returned metadata that could not be read: {0}")]
    InvalidOutput(String),
    #[error("the downloaded file could not be found")]
    MissingOutput,
    #[error("temporary file error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RawVideoInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    fps: Option<f32>,
    format_note: Option<String>,
    tbr: Option<f32>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    abr: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct VideoInfo {
    pub title: String,
    pub thumbnail: Option<String>,
    pub duration_seconds: Option<u64>,
    pub uploader: Option<String>,
    pub video_options: Vec<FormatOption>,
    pub audio_options: Vec<FormatOption>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct FormatOption {
    pub format_id: String,
    pub label: String,
    pub resolution: Option<String>,
    pub ext: String,
    pub has_audio: bool,
}

/// What to ask yt-dlp for with `-f`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Format { format_id: String, has_audio: bool },
    MaxHeight(u32),
    BestVideo,
    BestAudio,
}

impl Selector {
    pub fn as_arg(&self) -> String {
        match self {
            Self::Format {
                format_id,
                has_audio: true,
            } => format_id.clone(),
            Self::Format {
                format_id,
                has_audio: false,
            } => format!("{format_id}+bestaudio/best"),
            Self::MaxHeight(height) => {
                format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]")
            }
            Self::BestVideo => "bestvideo+bestaudio/best".to_string(),
            Self::BestAudio => "bestaudio/best".to_string(),
        }
    }
}

impl YtDlp {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub async fn fetch_info(&self, url: &Url, proxy: Option<&str>) -> Result<VideoInfo, YtDlpError> {
        let args = vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        let output = self.run(args, url, proxy).await?;
        parse_video_info(&output.stdout)
    }

    /// Downloads into `job_dir` and returns the path of the produced file.
    pub async fn download(
        &self,
        job_dir: &Path,
        url: &Url,
        selector: &Selector,
        proxy: Option<&str>,
    ) -> Result<PathBuf, YtDlpError> {
        let output_template = format!("{}/%(title).140B-%(id)s.%(ext)s", job_dir.to_string_lossy());
        let args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--newline".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "-o".to_string(),
            output_template,
            "-f".to_string(),
            selector.as_arg(),
        ];

        let output = self.run(args, url, proxy).await?;
        let printed_path = extract_printed_path(&output.stdout);
        resolve_downloaded_file(job_dir, printed_path.as_deref()).await
    }

    async fn run(
        &self,
        mut args: Vec<String>,
        url: &Url,
        proxy: Option<&str>,
    ) -> Result<std::process::Output, YtDlpError> {
        if let Some(proxy) = proxy {
            args.push("--proxy".to_string());
            args.push(proxy.to_string());
        }
        args.push(url.to_string());

        debug!(binary = %self.binary, ?args, "running yt-dlp");
        let command_future = Command::new(&self.binary).args(&args).kill_on_drop(true).output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| YtDlpError::TimedOut(self.timeout.as_secs()))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    YtDlpError::NotInstalled {
                        binary: self.binary.clone(),
                    }
                } else {
                    YtDlpError::Spawn(error)
                }
            })?;

        if !output.status.success() {
            return Err(YtDlpError::Failed(run_error_message(&output.stderr)));
        }

        Ok(output)
    }
}

fn parse_video_info(stdout: &[u8]) -> Result<VideoInfo, YtDlpError> {
    let raw: RawVideoInfo =
        serde_json::from_slice(stdout).map_err(|error| YtDlpError::InvalidOutput(error.to_string()))?;

    let mut video_options = build_video_options(&raw.formats);
    let mut audio_options = build_audio_options(&raw.formats);

    if video_options.is_empty() {
        video_options.push(FormatOption {
            format_id: Selector::BestVideo.as_arg(),
            label: "Best available quality".to_string(),
            resolution: Some("Auto".to_string()),
            ext: "mp4".to_string(),
            has_audio: true,
        });
    }
    if audio_options.is_empty() {
        audio_options.push(FormatOption {
            format_id: "bestaudio".to_string(),
            label: "Best available audio".to_string(),
            resolution: None,
            ext: "m4a".to_string(),
            has_audio: true,
        });
    }

    Ok(VideoInfo {
        title: raw
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        thumbnail: raw.thumbnail,
        duration_seconds: raw
            .duration
            .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
            .map(|seconds| seconds.round() as u64),
        uploader: raw.uploader,
        video_options,
        audio_options,
    })
}

fn build_video_options(formats: &[RawFormat]) -> Vec<FormatOption> {
    let ranked = formats.iter().filter(|item| has_video(item)).map(|item| {
        let ext = item.ext.as_deref().unwrap_or("mp4");
        let resolution = item
            .height
            .map(|height| format!("{height}p"))
            .or_else(|| item.format_note.clone())
            .unwrap_or_else(|| "Video".to_string());
        let has_audio = has_audio(item);
        let label = [
            resolution.clone(),
            ext.to_uppercase(),
            rate_label(item.fps, "fps"),
            size_label(item),
            if has_audio { "with audio" } else { "no audio" }.to_string(),
        ]
        .join(" · ");

        let rank = [
            item.height.unwrap_or_default() as f32,
            item.fps.unwrap_or_default(),
            item.tbr.unwrap_or_default(),
        ];
        (rank, FormatOption {
            format_id: item.format_id.clone(),
            label,
            resolution: Some(resolution),
            ext: ext.to_string(),
            has_audio,
        })
    });

    best_first(ranked)
}

fn build_audio_options(formats: &[RawFormat]) -> Vec<FormatOption> {
    let ranked = formats
        .iter()
        .filter(|item| !has_video(item) && has_audio(item))
        .map(|item| {
            let ext = item.ext.as_deref().unwrap_or("m4a");
            let label = [
                "Audio".to_string(),
                ext.to_uppercase(),
                rate_label(item.abr.or(item.tbr), "kbps"),
                size_label(item),
            ]
            .join(" · ");

            let rank = [item.abr.unwrap_or_default(), item.tbr.unwrap_or_default()];
            (rank, FormatOption {
                format_id: item.format_id.clone(),
                label,
                resolution: None,
                ext: ext.to_string(),
                has_audio: true,
            })
        });

    best_first(ranked)
}

/// Sorts by descending rank and keeps the first option per format id.
fn best_first<const N: usize>(ranked: impl Iterator<Item = ([f32; N], FormatOption)>) -> Vec<FormatOption> {
    let mut ranked: Vec<_> = ranked.collect();
    ranked.sort_by(|(a, _), (b, _)| b.partial_cmp(a).unwrap_or(Ordering::Equal));

    let mut seen_ids = HashSet::new();
    ranked
        .into_iter()
        .map(|(_, option)| option)
        .filter(|option| seen_ids.insert(option.format_id.clone()))
        .collect()
}

fn has_video(format: &RawFormat) -> bool {
    matches!(format.vcodec.as_deref(), Some(value) if value != "none")
}

fn has_audio(format: &RawFormat) -> bool {
    matches!(format.acodec.as_deref(), Some(value) if value != "none")
}

fn rate_label(value: Option<f32>, unit: &str) -> String {
    match value.filter(|rate| *rate > 0.0) {
        Some(rate) => format!("{} {unit}", rate.round() as u32),
        None => format!("variable {unit}"),
    }
}

fn size_label(format: &RawFormat) -> String {
    let Some(bytes) = format.filesize.or(format.filesize_approx) else {
        return "variable size".to_string();
    };
    let mib = bytes / 1_048_576.0;
    if mib > 1024.0 {
        format!("{:.2} GB", mib / 1024.0)
    } else {
        format!("{mib:.1} MB")
    }
}

/// Known yt-dlp failure texts and the message shown instead.
const KNOWN_FAILURES: [(&str, &str); 3] = [
    ("unsupported url", "Unsupported or invalid URL for download."),
    (
        "sign in to confirm",
        "The site is asking for a sign-in to confirm this is not a bot. Try again later.",
    ),
    ("nonetype", "Could not read metadata for this URL. Try again later."),
];

fn run_error_message(stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let Some(last_line) = stderr.lines().map(str::trim).rfind(|line| !line.is_empty()) else {
        return "yt-dlp could not complete the operation".to_string();
    };

    let lower = last_line.to_ascii_lowercase();
    KNOWN_FAILURES
        .iter()
        .find(|(needle, _)| lower.contains(*needle))
        .map_or_else(|| last_line.to_string(), |(_, message)| (*message).to_string())
}

fn extract_printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

async fn resolve_downloaded_file(job_dir: &Path, printed_path: Option<&str>) -> Result<PathBuf, YtDlpError> {
    let canonical_job_dir = tokio::fs::canonicalize(job_dir).await?;

    if let Some(path_value) = printed_path {
        for candidate in [PathBuf::from(path_value), job_dir.join(path_value)] {
            if let Some(valid_path) = resolve_candidate(&canonical_job_dir, &candidate).await? {
                return Ok(valid_path);
            }
        }
    }

    let mut entries = tokio::fs::read_dir(job_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(valid_path) = resolve_candidate(&canonical_job_dir, &entry.path()).await? {
            return Ok(valid_path);
        }
    }

    Err(YtDlpError::MissingOutput)
}

async fn resolve_candidate(canonical_job_dir: &Path, candidate: &Path) -> Result<Option<PathBuf>, YtDlpError> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await?;
    if !canonical.starts_with(canonical_job_dir) {
        warn!("refusing file outside the job directory: {:?}", canonical);
        return Ok(None);
    }

    Ok(Some(canonical))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_INFO: &str = r#"{
        "title": "Sample clip",
        "thumbnail": "https://i.ytimg.com/vi/x/hq.jpg",
        "duration": 212.4,
        "uploader": "Someone",
        "formats": [
            {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "abr": 129.5, "filesize": 3400000},
            {"format_id": "251", "ext": "webm", "vcodec": "none", "acodec": "opus", "abr": 160.0},
            {"format_id": "137", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "height": 1080, "fps": 30.0, "tbr": 4000.0},
            {"format_id": "18", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a", "height": 360, "fps": 30.0},
            {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none"}
        ]
    }"#;

    #[test]
    fn parses_and_sorts_formats() {
        let info = parse_video_info(SAMPLE_INFO.as_bytes()).unwrap();
        assert_eq!(info.title, "Sample clip");
        assert_eq!(info.duration_seconds, Some(212));

        let video_ids: Vec<_> = info.video_options.iter().map(|o| o.format_id.as_str()).collect();
        assert_eq!(video_ids, ["137", "18"]);
        assert!(!info.video_options[0].has_audio);
        assert!(info.video_options[1].label.contains("with audio"));

        let audio_ids: Vec<_> = info.audio_options.iter().map(|o| o.format_id.as_str()).collect();
        assert_eq!(audio_ids, ["251", "140"]);
        assert!(info.audio_options[1].label.contains("130 kbps"));
    }

    #[test]
    fn labels_describe_rate_and_size() {
        let info = parse_video_info(SAMPLE_INFO.as_bytes()).unwrap();
        assert_eq!(
            info.video_options[0].label,
            "1080p · MP4 · 30 fps · variable size · no audio"
        );
        assert_eq!(info.audio_options[1].label, "Audio · M4A · 130 kbps · 3.2 MB");
    }

    #[test]
    fn empty_format_list_gets_automatic_options() {
        let info = parse_video_info(br#"{"title": "  "}"#).unwrap();
        assert_eq!(info.title, "Untitled");
        assert_eq!(info.video_options[0].format_id, "bestvideo+bestaudio/best");
        assert_eq!(info.audio_options[0].format_id, "bestaudio");
    }

    #[test]
    fn garbage_metadata_is_invalid_output() {
        assert!(matches!(
            parse_video_info(b"not json"),
            Err(YtDlpError::InvalidOutput(_))
        ));
    }

    #[test]
    fn selector_arguments() {
        let with_audio = Selector::Format {
            format_id: "18".to_string(),
            has_audio: true,
        };
        let video_only = Selector::Format {
            format_id: "137".to_string(),
            has_audio: false,
        };
        assert_eq!(with_audio.as_arg(), "18");
        assert_eq!(video_only.as_arg(), "137+bestaudio/best");
        assert_eq!(
            Selector::MaxHeight(720).as_arg(),
            "bestvideo[height<=720]+bestaudio/best[height<=720]"
        );
    }

    #[test]
    fn error_message_uses_last_stderr_line() {
        let stderr = b"WARNING: something\nERROR: [youtube] abc: Video unavailable\n\n";
        assert_eq!(run_error_message(stderr), "ERROR: [youtube] abc: Video unavailable");
        assert_eq!(
            run_error_message(b"ERROR: Unsupported URL: https://x"),
            "Unsupported or invalid URL for download."
        );
        assert_eq!(run_error_message(b""), "yt-dlp could not complete the operation");
    }

    #[tokio::test]
    async fn resolves_printed_path_inside_job_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip-abc.mp4");
        tokio::fs::write(&file, b"data").await.unwrap();

        let printed = extract_printed_path(format!("[info] x\n{}\n", file.display()).as_bytes());
        let resolved = resolve_downloaded_file(dir.path(), printed.as_deref()).await.unwrap();
        assert_eq!(resolved, tokio::fs::canonicalize(&file).await.unwrap());
    }

    #[tokio::test]
    async fn ignores_printed_path_outside_job_dir() {
        let job = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let outside = other.path().join("evil.mp4");
        tokio::fs::write(&outside, b"x").await.unwrap();

        let result = resolve_downloaded_file(job.path(), outside.to_str()).await;
        assert!(matches!(result, Err(YtDlpError::MissingOutput)));
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let tool = YtDlp::new("definitely-not-a-real-yt-dlp-binary", Duration::from_secs(5));
        let url = Url::parse("https://youtu.be/dQw4w9WgXcQ").unwrap();
        let result = tool.fetch_info(&url, Some("http://127.0.0.1:1")).await;
        assert!(matches!(result, Err(YtDlpError::NotInstalled { .. })));
    }
}
