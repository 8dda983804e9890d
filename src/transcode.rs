//! Audio conversion through `ffmpeg`.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::debug;

pub const DEFAULT_BITRATE_KBPS: u32 = 192;
const MIN_BITRATE_KBPS: u32 = 32;
const MAX_BITRATE_KBPS: u32 = 320;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("unsupported codec {0:?}; use mp3, aac, opus, flac or wav")]
    UnsupportedCodec(String),
    #[error("bitrate {0} kbps is outside the 32-320 kbps range")]
    InvalidBitrate(u32),
    #[error("{binary} is not installed. Install it and restart the service.")]
    NotInstalled { binary: String },
    #[error("could not run ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("conversion did not finish within {0} seconds")]
    TimedOut(u64),
    #[error("conversion failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioCodec {
    #[default]
    Mp3,
    Aac,
    Opus,
    Flac,
    Wav,
}

impl AudioCodec {
    pub fn parse(value: &str) -> Result<Self, TranscodeError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "aac" | "m4a" => Ok(Self::Aac),
            "opus" => Ok(Self::Opus),
            "flac" => Ok(Self::Flac),
            "wav" => Ok(Self::Wav),
            other => Err(TranscodeError::UnsupportedCodec(other.to_string())),
        }
    }

    fn encoder(self) -> &'static str {
        match self {
            Self::Mp3 => "libmp3lame",
            Self::Aac => "aac",
            Self::Opus => "libopus",
            Self::Flac => "flac",
            Self::Wav => "pcm_s16le",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "m4a",
            Self::Opus => "opus",
            Self::Flac => "flac",
            Self::Wav => "wav",
        }
    }

    fn is_lossless(self) -> bool {
        matches!(self, Self::Flac | Self::Wav)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTarget {
    pub codec: AudioCodec,
    pub bitrate_kbps: u32,
}

impl AudioTarget {
    pub fn new(codec: AudioCodec, bitrate_kbps: Option<u32>) -> Result<Self, TranscodeError> {
        let bitrate_kbps = bitrate_kbps.unwrap_or(DEFAULT_BITRATE_KBPS);
        if !codec.is_lossless() && !(MIN_BITRATE_KBPS..=MAX_BITRATE_KBPS).contains(&bitrate_kbps) {
            return Err(TranscodeError::InvalidBitrate(bitrate_kbps));
        }
        Ok(Self { codec, bitrate_kbps })
    }

    fn ffmpeg_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-vn".to_string(),
            "-c:a".to_string(),
            self.codec.encoder().to_string(),
        ];
        if !self.codec.is_lossless() {
            args.push("-b:a".to_string());
            args.push(format!("{}k", self.bitrate_kbps));
        }
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

#[derive(Debug, Clone)]
pub struct Transcoder {
    binary: String,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Writes `<input stem>.<ext>` next to the input and returns its path.
    pub async fn convert(&self, input: &Path, target: &AudioTarget) -> Result<PathBuf, TranscodeError> {
        let output = output_path_for(input, target.codec);
        let args = target.ffmpeg_args(input, &output);
        debug!(binary = %self.binary, ?args, "running ffmpeg");

        let command_future = Command::new(&self.binary).args(&args).kill_on_drop(true).output();
        let result = timeout(self.timeout, command_future)
            .await
            .map_err(|_| TranscodeError::TimedOut(self.timeout.as_secs()))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    TranscodeError::NotInstalled {
                        binary: self.binary.clone(),
                    }
                } else {
                    TranscodeError::Spawn(error)
                }
            })?;

        if !result.status.success() {
            let message = String::from_utf8_lossy(&result.stderr)
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .next_back()
                .unwrap_or("ffmpeg exited with an error")
                .to_string();
            return Err(TranscodeError::Failed(message));
        }

        Ok(output)
    }
}

fn output_path_for(input: &Path, codec: AudioCodec) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("audio");
    let candidate = input.with_file_name(format!("{stem}.{}", codec.extension()));
    if candidate == input {
        input.with_file_name(format!("{stem}-converted.{}", codec.extension()))
    } else {
        candidate
    }
}
