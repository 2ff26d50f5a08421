mod avc;
mod process;
mod request;
mod vp9;

use std::{fmt, path::Path, str::FromStr};

use thiserror::Error;

use avc::LibX264;
use vp9::LibVpxVp9;

// re-export from process and request
pub use process::*;
pub use request::*;

/// Output container requested by the caller.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub enum OutputFormat {
    #[default]
    Mp4,
    Webm,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
        }
    }

    pub fn content_type(&self) -> String {
        format!("video/{}", self.as_str())
    }

    fn transcoder(&self) -> &'static dyn Transcoder {
        match self {
            Self::Mp4 => &LibX264,
            Self::Webm => &LibVpxVp9,
        }
    }
}

/// Compression/speed trade-off preset.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub enum QualityTier {
    Low,
    #[default]
    Medium,
    High,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// x264-style flags for this tier, in the order they are passed.
    pub fn flags(&self) -> &'static [&'static str] {
        match self {
            Self::Low => QUALITY_PRESETS[0],
            Self::Medium => QUALITY_PRESETS[1],
            Self::High => QUALITY_PRESETS[2],
        }
    }
}

static QUALITY_PRESETS: [&[&str]; 3] = [
    &["-crf", "28", "-preset", "fast"],
    &["-crf", "23", "-preset", "medium"],
    &["-crf", "18", "-preset", "slow"],
];

/// How the encoded bytes reach the caller.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub enum Delivery {
    #[default]
    Buffered,
    Streamed,
}

impl Delivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buffered => "buffered",
            Self::Streamed => "streamed",
        }
    }
}

/// A query value that none of the known variants matched.
#[derive(Debug, Error)]
#[error("unrecognized value '{0}'")]
pub struct UnknownVariant(pub String);

macro_rules! parse_lowercase {
    ($ty:ty, [$($variant:expr),+]) => {
        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
                    .ok_or_else(|| UnknownVariant(s.to_string()))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

parse_lowercase!(OutputFormat, [OutputFormat::Mp4, OutputFormat::Webm]);
parse_lowercase!(QualityTier, [QualityTier::Low, QualityTier::Medium, QualityTier::High]);
parse_lowercase!(Delivery, [Delivery::Buffered, Delivery::Streamed]);

/// Where the encoder writes its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget<'a> {
    /// The encoder's own standard output.
    Pipe,
    File(&'a Path),
}

/// Codec and container settings for one output format
pub trait Transcoder: Sync {
    fn video_codec(&self) -> &'static str;
    fn audio_codec(&self) -> &'static str;
    /// Rate control and speed flags for a tier.
    fn quality_flags(&self, tier: QualityTier) -> &'static [&'static str] {
        tier.flags()
    }
    /// Container flags; `seekable` is false when writing to a pipe.
    fn container_flags(&self, seekable: bool) -> &'static [&'static str];
}

/// Build the full encoder argument list for one conversion.
pub fn encoder_args(request: &ConversionRequest, target: &OutputTarget) -> Vec<String> {
    let transcoder = request.format.transcoder();
    let seekable = matches!(target, OutputTarget::File(_));

    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-i".into(),
        request.input_path.to_string_lossy().into_owned(),
        "-c:v".into(),
        transcoder.video_codec().into(),
        "-c:a".into(),
        transcoder.audio_codec().into(),
    ];
    args.extend(
        transcoder
            .quality_flags(request.quality)
            .iter()
            .map(|f| f.to_string()),
    );
    args.extend(
        transcoder
            .container_flags(seekable)
            .iter()
            .map(|f| f.to_string()),
    );
    args.push("-f".into());
    args.push(request.format.as_str().into());
    args.push("-y".into());
    match target {
        OutputTarget::Pipe => args.push("pipe:1".into()),
        OutputTarget::File(path) => args.push(path.to_string_lossy().into_owned()),
    }
    args
}
