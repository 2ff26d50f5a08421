use super::{QualityTier, Transcoder};

pub struct LibVpxVp9;

impl Transcoder for LibVpxVp9 {
    fn video_codec(&self) -> &'static str {
        "libvpx-vp9"
    }

    fn audio_codec(&self) -> &'static str {
        "libopus"
    }

    fn quality_flags(&self, tier: QualityTier) -> &'static [&'static str] {
        // libvpx has no -preset, speed is -cpu-used. -b:v 0 makes -crf constant quality
        match tier {
            QualityTier::Low => &["-crf", "28", "-b:v", "0", "-deadline", "good", "-cpu-used", "4"],
            QualityTier::Medium => &["-crf", "23", "-b:v", "0", "-deadline", "good", "-cpu-used", "2"],
            QualityTier::High => &["-crf", "18", "-b:v", "0", "-deadline", "good", "-cpu-used", "1"],
        }
    }

    fn container_flags(&self, _seekable: bool) -> &'static [&'static str] {
        // webm is written progressively either way
        &[]
    }
}
