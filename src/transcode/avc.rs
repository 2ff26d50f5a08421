use super::Transcoder;

/// H.264 video with AAC audio, for the mp4 container.
pub struct LibX264;

impl Transcoder for LibX264 {
    fn video_codec(&self) -> &'static str {
        "libx264"
    }

    fn audio_codec(&self) -> &'static str {
        "aac"
    }

    fn container_flags(&self, seekable: bool) -> &'static [&'static str] {
        if seekable {
            // move the moov atom to the front so playback can start early
            &["-movflags", "+faststart"]
        } else {
            // faststart needs a second pass over the file, a pipe can't seek back
            &["-movflags", "frag_keyframe+empty_moov+default_base_moof"]
        }
    }
}
