//! Transcoder command lines for fMP4 segment output.
//!
//! Codec, bitrate and profile selection belong to the caller and are passed
//! through untouched as `encoder_args`. This module only owns the input
//! framing and the output flags the box parser depends on.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fmp4::SegmentMode;

/// Output movflags that make every fragment a self-contained `moof`+`mdat`
/// pair, preceded by a single empty `moov`, with no `sidx` boxes and no
/// trailing `moov`.
pub const FRAGMENT_MOVFLAGS: &str =
    "default_base_moof+empty_moov+frag_keyframe+skip_sidx+skip_trailer";

/// Where the transcoder reads its media from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum InputSource {
    /// Live camera feed (RTSP URL, file path, ...)
    Url { url: String },
    /// Recorded MP4 written to stdin, fast-forwarded by `offset_ms`
    Stdin { offset_ms: u64 },
}

/// Command line for a segment-producing transcoder process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCommand {
    pub input: InputSource,
    /// Codec and rate control arguments, inserted between input and output
    #[serde(default)]
    pub encoder_args: Vec<String>,
    /// Fragment duration cap; keyframes always start a new fragment
    #[serde(default)]
    pub fragment_duration: Option<Duration>,
    /// FFmpeg log level; must stay verbose enough to write to stderr
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SegmentCommand {
    /// Livestream command reading from `url`.
    pub fn livestream(url: impl Into<String>) -> Self {
        Self {
            input: InputSource::Url { url: url.into() },
            encoder_args: Vec::new(),
            fragment_duration: None,
            log_level: default_log_level(),
        }
    }

    /// Recording command reading MP4 from stdin, starting `offset` into it.
    pub fn recording(offset: Duration) -> Self {
        Self {
            input: InputSource::Stdin {
                offset_ms: offset.as_millis() as u64,
            },
            encoder_args: Vec::new(),
            fragment_duration: None,
            log_level: default_log_level(),
        }
    }

    /// Replaces the encoder arguments.
    pub fn with_encoder_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.encoder_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Caps fragment length.
    pub fn with_fragment_duration(mut self, duration: Duration) -> Self {
        self.fragment_duration = Some(duration);
        self
    }

    /// Segment mode implied by the input.
    pub fn mode(&self) -> SegmentMode {
        match self.input {
            InputSource::Url { .. } => SegmentMode::Livestream,
            InputSource::Stdin { .. } => SegmentMode::Recording,
        }
    }

    /// Builds the full argument vector (without the program name).
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            self.log_level.clone(),
        ];

        match &self.input {
            InputSource::Url { url } => {
                args.extend(["-i".to_string(), url.clone()]);
            }
            InputSource::Stdin { offset_ms } => {
                args.extend(["-f".to_string(), "mp4".to_string()]);
                if *offset_ms > 0 {
                    args.extend(["-ss".to_string(), format!("{offset_ms}ms")]);
                }
                args.extend(["-i".to_string(), "pipe:0".to_string()]);
            }
        }

        args.extend(self.encoder_args.iter().cloned());

        if let Some(duration) = self.fragment_duration {
            args.extend([
                "-frag_duration".to_string(),
                duration.as_micros().to_string(),
            ]);
        }

        args.extend([
            "-movflags".to_string(),
            FRAGMENT_MOVFLAGS.to_string(),
            "-f".to_string(),
            "mp4".to_string(),
            "pipe:1".to_string(),
        ]);

        args
    }
}

/// Whether an argument vector makes stdin the media input.
pub fn reads_stdin(args: &[String]) -> bool {
    args.iter().any(|arg| arg == "pipe:0" || arg == "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(args: &[String], needle: &str) -> usize {
        args.iter().position(|arg| arg == needle).unwrap()
    }

    #[test]
    fn test_livestream_args() {
        let args = SegmentCommand::livestream("rtsp://10.0.0.5/stream")
            .with_encoder_args(["-c:v", "copy"])
            .build_args();

        assert_eq!(args[position(&args, "-i") + 1], "rtsp://10.0.0.5/stream");
        assert!(position(&args, "-c:v") > position(&args, "-i"));
        assert!(!reads_stdin(&args));
        assert_eq!(args.last().unwrap(), "pipe:1");
    }

    #[test]
    fn test_recording_args_seek_before_stdin_input() {
        let args = SegmentCommand::recording(Duration::from_millis(2500)).build_args();

        assert_eq!(args[position(&args, "-ss") + 1], "2500ms");
        assert!(position(&args, "-ss") < position(&args, "pipe:0"));
        assert!(reads_stdin(&args));
    }

    #[test]
    fn test_recording_without_offset_skips_seek() {
        let args = SegmentCommand::recording(Duration::ZERO).build_args();
        assert!(!args.contains(&"-ss".to_string()));
    }

    #[test]
    fn test_framing_flags_always_present() {
        let args = SegmentCommand::livestream("in.mp4")
            .with_fragment_duration(Duration::from_secs(4))
            .build_args();

        let movflags = &args[position(&args, "-movflags") + 1];
        for flag in [
            "frag_keyframe",
            "empty_moov",
            "default_base_moof",
            "skip_sidx",
            "skip_trailer",
        ] {
            assert!(movflags.contains(flag), "missing {flag}");
        }
        assert_eq!(args[position(&args, "-frag_duration") + 1], "4000000");
    }

    #[test]
    fn test_mode_follows_input() {
        assert_eq!(
            SegmentCommand::livestream("rtsp://cam").mode(),
            SegmentMode::Livestream
        );
        assert_eq!(
            SegmentCommand::recording(Duration::ZERO).mode(),
            SegmentMode::Recording
        );
    }

    #[test]
    fn test_command_deserializes_from_session_record() {
        let json = r#"{
            "input": { "kind": "stdin", "offset_ms": 1200 },
            "encoder_args": ["-c:v", "libx264", "-b:v", "2000k"]
        }"#;

        let command: SegmentCommand = serde_json::from_str(json).unwrap();

        assert_eq!(command.input, InputSource::Stdin { offset_ms: 1200 });
        assert_eq!(command.log_level, "info");
        assert_eq!(command.fragment_duration, None);
        assert_eq!(command.encoder_args.len(), 4);
    }
}
