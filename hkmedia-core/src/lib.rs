//! hkmedia core - media transport for HomeKit camera streaming
//!
//! This crate supervises FFmpeg transcoder processes, turns their fragmented
//! MP4 output into HomeKit segments under the Secure Video deadlines, and
//! adapts multiplexed RTP/RTCP traffic for FFmpeg's RTP input.

pub mod config;
pub mod fmp4;
pub mod process;
pub mod rtp;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::MediaConfig;
pub use fmp4::{Fmp4Output, Fmp4Session, Mp4Error, SegmentGenerator, SegmentMode};
pub use process::{FfmpegProcess, ProcessError, ProcessHooks, SegmentCommand};
pub use rtp::{IpFamily, PortAllocator, PortSpan, RtpDemuxer, RtpError};

/// Errors that can bubble up from any hkmedia subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("MP4 framing error: {0}")]
    Mp4(#[from] Mp4Error),

    #[error("RTP error: {0}")]
    Rtp(#[from] RtpError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    /// Short operator-facing description.
    pub fn user_message(&self) -> String {
        match self {
            MediaError::Process(ProcessError::Spawn { program, .. }) => {
                format!("Could not start {program}; check that FFmpeg is installed")
            }
            MediaError::Process(_) => "Transcoder error occurred".to_string(),
            MediaError::Mp4(_) => "Transcoder produced invalid MP4 output".to_string(),
            MediaError::Rtp(RtpError::Bind { port, .. }) => {
                format!("UDP port {port} is not available")
            }
            MediaError::Rtp(_) => "Network error occurred".to_string(),
            MediaError::Io(_) => "File system error occurred".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmp4::BoxType;

    #[test]
    fn test_user_messages() {
        let error = MediaError::from(ProcessError::Spawn {
            program: "ffmpeg".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert!(error.user_message().contains("ffmpeg"));

        let error = MediaError::from(Mp4Error::UnsupportedBoxSize {
            box_type: BoxType::MDAT,
        });
        assert_eq!(error.user_message(), "Transcoder produced invalid MP4 output");
        assert!(error.to_string().contains("mdat"));
    }
}
