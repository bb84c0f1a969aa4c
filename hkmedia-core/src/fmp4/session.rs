//! Segment-producing transcoder session.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::segments::{Fmp4Output, SegmentGenerator};
use crate::config::MediaConfig;
use crate::process::{FfmpegProcess, ProcessError, ProcessHooks, SegmentCommand};

/// A supervised transcoder with fMP4 segment output attached.
///
/// Each `start` creates fresh output state, so a session can be restarted
/// after its process has exited.
#[derive(Debug)]
pub struct Fmp4Session {
    process: FfmpegProcess,
    output: Option<Fmp4Output>,
    segment_timeout: Duration,
    max_box_size: u64,
}

impl Fmp4Session {
    pub fn new(config: &MediaConfig, label: impl Into<String>) -> Self {
        Self {
            process: FfmpegProcess::new(config.process.clone(), label),
            output: None,
            segment_timeout: config.segments.segment_timeout,
            max_box_size: config.segments.max_box_size,
        }
    }

    /// Spawns the transcoder for `command`.
    ///
    /// # Errors
    ///
    /// - `ProcessError::AlreadyRunning` - The previous run has not exited yet
    /// - `ProcessError::Spawn` - The executable could not be started
    pub fn start(
        &mut self,
        command: &SegmentCommand,
        hooks: ProcessHooks,
    ) -> Result<Fmp4Output, ProcessError> {
        let output = Fmp4Output::with_max_box_size(command.mode(), self.max_box_size);
        self.process.start_with_output(
            command.build_args(),
            hooks,
            Some(Arc::new(output.clone())),
        )?;
        self.output = Some(output.clone());
        Ok(output)
    }

    /// Recording segment sequence for the current run, available once.
    pub fn segments(&self) -> Option<SegmentGenerator> {
        self.output.as_ref()?.generator(self.segment_timeout)
    }

    /// Waits for the initialization segment of the current run.
    pub async fn init_segment(&self) -> Option<Bytes> {
        self.output.as_ref()?.init_segment().await
    }

    /// True if the current run's generator hit the segment deadline.
    pub fn is_timed_out(&self) -> bool {
        self.output.as_ref().is_some_and(Fmp4Output::is_timed_out)
    }

    /// Feeds recorded MP4 to the transcoder.
    ///
    /// # Errors
    ///
    /// - `ProcessError::StdinUnavailable` - Not running or stdin already closed
    /// - `ProcessError::Write` - The transcoder stopped reading
    pub async fn write_input(&self, data: &[u8]) -> Result<(), ProcessError> {
        self.process.write_input(data).await
    }

    /// Closes the transcoder's stdin, marking the end of recorded input.
    pub async fn close_input(&self) {
        self.process.close_input().await;
    }

    pub async fn stop(&self) {
        self.process.stop().await;
    }

    pub fn process(&self) -> &FfmpegProcess {
        &self.process
    }

    pub fn output(&self) -> Option<&Fmp4Output> {
        self.output.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_without_run_has_no_output() {
        let session = Fmp4Session::new(&MediaConfig::for_testing(), "Porch");

        assert!(session.segments().is_none());
        assert!(session.output().is_none());
        assert_eq!(session.init_segment().await, None);
        assert!(!session.is_timed_out());
    }

    #[tokio::test]
    async fn test_failed_spawn_leaves_session_idle() {
        let mut config = MediaConfig::for_testing();
        config.process.ffmpeg_path = "/nonexistent/hkmedia-ffmpeg".into();
        let mut session = Fmp4Session::new(&config, "Porch");

        let result = session.start(&SegmentCommand::livestream("rtsp://cam"), ProcessHooks::new());

        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
        assert!(session.output().is_none());
        assert!(!session.process().is_running());
    }
}
