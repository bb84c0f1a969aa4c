//! Exit classification for transcoder processes.

use std::fmt;
use std::sync::LazyLock;

use regex::RegexSet;

/// How a process ended, from the supervisor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit code 0.
    Normal,
    /// Ended after the supervisor asked it to stop.
    Killed,
    /// Anything else.
    Failed,
}

impl ExitKind {
    /// Classifies an exit.
    ///
    /// FFmpeg reports 255 when it quits on a signal or on `q`, and a process
    /// killed outright has no exit code at all. Either only counts as expected
    /// when the supervisor initiated the stop.
    pub fn classify(code: Option<i32>, stopped_by_supervisor: bool) -> Self {
        match code {
            Some(0) => ExitKind::Normal,
            None | Some(255) if stopped_by_supervisor => ExitKind::Killed,
            _ => ExitKind::Failed,
        }
    }
}

/// Termination record of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub kind: ExitKind,
}

impl ProcessExit {
    pub fn from_status(status: std::process::ExitStatus, stopped_by_supervisor: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            kind: ExitKind::classify(status.code(), stopped_by_supervisor),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

// Stream discontinuities upstream (a camera restarting its feed, the
// consumer hanging up) end FFmpeg with these messages. They are expected
// in normal operation.
static BENIGN_ERRORS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)av_interleaved_write_frame\(\): broken pipe",
        r"(?i)error (writing trailer|closing file).*broken pipe",
        r"(?i)could not write header.*broken pipe",
        r"(?i)(end of file|eof).*(format|probe)",
        r"(?i)error splitting the input into nal units",
        r"(?i)moov atom not found",
    ])
    .unwrap_or_else(|_| RegexSet::empty())
});

/// Lines at the end of a transcript that may carry the terminating error.
/// FFmpeg follows the cause with a few summary lines such as
/// `Conversion failed!`.
const BENIGN_TAIL_LINES: usize = 4;

/// Whether a stderr transcript ends in one of the known benign errors.
///
/// Only the last few lines count; a recoverable hiccup
/// early in the run does not excuse a later real failure.
pub fn is_benign_error<S: AsRef<str>>(stderr_log: &[S]) -> bool {
    let tail = &stderr_log[stderr_log.len().saturating_sub(BENIGN_TAIL_LINES)..];
    tail.iter()
        .any(|line| BENIGN_ERRORS.is_match(line.as_ref()))
}

/// Message handed to the fatal error callback.
pub fn fatal_message(label: &str, exit: &ProcessExit) -> String {
    format!("{label}: FFmpeg process ended unexpectedly with {exit}.")
}
