//! Transcoder process lifecycle: spawning, stdio wiring, two-phase stop and
//! exit classification.

pub mod command;
pub mod exit;
pub mod output;
pub mod supervisor;

pub use command::{FRAGMENT_MOVFLAGS, InputSource, SegmentCommand, reads_stdin};
pub use exit::{ExitKind, ProcessExit, fatal_message, is_benign_error};
pub use output::OutputStrategy;
pub use supervisor::{FfmpegProcess, ProcessError, ProcessHooks, ProcessStatus};
