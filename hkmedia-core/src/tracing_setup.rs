//! Log output for hkmedia tools.
//!
//! Two sinks are installed: the console, filtered to what the operator asked
//! for, and a per-run file that always records everything down to `trace`.
//! Transcoder failures are usually only diagnosable from the stderr
//! transcript and per-box timing, which live below the console level.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const RUN_LOG_NAME: &str = "hkmedia-last-run.log";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("Cannot open run log {}: {source}", path.display())]
    RunLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("A global subscriber is already installed")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Where and how much to log.
#[derive(Debug, Clone)]
pub struct LogSettings {
    console: LevelFilter,
    logs_dir: PathBuf,
}

impl LogSettings {
    pub fn new(console: impl Into<LevelFilter>) -> Self {
        Self {
            console: console.into(),
            logs_dir: PathBuf::from("logs"),
        }
    }

    pub fn logs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = dir.into();
        self
    }

    /// Path of the file the current run is written to.
    pub fn run_log_path(&self) -> PathBuf {
        self.logs_dir.join(RUN_LOG_NAME)
    }

    /// Installs the global subscriber and returns the run log path.
    ///
    /// The run log replaces the previous run's. `RUST_LOG` takes precedence
    /// over the console level.
    ///
    /// # Errors
    ///
    /// - `TracingError::RunLog` - The logs directory or the run log cannot be created
    /// - `TracingError::AlreadyInstalled` - Tracing was initialized earlier in this process
    pub fn install(&self) -> Result<PathBuf, TracingError> {
        let path = self.run_log_path();
        let file = open_run_log(&self.logs_dir, &path)?;

        tracing_subscriber::registry()
            .with(console_layer(self.console))
            .with(file_layer(file))
            .try_init()?;

        tracing::info!(console = %self.console, run_log = %path.display(), "tracing initialized");
        Ok(path)
    }
}

fn open_run_log(dir: &Path, path: &Path) -> Result<File, TracingError> {
    let run_log_error = |source| TracingError::RunLog {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(run_log_error)?;
    File::create(path).map_err(run_log_error)
}

fn console_layer(level: LevelFilter) -> impl Layer<Registry> + Send + Sync {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    fmt::layer().compact().with_target(true).with_filter(filter)
}

fn file_layer<S>(file: File) -> impl Layer<S> + Send + Sync
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(file)
        .with_filter(LevelFilter::TRACE)
}

/// Console verbosity accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    /// Includes per-box and per-packet events
    Trace,
}

impl From<CliLogLevel> for LevelFilter {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => LevelFilter::ERROR,
            CliLogLevel::Warn => LevelFilter::WARN,
            CliLogLevel::Info => LevelFilter::INFO,
            CliLogLevel::Debug => LevelFilter::DEBUG,
            CliLogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn test_cli_level_parses_case_insensitively() {
        assert_eq!(CliLogLevel::from_str("warn", true), Ok(CliLogLevel::Warn));
        assert_eq!(CliLogLevel::from_str("TRACE", true), Ok(CliLogLevel::Trace));
        assert!(CliLogLevel::from_str("verbose", true).is_err());
        assert_eq!(LevelFilter::from(CliLogLevel::Debug), LevelFilter::DEBUG);
    }

    #[test]
    fn test_run_log_path_follows_logs_dir() {
        let settings = LogSettings::new(CliLogLevel::Info);
        assert_eq!(settings.run_log_path(), Path::new("logs").join(RUN_LOG_NAME));

        let settings = settings.logs_dir("/var/log/hkmedia");
        assert_eq!(
            settings.run_log_path(),
            Path::new("/var/log/hkmedia/hkmedia-last-run.log")
        );
    }

    #[test]
    fn test_unwritable_logs_dir_is_reported() {
        let scratch = tempfile::tempdir().unwrap();
        let blocker = scratch.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();

        let err = LogSettings::new(CliLogLevel::Info)
            .logs_dir(blocker.join("logs"))
            .install()
            .unwrap_err();

        assert!(matches!(err, TracingError::RunLog { .. }));
    }

    #[test]
    fn test_install_records_below_console_level_once() {
        let logs = tempfile::tempdir().unwrap();
        let settings = LogSettings::new(CliLogLevel::Warn).logs_dir(logs.path().join("runs"));

        let path = settings.install().unwrap();
        tracing::debug!(box_type = "mdat", "below console level");

        let log = fs::read_to_string(&path).unwrap();
        assert!(log.contains("tracing initialized"));
        assert!(log.contains("below console level"));

        assert!(matches!(
            settings.install(),
            Err(TracingError::AlreadyInstalled(_))
        ));
    }
}
