//! FFmpeg process supervision
//!
//! [`FfmpegProcess`] owns one transcoder child at a time. A monitor task owns
//! the [`Child`] handle and is the only place that waits on it, classifies its
//! exit and runs the exit hooks; everything else talks to it over a control
//! channel. Stdout is forwarded to an optional [`OutputStrategy`], stderr is
//! retained as a bounded transcript for error reports.

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::command::reads_stdin;
use super::exit::{ExitKind, ProcessExit, fatal_message, is_benign_error};
use super::output::OutputStrategy;
use crate::config::ProcessConfig;

/// How long the monitor waits for the pipe readers after the child exits.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Errors from starting or feeding a transcoder process
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A previous child is still running on this instance
    #[error("Transcoder process is already running")]
    AlreadyRunning,

    /// Stdin was closed by `stop`, `close_input` or an earlier write failure
    #[error("Transcoder stdin is not available")]
    StdinUnavailable,

    /// Writing to stdin failed
    #[error("Failed to write to transcoder stdin: {0}")]
    Write(#[source] io::Error),
}

/// Lifecycle callbacks for one process run.
#[derive(Default)]
pub struct ProcessHooks {
    on_ready: Option<Box<dyn FnOnce() + Send>>,
    on_fatal_error: Option<Box<dyn FnOnce(String) + Send>>,
}

impl ProcessHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once, when the process first writes to stderr.
    pub fn on_ready(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(callback));
        self
    }

    /// Called once with a formatted message when the process ends abnormally.
    pub fn on_fatal_error(mut self, callback: impl FnOnce(String) + Send + 'static) -> Self {
        self.on_fatal_error = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for ProcessHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHooks")
            .field("on_ready", &self.on_ready.is_some())
            .field("on_fatal_error", &self.on_fatal_error.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Exited(ProcessExit),
}

/// Shared state of one process run.
#[derive(Debug)]
pub struct ProcessStatus {
    started: AtomicBool,
    ended: AtomicBool,
    has_error: AtomicBool,
    killed: AtomicBool,
    lifecycle: watch::Sender<Lifecycle>,
    stderr_log: Mutex<VecDeque<String>>,
    stderr_limit: usize,
}

impl ProcessStatus {
    fn new(lifecycle: Lifecycle, stderr_limit: usize) -> Self {
        Self {
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            has_error: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            lifecycle: watch::Sender::new(lifecycle),
            stderr_log: Mutex::new(VecDeque::new()),
            stderr_limit,
        }
    }

    /// True once the process has written to stderr.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// True if the process ended abnormally for a reason not known to be benign.
    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    /// True once `stop` has been requested.
    pub fn was_stopped(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Exit record, once the process has been reaped.
    pub fn exit(&self) -> Option<ProcessExit> {
        match &*self.lifecycle.borrow() {
            Lifecycle::Exited(exit) => Some(exit.clone()),
            _ => None,
        }
    }

    /// Most recent stderr lines, oldest first.
    pub fn stderr_log(&self) -> Vec<String> {
        self.stderr_log.lock().iter().cloned().collect()
    }

    fn record_stderr_line(&self, line: &str) {
        if self.stderr_limit == 0 {
            return;
        }
        let mut log = self.stderr_log.lock();
        if log.len() == self.stderr_limit {
            log.pop_front();
        }
        log.push_back(line.to_string());
    }
}

#[derive(Debug, Clone, Copy)]
enum ControlSignal {
    Terminate,
    Kill,
}

/// Supervisor for a single transcoder child process.
pub struct FfmpegProcess {
    config: ProcessConfig,
    label: String,
    args: Vec<String>,
    status: Arc<ProcessStatus>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    control: Option<mpsc::UnboundedSender<ControlSignal>>,
    output: Option<Arc<dyn OutputStrategy>>,
}

impl std::fmt::Debug for FfmpegProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegProcess")
            .field("label", &self.label)
            .field("args", &self.args)
            .field("status", &self.status)
            .field("running", &self.is_running())
            .field("has_output", &self.output.is_some())
            .finish_non_exhaustive()
    }
}

impl FfmpegProcess {
    /// Creates an idle supervisor. `label` identifies the session in logs and
    /// fatal error messages.
    pub fn new(config: ProcessConfig, label: impl Into<String>) -> Self {
        let status = ProcessStatus::new(Lifecycle::Idle, config.stderr_log_limit);
        Self {
            config,
            label: label.into(),
            args: Vec::new(),
            status: Arc::new(status),
            stdin: Arc::new(tokio::sync::Mutex::new(None)),
            control: None,
            output: None,
        }
    }

    /// Spawns the process with `args`, discarding its stdout.
    ///
    /// # Errors
    ///
    /// - `ProcessError::AlreadyRunning` - The previous child has not exited yet
    /// - `ProcessError::Spawn` - The executable could not be started
    pub fn start(&mut self, args: Vec<String>, hooks: ProcessHooks) -> Result<(), ProcessError> {
        self.start_with_output(args, hooks, None)
    }

    /// Spawns the process with `args`, handing stdout chunks to `output`.
    ///
    /// Replaces the command line of any previous, already exited run.
    ///
    /// # Errors
    ///
    /// - `ProcessError::AlreadyRunning` - The previous child has not exited yet
    /// - `ProcessError::Spawn` - The executable could not be started
    pub fn start_with_output(
        &mut self,
        args: Vec<String>,
        hooks: ProcessHooks,
        output: Option<Arc<dyn OutputStrategy>>,
    ) -> Result<(), ProcessError> {
        if self.is_running() {
            return Err(ProcessError::AlreadyRunning);
        }

        self.args = args;
        self.output = output.clone();
        let status = Arc::new(ProcessStatus::new(
            Lifecycle::Running,
            self.config.stderr_log_limit,
        ));
        self.status = Arc::clone(&status);

        let mut command = Command::new(&self.config.ffmpeg_path);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            label = %self.label,
            program = %self.config.ffmpeg_path.display(),
            args = ?self.args,
            "Spawning transcoder"
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let program = self.config.ffmpeg_path.display().to_string();
                error!(label = %self.label, %program, error = %source, "Failed to spawn transcoder");
                status.has_error.store(true, Ordering::Release);
                status.ended.store(true, Ordering::Release);
                status.lifecycle.send_replace(Lifecycle::Idle);
                return Err(ProcessError::Spawn { program, source });
            }
        };

        self.stdin = Arc::new(tokio::sync::Mutex::new(child.stdin.take()));

        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(forward_stdout(
                stdout,
                output.clone(),
                self.config.read_chunk_size,
            ))
        });

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(collect_stderr(
                stderr,
                Arc::clone(&status),
                hooks.on_ready,
                self.label.clone(),
            ))
        });

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.control = Some(control_tx);

        tokio::spawn(monitor(
            child,
            control_rx,
            PipeTasks {
                stdout: stdout_task,
                stderr: stderr_task,
            },
            ExitContext {
                label: self.label.clone(),
                status,
                on_fatal_error: hooks.on_fatal_error,
                output,
            },
        ));

        Ok(())
    }

    /// Asks the process to quit, then kills it if it is still alive after
    /// the configured kill delay.
    ///
    /// The output strategy hears about the stop first, so consumers end
    /// cleanly even while the process ignores SIGTERM. When stdin carries
    /// media it is closed, which FFmpeg treats as end of input. Otherwise `q`
    /// is written to it first. The stdout reader is dropped and SIGTERM is
    /// sent. Returns without waiting for the exit; use
    /// [`FfmpegProcess::wait_for_exit`] for that.
    pub async fn stop(&self) {
        let Some(control) = self.control.clone() else {
            return;
        };
        if control.is_closed() {
            return;
        }

        self.status.killed.store(true, Ordering::Release);
        if let Some(output) = &self.output {
            output.on_stop();
        }

        match self.stdin.try_lock() {
            Ok(mut guard) => {
                if let Some(mut pipe) = guard.take() {
                    if !reads_stdin(&self.args)
                        && let Err(e) = pipe.write_all(b"q").await
                    {
                        debug!(label = %self.label, error = %e, "Could not send quit command");
                    }
                    drop(pipe);
                }
            }
            Err(_) => {
                debug!(label = %self.label, "Stdin busy with a write, leaving it to the signal");
            }
        }

        if control.send(ControlSignal::Terminate).is_err() {
            return;
        }

        let delay = self.config.kill_delay;
        let status = Arc::clone(&self.status);
        let label = self.label.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !status.is_ended() {
                warn!(%label, ?delay, "Transcoder ignored termination, killing it");
                let _ = control.send(ControlSignal::Kill);
            }
        });
    }

    /// Writes media to the process's stdin.
    ///
    /// A failed write closes stdin; later writes return `StdinUnavailable`.
    ///
    /// # Errors
    ///
    /// - `ProcessError::StdinUnavailable` - No process running or stdin already closed
    /// - `ProcessError::Write` - The pipe rejected the write (usually a broken pipe)
    pub async fn write_input(&self, data: &[u8]) -> Result<(), ProcessError> {
        let mut guard = self.stdin.lock().await;
        let pipe = guard.as_mut().ok_or(ProcessError::StdinUnavailable)?;

        if let Err(source) = pipe.write_all(data).await {
            warn!(label = %self.label, error = %source, "Failed to write to transcoder stdin");
            *guard = None;
            return Err(ProcessError::Write(source));
        }

        Ok(())
    }

    /// Closes stdin, signalling end of input.
    pub async fn close_input(&self) {
        self.stdin.lock().await.take();
    }

    /// Waits until the current run has been reaped.
    ///
    /// Returns `None` if nothing was started or the last spawn failed.
    pub async fn wait_for_exit(&self) -> Option<ProcessExit> {
        let mut lifecycle = self.status.lifecycle.subscribe();
        let state = lifecycle
            .wait_for(|state| !matches!(state, Lifecycle::Running))
            .await
            .ok()?;
        match &*state {
            Lifecycle::Exited(exit) => Some(exit.clone()),
            _ => None,
        }
    }

    /// True while a spawned child has not been reaped.
    pub fn is_running(&self) -> bool {
        self.control
            .as_ref()
            .is_some_and(|control| !control.is_closed())
    }

    /// Status of the current (or most recent) run.
    pub fn status(&self) -> Arc<ProcessStatus> {
        Arc::clone(&self.status)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Command line of the current (or most recent) run.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

struct PipeTasks {
    stdout: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

struct ExitContext {
    label: String,
    status: Arc<ProcessStatus>,
    on_fatal_error: Option<Box<dyn FnOnce(String) + Send>>,
    output: Option<Arc<dyn OutputStrategy>>,
}

async fn monitor(
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<ControlSignal>,
    mut pipes: PipeTasks,
    context: ExitContext,
) {
    let mut control_open = true;

    let wait_result = loop {
        tokio::select! {
            result = child.wait() => break result,
            signal = control.recv(), if control_open => match signal {
                Some(ControlSignal::Terminate) => {
                    if let Some(task) = pipes.stdout.take() {
                        task.abort();
                    }
                    terminate(&mut child, &context.label);
                }
                Some(ControlSignal::Kill) => {
                    if let Err(e) = child.start_kill() {
                        debug!(label = %context.label, error = %e, "Kill failed");
                    }
                }
                None => {
                    // Supervisor dropped
                    control_open = false;
                    let _ = child.start_kill();
                }
            },
        }
    };

    let stopped = context.status.was_stopped();
    let exit = match wait_result {
        Ok(status) => ProcessExit::from_status(status, stopped),
        Err(e) => {
            warn!(label = %context.label, error = %e, "Failed to reap transcoder");
            ProcessExit {
                code: None,
                signal: None,
                kind: ExitKind::classify(None, stopped),
            }
        }
    };

    if let Some(task) = pipes.stdout {
        drain(task).await;
    }
    if let Some(task) = pipes.stderr {
        drain(task).await;
    }

    // Closed before the exit is published so a waiter can restart right away
    drop(control);
    report_exit(context, exit);
}

fn report_exit(context: ExitContext, exit: ProcessExit) {
    let ExitContext {
        label,
        status,
        on_fatal_error,
        output,
    } = context;

    match exit.kind {
        ExitKind::Normal => debug!(%label, "Transcoder exited normally"),
        ExitKind::Killed => debug!(%label, %exit, "Transcoder stopped"),
        ExitKind::Failed => {
            let transcript = status.stderr_log();
            if is_benign_error(&transcript) {
                info!(%label, %exit, "Transcoder ended on an upstream stream discontinuity");
            } else {
                status.has_error.store(true, Ordering::Release);
                error!(
                    %label,
                    %exit,
                    stderr = %transcript.join("\n"),
                    "Transcoder ended unexpectedly"
                );
            }

            if let Some(callback) = on_fatal_error {
                callback(fatal_message(&label, &exit));
            }
        }
    }

    status.ended.store(true, Ordering::Release);
    if let Some(output) = output {
        output.on_exit(&exit);
    }
    status.lifecycle.send_replace(Lifecycle::Exited(exit));
}

async fn drain(mut task: JoinHandle<()>) {
    if tokio::time::timeout(PIPE_DRAIN_GRACE, &mut task)
        .await
        .is_err()
    {
        task.abort();
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child, label: &str) {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };

    // SAFETY: `pid` is our own child and has not been reaped, since the
    // monitor is the only place that waits on it.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        let e = io::Error::last_os_error();
        debug!(%label, pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, label: &str) {
    if let Err(e) = child.start_kill() {
        debug!(%label, error = %e, "Termination failed");
    }
}

async fn forward_stdout<R>(
    mut stdout: R,
    output: Option<Arc<dyn OutputStrategy>>,
    chunk_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; chunk_size.max(1)];
    loop {
        match stdout.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if let Some(output) = &output {
                    output.on_stdout(&buffer[..n]);
                }
            }
            Err(e) => {
                debug!(error = %e, "Transcoder stdout read failed");
                break;
            }
        }
    }
}

async fn collect_stderr<R>(
    mut stderr: R,
    status: Arc<ProcessStatus>,
    mut on_ready: Option<Box<dyn FnOnce() + Send>>,
    label: String,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 4096];
    let mut partial = String::new();

    loop {
        let n = match stderr.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(%label, error = %e, "Transcoder stderr read failed");
                break;
            }
        };

        if !status.started.swap(true, Ordering::AcqRel) {
            debug!(%label, "Transcoder started");
        }
        if let Some(callback) = on_ready.take() {
            callback();
        }

        partial.push_str(&String::from_utf8_lossy(&buffer[..n]));
        while let Some(end) = partial.find(['\n', '\r']) {
            let line: String = partial.drain(..=end).collect();
            let line = line.trim_end();
            if !line.is_empty() {
                trace!(%label, "ffmpeg: {line}");
                status.record_stderr_line(line);
            }
        }
    }

    let line = partial.trim();
    if !line.is_empty() {
        trace!(%label, "ffmpeg: {line}");
        status.record_stderr_line(line);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_stderr_log_is_bounded() {
        let status = ProcessStatus::new(Lifecycle::Running, 3);
        for i in 0..5 {
            status.record_stderr_line(&format!("line {i}"));
        }
        assert_eq!(status.stderr_log(), vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_stderr_lines_split_and_ready_fires_once() {
        let status = Arc::new(ProcessStatus::new(Lifecycle::Running, 10));
        let ready_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ready_count);

        let (mut writer, reader) = tokio::io::duplex(64);
        let task = tokio::spawn(collect_stderr(
            reader,
            Arc::clone(&status),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            "test".to_string(),
        ));

        writer.write_all(b"Input #0, mp4\nframe=  1\r").await.unwrap();
        writer.write_all(b"frame=  2\rStream map").await.unwrap();
        writer.write_all(b"ping done\n").await.unwrap();
        drop(writer);
        task.await.unwrap();

        assert!(status.is_started());
        assert_eq!(ready_count.load(Ordering::SeqCst), 1);
        assert_eq!(
            status.stderr_log(),
            vec!["Input #0, mp4", "frame=  1", "frame=  2", "Stream mapping done"]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_once() {
        let config = ProcessConfig {
            ffmpeg_path: "/nonexistent/hkmedia-ffmpeg".into(),
            ..Default::default()
        };
        let mut process = FfmpegProcess::new(config, "missing");

        let result = process.start(vec!["-version".to_string()], ProcessHooks::new());

        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
        assert!(!process.is_running());
        assert!(process.status().has_error());
        assert_eq!(process.wait_for_exit().await, None);
    }

    #[tokio::test]
    async fn test_idle_process_operations() {
        let process = FfmpegProcess::new(ProcessConfig::default(), "idle");

        process.stop().await;

        assert!(!process.is_running());
        assert_eq!(process.wait_for_exit().await, None);
        assert!(matches!(
            process.write_input(b"data").await,
            Err(ProcessError::StdinUnavailable)
        ));
    }
}
