//! Process supervision against real child processes.
#![cfg(unix)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hkmedia_core::process::{
    ExitKind, FfmpegProcess, OutputStrategy, ProcessError, ProcessExit, ProcessHooks,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout};

use crate::fake_ffmpeg::FakeFfmpeg;

const EXIT_DEADLINE: Duration = Duration::from_secs(10);
const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

struct HookEvents {
    ready_count: Arc<AtomicUsize>,
    ready: oneshot::Receiver<()>,
    fatal: oneshot::Receiver<String>,
}

fn observed_hooks() -> (ProcessHooks, HookEvents) {
    let ready_count = Arc::new(AtomicUsize::new(0));
    let (ready_tx, ready_rx) = oneshot::channel();
    let (fatal_tx, fatal_rx) = oneshot::channel();

    let counter = Arc::clone(&ready_count);
    let hooks = ProcessHooks::new()
        .on_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = ready_tx.send(());
        })
        .on_fatal_error(move |message| {
            let _ = fatal_tx.send(message);
        });

    (
        hooks,
        HookEvents {
            ready_count,
            ready: ready_rx,
            fatal: fatal_rx,
        },
    )
}

fn spawn(fake: &FakeFfmpeg, label: &str) -> FfmpegProcess {
    FfmpegProcess::new(fake.config().process, label)
}

async fn wait_exit(process: &FfmpegProcess) -> ProcessExit {
    timeout(EXIT_DEADLINE, process.wait_for_exit())
        .await
        .expect("process did not exit in time")
        .expect("process was never started")
}

#[tokio::test]
async fn test_clean_exit_fires_ready_once() {
    let fake = FakeFfmpeg::new(
        "echo 'ffmpeg version n7.0' >&2\necho 'frame=    1' >&2\necho 'frame=    2' >&2\nexit 0",
    );
    let mut process = spawn(&fake, "Driveway");
    let (hooks, mut events) = observed_hooks();

    process.start(vec!["-version".into()], hooks).unwrap();
    let exit = wait_exit(&process).await;

    assert_eq!(exit.kind, ExitKind::Normal);
    assert_eq!(events.ready_count.load(Ordering::SeqCst), 1);
    assert!(events.fatal.try_recv().is_err());

    let status = process.status();
    assert!(status.is_started());
    assert!(status.is_ended());
    assert!(!status.has_error());
    assert!(!process.is_running());
}

#[tokio::test]
async fn test_abnormal_exit_flags_error_and_reports() {
    let fake = FakeFfmpeg::new("echo \"Unknown encoder 'libnope'\" >&2\nexit 1");
    let mut process = spawn(&fake, "Garage");
    let (hooks, events) = observed_hooks();

    process.start(Vec::new(), hooks).unwrap();
    let exit = wait_exit(&process).await;

    assert_eq!(exit.kind, ExitKind::Failed);
    assert_eq!(exit.code, Some(1));
    assert!(process.status().has_error());
    assert!(
        process
            .status()
            .stderr_log()
            .contains(&"Unknown encoder 'libnope'".to_string())
    );
    assert_eq!(
        events.fatal.await.unwrap(),
        "Garage: FFmpeg process ended unexpectedly with exit code 1."
    );
}

#[tokio::test]
async fn test_benign_exit_still_reports_without_error_flag() {
    let fake = FakeFfmpeg::new("echo 'av_interleaved_write_frame(): Broken pipe' >&2\nexit 1");
    let mut process = spawn(&fake, "Porch");
    let (hooks, events) = observed_hooks();

    process.start(Vec::new(), hooks).unwrap();
    let exit = wait_exit(&process).await;

    assert_eq!(exit.kind, ExitKind::Failed);
    assert!(!process.status().has_error());
    assert!(events.fatal.await.is_ok());
}

#[tokio::test]
async fn test_stop_terminates_gracefully() {
    let fake = FakeFfmpeg::new("echo 'Press [q] to stop' >&2\nexec sleep 30");
    let mut process = spawn(&fake, "Nursery");
    let (hooks, mut events) = observed_hooks();

    process.start(Vec::new(), hooks).unwrap();
    timeout(EXIT_DEADLINE, &mut events.ready).await.unwrap().unwrap();
    assert!(matches!(
        process.start(Vec::new(), ProcessHooks::new()),
        Err(ProcessError::AlreadyRunning)
    ));

    process.stop().await;
    let exit = wait_exit(&process).await;

    assert_eq!(exit.kind, ExitKind::Killed);
    assert_eq!(exit.signal, Some(SIGTERM));
    assert!(process.status().was_stopped());
    assert!(!process.status().has_error());
    assert!(events.fatal.try_recv().is_err());
}

#[tokio::test]
async fn test_stop_escalates_to_kill() {
    let fake = FakeFfmpeg::new(
        "trap '' TERM\necho 'ignoring TERM' >&2\nwhile true; do sleep 0.1; done",
    );
    let mut process = spawn(&fake, "Backyard");
    let kill_delay = fake.config().process.kill_delay;
    let (hooks, mut events) = observed_hooks();

    process.start(Vec::new(), hooks).unwrap();
    timeout(EXIT_DEADLINE, &mut events.ready).await.unwrap().unwrap();

    let stopped_at = Instant::now();
    process.stop().await;
    let exit = wait_exit(&process).await;

    assert!(stopped_at.elapsed() >= kill_delay);
    assert_eq!(exit.kind, ExitKind::Killed);
    assert_eq!(exit.signal, Some(SIGKILL));
}

#[derive(Default)]
struct Capture {
    stdout: Mutex<Vec<u8>>,
    stops: AtomicUsize,
    exits: AtomicUsize,
}

impl OutputStrategy for Capture {
    fn on_stdout(&self, chunk: &[u8]) {
        self.stdout.lock().extend_from_slice(chunk);
    }

    fn on_stop(&self) {
        // The child has not been reaped yet
        assert_eq!(self.exits.load(Ordering::SeqCst), 0);
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn on_exit(&self, _exit: &ProcessExit) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_output_hears_stop_before_exit() {
    let fake = FakeFfmpeg::new("trap '' TERM\nwhile true; do sleep 0.1 </dev/null >/dev/null 2>&1; done");
    let mut process = spawn(&fake, "Carport");
    let capture = Arc::new(Capture::default());

    process
        .start_with_output(
            vec!["-i".into(), "rtsp://carport".into()],
            ProcessHooks::new(),
            Some(capture.clone() as Arc<dyn OutputStrategy>),
        )
        .unwrap();

    process.stop().await;
    assert_eq!(capture.stops.load(Ordering::SeqCst), 1);
    assert_eq!(capture.exits.load(Ordering::SeqCst), 0);

    let exit = wait_exit(&process).await;
    assert_eq!(exit.kind, ExitKind::Killed);
    assert_eq!(capture.exits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stdin_feeds_stdout_and_restart_replaces_command() {
    let fake = FakeFfmpeg::new("exec cat");
    let mut process = spawn(&fake, "Loopback");
    let capture = Arc::new(Capture::default());

    process
        .start_with_output(
            vec!["-i".into(), "pipe:0".into()],
            ProcessHooks::new(),
            Some(capture.clone() as Arc<dyn OutputStrategy>),
        )
        .unwrap();

    process.write_input(b"first chunk ").await.unwrap();
    process.write_input(b"second chunk").await.unwrap();
    process.close_input().await;
    let exit = wait_exit(&process).await;

    assert_eq!(exit.kind, ExitKind::Normal);
    assert_eq!(&capture.stdout.lock()[..], b"first chunk second chunk");
    assert_eq!(capture.exits.load(Ordering::SeqCst), 1);
    assert!(matches!(
        process.write_input(b"late").await,
        Err(ProcessError::StdinUnavailable)
    ));

    process
        .start(vec!["-i".into(), "rtsp://camera".into()], ProcessHooks::new())
        .unwrap();
    assert_eq!(process.args(), ["-i", "rtsp://camera"]);
    process.close_input().await;
    wait_exit(&process).await;
}
