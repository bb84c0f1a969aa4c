//! fMP4 segmenting end to end, from a child's stdout to HomeKit segments.
#![cfg(unix)]

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use hkmedia_core::fmp4::{Fmp4Output, Fmp4Session, SegmentMode};
use hkmedia_core::process::{ExitKind, OutputStrategy, ProcessExit, ProcessHooks, SegmentCommand};
use proptest::prelude::*;
use tokio::time::timeout;

use crate::fake_ffmpeg::{FakeFfmpeg, make_box, two_fragment_stream};

const DEADLINE: Duration = Duration::from_secs(10);

/// A fake transcoder that logs, writes `stream` to stdout, then either
/// idles or exits.
fn streaming_ffmpeg(stream: &[u8], then: &str) -> FakeFfmpeg {
    let fake = FakeFfmpeg::new("true");
    let data = fake.dir().join("stream.mp4");
    std::fs::write(&data, stream).unwrap();

    let script = format!(
        "echo \"Output #0, mp4, to 'pipe:1':\" >&2\ncat '{}'\n{then}",
        data.display()
    );
    std::fs::write(fake.dir().join("ffmpeg"), format!("#!/bin/sh\n{script}\n")).unwrap();
    fake
}

#[tokio::test]
async fn test_recording_segments_then_stop_is_not_a_timeout() {
    let fake = streaming_ffmpeg(&two_fragment_stream(), "exec sleep 30");
    let mut session = Fmp4Session::new(&fake.config(), "Front Door");

    session
        .start(&SegmentCommand::recording(Duration::ZERO), ProcessHooks::new())
        .unwrap();
    let mut segments = session.segments().unwrap();
    assert!(session.segments().is_none());

    let mut sizes = Vec::new();
    for _ in 0..3 {
        let segment = timeout(DEADLINE, segments.next_segment()).await.unwrap();
        sizes.push(segment.unwrap().len());
    }
    assert_eq!(sizes, vec![56, 124, 84]);
    assert_eq!(session.init_segment().await.unwrap().len(), 56);

    let pending = tokio::spawn(async move {
        let next = segments.next_segment().await;
        (next, segments.is_timed_out())
    });
    session.stop().await;

    let (next, timed_out) = timeout(DEADLINE, pending).await.unwrap().unwrap();
    assert_eq!(next, None);
    assert!(!timed_out);
    assert!(!session.is_timed_out());

    let exit = session.process().wait_for_exit().await.unwrap();
    assert_eq!(exit.kind, ExitKind::Killed);
}

#[tokio::test]
async fn test_stop_of_term_ignoring_child_is_not_a_timeout() {
    let header = [make_box(b"ftyp", 16), make_box(b"moov", 40)].concat();
    let fake = streaming_ffmpeg(
        &header,
        "while true; do sleep 0.1 </dev/null >/dev/null 2>&1; done",
    );
    // Prepend the trap so the whole script ignores SIGTERM
    let script = fake.dir().join("ffmpeg");
    let body = std::fs::read_to_string(&script).unwrap();
    std::fs::write(&script, body.replacen("#!/bin/sh\n", "#!/bin/sh\ntrap '' TERM\n", 1)).unwrap();

    let mut config = fake.config();
    config.segments.segment_timeout = Duration::from_millis(900);
    config.process.kill_delay = Duration::from_millis(1000);
    let mut session = Fmp4Session::new(&config, "Garage");

    session
        .start(&SegmentCommand::recording(Duration::ZERO), ProcessHooks::new())
        .unwrap();
    let mut segments = session.segments().unwrap();

    let first = timeout(DEADLINE, segments.next_segment()).await.unwrap();
    assert_eq!(first.unwrap().len(), 56);

    let pending = tokio::spawn(async move {
        let next = segments.next_segment().await;
        (next, segments.is_timed_out())
    });
    session.stop().await;

    let (next, timed_out) = timeout(DEADLINE, pending).await.unwrap().unwrap();
    assert_eq!(next, None);
    assert!(!timed_out);
    assert!(!session.is_timed_out());

    let exit = timeout(DEADLINE, session.process().wait_for_exit())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit.kind, ExitKind::Killed);
    assert_eq!(exit.signal, Some(9));
}

#[tokio::test]
async fn test_recording_stalls_past_deadline() {
    let header = [make_box(b"ftyp", 16), make_box(b"moov", 40)].concat();
    let fake = streaming_ffmpeg(&header, "exec sleep 30");
    let config = fake.config();
    let mut session = Fmp4Session::new(&config, "Side Gate");

    session
        .start(&SegmentCommand::recording(Duration::ZERO), ProcessHooks::new())
        .unwrap();
    let mut segments = session.segments().unwrap();

    let first = timeout(DEADLINE, segments.next_segment()).await.unwrap();
    assert_eq!(first.unwrap().len(), 56);

    let started = tokio::time::Instant::now();
    assert_eq!(segments.next_segment().await, None);
    assert!(started.elapsed() >= config.segments.segment_timeout);
    assert!(session.is_timed_out());

    session.stop().await;
    session.process().wait_for_exit().await;
}

#[tokio::test]
async fn test_livestream_pushes_segments_until_exit() {
    let fake = streaming_ffmpeg(&two_fragment_stream(), "exit 0");
    let mut session = Fmp4Session::new(&fake.config(), "Living Room");

    let output = session
        .start(&SegmentCommand::livestream("rtsp://10.0.1.20/live"), ProcessHooks::new())
        .unwrap();
    assert_eq!(output.mode(), SegmentMode::Livestream);
    assert!(session.segments().is_none());
    let mut live = output.live_segments().unwrap();

    let init = timeout(DEADLINE, output.init_segment()).await.unwrap();
    assert_eq!(init.unwrap().len(), 56);

    let mut sizes = Vec::new();
    while let Some(segment) = timeout(DEADLINE, live.recv()).await.unwrap() {
        sizes.push(segment.len());
    }
    assert_eq!(sizes, vec![124, 84]);

    let exit = session.process().wait_for_exit().await.unwrap();
    assert_eq!(exit.kind, ExitKind::Normal);
    assert!(output.is_ended());
}

#[tokio::test]
async fn test_stream_ends_before_init_segment() {
    let fake = streaming_ffmpeg(&make_box(b"ftyp", 16), "exit 0");
    let mut session = Fmp4Session::new(&fake.config(), "Attic");

    session
        .start(&SegmentCommand::livestream("rtsp://attic"), ProcessHooks::new())
        .unwrap();

    let init = timeout(DEADLINE, session.init_segment()).await.unwrap();
    assert_eq!(init, None);
}

#[tokio::test]
async fn test_segments_as_stream() {
    let output = Fmp4Output::new(SegmentMode::Recording);
    let stream = output.generator(DEADLINE).unwrap().into_stream();

    output.on_stdout(&two_fragment_stream());
    output.on_exit(&ProcessExit {
        code: Some(0),
        signal: None,
        kind: ExitKind::Normal,
    });

    // Segments still queued when the process ends are not delivered
    let collected: Vec<Bytes> = stream.collect().await;
    assert!(collected.is_empty());
}

fn fragment_stream(fragments: &[usize]) -> (Vec<u8>, Vec<usize>) {
    let mut stream = [make_box(b"ftyp", 24), make_box(b"moov", 300)].concat();
    let mut expected = vec![324];
    for &payload in fragments {
        stream.extend(make_box(b"moof", 40));
        stream.extend(make_box(b"mdat", payload + 8));
        expected.push(40 + payload + 8);
    }
    (stream, expected)
}

proptest! {
    #[test]
    fn prop_segments_independent_of_pipe_reads(
        fragments in prop::collection::vec(0usize..2000, 1..8),
        read_size in 1usize..700,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let (stream, expected) = fragment_stream(&fragments);
        let sizes = runtime.block_on(async {
            let output = Fmp4Output::new(SegmentMode::Recording);
            let mut generator = output.generator(DEADLINE).unwrap();
            for chunk in stream.chunks(read_size) {
                output.on_stdout(chunk);
            }

            let mut sizes = Vec::new();
            for _ in 0..expected.len() {
                sizes.push(generator.next_segment().await.unwrap().len());
            }
            sizes
        });

        prop_assert_eq!(sizes, expected);
    }
}
