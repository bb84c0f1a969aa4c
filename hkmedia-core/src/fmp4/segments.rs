//! HomeKit segment assembly from transcoder output.
//!
//! [`Fmp4Output`] is attached to a supervised process as its stdout strategy.
//! It frames boxes, captures the initialization segment and then, depending on
//! the [`SegmentMode`], either pushes live segments down a channel or queues
//! boxes for the pull-based [`SegmentGenerator`].
//!
//! A segment is everything accumulated since the previous flush, flushed the
//! moment a `moov` or `mdat` box completes:
//!
//! ```text
//! ftyp moov | moof mdat | moof mdat | ...
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, error, trace, warn};

use super::mp4_box::{BoxParser, BoxType, Mp4Box};
use crate::config::DEFAULT_MAX_BOX_SIZE;
use crate::process::{OutputStrategy, ProcessExit};

/// How completed segments reach the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentMode {
    /// Segments are pushed to [`Fmp4Output::live_segments`] as they complete
    Livestream,
    /// Boxes are queued for [`SegmentGenerator`]
    Recording,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InitState {
    Pending,
    Ready(Bytes),
    Ended,
}

#[derive(Debug)]
struct OutputState {
    parser: BoxParser,
    corrupted: bool,
    init_buffer: BytesMut,
    init_closed: bool,
    live_pending: BytesMut,
    live_tx: Option<mpsc::UnboundedSender<Bytes>>,
    live_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    recording: VecDeque<Mp4Box>,
}

#[derive(Debug)]
struct Shared {
    mode: SegmentMode,
    state: Mutex<OutputState>,
    box_available: Notify,
    init: watch::Sender<InitState>,
    ended: AtomicBool,
    timed_out: AtomicBool,
    generator_taken: AtomicBool,
}

/// fMP4 stdout strategy for a transcoder process.
///
/// Cloning is cheap; clones share state.
#[derive(Debug, Clone)]
pub struct Fmp4Output {
    shared: Arc<Shared>,
}

impl Fmp4Output {
    pub fn new(mode: SegmentMode) -> Self {
        Self::with_max_box_size(mode, DEFAULT_MAX_BOX_SIZE)
    }

    /// Output whose parser rejects boxes declaring more than `max_box_size`
    /// bytes.
    pub fn with_max_box_size(mode: SegmentMode, max_box_size: u64) -> Self {
        let (live_tx, live_rx) = match mode {
            SegmentMode::Livestream => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            SegmentMode::Recording => (None, None),
        };

        Self {
            shared: Arc::new(Shared {
                mode,
                state: Mutex::new(OutputState {
                    parser: BoxParser::with_max_box_size(max_box_size),
                    corrupted: false,
                    init_buffer: BytesMut::new(),
                    init_closed: false,
                    live_pending: BytesMut::new(),
                    live_tx,
                    live_rx,
                    recording: VecDeque::new(),
                }),
                box_available: Notify::new(),
                init: watch::Sender::new(InitState::Pending),
                ended: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                generator_taken: AtomicBool::new(false),
            }),
        }
    }

    pub fn mode(&self) -> SegmentMode {
        self.shared.mode
    }

    /// Waits for the initialization segment (every box before the first
    /// `moof`).
    ///
    /// Returns `None` if the stream ends before a `moof` is seen.
    pub async fn init_segment(&self) -> Option<Bytes> {
        let mut init = self.shared.init.subscribe();
        let state = init
            .wait_for(|state| !matches!(state, InitState::Pending))
            .await
            .ok()?;
        match &*state {
            InitState::Ready(segment) => Some(segment.clone()),
            _ => None,
        }
    }

    /// The initialization segment if it is already known.
    pub fn cached_init_segment(&self) -> Option<Bytes> {
        match &*self.shared.init.borrow() {
            InitState::Ready(segment) => Some(segment.clone()),
            _ => None,
        }
    }

    /// Receiver for live segments. Livestream mode only, available once.
    ///
    /// The channel closes when the process exits.
    pub fn live_segments(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.shared.state.lock().live_rx.take()
    }

    /// Pull-based segment sequence. Recording mode only, available once.
    pub fn generator(&self, segment_timeout: Duration) -> Option<SegmentGenerator> {
        if self.shared.mode != SegmentMode::Recording
            || self.shared.generator_taken.swap(true, Ordering::AcqRel)
        {
            return None;
        }

        Some(SegmentGenerator {
            shared: Arc::clone(&self.shared),
            segment_timeout,
            pending: BytesMut::new(),
            finished: false,
            discarded: 0,
        })
    }

    /// True if the generator gave up waiting for a box.
    pub fn is_timed_out(&self) -> bool {
        self.shared.timed_out.load(Ordering::Acquire)
    }

    /// True once the process has exited or a stop was requested.
    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::Acquire)
    }

    /// True if the output stopped framing after an invalid box header.
    pub fn is_corrupted(&self) -> bool {
        self.shared.state.lock().corrupted
    }
}

impl OutputStrategy for Fmp4Output {
    fn on_stdout(&self, chunk: &[u8]) {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.corrupted {
            return;
        }

        let boxes = match state.parser.push(chunk) {
            Ok(boxes) => boxes,
            Err(e) => {
                error!(error = %e, "Transcoder output is not valid fMP4, discarding the rest");
                state.corrupted = true;
                state.parser.reset();
                return;
            }
        };

        let mut queued = false;
        for mp4_box in boxes {
            trace!(box_type = %mp4_box.box_type, size = mp4_box.size(), "Box complete");

            if !state.init_closed {
                if mp4_box.box_type == BoxType::MOOF {
                    state.init_closed = true;
                    let init = state.init_buffer.split().freeze();
                    debug!(size = init.len(), "Initialization segment ready");
                    self.shared.init.send_replace(InitState::Ready(init));
                } else {
                    mp4_box.write_into(&mut state.init_buffer);
                }
            }

            match self.shared.mode {
                SegmentMode::Recording => {
                    state.recording.push_back(mp4_box);
                    queued = true;
                }
                SegmentMode::Livestream if state.init_closed => {
                    mp4_box.write_into(&mut state.live_pending);
                    if mp4_box.box_type.ends_segment() {
                        let segment = state.live_pending.split().freeze();
                        let closed = state
                            .live_tx
                            .as_ref()
                            .is_some_and(|tx| tx.send(segment).is_err());
                        if closed {
                            debug!("Live segment receiver dropped");
                            state.live_tx = None;
                        }
                    }
                }
                SegmentMode::Livestream => {}
            }
        }
        drop(guard);

        if queued {
            self.shared.box_available.notify_one();
        }
    }

    fn on_stop(&self) {
        if !self.shared.ended.swap(true, Ordering::AcqRel) {
            debug!("fMP4 output stopped");
        }
        self.shared.box_available.notify_one();
    }

    fn on_exit(&self, exit: &ProcessExit) {
        {
            let mut state = self.shared.state.lock();
            state.parser.reset();
            state.live_pending.clear();
            state.live_tx = None;
        }

        debug!(%exit, "fMP4 output ended");
        self.shared.ended.store(true, Ordering::Release);
        self.shared.init.send_if_modified(|state| {
            if *state == InitState::Pending {
                *state = InitState::Ended;
                true
            } else {
                false
            }
        });
        self.shared.box_available.notify_one();
    }
}

/// Single-consumer, non-restartable sequence of recording segments.
#[derive(Debug)]
pub struct SegmentGenerator {
    shared: Arc<Shared>,
    segment_timeout: Duration,
    pending: BytesMut,
    finished: bool,
    discarded: usize,
}

impl SegmentGenerator {
    /// Next complete segment, or `None` once the sequence has terminated.
    ///
    /// Terminates when the process has ended or was stopped, or when no box
    /// arrives within the segment timeout. Only the latter sets the timed-out
    /// flag. Boxes still queued at the end are dropped and counted in
    /// [`discarded_boxes`](Self::discarded_boxes).
    pub async fn next_segment(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }

        loop {
            if self.shared.ended.load(Ordering::Acquire) {
                let dropped = {
                    let mut state = self.shared.state.lock();
                    let dropped = state.recording.len();
                    state.recording.clear();
                    dropped
                };
                self.discarded = dropped;
                self.pending.clear();
                if dropped > 0 {
                    warn!(dropped_boxes = dropped, "Segment stream ended with boxes still queued");
                } else {
                    debug!("Segment stream ended");
                }
                self.finished = true;
                return None;
            }

            let next = self.shared.state.lock().recording.pop_front();
            let Some(mp4_box) = next else {
                let notified = self.shared.box_available.notified();
                if tokio::time::timeout(self.segment_timeout, notified)
                    .await
                    .is_err()
                    && self.shared.state.lock().recording.is_empty()
                    && !self.shared.ended.load(Ordering::Acquire)
                {
                    warn!(timeout = ?self.segment_timeout, "No fMP4 box within the segment deadline");
                    self.shared.timed_out.store(true, Ordering::Release);
                    self.finished = true;
                    return None;
                }
                continue;
            };

            mp4_box.write_into(&mut self.pending);
            if mp4_box.box_type.ends_segment() {
                return Some(self.pending.split().freeze());
            }
        }
    }

    /// True if the sequence terminated on the segment deadline.
    pub fn is_timed_out(&self) -> bool {
        self.shared.timed_out.load(Ordering::Acquire)
    }

    /// Boxes that were queued but never delivered because the stream ended.
    pub fn discarded_boxes(&self) -> usize {
        self.discarded
    }

    /// Adapts the generator into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send {
        futures::stream::unfold(self, |mut generator| async move {
            let segment = generator.next_segment().await?;
            Some((segment, generator))
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    use super::*;
    use crate::process::ExitKind;

    const DEADLINE: Duration = Duration::from_millis(4500);

    fn make_box(box_type: &[u8; 4], total_len: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(total_len);
        data.extend_from_slice(&(total_len as u32).to_be_bytes());
        data.extend_from_slice(box_type);
        data.resize(total_len, box_type[0]);
        data
    }

    fn clean_exit() -> ProcessExit {
        ProcessExit {
            code: Some(0),
            signal: None,
            kind: ExitKind::Normal,
        }
    }

    #[tokio::test]
    async fn test_segments_flush_at_moov_and_mdat() {
        let output = Fmp4Output::new(SegmentMode::Recording);
        let mut generator = output.generator(DEADLINE).unwrap();

        let ftyp = make_box(b"ftyp", 16);
        let moov = make_box(b"moov", 40);
        let moof = make_box(b"moof", 24);
        let mdat1 = make_box(b"mdat", 100);
        let mdat2 = make_box(b"mdat", 60);
        output.on_stdout(&[ftyp.clone(), moov.clone(), moof.clone(), mdat1.clone()].concat());
        output.on_stdout(&[moof.clone(), mdat2.clone()].concat());

        let first = generator.next_segment().await.unwrap();
        let second = generator.next_segment().await.unwrap();
        let third = generator.next_segment().await.unwrap();

        assert_eq!(&first[..], &[ftyp, moov].concat()[..]);
        assert_eq!(&second[..], &[moof.clone(), mdat1].concat()[..]);
        assert_eq!(&third[..], &[moof, mdat2].concat()[..]);
    }

    #[tokio::test]
    async fn test_chunks_split_mid_box() {
        let output = Fmp4Output::new(SegmentMode::Recording);
        let mut generator = output.generator(DEADLINE).unwrap();

        let stream = [
            make_box(b"ftyp", 16),
            make_box(b"moov", 40),
            make_box(b"moof", 24),
            make_box(b"mdat", 100),
        ]
        .concat();

        // Split inside moov and inside mdat
        output.on_stdout(&stream[..30]);
        output.on_stdout(&stream[30..120]);
        output.on_stdout(&stream[120..]);

        assert_eq!(generator.next_segment().await.unwrap().len(), 56);
        assert_eq!(generator.next_segment().await.unwrap().len(), 124);
        assert_eq!(
            output.init_segment().await.unwrap(),
            Bytes::copy_from_slice(&stream[..56])
        );
    }

    #[tokio::test]
    async fn test_init_segment_immutable_after_first_moof() {
        let output = Fmp4Output::new(SegmentMode::Livestream);
        let mut live = output.live_segments().unwrap();

        output.on_stdout(&make_box(b"ftyp", 16));
        assert_eq!(output.cached_init_segment(), None);

        output.on_stdout(&make_box(b"moov", 40));
        output.on_stdout(&make_box(b"moof", 24));
        let init = output.init_segment().await.unwrap();
        assert_eq!(init.len(), 56);

        output.on_stdout(&make_box(b"mdat", 100));
        output.on_stdout(&make_box(b"ftyp", 16));
        output.on_stdout(&make_box(b"moov", 40));

        assert_eq!(output.init_segment().await.unwrap(), init);
        assert_eq!(live.recv().await.unwrap().len(), 124);
        // Stray ftyp+moov after init are streamed, not folded into init
        assert_eq!(live.recv().await.unwrap().len(), 56);
    }

    #[tokio::test]
    async fn test_live_channel_closes_on_exit() {
        let output = Fmp4Output::new(SegmentMode::Livestream);
        let mut live = output.live_segments().unwrap();
        assert!(output.live_segments().is_none());
        assert!(output.generator(DEADLINE).is_none());

        output.on_exit(&clean_exit());

        assert_eq!(live.recv().await, None);
        assert_eq!(output.init_segment().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_times_out_without_data() {
        let output = Fmp4Output::new(SegmentMode::Recording);
        let mut generator = output.generator(DEADLINE).unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(generator.next_segment().await, None);

        assert!(started.elapsed() >= DEADLINE);
        assert!(output.is_timed_out());
        assert!(generator.is_timed_out());
        assert_eq!(generator.next_segment().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_segment_is_not_yielded_on_timeout() {
        let output = Fmp4Output::new(SegmentMode::Recording);
        let mut generator = output.generator(DEADLINE).unwrap();

        output.on_stdout(&make_box(b"moof", 24));

        assert_eq!(generator.next_segment().await, None);
        assert!(output.is_timed_out());
    }

    #[tokio::test]
    async fn test_exit_unblocks_waiting_generator() {
        let output = Fmp4Output::new(SegmentMode::Recording);
        let mut generator = output.generator(DEADLINE).unwrap();

        let mut pull = task::spawn(generator.next_segment());
        assert_pending!(pull.poll());

        output.on_exit(&clean_exit());

        assert!(pull.is_woken());
        assert_ready_eq!(pull.poll(), None);
        assert!(!output.is_timed_out());
        assert!(output.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_waiting_generator_before_exit() {
        let output = Fmp4Output::new(SegmentMode::Recording);
        let mut generator = output.generator(DEADLINE).unwrap();

        let mut pull = task::spawn(generator.next_segment());
        assert_pending!(pull.poll());

        output.on_stop();
        assert!(pull.is_woken());
        assert_ready_eq!(pull.poll(), None);
        drop(pull);

        // The process outlives the deadline; the stream stays cleanly ended
        tokio::time::advance(DEADLINE * 2).await;
        assert_eq!(generator.next_segment().await, None);
        assert!(!generator.is_timed_out());
        assert!(output.is_ended());

        output.on_exit(&clean_exit());
        assert_eq!(output.init_segment().await, None);
    }

    #[tokio::test]
    async fn test_queued_boxes_are_counted_when_stream_ends() {
        let output = Fmp4Output::new(SegmentMode::Recording);
        let mut generator = output.generator(DEADLINE).unwrap();

        output.on_stdout(&[make_box(b"ftyp", 16), make_box(b"moov", 40)].concat());
        assert_eq!(generator.next_segment().await.unwrap().len(), 56);

        output.on_stdout(&[make_box(b"moof", 24), make_box(b"mdat", 100)].concat());
        output.on_stdout(&make_box(b"moof", 24));
        output.on_exit(&clean_exit());

        assert_eq!(generator.next_segment().await, None);
        assert_eq!(generator.discarded_boxes(), 3);
        assert!(!generator.is_timed_out());
    }

    #[tokio::test]
    async fn test_oversized_box_marks_output_corrupted() {
        let output = Fmp4Output::with_max_box_size(SegmentMode::Recording, 1024);

        output.on_stdout(&make_box(b"ftyp", 16));
        assert!(!output.is_corrupted());

        let mut header = 0x7FFF_FFFFu32.to_be_bytes().to_vec();
        header.extend_from_slice(b"mdat");
        output.on_stdout(&header);

        assert!(output.is_corrupted());
    }

    #[tokio::test]
    async fn test_box_arrival_wakes_generator() {
        let output = Fmp4Output::new(SegmentMode::Recording);
        let mut generator = output.generator(DEADLINE).unwrap();

        let mut pull = task::spawn(generator.next_segment());
        assert_pending!(pull.poll());

        output.on_stdout(&make_box(b"moof", 24));
        assert!(pull.is_woken());
        assert_pending!(pull.poll());

        output.on_stdout(&make_box(b"mdat", 32));
        assert!(pull.is_woken());
        let segment = match pull.poll() {
            std::task::Poll::Ready(segment) => segment.unwrap(),
            std::task::Poll::Pending => panic!("segment not ready"),
        };
        assert_eq!(segment.len(), 56);
    }

    #[tokio::test]
    async fn test_invalid_box_stops_framing() {
        let output = Fmp4Output::new(SegmentMode::Recording);
        let mut generator = output.generator(DEADLINE).unwrap();

        let mut garbage = 4u32.to_be_bytes().to_vec();
        garbage.extend_from_slice(b"moof");
        output.on_stdout(&garbage);
        output.on_stdout(&make_box(b"ftyp", 16));

        assert!(output.is_corrupted());
        output.on_exit(&clean_exit());
        assert_eq!(generator.next_segment().await, None);
    }

    #[tokio::test]
    async fn test_generator_is_single_consumer() {
        let output = Fmp4Output::new(SegmentMode::Recording);
        assert!(output.generator(DEADLINE).is_some());
        assert!(output.generator(DEADLINE).is_none());
        assert!(output.live_segments().is_none());
    }

    #[tokio::test]
    async fn test_stream_adapter_yields_until_end() {
        let output = Fmp4Output::new(SegmentMode::Recording);
        let stream = output.generator(DEADLINE).unwrap().into_stream();

        output.on_stdout(&[make_box(b"ftyp", 16), make_box(b"moov", 40)].concat());
        output.on_stdout(&[make_box(b"moof", 24), make_box(b"mdat", 100)].concat());

        let mut stream = Box::pin(stream);
        assert_eq!(stream.next().await.unwrap().len(), 56);
        assert_eq!(stream.next().await.unwrap().len(), 124);

        output.on_exit(&clean_exit());
        assert_eq!(stream.next().await, None);
    }
}
