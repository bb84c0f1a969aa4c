//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Subcommand;
use hkmedia_core::MediaConfig;
use hkmedia_core::fmp4::{Fmp4Session, SegmentGenerator, SegmentMode};
use hkmedia_core::process::{ProcessHooks, SegmentCommand};
use hkmedia_core::rtp::{DemuxPorts, IpFamily, PortAllocator, PortSpan, RtpDemuxer};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Transcode a source into HomeKit fMP4 segments on disk
    Segments {
        /// Camera URL (livestream) or MP4 file (with --recording)
        source: String,
        /// Feed `source` over stdin and pull segments under the delivery deadline.
        /// Boxes still queued when FFmpeg exits are dropped, and the count is
        /// reported
        #[arg(long)]
        recording: bool,
        /// Start offset into the recording
        #[arg(long, default_value = "0")]
        offset_ms: u64,
        /// Directory for init.mp4 and numbered segments
        #[arg(short, long, default_value = "segments")]
        output: PathBuf,
        /// Stop after this many segments
        #[arg(long)]
        max_segments: Option<usize>,
        /// Fragment duration cap
        #[arg(long)]
        fragment_ms: Option<u64>,
        /// Encoder arguments passed to FFmpeg verbatim (after `--`)
        #[arg(last = true)]
        encoder_args: Vec<String>,
    },
    /// Split multiplexed RTP/RTCP from one port onto two
    Demux {
        /// Address family
        #[arg(long, default_value = "ipv4")]
        family: IpFamily,
        /// Multiplexed input port (0 picks a free one)
        #[arg(long, default_value = "0")]
        input: u16,
        /// Local RTP destination port
        #[arg(long)]
        rtp: u16,
        /// Local RTCP destination port
        #[arg(long)]
        rtcp: u16,
    },
    /// Reserve free UDP ports and print them as JSON
    Ports {
        /// Address family
        #[arg(long, default_value = "ipv4")]
        family: IpFamily,
        /// Reserve consecutive RTP/RTCP pairs
        #[arg(long)]
        pair: bool,
        /// Number of reservations
        #[arg(short, long, default_value = "1")]
        count: usize,
    },
}

/// Runs a CLI command
///
/// # Errors
///
/// - `anyhow::Error` - The command failed; the message names the failing step
pub async fn run_command(command: Commands, config: &MediaConfig) -> anyhow::Result<()> {
    match command {
        Commands::Segments {
            source,
            recording,
            offset_ms,
            output,
            max_segments,
            fragment_ms,
            encoder_args,
        } => {
            let mut command = if recording {
                SegmentCommand::recording(Duration::from_millis(offset_ms))
            } else {
                SegmentCommand::livestream(source.clone())
            }
            .with_encoder_args(encoder_args);
            if let Some(ms) = fragment_ms {
                command = command.with_fragment_duration(Duration::from_millis(ms));
            }

            let recording_input = recording.then(|| PathBuf::from(&source));
            write_segments(config, &command, recording_input, &output, max_segments).await
        }
        Commands::Demux {
            family,
            input,
            rtp,
            rtcp,
        } => run_demuxer(config, family, DemuxPorts { input, rtcp, rtp }).await,
        Commands::Ports {
            family,
            pair,
            count,
        } => reserve_ports(config, family, pair, count),
    }
}

enum SegmentSource {
    Recording(SegmentGenerator),
    Live(mpsc::UnboundedReceiver<Bytes>),
}

impl SegmentSource {
    async fn next(&mut self) -> Option<Bytes> {
        match self {
            SegmentSource::Recording(generator) => generator.next_segment().await,
            SegmentSource::Live(receiver) => receiver.recv().await,
        }
    }

    /// Boxes the recording generator dropped when the stream ended.
    fn discarded_boxes(&self) -> usize {
        match self {
            SegmentSource::Recording(generator) => generator.discarded_boxes(),
            SegmentSource::Live(_) => 0,
        }
    }
}

/// Runs a transcoder and writes its init segment and media segments to `output`
///
/// # Errors
///
/// - `anyhow::Error` - The output directory or a segment file could not be written
/// - `anyhow::Error` - FFmpeg could not be started
pub async fn write_segments(
    config: &MediaConfig,
    command: &SegmentCommand,
    recording_input: Option<PathBuf>,
    output: &Path,
    max_segments: Option<usize>,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(output)
        .await
        .with_context(|| format!("creating {}", output.display()))?;

    let mut session = Fmp4Session::new(config, "cli");
    let hooks = ProcessHooks::new()
        .on_ready(|| info!("Transcoder is running"))
        .on_fatal_error(|message| error!("{message}"));
    let fmp4 = session.start(command, hooks)?;
    let session = Arc::new(session);

    if let Some(path) = recording_input {
        tokio::spawn(feed_recording(Arc::clone(&session), path));
    }

    let mut source = match fmp4.mode() {
        SegmentMode::Recording => SegmentSource::Recording(
            session
                .segments()
                .context("segment generator already taken")?,
        ),
        SegmentMode::Livestream => SegmentSource::Live(
            fmp4.live_segments()
                .context("live segment channel already taken")?,
        ),
    };

    match session.init_segment().await {
        Some(init) => {
            tokio::fs::write(output.join("init.mp4"), &init).await?;
            println!("Initialization segment: {} bytes", init.len());
        }
        None => warn!("Stream ended before an initialization segment was produced"),
    }

    let mut written = 0usize;
    while max_segments.is_none_or(|max| written < max) {
        let segment = tokio::select! {
            segment = source.next() => segment,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(segment) = segment else {
            break;
        };

        let path = output.join(format!("segment-{written:05}.m4s"));
        tokio::fs::write(&path, &segment)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        written += 1;
        info!(segment = written, size = segment.len(), "Segment written");
    }

    session.stop().await;
    let exit = session.process().wait_for_exit().await;
    let status = session.process().status();

    println!("Segments written: {written}");
    let discarded = source.discarded_boxes();
    if discarded > 0 {
        warn!(dropped_boxes = discarded, "FFmpeg exited with boxes still queued");
        println!("Dropped at end of stream: {discarded} boxes");
    }
    if let Some(exit) = exit {
        println!("FFmpeg: {exit}");
    }
    if session.is_timed_out() {
        println!("Stopped: no segment within {:?}", config.segments.segment_timeout);
    }
    if status.has_error() {
        anyhow::bail!("FFmpeg ended with an error; see the log for its stderr");
    }

    Ok(())
}

async fn feed_recording(session: Arc<Fmp4Session>, path: PathBuf) {
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Cannot open recording");
            session.close_input().await;
            return;
        }
    };

    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        match file.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if session.write_input(&buffer[..n]).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Reading recording failed");
                break;
            }
        }
    }

    session.close_input().await;
}

/// Runs a demultiplexer until Ctrl-C
///
/// # Errors
///
/// - `anyhow::Error` - The input port could not be bound
pub async fn run_demuxer(
    config: &MediaConfig,
    family: IpFamily,
    ports: DemuxPorts,
) -> anyhow::Result<()> {
    let mut demuxer = RtpDemuxer::bind(family, ports, &config.rtp).await?;
    println!("Demultiplexing on {}", demuxer.local_addr());

    let mut report = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                let activity = demuxer.activity();
                info!(
                    rtp = activity.rtp_packets,
                    rtcp = activity.rtcp_packets,
                    heartbeats = activity.heartbeats,
                    "Forwarding"
                );
            }
        }
    }

    demuxer.close().await;
    let activity = demuxer.activity();
    println!(
        "RTP packets: {}, RTCP packets: {}, heartbeats: {}",
        activity.rtp_packets, activity.rtcp_packets, activity.heartbeats
    );
    Ok(())
}

/// Reserves `count` ports (or pairs) and prints them
///
/// # Errors
///
/// - `anyhow::Error` - No free port was found within the attempt limit
pub fn reserve_ports(
    config: &MediaConfig,
    family: IpFamily,
    pair: bool,
    count: usize,
) -> anyhow::Result<()> {
    let allocator = PortAllocator::new(&config.ports);
    let span = if pair { PortSpan::Pair } else { PortSpan::Single };

    let mut reserved = Vec::with_capacity(count);
    for _ in 0..count {
        let port = allocator.reserve(family, span).with_context(|| {
            format!(
                "no free {family} port after {} attempts",
                config.ports.max_attempts
            )
        })?;
        reserved.push(match span {
            PortSpan::Single => serde_json::json!({ "port": port }),
            PortSpan::Pair => serde_json::json!({ "rtp": port, "rtcp": port + 1 }),
        });
    }

    println!("{}", serde_json::to_string_pretty(&reserved)?);
    Ok(())
}
