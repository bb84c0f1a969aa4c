//! Integration tests for hkmedia
//!
//! These tests drive the components through real processes and sockets:
//! `/bin/sh` scripts stand in for FFmpeg, and the demultiplexer forwards
//! over loopback UDP.

#[path = "style.rs"]
mod style;

#[path = "integration/fake_ffmpeg.rs"]
mod fake_ffmpeg;

#[path = "integration/process_supervision.rs"]
mod process_supervision;

#[path = "integration/segment_pipeline.rs"]
mod segment_pipeline;

#[path = "integration/rtp_forwarding.rs"]
mod rtp_forwarding;
