//! Fragmented MP4 framing and HomeKit segment delivery.

pub mod mp4_box;
pub mod segments;
pub mod session;

pub use mp4_box::{BoxParser, BoxType, HEADER_LEN, LARGE_HEADER_LEN, Mp4Box, Mp4Error, ParseState};
pub use segments::{Fmp4Output, SegmentGenerator, SegmentMode};
pub use session::Fmp4Session;
