//! Incremental ISO-BMFF box framing.
//!
//! The transcoder's stdout arrives in arbitrarily sized pipe reads that have
//! no relation to box boundaries. [`BoxParser`] appends every read to a single
//! accumulator and only ever splits complete boxes off its front, so a box
//! that straddles two (or two hundred) reads is carried over until its
//! declared length is satisfied.
//!
//! ```text
//!  0               4               8                  size
//!  +---------------+---------------+--------------------+
//!  | size (u32 BE) | type (4 char) | payload            |
//!  +---------------+---------------+--------------------+
//!
//!  size == 1: a u64 BE "largesize" follows the type (16 byte header)
//! ```

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::config::DEFAULT_MAX_BOX_SIZE;

/// Length of a compact box header (32-bit size + type).
pub const HEADER_LEN: usize = 8;

/// Length of a box header carrying a 64-bit largesize.
pub const LARGE_HEADER_LEN: usize = 16;

/// Errors raised while framing boxes
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Mp4Error {
    /// Declared size is smaller than the box's own header, or above the
    /// parser's limit
    #[error("Invalid size {size} for '{box_type}' box")]
    InvalidBoxSize { size: u64, box_type: BoxType },

    /// Size 0 ("extends to end of file") cannot be framed on a live pipe
    #[error("Unbounded '{box_type}' box cannot be framed from a stream")]
    UnsupportedBoxSize { box_type: BoxType },
}

/// Four character box type code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxType(pub [u8; 4]);

impl BoxType {
    pub const FTYP: BoxType = BoxType(*b"ftyp");
    pub const MOOV: BoxType = BoxType(*b"moov");
    pub const MOOF: BoxType = BoxType(*b"moof");
    pub const MDAT: BoxType = BoxType(*b"mdat");

    /// Raw type bytes as they appear on the wire.
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Whether a box of this type completes a HomeKit segment.
    ///
    /// `moov` ends the `ftyp`+`moov` stream header and `mdat` ends every
    /// `moof`+`mdat` fragment.
    pub fn ends_segment(&self) -> bool {
        *self == Self::MOOV || *self == Self::MDAT
    }
}

impl fmt::Display for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in &self.0 {
            if byte.is_ascii_graphic() || byte == b' ' {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoxType({self})")
    }
}

/// One complete box, split into its header and payload.
///
/// Both halves are views into the parser's accumulator; no bytes are copied
/// while framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mp4Box {
    pub box_type: BoxType,
    pub header: Bytes,
    pub data: Bytes,
}

impl Mp4Box {
    /// Total size in bytes including the header.
    pub fn size(&self) -> usize {
        self.header.len() + self.data.len()
    }

    /// Appends the complete box (header then payload) to `buffer`.
    pub fn write_into(&self, buffer: &mut BytesMut) {
        buffer.reserve(self.size());
        buffer.extend_from_slice(&self.header);
        buffer.extend_from_slice(&self.data);
    }

    /// The complete box as one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.size());
        self.write_into(&mut buffer);
        buffer.freeze()
    }
}

/// Observable framing state, mainly for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Fewer bytes than a full header are buffered.
    AwaitingHeader { buffered: usize },
    /// The header is known; `missing` bytes of the box are still outstanding.
    AccumulatingBody {
        box_type: BoxType,
        declared: u64,
        missing: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct PendingBox {
    box_type: BoxType,
    header_len: usize,
    total_len: usize,
}

/// Streaming box parser over an append-only accumulator.
///
/// A box is buffered whole before it is emitted, so the declared size is
/// capped at `max_box_size`. A corrupt header cannot make the parser hold
/// the rest of the stream.
#[derive(Debug)]
pub struct BoxParser {
    buffer: BytesMut,
    current: Option<PendingBox>,
    max_box_size: u64,
}

impl Default for BoxParser {
    fn default() -> Self {
        Self::with_max_box_size(DEFAULT_MAX_BOX_SIZE)
    }
}

impl BoxParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_box_size(max_box_size: u64) -> Self {
        Self {
            buffer: BytesMut::new(),
            current: None,
            max_box_size,
        }
    }

    pub fn max_box_size(&self) -> u64 {
        self.max_box_size
    }

    /// Feeds one chunk and returns every box it completed, in stream order.
    ///
    /// Bytes that do not yet form a complete box stay buffered for the next
    /// call.
    ///
    /// # Errors
    ///
    /// - `Mp4Error::InvalidBoxSize` - A header declares a size smaller than its header or above the limit
    /// - `Mp4Error::UnsupportedBoxSize` - A header declares size 0
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Mp4Box>, Mp4Error> {
        self.buffer.extend_from_slice(chunk);

        let mut boxes = Vec::new();
        loop {
            let pending = match self.current {
                Some(pending) => pending,
                None => match self.read_header()? {
                    Some(pending) => {
                        self.current = Some(pending);
                        pending
                    }
                    None => break,
                },
            };

            if self.buffer.len() < pending.total_len {
                break;
            }

            let mut header = self.buffer.split_to(pending.total_len);
            let data = header.split_off(pending.header_len).freeze();
            self.current = None;

            boxes.push(Mp4Box {
                box_type: pending.box_type,
                header: header.freeze(),
                data,
            });
        }

        Ok(boxes)
    }

    /// Current framing state.
    pub fn state(&self) -> ParseState {
        match self.current {
            None => ParseState::AwaitingHeader {
                buffered: self.buffer.len(),
            },
            Some(pending) => ParseState::AccumulatingBody {
                box_type: pending.box_type,
                declared: pending.total_len as u64,
                missing: pending.total_len.saturating_sub(self.buffer.len()) as u64,
            },
        }
    }

    /// Number of carried-over bytes not yet emitted as part of a box.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discards any partial box.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.current = None;
    }

    fn read_header(&self) -> Result<Option<PendingBox>, Mp4Error> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &self.buffer[..];
        let compact_size = header.get_u32();
        let mut box_type = [0u8; 4];
        header.copy_to_slice(&mut box_type);
        let box_type = BoxType(box_type);

        let (header_len, declared) = match compact_size {
            0 => return Err(Mp4Error::UnsupportedBoxSize { box_type }),
            1 => {
                if self.buffer.len() < LARGE_HEADER_LEN {
                    return Ok(None);
                }
                (LARGE_HEADER_LEN, header.get_u64())
            }
            size => (HEADER_LEN, u64::from(size)),
        };

        if declared < header_len as u64 || declared > self.max_box_size {
            return Err(Mp4Error::InvalidBoxSize {
                size: declared,
                box_type,
            });
        }

        let total_len = usize::try_from(declared).map_err(|_| Mp4Error::InvalidBoxSize {
            size: declared,
            box_type,
        })?;

        Ok(Some(PendingBox {
            box_type,
            header_len,
            total_len,
        }))
    }
}
