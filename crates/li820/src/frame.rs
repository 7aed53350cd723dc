//! Streaming frame scanner
//!
//! The analyzer writes readings as `<li820>…</li820>` with arbitrary bytes
//! (line endings, partial records after a reconnect) in between. A frame is
//! only produced once both markers have been seen in order.
//!
//! Markers are matched incrementally with a prefix-function matcher, one byte
//! at a time, so the scan never rescans what it has already read.

use thiserror::Error;

use crate::source::{ByteSource, SourceError};

/// Opening tag the LI-820 writes before each reading
pub const START_TAG: &[u8] = b"<li820>";
/// Closing tag that ends each reading
pub const END_TAG: &[u8] = b"</li820>";
/// Start token emitted in place of [`START_TAG`] at the head of every frame.
///
/// The emitted frame therefore never begins with the bytes that were read.
/// Consumers must not expect the start and end tags to match.
pub const CANONICAL_START_TAG: &[u8] = b"<li840>";

pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
    #[error("End of stream")]
    EndOfStream,
    #[error("Source ended inside a frame after {0} bytes")]
    Incomplete(usize),
    #[error("No end marker within {limit} bytes")]
    Oversized { limit: usize },
}

/// Start/end markers plus the canonical token substituted for the start marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub canonical_start: Vec<u8>,
}

impl Markers {
    pub fn new(
        start: impl Into<Vec<u8>>,
        end: impl Into<Vec<u8>>,
        canonical_start: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            canonical_start: canonical_start.into(),
        }
    }

    pub fn li820() -> Self {
        Self::new(START_TAG, END_TAG, CANONICAL_START_TAG)
    }
}

impl Default for Markers {
    fn default() -> Self {
        Self::li820()
    }
}

/// A complete frame: canonical start token followed by the body through the end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ============ Incremental matcher ============

/// KMP matcher fed one byte at a time.
#[derive(Debug, Clone)]
struct MarkerMatcher {
    pattern: Vec<u8>,
    failure: Vec<usize>,
    matched: usize,
}

impl MarkerMatcher {
    fn new(pattern: &[u8]) -> Self {
        let mut failure = vec![0; pattern.len()];
        let mut k = 0;
        for i in 1..pattern.len() {
            while k > 0 && pattern[i] != pattern[k] {
                k = failure[k - 1];
            }
            if pattern[i] == pattern[k] {
                k += 1;
            }
            failure[i] = k;
        }
        Self {
            pattern: pattern.to_vec(),
            failure,
            matched: 0,
        }
    }

    /// Returns true when `byte` completes the pattern.
    fn feed(&mut self, byte: u8) -> bool {
        if self.pattern.is_empty() {
            return true;
        }
        while self.matched > 0 && byte != self.pattern[self.matched] {
            self.matched = self.failure[self.matched - 1];
        }
        if byte == self.pattern[self.matched] {
            self.matched += 1;
        }
        if self.matched == self.pattern.len() {
            self.matched = 0;
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.matched = 0;
    }
}

// ============ Frame reader ============

pub struct FrameReader {
    markers: Markers,
    start: MarkerMatcher,
    end: MarkerMatcher,
    max_len: Option<usize>,
}

impl FrameReader {
    pub fn new(markers: Markers) -> Self {
        Self {
            start: MarkerMatcher::new(&markers.start),
            end: MarkerMatcher::new(&markers.end),
            markers,
            max_len: Some(DEFAULT_MAX_FRAME_LEN),
        }
    }

    /// Limit on the frame body (after the start marker). `None` = unbounded.
    pub fn with_max_len(mut self, max_len: Option<usize>) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    /// Read and discard bytes until the start marker; returns the canonical start token.
    pub fn scan_for_start<S>(&mut self, source: &mut S) -> Result<Vec<u8>, FrameError>
    where
        S: ByteSource + ?Sized,
    {
        self.start.reset();
        loop {
            let byte = match source.read_byte() {
                Ok(byte) => byte,
                Err(SourceError::Closed) => return Err(FrameError::EndOfStream),
                Err(e) => return Err(e.into()),
            };
            if self.start.feed(byte) {
                return Ok(self.markers.canonical_start.clone());
            }
        }
    }

    /// Accumulate bytes through the end marker; returns them verbatim, end marker included.
    pub fn scan_for_end<S>(&mut self, source: &mut S) -> Result<Vec<u8>, FrameError>
    where
        S: ByteSource + ?Sized,
    {
        self.end.reset();
        let mut body = Vec::with_capacity(128);
        loop {
            let byte = match source.read_byte() {
                Ok(byte) => byte,
                Err(SourceError::Closed) => return Err(FrameError::Incomplete(body.len())),
                Err(e) => return Err(e.into()),
            };
            body.push(byte);
            if self.end.feed(byte) {
                return Ok(body);
            }
            if let Some(limit) = self.max_len {
                if body.len() >= limit {
                    return Err(FrameError::Oversized { limit });
                }
            }
        }
    }

    /// Read exactly one frame: `scan_for_start` followed by `scan_for_end`.
    pub fn read_frame<S>(&mut self, source: &mut S) -> Result<Frame, FrameError>
    where
        S: ByteSource + ?Sized,
    {
        let mut bytes = self.scan_for_start(source)?;
        let body = self.scan_for_end(source)?;
        bytes.extend_from_slice(&body);
        log::debug!("Read frame of {} bytes", bytes.len());
        Ok(Frame { bytes })
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(Markers::default())
    }
}
