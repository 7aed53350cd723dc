//! LI-820 - gas analyzer sampling
//!
//! Reads marker-framed readings from a LI-820 CO2/H2O analyzer and turns
//! them into timestamped samples.
//!
//! Pipeline: `ByteSource` -> `FrameReader` -> `SampleParser` -> `Sample`
//!
//! ## Quick Start
//!
//! ```ignore
//! use li820::{Sampler, SerialConfig, SerialInstrument};
//!
//! let mut sampler = Sampler::new(SerialInstrument::new(SerialConfig::default()));
//! sampler.open()?;
//!
//! loop {
//!     let sample = sampler.sample()?;
//!     println!("{} co2={} h2o={}", sample.at, sample.co2, sample.h2o);
//! }
//! ```
//!
//! ## Standalone Parsing
//!
//! ```ignore
//! use li820::SampleParser;
//!
//! let sample = SampleParser::new().parse(b"<li840><data><co2>412.5</co2></data></li820>")?;
//! assert_eq!(sample.co2, 412.5);
//! ```

pub mod frame;
pub mod markup;
mod sample;
mod sampler;
pub mod serial;
pub mod simulate;
pub mod source;

use thiserror::Error;

// ============ Primary Public API ============

pub use frame::{Frame, FrameError, FrameReader, Markers};
pub use markup::ParseError;
pub use sample::{CO2_PATH, H2O_PATH, Sample, SampleParser, WRAPPER_ELEMENT, coerce_float};
pub use sampler::{Sampler, SessionPolicy};
pub use serial::{SerialConfig, SerialInstrument};
pub use simulate::SimulatedInstrument;
pub use source::{ByteSource, Instrument, ReaderInstrument, ReaderSource, SourceError};

// ============ Errors ============

/// Why a single call to [`Sampler::sample`] produced no sample.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("Transport error: {0}")]
    Source(#[from] SourceError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

impl SampleError {
    /// The instrument could not be opened.
    pub fn is_open_failure(&self) -> bool {
        matches!(self, SampleError::Source(SourceError::Open { .. }))
    }

    /// A finite source ran out between frames.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, SampleError::Frame(FrameError::EndOfStream))
    }
}
