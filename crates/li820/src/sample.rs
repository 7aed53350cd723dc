//! Frame payload -> Sample

use chrono::{DateTime, Utc};
use winnow::ascii::{digit0, digit1};
use winnow::combinator::{alt, opt};
use winnow::prelude::*;
use winnow::token::one_of;

use crate::markup::{self, ParseError};

/// Synthetic element the frame is wrapped in before parsing
pub const WRAPPER_ELEMENT: &str = "root";
pub const CO2_PATH: &str = "data/co2";
pub const H2O_PATH: &str = "data/h2o";

/// One reading from the analyzer
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Wall-clock time the frame finished parsing
    pub at: DateTime<Utc>,
    /// CO2 concentration (ppm)
    pub co2: f64,
    /// H2O concentration (ppt)
    pub h2o: f64,
    /// Optional deployment label
    pub site: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SampleParser {
    site: Option<String>,
}

impl SampleParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag every parsed sample with `site`
    pub fn with_site(site: impl Into<String>) -> Self {
        Self {
            site: Some(site.into()),
        }
    }

    /// Parse a frame into a sample.
    ///
    /// Missing or non-numeric `co2`/`h2o` values become `0.0`. Only frames that
    /// are not markup at all (after wrapping) fail.
    pub fn parse(&self, frame: &[u8]) -> Result<Sample, ParseError> {
        let text = std::str::from_utf8(frame).map_err(|e| {
            let valid = std::str::from_utf8(&frame[..e.valid_up_to()]).unwrap_or_default();
            ParseError::at("frame is not valid UTF-8", valid, valid.len())
        })?;

        let open = format!("<{WRAPPER_ELEMENT}>");
        let wrapped = format!("{open}{text}</{WRAPPER_ELEMENT}>");
        let doc = markup::parse_document(&wrapped).map_err(|mut e| {
            // Report positions relative to the frame, not the wrapper
            e.offset = e.offset.saturating_sub(open.len()).min(text.len());
            if e.line == 1 {
                e.column = e.column.saturating_sub(open.len()).max(1);
            }
            e
        })?;

        let co2 = doc.text_at(CO2_PATH).map_or(0.0, |t| coerce_float(&t));
        let h2o = doc.text_at(H2O_PATH).map_or(0.0, |t| coerce_float(&t));

        Ok(Sample {
            at: Utc::now(),
            co2,
            h2o,
            site: self.site.clone(),
        })
    }
}

/// Lenient text -> number conversion: the longest numeric prefix after
/// leading whitespace, or `0.0` if there is none.
pub fn coerce_float(text: &str) -> f64 {
    let mut input = text.trim_start();
    float_prefix
        .parse_next(&mut input)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn float_prefix<'a>(input: &mut &'a str) -> winnow::ModalResult<&'a str> {
    (
        opt(one_of(['+', '-'])),
        alt(((digit1, opt(('.', digit0))).void(), ('.', digit1).void())),
        opt((one_of(['e', 'E']), opt(one_of(['+', '-'])), digit1)),
    )
        .take()
        .parse_next(input)
}
