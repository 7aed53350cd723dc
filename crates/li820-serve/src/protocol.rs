//! Wire record for published samples
//!
//! Every sample goes out as one JSON text message:
//! `{"at":"2024-05-01T12:00:00.123456789Z","co2":412.5,"h2o":0.0031}`
//! with an extra `"site"` key when the server is configured with one.

use chrono::{DateTime, Utc};
use li820::Sample;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Cannot encode non-finite {field} value {value}")]
    NonFinite { field: &'static str, value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleMessage {
    pub at: DateTime<Utc>,
    pub co2: f64,
    pub h2o: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
}

impl From<&Sample> for SampleMessage {
    fn from(sample: &Sample) -> Self {
        Self {
            at: sample.at,
            co2: sample.co2,
            h2o: sample.h2o,
            site: sample.site.clone(),
        }
    }
}

impl From<SampleMessage> for Sample {
    fn from(msg: SampleMessage) -> Self {
        Sample {
            at: msg.at,
            co2: msg.co2,
            h2o: msg.h2o,
            site: msg.site,
        }
    }
}

/// Encode a sample as its wire record.
pub fn encode_sample(sample: &Sample) -> Result<String, ProtocolError> {
    for (field, value) in [("co2", sample.co2), ("h2o", sample.h2o)] {
        if !value.is_finite() {
            return Err(ProtocolError::NonFinite { field, value });
        }
    }
    Ok(serde_json::to_string(&SampleMessage::from(sample))?)
}

/// Decode a wire record back into a sample.
pub fn decode_sample(text: &str) -> Result<Sample, ProtocolError> {
    let msg: SampleMessage = serde_json::from_str(text)?;
    Ok(msg.into())
}
