//! Simulated analyzer for running without hardware
//!
//! Produces LI-820 style records at a fixed interval with slowly drifting
//! readings.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::source::{ByteSource, Instrument, SourceError};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct SimulatedInstrument {
    interval: Duration,
    readings: Arc<AtomicU64>,
}

impl SimulatedInstrument {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            readings: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records produced so far, across all sessions
    pub fn readings(&self) -> u64 {
        self.readings.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

impl Instrument for SimulatedInstrument {
    type Source = SimulatedSource;

    fn describe(&self) -> String {
        format!("simulated LI-820 every {:?}", self.interval)
    }

    fn open(&self) -> Result<SimulatedSource, SourceError> {
        Ok(SimulatedSource {
            interval: self.interval,
            readings: self.readings.clone(),
            pending: VecDeque::new(),
            next_at: None,
        })
    }
}

pub struct SimulatedSource {
    interval: Duration,
    readings: Arc<AtomicU64>,
    pending: VecDeque<u8>,
    next_at: Option<Instant>,
}

impl SimulatedSource {
    fn emit_record(&mut self) {
        if let Some(at) = self.next_at {
            let now = Instant::now();
            if at > now {
                thread::sleep(at - now);
            }
        }
        self.next_at = Some(Instant::now() + self.interval);

        let n = self.readings.fetch_add(1, Ordering::SeqCst);
        self.pending.extend(record(n).into_bytes());
    }
}

impl ByteSource for SimulatedSource {
    fn read_byte(&mut self) -> Result<u8, SourceError> {
        if self.pending.is_empty() {
            self.emit_record();
        }
        self.pending.pop_front().ok_or(SourceError::Closed)
    }
}

/// The `n`th simulated record, terminated with CRLF like the instrument's output.
pub fn record(n: u64) -> String {
    let t = n as f64;
    let co2 = 410.0 + 12.0 * (t / 30.0).sin() + 1.5 * (t / 3.0).cos();
    let h2o = 9.5 + 2.0 * (t / 90.0).sin();
    format!(
        "<li820><data><celltemp>5.1e1</celltemp><cellpres>9.7e1</cellpres>\
         <co2>{co2:.2}</co2><h2o>{h2o:.3}</h2o><ivolt>1.8e1</ivolt></data></li820>\r\n"
    )
}
