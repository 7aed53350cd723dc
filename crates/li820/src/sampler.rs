//! Sampler: instrument session + frame reader + parser

use log::{debug, info, warn};

use crate::SampleError;
use crate::frame::FrameReader;
use crate::sample::{Sample, SampleParser};
use crate::source::{ByteSource, Instrument};

/// How long an instrument session lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPolicy {
    /// Open once and keep the session across samples. A failed read releases
    /// it and the next sample reopens.
    #[default]
    Persistent,
    /// Open, read one frame, close, for every sample. Bytes the instrument
    /// sends while the port is closed are lost.
    PerSample,
}

pub struct Sampler<I: Instrument> {
    instrument: I,
    policy: SessionPolicy,
    reader: FrameReader,
    parser: SampleParser,
    session: Option<I::Source>,
}

impl<I: Instrument> Sampler<I> {
    pub fn new(instrument: I) -> Self {
        Self {
            instrument,
            policy: SessionPolicy::default(),
            reader: FrameReader::default(),
            parser: SampleParser::default(),
            session: None,
        }
    }

    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_parser(mut self, parser: SampleParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_frame_reader(mut self, reader: FrameReader) -> Self {
        self.reader = reader;
        self
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn instrument(&self) -> &I {
        &self.instrument
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Acquire the session now instead of on the first sample.
    pub fn open(&mut self) -> Result<(), SampleError> {
        if self.session.is_none() {
            self.session = Some(self.acquire()?);
        }
        Ok(())
    }

    /// Release the session, if any.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.release(session);
        }
    }

    /// Read one frame and parse it.
    ///
    /// The session is released before returning whenever the policy says so
    /// or the read failed. A frame that fails to parse leaves a persistent
    /// session open, the stream is still aligned.
    pub fn sample(&mut self) -> Result<Sample, SampleError> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => self.acquire()?,
        };

        let frame = match self.reader.read_frame(&mut session) {
            Ok(frame) => frame,
            Err(e) => {
                self.release(session);
                return Err(e.into());
            }
        };

        let result = self.parser.parse(frame.as_bytes());

        match self.policy {
            SessionPolicy::Persistent => self.session = Some(session),
            SessionPolicy::PerSample => self.release(session),
        }

        let sample = result?;
        debug!("Sampled co2={} h2o={}", sample.co2, sample.h2o);
        Ok(sample)
    }

    fn acquire(&self) -> Result<I::Source, SampleError> {
        let session = self.instrument.open()?;
        match self.policy {
            SessionPolicy::Persistent => info!("Session opened: {}", self.instrument.describe()),
            SessionPolicy::PerSample => debug!("Session opened: {}", self.instrument.describe()),
        }
        Ok(session)
    }

    fn release(&self, mut session: I::Source) {
        if let Err(e) = session.close() {
            warn!("Closing {} failed: {}", self.instrument.describe(), e);
        }
        drop(session);
        debug!("Session released: {}", self.instrument.describe());
    }
}

impl<I: Instrument> Drop for Sampler<I> {
    fn drop(&mut self) {
        self.close();
    }
}
