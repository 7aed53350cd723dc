//! Sample-then-publish run loop

use std::future::Future;
use std::time::Duration;

use li820::{FrameError, Instrument, Sample, SampleError, Sampler};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinError;

use crate::publisher::{Endpoints, PublishError, Publisher};

/// Pause after a failed read before the session is reopened
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

const SAMPLE_CHANNEL_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Sample(#[from] SampleError),
    #[error("Sampling task failed: {0}")]
    Task(#[from] JoinError),
}

/// What a finished run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Samples handed to the publisher
    pub published: u64,
    /// Frames dropped because they did not parse, were oversized, or could not be encoded
    pub skipped: u64,
    /// Reads that failed and forced a reopen
    pub read_errors: u64,
}

pub struct Server<I: Instrument> {
    sampler: Sampler<I>,
    publisher: Publisher,
    samples_tx: broadcast::Sender<Sample>,
    retry_delay: Duration,
}

impl<I: Instrument> Server<I> {
    /// Bind the publisher, then open the instrument.
    ///
    /// Either failure aborts startup. Endpoints are bound first so a missing
    /// device is reported with the publisher already released.
    pub async fn start(sampler: Sampler<I>, endpoints: &Endpoints) -> Result<Self, ServerError> {
        let publisher = Publisher::bind(endpoints).await?;
        let (sampler, opened) = tokio::task::spawn_blocking(move || {
            let mut sampler = sampler;
            let opened = sampler.open();
            (sampler, opened)
        })
        .await?;
        if let Err(e) = opened {
            error!("Could not open {}: {}", sampler.instrument().describe(), e);
            return Err(e.into());
        }
        Ok(Self::new(sampler, publisher))
    }

    pub fn new(sampler: Sampler<I>, publisher: Publisher) -> Self {
        let (samples_tx, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        Self {
            sampler,
            publisher,
            samples_tx,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// In-process feed of every published sample. Slow receivers lag, the loop never waits.
    pub fn subscribe_samples(&self) -> broadcast::Receiver<Sample> {
        self.samples_tx.subscribe()
    }

    /// Sample and publish until `shutdown` resolves or the source ends.
    ///
    /// Each blocking `sample()` call runs on the blocking pool. If shutdown
    /// arrives mid-read, that read finishes on its own and its result is
    /// discarded along with the sampler.
    pub async fn run<F>(self, shutdown: F) -> Result<RunSummary, ServerError>
    where
        F: Future<Output = ()>,
    {
        let Server {
            mut sampler,
            publisher,
            samples_tx,
            retry_delay,
        } = self;
        let mut summary = RunSummary::default();
        tokio::pin!(shutdown);

        info!("Sampling {}", sampler.instrument().describe());
        loop {
            let task = tokio::task::spawn_blocking(move || {
                let result = sampler.sample();
                (sampler, result)
            });
            let (returned, result) = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                joined = task => joined?,
            };
            sampler = returned;

            let sample = match result {
                Ok(sample) => sample,
                Err(SampleError::Parse(e)) => {
                    warn!("Skipping unparseable frame: {}", e);
                    summary.skipped += 1;
                    continue;
                }
                Err(SampleError::Frame(FrameError::Oversized { limit })) => {
                    warn!("Skipping frame longer than {} bytes", limit);
                    summary.skipped += 1;
                    continue;
                }
                Err(e) if e.is_end_of_stream() => {
                    info!("Source reached end of stream");
                    break;
                }
                Err(e) if e.is_open_failure() => {
                    error!("Reopening {} failed: {}", sampler.instrument().describe(), e);
                    return Err(e.into());
                }
                Err(e) => {
                    warn!("Read failed, reopening in {:?}: {}", retry_delay, e);
                    summary.read_errors += 1;
                    tokio::select! {
                        _ = &mut shutdown => {
                            info!("Shutdown requested");
                            break;
                        }
                        _ = tokio::time::sleep(retry_delay) => continue,
                    }
                }
            };

            // A subscriber that stops reading holds the broadcast indefinitely
            let published = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested while publishing");
                    break;
                }
                published = publisher.broadcast(&sample) => published,
            };
            match published {
                Ok(n) => debug!("Sample delivered to {} subscriber(s)", n),
                Err(e) => {
                    warn!("Skipping sample that could not be published: {}", e);
                    summary.skipped += 1;
                    continue;
                }
            }
            summary.published += 1;
            // No receivers is fine
            let _ = samples_tx.send(sample);
        }

        info!(
            "Sampling stopped: {} published, {} skipped, {} read errors",
            summary.published, summary.skipped, summary.read_errors
        );
        Ok(summary)
    }
}
