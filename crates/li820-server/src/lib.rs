//! LI-820 Server - sampling daemon
//!
//! Ties a serial (or simulated) LI-820 to the WebSocket publisher and an
//! optional Prometheus metrics endpoint.
//!
//! # Example
//!
//! ```ignore
//! use li820_server::{ServerConfig, run};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let summary = run(ServerConfig::default(), async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     println!("published {} samples", summary.published);
//!     Ok(())
//! }
//! ```

pub mod metrics;

pub use metrics::{DEFAULT_METRICS_PORT, Metrics};

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use li820::{Instrument, SampleParser, SerialConfig, SerialInstrument, SimulatedInstrument};
use li820_serve::{Endpoints, RunSummary, Sampler, Server, SessionPolicy};
use log::info;
use tokio::task::JoinHandle;

/// Everything the daemon needs to start. `Default` is the fixed field setup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub serial: SerialConfig,
    pub endpoints: Endpoints,
    /// Tag attached to every published sample
    pub site: Option<String>,
    /// `None` disables the metrics endpoint
    pub metrics_addr: Option<SocketAddr>,
    pub policy: SessionPolicy,
    /// Replace the serial port with generated readings at this interval
    pub simulate: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            endpoints: Endpoints::default(),
            site: None,
            metrics_addr: Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_METRICS_PORT))),
            policy: SessionPolicy::default(),
            simulate: None,
        }
    }
}

/// A started daemon: endpoints bound, instrument open, not yet sampling.
pub struct Daemon<I: Instrument> {
    server: Server<I>,
    metrics_addr: Option<SocketAddr>,
    metrics_tasks: Vec<JoinHandle<()>>,
}

impl<I: Instrument> Daemon<I> {
    pub async fn start(instrument: I, config: &ServerConfig) -> anyhow::Result<Self> {
        let parser = match &config.site {
            Some(site) => SampleParser::with_site(site.clone()),
            None => SampleParser::new(),
        };
        let sampler = Sampler::new(instrument)
            .with_policy(config.policy)
            .with_parser(parser);
        let server = Server::start(sampler, &config.endpoints)
            .await
            .context("Failed to start sample server")?;

        let mut metrics_tasks = Vec::new();
        let metrics_addr = match config.metrics_addr {
            Some(addr) => {
                let metrics = Arc::new(Metrics::new(config.site.clone()));
                let (bound, http_task) = metrics::serve(metrics.clone(), addr)
                    .await
                    .with_context(|| format!("Failed to bind metrics endpoint {}", addr))?;
                metrics_tasks.push(http_task);
                metrics_tasks.push(metrics::spawn_recorder(metrics, server.subscribe_samples()));
                Some(bound)
            }
            None => None,
        };

        Ok(Self {
            server,
            metrics_addr,
            metrics_tasks,
        })
    }

    pub fn publisher_addr(&self) -> SocketAddr {
        self.server.publisher().local_addr()
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let summary = self.server.run(shutdown).await;
        for task in &self.metrics_tasks {
            task.abort();
        }
        Ok(summary?)
    }
}

/// Start with the configured instrument and sample until `shutdown` resolves.
pub async fn run<F>(config: ServerConfig, shutdown: F) -> anyhow::Result<RunSummary>
where
    F: Future<Output = ()>,
{
    match config.simulate {
        Some(interval) => {
            info!("Simulating an LI-820, one reading every {:?}", interval);
            Daemon::start(SimulatedInstrument::new(interval), &config)
                .await?
                .run(shutdown)
                .await
        }
        None => {
            Daemon::start(SerialInstrument::new(config.serial.clone()), &config)
                .await?
                .run(shutdown)
                .await
        }
    }
}
