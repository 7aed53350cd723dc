//! Prometheus exposition of the latest sample

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use li820::Sample;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub const DEFAULT_METRICS_PORT: u16 = 9092;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Latest readings plus a running sample count. Lock-free, shared with the HTTP handler.
#[derive(Debug)]
pub struct Metrics {
    site: Option<String>,
    co2_bits: AtomicU64,
    h2o_bits: AtomicU64,
    samples: AtomicU64,
}

impl Metrics {
    pub fn new(site: Option<String>) -> Self {
        Self {
            site,
            co2_bits: AtomicU64::new(0f64.to_bits()),
            h2o_bits: AtomicU64::new(0f64.to_bits()),
            samples: AtomicU64::new(0),
        }
    }

    pub fn record(&self, sample: &Sample) {
        self.co2_bits.store(sample.co2.to_bits(), Ordering::Relaxed);
        self.h2o_bits.store(sample.h2o.to_bits(), Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn co2(&self) -> f64 {
        f64::from_bits(self.co2_bits.load(Ordering::Relaxed))
    }

    pub fn h2o(&self) -> f64 {
        f64::from_bits(self.h2o_bits.load(Ordering::Relaxed))
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Text exposition format
    pub fn render(&self) -> String {
        let labels = match &self.site {
            Some(site) => format!("{{site=\"{}\"}}", escape_label(site)),
            None => String::new(),
        };
        let mut out = String::new();
        let _ = writeln!(out, "# HELP trailer_co2_ppm Current CO2 value measured on the licor.");
        let _ = writeln!(out, "# TYPE trailer_co2_ppm gauge");
        let _ = writeln!(out, "trailer_co2_ppm{} {}", labels, self.co2());
        let _ = writeln!(out, "# HELP trailer_h2o Current H2O value measured on the licor.");
        let _ = writeln!(out, "# TYPE trailer_h2o gauge");
        let _ = writeln!(out, "trailer_h2o{} {}", labels, self.h2o());
        let _ = writeln!(out, "# HELP li820_samples_total Samples read from the licor.");
        let _ = writeln!(out, "# TYPE li820_samples_total counter");
        let _ = writeln!(out, "li820_samples_total{} {}", labels, self.samples());
        out
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    debug!("GET /metrics");
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], metrics.render())
}

pub fn build_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Bind the metrics endpoint and serve it in the background.
///
/// Returns the bound address alongside the task so port 0 can be resolved.
pub async fn serve(
    metrics: Arc<Metrics>,
    addr: SocketAddr,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("Metrics on http://{}/metrics", local_addr);
    let router = build_router(metrics);
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            warn!("Metrics endpoint stopped: {}", e);
        }
    });
    Ok((local_addr, task))
}

/// Feed every sample from the run loop into `metrics` until the loop ends.
pub fn spawn_recorder(
    metrics: Arc<Metrics>,
    mut samples: broadcast::Receiver<Sample>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match samples.recv().await {
                Ok(sample) => metrics.record(&sample),
                Err(RecvError::Lagged(n)) => debug!("Metrics recorder skipped {} samples", n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
