//! LI-820 Server CLI
//!
//! A thin wrapper around the li820-server library.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use li820::serial::{DEFAULT_BAUD_RATE, DEFAULT_DEVICE};
use li820_serve::{DEFAULT_HOST, DEFAULT_IPC_PATH, DEFAULT_PORT, Endpoints, SessionPolicy};
use li820_server::{DEFAULT_METRICS_PORT, ServerConfig};

#[derive(Parser)]
#[command(name = "li820-server")]
#[command(about = "Publish LI-820 CO2/H2O readings over WebSocket")]
#[command(after_help = "\
EXAMPLES:
    # Field setup: /dev/ttyS4 at 9600 baud, ws://0.0.0.0:5556 and ./weather.ipc
    li820-server

    # Another port, tagged with a site name
    li820-server --device /dev/ttyUSB0 --site glbrc

    # No hardware: generated readings every 250ms, TCP only
    li820-server --simulate --simulate-interval-ms 250 --no-ipc
")]
struct Args {
    /// Serial device the analyzer is attached to
    #[arg(long, default_value = DEFAULT_DEVICE)]
    device: String,

    /// Serial bit rate
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Host to bind the publisher and metrics endpoints to
    #[arg(long, default_value_t = IpAddr::V4(DEFAULT_HOST))]
    host: IpAddr,

    /// Publisher port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Local socket file for subscribers on the same machine
    #[arg(long, default_value = DEFAULT_IPC_PATH, conflicts_with = "no_ipc")]
    ipc: PathBuf,

    /// Do not bind the local socket file
    #[arg(long)]
    no_ipc: bool,

    /// Site name attached to every sample
    #[arg(long)]
    site: Option<String>,

    /// Prometheus metrics port. Use 0 to disable.
    #[arg(long, default_value_t = DEFAULT_METRICS_PORT)]
    metrics_port: u16,

    /// Reopen the serial port for every sample instead of holding it open
    #[arg(long)]
    per_sample_session: bool,

    /// Generate readings instead of reading the serial port
    #[arg(long)]
    simulate: bool,

    /// Interval between generated readings
    #[arg(long, default_value = "1000", requires = "simulate")]
    simulate_interval_ms: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        let mut endpoints = Endpoints::tcp_only(SocketAddr::new(self.host, self.port));
        if !self.no_ipc {
            endpoints = endpoints.with_ipc(self.ipc);
        }
        ServerConfig {
            serial: li820::SerialConfig {
                device: self.device,
                baud_rate: self.baud,
                ..defaults.serial
            },
            endpoints,
            site: self.site,
            metrics_addr: (self.metrics_port != 0)
                .then(|| SocketAddr::new(self.host, self.metrics_port)),
            policy: if self.per_sample_session {
                SessionPolicy::PerSample
            } else {
                SessionPolicy::Persistent
            },
            simulate: self
                .simulate
                .then(|| Duration::from_millis(self.simulate_interval_ms)),
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Received Ctrl-C"),
        Err(e) => {
            log::error!("Cannot listen for Ctrl-C, running until killed: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    log::debug!("Config: {:?}", config);

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(li820_server::run(config, shutdown_signal()));
    // A read blocked on a silent serial line never returns on its own
    runtime.shutdown_timeout(Duration::from_secs(1));

    let summary = result?;
    log::info!(
        "Exiting after {} samples ({} skipped, {} read errors)",
        summary.published,
        summary.skipped,
        summary.read_errors
    );
    Ok(())
}
