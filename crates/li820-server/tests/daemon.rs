//! Integration tests for the sampling daemon
//!
//! A simulated analyzer feeds the daemon; tests subscribe over WebSocket and
//! scrape the metrics endpoint like a Prometheus server would.

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use li820::SimulatedInstrument;
use li820_serve::{Endpoints, decode_sample};
use li820_server::{Daemon, ServerConfig};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

fn loopback_config() -> ServerConfig {
    ServerConfig {
        endpoints: Endpoints::tcp_only("127.0.0.1:0".parse().unwrap()),
        metrics_addr: Some("127.0.0.1:0".parse().unwrap()),
        site: Some("glbrc".into()),
        simulate: Some(Duration::from_millis(10)),
        ..ServerConfig::default()
    }
}

async fn scrape(addr: SocketAddr) -> String {
    let response = reqwest::get(format!("http://{}/metrics", addr))
        .await
        .expect("Metrics request failed");
    assert!(response.status().is_success());
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
    response.text().await.expect("Metrics body")
}

/// Value of the first series named `name`
fn series_value(text: &str, name: &str) -> Option<f64> {
    text.lines()
        .filter(|line| !line.starts_with('#'))
        .find(|line| line.starts_with(name))
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}

#[tokio::test]
async fn test_simulated_daemon_publishes_and_exports_metrics() {
    let config = loopback_config();
    let daemon = Daemon::start(SimulatedInstrument::new(Duration::from_millis(10)), &config)
        .await
        .unwrap();
    let metrics_addr = daemon.metrics_addr().expect("metrics enabled");
    let (mut ws, _) = connect_async(format!("ws://{}", daemon.publisher_addr()))
        .await
        .expect("Failed to connect");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let run = tokio::spawn(daemon.run(async {
        let _ = shutdown_rx.await;
    }));

    // Wait for a published record
    let sample = loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream closed")
            .expect("WebSocket error");
        if let Message::Text(text) = msg {
            break decode_sample(text.as_str()).expect("Invalid record");
        }
    };
    assert_eq!(sample.site.as_deref(), Some("glbrc"));
    assert!(sample.co2 > 0.0);

    let text = timeout(Duration::from_secs(5), async {
        loop {
            let text = scrape(metrics_addr).await;
            if series_value(&text, "li820_samples_total").unwrap_or(0.0) >= 1.0 {
                break text;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Metrics never counted a sample");
    assert!(text.contains(r#"trailer_co2_ppm{site="glbrc"}"#));
    assert!(series_value(&text, "trailer_co2_ppm").unwrap() > 0.0);

    shutdown_tx.send(()).unwrap();
    let summary = timeout(Duration::from_secs(5), run)
        .await
        .expect("Shutdown did not stop the daemon")
        .unwrap()
        .unwrap();
    assert!(summary.published >= 1);
    assert_eq!(summary.skipped, 0);
}

#[tokio::test]
async fn test_metrics_disabled() {
    let config = ServerConfig {
        metrics_addr: None,
        ..loopback_config()
    };
    let daemon = Daemon::start(SimulatedInstrument::new(Duration::from_millis(10)), &config)
        .await
        .unwrap();
    assert!(daemon.metrics_addr().is_none());
}

#[tokio::test]
async fn test_missing_serial_device_fails_startup() {
    let mut config = ServerConfig {
        endpoints: Endpoints::tcp_only("127.0.0.1:0".parse().unwrap()),
        metrics_addr: None,
        ..ServerConfig::default()
    };
    config.serial.device = "/dev/li820-does-not-exist".into();

    let err = li820_server::run(config, std::future::pending())
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("/dev/li820-does-not-exist"));
}
