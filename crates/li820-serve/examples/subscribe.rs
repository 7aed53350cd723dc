//! Print every sample a running server publishes.
//!
//! Usage: cargo run -p li820-serve --example subscribe -- [ws://host:port]

use futures::StreamExt;
use li820_serve::decode_sample;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("ws://127.0.0.1:{}", li820_serve::DEFAULT_PORT));

    let (mut ws, _) = connect_async(&url).await?;
    println!("Subscribed to {}", url);

    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => match decode_sample(text.as_str()) {
                Ok(sample) => println!(
                    "{}  co2={:>8.2} ppm  h2o={:>8.4}{}",
                    sample.at.format("%Y-%m-%d %H:%M:%S%.3f"),
                    sample.co2,
                    sample.h2o,
                    sample.site.map(|s| format!("  site={s}")).unwrap_or_default()
                ),
                Err(e) => eprintln!("Bad record: {}", e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    println!("Server closed the connection");
    Ok(())
}
