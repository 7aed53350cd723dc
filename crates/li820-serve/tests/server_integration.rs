//! Integration tests for the LI-820 sample server
//!
//! These tests verify the black-box behavior of the server:
//! - A frame on the byte source reaches every WebSocket subscriber as one JSON record
//! - Unparseable frames are skipped, failed reads reopen the session
//! - Startup fails loudly when an endpoint or the instrument is unavailable
//! - The run loop stops on shutdown even while a read is blocked

use std::collections::VecDeque;
use std::io::{self, Cursor, Read};
use std::net::SocketAddr;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use futures::StreamExt;
use li820::{ReaderInstrument, SampleParser, SerialConfig, SerialInstrument};
use li820_serve::{
    Endpoints, PublishError, RunSummary, Sample, Sampler, Server, ServerError, decode_sample,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SINGLE_READING: &[u8] = b"<li820><data><co2>412.5</co2><h2o>0.0031</h2o></data></li820>";

fn loopback() -> Endpoints {
    Endpoints::tcp_only("127.0.0.1:0".parse().unwrap())
}

fn fixture(bytes: &[u8]) -> ReaderInstrument<Cursor<Vec<u8>>> {
    ReaderInstrument::new("fixture", Cursor::new(bytes.to_vec()))
}

/// Connect a WebSocket subscriber to the TCP endpoint
async fn connect_client(addr: SocketAddr) -> WsStream {
    let url = format!("ws://{}", addr);
    let (ws, _) = connect_async(&url).await.expect("Failed to connect");
    ws
}

/// Block until the publisher has registered `n` subscribers
async fn wait_for_subscribers<I: li820::Instrument>(server: &Server<I>, n: usize) {
    timeout(Duration::from_secs(2), async {
        while server.publisher().subscriber_count() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Subscribers never registered");
}

/// Receive the next published record, with timeout
async fn recv_sample<S>(ws: &mut WebSocketStream<S>) -> Sample
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let msg = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("Timeout waiting for message")
        .expect("Stream closed")
        .expect("WebSocket error");

    match msg {
        Message::Text(text) => decode_sample(text.as_str()).expect("Invalid record"),
        other => panic!("Expected text message, got {:?}", other),
    }
}

/// Assert that nothing but a close follows
async fn expect_closed<S>(ws: &mut WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let next = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("Timeout waiting for close");
    match next {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("Expected close, got {:?}", other),
    }
}

async fn run_to_end<I: li820::Instrument>(server: Server<I>) -> RunSummary {
    timeout(Duration::from_secs(5), server.run(std::future::pending()))
        .await
        .expect("Run loop did not finish")
        .expect("Run loop failed")
}

/// Reader fed by a channel; blocks until bytes arrive, ends when the sender drops
struct ChannelReader {
    rx: std_mpsc::Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

// ============ Tests ============

/// Test: one frame on the wire becomes exactly one published record
#[tokio::test]
async fn test_single_reading_published_once() {
    let server = Server::start(Sampler::new(fixture(SINGLE_READING)), &loopback())
        .await
        .unwrap();
    let mut ws = connect_client(server.publisher().local_addr()).await;
    wait_for_subscribers(&server, 1).await;

    let summary = run_to_end(server).await;
    assert_eq!(summary.published, 1);

    let sample = recv_sample(&mut ws).await;
    assert_eq!(sample.co2, 412.5);
    assert_eq!(sample.h2o, 0.0031);
    assert!(sample.site.is_none());
    assert!(!sample.at.to_rfc3339().is_empty());

    expect_closed(&mut ws).await;
}

/// Test: empty data publishes zeros
#[tokio::test]
async fn test_empty_data_publishes_zeros() {
    let server = Server::start(
        Sampler::new(fixture(b"<li820><data></data></li820>")),
        &loopback(),
    )
    .await
    .unwrap();
    let mut ws = connect_client(server.publisher().local_addr()).await;
    wait_for_subscribers(&server, 1).await;

    run_to_end(server).await;

    let sample = recv_sample(&mut ws).await;
    assert_eq!(sample.co2, 0.0);
    assert_eq!(sample.h2o, 0.0);
}

/// Test: every subscriber receives every record, in order
#[tokio::test]
async fn test_fan_out_to_all_subscribers() {
    let stream = b"junk<li820><data><co2>400</co2><h2o>1</h2o></data></li820>\r\n\
<li820><data><co2>401</co2><h2o>2</h2o></data></li820>\r\n";
    let server = Server::start(Sampler::new(fixture(stream)), &loopback())
        .await
        .unwrap();
    let addr = server.publisher().local_addr();
    let mut first = connect_client(addr).await;
    let mut second = connect_client(addr).await;
    wait_for_subscribers(&server, 2).await;

    assert_eq!(run_to_end(server).await.published, 2);

    for ws in [&mut first, &mut second] {
        assert_eq!(recv_sample(&mut *ws).await.co2, 400.0);
        assert_eq!(recv_sample(&mut *ws).await.co2, 401.0);
    }
}

/// Test: a frame that is not markup is skipped, the next one still goes out
#[tokio::test]
async fn test_malformed_frame_skipped() {
    let stream = b"<li820><data><<</data></li820><li820><data><co2>3</co2></data></li820>";
    let instrument = fixture(stream);
    let server = Server::start(Sampler::new(instrument.clone()), &loopback())
        .await
        .unwrap();
    let mut ws = connect_client(server.publisher().local_addr()).await;
    wait_for_subscribers(&server, 1).await;

    let summary = run_to_end(server).await;
    assert_eq!(
        summary,
        RunSummary {
            published: 1,
            skipped: 1,
            read_errors: 0
        }
    );
    assert_eq!(instrument.sessions_opened(), 1);

    let sample = recv_sample(&mut ws).await;
    assert_eq!(sample.co2, 3.0);
    expect_closed(&mut ws).await;
}

/// Test: a frame cut short releases the session and the loop reopens it
#[tokio::test]
async fn test_incomplete_frame_reopens_session() {
    let instrument = fixture(b"<li820><data><co2>1");
    let server = Server::start(Sampler::new(instrument.clone()), &loopback())
        .await
        .unwrap()
        .with_retry_delay(Duration::from_millis(10));

    let summary = run_to_end(server).await;
    assert_eq!(summary.read_errors, 1);
    assert_eq!(summary.published, 0);
    assert_eq!(instrument.sessions_opened(), 2);
    assert_eq!(instrument.sessions_active(), 0);
}

/// Test: an occupied port aborts startup before the instrument is touched
#[tokio::test]
async fn test_bind_failure_aborts_startup() {
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoints = Endpoints::tcp_only(occupied.local_addr().unwrap());
    let instrument = fixture(SINGLE_READING);

    let result = Server::start(Sampler::new(instrument.clone()), &endpoints).await;
    match result {
        Err(ServerError::Publish(PublishError::Bind { endpoint, .. })) => {
            assert!(endpoint.starts_with("tcp://"));
        }
        Err(other) => panic!("Expected bind failure, got {}", other),
        Ok(_) => panic!("Expected bind failure, server started"),
    }
    assert_eq!(instrument.sessions_opened(), 0);
}

/// Test: a missing device aborts startup
#[tokio::test]
async fn test_missing_device_aborts_startup() {
    let config = SerialConfig {
        device: "/dev/li820-does-not-exist".into(),
        ..SerialConfig::default()
    };
    let result = Server::start(Sampler::new(SerialInstrument::new(config)), &loopback()).await;
    match result {
        Err(ServerError::Sample(e)) => assert!(e.is_open_failure()),
        Err(other) => panic!("Expected open failure, got {}", other),
        Ok(_) => panic!("Expected open failure, server started"),
    }
}

/// Test: shutdown ends the run while a read is still blocked
#[tokio::test]
async fn test_shutdown_interrupts_blocked_read() {
    let (bytes_tx, bytes_rx) = std_mpsc::channel();
    let instrument = ReaderInstrument::new(
        "channel",
        ChannelReader {
            rx: bytes_rx,
            pending: VecDeque::new(),
        },
    );
    let server = Server::start(Sampler::new(instrument), &loopback())
        .await
        .unwrap();
    let mut samples = server.subscribe_samples();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let run = tokio::spawn(server.run(async {
        let _ = shutdown_rx.await;
    }));

    bytes_tx.send(SINGLE_READING.to_vec()).unwrap();
    let sample = timeout(Duration::from_secs(2), samples.recv())
        .await
        .expect("Timeout waiting for sample")
        .unwrap();
    assert_eq!(sample.co2, 412.5);

    // The loop is now blocked waiting for the next frame
    shutdown_tx.send(()).unwrap();
    let summary = timeout(Duration::from_secs(2), run)
        .await
        .expect("Shutdown did not stop the loop")
        .unwrap()
        .unwrap();
    assert_eq!(summary.published, 1);

    // Lets the abandoned read finish
    drop(bytes_tx);
}

#[cfg(unix)]
mod ipc {
    use super::*;
    use tokio::net::UnixStream;
    use tokio_tungstenite::client_async;

    async fn connect_ipc(path: &std::path::Path) -> WebSocketStream<UnixStream> {
        let stream = UnixStream::connect(path).await.expect("Failed to connect");
        let (ws, _) = client_async("ws://localhost/", stream)
            .await
            .expect("Handshake failed");
        ws
    }

    /// Test: subscribers on the socket file get the same records as TCP ones
    #[tokio::test]
    async fn test_ipc_subscriber_receives_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weather.ipc");
        let endpoints = loopback().with_ipc(&path);

        let server = Server::start(Sampler::new(fixture(SINGLE_READING)), &endpoints)
            .await
            .unwrap();
        assert_eq!(server.publisher().ipc_path(), Some(path.as_path()));

        let mut local = connect_ipc(&path).await;
        let mut remote = connect_client(server.publisher().local_addr()).await;
        wait_for_subscribers(&server, 2).await;

        run_to_end(server).await;

        assert_eq!(recv_sample(&mut local).await.co2, 412.5);
        assert_eq!(recv_sample(&mut remote).await.co2, 412.5);
        assert!(!path.exists(), "socket file left behind");
    }

    /// Test: a socket file left by a dead process is replaced
    #[tokio::test]
    async fn test_stale_socket_file_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weather.ipc");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let server = Server::start(
            Sampler::new(fixture(SINGLE_READING)),
            &loopback().with_ipc(&path),
        )
        .await
        .unwrap();
        let _ws = connect_ipc(&path).await;
        wait_for_subscribers(&server, 1).await;
    }

    /// Test: a regular file at the socket path is never deleted
    #[tokio::test]
    async fn test_regular_file_at_socket_path_fails_bind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weather.ipc");
        std::fs::write(&path, b"keep me").unwrap();

        let result = Server::start(
            Sampler::new(fixture(SINGLE_READING)),
            &loopback().with_ipc(&path),
        )
        .await;
        assert!(matches!(
            result,
            Err(ServerError::Publish(PublishError::Bind { .. }))
        ));
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }
}

/// Test: a reading that cannot be encoded is skipped, not counted or forwarded
#[tokio::test]
async fn test_unencodable_sample_skipped() {
    let stream = b"<li820><data><co2>1e999</co2></data></li820>\
<li820><data><co2>401</co2></data></li820>";
    let server = Server::start(Sampler::new(fixture(stream)), &loopback())
        .await
        .unwrap();
    let mut samples = server.subscribe_samples();
    let mut ws = connect_client(server.publisher().local_addr()).await;
    wait_for_subscribers(&server, 1).await;

    let summary = run_to_end(server).await;
    assert_eq!(
        summary,
        RunSummary {
            published: 1,
            skipped: 1,
            read_errors: 0
        }
    );

    assert_eq!(samples.recv().await.unwrap().co2, 401.0);
    assert!(samples.recv().await.is_err());
    assert_eq!(recv_sample(&mut ws).await.co2, 401.0);
    expect_closed(&mut ws).await;
}

/// Test: shutdown ends the run while a subscriber that never reads has stalled publication
#[tokio::test]
async fn test_shutdown_with_stalled_subscriber() {
    const FRAMES: usize = 2000;
    let stream = "<li820><data><co2>400</co2></data></li820>".repeat(FRAMES);
    // Large records fill the socket buffers after a few dozen samples
    let sampler = Sampler::new(fixture(stream.as_bytes()))
        .with_parser(SampleParser::with_site("x".repeat(200_000)));
    let server = Server::start(sampler, &loopback()).await.unwrap();
    let _stalled = connect_client(server.publisher().local_addr()).await;
    wait_for_subscribers(&server, 1).await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let run = tokio::spawn(server.run(async {
        let _ = shutdown_rx.await;
    }));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!run.is_finished(), "publication never stalled");
    shutdown_tx.send(()).unwrap();

    let summary = timeout(Duration::from_secs(3), run)
        .await
        .expect("Shutdown did not stop a stalled run")
        .unwrap()
        .unwrap();
    assert!(summary.published < FRAMES as u64);
}
