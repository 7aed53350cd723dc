//! WebSocket fan-out publisher
//!
//! Subscribers connect over WebSocket, either on the TCP endpoint or on the
//! local socket file, and receive every published record as a text message.
//! Publication waits for room in each subscriber's queue, so a subscriber that
//! stops reading eventually stalls the publisher. Nothing is dropped.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use li820::Sample;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ProtocolError, encode_sample};

pub const DEFAULT_HOST: Ipv4Addr = Ipv4Addr::UNSPECIFIED;
pub const DEFAULT_PORT: u16 = 5556;
pub const DEFAULT_IPC_PATH: &str = "weather.ipc";

/// Messages buffered per subscriber before `broadcast` waits on it
const SUBSCRIBER_QUEUE: usize = 16;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Where subscribers can connect. Fixed for the lifetime of a [`Publisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub tcp: SocketAddr,
    /// Local socket file; Unix only
    pub ipc: Option<PathBuf>,
}

impl Endpoints {
    pub fn tcp_only(tcp: SocketAddr) -> Self {
        Self { tcp, ipc: None }
    }

    pub fn with_ipc(mut self, path: impl Into<PathBuf>) -> Self {
        self.ipc = Some(path.into());
        self
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            tcp: SocketAddr::V4(SocketAddrV4::new(DEFAULT_HOST, DEFAULT_PORT)),
            ipc: Some(PathBuf::from(DEFAULT_IPC_PATH)),
        }
    }
}

type SubscriberId = u64;

struct Subscriber {
    peer: String,
    tx: mpsc::Sender<Message>,
}

struct SharedState {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
}

impl SharedState {
    fn subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, peer: String, tx: mpsc::Sender<Message>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers().insert(id, Subscriber { peer, tx });
        id
    }

    fn remove(&self, id: SubscriberId) -> Option<Subscriber> {
        self.subscribers().remove(&id)
    }
}

pub struct Publisher {
    state: Arc<SharedState>,
    local_addr: SocketAddr,
    ipc_path: Option<PathBuf>,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl Publisher {
    /// Bind every endpoint. Fails without serving anything if any bind fails.
    pub async fn bind(endpoints: &Endpoints) -> Result<Self, PublishError> {
        let tcp_endpoint = format!("tcp://{}", endpoints.tcp);
        let listener = TcpListener::bind(endpoints.tcp)
            .await
            .map_err(|source| PublishError::Bind {
                endpoint: tcp_endpoint.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| PublishError::Bind {
                endpoint: tcp_endpoint,
                source,
            })?;

        let ipc_listener = match &endpoints.ipc {
            Some(path) => Some(ipc::bind(path)?),
            None => None,
        };

        let state = Arc::new(SharedState {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        info!("Publishing on tcp://{}", local_addr);
        let mut accept_tasks = vec![tokio::spawn(accept_tcp(listener, state.clone()))];
        if let (Some(listener), Some(path)) = (ipc_listener, &endpoints.ipc) {
            info!("Publishing on ipc://{}", path.display());
            accept_tasks.push(tokio::spawn(ipc::accept(
                listener,
                path.clone(),
                state.clone(),
            )));
        }

        Ok(Self {
            state,
            local_addr,
            ipc_path: endpoints.ipc.clone(),
            accept_tasks,
        })
    }

    /// Address the TCP endpoint actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ipc_path(&self) -> Option<&Path> {
        self.ipc_path.as_deref()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.subscribers().len()
    }

    /// Encode and publish a sample. Returns the number of subscribers it was queued for.
    pub async fn broadcast(&self, sample: &Sample) -> Result<usize, PublishError> {
        let payload = encode_sample(sample)?;
        Ok(self.broadcast_text(payload).await)
    }

    /// Publish an already encoded record to every current subscriber.
    ///
    /// Subscribers whose connection has gone away are dropped; the rest still
    /// receive the record.
    pub async fn broadcast_text(&self, payload: String) -> usize {
        let targets: Vec<(SubscriberId, String, mpsc::Sender<Message>)> = self
            .state
            .subscribers()
            .iter()
            .map(|(id, sub)| (*id, sub.peer.clone(), sub.tx.clone()))
            .collect();

        let message = Message::Text(payload.into());
        let mut delivered = 0;
        for (id, peer, tx) in targets {
            match tx.send(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!("Send to subscriber {} ({}) failed: connection closed", id, peer);
                    self.state.remove(id);
                }
            }
        }
        debug!("Published to {} subscriber(s)", delivered);
        delivered
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        for task in &self.accept_tasks {
            task.abort();
        }
        // Dropping the senders ends each subscriber's writer, which closes the socket
        self.state.subscribers().clear();
        if let Some(path) = &self.ipc_path {
            ipc::remove_socket_file(path);
        }
    }
}

async fn accept_tcp(listener: TcpListener, state: Arc<SharedState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_subscriber(stream, peer.to_string(), state.clone()));
            }
            Err(e) => {
                error!("Accept on tcp endpoint failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_subscriber<S>(stream: S, peer: String, state: Arc<SharedState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (tx, mut rx) = mpsc::channel::<Message>(SUBSCRIBER_QUEUE);
    let id = state.register(peer.clone(), tx);
    info!("Subscriber {} connected from {}", id, peer);

    // Forward queued records to the socket
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_tx.send(msg).await {
                debug!("Write to subscriber {} failed: {}", id, e);
                return;
            }
        }
        if let Err(e) = ws_tx.close().await {
            debug!("Closing subscriber {} failed: {}", id, e);
        }
    });

    // Subscribers only listen; drain until they go away
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Read from subscriber {} failed: {}", id, e);
                break;
            }
        }
    }

    if state.remove(id).is_some() {
        forward_task.abort();
    }
    info!("Subscriber {} disconnected", id);
}

#[cfg(unix)]
mod ipc {
    use std::io::ErrorKind;
    use std::os::unix::fs::FileTypeExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use log::{debug, error, warn};
    use tokio::net::UnixListener;

    use super::{PublishError, SharedState, handle_subscriber};

    pub(super) fn bind(path: &Path) -> Result<UnixListener, PublishError> {
        let endpoint = format!("ipc://{}", path.display());
        // A socket file left behind by a previous run would make bind fail
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => {
                std::fs::remove_file(path).map_err(|source| PublishError::Bind {
                    endpoint: endpoint.clone(),
                    source,
                })?;
                debug!("Removed stale socket file {}", path.display());
            }
            _ => {}
        }
        UnixListener::bind(path).map_err(|source| PublishError::Bind { endpoint, source })
    }

    pub(super) async fn accept(listener: UnixListener, path: PathBuf, state: Arc<SharedState>) {
        let mut connections = 0u64;
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    connections += 1;
                    let peer = format!("ipc://{}#{}", path.display(), connections);
                    tokio::spawn(handle_subscriber(stream, peer, state.clone()));
                }
                Err(e) => {
                    error!("Accept on ipc://{} failed: {}", path.display(), e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub(super) fn remove_socket_file(path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }
}

#[cfg(not(unix))]
mod ipc {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use super::{PublishError, SharedState};

    pub(super) enum Never {}

    pub(super) fn bind(path: &Path) -> Result<Never, PublishError> {
        Err(PublishError::Bind {
            endpoint: format!("ipc://{}", path.display()),
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "local socket endpoints require a Unix platform",
            ),
        })
    }

    pub(super) async fn accept(listener: Never, _path: PathBuf, _state: Arc<SharedState>) {
        match listener {}
    }

    pub(super) fn remove_socket_file(_path: &Path) {}
}
