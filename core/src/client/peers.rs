//! Peer connection manager
//!
//! One relay socket per pairing notice, opened at `<url>/connect/<id>` and
//! surfaced to the application as an in-memory byte stream. A closed relay is
//! reopened with the same id after `retry_delay` unless the id was banned or
//! the manager destroyed.

use super::discovery::PairingHandler;
use super::{ClientConfig, ClientError, RootUrl};
use crate::channel::ConnectId;
use crate::scheduler::ScheduledTask;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const READ_CHUNK: usize = 16 * 1024;

/// How a connection reached the peer. Only relayed connections exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Relay,
}

/// Metadata handed to the application with each relay stream
#[derive(Clone)]
pub struct ConnectionDetails {
    pub connect_id: ConnectId,
    pub is_client: bool,
    pub kind: ConnectionKind,
    manager: Weak<PeerShared>,
}

impl ConnectionDetails {
    /// Never reconnect this id once its current connection closes
    pub fn ban(&self) {
        if let Some(shared) = self.manager.upgrade() {
            shared.ban(&self.connect_id);
        }
    }
}

impl fmt::Debug for ConnectionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDetails")
            .field("connect_id", &self.connect_id)
            .field("is_client", &self.is_client)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A live relay: read/write `stream` to talk to the peer
#[derive(Debug)]
pub struct RelayConnection {
    pub stream: DuplexStream,
    pub details: ConnectionDetails,
}

struct PeerRecord {
    generation: u64,
    // Dropping the sender stops the pump
    _shutdown: oneshot::Sender<()>,
}

#[derive(Default)]
struct PeerState {
    closed: bool,
    peers: HashMap<ConnectId, PeerRecord>,
    banned: HashSet<ConnectId>,
    retries: HashMap<ConnectId, ScheduledTask>,
    next_generation: u64,
}

struct PeerShared {
    root: RootUrl,
    retry_delay: Duration,
    relay_buffer: usize,
    state: Mutex<PeerState>,
    connections: mpsc::UnboundedSender<RelayConnection>,
}

impl PeerShared {
    fn on_pairing(self: &Arc<Self>, id: ConnectId, is_client: bool) {
        let (generation, shutdown) = {
            let mut state = self.state.lock();
            if state.closed {
                debug!("Ignoring pairing {} after destroy", id);
                return;
            }
            if state.peers.contains_key(&id) {
                debug!("Already tracking {}", id);
                return;
            }
            if let Some(retry) = state.retries.remove(&id) {
                retry.cancel();
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            let (tx, rx) = oneshot::channel();
            state.peers.insert(
                id.clone(),
                PeerRecord {
                    generation,
                    _shutdown: tx,
                },
            );
            (generation, rx)
        };

        tokio::spawn(Arc::clone(self).run_peer(id, is_client, generation, shutdown));
    }

    async fn run_peer(
        self: Arc<Self>,
        id: ConnectId,
        is_client: bool,
        generation: u64,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let url = self.root.relay_url(&id);
        let attempt = tokio::select! {
            result = connect_async(url.as_str()) => Some(result),
            _ = &mut shutdown => None,
        };

        match attempt {
            Some(Ok((socket, _))) => {
                let (app_side, relay_side) = tokio::io::duplex(self.relay_buffer);
                let details = ConnectionDetails {
                    connect_id: id.clone(),
                    is_client,
                    kind: ConnectionKind::Relay,
                    manager: Arc::downgrade(&self),
                };
                info!("Relay {} open (client: {})", id, is_client);
                if self
                    .connections
                    .send(RelayConnection {
                        stream: app_side,
                        details,
                    })
                    .is_err()
                {
                    debug!("No receiver for relay {}", id);
                }
                pump(socket, relay_side, &mut shutdown).await;
            }
            Some(Err(e)) => warn!("Failed to open relay {}: {}", id, e),
            None => {}
        }

        self.on_close(id, is_client, generation);
    }

    fn on_close(self: &Arc<Self>, id: ConnectId, is_client: bool, generation: u64) {
        let mut state = self.state.lock();
        match state.peers.get(&id).map(|record| record.generation) {
            Some(current) if current != generation => return,
            Some(_) => {
                state.peers.remove(&id);
            }
            None => {}
        }

        if state.closed {
            return;
        }
        if state.banned.contains(&id) {
            info!("Relay {} closed; banned, not retrying", id);
            return;
        }

        info!("Relay {} closed; retrying in {:?}", id, self.retry_delay);
        let shared = Arc::clone(self);
        let retry_id = id.clone();
        let retry = ScheduledTask::after(self.retry_delay, async move {
            shared.fire_retry(retry_id, is_client);
        });
        state.retries.insert(id, retry);
    }

    fn fire_retry(self: &Arc<Self>, id: ConnectId, is_client: bool) {
        {
            let mut state = self.state.lock();
            if let Some(own) = state.retries.remove(&id) {
                own.detach();
            }
            if state.closed || state.banned.contains(&id) {
                return;
            }
        }
        debug!("Retrying relay {}", id);
        self.on_pairing(id, is_client);
    }

    fn ban(&self, id: &ConnectId) {
        let mut state = self.state.lock();
        state.banned.insert(id.clone());
        if let Some(retry) = state.retries.remove(id) {
            retry.cancel();
        }
        info!("Banned {}", id);
    }

    fn destroy(&self) {
        let (peers, retries) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (mem::take(&mut state.peers), mem::take(&mut state.retries))
        };
        info!(
            "Destroying peer manager ({} open, {} pending retries)",
            peers.len(),
            retries.len()
        );
    }
}

/// Copy bytes between the relay socket and the application's stream until
/// either side closes or `shutdown` fires. The two directions run
/// independently, so a stalled reader on one side never blocks the other.
async fn pump(socket: RelaySocket, relay_side: DuplexStream, shutdown: &mut oneshot::Receiver<()>) {
    let (mut sink, mut stream) = socket.split();
    let (mut reader, mut writer) = tokio::io::split(relay_side);

    let outbound = async {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Relay stream read failed: {}", e);
                    break;
                }
            };
            if let Err(e) = sink.send(Message::Binary(buf[..n].to_vec())).await {
                debug!("Relay socket write failed: {}", e);
                break;
            }
        }
    };

    let inbound = async {
        while let Some(frame) = stream.next().await {
            let data = match frame {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Relay socket failed: {}", e);
                    break;
                }
            };
            if writer.write_all(&data).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = outbound => {}
        _ = inbound => {}
        _ = shutdown => {}
    }

    let _ = sink.close().await;
    let _ = writer.shutdown().await;
}

/// Destroys the manager once the last handle is gone
struct ManagerOwner(Arc<PeerShared>);

impl Drop for ManagerOwner {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

/// Opens, tracks and retries relay connections; clones share state.
/// Dropping the last clone destroys the manager.
#[derive(Clone)]
pub struct PeerConnectionManager {
    shared: Arc<PeerShared>,
    _owner: Arc<ManagerOwner>,
}

impl PeerConnectionManager {
    /// New manager plus the receiver on which relay connections are delivered
    pub fn new(
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayConnection>), ClientError> {
        let root = config.validate()?;
        let (connections, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PeerShared {
            root,
            retry_delay: config.retry_delay,
            relay_buffer: config.relay_buffer,
            state: Mutex::new(PeerState::default()),
            connections,
        });
        let owner = Arc::new(ManagerOwner(shared.clone()));
        Ok((
            Self {
                shared,
                _owner: owner,
            },
            rx,
        ))
    }

    /// Open a relay for a pairing notice. Ignored after destroy or if the
    /// id is already tracked.
    pub fn on_pairing(&self, id: ConnectId, is_client: bool) {
        self.shared.on_pairing(id, is_client);
    }

    /// Never reconnect `id`; a scheduled retry is cancelled
    pub fn ban(&self, id: &ConnectId) {
        self.shared.ban(id);
    }

    pub fn is_banned(&self, id: &ConnectId) -> bool {
        self.shared.state.lock().banned.contains(id)
    }

    pub fn is_tracked(&self, id: &ConnectId) -> bool {
        self.shared.state.lock().peers.contains_key(id)
    }

    pub fn tracked_count(&self) -> usize {
        self.shared.state.lock().peers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Close every relay and cancel every retry; later pairings are ignored
    pub fn destroy(&self) {
        self.shared.destroy();
    }
}

impl PairingHandler for PeerConnectionManager {
    fn on_pairing(&self, connect: ConnectId, is_client: bool) {
        self.shared.on_pairing(connect, is_client);
    }
}

// ============================================================================
// TESTS
// ============================================================================
