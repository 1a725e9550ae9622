//! Rendezvous service — websocket endpoints for discovery and relay
//!
//! - `/discovery`: JSON join/leave messages in, pairing notices out
//! - `/connect/{id}`: raw relay socket, spliced with the other socket that
//!   presents the same id

use super::broker::{BrokerStats, RelayBroker};
use super::rendezvous::{RendezvousServer, RendezvousStats};
use crate::channel::ConnectId;
use crate::protocol::ClientMessage;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warp::filters::BoxedFilter;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Reply};

/// Relay broker over warp websockets
pub type WsRelayBroker = RelayBroker<WebSocket, Message>;

/// Rendezvous server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub host: IpAddr,
    /// Port to listen on (0 = ephemeral)
    pub port: u16,
    /// How long an unmatched relay socket may wait (None = forever)
    pub pending_relay_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 80,
            pending_relay_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Server error types
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },
}

/// Shared state behind both endpoints; cheap to clone
#[derive(Clone)]
pub struct RendezvousService {
    rendezvous: Arc<Mutex<RendezvousServer>>,
    broker: WsRelayBroker,
}

impl RendezvousService {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            rendezvous: Arc::new(Mutex::new(RendezvousServer::new())),
            broker: RelayBroker::new(config.pending_relay_timeout),
        }
    }

    /// warp filter serving `/discovery` and `/connect/{id}`
    pub fn routes(&self) -> BoxedFilter<(impl Reply,)> {
        let service = self.clone();
        let with_service = warp::any().map(move || service.clone());

        let discovery = warp::path("discovery")
            .and(warp::path::end())
            .and(warp::ws())
            .and(with_service.clone())
            .map(|ws: Ws, service: RendezvousService| {
                ws.on_upgrade(move |socket| service.handle_discovery(socket))
            });

        let relay = warp::path!("connect" / String)
            .and(warp::ws())
            .and(with_service)
            .map(|id: String, ws: Ws, service: RendezvousService| {
                ws.on_upgrade(move |socket| service.handle_relay(ConnectId::from(id), socket))
            });

        discovery.or(relay).boxed()
    }

    /// Bind the listener; returns the bound address and the serve future
    pub fn bind(
        &self,
        addr: SocketAddr,
    ) -> Result<(SocketAddr, impl Future<Output = ()> + Send + 'static), ServerError> {
        let (bound, server) = warp::serve(self.routes())
            .try_bind_ephemeral(addr)
            .map_err(|e| ServerError::Bind {
                addr,
                reason: e.to_string(),
            })?;
        info!("Listening on {}", bound);
        Ok((bound, server))
    }

    pub fn connection_count(&self) -> usize {
        self.rendezvous.lock().connection_count()
    }

    pub fn pending_relays(&self) -> usize {
        self.broker.pending_count()
    }

    pub fn rendezvous_stats(&self) -> RendezvousStats {
        self.rendezvous.lock().get_stats()
    }

    pub fn broker_stats(&self) -> BrokerStats {
        self.broker.get_stats()
    }

    async fn handle_discovery(self, socket: WebSocket) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = self.rendezvous.lock().connect(tx);
        info!("/discovery {}", handle);

        // Notifications -> websocket
        let forward_task = tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                let json = match notice.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to encode notification: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
        });

        // Websocket -> rendezvous
        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) if msg.is_text() || msg.is_binary() => {
                    match ClientMessage::from_slice(msg.as_bytes()) {
                        Ok(parsed) => {
                            debug!("{} sent {:?}", handle, parsed);
                            self.rendezvous.lock().handle_message(handle, parsed);
                        }
                        Err(e) => warn!("dropping malformed message from {}: {}", handle, e),
                    }
                }
                Ok(msg) if msg.is_close() => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("discovery socket {} failed: {}", handle, e);
                    break;
                }
            }
        }

        self.rendezvous.lock().disconnect(handle);
        forward_task.abort();
        info!("/discovery {} closed", handle);
    }

    async fn handle_relay(self, id: ConnectId, socket: WebSocket) {
        debug!("/connect/{}", id);
        self.broker.offer(id, socket).await;
    }
}
