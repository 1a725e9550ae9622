//! Discovery client — keeps the desired channel set announced to the
//! rendezvous server across reconnects and hands pairing notices on.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> ...
//!        \______________\____________\_____-> Closed (terminal)
//! ```
//!
//! On every successful (re)connect the full channel set is sent as one
//! `join` message. While connected, single join/leave changes are sent
//! incrementally; while disconnected they only update the local set.

use super::{ClientConfig, ClientError};
use crate::channel::{Channel, ConnectId};
use crate::protocol::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type DiscoverySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of the discovery socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Receives pairing notices from the rendezvous server
pub trait PairingHandler: Send + Sync + 'static {
    fn on_pairing(&self, connect: ConnectId, is_client: bool);
}

impl<F> PairingHandler for F
where
    F: Fn(ConnectId, bool) + Send + Sync + 'static,
{
    fn on_pairing(&self, connect: ConnectId, is_client: bool) {
        self(connect, is_client)
    }
}

/// Counters for one discovery client
#[derive(Debug, Clone, Default)]
pub struct DiscoveryStats {
    /// Sessions that reached `Connected`
    pub sessions: u64,
    /// Keep-alive pings written to the socket
    pub heartbeats_sent: u64,
    /// Pairing notices handed to the handler
    pub pairings_received: u64,
}

struct Membership {
    state: DiscoveryState,
    channels: BTreeSet<Channel>,
    stats: DiscoveryStats,
}

struct Shared {
    url: String,
    membership: Mutex<Membership>,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    /// Move to `state` unless closed; false once closed
    fn enter(&self, state: DiscoveryState) -> bool {
        let mut membership = self.membership.lock();
        if membership.state == DiscoveryState::Closed {
            return false;
        }
        membership.state = state;
        true
    }

    /// Enter `Closed` and wake the worker; false if already closed
    fn shut_down(&self) -> bool {
        {
            let mut membership = self.membership.lock();
            if membership.state == DiscoveryState::Closed {
                return false;
            }
            membership.state = DiscoveryState::Closed;
        }
        self.shutdown.send_replace(true);
        true
    }
}

/// Held only by handles, never by the worker; the last handle dropped stops it
struct Owner {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if self.shared.shut_down() {
            debug!("Discovery client for {} dropped", self.shared.url);
        }
    }
}

/// Handle to a running discovery client; clones share the same connection.
/// Dropping the last clone closes the socket and stops reconnecting.
#[derive(Clone)]
pub struct DiscoveryClient {
    shared: Arc<Shared>,
    owner: Arc<Owner>,
}

impl DiscoveryClient {
    /// Start connecting to `<url>/discovery` in the background
    pub fn start(
        config: &ClientConfig,
        handler: Arc<dyn PairingHandler>,
    ) -> Result<Self, ClientError> {
        let root = config.validate()?;
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            url: root.discovery_url(),
            membership: Mutex::new(Membership {
                state: DiscoveryState::Disconnected,
                channels: BTreeSet::new(),
                stats: DiscoveryStats::default(),
            }),
            outgoing,
            shutdown,
        });

        let worker = Worker {
            shared: shared.clone(),
            handler,
            outgoing: outgoing_rx,
            shutdown: shutdown_rx,
            reconnect_delay: config.reconnect_delay,
            heartbeat_interval: config.heartbeat_interval,
        };
        let task = tokio::spawn(worker.run());
        info!("Discovery client started for {}", shared.url);

        Ok(Self {
            owner: Arc::new(Owner {
                shared: shared.clone(),
                task: Mutex::new(Some(task)),
            }),
            shared,
        })
    }

    /// Add a channel to the desired set. No-op if already present.
    pub fn join(&self, channel: Channel) {
        let mut membership = self.shared.membership.lock();
        if !membership.channels.insert(channel.clone()) {
            return;
        }
        debug!("join {}", channel);
        if membership.state == DiscoveryState::Connected {
            let _ = self.shared.outgoing.send(ClientMessage::join(vec![channel]));
        }
    }

    /// Remove a channel from the desired set. No-op if absent.
    pub fn leave(&self, channel: Channel) {
        let mut membership = self.shared.membership.lock();
        if !membership.channels.remove(&channel) {
            return;
        }
        debug!("leave {}", channel);
        if membership.state == DiscoveryState::Connected {
            let _ = self.shared.outgoing.send(ClientMessage::leave(vec![channel]));
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.shared.membership.lock().state
    }

    /// Current desired channel set, sorted
    pub fn channels(&self) -> Vec<Channel> {
        self.shared.membership.lock().channels.iter().cloned().collect()
    }

    pub fn get_stats(&self) -> DiscoveryStats {
        self.shared.membership.lock().stats.clone()
    }

    /// Close the socket and stop reconnecting. Idempotent.
    pub async fn close(&self) {
        if !self.shared.shut_down() {
            return;
        }

        let task = self.owner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Discovery client for {} closed", self.shared.url);
    }
}

/// Background connection loop
struct Worker {
    shared: Arc<Shared>,
    handler: Arc<dyn PairingHandler>,
    outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    shutdown: watch::Receiver<bool>,
    reconnect_delay: Duration,
    heartbeat_interval: Duration,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if !self.shared.enter(DiscoveryState::Connecting) {
                break;
            }
            debug!("Connecting to {}", self.shared.url);

            let attempt = tokio::select! {
                result = connect_async(self.shared.url.as_str()) => result,
                _ = self.shutdown.changed() => break,
            };
            match attempt {
                Ok((socket, _)) => {
                    if let Err(e) = self.session(socket).await {
                        warn!("Discovery session ended: {}", e);
                    }
                }
                Err(e) => warn!("Failed to connect to {}: {}", self.shared.url, e),
            }

            if !self.shared.enter(DiscoveryState::Disconnected) {
                break;
            }
            info!("Discovery disconnected, reconnecting in {:?}", self.reconnect_delay);
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        debug!("Discovery worker for {} stopped", self.shared.url);
    }

    async fn session(&mut self, socket: DiscoverySocket) -> Result<(), ClientError> {
        // Queued incremental changes are superseded by the hello
        let hello = {
            let mut membership = self.shared.membership.lock();
            if membership.state == DiscoveryState::Closed {
                return Ok(());
            }
            membership.state = DiscoveryState::Connected;
            membership.stats.sessions += 1;
            while self.outgoing.try_recv().is_ok() {}
            ClientMessage::hello(membership.channels.iter().cloned())
        };
        info!("Connected to {}", self.shared.url);

        let (mut sink, mut stream) = socket.split();
        sink.send(Message::Text(hello.to_json()?))
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        let period = self.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    sink.send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
                    self.shared.membership.lock().stats.heartbeats_sent += 1;
                }
                Some(msg) = self.outgoing.recv() => {
                    sink.send(Message::Text(msg.to_json()?))
                        .await
                        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => self.dispatch(&data),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ClientError::ConnectionFailed(e.to_string())),
                },
                _ = self.shutdown.changed() => {
                    let _ = sink.close().await;
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&self, data: &[u8]) {
        match ServerMessage::from_slice(data) {
            Ok(notice) => {
                debug!("Paired via {} (client: {})", notice.connect, notice.is_client);
                self.shared.membership.lock().stats.pairings_received += 1;
                self.handler.on_pairing(notice.connect, notice.is_client);
            }
            Err(e) => warn!("Dropping malformed discovery message: {}", e),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    type ServerSide = WebSocketStream<TcpStream>;

    fn ch(name: &str) -> Channel {
        Channel::from_token(name)
    }

    fn test_config(addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            url: format!("ws://{}", addr),
            reconnect_delay: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            ..Default::default()
        }
    }

    fn recorder() -> (Arc<dyn PairingHandler>, mpsc::UnboundedReceiver<(ConnectId, bool)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |id: ConnectId, is_client: bool| {
            let _ = tx.send((id, is_client));
        };
        (Arc::new(handler), rx)
    }

    async fn accept(listener: &TcpListener) -> ServerSide {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn next_client_message(server: &mut ServerSide) -> ClientMessage {
        loop {
            let frame = timeout(Duration::from_secs(5), server.next())
                .await
                .expect("no message from client")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = frame {
                return ClientMessage::from_slice(text.as_bytes()).unwrap();
            }
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_hello_then_incremental_changes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, _pairings) = recorder();
        let client = DiscoveryClient::start(&test_config(listener.local_addr().unwrap()), handler).unwrap();
        client.join(ch("foo"));

        let mut server = accept(&listener).await;
        assert_eq!(next_client_message(&mut server).await, ClientMessage::hello([ch("foo")]));
        assert_eq!(client.state(), DiscoveryState::Connected);

        client.join(ch("bar"));
        assert_eq!(next_client_message(&mut server).await, ClientMessage::join(vec![ch("bar")]));

        client.join(ch("bar"));
        client.leave(ch("foo"));
        assert_eq!(next_client_message(&mut server).await, ClientMessage::leave(vec![ch("foo")]));
        assert_eq!(client.channels(), vec![ch("bar")]);

        client.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_replays_entire_channel_set() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, _pairings) = recorder();
        let client = DiscoveryClient::start(&test_config(listener.local_addr().unwrap()), handler).unwrap();
        client.join(ch("foo"));

        let mut first = accept(&listener).await;
        assert_eq!(next_client_message(&mut first).await, ClientMessage::hello([ch("foo")]));

        drop(first);
        wait_until(|| client.state() != DiscoveryState::Connected).await;
        client.join(ch("bar"));

        let mut second = accept(&listener).await;
        assert_eq!(
            next_client_message(&mut second).await,
            ClientMessage::hello([ch("bar"), ch("foo")])
        );

        client.close().await;
    }

    #[tokio::test]
    async fn test_pairing_notices_reach_handler() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, mut pairings) = recorder();
        let client = DiscoveryClient::start(&test_config(listener.local_addr().unwrap()), handler).unwrap();

        let mut server = accept(&listener).await;
        next_client_message(&mut server).await;

        server.send(Message::Text("not json".to_string())).await.unwrap();
        server
            .send(Message::Text(r#"{"connect":"abc","isClient":true}"#.to_string()))
            .await
            .unwrap();

        let (id, is_client) = timeout(Duration::from_secs(5), pairings.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, ConnectId::from("abc"));
        assert!(is_client);
        assert_eq!(client.state(), DiscoveryState::Connected);
        assert_eq!(client.get_stats().pairings_received, 1);

        client.close().await;
    }

    #[tokio::test]
    async fn test_heartbeat_pings_while_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, _pairings) = recorder();
        let mut config = test_config(listener.local_addr().unwrap());
        config.heartbeat_interval = Duration::from_millis(50);
        let client = DiscoveryClient::start(&config, handler).unwrap();

        let mut server = accept(&listener).await;
        next_client_message(&mut server).await;

        let frame = timeout(Duration::from_secs(5), server.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Message::Ping(_)));

        client.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_reconnecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, _pairings) = recorder();
        let client = DiscoveryClient::start(&test_config(listener.local_addr().unwrap()), handler).unwrap();

        let mut server = accept(&listener).await;
        next_client_message(&mut server).await;

        client.close().await;
        client.close().await;
        assert_eq!(client.state(), DiscoveryState::Closed);

        // The socket is closed and no new attempt follows
        let ended = timeout(Duration::from_secs(5), async {
            loop {
                match server.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(ended.is_ok());
        assert!(timeout(Duration::from_millis(300), listener.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_no_heartbeat_after_server_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, _pairings) = recorder();
        let mut config = test_config(listener.local_addr().unwrap());
        config.heartbeat_interval = Duration::from_millis(50);
        config.reconnect_delay = Duration::from_secs(30);
        let client = DiscoveryClient::start(&config, handler).unwrap();

        let mut server = accept(&listener).await;
        next_client_message(&mut server).await;
        wait_until(|| client.get_stats().heartbeats_sent >= 1).await;

        drop(server);
        wait_until(|| client.state() == DiscoveryState::Disconnected).await;
        let sent = client.get_stats().heartbeats_sent;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(client.get_stats().heartbeats_sent, sent);
        assert_eq!(client.state(), DiscoveryState::Disconnected);
        assert_eq!(client.get_stats().sessions, 1);

        client.close().await;
    }

    #[tokio::test]
    async fn test_dropping_last_handle_stops_reconnecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, _pairings) = recorder();
        let client = DiscoveryClient::start(&test_config(listener.local_addr().unwrap()), handler).unwrap();
        let other = client.clone();

        let mut server = accept(&listener).await;
        next_client_message(&mut server).await;

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(other.state(), DiscoveryState::Connected);

        drop(other);
        let ended = timeout(Duration::from_secs(5), async {
            loop {
                match server.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(ended.is_ok());
        drop(server);

        // reconnect_delay is 100ms; give it several periods
        assert!(timeout(Duration::from_millis(500), listener.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_zero_heartbeat_is_rejected() {
        let (handler, _pairings) = recorder();
        let config = ClientConfig {
            heartbeat_interval: Duration::ZERO,
            ..ClientConfig::new("ws://localhost:9000")
        };
        let result = DiscoveryClient::start(&config, handler);
        assert!(matches!(result, Err(ClientError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let (handler, _pairings) = recorder();
        let result = DiscoveryClient::start(&ClientConfig::new("http://localhost"), handler);
        assert!(matches!(result, Err(ClientError::InvalidUrl { .. })));
    }
}
