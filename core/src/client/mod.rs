//! Client side: discovery control plane plus relay connection management

pub mod discovery;
pub mod peers;

pub use discovery::{DiscoveryClient, DiscoveryState, DiscoveryStats, PairingHandler};
pub use peers::{ConnectionDetails, ConnectionKind, PeerConnectionManager, RelayConnection};

use crate::channel::{Channel, ConnectId};
use crate::protocol::ProtocolError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::Uri;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Root websocket URL of the rendezvous server, e.g. `ws://host:port`
    pub url: String,
    /// Delay before reconnecting a dropped discovery socket
    pub reconnect_delay: Duration,
    /// Keep-alive ping period while connected
    pub heartbeat_interval: Duration,
    /// Delay before reopening a closed relay connection
    pub retry_delay: Duration,
    /// Buffer size of the byte stream handed to the application
    pub relay_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:80".to_string(),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(5),
            relay_buffer: 64 * 1024,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Check the configuration without connecting; returns the parsed root URL
    pub fn validate(&self) -> Result<RootUrl, ClientError> {
        let root = RootUrl::parse(&self.url)?;
        if self.heartbeat_interval.is_zero() {
            return Err(ClientError::InvalidConfig(
                "heartbeat_interval must be non-zero".to_string(),
            ));
        }
        if self.relay_buffer == 0 {
            return Err(ClientError::InvalidConfig(
                "relay_buffer must be non-zero".to_string(),
            ));
        }
        Ok(root)
    }
}

/// Client error types
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid server URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Validated root URL of a rendezvous server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootUrl(String);

impl RootUrl {
    pub fn parse(url: &str) -> Result<Self, ClientError> {
        let invalid = |reason: String| ClientError::InvalidUrl {
            url: url.to_string(),
            reason,
        };

        let trimmed = url.trim_end_matches('/');
        let uri: Uri = trimmed.parse().map_err(|e| invalid(format!("{}", e)))?;
        match uri.scheme_str() {
            Some("ws") | Some("wss") => {}
            Some(other) => return Err(invalid(format!("unsupported scheme '{}'", other))),
            None => return Err(invalid("missing scheme".to_string())),
        }
        if uri.authority().is_none() {
            return Err(invalid("missing host".to_string()));
        }
        if uri.query().is_some() {
            return Err(invalid("query strings are not supported".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn discovery_url(&self) -> String {
        format!("{}/discovery", self.0)
    }

    pub fn relay_url(&self, id: &ConnectId) -> String {
        format!("{}/connect/{}", self.0, id)
    }
}

/// Swarm-style facade: join topics by binary key, receive relay connections.
///
/// Construct inside a Tokio runtime; background tasks start immediately.
/// Dropping the swarm tears down its relays and discovery socket.
pub struct CloudSwarm {
    discovery: DiscoveryClient,
    peers: PeerConnectionManager,
}

impl CloudSwarm {
    /// Start the discovery client and peer manager. Relay connections are
    /// delivered on the returned receiver.
    pub fn new(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayConnection>), ClientError> {
        let (peers, connections) = PeerConnectionManager::new(&config)?;
        let handler: Arc<dyn PairingHandler> = Arc::new(peers.clone());
        let discovery = DiscoveryClient::start(&config, handler)?;
        Ok((Self { discovery, peers }, connections))
    }

    /// Join the channel derived from `key`
    pub fn join(&self, key: &[u8]) -> Channel {
        let channel = Channel::from_key(key);
        self.discovery.join(channel.clone());
        channel
    }

    /// Leave the channel derived from `key`
    pub fn leave(&self, key: &[u8]) -> Channel {
        let channel = Channel::from_key(key);
        self.discovery.leave(channel.clone());
        channel
    }

    pub fn discovery(&self) -> &DiscoveryClient {
        &self.discovery
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    /// Tear down every relay connection, then close the discovery socket
    pub async fn destroy(&self) {
        self.peers.destroy();
        self.discovery.close().await;
    }
}

impl Drop for CloudSwarm {
    fn drop(&mut self) {
        // The discovery worker holds a manager clone as its handler
        self.peers.destroy();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    #[test]
    fn test_root_url_accepts_ws_and_wss() {
        assert!(RootUrl::parse("ws://localhost:8080").is_ok());
        assert!(RootUrl::parse("wss://relay.example.com").is_ok());
    }

    #[test]
    fn test_root_url_trims_trailing_slash() {
        let root = RootUrl::parse("ws://localhost:8080/").unwrap();
        assert_eq!(root.discovery_url(), "ws://localhost:8080/discovery");
        assert_eq!(
            root.relay_url(&ConnectId::from("abc")),
            "ws://localhost:8080/connect/abc"
        );
    }

    #[test]
    fn test_root_url_rejects_bad_input() {
        assert!(RootUrl::parse("").is_err());
        assert!(RootUrl::parse("not a url").is_err());
        assert!(RootUrl::parse("http://localhost:8080").is_err());
        assert!(RootUrl::parse("localhost:8080").is_err());
        assert!(RootUrl::parse("ws://localhost:8080/?x=1").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new("ws://localhost:9000");
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_heartbeat_or_buffer_is_rejected() {
        let mut config = ClientConfig::new("ws://localhost:9000");
        config.heartbeat_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ClientError::InvalidConfig(_))));

        let mut config = ClientConfig::new("ws://localhost:9000");
        config.relay_buffer = 0;
        assert!(matches!(config.validate(), Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn test_swarm_construction_fails_fast_on_zero_heartbeat() {
        let config = ClientConfig {
            heartbeat_interval: Duration::ZERO,
            ..ClientConfig::new("ws://localhost:9000")
        };
        let result = CloudSwarm::new(config);
        assert!(matches!(result, Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn test_swarm_construction_fails_fast_on_bad_url() {
        let result = CloudSwarm::new(ClientConfig::new("ftp://nowhere"));
        assert!(matches!(result, Err(ClientError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_dropping_swarm_stops_background_work() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ClientConfig {
            reconnect_delay: Duration::from_millis(100),
            ..ClientConfig::new(format!("ws://{}", listener.local_addr().unwrap()))
        };
        let (swarm, _connections) = CloudSwarm::new(config).unwrap();
        let peers = swarm.peers().clone();
        swarm.join(b"topic");

        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut server = tokio_tungstenite::accept_async(stream).await.unwrap();
        let hello = timeout(Duration::from_secs(5), server.next()).await.unwrap();
        assert!(matches!(hello, Some(Ok(Message::Text(_)))));

        drop(swarm);
        assert!(peers.is_closed());

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

        assert!(timeout(Duration::from_millis(500), listener.accept()).await.is_err());
    }
}
