//! Rendezvous server: channel membership, pairing and relay splicing

pub mod broker;
pub mod channel_index;
pub mod rendezvous;
pub mod service;

pub use broker::{splice, BrokerStats, OfferOutcome, RelayBroker};
pub use channel_index::ChannelIndex;
pub use rendezvous::{ConnectionHandle, RendezvousServer, RendezvousStats};
pub use service::{RendezvousService, ServerConfig, ServerError, WsRelayBroker};
