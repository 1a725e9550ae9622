// Rendezvous Core — discovery and relay for peers that cannot dial each other
//
// Peers announce channels over `/discovery`; the server introduces every pair
// sharing a channel with a fresh connect id, and both sides meet again on
// `/connect/<id>` where their sockets are spliced into one byte pipe.

pub mod channel;
pub mod client;
pub mod protocol;
pub mod scheduler;
pub mod server;

pub use channel::{Channel, ConnectId};
pub use client::{
    ClientConfig, ClientError, CloudSwarm, ConnectionDetails, ConnectionKind, DiscoveryClient,
    DiscoveryState, DiscoveryStats, PairingHandler, PeerConnectionManager, RelayConnection,
    RootUrl,
};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use server::{
    ChannelIndex, ConnectionHandle, RelayBroker, RendezvousServer, RendezvousService,
    ServerConfig, ServerError,
};
