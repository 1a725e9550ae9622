//! Channel and connect-id tokens
//!
//! Both are opaque printable strings once minted. Channels are derived from
//! arbitrary binary topic keys; connect ids are minted by the rendezvous
//! server, one per introduced pair of peers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Encoded topic token two peers must share to be introduced.
///
/// Equality is byte-exact on the encoded token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    /// Derive the channel token for a binary topic key (Base58)
    pub fn from_key(key: &[u8]) -> Self {
        Self(bs58::encode(key).into_string())
    }

    /// Wrap a token that is already encoded, e.g. one received on the wire
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation token pairing exactly two relay stream attempts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectId(String);

impl ConnectId {
    /// Mint a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_channel_encoding_is_deterministic() {
        let a = Channel::from_key(b"foo");
        let b = Channel::from_key(b"foo");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "bQbp");
    }

    #[test]
    fn test_distinct_keys_give_distinct_channels() {
        let a = Channel::from_key(&[0x00, 0x01]);
        let b = Channel::from_key(&[0x01]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_channel_is_printable() {
        let channel = Channel::from_key(&[0xff, 0x00, 0x10, 0x7f, 0x80]);
        assert!(channel.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_channel_serializes_as_plain_string() {
        let channel = Channel::from_token("abc");
        let json = serde_json::to_string(&channel).unwrap();
        assert_eq!(json, "\"abc\"");
    }

    #[test]
    fn test_connect_ids_are_unique() {
        let ids: HashSet<ConnectId> = (0..1000).map(|_| ConnectId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_connect_id_is_url_safe() {
        let id = ConnectId::generate();
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '-'));
    }
}
