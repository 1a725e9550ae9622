//! Discovery wire protocol — JSON messages exchanged on the discovery socket

use crate::channel::{Channel, ConnectId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client → server: channel membership changes.
///
/// Both fields are optional and applied independently, `leave` before `join`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<Vec<Channel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leave: Option<Vec<Channel>>,
}

/// Server → client: introduction to a peer through a fresh connect id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// Correlation token for the relay connection
    pub connect: ConnectId,
    /// Exactly one side of each pairing is the client
    pub is_client: bool,
}

/// Discovery message serialization errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl ClientMessage {
    /// Full membership announcement sent on every (re)connect
    pub fn hello<I>(channels: I) -> Self
    where
        I: IntoIterator<Item = Channel>,
    {
        Self {
            join: Some(channels.into_iter().collect()),
            leave: None,
        }
    }

    pub fn join(channels: Vec<Channel>) -> Self {
        Self {
            join: Some(channels),
            leave: None,
        }
    }

    pub fn leave(channels: Vec<Channel>) -> Self {
        Self {
            join: None,
            leave: Some(channels),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl ServerMessage {
    pub fn new(connect: ConnectId, is_client: bool) -> Self {
        Self { connect, is_client }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_omits_absent_leave() {
        let msg = ClientMessage::join(vec![Channel::from_token("abc")]);
        assert_eq!(msg.to_json().unwrap(), r#"{"join":["abc"]}"#);
    }

    #[test]
    fn test_empty_object_decodes_to_noop() {
        let msg = ClientMessage::from_slice(b"{}").unwrap();
        assert_eq!(msg, ClientMessage::default());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let msg = ClientMessage::from_slice(br#"{"type":"Hello","join":["x","y"]}"#).unwrap();
        assert_eq!(
            msg.join,
            Some(vec![Channel::from_token("x"), Channel::from_token("y")])
        );
        assert!(msg.leave.is_none());
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        assert!(ClientMessage::from_slice(b"not json").is_err());
        assert!(ClientMessage::from_slice(br#"{"join":"abc"}"#).is_err());
    }

    #[test]
    fn test_server_message_uses_camel_case() {
        let msg = ServerMessage::new(ConnectId::from("id-1"), true);
        assert_eq!(msg.to_json().unwrap(), r#"{"connect":"id-1","isClient":true}"#);

        let decoded = ServerMessage::from_slice(br#"{"connect":"id-2","isClient":false}"#).unwrap();
        assert_eq!(decoded.connect, ConnectId::from("id-2"));
        assert!(!decoded.is_client);
    }

    #[test]
    fn test_hello_carries_every_channel() {
        let channels = vec![Channel::from_token("a"), Channel::from_token("b")];
        let msg = ClientMessage::hello(channels.clone());
        assert_eq!(msg.join, Some(channels));
    }
}
