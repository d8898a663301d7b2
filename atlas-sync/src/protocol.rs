//! Session wire messages (JSON).
//!
//! ```text
//! client ──► session   {"seq": 4, "aware": {...}, "change": {...}}
//! session ──► client   {"acks": {client: seq}, "aware": {client: {...}}, "change": {...}}
//!                      {"change": {...}}                      (fixes, direct reply)
//!                      {"error": {"kind": "badUpdate", "message": "..."}}
//! ```
//!
//! Framing belongs to the transport. Every field of an outgoing message is
//! optional and omitted when empty.

use std::collections::BTreeMap;

use atlas_core::{Aware, Changeset};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error reported to a client.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum ErrorKind {
    #[error("bad update: {0}")]
    BadUpdate(String),
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("session closed")]
    SessionClosed,
}

/// Client → session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Strictly increasing per connection.
    pub seq: i32,
    #[serde(default)]
    pub aware: Aware,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<Changeset>,
}

impl IncomingMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Session → client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acks: Option<BTreeMap<Uuid, i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aware: Option<BTreeMap<Uuid, Aware>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<Changeset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl OutgoingMessage {
    /// First message on a new connection: everyone's presence and the full
    /// document.
    pub fn welcome(aware: BTreeMap<Uuid, Aware>, snapshot: Option<Changeset>) -> Self {
        Self {
            aware: Some(aware),
            change: snapshot,
            ..Self::default()
        }
    }

    pub fn broadcast(acks: BTreeMap<Uuid, i32>, aware: BTreeMap<Uuid, Aware>, change: Option<Changeset>) -> Self {
        Self {
            acks: Some(acks),
            aware: Some(aware),
            change,
            error: None,
        }
    }

    pub fn fixes(change: Changeset) -> Self {
        Self {
            change: Some(change),
            ..Self::default()
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self {
            error: Some(kind),
            ..Self::default()
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}
