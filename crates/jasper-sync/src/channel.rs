//! Cross-instance broadcast channel.
//!
//! Managers sharing a replica set tell each other about local value changes
//! and replica-set edits so siblings converge without waiting for a poll.
//! The channel is advisory: lost messages are repaired by polling.

use async_trait::async_trait;
use jasper_core::Value;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use ulid::Ulid;

/// Messages exchanged between sibling managers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BroadcastMessage<V> {
    /// A sibling set a new value locally.
    #[serde(rename = "VALUE")]
    Value { value: V },
    /// A sibling changed the replica set; `syncs` is its config string.
    #[serde(rename = "UPDATE_SYNCS")]
    UpdateSyncs { syncs: String },
}

impl<V: Value> BroadcastMessage<V> {
    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::Malformed(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(text).map_err(|e| ChannelError::Malformed(e.to_string()))
    }
}

/// Channel error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// A named broadcast channel shared by sibling managers.
///
/// Implementations must not deliver a message back to the endpoint that
/// posted it.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Send a message to every other endpoint.
    async fn post(&self, message: String) -> Result<(), ChannelError>;

    /// Receive messages posted by other endpoints from now on.
    fn subscribe(&self) -> mpsc::Receiver<String>;
}

const ENDPOINT_BUFFER: usize = 256;

type Endpoints = Arc<RwLock<HashMap<Ulid, mpsc::Sender<String>>>>;

/// In-process hub connecting [`MemoryChannel`] endpoints.
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Endpoints,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new endpoint on this hub.
    pub fn endpoint(&self) -> MemoryChannel {
        MemoryChannel {
            origin: Ulid::new(),
            endpoints: self.endpoints.clone(),
        }
    }

    /// Number of subscribed endpoints.
    pub fn subscribers(&self) -> usize {
        self.endpoints.read().len()
    }
}

/// One endpoint of a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryChannel {
    origin: Ulid,
    endpoints: Endpoints,
}

impl MemoryChannel {
    pub fn origin(&self) -> Ulid {
        self.origin
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn post(&self, message: String) -> Result<(), ChannelError> {
        let senders: Vec<_> = {
            let endpoints = self.endpoints.read();
            endpoints
                .iter()
                .filter(|(origin, _)| **origin != self.origin)
                .map(|(origin, tx)| (*origin, tx.clone()))
                .collect()
        };

        let mut closed = Vec::new();
        for (origin, tx) in senders {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(%origin, "broadcast endpoint is full; dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(origin),
            }
        }

        if !closed.is_empty() {
            let mut endpoints = self.endpoints.write();
            for origin in closed {
                endpoints.remove(&origin);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(ENDPOINT_BUFFER);
        self.endpoints.write().insert(self.origin, tx);
        rx
    }
}
