//! In-memory target for testing and simulation.
//!
//! Targets created from the same [`MemoryStore`] with the same id share one
//! slot, so a replica set deserialised from its config string talks to the
//! same storage as the original.

use crate::codec;
use crate::error::TargetError;
use crate::target::{next_write_time, Target, Timestamp, Timestamped};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Target type key.
pub const MEMORY_KIND: &str = "memory";

#[derive(Debug)]
struct Slot {
    content: Option<Timestamped<Vec<u8>>>,
    online: bool,
    failing: bool,
    delay: Duration,
    reads: usize,
    writes: usize,
    timestamp_calls: usize,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            content: None,
            online: true,
            failing: false,
            delay: Duration::ZERO,
            reads: 0,
            writes: 0,
            timestamp_calls: 0,
        }
    }
}

/// Shared storage for memory targets, keyed by target id.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slots: Arc<Mutex<HashMap<String, Arc<Mutex<Slot>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a target backed by the slot for `id`, creating the slot if needed.
    pub fn target(&self, id: impl Into<String>) -> MemoryTarget {
        let id = id.into();
        let slot = self
            .slots
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .clone();
        MemoryTarget { id, slot }
    }

    /// Ids of every slot created so far.
    pub fn ids(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }
}

/// In-memory target with fault injection and call counters.
#[derive(Debug, Clone)]
pub struct MemoryTarget {
    id: String,
    slot: Arc<Mutex<Slot>>,
}

impl MemoryTarget {
    /// Create a target with its own private slot.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Create a target with a fresh unique id.
    pub fn anonymous() -> Self {
        Self::new(ulid::Ulid::new().to_string())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Store `value` as plain JSON, bypassing counters and faults.
    pub fn put<V: Serialize>(&self, value: &V) -> Timestamp {
        let bytes = codec::encode(value, false).unwrap_or_default();
        self.put_bytes(bytes)
    }

    /// Store raw bytes, bypassing counters and faults.
    pub fn put_bytes(&self, bytes: Vec<u8>) -> Timestamp {
        let mut slot = self.slot.lock();
        let timestamp = next_write_time(slot.content.as_ref().map(|c| c.timestamp));
        slot.content = Some(Timestamped::new(timestamp, bytes));
        timestamp
    }

    /// Store raw bytes with an explicit write time.
    pub fn put_at(&self, bytes: Vec<u8>, timestamp: Timestamp) {
        self.slot.lock().content = Some(Timestamped::new(timestamp, bytes));
    }

    /// Remove the stored content.
    pub fn clear(&self) {
        self.slot.lock().content = None;
    }

    /// Current content, bypassing counters and faults.
    pub fn peek(&self) -> Option<Timestamped<Vec<u8>>> {
        self.slot.lock().content.clone()
    }

    /// Decode the current content as plain JSON.
    pub fn peek_value<V: serde::de::DeserializeOwned>(&self) -> Option<V> {
        self.peek()
            .and_then(|content| codec::decode(&content.value, false).ok())
    }

    pub fn set_online(&self, online: bool) {
        self.slot.lock().online = online;
    }

    /// Make every call fail with a generic error.
    pub fn set_failing(&self, failing: bool) {
        self.slot.lock().failing = failing;
    }

    /// Delay applied to every call before it completes.
    pub fn set_delay(&self, delay: Duration) {
        self.slot.lock().delay = delay;
    }

    pub fn reads(&self) -> usize {
        self.slot.lock().reads
    }

    pub fn writes(&self) -> usize {
        self.slot.lock().writes
    }

    pub fn timestamp_calls(&self) -> usize {
        self.slot.lock().timestamp_calls
    }

    pub fn reset_counters(&self) {
        let mut slot = self.slot.lock();
        slot.reads = 0;
        slot.writes = 0;
        slot.timestamp_calls = 0;
    }

    async fn pause(&self) -> Result<(), TargetError> {
        let (delay, online, failing) = {
            let slot = self.slot.lock();
            (slot.delay, slot.online, slot.failing)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !online {
            return Err(TargetError::Offline);
        }
        if failing {
            return Err(TargetError::other(format!("memory target {} failed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl Target for MemoryTarget {
    fn kind(&self) -> &'static str {
        MEMORY_KIND
    }

    async fn read(&self) -> Result<Option<Timestamped<Vec<u8>>>, TargetError> {
        self.slot.lock().reads += 1;
        self.pause().await?;
        Ok(self.slot.lock().content.clone())
    }

    async fn write(&self, buffer: Vec<u8>) -> Result<Timestamp, TargetError> {
        self.slot.lock().writes += 1;
        self.pause().await?;
        let mut slot = self.slot.lock();
        let timestamp = next_write_time(slot.content.as_ref().map(|c| c.timestamp));
        slot.content = Some(Timestamped::new(timestamp, buffer));
        Ok(timestamp)
    }

    async fn timestamp(&self) -> Result<Option<Timestamp>, TargetError> {
        self.slot.lock().timestamp_calls += 1;
        self.pause().await?;
        Ok(self.slot.lock().content.as_ref().map(|c| c.timestamp))
    }

    fn serialise(&self) -> serde_json::Value {
        serde_json::json!({ "id": self.id })
    }

    fn online(&self) -> bool {
        self.slot.lock().online
    }

    fn is_local(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let target = MemoryTarget::new("a");
        assert_eq!(target.read().await.unwrap(), None);

        let written = target.write(b"hello".to_vec()).await.unwrap();
        let read = target.read().await.unwrap().unwrap();

        assert_eq!(read.value, b"hello".to_vec());
        assert_eq!(read.timestamp, written);
        assert_eq!(target.timestamp().await.unwrap(), Some(written));
        assert_eq!(target.reads(), 2);
        assert_eq!(target.writes(), 1);
    }

    #[tokio::test]
    async fn test_store_shares_slots() {
        let store = MemoryStore::new();
        let first = store.target("shared");
        let second = store.target("shared");

        first.put(&"value");
        assert_eq!(second.peek_value::<String>(), Some("value".to_string()));
        assert!(first.equals(&second));
        assert!(!first.equals(&store.target("other")));
    }

    #[tokio::test]
    async fn test_faults() {
        let target = MemoryTarget::new("a");
        target.set_online(false);
        assert_eq!(target.read().await, Err(TargetError::Offline));
        assert!(!target.online());

        target.set_online(true);
        target.set_failing(true);
        assert!(matches!(target.write(vec![1]).await, Err(TargetError::Error(_))));
        assert_eq!(target.peek(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay() {
        let target = MemoryTarget::new("slow");
        target.set_delay(Duration::from_millis(40));

        let started = tokio::time::Instant::now();
        target.timestamp().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_consecutive_puts_have_increasing_timestamps() {
        let target = MemoryTarget::anonymous();
        let first = target.put(&1);
        let second = target.put(&2);
        assert!(second > first);
    }
}
