//! Replica records and the persisted replica-set format.
//!
//! A [`Replica`] pairs a [`Target`] with the bookkeeping the manager keeps
//! about it. A replica set is persisted as a JSON list of
//! `{ "type": kind, "config": string }` entries, where `config` is itself the
//! JSON of the record fields plus `target.serialise()`. A [`TargetRegistry`]
//! maps each kind back to a deserializer.

use crate::codec;
use crate::error::{ConfigError, TargetError};
use crate::file::{FileTarget, FILE_KIND};
use crate::memory::{MemoryStore, MEMORY_KIND};
use crate::result::with_timeout;
use crate::target::{Target, Timestamp, Timestamped};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A target plus this instance's bookkeeping about it.
#[derive(Clone)]
pub struct Replica {
    pub target: Arc<dyn Target>,
    /// Values are gzip-compressed on this replica.
    pub compressed: bool,
    /// The last write failed; the write runner skips this replica until a
    /// write succeeds again.
    pub desynced: bool,
    /// Last write time this instance believes the replica holds.
    pub last_seen_write_time: Option<Timestamp>,
}

impl Replica {
    pub fn new(target: impl Target) -> Self {
        Self::from_arc(Arc::new(target))
    }

    pub fn from_arc(target: Arc<dyn Target>) -> Self {
        Self {
            target,
            compressed: false,
            desynced: false,
            last_seen_write_time: None,
        }
    }

    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Same target object, or a structurally equal one.
    pub fn same_target(&self, other: &Replica) -> bool {
        Arc::ptr_eq(&self.target, &other.target) || self.target.equals(other.target.as_ref())
    }

    /// Read and decode the replica's value.
    pub async fn read<V: DeserializeOwned>(
        &self,
        limit: Option<Duration>,
    ) -> Result<Option<Timestamped<V>>, TargetError> {
        if !self.target.online() {
            return Err(TargetError::Offline);
        }
        let Some(content) = with_timeout(limit, self.target.read()).await? else {
            return Ok(None);
        };
        let value = codec::decode(&content.value, self.compressed)?;
        Ok(Some(Timestamped::new(content.timestamp, value)))
    }

    /// Encode and write a value, returning the new write time.
    pub async fn write<V: Serialize>(
        &self,
        value: &V,
        limit: Option<Duration>,
    ) -> Result<Timestamp, TargetError> {
        if !self.target.online() {
            return Err(TargetError::Offline);
        }
        let bytes = codec::encode(value, self.compressed)?;
        with_timeout(limit, self.target.write(bytes)).await
    }

    pub async fn timestamp(&self, limit: Option<Duration>) -> Result<Option<Timestamp>, TargetError> {
        if !self.target.online() {
            return Err(TargetError::Offline);
        }
        with_timeout(limit, self.target.timestamp()).await
    }

    /// Snapshot for status displays.
    pub fn state(&self) -> ReplicaState {
        ReplicaState {
            kind: self.target.kind().to_string(),
            target: self.target.serialise(),
            compressed: self.compressed,
            desynced: self.desynced,
            last_seen_write_time: self.last_seen_write_time,
            online: self.target.online(),
        }
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("target", &self.target)
            .field("compressed", &self.compressed)
            .field("desynced", &self.desynced)
            .field("last_seen_write_time", &self.last_seen_write_time)
            .finish()
    }
}

/// Status of one replica as reported to callers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaState {
    pub kind: String,
    pub target: serde_json::Value,
    pub compressed: bool,
    pub desynced: bool,
    pub last_seen_write_time: Option<Timestamp>,
    pub online: bool,
}

/// Remove entries that share a target with an earlier entry.
pub fn dedup_replicas(replicas: Vec<Replica>) -> Vec<Replica> {
    let mut unique: Vec<Replica> = Vec::with_capacity(replicas.len());
    for replica in replicas {
        if !unique.iter().any(|kept| kept.same_target(&replica)) {
            unique.push(replica);
        }
    }
    unique
}

#[derive(Serialize, Deserialize)]
struct ConfigEntry {
    #[serde(rename = "type")]
    kind: String,
    config: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplicaConfig {
    #[serde(default)]
    compressed: bool,
    #[serde(default)]
    desynced: bool,
    #[serde(default)]
    last_seen_write_time: Option<Timestamp>,
    target: serde_json::Value,
}

/// Serialise a replica set to its persisted config string.
pub fn serialise_replicas(replicas: &[Replica]) -> Result<String, ConfigError> {
    let entries = replicas
        .iter()
        .map(|replica| {
            let config = ReplicaConfig {
                compressed: replica.compressed,
                desynced: replica.desynced,
                last_seen_write_time: replica.last_seen_write_time,
                target: replica.target.serialise(),
            };
            Ok(ConfigEntry {
                kind: replica.target.kind().to_string(),
                config: serde_json::to_string(&config)?,
            })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;
    Ok(serde_json::to_string(&entries)?)
}

type Deserializer =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Target>, ConfigError> + Send + Sync>;

/// Maps target kinds to deserializers.
#[derive(Clone, Default)]
pub struct TargetRegistry {
    deserializers: HashMap<String, Deserializer>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a deserializer for `kind`, replacing any previous one.
    pub fn register<F>(mut self, kind: impl Into<String>, deserialize: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn Target>, ConfigError> + Send + Sync + 'static,
    {
        self.deserializers.insert(kind.into(), Arc::new(deserialize));
        self
    }

    /// Register memory targets resolved against `store`.
    pub fn with_memory(self, store: MemoryStore) -> Self {
        self.register(MEMORY_KIND, move |config| {
            let id = config
                .get("id")
                .and_then(|id| id.as_str())
                .ok_or_else(|| ConfigError::InvalidTarget {
                    kind: MEMORY_KIND.to_string(),
                    reason: "missing id".to_string(),
                })?;
            Ok(Arc::new(store.target(id)) as Arc<dyn Target>)
        })
    }

    /// Register local file targets.
    pub fn with_files(self) -> Self {
        self.register(FILE_KIND, |config| {
            let path = config
                .get("path")
                .and_then(|path| path.as_str())
                .ok_or_else(|| ConfigError::InvalidTarget {
                    kind: FILE_KIND.to_string(),
                    reason: "missing path".to_string(),
                })?;
            Ok(Arc::new(FileTarget::new(path)) as Arc<dyn Target>)
        })
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> BTreeSet<String> {
        self.deserializers.keys().cloned().collect()
    }

    /// Rebuild a replica set from its config string.
    ///
    /// Entries of unknown kind, or whose config cannot be parsed, are dropped
    /// with a warning. Only a malformed outer list is an error.
    pub fn deserialise_replicas(&self, config: &str) -> Result<Vec<Replica>, ConfigError> {
        let entries: Vec<ConfigEntry> = serde_json::from_str(config)?;
        let mut replicas = Vec::with_capacity(entries.len());

        for entry in entries {
            let Some(deserialize) = self.deserializers.get(&entry.kind) else {
                tracing::warn!(kind = %entry.kind, "dropping replica of unknown target type");
                continue;
            };
            let parsed = serde_json::from_str::<ReplicaConfig>(&entry.config)
                .map_err(ConfigError::from)
                .and_then(|config| deserialize(&config.target).map(|target| (config, target)));

            match parsed {
                Ok((config, target)) => replicas.push(Replica {
                    target,
                    compressed: config.compressed,
                    desynced: config.desynced,
                    last_seen_write_time: config.last_seen_write_time,
                }),
                Err(error) => {
                    tracing::warn!(kind = %entry.kind, %error, "dropping unreadable replica config");
                }
            }
        }
        Ok(replicas)
    }
}

impl fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
