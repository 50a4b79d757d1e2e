//! Manager-id registry and manager cache.

use crate::error::{ManagerError, Result};
use crate::manager::{Manager, ManagerBuilder};
use jasper_core::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;

/// Set of live manager ids.
///
/// Managers claim their id on start and release it when their driver stops.
/// Tests inject a fresh registry instead of sharing [`ManagerIds::global`].
#[derive(Clone, Debug, Default)]
pub struct ManagerIds {
    ids: Arc<Mutex<HashMap<String, usize>>>,
}

impl ManagerIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<ManagerIds> = OnceLock::new();
        GLOBAL.get_or_init(ManagerIds::new).clone()
    }

    /// Claim `id`. Fails if it is already live, unless duplicates are allowed.
    pub fn claim(&self, id: &str, allow_duplicate: bool) -> Result<Registration> {
        let mut ids = self.ids.lock();
        let count = ids.entry(id.to_string()).or_insert(0);
        if *count > 0 && !allow_duplicate {
            return Err(ManagerError::DuplicateId(id.to_string()));
        }
        *count += 1;
        Ok(Registration {
            ids: self.clone(),
            id: id.to_string(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.lock().contains_key(id)
    }

    /// Forget every id.
    pub fn clear(&self) {
        self.ids.lock().clear();
    }

    fn release(&self, id: &str) {
        let mut ids = self.ids.lock();
        if let Some(count) = ids.get_mut(id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ids.remove(id);
            }
        }
    }
}

/// A claimed id, released on drop.
#[derive(Debug)]
pub struct Registration {
    ids: ManagerIds,
    id: String,
}

impl Registration {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.ids.release(&self.id);
    }
}

/// Reuses live managers by id.
///
/// A second request for a cached id returns the running manager and patches
/// its tunables with the requested ones. The set of target kinds must match.
pub struct ManagerCache<V: Value> {
    entries: Arc<Mutex<HashMap<String, Arc<OnceCell<Manager<V>>>>>>,
}

impl<V: Value> Clone for ManagerCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<V: Value> Default for ManagerCache<V> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<V: Value> ManagerCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live manager for the builder's id, or start one.
    ///
    /// Builders without an id are always started fresh.
    pub async fn get_or_start(&self, builder: ManagerBuilder<V>) -> Result<Manager<V>> {
        let Some(id) = builder.config().id.clone() else {
            return builder.start().await;
        };
        let requested = builder.target_kinds();
        let tunables = builder.tunables();

        let cell = {
            let mut entries = self.entries.lock();
            let cell = entries.entry(id.clone()).or_default();
            if cell.get().is_some_and(|manager| manager.is_stopped()) {
                *cell = Arc::default();
            }
            cell.clone()
        };

        let mut started = false;
        let manager = cell
            .get_or_try_init(|| {
                started = true;
                builder.start()
            })
            .await?
            .clone();

        if started {
            return Ok(manager);
        }
        if manager.target_kinds() != requested.as_slice() {
            return Err(ManagerError::InconsistentTargetKinds {
                id,
                cached: manager.target_kinds().to_vec(),
                requested,
            });
        }
        tracing::debug!(%id, "reusing cached manager");
        manager.tune(|current| *current = tunables)?;
        Ok(manager)
    }

    pub fn get(&self, id: &str) -> Option<Manager<V>> {
        self.entries.lock().get(id).and_then(|cell| cell.get().cloned())
    }

    /// Forget the cached manager for `id`. The manager keeps running.
    pub fn remove(&self, id: &str) -> Option<Manager<V>> {
        self.entries.lock().remove(id).and_then(|cell| cell.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_id_rejected() {
        let ids = ManagerIds::new();
        let first = ids.claim("settings", false).unwrap();
        assert_eq!(first.id(), "settings");
        assert_eq!(
            ids.claim("settings", false).unwrap_err(),
            ManagerError::DuplicateId("settings".to_string())
        );
    }

    #[test]
    fn test_release_on_drop() {
        let ids = ManagerIds::new();
        let registration = ids.claim("settings", false).unwrap();
        assert!(ids.contains("settings"));
        drop(registration);
        assert!(!ids.contains("settings"));
        assert!(ids.claim("settings", false).is_ok());
    }

    #[test]
    fn test_allowed_duplicates_are_counted() {
        let ids = ManagerIds::new();
        let first = ids.claim("shared", false).unwrap();
        let second = ids.claim("shared", true).unwrap();
        drop(first);
        assert!(ids.contains("shared"));
        drop(second);
        assert!(!ids.contains("shared"));
    }

    #[test]
    fn test_clear() {
        let ids = ManagerIds::new();
        let _a = ids.claim("a", false).unwrap();
        ids.clear();
        assert!(ids.claim("a", false).is_ok());
    }
}
