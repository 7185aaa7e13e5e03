//! Scope-local store of "before" snapshots.
//!
//! Each operation scope owns exactly one store. The first capture for a key
//! wins; later captures for the same key are ignored so that an unrelated
//! callback observing an already-mutated entity cannot overwrite the true
//! prior state.

use std::collections::HashMap;

use tracing::trace;

use crate::entity::{Attributes, EntityKey, EntityType, Snapshot};

/// Write-once, read-many snapshot cache.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    by_key: HashMap<EntityKey, Snapshot>,
}

impl SnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a "before" snapshot unless one already exists for the key.
    ///
    /// Returns `true` if the snapshot was stored.
    pub fn capture(
        &mut self,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<String>,
        attributes: Attributes,
    ) -> bool {
        self.capture_snapshot(Snapshot::new(entity_type, entity_id, attributes))
    }

    /// Stores an already built snapshot unless one already exists for its key.
    pub fn capture_snapshot(&mut self, snapshot: Snapshot) -> bool {
        if self.by_key.contains_key(snapshot.key()) {
            trace!(entity = %snapshot.key(), "before snapshot already captured, ignoring");
            return false;
        }
        self.by_key.insert(snapshot.key().clone(), snapshot);
        true
    }

    /// Returns the stored "before" snapshot, or `None` meaning "no prior
    /// state: treat as creation".
    #[must_use]
    pub fn get(&self, entity_type: &EntityType, entity_id: &str) -> Option<&Snapshot> {
        // Borrowed lookup would need a custom Borrow impl on the key pair.
        self.by_key.get(&EntityKey {
            entity_type: entity_type.clone(),
            entity_id: entity_id.to_string(),
        })
    }

    /// Returns the stored snapshot for a key.
    #[must_use]
    pub fn get_by_key(&self, key: &EntityKey) -> Option<&Snapshot> {
        self.by_key.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.by_key.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
