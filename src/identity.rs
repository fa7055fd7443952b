// ============================================================================
// Identity Map
// ============================================================================
//
// Per-repository cache guaranteeing one live instance per persisted key.
// Two partitions: persisted (key -> instance) and unpersisted (instances
// without a key). An instance belongs to exactly one partition at a time.
// The map performs no I/O.
// ============================================================================

use crate::core::{EntityKey, PersistError, Result};
use crate::entity::EntityRef;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// Default ceiling for the persisted partition before garbage collection
/// starts evicting.
pub const DEFAULT_MAX_SIZE: usize = 1024;

/// Which partition an entity landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Persisted,
    Unpersisted,
}

struct PersistedEntry {
    entity: EntityRef,
    touched: u64,
}

pub struct IdentityMap {
    persisted: HashMap<EntityKey, PersistedEntry>,
    unpersisted: Vec<EntityRef>,
    max_size: usize,
    touch_counter: u64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            persisted: HashMap::new(),
            unpersisted: Vec::new(),
            max_size,
            touch_counter: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn persisted_len(&self) -> usize {
        self.persisted.len()
    }

    pub fn unpersisted_len(&self) -> usize {
        self.unpersisted.len()
    }

    fn next_touch(&mut self) -> u64 {
        self.touch_counter += 1;
        self.touch_counter
    }

    fn persisted_key_of(&self, entity: &EntityRef) -> Option<EntityKey> {
        self.persisted
            .iter()
            .find(|(_, entry)| Arc::ptr_eq(&entry.entity, entity))
            .map(|(key, _)| key.clone())
    }

    fn unpersisted_position(&self, entity: &EntityRef) -> Option<usize> {
        self.unpersisted
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, entity))
    }

    /// Store an entity in the partition its key dictates.
    ///
    /// Attaching the same instance twice is a no-op; attaching a *different*
    /// instance under an occupied key is a fatal consistency error.
    pub fn attach(&mut self, entity: &EntityRef) -> Result<Partition> {
        let key = entity.read()?.key();

        match key {
            Some(key) => {
                if let Some(entry) = self.persisted.get_mut(&key) {
                    if Arc::ptr_eq(&entry.entity, entity) {
                        entry.touched = self.touch_counter + 1;
                        self.touch_counter += 1;
                        return Ok(Partition::Persisted);
                    }
                    return Err(PersistError::KeyCollision(format!(
                        "key '{}' is already held by a different instance",
                        key
                    )));
                }

                if let Some(position) = self.unpersisted_position(entity) {
                    self.unpersisted.remove(position);
                }

                let touched = self.next_touch();
                self.persisted.insert(
                    key,
                    PersistedEntry {
                        entity: Arc::clone(entity),
                        touched,
                    },
                );
                Ok(Partition::Persisted)
            }
            None => {
                if self.unpersisted_position(entity).is_none() {
                    self.unpersisted.push(Arc::clone(entity));
                }
                Ok(Partition::Unpersisted)
            }
        }
    }

    /// Remove the entity from whichever partition holds it.
    pub fn detach(&mut self, entity: &EntityRef) -> Result<bool> {
        if let Some(key) = self.persisted_key_of(entity) {
            self.persisted.remove(&key);
            return Ok(true);
        }
        if let Some(position) = self.unpersisted_position(entity) {
            self.unpersisted.remove(position);
            return Ok(true);
        }
        Ok(false)
    }

    /// Move a persisted entity's entry to its current key.
    pub fn rekey(&mut self, entity: &EntityRef) -> Result<()> {
        let new_key = entity.read()?.key().ok_or_else(|| {
            PersistError::Execution("cannot rekey an entity without a key".to_string())
        })?;
        let old_key = self.persisted_key_of(entity).ok_or_else(|| {
            PersistError::Execution("cannot rekey an entity that is not persisted".to_string())
        })?;

        if old_key == new_key {
            return Ok(());
        }

        if let Some(existing) = self.persisted.get(&new_key) {
            if !Arc::ptr_eq(&existing.entity, entity) {
                return Err(PersistError::KeyCollision(format!(
                    "cannot rekey to '{}': key is already held by a different instance",
                    new_key
                )));
            }
        }

        let mut entry = self
            .persisted
            .remove(&old_key)
            .expect("entry vanished between lookup and removal");
        entry.touched = self.next_touch();
        self.persisted.insert(new_key, entry);
        Ok(())
    }

    /// Look up a persisted entity by key, refreshing its recency.
    pub fn get(&mut self, key: &EntityKey) -> Option<EntityRef> {
        let touched = self.touch_counter + 1;
        let entry = self.persisted.get_mut(key)?;
        entry.touched = touched;
        self.touch_counter = touched;
        Some(Arc::clone(&entry.entity))
    }

    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.persisted.contains_key(key)
    }

    /// True when the entity is not in the persisted partition.
    pub fn is_new(&self, entity: &EntityRef) -> bool {
        self.persisted_key_of(entity).is_none()
    }

    /// Force the persisted/unpersisted state of an entity.
    ///
    /// Forcing "not new" requires a resolvable key and fails on collision;
    /// forcing "new" detaches the entity from the persisted partition.
    pub fn set_new_state(&mut self, entity: &EntityRef, new: bool) -> Result<()> {
        if new {
            if let Some(key) = self.persisted_key_of(entity) {
                self.persisted.remove(&key);
            }
            if self.unpersisted_position(entity).is_none() {
                self.unpersisted.push(Arc::clone(entity));
            }
            return Ok(());
        }

        let key = entity.read()?.key().ok_or_else(|| {
            PersistError::Execution(
                "forcing an entity to not-new requires a resolvable key".to_string(),
            )
        })?;

        if let Some(existing) = self.persisted.get(&key) {
            if !Arc::ptr_eq(&existing.entity, entity) {
                return Err(PersistError::KeyCollision(format!(
                    "key '{}' is already held by a different instance",
                    key
                )));
            }
        }

        if let Some(position) = self.unpersisted_position(entity) {
            self.unpersisted.remove(position);
        }
        let touched = self.next_touch();
        self.persisted.insert(
            key,
            PersistedEntry {
                entity: Arc::clone(entity),
                touched,
            },
        );
        Ok(())
    }

    /// Evict least-recently-touched unchanged entries while the persisted
    /// partition exceeds the configured ceiling. Changed entries are never
    /// evicted. Returns the number of entries removed.
    pub fn garbage_collect(&mut self) -> Result<usize> {
        let mut removed = 0usize;

        while self.persisted.len() > self.max_size {
            let mut victim: Option<(EntityKey, u64)> = None;
            for (key, entry) in &self.persisted {
                if entry.entity.read()?.is_changed() {
                    continue;
                }
                match &victim {
                    Some((_, oldest)) if entry.touched >= *oldest => {}
                    _ => victim = Some((key.clone(), entry.touched)),
                }
            }

            let Some((key, _)) = victim else {
                // Everything left is changed and pinned.
                break;
            };
            debug!("identity map evicting key '{}'", key);
            self.persisted.remove(&key);
            removed += 1;
        }

        Ok(removed)
    }

    /// Remove a single persisted entry if it is unchanged.
    pub fn garbage_collect_key(&mut self, key: &EntityKey) -> Result<bool> {
        let Some(entry) = self.persisted.get(key) else {
            return Ok(false);
        };
        if entry.entity.read()?.is_changed() {
            return Ok(false);
        }
        self.persisted.remove(key);
        Ok(true)
    }
}

impl Default for IdentityMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{StubEntity, note, persisted_note};

    #[test]
    fn test_attach_partitions_by_key() {
        let mut map = IdentityMap::new();

        let fresh = note("unsaved");
        assert_eq!(map.attach(&fresh).unwrap(), Partition::Unpersisted);

        let saved = persisted_note("saved", 1);
        assert_eq!(map.attach(&saved).unwrap(), Partition::Persisted);

        assert_eq!(map.unpersisted_len(), 1);
        assert_eq!(map.persisted_len(), 1);
    }

    #[test]
    fn test_attach_same_instance_twice_is_noop() {
        let mut map = IdentityMap::new();
        let saved = persisted_note("saved", 1);

        map.attach(&saved).unwrap();
        map.attach(&saved).unwrap();
        assert_eq!(map.persisted_len(), 1);
    }

    #[test]
    fn test_attach_distinct_instance_same_key_collides() {
        let mut map = IdentityMap::new();
        map.attach(&persisted_note("first", 7)).unwrap();

        let imposter = persisted_note("second", 7);
        let err = map.attach(&imposter).unwrap_err();
        assert!(matches!(err, PersistError::KeyCollision(_)));
    }

    #[test]
    fn test_get_returns_same_instance() {
        let mut map = IdentityMap::new();
        let saved = persisted_note("saved", 3);
        map.attach(&saved).unwrap();

        let found = map.get(&EntityKey::Int(3)).unwrap();
        assert!(Arc::ptr_eq(&found, &saved));
    }

    #[test]
    fn test_detach_removes_from_either_partition() {
        let mut map = IdentityMap::new();
        let fresh = note("unsaved");
        let saved = persisted_note("saved", 1);
        map.attach(&fresh).unwrap();
        map.attach(&saved).unwrap();

        assert!(map.detach(&fresh).unwrap());
        assert!(map.detach(&saved).unwrap());
        assert!(!map.detach(&saved).unwrap());
        assert_eq!(map.persisted_len() + map.unpersisted_len(), 0);
    }

    #[test]
    fn test_rekey_moves_entry() {
        let mut map = IdentityMap::new();
        let saved = persisted_note("saved", 1);
        map.attach(&saved).unwrap();

        saved.write().unwrap().set_key(Some(EntityKey::Int(2)));
        map.rekey(&saved).unwrap();

        assert!(map.get(&EntityKey::Int(1)).is_none());
        assert!(map.get(&EntityKey::Int(2)).is_some());
    }

    #[test]
    fn test_rekey_to_occupied_key_collides() {
        let mut map = IdentityMap::new();
        let first = persisted_note("first", 1);
        let second = persisted_note("second", 2);
        map.attach(&first).unwrap();
        map.attach(&second).unwrap();

        second.write().unwrap().set_key(Some(EntityKey::Int(1)));
        assert!(matches!(
            map.rekey(&second).unwrap_err(),
            PersistError::KeyCollision(_)
        ));
    }

    #[test]
    fn test_set_new_state_requires_key() {
        let mut map = IdentityMap::new();
        let fresh = note("unsaved");
        map.attach(&fresh).unwrap();

        assert!(map.set_new_state(&fresh, false).is_err());

        fresh.write().unwrap().set_key(Some(EntityKey::Int(9)));
        map.set_new_state(&fresh, false).unwrap();
        assert!(!map.is_new(&fresh));
        assert_eq!(map.unpersisted_len(), 0);

        map.set_new_state(&fresh, true).unwrap();
        assert!(map.is_new(&fresh));
        assert_eq!(map.persisted_len(), 0);
    }

    #[test]
    fn test_garbage_collect_evicts_oldest_unchanged() {
        let mut map = IdentityMap::with_max_size(2);
        let oldest = persisted_note("a", 1);
        let middle = persisted_note("b", 2);
        let newest = persisted_note("c", 3);
        map.attach(&oldest).unwrap();
        map.attach(&middle).unwrap();
        map.attach(&newest).unwrap();

        let removed = map.garbage_collect().unwrap();
        assert_eq!(removed, 1);
        assert!(!map.contains_key(&EntityKey::Int(1)));
        assert!(map.contains_key(&EntityKey::Int(2)));
        assert!(map.contains_key(&EntityKey::Int(3)));
    }

    #[test]
    fn test_garbage_collect_never_evicts_changed() {
        let mut map = IdentityMap::with_max_size(1);
        let dirty_a = StubEntity::new("note", "notes")
            .with_key(EntityKey::Int(1))
            .changed()
            .into_ref();
        let dirty_b = StubEntity::new("note", "notes")
            .with_key(EntityKey::Int(2))
            .changed()
            .into_ref();
        map.attach(&dirty_a).unwrap();
        map.attach(&dirty_b).unwrap();

        let removed = map.garbage_collect().unwrap();
        assert_eq!(removed, 0);
        assert_eq!(map.persisted_len(), 2);
    }

    #[test]
    fn test_garbage_collect_key_respects_changed_flag() {
        let mut map = IdentityMap::new();
        let clean = persisted_note("clean", 1);
        let dirty = StubEntity::new("note", "notes")
            .with_key(EntityKey::Int(2))
            .changed()
            .into_ref();
        map.attach(&clean).unwrap();
        map.attach(&dirty).unwrap();

        assert!(map.garbage_collect_key(&EntityKey::Int(1)).unwrap());
        assert!(!map.garbage_collect_key(&EntityKey::Int(2)).unwrap());
        assert!(!map.garbage_collect_key(&EntityKey::Int(99)).unwrap());
    }

    #[test]
    fn test_recently_used_entry_survives_gc() {
        let mut map = IdentityMap::with_max_size(1);
        let first = persisted_note("a", 1);
        let second = persisted_note("b", 2);
        map.attach(&first).unwrap();
        map.attach(&second).unwrap();

        // Touch the older entry so the newer one becomes the victim.
        map.get(&EntityKey::Int(1)).unwrap();

        map.garbage_collect().unwrap();
        assert!(map.contains_key(&EntityKey::Int(1)));
        assert!(!map.contains_key(&EntityKey::Int(2)));
    }
}
