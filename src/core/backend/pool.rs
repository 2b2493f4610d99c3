// src/core/backend/pool.rs

//! The pool slot and the per-worker cache that keeps pool slots alive
//! across frontend sessions.
//!
//! A pool slot aggregates exactly one backend slot per backend that was
//! valid (up, not quarantined) when the slot was created. If the valid set
//! changes while the slot sits in the cache, the slot is invalidated at the
//! next lookup and rebuilt; it is never mutated in place.

use crate::core::RelayError;
use crate::core::backend::slot::BackendSlot;
use crate::core::credentials::{CredentialStore, Secret};
use crate::core::status::StatusSnapshot;
use lru::LruCache;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Instant;
use tracing::{debug, info};

/// Cache key: one pool slot per `(user, database, protocol-major)` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub user: String,
    pub database: String,
    pub protocol_major: i32,
}

impl PoolKey {
    pub fn new(user: &str, database: &str, protocol_major: i32) -> Self {
        Self {
            user: user.to_string(),
            database: database.to_string(),
            protocol_major,
        }
    }
}

/// A group of backend slots for one pool key, plus the parameter-status
/// mirror replayed to frontends that pick up the cached slot.
pub struct PoolSlot {
    pub key: PoolKey,
    slots: BTreeMap<usize, BackendSlot>,
    /// Every `ParameterStatus` seen from any backend, latest value wins.
    pub params: BTreeMap<String, String>,
    /// Status-table generation the slot was created against.
    pub generation: u64,
    /// The secret used to open the backend slots; a changed secret kind
    /// invalidates the slot instead of re-authenticating in place.
    secret: Secret,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u64,
}

impl std::fmt::Debug for PoolSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSlot")
            .field("key", &self.key)
            .field("backends", &self.slots.keys().collect::<Vec<_>>())
            .field("generation", &self.generation)
            .field("use_count", &self.use_count)
            .finish()
    }
}

impl PoolSlot {
    /// Opens one backend slot per valid backend in the snapshot.
    pub async fn create(
        key: PoolKey,
        snapshot: &StatusSnapshot,
        store: &CredentialStore,
    ) -> Result<Self, RelayError> {
        let secret = store.resolve(&key.user)?;
        let mut slots: BTreeMap<usize, BackendSlot> = BTreeMap::new();
        let mut params = BTreeMap::new();

        for entry in snapshot.entries.iter().filter(|e| e.selectable()) {
            let slot = match BackendSlot::open(
                entry.node_id,
                &entry.host,
                entry.port,
                &key.user,
                &key.database,
                &secret,
                &mut params,
            )
            .await
            {
                Ok(slot) => slot,
                Err(e) => {
                    // Partial creation must not leak sockets.
                    for (_, mut opened) in slots {
                        opened.close().await;
                    }
                    return Err(e);
                }
            };
            slots.insert(entry.node_id, slot);
        }

        if slots.is_empty() {
            return Err(RelayError::NoEligibleBackend);
        }

        debug!(
            "Created pool slot for {}@{} across {} backend(s)",
            key.user,
            key.database,
            slots.len()
        );

        Ok(Self {
            key,
            slots,
            params,
            generation: snapshot.generation,
            secret,
            created_at: Instant::now(),
            last_used_at: Instant::now(),
            use_count: 0,
        })
    }

    /// Validates a cached slot for reuse: same status generation, compatible
    /// secret, and every socket still alive.
    pub fn reusable(&self, current_generation: u64, current_secret: &Secret) -> bool {
        if self.generation != current_generation {
            debug!("Pool slot {:?} stale: status generation changed", self.key);
            return false;
        }
        if std::mem::discriminant(&self.secret) != std::mem::discriminant(current_secret) {
            debug!("Pool slot {:?} stale: credential format changed", self.key);
            return false;
        }
        self.slots.values().all(|s| s.is_alive())
    }

    /// Marks the slot checked out by a new logical session.
    pub fn checkout(&mut self) {
        self.use_count += 1;
        self.last_used_at = Instant::now();
        for slot in self.slots.values_mut() {
            slot.mark_reused();
        }
    }

    pub fn node_ids(&self) -> Vec<usize> {
        self.slots.keys().copied().collect()
    }

    pub fn slot(&self, node_id: usize) -> Option<&BackendSlot> {
        self.slots.get(&node_id)
    }

    pub fn slot_mut(&mut self, node_id: usize) -> Result<&mut BackendSlot, RelayError> {
        self.slots
            .get_mut(&node_id)
            .ok_or(RelayError::BackendUnavailable(node_id))
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut BackendSlot> {
        self.slots.values_mut()
    }

    /// Removes a dead backend slot so the rest of the pool slot can finish
    /// the session; the slot as a whole is invalidated at the next lookup.
    pub async fn discard_backend(&mut self, node_id: usize) {
        if let Some(mut slot) = self.slots.remove(&node_id) {
            slot.close().await;
        }
    }

    /// The `(node_id, host, port, pid, cancel_key)` tuples needed to resolve
    /// frontend cancel requests against this slot.
    pub fn cancel_targets(&self) -> Vec<(usize, String, u16, i32, i32)> {
        self.slots
            .values()
            .map(|s| (s.node_id, s.host.clone(), s.port, s.pid(), s.cancel_key()))
            .collect()
    }

    pub fn record_parameter(&mut self, key: &str, value: &str) {
        self.params.insert(key.to_string(), value.to_string());
    }

    pub async fn close_all(&mut self) {
        for slot in self.slots.values_mut() {
            slot.close().await;
        }
        self.slots.clear();
    }
}

/// The per-worker LRU cache of pool slots. Strictly worker-local; no
/// cross-worker sharing on the hot path.
pub struct PoolCache {
    cache: LruCache<PoolKey, PoolSlot>,
}

impl PoolCache {
    pub fn new(max_pool: usize) -> Self {
        let cap = NonZeroUsize::new(max_pool.max(1)).expect("max_pool is nonzero");
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Looks up a reusable pool slot, discarding it on any validation
    /// failure. The caller creates and re-inserts on miss.
    pub async fn take(
        &mut self,
        key: &PoolKey,
        current_generation: u64,
        store: &CredentialStore,
    ) -> Option<PoolSlot> {
        let mut slot = self.cache.pop(key)?;
        let secret = store.resolve(&key.user).ok()?;
        if slot.reusable(current_generation, &secret) {
            slot.checkout();
            Some(slot)
        } else {
            slot.close_all().await;
            None
        }
    }

    /// Returns a slot to the cache, closing the LRU victim on overflow.
    pub async fn put(&mut self, slot: PoolSlot) {
        if let Some((evicted_key, mut evicted)) = self.cache.push(slot.key.clone(), slot) {
            // `push` returns the displaced entry; on key collision it is the
            // old value for the same key, which we also just close.
            debug!("Evicting pool slot {:?} from worker cache", evicted_key);
            evicted.close_all().await;
        }
    }

    /// Closes everything, e.g. on backend-state-sync or worker recycling.
    pub async fn invalidate_all(&mut self) {
        let count = self.cache.len();
        while let Some((_, mut slot)) = self.cache.pop_lru() {
            slot.close_all().await;
        }
        if count > 0 {
            info!("Invalidated {count} cached pool slot(s)");
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
