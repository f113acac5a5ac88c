//! Entity location tracking and message routing.
//!
//! Maps a virtual entity id to the rank that currently owns it. Lookups
//! are authoritative once an entity is locally registered; otherwise
//! they fall back to a bounded LRU cache of the last-known home, which
//! is refreshed eagerly whenever a message is actually delivered to an
//! entity rather than only on explicit
//! migration notifications, since a stale cache entry is only ever a
//! routing hint, never a consistency requirement.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use crate::types::RankId;

pub type EntityId = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("entity {0} is already registered locally")]
    AlreadyRegistered(EntityId),
    #[error("entity {0} is not registered locally on this rank")]
    NotLocal(EntityId),
    #[error("no known location for entity {0}; message queued pending discovery")]
    Unknown(EntityId),
}

/// A message that could not be routed immediately because no location
/// is known yet. Returned to the caller so the messenger can buffer it
/// and retry once a location update arrives.
pub struct PendingRoute<M> {
    pub entity: EntityId,
    pub payload: M,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residence {
    Local,
    Remote(RankId),
}

struct LruCache {
    capacity: usize,
    order: VecDeque<EntityId>,
    map: HashMap<EntityId, RankId>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self { capacity, order: VecDeque::new(), map: HashMap::new() }
    }

    fn get(&mut self, entity: EntityId) -> Option<RankId> {
        let rank = *self.map.get(&entity)?;
        self.touch(entity);
        Some(rank)
    }

    fn touch(&mut self, entity: EntityId) {
        if let Some(pos) = self.order.iter().position(|&e| e == entity) {
            self.order.remove(pos);
        }
        self.order.push_front(entity);
    }

    fn insert(&mut self, entity: EntityId, rank: RankId) {
        self.map.insert(entity, rank);
        self.touch(entity);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_back() {
                self.map.remove(&evicted);
            }
        }
    }

    fn remove(&mut self, entity: EntityId) {
        self.map.remove(&entity);
        if let Some(pos) = self.order.iter().position(|&e| e == entity) {
            self.order.remove(pos);
        }
    }
}

/// Per-rank directory of entity homes. Local residence
/// (invariant L1: a registered entity is always routable without
/// consulting the cache) always takes precedence over any cached
/// remote hint, which resolves the Open Question of what happens when
/// an emigrate/immigrate round-trip leaves both a local registration
/// and a stale cache entry for the same id (see DESIGN.md).
///
/// Every lookup is given the entity's `home`: the rank that originally
/// registered it, fixed for the entity's whole lifetime regardless of
/// how many times it migrates. Callers carry `home` themselves (it is
/// baked into `VirtualProxy`); `LocationManager` never has to guess it.
/// `home` resolves lookups in three tiers: local residence, then the
/// evictable cache (a hint, valid on any rank), then, only on the home
/// rank itself, a permanent per-entity directory that survives
/// `clear_cache()` — the home rank is the one node that may never
/// forget where an entity it once owned has gone. Anywhere else, an
/// unresolved lookup forwards once to `home`.
pub struct LocationManager {
    self_rank: RankId,
    local: HashMap<EntityId, ()>,
    cache: LruCache,
    homed: HashMap<EntityId, ()>,
    directory: HashMap<EntityId, RankId>,
}

const DEFAULT_CACHE_CAPACITY: usize = 4096;

impl LocationManager {
    pub fn new(self_rank: RankId) -> Self {
        Self {
            self_rank,
            local: HashMap::new(),
            cache: LruCache::new(DEFAULT_CACHE_CAPACITY),
            homed: HashMap::new(),
            directory: HashMap::new(),
        }
    }

    pub fn with_cache_capacity(self_rank: RankId, capacity: usize) -> Self {
        Self {
            self_rank,
            local: HashMap::new(),
            cache: LruCache::new(capacity),
            homed: HashMap::new(),
            directory: HashMap::new(),
        }
    }

    /// `registerEntity(entity)`: the entity is homed on this rank, now
    /// and for the rest of its life — later emigrations update the
    /// cache and this rank's permanent directory, never `homed` itself.
    pub fn register_entity(&mut self, entity: EntityId) -> Result<(), LocationError> {
        if self.local.contains_key(&entity) {
            return Err(LocationError::AlreadyRegistered(entity));
        }
        self.local.insert(entity, ());
        self.homed.insert(entity, ());
        self.cache.remove(entity);
        Ok(())
    }

    /// `unregisterEntity(entity)`: removes a local registration,
    /// typically as the first half of an emigration.
    pub fn unregister_entity(&mut self, entity: EntityId) -> Result<(), LocationError> {
        self.local.remove(&entity).ok_or(LocationError::NotLocal(entity))?;
        Ok(())
    }

    /// `entityEmigrated(entity, new_home)`: the entity has left this
    /// rank for `new_home`. Equivalent to unregistering and caching the
    /// new home in one step; if this rank is `entity`'s home, also
    /// records `new_home` in the permanent directory, which
    /// `clear_cache()` cannot wipe.
    pub fn entity_emigrated(&mut self, entity: EntityId, new_home: RankId) -> Result<(), LocationError> {
        self.unregister_entity(entity)?;
        self.cache.insert(entity, new_home);
        if self.homed.contains_key(&entity) {
            self.directory.insert(entity, new_home);
        }
        Ok(())
    }

    /// `entityImmigrated(entity, from)`: the entity has arrived on this
    /// rank, previously resident at `from`. Does not make this rank
    /// `entity`'s home; only the rank that first called
    /// `register_entity` for it keeps a permanent directory entry.
    pub fn entity_immigrated(&mut self, entity: EntityId, _from: RankId) -> Result<(), LocationError> {
        if self.local.contains_key(&entity) {
            return Err(LocationError::AlreadyRegistered(entity));
        }
        self.local.insert(entity, ());
        self.cache.remove(entity);
        Ok(())
    }

    fn residence(&mut self, entity: EntityId) -> Option<Residence> {
        if self.local.contains_key(&entity) {
            return Some(Residence::Local);
        }
        self.cache.get(entity).map(Residence::Remote)
    }

    /// `getLocation(entity, home)`: best-known current location for
    /// `entity`. Checked in order: local residence, the evictable
    /// cache, then — only if this rank *is* `home` — the permanent
    /// directory. If none of those resolve it and this rank isn't
    /// `home`, the authoritative answer is "ask home", returned as
    /// `Some(home)` so the caller forwards there once; if this rank
    /// *is* `home` and still comes up empty, there truly is no record
    /// and `None` is returned (home's `no_node` reply).
    pub fn get_location(&mut self, entity: EntityId, home: RankId) -> Option<RankId> {
        if let Some(residence) = self.residence(entity) {
            return Some(match residence {
                Residence::Local => self.self_rank,
                Residence::Remote(rank) => rank,
            });
        }
        if self.self_rank == home {
            return self.directory.get(&entity).copied();
        }
        Some(home)
    }

    /// `routeMsg(entity, home, payload)`: resolves a destination for
    /// `entity`, forwarding to `home` at most once when neither this
    /// rank nor its cache knows better. On success returns `Ok(rank)`
    /// (which may be `self_rank`, meaning local delivery, or `home`,
    /// meaning forward); only a `no_node` reply from `home` itself
    /// hands the payload back wrapped for the caller to buffer.
    pub fn route_msg<M>(&mut self, entity: EntityId, home: RankId, payload: M) -> Result<RankId, PendingRoute<M>> {
        match self.get_location(entity, home) {
            Some(rank) => Ok(rank),
            None => Err(PendingRoute { entity, payload }),
        }
    }

    /// Refreshes the cache eagerly on successful local delivery
    /// (invariant L2), called by the messenger once it has actually
    /// routed a message to `entity`'s current home.
    pub fn note_delivered(&mut self, entity: EntityId, home: RankId) {
        if home == self.self_rank {
            return;
        }
        if self.local.contains_key(&entity) {
            return;
        }
        self.cache.insert(entity, home);
    }

    /// Drops every evictable cache entry, keeping local registrations
    /// and the permanent home directory intact. A rank that is `home`
    /// for a migrated-away entity still resolves `get_location` for it
    /// correctly afterward; any other rank's knowledge of that entity
    /// is gone until it is re-learned via `note_delivered` or another
    /// forward through `home`.
    pub fn clear_cache(&mut self) {
        self.cache = LruCache::new(self.cache.capacity);
    }

    pub fn is_local(&self, entity: EntityId) -> bool {
        self.local.contains_key(&entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_registration_takes_precedence_over_cache() {
        let mut loc = LocationManager::new(0);
        loc.cache.insert(42, 3);
        loc.register_entity(42).unwrap();
        assert_eq!(loc.get_location(42, 0), Some(0));
    }

    #[test]
    fn emigrate_then_immigrate_converges_to_local() {
        let mut loc = LocationManager::new(0);
        loc.register_entity(7).unwrap();
        loc.entity_emigrated(7, 1).unwrap();
        assert_eq!(loc.get_location(7, 0), Some(1));
        loc.entity_immigrated(7, 1).unwrap();
        assert_eq!(loc.get_location(7, 0), Some(0));
        assert!(loc.is_local(7));
    }

    #[test]
    fn unknown_entity_at_home_routes_to_pending() {
        // rank 0 is its own home for entity 99 and has never heard of
        // it: nowhere left to forward, so it's a genuine no_node.
        let mut loc = LocationManager::new(0);
        match loc.route_msg(99, 0, "payload") {
            Err(pending) => {
                assert_eq!(pending.entity, 99);
                assert_eq!(pending.payload, "payload");
            }
            Ok(_) => panic!("expected a no_node route"),
        }
    }

    #[test]
    fn unknown_entity_elsewhere_forwards_to_home() {
        // rank 2 has no local/cached knowledge of entity 99, but knows
        // its home is rank 0: route once to home rather than giving up.
        let mut loc = LocationManager::new(2);
        assert_eq!(loc.route_msg(99, 0, "payload").unwrap(), 0);
    }

    #[test]
    fn clear_cache_preserves_the_home_rank_permanent_directory() {
        // rank 0 is home for entity 7, which emigrates to rank 1. After
        // clear_cache(), rank 0's cache hint is gone but its directory
        // entry survives, so getLocation still resolves correctly.
        let mut home = LocationManager::new(0);
        home.register_entity(7).unwrap();
        home.entity_emigrated(7, 1).unwrap();
        assert_eq!(home.get_location(7, 0), Some(1));

        home.clear_cache();
        assert_eq!(home.get_location(7, 0), Some(1), "the permanent directory must survive a cache clear");
    }

    #[test]
    fn clear_cache_on_a_non_home_rank_forgets_the_hint() {
        let mut other = LocationManager::new(2);
        other.note_delivered(7, 1);
        assert_eq!(other.get_location(7, 0), Some(1));

        other.clear_cache();
        assert_eq!(other.get_location(7, 0), Some(0), "no permanent record here, only home remains to ask");
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut loc = LocationManager::with_cache_capacity(0, 2);
        loc.cache.insert(1, 1);
        loc.cache.insert(2, 2);
        loc.cache.get(1);
        loc.cache.insert(3, 3);
        assert_eq!(loc.cache.get(2), None);
        assert_eq!(loc.cache.get(1), Some(1));
        assert_eq!(loc.cache.get(3), Some(3));
    }

    #[test]
    fn delivery_refreshes_cache_for_remote_entities_only() {
        let mut loc = LocationManager::new(0);
        loc.note_delivered(5, 2);
        assert_eq!(loc.get_location(5, 2), Some(2));
        loc.register_entity(6).unwrap();
        loc.note_delivered(6, 0);
        assert!(loc.is_local(6));
    }
}
