//! The permission cache.
//!
//! Two maps, both TTL-bounded against an injected [`Clock`]:
//!
//! - **Coarse**: `(user, academy) -> Option<Membership>`. `None` is a cached
//!   absent-membership sentinel, so repeated checks for non-members do not
//!   hammer the store.
//! - **Fine**: `(user, academy, department) -> PermissionSet`.
//!
//! Concurrent misses on the same key coalesce onto a single loader call
//! (per-key gates; distinct keys never contend). Invalidation is synchronous:
//! when `invalidate_*` returns, the entries are gone, which is what gives
//! permission changes read-your-writes behavior. Each invalidation also
//! publishes an [`InvalidationEvent`] for subscribers.

use crate::cache::clock::{Clock, SystemClock};
use crate::cache::invalidation::{InvalidationEvent, InvalidationPublisher};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::membership::models::{AcademyId, DepartmentId, Membership, RoleId, UserId};
use crate::rbac::models::PermissionSet;
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tracing::debug;

type CoarseKey = (UserId, AcademyId);
type FineKey = (UserId, AcademyId, Option<DepartmentId>);

// ═══════════════════════════════════════════════════════════════════════════════
// Entries and Stats
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A point-in-time view of cache counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Misses that waited on another caller's load instead of loading.
    pub coalesced: u64,
    pub invalidations: u64,
    pub membership_entries: usize,
    pub permission_entries: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Permission Cache
// ═══════════════════════════════════════════════════════════════════════════════

/// TTL cache for memberships and effective permission sets.
pub struct PermissionCache {
    memberships: DashMap<CoarseKey, Entry<Option<Membership>>>,
    permissions: DashMap<FineKey, Entry<PermissionSet>>,

    // Per-key single-flight gates. An entry exists only while a load for
    // that key is in flight.
    membership_flights: DashMap<CoarseKey, Arc<Mutex<()>>>,
    permission_flights: DashMap<FineKey, Arc<Mutex<()>>>,

    // Invalidation generations. A loader captures the generation for its
    // key before running; if an invalidation bumped it while the load was
    // in flight, the result is returned but not cached, so a stale value
    // can never outlive the write that superseded it.
    key_generations: DashMap<CoarseKey, u64>,
    broad_epoch: AtomicU64,

    clock: Arc<dyn Clock>,
    config: CacheConfig,
    events: InvalidationPublisher,

    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    invalidations: AtomicU64,
}

impl PermissionCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let events = InvalidationPublisher::new(config.event_capacity);
        Self {
            memberships: DashMap::new(),
            permissions: DashMap::new(),
            membership_flights: DashMap::new(),
            permission_flights: DashMap::new(),
            key_generations: DashMap::new(),
            broad_epoch: AtomicU64::new(0),
            clock,
            config,
            events,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// A cache with default TTLs on the system clock.
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default(), Arc::new(SystemClock))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Coarse: memberships
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the cached membership for `(user, academy)`, loading on miss.
    ///
    /// `Ok(None)` means "known non-member" and is cached as a sentinel.
    /// Loader errors are propagated and nothing is cached for the key.
    pub async fn membership_or_load<F, Fut>(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        load: F,
    ) -> Result<Option<Membership>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Membership>>>,
    {
        let key = (user_id.clone(), academy_id.clone());

        if let Some(value) = self.peek_membership(&key) {
            self.record_hit("membership");
            return Ok(value);
        }

        let gate = self
            .membership_flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _in_flight = gate.lock().await;

        // Another caller may have completed the load while we waited.
        if let Some(value) = self.peek_membership(&key) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            counter!("academy_permission_cache_coalesced_total", "map" => "membership")
                .increment(1);
            return Ok(value);
        }

        self.record_miss("membership");
        let generation = self.generation(&key.0, &key.1);
        let result = load().await;
        self.membership_flights.remove(&key);

        let value = result?;
        if self.generation(&key.0, &key.1) != generation {
            // Superseded by an invalidation while the load was in flight.
            // The result is still fine to return, but caching it would
            // resurrect pre-write state.
            debug!(user_id = %key.0, academy_id = %key.1, "discarding superseded membership load");
            return Ok(value);
        }
        let expires_at = self.clock.now() + self.config.membership_ttl;
        debug!(user_id = %key.0, academy_id = %key.1, cached_absent = value.is_none(), "membership cached");
        self.memberships.insert(
            key,
            Entry {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(value)
    }

    /// The invalidation generation covering `(user, academy)` entries in
    /// both maps.
    fn generation(&self, user_id: &UserId, academy_id: &AcademyId) -> (u64, u64) {
        let per_key = self
            .key_generations
            .get(&(user_id.clone(), academy_id.clone()))
            .map(|g| *g)
            .unwrap_or(0);
        (self.broad_epoch.load(Ordering::Acquire), per_key)
    }

    fn peek_membership(&self, key: &CoarseKey) -> Option<Option<Membership>> {
        let now = self.clock.now();
        if let Some(entry) = self.memberships.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        // Expired: drop the read guard before removing.
        self.memberships.remove(key);
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fine: permission sets
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the cached effective permission set, loading on miss.
    pub async fn permissions_or_load<F, Fut>(
        &self,
        user_id: &UserId,
        academy_id: &AcademyId,
        department_id: Option<&DepartmentId>,
        load: F,
    ) -> Result<PermissionSet>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PermissionSet>>,
    {
        let key = (
            user_id.clone(),
            academy_id.clone(),
            department_id.cloned(),
        );

        if let Some(value) = self.peek_permissions(&key) {
            self.record_hit("permissions");
            return Ok(value);
        }

        let gate = self
            .permission_flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _in_flight = gate.lock().await;

        if let Some(value) = self.peek_permissions(&key) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            counter!("academy_permission_cache_coalesced_total", "map" => "permissions")
                .increment(1);
            return Ok(value);
        }

        self.record_miss("permissions");
        let generation = self.generation(&key.0, &key.1);
        let result = load().await;
        self.permission_flights.remove(&key);

        let value = result?;
        if self.generation(&key.0, &key.1) != generation {
            debug!(user_id = %key.0, academy_id = %key.1, "discarding superseded permissions load");
            return Ok(value);
        }
        let expires_at = self.clock.now() + self.config.permissions_ttl;
        self.permissions.insert(
            key,
            Entry {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(value)
    }

    fn peek_permissions(&self, key: &FineKey) -> Option<PermissionSet> {
        let now = self.clock.now();
        if let Some(entry) = self.permissions.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        self.permissions.remove(key);
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invalidation (synchronous)
    // ─────────────────────────────────────────────────────────────────────────

    /// Drop everything cached for one `(user, academy)` pair.
    pub fn invalidate_membership(&self, user_id: &UserId, academy_id: &AcademyId) {
        *self
            .key_generations
            .entry((user_id.clone(), academy_id.clone()))
            .or_insert(0) += 1;
        self.memberships
            .remove(&(user_id.clone(), academy_id.clone()));
        self.permissions
            .retain(|(u, a, _), _| !(u == user_id && a == academy_id));
        self.record_invalidation("membership");
        self.events.publish(InvalidationEvent::Membership {
            user_id: user_id.clone(),
            academy_id: academy_id.clone(),
        });
    }

    /// Drop everything cached for one user, across academies.
    pub fn invalidate_user(&self, user_id: &UserId) {
        self.broad_epoch.fetch_add(1, Ordering::AcqRel);
        self.memberships.retain(|(u, _), _| u != user_id);
        self.permissions.retain(|(u, _, _), _| u != user_id);
        self.record_invalidation("user");
        self.events.publish(InvalidationEvent::User {
            user_id: user_id.clone(),
        });
    }

    /// Drop everything cached for one academy, across users.
    pub fn invalidate_academy(&self, academy_id: &AcademyId) {
        self.broad_epoch.fetch_add(1, Ordering::AcqRel);
        self.memberships.retain(|(_, a), _| a != academy_id);
        self.permissions.retain(|(_, a, _), _| a != academy_id);
        self.record_invalidation("academy");
        self.events.publish(InvalidationEvent::Academy {
            academy_id: academy_id.clone(),
        });
    }

    /// Drop all fine permission entries. Memberships stay: a catalog change
    /// alters what roles grant, not who is a member.
    pub fn invalidate_permissions(&self, role_id: Option<RoleId>) {
        self.broad_epoch.fetch_add(1, Ordering::AcqRel);
        self.permissions.clear();
        self.record_invalidation("role_catalog");
        self.events
            .publish(InvalidationEvent::RoleCatalog { role_id });
    }

    /// Full flush.
    pub fn clear(&self) {
        self.broad_epoch.fetch_add(1, Ordering::AcqRel);
        self.key_generations.clear();
        self.memberships.clear();
        self.permissions.clear();
        self.record_invalidation("all");
        self.events.publish(InvalidationEvent::All);
    }

    /// Subscribe to invalidation events.
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.events.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stats
    // ─────────────────────────────────────────────────────────────────────────

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            membership_entries: self.memberships.len(),
            permission_entries: self.permissions.len(),
        }
    }

    fn record_hit(&self, map: &'static str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!("academy_permission_cache_hits_total", "map" => map).increment(1);
    }

    fn record_miss(&self, map: &'static str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!("academy_permission_cache_misses_total", "map" => map).increment(1);
    }

    fn record_invalidation(&self, scope: &'static str) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        counter!("academy_permission_cache_invalidations_total", "scope" => scope).increment(1);
    }
}

impl std::fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionCache")
            .field("membership_entries", &self.memberships.len())
            .field("permission_entries", &self.permissions.len())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
