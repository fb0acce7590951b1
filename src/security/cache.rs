//! # Validation Cache
//!
//! Two-tier cache of [`ValidationResult`]s keyed by token identifier (`jti`, or
//! the signature segment for tokens without one).
//!
//! ## Tiers
//!
//! - **valid**: tokens that passed signature and time checks. Every access
//!   re-checks expiry (with clock skew) and that the stored raw token equals
//!   the presented one. Either failure demotes the entry.
//! - **invalid**: negative verdicts. Returned as-is until [`ValidationCache::clear`]
//!   or [`ValidationCache::invalidate`].
//!
//! Entries live as long as the token they describe; there is no background
//! eviction. Staleness is detected lazily on lookup.
//!
//! ## Concurrency
//!
//! Both tiers are `DashMap`s. Readers clone the `Arc` out of the map before
//! deciding anything, so no read guard is held across a demotion. Demotion
//! checks pointer identity under the entry lock: when two requests race to
//! demote the same entry only one moves it, the other still reports an
//! invalid verdict.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::Rejection;
use super::validation::{now_secs, ValidationResult};

/// Result of [`ValidationCache::lookup`].
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// Valid entry matching the presented token; skip verification
    Hit(Arc<ValidationResult>),
    /// Valid entry found expired or tampered; it now lives in the invalid tier
    Demoted(Arc<ValidationResult>),
    /// Previously recorded negative verdict
    NegativeHit(Arc<ValidationResult>),
    /// Nothing cached; verify and [`store`](ValidationCache::store)
    Miss,
}

/// Cache counters, see [`ValidationCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the valid tier
    pub hits: u64,
    /// Lookups answered from the invalid tier
    pub negative_hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Entries moved from the valid to the invalid tier
    pub demotions: u64,
    /// Current valid tier size
    pub valid_entries: usize,
    /// Current invalid tier size
    pub invalid_entries: usize,
}

impl CacheStats {
    /// Share of lookups that avoided verification, as a percentage.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let answered = self.hits + self.negative_hits;
        let total = answered + self.misses;
        if total == 0 {
            0.0
        } else {
            (answered as f64 / total as f64) * 100.0
        }
    }
}

/// Process-lifetime cache of verification verdicts.
#[derive(Debug)]
pub struct ValidationCache {
    enabled: bool,
    clock_skew_secs: u64,
    valid: DashMap<String, Arc<ValidationResult>>,
    invalid: DashMap<String, Arc<ValidationResult>>,
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    demotions: AtomicU64,
}

impl ValidationCache {
    /// Create a cache. A disabled cache always misses and never stores.
    pub fn new(enabled: bool, clock_skew_secs: u64) -> Self {
        info!(enabled, clock_skew_secs, "Initializing token validation cache");
        Self {
            enabled,
            clock_skew_secs,
            valid: DashMap::new(),
            invalid: DashMap::new(),
            hits: AtomicU64::new(0),
            negative_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
        }
    }

    /// Whether lookups and stores do anything.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up `jti` for the presented `raw` token.
    pub fn lookup(&self, jti: &str, raw: &str) -> CacheLookup {
        self.lookup_at(jti, raw, now_secs())
    }

    pub(crate) fn lookup_at(&self, jti: &str, raw: &str, now: i64) -> CacheLookup {
        if !self.enabled {
            return CacheLookup::Miss;
        }

        // Clone out so the shard guard is released before any mutation
        let cached = self.valid.get(jti).map(|entry| Arc::clone(entry.value()));
        if let Some(entry) = cached {
            let stale = if entry.is_expired(now, self.clock_skew_secs) {
                Some(Rejection::ExpiredToken)
            } else if entry.raw_payload() != raw {
                Some(Rejection::TamperedToken)
            } else {
                None
            };
            return match stale {
                None => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(jti, "token validation cache hit");
                    CacheLookup::Hit(entry)
                }
                Some(reason) => CacheLookup::Demoted(self.demote(jti, &entry, reason)),
            };
        }

        let negative = self.invalid.get(jti).map(|entry| Arc::clone(entry.value()));
        match negative {
            Some(entry) => {
                self.negative_hits.fetch_add(1, Ordering::Relaxed);
                debug!(jti, "token validation cache negative hit");
                CacheLookup::NegativeHit(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Miss
            }
        }
    }

    fn demote(
        &self,
        jti: &str,
        entry: &Arc<ValidationResult>,
        reason: Rejection,
    ) -> Arc<ValidationResult> {
        let label = reason.label();
        let demoted = Arc::new(entry.demoted(reason));
        // Holding the valid-tier entry while inserting into the invalid tier
        // means no reader can observe the key in neither tier
        if let Entry::Occupied(occupied) = self.valid.entry(jti.to_string()) {
            if Arc::ptr_eq(occupied.get(), entry) {
                self.invalid.insert(jti.to_string(), Arc::clone(&demoted));
                occupied.remove();
                self.demotions.fetch_add(1, Ordering::Relaxed);
                warn!(jti, reason = label, "cached token demoted to invalid tier");
            }
        }
        demoted
    }

    /// Record a verification outcome in the tier matching its validity.
    /// Provisional results are returned without being recorded.
    pub fn store(&self, jti: &str, result: ValidationResult) -> Arc<ValidationResult> {
        let result = Arc::new(result);
        if !self.enabled {
            return result;
        }
        if !result.is_cacheable() {
            debug!(jti, "provisional verdict, not cached");
            return result;
        }
        if result.is_valid() {
            self.invalid.remove(jti);
            self.valid.insert(jti.to_string(), Arc::clone(&result));
        } else {
            self.valid.remove(jti);
            self.invalid.insert(jti.to_string(), Arc::clone(&result));
        }
        result
    }

    /// Forget everything about `jti`. Returns whether anything was removed.
    pub fn invalidate(&self, jti: &str) -> bool {
        let valid = self.valid.remove(jti).is_some();
        let invalid = self.invalid.remove(jti).is_some();
        valid || invalid
    }

    /// Drop both tiers. Counters are kept.
    pub fn clear(&self) {
        let removed = self.valid.len() + self.invalid.len();
        self.valid.clear();
        self.invalid.clear();
        info!(removed, "token validation cache cleared");
    }

    /// Snapshot of counters and tier sizes.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            valid_entries: self.valid.len(),
            invalid_entries: self.invalid.len(),
        }
    }
}
