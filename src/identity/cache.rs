//! Memoizing wrapper around any [`ClassResolver`].

use super::{ClassIdentity, ClassResolver, TypeEntry};
use crate::constants::limits::MAX_CACHED_MISSES;
use dashmap::DashMap;
use std::any::TypeId;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Lookup counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub cached_identities: usize,
    /// Unrecognized identities among `cached_identities`
    pub cached_misses: usize,
    pub cached_types: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Caches both lookup directions, negative results included.
///
/// Identities come from stored rows, so unknown ones are remembered only up
/// to a limit ([`MAX_CACHED_MISSES`] by default).
///
/// Concurrent fills for the same key race harmlessly: resolution is pure, so
/// whichever writer lands last stores an identical value.
#[derive(Debug)]
pub struct CachedClassResolver<R> {
    inner: R,
    by_identity: DashMap<String, Option<Arc<TypeEntry>>>,
    by_type: DashMap<TypeId, Option<ClassIdentity>>,
    hits: AtomicU64,
    misses: AtomicU64,
    cached_misses: AtomicUsize,
    miss_limit: usize,
}

impl<R: ClassResolver> CachedClassResolver<R> {
    pub fn new(inner: R) -> Self {
        Self::with_miss_limit(inner, MAX_CACHED_MISSES)
    }

    pub fn with_miss_limit(inner: R, miss_limit: usize) -> Self {
        Self {
            inner,
            by_identity: DashMap::new(),
            by_type: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            cached_misses: AtomicUsize::new(0),
            miss_limit,
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cached_identities: self.by_identity.len(),
            cached_misses: self.cached_misses.load(Ordering::Relaxed),
            cached_types: self.by_type.len(),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: ClassResolver> ClassResolver for CachedClassResolver<R> {
    fn resolve(&self, identity: &str) -> Option<Arc<TypeEntry>> {
        if let Some(cached) = self.by_identity.get(identity) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return cached.value().clone();
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let resolved = self.inner.resolve(identity);
        if resolved.is_none() {
            let cached = self.cached_misses.fetch_add(1, Ordering::Relaxed);
            if cached >= self.miss_limit {
                self.cached_misses.fetch_sub(1, Ordering::Relaxed);
                if cached == self.miss_limit {
                    tracing::warn!(
                        limit = self.miss_limit,
                        "⚠️ Unknown class identity cache full, further misses are not cached"
                    );
                }
                return None;
            }
            tracing::debug!(identity = identity, "Class identity not recognized");
        }
        self.by_identity
            .insert(identity.to_string(), resolved.clone());
        resolved
    }

    fn identity_for(&self, type_id: TypeId) -> Option<ClassIdentity> {
        if let Some(cached) = self.by_type.get(&type_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return cached.value().clone();
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let resolved = self.inner.identity_for(type_id);
        self.by_type.insert(type_id, resolved.clone());
        resolved
    }
}
