//! Member tier lookup with an injected TTL cache
//!
//! Eviction contract when the cache is full: drop every expired entry first,
//! then the oldest-inserted one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;

use clubhouse_shared::{normalize_email, TierCatalog, TierLimits};

use crate::error::BillingResult;
use crate::store::MemberStore;

/// Tier name plus its limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTier {
    pub name: String,
    pub limits: TierLimits,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: ResolvedTier,
    inserted_at: Instant,
    sequence: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    next_sequence: u64,
}

/// Bounded TTL cache of member email -> resolved tier
#[derive(Debug, Clone)]
pub struct MemberTierCache {
    state: Arc<RwLock<CacheState>>,
    ttl: Duration,
    max_entries: usize,
}

impl MemberTierCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        entry.inserted_at.elapsed() < self.ttl
    }

    pub async fn get(&self, email: &str) -> Option<ResolvedTier> {
        let state = self.state.read().await;
        state
            .entries
            .get(email)
            .filter(|entry| self.is_fresh(entry))
            .map(|entry| entry.value.clone())
    }

    pub async fn insert(&self, email: String, value: ResolvedTier) {
        let mut state = self.state.write().await;

        if !state.entries.contains_key(&email) && state.entries.len() >= self.max_entries {
            let ttl = self.ttl;
            state
                .entries
                .retain(|_, entry| entry.inserted_at.elapsed() < ttl);

            if state.entries.len() >= self.max_entries {
                let oldest = state
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.sequence)
                    .map(|(key, _)| key.clone());
                if let Some(key) = oldest {
                    state.entries.remove(&key);
                }
            }
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.entries.insert(
            email,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                sequence,
            },
        );
    }

    pub async fn invalidate(&self, email: &str) {
        self.state.write().await.entries.remove(email);
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

/// Maps a member email to their tier, consulting the cache first
#[derive(Clone)]
pub struct TierResolver {
    members: Arc<dyn MemberStore>,
    catalog: Arc<TierCatalog>,
    cache: MemberTierCache,
}

impl TierResolver {
    pub fn new(members: Arc<dyn MemberStore>, catalog: Arc<TierCatalog>, cache: MemberTierCache) -> Self {
        Self {
            members,
            catalog,
            cache,
        }
    }

    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    /// Tier for `email`; `None` when the member or their tier is unknown
    pub async fn resolve(&self, email: &str) -> BillingResult<Option<ResolvedTier>> {
        let key = normalize_email(email);
        if key.is_empty() {
            return Ok(None);
        }

        if let Some(hit) = self.cache.get(&key).await {
            return Ok(Some(hit));
        }

        let Some(tier_name) = self.members.member_tier(&key).await? else {
            return Ok(None);
        };

        self.resolve_named(&tier_name, Some(key)).await
    }

    /// Look up an explicitly supplied tier name
    pub fn resolve_tier_name(&self, tier_name: &str) -> Option<ResolvedTier> {
        self.catalog.get(tier_name).map(|limits| ResolvedTier {
            name: tier_name.trim().to_lowercase(),
            limits,
        })
    }

    async fn resolve_named(
        &self,
        tier_name: &str,
        cache_key: Option<String>,
    ) -> BillingResult<Option<ResolvedTier>> {
        let Some(resolved) = self.resolve_tier_name(tier_name) else {
            tracing::warn!(tier = %tier_name, "Member has a tier missing from the catalog");
            return Ok(None);
        };

        if let Some(key) = cache_key {
            self.cache.insert(key, resolved.clone()).await;
        }
        Ok(Some(resolved))
    }

    /// Drop a cached member after a tier change
    pub async fn invalidate(&self, email: &str) {
        self.cache.invalidate(&normalize_email(email)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLedgerStore;

    fn tier(name: &str) -> ResolvedTier {
        ResolvedTier {
            name: name.to_string(),
            limits: TierCatalog::standard().get(name).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_cache_hit_and_invalidate() {
        let cache = MemberTierCache::new(Duration::from_secs(60), 10);
        cache.insert("a@club.test".into(), tier("core")).await;

        assert_eq!(cache.get("a@club.test").await, Some(tier("core")));
        cache.invalidate("a@club.test").await;
        assert_eq!(cache.get("a@club.test").await, None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_returned() {
        let cache = MemberTierCache::new(Duration::ZERO, 10);
        cache.insert("a@club.test".into(), tier("core")).await;
        assert_eq!(cache.get("a@club.test").await, None);
    }

    #[tokio::test]
    async fn test_full_cache_evicts_oldest_inserted() {
        let cache = MemberTierCache::new(Duration::from_secs(60), 2);
        cache.insert("a@club.test".into(), tier("core")).await;
        cache.insert("b@club.test".into(), tier("premium")).await;
        cache.insert("c@club.test".into(), tier("vip")).await;

        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("a@club.test").await, None);
        assert!(cache.get("b@club.test").await.is_some());
        assert!(cache.get("c@club.test").await.is_some());
    }

    #[tokio::test]
    async fn test_full_cache_drops_expired_before_oldest() {
        let cache = MemberTierCache::new(Duration::ZERO, 2);
        cache.insert("a@club.test".into(), tier("core")).await;
        cache.insert("b@club.test".into(), tier("core")).await;
        cache.insert("c@club.test".into(), tier("core")).await;

        // Both earlier entries were already expired and got swept together
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_resolver_reads_store_then_cache() {
        let store = Arc::new(InMemoryLedgerStore::new());
        store.set_member_tier("Host@Club.test", "premium").await;

        let resolver = TierResolver::new(
            store.clone(),
            Arc::new(TierCatalog::standard()),
            MemberTierCache::new(Duration::from_secs(60), 10),
        );

        let resolved = resolver.resolve(" host@club.test ").await.unwrap().unwrap();
        assert_eq!(resolved.name, "premium");
        assert_eq!(resolved.limits.guest_passes_per_month, 8);

        // Tier change is invisible until invalidated
        store.set_member_tier("host@club.test", "core").await;
        assert_eq!(resolver.resolve("host@club.test").await.unwrap().unwrap().name, "premium");
        resolver.invalidate("host@club.test").await;
        assert_eq!(resolver.resolve("host@club.test").await.unwrap().unwrap().name, "core");

        assert_eq!(resolver.resolve("nobody@club.test").await.unwrap(), None);
        assert_eq!(resolver.resolve("").await.unwrap(), None);
    }
}
