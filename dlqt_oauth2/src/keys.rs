use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use dlqt_auth::{
    error::KeyRejected,
    jwk::{KeyIdRef, KeySet, VerificationKey},
};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    source::{CacheValidators, FetchError, Fetched, KeySource},
    TenantId, TenantIdRef,
};

/// A failure to produce a verification key for a token
#[derive(Debug, Error)]
pub enum KeyError {
    /// The tenant is not on the allow-list, so no keys were fetched
    #[error("tenant is not trusted")]
    UntrustedTenant,

    /// The tenant publishes no signing key under the token's key id
    #[error("no signing key published under the token's key id")]
    UnknownKeyId,

    /// The tenant's key set could not be obtained
    #[error("signing keys unavailable")]
    Unavailable(#[source] FetchError),

    /// The published key could not be used
    #[error("published key rejected")]
    Rejected(#[from] KeyRejected),
}

impl KeyError {
    /// Whether the failure is due to the identity provider rather than the token
    #[must_use]
    pub fn is_provider_outage(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Timing policy for the key set cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub struct ResolverConfig {
    freshness: Duration,
    min_refresh_interval: Duration,
    fetch_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(60 * 60),
            min_refresh_interval: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

impl ResolverConfig {
    /// How long a fetched key set is used before it is refreshed
    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// The minimum time between refresh attempts for one tenant
    ///
    /// Limits forced refreshes triggered by unknown key ids, and retries
    /// after a failed fetch.
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Upper bound on a single fetch
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// How long a fetched key set is used before it is refreshed
    #[must_use]
    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// The minimum time between refresh attempts for one tenant
    #[must_use]
    pub fn min_refresh_interval(&self) -> Duration {
        self.min_refresh_interval
    }

    /// Upper bound on a single fetch
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }
}

#[derive(Debug)]
struct Snapshot {
    keys: KeySet,
    validators: CacheValidators,
    fetched_at: Instant,
}

#[derive(Debug, Default)]
struct RefreshState {
    last_attempt: Option<Instant>,
}

#[derive(Debug, Default)]
struct Slot {
    snapshot: ArcSwapOption<Snapshot>,
    refresh: Mutex<RefreshState>,
}

#[derive(Debug)]
struct Inner {
    source: Arc<dyn KeySource>,
    slots: HashMap<TenantId, Slot>,
    config: ResolverConfig,
}

/// A cache of published key sets, one slot per allow-listed tenant
///
/// Lookups read the current snapshot without locking. A stale or missing
/// snapshot is refreshed by one caller at a time; callers that queued
/// behind that refresh reuse its result instead of fetching again.
///
/// Cloning is cheap and clones share the cache.
#[derive(Debug, Clone)]
#[must_use]
pub struct KeyResolver {
    inner: Arc<Inner>,
}

impl KeyResolver {
    /// Constructs a resolver for `tenants`, fetching keys from `source`
    ///
    /// Nothing is fetched until the first lookup.
    pub fn new<S, I>(source: S, tenants: I, config: ResolverConfig) -> Self
    where
        S: KeySource + 'static,
        I: IntoIterator<Item = TenantId>,
    {
        let slots = tenants
            .into_iter()
            .map(|tenant| (tenant, Slot::default()))
            .collect();

        Self {
            inner: Arc::new(Inner {
                source: Arc::new(source),
                slots,
                config,
            }),
        }
    }

    /// The cache timing policy
    pub fn config(&self) -> ResolverConfig {
        self.inner.config
    }

    /// Whether `tenant` has a slot in this cache
    #[must_use]
    pub fn is_trusted(&self, tenant: &TenantIdRef) -> bool {
        self.inner.slots.contains_key(tenant)
    }

    /// Resolves the signing key published by `tenant` under `kid`
    ///
    /// If the cached key set does not contain `kid`, one forced refresh is
    /// attempted, unless the cached set was fetched less than the minimum
    /// refresh interval ago.
    ///
    /// # Errors
    ///
    /// * [`KeyError::UntrustedTenant`] if `tenant` is not allow-listed
    /// * [`KeyError::Unavailable`] if no key set could be obtained
    /// * [`KeyError::UnknownKeyId`] if no signing key is published under `kid`
    /// * [`KeyError::Rejected`] if the published key cannot be converted
    pub async fn resolve(
        &self,
        tenant: &TenantIdRef,
        kid: &KeyIdRef,
    ) -> Result<VerificationKey, KeyError> {
        let slot = self
            .inner
            .slots
            .get(tenant)
            .ok_or(KeyError::UntrustedTenant)?;

        let current = slot.snapshot.load_full();
        let (snapshot, refreshed) = match current {
            Some(snapshot) if self.is_fresh(&snapshot) => {
                tracing::trace!(%tenant, "key set cache hit");
                (snapshot, false)
            }
            stale => match self.refresh_slot(tenant, slot, stale.clone()).await {
                Ok(snapshot) => (snapshot, true),
                Err(err) => match stale {
                    Some(stale) => {
                        if let FetchError::Throttled = err {
                            tracing::debug!(%tenant, "key set refresh throttled; using stale key set");
                        } else {
                            tracing::warn!(%tenant, error = %err, "key set refresh failed; using stale key set");
                        }
                        (stale, true)
                    }
                    None => return Err(KeyError::Unavailable(err)),
                },
            },
        };

        if let Some(key) = snapshot.keys.find_signing_key(kid) {
            return Ok(key.to_verification_key()?);
        }

        if refreshed || snapshot.fetched_at.elapsed() < self.inner.config.min_refresh_interval {
            tracing::debug!(%tenant, %kid, "no signing key published under key id");
            return Err(KeyError::UnknownKeyId);
        }

        tracing::debug!(%tenant, %kid, "unknown key id; forcing key set refresh");
        let snapshot = match self.refresh_slot(tenant, slot, Some(snapshot)).await {
            Ok(snapshot) => snapshot,
            Err(FetchError::Throttled) => return Err(KeyError::UnknownKeyId),
            Err(err) => return Err(KeyError::Unavailable(err)),
        };

        let key = snapshot.keys.find_signing_key(kid).ok_or_else(|| {
            tracing::debug!(%tenant, %kid, "no signing key published under key id after refresh");
            KeyError::UnknownKeyId
        })?;

        Ok(key.to_verification_key()?)
    }

    /// Refreshes every tenant's key set now
    ///
    /// Failures are logged and leave the previous key set in place.
    pub async fn refresh_all(&self) {
        for (tenant, slot) in &self.inner.slots {
            let current = slot.snapshot.load_full();
            let _ = self.refresh_slot(tenant, slot, current).await;
        }
    }

    /// Refreshes every tenant's key set on a fixed interval in the background
    pub fn spawn_refresh(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;

            loop {
                timer.tick().await;
                this.refresh_all().await;
            }
        })
    }

    fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        snapshot.fetched_at.elapsed() < self.inner.config.freshness
    }

    /// Fetches a new snapshot for `slot`, unless one newer than `seen` was
    /// stored while waiting for the refresh lock.
    #[tracing::instrument(skip(self, slot, seen))]
    async fn refresh_slot(
        &self,
        tenant: &TenantIdRef,
        slot: &Slot,
        seen: Option<Arc<Snapshot>>,
    ) -> Result<Arc<Snapshot>, FetchError> {
        let mut state = slot.refresh.lock().await;

        if let Some(latest) = slot.snapshot.load_full() {
            let replaced = seen.as_ref().map_or(true, |s| !Arc::ptr_eq(s, &latest));
            if replaced {
                tracing::trace!("key set refreshed by a concurrent request");
                return Ok(latest);
            }
        }

        let min_interval = self.inner.config.min_refresh_interval;
        if let Some(last_attempt) = state.last_attempt {
            if last_attempt.elapsed() < min_interval {
                tracing::debug!("key set refresh throttled");
                return Err(FetchError::Throttled);
            }
        }
        state.last_attempt = Some(Instant::now());

        let timeout = self.inner.config.fetch_timeout;
        let cached = seen.as_ref().map(|s| &s.validators);
        let fetched = tokio::time::timeout(timeout, self.inner.source.fetch(tenant, cached))
            .await
            .map_err(|_| {
                tracing::warn!(?timeout, "key set fetch timed out");
                FetchError::Timeout(timeout)
            })??;

        let snapshot = match (fetched, seen) {
            (Fetched::Keys { keys, validators }, _) => {
                tracing::info!(keys = keys.len(), "key set refreshed");
                Snapshot {
                    keys,
                    validators,
                    fetched_at: Instant::now(),
                }
            }
            (Fetched::NotModified, Some(seen)) => {
                tracing::debug!("key set unchanged");
                Snapshot {
                    keys: seen.keys.clone(),
                    validators: seen.validators.clone(),
                    fetched_at: Instant::now(),
                }
            }
            (Fetched::NotModified, None) => {
                return Err(FetchError::Status { status: 304 });
            }
        };

        let snapshot = Arc::new(snapshot);
        slot.snapshot.store(Some(Arc::clone(&snapshot)));
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use dlqt_auth::testing;
    use tracing_test::traced_test;

    use super::*;
    use crate::StaticKeySource;

    fn tenant() -> TenantId {
        TenantId::from_static(testing::TENANT)
    }

    fn kid(kid: &str) -> &KeyIdRef {
        KeyIdRef::from_str(kid)
    }

    fn resolver(source: Arc<StaticKeySource>, config: ResolverConfig) -> KeyResolver {
        KeyResolver::new(source, [tenant()], config)
    }

    #[tokio::test]
    async fn caches_key_set_between_lookups() -> Result<()> {
        let source = Arc::new(StaticKeySource::new(testing::key_set()));
        let resolver = resolver(source.clone(), ResolverConfig::default());

        let first = resolver.resolve(&tenant(), kid(testing::KEY_ID)).await?;
        let second = resolver.resolve(&tenant(), kid(testing::KEY_ID)).await?;

        assert_eq!(first, second);
        assert_eq!(source.fetch_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn untrusted_tenant_is_never_fetched() {
        let source = Arc::new(StaticKeySource::new(testing::key_set()));
        let resolver = resolver(source.clone(), ResolverConfig::default());

        let other = TenantId::from_static(testing::OTHER_TENANT);
        let err = resolver
            .resolve(&other, kid(testing::KEY_ID))
            .await
            .unwrap_err();

        assert!(matches!(err, KeyError::UntrustedTenant));
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn unknown_key_id_right_after_fetch_does_not_refetch() {
        let source = Arc::new(StaticKeySource::new(testing::key_set()));
        let resolver = resolver(source.clone(), ResolverConfig::default());

        let err = resolver
            .resolve(&tenant(), kid("not-published"))
            .await
            .unwrap_err();

        assert!(matches!(err, KeyError::UnknownKeyId));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn rotation_is_picked_up_by_one_forced_refresh() -> Result<()> {
        let source = Arc::new(StaticKeySource::new(testing::key_set()));
        let config = ResolverConfig::default().with_min_refresh_interval(Duration::ZERO);
        let resolver = resolver(source.clone(), config);

        resolver.resolve(&tenant(), kid(testing::KEY_ID)).await?;
        source.set_keys(testing::rotated_key_set());

        resolver
            .resolve(&tenant(), kid(testing::ROTATED_KEY_ID))
            .await?;
        assert_eq!(source.fetch_count(), 2);

        // both keys are now cached
        resolver.resolve(&tenant(), kid(testing::KEY_ID)).await?;
        resolver
            .resolve(&tenant(), kid(testing::ROTATED_KEY_ID))
            .await?;
        assert_eq!(source.fetch_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn forced_refresh_respects_minimum_interval() -> Result<()> {
        let source = Arc::new(StaticKeySource::new(testing::key_set()));
        let config = ResolverConfig::default().with_min_refresh_interval(Duration::from_secs(60));
        let resolver = resolver(source.clone(), config);

        resolver.resolve(&tenant(), kid(testing::KEY_ID)).await?;
        source.set_keys(testing::rotated_key_set());

        let err = resolver
            .resolve(&tenant(), kid(testing::ROTATED_KEY_ID))
            .await
            .unwrap_err();

        assert!(matches!(err, KeyError::UnknownKeyId));
        assert_eq!(source.fetch_count(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_fetch() -> Result<()> {
        let source = Arc::new(
            StaticKeySource::new(testing::key_set()).with_latency(Duration::from_millis(50)),
        );
        let resolver = resolver(source.clone(), ResolverConfig::default());

        let lookups = (0..16).map(|_| {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve(&tenant(), kid(testing::KEY_ID)).await })
        });

        for lookup in lookups.collect::<Vec<_>>() {
            lookup.await??;
        }

        assert_eq!(source.fetch_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn outage_without_cached_keys_is_unavailable() {
        let source = Arc::new(StaticKeySource::new(testing::key_set()));
        source.set_unavailable(true);
        let resolver = resolver(source.clone(), ResolverConfig::default());

        let err = resolver
            .resolve(&tenant(), kid(testing::KEY_ID))
            .await
            .unwrap_err();

        assert!(err.is_provider_outage());
    }

    #[tokio::test]
    async fn failed_fetch_is_not_retried_within_minimum_interval() {
        let source = Arc::new(StaticKeySource::new(testing::key_set()));
        source.set_unavailable(true);
        let resolver = resolver(source.clone(), ResolverConfig::default());

        let _ = resolver.resolve(&tenant(), kid(testing::KEY_ID)).await;
        let err = resolver
            .resolve(&tenant(), kid(testing::KEY_ID))
            .await
            .unwrap_err();

        assert!(matches!(err, KeyError::Unavailable(FetchError::Throttled)));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn stale_keys_are_served_when_refresh_fails() -> Result<()> {
        let source = Arc::new(StaticKeySource::new(testing::key_set()));
        let config = ResolverConfig::default()
            .with_freshness(Duration::ZERO)
            .with_min_refresh_interval(Duration::ZERO);
        let resolver = resolver(source.clone(), config);

        resolver.resolve(&tenant(), kid(testing::KEY_ID)).await?;
        source.set_unavailable(true);

        resolver.resolve(&tenant(), kid(testing::KEY_ID)).await?;
        assert_eq!(source.fetch_count(), 2);
        assert!(logs_contain("key set refresh failed; using stale key set"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn throttled_refresh_serves_stale_keys_quietly() -> Result<()> {
        let source = Arc::new(StaticKeySource::new(testing::key_set()));
        let config = ResolverConfig::default()
            .with_freshness(Duration::ZERO)
            .with_min_refresh_interval(Duration::from_secs(3600));
        let resolver = resolver(source.clone(), config);

        resolver.resolve(&tenant(), kid(testing::KEY_ID)).await?;
        for _ in 0..3 {
            resolver.resolve(&tenant(), kid(testing::KEY_ID)).await?;
        }

        assert_eq!(source.fetch_count(), 1);
        assert!(logs_contain("key set refresh throttled; using stale key set"));
        assert!(!logs_contain("key set refresh failed"));
        Ok(())
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let source = Arc::new(
            StaticKeySource::new(testing::key_set()).with_latency(Duration::from_millis(500)),
        );
        let config = ResolverConfig::default().with_fetch_timeout(Duration::from_millis(20));
        let resolver = resolver(source, config);

        let err = resolver
            .resolve(&tenant(), kid(testing::KEY_ID))
            .await
            .unwrap_err();

        assert!(matches!(err, KeyError::Unavailable(FetchError::Timeout(_))));
    }

    #[tokio::test]
    async fn cancelled_lookup_releases_the_refresh_lock() -> Result<()> {
        let source = Arc::new(
            StaticKeySource::new(testing::key_set()).with_latency(Duration::from_millis(200)),
        );
        let config = ResolverConfig::default().with_min_refresh_interval(Duration::ZERO);
        let resolver = resolver(source.clone(), config);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            resolver.resolve(&tenant(), kid(testing::KEY_ID)),
        )
        .await;
        assert!(cancelled.is_err());

        resolver.resolve(&tenant(), kid(testing::KEY_ID)).await?;
        assert_eq!(source.fetch_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_all_populates_every_slot() -> Result<()> {
        let source = Arc::new(StaticKeySource::new(testing::key_set()));
        let resolver = KeyResolver::new(
            source.clone(),
            [tenant(), TenantId::from_static(testing::OTHER_TENANT)],
            ResolverConfig::default(),
        );

        resolver.refresh_all().await;
        assert_eq!(source.fetch_count(), 2);

        resolver.resolve(&tenant(), kid(testing::KEY_ID)).await?;
        assert_eq!(source.fetch_count(), 2);
        Ok(())
    }
}
