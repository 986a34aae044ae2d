//! Memoization of registry answers.
//!
//! Definitive answers (`Found`/`NotFound`) are stored with the time they
//! were obtained. Unavailability is never stored, so a flaky registry cannot
//! poison the cache, but an expired record can still be served as a stale
//! fallback to callers that tolerate it.

use {
    crate::{
        identifier::Identifier,
        registry::{RegistryResult, UnavailableCause},
        request_sharing::BoxRequestSharing,
    },
    futures::FutureExt,
    prometheus::{
        IntCounterVec,
        core::{AtomicU64, GenericGauge},
    },
    serde::Serialize,
    std::{
        collections::HashMap,
        future::Future,
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    },
    tokio::task::JoinHandle,
};

#[derive(Clone, Debug)]
pub struct Config {
    /// How long a definitive answer is served without asking the registry
    /// again.
    pub ttl: Duration,
    /// Records that were not refreshed for `ttl * grace_multiplier` are
    /// evicted. Until then they remain available as stale fallback.
    pub grace_multiplier: u32,
    /// Hard cap on the number of records. Exceeding it evicts the least
    /// recently requested tenth of the records in one go.
    pub max_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(6 * 60 * 60),
            grace_multiplier: 4,
            max_entries: 100_000,
        }
    }
}

/// Where the answer of a lookup came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Registry,
    StaleFallback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationRecord {
    pub identifier: Identifier,
    pub exists: bool,
    /// Taxpayer name as reported by the registry.
    pub name: Option<String>,
    pub checked_at: Instant,
    pub source: Source,
}

/// Whether an expired record may be served when the registry is unavailable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaleFallback {
    Allow,
    Deny,
}

/// Answer of [`VerificationCache::lookup_or_fetch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lookup {
    pub exists: bool,
    pub from_cache: bool,
    pub source: Source,
    pub name: Option<String>,
}

impl Lookup {
    fn from_record(record: VerificationRecord, source: Source) -> Self {
        Self {
            exists: record.exists,
            from_cache: true,
            source,
            name: record.name,
        }
    }
}

struct Entry {
    record: VerificationRecord,
    requested_at: Instant,
}

struct Storage {
    records: Mutex<HashMap<Identifier, Entry>>,
    config: Config,
}

/// Result of a shared fetch and whether it was answered from a record that
/// was stored while the fetch was being set up.
type Fetched = (RegistryResult, bool);

pub struct VerificationCache {
    storage: Arc<Storage>,
    in_flight: BoxRequestSharing<Identifier, Fetched>,
}

impl VerificationCache {
    pub fn new(config: Config) -> Arc<Self> {
        Metrics::get().reset();
        Arc::new(Self {
            storage: Arc::new(Storage {
                records: Default::default(),
                config,
            }),
            in_flight: BoxRequestSharing::labelled("registry_check".into()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.storage.config
    }

    pub fn len(&self) -> usize {
        self.storage.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the record for `identifier` unless it is older than the
    /// configured TTL.
    pub fn get(&self, identifier: &Identifier, now: Instant) -> Option<VerificationRecord> {
        self.storage.fresh(identifier, now, self.storage.config.ttl)
    }

    /// Stores a definitive answer obtained at `now`.
    pub fn put(&self, identifier: Identifier, exists: bool, now: Instant) {
        self.put_record(identifier, exists, None, now)
    }

    pub fn put_record(
        &self,
        identifier: Identifier,
        exists: bool,
        name: Option<String>,
        now: Instant,
    ) {
        self.storage.insert(identifier, exists, name, now)
    }

    /// Serves a fresh record if there is one, otherwise asks `fetch` for a
    /// new answer. Concurrent callers for the same identifier share a single
    /// fetch.
    ///
    /// Definitive answers are stored as obtained at `now`. If the registry is
    /// unavailable the most recent expired record is returned when `stale`
    /// allows it, otherwise the cause is returned.
    pub async fn lookup_or_fetch<F, Fut>(
        &self,
        identifier: Identifier,
        fetch: F,
        now: Instant,
        ttl: Duration,
        stale: StaleFallback,
    ) -> Result<Lookup, UnavailableCause>
    where
        F: FnOnce(Identifier) -> Fut,
        Fut: Future<Output = RegistryResult> + Send + 'static,
    {
        let metrics = Metrics::get();
        if let Some(record) = self.storage.fresh(&identifier, now, ttl) {
            metrics.access("hits");
            return Ok(Lookup::from_record(record, Source::Registry));
        }
        metrics.access("misses");

        let storage = self.storage.clone();
        let shared = self.in_flight.shared_or_else(identifier, move |identifier| {
            // A previous fetch may have completed since the freshness check
            // above. Its record is stored before its future resolves, so it
            // is visible here.
            if let Some(record) = storage.fresh(identifier, now, ttl) {
                let result = if record.exists {
                    RegistryResult::Found { name: record.name }
                } else {
                    RegistryResult::NotFound
                };
                return futures::future::ready((result, true)).boxed();
            }

            let identifier = *identifier;
            let fetch = fetch(identifier);
            async move {
                let result = fetch.await;
                storage.store(identifier, &result, now);
                (result, false)
            }
            .boxed()
        });

        let (result, from_cache) = shared.await;
        match result {
            RegistryResult::Found { name } => Ok(Lookup {
                exists: true,
                from_cache,
                source: Source::Registry,
                name,
            }),
            RegistryResult::NotFound => Ok(Lookup {
                exists: false,
                from_cache,
                source: Source::Registry,
                name: None,
            }),
            RegistryResult::Unavailable(cause) => match (stale, self.storage.latest(&identifier)) {
                (StaleFallback::Allow, Some(record)) => {
                    tracing::debug!(%identifier, ?cause, "serving stale verification record");
                    metrics.access("stale_fallback");
                    Ok(Lookup::from_record(record, Source::StaleFallback))
                }
                _ => Err(cause),
            },
        }
    }

    /// Removes records that were not refreshed for `ttl * grace_multiplier`.
    /// Returns the number of evicted records.
    pub fn evict(&self, now: Instant) -> usize {
        self.storage.evict_expired(now)
    }

    /// Spawns a task that periodically evicts expired records and forgets
    /// finished fetches. The task stops once the cache is dropped.
    pub fn spawn_maintenance_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    tracing::debug!("verification cache dropped; stopping maintenance");
                    break;
                };
                let evicted = cache.evict(Instant::now());
                cache.in_flight.collect_garbage();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = cache.len(), "evicted verification records");
                }
            }
        })
    }
}

impl Storage {
    fn fresh(&self, identifier: &Identifier, now: Instant, ttl: Duration) -> Option<VerificationRecord> {
        let mut records = self.records.lock().unwrap();
        let entry = records.get_mut(identifier)?;
        entry.requested_at = now;
        let is_recent = now.saturating_duration_since(entry.record.checked_at) < ttl;
        is_recent.then(|| entry.record.clone())
    }

    /// Most recent record regardless of its age.
    fn latest(&self, identifier: &Identifier) -> Option<VerificationRecord> {
        self.records
            .lock()
            .unwrap()
            .get(identifier)
            .map(|entry| entry.record.clone())
    }

    fn store(&self, identifier: Identifier, result: &RegistryResult, now: Instant) {
        match result {
            RegistryResult::Found { name } => self.insert(identifier, true, name.clone(), now),
            RegistryResult::NotFound => self.insert(identifier, false, None, now),
            RegistryResult::Unavailable(_) => (),
        }
    }

    fn insert(&self, identifier: Identifier, exists: bool, name: Option<String>, now: Instant) {
        let mut records = self.records.lock().unwrap();
        records.insert(
            identifier,
            Entry {
                record: VerificationRecord {
                    identifier,
                    exists,
                    name,
                    checked_at: now,
                    source: Source::Registry,
                },
                requested_at: now,
            },
        );

        if records.len() > self.config.max_entries {
            let keep = self.config.max_entries - self.config.max_entries / 10;
            let excess = records.len() - keep;
            let mut by_age: Vec<(Instant, Identifier)> = records
                .iter()
                .map(|(identifier, entry)| (entry.requested_at, *identifier))
                .collect();
            by_age.select_nth_unstable(excess - 1);
            for (_, identifier) in &by_age[..excess] {
                records.remove(identifier);
            }
            tracing::debug!(evicted = excess, "verification cache reached capacity");
        }
        Metrics::get().verification_cache_size.set(records.len() as u64);
    }

    fn evict_expired(&self, now: Instant) -> usize {
        let max_age = self.config.ttl.saturating_mul(self.config.grace_multiplier);
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, entry| now.saturating_duration_since(entry.record.checked_at) < max_age);
        Metrics::get().verification_cache_size.set(records.len() as u64);
        before - records.len()
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Verification cache lookups by result.
    #[metric(labels("result"))]
    verification_cache_access: IntCounterVec,

    /// Number of stored verification records.
    verification_cache_size: GenericGauge<AtomicU64>,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }

    fn reset(&self) {
        for result in ["hits", "misses", "stale_fallback"] {
            self.verification_cache_access
                .with_label_values(&[result])
                .reset();
        }
    }

    fn access(&self, result: &str) {
        self.verification_cache_access
            .with_label_values(&[result])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::identifier::Kind,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    const TTL: Duration = Duration::from_secs(60);

    fn rif(number: u32) -> Identifier {
        Identifier::with_number(Kind::J, number).unwrap()
    }

    fn cache() -> Arc<VerificationCache> {
        VerificationCache::new(Config {
            ttl: TTL,
            grace_multiplier: 3,
            max_entries: 100,
        })
    }

    async fn never_called(_: Identifier) -> RegistryResult {
        panic!("registry must not be called")
    }

    #[test]
    fn put_then_get_within_ttl() {
        let cache = cache();
        let now = Instant::now();
        cache.put(rif(1), true, now);
        cache.put(rif(2), false, now);

        let record = cache.get(&rif(1), now + Duration::from_secs(59)).unwrap();
        assert!(record.exists);
        assert_eq!(record.source, Source::Registry);
        assert!(!cache.get(&rif(2), now).unwrap().exists);

        assert!(cache.get(&rif(1), now + TTL).is_none());
        assert!(cache.get(&rif(3), now).is_none());
    }

    #[tokio::test]
    async fn serves_fresh_records_from_cache() {
        let cache = cache();
        let now = Instant::now();
        cache.put_record(rif(1), true, Some("ACME".into()), now);

        let lookup = cache
            .lookup_or_fetch(rif(1), never_called, now, TTL, StaleFallback::Deny)
            .await
            .unwrap();
        assert_eq!(
            lookup,
            Lookup {
                exists: true,
                from_cache: true,
                source: Source::Registry,
                name: Some("ACME".into()),
            }
        );
    }

    #[tokio::test]
    async fn stores_definitive_answers() {
        let cache = cache();
        let now = Instant::now();

        let lookup = cache
            .lookup_or_fetch(
                rif(1),
                |_| async { RegistryResult::NotFound },
                now,
                TTL,
                StaleFallback::Deny,
            )
            .await
            .unwrap();
        assert!(!lookup.exists);
        assert!(!lookup.from_cache);

        let lookup = cache
            .lookup_or_fetch(rif(1), never_called, now + Duration::from_secs(1), TTL, StaleFallback::Deny)
            .await
            .unwrap();
        assert!(!lookup.exists);
        assert!(lookup.from_cache);
    }

    #[tokio::test]
    async fn refreshes_expired_records() {
        let cache = cache();
        let now = Instant::now();
        cache.put(rif(1), false, now);

        let later = now + TTL;
        let lookup = cache
            .lookup_or_fetch(
                rif(1),
                |_| async { RegistryResult::Found { name: None } },
                later,
                TTL,
                StaleFallback::Deny,
            )
            .await
            .unwrap();
        assert!(lookup.exists);
        assert_eq!(cache.get(&rif(1), later).unwrap().checked_at, later);
    }

    #[tokio::test]
    async fn coalesces_concurrent_fetches() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let lookups = (0..10).map(|_| {
            let calls = calls.clone();
            cache.lookup_or_fetch(
                rif(1),
                move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    RegistryResult::Found { name: None }
                },
                now,
                TTL,
                StaleFallback::Deny,
            )
        });
        let results = futures::future::join_all(lookups).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert!(result.unwrap().exists);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn coalesces_fetches_across_tasks() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .lookup_or_fetch(
                            rif(7),
                            move |_| async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(200)).await;
                                RegistryResult::NotFound
                            },
                            now,
                            TTL,
                            StaleFallback::Deny,
                        )
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert!(!task.await.unwrap().unwrap().exists);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_is_never_stored() {
        let cache = cache();
        let now = Instant::now();

        let result = cache
            .lookup_or_fetch(
                rif(1),
                |_| async { RegistryResult::Unavailable(UnavailableCause::Timeout) },
                now,
                TTL,
                StaleFallback::Allow,
            )
            .await;
        assert_eq!(result, Err(UnavailableCause::Timeout));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn serves_stale_record_when_registry_is_unavailable() {
        let cache = cache();
        let now = Instant::now();
        cache.put(rif(1), true, now);
        let later = now + TTL + Duration::from_secs(1);

        let unavailable = |_| async { RegistryResult::Unavailable(UnavailableCause::TransportError) };
        let lookup = cache
            .lookup_or_fetch(rif(1), unavailable, later, TTL, StaleFallback::Allow)
            .await
            .unwrap();
        assert_eq!(lookup.source, Source::StaleFallback);
        assert!(lookup.exists);
        assert!(lookup.from_cache);

        // The stale record was neither refreshed nor replaced.
        assert!(cache.get(&rif(1), later).is_none());
        assert_eq!(
            cache.storage.latest(&rif(1)).unwrap().checked_at,
            now
        );

        let result = cache
            .lookup_or_fetch(rif(1), unavailable, later, TTL, StaleFallback::Deny)
            .await;
        assert_eq!(result, Err(UnavailableCause::TransportError));
    }

    #[test]
    fn evicts_after_grace_period() {
        let cache = cache();
        let now = Instant::now();
        cache.put(rif(1), true, now);
        cache.put(rif(2), true, now + TTL);

        assert_eq!(cache.evict(now + TTL * 3 - Duration::from_secs(1)), 0);
        assert_eq!(cache.evict(now + TTL * 3), 1);
        assert!(cache.storage.latest(&rif(1)).is_none());
        assert!(cache.storage.latest(&rif(2)).is_some());
    }

    #[test]
    fn evicts_least_recently_requested_at_capacity() {
        let cache = VerificationCache::new(Config {
            ttl: TTL,
            grace_multiplier: 3,
            max_entries: 2,
        });
        let now = Instant::now();
        cache.put(rif(1), true, now);
        cache.put(rif(2), true, now + Duration::from_secs(1));
        // Requesting the first record makes the second one the oldest.
        assert!(cache.get(&rif(1), now + Duration::from_secs(2)).is_some());
        cache.put(rif(3), true, now + Duration::from_secs(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.storage.latest(&rif(1)).is_some());
        assert!(cache.storage.latest(&rif(2)).is_none());
        assert!(cache.storage.latest(&rif(3)).is_some());
    }

    #[test]
    fn evicts_in_batches_at_capacity() {
        let cache = VerificationCache::new(Config {
            ttl: TTL,
            grace_multiplier: 3,
            max_entries: 10,
        });
        let now = Instant::now();
        for number in 1..=10 {
            cache.put(rif(number), true, now + Duration::from_secs(number.into()));
        }
        assert!(cache.get(&rif(1), now + Duration::from_secs(20)).is_some());

        // Overflowing drops down to nine records at once.
        cache.put(rif(11), true, now + Duration::from_secs(21));
        assert_eq!(cache.len(), 9);
        assert!(cache.storage.latest(&rif(1)).is_some());
        assert!(cache.storage.latest(&rif(2)).is_none());
        assert!(cache.storage.latest(&rif(3)).is_none());
        assert!(cache.storage.latest(&rif(11)).is_some());

        // The freed room is used without evicting again.
        cache.put(rif(12), true, now + Duration::from_secs(22));
        assert_eq!(cache.len(), 10);
        assert!(cache.storage.latest(&rif(4)).is_some());
    }

    #[tokio::test]
    async fn maintenance_stops_with_cache() {
        let cache = cache();
        let task = cache.spawn_maintenance_task(Duration::from_millis(10));
        drop(cache);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
