use crate::errors::Result;
use crate::path::SecretPath;
use crate::types::SecretValue;
use lru::LruCache;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Served from a live cache entry; no backend call was made.
    CacheHit,
    /// Produced by a backend fetch (own or coalesced into another caller's).
    Fetched,
}

struct CacheEntry {
    value: SecretValue,
    expires_at: Instant,
}

type FlightResult = Option<Result<SecretValue>>;

enum Flight {
    Lead(watch::Sender<FlightResult>),
    Join(watch::Receiver<FlightResult>),
}

/// Capacity-bounded cache of secret values with lease-derived expiry.
///
/// Concurrent fetches of the same path coalesce into a single backend call:
/// the first caller fetches, late arrivals wait for its broadcast result.
/// A failed fetch is broadcast to the waiters of that flight but never
/// stored, so an error cannot poison the entry.
pub struct LeaseCache {
    entries: Mutex<LruCache<SecretPath, CacheEntry>>,
    inflight: Mutex<HashMap<SecretPath, watch::Receiver<FlightResult>>>,
    default_ttl: Duration,
}

impl LeaseCache {
    /// `default_ttl` applies to values whose backend reported no lease.
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            inflight: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Return the cached value for `path`, or run `fetch` to produce it.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        path: &SecretPath,
        fetch: F,
    ) -> Result<(SecretValue, Source)>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<SecretValue>>,
    {
        loop {
            if let Some(value) = self.live_entry(path) {
                return Ok((value, Source::CacheHit));
            }

            let flight = {
                let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
                match inflight.get(path) {
                    Some(rx) => Flight::Join(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(path.clone(), rx);
                        Flight::Lead(tx)
                    }
                }
            };

            match flight {
                Flight::Join(mut rx) => match await_flight(&mut rx).await {
                    Some(result) => return result.map(|value| (value, Source::Fetched)),
                    // The leader was cancelled before publishing; start over.
                    None => continue,
                },
                Flight::Lead(tx) => {
                    let slot = FlightGuard { cache: self, path };
                    let result = fetch().await;
                    if let Ok(value) = &result {
                        self.store(path, value.clone());
                    }
                    // Release the slot before waking waiters so a newly
                    // arriving caller sees the cache, not a finished flight.
                    drop(slot);
                    let _ = tx.send(Some(result.clone()));
                    return result.map(|value| (value, Source::Fetched));
                }
            }
        }
    }

    /// Drop the entry for `path`, if any.
    pub fn invalidate(&self, path: &SecretPath) {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .pop(path);
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.entries.lock().expect("cache lock poisoned").clear();
    }

    fn live_entry(&self, path: &SecretPath) -> Option<SecretValue> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(entry) = entries.get(path) {
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
            entries.pop(path);
        }
        None
    }

    fn store(&self, path: &SecretPath, value: SecretValue) {
        let ttl = value.lease_ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .put(path.clone(), entry);
    }
}

async fn await_flight(rx: &mut watch::Receiver<FlightResult>) -> FlightResult {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return Some(result);
        }
        if rx.changed().await.is_err() {
            // Sender gone; pick up a result published right before the drop.
            return rx.borrow().clone();
        }
    }
}

/// Removes the in-flight slot when the leading fetch finishes or is cancelled.
struct FlightGuard<'a> {
    cache: &'a LeaseCache,
    path: &'a SecretPath,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.cache
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn path(raw: &str) -> SecretPath {
        SecretPath::parse(raw).unwrap()
    }

    fn value(version: u64) -> SecretValue {
        let mut fields = BTreeMap::new();
        fields.insert("token".to_string(), format!("v{version}"));
        SecretValue::new(fields, version)
    }

    fn counting_fetch(
        calls: Arc<AtomicUsize>,
        result: SecretValue,
    ) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = Result<SecretValue>> + Send>> {
        move || {
            let calls = calls.clone();
            let result = result.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result)
            })
        }
    }

    #[tokio::test]
    async fn repeated_gets_within_the_lease_hit_the_cache() {
        let cache = LeaseCache::new(16, Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let db = path("secret/db");

        let (first, source) = cache
            .get_or_fetch(&db, counting_fetch(calls.clone(), value(1)))
            .await
            .unwrap();
        assert_eq!(source, Source::Fetched);

        let (second, source) = cache
            .get_or_fetch(&db, counting_fetch(calls.clone(), value(2)))
            .await
            .unwrap();
        assert_eq!(source, Source::CacheHit);
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let cache = LeaseCache::new(16, Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let db = path("secret/db");
        let leased = value(1).with_lease(Duration::from_millis(40));

        cache
            .get_or_fetch(&db, counting_fetch(calls.clone(), leased.clone()))
            .await
            .unwrap();
        sleep(Duration::from_millis(60)).await;

        let (_, source) = cache
            .get_or_fetch(&db, counting_fetch(calls.clone(), leased))
            .await
            .unwrap();
        assert_eq!(source, Source::Fetched);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn default_ttl_applies_to_static_values() {
        let cache = LeaseCache::new(16, Duration::from_millis(40));
        let calls = Arc::new(AtomicUsize::new(0));
        let db = path("secret/db");

        cache
            .get_or_fetch(&db, counting_fetch(calls.clone(), value(1)))
            .await
            .unwrap();
        let (_, source) = cache
            .get_or_fetch(&db, counting_fetch(calls.clone(), value(1)))
            .await
            .unwrap();
        assert_eq!(source, Source::CacheHit);

        sleep(Duration::from_millis(60)).await;
        cache
            .get_or_fetch(&db, counting_fetch(calls.clone(), value(1)))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_cold_gets_issue_one_backend_call() {
        let cache = Arc::new(LeaseCache::new(16, Duration::from_secs(300)));
        let calls = Arc::new(AtomicUsize::new(0));
        let db = path("secret/db");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                let fetch = move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // Hold the flight open long enough for every task
                        // to join it.
                        sleep(Duration::from_millis(50)).await;
                        Ok(value(1))
                    }
                };
                cache.get_or_fetch(&db, fetch).await
            }));
        }

        for handle in handles {
            let (fetched, _) = handle.await.unwrap().unwrap();
            assert_eq!(fetched.version, 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetches_do_not_poison_the_entry() {
        let cache = LeaseCache::new(16, Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let db = path("secret/db");

        let failing = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<SecretValue, _>(Error::Unavailable("backend down".into()))
                }
            }
        };
        let err = cache.get_or_fetch(&db, failing).await.unwrap_err();
        assert_eq!(err, Error::Unavailable("backend down".into()));

        let (recovered, source) = cache
            .get_or_fetch(&db, counting_fetch(calls.clone(), value(1)))
            .await
            .unwrap();
        assert_eq!(source, Source::Fetched);
        assert_eq!(recovered.version, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidation_forces_a_refetch() {
        let cache = LeaseCache::new(16, Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let db = path("secret/db");

        cache
            .get_or_fetch(&db, counting_fetch(calls.clone(), value(1)))
            .await
            .unwrap();
        cache.invalidate(&db);

        let (fresh, source) = cache
            .get_or_fetch(&db, counting_fetch(calls.clone(), value(2)))
            .await
            .unwrap();
        assert_eq!(source, Source::Fetched);
        assert_eq!(fresh.version, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
