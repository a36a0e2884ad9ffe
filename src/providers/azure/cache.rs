use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info};
use tokio::time::Instant;

use crate::error::{PipelensError, Result};

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

/// A successfully fetched value and when it goes stale.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
    expires_at: Instant,
}

struct Slot<V> {
    entry: Option<CacheEntry<V>>,
    in_flight: Option<SharedFetch<V>>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            entry: None,
            in_flight: None,
        }
    }
}

type Slots<K, V> = Arc<Mutex<HashMap<K, Slot<V>>>>;

/// In-memory TTL cache with single-flight fetching.
///
/// For any key, at most one fetch runs at a time: callers that miss while a
/// fetch is underway wait for that fetch and receive its result. The fetch
/// runs on its own task, so it completes and fills the cache even if every
/// caller waiting on it goes away. Failures are handed to all waiters and
/// never cached. Stale entries are dropped when they are next looked up.
pub struct ResponseCache<K, V> {
    ttl: Duration,
    slots: Slots<K, V>,
}

impl<K, V> ResponseCache<K, V>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the fresh cached value for `key`, or the result of `fetch`.
    ///
    /// `fetch` is only invoked when there is neither a fresh entry nor a fetch
    /// already underway for `key`.
    ///
    /// # Errors
    ///
    /// Returns the error produced by the fetch this call waited on.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let pending = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let slot = slots.entry(key.clone()).or_default();

            if let Some(entry) = &slot.entry {
                if now < entry.expires_at {
                    debug!(
                        "Cache hit for {key} (age {}s)",
                        now.duration_since(entry.fetched_at).as_secs()
                    );
                    return Ok(entry.value.clone());
                }
                debug!("Cache entry for {key} expired");
                slot.entry = None;
            }

            match &slot.in_flight {
                Some(pending) => {
                    debug!("Joining in-flight fetch for {key}");
                    pending.clone()
                }
                None => {
                    info!("Cache miss for {key}, fetching from Azure DevOps");
                    let task = tokio::spawn(Self::populate(
                        Arc::clone(&self.slots),
                        key.clone(),
                        self.ttl,
                        fetch(),
                    ));
                    let pending = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(PipelensError::Upstream(format!("Fetch task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    slot.in_flight = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    async fn populate<Fut>(slots: Slots<K, V>, key: K, ttl: Duration, fetch: Fut) -> Result<V>
    where
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let result = fetch.await;

        let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(value) => {
                let fetched_at = Instant::now();
                let slot = slots.entry(key).or_default();
                slot.in_flight = None;
                slot.entry = Some(CacheEntry {
                    value: value.clone(),
                    fetched_at,
                    expires_at: fetched_at + ttl,
                });
            }
            Err(e) => {
                debug!("Fetch for {key} failed, not caching: {e}");
                slots.remove(&key);
            }
        }

        result
    }
}
