//! Generic expiring key/value store shared by the CSRF guard and the rate limiter.
//!
//! # Eviction
//!
//! Entries are evicted two ways:
//!
//! - **Lazily**: a [`ExpiringStore::get`] that finds an expired entry removes it
//! - **Periodically**: a background sweeper ([`spawn_sweeper`]) calls
//!   [`ExpiringStore::sweep`] on a fixed period
//!
//! An entry is live while `now < expires_at` and expired from `expires_at` on.
//!
//! # Locking
//!
//! The whole map sits behind one reader/writer lock. Every critical section is
//! a constant-time map operation with no I/O and no `.await`, so a synchronous
//! `parking_lot` lock is used rather than an async one.
//!
//! # Time
//!
//! All timestamps are [`tokio::time::Instant`], which lets tests pause the
//! runtime clock and step across expiry boundaries with `tokio::time::advance`.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::{Instant, interval};
use tracing::{debug, trace};

use crate::state::BackgroundTasks;

/// Expiry used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + ttl`, saturating to [`FAR_FUTURE`] instead of overflowing.
#[inline]
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Key/value map whose entries expire after a per-entry time-to-live.
#[derive(Debug)]
pub struct ExpiringStore<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> Default for ExpiringStore<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> ExpiringStore<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `key`, expiring `ttl` from now.
    ///
    /// An existing entry for the key is replaced.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let expires_at = expiry(Instant::now(), ttl);
        self.entries
            .write()
            .insert(key, Entry { value, expires_at });
    }

    /// Look up a live entry.
    ///
    /// Returns `None` when the key is absent or expired; an expired entry is
    /// removed before returning.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();

        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        // Re-check under the write lock: another task may have refreshed the
        // entry between the two lock acquisitions.
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Record a hit on `key` in a single write-locked step.
    ///
    /// If the key is absent or expired, a fresh entry `init()` expiring `ttl`
    /// from now replaces it. Otherwise `update` mutates the live value in
    /// place and its expiry is left unchanged. Returns a copy of the resulting
    /// value together with its expiry.
    pub fn hit(
        &self,
        key: K,
        ttl: Duration,
        init: impl FnOnce() -> V,
        update: impl FnOnce(&mut V),
    ) -> (V, Instant) {
        let now = Instant::now();
        let mut entries = self.entries.write();

        let entry = match entries.entry(key) {
            MapEntry::Vacant(slot) => slot.insert(Entry {
                value: init(),
                expires_at: expiry(now, ttl),
            }),
            MapEntry::Occupied(slot) => {
                let entry = slot.into_mut();
                if entry.is_expired(now) {
                    *entry = Entry {
                        value: init(),
                        expires_at: expiry(now, ttl),
                    };
                } else {
                    update(&mut entry.value);
                }
                entry
            }
        };

        (entry.value.clone(), entry.expires_at)
    }

    /// Remove every entry expired at `now`, returning how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Spawn a periodic sweep of `store` on `tasks`.
///
/// The first sweep happens one `period` after spawning. The task stops when
/// `tasks` is shut down.
pub fn spawn_sweeper<K, V>(
    store: Arc<ExpiringStore<K, V>>,
    period: Duration,
    name: &'static str,
    tasks: &BackgroundTasks,
) where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let cancel = tasks.cancellation_token();

    tasks.spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await; // Skip the first immediate tick

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(store = name, "Sweeper received cancellation signal");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = store.sweep(Instant::now());
                    if removed > 0 {
                        debug!(store = name, removed, remaining = store.len(), "Swept expired entries");
                    } else {
                        trace!(store = name, "Sweep found nothing to remove");
                    }
                }
            }
        }

        debug!(store = name, "Sweeper shutting down");
    });
}
