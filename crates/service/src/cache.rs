//! Connection caching.
//!
//! Both the secure-connection cache and the application message cache share
//! one behavior: a lookup either yields a live cached value, joins a dial
//! already in flight, or becomes the single dialer for its key.

use crate::error::{Error, Result};

use std::{future::Future, hash::Hash};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;

enum Slot<V> {
    Ready(V),
    Pending(Vec<oneshot::Sender<Result<V>>>),
}

pub struct ConnectionCache<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> Default for ConnectionCache<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> ConnectionCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Return the cached value for `key`, dialing at most once per key no
    /// matter how many callers miss concurrently.
    ///
    /// `alive` decides whether a cached value is still usable; stale entries
    /// are replaced by a fresh dial.
    pub async fn connect_cached<F, Fut>(
        &self,
        key: K,
        alive: impl Fn(&V) -> bool,
        dial: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let waiter = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&key) {
                Some(Slot::Ready(value)) if alive(value) => return Ok(value.clone()),
                Some(Slot::Pending(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                _ => {
                    slots.insert(key.clone(), Slot::Pending(Vec::new()));
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return rx.await.map_err(|_| Error::ConnectionLost)?;
        }

        let result = dial().await;
        let waiters = {
            let mut slots = self.slots.lock();
            let waiters = match slots.remove(&key) {
                Some(Slot::Pending(waiters)) => waiters,
                _ => Vec::new(),
            };

            if let Ok(value) = &result {
                slots.insert(key, Slot::Ready(value.clone()));
            }

            waiters
        };

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }

        result
    }

    /// Insert a value that arrived without a local dial, e.g. a connection
    /// our peer initiated and secured toward us.
    pub fn cache_unrequested(&self, key: K, value: V) {
        self.slots.lock().insert(key, Slot::Ready(value));
    }

    /// Empty the cache, handing back every ready value so the caller can
    /// close it. Dials still in flight are abandoned; their waiters fail.
    pub fn drain(&self) -> Vec<V> {
        let mut ready = Vec::new();
        for (_, slot) in self.slots.lock().drain() {
            if let Slot::Ready(value) = slot {
                ready.push(value);
            }
        }

        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[tokio::test]
    async fn concurrent_misses_share_one_dial() {
        let cache = Arc::new(ConnectionCache::<&'static str, u32>::default());
        let dials = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let dials = dials.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .connect_cached("key", |_| true, || async {
                        dials.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(7u32)
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 7);
        }

        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_entries_are_redialed() {
        let cache = ConnectionCache::<&'static str, u32>::default();

        let first = cache
            .connect_cached("key", |_| true, || async { Ok(1u32) })
            .await
            .unwrap();
        assert_eq!(first, 1);

        // A liveness check that rejects everything forces a new dial.
        let second = cache
            .connect_cached("key", |_| false, || async { Ok(2u32) })
            .await
            .unwrap();
        assert_eq!(second, 2);

        let third = cache
            .connect_cached("key", |_| true, || async { unreachable!() })
            .await
            .unwrap();
        assert_eq!(third, 2);
    }

    #[tokio::test]
    async fn failed_dials_are_not_cached() {
        let cache = ConnectionCache::<&'static str, u32>::default();

        let failed: Result<u32> = cache
            .connect_cached("key", |_| true, || async {
                Err(Error::Connection("nope".to_string()))
            })
            .await;
        assert!(failed.is_err());

        let ok = cache
            .connect_cached("key", |_| true, || async { Ok(3u32) })
            .await
            .unwrap();
        assert_eq!(ok, 3);
    }
}
