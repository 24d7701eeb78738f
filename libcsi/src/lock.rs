//! Per-key mutual exclusion.
//!
//! CSI calls for the same volume or the same path must not interleave, while
//! calls for unrelated volumes run in parallel.  [`KeyedLocks`] hands out one
//! async mutex per key; a caller needing several keys takes them in sorted
//! order so two callers can never deadlock on each other.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A lazily populated set of named async mutexes.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Holds every lock taken by one [`KeyedLocks::lock`] call.
#[derive(Debug)]
pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the locks for all `keys`, waiting as long as needed.
    pub async fn lock<I, K>(&self, keys: I) -> KeyedGuard<'_>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let mutex = Arc::clone(self.locks.entry(key.clone()).or_default().value());
            guards.push(mutex.lock_owned().await);
        }
        KeyedGuard {
            owner: self,
            keys,
            guards,
        }
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        for key in &self.keys {
            // Only drop entries nobody else holds or waits on.
            self.owner
                .locks
                .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(["volume/v1"]).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn overlapping_key_sets_do_not_deadlock() {
        let locks = Arc::new(KeyedLocks::new());
        let a = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                for _ in 0..50 {
                    let _g = locks.lock(["a", "b"]).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        let b = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                for _ in 0..50 {
                    let _g = locks.lock(["b", "a"]).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            a.await.unwrap();
            b.await.unwrap();
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(["path/a"]).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock(["path/b"])).await;
        assert!(b.is_ok());
    }
}
