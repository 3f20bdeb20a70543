//! Per-client mutex map with an idle-eviction sweeper (component D).
//!
//! The authentication pipeline serializes everything after the client
//! lookup on a per-client basis: step 4 of §4.H acquires the lock here and
//! holds it through persistence. Because the lock is held across `.await`
//! points it must be `tokio::sync::Mutex`, not `std::sync::Mutex`.

use dashmap::DashMap;
use latchkey_types::MUTEX_MAX_IDLE_SECS;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

struct ClientMutexEntry {
    mutex: Arc<Mutex<()>>,
    last_used: AtomicU64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Owns the per-client mutex map. `lock` is racy-safe: concurrent first
/// acquisitions for the same `client_id` always return guards over the
/// same underlying mutex.
pub struct ClientLockManager {
    entries: DashMap<String, Arc<ClientMutexEntry>>,
}

impl ClientLockManager {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Blocks until the named client's lock is held. `last_used` is
    /// refreshed both when the entry is looked up and again once the lock
    /// is actually acquired, so a lock held across a long pipeline run
    /// never looks idle to the sweeper.
    pub async fn lock(&self, client_id: &str) -> OwnedMutexGuard<()> {
        let entry = self
            .entries
            .entry(client_id.to_string())
            .or_insert_with(|| {
                Arc::new(ClientMutexEntry {
                    mutex: Arc::new(Mutex::new(())),
                    last_used: AtomicU64::new(now_secs()),
                })
            })
            .clone();
        entry.last_used.store(now_secs(), Ordering::Relaxed);

        let mutex = entry.mutex.clone();
        let guard = mutex.lock_owned().await;
        entry.last_used.store(now_secs(), Ordering::Relaxed);
        guard
    }

    /// Removes entries idle longer than `MUTEX_MAX_IDLE_SECS`.
    fn evict_stale(&self) {
        let now = now_secs();
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.last_used.load(Ordering::Relaxed)) <= MUTEX_MAX_IDLE_SECS);
    }

    /// Starts the idle-eviction sweeper. Runs until `shutdown` fires.
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        manager.evict_stale();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("client lock sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn set_last_used_for_test(&self, client_id: &str, secs_ago: u64) {
        if let Some(entry) = self.entries.get(client_id) {
            entry
                .last_used
                .store(now_secs().saturating_sub(secs_ago), Ordering::Relaxed);
        }
    }
}

impl Default for ClientLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn concurrent_first_acquisitions_share_one_mutex() {
        let manager = Arc::new(ClientLockManager::new());
        let counter = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = manager.lock("client-a").await;
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(manager.entry_count(), 1);
    }

    #[tokio::test]
    async fn distinct_clients_do_not_contend() {
        let manager = Arc::new(ClientLockManager::new());
        let _guard_a = manager.lock("client-a").await;
        // Must not deadlock: client-b's lock is independent.
        let _guard_b = tokio::time::timeout(Duration::from_millis(100), manager.lock("client-b"))
            .await
            .expect("locking a different client must not block");
    }

    #[tokio::test]
    async fn sweeper_evicts_only_idle_entries() {
        let manager = Arc::new(ClientLockManager::new());
        {
            let _guard = manager.lock("stale").await;
        }
        {
            let _guard = manager.lock("fresh").await;
        }
        manager.set_last_used_for_test("stale", MUTEX_MAX_IDLE_SECS + 60);

        manager.evict_stale();

        assert_eq!(manager.entry_count(), 1);
        assert!(manager.entries.contains_key("fresh"));
    }

    #[tokio::test]
    async fn sweeper_task_stops_on_shutdown_signal() {
        let manager = Arc::new(ClientLockManager::new());
        let (tx, rx) = watch::channel(false);
        let handle = manager.start_sweeper(Duration::from_millis(10), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("sweeper must stop promptly after shutdown")
            .unwrap();
    }
}
