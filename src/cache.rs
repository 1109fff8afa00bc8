//! Write-through last-value state cache with coalesced disk flushes.
//!
//! Every `update_state` writes through here and marks the cache dirty; a
//! single debounce task flushes to `device_state_cache.json` once writes
//! go quiet for the debounce window. A new write cancels and reschedules
//! the pending flush. Shutdown forces a final flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::ieee::Ieee;
use crate::storage::DataDir;

const CACHE_FILE: &str = "device_state_cache.json";
pub const DEBOUNCE: Duration = Duration::from_secs(2);

struct CacheInner {
    data: DataDir,
    states: DashMap<Ieee, Map<String, Value>>,
    dirty: AtomicBool,
    debounce: Duration,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    flushes: AtomicU64,
}

#[derive(Clone)]
pub struct StateCache {
    inner: Arc<CacheInner>,
}

impl StateCache {
    pub fn load(data: DataDir) -> Self {
        Self::load_with_debounce(data, DEBOUNCE)
    }

    pub fn load_with_debounce(data: DataDir, debounce: Duration) -> Self {
        let persisted: HashMap<String, Map<String, Value>> = data.load_json(CACHE_FILE);
        let states = DashMap::new();
        for (raw, state) in persisted {
            if let Some(ieee) = Ieee::parse(&raw) {
                states.insert(ieee, state);
            }
        }
        if !states.is_empty() {
            tracing::info!("Restored cached state for {} devices", states.len());
        }
        Self {
            inner: Arc::new(CacheInner {
                data,
                states,
                dirty: AtomicBool::new(false),
                debounce,
                flush_task: Mutex::new(None),
                flushes: AtomicU64::new(0),
            }),
        }
    }

    pub fn get(&self, ieee: &Ieee) -> Option<Map<String, Value>> {
        self.inner.states.get(ieee).map(|entry| entry.clone())
    }

    /// Write-through update with a rescheduled debounced flush.
    pub fn update(&self, ieee: &Ieee, state: Map<String, Value>) {
        self.inner.states.insert(ieee.clone(), state);
        self.inner.dirty.store(true, Ordering::SeqCst);
        self.schedule_flush();
    }

    pub fn purge(&self, ieee: &Ieee) {
        if self.inner.states.remove(ieee).is_some() {
            self.inner.dirty.store(true, Ordering::SeqCst);
            self.schedule_flush();
        }
    }

    fn schedule_flush(&self) {
        let mut guard = self.inner.flush_task.lock().expect("cache lock");
        if let Some(task) = guard.take() {
            task.abort();
        }
        let inner = Arc::clone(&self.inner);
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            flush(&inner);
        }));
    }

    /// Synchronous flush; no-op when clean.
    pub fn flush_now(&self) {
        flush(&self.inner);
    }

    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::SeqCst)
    }

    /// Cancel the pending debounce and force a final flush.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.flush_task.lock().expect("cache lock").take() {
            task.abort();
        }
        flush(&self.inner);
    }

    pub fn len(&self) -> usize {
        self.inner.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.states.is_empty()
    }
}

fn flush(inner: &CacheInner) {
    if !inner.dirty.swap(false, Ordering::SeqCst) {
        return;
    }
    let snapshot: HashMap<String, Map<String, Value>> = inner
        .states
        .iter()
        .map(|entry| (entry.key().to_string(), entry.value().clone()))
        .collect();
    inner.data.save_json(CACHE_FILE, &snapshot);
    inner.flushes.fetch_add(1, Ordering::SeqCst);
    tracing::debug!("State cache saved to disk ({} devices)", snapshot.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ieee() -> Ieee {
        Ieee::parse("00:11:22:33:44:55:66:77").unwrap()
    }

    fn state(value: i64) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("counter".into(), json!(value));
        map
    }

    #[tokio::test]
    async fn burst_of_writes_flushes_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache =
            StateCache::load_with_debounce(DataDir::new(dir.path()), Duration::from_millis(30));

        for i in 0..10 {
            cache.update(&ieee(), state(i));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(cache.flush_count(), 0, "debounce should still be pending");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.flush_count(), 1);

        // The flushed file holds the final write.
        let reloaded = StateCache::load(DataDir::new(dir.path()));
        assert_eq!(reloaded.get(&ieee()).unwrap()["counter"], json!(9));
    }

    #[tokio::test]
    async fn shutdown_forces_final_flush() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::load_with_debounce(DataDir::new(dir.path()), Duration::from_secs(60));
        cache.update(&ieee(), state(1));
        cache.shutdown();
        assert_eq!(cache.flush_count(), 1);

        let reloaded = StateCache::load(DataDir::new(dir.path()));
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_device() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::load_with_debounce(DataDir::new(dir.path()), Duration::from_millis(5));
        cache.update(&ieee(), state(1));
        cache.purge(&ieee());
        cache.shutdown();

        let reloaded = StateCache::load(DataDir::new(dir.path()));
        assert!(reloaded.get(&ieee()).is_none());
    }

    #[tokio::test]
    async fn flush_without_writes_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::load_with_debounce(DataDir::new(dir.path()), DEBOUNCE);
        cache.flush_now();
        assert_eq!(cache.flush_count(), 0);
    }
}
