use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{RwLock, RwLockWriteGuard};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// How often the background task physically removes expired keys.
    /// Reads never return expired keys regardless of this interval.
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Default)]
struct StoreData {
    values: BTreeMap<String, String>,
    expirations: HashMap<String, Instant>,
}

impl StoreData {
    fn is_expired(&self, key: &str, now: Instant) -> bool {
        self.expirations
            .get(key)
            .is_some_and(|expires_at| *expires_at <= now)
    }

    fn get(&self, key: &str, now: Instant) -> Option<&String> {
        if self.is_expired(key, now) {
            return None;
        }
        self.values.get(key)
    }

    fn set(&mut self, key: String, value: String, ttl: Duration, now: Instant) {
        // zero, or too far out to represent, means no expiry
        match now.checked_add(ttl).filter(|_| !ttl.is_zero()) {
            Some(expires_at) => self.expirations.insert(key.clone(), expires_at),
            None => self.expirations.remove(&key),
        };
        self.values.insert(key, value);
    }

    fn delete(&mut self, key: &str) {
        self.values.remove(key);
        self.expirations.remove(key);
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired.iter() {
            self.delete(key);
        }
        expired.len()
    }

    fn live_values(&self, now: Instant) -> BTreeMap<String, String> {
        self.values
            .iter()
            .filter(|(key, _)| !self.is_expired(key, now))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Thread-safe in-memory key/value map with optional per-key expiry.
///
/// Reads share a lock; mutations, restores and the expiry sweep take it
/// exclusively. A background task sweeps expired keys every
/// [`StoreConfig::sweep_interval`] until the store is dropped.
#[derive(Debug)]
pub struct Store {
    data: Arc<RwLock<StoreData>>,
    _sweeper: DropGuard,
}

impl Store {
    /// # Panics
    ///
    /// Must be called from within a tokio runtime, which hosts the sweep task.
    pub fn new(config: StoreConfig) -> Self {
        let data = Arc::new(RwLock::new(StoreData::default()));
        let cancel = CancellationToken::new();

        tokio::spawn(sweep_loop(
            Arc::downgrade(&data),
            config.sweep_interval,
            cancel.clone(),
        ));

        Self {
            data,
            _sweeper: cancel.drop_guard(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key, Instant::now()).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        self.write().set(key, value, ttl);
    }

    pub fn delete(&self, key: &str) {
        self.write().delete(key);
    }

    /// Hold the write lock for a batch of mutations. Readers observe either
    /// none or all of the changes made through the returned writer.
    pub fn write(&self) -> StoreWriter<'_> {
        StoreWriter {
            data: self.data.write(),
            now: Instant::now(),
        }
    }

    /// Sorted JSON object of every live key. Keys that have expired but were
    /// not swept yet are left out.
    pub fn serialize_data(&self) -> serde_json::Result<Vec<u8>> {
        let values = self.data.read().live_values(Instant::now());
        serde_json::to_vec(&values)
    }

    /// Swap in a whole new value map. All keys become permanent.
    pub fn replace_data(&self, values: impl IntoIterator<Item = (String, String)>) {
        let values: BTreeMap<String, String> = values.into_iter().collect();
        let mut data = self.data.write();
        data.values = values;
        data.expirations.clear();
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let data = self.data.read();
        data.values
            .keys()
            .filter(|key| !data.is_expired(key, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to the store for the duration of one transaction.
pub struct StoreWriter<'a> {
    data: RwLockWriteGuard<'a, StoreData>,
    now: Instant,
}

impl StoreWriter<'_> {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        self.data.set(key.into(), value.into(), ttl, self.now);
    }

    pub fn delete(&mut self, key: &str) {
        self.data.delete(key);
    }
}

async fn sweep_loop(data: Weak<RwLock<StoreData>>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(data) = data.upgrade() else {
            break;
        };
        let swept = data.write().sweep(Instant::now());
        if swept > 0 {
            tracing::debug!(swept, "removed expired keys");
        }
    }

    tracing::trace!("store sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::new(StoreConfig {
            sweep_interval: Duration::from_secs(1),
        })
    }

    fn physical_len(store: &Store) -> usize {
        store.data.read().values.len()
    }

    #[tokio::test]
    async fn permanent_keys_stay_until_overwritten_or_deleted() {
        let store = store();
        store.set("k", "v1", Duration::ZERO);
        assert_eq!(store.get("k").as_deref(), Some("v1"));

        store.set("k", "v2", Duration::ZERO);
        assert_eq!(store.get("k").as_deref(), Some("v2"));

        store.delete("k");
        assert_eq!(store.get("k"), None);
    }

    #[tokio::test]
    async fn deleting_an_absent_key_is_a_noop() {
        let store = store();
        store.delete("missing");
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_lazily_on_read() {
        let store = Store::new(StoreConfig::default());
        store.set("k", "v", Duration::from_secs(5));

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert_eq!(store.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.get("k"), None);
        // still physically present: the sweep interval is a minute
        assert_eq!(physical_len(&store), 1);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_clears_a_previous_expiry() {
        let store = store();
        store.set("k", "v", Duration::from_secs(1));
        store.set("k", "v", Duration::ZERO);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.get("k").as_deref(), Some("v"));
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_ttl_never_expires() {
        let store = store();
        store.set("k", "v", Duration::from_secs(1));
        store.set("k", "v", Duration::MAX);
        store.write().set("w", "v", Duration::MAX);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(store.get("k").as_deref(), Some("v"));
        assert_eq!(store.get("w").as_deref(), Some("v"));
        assert_eq!(store.data.read().expirations.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_removes_expired_keys() {
        let store = store();
        store.set("short", "v", Duration::from_millis(100));
        store.set("long", "v", Duration::from_secs(30));
        store.set("forever", "v", Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(physical_len(&store), 2);
        assert_eq!(store.get("long").as_deref(), Some("v"));
        assert_eq!(store.get("forever").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn sweep_task_does_not_keep_the_store_alive() {
        let store = store();
        let weak = Arc::downgrade(&store.data);
        drop(store);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn serialized_data_is_sorted_and_skips_expired_keys() {
        let store = store();
        store.set("b", "2", Duration::ZERO);
        store.set("a", "1", Duration::ZERO);
        store.set("gone", "x", Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(10)).await;

        let bytes = store.serialize_data().unwrap();
        assert_eq!(bytes, br#"{"a":"1","b":"2"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn replace_data_drops_old_keys_and_expirations() {
        let store = store();
        store.set("old", "x", Duration::ZERO);
        store.set("k", "ttl", Duration::from_secs(1));

        store.replace_data([("k".to_string(), "restored".to_string())]);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(store.get("old"), None);
        assert_eq!(store.get("k").as_deref(), Some("restored"));
    }

    #[tokio::test]
    async fn same_commands_give_same_contents() {
        let a = store();
        let b = store();

        for s in [&a, &b] {
            let mut w = s.write();
            w.set("x", "1", Duration::ZERO);
            w.set("y", "2", Duration::ZERO);
            w.delete("x");
            w.set("z", "3", Duration::ZERO);
            w.set("y", "4", Duration::ZERO);
        }

        assert_eq!(a.serialize_data().unwrap(), b.serialize_data().unwrap());
    }
}
