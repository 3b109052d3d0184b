use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{KvStore, StoreError, StoreResult, WindowCount};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// An in-process store with the same TTL semantics as Redis.
///
/// Time is read from `tokio::time::Instant`, so tests running with paused
/// time can advance through TTLs and rate-limit windows deterministically.
/// Only suitable for a single process.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every command fails with `Unavailable` until
    /// switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    /// Remaining TTL of a live key, for assertions.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

fn live_entry<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key, now) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::Backend(format!("WRONGTYPE {key}"))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn set_xx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key, now) {
            Some(entry) => {
                entry.value = Value::Str(value.to_string());
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(entries.remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sadd(&self, key: &str, members: &[String]) -> StoreResult<()> {
        self.check_online()?;
        if members.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key, now) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                set.extend(members.iter().cloned());
                Ok(())
            }
            Some(_) => Err(StoreError::Backend(format!("WRONGTYPE {key}"))),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(members.iter().cloned().collect()),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let (removed, now_empty) = match live_entry(&mut entries, key, now) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                let removed = set.remove(member);
                (removed, set.is_empty())
            }
            Some(_) => return Err(StoreError::Backend(format!("WRONGTYPE {key}"))),
            None => (false, false),
        };
        // Redis drops a set once its last member is gone.
        if now_empty {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key, now) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::Backend(format!("WRONGTYPE {key}"))),
            None => Ok(Vec::new()),
        }
    }

    async fn incr_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Str("0".to_string()),
            expires_at: None,
        });

        let current = match &entry.value {
            Value::Str(s) => s
                .parse::<u64>()
                .map_err(|_| StoreError::Corrupt(key.to_string()))?,
            Value::Set(_) => return Err(StoreError::Backend(format!("WRONGTYPE {key}"))),
        };
        let count = current + 1;
        entry.value = Value::Str(count.to_string());

        let expires_at = *entry.expires_at.get_or_insert(now + window);

        Ok(WindowCount {
            count,
            resets_in: expires_at.saturating_duration_since(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_only_writes_once() {
        let store = MemoryStore::new();
        assert!(store.set_nx("k", "first", None).await.unwrap());
        assert!(!store.set_nx("k", "second", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn set_xx_never_recreates_a_missing_key() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        assert!(!store.set_xx("k", "v", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "old", None).await.unwrap();
        assert!(store.set_xx("k", "new", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
        assert!(store.ttl("k").await.is_some());
    }

    #[tokio::test]
    async fn srem_reports_presence() {
        let store = MemoryStore::new();
        store
            .sadd("s", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        assert!(store.srem("s", "a").await.unwrap());
        assert!(!store.srem("s", "a").await.unwrap());
        assert_eq!(store.smembers("s").await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn incr_window_sets_expiry_on_first_hit_only() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        let first = store.incr_window("c", window).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.resets_in, window);

        tokio::time::advance(Duration::from_secs(20)).await;
        let second = store.incr_window("c", window).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.resets_in, Duration::from_secs(40));

        tokio::time::advance(Duration::from_secs(41)).await;
        let fresh = store.incr_window("c", window).await.unwrap();
        assert_eq!(fresh.count, 1);
    }

    #[tokio::test]
    async fn offline_store_fails_every_command() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_offline(false);
        assert!(store.get("k").await.is_ok());
    }
}
