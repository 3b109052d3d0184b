use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use uuid::Uuid;

use crate::crypto::aes::{self, Envelope, SecureKey};
use crate::error::{AppError, Result};
use crate::store::SharedStore;

/// Lifetime of a room key in the shared store.
pub const ROOM_KEY_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
/// Lifetime of a plaintext key in the process-local cache.
pub const KEY_CACHE_TTL: Duration = Duration::from_secs(60);
/// Most plaintext keys held in the process-local cache at once.
pub const KEY_CACHE_CAPACITY: u64 = 10_000;

/// A short-lived, bounded, process-local cache of unwrapped keys.
///
/// Entries are evicted once they age out or the cache is full. Keys rotated
/// by another process are picked up once the local entry expires.
#[derive(Clone)]
pub struct KeyCache {
    cache: Cache<String, SecureKey>,
}

impl KeyCache {
    /// Creates a new `KeyCache`.
    ///
    /// # Arguments
    ///
    /// * `ttl` - How long a key stays cached after insertion.
    /// * `max_entries` - The most keys held at once.
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Gets a key from the cache if it has not expired.
    pub async fn get(&self, name: &str) -> Option<SecureKey> {
        self.cache.get(name).await
    }

    /// Inserts a key into the cache.
    pub async fn insert(&self, name: &str, key: SecureKey) {
        self.cache.insert(name.to_string(), key).await;
    }

    #[cfg(test)]
    async fn len(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

/// Room and user keys, persisted sealed under the master key.
#[derive(Clone)]
pub struct Keyring {
    store: SharedStore,
    master_key: Arc<SecureKey>,
    cache: KeyCache,
}

fn room_key_name(project_id: &str) -> String {
    format!("chat:room_key:{}", project_id)
}

fn user_key_name(user_id: Uuid) -> String {
    format!("chat:user_key:{}", user_id)
}

fn at_rest_aad(name: &str) -> Vec<u8> {
    format!("key-at-rest:v1|{}", name).into_bytes()
}

impl Keyring {
    pub fn new(store: SharedStore, master_key: Arc<SecureKey>, cache: KeyCache) -> Self {
        Self {
            store,
            master_key,
            cache,
        }
    }

    /// Gets the current key for a chat room, creating one on first use.
    pub async fn room_key(&self, project_id: &str) -> Result<SecureKey> {
        self.get_or_create(&room_key_name(project_id), Some(ROOM_KEY_TTL))
            .await
    }

    /// Gets the wrapping key for a recipient, creating one on first use.
    pub async fn user_key(&self, user_id: Uuid) -> Result<SecureKey> {
        self.get_or_create(&user_key_name(user_id), None).await
    }

    /// Replaces a room's key. Messages sealed earlier carry their own wrapped
    /// copy of the old key and stay readable; nothing is re-encrypted.
    pub async fn rotate_room_key(&self, project_id: &str) -> Result<()> {
        let name = room_key_name(project_id);
        let key = aes::generate_key();
        let sealed = self.seal_at_rest(&name, &key)?;

        self.store.set(&name, &sealed, Some(ROOM_KEY_TTL)).await?;
        self.cache.insert(&name, key).await;

        tracing::info!("🔄 Room key rotated for project {}", project_id);
        Ok(())
    }

    async fn get_or_create(&self, name: &str, ttl: Option<Duration>) -> Result<SecureKey> {
        if let Some(key) = self.cache.get(name).await {
            tracing::debug!("✅ {} retrieved from cache", name);
            return Ok(key);
        }

        if let Some(key) = self.load(name).await? {
            self.cache.insert(name, key.clone()).await;
            tracing::debug!("✅ {} retrieved from store and cached", name);
            return Ok(key);
        }

        let key = aes::generate_key();
        let sealed = self.seal_at_rest(name, &key)?;

        if self.store.set_nx(name, &sealed, ttl).await? {
            self.cache.insert(name, key.clone()).await;
            tracing::info!("✅ {} created", name);
            return Ok(key);
        }

        // Another process created it between our read and write.
        let key = self.load(name).await?.ok_or_else(|| {
            tracing::error!("❌ {} vanished right after a concurrent create", name);
            AppError::EncryptionFailure
        })?;
        self.cache.insert(name, key.clone()).await;
        Ok(key)
    }

    async fn load(&self, name: &str) -> Result<Option<SecureKey>> {
        let Some(sealed) = self.store.get(name).await? else {
            return Ok(None);
        };

        let envelope = Envelope::from_json(&sealed)?;
        let bytes = aes::open(&self.master_key, &envelope, &at_rest_aad(name)).map_err(|e| {
            tracing::error!("❌ {} failed to unwrap under the master key", name);
            e
        })?;
        SecureKey::from_slice(&bytes).map(Some)
    }

    fn seal_at_rest(&self, name: &str, key: &SecureKey) -> Result<String> {
        aes::seal(&self.master_key, key.as_bytes(), &at_rest_aad(name))?.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvStore, MemoryStore};

    fn keyring(store: &MemoryStore, master: &Arc<SecureKey>) -> Keyring {
        Keyring::new(
            Arc::new(store.clone()),
            master.clone(),
            KeyCache::new(KEY_CACHE_TTL, KEY_CACHE_CAPACITY),
        )
    }

    #[tokio::test]
    async fn room_key_is_stable_and_shared_between_processes() {
        let store = MemoryStore::new();
        let master = Arc::new(aes::generate_key());
        let a = keyring(&store, &master);
        let b = keyring(&store, &master);

        let first = a.room_key("p1").await.unwrap();
        assert_eq!(a.room_key("p1").await.unwrap().as_bytes(), first.as_bytes());
        assert_eq!(b.room_key("p1").await.unwrap().as_bytes(), first.as_bytes());
        assert_ne!(a.room_key("p2").await.unwrap().as_bytes(), first.as_bytes());
    }

    #[tokio::test]
    async fn store_never_holds_plaintext_keys() {
        let store = MemoryStore::new();
        let master = Arc::new(aes::generate_key());
        let ring = keyring(&store, &master);

        let key = ring.room_key("p1").await.unwrap();
        let stored = store.get("chat:room_key:p1").await.unwrap().unwrap();
        assert!(!stored.contains(&hex::encode(key.as_bytes())));
        assert!(Envelope::from_json(&stored).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn room_keys_carry_a_seven_day_ttl() {
        let store = MemoryStore::new();
        let master = Arc::new(aes::generate_key());
        keyring(&store, &master).room_key("p1").await.unwrap();

        assert_eq!(store.ttl("chat:room_key:p1").await, Some(ROOM_KEY_TTL));
    }

    #[tokio::test]
    async fn rotation_replaces_the_key() {
        let store = MemoryStore::new();
        let master = Arc::new(aes::generate_key());
        let ring = keyring(&store, &master);

        let before = ring.room_key("p1").await.unwrap();
        ring.rotate_room_key("p1").await.unwrap();
        let after = ring.room_key("p1").await.unwrap();
        assert_ne!(before.as_bytes(), after.as_bytes());
    }

    #[tokio::test]
    async fn key_cache_is_bounded() {
        let cache = KeyCache::new(KEY_CACHE_TTL, 50);
        for i in 0..500 {
            cache.insert(&format!("room:{}", i), aes::generate_key()).await;
        }
        assert!(cache.len().await <= 50);
    }

    #[tokio::test]
    async fn key_cache_drops_expired_keys() {
        let cache = KeyCache::new(Duration::from_millis(50), KEY_CACHE_CAPACITY);
        for i in 0..100 {
            cache.insert(&format!("user:{}", i), aes::generate_key()).await;
        }
        assert!(cache.get("user:7").await.is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(cache.get("user:7").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn user_keys_are_unique_per_user() {
        let store = MemoryStore::new();
        let master = Arc::new(aes::generate_key());
        let ring = keyring(&store, &master);

        let alice = ring.user_key(Uuid::from_u128(1)).await.unwrap();
        let bob = ring.user_key(Uuid::from_u128(2)).await.unwrap();
        assert_ne!(alice.as_bytes(), bob.as_bytes());
        assert_eq!(store.ttl(&user_key_name(Uuid::from_u128(1))).await, None);
    }

    #[tokio::test]
    async fn wrong_master_key_cannot_unwrap() {
        let store = MemoryStore::new();
        keyring(&store, &Arc::new(aes::generate_key()))
            .room_key("p1")
            .await
            .unwrap();

        let other = keyring(&store, &Arc::new(aes::generate_key()));
        assert!(matches!(
            other.room_key("p1").await,
            Err(AppError::EncryptionFailure)
        ));
    }
}
