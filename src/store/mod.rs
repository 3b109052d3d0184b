//! Shared TTL-capable key-value store.
//!
//! Every component receives an `Arc<dyn KvStore>` at construction time. In
//! production this is [`RedisStore`]; tests and single-node development use
//! [`MemoryStore`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Errors raised by a store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The command did not complete within the configured deadline.
    #[error("store command timed out")]
    Timeout,

    /// The backend refused or lost the connection.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with an error.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored value could not be decoded.
    #[error("corrupt store value at {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The result of one atomic fixed-window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after the increment.
    pub count: u64,
    /// Time left until the window's counter expires.
    pub resets_in: Duration,
}

/// A handle to the store shared by every server process.
pub type SharedStore = Arc<dyn KvStore>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes `value`, replacing any previous value. `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Writes `value` only if `key` is absent. Returns whether it was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool>;

    /// Overwrites `value` only if `key` still exists, giving it a fresh TTL.
    /// Returns whether it was written.
    async fn set_xx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Returns whether a key was removed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Re-applies a TTL. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn sadd(&self, key: &str, members: &[String]) -> StoreResult<()>;

    /// Removes one set member atomically. Returns whether it was present.
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Increments a counter and, when the increment created it, sets its
    /// expiry to `window`. One atomic round trip.
    async fn incr_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount>;
}
