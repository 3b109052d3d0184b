use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Checked;
use crate::store::SharedStore;

/// Action classes with their own limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Auth,
    Chat,
    Admin,
    Mint,
    General,
}

impl RateLimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAction::Auth => "auth",
            RateLimitAction::Chat => "chat",
            RateLimitAction::Admin => "admin",
            RateLimitAction::Mint => "mint",
            RateLimitAction::General => "general",
        }
    }
}

impl fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed window and the number of requests it admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max_requests: u32,
}

impl RateLimitPolicy {
    pub const fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
        }
    }
}

/// Parses `window_ms:max`, e.g. `900000:5`.
impl FromStr for RateLimitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (window, max) = s
            .split_once(':')
            .ok_or_else(|| format!("expected window_ms:max, got {:?}", s))?;
        let window_ms: u64 = window
            .trim()
            .parse()
            .map_err(|e| format!("invalid window {:?}: {}", window, e))?;
        let max_requests: u32 = max
            .trim()
            .parse()
            .map_err(|e| format!("invalid max {:?}: {}", max, e))?;

        if window_ms == 0 || max_requests == 0 {
            return Err("window and max must both be positive".to_string());
        }
        Ok(Self::new(Duration::from_millis(window_ms), max_requests))
    }
}

/// Limits per action class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicies {
    pub auth: RateLimitPolicy,
    pub chat: RateLimitPolicy,
    pub admin: RateLimitPolicy,
    pub mint: RateLimitPolicy,
    pub general: RateLimitPolicy,
}

impl Default for RateLimitPolicies {
    fn default() -> Self {
        Self {
            auth: RateLimitPolicy::new(Duration::from_secs(15 * 60), 5),
            chat: RateLimitPolicy::new(Duration::from_secs(60), 100),
            admin: RateLimitPolicy::new(Duration::from_secs(60), 30),
            mint: RateLimitPolicy::new(Duration::from_secs(3600), 3),
            general: RateLimitPolicy::new(Duration::from_secs(15 * 60), 100),
        }
    }
}

impl RateLimitPolicies {
    pub fn for_action(&self, action: RateLimitAction) -> RateLimitPolicy {
        match action {
            RateLimitAction::Auth => self.auth,
            RateLimitAction::Chat => self.chat,
            RateLimitAction::Admin => self.admin,
            RateLimitAction::Mint => self.mint,
            RateLimitAction::General => self.general,
        }
    }
}

/// The verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window closes.
    pub resets_in: Duration,
    pub reset_at: DateTime<Utc>,
}

/// Prefers the authenticated user over the network address.
pub fn resolve_identifier(user_id: Option<Uuid>, ip: Option<IpAddr>) -> String {
    match (user_id, ip) {
        (Some(user_id), _) => format!("user:{}", user_id),
        (None, Some(ip)) => format!("ip:{}", ip),
        (None, None) => "ip:unknown".to_string(),
    }
}

pub fn rate_limit_key(action: RateLimitAction, identifier: &str) -> String {
    format!("rate_limit:{}:{}", action, identifier)
}

/// Fixed-window request counting in the shared store.
///
/// Windows do not overlap, so a client may send up to twice the limit across
/// a window boundary.
#[derive(Clone)]
pub struct RateLimiter {
    store: SharedStore,
    policies: RateLimitPolicies,
}

impl RateLimiter {
    pub fn new(store: SharedStore, policies: RateLimitPolicies) -> Self {
        Self { store, policies }
    }

    pub fn policies(&self) -> &RateLimitPolicies {
        &self.policies
    }

    /// Counts one request against `key`.
    ///
    /// # Arguments
    ///
    /// * `key` - The counter key.
    /// * `window` - Length of the fixed window.
    /// * `max_requests` - Requests admitted per window.
    ///
    /// # Returns
    ///
    /// `Live` with the verdict, or `Degraded` allowing the request when the
    /// store cannot be reached.
    pub async fn check_and_increment(
        &self,
        key: &str,
        window: Duration,
        max_requests: u32,
    ) -> Checked<RateLimitDecision> {
        match self.store.incr_window(key, window).await {
            Ok(counted) => {
                let allowed = counted.count <= u64::from(max_requests);
                let used = u32::try_from(counted.count).unwrap_or(u32::MAX);
                if !allowed {
                    tracing::warn!("🚫 Rate limit exceeded for {}", key);
                }
                Checked::Live(verdict(
                    allowed,
                    max_requests,
                    max_requests.saturating_sub(used),
                    counted.resets_in,
                ))
            }
            Err(e) => {
                tracing::warn!("⚠️ Rate limiter degraded, allowing {}: {}", key, e);
                Checked::Degraded(verdict(true, max_requests, max_requests, window))
            }
        }
    }

    /// Counts one request of `action` by `identifier` under the configured
    /// policy.
    pub async fn check(
        &self,
        action: RateLimitAction,
        identifier: &str,
    ) -> Checked<RateLimitDecision> {
        let policy = self.policies.for_action(action);
        self.check_and_increment(
            &rate_limit_key(action, identifier),
            policy.window,
            policy.max_requests,
        )
        .await
    }

    /// Clears a counter before its window ends.
    pub async fn reset(&self, key: &str) -> Checked<()> {
        match self.store.del(key).await {
            Ok(_) => {
                tracing::debug!("Rate limit counter {} reset", key);
                Checked::Live(())
            }
            Err(e) => {
                tracing::warn!("⚠️ Rate limit reset for {} failed: {}", key, e);
                Checked::Degraded(())
            }
        }
    }
}

fn verdict(allowed: bool, limit: u32, remaining: u32, resets_in: Duration) -> RateLimitDecision {
    let reset_at = Utc::now()
        + chrono::Duration::from_std(resets_in).unwrap_or_else(|_| chrono::Duration::zero());
    RateLimitDecision {
        allowed,
        limit,
        remaining,
        resets_in,
        reset_at,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::MemoryStore;

    fn limiter(store: &MemoryStore) -> RateLimiter {
        RateLimiter::new(Arc::new(store.clone()), RateLimitPolicies::default())
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_window_admits_max_then_resets() {
        let store = MemoryStore::new();
        let limiter = limiter(&store);
        let window = Duration::from_secs(60);

        for expected_remaining in (0..5).rev() {
            let decision = limiter.check_and_increment("k", window, 5).await;
            assert!(!decision.is_degraded());
            let decision = decision.into_inner();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = limiter.check_and_increment("k", window, 5).await.into_inner();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.resets_in <= window);

        tokio::time::advance(window + Duration::from_millis(1)).await;

        let fresh = limiter.check_and_increment("k", window, 5).await.into_inner();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn later_hits_do_not_extend_the_window() {
        let store = MemoryStore::new();
        let limiter = limiter(&store);
        let window = Duration::from_secs(60);

        limiter.check_and_increment("k", window, 2).await;
        tokio::time::advance(Duration::from_secs(40)).await;
        let second = limiter.check_and_increment("k", window, 2).await.into_inner();
        assert!(second.resets_in <= Duration::from_secs(20));

        tokio::time::advance(Duration::from_secs(21)).await;
        let next = limiter.check_and_increment("k", window, 2).await.into_inner();
        assert_eq!(next.remaining, 1);
    }

    #[tokio::test]
    async fn reset_clears_the_counter() {
        let store = MemoryStore::new();
        let limiter = limiter(&store);
        let key = rate_limit_key(RateLimitAction::Auth, "ip:10.0.0.1");

        for _ in 0..5 {
            limiter.check(RateLimitAction::Auth, "ip:10.0.0.1").await;
        }
        assert!(!limiter
            .check(RateLimitAction::Auth, "ip:10.0.0.1")
            .await
            .into_inner()
            .allowed);

        assert!(!limiter.reset(&key).await.is_degraded());
        assert!(limiter
            .check(RateLimitAction::Auth, "ip:10.0.0.1")
            .await
            .into_inner()
            .allowed);
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let store = MemoryStore::new();
        let limiter = limiter(&store);
        store.set_offline(true);

        let decision = limiter.check(RateLimitAction::Mint, "user:x").await;
        assert!(decision.is_degraded());
        assert!(decision.value().allowed);
        assert_eq!(decision.value().remaining, 3);
        assert!(limiter.reset("rate_limit:mint:user:x").await.is_degraded());
    }

    #[test]
    fn identifiers_prefer_the_user() {
        let user = Uuid::new_v4();
        let ip: IpAddr = "192.0.2.7".parse().unwrap();

        assert_eq!(resolve_identifier(Some(user), Some(ip)), format!("user:{}", user));
        assert_eq!(resolve_identifier(None, Some(ip)), "ip:192.0.2.7");
        assert_eq!(
            rate_limit_key(RateLimitAction::Chat, "ip:192.0.2.7"),
            "rate_limit:chat:ip:192.0.2.7"
        );
    }

    #[test]
    fn policy_parses_window_and_max() {
        let policy: RateLimitPolicy = "900000:5".parse().unwrap();
        assert_eq!(policy.window, Duration::from_secs(900));
        assert_eq!(policy.max_requests, 5);

        assert!("900000".parse::<RateLimitPolicy>().is_err());
        assert!("0:5".parse::<RateLimitPolicy>().is_err());
        assert!("60000:x".parse::<RateLimitPolicy>().is_err());
    }
}
