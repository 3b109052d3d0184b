use std::sync::Arc;

use crate::config::Config;
use crate::crypto::aes::SecureKey;
use crate::crypto::keyring::{KeyCache, Keyring, KEY_CACHE_CAPACITY, KEY_CACHE_TTL};
use crate::error::{AppError, Result};
use crate::repositories::user::{PgUserDirectory, UserDirectory};
use crate::services::auth::{Argon2Verifier, AuthOrchestrator, CredentialVerifier};
use crate::services::chat::ChatCrypto;
use crate::services::mfa::MfaService;
use crate::services::rate_limit::RateLimiter;
use crate::services::session::SessionStore;
use crate::services::token::{TokenService, TokenSettings};
use crate::store::{MemoryStore, RedisStore, SharedStore};

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// Login, logout and the MFA lifecycle.
    pub auth: AuthOrchestrator,
    /// Per-action fixed-window limits.
    pub limiter: RateLimiter,
    /// Chat envelope sealing.
    pub chat: ChatCrypto,
}

impl AppState {
    /// Creates a new `AppState`, connecting to the store and the database.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState`.
    pub async fn new(config: &Config) -> Result<Self> {
        let store: SharedStore = if config.uses_memory_store() {
            tracing::warn!("⚠️ Using the in-process store; state is not shared between nodes");
            Arc::new(MemoryStore::new())
        } else {
            let redis = RedisStore::connect(&config.redis_url, config.store_timeout).await?;
            tracing::info!("✅ Redis Connection Manager initialized");
            Arc::new(redis)
        };

        let pool = crate::db::create_pool(&config.database_url)?;
        tracing::info!("✅ PostgreSQL pool initialized with deadpool-postgres");

        Self::assemble(
            config,
            store,
            Arc::new(PgUserDirectory::new(pool)),
            Arc::new(Argon2Verifier),
        )
    }

    /// Wires every service onto an existing store and user directory.
    pub fn assemble(
        config: &Config,
        store: SharedStore,
        users: Arc<dyn UserDirectory>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Result<Self> {
        let master_key = Arc::new(SecureKey::from_slice(&config.chat_master_key).map_err(|_| {
            AppError::Internal("Chat master key must be 32 bytes".to_string())
        })?);

        let sessions = SessionStore::new(store.clone(), config.session_ttl);
        let tokens = TokenService::new(
            TokenSettings {
                secret: Arc::new(config.jwt_secret.clone()),
                issuer: config.jwt_issuer.clone(),
                audience: config.jwt_audience.clone(),
                access_ttl: config.access_token_ttl,
            },
            sessions.clone(),
            store.clone(),
        );
        let mfa = MfaService::new(store.clone(), master_key.clone(), config.mfa_issuer.clone());
        let auth = AuthOrchestrator::new(users, verifier, sessions, tokens, mfa);

        let keyring = Keyring::new(
            store.clone(),
            master_key.clone(),
            KeyCache::new(KEY_CACHE_TTL, KEY_CACHE_CAPACITY),
        );
        let chat = ChatCrypto::new(keyring, master_key);

        let limiter = RateLimiter::new(store, config.rate_limits);
        tracing::info!("✅ Services wired");

        Ok(AppState {
            auth,
            limiter,
            chat,
        })
    }
}
