#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;
use zeroize::Zeroizing;

use trustgate::config::Config;
use trustgate::error::Result;
use trustgate::models::user::{Role, UserRecord};
use trustgate::repositories::user::UserDirectory;
use trustgate::services::auth::{hash_password, Argon2Verifier};
use trustgate::services::rate_limit::RateLimitPolicies;
use trustgate::state::AppState;
use trustgate::store::MemoryStore;

pub const PASSWORD: &str = "correct horse battery staple";

/// Accounts kept in memory, standing in for the `users` table.
#[derive(Default, Clone)]
pub struct MemoryUsers {
    users: Arc<Mutex<HashMap<Uuid, UserRecord>>>,
}

impl MemoryUsers {
    pub fn add(&self, email: &str, role: Role) -> UserRecord {
        let user = UserRecord {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: hash_password(PASSWORD).unwrap(),
            role,
            mfa_enabled: false,
            is_active: true,
        };
        self.users.lock().unwrap().insert(user.id, user.clone());
        user
    }

    pub fn get(&self, user_id: Uuid) -> UserRecord {
        self.users.lock().unwrap()[&user_id].clone()
    }

    pub fn deactivate(&self, user_id: Uuid) {
        if let Some(user) = self.users.lock().unwrap().get_mut(&user_id) {
            user.is_active = false;
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryUsers {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email) && u.is_active)
            .cloned())
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<UserRecord>> {
        Ok(self.users.lock().unwrap().get(&user_id).cloned())
    }

    async fn set_mfa_enabled(&self, user_id: Uuid, enabled: bool) -> Result<()> {
        if let Some(user) = self.users.lock().unwrap().get_mut(&user_id) {
            user.mfa_enabled = enabled;
        }
        Ok(())
    }
}

pub fn config() -> Config {
    Config {
        database_url: "postgres://unused".to_string(),
        redis_url: "memory://".to_string(),
        store_timeout: Duration::from_secs(2),
        jwt_secret: Zeroizing::new(b"integration-test-secret-0123456789abcdef".to_vec()),
        jwt_issuer: "trustgate".to_string(),
        jwt_audience: "escrow-api".to_string(),
        access_token_ttl: Duration::from_secs(86_400),
        session_ttl: Duration::from_secs(86_400),
        mfa_issuer: "Escrow Platform".to_string(),
        chat_master_key: Zeroizing::new(vec![7u8; 32]),
        rate_limits: RateLimitPolicies::default(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
    }
}

pub struct TestContext {
    pub state: AppState,
    pub store: MemoryStore,
    pub users: MemoryUsers,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: Config) -> Self {
        let store = MemoryStore::new();
        let users = MemoryUsers::default();
        let state = AppState::assemble(
            &config,
            Arc::new(store.clone()),
            Arc::new(users.clone()),
            Arc::new(Argon2Verifier),
        )
        .unwrap();
        Self {
            state,
            store,
            users,
        }
    }
}

/// The code an authenticator app would show right now.
pub fn totp_now(secret: &str) -> String {
    let bytes = Secret::Encoded(secret.to_string()).to_bytes().unwrap();
    TOTP::new(Algorithm::SHA1, 6, 1, 30, bytes, None, "test".to_string())
        .unwrap()
        .generate(Utc::now().timestamp() as u64)
}
