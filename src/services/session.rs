use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::session::{NewSession, Session, SessionPatch};
use crate::store::{SharedStore, StoreError};

/// Default sliding lifetime of a session.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 3600);

fn session_key(session_id: Uuid) -> String {
    format!("session:{}", session_id)
}

fn user_sessions_key(user_id: Uuid) -> String {
    format!("user_sessions:{}", user_id)
}

/// TTL-backed session records with a per-user index.
#[derive(Clone)]
pub struct SessionStore {
    store: SharedStore,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Creates a session and registers it in the user's session set.
    pub async fn create(&self, user_id: Uuid, attrs: NewSession) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4(),
            user_id,
            email: attrs.email,
            role: attrs.role,
            mfa_enabled: attrs.mfa_enabled,
            mfa_verified: attrs.mfa_verified,
            created_at: now,
            last_accessed: now,
        };

        self.write(&session).await?;

        let index = user_sessions_key(user_id);
        self.store
            .sadd(&index, &[session.session_id.to_string()])
            .await?;
        self.store.expire(&index, self.ttl).await?;

        tracing::info!(
            "✅ Session created: session:{} for user {}",
            session.session_id,
            user_id
        );
        Ok(session)
    }

    /// Reads a session, sliding its expiry forward.
    pub async fn read(&self, session_id: Uuid) -> Result<Option<Session>> {
        let Some(mut session) = self.load(session_id).await? else {
            return Ok(None);
        };

        if !self.touch(&mut session).await? {
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Merges `patch` into a live session. Returns false if it is gone.
    pub async fn update(&self, session_id: Uuid, patch: SessionPatch) -> Result<bool> {
        let Some(mut session) = self.load(session_id).await? else {
            return Ok(false);
        };

        patch.apply(&mut session);
        self.touch(&mut session).await
    }

    /// Removes a session and its index entry. Deleting twice is harmless.
    pub async fn delete(&self, session_id: Uuid) -> Result<()> {
        if let Some(session) = self.load(session_id).await? {
            self.store
                .srem(
                    &user_sessions_key(session.user_id),
                    &session_id.to_string(),
                )
                .await?;
        }
        self.store.del(&session_key(session_id)).await?;

        tracing::info!("✅ Session deleted: session:{}", session_id);
        Ok(())
    }

    /// Lists a user's live sessions without extending them. Index entries
    /// whose session has expired are pruned along the way.
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let index = user_sessions_key(user_id);
        let mut sessions = Vec::new();

        for id in self.store.smembers(&index).await? {
            let live = match Uuid::parse_str(&id) {
                Ok(session_id) => self.load(session_id).await?,
                Err(_) => None,
            };
            match live {
                Some(session) if session.user_id == user_id => sessions.push(session),
                _ => {
                    self.store.srem(&index, &id).await?;
                }
            }
        }

        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    /// Deletes every session of a user. Returns how many were live.
    pub async fn delete_all_for_user(&self, user_id: Uuid) -> Result<usize> {
        let index = user_sessions_key(user_id);
        let mut removed = 0;

        for id in self.store.smembers(&index).await? {
            if self.store.del(&format!("session:{}", id)).await? {
                removed += 1;
            }
        }
        self.store.del(&index).await?;

        tracing::info!("✅ {} session(s) revoked for user {}", removed, user_id);
        Ok(removed)
    }

    async fn load(&self, session_id: Uuid) -> Result<Option<Session>> {
        let key = session_key(session_id);
        let Some(json) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let session: Session = sonic_rs::from_str(&json).map_err(|e| {
            tracing::warn!("❌ Invalid session JSON at {}: {}", key, e);
            AppError::Store(StoreError::Corrupt(key.clone()))
        })?;

        if session.session_id != session_id {
            tracing::warn!("❌ Session record at {} carries a foreign id", key);
            return Err(AppError::Store(StoreError::Corrupt(key)));
        }
        session.check().map_err(|e| {
            tracing::warn!("❌ Session record at {} failed validation: {}", key, e);
            AppError::Store(StoreError::Corrupt(key.clone()))
        })?;

        Ok(Some(session))
    }

    /// Rewrites a live session with a fresh expiry. Returns false when the
    /// session was deleted since it was loaded; it is never written back.
    async fn touch(&self, session: &mut Session) -> Result<bool> {
        session.last_accessed = Utc::now().max(session.last_accessed);
        let json = self.encode(session)?;

        let written = self
            .store
            .set_xx(&session_key(session.session_id), &json, self.ttl)
            .await
            .map_err(|e| {
                tracing::error!("❌ Session write failed: {}", e);
                AppError::Store(e)
            })?;
        if !written {
            tracing::debug!("Session {} vanished before its refresh", session.session_id);
            return Ok(false);
        }

        self.store
            .expire(&user_sessions_key(session.user_id), self.ttl)
            .await?;
        Ok(true)
    }

    async fn write(&self, session: &Session) -> Result<()> {
        let json = self.encode(session)?;
        self.store
            .set(&session_key(session.session_id), &json, Some(self.ttl))
            .await
            .map_err(|e| {
                tracing::error!("❌ Session write failed: {}", e);
                AppError::Store(e)
            })
    }

    fn encode(&self, session: &Session) -> Result<String> {
        session.check().map_err(AppError::Validation)?;
        sonic_rs::to_string(session)
            .map_err(|e| AppError::Internal(format!("Session serialization failed: {}", e)))
    }
}
