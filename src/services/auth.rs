use std::sync::Arc;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2, ParamsBuilder,
};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{AppError, Result};
use crate::models::mfa::{MfaSetup, MfaState};
use crate::models::session::{NewSession, Session, SessionPatch};
use crate::models::token::{AccessGrant, TokenPair};
use crate::models::user::UserRecord;
use crate::repositories::user::UserDirectory;
use crate::services::mfa::MfaService;
use crate::services::session::SessionStore;
use crate::services::token::TokenService;

/// The memory cost for Argon2 in MB.
const ARGON2_MEMORY_MB: u32 = 19;
/// The number of iterations for Argon2.
const ARGON2_ITERATIONS: u32 = 2;
const ARGON2_PARALLELISM: u32 = 1;

/// Checks a password against whatever the user directory stored.
pub trait CredentialVerifier: Send + Sync {
    fn verify_password(&self, password: &str, stored_hash: &str) -> bool;
}

/// Argon2id password verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct Argon2Verifier;

impl CredentialVerifier for Argon2Verifier {
    fn verify_password(&self, password: &str, stored_hash: &str) -> bool {
        let Ok(parsed_hash) = PasswordHash::new(stored_hash) else {
            tracing::error!("❌ Stored password hash is not a PHC string");
            return false;
        };
        let password = Zeroizing::new(password.as_bytes().to_vec());
        Argon2::default()
            .verify_password(&password, &parsed_hash)
            .is_ok()
    }
}

/// Hashes a password using Argon2id.
///
/// # Arguments
///
/// * `password` - The password to hash.
///
/// # Returns
///
/// A `Result` containing the PHC-formatted hash.
pub fn hash_password(password: &str) -> Result<String> {
    let password = Zeroizing::new(password.as_bytes().to_vec());

    let mut salt_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| AppError::Internal(format!("Salt encoding error: {}", e)))?;

    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        ParamsBuilder::new()
            .m_cost(ARGON2_MEMORY_MB * 1024)
            .t_cost(ARGON2_ITERATIONS)
            .p_cost(ARGON2_PARALLELISM)
            .build()
            .map_err(|e| AppError::Internal(format!("Argon2 params: {}", e)))?,
    );

    let hash = argon2
        .hash_password(&password, &salt)
        .map_err(|e| AppError::Internal(format!("Argon2 hash error: {}", e)))?
        .to_string();
    Ok(hash)
}

/// What a login attempt produced.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Credentials were right but the account needs a second factor. No
    /// tokens are issued; the session is left to expire.
    MfaRequired { session_id: Uuid },
    /// Fully logged in.
    Authenticated {
        session_id: Uuid,
        user_id: Uuid,
        mfa_verified: bool,
        tokens: TokenPair,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MfaStatus {
    pub state: MfaState,
    pub backup_codes_remaining: usize,
}

/// Drives login, logout and the MFA lifecycle across the session, token and
/// MFA services. Endpoints talk to this and nothing below it.
#[derive(Clone)]
pub struct AuthOrchestrator {
    users: Arc<dyn UserDirectory>,
    verifier: Arc<dyn CredentialVerifier>,
    sessions: SessionStore,
    tokens: TokenService,
    mfa: MfaService,
}

impl AuthOrchestrator {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        verifier: Arc<dyn CredentialVerifier>,
        sessions: SessionStore,
        tokens: TokenService,
        mfa: MfaService,
    ) -> Self {
        Self {
            users,
            verifier,
            sessions,
            tokens,
            mfa,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Authenticates a user.
    ///
    /// # Arguments
    ///
    /// * `email` - The account email.
    /// * `password` - The password to check.
    /// * `mfa_code` - A TOTP or backup code, when the caller has one.
    ///
    /// # Returns
    ///
    /// `MfaRequired` when the account has MFA and no code was given,
    /// otherwise `Authenticated` with a token pair. Wrong credentials or a
    /// wrong code are errors and never yield tokens.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        mfa_code: Option<&str>,
    ) -> Result<LoginOutcome> {
        tracing::debug!("🔐 Login attempt for {}", email);
        let mut user = self.check_credentials(email, password).await?;
        self.reconcile_mfa_flag(&mut user).await?;

        let session = self
            .sessions
            .create(
                user.id,
                NewSession {
                    email: user.email.clone(),
                    role: user.role,
                    mfa_enabled: user.mfa_enabled,
                    mfa_verified: false,
                },
            )
            .await?;

        if !user.mfa_enabled {
            return self.authenticated(&session, false).await;
        }

        let Some(code) = mfa_code else {
            tracing::info!("🔐 MFA required for user {}", user.id);
            return Ok(LoginOutcome::MfaRequired {
                session_id: session.session_id,
            });
        };

        if !self.mfa.verify_for_user(user.id, code).await? {
            self.sessions.delete(session.session_id).await?;
            tracing::warn!("❌ MFA code rejected during login for user {}", user.id);
            return Err(AppError::InvalidMfaCode);
        }

        let patch = SessionPatch {
            mfa_verified: Some(true),
            ..Default::default()
        };
        if !self.sessions.update(session.session_id, patch).await? {
            return Err(AppError::SessionNotFound);
        }
        self.authenticated(&session, true).await
    }

    /// Mints a new access token from a refresh token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<String> {
        self.tokens
            .refresh(refresh_token)
            .await
            .ok_or(AppError::TokenInvalid)
    }

    /// Ends one session and revokes the user's refresh token. Repeating it is
    /// harmless.
    pub async fn logout(&self, session_id: Uuid, user_id: Uuid) -> Result<()> {
        self.sessions.delete(session_id).await?;
        self.tokens.revoke(user_id).await?;
        tracing::info!("👋 User {} logged out of session {}", user_id, session_id);
        Ok(())
    }

    /// Ends every session of the user. Returns how many were live.
    pub async fn logout_everywhere(&self, user_id: Uuid) -> Result<usize> {
        let removed = self.sessions.delete_all_for_user(user_id).await?;
        self.tokens.revoke(user_id).await?;
        Ok(removed)
    }

    pub async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<Session>> {
        self.sessions.list_for_user(user_id).await
    }

    /// Starts MFA enrollment for a user without a confirmed factor.
    pub async fn setup_mfa(&self, user_id: Uuid) -> Result<MfaSetup> {
        let mut user = self.active_user(user_id).await?;
        self.reconcile_mfa_flag(&mut user).await?;
        if user.mfa_enabled {
            return Err(AppError::Validation("MFA is already enabled".to_string()));
        }
        self.mfa.begin_enrollment(user.id, &user.email).await
    }

    /// Confirms a pending enrollment. The calling session becomes verified;
    /// every other live session of the user now needs the second factor.
    pub async fn confirm_mfa(&self, user_id: Uuid, session_id: Uuid, code: &str) -> Result<()> {
        if !self.mfa.confirm(user_id, code).await? {
            return Err(AppError::InvalidMfaCode);
        }
        self.users.set_mfa_enabled(user_id, true).await?;

        for session in self.sessions.list_for_user(user_id).await? {
            let patch = SessionPatch {
                mfa_enabled: Some(true),
                mfa_verified: Some(session.session_id == session_id),
                ..Default::default()
            };
            self.sessions.update(session.session_id, patch).await?;
        }
        Ok(())
    }

    /// Removes the second factor. Needs both the password and a valid code,
    /// or only the password when the stored factor is gone. Afterwards every
    /// session of the user is ended.
    pub async fn disable_mfa(&self, user_id: Uuid, password: &str, mfa_code: &str) -> Result<()> {
        let mut user = self.active_user(user_id).await?;
        if !self.verify_password(password, &user.password_hash).await? {
            tracing::warn!("❌ Wrong password while disabling MFA for user {}", user_id);
            return Err(AppError::InvalidCredentials);
        }
        if self.reconcile_mfa_flag(&mut user).await? {
            self.logout_everywhere(user_id).await?;
            return Ok(());
        }
        if !user.mfa_enabled {
            return Err(AppError::Validation("MFA is not enabled".to_string()));
        }
        if !self.mfa.verify_for_user(user_id, mfa_code).await? {
            tracing::warn!("❌ Wrong MFA code while disabling MFA for user {}", user_id);
            return Err(AppError::InvalidMfaCode);
        }

        self.mfa.teardown(user_id).await?;
        self.users.set_mfa_enabled(user_id, false).await?;
        self.logout_everywhere(user_id).await?;
        tracing::info!("🔓 MFA disabled for user {}", user_id);
        Ok(())
    }

    /// Replaces all backup codes after proving a current TOTP code.
    pub async fn regenerate_backup_codes(
        &self,
        user_id: Uuid,
        totp_code: &str,
    ) -> Result<Vec<String>> {
        self.mfa
            .regenerate_backup_codes(user_id, totp_code)
            .await?
            .ok_or(AppError::InvalidMfaCode)
    }

    pub async fn mfa_status(&self, user_id: Uuid) -> Result<MfaStatus> {
        Ok(MfaStatus {
            state: self.mfa.status(user_id).await?,
            backup_codes_remaining: self.mfa.backup_codes_remaining(user_id).await?,
        })
    }

    async fn check_credentials(&self, email: &str, password: &str) -> Result<UserRecord> {
        let Some(user) = self.users.find_by_email(email).await? else {
            tracing::warn!("❌ Login failed: unknown email");
            return Err(AppError::InvalidCredentials);
        };
        if !user.is_active {
            tracing::warn!("❌ Login failed: user {} is inactive", user.id);
            return Err(AppError::InvalidCredentials);
        }
        if !self.verify_password(password, &user.password_hash).await? {
            tracing::warn!("❌ Login failed: wrong password for user {}", user.id);
            return Err(AppError::InvalidCredentials);
        }
        Ok(user)
    }

    /// Clears the account's MFA flag when the store holds no confirmed
    /// factor for it, so a lost factor cannot lock the account. Returns
    /// whether the flag was cleared.
    async fn reconcile_mfa_flag(&self, user: &mut UserRecord) -> Result<bool> {
        if !user.mfa_enabled || self.mfa.status(user.id).await? == MfaState::Confirmed {
            return Ok(false);
        }

        tracing::warn!(
            "⚠️ User {} is flagged for MFA but has no confirmed factor; clearing the flag",
            user.id
        );
        self.mfa.teardown(user.id).await?;
        self.users.set_mfa_enabled(user.id, false).await?;
        user.mfa_enabled = false;
        Ok(true)
    }

    async fn active_user(&self, user_id: Uuid) -> Result<UserRecord> {
        match self.users.find_by_id(user_id).await? {
            Some(user) if user.is_active => Ok(user),
            _ => Err(AppError::InvalidCredentials),
        }
    }

    async fn verify_password(&self, password: &str, stored_hash: &str) -> Result<bool> {
        let verifier = self.verifier.clone();
        let password = Zeroizing::new(password.to_string());
        let stored_hash = stored_hash.to_string();

        tokio::task::spawn_blocking(move || verifier.verify_password(&password, &stored_hash))
            .await
            .map_err(|e| AppError::Internal(format!("Password check panicked: {}", e)))
    }

    async fn authenticated(&self, session: &Session, mfa_verified: bool) -> Result<LoginOutcome> {
        let grant = AccessGrant {
            user_id: session.user_id,
            email: session.email.clone(),
            role: session.role,
            mfa_verified,
            session_id: session.session_id,
        };
        let tokens = self.tokens.issue_pair(&grant).await?;

        tracing::info!(
            "✅ User {} authenticated (session {}, mfa_verified={})",
            session.user_id,
            session.session_id,
            mfa_verified
        );
        Ok(LoginOutcome::Authenticated {
            session_id: session.session_id,
            user_id: session.user_id,
            mfa_verified,
            tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argon2_hash_verifies_only_the_right_password() {
        let hash = hash_password("correct horse battery").unwrap();
        assert!(hash.starts_with("$argon2id$"));

        let verifier = Argon2Verifier;
        assert!(verifier.verify_password("correct horse battery", &hash));
        assert!(!verifier.verify_password("wrong horse battery", &hash));
        assert!(!verifier.verify_password("correct horse battery", "plaintext"));
    }
}
