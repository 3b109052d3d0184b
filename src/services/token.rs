use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::session::Session;
use crate::models::token::{AccessClaims, AccessGrant, RefreshClaims, TokenKind, TokenPair};
use crate::services::session::SessionStore;
use crate::store::SharedStore;

/// Default access-token lifetime.
pub const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(24 * 3600);
/// Refresh-token lifetime.
pub const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Signing material and the fixed issuer/audience pair.
#[derive(Clone)]
pub struct TokenSettings {
    pub secret: Arc<zeroize::Zeroizing<Vec<u8>>>,
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
}

/// A verified bearer token together with its live session.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: AccessClaims,
    pub session: Session,
}

fn refresh_key(user_id: Uuid) -> String {
    format!("refresh_token:{}", user_id)
}

/// Issues and validates signed bearer credentials.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    settings: TokenSettings,
    sessions: SessionStore,
    store: SharedStore,
}

impl TokenService {
    pub fn new(settings: TokenSettings, sessions: SessionStore, store: SharedStore) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[settings.issuer.as_str()]);
        validation.set_audience(&[settings.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "aud", "sub"]);
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(&settings.secret),
            decoding: DecodingKey::from_secret(&settings.secret),
            validation,
            settings,
            sessions,
            store,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.settings.access_ttl
    }

    /// Signs an access token for `grant`.
    pub fn issue_access(&self, grant: &AccessGrant) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            sub: grant.user_id,
            email: grant.email.clone(),
            role: grant.role,
            mfa_verified: grant.mfa_verified,
            sid: grant.session_id,
            kind: TokenKind::Access,
            iss: self.settings.issuer.clone(),
            aud: self.settings.audience.clone(),
            iat: now,
            exp: now + secs(self.settings.access_ttl),
        };
        self.sign(&claims)
    }

    /// Signs a refresh token and makes it the user's only active one.
    pub async fn issue_refresh(&self, user_id: Uuid, session_id: Uuid) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = RefreshClaims {
            sub: user_id,
            sid: session_id,
            kind: TokenKind::Refresh,
            jti: Uuid::new_v4(),
            iss: self.settings.issuer.clone(),
            aud: self.settings.audience.clone(),
            iat: now,
            exp: now + secs(REFRESH_TOKEN_TTL),
        };
        let token = self.sign(&claims)?;

        self.store
            .set(&refresh_key(user_id), &token, Some(REFRESH_TOKEN_TTL))
            .await?;

        tracing::debug!("🔑 Active refresh token replaced for user {}", user_id);
        Ok(token)
    }

    /// Issues an access token and a fresh refresh token.
    pub async fn issue_pair(&self, grant: &AccessGrant) -> Result<TokenPair> {
        let access_token = self.issue_access(grant)?;
        let refresh_token = self.issue_refresh(grant.user_id, grant.session_id).await?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer",
            expires_in: self.settings.access_ttl.as_secs(),
        })
    }

    /// Checks signature, expiry, issuer, audience and token kind.
    /// Every failure is the same `TokenInvalid`.
    pub fn verify(&self, token: &str) -> Result<AccessClaims> {
        let claims: AccessClaims = self.decode(token)?;
        if claims.kind != TokenKind::Access {
            return Err(AppError::TokenInvalid);
        }
        Ok(claims)
    }

    /// Verifies a bearer token and confirms its session still exists.
    /// Store failures reject the token.
    pub async fn authenticate(&self, token: &str) -> Result<AuthContext> {
        let claims = self.verify(token)?;

        let session = match self.sessions.read(claims.sid).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::debug!("❌ Session {} no longer exists", claims.sid);
                return Err(AppError::TokenInvalid);
            }
            Err(e) => {
                tracing::warn!("❌ Session lookup failed, rejecting token: {}", e);
                return Err(AppError::TokenInvalid);
            }
        };

        if session.user_id != claims.sub {
            tracing::warn!("❌ Token subject does not own session {}", claims.sid);
            return Err(AppError::TokenInvalid);
        }

        Ok(AuthContext { claims, session })
    }

    /// Mints a new access token from a refresh token. Returns `None` on any
    /// failure; the caller must re-authenticate.
    pub async fn refresh(&self, refresh_token: &str) -> Option<String> {
        let claims: RefreshClaims = self.decode(refresh_token).ok()?;
        if claims.kind != TokenKind::Refresh {
            return None;
        }

        let active = match self.store.get(&refresh_key(claims.sub)).await {
            Ok(active) => active?,
            Err(e) => {
                tracing::warn!("❌ Refresh lookup failed: {}", e);
                return None;
            }
        };
        if !bool::from(active.as_bytes().ct_eq(refresh_token.as_bytes())) {
            tracing::debug!("❌ Refresh token for user {} is not the active one", claims.sub);
            return None;
        }

        let session = match self.sessions.read(claims.sid).await {
            Ok(Some(session)) if session.user_id == claims.sub => session,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!("❌ Session lookup failed during refresh: {}", e);
                return None;
            }
        };

        let grant = AccessGrant {
            user_id: session.user_id,
            email: session.email.clone(),
            role: session.role,
            mfa_verified: session.mfa_verified,
            session_id: session.session_id,
        };
        self.issue_access(&grant).ok()
    }

    /// Forgets the user's active refresh token. Idempotent.
    pub async fn revoke(&self, user_id: Uuid) -> Result<()> {
        self.store.del(&refresh_key(user_id)).await?;
        tracing::debug!("🔒 Refresh token revoked for user {}", user_id);
        Ok(())
    }

    fn sign<T: serde::Serialize>(&self, claims: &T) -> Result<String> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("Token signing failed: {}", e)))
    }

    fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<T> {
        jsonwebtoken::decode::<T>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!("❌ Token rejected: {}", e);
                AppError::TokenInvalid
            })
    }
}

fn secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}
