use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::user::Role;

/// Distinguishes access from refresh tokens so neither can stand in for the
/// other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims of a bearer access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// The user id.
    pub sub: Uuid,
    pub email: String,
    pub role: Role,
    pub mfa_verified: bool,
    /// The session this token is bound to; deleting it revokes the token.
    pub sid: Uuid,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims of a refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: Uuid,
    pub sid: Uuid,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    /// Makes every issued refresh token distinct, even within one second.
    pub jti: Uuid,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Everything needed to mint an access token.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
    pub mfa_verified: bool,
    pub session_id: Uuid,
}

/// An access token and its paired refresh token.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Access-token lifetime in seconds.
    pub expires_in: u64,
}
