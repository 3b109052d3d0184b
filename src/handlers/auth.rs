use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::Result,
    middleware_layer::rate_limit::RateLimitIdentity,
    models::{session::Session, token::TokenPair, user::Role},
    services::{
        auth::{LoginOutcome, MfaStatus},
        rate_limit::{rate_limit_key, RateLimitAction},
        token::AuthContext,
    },
    state::AppState,
    validation::auth::*,
};

/// The request payload for user login.
#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub mfa_code: Option<String>,
}

/// The response payload for a login attempt.
#[derive(Serialize)]
pub struct LoginResponse {
    pub requires_mfa: bool,
    pub session_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mfa_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenPair>,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

#[derive(Deserialize)]
pub struct MfaCodeRequest {
    pub code: String,
}

#[derive(Deserialize)]
pub struct DisableMfaRequest {
    pub password: String,
    pub code: String,
}

/// A session as shown to its owner.
#[derive(Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub role: Role,
    pub mfa_verified: bool,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub current: bool,
}

impl SessionView {
    fn new(session: Session, current: Uuid) -> Self {
        Self {
            current: session.session_id == current,
            session_id: session.session_id,
            role: session.role,
            mfa_verified: session.mfa_verified,
            created_at: session.created_at,
            last_accessed: session.last_accessed,
        }
    }
}

/// The response payload for simple acknowledgements.
#[derive(Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub message: String,
}

impl AuthResponse {
    fn ok(message: &str) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.to_string(),
        })
    }
}

/// Handles user login.
pub async fn login(
    State(state): State<AppState>,
    Extension(identity): Extension<RateLimitIdentity>,
    Json(payload): Json<LoginRequest>,
) -> Result<Response> {
    validate_email(&payload.email)?;
    validate_password(&payload.password)?;
    if let Some(code) = payload.mfa_code.as_deref() {
        validate_mfa_code(code)?;
    }

    let outcome = state
        .auth
        .login(&payload.email, &payload.password, payload.mfa_code.as_deref())
        .await?;

    state
        .limiter
        .reset(&rate_limit_key(RateLimitAction::Auth, &identity.0))
        .await;

    let body = match outcome {
        LoginOutcome::MfaRequired { session_id } => LoginResponse {
            requires_mfa: true,
            session_id,
            mfa_verified: None,
            tokens: None,
        },
        LoginOutcome::Authenticated {
            session_id,
            mfa_verified,
            tokens,
            ..
        } => LoginResponse {
            requires_mfa: false,
            session_id,
            mfa_verified: Some(mfa_verified),
            tokens: Some(tokens),
        },
    };
    Ok(Json(body).into_response())
}

/// Exchanges a refresh token for a new access token.
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>> {
    let access_token = state.auth.refresh(&payload.refresh_token).await?;
    Ok(Json(RefreshResponse {
        access_token,
        token_type: "Bearer",
        expires_in: state.auth.tokens().access_ttl().as_secs(),
    }))
}

/// Handles user logout.
pub async fn logout(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<AuthResponse>> {
    state.auth.logout(ctx.claims.sid, ctx.claims.sub).await?;
    Ok(AuthResponse::ok("Logged out"))
}

/// Lists the caller's live sessions.
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Vec<SessionView>>> {
    let sessions = state.auth.list_sessions(ctx.claims.sub).await?;
    Ok(Json(
        sessions
            .into_iter()
            .map(|s| SessionView::new(s, ctx.claims.sid))
            .collect(),
    ))
}

/// Ends every session of the caller.
pub async fn logout_everywhere(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<AuthResponse>> {
    let removed = state.auth.logout_everywhere(ctx.claims.sub).await?;
    Ok(AuthResponse::ok(&format!("{} session(s) ended", removed)))
}

/// Starts MFA enrollment. The secret and backup codes are shown once.
pub async fn mfa_setup(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response> {
    let setup = state.auth.setup_mfa(ctx.claims.sub).await?;
    Ok((StatusCode::CREATED, Json(setup)).into_response())
}

pub async fn mfa_confirm(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<MfaCodeRequest>,
) -> Result<Json<AuthResponse>> {
    validate_mfa_code(&payload.code)?;
    state
        .auth
        .confirm_mfa(ctx.claims.sub, ctx.claims.sid, &payload.code)
        .await?;
    Ok(AuthResponse::ok("MFA enabled"))
}

pub async fn mfa_disable(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<DisableMfaRequest>,
) -> Result<Json<AuthResponse>> {
    validate_mfa_code(&payload.code)?;
    state
        .auth
        .disable_mfa(ctx.claims.sub, &payload.password, &payload.code)
        .await?;
    Ok(AuthResponse::ok("MFA disabled; all sessions ended"))
}

#[derive(Serialize)]
pub struct BackupCodesResponse {
    pub backup_codes: Vec<String>,
}

/// Replaces the caller's backup codes after a current TOTP code.
pub async fn mfa_backup_codes(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<MfaCodeRequest>,
) -> Result<Json<BackupCodesResponse>> {
    validate_mfa_code(&payload.code)?;
    let backup_codes = state
        .auth
        .regenerate_backup_codes(ctx.claims.sub, &payload.code)
        .await?;
    Ok(Json(BackupCodesResponse { backup_codes }))
}

pub async fn mfa_status(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<MfaStatus>> {
    Ok(Json(state.auth.mfa_status(ctx.claims.sub).await?))
}
