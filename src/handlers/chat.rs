use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    services::token::AuthContext,
    state::AppState,
    validation::auth::validate_project_id,
};

/// Largest plaintext accepted for one message.
const MAX_MESSAGE_BYTES: usize = 64 * 1024;
const MAX_RECIPIENTS: usize = 32;

#[derive(Deserialize)]
pub struct SealRequest {
    pub message: String,
    /// Defaults to the caller.
    #[serde(default)]
    pub recipients: Vec<Uuid>,
}

#[derive(Serialize)]
pub struct SealedMessage {
    pub recipient_id: Uuid,
    pub envelope: String,
}

#[derive(Serialize)]
pub struct SealResponse {
    pub project_id: String,
    pub sealed: Vec<SealedMessage>,
}

#[derive(Deserialize)]
pub struct OpenRequest {
    pub envelope: String,
}

#[derive(Serialize)]
pub struct OpenResponse {
    pub message: String,
}

#[derive(Serialize)]
pub struct RotateResponse {
    pub project_id: String,
    pub rotated: bool,
}

/// Seals a chat message for each recipient of a project room.
pub async fn seal(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(project_id): Path<String>,
    Json(payload): Json<SealRequest>,
) -> Result<Json<SealResponse>> {
    validate_project_id(&project_id)?;
    if payload.message.len() > MAX_MESSAGE_BYTES {
        return Err(AppError::Validation("Message is too large".to_string()));
    }

    let mut recipients = payload.recipients;
    if recipients.is_empty() {
        recipients.push(ctx.claims.sub);
    }
    recipients.sort_unstable();
    recipients.dedup();
    if recipients.len() > MAX_RECIPIENTS {
        return Err(AppError::Validation("Too many recipients".to_string()));
    }

    let sealed = state
        .chat
        .seal_for_recipients(&project_id, &recipients, payload.message.as_bytes())
        .await?
        .into_iter()
        .map(|(recipient_id, envelope)| SealedMessage {
            recipient_id,
            envelope,
        })
        .collect();

    tracing::debug!(
        "🔒 User {} sealed a message in project {}",
        ctx.claims.sub,
        project_id
    );
    Ok(Json(SealResponse { project_id, sealed }))
}

/// Opens an envelope addressed to the caller.
pub async fn open(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(project_id): Path<String>,
    Json(payload): Json<OpenRequest>,
) -> Result<Json<OpenResponse>> {
    validate_project_id(&project_id)?;

    let plaintext = state
        .chat
        .open(&project_id, ctx.claims.sub, &payload.envelope)
        .await?;
    let message = String::from_utf8(plaintext.to_vec()).map_err(|_| AppError::EncryptionFailure)?;

    Ok(Json(OpenResponse { message }))
}

/// Rotates a project's room key.
pub async fn rotate(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(project_id): Path<String>,
) -> Result<Json<RotateResponse>> {
    validate_project_id(&project_id)?;
    state.chat.rotate(&project_id).await?;

    tracing::info!(
        "🔄 User {} rotated the key of project {}",
        ctx.claims.sub,
        project_id
    );
    Ok(Json(RotateResponse {
        project_id,
        rotated: true,
    }))
}
