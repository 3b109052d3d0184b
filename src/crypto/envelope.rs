//! Layered envelopes for chat content.
//!
//! A stored chat message is an [`Envelope`] sealed under the server master
//! key. Inside it sit two more envelopes: the message sealed under the room
//! key, and the room key sealed under the recipient's user key. Opening
//! therefore needs the master key and the recipient's user key; the room key
//! travels wrapped with every message.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::aes::{self, Envelope, SecureKey};
use crate::error::{AppError, Result};

const LAYOUT_VERSION: u8 = 1;

/// Where a message belongs and who may read it. Bound into every layer's AAD
/// so an envelope cannot be replayed into another room or to another user.
#[derive(Debug, Clone, Copy)]
pub struct ChatContext<'a> {
    pub project_id: &'a str,
    pub recipient_id: Uuid,
}

impl ChatContext<'_> {
    fn message_aad(&self) -> Vec<u8> {
        format!("chat-message:v1|{}", self.project_id).into_bytes()
    }

    fn room_key_aad(&self) -> Vec<u8> {
        format!("chat-room-key:v1|{}|{}", self.project_id, self.recipient_id).into_bytes()
    }

    fn outer_aad(&self) -> Vec<u8> {
        format!("chat-outer:v1|{}|{}", self.project_id, self.recipient_id).into_bytes()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LayeredPayload {
    v: u8,
    message: Envelope,
    key: Envelope,
}

/// Seals `plaintext` in three layers: room key, user key, master key.
pub fn seal_message(
    room_key: &SecureKey,
    user_key: &SecureKey,
    master_key: &SecureKey,
    ctx: ChatContext<'_>,
    plaintext: &[u8],
) -> Result<Envelope> {
    let message = aes::seal(room_key, plaintext, &ctx.message_aad())?;
    let key = aes::seal(user_key, room_key.as_bytes(), &ctx.room_key_aad())?;

    let payload = LayeredPayload {
        v: LAYOUT_VERSION,
        message,
        key,
    };
    let inner = Zeroizing::new(
        sonic_rs::to_vec(&payload)
            .map_err(|e| AppError::Internal(format!("Layer serialization failed: {}", e)))?,
    );

    aes::seal(master_key, &inner, &ctx.outer_aad())
}

/// Reverses [`seal_message`]: master key, parse, user key (recovers the room
/// key), room key. Every failure is the same `EncryptionFailure`.
pub fn open_message(
    user_key: &SecureKey,
    master_key: &SecureKey,
    ctx: ChatContext<'_>,
    outer: &Envelope,
) -> Result<Zeroizing<Vec<u8>>> {
    let payload = open_outer(master_key, ctx, outer)?;

    let room_key_bytes = aes::open(user_key, &payload.key, &ctx.room_key_aad())?;
    let room_key = SecureKey::from_slice(&room_key_bytes)?;

    aes::open(&room_key, &payload.message, &ctx.message_aad())
}

fn open_outer(
    master_key: &SecureKey,
    ctx: ChatContext<'_>,
    outer: &Envelope,
) -> Result<LayeredPayload> {
    let inner = aes::open(master_key, outer, &ctx.outer_aad())?;
    let payload: LayeredPayload =
        sonic_rs::from_slice(&inner).map_err(|_| AppError::EncryptionFailure)?;
    if payload.v != LAYOUT_VERSION {
        return Err(AppError::EncryptionFailure);
    }
    Ok(payload)
}

/// Encodes an outer envelope as one URL-safe string for storage or transport.
pub fn encode_wire(envelope: &Envelope) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(envelope.to_json()?))
}

/// Decodes [`encode_wire`] output. Malformed input is an encryption failure.
pub fn decode_wire(wire: &str) -> Result<Envelope> {
    let json = URL_SAFE_NO_PAD
        .decode(wire.trim().as_bytes())
        .map_err(|_| AppError::EncryptionFailure)?;
    let json = std::str::from_utf8(&json).map_err(|_| AppError::EncryptionFailure)?;
    Envelope::from_json(json)
}
