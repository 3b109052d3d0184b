use std::sync::Arc;

use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::aes::SecureKey;
use crate::crypto::envelope::{self, ChatContext};
use crate::crypto::keyring::Keyring;
use crate::error::Result;

/// Seals and opens chat messages for project rooms.
#[derive(Clone)]
pub struct ChatCrypto {
    keyring: Keyring,
    master_key: Arc<SecureKey>,
}

impl ChatCrypto {
    pub fn new(keyring: Keyring, master_key: Arc<SecureKey>) -> Self {
        Self {
            keyring,
            master_key,
        }
    }

    /// Seals `plaintext` for one recipient in a project room and returns the
    /// wire form.
    pub async fn seal(
        &self,
        project_id: &str,
        recipient_id: Uuid,
        plaintext: &[u8],
    ) -> Result<String> {
        let room_key = self.keyring.room_key(project_id).await?;
        self.seal_with(&room_key, project_id, recipient_id, plaintext)
            .await
    }

    /// Seals the same message once per recipient under one room key.
    pub async fn seal_for_recipients(
        &self,
        project_id: &str,
        recipients: &[Uuid],
        plaintext: &[u8],
    ) -> Result<Vec<(Uuid, String)>> {
        let room_key = self.keyring.room_key(project_id).await?;

        let mut sealed = Vec::with_capacity(recipients.len());
        for recipient_id in recipients {
            let wire = self
                .seal_with(&room_key, project_id, *recipient_id, plaintext)
                .await?;
            sealed.push((*recipient_id, wire));
        }
        Ok(sealed)
    }

    /// Opens a wire envelope addressed to `recipient_id` in `project_id`.
    pub async fn open(
        &self,
        project_id: &str,
        recipient_id: Uuid,
        wire: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let outer = envelope::decode_wire(wire)?;
        let user_key = self.keyring.user_key(recipient_id).await?;
        let ctx = ChatContext {
            project_id,
            recipient_id,
        };

        envelope::open_message(&user_key, &self.master_key, ctx, &outer).map_err(|e| {
            tracing::warn!(
                "❌ Chat envelope for project {} failed to open for {}",
                project_id,
                recipient_id
            );
            e
        })
    }

    /// Replaces the room key. Only messages sealed afterwards use the new key.
    pub async fn rotate(&self, project_id: &str) -> Result<()> {
        self.keyring.rotate_room_key(project_id).await
    }

    async fn seal_with(
        &self,
        room_key: &SecureKey,
        project_id: &str,
        recipient_id: Uuid,
        plaintext: &[u8],
    ) -> Result<String> {
        let user_key = self.keyring.user_key(recipient_id).await?;
        let ctx = ChatContext {
            project_id,
            recipient_id,
        };

        let outer = envelope::seal_message(room_key, &user_key, &self.master_key, ctx, plaintext)?;
        tracing::debug!("🔒 Chat message sealed for project {}", project_id);
        envelope::encode_wire(&outer)
    }
}
