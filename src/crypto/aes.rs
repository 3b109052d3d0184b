use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{AppError, Result};

/// The size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// The size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// The size of the AES-GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// The size of the per-envelope salt in bytes.
pub const SALT_SIZE: usize = 16;

const SUBKEY_LABEL: &[u8] = b"trustgate/envelope/v1";

type HmacSha256 = Hmac<Sha256>;

/// A secure key wrapper that ensures the key is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey([u8; KEY_SIZE]);

impl SecureKey {
    /// Creates a new `SecureKey` from a byte array.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self(key)
    }

    /// Copies a key out of a slice, rejecting anything that is not exactly
    /// `KEY_SIZE` bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| AppError::EncryptionFailure)?;
        Ok(Self(key))
    }

    /// Returns a reference to the key as a byte slice.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecureKey(..)")
    }
}

/// One unit of authenticated encryption.
///
/// Each envelope is sealed under a subkey derived from the caller's key and
/// a fresh random salt, with a fresh random nonce, so a (subkey, nonce) pair
/// never repeats under a long-lived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
}

impl Envelope {
    /// Serializes the envelope to JSON.
    pub fn to_json(&self) -> Result<String> {
        sonic_rs::to_string(self)
            .map_err(|e| AppError::Internal(format!("Envelope serialization failed: {}", e)))
    }

    /// Parses an envelope from JSON. Malformed input is an encryption failure.
    pub fn from_json(json: &str) -> Result<Self> {
        sonic_rs::from_str(json).map_err(|_| AppError::EncryptionFailure)
    }
}

/// Generates a new random AES-256 key.
pub fn generate_key() -> SecureKey {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    SecureKey::new(key)
}

/// Generates a new random AES-GCM nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn derive_subkey(key: &SecureKey, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|_| AppError::EncryptionFailure)?;
    mac.update(SUBKEY_LABEL);
    mac.update(salt);
    let digest = mac.finalize().into_bytes();

    let mut subkey = Zeroizing::new([0u8; KEY_SIZE]);
    subkey.copy_from_slice(&digest);
    Ok(subkey)
}

/// Encrypts `plaintext` under `key`, binding `aad`.
pub fn seal(key: &SecureKey, plaintext: &[u8], aad: &[u8]) -> Result<Envelope> {
    let salt = generate_salt();
    let subkey = derive_subkey(key, &salt)?;
    let cipher = Aes256Gcm::new((&*subkey).into());

    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from(nonce_bytes);

    let mut sealed = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| {
            tracing::error!("AES-GCM encryption failed: {}", e);
            AppError::EncryptionFailure
        })?;

    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Ok(Envelope {
        ciphertext: sealed,
        nonce: nonce_bytes.to_vec(),
        tag,
        salt: salt.to_vec(),
    })
}

/// Decrypts an envelope sealed with [`seal`]. Any mismatch in key, AAD,
/// shape or content yields `EncryptionFailure`.
pub fn open(key: &SecureKey, envelope: &Envelope, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if envelope.nonce.len() != NONCE_SIZE
        || envelope.tag.len() != TAG_SIZE
        || envelope.salt.len() != SALT_SIZE
    {
        return Err(AppError::EncryptionFailure);
    }

    let subkey = derive_subkey(key, &envelope.salt)?;
    let cipher = Aes256Gcm::new((&*subkey).into());
    let nonce = Nonce::from_slice(&envelope.nonce);

    let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_SIZE);
    sealed.extend_from_slice(&envelope.ciphertext);
    sealed.extend_from_slice(&envelope.tag);

    cipher
        .decrypt(nonce, Payload { msg: &sealed, aad })
        .map(Zeroizing::new)
        .map_err(|_| AppError::EncryptionFailure)
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = generate_key();
        let envelope = seal(&key, b"hello escrow", b"ctx").unwrap();
        let opened = open(&key, &envelope, b"ctx").unwrap();
        assert_eq!(opened.as_slice(), b"hello escrow");
    }

    #[test]
    fn nonce_and_salt_are_fresh_per_call() {
        let key = generate_key();
        let a = seal(&key, b"same", b"").unwrap();
        let b = seal(&key, b"same", b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_aad_fails() {
        let key = generate_key();
        let envelope = seal(&key, b"payload", b"room-a").unwrap();
        assert!(matches!(
            open(&key, &envelope, b"room-b"),
            Err(AppError::EncryptionFailure)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let envelope = seal(&generate_key(), b"payload", b"").unwrap();
        assert!(open(&generate_key(), &envelope, b"").is_err());
    }

    #[test]
    fn any_flipped_bit_fails() {
        let key = generate_key();
        let envelope = seal(&key, b"tamper target", b"aad").unwrap();

        for field in 0..4 {
            let len = match field {
                0 => envelope.ciphertext.len(),
                1 => envelope.tag.len(),
                2 => envelope.nonce.len(),
                _ => envelope.salt.len(),
            };
            for byte in 0..len {
                for bit in 0..8 {
                    let mut tampered = envelope.clone();
                    let target = match field {
                        0 => &mut tampered.ciphertext,
                        1 => &mut tampered.tag,
                        2 => &mut tampered.nonce,
                        _ => &mut tampered.salt,
                    };
                    target[byte] ^= 1 << bit;
                    assert!(open(&key, &tampered, b"aad").is_err());
                }
            }
        }
    }

    #[test]
    fn truncated_fields_are_rejected() {
        let key = generate_key();
        let mut envelope = seal(&key, b"x", b"").unwrap();
        envelope.tag.pop();
        assert!(matches!(
            open(&key, &envelope, b""),
            Err(AppError::EncryptionFailure)
        ));
    }

    #[test]
    fn envelope_json_roundtrip_is_base64() {
        let key = generate_key();
        let envelope = seal(&key, b"json", b"").unwrap();
        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"ciphertext\""));
        assert_eq!(Envelope::from_json(&json).unwrap(), envelope);
        assert!(Envelope::from_json("{not json").is_err());
    }

    #[test]
    fn debug_never_prints_key_material() {
        let key = SecureKey::new([7u8; KEY_SIZE]);
        assert_eq!(format!("{:?}", key), "SecureKey(..)");
    }
}
