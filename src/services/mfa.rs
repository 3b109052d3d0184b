use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::aes::{self, Envelope, SecureKey};
use crate::error::{AppError, Result};
use crate::models::mfa::{Enrollment, MfaSetup, MfaState, PendingEnrollment};
use crate::store::SharedStore;

/// How long an unproven enrollment waits for its first code.
pub const PENDING_TTL: Duration = Duration::from_secs(10 * 60);
pub const BACKUP_CODE_COUNT: usize = 10;
pub const BACKUP_CODE_LEN: usize = 8;
pub const TOTP_DIGITS: usize = 6;

const TOTP_STEP: u64 = 30;
const TOTP_SKEW: u8 = 1;
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

type HmacSha256 = Hmac<Sha256>;

/// A second-factor code after normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MfaCode {
    Totp(String),
    Backup(String),
}

/// Strips dashes and whitespace, uppercases, and sorts the input into a TOTP
/// or backup code. Anything else is `None`.
pub fn classify_code(input: &str) -> Option<MfaCode> {
    let normalized: String = input
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if normalized.len() == TOTP_DIGITS && normalized.bytes().all(|b| b.is_ascii_digit()) {
        return Some(MfaCode::Totp(normalized));
    }
    if normalized.len() == BACKUP_CODE_LEN
        && normalized.bytes().all(|b| BACKUP_CODE_ALPHABET.contains(&b))
    {
        return Some(MfaCode::Backup(normalized));
    }
    None
}

/// Generates `n` distinct backup codes.
pub fn generate_backup_codes(n: usize) -> Vec<String> {
    let mut codes = BTreeSet::new();
    while codes.len() < n {
        codes.insert(generate_code(&mut OsRng));
    }
    codes.into_iter().collect()
}

fn generate_code<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut raw = [0u8; BACKUP_CODE_LEN];
    rng.fill_bytes(&mut raw);
    raw.iter()
        .map(|byte| BACKUP_CODE_ALPHABET[usize::from(*byte) % BACKUP_CODE_ALPHABET.len()] as char)
        .collect()
}

fn pending_key(user_id: Uuid) -> String {
    format!("mfa:pending:{}", user_id)
}

fn secret_key(user_id: Uuid) -> String {
    format!("mfa:secret:{}", user_id)
}

fn backup_key(user_id: Uuid) -> String {
    format!("mfa:backup:{}", user_id)
}

fn secret_aad(user_id: Uuid) -> Vec<u8> {
    format!("mfa-secret:v1|{}", user_id).into_bytes()
}

/// TOTP enrollment, verification and one-time backup codes.
///
/// Secrets are sealed under the master key before they reach the store.
/// Backup codes are stored only as keyed digests.
#[derive(Clone)]
pub struct MfaService {
    store: SharedStore,
    master_key: Arc<SecureKey>,
    issuer: String,
}

impl MfaService {
    pub fn new(store: SharedStore, master_key: Arc<SecureKey>, issuer: impl Into<String>) -> Self {
        Self {
            store,
            master_key,
            issuer: issuer.into(),
        }
    }

    /// Generates a fresh secret and its `otpauth://` URI for `account`.
    pub fn enroll(&self, account: &str) -> Result<Enrollment> {
        let bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| AppError::Internal(format!("Secret generation failed: {}", e)))?;
        let totp = self.totp(bytes, account)?;

        Ok(Enrollment {
            secret: totp.get_secret_base32(),
            provisioning_uri: totp.get_url(),
        })
    }

    /// Checks `code` against `secret` at the current time.
    pub fn verify_code(&self, secret: &str, code: &str) -> bool {
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
        self.verify_code_at(secret, code, now)
    }

    /// Checks `code` against `secret` at `unix_time`, accepting one step of
    /// drift either way.
    pub fn verify_code_at(&self, secret: &str, code: &str, unix_time: u64) -> bool {
        let Some(MfaCode::Totp(code)) = classify_code(code) else {
            return false;
        };
        let Ok(bytes) = Secret::Encoded(secret.to_string()).to_bytes() else {
            return false;
        };
        match self.totp(bytes, "verify") {
            Ok(totp) => totp.check(&code, unix_time),
            Err(_) => false,
        }
    }

    /// Starts enrollment. Replaces any earlier pending enrollment, so the
    /// returned secret is always new.
    pub async fn begin_enrollment(&self, user_id: Uuid, account: &str) -> Result<MfaSetup> {
        let enrollment = self.enroll(account)?;
        let backup_codes = generate_backup_codes(BACKUP_CODE_COUNT);

        let pending = PendingEnrollment {
            sealed_secret: self.seal_secret(user_id, &enrollment.secret)?,
            backup_digests: backup_codes
                .iter()
                .map(|code| self.digest(user_id, code))
                .collect::<Result<_>>()?,
        };
        let json = sonic_rs::to_string(&pending)
            .map_err(|e| AppError::Internal(format!("Enrollment serialization failed: {}", e)))?;
        self.store
            .set(&pending_key(user_id), &json, Some(PENDING_TTL))
            .await?;

        tracing::info!("🔐 MFA enrollment pending for user {}", user_id);
        Ok(MfaSetup {
            secret: enrollment.secret,
            provisioning_uri: enrollment.provisioning_uri,
            backup_codes,
        })
    }

    /// Proves a pending enrollment with its first code. On success the
    /// secret and backup digests become the user's confirmed factor.
    pub async fn confirm(&self, user_id: Uuid, code: &str) -> Result<bool> {
        let Some(json) = self.store.get(&pending_key(user_id)).await? else {
            tracing::debug!("❌ No pending MFA enrollment for user {}", user_id);
            return Ok(false);
        };
        let pending: PendingEnrollment = sonic_rs::from_str(&json).map_err(|e| {
            tracing::error!("❌ Invalid pending enrollment for user {}: {}", user_id, e);
            AppError::Internal("Pending enrollment is unreadable".to_string())
        })?;

        let secret = self.open_secret(user_id, &pending.sealed_secret)?;
        if !self.verify_code(&secret, code) {
            tracing::warn!("❌ MFA confirmation code rejected for user {}", user_id);
            return Ok(false);
        }

        self.store
            .set(
                &secret_key(user_id),
                &pending.sealed_secret.to_json()?,
                None,
            )
            .await?;
        self.replace_backup_digests(user_id, pending.backup_digests)
            .await?;
        self.store.del(&pending_key(user_id)).await?;

        tracing::info!("✅ MFA confirmed for user {}", user_id);
        Ok(true)
    }

    /// Checks a TOTP or backup code against the user's confirmed factor.
    /// A matching backup code is spent.
    pub async fn verify_for_user(&self, user_id: Uuid, code: &str) -> Result<bool> {
        match classify_code(code) {
            Some(MfaCode::Totp(code)) => self.verify_totp_for_user(user_id, &code).await,
            Some(MfaCode::Backup(code)) => self.consume_backup_code(user_id, &code).await,
            None => Ok(false),
        }
    }

    /// Spends a backup code. The removal is one atomic store operation, so two
    /// concurrent attempts with the same code cannot both succeed.
    pub async fn consume_backup_code(&self, user_id: Uuid, code: &str) -> Result<bool> {
        let Some(MfaCode::Backup(code)) = classify_code(code) else {
            return Ok(false);
        };

        let digest = self.digest(user_id, &code)?;
        let consumed = self.store.srem(&backup_key(user_id), &digest).await?;
        if consumed {
            tracing::info!("🔑 Backup code consumed for user {}", user_id);
        } else {
            tracing::warn!("❌ Unknown or spent backup code for user {}", user_id);
        }
        Ok(consumed)
    }

    pub async fn status(&self, user_id: Uuid) -> Result<MfaState> {
        if self.store.get(&secret_key(user_id)).await?.is_some() {
            return Ok(MfaState::Confirmed);
        }
        if self.store.get(&pending_key(user_id)).await?.is_some() {
            return Ok(MfaState::Pending);
        }
        Ok(MfaState::Disabled)
    }

    pub async fn backup_codes_remaining(&self, user_id: Uuid) -> Result<usize> {
        Ok(self.store.smembers(&backup_key(user_id)).await?.len())
    }

    /// Replaces every backup code after proving a current TOTP code. Backup
    /// codes cannot be used to mint new ones. Returns `None` if the code is
    /// rejected.
    pub async fn regenerate_backup_codes(
        &self,
        user_id: Uuid,
        totp_code: &str,
    ) -> Result<Option<Vec<String>>> {
        let Some(MfaCode::Totp(code)) = classify_code(totp_code) else {
            return Ok(None);
        };
        if !self.verify_totp_for_user(user_id, &code).await? {
            return Ok(None);
        }

        let codes = generate_backup_codes(BACKUP_CODE_COUNT);
        let digests = codes
            .iter()
            .map(|code| self.digest(user_id, code))
            .collect::<Result<Vec<_>>>()?;
        self.replace_backup_digests(user_id, digests).await?;

        tracing::info!("🔄 Backup codes regenerated for user {}", user_id);
        Ok(Some(codes))
    }

    /// Forgets every trace of the user's second factor.
    pub async fn teardown(&self, user_id: Uuid) -> Result<()> {
        self.store.del(&secret_key(user_id)).await?;
        self.store.del(&backup_key(user_id)).await?;
        self.store.del(&pending_key(user_id)).await?;
        tracing::info!("🔓 MFA removed for user {}", user_id);
        Ok(())
    }

    async fn verify_totp_for_user(&self, user_id: Uuid, code: &str) -> Result<bool> {
        let Some(json) = self.store.get(&secret_key(user_id)).await? else {
            tracing::warn!("❌ No confirmed MFA secret for user {}", user_id);
            return Ok(false);
        };
        let sealed = Envelope::from_json(&json)?;
        let secret = self.open_secret(user_id, &sealed)?;

        if !self.verify_code(&secret, code) {
            tracing::warn!("❌ TOTP code rejected for user {}", user_id);
            return Ok(false);
        }
        Ok(true)
    }

    async fn replace_backup_digests(&self, user_id: Uuid, digests: Vec<String>) -> Result<()> {
        let key = backup_key(user_id);
        self.store.del(&key).await?;
        self.store.sadd(&key, &digests).await?;
        Ok(())
    }

    fn totp(&self, secret: Vec<u8>, account: &str) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP,
            secret,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| AppError::Internal(format!("TOTP init error: {}", e)))
    }

    fn seal_secret(&self, user_id: Uuid, secret: &str) -> Result<Envelope> {
        aes::seal(&self.master_key, secret.as_bytes(), &secret_aad(user_id))
    }

    fn open_secret(&self, user_id: Uuid, sealed: &Envelope) -> Result<Zeroizing<String>> {
        let bytes = aes::open(&self.master_key, sealed, &secret_aad(user_id)).map_err(|e| {
            tracing::error!("❌ MFA secret for user {} failed to unseal", user_id);
            e
        })?;
        let secret = std::str::from_utf8(&bytes).map_err(|_| AppError::EncryptionFailure)?;
        Ok(Zeroizing::new(secret.to_string()))
    }

    fn digest(&self, user_id: Uuid, code: &str) -> Result<String> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.master_key.as_bytes())
            .map_err(|e| AppError::Internal(format!("HMAC init error: {}", e)))?;
        mac.update(b"backup-code:v1|");
        mac.update(user_id.as_bytes());
        mac.update(code.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> MfaService {
        MfaService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(aes::generate_key()),
            "Escrow Platform",
        )
    }

    fn code_at(secret: &str, unix_time: u64) -> String {
        let bytes = Secret::Encoded(secret.to_string()).to_bytes().unwrap();
        TOTP::new(Algorithm::SHA1, 6, 1, 30, bytes, None, "t".to_string())
            .unwrap()
            .generate(unix_time)
    }

    fn current_code(secret: &str) -> String {
        code_at(secret, Utc::now().timestamp() as u64)
    }

    fn wrong_code(secret: &str) -> String {
        let code = current_code(secret);
        let last = code.as_bytes()[5] - b'0';
        format!("{}{}", &code[..5], (last + 5) % 10)
    }

    #[test]
    fn every_enrollment_gets_a_fresh_secret() {
        let mfa = service();
        let a = mfa.enroll("client@example.com").unwrap();
        let b = mfa.enroll("client@example.com").unwrap();

        assert_ne!(a.secret, b.secret);
        assert!(a.provisioning_uri.starts_with("otpauth://totp/"));
        assert!(a.provisioning_uri.contains("Escrow%20Platform"));
    }

    #[test]
    fn codes_tolerate_one_step_of_drift() {
        let mfa = service();
        let secret = mfa.enroll("a@example.com").unwrap().secret;
        let t = 1_700_000_010;
        let code = code_at(&secret, t);

        assert!(mfa.verify_code_at(&secret, &code, t));
        assert!(mfa.verify_code_at(&secret, &code, t + 30));
        assert!(mfa.verify_code_at(&secret, &code, t - 30));
        assert!(!mfa.verify_code_at(&secret, &code, t + 90));
        assert!(!mfa.verify_code_at(&secret, "abcdef", t));
        assert!(!mfa.verify_code_at("not base32!", &code, t));
    }

    #[test]
    fn backup_codes_are_unique_and_well_formed() {
        let codes = generate_backup_codes(BACKUP_CODE_COUNT);
        let unique: BTreeSet<_> = codes.iter().collect();

        assert_eq!(codes.len(), BACKUP_CODE_COUNT);
        assert_eq!(unique.len(), BACKUP_CODE_COUNT);
        for code in &codes {
            assert!(matches!(classify_code(code), Some(MfaCode::Backup(_))));
        }
    }

    #[test]
    fn classify_normalises_input() {
        assert_eq!(
            classify_code(" 123 456 "),
            Some(MfaCode::Totp("123456".to_string()))
        );
        assert_eq!(
            classify_code("abcd-efgh"),
            Some(MfaCode::Backup("ABCDEFGH".to_string()))
        );
        assert_eq!(classify_code("ABCD-EFG1"), None);
        assert_eq!(classify_code("12345"), None);
    }

    #[tokio::test]
    async fn enrollment_lifecycle() {
        let mfa = service();
        let user = Uuid::new_v4();
        assert_eq!(mfa.status(user).await.unwrap(), MfaState::Disabled);

        let first = mfa.begin_enrollment(user, "u@example.com").await.unwrap();
        assert_eq!(mfa.status(user).await.unwrap(), MfaState::Pending);

        let second = mfa.begin_enrollment(user, "u@example.com").await.unwrap();
        assert_ne!(first.secret, second.secret);

        assert!(!mfa.confirm(user, &wrong_code(&second.secret)).await.unwrap());
        assert_eq!(mfa.status(user).await.unwrap(), MfaState::Pending);

        assert!(mfa.confirm(user, &current_code(&second.secret)).await.unwrap());
        assert_eq!(mfa.status(user).await.unwrap(), MfaState::Confirmed);
        assert_eq!(
            mfa.backup_codes_remaining(user).await.unwrap(),
            BACKUP_CODE_COUNT
        );

        assert!(mfa
            .verify_for_user(user, &current_code(&second.secret))
            .await
            .unwrap());

        mfa.teardown(user).await.unwrap();
        assert_eq!(mfa.status(user).await.unwrap(), MfaState::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_enrollment_expires() {
        let mfa = service();
        let user = Uuid::new_v4();
        let setup = mfa.begin_enrollment(user, "u@example.com").await.unwrap();

        tokio::time::advance(PENDING_TTL + Duration::from_secs(1)).await;

        assert_eq!(mfa.status(user).await.unwrap(), MfaState::Disabled);
        assert!(!mfa.confirm(user, &current_code(&setup.secret)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_factor_outlives_long_idle_periods() {
        let mfa = service();
        let user = Uuid::new_v4();
        let setup = mfa.begin_enrollment(user, "u@example.com").await.unwrap();
        assert!(mfa.confirm(user, &current_code(&setup.secret)).await.unwrap());

        tokio::time::advance(Duration::from_secs(400 * 24 * 3600)).await;

        assert_eq!(mfa.status(user).await.unwrap(), MfaState::Confirmed);
        assert!(mfa.verify_for_user(user, &setup.backup_codes[0]).await.unwrap());
        assert!(mfa
            .verify_for_user(user, &current_code(&setup.secret))
            .await
            .unwrap());
        assert_eq!(
            mfa.backup_codes_remaining(user).await.unwrap(),
            BACKUP_CODE_COUNT - 1
        );
    }

    #[tokio::test]
    async fn backup_codes_are_single_use() {
        let mfa = service();
        let user = Uuid::new_v4();
        let setup = mfa.begin_enrollment(user, "u@example.com").await.unwrap();
        assert!(mfa.confirm(user, &current_code(&setup.secret)).await.unwrap());

        let code = setup.backup_codes[3].clone();
        let dashed = format!("{}-{}", &code[..4], code[4..].to_lowercase());

        assert!(mfa.consume_backup_code(user, &dashed).await.unwrap());
        assert!(!mfa.consume_backup_code(user, &code).await.unwrap());
        assert!(!mfa.verify_for_user(user, &code).await.unwrap());
        assert_eq!(
            mfa.backup_codes_remaining(user).await.unwrap(),
            BACKUP_CODE_COUNT - 1
        );

        let other_user = Uuid::new_v4();
        assert!(!mfa
            .consume_backup_code(other_user, &setup.backup_codes[0])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn regeneration_needs_a_totp_code_and_replaces_everything() {
        let mfa = service();
        let user = Uuid::new_v4();
        let setup = mfa.begin_enrollment(user, "u@example.com").await.unwrap();
        assert!(mfa.confirm(user, &current_code(&setup.secret)).await.unwrap());

        assert!(mfa
            .regenerate_backup_codes(user, &setup.backup_codes[0])
            .await
            .unwrap()
            .is_none());

        let fresh = mfa
            .regenerate_backup_codes(user, &current_code(&setup.secret))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.len(), BACKUP_CODE_COUNT);
        assert!(!mfa
            .consume_backup_code(user, &setup.backup_codes[1])
            .await
            .unwrap());
        assert!(mfa.consume_backup_code(user, &fresh[0]).await.unwrap());
    }

    #[tokio::test]
    async fn store_holds_no_plaintext_secret() {
        let store = MemoryStore::new();
        let mfa = MfaService::new(
            Arc::new(store.clone()),
            Arc::new(aes::generate_key()),
            "Escrow Platform",
        );
        let user = Uuid::new_v4();
        let setup = mfa.begin_enrollment(user, "u@example.com").await.unwrap();

        let raw = crate::store::KvStore::get(&store, &pending_key(user))
            .await
            .unwrap()
            .unwrap();
        assert!(!raw.contains(&setup.secret));
        for code in &setup.backup_codes {
            assert!(!raw.contains(code.as_str()));
        }
    }
}
