use serde::{Deserialize, Serialize};

use crate::crypto::aes::Envelope;

/// Where an account's second factor stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MfaState {
    /// A secret was issued but never proven.
    Pending,
    /// The secret was proven with a valid code and is in force.
    Confirmed,
    /// No second factor.
    Disabled,
}

/// A freshly generated TOTP secret.
#[derive(Debug, Clone)]
pub struct Enrollment {
    /// Base32 secret for manual entry into an authenticator.
    pub secret: String,
    /// `otpauth://` URI for QR rendering.
    pub provisioning_uri: String,
}

/// What a user sees once, right after starting enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct MfaSetup {
    pub secret: String,
    pub provisioning_uri: String,
    pub backup_codes: Vec<String>,
}

/// The pending record cached while enrollment is unproven.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PendingEnrollment {
    pub sealed_secret: Envelope,
    pub backup_digests: Vec<String>,
}
