use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::store::StoreError;

/// The application's error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Unknown email or wrong password.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The session exists but has not completed its second factor.
    #[error("MFA verification required")]
    MfaRequired,

    /// The supplied TOTP or backup code did not verify.
    #[error("Invalid MFA code")]
    InvalidMfaCode,

    /// Bad signature, expired, wrong issuer/audience, wrong token kind, or a
    /// token whose session no longer exists.
    #[error("Token invalid")]
    TokenInvalid,

    /// A fixed-window counter is over its limit.
    #[error("Rate limit exceeded")]
    RateLimited {
        /// The window's request ceiling.
        limit: u32,
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// Missing key, corrupt envelope or authentication tag mismatch.
    #[error("Encryption failure")]
    EncryptionFailure,

    /// The referenced session is absent from the store.
    #[error("Session not found")]
    SessionNotFound,

    /// A shared-store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A database error.
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// A connection pool error.
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Whether this error belongs to the authentication class that is always
    /// reported to callers with the same generic body.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            AppError::InvalidCredentials
                | AppError::InvalidMfaCode
                | AppError::TokenInvalid
                | AppError::SessionNotFound
        )
    }
}

/// The outcome of an operation that may fall back to a safe default when the
/// shared store misbehaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checked<T> {
    /// The store answered; the value reflects shared state.
    Live(T),
    /// The store failed; the value is the documented safe default.
    Degraded(T),
}

impl<T> Checked<T> {
    /// Returns the carried value regardless of how it was obtained.
    pub fn into_inner(self) -> T {
        match self {
            Checked::Live(value) | Checked::Degraded(value) => value,
        }
    }

    /// Borrows the carried value.
    pub fn value(&self) -> &T {
        match self {
            Checked::Live(value) | Checked::Degraded(value) => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Checked::Degraded(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut retry_after = None;

        let (status, message) = match self {
            ref e if e.is_auth_rejection() => {
                tracing::warn!("Authentication rejected: {}", e);
                (StatusCode::UNAUTHORIZED, "Authentication failed".to_string())
            }

            AppError::MfaRequired => {
                tracing::debug!("MFA verification required");
                (StatusCode::FORBIDDEN, "MFA verification required".to_string())
            }

            AppError::RateLimited {
                limit,
                retry_after_secs,
            } => {
                tracing::warn!("Rate limit exceeded (limit {})", limit);
                retry_after = Some(retry_after_secs);
                (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string())
            }

            AppError::EncryptionFailure => {
                tracing::warn!("Envelope operation failed");
                (StatusCode::BAD_REQUEST, "Decryption failed".to_string())
            }

            AppError::Store(ref e) => {
                tracing::error!("Store error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable".to_string(),
                )
            }

            AppError::Database(ref e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }

            AppError::Pool(ref e) => {
                tracing::error!("Pool error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }

            AppError::Validation(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }

            // covered by the guard arm above
            AppError::InvalidCredentials
            | AppError::InvalidMfaCode
            | AppError::TokenInvalid
            | AppError::SessionNotFound => {
                (StatusCode::UNAUTHORIZED, "Authentication failed".to_string())
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());

        let mut response = (
            status,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            body,
        )
            .into_response();

        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
