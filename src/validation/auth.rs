use crate::error::{AppError, Result};
use crate::services::mfa::{classify_code, MfaCode};

/// Validates an email address.
///
/// # Arguments
///
/// * `email` - The email to validate.
///
/// # Returns
///
/// A `Result<()>` indicating whether the email is acceptable.
pub fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() || email.len() > 254 {
        return Err(AppError::Validation(
            "Email must be between 1 and 254 characters".to_string(),
        ));
    }

    let Some((local, domain)) = email.split_once('@') else {
        return Err(AppError::Validation("Email must contain '@'".to_string()));
    };

    if local.is_empty() || domain.len() < 3 || !domain.contains('.') || domain.contains('@') {
        return Err(AppError::Validation("Email is malformed".to_string()));
    }

    if email.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AppError::Validation(
            "Email cannot contain whitespace".to_string(),
        ));
    }

    Ok(())
}

/// Validates a password.
///
/// # Arguments
///
/// * `password` - The password to validate.
///
/// # Returns
///
/// A `Result<()>` indicating whether the password is valid.
pub fn validate_password(password: &str) -> Result<()> {
    if password.len() < 8 {
        return Err(AppError::Validation(
            "Password must be at least 8 characters long".to_string(),
        ));
    }

    if password.len() > 128 {
        return Err(AppError::Validation(
            "Password must be at most 128 characters".to_string(),
        ));
    }

    Ok(())
}

/// Accepts a 6-digit TOTP code or an 8-character backup code. Dashes and
/// spaces are tolerated.
pub fn validate_mfa_code(code: &str) -> Result<MfaCode> {
    classify_code(code).ok_or_else(|| {
        AppError::Validation(
            "MFA code must be a 6-digit code or an 8-character backup code".to_string(),
        )
    })
}

/// Project ids become part of store keys and AAD strings.
pub fn validate_project_id(project_id: &str) -> Result<()> {
    if project_id.is_empty() || project_id.len() > 128 {
        return Err(AppError::Validation(
            "Project id must be between 1 and 128 characters".to_string(),
        ));
    }

    if !project_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::Validation(
            "Project id can only contain letters, numbers, underscores, and hyphens".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails() {
        assert!(validate_email("client@example.com").is_ok());
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("a@b").is_err());
        assert!(validate_email("a b@example.com").is_err());
    }

    #[test]
    fn passwords() {
        assert!(validate_password("long enough").is_ok());
        assert!(validate_password("short").is_err());
        assert!(validate_password(&"x".repeat(129)).is_err());
    }

    #[test]
    fn mfa_codes() {
        assert_eq!(
            validate_mfa_code("123-456").unwrap(),
            MfaCode::Totp("123456".to_string())
        );
        assert!(matches!(
            validate_mfa_code("k7m2 q9xz").unwrap(),
            MfaCode::Backup(_)
        ));
        assert!(validate_mfa_code("12345").is_err());
        assert!(validate_mfa_code("").is_err());
    }

    #[test]
    fn project_ids() {
        assert!(validate_project_id("escrow-42_a").is_ok());
        assert!(validate_project_id("").is_err());
        assert!(validate_project_id("a|b").is_err());
        assert!(validate_project_id("../etc").is_err());
    }
}
