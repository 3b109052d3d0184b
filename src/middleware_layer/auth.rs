use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::Response,
    Extension,
};

use crate::{error::AppError, services::token::AuthContext, state::AppState};

/// Extracts the bearer token from the `Authorization` header.
///
/// # Arguments
///
/// * `request` - The incoming request.
///
/// # Returns
///
/// An `Option` containing the token if the header is well-formed.
pub(crate) fn extract_bearer(request: &Request<Body>) -> Option<&str> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// A middleware that requires a valid bearer token whose session still
/// exists. The verified [`AuthContext`] is attached to the request.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `request` - The incoming request.
/// * `next` - The next middleware in the chain.
///
/// # Returns
///
/// A `Response` or an `AppError`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    tracing::debug!("🔐 Checking authentication...");

    let token = extract_bearer(&request).ok_or_else(|| {
        tracing::warn!("❌ No bearer token found");
        AppError::TokenInvalid
    })?;

    let ctx = state.auth.tokens().authenticate(token).await?;
    tracing::debug!(
        "✅ Authenticated user {} via session {}",
        ctx.claims.sub,
        ctx.claims.sid
    );

    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

/// A middleware for routes carrying sensitive content: a session of an
/// account with MFA must have completed its second factor. Runs after
/// [`require_auth`].
pub async fn require_mfa(
    Extension(ctx): Extension<AuthContext>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let session = &ctx.session;
    if session.mfa_enabled && !session.mfa_verified {
        tracing::warn!(
            "❌ Session {} has not completed MFA",
            session.session_id
        );
        return Err(AppError::MfaRequired);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(authorization: &str) -> Request<Body> {
        Request::builder()
            .header(header::AUTHORIZATION, authorization)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(extract_bearer(&request("Bearer abc.def")), Some("abc.def"));
        assert_eq!(extract_bearer(&request("bearer  abc")), Some("abc"));
        assert_eq!(extract_bearer(&request("Basic abc")), None);
        assert_eq!(extract_bearer(&request("Bearer ")), None);
        assert_eq!(extract_bearer(&Request::new(Body::empty())), None);
    }
}
