use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use uuid::Uuid;

use crate::{
    error::AppError,
    middleware_layer::auth::extract_bearer,
    services::rate_limit::{resolve_identifier, RateLimitAction, RateLimitDecision},
    state::AppState,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// The identifier a request was counted under, for handlers that reset
/// their counter (successful login).
#[derive(Debug, Clone)]
pub struct RateLimitIdentity(pub String);

/// Extracts the real IP address from the request extensions.
///
/// # Arguments
///
/// * `req` - The incoming request.
///
/// # Returns
///
/// The peer IP address, if the server exposed it.
fn extract_real_ip(req: &Request<Body>) -> Option<std::net::IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
}

fn write_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_at.timestamp()),
    );
}

/// The user behind a correctly signed bearer token. Only the signature and
/// claims are checked; the session lookup is left to `require_auth`, so
/// rejected tokens are still counted against the peer address.
fn bearer_subject(state: &AppState, req: &Request<Body>) -> Option<Uuid> {
    let token = extract_bearer(req)?;
    state.auth.tokens().verify(token).ok().map(|claims| claims.sub)
}

/// Counts the request against `action`'s window and either forwards it or
/// answers 429. Runs ahead of authentication; the token's user is preferred
/// over the peer address.
async fn enforce(
    state: AppState,
    action: RateLimitAction,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let identifier = resolve_identifier(bearer_subject(&state, &req), extract_real_ip(&req));

    let checked = state.limiter.check(action, &identifier).await;
    let decision = *checked.value();

    if !decision.allowed {
        let mut response = AppError::RateLimited {
            limit: decision.limit,
            retry_after_secs: decision.resets_in.as_secs().max(1),
        }
        .into_response();
        write_headers(response.headers_mut(), &decision);
        return response;
    }

    req.extensions_mut().insert(RateLimitIdentity(identifier));
    let mut response = next.run(req).await;
    write_headers(response.headers_mut(), &decision);
    response
}

/// Login and token refresh.
pub async fn rate_limit_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    enforce(state, RateLimitAction::Auth, req, next).await
}

/// Chat sealing and opening.
pub async fn rate_limit_chat(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    enforce(state, RateLimitAction::Chat, req, next).await
}

/// MFA management and key rotation.
pub async fn rate_limit_admin(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    enforce(state, RateLimitAction::Admin, req, next).await
}

/// Everything else behind a bearer token.
pub async fn rate_limit_general(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    enforce(state, RateLimitAction::General, req, next).await
}
