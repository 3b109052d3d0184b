use axum::{
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};
use tracing::Level;

use crate::{
    handlers,
    middleware_layer::{auth, rate_limit},
    state::AppState,
};

/// Request bodies larger than this are refused before any handler runs.
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Builds the HTTP surface. Middleware added with `route_layer` runs in
/// reverse order of addition, so each group adds its rate limit last: every
/// request is counted before authentication, rejected ones included.
pub fn router(state: AppState) -> Router {
    let login_routes = Router::new()
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/refresh", post(handlers::auth::refresh))
        .route_layer(from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_auth,
        ))
        .with_state(state.clone());

    let session_routes = Router::new()
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route(
            "/api/auth/sessions",
            get(handlers::auth::list_sessions).delete(handlers::auth::logout_everywhere),
        )
        .route("/api/auth/mfa/status", get(handlers::auth::mfa_status))
        .route_layer(from_fn_with_state(state.clone(), auth::require_auth))
        .route_layer(from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_general,
        ))
        .with_state(state.clone());

    let mfa_routes = Router::new()
        .route("/api/auth/mfa/setup", post(handlers::auth::mfa_setup))
        .route("/api/auth/mfa/confirm", post(handlers::auth::mfa_confirm))
        .route("/api/auth/mfa/disable", post(handlers::auth::mfa_disable))
        .route(
            "/api/auth/mfa/backup-codes",
            post(handlers::auth::mfa_backup_codes),
        )
        .route_layer(from_fn_with_state(state.clone(), auth::require_auth))
        .route_layer(from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_admin,
        ))
        .with_state(state.clone());

    let chat_routes = Router::new()
        .route("/api/chat/{project_id}/seal", post(handlers::chat::seal))
        .route("/api/chat/{project_id}/open", post(handlers::chat::open))
        .route_layer(from_fn(auth::require_mfa))
        .route_layer(from_fn_with_state(state.clone(), auth::require_auth))
        .route_layer(from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_chat,
        ))
        .with_state(state.clone());

    let rotate_routes = Router::new()
        .route("/api/chat/{project_id}/rotate", post(handlers::chat::rotate))
        .route_layer(from_fn(auth::require_mfa))
        .route_layer(from_fn_with_state(state.clone(), auth::require_auth))
        .route_layer(from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_admin,
        ))
        .with_state(state);

    Router::new()
        .merge(login_routes)
        .merge(session_routes)
        .merge(mfa_routes)
        .merge(chat_routes)
        .merge(rotate_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        )
}
