//! Trust core of an escrow platform: bearer tokens bound to server-side
//! sessions, TOTP second factor with one-time backup codes, fixed-window
//! rate limiting and layered chat envelope encryption, all backed by one
//! shared TTL store.

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod store;

pub mod crypto {
    pub mod aes;
    pub mod envelope;
    pub mod keyring;
}

pub mod models {
    pub mod mfa;
    pub mod session;
    pub mod token;
    pub mod user;
}

pub mod repositories {
    pub mod user;
}

pub mod services {
    pub mod auth;
    pub mod chat;
    pub mod mfa;
    pub mod rate_limit;
    pub mod session;
    pub mod token;
}

pub mod handlers {
    pub mod auth;
    pub mod chat;
}

pub mod middleware_layer {
    pub mod auth;
    pub mod rate_limit;
}

pub mod validation {
    pub mod auth;
}
