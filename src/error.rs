//! Crate-wide error type.
//!
//! Covers configuration, network, DNS, plugin, and validation failures via
//! `thiserror`. Used internally by the transaction state machine and its
//! collaborators; converted to `pingora_error::Error` at the `ProxyHttp`
//! boundary in `service/http.rs`, which already expects a
//! `pingora_error::Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoomError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("upstream selection failed: {0}")]
    UpstreamSelection(String),

    #[error("route matching failed: {0}")]
    RouteMatching(String),

    #[error("pingora error: {0}")]
    Pingora(#[from] Box<pingora_error::Error>),
}

impl LoomError {
    pub fn config(msg: impl Into<String>) -> Self {
        LoomError::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        LoomError::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, LoomError>;

impl From<LoomError> for Box<pingora_error::Error> {
    fn from(err: LoomError) -> Self {
        match err {
            LoomError::Pingora(e) => e,
            other => Box::new(pingora_error::Error::new_str(&other.to_string())),
        }
    }
}
