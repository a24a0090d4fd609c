//! Error types for the reqwest-egress-pool crate.

use std::time::Duration;
use thiserror::Error;

/// Error returned when no healthy proxy is available in the pool.
#[derive(Debug, Error)]
#[error("No proxy available in pool")]
pub struct NoProxyAvailable;

/// Errors raised by a proxy source adapter.
///
/// Only registration and the initial listing are fatal; every later failure
/// is absorbed by the pool and degrades to "no proxy".
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Registration or token exchange was rejected or malformed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The vendor offered no free-tier region.
    #[error("No free regions available")]
    NoFreeRegions,

    /// A vendor or list endpoint could not be reached.
    #[error("Upstream request failed: {0}")]
    Upstream(String),

    /// A vendor response did not have the expected shape.
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::Malformed(err.to_string())
        } else {
            SourceError::Upstream(err.to_string())
        }
    }
}

/// Errors seen by callers of the resilient client.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The underlying send failed.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A single attempt exceeded the configured timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The request body is a stream and cannot be replayed.
    #[error("Request object is not cloneable. Are you passing a streaming body?")]
    RequestNotCloneable,

    /// Any other failure raised inside the middleware chain.
    #[error(transparent)]
    Middleware(anyhow::Error),
}

impl From<reqwest_middleware::Error> for FetchError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(e) => FetchError::Transport(e),
            reqwest_middleware::Error::Middleware(e) => match e.downcast::<FetchError>() {
                Ok(fetch) => fetch,
                Err(other) => FetchError::Middleware(other),
            },
        }
    }
}
