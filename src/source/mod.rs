//! Proxy source adapters.
//!
//! Each adapter acquires candidate egress endpoints from one kind of
//! provider. The pool picks exactly one adapter at construction time and
//! talks to it only through [`ProxySource`].

mod anonymous;
mod authenticated;
mod static_list;

pub use anonymous::AnonymousVendorSource;
pub use authenticated::AuthenticatedVendorSource;
pub use static_list::{parse_proxy_list, StaticListSource};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{RotationStrategy, SourceConfig};
use crate::error::SourceError;
use crate::proxy::{ProxyCandidate, SourceKind};

/// Credentials scoped to a single proxy server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCredential {
    pub username: String,
    pub password: String,
}

/// Authentication state of one adapter.
#[derive(Debug)]
pub struct VendorSession {
    access_token: String,
    expires_at: Option<Instant>,
    proxy_credential: Mutex<Option<ProxyCredential>>,
}

impl VendorSession {
    pub fn new(access_token: impl Into<String>, expires_in: Option<Duration>) -> Self {
        Self {
            access_token: access_token.into(),
            // A lifetime too large to represent never expires.
            expires_at: expires_in.and_then(|ttl| Instant::now().checked_add(ttl)),
            proxy_credential: Mutex::new(None),
        }
    }

    /// A session for sources that need no authentication.
    pub fn anonymous() -> Self {
        Self::new(String::new(), None)
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Whether the access token has passed its expiry.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// The credential from the most recent signed handshake.
    pub fn proxy_credential(&self) -> Option<ProxyCredential> {
        self.proxy_credential.lock().clone()
    }

    pub fn set_proxy_credential(&self, credential: ProxyCredential) {
        *self.proxy_credential.lock() = Some(credential);
    }
}

/// A provider of candidate egress endpoints.
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Which kind of provider this is.
    fn kind(&self) -> SourceKind;

    /// Authenticate with the provider.
    async fn register(&self) -> Result<VendorSession, SourceError>;

    /// List the candidates currently offered.
    async fn list_candidates(
        &self,
        session: &VendorSession,
    ) -> Result<Vec<ProxyCandidate>, SourceError>;

    /// Resolve the endpoint URL of a candidate. `Ok(None)` means the provider
    /// has nothing to offer for it right now.
    async fn acquire_endpoint(
        &self,
        session: &VendorSession,
        candidate: &ProxyCandidate,
    ) -> Result<Option<String>, SourceError>;

    /// Candidates to try, in order, during one rotation pass. `exclude` is
    /// the key of the candidate being rotated away from; the pool defers it
    /// itself, so returning it is allowed.
    async fn rotation_candidates(
        &self,
        _session: &VendorSession,
        mut known: Vec<ProxyCandidate>,
        _exclude: Option<&str>,
    ) -> Vec<ProxyCandidate> {
        known.shuffle(&mut rand::rng());
        known
    }

    /// Rotation strategy used when the configuration does not force one.
    fn default_strategy(&self) -> RotationStrategy {
        match self.kind() {
            SourceKind::StaticList => RotationStrategy::HealthTable,
            SourceKind::AuthenticatedVendor | SourceKind::AnonymousVendor => {
                RotationStrategy::SwapOnFailure
            }
        }
    }
}

/// Build the adapter selected by `config`.
pub fn build_source(config: &SourceConfig) -> Arc<dyn ProxySource> {
    let client = reqwest::Client::new();
    match config {
        SourceConfig::AuthenticatedVendor(c) => {
            Arc::new(AuthenticatedVendorSource::new(client, c.clone()))
        }
        SourceConfig::AnonymousVendor(c) => Arc::new(AnonymousVendorSource::new(client, c.clone())),
        SourceConfig::StaticList(c) => Arc::new(StaticListSource::new(client, c.clone())),
    }
}

/// Build an endpoint URL with percent-encoded credentials in its authority.
pub(crate) fn endpoint_url(
    scheme: &str,
    host: &str,
    port: u16,
    credential: Option<&ProxyCredential>,
) -> Option<String> {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    let mut url = url::Url::parse(&format!("{}://{}:{}", scheme, host, port)).ok()?;
    if let Some(credential) = credential {
        url.set_username(&credential.username).ok()?;
        url.set_password(Some(&credential.password)).ok()?;
    }
    Some(url.to_string().trim_end_matches('/').to_string())
}
