//! The one entry point every outbound call goes through.

use reqwest::{IntoUrl, Method};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use std::sync::Arc;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::middleware::{EgressMiddleware, EgressOverride};
use crate::pool::ProxyPool;

/// An HTTP client that sends through [`EgressMiddleware`].
#[derive(Clone)]
pub struct ResilientClient {
    inner: ClientWithMiddleware,
    pool: Option<Arc<ProxyPool>>,
}

impl ResilientClient {
    /// Build a client around a default `reqwest::Client`.
    pub fn new(config: FetchConfig, pool: Option<Arc<ProxyPool>>) -> Self {
        Self::with_client(reqwest::Client::new(), config, pool)
    }

    /// Build a client around `client`, used for calls without an egress
    /// override.
    pub fn with_client(
        client: reqwest::Client,
        config: FetchConfig,
        pool: Option<Arc<ProxyPool>>,
    ) -> Self {
        let inner = ClientBuilder::new(client)
            .with(EgressMiddleware::new(config, pool.clone()))
            .build();
        Self { inner, pool }
    }

    /// The pool backing auto-rotation, if any.
    pub fn pool(&self) -> Option<&Arc<ProxyPool>> {
        self.pool.as_ref()
    }

    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.inner.get(url)
    }

    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        self.inner.request(method, url)
    }

    /// Send `request`, optionally through a one-off egress.
    pub async fn send(
        &self,
        request: reqwest::Request,
        egress: Option<EgressOverride>,
    ) -> Result<reqwest::Response, FetchError> {
        let mut extensions = http::Extensions::new();
        if let Some(egress) = egress {
            extensions.insert(egress);
        }
        self.inner
            .execute_with_extensions(request, &mut extensions)
            .await
            .map_err(FetchError::from)
    }
}
