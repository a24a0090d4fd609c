//! Health probing of candidate endpoints against a canary URL.

use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use crate::config::{ProbeMode, ProxyPoolConfig};
use crate::proxy::{redact_url, ProxyTarget};

/// Checks whether an endpoint can reach the network.
///
/// Implementations never fail: every problem is reported as `false`.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, endpoint: &str) -> bool;
}

/// Probes endpoints with one reqwest GET to a canary URL.
#[derive(Debug, Clone)]
pub struct HealthProber {
    canary_url: String,
    timeout: Duration,
    mode: ProbeMode,
}

impl HealthProber {
    pub fn new(canary_url: impl Into<String>, timeout: Duration, mode: ProbeMode) -> Self {
        Self {
            canary_url: canary_url.into(),
            timeout,
            mode,
        }
    }

    pub fn from_config(config: &ProxyPoolConfig) -> Self {
        Self::new(config.canary_url.clone(), config.probe_timeout, config.probe_mode)
    }
}

#[async_trait]
impl Probe for HealthProber {
    async fn probe(&self, endpoint: &str) -> bool {
        let proxy = match ProxyTarget::parse(endpoint).to_reqwest_proxy() {
            Ok(proxy) => proxy,
            Err(e) => {
                debug!("Unusable proxy {}: {}", redact_url(endpoint), e);
                return false;
            }
        };

        // The client, and with it the proxied connection, is dropped when
        // this function returns on any path.
        let client = match reqwest::Client::builder()
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .proxy(proxy)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                debug!("Failed to build probe client for {}: {}", redact_url(endpoint), e);
                return false;
            }
        };

        match client.get(&self.canary_url).send().await {
            Ok(resp) if self.mode.accepts(resp.status()) => {
                if !self.mode.requires_body() {
                    return true;
                }
                match resp.text().await {
                    Ok(body) if !body.trim().is_empty() => true,
                    Ok(_) => {
                        debug!("Probe through {} returned an empty body", redact_url(endpoint));
                        false
                    }
                    Err(e) => {
                        debug!("Probe through {} body failed: {}", redact_url(endpoint), e);
                        false
                    }
                }
            }
            Ok(resp) => {
                debug!("Probe through {} answered {}", redact_url(endpoint), resp.status());
                false
            }
            Err(e) => {
                debug!("Probe through {} failed: {}", redact_url(endpoint), e);
                false
            }
        }
    }
}
