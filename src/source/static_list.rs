//! Plaintext proxy lists.

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;

use super::{ProxySource, VendorSession};
use crate::config::StaticListConfig;
use crate::error::SourceError;
use crate::proxy::{redact_url, ProxyCandidate, ProxyProtocol, SourceKind};

/// Fetches an HTTP list and a SOCKS5 list of `host:port` lines.
pub struct StaticListSource {
    client: Client,
    config: StaticListConfig,
}

impl StaticListSource {
    pub fn new(client: Client, config: StaticListConfig) -> Self {
        Self { client, config }
    }

    async fn fetch_tagged(&self, source: &str, protocol: ProxyProtocol) -> Vec<ProxyCandidate> {
        match fetch_proxies_from_source(&self.client, source).await {
            Ok(content) => {
                let candidates = parse_proxy_list(&content, protocol);
                info!(
                    "Fetched {} {} proxies from {}",
                    candidates.len(),
                    protocol.scheme(),
                    redact_url(source)
                );
                candidates
            }
            Err(e) => {
                warn!("Failed to fetch proxies from {}: {}", redact_url(source), e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl ProxySource for StaticListSource {
    fn kind(&self) -> SourceKind {
        SourceKind::StaticList
    }

    async fn register(&self) -> Result<VendorSession, SourceError> {
        Ok(VendorSession::anonymous())
    }

    async fn list_candidates(
        &self,
        _session: &VendorSession,
    ) -> Result<Vec<ProxyCandidate>, SourceError> {
        let (mut http, socks5) = futures::join!(
            self.fetch_tagged(&self.config.http_list, ProxyProtocol::Http),
            self.fetch_tagged(&self.config.socks5_list, ProxyProtocol::Socks5),
        );
        http.extend(socks5);
        Ok(http)
    }

    async fn acquire_endpoint(
        &self,
        _session: &VendorSession,
        candidate: &ProxyCandidate,
    ) -> Result<Option<String>, SourceError> {
        Ok(candidate.endpoint.clone())
    }
}

/// Fetch the raw text of a list from a URL or file path.
async fn fetch_proxies_from_source(client: &Client, source: &str) -> Result<String, SourceError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = client.get(source).send().await?.error_for_status()?;
        Ok(response.text().await?)
    } else {
        tokio::fs::read_to_string(source)
            .await
            .map_err(|e| SourceError::Upstream(format!("{}: {}", source, e)))
    }
}

/// Parse newline-delimited proxies, tagging bare `host:port` lines with
/// `protocol`. Lines with their own scheme keep it and are tagged by it.
/// Blank lines and `#` comments are dropped.
pub fn parse_proxy_list(content: &str, protocol: ProxyProtocol) -> Vec<ProxyCandidate> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            if line.contains("://") {
                let tagged = ProxyProtocol::from_endpoint(line).unwrap_or(protocol);
                ProxyCandidate::endpoint(line, tagged, SourceKind::StaticList)
            } else {
                let url = format!("{}://{}", protocol.scheme(), line);
                ProxyCandidate::endpoint(url, protocol, SourceKind::StaticList)
            }
        })
        .collect()
}
