//! Vendor API with anonymous registration and signed proxy handshakes.
//!
//! Registration yields an identity token, which is exchanged for a security
//! token. Every later step is fail-soft: a missing region, server, address or
//! credential ends the chain with `Ok(None)`.

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::seq::IndexedRandom;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{endpoint_url, ProxyCredential, ProxySource, VendorSession};
use crate::config::AnonymousVendorConfig;
use crate::error::SourceError;
use crate::proxy::{ProxyCandidate, ProxyProtocol, SourceKind};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientDescriptor {
    client_type: &'static str,
    client_version: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityResponse {
    identity_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    identity_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    security_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Directory {
    #[serde(default)]
    countries: Vec<Country>,
}

#[derive(Debug, Deserialize)]
struct Country {
    code: Option<String>,
    #[serde(default)]
    servers: Vec<DirectoryServer>,
}

#[derive(Debug, Deserialize)]
struct DirectoryServer {
    #[serde(default)]
    addresses: Vec<DirectoryAddress>,
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DirectoryAddress {
    ip: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Serialize)]
struct CredentialRequest<'a> {
    signature: &'a str,
}

#[derive(Debug, Deserialize)]
struct CredentialResponse {
    username: Option<String>,
    password: Option<String>,
}

/// Adapter for a vendor that publishes a server directory per country.
pub struct AnonymousVendorSource {
    client: Client,
    config: AnonymousVendorConfig,
}

impl AnonymousVendorSource {
    pub fn new(client: Client, config: AnonymousVendorConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn protocol(&self) -> ProxyProtocol {
        ProxyProtocol::from_scheme(&self.config.scheme).unwrap_or(ProxyProtocol::Https)
    }

    async fn fetch_directory(&self, session: &VendorSession) -> Result<Directory, SourceError> {
        Ok(self
            .client
            .get(self.url("/v2/directory"))
            .bearer_auth(session.access_token())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Region to use: the explicit target or a random preferred one, or the
    /// first available region when that choice is not offered. The region in
    /// `exclude` is skipped unless it is the only one left.
    fn pick_region(
        &self,
        available: &[ProxyCandidate],
        exclude: Option<&str>,
    ) -> Option<ProxyCandidate> {
        let mut eligible: Vec<&ProxyCandidate> = available
            .iter()
            .filter(|c| exclude != Some(c.key.as_str()))
            .collect();
        if eligible.is_empty() {
            eligible = available.iter().collect();
        }

        let preferred: Vec<&String> = self
            .config
            .preferred_regions
            .iter()
            .filter(|code| !exclude.is_some_and(|key| key.eq_ignore_ascii_case(code.as_str())))
            .collect();
        let wanted = match &self.config.target_region {
            Some(target) => Some(target),
            None => preferred.choose(&mut rand::rng()).copied(),
        };
        wanted
            .and_then(|code| eligible.iter().find(|c| c.key.eq_ignore_ascii_case(code)))
            .or_else(|| eligible.first())
            .map(|c| (*c).clone())
    }

    async fn exchange_signature(
        &self,
        session: &VendorSession,
        signature: &str,
    ) -> Result<Option<ProxyCredential>, SourceError> {
        let body: CredentialResponse = self
            .client
            .post(self.url("/v2/credential"))
            .bearer_auth(session.access_token())
            .json(&CredentialRequest { signature })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(match (body.username, body.password) {
            (Some(username), Some(password)) => Some(ProxyCredential { username, password }),
            _ => None,
        })
    }

    fn regions(&self, directory: Directory) -> Vec<ProxyCandidate> {
        let protocol = self.protocol();
        directory
            .countries
            .into_iter()
            .filter(|c| !c.servers.is_empty())
            .filter_map(|c| c.code)
            .map(|code| ProxyCandidate::region(code, protocol, SourceKind::AnonymousVendor))
            .collect()
    }
}

#[async_trait]
impl ProxySource for AnonymousVendorSource {
    fn kind(&self) -> SourceKind {
        SourceKind::AnonymousVendor
    }

    async fn register(&self) -> Result<VendorSession, SourceError> {
        let identity: IdentityResponse = self
            .client
            .post(self.url("/v2/register"))
            .json(&ClientDescriptor {
                client_type: "browser-extension",
                client_version: "2.1.0",
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::Auth(format!("anonymous registration failed: {}", e)))?
            .json()
            .await
            .map_err(|e| SourceError::Auth(format!("malformed registration response: {}", e)))?;

        let identity_token = identity
            .identity_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SourceError::Auth("registration returned no identity token".to_string()))?;

        let token: TokenResponse = self
            .client
            .post(self.url("/v2/token"))
            .json(&TokenRequest {
                identity_token: &identity_token,
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::Auth(format!("security token exchange failed: {}", e)))?
            .json()
            .await
            .map_err(|e| SourceError::Auth(format!("malformed token response: {}", e)))?;

        let security_token = token
            .security_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SourceError::Auth("token exchange returned no security token".to_string()))?;

        info!("Registered with anonymous vendor");
        Ok(VendorSession::new(security_token, None))
    }

    async fn list_candidates(
        &self,
        session: &VendorSession,
    ) -> Result<Vec<ProxyCandidate>, SourceError> {
        let regions = self.regions(self.fetch_directory(session).await?);
        info!("Anonymous vendor directory lists {} regions", regions.len());
        Ok(regions)
    }

    async fn acquire_endpoint(
        &self,
        session: &VendorSession,
        candidate: &ProxyCandidate,
    ) -> Result<Option<String>, SourceError> {
        let directory = self.fetch_directory(session).await?;

        let Some(country) = directory
            .countries
            .into_iter()
            .find(|c| c.code.as_deref().is_some_and(|code| code.eq_ignore_ascii_case(&candidate.key)))
        else {
            debug!("Region {} is no longer in the directory", candidate.key);
            return Ok(None);
        };
        let Some(server) = country.servers.into_iter().next() else {
            debug!("Region {} has no servers", candidate.key);
            return Ok(None);
        };
        let Some((ip, port)) = server
            .addresses
            .into_iter()
            .find_map(|a| Some((a.ip?, a.port?)))
        else {
            debug!("Server in region {} has no usable address", candidate.key);
            return Ok(None);
        };

        let credential = match server.signature.as_deref() {
            Some(signature) => match self.exchange_signature(session, signature).await? {
                Some(credential) => {
                    session.set_proxy_credential(credential.clone());
                    Some(credential)
                }
                None => {
                    debug!("Signed handshake for region {} returned no credential", candidate.key);
                    return Ok(None);
                }
            },
            None => None,
        };

        Ok(endpoint_url(&self.config.scheme, &ip, port, credential.as_ref()))
    }

    /// Re-derive one fresh candidate from the current directory.
    async fn rotation_candidates(
        &self,
        session: &VendorSession,
        known: Vec<ProxyCandidate>,
        exclude: Option<&str>,
    ) -> Vec<ProxyCandidate> {
        let available = match self.fetch_directory(session).await {
            Ok(directory) => self.regions(directory),
            Err(e) => {
                warn!("Directory refresh failed, using known regions: {}", e);
                known
            }
        };
        self.pick_region(&available, exclude).into_iter().collect()
    }
}
