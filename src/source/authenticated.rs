//! Vendor API with device registration and bearer tokens.

use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{endpoint_url, ProxyCredential, ProxySource, VendorSession};
use crate::config::AuthenticatedVendorConfig;
use crate::error::SourceError;
use crate::proxy::{redact_url, ProxyCandidate, ProxyProtocol, SourceKind};

const FREE_TIER: &str = "free";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceDescriptor {
    device_id: String,
    platform: &'static str,
    model: &'static str,
    app_version: String,
}

impl DeviceDescriptor {
    fn synthetic(app_version: &str) -> Self {
        let id: u128 = rand::rng().random();
        Self {
            device_id: format!("{:032x}", id),
            platform: "android",
            model: "Pixel 7",
            app_version: app_version.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    #[serde(default)]
    success: bool,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LocationsResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    locations: Vec<Location>,
}

#[derive(Debug, Deserialize)]
struct Location {
    code: String,
    #[serde(default)]
    tier: String,
}

#[derive(Debug, Serialize)]
struct AllocateRequest<'a> {
    region: &'a str,
    #[serde(rename = "type")]
    server_type: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct AllocateResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct Server {
    #[serde(default)]
    addresses: Vec<String>,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

/// Adapter for a vendor that hands out servers per free-tier region.
pub struct AuthenticatedVendorSource {
    client: Client,
    config: AuthenticatedVendorConfig,
}

impl AuthenticatedVendorSource {
    pub fn new(client: Client, config: AuthenticatedVendorConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn protocol(&self) -> ProxyProtocol {
        ProxyProtocol::from_scheme(&self.config.scheme).unwrap_or(ProxyProtocol::Https)
    }
}

#[async_trait]
impl ProxySource for AuthenticatedVendorSource {
    fn kind(&self) -> SourceKind {
        SourceKind::AuthenticatedVendor
    }

    async fn register(&self) -> Result<VendorSession, SourceError> {
        let response = self
            .client
            .post(self.url("/v1/devices"))
            .json(&DeviceDescriptor::synthetic(&self.config.app_version))
            .send()
            .await
            .map_err(|e| SourceError::Auth(format!("device registration failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(SourceError::Auth(format!(
                "device registration rejected with {}",
                response.status()
            )));
        }

        let body: RegisterResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Auth(format!("malformed registration response: {}", e)))?;

        match body.access_token {
            Some(token) if body.success && !token.is_empty() => {
                info!("Registered device with authenticated vendor");
                Ok(VendorSession::new(token, body.expires_in.map(Duration::from_secs)))
            }
            _ => Err(SourceError::Auth("registration returned no access token".to_string())),
        }
    }

    async fn list_candidates(
        &self,
        session: &VendorSession,
    ) -> Result<Vec<ProxyCandidate>, SourceError> {
        let body: LocationsResponse = self
            .client
            .get(self.url("/v1/locations"))
            .bearer_auth(session.access_token())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !body.success {
            return Err(SourceError::Upstream("location listing unsuccessful".to_string()));
        }

        let protocol = self.protocol();
        let regions: Vec<ProxyCandidate> = body
            .locations
            .into_iter()
            .filter(|l| l.tier.eq_ignore_ascii_case(FREE_TIER))
            .map(|l| ProxyCandidate::region(l.code, protocol, SourceKind::AuthenticatedVendor))
            .collect();

        if regions.is_empty() {
            return Err(SourceError::NoFreeRegions);
        }
        info!("Authenticated vendor offers {} free regions", regions.len());
        Ok(regions)
    }

    async fn acquire_endpoint(
        &self,
        session: &VendorSession,
        candidate: &ProxyCandidate,
    ) -> Result<Option<String>, SourceError> {
        let response = self
            .client
            .post(self.url("/v1/servers"))
            .bearer_auth(session.access_token())
            .json(&AllocateRequest {
                region: &candidate.key,
                server_type: &self.config.server_type,
            })
            .send()
            .await?
            .error_for_status()?;

        // An empty body means no capacity.
        let text = response.text().await?;
        let body: AllocateResponse = if text.trim().is_empty() {
            AllocateResponse::default()
        } else {
            serde_json::from_str(&text).map_err(|e| SourceError::Malformed(e.to_string()))?
        };

        let server = if body.success { body.servers.into_iter().next() } else { None };
        let Some(server) = server else {
            debug!("No server capacity in region {}", candidate.key);
            return Ok(None);
        };
        let Some(address) = server.addresses.first() else {
            debug!("Server in region {} has no address", candidate.key);
            return Ok(None);
        };

        let credential = server.username.map(|username| ProxyCredential {
            username,
            password: server.password.unwrap_or_default(),
        });

        let endpoint = endpoint_url(&self.config.scheme, address, server.port, credential.as_ref());
        if let Some(endpoint) = &endpoint {
            debug!("Allocated {} in region {}", redact_url(endpoint), candidate.key);
        }
        Ok(endpoint)
    }
}
