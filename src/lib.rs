//! # reqwest-egress-pool
//!
//! Verified, rotating egress paths for reqwest.
//!
//! This library acquires candidate proxies from vendor APIs or plaintext
//! lists, probes them against a canary URL, keeps one active endpoint, and
//! sends requests through it with backoff retries and a single retry after
//! rotating away from a failing endpoint.

pub mod client;
pub mod config;
pub mod error;
pub mod middleware;
pub mod pool;
pub mod probe;
pub mod proxy;
pub mod source;

pub use client::ResilientClient;
pub use config::{
    AnonymousVendorConfig, AuthenticatedVendorConfig, FetchConfig, FetchConfigBuilder, ProbeMode,
    ProxyPoolConfig, ProxyPoolConfigBuilder, RetryPolicy, RotationStrategy, SourceConfig,
    StaticListConfig,
};
pub use error::{FetchError, NoProxyAvailable, SourceError};
pub use middleware::{EgressMiddleware, EgressOverride};
pub use pool::{PoolState, ProxyPool};
pub use probe::{HealthProber, Probe};
pub use proxy::{redact_url, ProxyCandidate, ProxyProtocol, ProxyStatus, ProxyTarget, SourceKind};
pub use source::{ProxySource, VendorSession};
