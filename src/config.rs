//! Configuration for the proxy pool and the resilient client.

use ipnet::IpNet;
use reqwest::StatusCode;
use std::time::Duration;

use crate::proxy::SourceKind;

/// How the pool picks its active endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStrategy {
    /// Keep one active endpoint; probe candidates in turn when it fails.
    SwapOnFailure,
    /// Keep a continuously probed health table and sample healthy entries.
    HealthTable,
}

/// What a health probe counts as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// The canary must answer with exactly this status and a non-blank body.
    ExactStatus(StatusCode),
    /// Any 2xx or 3xx answer counts.
    SuccessOrRedirect,
}

impl ProbeMode {
    /// Whether `status` counts as a healthy answer.
    pub fn accepts(&self, status: StatusCode) -> bool {
        match self {
            ProbeMode::ExactStatus(expected) => status == *expected,
            ProbeMode::SuccessOrRedirect => status.is_success() || status.is_redirection(),
        }
    }

    /// Whether a healthy answer must also carry a non-blank body.
    pub fn requires_body(&self) -> bool {
        matches!(self, ProbeMode::ExactStatus(_))
    }
}

/// Settings for the authenticated vendor API.
#[derive(Debug, Clone)]
pub struct AuthenticatedVendorConfig {
    /// Base URL of the vendor API.
    pub base_url: String,
    /// Server type requested on allocation.
    pub server_type: String,
    /// Protocol of allocated servers.
    pub scheme: String,
    /// Application version reported in the device descriptor.
    pub app_version: String,
}

impl AuthenticatedVendorConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            server_type: "proxy".to_string(),
            scheme: "https".to_string(),
            app_version: "3.4.1".to_string(),
        }
    }
}

/// Settings for the anonymous vendor API.
#[derive(Debug, Clone)]
pub struct AnonymousVendorConfig {
    /// Base URL of the vendor API.
    pub base_url: String,
    /// Region to use when present in the directory.
    pub target_region: Option<String>,
    /// Regions to pick from at random when no target is set.
    pub preferred_regions: Vec<String>,
    /// Protocol of directory servers.
    pub scheme: String,
}

impl AnonymousVendorConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            target_region: None,
            preferred_regions: ["US", "DE", "NL", "GB", "FR"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            scheme: "https".to_string(),
        }
    }
}

/// Settings for the plaintext list source.
#[derive(Debug, Clone)]
pub struct StaticListConfig {
    /// List of HTTP proxies, one `host:port` per line. URL or file path.
    pub http_list: String,
    /// List of SOCKS5 proxies, one `host:port` per line. URL or file path.
    pub socks5_list: String,
}

impl Default for StaticListConfig {
    fn default() -> Self {
        Self {
            http_list: "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/http/data.txt"
                .to_string(),
            socks5_list: "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/socks5/data.txt"
                .to_string(),
        }
    }
}

/// Which adapter populates the pool.
#[derive(Debug, Clone)]
pub enum SourceConfig {
    AuthenticatedVendor(AuthenticatedVendorConfig),
    AnonymousVendor(AnonymousVendorConfig),
    StaticList(StaticListConfig),
}

impl SourceConfig {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceConfig::AuthenticatedVendor(_) => SourceKind::AuthenticatedVendor,
            SourceConfig::AnonymousVendor(_) => SourceKind::AnonymousVendor,
            SourceConfig::StaticList(_) => SourceKind::StaticList,
        }
    }
}

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Adapter that supplies candidates.
    pub source: SourceConfig,
    /// Rotation strategy. `None` uses the adapter's default.
    pub rotation: Option<RotationStrategy>,
    /// URL used for health checks.
    pub canary_url: String,
    /// Timeout for one health check.
    pub probe_timeout: Duration,
    /// What counts as a healthy answer.
    pub probe_mode: ProbeMode,
    /// Interval between background probe batches.
    pub probe_interval: Duration,
    /// Maximum number of candidates probed concurrently in one batch.
    pub probe_batch_size: usize,
    /// Age after which a probe result is re-checked.
    pub staleness: Duration,
    /// Delay between refetches of an empty list.
    pub list_retry_interval: Duration,
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new()
    }
}

/// Builder for `ProxyPoolConfig`.
pub struct ProxyPoolConfigBuilder {
    source: Option<SourceConfig>,
    rotation: Option<RotationStrategy>,
    canary_url: Option<String>,
    probe_timeout: Option<Duration>,
    probe_mode: Option<ProbeMode>,
    probe_interval: Option<Duration>,
    probe_batch_size: Option<usize>,
    staleness: Option<Duration>,
    list_retry_interval: Option<Duration>,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            source: None,
            rotation: None,
            canary_url: None,
            probe_timeout: None,
            probe_mode: None,
            probe_interval: None,
            probe_batch_size: None,
            staleness: None,
            list_retry_interval: None,
        }
    }

    /// Set the adapter that supplies candidates.
    pub fn source(mut self, source: SourceConfig) -> Self {
        self.source = Some(source);
        self
    }

    /// Force a rotation strategy instead of the adapter's default.
    pub fn rotation(mut self, strategy: RotationStrategy) -> Self {
        self.rotation = Some(strategy);
        self
    }

    /// Set the URL used for health checks.
    pub fn canary_url(mut self, url: impl Into<String>) -> Self {
        self.canary_url = Some(url.into());
        self
    }

    /// Set the timeout for health checks.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Set what counts as a healthy answer.
    pub fn probe_mode(mut self, mode: ProbeMode) -> Self {
        self.probe_mode = Some(mode);
        self
    }

    /// Set the interval between background probe batches.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = Some(interval);
        self
    }

    /// Set the maximum number of candidates probed in one batch.
    pub fn probe_batch_size(mut self, size: usize) -> Self {
        self.probe_batch_size = Some(size);
        self
    }

    /// Set the age after which a probe result is re-checked.
    pub fn staleness(mut self, staleness: Duration) -> Self {
        self.staleness = Some(staleness);
        self
    }

    /// Set the delay between refetches of an empty list.
    pub fn list_retry_interval(mut self, interval: Duration) -> Self {
        self.list_retry_interval = Some(interval);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            source: self
                .source
                .unwrap_or_else(|| SourceConfig::StaticList(StaticListConfig::default())),
            rotation: self.rotation,
            canary_url: self.canary_url.unwrap_or_else(|| "https://api.ipify.org".to_string()),
            probe_timeout: self.probe_timeout.unwrap_or(Duration::from_secs(6)),
            probe_mode: self.probe_mode.unwrap_or(ProbeMode::ExactStatus(StatusCode::OK)),
            probe_interval: self.probe_interval.unwrap_or(Duration::from_secs(60)),
            probe_batch_size: self.probe_batch_size.unwrap_or(30).max(1),
            staleness: self.staleness.unwrap_or(Duration::from_secs(300)),
            list_retry_interval: self.list_retry_interval.unwrap_or(Duration::from_secs(30)),
        }
    }
}

impl Default for ProxyPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff settings. Delays are deterministic: no jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Whether failed sends are retried at all.
    pub enabled: bool,
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub min_timeout: Duration,
    /// Factor applied to the delay after each retry.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Number of attempts a call gets under this policy.
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.multiplier.max(0.0).powi(exponent);
        Duration::from_nanos((self.min_timeout.as_nanos() as f64 * factor).round() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            min_timeout: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

/// Configuration for the resilient client.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Proxy used when auto-rotation is off.
    pub static_proxy: Option<String>,
    /// Block to draw alternate source addresses from.
    pub address_block: Option<IpNet>,
    /// Take the proxy from the pool and rotate it on failure.
    pub auto_rotate: bool,
    /// Per-attempt timeout. `None` attaches no cancellation.
    pub timeout: Option<Duration>,
    /// Backoff settings.
    pub retry: RetryPolicy,
    /// Maximum requests per second through one egress.
    pub max_requests_per_second: Option<f64>,
}

impl FetchConfig {
    /// Create a new configuration builder.
    pub fn builder() -> FetchConfigBuilder {
        FetchConfigBuilder::new()
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfigBuilder::new().build()
    }
}

/// Builder for `FetchConfig`.
#[derive(Default)]
pub struct FetchConfigBuilder {
    static_proxy: Option<String>,
    address_block: Option<IpNet>,
    auto_rotate: bool,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    max_requests_per_second: Option<f64>,
}

impl FetchConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the proxy used when auto-rotation is off.
    pub fn static_proxy(mut self, endpoint: impl Into<String>) -> Self {
        self.static_proxy = Some(endpoint.into());
        self
    }

    /// Set the block alternate source addresses are drawn from.
    pub fn address_block(mut self, block: IpNet) -> Self {
        self.address_block = Some(block);
        self
    }

    /// Take proxies from the pool and rotate them on failure.
    pub fn auto_rotate(mut self, enabled: bool) -> Self {
        self.auto_rotate = enabled;
        self
    }

    /// Set the per-attempt timeout. A zero duration disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the backoff settings.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Set the maximum requests per second through one egress.
    pub fn max_requests_per_second(mut self, rps: f64) -> Self {
        self.max_requests_per_second = Some(rps);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> FetchConfig {
        FetchConfig {
            static_proxy: self.static_proxy.filter(|p| !p.trim().is_empty()),
            address_block: self.address_block,
            auto_rotate: self.auto_rotate,
            timeout: self.timeout.filter(|t| !t.is_zero()),
            retry: self.retry.unwrap_or_default(),
            max_requests_per_second: self.max_requests_per_second.filter(|rps| *rps > 0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delays_are_deterministic() {
        let policy = RetryPolicy {
            enabled: true,
            max_attempts: 3,
            min_timeout: Duration::from_millis(100),
            multiplier: 2.0,
        };
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn disabled_retry_means_one_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn zero_timeout_is_no_timeout() {
        let config = FetchConfig::builder().timeout(Duration::ZERO).build();
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn probe_modes() {
        let strict = ProbeMode::ExactStatus(StatusCode::OK);
        assert!(strict.accepts(StatusCode::OK));
        assert!(!strict.accepts(StatusCode::NO_CONTENT));
        assert!(!strict.accepts(StatusCode::FOUND));

        let lenient = ProbeMode::SuccessOrRedirect;
        assert!(lenient.accepts(StatusCode::NO_CONTENT));
        assert!(lenient.accepts(StatusCode::MOVED_PERMANENTLY));
        assert!(!lenient.accepts(StatusCode::FORBIDDEN));

        assert!(strict.requires_body());
        assert!(!lenient.requires_body());
    }

    #[test]
    fn pool_defaults() {
        let config = ProxyPoolConfig::builder().build();
        assert_eq!(config.canary_url, "https://api.ipify.org");
        assert_eq!(config.probe_timeout, Duration::from_secs(6));
        assert_eq!(config.probe_batch_size, 30);
        assert_eq!(config.source.kind(), SourceKind::StaticList);
    }
}
