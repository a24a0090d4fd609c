//! Core proxy pool implementation.
//!
//! The pool owns the candidate table and the active endpoint. It is created
//! once per process, shared through an `Arc`, and driven through
//! [`ProxyPool::initialize`], [`ProxyPool::rotate`] and
//! [`ProxyPool::mark_failed`].

use crate::config::{ProxyPoolConfig, RotationStrategy};
use crate::error::{NoProxyAvailable, SourceError};
use crate::probe::{HealthProber, Probe};
use crate::proxy::{redact_url, ProxyCandidate, ProxyStatus};
use crate::source::{build_source, ProxySource, VendorSession};

use futures::future::{self, BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

type InitFuture = Shared<BoxFuture<'static, Result<Arc<VendorSession>, SourceError>>>;

#[derive(Debug, Clone)]
struct ActiveProxy {
    key: String,
    endpoint: String,
}

struct PoolInner {
    state: PoolState,
    session: Option<Arc<VendorSession>>,
    candidates: HashMap<String, ProxyCandidate>,
    /// Endpoints allocated for vendor regions by the health table, by key.
    allocated: HashMap<String, String>,
    active: Option<ActiveProxy>,
}

impl PoolInner {
    fn endpoint_of(&self, candidate: &ProxyCandidate) -> Option<String> {
        candidate
            .endpoint
            .clone()
            .or_else(|| self.allocated.get(&candidate.key).cloned())
    }
}

/// A pool of candidate egress endpoints with one active endpoint.
pub struct ProxyPool {
    /// Configuration for the pool.
    pub config: ProxyPoolConfig,
    strategy: RotationStrategy,
    source: Arc<dyn ProxySource>,
    prober: Arc<dyn Probe>,
    inner: Mutex<PoolInner>,
    init: Mutex<Option<InitFuture>>,
    rotating: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Clears the rotation flag when a rotation pass ends, however it ends.
struct RotationGuard<'a>(&'a AtomicBool);

impl Drop for RotationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ProxyPool {
    /// Create a pool around an explicit source and prober.
    pub fn new(
        config: ProxyPoolConfig,
        source: Arc<dyn ProxySource>,
        prober: Arc<dyn Probe>,
    ) -> Arc<Self> {
        let strategy = config.rotation.unwrap_or_else(|| source.default_strategy());
        Arc::new(Self {
            config,
            strategy,
            source,
            prober,
            inner: Mutex::new(PoolInner {
                state: PoolState::Uninitialized,
                session: None,
                candidates: HashMap::new(),
                allocated: HashMap::new(),
                active: None,
            }),
            init: Mutex::new(None),
            rotating: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Create a pool with the source and prober described by `config`.
    pub fn from_config(config: ProxyPoolConfig) -> Arc<Self> {
        let source = build_source(&config.source);
        let prober = Arc::new(HealthProber::from_config(&config));
        Self::new(config, source, prober)
    }

    pub fn state(&self) -> PoolState {
        self.inner.lock().state
    }

    pub fn strategy(&self) -> RotationStrategy {
        self.strategy
    }

    /// Register with the source, list candidates and seed the active
    /// endpoint.
    ///
    /// Concurrent callers share one in-flight initialization and observe the
    /// same outcome. Once ready, later calls return the same session. After
    /// a failure the next call starts a fresh attempt.
    pub async fn initialize(self: &Arc<Self>) -> Result<Arc<VendorSession>, SourceError> {
        let fut = {
            let mut slot = self.init.lock();
            match slot.as_ref() {
                Some(fut) => fut.clone(),
                None => {
                    self.inner.lock().state = PoolState::Initializing;
                    let pool = Arc::clone(self);
                    let fut = async move { pool.run_initialization().await }
                        .boxed()
                        .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        fut.await
    }

    async fn run_initialization(self: Arc<Self>) -> Result<Arc<VendorSession>, SourceError> {
        info!("Initializing proxy pool from {:?} source", self.source.kind());

        let result = self.bootstrap().await;
        match &result {
            Ok(_) => {
                self.inner.lock().state = PoolState::Ready;
                let (total, healthy) = self.get_stats();
                info!("Proxy pool ready: {}/{} healthy proxies", healthy, total);
            }
            Err(e) => {
                warn!("Proxy pool initialization failed: {}", e);
                self.inner.lock().state = PoolState::Failed;
                *self.init.lock() = None;
            }
        }
        result
    }

    async fn bootstrap(self: &Arc<Self>) -> Result<Arc<VendorSession>, SourceError> {
        let session = Arc::new(self.source.register().await?);
        let candidates = self.source.list_candidates(&session).await?;
        let empty = candidates.is_empty();

        {
            let mut inner = self.inner.lock();
            inner.session = Some(Arc::clone(&session));
        }
        self.merge_candidates(candidates);

        if self.strategy == RotationStrategy::HealthTable {
            self.spawn_health_task();
        }
        if empty && self.strategy == RotationStrategy::HealthTable {
            warn!("Proxy source returned no candidates, retrying in the background");
            self.spawn_list_retry(Arc::clone(&session));
        }

        if self.rotate().await.is_none() {
            info!("No proxy currently available");
        }
        Ok(session)
    }

    /// The last known active endpoint.
    pub fn current_proxy(&self) -> Option<String> {
        self.inner.lock().active.as_ref().map(|a| a.endpoint.clone())
    }

    /// A snapshot of the active candidate.
    pub fn get_proxy(&self) -> Result<ProxyCandidate, NoProxyAvailable> {
        let inner = self.inner.lock();
        let active = inner.active.as_ref().ok_or(NoProxyAvailable)?;
        let mut candidate = inner
            .candidates
            .get(&active.key)
            .cloned()
            .ok_or(NoProxyAvailable)?;
        candidate.endpoint = Some(active.endpoint.clone());
        Ok(candidate)
    }

    /// Pick a new active endpoint.
    ///
    /// Returns `None`, and clears the active endpoint, when no candidate is
    /// healthy. If another rotation is already running, returns the current
    /// endpoint without rotating again.
    pub async fn rotate(&self) -> Option<String> {
        self.rotate_excluding(None).await
    }

    /// Report that the active endpoint misbehaved and rotate away from it.
    pub async fn mark_failed(&self) -> Option<String> {
        let failed = {
            let mut inner = self.inner.lock();
            let failed = inner.active.clone();
            if let Some(active) = &failed {
                if let Some(candidate) = inner.candidates.get_mut(&active.key) {
                    candidate.status = ProxyStatus::Unhealthy;
                    candidate.failure_count += 1;
                    candidate.last_checked = Some(Instant::now());
                }
            }
            failed
        };

        if let Some(active) = &failed {
            warn!("Proxy {} reported as failing", redact_url(&active.endpoint));
        }
        self.rotate_excluding(failed.map(|a| a.key)).await
    }

    async fn rotate_excluding(&self, exclude: Option<String>) -> Option<String> {
        if matches!(self.state(), PoolState::Uninitialized | PoolState::Failed) {
            debug!("Rotation requested before the pool is initialized");
            return None;
        }

        let Some(_guard) = self.begin_rotation() else {
            debug!("Rotation already in progress");
            return self.current_proxy();
        };

        let next = match self.strategy {
            RotationStrategy::SwapOnFailure => self.rotate_swap(exclude).await,
            RotationStrategy::HealthTable => self.next_working().await,
        };

        let mut inner = self.inner.lock();
        match next {
            Some(active) => {
                info!("Active proxy is now {}", redact_url(&active.endpoint));
                let endpoint = active.endpoint.clone();
                inner.active = Some(active);
                Some(endpoint)
            }
            None => {
                if inner.active.take().is_some() {
                    warn!("No healthy proxy left, continuing without one");
                }
                None
            }
        }
    }

    fn begin_rotation(&self) -> Option<RotationGuard<'_>> {
        self.rotating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RotationGuard(&self.rotating))
    }

    async fn rotate_swap(&self, exclude: Option<String>) -> Option<ActiveProxy> {
        let session = self.session_for_rotation().await?;
        let known = self.candidates();
        let ordered = self
            .source
            .rotation_candidates(&session, known, exclude.as_deref())
            .await;

        let mut deferred = None;
        for candidate in ordered {
            if exclude.as_deref() == Some(candidate.key.as_str()) {
                deferred = Some(candidate);
                continue;
            }
            if let Some(active) = self.try_candidate(&session, &candidate).await {
                return Some(active);
            }
        }

        // The failed candidate is retried only when nothing else has ever
        // been healthy.
        let candidate = deferred?;
        let others_healthy = self
            .inner
            .lock()
            .candidates
            .values()
            .any(|c| c.key != candidate.key && c.ever_healthy());
        if others_healthy {
            return None;
        }
        self.try_candidate(&session, &candidate).await
    }

    async fn session_for_rotation(&self) -> Option<Arc<VendorSession>> {
        let session = self.inner.lock().session.clone()?;
        if !session.is_expired() {
            return Some(session);
        }

        info!("Vendor session expired, registering again");
        match self.source.register().await {
            Ok(fresh) => {
                let fresh = Arc::new(fresh);
                self.inner.lock().session = Some(Arc::clone(&fresh));
                Some(fresh)
            }
            Err(e) => {
                warn!("Re-registration failed: {}", e);
                None
            }
        }
    }

    async fn resolve_endpoint(
        &self,
        session: &VendorSession,
        candidate: &ProxyCandidate,
    ) -> Option<String> {
        if let Some(endpoint) = &candidate.endpoint {
            return Some(endpoint.clone());
        }
        match self.source.acquire_endpoint(session, candidate).await {
            Ok(Some(endpoint)) => Some(endpoint),
            Ok(None) => {
                debug!("No endpoint available for {}", candidate.key);
                None
            }
            Err(e) => {
                warn!("Failed to acquire endpoint for {}: {}", candidate.key, e);
                None
            }
        }
    }

    async fn try_candidate(
        &self,
        session: &VendorSession,
        candidate: &ProxyCandidate,
    ) -> Option<ActiveProxy> {
        let endpoint = self.resolve_endpoint(session, candidate).await?;

        if self.probe_and_record(candidate, &endpoint).await {
            Some(ActiveProxy {
                key: candidate.key.clone(),
                endpoint,
            })
        } else {
            None
        }
    }

    async fn probe_and_record(&self, candidate: &ProxyCandidate, endpoint: &str) -> bool {
        let start = Instant::now();
        let healthy = self.prober.probe(endpoint).await;
        let elapsed = start.elapsed();

        let mut inner = self.inner.lock();
        let entry = inner
            .candidates
            .entry(candidate.key.clone())
            .or_insert_with(|| candidate.clone());
        let old_status = entry.status;
        entry.record_probe(healthy, elapsed);

        if old_status != entry.status {
            debug!(
                "Proxy {} status changed: {:?} -> {:?}",
                redact_url(endpoint),
                old_status,
                entry.status
            );
        }
        healthy
    }

    /// Sample uniformly among healthy candidates. When none is healthy,
    /// run exactly one forced probe batch and sample again.
    pub async fn next_working_proxy(&self) -> Option<String> {
        self.next_working().await.map(|a| a.endpoint)
    }

    async fn next_working(&self) -> Option<ActiveProxy> {
        if let Some(active) = self.sample_healthy() {
            return Some(active);
        }
        debug!("No healthy proxies yet, forcing one probe batch");
        self.probe_batch(true).await;
        self.sample_healthy()
    }

    fn sample_healthy(&self) -> Option<ActiveProxy> {
        let inner = self.inner.lock();
        let healthy: Vec<ActiveProxy> = inner
            .candidates
            .values()
            .filter(|c| c.status == ProxyStatus::Healthy)
            .filter_map(|c| {
                Some(ActiveProxy {
                    key: c.key.clone(),
                    endpoint: inner.endpoint_of(c)?,
                })
            })
            .collect();
        healthy.choose(&mut rand::rng()).cloned()
    }

    /// Probe one bounded batch of candidates concurrently.
    ///
    /// Unforced batches only take candidates whose last check is older than
    /// the staleness window. Oldest checks go first. Vendor regions get a
    /// freshly allocated endpoint for each check. Returns the number of
    /// healthy results.
    pub async fn probe_batch(&self, force: bool) -> usize {
        let (batch, session) = {
            let inner = self.inner.lock();
            let mut due: Vec<&ProxyCandidate> = inner
                .candidates
                .values()
                .filter(|c| c.endpoint.is_some() || inner.session.is_some())
                .filter(|c| force || c.is_stale(self.config.staleness))
                .collect();
            due.sort_by_key(|c| c.last_checked);
            let batch: Vec<ProxyCandidate> = due
                .into_iter()
                .take(self.config.probe_batch_size)
                .cloned()
                .collect();
            (batch, inner.session.clone())
        };

        if batch.is_empty() {
            return 0;
        }

        let checks = batch
            .iter()
            .map(|candidate| self.check_candidate(session.as_deref(), candidate));
        let results = future::join_all(checks).await;

        let healthy = results.iter().filter(|&&ok| ok).count();
        debug!(
            "Probe batch completed: {} healthy, {} unhealthy",
            healthy,
            results.len() - healthy
        );
        healthy
    }

    async fn check_candidate(
        &self,
        session: Option<&VendorSession>,
        candidate: &ProxyCandidate,
    ) -> bool {
        let endpoint = match (&candidate.endpoint, session) {
            (Some(endpoint), _) => Some(endpoint.clone()),
            (None, Some(session)) => self.resolve_endpoint(session, candidate).await,
            (None, None) => None,
        };

        let Some(endpoint) = endpoint else {
            // Nothing to probe counts as a failed check.
            let mut inner = self.inner.lock();
            inner.allocated.remove(&candidate.key);
            if let Some(entry) = inner.candidates.get_mut(&candidate.key) {
                entry.record_probe(false, Duration::ZERO);
            }
            return false;
        };

        let healthy = self.probe_and_record(candidate, &endpoint).await;
        if candidate.endpoint.is_none() {
            let mut inner = self.inner.lock();
            if healthy {
                inner.allocated.insert(candidate.key.clone(), endpoint);
            } else {
                inner.allocated.remove(&candidate.key);
            }
        }
        healthy
    }

    /// Add candidates not yet in the table.
    pub fn merge_candidates(&self, candidates: Vec<ProxyCandidate>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.candidates.len();
        for candidate in candidates {
            inner
                .candidates
                .entry(candidate.key.clone())
                .or_insert(candidate);
        }
        inner.candidates.len() - before
    }

    /// A snapshot of all candidates.
    pub fn candidates(&self) -> Vec<ProxyCandidate> {
        self.inner.lock().candidates.values().cloned().collect()
    }

    /// Healthy endpoints with their last probe time, fastest first.
    pub fn working_proxies(&self) -> Vec<(String, Duration)> {
        let inner = self.inner.lock();
        let mut working: Vec<(String, Duration)> = inner
            .candidates
            .values()
            .filter(|c| c.status == ProxyStatus::Healthy)
            .filter_map(|c| Some((inner.endpoint_of(c)?, c.response_time?)))
            .collect();
        working.sort_by_key(|(_, elapsed)| *elapsed);
        working
    }

    /// Get statistics about the proxy pool: `(total, healthy)`.
    pub fn get_stats(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let total = inner.candidates.len();
        let healthy = inner
            .candidates
            .values()
            .filter(|c| c.status == ProxyStatus::Healthy)
            .count();
        (total, healthy)
    }

    fn spawn_health_task(self: &Arc<Self>) {
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.probe_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; initialization already
            // seeds the table.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.probe_batch(false).await;
                let (total, healthy) = pool.get_stats();
                info!("Proxy pool status update: {}/{} healthy proxies", healthy, total);
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_list_retry(self: &Arc<Self>, session: Arc<VendorSession>) {
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.list_retry_interval;

        let handle = tokio::spawn(async move {
            loop {
                time::sleep(period).await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                match pool.source.list_candidates(&session).await {
                    Ok(candidates) if !candidates.is_empty() => {
                        let added = pool.merge_candidates(candidates);
                        info!("Proxy list refetch added {} candidates", added);
                        break;
                    }
                    Ok(_) => warn!("Proxy list still empty, retrying in {:?}", period),
                    Err(e) => warn!("Proxy list refetch failed: {}", e),
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop all background tasks owned by the pool.
    pub fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if !tasks.is_empty() {
            info!("Stopping {} proxy pool background tasks", tasks.len());
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for ProxyPool {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
