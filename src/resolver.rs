use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::cache::GeocodeCache;
use crate::config::AppConfig;
use crate::errors::AppError;
use crate::ingestion::NormalizedAddress;
use crate::providers::{Coordinate, GeocodeProvider, ProviderFailure, ProviderKind};
use crate::telemetry::TelemetryClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Cache,
    Provider(ProviderKind),
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub coordinate: Coordinate,
    pub source: ResolutionSource,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("every provider failed: {}", describe_failures(.failures))]
    Exhausted {
        failures: Vec<(ProviderKind, ProviderFailure)>,
    },
    #[error("no geocoding providers configured")]
    NoProviders,
    #[error("geocode cache unavailable: {0}")]
    Cache(#[source] AppError),
}

impl ResolveError {
    /// Every provider failed at the transport level, which looks like an
    /// outage rather than a bad address.
    pub fn is_transport_outage(&self) -> bool {
        match self {
            ResolveError::Exhausted { failures } => {
                !failures.is_empty()
                    && failures
                        .iter()
                        .all(|(_, failure)| matches!(failure, ProviderFailure::Transport(_)))
            }
            _ => false,
        }
    }
}

fn describe_failures(failures: &[(ProviderKind, ProviderFailure)]) -> String {
    failures
        .iter()
        .map(|(kind, failure)| format!("{}: {failure}", kind.as_str()))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub cache_ttl: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// Longest sleep before retrying a rate-limited provider. A provider
    /// asking for more is skipped instead.
    pub max_backoff: Duration,
    pub rate_limit_qps: u32,
}

impl ResolverSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            max_attempts: config.max_rate_limit_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            rate_limit_qps: config.rate_limit_qps.max(1),
        }
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Cache lookup, ordered provider fallback and rate-limit backoff.
/// Clones share the cache, the providers and the in-flight table.
#[derive(Clone)]
pub struct GeocodeResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    cache: Arc<dyn GeocodeCache>,
    providers: Vec<Arc<dyn GeocodeProvider>>,
    settings: ResolverSettings,
    rate_limiter: RateLimiter,
    jitter_rng: Mutex<StdRng>,
    in_flight: Mutex<HashMap<NormalizedAddress, Arc<AsyncMutex<()>>>>,
    network_calls: AtomicU64,
    telemetry: Option<TelemetryClient>,
}

impl GeocodeResolver {
    pub fn new(
        cache: Arc<dyn GeocodeCache>,
        providers: Vec<Arc<dyn GeocodeProvider>>,
        settings: ResolverSettings,
    ) -> Self {
        Self::build(cache, providers, settings, StdRng::from_entropy(), None)
    }

    pub fn with_telemetry(
        cache: Arc<dyn GeocodeCache>,
        providers: Vec<Arc<dyn GeocodeProvider>>,
        settings: ResolverSettings,
        telemetry: TelemetryClient,
    ) -> Self {
        Self::build(
            cache,
            providers,
            settings,
            StdRng::from_entropy(),
            Some(telemetry),
        )
    }

    #[cfg(test)]
    pub fn with_rng(
        cache: Arc<dyn GeocodeCache>,
        providers: Vec<Arc<dyn GeocodeProvider>>,
        settings: ResolverSettings,
        rng: StdRng,
    ) -> Self {
        Self::build(cache, providers, settings, rng, None)
    }

    fn build(
        cache: Arc<dyn GeocodeCache>,
        providers: Vec<Arc<dyn GeocodeProvider>>,
        settings: ResolverSettings,
        rng: StdRng,
        telemetry: Option<TelemetryClient>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(settings.rate_limit_qps);
        Self {
            inner: Arc::new(ResolverInner {
                cache,
                providers,
                settings,
                rate_limiter,
                jitter_rng: Mutex::new(rng),
                in_flight: Mutex::new(HashMap::new()),
                network_calls: AtomicU64::new(0),
                telemetry,
            }),
        }
    }

    pub fn provider_order(&self) -> Vec<ProviderKind> {
        self.inner.providers.iter().map(|p| p.kind()).collect()
    }

    /// Provider requests issued so far, retries included.
    pub fn network_calls(&self) -> u64 {
        self.inner.network_calls.load(Ordering::SeqCst)
    }

    pub fn rate_limit_qps(&self) -> u32 {
        self.inner.rate_limiter.qps()
    }

    pub async fn resolve(&self, address: &NormalizedAddress) -> Result<Resolution, ResolveError> {
        self.resolve_paced(address, None).await
    }

    async fn resolve_paced(
        &self,
        address: &NormalizedAddress,
        throttle: Option<&BatchThrottle>,
    ) -> Result<Resolution, ResolveError> {
        if self.inner.providers.is_empty() {
            return Err(ResolveError::NoProviders);
        }
        if let Some(coordinate) = self.cached(address).await? {
            return Ok(Resolution {
                coordinate,
                source: ResolutionSource::Cache,
            });
        }

        // One resolution per address at a time; waiters usually find the
        // winner's result in the cache.
        let _flight = self.join_flight(address).await;
        if let Some(coordinate) = self.cached(address).await? {
            return Ok(Resolution {
                coordinate,
                source: ResolutionSource::Cache,
            });
        }

        if let Some(throttle) = throttle {
            throttle.wait_turn().await;
        }
        let outcome = self.resolve_from_providers(address).await;
        if let Some(throttle) = throttle {
            throttle.record_resolution().await;
        }

        let coordinate = outcome?;
        self.inner
            .cache
            .set(address, &coordinate, self.inner.settings.cache_ttl)
            .await
            .map_err(ResolveError::Cache)?;
        Ok(Resolution {
            source: ResolutionSource::Provider(coordinate.provider),
            coordinate,
        })
    }

    async fn cached(&self, address: &NormalizedAddress) -> Result<Option<Coordinate>, ResolveError> {
        let hit = self
            .inner
            .cache
            .get(address)
            .await
            .map_err(ResolveError::Cache)?;
        if hit.is_some() {
            trace!(%address, "geocode cache hit");
        }
        Ok(hit)
    }

    async fn resolve_from_providers(
        &self,
        address: &NormalizedAddress,
    ) -> Result<Coordinate, ResolveError> {
        let mut failures = Vec::with_capacity(self.inner.providers.len());
        for provider in &self.inner.providers {
            match self.resolve_with_retry(provider.as_ref(), address).await {
                Ok(coordinate) => return Ok(coordinate),
                Err(failure) => {
                    warn!(
                        %address,
                        provider = provider.kind().as_str(),
                        %failure,
                        "provider failed; falling through"
                    );
                    failures.push((provider.kind(), failure));
                }
            }
        }
        Err(ResolveError::Exhausted { failures })
    }

    async fn resolve_with_retry(
        &self,
        provider: &dyn GeocodeProvider,
        address: &NormalizedAddress,
    ) -> Result<Coordinate, ProviderFailure> {
        let max_attempts = self.inner.settings.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.inner.rate_limiter.wait().await;
            self.inner.network_calls.fetch_add(1, Ordering::SeqCst);
            debug!(%address, provider = provider.kind().as_str(), attempt, "geocoding");
            match provider.resolve(address).await {
                Ok(coordinate) => return Ok(coordinate),
                Err(ProviderFailure::RateLimited { retry_after }) if attempt < max_attempts => {
                    let max_backoff = self.inner.settings.max_backoff;
                    if retry_after.is_some_and(|wait| wait > max_backoff) {
                        warn!(
                            provider = provider.kind().as_str(),
                            attempt,
                            ?retry_after,
                            "retry-after exceeds max backoff; skipping provider"
                        );
                        return Err(ProviderFailure::RateLimited { retry_after });
                    }
                    let delay = self
                        .backoff_delay(attempt)
                        .max(retry_after.unwrap_or_default())
                        .min(max_backoff);
                    warn!(
                        provider = provider.kind().as_str(),
                        attempt, "rate limited; retrying after {:?}", delay
                    );
                    if let Some(telemetry) = &self.inner.telemetry {
                        telemetry.provider_rate_limited(provider.kind(), attempt);
                    }
                    sleep(delay).await;
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.inner.settings.backoff_base.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt.saturating_sub(1)).min(6);
        let base = Duration::from_millis(base_ms * (1 << exponent));
        let jitter = {
            let mut rng = self.inner.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..base_ms))
        };
        base + jitter
    }

    async fn join_flight(&self, address: &NormalizedAddress) -> FlightGuard {
        let slot = {
            let mut in_flight = self.inner.in_flight.lock();
            Arc::clone(
                in_flight
                    .entry(address.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let guard = Arc::clone(&slot).lock_owned().await;
        FlightGuard {
            inner: Arc::clone(&self.inner),
            address: address.clone(),
            slot,
            guard: Some(guard),
        }
    }
}

struct FlightGuard {
    inner: Arc<ResolverInner>,
    address: NormalizedAddress,
    slot: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut in_flight = self.inner.in_flight.lock();
        // Only the table and this guard still hold the slot: nobody is waiting.
        if Arc::strong_count(&self.slot) == 2 {
            in_flight.remove(&self.address);
        }
    }
}

/// Job-wide pacing: after every `batch_size` network resolutions all
/// workers pause for `pause`, whatever the per-provider limits are.
pub struct BatchThrottle {
    batch_size: usize,
    pause: Duration,
    resolutions: AtomicUsize,
    gate: AsyncMutex<()>,
}

impl BatchThrottle {
    pub fn new(batch_size: usize, pause: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pause,
            resolutions: AtomicUsize::new(0),
            gate: AsyncMutex::new(()),
        }
    }

    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }

    async fn wait_turn(&self) {
        drop(self.gate.lock().await);
    }

    async fn record_resolution(&self) {
        let count = self.resolutions.fetch_add(1, Ordering::SeqCst) + 1;
        if count % self.batch_size == 0 && !self.pause.is_zero() {
            let _gate = self.gate.lock().await;
            debug!(resolutions = count, pause = ?self.pause, "batch throttle pause");
            sleep(self.pause).await;
        }
    }
}

/// The resolver bound to one job's throttle.
#[derive(Clone)]
pub struct BatchResolver {
    resolver: GeocodeResolver,
    throttle: Arc<BatchThrottle>,
}

impl BatchResolver {
    pub fn new(resolver: GeocodeResolver, throttle: BatchThrottle) -> Self {
        Self {
            resolver,
            throttle: Arc::new(throttle),
        }
    }

    pub async fn resolve_batch_entry(
        &self,
        address: &NormalizedAddress,
    ) -> Result<Resolution, ResolveError> {
        self.resolver
            .resolve_paced(address, Some(self.throttle.as_ref()))
            .await
    }

    pub fn throttle(&self) -> &BatchThrottle {
        &self.throttle
    }
}

struct RateLimiter {
    min_interval_ms: AtomicU64,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    fn qps(&self) -> u32 {
        let interval = self.min_interval_ms.load(Ordering::SeqCst).max(1);
        let qps = (1000_f64 / interval as f64).round() as u32;
        qps.max(1)
    }

    fn interval_ms(qps: u32) -> u64 {
        let safe_qps = qps.max(1);
        let interval_ms = (1000_f64 / safe_qps as f64).ceil() as u64;
        interval_ms.max(50)
    }

    async fn wait(&self) {
        let interval = Duration::from_millis(self.min_interval_ms.load(Ordering::SeqCst));
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;

    use async_trait::async_trait;

    use super::*;
    use crate::errors::AppResult;

    /// Plays back scripted outcomes, then repeats `fallback` forever.
    pub struct ScriptedProvider {
        kind: ProviderKind,
        script: Mutex<VecDeque<Result<(f64, f64), ProviderFailure>>>,
        fallback: Result<(f64, f64), ProviderFailure>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        pub fn new(kind: ProviderKind, fallback: Result<(f64, f64), ProviderFailure>) -> Self {
            Self {
                kind,
                script: Mutex::new(VecDeque::new()),
                fallback,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn then(self, outcome: Result<(f64, f64), ProviderFailure>) -> Self {
            self.script.lock().push_back(outcome);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeocodeProvider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn resolve(&self, _address: &NormalizedAddress) -> Result<Coordinate, ProviderFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let outcome = self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            let (lat, lon) = outcome?;
            Coordinate::new(lat, lon, self.kind)
        }
    }

    /// Resolves by looking the address up in a fixed table.
    pub struct TableProvider {
        kind: ProviderKind,
        table: HashMap<String, Result<(f64, f64), ProviderFailure>>,
        calls: AtomicUsize,
    }

    impl TableProvider {
        pub fn new(kind: ProviderKind) -> Self {
            Self {
                kind,
                table: HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with(mut self, address: &str, outcome: Result<(f64, f64), ProviderFailure>) -> Self {
            self.table.insert(address.to_string(), outcome);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeocodeProvider for TableProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn resolve(&self, address: &NormalizedAddress) -> Result<Coordinate, ProviderFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (lat, lon) = self
                .table
                .get(address.as_str())
                .cloned()
                .unwrap_or(Err(ProviderFailure::NotFound))?;
            Coordinate::new(lat, lon, self.kind)
        }
    }

    pub struct UnavailableCache;

    #[async_trait]
    impl GeocodeCache for UnavailableCache {
        async fn get(&self, _key: &NormalizedAddress) -> AppResult<Option<Coordinate>> {
            Err(AppError::Storage("connection refused".into()))
        }

        async fn set(
            &self,
            _key: &NormalizedAddress,
            _coordinate: &Coordinate,
            _ttl: Duration,
        ) -> AppResult<()> {
            Err(AppError::Storage("connection refused".into()))
        }
    }

    pub fn fast_settings() -> ResolverSettings {
        ResolverSettings {
            cache_ttl: Duration::from_secs(60),
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            max_backoff: Duration::from_millis(500),
            rate_limit_qps: 1000,
        }
    }
}
