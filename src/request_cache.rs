//! Request cache in front of an external key-value service.
//!
//! [RequestCache::cached_call] returns the result of a computation, storing it as JSON under the
//! operation's [cache key](crate::operation::Cacheable::cache_key). A [CircuitBreaker] guards
//! the cache service: once it fails, requests bypass the cache and compute directly until a
//! probe after the cooldown succeeds. Correctness never depends on the cache service, only
//! latency does.

use crate::error::ForecastError;
use crate::metrics::{record_breaker_transition, record_cache_event};
use crate::operation::Cacheable;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cached::{Cached, TimedSizedCache};
use redis::aio::MultiplexedConnection;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};

fn unavailable(error: impl std::fmt::Display) -> ForecastError {
    ForecastError::CacheUnavailable {
        error: error.to_string(),
    }
}

/// A key-value cache service storing JSON strings.
///
/// Every method fails with [ForecastError::CacheUnavailable] when the service cannot be reached.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Returns the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, ForecastError>;

    /// Stores `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), ForecastError>;

    /// Checks that the service is reachable.
    async fn ping(&self) -> Result<(), ForecastError>;
}

/// Redis cache backend.
///
/// One multiplexed connection is shared by all requests. It is dropped after an error and
/// re-established by the next command.
pub struct RedisBackend {
    client: redis::Client,
    prefix: String,
    timeout: Duration,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    pub fn new(url: &str, prefix: &str, timeout: Duration) -> Result<Self, ForecastError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            timeout,
            connection: Mutex::new(None),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, ForecastError> {
        let mut connection = self.connection.lock().await;
        if let Some(connection) = connection.as_ref() {
            return Ok(connection.clone());
        }
        let new = timeout(self.timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| unavailable("redis connection timed out"))?
            .map_err(unavailable)?;
        *connection = Some(new.clone());
        Ok(new)
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, ForecastError> {
        let mut connection = self.connection().await?;
        let result = match timeout(self.timeout, cmd.query_async::<_, T>(&mut connection)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => unavailable(error),
            Err(_) => unavailable("redis command timed out"),
        };
        *self.connection.lock().await = None;
        Err(result)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, ForecastError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.key(key));
        self.query(cmd).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), ForecastError> {
        let mut cmd = redis::cmd("SETEX");
        cmd.arg(self.key(key)).arg(ttl.as_secs().max(1)).arg(value);
        self.query(cmd).await
    }

    async fn ping(&self) -> Result<(), ForecastError> {
        let _: String = self.query(redis::cmd("PING")).await?;
        Ok(())
    }
}

/// In-process cache backend, for deployments without a cache service.
///
/// Entries expire after the lifespan given at construction, whatever the TTL passed to
/// [CacheBackend::set]. The least recently used entries are evicted beyond `size` entries.
pub struct LocalBackend {
    cache: std::sync::Mutex<TimedSizedCache<String, String>>,
}

impl LocalBackend {
    pub fn new(size: usize, lifespan: Duration) -> Self {
        Self {
            cache: std::sync::Mutex::new(TimedSizedCache::with_size_and_lifespan(
                size.max(1),
                lifespan.as_secs().max(1),
            )),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimedSizedCache<String, String>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CacheBackend for LocalBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, ForecastError> {
        Ok(self.lock().cache_get(key).cloned())
    }

    async fn set(&self, key: &str, value: String, _ttl: Duration) -> Result<(), ForecastError> {
        self.lock().cache_set(key.to_string(), value);
        Ok(())
    }

    async fn ping(&self) -> Result<(), ForecastError> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BreakerState {
    /// The cache service is assumed healthy.
    Closed { failures: u32 },
    /// The cache service is bypassed until `retry_at`.
    Open { retry_at: Instant },
    /// One caller is checking whether the service recovered. A check still unresolved at
    /// `until` was abandoned, and the next call checks again.
    Probing { until: Instant },
}

/// Decision of the circuit breaker for one call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Use the cache.
    Pass,
    /// Check the service first: the caller must report the outcome.
    Probe,
    /// Compute directly.
    Bypass,
}

/// Circuit breaker over the cache service.
///
/// Closed until `failure_threshold` consecutive failures, then open for `cooldown`. The first
/// call after the cooldown probes the service; every other call bypasses the cache meanwhile.
/// A recovery check that never reports back (its caller was cancelled) expires after another
/// cooldown.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    /// Decides how the next call uses the cache.
    pub async fn admit(&self) -> Admission {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match *state {
            BreakerState::Closed { .. } => Admission::Pass,
            BreakerState::Open { retry_at: deadline } | BreakerState::Probing { until: deadline }
                if now >= deadline =>
            {
                *state = BreakerState::Probing {
                    until: now + self.cooldown,
                };
                Admission::Probe
            }
            BreakerState::Open { .. } | BreakerState::Probing { .. } => Admission::Bypass,
        }
    }

    /// Records a successful exchange with the cache service.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        if !matches!(*state, BreakerState::Closed { .. }) {
            tracing::info!("cache service recovered, closing circuit breaker");
            record_breaker_transition("closed");
        }
        *state = BreakerState::Closed { failures: 0 };
    }

    /// Records a failed exchange with the cache service.
    pub async fn record_failure(&self, error: &ForecastError) {
        let mut state = self.state.lock().await;
        let open = match *state {
            BreakerState::Closed { failures } if failures + 1 < self.failure_threshold => {
                *state = BreakerState::Closed {
                    failures: failures + 1,
                };
                false
            }
            BreakerState::Closed { .. } | BreakerState::Probing { .. } => true,
            // Already open: another caller's request failed concurrently.
            BreakerState::Open { .. } => false,
        };
        if open {
            tracing::warn!(%error, cooldown = ?self.cooldown, "opening circuit breaker");
            record_breaker_transition("open");
            *state = BreakerState::Open {
                retry_at: Instant::now() + self.cooldown,
            };
        }
    }

    /// Whether calls currently bypass the cache.
    pub async fn is_open(&self) -> bool {
        !matches!(*self.state.lock().await, BreakerState::Closed { .. })
    }
}

/// Get-or-compute-and-store cache of operation results.
pub struct RequestCache {
    backend: Option<Arc<dyn CacheBackend>>,
    breaker: CircuitBreaker,
}

impl RequestCache {
    pub fn new(backend: Arc<dyn CacheBackend>, breaker: CircuitBreaker) -> Self {
        Self {
            backend: Some(backend),
            breaker,
        }
    }

    /// A cache that always computes.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            breaker: CircuitBreaker::new(1, Duration::ZERO),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Returns the result of `compute`, served from the cache when available.
    ///
    /// Errors of `compute` are returned unchanged and never cached. Cache service errors open the
    /// circuit breaker but never fail the call. Results that cannot be serialised are returned
    /// without being cached, and cached values that cannot be deserialised count as misses.
    pub async fn cached_call<K, T, F, Fut>(
        &self,
        key: &K,
        ttl: Duration,
        compute: F,
    ) -> Result<T, ForecastError>
    where
        K: Cacheable + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ForecastError>>,
    {
        let Some(backend) = &self.backend else {
            return compute().await;
        };

        match self.breaker.admit().await {
            Admission::Pass => (),
            Admission::Probe => match backend.ping().await {
                Ok(()) => self.breaker.record_success().await,
                Err(error) => {
                    self.breaker.record_failure(&error).await;
                    record_cache_event("bypass");
                    return compute().await;
                }
            },
            Admission::Bypass => {
                record_cache_event("bypass");
                return compute().await;
            }
        }

        let cache_key = key.cache_key();
        match backend.get(&cache_key).await {
            Ok(Some(cached)) => match serde_json::from_str(&cached) {
                Ok(value) => {
                    self.breaker.record_success().await;
                    record_cache_event("hit");
                    return Ok(value);
                }
                Err(error) => {
                    tracing::debug!(%error, key = %cache_key, "ignoring undecodable cache entry");
                    record_cache_event("miss");
                }
            },
            Ok(None) => record_cache_event("miss"),
            Err(error) => {
                self.breaker.record_failure(&error).await;
                record_cache_event("error");
                return compute().await;
            }
        }

        let value = compute().await?;
        let serialized = match serde_json::to_string(&value) {
            Ok(serialized) => serialized,
            Err(error) => {
                tracing::debug!(%error, operation = key.operation_name(), "result not cached");
                record_cache_event("skip");
                return Ok(value);
            }
        };
        match backend.set(&cache_key, serialized, ttl).await {
            Ok(()) => self.breaker.record_success().await,
            Err(error) => {
                self.breaker.record_failure(&error).await;
                record_cache_event("error");
            }
        }
        Ok(value)
    }
}
