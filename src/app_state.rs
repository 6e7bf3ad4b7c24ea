use crate::cli::{CacheBackendKind, CommandLineArgs};
use crate::dataset::{default_opener, DataSource};
use crate::error::ForecastError;
use crate::operation::Operation;
use crate::operations::general::LastForecastDate;
use crate::request_cache::{CircuitBreaker, LocalBackend, RedisBackend, RequestCache};
use crate::resource_manager::ResourceManager;
use crate::types::{DateSelector, ForecastDate};
use crate::warm_cache::WarmCacheStore;

use std::sync::Arc;
use std::time::Duration;

/// Shared application state passed to each operation request handler.
pub struct AppState {
    /// Command line arguments.
    pub args: CommandLineArgs,

    /// Resource manager.
    pub resource_manager: ResourceManager,

    /// Forecast files.
    pub source: DataSource,

    /// Request cache.
    pub request_cache: RequestCache,

    /// Store of precomputed results, if enabled.
    pub warm_cache: Option<WarmCacheStore>,
}

impl AppState {
    /// Create and return an [AppState].
    pub fn new(args: &CommandLineArgs) -> Self {
        let source = DataSource::new(args.data_dir.clone(), default_opener());
        Self::with_source(args, source)
    }

    /// Create and return an [AppState] reading forecast files through `source`.
    pub fn with_source(args: &CommandLineArgs, source: DataSource) -> Self {
        let task_limit = args
            .thread_limit
            .or_else(|| Some(num_cpus::get().saturating_sub(1).max(1)));
        let resource_manager = ResourceManager::new(task_limit);
        let warm_cache = args
            .use_warm_cache
            .then(|| WarmCacheStore::new(args.warm_cache_dir()));

        Self {
            args: args.clone(),
            resource_manager,
            source,
            request_cache: request_cache(args),
            warm_cache,
        }
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.args.cache_ttl)
    }

    /// Run an operation through the request cache.
    pub async fn run<O: Operation>(&self, op: O) -> Result<O::Output, ForecastError> {
        self.request_cache
            .cached_call(&op, self.cache_ttl(), || self.compute(op.clone()))
            .await
    }

    /// Run an operation off the async runtime, serving it from the warm cache when possible.
    async fn compute<O: Operation>(&self, op: O) -> Result<O::Output, ForecastError> {
        let _permit = self.resource_manager.task().await?;
        let source = self.source.clone();
        let warm_cache = self.warm_cache.clone();
        let work = move || {
            if let Some(output) = warm_cache.and_then(|store| store.lookup(&source, &op)) {
                tracing::debug!(operation = O::NAME, "served from warm cache");
                return Ok(output);
            }
            op.execute(&source)
        };
        if self.args.use_rayon {
            tokio_rayon::spawn(work).await
        } else {
            tokio::task::spawn_blocking(work).await?
        }
    }

    /// Resolve a forecast date path parameter, which may be `latest`.
    pub async fn resolve_forecast_date(
        &self,
        region: &str,
        forecast_date: &str,
    ) -> Result<ForecastDate, ForecastError> {
        match forecast_date.parse::<DateSelector>()? {
            DateSelector::Date(date) => Ok(date),
            DateSelector::Latest => {
                let op = LastForecastDate {
                    region: region.to_string(),
                };
                Ok(self.compute(op).await?.last_forecast_date)
            }
        }
    }
}

/// Build the request cache selected on the command line.
fn request_cache(args: &CommandLineArgs) -> RequestCache {
    let breaker = CircuitBreaker::new(
        args.breaker_failure_threshold,
        Duration::from_secs(args.breaker_cooldown),
    );
    match args.cache_backend {
        CacheBackendKind::None => RequestCache::disabled(),
        CacheBackendKind::Local => {
            let backend = LocalBackend::new(
                args.local_cache_size,
                Duration::from_secs(args.cache_ttl),
            );
            RequestCache::new(Arc::new(backend), breaker)
        }
        CacheBackendKind::Redis => {
            let timeout = Duration::from_millis(args.cache_timeout);
            match RedisBackend::new(&args.redis_url, &args.cache_prefix, timeout) {
                Ok(backend) => RequestCache::new(Arc::new(backend), breaker),
                Err(error) => {
                    tracing::warn!(%error, "request cache disabled");
                    RequestCache::disabled()
                }
            }
        }
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
