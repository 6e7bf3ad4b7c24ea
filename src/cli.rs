//! Command Line Interface (CLI) arguments.

use crate::warm_cache;

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use strum_macros::Display;

/// Cache service used by the request cache
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum CacheBackendKind {
    /// No request cache
    None,
    /// In-process cache
    Local,
    /// Redis server
    Redis,
}

/// Analogcast server command line interface
#[derive(Clone, Debug, Parser)]
#[command(version, about)]
pub struct CommandLineArgs {
    /// The IP address on which the server should listen
    #[arg(long, default_value = "0.0.0.0", env = "ANALOGCAST_HOST")]
    pub host: String,
    /// The port to which the server should bind
    #[arg(long, default_value_t = 8080, env = "ANALOGCAST_PORT")]
    pub port: u16,
    /// Flag indicating whether HTTPS should be used
    #[arg(long, default_value_t = false, env = "ANALOGCAST_HTTPS")]
    pub https: bool,
    /// Path to the certificate file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/analogcast/certs/cert.pem",
        env = "ANALOGCAST_CERT_FILE"
    )]
    pub cert_file: String,
    /// Path to the key file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/analogcast/certs/key.pem",
        env = "ANALOGCAST_KEY_FILE"
    )]
    pub key_file: String,
    /// Maximum time in seconds to wait for operations to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "ANALOGCAST_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "ANALOGCAST_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
    /// Whether to use Rayon for execution of CPU-bound tasks.
    #[arg(long, default_value_t = false, env = "ANALOGCAST_USE_RAYON")]
    pub use_rayon: bool,
    /// Maximum number of computations running at once.
    /// Defaults to the number of CPUs minus one.
    #[arg(long, env = "ANALOGCAST_THREAD_LIMIT")]
    pub thread_limit: Option<usize>,
    /// Directory holding one subdirectory of forecast files per region.
    #[arg(long, default_value = "./data", env = "ANALOGCAST_DATA_DIR")]
    pub data_dir: PathBuf,
    /// Cache service of the request cache.
    #[arg(
        long,
        value_enum,
        default_value_t = CacheBackendKind::Redis,
        env = "ANALOGCAST_CACHE_BACKEND"
    )]
    pub cache_backend: CacheBackendKind,
    /// URL of the Redis server.
    #[arg(long, default_value = "redis://127.0.0.1:6379/0", env = "ANALOGCAST_REDIS_URL")]
    pub redis_url: String,
    /// Prefix of the request cache keys.
    #[arg(long, default_value = "analogcast", env = "ANALOGCAST_CACHE_PREFIX")]
    pub cache_prefix: String,
    /// Lifetime of request cache entries, in seconds.
    #[arg(long, default_value_t = 3600, env = "ANALOGCAST_CACHE_TTL")]
    pub cache_ttl: u64,
    /// Timeout of each request to the cache service, in milliseconds.
    #[arg(long, default_value_t = 500, env = "ANALOGCAST_CACHE_TIMEOUT")]
    pub cache_timeout: u64,
    /// Maximum number of entries of the local cache.
    #[arg(long, default_value_t = 1000, env = "ANALOGCAST_LOCAL_CACHE_SIZE")]
    pub local_cache_size: usize,
    /// Number of consecutive cache service failures that open the circuit breaker.
    #[arg(long, default_value_t = 1, env = "ANALOGCAST_BREAKER_FAILURE_THRESHOLD")]
    pub breaker_failure_threshold: u32,
    /// Time in seconds before the cache service is probed again after a failure.
    #[arg(long, default_value_t = 30, env = "ANALOGCAST_BREAKER_COOLDOWN")]
    pub breaker_cooldown: u64,
    /// Whether to serve fresh results precomputed by the warmup tool.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "ANALOGCAST_USE_WARM_CACHE"
    )]
    pub use_warm_cache: bool,
    /// Directory of precomputed results. Defaults to `.prebuilt_cache` in the data directory.
    #[arg(long, env = "ANALOGCAST_WARM_CACHE_DIR")]
    pub warm_cache_dir: Option<PathBuf>,
}

impl CommandLineArgs {
    /// Directory of precomputed results.
    pub fn warm_cache_dir(&self) -> PathBuf {
        self.warm_cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(warm_cache::DEFAULT_DIR_NAME))
    }
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}

/// Operations the warmup tool can precompute
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, ValueEnum)]
#[strum(serialize_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum WarmOperation {
    SeriesSynthesisPerMethod,
    SeriesSynthesisTotal,
    ListMethods,
    ListMethodsAndConfigs,
    EntitiesAnalogValuesPercentile,
}

/// Analogcast warmup command line interface
///
/// Precomputes the results of recent forecasts so that the server can serve them without
/// reading forecast files.
#[derive(Clone, Debug, Parser)]
#[command(version, about)]
pub struct WarmupArgs {
    /// Directory holding one subdirectory of forecast files per region.
    #[arg(long, default_value = "./data", env = "ANALOGCAST_DATA_DIR")]
    pub data_dir: PathBuf,
    /// Forecasts with files modified within this many days are considered.
    #[arg(long, default_value_t = 10)]
    pub days: u32,
    /// Operations to precompute.
    #[arg(
        long,
        value_enum,
        value_delimiter = ',',
        num_args = 1..,
        default_values_t = [WarmOperation::SeriesSynthesisPerMethod, WarmOperation::SeriesSynthesisTotal]
    )]
    pub functions: Vec<WarmOperation>,
    /// Regions to process. Defaults to every region of the data directory.
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub regions: Vec<String>,
    /// Percentile of the aggregations.
    #[arg(long, default_value_t = 90, value_parser = clap::value_parser!(u32).range(0..=100))]
    pub percentile: u32,
    /// Return period of the reference value the aggregations are divided by.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pub normalize: u32,
    /// Methods of the entities percentile. Defaults to every method of each forecast.
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub methods: Vec<String>,
    /// Comma separated lead times, in hours, of the entities percentile.
    #[arg(long, value_delimiter = ',', default_values_t = [0, 24, 48, 72])]
    pub lead_times: Vec<u32>,
    /// List what would be computed without computing anything.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
    /// Directory of precomputed results. Defaults to `.prebuilt_cache` in the data directory.
    #[arg(long, env = "ANALOGCAST_WARM_CACHE_DIR")]
    pub warm_cache_dir: Option<PathBuf>,
    /// Time in seconds to wait for an entry locked by another worker.
    #[arg(long, default_value_t = 5)]
    pub lock_timeout: u64,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "ANALOGCAST_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
}

impl WarmupArgs {
    /// Directory of precomputed results.
    pub fn warm_cache_dir(&self) -> PathBuf {
        self.warm_cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(warm_cache::DEFAULT_DIR_NAME))
    }
}
