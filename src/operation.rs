use crate::dataset::DataSource;
use crate::error::ForecastError;
use crate::types::ForecastKey;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// A named operation with a serialisable argument set, as seen by the caches.
pub trait Cacheable {
    /// Name of the operation.
    fn operation_name(&self) -> &'static str;

    /// Canonical serialisation of the arguments.
    ///
    /// Object keys are sorted, so two argument sets that differ only in field order serialise
    /// identically. Arguments that cannot be represented as JSON fall back to their `Debug` form.
    fn canonical_args(&self) -> String;

    /// Key of the result: a hex MD5 digest of `{operation_name}:{canonical_args}`.
    fn cache_key(&self) -> String {
        cache_key(self.operation_name(), &self.canonical_args())
    }
}

/// Returns the cache key of an operation name and canonical argument string.
pub fn cache_key(operation_name: &str, canonical_args: &str) -> String {
    let digest = md5::compute(format!("{operation_name}:{canonical_args}"));
    hex::encode(digest.0)
}

/// Recursively sorts the keys of JSON objects.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, sort_keys(value)))
                    .collect(),
            )
        }
        Value::Array(values) => Value::Array(values.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Returns the canonical serialisation of a value.
pub fn canonical_json<T: Serialize + std::fmt::Debug>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(json) => sort_keys(json).to_string(),
        Err(_) => format!("{value:?}"),
    }
}

/// Trait for forecast operations.
///
/// This forms the contract between the API layer, the caches and the computations. An operation
/// value carries every argument that affects its result.
pub trait Operation: Serialize + std::fmt::Debug + Clone + Send + Sync + 'static {
    /// Name of the operation, used in cache keys and warm cache paths.
    const NAME: &'static str;

    /// Result of the operation.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// The forecast run the result derives from, if the operation reads a single one.
    ///
    /// Only operations with a forecast key can be served from the warm cache.
    fn forecast_key(&self) -> Option<ForecastKey> {
        None
    }

    /// Execute the operation.
    ///
    /// This reads forecast files and may take a while; callers run it off the async runtime.
    fn execute(&self, source: &DataSource) -> Result<Self::Output, ForecastError>;
}

impl<T: Operation> Cacheable for T {
    fn operation_name(&self) -> &'static str {
        T::NAME
    }

    fn canonical_args(&self) -> String {
        canonical_json(self)
    }
}
