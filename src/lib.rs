//! This crate provides a server of statistics over analog forecast ensembles.
//!
//! An analog forecast predicts a quantity, such as precipitation, at a set of stations by
//! retrieving past situations similar to the forecast one. Each forecast file holds, for one
//! method and configuration, the values observed on the analog dates of every lead time and
//! station. The server reads these files and returns raw analogs, percentiles of the analog
//! values, and aggregations over the configurations and methods of a forecast run.
//!
//! Results are cached twice:
//!
//! * the [request cache](crate::request_cache) holds recent responses in Redis or in memory,
//!   behind a circuit breaker that keeps requests flowing when the cache service fails;
//! * the [warm cache](crate::warm_cache) holds results precomputed by the `analogcast-warmup`
//!   tool next to the forecast files. They are served as long as no forecast file is newer.
//!
//! The server is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, on top of the [hyper] HTTP library.
//! * [Serde](serde) performs (de)serialisation of JSON response data.
//! * [ndarray] provides [NumPy](https://numpy.org)-like n-dimensional arrays used in numerical
//!   computation.
//! * [Rayon](rayon) optionally runs the computations on a thread pool.

pub mod app;
pub mod app_state;
pub mod cli;
pub mod dataset;
pub mod error;
pub mod layout;
pub mod metrics;
pub mod models;
pub mod operation;
pub mod operations;
pub mod percentile;
pub mod request_cache;
pub mod resource_manager;
pub mod server;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod types;
pub mod validated_query;
pub mod warm_cache;
pub mod warmup;
