//! Error handling.

use axum::{
    extract::rejection::QueryRejection,
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};

/// Forecast server error type
///
/// This type encapsulates the various errors that may occur.
/// Each variant may result in a different API error response.
#[derive(Debug, Error)]
pub enum ForecastError {
    /// A region, forecast date, file, entity or target date does not exist
    #[error("{what} not found")]
    NotFound { what: String },

    /// Files expected to agree on stations or target dates do not
    #[error("inconsistent forecast data: {reason}")]
    Inconsistent { reason: String },

    /// The external cache service failed
    #[error("cache service unavailable: {error}")]
    CacheUnavailable { error: String },

    /// Another worker holds the lock on a warm cache entry
    #[error("lock busy: {path}")]
    LockBusy { path: String },

    /// A request parameter has an invalid value
    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// Error deserialising the request query string
    #[error("request query is not valid")]
    RequestQueryRejection(#[from] QueryRejection),

    /// Error validating request data
    #[error("request data is not valid")]
    RequestDataValidation(#[from] validator::ValidationErrors),

    /// Error reading a forecast file
    #[error("failed to read dataset {path}: {reason}")]
    Dataset { path: String, reason: String },

    /// Error accessing the file system
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Error (de)serialising cached data
    #[error("failed to (de)serialise data")]
    Serialization(#[from] serde_json::Error),

    /// A worker task panicked or was cancelled
    #[error("worker task failed")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),
}

impl ForecastError {
    /// Returns a [ForecastError::NotFound] describing the missing item.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Returns a [ForecastError::Inconsistent] with the given reason.
    pub fn inconsistent(reason: impl Into<String>) -> Self {
        Self::Inconsistent {
            reason: reason.into(),
        }
    }

    /// Returns a [ForecastError::InvalidParameter] for the named parameter.
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// Returns a [ForecastError::Dataset] for a file that could not be read.
    pub fn dataset(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        Self::Dataset {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error means that the requested data does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl IntoResponse for ForecastError {
    /// Convert from a `ForecastError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Main error message
    message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    fn new<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        let message = error.to_string();
        let mut causes = Vec::new();
        let mut current = error.source();
        while let Some(source) = current {
            causes.push(source.to_string());
            current = source.source();
        }
        causes.dedup();
        let caused_by = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };
        ErrorBody { message, caused_by }
    }
}

/// A response to send in error cases
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl ErrorResponse {
    fn new<E>(status: StatusCode, error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        ErrorResponse {
            status,
            error: ErrorBody::new(error),
        }
    }
}

impl From<ForecastError> for ErrorResponse {
    /// Convert from a `ForecastError` into an `ErrorResponse`.
    fn from(error: ForecastError) -> Self {
        let status = match &error {
            ForecastError::NotFound { .. } => StatusCode::NOT_FOUND,

            ForecastError::InvalidParameter { .. }
            | ForecastError::RequestQueryRejection(_)
            | ForecastError::RequestDataValidation(_) => StatusCode::BAD_REQUEST,

            ForecastError::Inconsistent { .. }
            | ForecastError::CacheUnavailable { .. }
            | ForecastError::LockBusy { .. }
            | ForecastError::Dataset { .. }
            | ForecastError::Io(_)
            | ForecastError::Serialization(_)
            | ForecastError::TaskJoin(_)
            | ForecastError::SemaphoreAcquireError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let response = Self::new(status, &error);

        // Log server errors.
        if response.status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        response
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        let json_body = serde_json::to_string_pretty(&self);
        match json_body {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}
