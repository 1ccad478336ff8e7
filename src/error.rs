//! Crate-wide error types and `Result` alias.

// std
use std::sync::Arc;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the dashboard cache crate.
///
/// The type is `Clone` because one fetch outcome is delivered to every caller
/// that joined the same in-flight request.
#[allow(missing_docs)]
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Reqwest(Arc<reqwest::Error>),
	#[error(transparent)]
	Serde(Arc<serde_json::Error>),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[cfg(feature = "redis")]
	#[error(transparent)]
	Redis(Arc<redis::RedisError>),

	#[error("Cache error: {0}")]
	Cache(String),
	#[error("Request for '{key}' was cancelled.")]
	Cancelled {
		/// Cache key of the request, or the URL when raised by [`JsonFetcher`](crate::JsonFetcher).
		key: String,
	},
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	HttpStatus { status: http::StatusCode, url: url::Url, body: Option<String> },
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("Persistence error: {0}")]
	Persistence(String),
	#[error("Rate limited for '{key}'; retry in {wait:?}.")]
	RateLimited { key: String, wait: std::time::Duration },
	#[error("Upstream error: {0}")]
	Upstream(String),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
impl Error {
	/// Whether the error reports an aborted request rather than a failed one.
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled { .. })
	}

	/// Numeric HTTP status carried by the error, if any.
	pub fn status_code(&self) -> Option<u16> {
		match self {
			Self::HttpStatus { status, .. } => Some(status.as_u16()),
			Self::Reqwest(err) => err.status().map(|status| status.as_u16()),
			_ => None,
		}
	}
}
impl From<reqwest::Error> for Error {
	fn from(value: reqwest::Error) -> Self {
		Self::Reqwest(Arc::new(value))
	}
}
impl From<serde_json::Error> for Error {
	fn from(value: serde_json::Error) -> Self {
		Self::Serde(Arc::new(value))
	}
}
#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
	fn from(value: redis::RedisError) -> Self {
		Self::Redis(Arc::new(value))
	}
}
#[cfg(feature = "prometheus")]
impl From<metrics_exporter_prometheus::BuildError> for Error {
	fn from(value: metrics_exporter_prometheus::BuildError) -> Self {
		Self::Metrics(value.to_string())
	}
}
