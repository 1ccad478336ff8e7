//! Cancellation-aware JSON fetcher for cache-backed data sources.

// crates.io
use reqwest::{Client, redirect::Policy};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use url::Url;
// self
use crate::_prelude::*;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default size guard (8 MiB).
pub const DEFAULT_MAX_RESPONSE_BYTES: u64 = 8 * 1_048_576;

/// HTTP fetcher producing typed JSON payloads for [`RequestCache`](crate::RequestCache).
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct JsonFetcher {
	client: Client,
	request_timeout: Duration,
	max_response_bytes: u64,
}
impl JsonFetcher {
	/// Build a fetcher with a default reqwest client.
	pub fn new() -> Result<Self> {
		let client = Client::builder()
			.redirect(Policy::limited(5))
			.user_agent(format!("dashboard-cache/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(Duration::from_secs(5))
			.build()?;

		Ok(Self::with_client(client))
	}

	/// Build a fetcher around an existing client.
	pub fn with_client(client: Client) -> Self {
		Self {
			client,
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
		}
	}

	/// Override the per-request timeout.
	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.request_timeout = timeout;

		self
	}

	/// Override the response size guard.
	pub fn max_response_bytes(mut self, bytes: u64) -> Self {
		self.max_response_bytes = bytes;

		self
	}

	/// GET `url` and decode the JSON body.
	///
	/// Resolves to [`Error::Cancelled`] as soon as `token` fires, dropping the request.
	pub async fn fetch<T>(&self, url: Url, token: CancellationToken) -> Result<T>
	where
		T: DeserializeOwned,
	{
		tokio::select! {
			biased;
			_ = token.cancelled() => {
				tracing::debug!(%url, "fetch aborted");

				Err(Error::Cancelled { key: url.to_string() })
			},
			outcome = self.fetch_uncancelled(url.clone()) => outcome,
		}
	}

	async fn fetch_uncancelled<T>(&self, url: Url) -> Result<T>
	where
		T: DeserializeOwned,
	{
		let start = Instant::now();
		let response = self
			.client
			.get(url.clone())
			.header(reqwest::header::ACCEPT, "application/json")
			.timeout(self.request_timeout)
			.send()
			.await?;
		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.ok();

			return Err(Error::HttpStatus { status, url, body });
		}

		let bytes = response.bytes().await?;

		if bytes.len() as u64 > self.max_response_bytes {
			return Err(Error::Validation {
				field: "max_response_bytes",
				reason: format!(
					"Response size {size} bytes exceeds the configured guard of {limit} bytes.",
					size = bytes.len(),
					limit = self.max_response_bytes
				),
			});
		}

		let payload = serde_json::from_slice(&bytes)?;

		tracing::debug!(%url, %status, elapsed = ?start.elapsed(), "json fetch complete");

		Ok(payload)
	}
}
