//! Integration tests for cached JSON fetches.

// std
use std::{sync::Arc, time::Duration};
// crates.io
use dashboard_cache::{
	CacheKey, Error, FetchOptions, JsonFetcher, MemoryStore, RequestCache, Result,
};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::{
	Mock, MockServer, ResponseTemplate, Times,
	matchers::{method, path},
};

const REPORT_PATH: &str = "/v1beta/properties/1234:runReport";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Report {
	metric: String,
	value: u64,
}

fn report_key() -> CacheKey {
	CacheKey::builder()
		.param("property", "1234")
		.param("metric", "sessions")
		.param("days", 28)
		.build()
}

fn fetch_report(
	fetcher: &JsonFetcher,
	url: &Url,
) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, Result<Report>> + Send + 'static {
	let fetcher = fetcher.clone();
	let url = url.clone();

	move |token| Box::pin(async move { fetcher.fetch::<Report>(url, token).await })
}

async fn mount_report(server: &MockServer, delay: Duration, expected_calls: impl Into<Times>) {
	Mock::given(method("GET"))
		.and(path(REPORT_PATH))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(serde_json::json!({ "metric": "sessions", "value": 1_337 }))
				.set_delay(delay),
		)
		.expect(expected_calls)
		.mount(server)
		.await;
}

#[tokio::test]
async fn concurrent_fetches_hit_the_origin_once() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount_report(&server, Duration::from_millis(100), 1).await;

	let cache = RequestCache::<Report>::builder().name("ga4").build()?;
	let fetcher = JsonFetcher::new()?;
	let url = Url::parse(&format!("{}{REPORT_PATH}", server.uri()))?;
	let key = report_key();
	let (first, second) = tokio::join!(
		cache.fetch_with_cache(&key, fetch_report(&fetcher, &url), FetchOptions::new()),
		cache.fetch_with_cache(&key, fetch_report(&fetcher, &url), FetchOptions::new()),
	);
	let (first, second) = (first?, second?);

	assert!(Arc::ptr_eq(&first, &second));
	assert_eq!(*first, Report { metric: "sessions".into(), value: 1_337 });

	let cached =
		cache.fetch_with_cache(&key, fetch_report(&fetcher, &url), FetchOptions::new()).await?;

	assert!(Arc::ptr_eq(&first, &cached));
	assert_eq!(cache.in_flight_count().await, 0);

	Ok(())
}

#[tokio::test]
async fn persisted_reports_survive_a_new_cache_instance() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount_report(&server, Duration::ZERO, 1).await;

	let store = MemoryStore::new();
	let fetcher = JsonFetcher::new()?;
	let url = Url::parse(&format!("{}{REPORT_PATH}", server.uri()))?;
	let key = report_key();
	let options = FetchOptions::new().ttl(Duration::from_secs(60));
	let first_session = RequestCache::<Report>::builder().store(store.clone()).build()?;
	let fetched =
		first_session.fetch_with_cache(&key, fetch_report(&fetcher, &url), options).await?;
	let second_session = RequestCache::<Report>::builder().store(store.clone()).build()?;
	let restored =
		second_session.fetch_with_cache(&key, fetch_report(&fetcher, &url), options).await?;

	assert_eq!(fetched, restored);
	assert!(!Arc::ptr_eq(&fetched, &restored));

	Ok(())
}

#[tokio::test]
async fn aborted_fetches_surface_as_cancelled() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	mount_report(&server, Duration::from_secs(5), 0..=1).await;

	let cache = RequestCache::<Report>::builder().build()?;
	let fetcher = JsonFetcher::new()?;
	let url = Url::parse(&format!("{}{REPORT_PATH}", server.uri()))?;
	let key = report_key();
	let pending = cache.request(&key, fetch_report(&fetcher, &url), FetchOptions::new()).await;

	// Let the request reach the mock before aborting it.
	tokio::time::sleep(Duration::from_millis(100)).await;

	assert_eq!(cache.abort_all().await, 1);

	let err = pending.await.expect_err("cancelled");

	assert!(err.is_cancelled(), "unexpected error: {err}");
	assert!(cache.get(&key).await.is_none());

	Ok(())
}

#[tokio::test]
async fn upstream_statuses_are_reported() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path(REPORT_PATH))
		.respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
		.expect(1)
		.mount(&server)
		.await;

	let cache = RequestCache::<Report>::builder().build()?;
	let fetcher = JsonFetcher::new()?;
	let url = Url::parse(&format!("{}{REPORT_PATH}", server.uri()))?;
	let err = cache
		.fetch_with_cache(&report_key(), fetch_report(&fetcher, &url), FetchOptions::new())
		.await
		.expect_err("upstream failure");

	assert_eq!(err.status_code(), Some(503));
	assert!(matches!(err, Error::HttpStatus { body: Some(ref body), .. } if body == "maintenance"));
	assert_eq!(cache.in_flight_count().await, 0);

	Ok(())
}
