//! Integration tests for backoff around quota-limited origins.

// std
use std::time::Duration;
// crates.io
use dashboard_cache::{
	Error, JsonFetcher, RateLimitDecision, RateLimitPolicy, RateLimiter, Result, is_quota_error,
};
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path},
};

#[tokio::test]
async fn quota_responses_back_off_for_at_least_the_floor() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/v1/metrics"))
		.respond_with(
			ResponseTemplate::new(429).set_body_string("Quota exceeded for quota metric 'Requests'"),
		)
		.expect(1)
		.mount(&server)
		.await;

	let limiter = RateLimiter::with_policy(RateLimitPolicy {
		base_backoff: Duration::from_millis(100),
		max_backoff: Duration::from_secs(10),
		quota_floor: Duration::from_secs(60),
	})?;
	let fetcher = JsonFetcher::new()?;
	let url = Url::parse(&format!("{}/v1/metrics", server.uri()))?;
	let key = "crux:origin";
	let err = limiter
		.run(key, || fetcher.fetch::<serde_json::Value>(url.clone(), CancellationToken::new()))
		.await
		.expect_err("quota failure");

	assert!(is_quota_error(&err));

	let state = limiter.state(key).expect("failure recorded");

	assert_eq!(state.attempts, 1);
	assert_eq!(state.backoff, Duration::from_secs(60));

	// The limiter refuses the next attempt without contacting the origin.
	let throttled = limiter
		.run(key, || fetcher.fetch::<serde_json::Value>(url.clone(), CancellationToken::new()))
		.await
		.expect_err("throttled");

	assert!(matches!(throttled, Error::RateLimited { .. }));
	assert!(matches!(limiter.should_allow(key), RateLimitDecision::Throttled { .. }));

	Ok(())
}
