//! Per-key exponential backoff guarding overloaded downstream dependencies.
//!
//! Keys name a logical operation, e.g. `insights:<metric-id>`. A key has no state until
//! its first failure; any success deletes the state again.

// std
use std::{
	collections::HashMap,
	future::Future,
	sync::{Mutex, MutexGuard, PoisonError},
};
// self
use crate::{_prelude::*, config::RateLimitPolicy};

const QUOTA_MARKERS: [&str; 3] = ["quota", "rate limit", "too many requests"];

/// Outcome of [`RateLimiter::should_allow`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
	/// The operation may run now.
	Allowed,
	/// The key is inside its backoff window.
	Throttled {
		/// Time left before the next attempt is allowed.
		wait: Duration,
	},
}
impl RateLimitDecision {
	/// Whether the operation may run now.
	pub fn is_allowed(&self) -> bool {
		matches!(self, Self::Allowed)
	}

	/// Remaining wait when throttled.
	pub fn wait(&self) -> Option<Duration> {
		match self {
			Self::Allowed => None,
			Self::Throttled { wait } => Some(*wait),
		}
	}
}

/// Failure bookkeeping for a single key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitState {
	/// Consecutive failures since the last success.
	pub attempts: u32,
	/// When the most recent failure was recorded.
	pub last_attempt_at: Instant,
	/// Required wait after `last_attempt_at` before the next attempt.
	pub backoff: Duration,
}
impl RateLimitState {
	/// Wait still owed at `now`; zero once the backoff window elapsed.
	pub fn remaining(&self, now: Instant) -> Duration {
		self.backoff.saturating_sub(now.saturating_duration_since(self.last_attempt_at))
	}
}

/// Per-key exponential backoff tracker.
#[derive(Debug, Default)]
pub struct RateLimiter {
	policy: RateLimitPolicy,
	states: Mutex<HashMap<String, RateLimitState>>,
}
impl RateLimiter {
	/// Create a limiter with the default policy.
	pub fn new() -> Self {
		Self::default()
	}

	/// Create a limiter with a validated custom policy.
	pub fn with_policy(policy: RateLimitPolicy) -> Result<Self> {
		policy.validate()?;

		Ok(Self { policy, states: Mutex::default() })
	}

	/// Active backoff policy.
	pub fn policy(&self) -> &RateLimitPolicy {
		&self.policy
	}

	/// Decide whether an attempt for `key` may run now.
	///
	/// An elapsed backoff window allows the attempt without resetting the state; only a
	/// recorded success does that.
	pub fn should_allow(&self, key: &str) -> RateLimitDecision {
		let states = self.states();
		let Some(state) = states.get(key) else {
			return RateLimitDecision::Allowed;
		};
		let wait = state.remaining(Instant::now());

		if wait.is_zero() {
			RateLimitDecision::Allowed
		} else {
			tracing::debug!(key, ?wait, attempts = state.attempts, "attempt throttled");

			RateLimitDecision::Throttled { wait }
		}
	}

	/// Forget every failure recorded for `key`.
	pub fn record_success(&self, key: &str) {
		if self.states().remove(key).is_some() {
			tracing::debug!(key, "backoff reset after success");
		}
	}

	/// Record a failure for `key` and return the backoff now in force.
	///
	/// Quota failures never back off for less than the policy's quota floor.
	pub fn record_failure(&self, key: &str, is_quota: bool) -> Duration {
		let mut states = self.states();
		let attempts = states.get(key).map_or(0, |state| state.attempts).saturating_add(1);
		let backoff = self.policy.backoff_for(attempts, is_quota);

		states.insert(
			key.to_owned(),
			RateLimitState { attempts, last_attempt_at: Instant::now(), backoff },
		);

		tracing::warn!(key, attempts, ?backoff, is_quota, "downstream failure; backing off");

		backoff
	}

	/// Current failure state for `key`, if any.
	pub fn state(&self, key: &str) -> Option<RateLimitState> {
		self.states().get(key).copied()
	}

	/// Run `op` under the limiter.
	///
	/// Returns [`Error::RateLimited`] without running `op` while `key` is throttled.
	/// Successes reset the key, failures extend its backoff, and cancellations leave it
	/// untouched.
	pub async fn run<F, Fut, R>(&self, key: &str, op: F) -> Result<R>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<R>>,
	{
		if let RateLimitDecision::Throttled { wait } = self.should_allow(key) {
			return Err(Error::RateLimited { key: key.to_owned(), wait });
		}

		match op().await {
			Ok(value) => {
				self.record_success(key);

				Ok(value)
			},
			Err(err) if err.is_cancelled() => Err(err),
			Err(err) => {
				self.record_failure(key, is_quota_error(&err));

				Err(err)
			},
		}
	}

	fn states(&self) -> MutexGuard<'_, HashMap<String, RateLimitState>> {
		self.states.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// Whether `error` signals an exhausted quota or upstream rate limiting.
///
/// Matches HTTP 429 and 403 statuses, or a message mentioning a quota, a rate limit, or
/// too many requests.
pub fn is_quota_error(error: &Error) -> bool {
	matches!(error.status_code(), Some(429 | 403)) || is_quota_message(&error.to_string())
}

/// Case-insensitive check of `message` for quota or rate-limit wording.
pub fn is_quota_message(message: &str) -> bool {
	let message = message.to_lowercase();

	QUOTA_MARKERS.iter().any(|marker| message.contains(marker))
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn limiter() -> RateLimiter {
		RateLimiter::with_policy(RateLimitPolicy {
			base_backoff: Duration::from_secs(1),
			max_backoff: Duration::from_secs(3),
			quota_floor: Duration::from_secs(30),
		})
		.expect("policy")
	}

	#[tokio::test(start_paused = true)]
	async fn unknown_keys_are_allowed() {
		assert_eq!(limiter().should_allow("insights:sessions"), RateLimitDecision::Allowed);
	}

	#[tokio::test(start_paused = true)]
	async fn backoff_grows_geometrically_and_caps() {
		let limiter = limiter();
		let key = "insights:sessions";
		let mut observed = Vec::new();

		for _ in 0..3 {
			observed.push(limiter.record_failure(key, false));
		}

		assert_eq!(
			observed,
			vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(3)]
		);
		assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
		assert_eq!(limiter.state(key).map(|state| state.attempts), Some(3));

		limiter.record_success(key);

		assert_eq!(limiter.should_allow(key), RateLimitDecision::Allowed);
		assert!(limiter.state(key).is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn throttles_until_the_window_elapses() {
		let limiter = limiter();
		let key = "insights:bounce-rate";

		limiter.record_failure(key, false);
		limiter.record_failure(key, false);
		tokio::time::advance(Duration::from_millis(500)).await;

		assert_eq!(
			limiter.should_allow(key),
			RateLimitDecision::Throttled { wait: Duration::from_millis(1_500) }
		);

		tokio::time::advance(Duration::from_millis(1_500)).await;

		assert!(limiter.should_allow(key).is_allowed());
		// Allowing does not reset; the next failure compounds.
		assert_eq!(limiter.record_failure(key, false), Duration::from_secs(3));
	}

	#[tokio::test(start_paused = true)]
	async fn quota_failures_respect_the_floor() {
		let limiter = limiter();

		assert_eq!(limiter.record_failure("insights:quota", true), Duration::from_secs(30));
		assert_eq!(
			limiter.should_allow("insights:quota").wait(),
			Some(Duration::from_secs(30))
		);
	}

	#[tokio::test(start_paused = true)]
	async fn run_records_outcomes() {
		let limiter = limiter();
		let key = "insights:conversions";
		let err = limiter
			.run(key, || async { Err::<(), _>(Error::Upstream("Too Many Requests".into())) })
			.await
			.expect_err("failure");

		assert!(matches!(err, Error::Upstream(_)));
		assert_eq!(limiter.state(key).map(|state| state.backoff), Some(Duration::from_secs(30)));

		let throttled = limiter.run(key, || async { Ok(1) }).await.expect_err("throttled");

		assert!(matches!(throttled, Error::RateLimited { .. }));

		tokio::time::advance(Duration::from_secs(30)).await;

		assert_eq!(limiter.run(key, || async { Ok(2) }).await.expect("allowed"), 2);
		assert!(limiter.state(key).is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn run_ignores_cancellation() {
		let limiter = limiter();
		let key = "insights:cancelled";
		let err = limiter
			.run(key, || async { Err::<(), _>(Error::Cancelled { key: key.into() }) })
			.await
			.expect_err("cancelled");

		assert!(err.is_cancelled());
		assert!(limiter.state(key).is_none());
	}

	#[test]
	fn classifies_quota_errors() {
		let url = url::Url::parse("https://analyticsdata.googleapis.com/v1beta").expect("url");

		for status in [http::StatusCode::TOO_MANY_REQUESTS, http::StatusCode::FORBIDDEN] {
			let err = Error::HttpStatus { status, url: url.clone(), body: None };

			assert!(is_quota_error(&err), "{status} should be quota-classed");
		}

		let server_error =
			Error::HttpStatus { status: http::StatusCode::BAD_GATEWAY, url, body: None };

		assert!(!is_quota_error(&server_error));
		assert!(is_quota_error(&Error::Upstream("Exhausted QUOTA for project".into())));
		assert!(is_quota_error(&Error::Upstream("Rate limit reached".into())));
		assert!(!is_quota_error(&Error::Upstream("connection reset".into())));
		assert!(!is_quota_message("rate-limited"));
	}
}
