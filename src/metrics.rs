//! Metrics helpers and per-cache telemetry bookkeeping.

// std
#[cfg(feature = "prometheus")] use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
// crates.io
#[cfg(feature = "metrics")] use metrics::Label;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
#[cfg(feature = "metrics")] use smallvec::SmallVec;
// self
use crate::_prelude::*;

#[cfg(feature = "metrics")]
type LabelSet = SmallVec<[Label; 2]>;

#[cfg(feature = "metrics")]
const METRIC_REQUESTS_TOTAL: &str = "dashboard_cache_requests_total";
#[cfg(feature = "metrics")]
const METRIC_HITS_TOTAL: &str = "dashboard_cache_hits_total";
#[cfg(feature = "metrics")]
const METRIC_STALE_TOTAL: &str = "dashboard_cache_stale_total";
#[cfg(feature = "metrics")]
const METRIC_MISSES_TOTAL: &str = "dashboard_cache_misses_total";
#[cfg(feature = "metrics")]
const METRIC_JOINED_TOTAL: &str = "dashboard_cache_joined_total";
#[cfg(feature = "metrics")]
const METRIC_FETCH_TOTAL: &str = "dashboard_cache_fetch_total";
#[cfg(feature = "metrics")]
const METRIC_FETCH_DURATION: &str = "dashboard_cache_fetch_duration_seconds";
#[cfg(feature = "metrics")]
const METRIC_FETCH_ERRORS: &str = "dashboard_cache_fetch_errors_total";
#[cfg(feature = "metrics")]
const METRIC_PERSISTENCE_ERRORS: &str = "dashboard_cache_persistence_errors_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thread-safe metrics accumulator for a single cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
	total_requests: AtomicU64,
	cache_hits: AtomicU64,
	stale_serves: AtomicU64,
	misses: AtomicU64,
	joined_requests: AtomicU64,
	fetch_successes: AtomicU64,
	fetch_errors: AtomicU64,
	cancellations: AtomicU64,
	persistence_errors: AtomicU64,
	last_fetch_micros: AtomicU64,
	has_fetched: AtomicBool,
}
impl CacheMetrics {
	/// Create a new metrics accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record a lookup served from the cache.
	pub fn record_hit(&self, stale: bool) {
		self.total_requests.fetch_add(1, Ordering::Relaxed);
		self.cache_hits.fetch_add(1, Ordering::Relaxed);

		if stale {
			self.stale_serves.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Record a lookup that issued a new request.
	pub fn record_miss(&self) {
		self.total_requests.fetch_add(1, Ordering::Relaxed);
		self.misses.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a lookup that joined an in-flight request.
	pub fn record_join(&self) {
		self.total_requests.fetch_add(1, Ordering::Relaxed);
		self.joined_requests.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a successful fetch and its latency.
	pub fn record_fetch_success(&self, duration: Duration) {
		self.fetch_successes.fetch_add(1, Ordering::Relaxed);
		let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);

		self.last_fetch_micros.store(micros, Ordering::Relaxed);
		self.has_fetched.store(true, Ordering::Relaxed);
	}

	/// Record a failed fetch.
	pub fn record_fetch_error(&self) {
		self.fetch_errors.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a cancelled fetch.
	pub fn record_cancellation(&self) {
		self.cancellations.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a persistent-tier failure.
	pub fn record_persistence_error(&self) {
		self.persistence_errors.fetch_add(1, Ordering::Relaxed);
	}

	/// Take a point-in-time snapshot for status reporting.
	pub fn snapshot(&self) -> CacheMetricsSnapshot {
		CacheMetricsSnapshot {
			total_requests: self.total_requests.load(Ordering::Relaxed),
			cache_hits: self.cache_hits.load(Ordering::Relaxed),
			stale_serves: self.stale_serves.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			joined_requests: self.joined_requests.load(Ordering::Relaxed),
			fetch_successes: self.fetch_successes.load(Ordering::Relaxed),
			fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
			cancellations: self.cancellations.load(Ordering::Relaxed),
			persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
			last_fetch_micros: self
				.has_fetched
				.load(Ordering::Relaxed)
				.then(|| self.last_fetch_micros.load(Ordering::Relaxed)),
		}
	}
}

/// Read-only snapshot of per-cache telemetry counters.
#[derive(Clone, Debug, Serialize)]
pub struct CacheMetricsSnapshot {
	/// Total number of `fetch_with_cache` lookups observed.
	pub total_requests: u64,
	/// Lookups served from the cache, fresh or stale.
	pub cache_hits: u64,
	/// Lookups served from stale entries.
	pub stale_serves: u64,
	/// Lookups that issued a new request.
	pub misses: u64,
	/// Lookups that joined an in-flight request.
	pub joined_requests: u64,
	/// Fetches that completed and populated the cache.
	pub fetch_successes: u64,
	/// Fetches that failed for reasons other than cancellation.
	pub fetch_errors: u64,
	/// Fetches aborted before completion.
	pub cancellations: u64,
	/// Persistent-tier reads or writes that failed.
	pub persistence_errors: u64,
	/// Microsecond latency of the most recent successful fetch.
	pub last_fetch_micros: Option<u64>,
}
impl CacheMetricsSnapshot {
	/// Ratio of lookups served from the cache.
	pub fn hit_rate(&self) -> f64 {
		if self.total_requests == 0 {
			0.0
		} else {
			self.cache_hits as f64 / self.total_requests as f64
		}
	}

	/// Ratio of lookups served from stale entries.
	pub fn stale_ratio(&self) -> f64 {
		if self.total_requests == 0 {
			0.0
		} else {
			self.stale_serves as f64 / self.total_requests as f64
		}
	}
}

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new().install_recorder()?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a cache hit, tagging whether it was served stale.
pub fn record_hit(cache: &str, stale: bool) {
	#[cfg(feature = "metrics")]
	{
		let labels = base_labels(cache);

		metrics::counter!(METRIC_REQUESTS_TOTAL, labels.iter()).increment(1);
		metrics::counter!(METRIC_HITS_TOTAL, labels.iter()).increment(1);

		if stale {
			metrics::counter!(METRIC_STALE_TOTAL, labels.iter()).increment(1);
		}
	}
	#[cfg(not(feature = "metrics"))]
	let _ = (cache, stale);
}

/// Record a lookup that issued a new upstream request.
pub fn record_miss(cache: &str) {
	#[cfg(feature = "metrics")]
	{
		let labels = base_labels(cache);

		metrics::counter!(METRIC_REQUESTS_TOTAL, labels.iter()).increment(1);
		metrics::counter!(METRIC_MISSES_TOTAL, labels.iter()).increment(1);
	}
	#[cfg(not(feature = "metrics"))]
	let _ = cache;
}

/// Record a lookup that joined an in-flight request.
pub fn record_join(cache: &str) {
	#[cfg(feature = "metrics")]
	{
		let labels = base_labels(cache);

		metrics::counter!(METRIC_REQUESTS_TOTAL, labels.iter()).increment(1);
		metrics::counter!(METRIC_JOINED_TOTAL, labels.iter()).increment(1);
	}
	#[cfg(not(feature = "metrics"))]
	let _ = cache;
}

/// Record a successful fetch along with its latency.
pub fn record_fetch_success(cache: &str, duration: Duration) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(METRIC_FETCH_TOTAL, status_labels(cache, "success").iter()).increment(1);
		metrics::histogram!(METRIC_FETCH_DURATION, base_labels(cache).iter())
			.record(duration.as_secs_f64());
	}
	#[cfg(not(feature = "metrics"))]
	let _ = (cache, duration);
}

/// Record a failed fetch.
pub fn record_fetch_error(cache: &str) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(METRIC_FETCH_TOTAL, status_labels(cache, "error").iter()).increment(1);
		metrics::counter!(METRIC_FETCH_ERRORS, base_labels(cache).iter()).increment(1);
	}
	#[cfg(not(feature = "metrics"))]
	let _ = cache;
}

/// Record a cancelled fetch.
pub fn record_cancellation(cache: &str) {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_FETCH_TOTAL, status_labels(cache, "cancelled").iter()).increment(1);
	#[cfg(not(feature = "metrics"))]
	let _ = cache;
}

/// Record a persistent-tier failure.
pub fn record_persistence_error(cache: &str) {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_PERSISTENCE_ERRORS, base_labels(cache).iter()).increment(1);
	#[cfg(not(feature = "metrics"))]
	let _ = cache;
}

#[cfg(feature = "metrics")]
fn base_labels(cache: &str) -> LabelSet {
	let mut labels = LabelSet::new();

	labels.push(Label::new("cache", cache.to_owned()));

	labels
}

#[cfg(feature = "metrics")]
fn status_labels(cache: &str, status: &'static str) -> LabelSet {
	let mut labels = base_labels(cache);

	labels.push(Label::new("status", status));

	labels
}
