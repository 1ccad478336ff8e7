//! Two-tier request cache with stale-while-revalidate, in-flight deduplication, cancellation,
//! and per-key exponential backoff for dashboard data sources.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
pub mod config;
pub mod http;
pub mod metrics;
pub mod rate_limit;

mod error;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, TimeDelta, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}
#[cfg(test)]
mod _test {
	use metrics_util as _;
	use tracing_subscriber as _;
	use wiremock as _;
}

#[cfg(feature = "redis")] pub use crate::cache::store::RedisStore;
#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	cache::{
		entry::{Freshness, Lookup},
		flight::{FetchOrigin, PendingFetch},
		key::{CacheKey, CacheKeyBuilder},
		manager::{CacheStatus, Cacheable, FetchOptions, RequestCache, RequestCacheBuilder},
		store::{MemoryStore, NoopStore, PersistentStore},
	},
	config::{CacheConfig, RateLimitPolicy},
	error::{Error, Result},
	http::client::JsonFetcher,
	metrics::{CacheMetrics, CacheMetricsSnapshot},
	rate_limit::{RateLimitDecision, RateLimitState, RateLimiter, is_quota_error, is_quota_message},
};
