//! Request cache coordinating lookups, deduplication, and background revalidation.

// std
use std::{
	collections::HashMap,
	fmt::{Debug, Formatter, Result as FmtResult},
	any::Any,
	future::Future,
	marker::PhantomData,
	panic::AssertUnwindSafe,
	sync::atomic::{AtomicU64, Ordering},
};
// crates.io
use futures::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
// self
use crate::{
	_prelude::*,
	cache::{
		entry::{CacheEntry, Freshness, Lookup, PersistedEntry},
		flight::{FetchOrigin, InFlightRequest, PendingFetch},
		key::CacheKey,
		store::{MemoryStore, PersistentStore},
	},
	config::CacheConfig,
	metrics::{self, CacheMetrics, CacheMetricsSnapshot},
};

/// Values that can live in a [`RequestCache`].
///
/// Serialization is required so entries can be written to the persistent tier.
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Per-call options for [`RequestCache::fetch_with_cache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchOptions {
	/// Time-to-live for the fetched value; the cache default applies when unset.
	pub ttl: Option<Duration>,
	/// Bypass cached values and supersede any in-flight request for the key.
	pub force_refresh: bool,
}
impl FetchOptions {
	/// Options with the cache default TTL and no forced refresh.
	pub fn new() -> Self {
		Self::default()
	}

	/// Set the time-to-live for the fetched value.
	pub fn ttl(mut self, ttl: Duration) -> Self {
		self.ttl = Some(ttl);

		self
	}

	/// Toggle forced refresh.
	pub fn force_refresh(mut self, force_refresh: bool) -> Self {
		self.force_refresh = force_refresh;

		self
	}
}

/// Status projection for a cache instance.
#[derive(Clone, Debug, Serialize)]
pub struct CacheStatus {
	/// Cache name from configuration.
	pub name: String,
	/// Number of entries held in the hot tier, including ones not yet purged.
	pub entries: usize,
	/// Number of requests currently in flight.
	pub in_flight: usize,
	/// Ratio of lookups served from the cache.
	pub hit_rate: f64,
	/// Ratio of lookups served from stale entries.
	pub stale_serve_ratio: f64,
	/// Raw counters.
	pub metrics: CacheMetricsSnapshot,
}

/// Two-tier request cache with deduplication and stale-while-revalidate.
///
/// The hot tier is an in-process map; the persistent tier is any [`PersistentStore`].
/// Clones share state, so construct one instance per session and hand clones to consumers.
pub struct RequestCache<T, S = MemoryStore> {
	inner: Arc<CacheInner<T, S>>,
}
impl<T> RequestCache<T, MemoryStore>
where
	T: Cacheable,
{
	/// Build a cache with default configuration over a fresh [`MemoryStore`].
	pub fn new() -> Self {
		Self::with_parts(CacheConfig::default(), MemoryStore::new())
	}

	/// Create a [`RequestCacheBuilder`] for advanced configuration.
	pub fn builder() -> RequestCacheBuilder<T> {
		RequestCacheBuilder::new()
	}
}
impl<T, S> RequestCache<T, S>
where
	T: Cacheable,
	S: PersistentStore,
{
	/// Build a cache from explicit configuration and store.
	pub fn with_store(config: CacheConfig, store: S) -> Result<Self> {
		config.validate()?;

		Ok(Self::with_parts(config, store))
	}

	fn with_parts(config: CacheConfig, store: S) -> Self {
		Self {
			inner: Arc::new(CacheInner {
				config,
				store,
				entries: RwLock::new(HashMap::new()),
				in_flight: Mutex::new(HashMap::new()),
				next_request_id: AtomicU64::new(1),
				metrics: CacheMetrics::new(),
			}),
		}
	}

	/// Active configuration.
	pub fn config(&self) -> &CacheConfig {
		&self.inner.config
	}

	/// Persistent tier backing this cache.
	pub fn store(&self) -> &S {
		&self.inner.store
	}

	/// Access the per-cache metrics accumulator.
	pub fn metrics(&self) -> Arc<CacheMetrics> {
		self.inner.metrics.clone()
	}

	/// Look up `key`, hydrating from the persistent tier when the hot tier misses.
	///
	/// Expired entries are purged from both tiers and reported as absent.
	#[tracing::instrument(skip(self, key), fields(cache = %self.inner.config.name, key = %key))]
	pub async fn get(&self, key: &CacheKey) -> Option<Lookup<T>> {
		let now = Instant::now();
		let expired = {
			let entries = self.inner.entries.read().await;

			match entries.get(key) {
				Some(entry) => match entry.lookup(now) {
					Some(lookup) => return Some(lookup),
					None => true,
				},
				None => false,
			}
		};

		if expired {
			self.purge_expired(key).await;

			return None;
		}

		self.hydrate(key, now).await
	}

	/// Store `value` under `key` in both tiers.
	///
	/// Persistent-tier failures are logged and never propagated.
	#[tracing::instrument(
		skip(self, key, value),
		fields(cache = %self.inner.config.name, key = %key)
	)]
	pub async fn set(&self, key: &CacheKey, value: T, ttl: Duration) -> Arc<T> {
		let value = Arc::new(value);

		self.store_value(key, value.clone(), ttl).await;

		value
	}

	/// Resolve `key` from the cache or through `fetcher`.
	///
	/// - A fresh entry is returned without calling `fetcher`.
	/// - A stale entry is returned immediately while `fetcher` revalidates it in the
	///   background, unless a request for the key is already in flight.
	/// - Otherwise the call joins the in-flight request for the key or issues a new one.
	///
	/// With [`FetchOptions::force_refresh`] cached entries are ignored and an in-flight
	/// request is cancelled and replaced. Cancellation surfaces as [`Error::Cancelled`].
	#[tracing::instrument(
		skip(self, key, fetcher, options),
		fields(
			cache = %self.inner.config.name,
			key = %key,
			force_refresh = options.force_refresh
		)
	)]
	pub async fn fetch_with_cache<F, Fut>(
		&self,
		key: &CacheKey,
		fetcher: F,
		options: FetchOptions,
	) -> Result<Arc<T>>
	where
		F: 'static + Send + FnOnce(CancellationToken) -> Fut,
		Fut: 'static + Send + Future<Output = Result<T>>,
	{
		if !options.force_refresh
			&& let Some(lookup) = self.get(key).await
		{
			if lookup.is_stale {
				self.observe_hit(true);
				self.revalidate(key, fetcher, options).await;
			} else {
				self.observe_hit(false);
			}

			return Ok(lookup.value);
		}

		self.request(key, fetcher, options).await.await
	}

	/// Join the in-flight request for `key` or issue a new one, without consulting cached
	/// entries.
	///
	/// Concurrent callers for the same key receive handles on the same request.
	pub async fn request<F, Fut>(
		&self,
		key: &CacheKey,
		fetcher: F,
		options: FetchOptions,
	) -> PendingFetch<T>
	where
		F: 'static + Send + FnOnce(CancellationToken) -> Fut,
		Fut: 'static + Send + Future<Output = Result<T>>,
	{
		let ttl = self.ttl(options);
		let mut in_flight = self.inner.in_flight.lock().await;

		if let Some(existing) = in_flight.get(key) {
			if !options.force_refresh {
				tracing::debug!(request_id = existing.id, "joining in-flight request");

				self.observe_join();

				return existing.pending();
			}

			tracing::debug!(request_id = existing.id, "cancelling superseded request");

			existing.cancel();
		}

		self.observe_miss();

		let request = self.issue(key.clone(), fetcher, ttl, FetchOrigin::Foreground);
		let pending = request.pending();

		in_flight.insert(key.clone(), request);

		pending
	}

	/// Cancel every in-flight request and clear the in-flight table.
	///
	/// Returns the number of cancelled requests.
	#[tracing::instrument(skip(self), fields(cache = %self.inner.config.name))]
	pub async fn abort_all(&self) -> usize {
		let drained = {
			let mut in_flight = self.inner.in_flight.lock().await;

			in_flight.drain().map(|(_, request)| request).collect::<Vec<_>>()
		};

		for request in &drained {
			request.cancel();
		}

		if !drained.is_empty() {
			tracing::debug!(count = drained.len(), "aborted in-flight requests");
		}

		drained.len()
	}

	/// Purge entries from both tiers; only keys starting with `prefix` when one is given.
	#[tracing::instrument(skip(self), fields(cache = %self.inner.config.name))]
	pub async fn clear(&self, prefix: Option<&str>) {
		{
			let mut entries = self.inner.entries.write().await;

			match prefix {
				Some(prefix) => entries.retain(|key, _| !key.as_str().starts_with(prefix)),
				None => entries.clear(),
			}
		}

		let storage_prefix =
			format!("{}{}", self.inner.config.storage_prefix, prefix.unwrap_or_default());

		match self.inner.store.keys(&storage_prefix).await {
			Ok(keys) =>
				for storage_key in keys {
					self.remove_persisted(&storage_key).await;
				},
			Err(err) => {
				self.observe_persistence_error();

				tracing::warn!(error = %err, "failed to enumerate persistent tier");
			},
		}
	}

	/// Remove a single key from both tiers.
	pub async fn invalidate(&self, key: &CacheKey) {
		self.inner.entries.write().await.remove(key);
		self.remove_persisted(&self.storage_key(key)).await;
	}

	/// Number of requests currently in flight.
	pub async fn in_flight_count(&self) -> usize {
		self.inner.in_flight.lock().await.len()
	}

	/// Capture cache status for reporting.
	pub async fn status(&self) -> CacheStatus {
		let entries = self.inner.entries.read().await.len();
		let in_flight = self.in_flight_count().await;
		let metrics = self.inner.metrics.snapshot();

		CacheStatus {
			name: self.inner.config.name.clone(),
			entries,
			in_flight,
			hit_rate: metrics.hit_rate(),
			stale_serve_ratio: metrics.stale_ratio(),
			metrics,
		}
	}

	/// Remove `key` from both tiers if it is still expired once the write lock is held.
	///
	/// The lock spans the persistent removal so a concurrent write lands after it.
	async fn purge_expired(&self, key: &CacheKey) -> bool {
		let mut entries = self.inner.entries.write().await;

		if !entries
			.get(key)
			.is_some_and(|entry| entry.freshness(Instant::now()) == Freshness::Expired)
		{
			return false;
		}

		tracing::debug!("entry expired; purging");

		entries.remove(key);
		self.remove_persisted(&self.storage_key(key)).await;

		true
	}

	async fn hydrate(&self, key: &CacheKey, now: Instant) -> Option<Lookup<T>> {
		let storage_key = self.storage_key(key);
		let raw = match self.inner.store.get(&storage_key).await {
			Ok(Some(raw)) => raw,
			Ok(None) => return None,
			Err(err) => {
				self.observe_persistence_error();

				tracing::warn!(error = %err, "failed to read persistent tier");

				return None;
			},
		};
		let record = match serde_json::from_str::<PersistedEntry<T>>(&raw) {
			Ok(record) => record,
			Err(err) => {
				tracing::warn!(error = %err, "discarding unreadable persisted entry");

				self.remove_persisted(&storage_key).await;

				return None;
			},
		};
		let Some(entry) = CacheEntry::from_persisted(record, now, Utc::now()) else {
			tracing::debug!("persisted entry expired; purging");

			self.remove_persisted(&storage_key).await;

			return None;
		};
		let mut entries = self.inner.entries.write().await;
		// A concurrent write may have landed while the store was read; it wins.
		let lookup = entries.entry(key.clone()).or_insert(entry).lookup(now);

		tracing::debug!(
			stale = lookup.as_ref().map(|lookup| lookup.is_stale),
			"hydrated from persistent tier"
		);

		lookup
	}

	async fn store_value(&self, key: &CacheKey, value: Arc<T>, ttl: Duration) {
		let now = Instant::now();
		let entry = CacheEntry::new(value, now, ttl, self.inner.config.stale_fraction);
		let serialized =
			entry.to_persisted(now, Utc::now()).map(|record| serde_json::to_string(&record));

		self.inner.entries.write().await.insert(key.clone(), entry);

		let raw = match serialized {
			Some(Ok(raw)) => raw,
			Some(Err(err)) => {
				tracing::warn!(error = %err, "failed to serialize entry for persistent tier");

				return;
			},
			None => {
				tracing::warn!(?ttl, "entry deadline cannot be represented in wall-clock time");

				return;
			},
		};

		if let Err(err) = self.inner.store.set(&self.storage_key(key), raw, ttl).await {
			self.observe_persistence_error();

			tracing::warn!(error = %err, "failed to write persistent tier");
		}
	}

	async fn remove_persisted(&self, storage_key: &str) {
		if let Err(err) = self.inner.store.remove(storage_key).await {
			self.observe_persistence_error();

			tracing::warn!(error = %err, storage_key, "failed to remove persisted entry");
		}
	}

	async fn revalidate<F, Fut>(&self, key: &CacheKey, fetcher: F, options: FetchOptions)
	where
		F: 'static + Send + FnOnce(CancellationToken) -> Fut,
		Fut: 'static + Send + Future<Output = Result<T>>,
	{
		let ttl = self.ttl(options);
		let mut in_flight = self.inner.in_flight.lock().await;

		if let Some(existing) = in_flight.get(key) {
			tracing::debug!(request_id = existing.id, "revalidation already in flight");

			return;
		}

		tracing::debug!("entry stale; revalidating in background");

		let request = self.issue(key.clone(), fetcher, ttl, FetchOrigin::Background);

		in_flight.insert(key.clone(), request);
	}

	/// Spawn the fetch task; the caller registers the returned request under the in-flight
	/// lock.
	fn issue<F, Fut>(
		&self,
		key: CacheKey,
		fetcher: F,
		ttl: Duration,
		origin: FetchOrigin,
	) -> InFlightRequest<T>
	where
		F: 'static + Send + FnOnce(CancellationToken) -> Fut,
		Fut: 'static + Send + Future<Output = Result<T>>,
	{
		let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
		let token = CancellationToken::new();
		let span = tracing::debug_span!(
			"fetch",
			cache = %self.inner.config.name,
			key = %key,
			request_id = id,
			?origin
		);
		let task = self.clone().run_fetch(id, key.clone(), fetcher, ttl, origin, token.clone());
		let handle = tokio::spawn(task.instrument(span));
		let fetch = async move {
			match handle.await {
				Ok(outcome) => outcome,
				Err(err) if err.is_cancelled() => Err(Error::Cancelled { key: key.to_string() }),
				Err(err) => Err(Error::Cache(format!("Fetch task failed: {err}."))),
			}
		}
		.boxed();

		InFlightRequest::new(id, origin, fetch, token)
	}

	async fn run_fetch<F, Fut>(
		self,
		id: u64,
		key: CacheKey,
		fetcher: F,
		ttl: Duration,
		origin: FetchOrigin,
		token: CancellationToken,
	) -> Result<Arc<T>>
	where
		F: 'static + Send + FnOnce(CancellationToken) -> Fut,
		Fut: 'static + Send + Future<Output = Result<T>>,
	{
		let started = Instant::now();
		// The slot must be released on every path, including a panicking fetcher.
		let outcome = AssertUnwindSafe(self.settle(&key, fetcher, ttl, &token))
			.catch_unwind()
			.await
			.unwrap_or_else(|panic| {
				Err(Error::Cache(format!(
					"Fetch for '{key}' panicked: {}.",
					panic_message(panic.as_ref())
				)))
			});

		match &outcome {
			Ok(_) => {
				self.observe_fetch_success(started.elapsed());

				tracing::debug!(elapsed = ?started.elapsed(), "fetch complete");
			},
			Err(err) if err.is_cancelled() => {
				self.observe_cancellation();

				tracing::debug!("fetch cancelled");
			},
			Err(err) => {
				self.observe_fetch_error();

				match origin {
					FetchOrigin::Background => tracing::warn!(
						error = %err,
						"background revalidation failed; keeping stale entry"
					),
					FetchOrigin::Foreground => tracing::debug!(error = %err, "fetch failed"),
				}
			},
		}

		self.release(&key, id).await;

		outcome
	}

	async fn settle<F, Fut>(
		&self,
		key: &CacheKey,
		fetcher: F,
		ttl: Duration,
		token: &CancellationToken,
	) -> Result<Arc<T>>
	where
		F: 'static + Send + FnOnce(CancellationToken) -> Fut,
		Fut: 'static + Send + Future<Output = Result<T>>,
	{
		let fetch = fetcher(token.clone());
		let outcome = tokio::select! {
			biased;
			_ = token.cancelled() => Err(Error::Cancelled { key: key.to_string() }),
			outcome = fetch => outcome,
		};

		match outcome {
			// The fetcher may finish in the same turn it was cancelled; never cache that.
			Ok(_) if token.is_cancelled() => Err(Error::Cancelled { key: key.to_string() }),
			Ok(value) => {
				let value = Arc::new(value);

				self.store_value(key, value.clone(), ttl).await;

				Ok(value)
			},
			Err(err) => Err(err),
		}
	}

	async fn release(&self, key: &CacheKey, id: u64) {
		let mut in_flight = self.inner.in_flight.lock().await;

		// A forced refresh may already have replaced this request.
		if in_flight.get(key).is_some_and(|request| request.id == id) {
			in_flight.remove(key);
		}
	}

	fn ttl(&self, options: FetchOptions) -> Duration {
		options.ttl.unwrap_or(self.inner.config.default_ttl)
	}

	fn storage_key(&self, key: &CacheKey) -> String {
		format!("{}{}", self.inner.config.storage_prefix, key)
	}

	fn observe_hit(&self, stale: bool) {
		metrics::record_hit(&self.inner.config.name, stale);

		self.inner.metrics.record_hit(stale);
	}

	fn observe_miss(&self) {
		metrics::record_miss(&self.inner.config.name);

		self.inner.metrics.record_miss();
	}

	fn observe_join(&self) {
		metrics::record_join(&self.inner.config.name);

		self.inner.metrics.record_join();
	}

	fn observe_fetch_success(&self, duration: Duration) {
		metrics::record_fetch_success(&self.inner.config.name, duration);

		self.inner.metrics.record_fetch_success(duration);
	}

	fn observe_fetch_error(&self) {
		metrics::record_fetch_error(&self.inner.config.name);

		self.inner.metrics.record_fetch_error();
	}

	fn observe_cancellation(&self) {
		metrics::record_cancellation(&self.inner.config.name);

		self.inner.metrics.record_cancellation();
	}

	fn observe_persistence_error(&self) {
		metrics::record_persistence_error(&self.inner.config.name);

		self.inner.metrics.record_persistence_error();
	}
}
impl<T, S> Clone for RequestCache<T, S> {
	fn clone(&self) -> Self {
		Self { inner: self.inner.clone() }
	}
}
impl<T, S> Debug for RequestCache<T, S> {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("RequestCache").field("config", &self.inner.config).finish_non_exhaustive()
	}
}
impl<T> Default for RequestCache<T, MemoryStore>
where
	T: Cacheable,
{
	fn default() -> Self {
		Self::new()
	}
}

/// Builder for [`RequestCache`].
pub struct RequestCacheBuilder<T, S = MemoryStore> {
	config: CacheConfig,
	store: S,
	_value: PhantomData<fn() -> T>,
}
impl<T> RequestCacheBuilder<T, MemoryStore>
where
	T: Cacheable,
{
	/// Create a builder with default configuration over a fresh [`MemoryStore`].
	pub fn new() -> Self {
		Self { config: CacheConfig::default(), store: MemoryStore::new(), _value: PhantomData }
	}
}
impl<T, S> RequestCacheBuilder<T, S>
where
	T: Cacheable,
	S: PersistentStore,
{
	/// Replace the whole configuration.
	pub fn config(mut self, config: CacheConfig) -> Self {
		self.config = config;

		self
	}

	/// Name used in log fields and metric labels.
	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.config.name = name.into();

		self
	}

	/// Fraction of the TTL after which entries are served stale.
	pub fn stale_fraction(mut self, value: f64) -> Self {
		self.config.stale_fraction = value;

		self
	}

	/// TTL applied when a fetch does not supply one.
	pub fn default_ttl(mut self, value: Duration) -> Self {
		self.config.default_ttl = value;

		self
	}

	/// Prefix prepended to keys in the persistent tier.
	pub fn storage_prefix(mut self, value: impl Into<String>) -> Self {
		self.config.storage_prefix = value.into();

		self
	}

	/// Use `store` as the persistent tier.
	pub fn store<S2>(self, store: S2) -> RequestCacheBuilder<T, S2>
	where
		S2: PersistentStore,
	{
		RequestCacheBuilder { config: self.config, store, _value: PhantomData }
	}

	/// Validate the configuration and construct the cache.
	pub fn build(self) -> Result<RequestCache<T, S>> {
		RequestCache::with_store(self.config, self.store)
	}
}
impl<T> Default for RequestCacheBuilder<T, MemoryStore>
where
	T: Cacheable,
{
	fn default() -> Self {
		Self::new()
	}
}

struct CacheInner<T, S> {
	config: CacheConfig,
	store: S,
	entries: RwLock<HashMap<CacheKey, CacheEntry<T>>>,
	in_flight: Mutex<HashMap<CacheKey, InFlightRequest<T>>>,
	next_request_id: AtomicU64,
	metrics: Arc<CacheMetrics>,
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
	panic
		.downcast_ref::<&str>()
		.copied()
		.or_else(|| panic.downcast_ref::<String>().map(String::as_str))
		.unwrap_or("unknown panic")
}
