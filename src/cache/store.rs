//! Persistent second-tier stores.
//!
//! The persistent tier is best effort: [`RequestCache`](crate::RequestCache) logs and
//! swallows every error returned from these stores.

// std
use std::{collections::BTreeMap, future::Future};
// crates.io
#[cfg(feature = "redis")] use redis::AsyncCommands;
use tokio::sync::RwLock;
// self
use crate::_prelude::*;

/// Session-scoped key-value store backing the second cache tier.
pub trait PersistentStore: Send + Sync + 'static {
	/// Load the raw record stored under `key`.
	fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

	/// Store a raw record; `ttl` is a hint for backends with native expiry.
	fn set(&self, key: &str, value: String, ttl: Duration)
	-> impl Future<Output = Result<()>> + Send;

	/// Remove the record stored under `key`, if any.
	fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

	/// Enumerate keys starting with `prefix`.
	fn keys(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Store that keeps nothing; disables the persistent tier.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopStore;
impl PersistentStore for NoopStore {
	async fn get(&self, _: &str) -> Result<Option<String>> {
		Ok(None)
	}

	async fn set(&self, _: &str, _: String, _: Duration) -> Result<()> {
		Ok(())
	}

	async fn remove(&self, _: &str) -> Result<()> {
		Ok(())
	}

	async fn keys(&self, _: &str) -> Result<Vec<String>> {
		Ok(Vec::new())
	}
}

/// In-process store scoped to a session.
///
/// Clones share the same records, so a second cache built over a clone observes what the
/// first one persisted. An optional byte quota rejects writes that would exceed it.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
	records: Arc<RwLock<BTreeMap<String, String>>>,
	quota_bytes: Option<usize>,
}
impl MemoryStore {
	/// Create an unbounded store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Create a store that rejects writes once keys plus values exceed `bytes`.
	pub fn with_quota(bytes: usize) -> Self {
		Self { quota_bytes: Some(bytes), ..Self::default() }
	}

	/// Number of stored records.
	pub async fn len(&self) -> usize {
		self.records.read().await.len()
	}

	/// Whether the store holds no records.
	pub async fn is_empty(&self) -> bool {
		self.records.read().await.is_empty()
	}
}
impl PersistentStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<String>> {
		Ok(self.records.read().await.get(key).cloned())
	}

	async fn set(&self, key: &str, value: String, _: Duration) -> Result<()> {
		let mut records = self.records.write().await;

		if let Some(quota) = self.quota_bytes {
			let used = records
				.iter()
				.filter(|(existing, _)| existing.as_str() != key)
				.map(|(k, v)| k.len() + v.len())
				.sum::<usize>();
			let needed = key.len() + value.len();

			if used + needed > quota {
				return Err(Error::Persistence(format!(
					"Storage quota exceeded: {needed} bytes requested with {used} of {quota} bytes used."
				)));
			}
		}

		records.insert(key.to_owned(), value);

		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<()> {
		self.records.write().await.remove(key);

		Ok(())
	}

	async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
		let records = self.records.read().await;

		Ok(records
			.range(prefix.to_owned()..)
			.take_while(|(key, _)| key.starts_with(prefix))
			.map(|(key, _)| key.clone())
			.collect())
	}
}

#[cfg(feature = "redis")]
/// Redis-backed store; records expire natively with the entry TTL.
#[derive(Clone, Debug)]
pub struct RedisStore {
	client: redis::Client,
}
#[cfg(feature = "redis")]
impl RedisStore {
	/// Wrap a Redis client.
	pub fn new(client: redis::Client) -> Self {
		Self { client }
	}
}
#[cfg(feature = "redis")]
impl PersistentStore for RedisStore {
	async fn get(&self, key: &str) -> Result<Option<String>> {
		let mut conn = self.client.get_multiplexed_async_connection().await?;
		let value: Option<String> = conn.get(key).await?;

		Ok(value)
	}

	async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
		let mut conn = self.client.get_multiplexed_async_connection().await?;

		conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?;

		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<()> {
		let mut conn = self.client.get_multiplexed_async_connection().await?;

		conn.del::<_, ()>(key).await?;

		Ok(())
	}

	async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
		let mut conn = self.client.get_multiplexed_async_connection().await?;
		let keys: Vec<String> = conn.keys(format!("{}*", escape_glob(prefix))).await?;

		Ok(keys)
	}
}

#[cfg(feature = "redis")]
fn escape_glob(raw: &str) -> String {
	let mut escaped = String::with_capacity(raw.len());

	for c in raw.chars() {
		if matches!(c, '*' | '?' | '[' | ']' | '\\') {
			escaped.push('\\');
		}

		escaped.push(c);
	}

	escaped
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn memory_store_clones_share_records() {
		let store = MemoryStore::new();
		let clone = store.clone();

		store.set("a:1", "one".into(), Duration::from_secs(1)).await.expect("set");

		assert_eq!(clone.get("a:1").await.expect("get").as_deref(), Some("one"));

		clone.remove("a:1").await.expect("remove");

		assert!(store.is_empty().await);
	}

	#[tokio::test]
	async fn memory_store_lists_keys_by_prefix() {
		let store = MemoryStore::new();

		for key in ["ga4:a", "ga4:b", "crux:a", "ga5:a"] {
			store.set(key, "x".into(), Duration::from_secs(1)).await.expect("set");
		}

		assert_eq!(store.keys("ga4:").await.expect("keys"), vec!["ga4:a", "ga4:b"]);
		assert_eq!(store.keys("").await.expect("keys").len(), 4);
	}

	#[tokio::test]
	async fn memory_store_quota_rejects_oversized_writes() {
		let store = MemoryStore::with_quota(16);

		store.set("k1", "0123456789".into(), Duration::from_secs(1)).await.expect("fits");

		let err = store
			.set("k2", "0123456789".into(), Duration::from_secs(1))
			.await
			.expect_err("over quota");

		assert!(matches!(err, Error::Persistence(_)));
		// Overwriting an existing key only counts the replacement.
		store.set("k1", "abcdefghij".into(), Duration::from_secs(1)).await.expect("overwrite");
		assert_eq!(store.len().await, 1);
	}

	#[tokio::test]
	async fn noop_store_keeps_nothing() {
		let store = NoopStore;

		store.set("k", "v".into(), Duration::from_secs(1)).await.expect("set");

		assert!(store.get("k").await.expect("get").is_none());
		assert!(store.keys("").await.expect("keys").is_empty());
	}
}
