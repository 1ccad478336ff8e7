//! Cache entry definitions and freshness classification.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Longest lifetime an entry can have; larger TTLs are clamped.
pub const MAX_LIFETIME: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Freshness of a cached entry at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
	/// Entry may be served without contacting the origin.
	Fresh,
	/// Entry may be served but a background refresh is due.
	Stale,
	/// Entry is past its hard expiry and must be treated as absent.
	Expired,
}

/// Result of a successful cache lookup.
#[derive(Debug)]
pub struct Lookup<T> {
	/// Cached payload.
	pub value: Arc<T>,
	/// Whether the payload passed its stale deadline.
	pub is_stale: bool,
}
impl<T> Clone for Lookup<T> {
	fn clone(&self) -> Self {
		Self { value: self.value.clone(), is_stale: self.is_stale }
	}
}

/// Hot-tier record for a single cache key.
#[derive(Debug)]
pub struct CacheEntry<T> {
	value: Arc<T>,
	stale_at: Instant,
	expires_at: Instant,
	refreshed_at: DateTime<Utc>,
}
impl<T> CacheEntry<T> {
	/// Create an entry written at `now` that turns stale after `ttl * stale_fraction`.
	///
	/// TTLs beyond [`MAX_LIFETIME`] (e.g. `Duration::MAX`) are clamped to it.
	pub fn new(value: Arc<T>, now: Instant, ttl: Duration, stale_fraction: f64) -> Self {
		let ttl = ttl.min(MAX_LIFETIME);
		let expires_at = deadline(now, ttl);
		let stale_at = deadline(now, ttl.mul_f64(stale_fraction)).min(expires_at);

		Self { value, stale_at, expires_at, refreshed_at: Utc::now() }
	}

	/// Rebuild a hot-tier entry from a persisted record, re-anchoring wall-clock deadlines
	/// onto the monotonic clock.
	///
	/// Returns `None` when the record already expired.
	pub fn from_persisted(
		record: PersistedEntry<T>,
		now: Instant,
		wall_now: DateTime<Utc>,
	) -> Option<Self> {
		let until_expiry = (record.expires_at - wall_now).to_std().ok()?;

		if until_expiry.is_zero() {
			return None;
		}

		let until_stale = (record.stale_at - wall_now).to_std().unwrap_or_default();
		let expires_at = deadline(now, until_expiry.min(MAX_LIFETIME));

		Some(Self {
			value: Arc::new(record.value),
			stale_at: deadline(now, until_stale.min(MAX_LIFETIME)).min(expires_at),
			expires_at,
			refreshed_at: record.refreshed_at,
		})
	}

	/// Cached payload.
	pub fn value(&self) -> &Arc<T> {
		&self.value
	}

	/// Monotonic instant after which the entry is served stale.
	pub fn stale_at(&self) -> Instant {
		self.stale_at
	}

	/// Monotonic instant after which the entry is treated as absent.
	pub fn expires_at(&self) -> Instant {
		self.expires_at
	}

	/// Wall-clock time of the write that produced this entry.
	pub fn refreshed_at(&self) -> DateTime<Utc> {
		self.refreshed_at
	}

	/// Classify the entry at `now`.
	pub fn freshness(&self, now: Instant) -> Freshness {
		if now >= self.expires_at {
			Freshness::Expired
		} else if now > self.stale_at {
			Freshness::Stale
		} else {
			Freshness::Fresh
		}
	}

	/// Produce a lookup result unless the entry expired.
	pub fn lookup(&self, now: Instant) -> Option<Lookup<T>> {
		match self.freshness(now) {
			Freshness::Expired => None,
			freshness => Some(Lookup {
				value: self.value.clone(),
				is_stale: freshness == Freshness::Stale,
			}),
		}
	}

	/// Build the persisted form of this entry, mapping monotonic deadlines onto the wall clock.
	pub fn to_persisted(
		&self,
		now: Instant,
		wall_now: DateTime<Utc>,
	) -> Option<PersistedEntry<&T>> {
		Some(PersistedEntry {
			value: self.value.as_ref(),
			refreshed_at: self.refreshed_at,
			stale_at: to_datetime(self.stale_at, now, wall_now)?,
			expires_at: to_datetime(self.expires_at, now, wall_now)?,
		})
	}
}

/// Serialized second-tier record.
///
/// Deadlines are wall-clock timestamps so a record survives a process restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedEntry<V> {
	/// Cached payload.
	pub value: V,
	/// UTC timestamp of the write that produced the payload.
	pub refreshed_at: DateTime<Utc>,
	/// UTC timestamp after which the payload is served stale.
	pub stale_at: DateTime<Utc>,
	/// UTC timestamp after which the payload is discarded.
	pub expires_at: DateTime<Utc>,
}

fn deadline(now: Instant, after: Duration) -> Instant {
	// Only reachable on a clock anchored near its own upper bound.
	now.checked_add(after).unwrap_or(now)
}

fn to_datetime(instant: Instant, now: Instant, wall_now: DateTime<Utc>) -> Option<DateTime<Utc>> {
	if let Some(delta) = instant.checked_duration_since(now) {
		wall_now.checked_add_signed(TimeDelta::from_std(delta).ok()?)
	} else {
		let delta = now.checked_duration_since(instant)?;

		wall_now.checked_sub_signed(TimeDelta::from_std(delta).ok()?)
	}
}
