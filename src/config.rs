//! Cache and rate-limit configuration with validation.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Portion of the TTL after which an entry is served stale and revalidated.
pub const DEFAULT_STALE_FRACTION: f64 = 0.8;
/// Default time-to-live applied when a fetch does not supply one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
/// Default key prefix for records written to the persistent tier.
pub const DEFAULT_STORAGE_PREFIX: &str = "dashboard-cache:";
/// Default cache name used for log and metric labels.
pub const DEFAULT_CACHE_NAME: &str = "dashboard";
/// Default base delay after the first failure.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
/// Default ceiling for exponential backoff growth.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
/// Default minimum backoff after a quota-class failure.
pub const DEFAULT_QUOTA_FLOOR: Duration = Duration::from_secs(60);

/// Settings shared by every entry of a [`RequestCache`](crate::RequestCache).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
	/// Name attached to log fields and metric labels.
	#[serde(default = "default_name")]
	pub name: String,
	/// Fraction of the TTL after which entries are considered stale.
	#[serde(default = "default_stale_fraction")]
	pub stale_fraction: f64,
	/// TTL used when a fetch does not specify one.
	#[serde(default = "default_ttl")]
	pub default_ttl: Duration,
	/// Fixed prefix prepended to canonical keys in the persistent tier.
	#[serde(default = "default_storage_prefix")]
	pub storage_prefix: String,
}
impl CacheConfig {
	/// Validate invariants for cache configuration.
	pub fn validate(&self) -> Result<()> {
		if self.name.trim().is_empty() {
			return Err(Error::Validation { field: "name", reason: "Must not be empty.".into() });
		}
		if !(self.stale_fraction > 0.0 && self.stale_fraction <= 1.0) {
			return Err(Error::Validation {
				field: "stale_fraction",
				reason: "Must be within (0, 1].".into(),
			});
		}
		if self.default_ttl.is_zero() {
			return Err(Error::Validation {
				field: "default_ttl",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.storage_prefix.is_empty() {
			return Err(Error::Validation {
				field: "storage_prefix",
				reason: "Must not be empty.".into(),
			});
		}

		Ok(())
	}
}
impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			name: default_name(),
			stale_fraction: DEFAULT_STALE_FRACTION,
			default_ttl: DEFAULT_TTL,
			storage_prefix: default_storage_prefix(),
		}
	}
}

/// Backoff configuration for [`RateLimiter`](crate::RateLimiter).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
	/// Delay imposed after the first failure; doubled on each further failure.
	#[serde(default = "default_base_backoff")]
	pub base_backoff: Duration,
	/// Upper bound applied to exponential backoff growth.
	#[serde(default = "default_max_backoff")]
	pub max_backoff: Duration,
	/// Minimum delay imposed after a quota or rate-limit failure.
	#[serde(default = "default_quota_floor")]
	pub quota_floor: Duration,
}
impl RateLimitPolicy {
	/// Validate invariants for backoff configuration.
	pub fn validate(&self) -> Result<()> {
		if self.base_backoff.is_zero() {
			return Err(Error::Validation {
				field: "rate_limit.base_backoff",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.max_backoff < self.base_backoff {
			return Err(Error::Validation {
				field: "rate_limit.max_backoff",
				reason: "Must be greater than or equal to base_backoff.".into(),
			});
		}
		if self.quota_floor.is_zero() {
			return Err(Error::Validation {
				field: "rate_limit.quota_floor",
				reason: "Must be greater than zero.".into(),
			});
		}

		Ok(())
	}

	/// Backoff owed after `attempts` consecutive failures.
	pub fn backoff_for(&self, attempts: u32, quota: bool) -> Duration {
		// base * 2^(attempts - 1)
		let factor = 1u32.checked_shl(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
		let backoff = self.base_backoff.saturating_mul(factor).min(self.max_backoff);

		if quota { backoff.max(self.quota_floor) } else { backoff }
	}
}
impl Default for RateLimitPolicy {
	fn default() -> Self {
		Self {
			base_backoff: DEFAULT_BASE_BACKOFF,
			max_backoff: DEFAULT_MAX_BACKOFF,
			quota_floor: DEFAULT_QUOTA_FLOOR,
		}
	}
}

fn default_name() -> String {
	DEFAULT_CACHE_NAME.into()
}

fn default_stale_fraction() -> f64 {
	DEFAULT_STALE_FRACTION
}

fn default_ttl() -> Duration {
	DEFAULT_TTL
}

fn default_storage_prefix() -> String {
	DEFAULT_STORAGE_PREFIX.into()
}

fn default_base_backoff() -> Duration {
	DEFAULT_BASE_BACKOFF
}

fn default_max_backoff() -> Duration {
	DEFAULT_MAX_BACKOFF
}

fn default_quota_floor() -> Duration {
	DEFAULT_QUOTA_FLOOR
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn default_config_is_valid() {
		CacheConfig::default().validate().expect("default cache config");
		RateLimitPolicy::default().validate().expect("default rate limit policy");
	}

	#[test]
	fn rejects_stale_fraction_outside_unit_interval() {
		for fraction in [0.0, -0.5, 1.01, f64::NAN] {
			let config = CacheConfig { stale_fraction: fraction, ..Default::default() };

			assert!(
				matches!(config.validate(), Err(Error::Validation { field: "stale_fraction", .. })),
				"fraction {fraction} should be rejected"
			);
		}

		let config = CacheConfig { stale_fraction: 1.0, ..Default::default() };

		config.validate().expect("a fraction of one disables staleness");
	}

	#[test]
	fn rejects_max_backoff_below_base() {
		let policy = RateLimitPolicy {
			base_backoff: Duration::from_secs(10),
			max_backoff: Duration::from_secs(5),
			..Default::default()
		};

		assert!(matches!(
			policy.validate(),
			Err(Error::Validation { field: "rate_limit.max_backoff", .. })
		));
	}

	#[test]
	fn backoff_doubles_until_capped() {
		let policy = RateLimitPolicy {
			base_backoff: Duration::from_millis(100),
			max_backoff: Duration::from_millis(350),
			quota_floor: Duration::from_secs(1),
		};

		assert_eq!(policy.backoff_for(1, false), Duration::from_millis(100));
		assert_eq!(policy.backoff_for(2, false), Duration::from_millis(200));
		assert_eq!(policy.backoff_for(3, false), Duration::from_millis(350));
		assert_eq!(policy.backoff_for(80, false), Duration::from_millis(350));
		assert_eq!(policy.backoff_for(1, true), Duration::from_secs(1));
	}

	#[test]
	fn deserializes_with_defaults() {
		let config: CacheConfig = serde_json::from_str(r#"{ "name": "ga4" }"#).expect("config");

		assert_eq!(config.name, "ga4");
		assert_eq!(config.stale_fraction, DEFAULT_STALE_FRACTION);
		assert_eq!(config.default_ttl, DEFAULT_TTL);
		assert_eq!(config.storage_prefix, DEFAULT_STORAGE_PREFIX);
	}
}
