//! Deterministic cache key construction.

// std
use std::fmt::{Display, Formatter, Result as FmtResult};
// crates.io
use serde::Serialize;
use serde_json::Value;
// self
use crate::_prelude::*;

const PAIR_SEPARATOR: &str = "|";

/// Canonical cache key built from a set of named request parameters.
///
/// Parameter names are sorted lexicographically and rendered as `name:<json>` pairs
/// joined by `|`, so the same parameter set always yields the same key regardless of
/// insertion order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(Arc<str>);
impl CacheKey {
	/// Start building a key from individual parameters.
	pub fn builder() -> CacheKeyBuilder {
		CacheKeyBuilder::default()
	}

	/// Build a key from any value that serializes to a JSON object.
	pub fn from_params<P>(params: &P) -> Result<Self>
	where
		P: ?Sized + Serialize,
	{
		match serde_json::to_value(params)? {
			Value::Object(map) => Ok(Self::from_pairs(map)),
			other => Err(Error::Validation {
				field: "params",
				reason: format!("Expected a JSON object, got `{other}`."),
			}),
		}
	}

	/// Build a key from `(name, value)` pairs.
	pub fn from_pairs<I, K>(pairs: I) -> Self
	where
		I: IntoIterator<Item = (K, Value)>,
		K: Into<String>,
	{
		let mut pairs = pairs
			.into_iter()
			.map(|(name, value)| (name.into(), value))
			.collect::<Vec<(String, Value)>>();

		pairs.sort_by(|(a, _), (b, _)| a.cmp(b));

		let rendered = pairs
			.iter()
			.map(|(name, value)| format!("{name}:{value}"))
			.collect::<Vec<_>>()
			.join(PAIR_SEPARATOR);

		Self(rendered.into())
	}

	/// Wrap an already canonical key string.
	pub fn from_raw(raw: impl Into<Arc<str>>) -> Self {
		Self(raw.into())
	}

	/// Canonical string form.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl Display for CacheKey {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.write_str(&self.0)
	}
}
impl AsRef<str> for CacheKey {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

/// Incremental builder for [`CacheKey`].
#[derive(Clone, Debug, Default)]
pub struct CacheKeyBuilder {
	params: Vec<(String, Value)>,
}
impl CacheKeyBuilder {
	/// Add a parameter; a repeated name replaces the earlier value.
	pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
		let name = name.into();
		let value = value.into();

		match self.params.iter_mut().find(|(existing, _)| *existing == name) {
			Some((_, slot)) => *slot = value,
			None => self.params.push((name, value)),
		}

		self
	}

	/// Add a parameter from any serializable value.
	pub fn try_param<V>(self, name: impl Into<String>, value: &V) -> Result<Self>
	where
		V: ?Sized + Serialize,
	{
		Ok(self.param(name, serde_json::to_value(value)?))
	}

	/// Finalise the key.
	pub fn build(self) -> CacheKey {
		CacheKey::from_pairs(self.params)
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use serde_json::json;
	// self
	use super::*;

	#[derive(Serialize)]
	#[serde(rename_all = "camelCase")]
	struct ReportQuery {
		start_date: &'static str,
		end_date: &'static str,
		metric: &'static str,
	}

	#[test]
	fn insertion_order_does_not_change_the_key() {
		let forward = CacheKey::builder()
			.param("startDate", "2024-01-01")
			.param("endDate", "2024-01-31")
			.param("filters", json!({ "region": "Stockholm", "channels": ["organic", "paid"] }))
			.build();
		let reverse = CacheKey::builder()
			.param("filters", json!({ "region": "Stockholm", "channels": ["organic", "paid"] }))
			.param("endDate", "2024-01-31")
			.param("startDate", "2024-01-01")
			.build();

		assert_eq!(forward, reverse);
		assert_eq!(forward.as_str(), reverse.as_str());
	}

	#[test]
	fn renders_sorted_name_json_pairs() {
		let key = CacheKey::builder().param("metric", "sessions").param("days", 28).build();

		assert_eq!(key.as_str(), r#"days:28|metric:"sessions""#);
	}

	#[test]
	fn serializable_params_match_builder() {
		let query =
			ReportQuery { start_date: "2024-01-01", end_date: "2024-01-31", metric: "sessions" };
		let from_struct = CacheKey::from_params(&query).expect("object params");
		let from_builder = CacheKey::builder()
			.param("metric", "sessions")
			.param("startDate", "2024-01-01")
			.param("endDate", "2024-01-31")
			.build();

		assert_eq!(from_struct, from_builder);
	}

	#[test]
	fn distinct_values_produce_distinct_keys() {
		let a = CacheKey::builder().param("days", 7).build();
		let b = CacheKey::builder().param("days", "7").build();

		assert_ne!(a, b);
	}

	#[test]
	fn rejects_non_object_params() {
		assert!(matches!(
			CacheKey::from_params(&[1, 2, 3]),
			Err(Error::Validation { field: "params", .. })
		));
	}
}
