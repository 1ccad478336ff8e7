//! HTTP helpers for fetching cacheable JSON payloads.

pub mod client;
