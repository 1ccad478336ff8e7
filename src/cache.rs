//! Two-tier request cache with deduplication and stale-while-revalidate.

pub mod entry;
pub mod flight;
pub mod key;
pub mod manager;
pub mod store;
