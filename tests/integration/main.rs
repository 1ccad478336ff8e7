//! Integration tests exercising the cache against a mocked HTTP origin.

mod fetch;
mod rate_limit;
