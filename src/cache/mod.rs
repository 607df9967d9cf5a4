//! Disk-backed response cache.
//!
//! Stores one snapshot per vehicle (plus an independent wake-state flag)
//! as per-key JSON files so repeated reads don't cost upstream API requests.
//! Entries carry their own TTL; stale entries are reported but never
//! served as hits.

mod keys;
mod response_cache;

pub use keys::cache_key;
pub use response_cache::{CacheEntry, CacheStatus, ResponseCache};
