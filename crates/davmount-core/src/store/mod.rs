//! The two persistent caches and the KV store they share.
//!
//! One sled tree holds both partitions; fixed key prefixes keep them
//! apart (`sc:`/`cu:` for the stat cache, `fc:` for the file cache).

pub mod file_cache;
pub mod kv;
pub mod stat_cache;
