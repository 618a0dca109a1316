//! Cache timing constants shared across modules.

/// A cached body revalidated within this window is served without a GET.
pub const REFRESH_INTERVAL_SECS: u64 = 3;

/// File-cache entries not revalidated within this window are aged out
/// by the maintenance sweep (eight days).
pub const AGE_OUT_THRESHOLD_SECS: u64 = 691_200;

/// How often the maintenance worker runs (once a day).
pub const CACHE_CLEANUP_INTERVAL_SECS: u64 = 86_400;

/// How long saint mode suppresses freshness checks after a failure.
pub const SAINT_MODE_DURATION_SECS: u64 = 10;

/// Subtracted from the changes-since window to absorb clock skew
/// between us and the server.
pub const CLOCK_SKEW_SECS: u64 = 10;

/// A directory whose children were refreshed within this window is fresh;
/// stat lookups under it trust the cache (including negative entries).
pub const STAT_CACHE_NEGATIVE_TTL_SECS: u64 = 3;

/// Directories not listed in this long are dropped wholesale by
/// `StatCache::prune` (fourteen days).
pub const STAT_CACHE_PRUNE_THRESHOLD_SECS: u64 = 1_209_600;

/// Upper bound on a stored entity tag, matching the fixed-size field the
/// cache format reserves for it.
pub const ETAG_MAX: usize = 256;
