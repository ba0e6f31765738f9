//! Documented constants for the experiment engine
//!
//! Tunable parameters live here so allocation, accounting and analysis
//! read the same numbers. Allocation constants are part of the on-disk
//! contract: a running test keeps using whatever they were when it started.

// =============================================================================
// ALLOCATION CONSTANTS
// Changing any of these reassigns live users. Treat as a breaking change.
// =============================================================================

/// Salt mixed into the inclusion hash
pub const INCLUSION_SALT: &str = "shodh.exp.inclusion.v1";

/// Salt mixed into the variant-selection hash
///
/// Distinct from [`INCLUSION_SALT`] so the variant draw is decorrelated from
/// the inclusion draw: users near the inclusion cutoff are not biased toward
/// the first variant in order.
pub const VARIANT_SALT: &str = "shodh.exp.variant.v1";

/// Number of buckets the hash space is folded into
///
/// One million buckets over [0, 100) gives a resolution of 0.0001 percentage
/// points, finer than the tolerance accepted for traffic percentages.
pub const HASH_BUCKETS: u64 = 1_000_000;

/// Identity key used when neither a user id nor a session token is supplied
pub const ANONYMOUS_IDENTITY: &str = "anonymous";

/// Allowed deviation when checking that variant percentages sum to 100
pub const TRAFFIC_SUM_TOLERANCE: f64 = 0.01;

// =============================================================================
// ANALYSIS CONSTANTS
// =============================================================================

/// Minimum participants per variant before an unforced analysis runs
pub const DEFAULT_MIN_SAMPLE_SIZE: u64 = 30;

/// Default confidence level, in percent (alpha = 0.05)
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 95.0;

/// Lowest and highest confidence levels a test may be configured with
pub const MIN_CONFIDENCE_LEVEL: f64 = 50.0;
pub const MAX_CONFIDENCE_LEVEL: f64 = 99.9;

/// Absolute conversion-rate delta under which variants count as identical
///
/// Half a percentage point. Below this, the recommendation suggests testing
/// a more dramatic change rather than waiting for more data.
pub const NEARLY_IDENTICAL_RATE_DELTA: f64 = 0.005;

/// Target power used for the "how much more data" estimate
pub const TARGET_POWER: f64 = 0.8;

/// Default significance threshold for the sample-ratio-mismatch check
pub const DEFAULT_SRM_ALPHA: f64 = 0.001;

/// Uplift above which the recommendation calls out a strong effect (percent)
pub const STRONG_UPLIFT_PERCENT: f64 = 20.0;

// =============================================================================
// REGISTRY CONSTANTS
// =============================================================================

/// Attempts made by the registry before surfacing a concurrency conflict
pub const DEFAULT_MAX_ASSIGN_RETRIES: u32 = 3;
