//! Deterministic traffic allocation
//!
//! Pure functions only: no clocks, no randomness, no storage. Given the same
//! test configuration and identity, every call in every process returns the
//! same answer. Two independently salted hashes are used, one for inclusion
//! and one for variant choice, so the two draws are decorrelated.
//!
//! The hash is SHA-256 truncated to 64 bits. Cryptographic strength is not
//! needed, but the output must be stable across builds and platforms, which
//! rules out `DefaultHasher`.

use sha2::{Digest, Sha256};

use super::types::{ABTest, Identity, Variant};
use crate::constants::{HASH_BUCKETS, INCLUSION_SALT, TRAFFIC_SUM_TOLERANCE, VARIANT_SALT};
use crate::errors::{ExperimentError, Result};

/// Outcome of running both allocation steps
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Allocation<'a> {
    Excluded,
    Included(&'a Variant),
}

/// Check the invariants allocation relies on
///
/// - at least one variant, exactly one flagged control
/// - every percentage finite and within [0, 100]
/// - percentages sum to 100 (within tolerance)
/// - traffic allocation within [0, 100]
pub fn validate_config(test: &ABTest) -> Result<()> {
    if !(0.0..=100.0).contains(&test.traffic_allocation) {
        return Err(ExperimentError::Configuration(format!(
            "traffic_allocation must be within 0-100, got {}",
            test.traffic_allocation
        )));
    }

    if test.variants.is_empty() {
        return Err(ExperimentError::Configuration(
            "test has no variants".to_string(),
        ));
    }

    let controls = test.variants.iter().filter(|v| v.is_control).count();
    if controls != 1 {
        return Err(ExperimentError::Configuration(format!(
            "exactly one control variant required, found {controls}"
        )));
    }

    for variant in &test.variants {
        if !variant.traffic_percentage.is_finite()
            || !(0.0..=100.0).contains(&variant.traffic_percentage)
        {
            return Err(ExperimentError::Configuration(format!(
                "variant '{}' has invalid traffic_percentage {}",
                variant.name, variant.traffic_percentage
            )));
        }
    }

    let sum: f64 = test.variants.iter().map(|v| v.traffic_percentage).sum();
    if (sum - 100.0).abs() > TRAFFIC_SUM_TOLERANCE {
        return Err(ExperimentError::Configuration(format!(
            "variant traffic percentages sum to {sum:.4}, expected 100"
        )));
    }

    Ok(())
}

/// Map (salt, test salt, identity) onto a stable value in [0, 100)
pub fn bucket_value(salt: &str, test_salt: &str, identity: &Identity) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update([0x1f]);
    hasher.update(test_salt.as_bytes());
    hasher.update([0x1f]);
    hasher.update(identity.key().as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hash = u64::from_be_bytes(prefix);

    (hash % HASH_BUCKETS) as f64 * 100.0 / HASH_BUCKETS as f64
}

/// Whether `identity` falls inside the test's traffic allocation
pub fn decide_inclusion(test: &ABTest, identity: &Identity) -> bool {
    bucket_value(INCLUSION_SALT, &test.allocation_salt, identity) < test.traffic_allocation
}

/// Pick the variant for `identity`
///
/// Walks variants in ascending id order accumulating traffic percentages and
/// returns the first whose cumulative bound exceeds the identity's value.
/// A rounding gap at the top falls back to the first variant.
pub fn select_variant<'a>(test: &'a ABTest, identity: &Identity) -> Result<&'a Variant> {
    validate_config(test)?;

    let value = bucket_value(VARIANT_SALT, &test.allocation_salt, identity);

    let mut ordered: Vec<&Variant> = test.variants.iter().collect();
    ordered.sort_by_key(|v| v.id);

    let mut cumulative = 0.0;
    for variant in &ordered {
        cumulative += variant.traffic_percentage;
        if value < cumulative {
            return Ok(variant);
        }
    }

    Ok(ordered[0])
}

/// Inclusion followed by variant selection
pub fn allocate<'a>(test: &'a ABTest, identity: &Identity) -> Result<Allocation<'a>> {
    validate_config(test)?;
    if !decide_inclusion(test, identity) {
        return Ok(Allocation::Excluded);
    }
    select_variant(test, identity).map(Allocation::Included)
}
