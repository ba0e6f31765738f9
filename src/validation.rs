//! Input validation for caller-supplied values
//! Rejects malformed identities, names and numbers before they reach the store

use anyhow::{anyhow, Result};

use crate::constants::{MAX_CONFIDENCE_LEVEL, MIN_CONFIDENCE_LEVEL};
use crate::experiment::types::{Identity, TestId, VariantSpec};

/// Maximum lengths
pub const MAX_IDENTITY_LENGTH: usize = 256;
pub const MAX_NAME_LENGTH: usize = 200;
pub const MAX_DESCRIPTION_LENGTH: usize = 5_000;
pub const MAX_EVENT_NAME_LENGTH: usize = 64;
pub const MAX_VARIANTS: usize = 20;

/// Validate a user id or session token
pub fn validate_identity_value(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{kind} cannot be empty"));
    }

    if value.len() > MAX_IDENTITY_LENGTH {
        return Err(anyhow!(
            "{kind} too long: {} chars (max: {})",
            value.len(),
            MAX_IDENTITY_LENGTH
        ));
    }

    // Opaque tokens are often base64, so allow its alphabet too
    let allowed = |c: char| {
        c.is_alphanumeric() || matches!(c, '-' | '_' | '@' | '.' | ':' | '+' | '/' | '=')
    };
    if !value.chars().all(allowed) {
        return Err(anyhow!(
            "{kind} contains invalid characters (allowed: alphanumeric, - _ @ . : + / =)"
        ));
    }

    Ok(())
}

/// Validate an identity; the anonymous sentinel is always accepted
pub fn validate_identity(identity: &Identity) -> Result<()> {
    match identity {
        Identity::User(id) => validate_identity_value("user_id", id),
        Identity::Session(token) => validate_identity_value("session_token", token),
        Identity::Anonymous => Ok(()),
    }
}

/// Validate test_id (UUID format)
pub fn validate_test_id(test_id: &str) -> Result<TestId> {
    uuid::Uuid::parse_str(test_id)
        .map(TestId)
        .map_err(|e| anyhow!("Invalid test_id UUID format: {e}"))
}

/// Validate a test or variant name
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("name cannot be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(anyhow!(
            "name too long: {} chars (max: {})",
            name.len(),
            MAX_NAME_LENGTH
        ));
    }
    Ok(())
}

pub fn validate_description(description: &str) -> Result<()> {
    if description.len() > MAX_DESCRIPTION_LENGTH {
        return Err(anyhow!(
            "description too long: {} chars (max: {})",
            description.len(),
            MAX_DESCRIPTION_LENGTH
        ));
    }
    Ok(())
}

pub fn validate_confidence_level(level: f64) -> Result<()> {
    if !level.is_finite() || !(MIN_CONFIDENCE_LEVEL..=MAX_CONFIDENCE_LEVEL).contains(&level) {
        return Err(anyhow!(
            "must be within {MIN_CONFIDENCE_LEVEL}-{MAX_CONFIDENCE_LEVEL}, got {level}"
        ));
    }
    Ok(())
}

/// Validate variant definitions (names and count; sums are checked by the allocator)
pub fn validate_variant_specs(specs: &[VariantSpec]) -> Result<()> {
    if specs.len() > MAX_VARIANTS {
        return Err(anyhow!(
            "too many variants: {} (max: {})",
            specs.len(),
            MAX_VARIANTS
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for spec in specs {
        validate_name(&spec.name)?;
        if !seen.insert(spec.name.as_str()) {
            return Err(anyhow!("duplicate variant name '{}'", spec.name));
        }
    }
    Ok(())
}

/// Validate an optional event value
pub fn validate_event_value(value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() => Err(anyhow!("value must be finite, got {v}")),
        _ => Ok(()),
    }
}

/// Validate a custom event name
pub fn validate_custom_event_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("custom event name cannot be empty"));
    }
    if name.len() > MAX_EVENT_NAME_LENGTH {
        return Err(anyhow!(
            "custom event name too long: {} chars (max: {})",
            name.len(),
            MAX_EVENT_NAME_LENGTH
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(anyhow!(
            "custom event name contains invalid characters (allowed: a-z, 0-9, _, -, .)"
        ));
    }
    Ok(())
}
