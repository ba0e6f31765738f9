//! Configuration management for the experiment engine
//!
//! All configurable parameters in one place with environment variable overrides.
//! Follows the principle: sensible defaults, configurable in production.

use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::constants::{
    DEFAULT_CONFIDENCE_LEVEL, DEFAULT_MAX_ASSIGN_RETRIES, DEFAULT_MIN_SAMPLE_SIZE,
    DEFAULT_SRM_ALPHA, MAX_CONFIDENCE_LEVEL, MIN_CONFIDENCE_LEVEL,
};
use crate::experiment::analyzer::AnalyzerSettings;
use crate::experiment::storage::WriteMode;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory for the RocksDB store
    pub storage_path: PathBuf,

    /// Participants required in every variant before an unforced analysis runs
    pub min_sample_size: u64,

    /// Confidence level (percent) applied to tests created without one
    pub default_confidence_level: f64,

    /// Whether events for existing participants are accepted while paused
    pub record_events_while_paused: bool,

    /// Attempts the registry makes before surfacing a concurrency conflict
    pub max_assign_retries: u32,

    /// fsync behaviour of the persistent store
    pub write_mode: WriteMode,

    /// Significance threshold for the sample-ratio-mismatch check
    pub srm_alpha: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./shodh_experiments_data"),
            min_sample_size: DEFAULT_MIN_SAMPLE_SIZE,
            default_confidence_level: DEFAULT_CONFIDENCE_LEVEL,
            record_events_while_paused: true,
            max_assign_retries: DEFAULT_MAX_ASSIGN_RETRIES,
            write_mode: WriteMode::Async,
            srm_alpha: DEFAULT_SRM_ALPHA,
        }
    }
}

fn parse_bool(val: &str) -> bool {
    val.to_lowercase() == "true" || val == "1"
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults
    #[allow(clippy::field_reassign_with_default)] // Environment overrides require mutable config
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("SHODH_EXP_STORAGE_PATH") {
            config.storage_path = PathBuf::from(val);
        }

        if let Ok(val) = env::var("SHODH_EXP_MIN_SAMPLE_SIZE") {
            if let Ok(n) = val.parse::<u64>() {
                config.min_sample_size = n.max(1);
            }
        }

        if let Ok(val) = env::var("SHODH_EXP_CONFIDENCE_LEVEL") {
            if let Ok(level) = val.parse::<f64>() {
                if level.is_finite() {
                    config.default_confidence_level =
                        level.clamp(MIN_CONFIDENCE_LEVEL, MAX_CONFIDENCE_LEVEL);
                }
            }
        }

        if let Ok(val) = env::var("SHODH_EXP_EVENTS_WHILE_PAUSED") {
            config.record_events_while_paused = parse_bool(&val);
        }

        if let Ok(val) = env::var("SHODH_EXP_MAX_ASSIGN_RETRIES") {
            if let Ok(n) = val.parse::<u32>() {
                config.max_assign_retries = n.clamp(1, 20);
            }
        }

        if let Ok(val) = env::var("SHODH_EXP_WRITE_MODE") {
            match val.parse() {
                Ok(mode) => config.write_mode = mode,
                Err(e) => warn!("Ignoring SHODH_EXP_WRITE_MODE: {}", e),
            }
        }

        if let Ok(val) = env::var("SHODH_EXP_SRM_ALPHA") {
            if let Ok(alpha) = val.parse::<f64>() {
                if alpha > 0.0 && alpha < 1.0 {
                    config.srm_alpha = alpha;
                }
            }
        }

        config
    }

    /// Thresholds handed to the statistical analyzer
    pub fn analyzer_settings(&self) -> AnalyzerSettings {
        AnalyzerSettings {
            min_sample_size: self.min_sample_size,
            srm_alpha: self.srm_alpha,
        }
    }

    /// Log the current configuration
    pub fn log(&self) {
        info!("Experiment engine configuration:");
        info!("   Storage: {:?} ({:?} writes)", self.storage_path, self.write_mode);
        info!("   Min sample size per variant: {}", self.min_sample_size);
        info!(
            "   Default confidence level: {:.1}%",
            self.default_confidence_level
        );
        info!(
            "   Events while paused: {}",
            if self.record_events_while_paused {
                "accepted"
            } else {
                "rejected"
            }
        );
        info!("   Assignment retries: {}", self.max_assign_retries);
        info!("   SRM alpha: {}", self.srm_alpha);
    }
}
