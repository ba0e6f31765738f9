//! Shodh-Experiments Library
//!
//! Embedded A/B experiment engine: decides which identities enter a test,
//! binds each one to a variant exactly once, records behavioral events and
//! tells you whether a treatment beats control.
//!
//! # Key Features
//! - Deterministic SHA-256 bucketing (same identity, same variant, any process)
//! - Idempotent participant registry safe under concurrent first assignment
//! - Conversion rollups maintained atomically with the event log
//! - Two-proportion z-test, Cohen's h, confidence intervals, power estimates
//! - Sample-ratio-mismatch detection
//! - RocksDB embedded storage or an in-memory store for tests
//!
//! # Example
//! ```no_run
//! use shodh_experiments::{EngineConfig, ExperimentEngine, Identity, NewTest, VariantSpec};
//!
//! # fn main() -> shodh_experiments::errors::Result<()> {
//! let engine = ExperimentEngine::in_memory(EngineConfig::default());
//! let test = engine.create_test(NewTest::new(
//!     "checkout-button",
//!     vec![VariantSpec::control("blue", 50.0), VariantSpec::treatment("green", 50.0)],
//! ))?;
//! engine.start_test(&test.id)?;
//! let outcome = engine.decide_and_assign(&test.id, &Identity::user("user-42"))?;
//! assert!(outcome.included);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod errors;
pub mod experiment;
pub mod metrics;
pub mod tracing_setup;
pub mod validation;

pub use config::EngineConfig;
pub use errors::ExperimentError;
pub use experiment::{
    ABTest, AnalysisResult, AnalysisStatus, AssignmentOutcome, Event, EventType,
    ExperimentEngine, ExperimentStore, ExperimentSummary, Identity, InMemoryStore, NewTest,
    Participant, RocksStore, TestConfigUpdate, TestId, TestStatus, VariantId, VariantSpec,
};

// Re-export dependencies to ensure tests/benchmarks use the same version
pub use chrono;
pub use parking_lot;
pub use uuid;
