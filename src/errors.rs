//! Structured error types for the experiment engine
//!
//! Every failure carries a stable machine-readable code so callers (HTTP
//! layers, schedulers, dashboards) can branch without string matching.
//! There is no "not enough data" error: an underpowered analysis is a
//! normal result.

use crate::experiment::types::TestStatus;

/// Errors surfaced by the engine and its stores
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExperimentError {
    /// Invalid variant percentages, missing control, or bad traffic values
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Lifecycle move not present in the transition table
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: TestStatus, to: TestStatus },

    #[error("Test not found: {0}")]
    TestNotFound(String),

    #[error("Test already exists: {0}")]
    TestAlreadyExists(String),

    /// Operation requires a status the test is not in
    #[error("Test {test_id} does not accept this operation while {status}")]
    TestNotActive { test_id: String, status: TestStatus },

    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("Invalid input for field '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    /// Registry race that idempotent retries could not resolve
    #[error("Concurrency conflict on {resource} after {attempts} attempt(s)")]
    ConcurrencyConflict { resource: String, attempts: u32 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ExperimentError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::TestNotFound(_) => "TEST_NOT_FOUND",
            Self::TestAlreadyExists(_) => "TEST_ALREADY_EXISTS",
            Self::TestNotActive { .. } => "TEST_NOT_ACTIVE",
            Self::ParticipantNotFound(_) => "PARTICIPANT_NOT_FOUND",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether repeating the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    pub fn invalid_input(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Storage internals use anyhow; anything escaping a store is a storage error
impl From<anyhow::Error> for ExperimentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

/// Helper trait to convert validation errors
pub trait ValidationErrorExt<T> {
    fn map_validation_err(self, field: &str) -> Result<T>;
}

impl<T> ValidationErrorExt<T> for anyhow::Result<T> {
    fn map_validation_err(self, field: &str) -> Result<T> {
        self.map_err(|e| ExperimentError::InvalidInput {
            field: field.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Type alias for Results using ExperimentError
pub type Result<T> = std::result::Result<T, ExperimentError>;
