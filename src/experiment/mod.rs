//! Experiment engine
//!
//! `ExperimentEngine` ties the pieces together behind four call contracts:
//! `decide_and_assign`, `record_event`, `transition_status` and `analyze`.
//! It owns no global state; the store is injected at construction and every
//! component shares it.
//!
//! Flow for one identity:
//!
//! ```text
//! decide_and_assign ─> allocator (pure) ─> registry (insert-if-absent)
//! record_event      ─> recorder (status gate) ─> store (atomic accounting)
//! analyze           ─> analyzer (pure) ─> store (immutable snapshot)
//! ```

pub mod aggregator;
pub mod allocator;
pub mod analyzer;
pub mod lifecycle;
pub mod recorder;
pub mod registry;
pub mod stats;
pub mod storage;
pub mod store;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use aggregator::{ExperimentSummary, TestSummaryRow};
pub use allocator::Allocation;
pub use analyzer::{
    AnalysisResult, AnalysisStatus, AnalyzerSettings, SrmCheck, StatisticalAnalyzer,
    VariantComparison, VariantSummary,
};
pub use storage::{RocksStore, WriteMode};
pub use store::{AssignOutcome, EventEffect, ExperimentStore, InMemoryStore};
pub use types::{
    ABTest, ABTestBuilder, AnalysisId, Event, EventId, EventType, Identity, Participant,
    ParticipantId, TestConfigUpdate, TestId, TestStatus, Variant, VariantId, VariantRollup,
    VariantSpec,
};

use crate::config::EngineConfig;
use crate::errors::{ExperimentError, Result, ValidationErrorExt};
use crate::metrics::{self, Timer};
use crate::validation;
use recorder::EventRecorder;
use registry::ParticipantRegistry;

/// Definition of a test to create
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Percentage of identities included at all (default 100)
    #[serde(default)]
    pub traffic_allocation: Option<f64>,
    /// Falls back to the engine's default confidence level
    #[serde(default)]
    pub confidence_level: Option<f64>,
    #[serde(default)]
    pub primary_metric: Option<String>,
    pub variants: Vec<VariantSpec>,
}

impl NewTest {
    pub fn new(name: &str, variants: Vec<VariantSpec>) -> Self {
        Self {
            name: name.to_string(),
            variants,
            ..Default::default()
        }
    }

    pub fn with_traffic_allocation(mut self, percent: f64) -> Self {
        self.traffic_allocation = Some(percent);
        self
    }

    pub fn with_confidence_level(mut self, level: f64) -> Self {
        self.confidence_level = Some(level);
        self
    }
}

/// Answer to "is this identity in the test, and where?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentOutcome {
    pub included: bool,
    pub variant_id: Option<VariantId>,
    pub participant_id: Option<ParticipantId>,
    /// Identity was the anonymous sentinel; every such caller shares one bucket
    pub anonymous: bool,
    /// This call created the participant
    pub newly_assigned: bool,
}

impl AssignmentOutcome {
    fn excluded(anonymous: bool) -> Self {
        Self {
            included: false,
            variant_id: None,
            participant_id: None,
            anonymous,
            newly_assigned: false,
        }
    }

    fn assigned(participant: &Participant, newly_assigned: bool) -> Self {
        Self {
            included: true,
            variant_id: Some(participant.variant_id),
            participant_id: Some(participant.id),
            anonymous: participant.identity.is_anonymous(),
            newly_assigned,
        }
    }
}

/// Experiment assignment and analysis engine
pub struct ExperimentEngine {
    store: Arc<dyn ExperimentStore>,
    config: EngineConfig,
    registry: ParticipantRegistry,
    recorder: EventRecorder,
    analyzer: StatisticalAnalyzer,
}

impl ExperimentEngine {
    pub fn new(store: Arc<dyn ExperimentStore>, config: EngineConfig) -> Self {
        let registry = ParticipantRegistry::new(store.clone(), config.max_assign_retries);
        let recorder = EventRecorder::new(store.clone(), config.record_events_while_paused);
        let analyzer = StatisticalAnalyzer::new(config.analyzer_settings());
        Self {
            store,
            config,
            registry,
            recorder,
            analyzer,
        }
    }

    /// Engine over a process-local store
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(InMemoryStore::shared(), config)
    }

    /// Engine over a RocksDB store at `config.storage_path`
    pub fn open(config: EngineConfig) -> Result<Self> {
        let store = RocksStore::open(&config.storage_path, config.write_mode)?;
        config.log();
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ExperimentStore> {
        &self.store
    }

    // =========================================================================
    // TEST MANAGEMENT
    // =========================================================================

    /// Create a test in `draft`
    pub fn create_test(&self, spec: NewTest) -> Result<ABTest> {
        validation::validate_name(&spec.name).map_validation_err("name")?;
        validation::validate_description(&spec.description).map_validation_err("description")?;
        validation::validate_variant_specs(&spec.variants).map_validation_err("variants")?;

        let confidence = spec
            .confidence_level
            .unwrap_or(self.config.default_confidence_level);
        validation::validate_confidence_level(confidence).map_validation_err("confidence_level")?;

        let mut builder = ABTest::builder(&spec.name)
            .with_description(&spec.description)
            .with_confidence_level(confidence);
        if let Some(traffic) = spec.traffic_allocation {
            builder = builder.with_traffic_allocation(traffic);
        }
        if let Some(metric) = &spec.primary_metric {
            validation::validate_name(metric).map_validation_err("primary_metric")?;
            builder = builder.with_primary_metric(metric);
        }
        for variant in spec.variants {
            builder = builder.with_variant_spec(variant);
        }
        let test = builder.build();

        allocator::validate_config(&test)?;
        self.store.insert_test(&test)?;

        info!(
            test_id = %test.id,
            name = %test.name,
            variants = test.variants.len(),
            traffic = test.traffic_allocation,
            "Test created"
        );
        Ok(test)
    }

    /// Change configuration of a test still in `draft`
    pub fn update_test_config(&self, test_id: &TestId, update: TestConfigUpdate) -> Result<ABTest> {
        let test = self.get_test(test_id)?;
        if !test.status.is_config_mutable() {
            return Err(ExperimentError::TestNotActive {
                test_id: test_id.to_string(),
                status: test.status,
            });
        }
        if update.is_empty() {
            return Ok(test);
        }

        if let Some(name) = &update.name {
            validation::validate_name(name).map_validation_err("name")?;
        }
        if let Some(description) = &update.description {
            validation::validate_description(description).map_validation_err("description")?;
        }
        if let Some(level) = update.confidence_level {
            validation::validate_confidence_level(level).map_validation_err("confidence_level")?;
        }
        if let Some(metric) = &update.primary_metric {
            validation::validate_name(metric).map_validation_err("primary_metric")?;
        }
        if let Some(variants) = &update.variants {
            validation::validate_variant_specs(variants).map_validation_err("variants")?;
        }

        let next = update.apply_to(&test);
        allocator::validate_config(&next)?;
        let stored = self.store.update_test(&next)?;

        info!(test_id = %test_id, revision = stored.revision, "Test configuration updated");
        Ok(stored)
    }

    /// Fetch a test with current rollups
    pub fn get_test(&self, test_id: &TestId) -> Result<ABTest> {
        self.store
            .get_test(test_id)?
            .ok_or_else(|| ExperimentError::TestNotFound(test_id.to_string()))
    }

    /// Fetch a test by its textual id (as received from callers)
    pub fn resolve_test(&self, raw_id: &str) -> Result<ABTest> {
        let test_id = validation::validate_test_id(raw_id).map_validation_err("test_id")?;
        self.get_test(&test_id)
    }

    pub fn list_tests(&self) -> Result<Vec<ABTest>> {
        self.store.list_tests()
    }

    pub fn list_tests_by_status(&self, status: TestStatus) -> Result<Vec<ABTest>> {
        Ok(self
            .store
            .list_tests()?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    // =========================================================================
    // ASSIGNMENT
    // =========================================================================

    /// Decide inclusion and variant for `identity`, persisting the assignment once
    ///
    /// A known identity always gets its original assignment back. New
    /// identities are only assigned while the test is running; a paused test
    /// still answers for identities it already knows.
    pub fn decide_and_assign(
        &self,
        test_id: &TestId,
        identity: &Identity,
    ) -> Result<AssignmentOutcome> {
        validation::validate_identity(identity).map_validation_err("identity")?;
        let test = self.get_test(test_id)?;

        let serves_existing = matches!(test.status, TestStatus::Running | TestStatus::Paused);
        if !serves_existing {
            return Err(ExperimentError::TestNotActive {
                test_id: test_id.to_string(),
                status: test.status,
            });
        }

        if identity.is_anonymous() {
            warn!(
                test_id = %test_id,
                "Anonymous identity: all anonymous callers share one allocation bucket"
            );
        }

        if let Some(existing) = self.registry.lookup(test_id, identity)? {
            metrics::record_assignment("existing");
            return Ok(AssignmentOutcome::assigned(&existing, false));
        }

        if !test.status.accepts_assignments() {
            return Err(ExperimentError::TestNotActive {
                test_id: test_id.to_string(),
                status: test.status,
            });
        }

        let variant = match allocator::allocate(&test, identity)? {
            Allocation::Excluded => {
                metrics::record_assignment("excluded");
                debug!(test_id = %test_id, "Identity excluded by traffic allocation");
                return Ok(AssignmentOutcome::excluded(identity.is_anonymous()));
            }
            Allocation::Included(variant) => variant,
        };

        let outcome = self.registry.assign(test_id, identity, &variant.id)?;
        let newly_assigned = outcome.is_new();
        let participant = outcome.into_participant();

        if newly_assigned {
            metrics::record_assignment("included");
            info!(
                test_id = %test_id,
                variant = %variant.name,
                participant_id = %participant.id,
                "Participant assigned"
            );
        } else {
            metrics::record_assignment("existing");
        }

        Ok(AssignmentOutcome::assigned(&participant, newly_assigned))
    }

    /// Participant by id
    pub fn participant(&self, participant_id: &ParticipantId) -> Result<Participant> {
        self.store
            .get_participant(participant_id)?
            .ok_or_else(|| ExperimentError::ParticipantNotFound(participant_id.to_string()))
    }

    pub fn participants(&self, test_id: &TestId) -> Result<Vec<Participant>> {
        self.get_test(test_id)?;
        self.store.list_participants(test_id)
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Append an event for an assigned participant
    pub fn record_event(
        &self,
        participant_id: &ParticipantId,
        variant_id: &VariantId,
        test_id: &TestId,
        event_type: EventType,
        value: Option<f64>,
    ) -> Result<Event> {
        let test = self.get_test(test_id)?;
        let recorded = self
            .recorder
            .record(&test, variant_id, participant_id, event_type, value)?;

        metrics::record_event(
            recorded.event.event_type.as_str(),
            recorded.effect.first_conversion,
        );
        Ok(recorded.event)
    }

    pub fn events(&self, test_id: &TestId) -> Result<Vec<Event>> {
        self.get_test(test_id)?;
        self.store.list_events(test_id)
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Move a test to `new_status`
    ///
    /// Disallowed moves fail with `InvalidStateTransition` and change nothing.
    /// A concurrent update to the same test is retried against fresh state.
    pub fn transition_status(&self, test_id: &TestId, new_status: TestStatus) -> Result<ABTest> {
        let max_attempts = self.config.max_assign_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let current = self.get_test(test_id)?;
            let next = lifecycle::apply_transition(&current, new_status, Utc::now())?;

            match self.store.update_test(&next) {
                Ok(stored) => {
                    metrics::record_transition(new_status.as_str());
                    info!(
                        test_id = %test_id,
                        from = %current.status,
                        to = %new_status,
                        "Test status changed"
                    );
                    return Ok(stored);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    debug!(test_id = %test_id, attempt, "Retrying transition after conflict");
                }
                Err(err) if err.is_retryable() => {
                    return Err(ExperimentError::ConcurrencyConflict {
                        resource: format!("test {test_id}"),
                        attempts: attempt,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn start_test(&self, test_id: &TestId) -> Result<ABTest> {
        self.transition_status(test_id, TestStatus::Running)
    }

    pub fn pause_test(&self, test_id: &TestId) -> Result<ABTest> {
        self.transition_status(test_id, TestStatus::Paused)
    }

    pub fn complete_test(&self, test_id: &TestId) -> Result<ABTest> {
        self.transition_status(test_id, TestStatus::Completed)
    }

    pub fn cancel_test(&self, test_id: &TestId) -> Result<ABTest> {
        self.transition_status(test_id, TestStatus::Cancelled)
    }

    // =========================================================================
    // ANALYSIS
    // =========================================================================

    /// Analyze current rollups and persist the snapshot
    pub fn analyze(&self, test_id: &TestId, force: bool) -> Result<AnalysisResult> {
        let _timer = Timer::new(metrics::ANALYSIS_DURATION.clone());
        let test = self.get_test(test_id)?;

        let result = match self.analyzer.analyze(&test, force) {
            Ok(result) => result,
            Err(err) => {
                metrics::record_analysis("error");
                return Err(err);
            }
        };
        self.store.save_analysis(&result)?;
        metrics::record_analysis(result.status.as_str());

        info!(
            test_id = %test_id,
            status = result.status.as_str(),
            sample_size = result.sample_size,
            p_value = result.p_value.unwrap_or(1.0),
            significant = result.is_significant,
            "Analysis recorded"
        );
        Ok(result)
    }

    /// Most recent snapshot, if any
    pub fn latest_analysis(&self, test_id: &TestId) -> Result<Option<AnalysisResult>> {
        Ok(self.analysis_history(test_id)?.pop())
    }

    /// All snapshots, oldest first
    pub fn analysis_history(&self, test_id: &TestId) -> Result<Vec<AnalysisResult>> {
        self.get_test(test_id)?;
        self.store.list_analyses(test_id)
    }

    // =========================================================================
    // REPORTING
    // =========================================================================

    /// Cross-test dashboard summary
    pub fn summary(&self) -> Result<ExperimentSummary> {
        let tests = self.store.list_tests()?;
        let mut latest: HashMap<TestId, AnalysisResult> = HashMap::new();
        for test in &tests {
            if let Some(result) = self.store.list_analyses(&test.id)?.pop() {
                latest.insert(test.id, result);
            }
        }
        Ok(aggregator::summarize(&tests, |id| latest.get(id)))
    }
}
