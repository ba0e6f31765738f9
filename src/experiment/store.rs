//! Persistence boundary for the engine
//!
//! Components never touch global state: the engine is handed an
//! `Arc<dyn ExperimentStore>` at bootstrap. Implementations must provide two
//! atomic primitives:
//!
//! - insert-if-absent on (test_id, identity key), with the variant's
//!   participant counter bumped inside the same critical section
//! - event append with first-conversion accounting, where the "already
//!   converted?" check and the rollup increment happen together
//!
//! Both re-check the test's status inside their critical section, so once a
//! transition to `completed` or `cancelled` commits, no later participant or
//! counter change can land.
//!
//! Rollups are never written from a caller-supplied value. `update_test`
//! ignores the `rollup` snapshots carried by variants.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::analyzer::AnalysisResult;
use super::lifecycle::ensure_admitted;
use super::types::{
    ABTest, Event, EventType, Identity, Participant, ParticipantId, TestId, TestStatus, VariantId,
    VariantRollup,
};
use crate::errors::{ExperimentError, Result};

/// Result of an insert-if-absent assignment
#[derive(Debug, Clone, PartialEq)]
pub enum AssignOutcome {
    /// This call created the participant
    Created(Participant),
    /// The (test, identity) pair was already assigned; returned unchanged
    Existing(Participant),
}

impl AssignOutcome {
    pub fn participant(&self) -> &Participant {
        match self {
            AssignOutcome::Created(p) | AssignOutcome::Existing(p) => p,
        }
    }

    pub fn into_participant(self) -> Participant {
        match self {
            AssignOutcome::Created(p) | AssignOutcome::Existing(p) => p,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, AssignOutcome::Created(_))
    }
}

/// What appending an event changed
#[derive(Debug, Clone, PartialEq)]
pub struct EventEffect {
    /// Participant state after the event was applied
    pub participant: Participant,
    /// True only for the participant's first conversion
    pub first_conversion: bool,
}

/// Storage contract consumed by the engine
pub trait ExperimentStore: Send + Sync {
    /// Insert a new test; fails with `TestAlreadyExists` on id collision
    fn insert_test(&self, test: &ABTest) -> Result<()>;

    /// Fetch a test with current rollups populated on its variants
    fn get_test(&self, id: &TestId) -> Result<Option<ABTest>>;

    /// Replace a test's configuration and status
    ///
    /// Succeeds only if the stored revision equals `test.revision`; the
    /// stored revision is then bumped. A mismatch is a `ConcurrencyConflict`.
    fn update_test(&self, test: &ABTest) -> Result<ABTest>;

    fn list_tests(&self) -> Result<Vec<ABTest>>;

    /// Atomic get-or-create keyed by (test_id, identity)
    ///
    /// Fails with `TestNotActive` unless the test's status, read inside the
    /// same critical section as the insert, is one of `admit`.
    fn get_or_create_participant(
        &self,
        test_id: &TestId,
        identity: &Identity,
        variant_id: &VariantId,
        admit: &[TestStatus],
    ) -> Result<AssignOutcome>;

    fn get_participant(&self, id: &ParticipantId) -> Result<Option<Participant>>;

    fn find_participant(&self, test_id: &TestId, identity: &Identity)
        -> Result<Option<Participant>>;

    fn list_participants(&self, test_id: &TestId) -> Result<Vec<Participant>>;

    /// Append an event and apply its accounting atomically
    ///
    /// `view` bumps page views; the first `conversion` marks the participant
    /// converted and increments the variant's conversions and value. Later
    /// conversions are stored but change no counters. The status gate is the
    /// same as for `get_or_create_participant`.
    fn append_event(&self, event: &Event, admit: &[TestStatus]) -> Result<EventEffect>;

    /// Events for a test in append order
    fn list_events(&self, test_id: &TestId) -> Result<Vec<Event>>;

    fn rollups(&self, test_id: &TestId) -> Result<HashMap<VariantId, VariantRollup>>;

    /// Persist an immutable analysis snapshot
    fn save_analysis(&self, result: &AnalysisResult) -> Result<()>;

    /// Snapshots for a test, oldest first
    fn list_analyses(&self, test_id: &TestId) -> Result<Vec<AnalysisResult>>;
}

/// Apply an event to a participant, returning whether it was a first conversion
///
/// Shared by every store so accounting rules live in one place.
pub(crate) fn apply_event_to_participant(participant: &mut Participant, event: &Event) -> bool {
    participant.last_seen_at = event.created_at;
    match event.event_type {
        EventType::View => {
            participant.page_views += 1;
            false
        }
        EventType::Conversion if !participant.converted => {
            participant.converted = true;
            participant.conversion_at = Some(event.created_at);
            participant.conversion_value = event.value;
            true
        }
        EventType::Conversion | EventType::Click | EventType::Custom(_) => false,
    }
}

/// Fold a first conversion into a rollup
pub(crate) fn apply_conversion_to_rollup(rollup: &mut VariantRollup, value: Option<f64>) {
    rollup.conversions_count += 1;
    rollup.total_value += value.unwrap_or(0.0);
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// Process-local store backed by sharded maps
///
/// Lock order is tests -> identity index -> participants -> rollups; no path
/// acquires them in the opposite direction. Writers to participants and
/// rollups hold the `tests` read lock throughout, which is what makes
/// `update_test` (a write lock) a barrier for them.
#[derive(Default)]
pub struct InMemoryStore {
    tests: RwLock<HashMap<TestId, ABTest>>,
    identity_index: DashMap<(TestId, String), ParticipantId>,
    participants: DashMap<ParticipantId, Participant>,
    rollups: DashMap<VariantId, VariantRollup>,
    events: DashMap<TestId, Vec<Event>>,
    analyses: RwLock<HashMap<TestId, Vec<AnalysisResult>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn ExperimentStore> {
        Arc::new(Self::new())
    }

    fn with_rollups(&self, mut test: ABTest) -> ABTest {
        for variant in &mut test.variants {
            variant.rollup = self
                .rollups
                .get(&variant.id)
                .map(|r| *r)
                .unwrap_or_default();
        }
        test
    }
}

impl ExperimentStore for InMemoryStore {
    fn insert_test(&self, test: &ABTest) -> Result<()> {
        let mut tests = self.tests.write();
        if tests.contains_key(&test.id) {
            return Err(ExperimentError::TestAlreadyExists(test.id.to_string()));
        }
        let mut stored = test.clone();
        for variant in &mut stored.variants {
            variant.rollup = VariantRollup::default();
        }
        tests.insert(test.id, stored);
        Ok(())
    }

    fn get_test(&self, id: &TestId) -> Result<Option<ABTest>> {
        let test = self.tests.read().get(id).cloned();
        Ok(test.map(|t| self.with_rollups(t)))
    }

    fn update_test(&self, test: &ABTest) -> Result<ABTest> {
        let mut tests = self.tests.write();
        let current = tests
            .get_mut(&test.id)
            .ok_or_else(|| ExperimentError::TestNotFound(test.id.to_string()))?;

        if current.revision != test.revision {
            return Err(ExperimentError::ConcurrencyConflict {
                resource: format!("test {}", test.id),
                attempts: 1,
            });
        }

        let mut next = test.clone();
        next.revision = current.revision + 1;
        for variant in &mut next.variants {
            variant.rollup = VariantRollup::default();
        }
        *current = next.clone();
        drop(tests);

        Ok(self.with_rollups(next))
    }

    fn list_tests(&self) -> Result<Vec<ABTest>> {
        let tests: Vec<ABTest> = self.tests.read().values().cloned().collect();
        let mut tests: Vec<ABTest> = tests.into_iter().map(|t| self.with_rollups(t)).collect();
        tests.sort_by_key(|t| t.created_at);
        Ok(tests)
    }

    fn get_or_create_participant(
        &self,
        test_id: &TestId,
        identity: &Identity,
        variant_id: &VariantId,
        admit: &[TestStatus],
    ) -> Result<AssignOutcome> {
        let tests = self.tests.read();
        ensure_admitted(test_id, tests.get(test_id), admit)?;

        match self.identity_index.entry((*test_id, identity.key())) {
            Entry::Occupied(entry) => {
                let participant_id = *entry.get();
                let participant = self
                    .participants
                    .get(&participant_id)
                    .map(|p| p.clone())
                    .ok_or_else(|| ExperimentError::ConcurrencyConflict {
                        resource: format!("participant {participant_id}"),
                        attempts: 1,
                    })?;
                Ok(AssignOutcome::Existing(participant))
            }
            Entry::Vacant(entry) => {
                let participant = Participant::new(*test_id, identity.clone(), *variant_id);
                self.participants
                    .insert(participant.id, participant.clone());
                self.rollups
                    .entry(*variant_id)
                    .or_default()
                    .participants_count += 1;
                entry.insert(participant.id);
                debug!(test_id = %test_id, participant_id = %participant.id, "participant created");
                Ok(AssignOutcome::Created(participant))
            }
        }
    }

    fn get_participant(&self, id: &ParticipantId) -> Result<Option<Participant>> {
        Ok(self.participants.get(id).map(|p| p.clone()))
    }

    fn find_participant(
        &self,
        test_id: &TestId,
        identity: &Identity,
    ) -> Result<Option<Participant>> {
        let participant_id = match self.identity_index.get(&(*test_id, identity.key())) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get_participant(&participant_id)
    }

    fn list_participants(&self, test_id: &TestId) -> Result<Vec<Participant>> {
        let mut participants: Vec<Participant> = self
            .participants
            .iter()
            .filter(|p| &p.test_id == test_id)
            .map(|p| p.clone())
            .collect();
        participants.sort_by_key(|p| p.assigned_at);
        Ok(participants)
    }

    fn append_event(&self, event: &Event, admit: &[TestStatus]) -> Result<EventEffect> {
        let tests = self.tests.read();
        ensure_admitted(&event.test_id, tests.get(&event.test_id), admit)?;

        let mut participant = self
            .participants
            .get_mut(&event.participant_id)
            .ok_or_else(|| ExperimentError::ParticipantNotFound(event.participant_id.to_string()))?;

        let first_conversion = apply_event_to_participant(&mut participant, event);
        if first_conversion {
            let mut rollup = self.rollups.entry(participant.variant_id).or_default();
            apply_conversion_to_rollup(&mut rollup, event.value);
        }

        self.events
            .entry(event.test_id)
            .or_default()
            .push(event.clone());

        let effect = EventEffect {
            participant: participant.clone(),
            first_conversion,
        };
        drop(participant);
        drop(tests);
        Ok(effect)
    }

    fn list_events(&self, test_id: &TestId) -> Result<Vec<Event>> {
        Ok(self
            .events
            .get(test_id)
            .map(|events| events.clone())
            .unwrap_or_default())
    }

    fn rollups(&self, test_id: &TestId) -> Result<HashMap<VariantId, VariantRollup>> {
        let tests = self.tests.read();
        let test = tests
            .get(test_id)
            .ok_or_else(|| ExperimentError::TestNotFound(test_id.to_string()))?;
        Ok(test
            .variants
            .iter()
            .map(|v| {
                let rollup = self.rollups.get(&v.id).map(|r| *r).unwrap_or_default();
                (v.id, rollup)
            })
            .collect())
    }

    fn save_analysis(&self, result: &AnalysisResult) -> Result<()> {
        self.analyses
            .write()
            .entry(result.test_id)
            .or_default()
            .push(result.clone());
        Ok(())
    }

    fn list_analyses(&self, test_id: &TestId) -> Result<Vec<AnalysisResult>> {
        Ok(self
            .analyses
            .read()
            .get(test_id)
            .cloned()
            .unwrap_or_default())
    }
}
