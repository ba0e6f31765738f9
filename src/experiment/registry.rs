//! Participant registry: durable, idempotent (test, identity) -> variant
//!
//! The store's insert-if-absent resolves races between concurrent first
//! assignments. A store may still report a transient conflict (for example
//! an index entry whose participant row is not visible yet); the registry
//! retries those and surfaces `ConcurrencyConflict` only once retries run out.
//!
//! New bindings are only admitted while the test is running; the store checks
//! that under the same lock as the write.

use std::sync::Arc;

use tracing::{debug, warn};

use super::store::{AssignOutcome, ExperimentStore};
use super::types::{Identity, Participant, TestId, TestStatus, VariantId};
use crate::errors::{ExperimentError, Result};

pub struct ParticipantRegistry {
    store: Arc<dyn ExperimentStore>,
    max_attempts: u32,
}

impl ParticipantRegistry {
    pub fn new(store: Arc<dyn ExperimentStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Bind `identity` to `variant_id` unless it is already bound
    ///
    /// A known identity gets its original participant back unchanged, even if
    /// `variant_id` differs from the one it was first assigned.
    pub fn assign(
        &self,
        test_id: &TestId,
        identity: &Identity,
        variant_id: &VariantId,
    ) -> Result<AssignOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.get_or_create_participant(
                test_id,
                identity,
                variant_id,
                TestStatus::ASSIGNABLE,
            ) {
                Ok(outcome) => {
                    if attempt > 1 {
                        debug!(test_id = %test_id, attempt, "assignment resolved after retry");
                    }
                    return Ok(outcome);
                }
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    debug!(test_id = %test_id, attempt, error = %err, "retrying assignment");
                }
                Err(err) if err.is_retryable() => {
                    warn!(test_id = %test_id, attempts = attempt, "assignment retries exhausted");
                    return Err(ExperimentError::ConcurrencyConflict {
                        resource: format!("participant in test {test_id}"),
                        attempts: attempt,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Existing assignment for `identity`, if any
    pub fn lookup(
        &self,
        test_id: &TestId,
        identity: &Identity,
    ) -> Result<Option<Participant>> {
        self.store.find_participant(test_id, identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::analyzer::AnalysisResult;
    use crate::experiment::store::{EventEffect, InMemoryStore};
    use crate::experiment::types::{ABTest, Event, ParticipantId, VariantRollup};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Delegates to an in-memory store but fails the first `failures` assigns
    struct FlakyStore {
        inner: InMemoryStore,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryStore::new(),
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl ExperimentStore for FlakyStore {
        fn insert_test(&self, test: &ABTest) -> Result<()> {
            self.inner.insert_test(test)
        }
        fn get_test(&self, id: &TestId) -> Result<Option<ABTest>> {
            self.inner.get_test(id)
        }
        fn update_test(&self, test: &ABTest) -> Result<ABTest> {
            self.inner.update_test(test)
        }
        fn list_tests(&self) -> Result<Vec<ABTest>> {
            self.inner.list_tests()
        }
        fn get_or_create_participant(
            &self,
            test_id: &TestId,
            identity: &Identity,
            variant_id: &VariantId,
            admit: &[TestStatus],
        ) -> Result<AssignOutcome> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ExperimentError::ConcurrencyConflict {
                    resource: "participant".to_string(),
                    attempts: 1,
                });
            }
            self.inner
                .get_or_create_participant(test_id, identity, variant_id, admit)
        }
        fn get_participant(&self, id: &ParticipantId) -> Result<Option<Participant>> {
            self.inner.get_participant(id)
        }
        fn find_participant(
            &self,
            test_id: &TestId,
            identity: &Identity,
        ) -> Result<Option<Participant>> {
            self.inner.find_participant(test_id, identity)
        }
        fn list_participants(&self, test_id: &TestId) -> Result<Vec<Participant>> {
            self.inner.list_participants(test_id)
        }
        fn append_event(&self, event: &Event, admit: &[TestStatus]) -> Result<EventEffect> {
            self.inner.append_event(event, admit)
        }
        fn list_events(&self, test_id: &TestId) -> Result<Vec<Event>> {
            self.inner.list_events(test_id)
        }
        fn rollups(&self, test_id: &TestId) -> Result<HashMap<VariantId, VariantRollup>> {
            self.inner.rollups(test_id)
        }
        fn save_analysis(&self, result: &AnalysisResult) -> Result<()> {
            self.inner.save_analysis(result)
        }
        fn list_analyses(&self, test_id: &TestId) -> Result<Vec<AnalysisResult>> {
            self.inner.list_analyses(test_id)
        }
    }

    /// Running two-variant test stored in `store`
    fn running_in(store: &dyn ExperimentStore) -> ABTest {
        let mut test = ABTest::builder("registry")
            .with_control("control", 50.0)
            .with_variant("v", 50.0)
            .build();
        test.status = TestStatus::Running;
        store.insert_test(&test).unwrap();
        test
    }

    #[test]
    fn test_second_assign_returns_original() {
        let store = InMemoryStore::shared();
        let test = running_in(store.as_ref());
        let registry = ParticipantRegistry::new(store, 3);
        let (test_id, first_variant) = (test.id, test.variants[0].id);
        let identity = Identity::user("u-1");

        let first = registry.assign(&test_id, &identity, &first_variant).unwrap();
        assert!(first.is_new());

        let other_variant = test.variants[1].id;
        let second = registry.assign(&test_id, &identity, &other_variant).unwrap();
        assert!(!second.is_new());
        assert_eq!(second.participant().id, first.participant().id);
        assert_eq!(second.participant().variant_id, first_variant);

        let found = registry.lookup(&test_id, &identity).unwrap().unwrap();
        assert_eq!(found.id, first.participant().id);
    }

    #[test]
    fn test_transient_conflict_is_retried() {
        let store = Arc::new(FlakyStore::new(2));
        let test = running_in(store.as_ref());
        let registry = ParticipantRegistry::new(store.clone(), 3);
        let (test_id, variant) = (test.id, test.variants[0].id);

        let outcome = registry
            .assign(&test_id, &Identity::user("u"), &variant)
            .unwrap();
        assert!(outcome.is_new());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_retries_surface_conflict() {
        let store = Arc::new(FlakyStore::new(10));
        let test = running_in(store.as_ref());
        let registry = ParticipantRegistry::new(store.clone(), 3);
        let (test_id, variant) = (test.id, test.variants[0].id);

        let err = registry
            .assign(&test_id, &Identity::user("u"), &variant)
            .unwrap_err();
        assert_eq!(
            err,
            ExperimentError::ConcurrencyConflict {
                resource: format!("participant in test {test_id}"),
                attempts: 3,
            }
        );
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_new_bindings_refused_unless_running() {
        let store = InMemoryStore::shared();
        let test = running_in(store.as_ref());
        let registry = ParticipantRegistry::new(store.clone(), 3);
        let variant = test.variants[0].id;
        registry.assign(&test.id, &Identity::user("early"), &variant).unwrap();

        let mut paused = test.clone();
        paused.status = TestStatus::Paused;
        store.update_test(&paused).unwrap();

        let err = registry
            .assign(&test.id, &Identity::user("late"), &variant)
            .unwrap_err();
        assert_eq!(err.code(), "TEST_NOT_ACTIVE");
        assert!(registry
            .lookup(&test.id, &Identity::user("late"))
            .unwrap()
            .is_none());
        assert!(registry
            .lookup(&test.id, &Identity::user("early"))
            .unwrap()
            .is_some());
    }
}
