//! Event recorder
//!
//! Checks that an event is admissible for the test's status and that the
//! participant actually belongs to the claimed test and variant, then hands
//! it to the store, which applies view and first-conversion accounting
//! atomically.

use std::sync::Arc;

use tracing::{debug, info};

use super::store::{EventEffect, ExperimentStore};
use super::types::{ABTest, Event, EventType, ParticipantId, TestStatus, VariantId};
use crate::errors::{ExperimentError, Result, ValidationErrorExt};
use crate::validation;

/// An appended event and its accounting effect
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub event: Event,
    pub effect: EventEffect,
}

pub struct EventRecorder {
    store: Arc<dyn ExperimentStore>,
    allow_while_paused: bool,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn ExperimentStore>, allow_while_paused: bool) -> Self {
        Self {
            store,
            allow_while_paused,
        }
    }

    /// Record an event for `participant_id` in `test`
    pub fn record(
        &self,
        test: &ABTest,
        variant_id: &VariantId,
        participant_id: &ParticipantId,
        event_type: EventType,
        value: Option<f64>,
    ) -> Result<RecordedEvent> {
        if !test.status.accepts_events(self.allow_while_paused) {
            return Err(ExperimentError::TestNotActive {
                test_id: test.id.to_string(),
                status: test.status,
            });
        }

        validation::validate_event_value(value).map_validation_err("value")?;
        if let EventType::Custom(name) = &event_type {
            validation::validate_custom_event_name(name).map_validation_err("event_type")?;
        }

        let participant = self
            .store
            .get_participant(participant_id)?
            .ok_or_else(|| ExperimentError::ParticipantNotFound(participant_id.to_string()))?;

        if participant.test_id != test.id {
            return Err(ExperimentError::invalid_input(
                "test_id",
                format!("participant {participant_id} does not belong to test {}", test.id),
            ));
        }
        if &participant.variant_id != variant_id {
            return Err(ExperimentError::invalid_input(
                "variant_id",
                format!("participant {participant_id} is assigned to another variant"),
            ));
        }

        let event = Event::new(test.id, *variant_id, *participant_id, event_type, value);
        let effect = self
            .store
            .append_event(&event, TestStatus::event_statuses(self.allow_while_paused))?;

        if effect.first_conversion {
            info!(
                test_id = %test.id,
                variant_id = %variant_id,
                value = value.unwrap_or(0.0),
                "participant converted"
            );
        } else {
            debug!(test_id = %test.id, event_type = event.event_type.as_str(), "event recorded");
        }

        Ok(RecordedEvent { event, effect })
    }
}
