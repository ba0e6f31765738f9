//! Test status state machine
//!
//! ```text
//! draft ──> running <──> paused
//!   │          │  \        │  \
//!   │          │   └─> completed <┘
//!   └──────────┴──────> cancelled <┘
//! ```
//!
//! `completed` and `cancelled` are terminal. Transitions are computed on a
//! copy so a rejected move leaves the stored test untouched.

use chrono::{DateTime, Utc};

use super::allocator::validate_config;
use super::types::{ABTest, TestId, TestStatus};
use crate::errors::{ExperimentError, Result};

impl TestStatus {
    /// Outgoing edges of the transition table
    pub fn allowed_transitions(self) -> &'static [TestStatus] {
        match self {
            TestStatus::Draft => &[TestStatus::Running, TestStatus::Cancelled],
            TestStatus::Running => &[
                TestStatus::Paused,
                TestStatus::Completed,
                TestStatus::Cancelled,
            ],
            TestStatus::Paused => &[
                TestStatus::Running,
                TestStatus::Completed,
                TestStatus::Cancelled,
            ],
            TestStatus::Completed | TestStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: TestStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Variants, traffic and metric may only change in draft
    pub fn is_config_mutable(self) -> bool {
        self == TestStatus::Draft
    }

    /// Statuses in which new participants may be created
    pub const ASSIGNABLE: &'static [TestStatus] = &[TestStatus::Running];

    /// Statuses in which events are accepted
    pub fn event_statuses(allow_paused: bool) -> &'static [TestStatus] {
        if allow_paused {
            &[TestStatus::Running, TestStatus::Paused]
        } else {
            &[TestStatus::Running]
        }
    }

    /// New identities may only be assigned while running
    pub fn accepts_assignments(self) -> bool {
        Self::ASSIGNABLE.contains(&self)
    }

    /// Events are accepted while running, and while paused when policy allows
    pub fn accepts_events(self, allow_paused: bool) -> bool {
        Self::event_statuses(allow_paused).contains(&self)
    }
}

/// Check that `test` exists and sits in one of the `admit` statuses
///
/// Stores call this inside the critical section of a write, so a transition
/// committed concurrently is always observed before the write lands.
pub fn ensure_admitted(
    test_id: &TestId,
    test: Option<&ABTest>,
    admit: &[TestStatus],
) -> Result<()> {
    let test = test.ok_or_else(|| ExperimentError::TestNotFound(test_id.to_string()))?;
    if admit.contains(&test.status) {
        Ok(())
    } else {
        Err(ExperimentError::TestNotActive {
            test_id: test_id.to_string(),
            status: test.status,
        })
    }
}

/// Compute the test that results from moving to `to` at `now`
///
/// - first entry into `running` stamps `started_at` (resume keeps it)
/// - entry into `completed` or `cancelled` stamps `ended_at`
/// - leaving `draft` for `running` re-validates the configuration
pub fn apply_transition(test: &ABTest, to: TestStatus, now: DateTime<Utc>) -> Result<ABTest> {
    let from = test.status;
    if !from.can_transition_to(to) {
        return Err(ExperimentError::InvalidStateTransition { from, to });
    }

    if from == TestStatus::Draft && to == TestStatus::Running {
        validate_config(test)?;
    }

    let mut next = test.clone();
    next.status = to;
    next.updated_at = now;

    match to {
        TestStatus::Running => {
            if next.started_at.is_none() {
                next.started_at = Some(now);
            }
        }
        TestStatus::Completed | TestStatus::Cancelled => {
            next.ended_at = Some(now);
        }
        TestStatus::Draft | TestStatus::Paused => {}
    }

    Ok(next)
}
