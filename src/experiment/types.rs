//! Core data model for experiments
//!
//! Tests, variants, participants and events. Statuses and event kinds are
//! closed enums; all ids are UUID newtypes so a participant id can never be
//! passed where a variant id is expected.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{ANONYMOUS_IDENTITY, DEFAULT_CONFIDENCE_LEVEL};

// =============================================================================
// IDENTIFIERS
// =============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an experiment
    TestId
);
uuid_id!(
    /// Identifier of a variant; ordering defines allocation order
    VariantId
);
uuid_id!(ParticipantId);
uuid_id!(EventId);
uuid_id!(AnalysisId);

// =============================================================================
// STATUS
// =============================================================================

/// Lifecycle status of a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// Being configured; the only state where configuration may change
    Draft,
    /// Assigning participants and recording events
    Running,
    /// No new assignments; existing participants may still record events
    Paused,
    /// Concluded (terminal)
    Completed,
    /// Abandoned (terminal)
    Cancelled,
}

impl TestStatus {
    pub const ALL: [TestStatus; 5] = [
        TestStatus::Draft,
        TestStatus::Running,
        TestStatus::Paused,
        TestStatus::Completed,
        TestStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Draft => "draft",
            TestStatus::Running => "running",
            TestStatus::Paused => "paused",
            TestStatus::Completed => "completed",
            TestStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Who is being allocated
///
/// A stable user id is preferred; an anonymous session token is the fallback.
/// `Anonymous` collapses every caller onto one sentinel key, so all such
/// traffic lands in the same bucket and cannot be partitioned per user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    User(String),
    Session(String),
    Anonymous,
}

impl Identity {
    pub fn user(user_id: impl Into<String>) -> Self {
        Identity::User(user_id.into())
    }

    pub fn session(token: impl Into<String>) -> Self {
        Identity::Session(token.into())
    }

    /// Pick the strongest identity available (user id, then session token)
    pub fn from_parts(user_id: Option<&str>, session_token: Option<&str>) -> Self {
        fn non_blank(s: Option<&str>) -> Option<&str> {
            s.map(str::trim).filter(|s| !s.is_empty())
        }

        if let Some(user) = non_blank(user_id) {
            Identity::User(user.to_string())
        } else if let Some(token) = non_blank(session_token) {
            Identity::Session(token.to_string())
        } else {
            Identity::Anonymous
        }
    }

    /// Key used for hashing and for the (test, identity) uniqueness index
    ///
    /// The kind prefix keeps a user id and a session token with the same text
    /// from colliding.
    pub fn key(&self) -> String {
        match self {
            Identity::User(id) => format!("user:{id}"),
            Identity::Session(token) => format!("session:{token}"),
            Identity::Anonymous => ANONYMOUS_IDENTITY.to_string(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }
}

// =============================================================================
// VARIANTS
// =============================================================================

/// Aggregated per-variant counters
///
/// Only ever changed through the store's atomic accounting paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantRollup {
    pub participants_count: u64,
    pub conversions_count: u64,
    pub total_value: f64,
}

impl VariantRollup {
    pub fn conversion_rate(&self) -> f64 {
        if self.participants_count == 0 {
            0.0
        } else {
            self.conversions_count as f64 / self.participants_count as f64
        }
    }

    /// Average value per converted participant
    pub fn average_value(&self) -> f64 {
        if self.conversions_count == 0 {
            0.0
        } else {
            self.total_value / self.conversions_count as f64
        }
    }
}

/// One arm of a test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub test_id: TestId,
    pub name: String,
    pub description: String,
    pub is_control: bool,
    /// Share of included traffic, in percent
    pub traffic_percentage: f64,
    /// Snapshot of the counters at read time. Stores ignore this field on write.
    pub rollup: VariantRollup,
}

/// Variant definition before ids are assigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_control: bool,
    pub traffic_percentage: f64,
}

impl VariantSpec {
    pub fn control(name: &str, traffic_percentage: f64) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            is_control: true,
            traffic_percentage,
        }
    }

    pub fn treatment(name: &str, traffic_percentage: f64) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            is_control: false,
            traffic_percentage,
        }
    }

    fn into_variant(self, test_id: TestId) -> Variant {
        Variant {
            id: VariantId::new(),
            test_id,
            name: self.name,
            description: self.description,
            is_control: self.is_control,
            traffic_percentage: self.traffic_percentage,
            rollup: VariantRollup::default(),
        }
    }
}

/// Build variants from specs, sorted into allocation order (ascending id)
pub fn materialize_variants(test_id: TestId, specs: Vec<VariantSpec>) -> Vec<Variant> {
    let mut variants: Vec<Variant> = specs
        .into_iter()
        .map(|spec| spec.into_variant(test_id))
        .collect();
    variants.sort_by_key(|v| v.id);
    variants
}

// =============================================================================
// TESTS
// =============================================================================

/// An experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ABTest {
    pub id: TestId,
    pub name: String,
    pub description: String,
    pub status: TestStatus,
    /// Percentage of identities included in the test at all (0-100)
    pub traffic_allocation: f64,
    /// Confidence level in percent; alpha = (100 - level) / 100
    pub confidence_level: f64,
    /// Name of the conversion metric this test optimizes
    pub primary_metric: String,
    /// Per-test hash salt, fixed at creation and never mutated
    pub allocation_salt: String,
    /// Variants in allocation order (ascending id)
    pub variants: Vec<Variant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency revision, bumped by the store on every update
    pub revision: u64,
}

impl ABTest {
    /// Create a new test builder
    pub fn builder(name: &str) -> ABTestBuilder {
        ABTestBuilder::new(name)
    }

    /// The control variant, if configured
    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.is_control)
    }

    pub fn variant(&self, id: &VariantId) -> Option<&Variant> {
        self.variants.iter().find(|v| &v.id == id)
    }

    /// Non-control variants in allocation order
    pub fn treatments(&self) -> impl Iterator<Item = &Variant> {
        self.variants.iter().filter(|v| !v.is_control)
    }

    /// Significance threshold derived from the confidence level
    pub fn alpha(&self) -> f64 {
        (100.0 - self.confidence_level) / 100.0
    }

    pub fn total_participants(&self) -> u64 {
        self.variants
            .iter()
            .map(|v| v.rollup.participants_count)
            .sum()
    }

    pub fn total_conversions(&self) -> u64 {
        self.variants.iter().map(|v| v.rollup.conversions_count).sum()
    }

    pub fn total_value(&self) -> f64 {
        self.variants.iter().map(|v| v.rollup.total_value).sum()
    }
}

/// Builder for creating tests in `Draft`
pub struct ABTestBuilder {
    id: TestId,
    name: String,
    description: String,
    traffic_allocation: f64,
    confidence_level: f64,
    primary_metric: String,
    variants: Vec<VariantSpec>,
}

impl ABTestBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            id: TestId::new(),
            name: name.to_string(),
            description: String::new(),
            traffic_allocation: 100.0,
            confidence_level: DEFAULT_CONFIDENCE_LEVEL,
            primary_metric: "conversion".to_string(),
            variants: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: TestId) -> Self {
        self.id = id;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_traffic_allocation(mut self, percent: f64) -> Self {
        self.traffic_allocation = percent;
        self
    }

    pub fn with_confidence_level(mut self, level: f64) -> Self {
        self.confidence_level = level;
        self
    }

    pub fn with_primary_metric(mut self, metric: &str) -> Self {
        self.primary_metric = metric.to_string();
        self
    }

    pub fn with_control(mut self, name: &str, traffic_percentage: f64) -> Self {
        self.variants
            .push(VariantSpec::control(name, traffic_percentage));
        self
    }

    pub fn with_variant(mut self, name: &str, traffic_percentage: f64) -> Self {
        self.variants
            .push(VariantSpec::treatment(name, traffic_percentage));
        self
    }

    pub fn with_variant_spec(mut self, spec: VariantSpec) -> Self {
        self.variants.push(spec);
        self
    }

    /// Build the test. Validation happens when the engine accepts it.
    pub fn build(self) -> ABTest {
        let now = Utc::now();
        ABTest {
            id: self.id,
            name: self.name,
            description: self.description,
            status: TestStatus::Draft,
            traffic_allocation: self.traffic_allocation,
            confidence_level: self.confidence_level,
            primary_metric: self.primary_metric,
            allocation_salt: self.id.to_string(),
            variants: materialize_variants(self.id, self.variants),
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            revision: 0,
        }
    }
}

/// Partial configuration update, legal only while a test is in `Draft`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestConfigUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub traffic_allocation: Option<f64>,
    pub confidence_level: Option<f64>,
    pub primary_metric: Option<String>,
    /// Replaces the full variant set (new ids are issued)
    pub variants: Option<Vec<VariantSpec>>,
}

impl TestConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.traffic_allocation.is_none()
            && self.confidence_level.is_none()
            && self.primary_metric.is_none()
            && self.variants.is_none()
    }

    /// Apply onto a copy of `test`; the original is untouched
    pub fn apply_to(&self, test: &ABTest) -> ABTest {
        let mut next = test.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }
        if let Some(description) = &self.description {
            next.description = description.clone();
        }
        if let Some(traffic) = self.traffic_allocation {
            next.traffic_allocation = traffic;
        }
        if let Some(level) = self.confidence_level {
            next.confidence_level = level;
        }
        if let Some(metric) = &self.primary_metric {
            next.primary_metric = metric.clone();
        }
        if let Some(specs) = &self.variants {
            next.variants = materialize_variants(test.id, specs.clone());
        }
        next.updated_at = Utc::now();
        next
    }
}

// =============================================================================
// PARTICIPANTS AND EVENTS
// =============================================================================

/// A (test, identity) pair bound to one variant for the life of the test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub test_id: TestId,
    pub variant_id: VariantId,
    pub identity: Identity,
    pub assigned_at: DateTime<Utc>,
    pub converted: bool,
    pub conversion_at: Option<DateTime<Utc>>,
    pub conversion_value: Option<f64>,
    pub page_views: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(test_id: TestId, identity: Identity, variant_id: VariantId) -> Self {
        let now = Utc::now();
        Self {
            id: ParticipantId::new(),
            test_id,
            variant_id,
            identity,
            assigned_at: now,
            converted: false,
            conversion_at: None,
            conversion_value: None,
            page_views: 0,
            first_seen_at: now,
            last_seen_at: now,
        }
    }
}

/// Kind of behavioral event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    View,
    Click,
    Conversion,
    /// Caller-named event with no accounting side effects
    Custom(String),
}

impl EventType {
    /// Label for metrics and logs (custom names are collapsed)
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::View => "view",
            EventType::Click => "click",
            EventType::Conversion => "conversion",
            EventType::Custom(_) => "custom",
        }
    }
}

/// An append-only behavioral event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub participant_id: ParticipantId,
    pub variant_id: VariantId,
    pub test_id: TestId,
    pub event_type: EventType,
    pub value: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        test_id: TestId,
        variant_id: VariantId,
        participant_id: ParticipantId,
        event_type: EventType,
        value: Option<f64>,
    ) -> Self {
        Self {
            id: EventId::new(),
            participant_id,
            variant_id,
            test_id,
            event_type,
            value,
            created_at: Utc::now(),
        }
    }
}
