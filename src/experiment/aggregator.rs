//! Cross-test summary statistics for dashboards

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::analyzer::AnalysisResult;
use super::types::{ABTest, TestId, TestStatus};
use crate::errors::{ExperimentError, Result};

/// One row per test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSummaryRow {
    pub test_id: TestId,
    pub name: String,
    pub status: TestStatus,
    pub participants: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    pub total_value: f64,
    /// Latest snapshot named a treatment as the winner
    pub has_winner: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub total_tests: usize,
    /// Keyed by lowercase status name
    pub tests_by_status: BTreeMap<String, usize>,
    pub total_participants: u64,
    pub total_conversions: u64,
    pub overall_conversion_rate: f64,
    pub total_value: f64,
    pub tests_with_winner: usize,
    pub tests: Vec<TestSummaryRow>,
}

impl ExperimentSummary {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ExperimentError::Serialization(format!("summary: {e}")))
    }
}

/// Fold tests (with rollups populated) and their latest snapshots into a summary
pub fn summarize<'a>(
    tests: &[ABTest],
    latest: impl Fn(&TestId) -> Option<&'a AnalysisResult>,
) -> ExperimentSummary {
    let mut tests_by_status: BTreeMap<String, usize> = TestStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();

    let rows: Vec<TestSummaryRow> = tests
        .iter()
        .map(|test| {
            *tests_by_status
                .entry(test.status.as_str().to_string())
                .or_insert(0) += 1;

            let participants = test.total_participants();
            let conversions = test.total_conversions();
            TestSummaryRow {
                test_id: test.id,
                name: test.name.clone(),
                status: test.status,
                participants,
                conversions,
                conversion_rate: rate(conversions, participants),
                total_value: test.total_value(),
                has_winner: latest(&test.id).is_some_and(|a| a.has_treatment_winner()),
            }
        })
        .collect();

    let total_participants: u64 = rows.iter().map(|r| r.participants).sum();
    let total_conversions: u64 = rows.iter().map(|r| r.conversions).sum();

    ExperimentSummary {
        total_tests: rows.len(),
        tests_by_status,
        total_participants,
        total_conversions,
        overall_conversion_rate: rate(total_conversions, total_participants),
        total_value: rows.iter().map(|r| r.total_value).sum(),
        tests_with_winner: rows.iter().filter(|r| r.has_winner).count(),
        tests: rows,
    }
}

fn rate(conversions: u64, participants: u64) -> f64 {
    if participants == 0 {
        0.0
    } else {
        conversions as f64 / participants as f64
    }
}
