//! Statistical analysis of experiment rollups
//!
//! Every treatment is compared pairwise against the control with a pooled
//! two-proportion z-test. The result is an immutable snapshot: callers persist
//! it as-is and never edit it afterwards.
//!
//! An underpowered test is not an error. It yields a result with
//! `analysis_completed = false` and a recommendation to gather more data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stats::{
    chi_square_sf, cohens_h, difference_interval, power, required_sample_size,
    two_proportion_z_test, Proportion,
};
use super::types::{ABTest, AnalysisId, TestId, Variant, VariantId};
use crate::constants::{
    DEFAULT_MIN_SAMPLE_SIZE, DEFAULT_SRM_ALPHA, NEARLY_IDENTICAL_RATE_DELTA,
    STRONG_UPLIFT_PERCENT, TARGET_POWER,
};
use crate::errors::{ExperimentError, Result};

// =============================================================================
// RESULT TYPES
// =============================================================================

/// Why an analysis did or did not run to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Completed,
    /// Some variant is below the minimum sample size and `force` was not set
    InsufficientSample,
    /// Fewer than two variants; nothing to compare
    TooFewVariants,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::InsufficientSample => "insufficient_sample",
            AnalysisStatus::TooFewVariants => "too_few_variants",
        }
    }
}

/// Observed counters for one variant at analysis time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSummary {
    pub variant_id: VariantId,
    pub name: String,
    pub is_control: bool,
    pub traffic_percentage: f64,
    pub participants: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    /// Sum of conversion values (revenue)
    pub total_value: f64,
    /// Average value per converted participant
    pub average_value: f64,
}

/// One treatment measured against the control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantComparison {
    pub variant_id: VariantId,
    pub name: String,
    pub control_rate: f64,
    pub variant_rate: f64,
    pub z_score: f64,
    pub p_value: f64,
    pub is_significant: bool,
    /// Relative change over control, in percent (0 when control rate is 0)
    pub uplift_percentage: f64,
    /// Cohen's h
    pub effect_size: f64,
    /// Interval for the absolute rate difference (variant - control)
    pub confidence_interval_lower: f64,
    pub confidence_interval_upper: f64,
    /// Power to detect the observed effect at the current sample sizes
    pub power: f64,
    /// Participants per variant needed for the target power, if estimable
    pub required_sample_size: Option<u64>,
    /// Pooled variance was zero; reported as not significant
    pub no_variance: bool,
}

/// Sample-ratio-mismatch check
///
/// Chi-square goodness of fit of observed participant counts against the
/// configured traffic split. A detected mismatch points at an assignment or
/// logging bug rather than a real effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrmCheck {
    pub chi_squared: f64,
    pub degrees_of_freedom: u32,
    pub p_value: f64,
    pub detected: bool,
}

/// Immutable, timestamped analysis snapshot for one test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: AnalysisId,
    pub test_id: TestId,
    pub created_at: DateTime<Utc>,
    pub analysis_completed: bool,
    pub status: AnalysisStatus,
    /// Minimum sample size was bypassed
    pub forced: bool,
    pub confidence_level: f64,
    /// Total participants across all variants
    pub sample_size: u64,
    /// Headline comparison: the winner's, else the lowest p-value
    pub p_value: Option<f64>,
    pub z_score: Option<f64>,
    pub is_significant: bool,
    /// Winning variant; the control when nothing beats it significantly
    pub winner_variant_id: Option<VariantId>,
    /// Winner's uplift over control (0 when control wins)
    pub uplift_percentage: f64,
    pub effect_size: Option<f64>,
    pub confidence_interval_lower: Option<f64>,
    pub confidence_interval_upper: Option<f64>,
    pub variants: Vec<VariantSummary>,
    pub comparisons: Vec<VariantComparison>,
    pub srm: Option<SrmCheck>,
    pub recommendations: Vec<String>,
}

impl AnalysisResult {
    fn incomplete(test: &ABTest, status: AnalysisStatus, variants: Vec<VariantSummary>) -> Self {
        Self {
            id: AnalysisId::new(),
            test_id: test.id,
            created_at: Utc::now(),
            analysis_completed: false,
            status,
            forced: false,
            confidence_level: test.confidence_level,
            sample_size: test.total_participants(),
            p_value: None,
            z_score: None,
            is_significant: false,
            winner_variant_id: None,
            uplift_percentage: 0.0,
            effect_size: None,
            confidence_interval_lower: None,
            confidence_interval_upper: None,
            variants,
            comparisons: Vec::new(),
            srm: None,
            recommendations: Vec::new(),
        }
    }

    /// Whether the winner is a treatment rather than the control
    pub fn has_treatment_winner(&self) -> bool {
        match self.winner_variant_id {
            Some(id) => self
                .variants
                .iter()
                .any(|v| v.variant_id == id && !v.is_control),
            None => false,
        }
    }
}

// =============================================================================
// ANALYZER
// =============================================================================

/// Thresholds the analyzer applies
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerSettings {
    /// Participants required in every variant before an unforced analysis runs
    pub min_sample_size: u64,
    /// Significance threshold for the sample-ratio-mismatch check
    pub srm_alpha: f64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            min_sample_size: DEFAULT_MIN_SAMPLE_SIZE,
            srm_alpha: DEFAULT_SRM_ALPHA,
        }
    }
}

/// Statistical analyzer for experiments
#[derive(Debug, Clone, Default)]
pub struct StatisticalAnalyzer {
    settings: AnalyzerSettings,
}

impl StatisticalAnalyzer {
    pub fn new(settings: AnalyzerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    /// Analyze a test whose variant rollups are populated
    ///
    /// Fails only when the test has no control variant. Small samples, zero
    /// variance and empty variants all produce a renderable result.
    pub fn analyze(&self, test: &ABTest, force: bool) -> Result<AnalysisResult> {
        let summaries: Vec<VariantSummary> = test.variants.iter().map(summarize).collect();

        if test.variants.len() < 2 {
            let mut result =
                AnalysisResult::incomplete(test, AnalysisStatus::TooFewVariants, summaries);
            result
                .recommendations
                .push("Add at least one treatment variant: analysis needs two variants to compare".to_string());
            return Ok(result);
        }

        let control = test.control().ok_or_else(|| {
            ExperimentError::Configuration(format!("test {} has no control variant", test.id))
        })?;

        let smallest = test
            .variants
            .iter()
            .filter(|v| v.traffic_percentage > 0.0)
            .map(|v| v.rollup.participants_count)
            .min()
            .unwrap_or(0);
        let below_minimum = smallest < self.settings.min_sample_size;
        let srm = self.check_srm(test);

        if below_minimum && !force {
            let mut result =
                AnalysisResult::incomplete(test, AnalysisStatus::InsufficientSample, summaries);
            result.recommendations.push(format!(
                "Insufficient data: smallest variant has {} participants, need at least {} per variant. Gather more data before drawing conclusions",
                smallest, self.settings.min_sample_size
            ));
            if let Some(check) = &srm {
                push_srm_warning(&mut result.recommendations, check);
            }
            result.srm = srm;
            return Ok(result);
        }

        let alpha = test.alpha();
        let comparisons: Vec<VariantComparison> = test
            .treatments()
            .map(|variant| compare(control, variant, alpha))
            .collect();

        let winner = pick_winner(&comparisons);
        let headline = winner.or_else(|| {
            comparisons
                .iter()
                .min_by(|a, b| a.p_value.total_cmp(&b.p_value))
        });

        let winner_variant_id = Some(winner.map_or(control.id, |w| w.variant_id));
        let uplift_percentage = winner.map_or(0.0, |w| w.uplift_percentage);

        let recommendations = self.recommendations(
            control,
            &comparisons,
            winner,
            srm.as_ref(),
            force && below_minimum,
            smallest,
        );

        Ok(AnalysisResult {
            id: AnalysisId::new(),
            test_id: test.id,
            created_at: Utc::now(),
            analysis_completed: true,
            status: AnalysisStatus::Completed,
            forced: force && below_minimum,
            confidence_level: test.confidence_level,
            sample_size: test.total_participants(),
            p_value: headline.map(|c| c.p_value),
            z_score: headline.map(|c| c.z_score),
            is_significant: headline.is_some_and(|c| c.is_significant),
            winner_variant_id,
            uplift_percentage,
            effect_size: headline.map(|c| c.effect_size),
            confidence_interval_lower: headline.map(|c| c.confidence_interval_lower),
            confidence_interval_upper: headline.map(|c| c.confidence_interval_upper),
            variants: summaries,
            comparisons,
            srm,
            recommendations,
        })
    }

    /// Chi-square goodness of fit of participant counts vs configured split
    ///
    /// Variants configured at 0% are left out. Returns `None` when there is
    /// nothing to test (no participants or fewer than two weighted variants).
    pub fn check_srm(&self, test: &ABTest) -> Option<SrmCheck> {
        let weighted: Vec<&Variant> = test
            .variants
            .iter()
            .filter(|v| v.traffic_percentage > 0.0)
            .collect();
        if weighted.len() < 2 {
            return None;
        }

        let total: u64 = weighted.iter().map(|v| v.rollup.participants_count).sum();
        if total == 0 {
            return None;
        }
        let weight_sum: f64 = weighted.iter().map(|v| v.traffic_percentage).sum();

        let chi_squared: f64 = weighted
            .iter()
            .map(|v| {
                let expected = total as f64 * v.traffic_percentage / weight_sum;
                let observed = v.rollup.participants_count as f64;
                (observed - expected).powi(2) / expected
            })
            .sum();

        let degrees_of_freedom = (weighted.len() - 1) as u32;
        let p_value = chi_square_sf(chi_squared, degrees_of_freedom);

        Some(SrmCheck {
            chi_squared,
            degrees_of_freedom,
            p_value,
            detected: p_value < self.settings.srm_alpha,
        })
    }

    fn recommendations(
        &self,
        control: &Variant,
        comparisons: &[VariantComparison],
        winner: Option<&VariantComparison>,
        srm: Option<&SrmCheck>,
        forced_below_minimum: bool,
        smallest: u64,
    ) -> Vec<String> {
        let mut recommendations = Vec::new();

        if forced_below_minimum {
            recommendations.push(format!(
                "Analysis forced with only {} participants in the smallest variant (minimum {}); treat results as preliminary",
                smallest, self.settings.min_sample_size
            ));
        }

        if let Some(w) = winner {
            recommendations.push(format!(
                "Variant '{}' wins with {:.1}% uplift over control '{}' (p = {:.4})",
                w.name, w.uplift_percentage, control.name, w.p_value
            ));
            recommendations.push(format!("Recommendation: roll out '{}'", w.name));
            if w.uplift_percentage > STRONG_UPLIFT_PERCENT {
                recommendations.push(
                    "Strong effect detected - consider investigating what drove the improvement"
                        .to_string(),
                );
            }
        } else if let Some(loser) = comparisons.iter().find(|c| c.is_significant) {
            recommendations.push(format!(
                "Control '{}' outperforms '{}' - variant converted {:.1}% worse",
                control.name, loser.name, -loser.uplift_percentage
            ));
            recommendations
                .push("Recommendation: keep the control experience".to_string());
        } else {
            recommendations.push("No statistically significant difference detected".to_string());

            if !comparisons.is_empty() && comparisons.iter().all(|c| c.no_variance) {
                recommendations.push(
                    "No variance in conversions across variants; the test cannot tell them apart yet"
                        .to_string(),
                );
            }

            let max_delta = comparisons
                .iter()
                .map(|c| (c.variant_rate - c.control_rate).abs())
                .fold(0.0_f64, f64::max);
            if max_delta < NEARLY_IDENTICAL_RATE_DELTA {
                recommendations.push(
                    "Conversion rates are nearly identical - consider testing more dramatic changes"
                        .to_string(),
                );
            } else if let Some(best) = comparisons
                .iter()
                .filter(|c| !c.no_variance)
                .min_by(|a, b| a.p_value.total_cmp(&b.p_value))
            {
                if best.power < TARGET_POWER {
                    match best.required_sample_size {
                        Some(needed) => recommendations.push(format!(
                            "Current statistical power: {:.1}%. Need ~{} participants per variant for {:.0}% power",
                            best.power * 100.0,
                            needed,
                            TARGET_POWER * 100.0
                        )),
                        None => recommendations.push(format!(
                            "Current statistical power: {:.1}%. Gather more data",
                            best.power * 100.0
                        )),
                    }
                }
            }
        }

        if let Some(check) = srm {
            push_srm_warning(&mut recommendations, check);
        }

        recommendations
    }
}

fn summarize(variant: &Variant) -> VariantSummary {
    VariantSummary {
        variant_id: variant.id,
        name: variant.name.clone(),
        is_control: variant.is_control,
        traffic_percentage: variant.traffic_percentage,
        participants: variant.rollup.participants_count,
        conversions: variant.rollup.conversions_count,
        conversion_rate: variant.rollup.conversion_rate(),
        total_value: variant.rollup.total_value,
        average_value: variant.rollup.average_value(),
    }
}

fn compare(control: &Variant, variant: &Variant, alpha: f64) -> VariantComparison {
    let c = Proportion::new(
        control.rollup.conversions_count,
        control.rollup.participants_count,
    );
    let v = Proportion::new(
        variant.rollup.conversions_count,
        variant.rollup.participants_count,
    );

    let test = two_proportion_z_test(c, v);
    let (p1, p2) = (c.rate(), v.rate());
    let effect_size = cohens_h(p1, p2);
    let (lower, upper) = difference_interval(c, v, alpha);

    let uplift_percentage = if p1 > 0.0 {
        (p2 - p1) / p1 * 100.0
    } else {
        0.0
    };

    VariantComparison {
        variant_id: variant.id,
        name: variant.name.clone(),
        control_rate: p1,
        variant_rate: p2,
        z_score: test.z,
        p_value: test.p_value,
        is_significant: !test.no_variance && test.p_value < alpha,
        uplift_percentage,
        effect_size,
        confidence_interval_lower: lower,
        confidence_interval_upper: upper,
        power: power(effect_size, c.trials, v.trials, alpha),
        required_sample_size: required_sample_size(effect_size, alpha, TARGET_POWER),
        no_variance: test.no_variance,
    }
}

/// Significant treatment that beats control with the lowest p-value
///
/// Ties go to the larger uplift. A significant loss never wins.
fn pick_winner(comparisons: &[VariantComparison]) -> Option<&VariantComparison> {
    comparisons
        .iter()
        .filter(|c| c.is_significant && c.variant_rate > c.control_rate)
        .min_by(|a, b| {
            a.p_value
                .total_cmp(&b.p_value)
                .then_with(|| b.uplift_percentage.total_cmp(&a.uplift_percentage))
        })
}

fn push_srm_warning(recommendations: &mut Vec<String>, check: &SrmCheck) {
    if check.detected {
        recommendations.push(format!(
            "Warning: sample ratio mismatch detected (chi-square {:.2}, p = {:.5}) - check assignment and logging before trusting results",
            check.chi_squared, check.p_value
        ));
    }
}
