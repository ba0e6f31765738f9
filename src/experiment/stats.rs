//! Numerical helpers for proportion tests
//!
//! Closed-form approximations only, so every analysis is a bounded
//! computation: no iteration that depends on the data.

/// Error function (Abramowitz & Stegun 7.1.26, |error| < 1.5e-7)
pub fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

/// Standard normal CDF
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Inverse standard normal CDF (Acklam's rational approximation)
pub fn inverse_normal_cdf(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let a = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    let b = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    let c = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    let d = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];

    let p_low = 0.02425;
    let p_high = 1.0 - p_low;

    if p < p_low {
        let q = (-2.0 * p.ln()).sqrt();
        (((((c[0] * q + c[1]) * q + c[2]) * q + c[3]) * q + c[4]) * q + c[5])
            / ((((d[0] * q + d[1]) * q + d[2]) * q + d[3]) * q + 1.0)
    } else if p <= p_high {
        let q = p - 0.5;
        let r = q * q;
        (((((a[0] * r + a[1]) * r + a[2]) * r + a[3]) * r + a[4]) * r + a[5]) * q
            / (((((b[0] * r + b[1]) * r + b[2]) * r + b[3]) * r + b[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((c[0] * q + c[1]) * q + c[2]) * q + c[3]) * q + c[4]) * q + c[5])
            / ((((d[0] * q + d[1]) * q + d[2]) * q + d[3]) * q + 1.0)
    }
}

/// Two-sided critical value z_(1 - alpha/2)
pub fn two_sided_critical(alpha: f64) -> f64 {
    inverse_normal_cdf(1.0 - alpha / 2.0)
}

/// Upper-tail probability of a chi-square statistic
///
/// Wilson-Hilferty cube-root normal approximation; accurate to a few
/// thousandths for df >= 1 in the tail region the SRM check cares about.
pub fn chi_square_sf(statistic: f64, df: u32) -> f64 {
    if statistic <= 0.0 || df == 0 {
        return 1.0;
    }
    let k = df as f64;
    let term = 2.0 / (9.0 * k);
    let z = ((statistic / k).powf(1.0 / 3.0) - (1.0 - term)) / term.sqrt();
    (1.0 - normal_cdf(z)).clamp(0.0, 1.0)
}

/// Successes out of trials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proportion {
    pub successes: u64,
    pub trials: u64,
}

impl Proportion {
    pub fn new(successes: u64, trials: u64) -> Self {
        Self { successes, trials }
    }

    pub fn rate(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.successes as f64 / self.trials as f64
        }
    }
}

/// Outcome of a pooled two-proportion z-test
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZTest {
    /// (p2 - p1) / se; positive when the variant converts better
    pub z: f64,
    /// Two-tailed p-value
    pub p_value: f64,
    pub standard_error: f64,
    /// True when the pooled variance is zero (or a sample is empty)
    pub no_variance: bool,
}

impl ZTest {
    fn degenerate() -> Self {
        Self {
            z: 0.0,
            p_value: 1.0,
            standard_error: 0.0,
            no_variance: true,
        }
    }
}

/// Pooled two-proportion z-test of `variant` against `control`
pub fn two_proportion_z_test(control: Proportion, variant: Proportion) -> ZTest {
    if control.trials == 0 || variant.trials == 0 {
        return ZTest::degenerate();
    }

    let n1 = control.trials as f64;
    let n2 = variant.trials as f64;
    let p1 = control.rate();
    let p2 = variant.rate();

    let pooled = (control.successes + variant.successes) as f64 / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if !(se > 0.0) {
        return ZTest::degenerate();
    }

    let z = (p2 - p1) / se;
    let p_value = (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0);

    ZTest {
        z,
        p_value,
        standard_error: se,
        no_variance: false,
    }
}

/// Cohen's h effect size: 2 * (asin(sqrt(p2)) - asin(sqrt(p1)))
pub fn cohens_h(p1: f64, p2: f64) -> f64 {
    2.0 * (p2.clamp(0.0, 1.0).sqrt().asin() - p1.clamp(0.0, 1.0).sqrt().asin())
}

/// Unpooled (Wald) confidence interval for p2 - p1
pub fn difference_interval(control: Proportion, variant: Proportion, alpha: f64) -> (f64, f64) {
    if control.trials == 0 || variant.trials == 0 {
        return (0.0, 0.0);
    }
    let p1 = control.rate();
    let p2 = variant.rate();
    let diff = p2 - p1;
    let se = (p1 * (1.0 - p1) / control.trials as f64 + p2 * (1.0 - p2) / variant.trials as f64)
        .sqrt();
    let margin = two_sided_critical(alpha) * se;
    (diff - margin, diff + margin)
}

/// Approximate power of a two-sided test to detect effect `h` at these sizes
pub fn power(h: f64, n1: u64, n2: u64, alpha: f64) -> f64 {
    if n1 == 0 || n2 == 0 || h == 0.0 {
        return 0.0;
    }
    let n1 = n1 as f64;
    let n2 = n2 as f64;
    let n_eff = (n1 * n2 / (n1 + n2)).sqrt();
    normal_cdf(h.abs() * n_eff - two_sided_critical(alpha)).clamp(0.0, 1.0)
}

/// Participants per arm needed to detect effect `h` with `target_power`
pub fn required_sample_size(h: f64, alpha: f64, target_power: f64) -> Option<u64> {
    if !h.is_finite() || h.abs() < 1e-6 {
        return None;
    }
    let z_alpha = two_sided_critical(alpha);
    let z_beta = inverse_normal_cdf(target_power);
    let n = 2.0 * ((z_alpha + z_beta) / h).powi(2);
    Some(n.ceil() as u64)
}
