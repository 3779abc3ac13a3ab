//! Per-cell accumulators and interval statistics

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Confidence level bounds accepted by the z-score approximation
const MIN_LEVEL: f64 = 0.0001;
const MAX_LEVEL: f64 = 0.9999;

// Acklam's rational approximation coefficients
const A: [f64; 6] = [
    -3.969683028665376e+01,
    2.209460984245205e+02,
    -2.759285104469687e+02,
    1.383577518672690e+02,
    -3.066479806614716e+01,
    2.506628277459239e+00,
];
const B: [f64; 5] = [
    -5.447609879822406e+01,
    1.615858368580409e+02,
    -1.556989798598866e+02,
    6.680131188771972e+01,
    -1.328068155288572e+01,
];
const C: [f64; 6] = [
    -7.784894002430293e-03,
    -3.223964580411365e-01,
    -2.400758277161838e+00,
    -2.549732539343734e+00,
    4.374664141464968e+00,
    2.938163982698783e+00,
];
const D: [f64; 4] = [
    7.784695709041462e-03,
    3.224671290700398e-01,
    2.445134137142996e+00,
    3.754408661907416e+00,
];
const P_LOW: f64 = 0.02425;

/// Running totals for one hex cell
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HexAggregate {
    pub count: u64,
    pub categories: BTreeMap<String, u64>,
    pub risk_value_count: u64,
    pub risk_value_sum: f64,
    pub risk_value_sum_squares: f64,
}

/// Two-sided interval around a cell's mean risk score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub level: f64,
    pub lower: f64,
    pub upper: f64,
}

/// The statistics block of a cell in query output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellStatistics {
    pub mean_risk_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_interval: Option<ConfidenceInterval>,
}

/// A cell as rendered to callers: `{count, categories, statistics}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSummary {
    pub count: u64,
    pub categories: BTreeMap<String, u64>,
    pub statistics: CellStatistics,
}

impl HexAggregate {
    pub fn add(&mut self, category: &str, risk_score: Option<f64>) {
        self.count += 1;
        *self.categories.entry(category.to_string()).or_insert(0) += 1;
        if let Some(risk) = risk_score {
            self.risk_value_count += 1;
            self.risk_value_sum += risk;
            self.risk_value_sum_squares += risk * risk;
        }
    }

    pub fn merge(&mut self, other: HexAggregate) {
        self.count += other.count;
        for (category, count) in other.categories {
            *self.categories.entry(category).or_insert(0) += count;
        }
        self.risk_value_count += other.risk_value_count;
        self.risk_value_sum += other.risk_value_sum;
        self.risk_value_sum_squares += other.risk_value_sum_squares;
    }

    /// `None` when no record in the cell carried a risk score
    pub fn mean_risk_score(&self) -> Option<f64> {
        if self.risk_value_count == 0 {
            return None;
        }
        Some(self.risk_value_sum / self.risk_value_count as f64)
    }

    /// Sample variance of the risk scores, floored at zero
    pub fn variance(&self) -> Option<f64> {
        if self.risk_value_count == 0 {
            return None;
        }
        let n = self.risk_value_count as f64;
        let denominator = (n - 1.0).max(1.0);
        let variance = (self.risk_value_sum_squares - self.risk_value_sum * self.risk_value_sum / n)
            / denominator;
        Some(variance.max(0.0))
    }

    /// Normal-approximation interval of the mean at `level`, clamped to `[0, 1]`
    pub fn confidence_interval(&self, level: f64) -> Option<ConfidenceInterval> {
        let mean = self.mean_risk_score()?;
        let level = level.clamp(MIN_LEVEL, MAX_LEVEL);

        if self.risk_value_count == 1 {
            return Some(ConfidenceInterval {
                level,
                lower: mean,
                upper: mean,
            });
        }

        let n = self.risk_value_count as f64;
        let standard_error = (self.variance()? / n).sqrt();
        let margin = z_score(level) * standard_error;

        Some(ConfidenceInterval {
            level,
            lower: (mean - margin).clamp(0.0, 1.0),
            upper: (mean + margin).clamp(0.0, 1.0),
        })
    }

    pub fn summarize(&self, confidence_level: Option<f64>) -> CellSummary {
        CellSummary {
            count: self.count,
            categories: self.categories.clone(),
            statistics: CellStatistics {
                mean_risk_score: self.mean_risk_score(),
                confidence_interval: confidence_level
                    .and_then(|level| self.confidence_interval(level)),
            },
        }
    }
}

/// Two-sided critical value for a confidence level
pub fn z_score(level: f64) -> f64 {
    let level = level.clamp(MIN_LEVEL, MAX_LEVEL);
    inverse_normal_cdf(1.0 - (1.0 - level) / 2.0)
}

/// Inverse of the standard normal CDF for `p` in `(0, 1)`
///
/// Acklam's approximation, relative error below 1.15e-9.
pub fn inverse_normal_cdf(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        lower_tail(q)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -lower_tail(q)
    }
}

fn lower_tail(q: f64) -> f64 {
    (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
        / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
}
