use super::error::DriftError;

const MIN_EVENTS: usize = 2;

/// A linear gain drift correction of a value against an indicator.
///
/// `corrected = value * (1 + slope * (indicator - pivot))`, with the pivot at the median of
/// the indicator used while learning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftCorrection {
    pub pivot: f64,
    pub slope: f64,
}

impl DriftCorrection {
    /// Learn the correction that removes the linear dependence of `values` on `indicator`
    pub fn learn(indicator: &[f64], values: &[f64]) -> Result<Self, DriftError> {
        if indicator.len() != values.len() {
            return Err(DriftError::LengthMismatch(values.len(), indicator.len()));
        }
        if values.len() < MIN_EVENTS {
            return Err(DriftError::TooFewEvents(MIN_EVENTS, values.len()));
        }
        if indicator.iter().chain(values.iter()).any(|v| !v.is_finite()) {
            return Err(DriftError::NonFinite);
        }

        let pivot = median(indicator);
        let n = values.len() as f64;
        let mean_value = values.iter().sum::<f64>() / n;
        if mean_value <= 0.0 {
            return Err(DriftError::NonPositiveMean(mean_value));
        }
        let mean_offset = indicator.iter().map(|i| i - pivot).sum::<f64>() / n;

        let mut covariance = 0.0;
        let mut variance = 0.0;
        for (i, v) in indicator.iter().zip(values) {
            let d = i - pivot - mean_offset;
            covariance += d * (v - mean_value);
            variance += d * d;
        }
        // A constant indicator carries no drift information
        let slope = if variance > 0.0 {
            -(covariance / variance) / mean_value
        } else {
            0.0
        };
        Ok(Self { pivot, slope })
    }

    pub fn apply_one(&self, indicator: f64, value: f64) -> f64 {
        value * (1.0 + self.slope * (indicator - self.pivot))
    }

    pub fn apply(&self, indicator: &[f64], values: &[f64]) -> Result<Vec<f64>, DriftError> {
        if indicator.len() != values.len() {
            return Err(DriftError::LengthMismatch(values.len(), indicator.len()));
        }
        Ok(indicator
            .iter()
            .zip(values)
            .map(|(i, v)| self.apply_one(*i, *v))
            .collect())
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    }
}
