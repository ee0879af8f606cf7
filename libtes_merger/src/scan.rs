use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::error::ScanError;
use super::merger::MergedEvents;

/// A binning axis as written in configuration files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisSpec {
    Uniform { min: f64, max: f64, bins: usize },
    Edges { edges: Vec<f64> },
}

impl AxisSpec {
    pub fn to_axis(&self) -> Result<BinAxis, ScanError> {
        match self {
            Self::Uniform { min, max, bins } => BinAxis::uniform(*min, *max, *bins),
            Self::Edges { edges } => BinAxis::from_edges(edges.clone()),
        }
    }
}

/// Bin edges of a histogram axis.
///
/// Bins are half-open `[e_i, e_i+1)` except the last, which also holds its upper edge.
#[derive(Debug, Clone, PartialEq)]
pub struct BinAxis {
    edges: Vec<f64>,
}

impl BinAxis {
    pub fn uniform(min: f64, max: f64, bins: usize) -> Result<Self, ScanError> {
        if bins == 0 {
            return Err(ScanError::NoBins);
        }
        if !(min.is_finite() && max.is_finite() && min < max) {
            return Err(ScanError::BadRange(min, max));
        }
        let width = (max - min) / bins as f64;
        let mut edges: Vec<f64> = (0..bins).map(|i| min + width * i as f64).collect();
        edges.push(max);
        Ok(Self { edges })
    }

    pub fn from_edges(edges: Vec<f64>) -> Result<Self, ScanError> {
        if edges.len() < 2 {
            return Err(ScanError::NoBins);
        }
        if edges.iter().any(|e| !e.is_finite()) || edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ScanError::BadEdges);
        }
        Ok(Self { edges })
    }

    /// Number of bins
    pub fn len(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn min(&self) -> f64 {
        self.edges[0]
    }

    pub fn max(&self) -> f64 {
        self.edges[self.edges.len() - 1]
    }

    pub fn centers(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }

    /// The bin holding `value`, if any
    pub fn bin_of(&self, value: f64) -> Option<usize> {
        if !(value >= self.min() && value <= self.max()) {
            return None;
        }
        let upper = self.edges.partition_point(|e| *e <= value);
        Some(upper.saturating_sub(1).min(self.len() - 1))
    }
}

/// The beamline's record of the scanned variable, sampled over time
#[derive(Debug, Clone, PartialEq)]
pub struct ScanLog {
    variable: String,
    times: Vec<f64>,
    values: Vec<f64>,
    normalization: Option<(String, Vec<f64>)>,
}

impl ScanLog {
    /// Times are seconds since the unix epoch and must be non-decreasing. The optional
    /// normalization signal is given as (name, values) sampled at the same times.
    pub fn new(
        variable: &str,
        times: Vec<f64>,
        values: Vec<f64>,
        normalization: Option<(String, Vec<f64>)>,
    ) -> Result<Self, ScanError> {
        let n_norm = normalization
            .as_ref()
            .map_or(times.len(), |(_, norm)| norm.len());
        if times.len() != values.len() || n_norm != times.len() {
            return Err(ScanError::LengthMismatch(times.len(), values.len(), n_norm));
        }
        for (idx, t) in times.iter().enumerate() {
            let norm_finite = normalization
                .as_ref()
                .map_or(true, |(_, norm)| norm[idx].is_finite());
            if !t.is_finite() || !values[idx].is_finite() || !norm_finite {
                return Err(ScanError::NonFinite(idx));
            }
            if idx > 0 && *t < times[idx - 1] {
                return Err(ScanError::UnsortedLog(idx));
            }
        }
        Ok(Self {
            variable: variable.to_string(),
            times,
            values,
            normalization,
        })
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn normalization_name(&self) -> Option<&str> {
        self.normalization.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn normalization(&self) -> Option<&[f64]> {
        self.normalization.as_ref().map(|(_, norm)| norm.as_slice())
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// The scan value in effect at time `t`: the value of the last sample at or before `t`.
    /// None before the first sample.
    pub fn value_at(&self, t: f64) -> Option<f64> {
        let after = self.times.partition_point(|sample| *sample <= t);
        after.checked_sub(1).map(|idx| self.values[idx])
    }
}

/// Total fluorescence yield against the scan variable
#[derive(Debug, Clone, PartialEq)]
pub struct Scan1D {
    pub scan_axis: Vec<f64>,
    pub intensity: Vec<f64>,
    pub normalization: Vec<f64>,
    pub counts: Vec<u64>,
}

/// RIXS map: event counts by scan bin and emission energy bin
#[derive(Debug, Clone, PartialEq)]
pub struct Scan2D {
    pub scan_axis: Vec<f64>,
    pub emission_axis: Vec<f64>,
    pub counts: Array2<u64>,
}

/// Bin the merged events into a 1D scan.
///
/// Counts only events with an energy inside `emission_axis`. The intensity of a bin is its
/// count divided by the mean normalization of the log samples taken in that bin, or zero
/// where there is no normalization. Without a normalization signal the intensity is the
/// count.
pub fn build_1d_scan(
    events: &MergedEvents,
    scan_log: &ScanLog,
    scan_axis: &BinAxis,
    emission_axis: &BinAxis,
) -> Scan1D {
    let mut counts = vec![0_u64; scan_axis.len()];
    for (t, energy) in events.timestamps.iter().zip(events.energies.iter()) {
        if emission_axis.bin_of(*energy).is_none() {
            continue;
        }
        if let Some(bin) = scan_log.value_at(*t).and_then(|v| scan_axis.bin_of(v)) {
            counts[bin] += 1;
        }
    }

    let normalization: Vec<f64> = match scan_log.normalization() {
        Some(norm) => {
            let mut sums = vec![0.0; scan_axis.len()];
            let mut samples = vec![0_usize; scan_axis.len()];
            for (value, n) in scan_log.values().iter().zip(norm) {
                if let Some(bin) = scan_axis.bin_of(*value) {
                    sums[bin] += n;
                    samples[bin] += 1;
                }
            }
            sums.iter()
                .zip(samples.iter())
                .map(|(s, k)| if *k > 0 { s / *k as f64 } else { 0.0 })
                .collect()
        }
        None => vec![1.0; scan_axis.len()],
    };

    let intensity = counts
        .iter()
        .zip(normalization.iter())
        .map(|(c, n)| if *n > 0.0 { *c as f64 / n } else { 0.0 })
        .collect();

    Scan1D {
        scan_axis: scan_axis.centers(),
        intensity,
        normalization,
        counts,
    }
}

/// Bin the merged events into a 2D RIXS map
pub fn build_2d_scan(
    events: &MergedEvents,
    scan_log: &ScanLog,
    scan_axis: &BinAxis,
    emission_axis: &BinAxis,
) -> Scan2D {
    let mut counts = Array2::<u64>::zeros((scan_axis.len(), emission_axis.len()));
    for (t, energy) in events.timestamps.iter().zip(events.energies.iter()) {
        let Some(emission_bin) = emission_axis.bin_of(*energy) else {
            continue;
        };
        if let Some(scan_bin) = scan_log.value_at(*t).and_then(|v| scan_axis.bin_of(v)) {
            counts[[scan_bin, emission_bin]] += 1;
        }
    }
    Scan2D {
        scan_axis: scan_axis.centers(),
        emission_axis: emission_axis.centers(),
        counts,
    }
}
