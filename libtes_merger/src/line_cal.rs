use super::error::LineCalibrationError;

const HISTOGRAM_BINS: usize = 2000;
const SMOOTHING_HALF_WIDTH: usize = 2;
const MIN_PEAK_SEPARATION: usize = 8; // bins
const PEAK_WINDOW_HALF_WIDTH: usize = 3; // bins
const MIN_PEAK_COUNTS: f64 = 5.0; // smoothed counts per bin
const MIN_EVENTS_PER_LINE: usize = 20;

/// Reference energies (eV) of the emission lines used for calibration
const KNOWN_LINES: &[(&str, f64)] = &[
    ("CKAlpha", 277.0),
    ("NKAlpha", 392.4),
    ("TiLAlpha", 452.2),
    ("VLAlpha", 511.3),
    ("OKAlpha", 524.9),
    ("CrLAlpha", 572.8),
    ("MnLAlpha", 637.4),
    ("FKAlpha", 676.8),
    ("FeLAlpha", 705.0),
    ("CoLAlpha", 776.2),
    ("NeKAlpha", 848.6),
    ("NiLAlpha", 851.5),
    ("CuLAlpha", 929.7),
    ("ZnLAlpha", 1011.7),
    ("NaKAlpha", 1041.0),
    ("MgKAlpha", 1253.6),
    ("AlKAlpha", 1486.7),
    ("SiKAlpha", 1740.0),
    ("MnKAlpha", 5898.8),
    ("FeKAlpha", 6403.8),
    ("CoKAlpha", 6930.3),
    ("NiKAlpha", 7478.2),
    ("CuKAlpha", 8047.8),
];

/// A named spectral line with a known energy
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralLine {
    pub name: String,
    pub energy: f64,
}

impl SpectralLine {
    /// Look up a line by name. A name that parses as a positive number is taken as an
    /// energy in eV.
    pub fn resolve(name: &str) -> Result<Self, LineCalibrationError> {
        if let Some((_, energy)) = KNOWN_LINES.iter().find(|(known, _)| *known == name) {
            return Ok(Self {
                name: name.to_string(),
                energy: *energy,
            });
        }
        match name.parse::<f64>() {
            Ok(energy) if energy.is_finite() && energy > 0.0 => Ok(Self {
                name: name.to_string(),
                energy,
            }),
            _ => Err(LineCalibrationError::UnknownLine(name.to_string())),
        }
    }
}

/// Resolve a list of line names, sorted by increasing energy
pub fn resolve_lines(names: &[String]) -> Result<Vec<SpectralLine>, LineCalibrationError> {
    if names.is_empty() {
        return Err(LineCalibrationError::NoLines);
    }
    let mut lines = names
        .iter()
        .map(|n| SpectralLine::resolve(n))
        .collect::<Result<Vec<_>, _>>()?;
    lines.sort_by(|a, b| a.energy.total_cmp(&b.energy));
    for pair in lines.windows(2) {
        if pair[0].energy == pair[1].energy {
            return Err(LineCalibrationError::DuplicateEnergy(
                pair[0].name.clone(),
                pair[1].name.clone(),
            ));
        }
    }
    Ok(lines)
}

/// Mapping from a corrected filtered value to energy.
///
/// Piecewise linear through the origin and one (peak position, line energy) point per
/// calibration line. Values past the last point follow the last segment.
#[derive(Debug, Clone, PartialEq)]
pub struct LineCalibration {
    points: Vec<(f64, f64)>,
}

impl LineCalibration {
    /// Find one peak per line in `values` and match peaks to lines in order of energy
    pub fn fit(values: &[f64], lines: &[SpectralLine]) -> Result<Self, LineCalibrationError> {
        if lines.is_empty() {
            return Err(LineCalibrationError::NoLines);
        }
        let positive: Vec<f64> = values
            .iter()
            .copied()
            .filter(|v| v.is_finite() && *v > 0.0)
            .collect();
        let min_events = MIN_EVENTS_PER_LINE * lines.len();
        if positive.len() < min_events {
            return Err(LineCalibrationError::TooFewEvents(
                min_events,
                positive.len(),
            ));
        }

        let max_value = positive.iter().copied().fold(f64::MIN, f64::max);
        let bin_width = max_value / HISTOGRAM_BINS as f64;
        let bin_of = |v: f64| ((v / bin_width) as usize).min(HISTOGRAM_BINS - 1);

        let mut counts = vec![0_u64; HISTOGRAM_BINS];
        for v in positive.iter() {
            counts[bin_of(*v)] += 1;
        }
        let smoothed = smooth(&counts);
        let peak_bins = find_peaks(&smoothed, lines.len());
        if peak_bins.len() < lines.len() {
            return Err(LineCalibrationError::NotEnoughPeaks(
                peak_bins.len(),
                lines.len(),
            ));
        }

        // Refine each peak with the mean of the values around it
        let mut sums = vec![0.0; peak_bins.len()];
        let mut totals = vec![0_usize; peak_bins.len()];
        for v in positive.iter() {
            let bin = bin_of(*v);
            for (idx, peak) in peak_bins.iter().enumerate() {
                if bin.abs_diff(*peak) <= PEAK_WINDOW_HALF_WIDTH {
                    sums[idx] += v;
                    totals[idx] += 1;
                }
            }
        }
        let positions: Vec<f64> = sums
            .iter()
            .zip(totals.iter())
            .map(|(s, t)| s / *t as f64)
            .collect();

        let points: Vec<(f64, f64)> = positions
            .into_iter()
            .zip(lines.iter().map(|l| l.energy))
            .collect();
        Ok(Self { points })
    }

    /// The (peak position, energy) pairs of the calibration
    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn energy(&self, value: f64) -> f64 {
        let mut prev = (0.0, 0.0);
        for point in self.points.iter() {
            if value <= point.0 {
                return interpolate(prev, *point, value);
            }
            prev = *point;
        }
        let n = self.points.len();
        let start = if n >= 2 { self.points[n - 2] } else { (0.0, 0.0) };
        interpolate(start, self.points[n - 1], value)
    }

    pub fn energies(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|v| self.energy(*v)).collect()
    }
}

fn interpolate(a: (f64, f64), b: (f64, f64), x: f64) -> f64 {
    a.1 + (x - a.0) * (b.1 - a.1) / (b.0 - a.0)
}

/// Moving average over 2 * SMOOTHING_HALF_WIDTH + 1 bins
fn smooth(counts: &[u64]) -> Vec<f64> {
    let width = (2 * SMOOTHING_HALF_WIDTH + 1) as f64;
    (0..counts.len())
        .map(|i| {
            let lo = i.saturating_sub(SMOOTHING_HALF_WIDTH);
            let hi = (i + SMOOTHING_HALF_WIDTH + 1).min(counts.len());
            counts[lo..hi].iter().sum::<u64>() as f64 / width
        })
        .collect()
}

/// The `n` tallest well separated local maxima, returned in increasing bin order
fn find_peaks(smoothed: &[f64], n: usize) -> Vec<usize> {
    let mut candidates: Vec<usize> = (0..smoothed.len())
        .filter(|&i| {
            let left = if i == 0 { 0.0 } else { smoothed[i - 1] };
            let right = smoothed.get(i + 1).copied().unwrap_or(0.0);
            smoothed[i] >= MIN_PEAK_COUNTS && smoothed[i] > left && smoothed[i] >= right
        })
        .collect();
    candidates.sort_by(|a, b| smoothed[*b].total_cmp(&smoothed[*a]).then(a.cmp(b)));

    let mut peaks: Vec<usize> = Vec::with_capacity(n);
    for candidate in candidates {
        if peaks.len() == n {
            break;
        }
        if peaks
            .iter()
            .all(|p| p.abs_diff(candidate) >= MIN_PEAK_SEPARATION)
        {
            peaks.push(candidate);
        }
    }
    peaks.sort_unstable();
    peaks
}
