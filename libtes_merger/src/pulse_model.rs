use fxhash::FxHashMap;
use ndarray::{Array2, ArrayView1};
use std::path::Path;

use super::error::PulseModelError;

const CHANNEL_GROUP_PREFIX: &str = "chan";
const FILTER_NAME: &str = "filter_5lag";
const N_LAGS: usize = 5;

/// The 5-lag optimal filter for one channel, expressed in the channel's projection basis.
///
/// Row `k` of the filter evaluates the filter at lag `k - 2`. The five lagged outputs of an
/// event are fit with a parabola whose peak gives the filtered value.
#[derive(Debug, Clone, PartialEq)]
pub struct FiveLagFilter {
    filter: Array2<f64>,
}

impl FiveLagFilter {
    pub fn new(filter: Array2<f64>) -> Result<Self, PulseModelError> {
        if filter.nrows() != N_LAGS || filter.ncols() == 0 {
            return Err(PulseModelError::BadFilterShape(filter.shape().to_vec()));
        }
        Ok(Self { filter })
    }

    pub fn n_basis(&self) -> usize {
        self.filter.ncols()
    }

    /// Apply the filter to per-event projection coefficients, shape `[n_events, n_basis]`,
    /// giving the 5-lag filtered value of each event.
    pub fn apply(&self, projections: &Array2<f64>) -> Result<Vec<f64>, PulseModelError> {
        if projections.ncols() != self.n_basis() {
            return Err(PulseModelError::BasisMismatch(
                self.n_basis(),
                projections.ncols(),
            ));
        }
        let lags = projections.dot(&self.filter.t());
        Ok(lags.rows().into_iter().map(parabola_peak).collect())
    }
}

/// Least-squares parabola through the five lag values at x = -2..=2.
///
/// Returns the peak value. If the parabola has no maximum the centre value is used.
fn parabola_peak(lags: ArrayView1<f64>) -> f64 {
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_x2y = 0.0;
    for (idx, y) in lags.iter().enumerate() {
        let x = idx as f64 - 2.0;
        sum_y += y;
        sum_xy += x * y;
        sum_x2y += x * x * y;
    }
    // Normal equations for x = -2..=2: sum x^2 = 10, sum x^4 = 34, odd sums vanish
    let a = (34.0 * sum_y - 10.0 * sum_x2y) / 70.0;
    let b = sum_xy / 10.0;
    let c = (5.0 * sum_x2y - 10.0 * sum_y) / 70.0;
    if c >= 0.0 {
        return lags[2];
    }
    a - b * b / (4.0 * c)
}

/// A precomputed pulse model: one 5-lag filter per channel.
///
/// Stored as HDF5 with a group `chan<N>` per channel holding a `filter_5lag` dataset.
#[derive(Debug, Clone, Default)]
pub struct PulseModel {
    filters: FxHashMap<u32, FiveLagFilter>,
}

impl PulseModel {
    pub fn load(path: &Path) -> Result<Self, PulseModelError> {
        if !path.exists() {
            return Err(PulseModelError::BadFilePath(path.to_path_buf()));
        }
        let file = hdf5::File::open(path)?;
        let mut model = PulseModel::default();
        for name in file.member_names()? {
            let Some(channel) = name
                .strip_prefix(CHANNEL_GROUP_PREFIX)
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let group = file.group(&name)?;
            let filter = group.dataset(FILTER_NAME)?.read_2d::<f64>()?;
            model.insert(channel, FiveLagFilter::new(filter)?);
        }
        spdlog::info!(
            "Loaded pulse model {} with {} channels",
            path.to_string_lossy(),
            model.len()
        );
        Ok(model)
    }

    pub fn insert(&mut self, channel: u32, filter: FiveLagFilter) {
        self.filters.insert(channel, filter);
    }

    pub fn filter(&self, channel: u32) -> Result<&FiveLagFilter, PulseModelError> {
        self.filters
            .get(&channel)
            .ok_or(PulseModelError::MissingChannel(channel))
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
