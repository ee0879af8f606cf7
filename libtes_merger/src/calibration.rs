use fxhash::FxHashMap;
use std::path::Path;

use super::channel::{
    Channel, ChannelGroup, EventSnapshot, FILT_PHASE_NAME, FILT_VALUE_NAME,
    PRETRIGGER_MEAN_NAME, PROJECTIONS_NAME,
};
use super::drift::DriftCorrection;
use super::error::{CalibrationError, ChannelError};
use super::experiment_state::StateSelection;
use super::line_cal::{resolve_lines, LineCalibration, SpectralLine};
use super::pulse_model::{FiveLagFilter, PulseModel};

/// Name of the calibrated energy attribute
pub const ENERGY_ATTR: &str = "energy";

const FIVE_LAG_QUALIFIER: &str = "5Lag";
const PRETRIGGER_CORRECTED_SUFFIX: &str = "DC";
const PHASE_CORRECTED_SUFFIX: &str = "PC";

/// Which filtered value the calibration is built on.
///
/// The attribute names of every derived value follow from this: `filtValue` ->
/// `filtValueDC` -> `filtValueDCPC`, or the same with the `5Lag` qualifier when a pulse
/// model was supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilteredValueKind {
    Base,
    FiveLag,
}

impl FilteredValueKind {
    pub fn uncorrected_name(&self) -> String {
        match self {
            Self::Base => FILT_VALUE_NAME.to_string(),
            Self::FiveLag => format!("{FILT_VALUE_NAME}{FIVE_LAG_QUALIFIER}"),
        }
    }

    /// Name after the pretrigger-mean drift correction
    pub fn dc_name(&self) -> String {
        format!("{}{PRETRIGGER_CORRECTED_SUFFIX}", self.uncorrected_name())
    }

    /// Name after both drift corrections. This is the attribute the energy is calibrated on.
    pub fn dcpc_name(&self) -> String {
        format!("{}{PHASE_CORRECTED_SUFFIX}", self.dc_name())
    }
}

/// Everything needed to turn one channel's raw features into energies
#[derive(Debug, Clone)]
pub struct ChannelCalibration {
    five_lag: Option<FiveLagFilter>,
    pretrigger_correction: DriftCorrection,
    phase_correction: DriftCorrection,
    energy: LineCalibration,
}

impl ChannelCalibration {
    /// Read the events of the selected state, with every dataset the energies depend on
    pub fn read_events(
        &self,
        channel: &Channel,
        selection: &StateSelection,
    ) -> Result<EventSnapshot, ChannelError> {
        channel.get_attr(&required_names(self.five_lag.is_some()), selection)
    }

    /// Doubly corrected filtered values of the events
    pub fn corrected_values(&self, events: &EventSnapshot) -> Result<Vec<f64>, ChannelError> {
        let number = events.channel();
        let drift_err = |e| ChannelError::DriftError(number, e);
        let filt_value = filtered_values(events, self.five_lag.as_ref())?;
        let dc = self
            .pretrigger_correction
            .apply(events.feature(PRETRIGGER_MEAN_NAME)?, &filt_value)
            .map_err(drift_err)?;
        self.phase_correction
            .apply(events.feature(FILT_PHASE_NAME)?, &dc)
            .map_err(drift_err)
    }

    /// Calibrated energies of the events
    pub fn energies(&self, events: &EventSnapshot) -> Result<Vec<f64>, ChannelError> {
        Ok(self.energy.energies(&self.corrected_values(events)?))
    }
}

/// The datasets a calibration reads from each channel
fn required_names(five_lag: bool) -> [&'static str; 3] {
    let filtered = if five_lag {
        PROJECTIONS_NAME
    } else {
        FILT_VALUE_NAME
    };
    [filtered, PRETRIGGER_MEAN_NAME, FILT_PHASE_NAME]
}

/// The filtered value of every event, from the 5-lag filter if one is given
fn filtered_values(
    events: &EventSnapshot,
    five_lag: Option<&FiveLagFilter>,
) -> Result<Vec<f64>, ChannelError> {
    match five_lag {
        Some(filter) => filter
            .apply(events.projections()?)
            .map_err(|e| ChannelError::ModelError(events.channel(), e)),
        None => Ok(events.feature(FILT_VALUE_NAME)?.to_vec()),
    }
}

/// The calibration learned from one calibration run.
///
/// Covers only the channels that calibrated successfully.
#[derive(Debug, Clone)]
pub struct CalibrationState {
    run_uid: String,
    state_label: String,
    kind: FilteredValueKind,
    channels: FxHashMap<u32, ChannelCalibration>,
}

impl CalibrationState {
    /// Identifier of the calibration run this was built from
    pub fn run_uid(&self) -> &str {
        &self.run_uid
    }

    pub fn state_label(&self) -> &str {
        &self.state_label
    }

    pub fn kind(&self) -> FilteredValueKind {
        self.kind
    }

    /// The filtered value attribute the energies are calibrated on
    pub fn fv_attr(&self) -> String {
        self.kind.dcpc_name()
    }

    pub fn energy_attr(&self) -> &'static str {
        ENERGY_ATTR
    }

    /// Sorted numbers of the calibrated channels
    pub fn channel_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self.channels.keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn covers(&self, channel: u32) -> bool {
        self.channels.contains_key(&channel)
    }

    pub fn get(&self, channel: u32) -> Option<&ChannelCalibration> {
        self.channels.get(&channel)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// A channel that was marked bad, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFailure {
    pub channel: u32,
    pub reason: String,
}

/// A new calibration along with the channels that could not be calibrated
#[derive(Debug)]
pub struct CalibrationBuild {
    pub state: CalibrationState,
    pub failures: Vec<ChannelFailure>,
}

/// Build a calibration from the channels of a calibration run.
///
/// Each channel is drift corrected twice (against the pretrigger mean, then against the
/// filter phase) and its corrected values are calibrated against `line_names` on the
/// events of `state_label`. With a `model_path` the 5-lag filtered value is used. A channel
/// that fails any step is marked bad and reported; the build only fails if no channel
/// could be calibrated or a run-level input (lines, state, model) is unusable.
pub fn build_calibration(
    channels: &mut ChannelGroup,
    run_uid: &str,
    state_label: &str,
    line_names: &[String],
    model_path: Option<&Path>,
) -> Result<CalibrationBuild, CalibrationError> {
    let lines = resolve_lines(line_names)?;
    let selection = channels.states().selection(state_label)?;
    let model = match model_path {
        Some(path) => Some(PulseModel::load(path)?),
        None => None,
    };
    let kind = if model.is_some() {
        FilteredValueKind::FiveLag
    } else {
        FilteredValueKind::Base
    };

    let mut calibrations = FxHashMap::default();
    let mut failures = Vec::new();
    for channel in channels.iter_mut() {
        if channel.is_bad() {
            continue;
        }
        match calibrate_channel(channel, &selection, &lines, model.as_ref()) {
            Ok(cal) => {
                calibrations.insert(channel.number(), cal);
            }
            Err(e) => {
                spdlog::warn!("Channel {} failed calibration: {}", channel.number(), e);
                let reason = e.to_string();
                channel.mark_bad(&reason);
                failures.push(ChannelFailure {
                    channel: channel.number(),
                    reason,
                });
            }
        }
    }

    if calibrations.is_empty() {
        return Err(CalibrationError::NoChannelsCalibrated(channels.len()));
    }

    spdlog::info!(
        "Calibrated {} of {} channels on {} using state {}",
        calibrations.len(),
        channels.len(),
        kind.dcpc_name(),
        state_label
    );

    Ok(CalibrationBuild {
        state: CalibrationState {
            run_uid: run_uid.to_string(),
            state_label: state_label.to_string(),
            kind,
            channels: calibrations,
        },
        failures,
    })
}

fn calibrate_channel(
    channel: &Channel,
    selection: &StateSelection,
    lines: &[SpectralLine],
    model: Option<&PulseModel>,
) -> Result<ChannelCalibration, ChannelError> {
    let number = channel.number();
    let drift_err = |e| ChannelError::DriftError(number, e);

    let five_lag = match model {
        Some(m) => Some(
            m.filter(number)
                .map_err(|e| ChannelError::ModelError(number, e))?
                .clone(),
        ),
        None => None,
    };

    let events = channel.get_attr(&required_names(five_lag.is_some()), selection)?;
    let filt_value = filtered_values(&events, five_lag.as_ref())?;
    let pretrigger_mean = events.feature(PRETRIGGER_MEAN_NAME)?;
    let pretrigger_correction =
        DriftCorrection::learn(pretrigger_mean, &filt_value).map_err(drift_err)?;
    let dc = pretrigger_correction
        .apply(pretrigger_mean, &filt_value)
        .map_err(drift_err)?;

    let phase = events.feature(FILT_PHASE_NAME)?;
    let phase_correction = DriftCorrection::learn(phase, &dc).map_err(drift_err)?;
    let dcpc = phase_correction.apply(phase, &dc).map_err(drift_err)?;

    let energy =
        LineCalibration::fit(&dcpc, lines).map_err(|e| ChannelError::CalibrationError(number, e))?;

    Ok(ChannelCalibration {
        five_lag,
        pretrigger_correction,
        phase_correction,
        energy,
    })
}

/// Whether a calibration is available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStatus {
    NoCalibration,
    Calibrated,
}

/// The active calibration together with the channels it was built from
#[derive(Debug)]
pub struct ActiveCalibration {
    pub state: CalibrationState,
    pub channels: ChannelGroup,
}

/// Holds at most one active calibration. Installing a new one replaces the old one whole.
#[derive(Debug, Default)]
pub struct CalibrationStore {
    active: Option<ActiveCalibration>,
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> CalibrationStatus {
        if self.active.is_some() {
            CalibrationStatus::Calibrated
        } else {
            CalibrationStatus::NoCalibration
        }
    }

    /// Install a calibration, returning the one it replaced
    pub fn install(
        &mut self,
        state: CalibrationState,
        channels: ChannelGroup,
    ) -> Option<ActiveCalibration> {
        self.active.replace(ActiveCalibration { state, channels })
    }

    pub fn active(&self) -> Option<&ActiveCalibration> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveCalibration> {
        self.active.as_mut()
    }
}
