//! Fixtures shared by the unit tests
use fxhash::FxHashMap;
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::catalog::{RunCatalog, RunHandle};
use crate::channel::{
    Channel, ChannelGroup, ChannelSource, FILT_PHASE_NAME, FILT_VALUE_NAME, PRETRIGGER_MEAN_NAME,
    PROJECTIONS_NAME, UNIXNANO_NAME,
};
use crate::error::{CatalogError, ChannelError};
use crate::experiment_state::ExperimentStates;
use crate::scan::ScanLog;

pub const BASE_NS: u64 = 1_715_170_000_000_000_000;
pub const SECOND_NS: u64 = 1_000_000_000;
pub const CAL_STATE: &str = "CAL0";
pub const SCAN_STATE: &str = "SCAN1";
pub const END_STATE: &str = "END";

pub const N_CAL_EVENTS: usize = 1320;
pub const N_SCAN_EVENTS: usize = 600;
const CAL_SPACING_NS: u64 = 50_000_000;
const SCAN_SPACING_NS: u64 = 100_000_000;
/// The scan state runs from BASE + 100 s to BASE + 200 s
pub const SCAN_START_NS: u64 = BASE_NS + 100 * SECOND_NS;
const END_NS: u64 = BASE_NS + 200 * SECOND_NS;

pub fn standard_states() -> ExperimentStates {
    let mut states = ExperimentStates::default();
    states.push(BASE_NS, CAL_STATE).unwrap();
    states.push(SCAN_START_NS, SCAN_STATE).unwrap();
    states.push(END_NS, END_STATE).unwrap();
    states
}

pub fn line_names() -> Vec<String> {
    vec!["CKAlpha".to_string(), "OKAlpha".to_string()]
}

/// Seconds since the unix epoch of a time inside the scan state
pub fn scan_time_s(offset_s: f64) -> f64 {
    SCAN_START_NS as f64 * 1e-9 + offset_s
}

/// An in-memory channel source
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    channel: u32,
    timestamps: Vec<u64>,
    features: BTreeMap<String, Vec<f64>>,
    projections: Option<Array2<f64>>,
    broken: Option<Arc<AtomicBool>>,
}

impl MemoryChannel {
    pub fn new(channel: u32) -> Self {
        Self {
            channel,
            ..Default::default()
        }
    }

    pub fn with_timestamps(mut self, timestamps: Vec<u64>) -> Self {
        self.timestamps = timestamps;
        self
    }

    pub fn with_feature(mut self, name: &str, values: Vec<f64>) -> Self {
        self.features.insert(name.to_string(), values);
        self
    }

    pub fn with_projections(mut self, projections: Array2<f64>) -> Self {
        self.projections = Some(projections);
        self
    }

    /// Every read fails
    pub fn failing(self) -> Self {
        self.with_switch(Arc::new(AtomicBool::new(true)))
    }

    /// Every read fails once the switch is set
    pub fn with_switch(mut self, switch: Arc<AtomicBool>) -> Self {
        self.broken = Some(switch);
        self
    }

    fn check(&self, name: &str) -> Result<(), ChannelError> {
        match &self.broken {
            Some(switch) if switch.load(Ordering::SeqCst) => Err(ChannelError::MissingFeature(
                self.channel,
                name.to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl ChannelSource for MemoryChannel {
    fn channel_number(&self) -> u32 {
        self.channel
    }

    fn timestamps(&self) -> Result<Vec<u64>, ChannelError> {
        self.check(UNIXNANO_NAME)?;
        Ok(self.timestamps.clone())
    }

    fn feature(&self, name: &str) -> Result<Vec<f64>, ChannelError> {
        self.check(name)?;
        self.features
            .get(name)
            .cloned()
            .ok_or_else(|| ChannelError::MissingFeature(self.channel, name.to_string()))
    }

    fn projections(&self) -> Result<Array2<f64>, ChannelError> {
        self.check(PROJECTIONS_NAME)?;
        self.projections
            .clone()
            .ok_or(ChannelError::MissingProjections(self.channel))
    }
}

/// A channel whose file gains one event after every timestamp read, like a file the DAQ
/// is still writing to. Only the first `visible` events of `inner` exist at any time.
#[derive(Debug)]
pub struct GrowingChannel {
    inner: MemoryChannel,
    visible: AtomicUsize,
}

impl GrowingChannel {
    pub fn new(inner: MemoryChannel, visible: usize) -> Self {
        Self {
            inner,
            visible: AtomicUsize::new(visible),
        }
    }

    fn visible(&self) -> usize {
        self.visible
            .load(Ordering::SeqCst)
            .min(self.inner.timestamps.len())
    }
}

impl ChannelSource for GrowingChannel {
    fn channel_number(&self) -> u32 {
        self.inner.channel
    }

    fn timestamps(&self) -> Result<Vec<u64>, ChannelError> {
        let n = self.visible();
        self.visible.fetch_add(1, Ordering::SeqCst);
        Ok(self.inner.timestamps()?[..n].to_vec())
    }

    fn feature(&self, name: &str) -> Result<Vec<f64>, ChannelError> {
        let mut values = self.inner.feature(name)?;
        values.truncate(self.visible());
        Ok(values)
    }

    fn projections(&self) -> Result<Array2<f64>, ChannelError> {
        let projections = self.inner.projections()?;
        let n = self.visible().min(projections.nrows());
        Ok(projections.slice(ndarray::s![..n, ..]).to_owned())
    }
}

/// A channel with CKAlpha and OKAlpha events in the calibration state and the scan state.
///
/// The filtered value drifts with the pretrigger mean and the phase, with a gain that depends
/// on the channel number. Scan state events are shifted by `scan_offset_ns`.
pub fn synthetic_channel(channel: u32, scan_offset_ns: u64) -> MemoryChannel {
    let gain = 5.0 + 0.25 * channel as f64;
    let mut timestamps = Vec::with_capacity(N_CAL_EVENTS + N_SCAN_EVENTS);
    let mut filt_value = Vec::new();
    let mut pretrigger_mean = Vec::new();
    let mut phase = Vec::new();

    let mut push_event = |i: usize, t: u64| {
        let energy = if i % 2 == 0 { 277.0 } else { 524.9 };
        let ptm = 90.0 + ((i * 7) % 21) as f64;
        let ph = ((i * 13) % 11) as f64 / 10.0 - 0.5;
        let jitter = ((i * 37) % 101) as f64 / 101.0 - 0.5;
        let value = energy
            * gain
            * (1.0 + 0.001 * jitter)
            * (1.0 + 0.0005 * (ptm - 100.0))
            * (1.0 + 0.002 * ph);
        timestamps.push(t);
        filt_value.push(value);
        pretrigger_mean.push(ptm);
        phase.push(ph);
    };
    for i in 0..N_CAL_EVENTS {
        push_event(i, BASE_NS + i as u64 * CAL_SPACING_NS);
    }
    for i in 0..N_SCAN_EVENTS {
        push_event(i, SCAN_START_NS + i as u64 * SCAN_SPACING_NS + scan_offset_ns);
    }

    // Projections that an identity 5-lag filter turns back into the filtered value
    let mut coefs = Array2::zeros((filt_value.len(), 5));
    for (row, value) in filt_value.iter().enumerate() {
        let k = 0.01 * value;
        for (col, x) in [-2.0_f64, -1.0, 0.0, 1.0, 2.0].iter().enumerate() {
            coefs[[row, col]] = value - k * x * x;
        }
    }

    MemoryChannel::new(channel)
        .with_timestamps(timestamps)
        .with_feature(FILT_VALUE_NAME, filt_value)
        .with_feature(PRETRIGGER_MEAN_NAME, pretrigger_mean)
        .with_feature(FILT_PHASE_NAME, phase)
        .with_projections(coefs)
}

fn synthetic_channels(good: &[u32]) -> Vec<Channel> {
    good.iter()
        .map(|ch| Channel::new(Box::new(synthetic_channel(*ch, *ch as u64 * 1000))))
        .collect()
}

/// A group of synthetic channels plus channels whose reads always fail
pub fn synthetic_group(good: &[u32], failing: &[u32]) -> ChannelGroup {
    let mut channels = synthetic_channels(good);
    channels.extend(
        failing
            .iter()
            .map(|ch| Channel::new(Box::new(MemoryChannel::new(*ch).failing()))),
    );
    ChannelGroup::from_parts(channels, standard_states())
}

/// Synthetic channels whose scan state events all share the same timestamps
pub fn aligned_group(good: &[u32]) -> ChannelGroup {
    let channels = good
        .iter()
        .map(|ch| Channel::new(Box::new(synthetic_channel(*ch, 0))))
        .collect();
    ChannelGroup::from_parts(channels, standard_states())
}

/// A scan log stepping through `steps` values over the scan state
pub fn stepped_scan_log(steps: usize, with_normalization: bool) -> ScanLog {
    let step_s = 100.0 / steps as f64;
    let times: Vec<f64> = (0..steps).map(|k| scan_time_s(k as f64 * step_s)).collect();
    let values: Vec<f64> = (0..steps).map(|k| 400.0 + 10.0 * k as f64).collect();
    let normalization =
        with_normalization.then(|| ("i0".to_string(), (0..steps).map(|k| 2.0 + k as f64).collect()));
    ScanLog::new("mono_energy", times, values, normalization).unwrap()
}

pub fn write_channel_file(
    path: &Path,
    unixnano: &[u64],
    features: &[(&str, Vec<f64>)],
    projections: Option<&Array2<f64>>,
) {
    let file = hdf5::File::create(path).unwrap();
    file.new_dataset_builder()
        .with_data(unixnano)
        .create(UNIXNANO_NAME)
        .unwrap();
    for (name, values) in features {
        file.new_dataset_builder()
            .with_data(values.as_slice())
            .create(*name)
            .unwrap();
    }
    if let Some(coefs) = projections {
        file.new_dataset_builder()
            .with_data(coefs)
            .create(PROJECTIONS_NAME)
            .unwrap();
    }
}

pub fn write_model_file(path: &Path, channels: &[u32], filter: &Array2<f64>) {
    let file = hdf5::File::create(path).unwrap();
    for channel in channels {
        let group = file.create_group(&format!("chan{channel}")).unwrap();
        group
            .new_dataset_builder()
            .with_data(filter)
            .create("filter_5lag")
            .unwrap();
    }
}

/// Write synthetic channels and the experiment state file as an acquisition on disk
pub fn write_synthetic_run(dir: &Path, prefix: &str, channels: &[u32]) {
    for channel in channels {
        let source = synthetic_channel(*channel, *channel as u64 * 1000);
        let features: Vec<(&str, Vec<f64>)> = source
            .features
            .iter()
            .map(|(name, values)| (name.as_str(), values.clone()))
            .collect();
        write_channel_file(
            &dir.join(format!("{prefix}_chan{channel}.h5")),
            &source.timestamps,
            &features,
            source.projections.as_ref(),
        );
    }
    std::fs::write(
        dir.join(format!("{prefix}_experiment_state.txt")),
        format!(
            "# unix time in nanoseconds, state label\n{BASE_NS}, {CAL_STATE}\n{SCAN_START_NS}, {SCAN_STATE}\n{END_NS}, {END_STATE}\n"
        ),
    )
    .unwrap();
}

/// The channels a [`MemoryCatalog`] opens for one run
#[derive(Debug, Default)]
struct MemoryRunChannels {
    good: Vec<u32>,
    failing: Vec<u32>,
    switched: Vec<u32>,
    switch: Option<Arc<AtomicBool>>,
}

/// A catalog of in-memory runs. Calibration runs open synthetic channel groups.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    runs: FxHashMap<String, RunHandle>,
    channels: FxHashMap<String, MemoryRunChannels>,
}

impl MemoryCatalog {
    pub fn add_run(&mut self, handle: RunHandle, good: &[u32], failing: &[u32]) {
        self.insert(
            handle,
            MemoryRunChannels {
                good: good.to_vec(),
                failing: failing.to_vec(),
                ..Default::default()
            },
        );
    }

    /// Add a run whose `switched` channels fail once `switch` is set
    pub fn add_switched_run(
        &mut self,
        handle: RunHandle,
        good: &[u32],
        switched: &[u32],
        switch: Arc<AtomicBool>,
    ) {
        self.insert(
            handle,
            MemoryRunChannels {
                good: good.to_vec(),
                switched: switched.to_vec(),
                switch: Some(switch),
                ..Default::default()
            },
        );
    }

    fn insert(&mut self, handle: RunHandle, channels: MemoryRunChannels) {
        self.channels.insert(handle.uid.clone(), channels);
        self.runs.insert(handle.uid.clone(), handle);
    }
}

impl RunCatalog for MemoryCatalog {
    fn resolve_run(&self, run_id: &str) -> Result<RunHandle, CatalogError> {
        self.runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownRun(run_id.to_string(), PathBuf::from("memory")))
    }

    fn open_channel_files(&self, run: &RunHandle) -> Result<ChannelGroup, CatalogError> {
        let run_channels = self
            .channels
            .get(&run.uid)
            .ok_or_else(|| CatalogError::UnknownRun(run.uid.clone(), PathBuf::from("memory")))?;
        let mut channels = synthetic_channels(&run_channels.good);
        channels.extend(
            run_channels
                .failing
                .iter()
                .map(|ch| Channel::new(Box::new(MemoryChannel::new(*ch).failing()))),
        );
        if let Some(switch) = &run_channels.switch {
            channels.extend(run_channels.switched.iter().map(|ch| {
                Channel::new(Box::new(
                    synthetic_channel(*ch, *ch as u64 * 1000).with_switch(switch.clone()),
                ))
            }));
        }
        Ok(ChannelGroup::from_parts(channels, standard_states()))
    }
}
