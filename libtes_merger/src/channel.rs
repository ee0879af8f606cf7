use fxhash::FxHashMap;
use ndarray::{s, Array2, Axis};
use std::path::{Path, PathBuf};

use super::error::{ChannelError, ChannelGroupError};
use super::experiment_state::{ExperimentStates, StateSelection};

pub const UNIXNANO_NAME: &str = "unixnano";
pub const PRETRIGGER_MEAN_NAME: &str = "pretriggerMean";
pub const FILT_VALUE_NAME: &str = "filtValue";
pub const FILT_PHASE_NAME: &str = "filtPhase";
pub const PROJECTIONS_NAME: &str = "coefs";

const CHANNEL_INFIX: &str = "_chan";
const CHANNEL_EXTENSION: &str = "h5";
const STATE_FILE_SUFFIX: &str = "_experiment_state.txt";

/// Raw per-event features of a single detector channel.
///
/// Implementations read the data produced by the pulse processing (filtered values,
/// baselines, phases). Every method reports all of the events of the channel; selection by
/// experiment state is done by [`Channel`].
pub trait ChannelSource: Send {
    /// The channel number of this source
    fn channel_number(&self) -> u32;

    /// Event timestamps in unix nanoseconds
    fn timestamps(&self) -> Result<Vec<u64>, ChannelError>;

    /// A scalar per-event feature, e.g. `filtValue`
    fn feature(&self, name: &str) -> Result<Vec<f64>, ChannelError>;

    /// Per-event projection coefficients, shape `[n_events, n_basis]`
    fn projections(&self) -> Result<Array2<f64>, ChannelError>;

    /// Timestamps and the named datasets in one pass. Lengths may differ if the source is
    /// still being written.
    fn read_events(&self, names: &[&str]) -> Result<EventSnapshot, ChannelError> {
        let mut snapshot = EventSnapshot::new(self.channel_number(), self.timestamps()?);
        for name in names {
            if *name == PROJECTIONS_NAME {
                snapshot.projections = Some(self.projections()?);
            } else {
                snapshot.features.insert(name.to_string(), self.feature(name)?);
            }
        }
        Ok(snapshot)
    }
}

/// A detector channel: a data source plus the durable "bad" flag.
///
/// Once a channel is marked bad it stays bad for the lifetime of the group it belongs to.
pub struct Channel {
    source: Box<dyn ChannelSource>,
    bad_reason: Option<String>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("channel", &self.number())
            .field("bad_reason", &self.bad_reason)
            .finish()
    }
}

impl Channel {
    pub fn new(source: Box<dyn ChannelSource>) -> Self {
        Self {
            source,
            bad_reason: None,
        }
    }

    pub fn number(&self) -> u32 {
        self.source.channel_number()
    }

    pub fn is_bad(&self) -> bool {
        self.bad_reason.is_some()
    }

    pub fn bad_reason(&self) -> Option<&str> {
        self.bad_reason.as_deref()
    }

    /// Mark the channel bad. The first reason given is kept.
    pub fn mark_bad(&mut self, reason: &str) {
        if self.bad_reason.is_none() {
            self.bad_reason = Some(reason.to_string());
        }
    }

    /// Read the timestamps and the named datasets of the events recorded under the selected
    /// state, all from one pass over the source. `PROJECTIONS_NAME` requests the projection
    /// coefficients.
    ///
    /// Datasets that are longer than the others (events appended during the read) are cut
    /// to the shortest common length before the state selection is applied.
    pub fn get_attr(
        &self,
        names: &[&str],
        selection: &StateSelection,
    ) -> Result<EventSnapshot, ChannelError> {
        let mut snapshot = self.source.read_events(names)?;
        let clamped = snapshot.clamp_to_common_length();
        if clamped > 0 {
            spdlog::debug!(
                "Channel {} ignored {} events still being written",
                self.number(),
                clamped
            );
        }
        Ok(snapshot.select(selection))
    }
}

/// The events of one channel read in a single pass: timestamps plus the requested datasets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSnapshot {
    channel: u32,
    unixnano: Vec<u64>,
    features: FxHashMap<String, Vec<f64>>,
    projections: Option<Array2<f64>>,
}

impl EventSnapshot {
    fn new(channel: u32, unixnano: Vec<u64>) -> Self {
        Self {
            channel,
            unixnano,
            ..Default::default()
        }
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn len(&self) -> usize {
        self.unixnano.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unixnano.is_empty()
    }

    pub fn unixnano(&self) -> &[u64] {
        &self.unixnano
    }

    pub fn feature(&self, name: &str) -> Result<&[f64], ChannelError> {
        self.features
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| ChannelError::MissingFeature(self.channel, name.to_string()))
    }

    pub fn projections(&self) -> Result<&Array2<f64>, ChannelError> {
        self.projections
            .as_ref()
            .ok_or(ChannelError::MissingProjections(self.channel))
    }

    /// Cut every dataset to the shortest one. Returns the number of timestamps dropped.
    fn clamp_to_common_length(&mut self) -> usize {
        let n = self
            .features
            .values()
            .map(|v| v.len())
            .chain(self.projections.iter().map(|p| p.nrows()))
            .fold(self.unixnano.len(), usize::min);
        let dropped = self.unixnano.len() - n;
        self.unixnano.truncate(n);
        for values in self.features.values_mut() {
            values.truncate(n);
        }
        if let Some(projections) = self.projections.as_mut() {
            if projections.nrows() > n {
                *projections = projections.slice(s![..n, ..]).to_owned();
            }
        }
        dropped
    }

    /// Keep only the events recorded under the selected state
    fn select(self, selection: &StateSelection) -> Self {
        let mask = selection.mask(&self.unixnano);
        let rows: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(idx, keep)| keep.then_some(idx))
            .collect();
        Self {
            channel: self.channel,
            unixnano: rows.iter().map(|idx| self.unixnano[*idx]).collect(),
            features: self
                .features
                .into_iter()
                .map(|(name, values)| (name, rows.iter().map(|idx| values[*idx]).collect::<Vec<f64>>()))
                .collect(),
            projections: self.projections.map(|p| p.select(Axis(0), &rows)),
        }
    }
}

/// All of the channels of a run, along with the run's experiment states.
#[derive(Debug)]
pub struct ChannelGroup {
    channels: Vec<Channel>,
    states: ExperimentStates,
    states_path: Option<PathBuf>,
    source_path: Option<PathBuf>,
}

impl ChannelGroup {
    /// Build a group from channels that are already open. Channels are ordered by number.
    pub fn from_parts(mut channels: Vec<Channel>, states: ExperimentStates) -> Self {
        channels.sort_by_key(|ch| ch.number());
        Self {
            channels,
            states,
            states_path: None,
            source_path: None,
        }
    }

    /// Open every channel file belonging to the same acquisition as `one_file`.
    ///
    /// Channel files are named `<prefix>_chan<N>.h5`, and the experiment state file
    /// `<prefix>_experiment_state.txt` lives in the same directory. At most `max_channels`
    /// channels (lowest numbers first) are opened.
    pub fn open(one_file: &Path, max_channels: usize) -> Result<Self, ChannelGroupError> {
        if !one_file.exists() {
            return Err(ChannelGroupError::BadFilePath(one_file.to_path_buf()));
        }
        let (prefix, _) = split_channel_file_name(one_file)?;
        let files = get_channel_file_list(one_file, max_channels)?;
        let total_size = files.iter().fold(0, |sum, (_, path)| {
            sum + path.metadata().map(|m| m.len()).unwrap_or(0)
        });
        spdlog::info!(
            "Opening {} channel files with total size {}",
            files.len(),
            human_bytes::human_bytes(total_size as f64)
        );

        let parent = one_file.parent().unwrap_or(Path::new("."));
        let states_path = parent.join(format!("{prefix}{STATE_FILE_SUFFIX}"));
        let states = ExperimentStates::from_file(&states_path)?;

        let channels = files
            .into_iter()
            .map(|(number, path)| {
                Channel::new(Box::new(Hdf5ChannelFile::new(number, path)) as Box<dyn ChannelSource>)
            })
            .collect();

        Ok(Self {
            channels,
            states,
            states_path: Some(states_path),
            source_path: Some(one_file.to_path_buf()),
        })
    }

    /// Re-read the experiment state file, picking up states added since the group was opened
    pub fn refresh_states(&mut self) -> Result<(), ChannelGroupError> {
        if let Some(path) = &self.states_path {
            self.states = ExperimentStates::from_file(path)?;
        }
        Ok(())
    }

    pub fn states(&self) -> &ExperimentStates {
        &self.states
    }

    /// The file this group was opened from, if it was opened from disk
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.iter_mut()
    }

    pub fn get(&self, number: u32) -> Option<&Channel> {
        self.channels.iter().find(|ch| ch.number() == number)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Numbers of the channels that are not marked bad
    pub fn good_channels(&self) -> Vec<u32> {
        self.channels
            .iter()
            .filter(|ch| !ch.is_bad())
            .map(Channel::number)
            .collect()
    }
}

/// Split `<prefix>_chan<N>.h5` into the prefix and the channel number
fn split_channel_file_name(path: &Path) -> Result<(String, u32), ChannelGroupError> {
    let bad_name = || ChannelGroupError::BadFileName(path.to_path_buf());
    if path.extension().and_then(|e| e.to_str()) != Some(CHANNEL_EXTENSION) {
        return Err(bad_name());
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).ok_or_else(bad_name)?;
    let (prefix, number) = stem.rsplit_once(CHANNEL_INFIX).ok_or_else(bad_name)?;
    let number: u32 = number.parse().map_err(|_| bad_name())?;
    Ok((prefix.to_string(), number))
}

/// Get all of the channel files which share a prefix with `one_file`, sorted by channel
fn get_channel_file_list(
    one_file: &Path,
    max_channels: usize,
) -> Result<Vec<(u32, PathBuf)>, ChannelGroupError> {
    let (prefix, _) = split_channel_file_name(one_file)?;
    let parent = one_file.parent().unwrap_or(Path::new("."));
    let mut file_list: Vec<(u32, PathBuf)> = Vec::new();
    for item in parent.read_dir()? {
        let item_path = item?.path();
        if let Ok((item_prefix, number)) = split_channel_file_name(&item_path) {
            if item_prefix == prefix {
                file_list.push((number, item_path));
            }
        }
    }

    if file_list.is_empty() {
        return Err(ChannelGroupError::NoMatchingFiles(one_file.to_path_buf()));
    }

    file_list.sort_by_key(|(number, _)| *number);
    file_list.truncate(max_channels);
    Ok(file_list)
}

/// A channel stored as an HDF5 file with one dataset per feature.
///
/// The file is opened again for every read, since the DAQ keeps appending events to it.
#[derive(Debug, Clone)]
pub struct Hdf5ChannelFile {
    channel: u32,
    path: PathBuf,
}

impl Hdf5ChannelFile {
    pub fn new(channel: u32, path: PathBuf) -> Self {
        Self { channel, path }
    }

    fn open(&self) -> Result<hdf5::File, ChannelError> {
        hdf5::File::open(&self.path).map_err(|e| ChannelError::HDF5Error(self.channel, e))
    }

    fn read_timestamps(&self, file: &hdf5::File) -> Result<Vec<u64>, ChannelError> {
        self.dataset(file, UNIXNANO_NAME)?
            .read_raw::<u64>()
            .map_err(|e| ChannelError::HDF5Error(self.channel, e))
    }

    fn read_feature(&self, file: &hdf5::File, name: &str) -> Result<Vec<f64>, ChannelError> {
        self.dataset(file, name)?
            .read_raw::<f64>()
            .map_err(|e| ChannelError::HDF5Error(self.channel, e))
    }

    fn read_projections(&self, file: &hdf5::File) -> Result<Array2<f64>, ChannelError> {
        if !file.link_exists(PROJECTIONS_NAME) {
            return Err(ChannelError::MissingProjections(self.channel));
        }
        self.dataset(file, PROJECTIONS_NAME)?
            .read_2d::<f64>()
            .map_err(|e| ChannelError::HDF5Error(self.channel, e))
    }

    fn dataset(&self, file: &hdf5::File, name: &str) -> Result<hdf5::Dataset, ChannelError> {
        if !file.link_exists(name) {
            return Err(ChannelError::MissingFeature(self.channel, name.to_string()));
        }
        file.dataset(name)
            .map_err(|e| ChannelError::HDF5Error(self.channel, e))
    }
}

impl ChannelSource for Hdf5ChannelFile {
    fn channel_number(&self) -> u32 {
        self.channel
    }

    fn timestamps(&self) -> Result<Vec<u64>, ChannelError> {
        let file = self.open()?;
        self.read_timestamps(&file)
    }

    fn feature(&self, name: &str) -> Result<Vec<f64>, ChannelError> {
        let file = self.open()?;
        self.read_feature(&file, name)
    }

    fn projections(&self) -> Result<Array2<f64>, ChannelError> {
        let file = self.open()?;
        self.read_projections(&file)
    }

    fn read_events(&self, names: &[&str]) -> Result<EventSnapshot, ChannelError> {
        let file = self.open()?;
        let mut snapshot = EventSnapshot::new(self.channel, self.read_timestamps(&file)?);
        for name in names {
            if *name == PROJECTIONS_NAME {
                snapshot.projections = Some(self.read_projections(&file)?);
            } else {
                snapshot
                    .features
                    .insert(name.to_string(), self.read_feature(&file, name)?);
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_channel_file, GrowingChannel, MemoryChannel};
    use ndarray::Array1;

    fn selection(states: &ExperimentStates, label: &str) -> StateSelection {
        states.selection(label).unwrap()
    }

    #[test]
    fn test_state_selection_applies_to_features() {
        let mut states = ExperimentStates::default();
        states.push(0, "A").unwrap();
        states.push(100, "B").unwrap();
        let source = MemoryChannel::new(4)
            .with_timestamps(vec![10, 50, 150, 200])
            .with_feature("filtValue", vec![1.0, 2.0, 3.0, 4.0]);
        let channel = Channel::new(Box::new(source));

        let sel_b = selection(&states, "B");
        let events = channel.get_attr(&["filtValue"], &sel_b).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events.unixnano(), &[150, 200]);
        assert_eq!(events.feature("filtValue").unwrap(), &[3.0, 4.0]);
        assert!(matches!(
            events.feature("filtPhase"),
            Err(ChannelError::MissingFeature(4, _))
        ));
        assert!(matches!(
            events.projections(),
            Err(ChannelError::MissingProjections(4))
        ));
        assert!(matches!(
            channel.get_attr(&["filtPhase"], &sel_b),
            Err(ChannelError::MissingFeature(4, _))
        ));
    }

    #[test]
    fn test_trailing_events_are_clamped() {
        let mut states = ExperimentStates::default();
        states.push(0, "A").unwrap();
        states.push(15, "B").unwrap();
        let coefs = Array2::from_shape_vec((4, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let source = MemoryChannel::new(1)
            .with_timestamps(vec![10, 20, 30, 40])
            .with_feature("filtValue", vec![1.0, 2.0, 3.0])
            .with_feature("pretriggerMean", vec![5.0, 6.0, 7.0, 8.0, 9.0])
            .with_projections(coefs);
        let channel = Channel::new(Box::new(source));

        let events = channel
            .get_attr(
                &["filtValue", "pretriggerMean", PROJECTIONS_NAME],
                &selection(&states, "B"),
            )
            .unwrap();
        assert_eq!(events.unixnano(), &[20, 30]);
        assert_eq!(events.feature("filtValue").unwrap(), &[2.0, 3.0]);
        assert_eq!(events.feature("pretriggerMean").unwrap(), &[6.0, 7.0]);
        assert_eq!(events.projections().unwrap().column(0).to_vec(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_source_growing_between_reads() {
        let mut states = ExperimentStates::default();
        states.push(0, "A").unwrap();
        let channel = Channel::new(Box::new(GrowingChannel::new(
            MemoryChannel::new(2)
                .with_timestamps((0..10).collect())
                .with_feature("filtValue", (0..10).map(|v| v as f64).collect()),
            6,
        )));
        let sel = selection(&states, "A");
        for expected in [6, 7, 8] {
            let events = channel.get_attr(&["filtValue"], &sel).unwrap();
            assert_eq!(events.len(), expected);
            assert_eq!(events.feature("filtValue").unwrap().len(), expected);
        }
    }

    #[test]
    fn test_mark_bad_keeps_first_reason() {
        let mut channel = Channel::new(Box::new(MemoryChannel::new(3)));
        assert!(!channel.is_bad());
        channel.mark_bad("first");
        channel.mark_bad("second");
        assert_eq!(channel.bad_reason(), Some("first"));
    }

    #[test]
    fn test_split_channel_file_name() {
        let (prefix, number) =
            split_channel_file_name(Path::new("/data/20240507_run0000_chan17.h5")).unwrap();
        assert_eq!(prefix, "20240507_run0000");
        assert_eq!(number, 17);
        assert!(split_channel_file_name(Path::new("/data/20240507_run0000.h5")).is_err());
        assert!(split_channel_file_name(Path::new("/data/x_chanA.h5")).is_err());
        assert!(split_channel_file_name(Path::new("/data/x_chan1.off")).is_err());
    }

    #[test]
    fn test_open_group_from_one_file() {
        let dir = tempfile::tempdir().unwrap();
        for number in [3_u32, 1, 2] {
            write_channel_file(
                &dir.path().join(format!("day_run0000_chan{number}.h5")),
                &[10, 20, 30],
                &[(FILT_VALUE_NAME, vec![1.0, 2.0, 3.0])],
                None,
            );
        }
        // A different acquisition in the same directory is ignored
        write_channel_file(
            &dir.path().join("other_chan9.h5"),
            &[10],
            &[(FILT_VALUE_NAME, vec![1.0])],
            None,
        );
        std::fs::write(
            dir.path().join("day_run0000_experiment_state.txt"),
            "# unix time in nanoseconds, state label\n0, CAL0\n25, SCAN1\n",
        )
        .unwrap();

        let group = ChannelGroup::open(&dir.path().join("day_run0000_chan2.h5"), 2).unwrap();
        assert_eq!(group.good_channels(), vec![1, 2]);

        let sel = group.states().selection("CAL0").unwrap();
        let channel = group.get(2).unwrap();
        let events = channel.get_attr(&[FILT_VALUE_NAME], &sel).unwrap();
        assert_eq!(events.unixnano(), &[10, 20]);
        assert_eq!(events.feature(FILT_VALUE_NAME).unwrap(), &[1.0, 2.0]);
        assert!(matches!(
            channel.get_attr(&[PROJECTIONS_NAME], &sel),
            Err(ChannelError::MissingProjections(2))
        ));
    }

    #[test]
    fn test_hdf5_projections_are_selected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day_chan1.h5");
        let coefs = Array2::from_shape_vec((3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        write_channel_file(&path, &[10, 20, 30], &[], Some(&coefs));
        let channel = Channel::new(Box::new(Hdf5ChannelFile::new(1, path)));

        let mut states = ExperimentStates::default();
        states.push(15, "B").unwrap();
        let events = channel
            .get_attr(&[PROJECTIONS_NAME], &states.selection("B").unwrap())
            .unwrap();
        let projections = events.projections().unwrap();
        assert_eq!(events.unixnano(), &[20, 30]);
        assert_eq!(projections.nrows(), 2);
        assert_eq!(projections.row(0), Array1::from(vec![3.0, 4.0]));
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ChannelGroup::open(&dir.path().join("nothing_chan1.h5"), 10),
            Err(ChannelGroupError::BadFilePath(_))
        ));
    }
}
