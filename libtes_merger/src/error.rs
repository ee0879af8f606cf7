use std::path::PathBuf;
use thiserror::Error;

use super::worker_status::RunStatus;

#[derive(Debug, Error)]
pub enum ExperimentStateError {
    #[error("ExperimentStates failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ExperimentStates failed to parse a timestamp: {0}")]
    ParsingError(#[from] std::num::ParseIntError),
    #[error("ExperimentStates was given a line with the incorrect format: {0:?}")]
    BadFileFormat(String),
    #[error("ExperimentStates rows are out of order at timestamp {0}")]
    OutOfOrder(u64),
    #[error("State label {0} was not found in the experiment state file")]
    UnknownState(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel {0} failed due to HDF5 error: {1}")]
    HDF5Error(u32, hdf5::Error),
    #[error("Channel {0} has no feature named {1}")]
    MissingFeature(u32, String),
    #[error("Channel {0} has no projection coefficients")]
    MissingProjections(u32),
    #[error("Channel {0} is not covered by the active calibration")]
    NotCalibrated(u32),
    #[error("Channel {0} failed due to PulseModel error: {1}")]
    ModelError(u32, #[source] PulseModelError),
    #[error("Channel {0} failed due to drift correction error: {1}")]
    DriftError(u32, #[source] DriftError),
    #[error("Channel {0} failed due to line calibration error: {1}")]
    CalibrationError(u32, #[source] LineCalibrationError),
}

#[derive(Debug, Error)]
pub enum ChannelGroupError {
    #[error("ChannelGroup could not open channel files as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("ChannelGroup could not find a channel number in file name {0:?}")]
    BadFileName(PathBuf),
    #[error("ChannelGroup did not find any matching channel files next to {0:?}")]
    NoMatchingFiles(PathBuf),
    #[error("ChannelGroup failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ChannelGroup failed due to ExperimentStates error: {0}")]
    StateError(#[from] ExperimentStateError),
}

#[derive(Debug, Error)]
pub enum PulseModelError {
    #[error("PulseModel could not be loaded as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("PulseModel failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("PulseModel has no 5-lag filter for channel {0}")]
    MissingChannel(u32),
    #[error("PulseModel filter has shape {0:?}; expected 5 rows")]
    BadFilterShape(Vec<usize>),
    #[error("PulseModel filter has {0} basis components but the channel projections have {1}")]
    BasisMismatch(usize, usize),
}

#[derive(Debug, Clone, Error)]
pub enum DriftError {
    #[error("DriftCorrection needs at least {0} events, found {1}")]
    TooFewEvents(usize, usize),
    #[error("DriftCorrection was given {0} values and {1} indicator values")]
    LengthMismatch(usize, usize),
    #[error("DriftCorrection found a non-finite input value")]
    NonFinite,
    #[error("DriftCorrection requires a positive mean value, found {0}")]
    NonPositiveMean(f64),
}

#[derive(Debug, Clone, Error)]
pub enum LineCalibrationError {
    #[error("Spectral line {0} is not a known line name or energy")]
    UnknownLine(String),
    #[error("LineCalibration was given no spectral lines")]
    NoLines,
    #[error("Spectral lines {0} and {1} have the same energy")]
    DuplicateEnergy(String, String),
    #[error("LineCalibration needs at least {0} positive values, found {1}")]
    TooFewEvents(usize, usize),
    #[error("LineCalibration found {0} peaks but {1} lines were requested")]
    NotEnoughPeaks(usize, usize),
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Calibration failed due to line error: {0}")]
    LineError(#[from] LineCalibrationError),
    #[error("Calibration failed due to PulseModel error: {0}")]
    ModelError(#[from] PulseModelError),
    #[error("Calibration failed due to ExperimentStates error: {0}")]
    StateError(#[from] ExperimentStateError),
    #[error("Calibration failed because none of the {0} channels could be calibrated")]
    NoChannelsCalibrated(usize),
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Merger failed due to ExperimentStates error: {0}")]
    StateError(#[from] ExperimentStateError),
    #[error("Merger failed because no channels survived for state {0}")]
    NoSurvivingChannels(String),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("ScanLog has {0} times, {1} values and {2} normalization values")]
    LengthMismatch(usize, usize, usize),
    #[error("ScanLog times are not in increasing order at sample {0}")]
    UnsortedLog(usize),
    #[error("ScanLog contains a non-finite value at sample {0}")]
    NonFinite(usize),
    #[error("Axis needs at least one bin")]
    NoBins,
    #[error("Axis range [{0}, {1}] is invalid")]
    BadRange(f64, f64),
    #[error("Axis edges must be finite and strictly increasing")]
    BadEdges,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Catalog could not find run {0} at {1:?}")]
    UnknownRun(String, PathBuf),
    #[error("Run {0} has no stop document and cannot be processed yet")]
    RunNotComplete(String),
    #[error("Run {0} does not name a raw data file")]
    NoRawData(String),
    #[error("Catalog failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Catalog failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Catalog failed due to ScanLog error: {0}")]
    ScanError(#[from] ScanError),
    #[error("Catalog failed due to ChannelGroup error: {0}")]
    ChannelGroupError(#[from] ChannelGroupError),
}

#[derive(Debug, Error)]
pub enum HDF5WriterError {
    #[error("HDF5Writer failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("HDF5Writer failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("HDF5Writer could not store string attribute {0}")]
    BadString(String),
    #[error("HDF5Writer could not write to {0:?} as the directory does not exist")]
    BadOutputPath(PathBuf),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid axis: {0}")]
    AxisError(#[from] ScanError),
    #[error("Config max_channels must be at least 1")]
    BadMaxChannels,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatcher failed due to Catalog error: {0}")]
    CatalogError(#[from] CatalogError),
    #[error("Dispatcher failed due to Calibration error: {0}")]
    CalibrationError(#[from] CalibrationError),
    #[error("Dispatcher failed due to Merger error: {0}")]
    MergeError(#[from] MergeError),
    #[error("Dispatcher failed due to ChannelGroup error: {0}")]
    ChannelGroupError(#[from] ChannelGroupError),
    #[error("Dispatcher failed due to HDF5Writer error: {0}")]
    HDFError(#[from] HDF5WriterError),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to HDF5Writer error: {0}")]
    HDFError(#[from] HDF5WriterError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<RunStatus>),
}
