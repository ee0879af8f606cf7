use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::channel::ChannelGroup;
use super::error::CatalogError;
use super::scan::ScanLog;

const CALIBRATION_SCAN_TYPE: &str = "calibration";
const RUN_DOCUMENT_EXTENSION: &str = "yml";

/// How a run is handled, decided by its declared scan type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Calibration,
    Data,
    Unclassified,
}

impl RunKind {
    pub fn classify(scan_type: &str) -> Self {
        match scan_type.trim() {
            "" => Self::Unclassified,
            CALIBRATION_SCAN_TYPE => Self::Calibration,
            _ => Self::Data,
        }
    }
}

/// A normalization signal recorded alongside the scan variable
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationSignal {
    pub name: String,
    pub values: Vec<f64>,
}

/// The primary data stream of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimaryStream {
    pub scan_variable: String,
    pub time: Vec<f64>,
    pub values: Vec<f64>,
    #[serde(default)]
    pub normalization: Option<NormalizationSignal>,
}

/// One run as stored by the file-backed catalog
///
/// A run only has an `exit_status` once its stop document was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDocument {
    pub uid: String,
    pub plan_name: String,
    pub scan_id: u64,
    #[serde(default)]
    pub scan_type: String,
    #[serde(default)]
    pub tes_state: String,
    #[serde(default)]
    pub cal_lines: Vec<String>,
    #[serde(default)]
    pub raw_data_path: Option<PathBuf>,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub exit_status: Option<String>,
    #[serde(default)]
    pub primary: PrimaryStream,
}

/// Everything the dispatcher needs to know about a completed run
#[derive(Debug, Clone, PartialEq)]
pub struct RunHandle {
    pub uid: String,
    pub scan_type: String,
    pub state_label: String,
    pub line_names: Vec<String>,
    pub plan_name: String,
    pub scan_id: u64,
    pub raw_data_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub scan_log: ScanLog,
}

impl RunHandle {
    pub fn kind(&self) -> RunKind {
        RunKind::classify(&self.scan_type)
    }

    /// Name of the 1D scan output, without extension
    pub fn scan_output_name(&self) -> String {
        format!("{}_{}", self.plan_name, self.scan_id)
    }

    /// Name of the RIXS map output, without extension
    pub fn rixs_output_name(&self) -> String {
        format!("{}_rixs_{}", self.plan_name, self.scan_id)
    }
}

/// The source of run metadata and channel data
pub trait RunCatalog {
    /// Look up a completed run by its identifier
    fn resolve_run(&self, run_id: &str) -> Result<RunHandle, CatalogError>;

    /// Open the channel files holding the run's events
    fn open_channel_files(&self, run: &RunHandle) -> Result<ChannelGroup, CatalogError>;
}

/// A catalog kept as a directory of `<run id>.yml` run documents.
///
/// Relative data and model paths in a document are taken relative to the directory.
#[derive(Debug, Clone)]
pub struct YamlCatalog {
    dir: PathBuf,
    max_channels: usize,
}

impl YamlCatalog {
    pub fn new(dir: &Path, max_channels: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            max_channels,
        }
    }

    pub fn run_document_path(&self, run_id: &str) -> PathBuf {
        self.dir
            .join(format!("{run_id}.{RUN_DOCUMENT_EXTENSION}"))
    }

    pub fn read_run_document(&self, run_id: &str) -> Result<RunDocument, CatalogError> {
        let path = self.run_document_path(run_id);
        if !path.exists() {
            return Err(CatalogError::UnknownRun(run_id.to_string(), path));
        }
        let mut yaml_str = String::new();
        let mut file = File::open(&path)?;
        file.read_to_string(&mut yaml_str)?;
        Ok(serde_yaml::from_str::<RunDocument>(&yaml_str)?)
    }

    fn resolve_path(&self, path: Option<PathBuf>) -> Option<PathBuf> {
        path.map(|p| if p.is_relative() { self.dir.join(p) } else { p })
    }
}

impl RunCatalog for YamlCatalog {
    fn resolve_run(&self, run_id: &str) -> Result<RunHandle, CatalogError> {
        let doc = self.read_run_document(run_id)?;
        if doc.exit_status.is_none() {
            return Err(CatalogError::RunNotComplete(doc.uid));
        }
        let primary = doc.primary;
        let normalization = primary.normalization.map(|n| (n.name, n.values));
        let scan_log = ScanLog::new(
            &primary.scan_variable,
            primary.time,
            primary.values,
            normalization,
        )?;
        Ok(RunHandle {
            uid: doc.uid,
            scan_type: doc.scan_type,
            state_label: doc.tes_state,
            line_names: doc.cal_lines,
            plan_name: doc.plan_name,
            scan_id: doc.scan_id,
            raw_data_path: self.resolve_path(doc.raw_data_path),
            model_path: self.resolve_path(doc.model_path),
            scan_log,
        })
    }

    fn open_channel_files(&self, run: &RunHandle) -> Result<ChannelGroup, CatalogError> {
        let path = run
            .raw_data_path
            .as_ref()
            .ok_or_else(|| CatalogError::NoRawData(run.uid.clone()))?;
        Ok(ChannelGroup::open(path, self.max_channels)?)
    }
}
