use hdf5::types::VarLenUnicode;
use hdf5::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::calibration::CalibrationState;
use super::catalog::RunHandle;
use super::error::HDF5WriterError;
use super::scan::{Scan1D, Scan2D};

const SCAN_AXIS_NAME: &str = "scan_axis";
const EMISSION_AXIS_NAME: &str = "emission_axis";
const INTENSITY_NAME: &str = "intensity";
const NORMALIZATION_NAME: &str = "normalization";
const COUNTS_NAME: &str = "counts";
const NO_NORMALIZATION: &str = "none";
const OUTPUT_EXTENSION: &str = "h5";
const PARTIAL_SUFFIX: &str = ".partial";

/// This is the version of the output format
pub const FORMAT_VERSION: &str = "1.0";

// Structure of the 1D scan file, <plan_name>_<scan_id>.h5
// / - version, run_uid, plan_name, scan_id, scan_variable, normalization_name, energy_attr,
// |   fv_attr, calibration_run_uid
// |---- scan_axis(dset)
// |---- intensity(dset)
// |---- normalization(dset)
// |---- counts(dset)
//
// The RIXS file, <plan_name>_rixs_<scan_id>.h5, has the same attributes and
// |---- scan_axis(dset)
// |---- emission_axis(dset)
// |---- counts(dset) - [scan bin, emission bin]

/// Writes the binned products of a data run as HDF5 files in the output directory.
///
/// Files of the same name are replaced.
#[derive(Debug, Clone)]
pub struct ScanWriter {
    output_dir: PathBuf,
}

impl ScanWriter {
    pub fn new(output_dir: &Path) -> Result<Self, HDF5WriterError> {
        if !output_dir.is_dir() {
            return Err(HDF5WriterError::BadOutputPath(output_dir.to_path_buf()));
        }
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
        })
    }

    pub fn scan_path(&self, run: &RunHandle) -> PathBuf {
        self.output_dir
            .join(format!("{}.{OUTPUT_EXTENSION}", run.scan_output_name()))
    }

    pub fn rixs_path(&self, run: &RunHandle) -> PathBuf {
        self.output_dir
            .join(format!("{}.{OUTPUT_EXTENSION}", run.rixs_output_name()))
    }

    /// Write both products of a run, returning the paths of the 1D scan and the RIXS map.
    ///
    /// The files are written under temporary names and only moved into place once both
    /// are complete, so a failed run never leaves one product without the other or
    /// truncates an earlier copy.
    pub fn write_run(
        &self,
        run: &RunHandle,
        calibration: &CalibrationState,
        scan: &Scan1D,
        rixs: &Scan2D,
    ) -> Result<(PathBuf, PathBuf), HDF5WriterError> {
        let scan_path = self.scan_path(run);
        let rixs_path = self.rixs_path(run);
        let scan_partial = partial_path(&scan_path);
        let rixs_partial = partial_path(&rixs_path);

        let written = write_scan_1d(&scan_partial, run, calibration, scan)
            .and_then(|()| write_rixs(&rixs_partial, run, calibration, rixs));
        if let Err(e) = written {
            remove_partial(&scan_partial);
            remove_partial(&rixs_partial);
            return Err(e);
        }

        std::fs::rename(&scan_partial, &scan_path)?;
        std::fs::rename(&rixs_partial, &rixs_path)?;
        Ok((scan_path, rixs_path))
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn remove_partial(path: &Path) {
    if path.is_file() {
        if let Err(e) = std::fs::remove_file(path) {
            spdlog::warn!(
                "Could not remove partial output {}: {}",
                path.to_string_lossy(),
                e
            );
        }
    }
}

fn write_scan_1d(
    path: &Path,
    run: &RunHandle,
    calibration: &CalibrationState,
    scan: &Scan1D,
) -> Result<(), HDF5WriterError> {
    let file = File::create(path)?;
    write_run_attrs(&file, run, calibration)?;
    file.new_dataset_builder()
        .with_data(scan.scan_axis.as_slice())
        .create(SCAN_AXIS_NAME)?;
    file.new_dataset_builder()
        .with_data(scan.intensity.as_slice())
        .create(INTENSITY_NAME)?;
    file.new_dataset_builder()
        .with_data(scan.normalization.as_slice())
        .create(NORMALIZATION_NAME)?;
    file.new_dataset_builder()
        .with_data(scan.counts.as_slice())
        .create(COUNTS_NAME)?;
    file.close()?;
    Ok(())
}

fn write_rixs(
    path: &Path,
    run: &RunHandle,
    calibration: &CalibrationState,
    scan: &Scan2D,
) -> Result<(), HDF5WriterError> {
    let file = File::create(path)?;
    write_run_attrs(&file, run, calibration)?;
    file.new_dataset_builder()
        .with_data(scan.scan_axis.as_slice())
        .create(SCAN_AXIS_NAME)?;
    file.new_dataset_builder()
        .with_data(scan.emission_axis.as_slice())
        .create(EMISSION_AXIS_NAME)?;
    file.new_dataset_builder()
        .with_data(&scan.counts)
        .create(COUNTS_NAME)?;
    file.close()?;
    Ok(())
}

fn write_run_attrs(
    file: &File,
    run: &RunHandle,
    calibration: &CalibrationState,
) -> Result<(), HDF5WriterError> {
    let version = format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION);
    write_string_attr(file, "version", &version)?;
    write_string_attr(file, "run_uid", &run.uid)?;
    write_string_attr(file, "plan_name", &run.plan_name)?;
    file.new_attr::<u64>()
        .create("scan_id")?
        .write_scalar(&run.scan_id)?;
    write_string_attr(file, "scan_variable", run.scan_log.variable())?;
    write_string_attr(
        file,
        "normalization_name",
        run.scan_log.normalization_name().unwrap_or(NO_NORMALIZATION),
    )?;
    write_string_attr(file, "energy_attr", calibration.energy_attr())?;
    write_string_attr(file, "fv_attr", &calibration.fv_attr())?;
    write_string_attr(file, "calibration_run_uid", calibration.run_uid())?;
    Ok(())
}

fn write_string_attr(file: &File, name: &str, value: &str) -> Result<(), HDF5WriterError> {
    let value = VarLenUnicode::from_str(value)
        .map_err(|_| HDF5WriterError::BadString(value.to_string()))?;
    file.new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}
