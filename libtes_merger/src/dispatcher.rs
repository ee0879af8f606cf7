use std::path::PathBuf;

use super::calibration::{build_calibration, CalibrationStatus, CalibrationStore, ChannelFailure};
use super::catalog::{RunCatalog, RunHandle, RunKind};
use super::error::DispatchError;
use super::hdf_writer::ScanWriter;
use super::merger::merge_events;
use super::scan::{build_1d_scan, build_2d_scan, BinAxis};

/// What happened to a run that was handled without error
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A new calibration was installed
    Calibrated {
        covered: Vec<u32>,
        failures: Vec<ChannelFailure>,
    },
    /// The run was merged, binned and written
    Processed {
        n_events: usize,
        failures: Vec<ChannelFailure>,
        scan_path: PathBuf,
        rixs_path: PathBuf,
    },
    /// A data run arrived before any calibration
    NoCalibration,
    /// The run has no recognizable scan type
    Unclassified,
}

/// Routes each completed run to calibration or to data processing.
///
/// Starts without a calibration. The first successful calibration run moves it to the
/// calibrated state, and every later one replaces the active calibration. A calibration run
/// that fails leaves the previous calibration in place.
pub struct RunDispatcher<C: RunCatalog> {
    catalog: C,
    store: CalibrationStore,
    writer: ScanWriter,
    scan_axis: BinAxis,
    emission_axis: BinAxis,
    default_model_path: Option<PathBuf>,
}

impl<C: RunCatalog> RunDispatcher<C> {
    pub fn new(
        catalog: C,
        writer: ScanWriter,
        scan_axis: BinAxis,
        emission_axis: BinAxis,
        default_model_path: Option<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            store: CalibrationStore::new(),
            writer,
            scan_axis,
            emission_axis,
            default_model_path,
        }
    }

    pub fn state(&self) -> CalibrationStatus {
        self.store.status()
    }

    pub fn store(&self) -> &CalibrationStore {
        &self.store
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Resolve a run through the catalog and handle it
    pub fn handle_run_id(&mut self, run_id: &str) -> Result<DispatchOutcome, DispatchError> {
        let run = self.catalog.resolve_run(run_id)?;
        self.handle_run(&run)
    }

    pub fn handle_run(&mut self, run: &RunHandle) -> Result<DispatchOutcome, DispatchError> {
        match run.kind() {
            RunKind::Unclassified => {
                spdlog::info!("Run {} has no recognizable scan type, skipping", run.uid);
                Ok(DispatchOutcome::Unclassified)
            }
            RunKind::Calibration => self.calibrate(run),
            RunKind::Data => self.process_data(run),
        }
    }

    fn calibrate(&mut self, run: &RunHandle) -> Result<DispatchOutcome, DispatchError> {
        spdlog::info!(
            "Run {} is a calibration run using state {}",
            run.uid,
            run.state_label
        );
        let mut channels = self.catalog.open_channel_files(run)?;
        let model_path = run
            .model_path
            .as_deref()
            .or(self.default_model_path.as_deref());
        let build = build_calibration(
            &mut channels,
            &run.uid,
            &run.state_label,
            &run.line_names,
            model_path,
        )?;

        let covered = build.state.channel_numbers();
        if let Some(previous) = self.store.install(build.state, channels) {
            spdlog::info!(
                "Calibration from run {} (state {}) replaced by run {} (state {})",
                previous.state.run_uid(),
                previous.state.state_label(),
                run.uid,
                run.state_label
            );
        }
        Ok(DispatchOutcome::Calibrated {
            covered,
            failures: build.failures,
        })
    }

    fn process_data(&mut self, run: &RunHandle) -> Result<DispatchOutcome, DispatchError> {
        let Some(active) = self.store.active_mut() else {
            spdlog::info!("No calibration available for run {}, skipping", run.uid);
            return Ok(DispatchOutcome::NoCalibration);
        };

        if let (Some(run_path), Some(cal_path)) =
            (run.raw_data_path.as_deref(), active.channels.source_path())
        {
            if run_path != cal_path {
                spdlog::warn!(
                    "Run {} names raw data {} but the calibration was built from {}; using the calibration channel files",
                    run.uid,
                    run_path.to_string_lossy(),
                    cal_path.to_string_lossy()
                );
            }
        }

        active.channels.refresh_states()?;
        let merged = merge_events(&active.state, &mut active.channels, &run.state_label)?;
        let tfy = build_1d_scan(
            &merged.events,
            &run.scan_log,
            &self.scan_axis,
            &self.emission_axis,
        );
        let rixs = build_2d_scan(
            &merged.events,
            &run.scan_log,
            &self.scan_axis,
            &self.emission_axis,
        );

        let (scan_path, rixs_path) = self.writer.write_run(run, &active.state, &tfy, &rixs)?;
        spdlog::info!(
            "Run {} wrote {} and {}",
            run.uid,
            scan_path.to_string_lossy(),
            rixs_path.to_string_lossy()
        );

        Ok(DispatchOutcome::Processed {
            n_events: merged.events.len(),
            failures: merged.failures,
            scan_path,
            rixs_path,
        })
    }
}
