use std::sync::mpsc::Sender;

use super::catalog::YamlCatalog;
use super::config::Config;
use super::dispatcher::{DispatchOutcome, RunDispatcher};
use super::error::ProcessorError;
use super::hdf_writer::ScanWriter;
use super::worker_status::RunStatus;

/// Tally of how the runs of a session were handled
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub calibrated: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ProcessSummary {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Calibrated { .. } => self.calibrated += 1,
            DispatchOutcome::Processed { .. } => self.processed += 1,
            DispatchOutcome::NoCalibration | DispatchOutcome::Unclassified => self.skipped += 1,
        }
    }
}

/// The main loop of tes_merger.
///
/// Handles the configured runs strictly in order. A run that fails is logged and counted,
/// and the loop moves on to the next run. Progress is sent over `tx` after every run.
pub fn process_runs(
    config: &Config,
    tx: &Sender<RunStatus>,
) -> Result<ProcessSummary, ProcessorError> {
    config.validate()?;
    let catalog = YamlCatalog::new(config.get_catalog_directory()?, config.max_channels);
    let writer = ScanWriter::new(config.get_output_directory()?)?;
    let mut dispatcher = RunDispatcher::new(
        catalog,
        writer,
        config.get_scan_axis()?,
        config.get_emission_axis()?,
        config.model_path.clone(),
    );

    let mut summary = ProcessSummary::default();
    let total = config.runs.len();
    for (idx, run_id) in config.runs.iter().enumerate() {
        spdlog::info!("Handling run {} ({}/{})...", run_id, idx + 1, total);
        match dispatcher.handle_run_id(run_id) {
            Ok(outcome) => {
                if let DispatchOutcome::Calibrated { failures, .. }
                | DispatchOutcome::Processed { failures, .. } = &outcome
                {
                    if !failures.is_empty() {
                        let dropped: Vec<u32> = failures.iter().map(|f| f.channel).collect();
                        spdlog::warn!("Run {} dropped channels {:?}", run_id, dropped);
                    }
                }
                summary.record(&outcome);
                spdlog::info!("Finished run {}.", run_id);
            }
            Err(e) => {
                spdlog::error!("Run {} failed: {}", run_id, e);
                summary.failed += 1;
            }
        }
        tx.send(RunStatus::new(
            (idx + 1) as f32 / total as f32,
            idx,
            run_id,
        ))?;
    }

    spdlog::info!(
        "Calibrated: {} Processed: {} Skipped: {} Failed: {}",
        summary.calibrated,
        summary.processed,
        summary.skipped,
        summary.failed
    );
    Ok(summary)
}
