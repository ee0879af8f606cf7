//! # tes_merger
//!
//! tes_merger is the run processing pipeline for the transition-edge sensor (TES)
//! microcalorimeter spectrometer, written in Rust. It takes the per-channel pulse data
//! written by the TES DAQ, calibrates each channel against known emission lines, merges the
//! calibrated events of all channels into one time-ordered stream, and bins that stream
//! against the beamline's scan variable. The results are written as HDF5 files.
//!
//! ## Installation
//!
//! The only method of install is from source.
//!
//! ### HDF5
//!
//! The HDF5 library is built from source and linked statically, so no system installation
//! of HDF5 is needed. A C compiler and CMake must be available.
//!
//! ### Building & Install
//!
//! To build and install the CLI use `cargo install --path ./tes_merger_cli` from the top
//! level tes_merger repository. To use the CLI see the `tes_merger_cli` README.
//!
//! ## How runs are handled
//!
//! Runs are handled one at a time, in the order given in the configuration. Each run is
//! looked up in the run catalog and classified by its declared scan type:
//!
//! - `calibration`: the channels of the run are calibrated on the run's TES state. Each
//! channel is drift corrected against its pretrigger mean and then against its filter phase,
//! and the corrected filtered value is matched to the run's calibration lines. Channels that
//! fail are marked bad and never used again. The new calibration replaces the previous one.
//! A calibration run in which no channel could be calibrated leaves the previous calibration
//! in place.
//! - any other non-empty type: a data run. If a calibration is available, the calibrated
//! events of the run's TES state are merged across channels and binned. Otherwise the run is
//! skipped.
//! - empty: the run is skipped.
//!
//! If the calibration run names a pulse model, the 5-lag filtered value (`filtValue5Lag`)
//! is used in place of `filtValue`.
//!
//! ## Configuration
//!
//! ```yml
//! catalog_path: /data/20240507/catalog
//! output_path: /data/20240507/processed
//! model_path: null
//! max_channels: 400
//! runs: ['1201', '1202', '1203']
//! scan_axis:
//!   min: 280.0
//!   max: 300.0
//!   bins: 100
//! emission_axis:
//!   min: 200.0
//!   max: 1000.0
//!   bins: 200
//! ```
//!
//! An axis is either `min`, `max`, `bins` or a list of `edges`. The `model_path` is used for
//! calibration runs which don't name a pulse model of their own.
//!
//! ## Run catalog
//!
//! The catalog is a directory holding one `<run id>.yml` document per run. Only runs with an
//! `exit_status` are processed. Relative paths are taken relative to the catalog directory.
//!
//! ```yml
//! uid: 3f5e0c2a
//! plan_name: tes_scan
//! scan_id: 1202
//! scan_type: xas
//! tes_state: SCAN1
//! cal_lines: [CKAlpha, OKAlpha]
//! raw_data_path: 0000/20240507_run0000_chan1.h5
//! model_path: null
//! exit_status: success
//! primary:
//!   scan_variable: mono_energy
//!   time: [1715170400.0, 1715170401.0]
//!   values: [280.0, 280.2]
//!   normalization:
//!     name: i0
//!     values: [1.02, 1.01]
//! ```
//!
//! Channel files are named `<prefix>_chan<N>.h5`, and the TES states of the acquisition are
//! read from `<prefix>_experiment_state.txt` in the same directory.
//!
//! ## Output
//!
//! Every processed data run produces two files, with the run attributes
//! (version, run_uid, plan_name, scan_id, scan_variable, normalization_name, energy_attr,
//! fv_attr, calibration_run_uid) on the root of each:
//!
//! ```text
//! <plan_name>_<scan_id>.h5
//! |---- scan_axis(dset)
//! |---- intensity(dset)
//! |---- normalization(dset)
//! |---- counts(dset)
//! <plan_name>_rixs_<scan_id>.h5
//! |---- scan_axis(dset)
//! |---- emission_axis(dset)
//! |---- counts(dset)
//! ```
pub mod calibration;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod drift;
pub mod error;
pub mod experiment_state;
pub mod hdf_writer;
pub mod line_cal;
pub mod merger;
pub mod process;
pub mod pulse_model;
pub mod scan;
pub mod worker_status;

#[cfg(test)]
mod testing;
