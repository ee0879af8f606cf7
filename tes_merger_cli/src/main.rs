//! # tes_merger_cli
//!
//! Part of the tes_merger crate family.
//!
//! This is the application to process TES runs from the command line.
//!
//! ## Install
//!
//! Use `cargo install --path ./tes_merger_cli`
//!
//! ## Use
//!
//! Make a template configuration file
//!
//! ```bash
//! tes_merger_cli -p config.yml new
//! ```
//!
//! fill it out, then process the configured runs
//!
//! ```bash
//! tes_merger_cli -p config.yml
//! ```
//!
//! Progress is shown on the terminal and the full log is written to `tes_merger.log`.
use clap::{Arg, Command};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use libtes_merger::config::Config;
use libtes_merger::process::process_runs;
use libtes_merger::worker_status::RunStatus;

const LOG_FILE: &str = "./tes_merger.log";

fn make_template_config(path: &Path) {
    match Config::default().write_config_file(path) {
        Ok(()) => spdlog::info!("Done."),
        Err(e) => spdlog::error!("Could not write template config: {e}"),
    }
}

/// Keep the terminal output and add a log file
fn setup_logging() -> Result<(), spdlog::Error> {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from(LOG_FILE))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()?,
    );
    let logger = spdlog::default_logger().fork_with(|new| {
        new.sinks_mut().push(file_sink);
        new.set_flush_level_filter(spdlog::LevelFilter::All);
        Ok(())
    })?;
    spdlog::set_default_logger(logger);
    Ok(())
}

fn main() {
    // Create a cli
    let matches = Command::new("tes_merger_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    // Initialize feedback
    if let Err(e) = setup_logging() {
        spdlog::error!("Could not create log file {LOG_FILE}: {e}");
    }

    // Parse the cli
    let Some(config_path) = matches.get_one::<String>("path").map(PathBuf::from) else {
        spdlog::error!("A configuration path is required");
        return;
    };

    if let Some(("new", _)) = matches.subcommand() {
        spdlog::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        return;
    }

    // Load our config
    spdlog::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };
    spdlog::info!("Config successfully loaded.");
    spdlog::info!("Catalog Path: {}", config.catalog_path.to_string_lossy());
    spdlog::info!("Output Path: {}", config.output_path.to_string_lossy());
    match &config.model_path {
        Some(path) => spdlog::info!("Default Pulse Model: {}", path.to_string_lossy()),
        None => spdlog::info!("Default Pulse Model: None"),
    }
    spdlog::info!("Max Channels: {}", config.max_channels);
    spdlog::info!("Number of Runs: {}", config.runs.len());

    // Setup the progress bar
    let pb = ProgressBar::new(config.runs.len() as u64);
    if let Ok(style) = ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan} {pos}/{len} {msg}") {
        pb.set_style(style);
    }

    // Spawn the task!
    let (tx, rx) = mpsc::channel::<RunStatus>();
    let handle = std::thread::spawn(move || process_runs(&config, &tx));

    // The channel closes when the worker is done
    for status in rx.iter() {
        pb.set_position(status.run_index as u64 + 1);
        pb.set_message(status.run_id);
    }
    pb.finish();

    match handle.join() {
        Ok(Ok(summary)) => {
            if summary.failed > 0 {
                spdlog::warn!(
                    "{} runs failed, check {} for details",
                    summary.failed,
                    LOG_FILE
                );
            }
            spdlog::info!("Successfully processed runs!");
        }
        Ok(Err(e)) => spdlog::error!("Processing failed with error: {e}"),
        Err(_) => spdlog::error!("Failed to join processing task!"),
    }

    spdlog::info!("Done.");
}
