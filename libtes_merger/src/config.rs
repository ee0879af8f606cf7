use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::ConfigError;
use super::scan::{AxisSpec, BinAxis};

const DEFAULT_MAX_CHANNELS: usize = 400;

/// Structure representing the application configuration. Contains pathing, the runs to handle
/// and the binning of the outputs.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub catalog_path: PathBuf,
    pub output_path: PathBuf,
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    pub runs: Vec<String>,
    pub scan_axis: AxisSpec,
    #[serde(default = "default_emission_axis")]
    pub emission_axis: AxisSpec,
}

fn default_max_channels() -> usize {
    DEFAULT_MAX_CHANNELS
}

fn default_emission_axis() -> AxisSpec {
    AxisSpec::Uniform {
        min: 200.0,
        max: 1000.0,
        bins: 200,
    }
}

impl Default for Config {
    /// Generate a new Config object. Paths will be invalid and there are no runs
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("None"),
            output_path: PathBuf::from("None"),
            model_path: None,
            max_channels: DEFAULT_MAX_CHANNELS,
            runs: Vec::new(),
            scan_axis: AxisSpec::Uniform {
                min: 280.0,
                max: 300.0,
                bins: 100,
            },
            emission_axis: default_emission_axis(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Get the directory of run documents
    pub fn get_catalog_directory(&self) -> Result<&Path, ConfigError> {
        if self.catalog_path.is_dir() {
            Ok(&self.catalog_path)
        } else {
            Err(ConfigError::BadFilePath(self.catalog_path.clone()))
        }
    }

    /// Get the directory the output files are written to
    pub fn get_output_directory(&self) -> Result<&Path, ConfigError> {
        if self.output_path.is_dir() {
            Ok(&self.output_path)
        } else {
            Err(ConfigError::BadFilePath(self.output_path.clone()))
        }
    }

    pub fn get_scan_axis(&self) -> Result<BinAxis, ConfigError> {
        Ok(self.scan_axis.to_axis()?)
    }

    pub fn get_emission_axis(&self) -> Result<BinAxis, ConfigError> {
        Ok(self.emission_axis.to_axis()?)
    }

    pub fn is_max_channels_valid(&self) -> bool {
        self.max_channels >= 1
    }

    /// Check everything needed before any run is handled
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_max_channels_valid() {
            return Err(ConfigError::BadMaxChannels);
        }
        self.get_catalog_directory()?;
        self.get_output_directory()?;
        self.get_scan_axis()?;
        self.get_emission_axis()?;
        if let Some(model) = &self.model_path {
            if !model.exists() {
                return Err(ConfigError::BadFilePath(model.clone()));
            }
        }
        Ok(())
    }
}
