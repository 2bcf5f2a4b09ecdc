use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

use rastercompiler_backend::ScanParams;

use crate::acquisition::DEFAULT_TIMEOUT_MARGIN;
use crate::error::ConfigError;
use crate::scanner::ScanRequest;

/// Trigger output settings. The mask is written inline as rows of 8-bit intensities and is
/// resized to the scan grid, so a coarse mask is enough to gate whole regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub chan: String,
    pub high_voltage: f64,
    pub mask: Vec<Vec<u8>>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            chan: String::from("ao2"),
            high_voltage: 5.0,
            mask: vec![vec![255]],
        }
    }
}

impl TriggerConfig {
    /// The mask as a 2D array. Rows of unequal length are rejected.
    pub fn mask_array(&self) -> Result<Array2<u8>, ConfigError> {
        let rows = self.mask.len();
        let cols = self.mask.first().map_or(0, Vec::len);
        if let Some(row) = self.mask.iter().position(|r| r.len() != cols) {
            return Err(ConfigError::Invalid(format!(
                "trigger mask row {row} has {} values, row 0 has {cols}",
                self.mask[row].len()
            )));
        }
        let flat: Vec<u8> = self.mask.iter().flatten().copied().collect();
        Array2::from_shape_vec((rows, cols), flat).map_err(|err| ConfigError::Invalid(err.to_string()))
    }
}

/// Scan configuration read from YAML. Every field has a default, so files only need the
/// settings that differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Device name as shown in NI MAX, e.g. `Dev1`.
    pub device: String,
    pub ao_chans: Vec<String>,
    pub ai_chans: Vec<String>,
    pub geometry: ScanParams,
    pub timeout_margin: f64,
    pub trigger: Option<TriggerConfig>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            device: String::from("Dev1"),
            ao_chans: vec![String::from("ao0"), String::from("ao1")],
            ai_chans: vec![String::from("ai0")],
            geometry: ScanParams::default(),
            timeout_margin: DEFAULT_TIMEOUT_MARGIN,
            trigger: None,
        }
    }
}

impl ScanConfig {
    /// Read the configuration in a YAML file
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(config_path)?;
        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the default configuration to `config_path` as a starting point.
    pub fn write_template(config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(&Self::default())?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    pub fn to_request(&self) -> Result<ScanRequest, ConfigError> {
        if self.ao_chans.len() != 2 {
            return Err(ConfigError::Invalid(format!(
                "expected the x and y galvo channels, got {:?}",
                self.ao_chans
            )));
        }
        let mut request = ScanRequest {
            params: self.geometry,
            ao_chans: self.ao_chans.clone(),
            ai_chans: self.ai_chans.clone(),
            trigger: None,
            timeout_margin: self.timeout_margin,
        };
        if let Some(trigger) = &self.trigger {
            request = request.with_trigger(&trigger.chan, trigger.mask_array()?, trigger.high_voltage);
        }
        Ok(request)
    }
}
