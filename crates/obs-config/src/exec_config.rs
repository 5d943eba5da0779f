//! Executor configuration schema

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_yaml;
use indexmap::IndexMap;
use obs_core::{DeviceKind, DeviceValue, EquPosition, Target};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

/// Top-level executor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecConfig {
    pub observatory: ObservatoryConfig,
    /// Devices by connection name, in configuration order
    pub devices: IndexMap<String, DeviceConfig>,
    /// Targets observed in order
    pub targets: Vec<TargetConfig>,
    pub astrometry: AstrometryConfig,
}

/// Site-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObservatoryConfig {
    /// Seconds per degree of telescope slew
    pub telescope_speed: f64,
    /// Ask devices to report script ends
    pub call_script_ends: bool,
    /// Seconds between idle ticks
    pub idle_interval: f64,
    /// Speed-up of simulated devices; 10 runs a 10 s exposure in 1 s
    pub simulation_speed: f64,
}

impl Default for ObservatoryConfig {
    fn default() -> Self {
        Self {
            telescope_speed: 1.0,
            call_script_ends: false,
            idle_interval: 1.0,
            simulation_speed: 1.0,
        }
    }
}

/// One device connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    /// Seconds to read out an image
    pub readout_time: f64,
    /// Seconds to move the filter wheel
    pub filter_movement: f64,
    /// Initial device values
    pub values: IndexMap<String, DeviceValue>,
}

/// A target with its per-device scripts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub id: i32,
    #[serde(default)]
    pub obs_id: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ra: Option<f64>,
    #[serde(default)]
    pub dec: Option<f64>,
    /// Shared acquisition id, defaults to `id`
    #[serde(default)]
    pub obs_target_id: Option<i32>,
    #[serde(default)]
    pub scripts: IndexMap<String, String>,
}

impl TargetConfig {
    /// Build the runtime target record
    pub fn to_target(&self) -> Target {
        let mut target = Target::new(self.id, self.obs_id, self.name.clone())
            .with_obs_target_id(self.obs_target_id.unwrap_or(self.id));
        if let (Some(ra), Some(dec)) = (self.ra, self.dec) {
            target = target.with_position(EquPosition::new(ra, dec));
        }
        for (device, script) in &self.scripts {
            target = target.with_script(device.clone(), script.clone());
        }
        target
    }
}

/// Settings of the simulated astrometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AstrometryConfig {
    /// Reported pointing error in degrees
    pub precision: f64,
    /// Fail every n-th solve; 0 never fails
    pub fail_every: u32,
}

impl Default for AstrometryConfig {
    fn default() -> Self {
        Self {
            precision: 0.01,
            fail_every: 0,
        }
    }
}

impl ExecConfig {
    /// Load the configuration from `file` inside `config_dir`
    pub fn load(config_dir: impl Into<PathBuf>, file: &str) -> ConfigResult<Self> {
        let value = load_yaml(config_dir, file)?;
        Self::from_yaml(&value)
    }

    /// Deserialize and validate an already loaded document
    pub fn from_yaml(value: &serde_yaml::Value) -> ConfigResult<Self> {
        let config: ExecConfig =
            serde_yaml::from_value(value.clone()).map_err(|e| ConfigError::InvalidValue {
                key: "exec".to_string(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        debug!(
            devices = config.devices.len(),
            targets = config.targets.len(),
            "Loaded executor configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        for (key, value) in [
            ("observatory.idle_interval", self.observatory.idle_interval),
            ("observatory.simulation_speed", self.observatory.simulation_speed),
        ] {
            if value <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }
        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert((target.id, target.obs_id)) {
                return Err(ConfigError::InvalidValue {
                    key: format!("targets.{}", target.id),
                    reason: format!("duplicate target {} in observation {}", target.id, target.obs_id),
                });
            }
            if let Some(device) = target
                .scripts
                .keys()
                .find(|d| !self.devices.contains_key(d.as_str()))
            {
                return Err(ConfigError::InvalidValue {
                    key: format!("targets.{}.scripts", target.id),
                    reason: format!("unknown device '{}'", device),
                });
            }
        }
        Ok(())
    }

    /// Targets as runtime records, in configuration order
    pub fn build_targets(&self) -> Vec<Target> {
        self.targets.iter().map(TargetConfig::to_target).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ConfigResult<ExecConfig> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        ExecConfig::from_yaml(&value)
    }

    #[test]
    fn test_defaults() {
        let config = parse("{}").unwrap();
        assert_eq!(config.observatory.telescope_speed, 1.0);
        assert!(config.devices.is_empty());
        assert_eq!(config.astrometry.fail_every, 0);
    }

    #[test]
    fn test_devices_keep_order() {
        let config = parse(
            "devices:\n  C1:\n    kind: camera\n  C0:\n    kind: camera\n    readout_time: 4\n    values:\n      exposure: 10\n      filter: R\n",
        )
        .unwrap();
        let names: Vec<_> = config.devices.keys().cloned().collect();
        assert_eq!(names, vec!["C1", "C0"]);
        let c0 = &config.devices["C0"];
        assert_eq!(c0.kind, DeviceKind::Camera);
        assert_eq!(c0.readout_time, 4.0);
        assert_eq!(c0.values["filter"], DeviceValue::from("R"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = parse("observatory:\n  telescope_sped: 2\n");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_target_conversion() {
        let config = parse(
            "devices:\n  C0: {kind: camera}\ntargets:\n  - id: 5\n    obs_id: 50\n    name: M31\n    ra: 10.68\n    dec: 41.27\n    scripts:\n      C0: E 10\n",
        )
        .unwrap();
        let target = config.build_targets().remove(0);
        assert_eq!(target.obs_target_id, 5);
        assert!(target.position.is_some());
        assert_eq!(target.script_fragments("C0").unwrap(), ["E 10".to_string()]);
    }

    #[test]
    fn test_script_for_unknown_device() {
        let result = parse("targets:\n  - id: 1\n    scripts:\n      C9: E 1\n");
        assert!(matches!(result, Err(ConfigError::InvalidValue { key, .. }) if key == "targets.1.scripts"));
    }
}
