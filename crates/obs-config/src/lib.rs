//! YAML configuration loading for the observation sequencer
//!
//! The executor reads one YAML document describing the observatory, its
//! devices and the targets to observe. Two custom tags are resolved while
//! loading:
//!
//! - `!include path` - Include another YAML file (relative to the including file)
//! - `!env_var VAR` - Environment variable substitution
//!
//! # Example
//!
//! ```ignore
//! use obs_config::ExecConfig;
//!
//! let config = ExecConfig::load("/etc/obs", "exec.yaml")?;
//! for (name, device) in &config.devices {
//!     println!("{name}: readout {}s", device.readout_time);
//! }
//! ```

mod error;
mod exec_config;
mod loader;

pub use error::{ConfigError, ConfigResult};
pub use exec_config::{
    AstrometryConfig, DeviceConfig, ExecConfig, ObservatoryConfig, TargetConfig,
};
pub use loader::{load_yaml, load_yaml_string, YamlLoader};

// Re-export serde_yaml::Value for convenience
pub use serde_yaml::Value;
