//! YAML loader resolving `!include` and `!env_var` tags

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::value::TaggedValue;
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// YAML loader with include and environment substitution support
pub struct YamlLoader {
    /// Base directory for relative paths
    config_dir: PathBuf,
    /// Files currently being loaded, innermost last
    include_stack: Vec<PathBuf>,
}

impl YamlLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            include_stack: Vec::new(),
        }
    }

    /// Load and process a YAML file
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.resolve_path(path.as_ref());
        debug!("Loading YAML file: {:?}", path);

        if self.include_stack.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::ReadFile {
            path: path.clone(),
            source: e,
        })?;

        self.include_stack.push(path.clone());
        let result = self.load_string(&content, &path);
        self.include_stack.pop();

        result
    }

    /// Load and process YAML from a string
    pub fn load_string(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source: e,
        })?;

        self.process_value(value, source_path)
    }

    fn process_value(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.process_tagged(*tagged, source_path),
            Value::Mapping(map) => {
                let mut result = serde_yaml::Mapping::with_capacity(map.len());
                for (k, v) in map {
                    result.insert(k, self.process_value(v, source_path)?);
                }
                Ok(Value::Mapping(result))
            }
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|v| self.process_value(v, source_path))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            _ => Ok(value),
        }
    }

    fn process_tagged(&mut self, tagged: TaggedValue, source_path: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!("Processing tag '{}'", tag);

        match tag.as_str() {
            "!include" => {
                let include_path = self.tag_argument(&tag, &tagged.value)?;
                let base_dir = source_path.parent().unwrap_or(&self.config_dir);
                let resolved = if Path::new(&include_path).is_absolute() {
                    PathBuf::from(&include_path)
                } else {
                    base_dir.join(&include_path)
                };
                debug!("Including file: {:?}", resolved);
                self.load_file(resolved)
            }
            "!env_var" => {
                let var = self.tag_argument(&tag, &tagged.value)?;
                let value = std::env::var(&var)
                    .map_err(|_| ConfigError::EnvVarNotFound { var: var.clone() })?;
                debug!("Substituted env var: {}", var);
                // Numbers in the environment stay numbers in the document
                Ok(serde_yaml::from_str::<Value>(&value).unwrap_or(Value::String(value)))
            }
            _ => Err(ConfigError::InvalidValue {
                key: tag,
                reason: "unsupported tag".to_string(),
            }),
        }
    }

    fn tag_argument(&self, tag: &str, value: &Value) -> ConfigResult<String> {
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Err(ConfigError::InvalidIncludePath {
                path: format!("{:?}", other),
                reason: format!("{} expects a string", tag),
            }),
        }
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

/// Load a YAML file with tag processing
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir).load_file(file)
}

/// Load a YAML string with tag processing
pub fn load_yaml_string(
    config_dir: impl Into<PathBuf>,
    content: &str,
    source_name: &str,
) -> ConfigResult<Value> {
    let config_dir = config_dir.into();
    let source = config_dir.join(source_name);
    YamlLoader::new(config_dir).load_string(content, &source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut file = fs::File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_include_relative_to_including_file() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "targets/m31.yaml", "id: 31\nname: M31\n");
        write_file(dir.path(), "targets/all.yaml", "- !include m31.yaml\n");
        write_file(dir.path(), "exec.yaml", "targets: !include targets/all.yaml\n");

        let value = load_yaml(dir.path(), "exec.yaml").unwrap();
        let targets = value.get("targets").unwrap().as_sequence().unwrap();
        assert_eq!(targets[0].get("name").unwrap().as_str(), Some("M31"));
    }

    #[test]
    fn test_circular_include() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.yaml", "b: !include b.yaml\n");
        write_file(dir.path(), "b.yaml", "a: !include a.yaml\n");

        let result = load_yaml(dir.path(), "a.yaml");
        assert!(matches!(result, Err(ConfigError::CircularInclude { .. })));
    }

    #[test]
    fn test_env_var_keeps_numbers() {
        std::env::set_var("OBS_CONFIG_TEST_SPEED", "2.5");
        let dir = TempDir::new().unwrap();
        let value = load_yaml_string(
            dir.path(),
            "speed: !env_var OBS_CONFIG_TEST_SPEED\n",
            "inline.yaml",
        )
        .unwrap();
        assert_eq!(value.get("speed").unwrap().as_f64(), Some(2.5));
    }

    #[test]
    fn test_missing_env_var() {
        let dir = TempDir::new().unwrap();
        let result = load_yaml_string(
            dir.path(),
            "x: !env_var OBS_CONFIG_TEST_MISSING_VAR\n",
            "inline.yaml",
        );
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound { .. })));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let dir = TempDir::new().unwrap();
        let result = load_yaml_string(dir.path(), "x: !secret key\n", "inline.yaml");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
