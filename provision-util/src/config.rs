//! Application settings.
//!
//! Settings are read from `appsettings.json` in the configuration directory
//! and overlaid with `appsettings.<environment>.json` when that file exists.
//! Section and key names are matched ignoring ASCII case, so
//! `ConnectionStrings:Dps` and `connectionStrings:dps` refer to the same
//! value.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub const SETTINGS_FILE: &str = "appsettings.json";

/// File name prefixes tried in order, the second one is the `appSettings`
/// spelling found in older deployments
const SETTINGS_PREFIXES: [&str; 2] = ["appsettings", "appSettings"];

const CONNECTION_STRINGS: &str = "ConnectionStrings";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings file {0} does not exist")]
    NotFound(PathBuf),

    #[error("failed to read settings file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("settings file {0} must contain a JSON object")]
    NotAnObject(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    values: Map<String, Value>,
}

impl Settings {
    /// Load the base settings file from `dir`, overlaid with the settings
    /// for `environment` if given and present.
    pub fn load(dir: &Path, environment: Option<&str>) -> Result<Self, ConfigError> {
        let mut values =
            read_first(dir, "json")?.ok_or_else(|| ConfigError::NotFound(dir.join(SETTINGS_FILE)))?;

        if let Some(environment) = environment.filter(|e| !e.trim().is_empty()) {
            let suffix = format!("{}.json", environment.trim());
            if let Some(overrides) = read_first(dir, &suffix)? {
                merge(&mut values, overrides);
            }
        }

        Ok(Self { values })
    }

    /// Look up a value by its `:` separated path, e.g. `ConnectionStrings:Dps`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut segments = key.split(':');
        let first = segments.next()?;
        segments.try_fold(get_ignore_case(&self.values, first)?, |value, segment| {
            value
                .as_object()
                .and_then(|map| get_ignore_case(map, segment))
        })
    }

    /// The connection string stored under `ConnectionStrings:<name>`.
    ///
    /// Blank values are reported as missing.
    pub fn connection_string(&self, name: &str) -> Option<&str> {
        self.get(&format!("{CONNECTION_STRINGS}:{name}"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl From<Map<String, Value>> for Settings {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

/// Read the first existing `<prefix>.<suffix>` settings file in `dir`.
fn read_first(dir: &Path, suffix: &str) -> Result<Option<Map<String, Value>>, ConfigError> {
    for prefix in SETTINGS_PREFIXES {
        let path = dir.join(format!("{prefix}.{suffix}"));
        if let Some(values) = read_object(&path)? {
            debug!("loaded settings from {}", path.display());
            return Ok(Some(values));
        }
    }
    Ok(None)
}

fn read_object(path: &Path) -> Result<Option<Map<String, Value>>, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    match serde_json::from_str(&contents) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err(ConfigError::NotAnObject(path.to_path_buf())),
        Err(source) => Err(ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn get_ignore_case<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

/// Overlay `overrides` on `base`. Objects are merged recursively, any other
/// value replaces the one in `base`.
fn merge(base: &mut Map<String, Value>, overrides: Map<String, Value>) {
    for (key, value) in overrides {
        let existing = base
            .keys()
            .find(|k| k.eq_ignore_ascii_case(&key))
            .cloned();

        match (existing, value) {
            (Some(existing), Value::Object(overrides)) => {
                if let Some(Value::Object(nested)) = base.get_mut(&existing) {
                    merge(nested, overrides);
                } else {
                    base.remove(&existing);
                    base.insert(key, Value::Object(overrides));
                }
            }
            (Some(existing), value) => {
                base.remove(&existing);
                base.insert(key, value);
            }
            (None, value) => {
                base.insert(key, value);
            }
        }
    }
}
