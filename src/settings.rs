//! Key-value settings store backed by a small JSON file.
//!
//! Keys are written as `section.name` (for example `paths.blender_path`).
//! Values are kept as strings so that anything written can be read back
//! verbatim; typed access parses on the way out.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

type Sections = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings file not found: {0}")]
    NotFound(PathBuf),
    #[error("setting `{0}` is not set")]
    Missing(String),
    #[error("setting `{key}` has invalid value `{value}`")]
    Invalid { key: String, value: String },
    #[error("setting key `{0}` must look like `section.name`")]
    BadKey(String),
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Settings {
    path: PathBuf,
    sections: Sections,
}

fn split_key(key: &str) -> Result<(&str, &str), SettingsError> {
    match key.split_once('.') {
        Some((section, name)) if !section.is_empty() && !name.is_empty() => Ok((section, name)),
        _ => Err(SettingsError::BadKey(key.to_string())),
    }
}

impl Settings {
    /// An empty store that will be written to `path` on save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sections: Sections::new(),
        }
    }

    /// Loads the store. A missing file is an error: the pipeline cannot run
    /// without its paths and API key.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Err(SettingsError::NotFound(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        let raw: BTreeMap<String, BTreeMap<String, Value>> = serde_json::from_str(&contents)
            .map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        // Hand-edited files may use JSON numbers or booleans
        let sections = raw
            .into_iter()
            .map(|(section, entries)| {
                let entries = entries
                    .into_iter()
                    .map(|(name, value)| {
                        let value = match value {
                            Value::String(s) => s,
                            Value::Null => String::new(),
                            other => other.to_string(),
                        };
                        (name, value)
                    })
                    .collect();
                (section, entries)
            })
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            sections,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the store back to disk through a temporary file and a rename.
    pub fn save(&self) -> Result<(), SettingsError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let json = serde_json::to_string_pretty(&self.sections).map_err(|source| {
            SettingsError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path).map_err(|e| SettingsError::Io(e.error))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let (section, name) = split_key(key).ok()?;
        self.sections
            .get(section)
            .and_then(|entries| entries.get(name))
            .map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), SettingsError> {
        let (section, name) = split_key(key)?;
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(name.to_string(), value.into());
        Ok(())
    }

    /// A value that must be present and non-empty.
    pub fn require(&self, key: &str) -> Result<&str, SettingsError> {
        match self.get(key) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(SettingsError::Missing(key.to_string())),
        }
    }

    /// Parses `key` when it is set, falling back to `default` when it is absent or blank.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, SettingsError> {
        match self.get(key).map(str::trim) {
            None | Some("") => Ok(default),
            Some(value) => value.parse().map_err(|_| SettingsError::Invalid {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    /// All entries as `(section.name, value)` pairs, sorted.
    pub fn entries(&self) -> Vec<(String, &str)> {
        self.sections
            .iter()
            .flat_map(|(section, entries)| {
                entries
                    .iter()
                    .map(move |(name, value)| (format!("{section}.{name}"), value.as_str()))
            })
            .collect()
    }
}
