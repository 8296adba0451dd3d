#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

//! `config.json` handling.
//!
//! Config is stored as JSON so external programs can manipulate it. It is a
//! flat string-keyed map of JSON primitives; typed getters enforce value
//! types and report violations as [`Error::InvalidConfig`]. Unknown keys are
//! preserved on save but otherwise ignored — each service picks out the
//! keys it recognizes when its configuration is (re)applied.

use std::fs;
use std::path::Path;

use peervod_core::{Error, Result};
use serde_json::{Map, Value};
use tracing::debug;

/// Name of the config file within the config directory.
pub const FILENAME: &str = "config.json";

/// Keys owned by the external FTP front end.
pub const FTP_KEYS: &[&str] = &["ftp_enabled", "ftp_bind_address", "ftp_port"];
/// Keys owned by the external HTTP front end.
pub const HTTP_KEYS: &[&str] = &["http_enabled", "http_bind_address", "http_port"];
/// Whether front ends may bind publicly.
pub const PUBLIC_ENABLE_KEY: &str = "public_enable";

/// A loaded configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    values: Map<String, Value>,
}

impl Config {
    /// An empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an existing JSON object.
    #[must_use]
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Load `config.json` from a config directory. A missing file yields an
    /// empty config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the file exists but cannot be
    /// read or is not a JSON object.
    pub fn from_dir(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(FILENAME);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, starting empty");
                return Ok(Self::new());
            }
            Err(err) => {
                return Err(Error::InvalidConfig(format!(
                    "reading {}: {err}",
                    path.display()
                )));
            }
        };
        let parsed: Value = serde_json::from_str(&text)
            .map_err(|err| Error::InvalidConfig(format!("parsing {}: {err}", path.display())))?;
        match parsed {
            Value::Object(values) => Ok(Self { values }),
            other => Err(Error::InvalidConfig(format!(
                "config root must be an object, got {other}"
            ))),
        }
    }

    /// Write `config.json` (pretty, stable key order) into a config
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the file cannot be written.
    pub fn write_dir(&self, config_dir: &Path) -> Result<()> {
        let path = config_dir.join(FILENAME);
        let text = serde_json::to_string_pretty(&Value::Object(self.values.clone()))
            .map_err(|err| Error::InvalidConfig(err.to_string()))?;
        fs::write(&path, text)
            .map_err(|err| Error::InvalidConfig(format!("writing {}: {err}", path.display())))
    }

    /// Raw value lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Insert or replace a value.
    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_owned(), value);
    }

    /// Insert a value only if the key is absent.
    pub fn set_default(&mut self, key: &str, value: Value) {
        self.values.entry(key.to_owned()).or_insert(value);
    }

    /// Iterate all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// A string value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the key holds a non-string.
    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::String(text)) => Ok(Some(text)),
            Some(other) => Err(type_error(key, other, "a string")),
        }
    }

    /// An integer value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the key holds a non-integer.
    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(value @ Value::Number(number)) => number
                .as_i64()
                .map(Some)
                .ok_or_else(|| type_error(key, value, "an integer")),
            Some(other) => Err(type_error(key, other, "an integer")),
        }
    }

    /// A boolean value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the key holds a non-boolean.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Bool(flag)) => Ok(Some(*flag)),
            Some(other) => Err(type_error(key, other, "a boolean")),
        }
    }

    /// A string value that must be present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the key is absent or ill-typed.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)?
            .ok_or_else(|| Error::InvalidConfig(format!("\"{key}\": missing")))
    }

    /// An integer value that must be present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the key is absent or ill-typed.
    pub fn require_int(&self, key: &str) -> Result<i64> {
        self.get_int(key)?
            .ok_or_else(|| Error::InvalidConfig(format!("\"{key}\": missing")))
    }
}

fn type_error(key: &str, value: &Value, wanted: &str) -> Error {
    Error::InvalidConfig(format!("\"{key}\": {value} is not {wanted}"))
}
