//! Client configuration.
//!
//! Values come from `NIMBUS_*` environment variables, optionally seeded from a
//! `.env` file, and fall back to defaults.

use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;

const DEFAULT_CLASS_VAR: &str = "NIMBUS_DEFAULT_CLASS";
const FETCH_WHEN_SAVE_VAR: &str = "NIMBUS_FETCH_WHEN_SAVE";
const SAVE_DESCENDANTS_VAR: &str = "NIMBUS_SAVE_DESCENDANTS";

/// Class used for payloads that carry no class name.
pub const DEFAULT_CLASS_NAME: &str = "_Object";

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a boolean, got '{value}'")]
    InvalidFlag { var: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Class name assumed when a payload has none
    pub default_class_name: String,
    /// Ask the backend to return the full record after a save
    pub fetch_when_save: bool,
    /// Persist pending descendants before their parent
    pub save_descendants: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_class_name: DEFAULT_CLASS_NAME.to_string(),
            fetch_when_save: false,
            save_descendants: true,
        }
    }
}

impl Config {
    /// Load a `.env` file if present, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let default_class_name = match lookup(DEFAULT_CLASS_VAR) {
            Some(name) if name.trim().is_empty() => return Err(ConfigError::Empty(DEFAULT_CLASS_VAR)),
            Some(name) => name.trim().to_string(),
            None => defaults.default_class_name,
        };

        Ok(Self {
            default_class_name,
            fetch_when_save: flag(&lookup, FETCH_WHEN_SAVE_VAR, defaults.fetch_when_save)?,
            save_descendants: flag(&lookup, SAVE_DESCENDANTS_VAR, defaults.save_descendants)?,
        })
    }
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag { var, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.default_class_name, "_Object");
        assert!(!config.fetch_when_save);
        assert!(config.save_descendants);
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("NIMBUS_DEFAULT_CLASS", "Todo"),
            ("NIMBUS_FETCH_WHEN_SAVE", "TRUE"),
            ("NIMBUS_SAVE_DESCENDANTS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.default_class_name, "Todo");
        assert!(config.fetch_when_save);
        assert!(!config.save_descendants);
    }

    #[test]
    fn rejects_bad_values() {
        let err = Config::from_lookup(lookup(&[("NIMBUS_FETCH_WHEN_SAVE", "maybe")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidFlag {
                var: "NIMBUS_FETCH_WHEN_SAVE",
                value: "maybe".into()
            }
        );

        let err = Config::from_lookup(lookup(&[("NIMBUS_DEFAULT_CLASS", "  ")])).unwrap_err();
        assert_eq!(err, ConfigError::Empty("NIMBUS_DEFAULT_CLASS"));
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: Config = serde_json::from_str(r#"{"fetchWhenSave": true}"#).unwrap();
        assert!(config.fetch_when_save);
        assert_eq!(config.default_class_name, "_Object");
    }
}
