//! Settings tree handed to each stage's `read_settings`.
//!
//! The tree is an in-memory YAML document: scalar options, vectors and nested
//! stage declarations all hang off string keys. A missing key is not an error;
//! stages fall back to their built-in defaults, so a configuration only names the
//! options it overrides.

use super::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde_yaml::Value;

/// Key naming the stage type inside a stage declaration node.
pub const TYPE_KEY: &str = "type";

/// One node of the configuration tree.
#[derive(Clone, Debug, Default)]
pub struct Config {
    value: Value,
}

impl Config {
    /// An empty node; every lookup misses.
    #[must_use]
    pub fn empty() -> Self {
        Self { value: Value::Null }
    }

    /// Wrap an already-parsed YAML value.
    #[must_use]
    pub const fn from_value(value: Value) -> Self {
        Self { value }
    }

    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for malformed YAML.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let value = serde_yaml::from_str(text)
            .map_err(|error| Error::InvalidParameter(format!("malformed configuration: {error}")))?;
        Ok(Self { value })
    }

    /// Read a typed value, `None` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] when the key exists but does not parse as
    /// `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.value.get(key) {
            None => Ok(None),
            Some(value) => serde_yaml::from_value(value.clone()).map(Some).map_err(|error| {
                Error::InvalidParameter(format!("option {key}: {error}"))
            }),
        }
    }

    /// Read a typed value, falling back to `default` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] when the key exists but does not parse as
    /// `T`.
    pub fn read_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Whether the key is present.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.value.get(key).is_some()
    }

    /// The child node under `key`, `None` when absent.
    #[must_use]
    pub fn child(&self, key: &str) -> Option<Self> {
        self.value.get(key).map(|value| Self { value: value.clone() })
    }

    /// The sequence of child nodes under `key`; empty when absent.
    #[must_use]
    pub fn children(&self, key: &str) -> Vec<Self> {
        match self.value.get(key) {
            Some(Value::Sequence(items)) => {
                items.iter().map(|value| Self { value: value.clone() }).collect()
            }
            _ => Vec::new(),
        }
    }

    /// The stage type name of a stage declaration node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] when the node carries no `type` key.
    pub fn stage_type(&self) -> Result<String> {
        self.get::<String>(TYPE_KEY)?
            .ok_or_else(|| Error::InvalidParameter("stage declaration without a type".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_vectors_and_defaults() {
        let config = Config::from_yaml_str(
            "GenericDistanceCut: 1.5\nLayersToStepBack: [3, 3]\nUseIsolatedHits: true\n",
        )
        .unwrap();

        assert_eq!(config.read_or("GenericDistanceCut", 1.0).unwrap(), 1.5);
        assert_eq!(config.read_or("MissingOption", 7_u32).unwrap(), 7);
        assert_eq!(
            config.get::<Vec<u32>>("LayersToStepBack").unwrap(),
            Some(vec![3, 3])
        );
        assert!(config.read_or("UseIsolatedHits", false).unwrap());
    }

    #[test]
    fn type_errors_are_loud() {
        let config = Config::from_yaml_str("GenericDistanceCut: fast\n").unwrap();
        assert!(config.read_or("GenericDistanceCut", 1.0).is_err());
    }

    #[test]
    fn stage_declarations() {
        let config = Config::from_yaml_str(
            "pipeline:\n  - type: ConeClustering\n    GenericDistanceCut: 0.8\n  - type: TopologicalAssociation\n",
        )
        .unwrap();

        let stages = config.children("pipeline");
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].stage_type().unwrap(), "ConeClustering");
        assert_eq!(stages[0].read_or("GenericDistanceCut", 1.0).unwrap(), 0.8);
        assert!(stages[1].stage_type().is_ok());
    }

    #[test]
    fn empty_config_misses_everything() {
        let config = Config::empty();
        assert!(!config.has("anything"));
        assert!(config.child("anything").is_none());
        assert!(config.children("anything").is_empty());
    }
}
