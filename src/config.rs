//! Workload configuration.
//!
//! Workloads are YAML documents. They are loaded once into a [`ConfigNode`]
//! tree and then read lazily: each component pulls out the keys it cares
//! about and converts them with serde. A node remembers its dotted path so
//! that configuration errors can name the offending key.

use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::coordinator::CoordinatorAddress;
use crate::core::errors::{LoadcastError, Result};
use crate::pool::{ClientPool, CommandObserver};

/// A (possibly absent) node in the workload configuration tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigNode {
    path: String,
    value: Option<Value>,
}

impl ConfigNode {
    /// Wraps an already-parsed YAML value as the root of a tree.
    pub fn from_value(value: Value) -> Self {
        Self {
            path: String::new(),
            value: Some(value),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Ok(Self::from_value(value))
    }

    /// Loads a workload definition from a YAML file
    pub fn from_yaml_file(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_path = file_path.as_ref();
        let mut file = File::open(file_path)
            .map_err(|e| LoadcastError::io(format!("open {}", file_path.display()), e))?;

        let mut yaml_content = String::new();
        file.read_to_string(&mut yaml_content)
            .map_err(|e| LoadcastError::io(format!("read {}", file_path.display()), e))?;

        Self::from_yaml_str(&yaml_content)
    }

    fn child(&self, segment: &str, value: Option<Value>) -> Self {
        let path = if self.path.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{}", self.path, segment)
        };
        Self { path, value }
    }

    /// Dotted path from the root, e.g. `Actors.0.Phases.2`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// True if the key was present at all (even if explicitly null).
    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, Some(Value::Null))
    }

    /// Looks up a mapping key. Missing keys give an absent node.
    pub fn get(&self, key: &str) -> ConfigNode {
        let value = match &self.value {
            Some(Value::Mapping(map)) => map.get(key).cloned(),
            _ => None,
        };
        self.child(key, value)
    }

    /// Looks up a sequence element. Out-of-range gives an absent node.
    pub fn index(&self, i: usize) -> ConfigNode {
        let value = match &self.value {
            Some(Value::Sequence(seq)) => seq.get(i).cloned(),
            _ => None,
        };
        self.child(&i.to_string(), value)
    }

    /// Children in declaration order. Sequences are keyed by index.
    pub fn entries(&self) -> Vec<(String, ConfigNode)> {
        match &self.value {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let key = i.to_string();
                    let node = self.child(&key, Some(v.clone()));
                    (key, node)
                })
                .collect(),
            Some(Value::Mapping(map)) => map
                .iter()
                .map(|(k, v)| {
                    let key = key_to_string(k);
                    let node = self.child(&key, Some(v.clone()));
                    (key, node)
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Converts a required key. Absent or null nodes are configuration errors.
    pub fn to<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.value {
            None | Some(Value::Null) => Err(LoadcastError::configuration_field(
                format!("Missing required key '{}'", self.path),
                self.path.clone(),
            )),
            Some(value) => self.convert(value),
        }
    }

    /// Converts an optional key. Absent or null nodes give `None`.
    pub fn maybe<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.value {
            None | Some(Value::Null) => Ok(None),
            Some(value) => self.convert(value).map(Some),
        }
    }

    fn convert<T: DeserializeOwned>(&self, value: &Value) -> Result<T> {
        serde_yaml::from_value(value.clone()).map_err(|e| {
            LoadcastError::configuration_field(
                format!("Bad value for '{}': {}", self.path, e),
                self.path.clone(),
            )
        })
    }
}

fn key_to_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Options for building an execution context that do not come from the
/// workload file itself.
#[derive(Clone)]
pub struct ContextOptions {
    /// Maximum number of unit contexts constructing actors at once
    pub max_parallel_construction: usize,
    /// Hand out client leases that never connect
    pub dry_run: bool,
    /// Overrides `ExternalPhaseCoordinator` from the workload
    pub coordinator: Option<CoordinatorAddress>,
    /// Called whenever a client lease reports a command starting
    pub command_observer: Option<CommandObserver>,
    /// Replaces the default URI-based pool manager
    pub client_pool: Option<Arc<dyn ClientPool>>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_parallel_construction: default_max_parallel_construction(),
            dry_run: false,
            coordinator: None,
            command_observer: None,
            client_pool: None,
        }
    }
}

fn default_max_parallel_construction() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .max(1)
}

impl ContextOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_construction == 0 {
            return Err(LoadcastError::configuration_field(
                "max_parallel_construction must be greater than 0",
                "max_parallel_construction",
            ));
        }
        Ok(())
    }

    pub fn with_max_parallel_construction(mut self, max: usize) -> Self {
        self.max_parallel_construction = max;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_coordinator(mut self, address: CoordinatorAddress) -> Self {
        self.coordinator = Some(address);
        self
    }

    pub fn with_command_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&crate::pool::CommandEvent) + Send + Sync + 'static,
    {
        self.command_observer = Some(Arc::new(observer));
        self
    }

    pub fn with_client_pool(mut self, pool: Arc<dyn ClientPool>) -> Self {
        self.client_pool = Some(pool);
        self
    }
}

impl fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptions")
            .field("max_parallel_construction", &self.max_parallel_construction)
            .field("dry_run", &self.dry_run)
            .field("coordinator", &self.coordinator)
            .field("command_observer", &self.command_observer.is_some())
            .field("client_pool", &self.client_pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const WORKLOAD: &str = r#"
SchemaVersion: 2018-07-01
RandomSeed: 42
Actors:
- Name: Inserter
  Type: Insert
  Phases:
  - Nop: true
  - {}
"#;

    #[test]
    fn test_navigation_and_paths() {
        let root = ConfigNode::from_yaml_str(WORKLOAD).unwrap();
        let phases = root.get("Actors").index(0).get("Phases");
        assert_eq!(phases.path(), "Actors.0.Phases");
        assert_eq!(phases.entries().len(), 2);

        let nop: Option<bool> = phases.index(0).get("Nop").maybe().unwrap();
        assert_eq!(nop, Some(true));
        assert_eq!(phases.index(1).get("Nop").maybe::<bool>().unwrap(), None);
    }

    #[test]
    fn test_required_and_optional_keys() {
        let root = ConfigNode::from_yaml_str(WORKLOAD).unwrap();
        assert_eq!(root.get("SchemaVersion").to::<String>().unwrap(), "2018-07-01");
        assert_eq!(root.get("RandomSeed").maybe::<u64>().unwrap(), Some(42));

        let err = root.get("Missing").to::<String>().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Missing"));

        let err = root.get("Actors").to::<u64>().unwrap_err();
        assert!(err.to_string().contains("Bad value for 'Actors'"));
    }

    #[test]
    fn test_null_is_distinct_from_absent() {
        let root = ConfigNode::from_yaml_str("Phases:\n- ~\n").unwrap();
        let first = root.get("Phases").index(0);
        assert!(first.exists());
        assert!(first.is_null());
        assert!(!root.get("Phases").index(3).exists());
    }

    #[test]
    fn test_mapping_entries_keep_order() {
        let root = ConfigNode::from_yaml_str("Actors:\n  b: 1\n  a: 2\n  c: 3\n").unwrap();
        let keys: Vec<String> = root.get("Actors").entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_options_validation() {
        assert!(ContextOptions::default().validate().is_ok());
        let err = ContextOptions::default()
            .with_max_parallel_construction(0)
            .validate()
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
