//! Metrics sink settings read from the `Metrics` block of a workload.
//!
//! Only the format and output path are resolved here; recording and
//! formatting live with whatever consumes [`MetricsConfig`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::config::ConfigNode;
use crate::core::errors::{LoadcastError, Result};

pub const DEFAULT_METRICS_PATH: &str = "build/WorkloadOutput/CedarMetrics";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricsFormat {
    Ftdc,
    Csv,
    CedarCsv,
    CsvFtdc,
}

impl MetricsFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ftdc => "ftdc",
            Self::Csv => "csv",
            Self::CedarCsv => "cedar-csv",
            Self::CsvFtdc => "csv-ftdc",
        }
    }

    pub fn is_deprecated(&self) -> bool {
        *self != Self::Ftdc
    }
}

impl Default for MetricsFormat {
    fn default() -> Self {
        Self::Ftdc
    }
}

impl fmt::Display for MetricsFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricsFormat {
    type Err = LoadcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "ftdc" => Ok(Self::Ftdc),
            "csv" => Ok(Self::Csv),
            "cedar-csv" => Ok(Self::CedarCsv),
            "csv-ftdc" => Ok(Self::CsvFtdc),
            other => Err(LoadcastError::configuration_field(
                format!("Unknown metrics format '{}'", other),
                "Metrics.Format",
            )),
        }
    }
}

/// Where and how metrics for a run are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub format: MetricsFormat,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            format: MetricsFormat::default(),
            path: DEFAULT_METRICS_PATH.to_string(),
        }
    }
}

impl MetricsConfig {
    /// Resolves `Metrics.Format` and `Metrics.Path`.
    ///
    /// A bad format never fails the run: it is logged and replaced with ftdc.
    pub fn from_node(metrics: &ConfigNode) -> Result<Self> {
        let format = match metrics.get("Format").maybe::<String>() {
            Ok(Some(raw)) => match raw.parse::<MetricsFormat>() {
                Ok(format) => format,
                Err(e) => {
                    warn!("{}; falling back to ftdc", e);
                    MetricsFormat::Ftdc
                }
            },
            Ok(None) => MetricsFormat::Ftdc,
            Err(e) => {
                warn!("Unreadable Metrics.Format ({}); falling back to ftdc", e);
                MetricsFormat::Ftdc
            }
        };

        if format.is_deprecated() {
            info!("Metrics format {} is deprecated in favor of ftdc.", format);
        }

        let path = metrics
            .get("Path")
            .maybe::<String>()?
            .unwrap_or_else(|| DEFAULT_METRICS_PATH.to_string());

        Ok(Self { format, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(yaml: &str) -> MetricsConfig {
        let root = ConfigNode::from_yaml_str(yaml).unwrap();
        MetricsConfig::from_node(&root.get("Metrics")).unwrap()
    }

    #[test]
    fn test_defaults() {
        assert_eq!(metrics("SchemaVersion: 2018-07-01"), MetricsConfig::default());
    }

    #[test]
    fn test_explicit_values() {
        let config = metrics("Metrics:\n  Format: csv\n  Path: /tmp/out\n");
        assert_eq!(config.format, MetricsFormat::Csv);
        assert_eq!(config.path, "/tmp/out");
        assert!(config.format.is_deprecated());
    }

    #[test]
    fn test_serde_uses_workload_spellings() {
        for format in [
            MetricsFormat::Ftdc,
            MetricsFormat::Csv,
            MetricsFormat::CedarCsv,
            MetricsFormat::CsvFtdc,
        ] {
            let parsed: MetricsFormat = serde_yaml::from_str(format.as_str()).unwrap();
            assert_eq!(parsed, format);
        }
        assert!(serde_yaml::from_str::<MetricsFormat>("CedarCsv").is_err());
    }

    #[test]
    fn test_unknown_format_is_not_fatal() {
        let config = metrics("Metrics:\n  Format: protobuf\n");
        assert_eq!(config.format, MetricsFormat::Ftdc);
    }
}
