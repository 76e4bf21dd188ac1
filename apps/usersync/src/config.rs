//! Runner configuration loading and types.
//!
//! The YAML file carries the engine configuration at the top level plus two
//! runner-only sections: `connectors` and `logging`.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use usersync_engine::SyncConfig;

use crate::error::{CliError, CliResult};

/// Root runner configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub connectors: ConnectorsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(flatten)]
    pub sync: SyncConfig,
}

/// Connector declarations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectorsConfig {
    /// Directory connectors by name.
    #[serde(default)]
    pub directory: BTreeMap<String, ConnectorValue>,
    /// Dashboard connector.
    #[serde(default)]
    pub dashboard: Option<ConnectorValue>,
}

/// A connector configuration value as written in the file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConnectorValue {
    /// A mapping written in place.
    Inline(serde_json::Map<String, serde_json::Value>),
    /// Path of a YAML file holding a mapping, relative to the config file.
    FileReference(String),
    /// Several values merged in order; later keys override earlier ones.
    List(Vec<ConnectorValue>),
}

impl ConnectorValue {
    /// Resolve to one flat mapping.
    pub fn resolve(&self, base_dir: &Path) -> CliResult<serde_json::Map<String, serde_json::Value>> {
        match self {
            ConnectorValue::Inline(map) => Ok(map.clone()),
            ConnectorValue::FileReference(reference) => {
                let path = base_dir.join(reference);
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    CliError::Config(format!(
                        "Failed to read connector config {}: {e}",
                        path.display()
                    ))
                })?;
                let value: serde_json::Value = serde_yaml::from_str(&content).map_err(|e| {
                    CliError::Config(format!(
                        "Failed to parse connector config {}: {e}",
                        path.display()
                    ))
                })?;
                match value {
                    serde_json::Value::Object(map) => Ok(map),
                    _ => Err(CliError::Config(format!(
                        "Connector config {} is not a mapping",
                        path.display()
                    ))),
                }
            }
            ConnectorValue::List(values) => {
                let mut merged = serde_json::Map::new();
                for value in values {
                    merged.extend(value.resolve(base_dir)?);
                }
                Ok(merged)
            }
        }
    }
}

/// Settings of the file-backed connectors.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConnectorConfig {
    /// JSON file with the users.
    pub path: PathBuf,
    /// JSON-lines file that receives applied actions (dashboard only).
    #[serde(default)]
    pub journal: Option<PathBuf>,
}

impl FileConnectorConfig {
    /// Build from a resolved mapping; relative paths are taken from `base_dir`.
    pub fn from_resolved(
        name: &str,
        map: serde_json::Map<String, serde_json::Value>,
        base_dir: &Path,
    ) -> CliResult<Self> {
        let mut config: Self = serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| CliError::Config(format!("Connector '{name}': {e}")))?;
        config.path = base_dir.join(&config.path);
        config.journal = config.journal.map(|j| base_dir.join(j));
        Ok(config)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info,usersync_engine=info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CliResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CliError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(content: &str) -> CliResult<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| CliError::Config(format!("Failed to parse config: {e}")))?;
        config.sync.validate()?;
        if !matches!(config.logging.format.as_str(), "json" | "pretty") {
            return Err(CliError::Config(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                config.logging.format
            )));
        }
        Ok(config)
    }

    /// Get the configuration file path from environment or default.
    pub fn config_path() -> String {
        std::env::var("USERSYNC_CONFIG").unwrap_or_else(|_| "./usersync.yml".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config_with_connectors() {
        let yaml = r#"
accessor_organizations: [org1]
mappings:
  - directory_group: Marketing
    dashboard_groups: ["Acrobat", "org1::Group A"]
connectors:
  directory:
    ldap: { path: users.json }
  dashboard: { path: dashboard.json, journal: applied.jsonl }
logging:
  format: json
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.sync.mappings.len(), 1);
        assert_eq!(config.sync.accessor_organizations, vec!["org1"]);
        assert!(config.connectors.directory.contains_key("ldap"));
        assert!(config.connectors.dashboard.is_some());
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info,usersync_engine=info");
    }

    #[test]
    fn test_invalid_engine_section_is_rejected() {
        let yaml = "default_country_code: USA\n";
        let err = AppConfig::from_yaml(yaml).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_invalid_log_format_is_rejected() {
        let yaml = "logging:\n  format: xml\n";
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_connector_value_shapes() {
        let inline: ConnectorValue = serde_yaml::from_str("{ path: a.json }").unwrap();
        assert!(matches!(inline, ConnectorValue::Inline(_)));
        let file: ConnectorValue = serde_yaml::from_str("connector-ldap.yml").unwrap();
        assert_eq!(file, ConnectorValue::FileReference("connector-ldap.yml".to_string()));
        let list: ConnectorValue =
            serde_yaml::from_str("[connector-ldap.yml, { path: b.json }]").unwrap();
        assert!(matches!(list, ConnectorValue::List(ref v) if v.len() == 2));
    }

    #[test]
    fn test_resolve_merges_later_keys_over_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("base.yml")).unwrap();
        writeln!(file, "path: base.json\njournal: base.jsonl").unwrap();

        let value: ConnectorValue =
            serde_yaml::from_str("[base.yml, { path: override.json }]").unwrap();
        let resolved = value.resolve(dir.path()).unwrap();
        assert_eq!(resolved["path"], "override.json");
        assert_eq!(resolved["journal"], "base.jsonl");

        let config = FileConnectorConfig::from_resolved("ldap", resolved, dir.path()).unwrap();
        assert_eq!(config.path, dir.path().join("override.json"));
    }

    #[test]
    fn test_resolve_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let value = ConnectorValue::FileReference("missing.yml".to_string());
        let err = value.resolve(dir.path()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usersync.yml");
        std::fs::write(&path, "manage_groups: false\n").unwrap();
        let config = AppConfig::from_file(&path).unwrap();
        assert!(!config.sync.manage_groups);
    }
}
