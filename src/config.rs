// ABOUTME: Declarative configuration of systems, sources and sinks
// ABOUTME: Loads a JSON or TOML document and validates it before any connection is made

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

use crate::error::BridgeError;
use crate::utils::{validate_connection_string, validate_identifier};

/// Timestamp column written by sinks when the target table has it.
pub const DEFAULT_TIMESTAMP_COLUMN: &str = "bridge_timestamp";

pub const DEFAULT_SCHEMA: &str = "public";

/// Root document: system id -> system definition.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(transparent)]
pub struct BridgeConfig {
    pub systems: BTreeMap<String, SystemConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SystemConfig {
    /// `postgresql://host:port/database`; credentials may be given separately.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bounds both connecting and waiting for a pooled connection.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub sinks: BTreeMap<String, SinkConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SourceConfig {
    /// Table to read; defaults to the source id. Ignored for query sources.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    /// Literal SQL; makes this a query source.
    #[serde(default)]
    pub query: Option<String>,
    /// Placeholder inside `query` replaced by the cursor parameter.
    #[serde(default)]
    pub since: Option<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub updated_column: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SinkConfig {
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    /// Empty means: use the table's declared primary key.
    #[serde(default, deserialize_with = "one_or_many")]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default = "default_timestamp_column")]
    pub timestamp: String,
    #[serde(default, alias = "truncate_table_on_first_run")]
    pub truncate_table_on_first_run: bool,
}

fn default_max_connections() -> usize {
    10
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_timestamp_column() -> String {
    DEFAULT_TIMESTAMP_COLUMN.to_string()
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(column) => vec![column],
        OneOrMany::Many(columns) => columns,
    })
}

impl SourceConfig {
    pub fn schema_name(&self) -> &str {
        self.schema.as_deref().unwrap_or(DEFAULT_SCHEMA)
    }

    pub fn table_name<'a>(&'a self, source_id: &'a str) -> &'a str {
        self.table.as_deref().unwrap_or(source_id)
    }

    fn validate(&self, source_id: &str) -> Result<()> {
        if self.primary_key.is_empty() {
            return Err(BridgeError::config(format!(
                "source '{}' must declare at least one primary-key column",
                source_id
            ))
            .into());
        }
        for column in &self.primary_key {
            validate_identifier(column)
                .with_context(|| format!("Invalid primary key in source '{}'", source_id))?;
        }
        if let Some(column) = &self.updated_column {
            validate_identifier(column)
                .with_context(|| format!("Invalid updated-column in source '{}'", source_id))?;
        }

        match &self.query {
            Some(query) => {
                if self.table.is_some() {
                    return Err(BridgeError::config(format!(
                        "source '{}' sets both 'table' and 'query'",
                        source_id
                    ))
                    .into());
                }
                if query.trim().is_empty() {
                    return Err(
                        BridgeError::config(format!("source '{}' has an empty query", source_id))
                            .into(),
                    );
                }
                if let Some(marker) = &self.since {
                    if marker.is_empty() || !query.contains(marker.as_str()) {
                        return Err(BridgeError::config(format!(
                            "since marker '{}' of source '{}' does not occur in its query",
                            marker, source_id
                        ))
                        .into());
                    }
                }
            }
            None => {
                if self.since.is_some() {
                    return Err(BridgeError::config(format!(
                        "source '{}' sets 'since' but is not a query source",
                        source_id
                    ))
                    .into());
                }
                validate_identifier(self.table_name(source_id))
                    .with_context(|| format!("Invalid table for source '{}'", source_id))?;
            }
        }
        Ok(())
    }
}

impl SinkConfig {
    pub fn schema_name(&self) -> &str {
        self.schema.as_deref().unwrap_or(DEFAULT_SCHEMA)
    }

    fn validate(&self, sink_id: &str) -> Result<()> {
        validate_identifier(&self.table)
            .with_context(|| format!("Invalid table for sink '{}'", sink_id))?;
        validate_identifier(self.schema_name())
            .with_context(|| format!("Invalid schema for sink '{}'", sink_id))?;
        validate_identifier(&self.timestamp)
            .with_context(|| format!("Invalid timestamp column for sink '{}'", sink_id))?;
        for column in &self.primary_key {
            validate_identifier(column)
                .with_context(|| format!("Invalid primary key in sink '{}'", sink_id))?;
        }
        Ok(())
    }
}

impl SystemConfig {
    fn validate(&self, system_id: &str) -> Result<()> {
        validate_connection_string(&self.url)
            .with_context(|| format!("Invalid url for system '{}'", system_id))?;
        if self.max_connections == 0 {
            return Err(BridgeError::config(format!(
                "system '{}' needs max-connections of at least 1",
                system_id
            ))
            .into());
        }
        if self.connect_timeout_secs == 0 {
            return Err(BridgeError::config(format!(
                "system '{}' needs a non-zero connect-timeout-secs",
                system_id
            ))
            .into());
        }
        for (source_id, source) in &self.sources {
            source
                .validate(source_id)
                .with_context(|| format!("Invalid source in system '{}'", system_id))?;
        }
        for (sink_id, sink) in &self.sinks {
            sink.validate(sink_id)
                .with_context(|| format!("Invalid sink in system '{}'", system_id))?;
        }
        Ok(())
    }
}

impl BridgeConfig {
    /// Read, parse and validate a configuration file.
    ///
    /// Files ending in `.toml` are parsed as TOML, everything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config = if is_toml {
            Self::from_toml_str(&contents)
        } else {
            Self::from_json_str(&contents)
        }
        .with_context(|| format!("Failed to parse configuration from {:?}", path))?;

        tracing::info!(
            "Loaded configuration for {} system(s) from {:?}",
            config.systems.len(),
            path
        );
        Ok(config)
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(contents)
            .map_err(|e| BridgeError::config(format!("invalid JSON configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: BridgeConfig = toml::from_str(contents)
            .map_err(|e| BridgeError::config(format!("invalid TOML configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.systems.is_empty() {
            return Err(BridgeError::config("no systems configured").into());
        }
        for (system_id, system) in &self.systems {
            system.validate(system_id)?;
        }
        Ok(())
    }
}
