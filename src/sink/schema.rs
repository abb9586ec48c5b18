// ABOUTME: Probes a sink's target table once at configuration time
// ABOUTME: Discovers columns, the optional timestamp column and the effective primary key

use anyhow::{Context, Result};
use tokio_postgres::Client;

use crate::config::SinkConfig;
use crate::error::BridgeError;
use crate::utils::qualified_name;

/// A column of the sink's target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Table metadata resolved once per sink and never re-read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSchema {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    /// Whether the configured timestamp column exists and is written.
    pub use_timestamp: bool,
    /// Effective primary key, never empty.
    pub primary_key: Vec<String>,
}

impl SinkSchema {
    /// Quoted `"schema"."table"` for generated SQL.
    pub fn qualified_table(&self) -> String {
        qualified_name(&self.schema, &self.table)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn is_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }
}

/// Probe the live database for a sink's table.
///
/// Any mismatch between configuration and table is a `BridgeError::Config`.
pub async fn inspect(client: &Client, sink_id: &str, config: &SinkConfig) -> Result<SinkSchema> {
    let schema = config.schema_name();
    let table = config.table.as_str();

    if !table_exists(client, schema, table).await? {
        return Err(BridgeError::config(format!(
            "sink '{}': no such table found: {}.{}",
            sink_id, schema, table
        ))
        .into());
    }

    let columns = get_table_columns(client, schema, table).await?;
    for column in &columns {
        tracing::debug!(
            "Sink '{}' found column {} ({})",
            sink_id,
            column.name,
            column.data_type
        );
    }

    let declared_key = if config.primary_key.is_empty() {
        get_primary_key_columns(client, schema, table).await?
    } else {
        Vec::new()
    };

    let resolved = resolve_schema(sink_id, config, columns, declared_key)?;
    tracing::info!(
        "Configured sink '{}' on {} ({} columns, key [{}]{})",
        sink_id,
        resolved.qualified_table(),
        resolved.columns.len(),
        resolved.primary_key.join(", "),
        if resolved.use_timestamp {
            format!(", timestamp column {}", config.timestamp)
        } else {
            String::new()
        }
    );
    Ok(resolved)
}

/// Combine inspected metadata with the sink configuration.
///
/// `declared_key` is the table's own primary key; it is only consulted when the
/// configuration names no key columns.
pub fn resolve_schema(
    sink_id: &str,
    config: &SinkConfig,
    columns: Vec<ColumnInfo>,
    declared_key: Vec<String>,
) -> Result<SinkSchema, BridgeError> {
    let has_column = |name: &str| columns.iter().any(|c| c.name == name);

    let use_timestamp = has_column(&config.timestamp);

    let primary_key = if config.primary_key.is_empty() {
        if declared_key.is_empty() {
            return Err(BridgeError::config(format!(
                "sink '{}': table {}.{} has no primary key and none is configured",
                sink_id,
                config.schema_name(),
                config.table
            )));
        }
        declared_key
    } else {
        if let Some(missing) = config.primary_key.iter().find(|pk| !has_column(pk)) {
            return Err(BridgeError::config(format!(
                "sink '{}': no such column found: {} in {}.{}",
                sink_id,
                missing,
                config.schema_name(),
                config.table
            )));
        }
        config.primary_key.clone()
    };

    Ok(SinkSchema {
        schema: config.schema_name().to_string(),
        table: config.table.clone(),
        columns,
        use_timestamp,
        primary_key,
    })
}

async fn table_exists(client: &Client, schema: &str, table: &str) -> Result<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
             )",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to look up table {}.{}", schema, table))?;
    Ok(row.get(0))
}

/// Columns in ordinal order.
pub async fn get_table_columns(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<ColumnInfo>> {
    let rows = client
        .query(
            "SELECT column_name, data_type
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to get columns for {}.{}", schema, table))?;

    Ok(rows
        .iter()
        .map(|row| ColumnInfo {
            name: row.get(0),
            data_type: row.get(1),
        })
        .collect())
}

/// Declared primary key columns in key order.
pub async fn get_primary_key_columns(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT a.attname
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             JOIN pg_class c ON c.oid = i.indrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE i.indisprimary
               AND n.nspname = $1
               AND c.relname = $2
             ORDER BY array_position(i.indkey, a.attnum)",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to get primary key for {}.{}", schema, table))?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}
