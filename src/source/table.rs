// ABOUTME: Table-backed source reading a whole table or the rows changed since a cursor
// ABOUTME: Incremental reads compare the updated column against the bound cursor

use crate::config::SourceConfig;
use crate::entity::Value;
use crate::utils::{qualified_name, quote_ident};

#[derive(Debug, Clone)]
pub struct TableSource {
    pub schema: String,
    pub table: String,
    pub primary_key: Vec<String>,
    pub updated_column: Option<String>,
}

impl TableSource {
    pub fn from_config(id: &str, config: &SourceConfig) -> Self {
        Self {
            schema: config.schema_name().to_string(),
            table: config.table_name(id).to_string(),
            primary_key: config.primary_key.clone(),
            updated_column: config.updated_column.clone(),
        }
    }

    /// SQL and parameters for one read.
    ///
    /// Without a cursor or updated column this is a full scan. When an updated
    /// column is configured rows always come back in its order.
    pub fn statement(&self, since: Option<&str>) -> (String, Vec<Value>) {
        let table = qualified_name(&self.schema, &self.table);
        match (&self.updated_column, since) {
            (Some(updated), Some(cursor)) => {
                let column = quote_ident(updated);
                (
                    format!(
                        "SELECT * FROM {} WHERE {} > $1 ORDER BY {}",
                        table, column, column
                    ),
                    vec![Value::from(cursor)],
                )
            }
            (Some(updated), None) => (
                format!("SELECT * FROM {} ORDER BY {}", table, quote_ident(updated)),
                Vec::new(),
            ),
            (None, _) => (format!("SELECT * FROM {}", table), Vec::new()),
        }
    }
}
