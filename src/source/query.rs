// ABOUTME: Query-backed source running a literal configured SELECT
// ABOUTME: The since marker becomes a bound $1 parameter holding the cursor or NULL

use crate::config::SourceConfig;
use crate::entity::Value;

#[derive(Debug, Clone)]
pub struct QuerySource {
    pub query: String,
    pub since_marker: Option<String>,
    pub primary_key: Vec<String>,
    pub updated_column: Option<String>,
}

impl QuerySource {
    pub fn from_config(query: &str, config: &SourceConfig) -> Self {
        Self {
            query: query.to_string(),
            since_marker: config.since.clone(),
            primary_key: config.primary_key.clone(),
            updated_column: config.updated_column.clone(),
        }
    }

    /// Every occurrence of the marker refers to the same parameter.
    pub fn statement(&self, since: Option<&str>) -> (String, Vec<Value>) {
        match &self.since_marker {
            Some(marker) => {
                let cursor = since.map(Value::from).unwrap_or(Value::Null);
                (self.query.replace(marker.as_str(), "$1"), vec![cursor])
            }
            None => (self.query.clone(), Vec::new()),
        }
    }
}
