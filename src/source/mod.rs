// ABOUTME: Source readers producing entity streams from tables or literal queries
// ABOUTME: A closed enum of source kinds behind a single read operation

pub mod query;
pub mod stream;
pub mod table;

use anyhow::{Context, Result};
use deadpool_postgres::Object;

use crate::config::SourceConfig;
use crate::entity::Value;

pub use query::QuerySource;
pub use stream::{EntityMeta, EntityStream, ID_FIELD, UPDATED_FIELD};
pub use table::TableSource;

#[derive(Debug, Clone)]
pub enum Source {
    Table(TableSource),
    Query(QuerySource),
}

impl Source {
    pub fn from_config(id: &str, config: &SourceConfig) -> Self {
        match &config.query {
            Some(query) => Source::Query(QuerySource::from_config(query, config)),
            None => Source::Table(TableSource::from_config(id, config)),
        }
    }

    pub fn primary_key(&self) -> &[String] {
        match self {
            Source::Table(t) => &t.primary_key,
            Source::Query(q) => &q.primary_key,
        }
    }

    pub fn updated_column(&self) -> Option<&str> {
        match self {
            Source::Table(t) => t.updated_column.as_deref(),
            Source::Query(q) => q.updated_column.as_deref(),
        }
    }

    pub fn statement(&self, since: Option<&str>) -> (String, Vec<Value>) {
        match self {
            Source::Table(t) => t.statement(since),
            Source::Query(q) => q.statement(since),
        }
    }

    /// Start reading entities changed since `since`.
    ///
    /// The query is executed before this returns, so SQL errors surface here;
    /// rows are then converted lazily as the stream is polled.
    pub async fn read(&self, label: &str, client: Object, since: Option<&str>) -> Result<EntityStream> {
        let (sql, params) = self.statement(since);
        tracing::debug!("Source '{}': {} (since {:?})", label, sql, since);

        let rows = client
            .query_raw(sql.as_str(), params.iter())
            .await
            .with_context(|| format!("Failed to execute read for source '{}'", label))?;

        let meta = EntityMeta {
            primary_key: self.primary_key().to_vec(),
            updated_column: self.updated_column().map(str::to_string),
        };
        Ok(EntityStream::new(label.to_string(), client, rows, meta, since))
    }
}
