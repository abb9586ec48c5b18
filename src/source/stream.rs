// ABOUTME: Lazy stream of entities read from one source query
// ABOUTME: Converts rows as they arrive and tracks the cursor for the next poll

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use deadpool_postgres::Object;
use futures::Stream;
use tokio_postgres::{Row, RowStream};

use crate::entity::{Entity, Value};

/// Field carrying the primary-key values of a source entity, joined with `:`.
pub const ID_FIELD: &str = "_id";

/// Field carrying a source entity's cursor value.
pub const UPDATED_FIELD: &str = "_updated";

const KEY_SEPARATOR: &str = ":";

/// Key and cursor columns used to annotate entities.
#[derive(Debug, Clone, Default)]
pub struct EntityMeta {
    pub primary_key: Vec<String>,
    pub updated_column: Option<String>,
}

impl EntityMeta {
    /// Convert one row into an entity and return its cursor value, if any.
    ///
    /// Column names become field names. `_id` and `_updated` are only added
    /// when the row has no real columns of that name.
    pub fn entity_from_row(&self, row: &Row) -> Result<(Entity, Option<String>)> {
        let mut entity = Entity::new();
        for (idx, column) in row.columns().iter().enumerate() {
            let value: Value = row.try_get(idx).with_context(|| {
                format!(
                    "Failed to read column '{}' of type {}",
                    column.name(),
                    column.type_()
                )
            })?;
            entity.insert(column.name(), value);
        }
        let cursor = self.annotate(&mut entity);
        Ok((entity, cursor))
    }

    fn annotate(&self, entity: &mut Entity) -> Option<String> {
        if !entity.contains(ID_FIELD) {
            let parts: Option<Vec<String>> = self
                .primary_key
                .iter()
                .map(|column| entity.get(column).and_then(Value::to_plain_string))
                .collect();
            if let Some(parts) = parts {
                entity.insert(ID_FIELD, parts.join(KEY_SEPARATOR));
            }
        }

        let cursor = self
            .updated_column
            .as_deref()
            .and_then(|column| entity.get(column))
            .and_then(Value::to_plain_string);
        if let Some(cursor) = &cursor {
            if !entity.contains(UPDATED_FIELD) {
                entity.insert(UPDATED_FIELD, cursor.clone());
            }
        }
        cursor
    }
}

/// Entities of one read, produced as rows arrive from the server.
///
/// Holds its pooled connection until dropped. After the stream ends,
/// [`EntityStream::next_cursor`] is the value to pass as `since` next time.
pub struct EntityStream {
    rows: Pin<Box<RowStream>>,
    // Dropped after `rows`; returns the connection to the pool.
    _client: Object,
    meta: EntityMeta,
    cursor: Option<String>,
    finished: bool,
    emitted: u64,
    label: String,
}

impl EntityStream {
    pub(crate) fn new(
        label: String,
        client: Object,
        rows: RowStream,
        meta: EntityMeta,
        since: Option<&str>,
    ) -> Self {
        Self {
            rows: Box::pin(rows),
            _client: client,
            meta,
            cursor: since.map(str::to_string),
            finished: false,
            emitted: 0,
            label,
        }
    }

    /// Cursor of the last emitted entity, or the incoming cursor if none was emitted.
    pub fn next_cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

impl Stream for EntityStream {
    type Item = Result<Entity>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let polled = self.rows.as_mut().poll_next(cx);
        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                self.finished = true;
                tracing::info!(
                    "Source '{}': emitted {} entities, next cursor {:?}",
                    self.label,
                    self.emitted,
                    self.cursor
                );
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                let err = anyhow::Error::new(e)
                    .context(format!("Failed to read rows for source '{}'", self.label));
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(Ok(row))) => match self.meta.entity_from_row(&row) {
                Ok((entity, cursor)) => {
                    if cursor.is_some() {
                        self.cursor = cursor;
                    }
                    self.emitted += 1;
                    Poll::Ready(Some(Ok(entity)))
                }
                Err(e) => {
                    self.finished = true;
                    Poll::Ready(Some(Err(e)))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn meta(pk: &[&str], updated: Option<&str>) -> EntityMeta {
        EntityMeta {
            primary_key: pk.iter().map(|s| s.to_string()).collect(),
            updated_column: updated.map(str::to_string),
        }
    }

    #[test]
    fn test_annotate_adds_id_and_updated() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let mut entity = Entity::new()
            .with("order_id", 7)
            .with("line", 2)
            .with("updated_at", day);

        let cursor = meta(&["order_id", "line"], Some("updated_at")).annotate(&mut entity);

        assert_eq!(cursor.as_deref(), Some("2024-01-02"));
        assert_eq!(entity.get(ID_FIELD), Some(&Value::from("7:2")));
        assert_eq!(entity.get(UPDATED_FIELD), Some(&Value::from("2024-01-02")));
    }

    #[test]
    fn test_annotate_respects_real_columns() {
        let mut entity = Entity::new().with("_id", "native").with("id", 1);
        let cursor = meta(&["id"], None).annotate(&mut entity);

        assert_eq!(cursor, None);
        assert_eq!(entity.get(ID_FIELD), Some(&Value::from("native")));
        assert!(!entity.contains(UPDATED_FIELD));
    }

    #[test]
    fn test_annotate_skips_id_with_null_key() {
        let mut entity = Entity::new().with("id", Value::Null);
        meta(&["id"], None).annotate(&mut entity);
        assert!(!entity.contains(ID_FIELD));
    }
}
