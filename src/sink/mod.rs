// ABOUTME: Sink writer applying entity batches to a table as upserts and deletes
// ABOUTME: One transaction per batch; any failure rolls the whole batch back

pub mod schema;
pub mod statement;

use anyhow::{Context, Result};
use deadpool_postgres::{Client, Transaction};
use futures::stream::{self, Stream, StreamExt};
use tokio_postgres::types::ToSql;
use tokio_postgres::Statement;

use crate::config::SinkConfig;
use crate::entity::{Entity, Value};
use crate::error::BridgeError;
use crate::postgres::WriteTimestamp;

pub use schema::{ColumnInfo, SinkSchema};
use statement::{build_delete, build_delete_all, build_insert, build_update, ColumnFilter};

/// Outcome of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub inserted: u64,
    pub updated: u64,
    /// Rows actually removed; tombstones for unknown keys do not count.
    pub deleted: u64,
    pub truncated: bool,
}

impl WriteStats {
    pub fn entities(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// A configured sink with its inspected table metadata.
#[derive(Debug, Clone)]
pub struct Sink {
    id: String,
    config: SinkConfig,
    schema: SinkSchema,
}

impl Sink {
    /// Probe the target table and build the sink.
    pub async fn configure(
        id: &str,
        config: SinkConfig,
        client: &tokio_postgres::Client,
    ) -> Result<Self> {
        let schema = schema::inspect(client, id, &config).await?;
        Ok(Self::from_schema(id, config, schema))
    }

    pub fn from_schema(id: &str, config: SinkConfig, schema: SinkSchema) -> Self {
        Self {
            id: id.to_string(),
            config,
            schema,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn schema(&self) -> &SinkSchema {
        &self.schema
    }

    fn timestamp_column(&self) -> Option<&str> {
        self.schema
            .use_timestamp
            .then_some(self.config.timestamp.as_str())
    }

    /// Drop the fields this sink does not write. An incoming value for the
    /// timestamp column is dropped too; the write time always wins.
    fn filter_fields(&self, entity: &mut Entity) {
        let filter = ColumnFilter::new(
            &self.schema.primary_key,
            &self.config.whitelist,
            &self.config.blacklist,
        );
        let timestamp = self.timestamp_column();
        entity.retain(|column| filter.keeps(column) && Some(column) != timestamp);
    }

    /// Key values in key order. Absent and null keys are both rejected.
    fn key_values<'e>(&self, entity: &'e Entity) -> Result<Vec<&'e Value>, BridgeError> {
        self.schema
            .primary_key
            .iter()
            .map(|column| match entity.get(column) {
                Some(value) if !value.is_null() => Ok(value),
                _ => Err(BridgeError::MissingKey {
                    column: column.clone(),
                }),
            })
            .collect()
    }

    /// Apply an in-memory batch. See [`Sink::write_stream`].
    pub async fn write<I>(&self, client: &mut Client, entities: I, is_full: bool) -> Result<WriteStats>
    where
        I: IntoIterator<Item = Result<Entity, BridgeError>>,
    {
        self.write_stream(client, stream::iter(entities), is_full).await
    }

    /// Apply a stream of entities in arrival order.
    ///
    /// With `is_full` and `truncate-table-on-first-run` the table is emptied first,
    /// in its own committed transaction. Everything else runs in one transaction that
    /// commits only after the stream ends; dropping the returned future before that
    /// rolls the batch back.
    pub async fn write_stream<S>(
        &self,
        client: &mut Client,
        entities: S,
        is_full: bool,
    ) -> Result<WriteStats>
    where
        S: Stream<Item = Result<Entity, BridgeError>>,
    {
        let table = self.schema.qualified_table();
        let mut stats = WriteStats::default();

        if is_full && self.config.truncate_table_on_first_run {
            let sql = build_delete_all(&table);
            tracing::info!("Sink '{}': deleting all rows from {}", self.id, table);
            let tx = client
                .transaction()
                .await
                .context("Failed to begin truncate transaction")?;
            tx.execute(sql.as_str(), &[])
                .await
                .with_context(|| format!("Failed to delete all rows from {}", table))?;
            tx.commit()
                .await
                .with_context(|| format!("Failed to commit truncate of {}", table))?;
            stats.truncated = true;
        }

        let tx = client
            .transaction()
            .await
            .context("Failed to begin batch transaction")?;

        match self.apply_all(&tx, entities, &mut stats).await {
            Ok(()) => {
                tx.commit()
                    .await
                    .with_context(|| format!("Failed to commit batch into {}", table))?;
            }
            Err(e) => {
                tracing::warn!(
                    "Sink '{}': rolling back entire batch after error: {:#}",
                    self.id,
                    e
                );
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("Sink '{}': rollback failed: {}", self.id, rollback_err);
                }
                return Err(e);
            }
        }

        tracing::info!(
            "Sink '{}': {} inserted, {} updated, {} deleted{}",
            self.id,
            stats.inserted,
            stats.updated,
            stats.deleted,
            if stats.truncated { " (table truncated)" } else { "" }
        );
        Ok(stats)
    }

    async fn apply_all<S>(&self, tx: &Transaction<'_>, entities: S, stats: &mut WriteStats) -> Result<()>
    where
        S: Stream<Item = Result<Entity, BridgeError>>,
    {
        let written_at = WriteTimestamp::now();
        futures::pin_mut!(entities);

        let mut index = 0usize;
        while let Some(entity) = entities.next().await {
            let mut entity = entity.with_context(|| format!("Entity #{} is malformed", index))?;
            self.filter_fields(&mut entity);
            self.apply(tx, &entity, &written_at, stats)
                .await
                .with_context(|| format!("Failed to apply entity #{}", index))?;
            index += 1;
        }
        Ok(())
    }

    async fn apply(
        &self,
        tx: &Transaction<'_>,
        entity: &Entity,
        written_at: &WriteTimestamp,
        stats: &mut WriteStats,
    ) -> Result<()> {
        let table = self.schema.qualified_table();
        let keys = self.key_values(entity)?;
        let key_params = keys.iter().map(|v| *v as &(dyn ToSql + Sync));

        if entity.is_deleted() {
            let sql = build_delete(&table, &self.schema.primary_key);
            let params: Vec<&(dyn ToSql + Sync)> = key_params.collect();
            let stmt = prepare(tx, &sql).await?;
            stats.deleted += tx
                .execute(&stmt, &params)
                .await
                .with_context(|| format!("Failed to delete from {}", table))?;
            return Ok(());
        }

        let columns: Vec<&str> = entity.fields().map(|(name, _)| name).collect();
        let timestamp = self.timestamp_column();

        let mut params: Vec<&(dyn ToSql + Sync)> = entity
            .fields()
            .map(|(_, value)| value as &(dyn ToSql + Sync))
            .collect();
        if timestamp.is_some() {
            params.push(written_at);
        }
        let insert_len = params.len();
        params.extend(key_params);

        let sql = build_update(&table, &columns, timestamp, &self.schema.primary_key);
        let stmt = prepare(tx, &sql).await?;
        let updated = tx
            .execute(&stmt, &params)
            .await
            .with_context(|| format!("Failed to update {}", table))?;

        match updated {
            1 => stats.updated += 1,
            0 => {
                let sql = build_insert(&table, &columns, timestamp);
                let stmt = prepare(tx, &sql).await?;
                tx.execute(&stmt, &params[..insert_len])
                    .await
                    .with_context(|| format!("Failed to insert into {}", table))?;
                stats.inserted += 1;
            }
            count => return Err(BridgeError::Consistency { table, count }.into()),
        }
        Ok(())
    }
}

/// Prepare through the connection's statement cache, so each distinct SQL
/// text is parsed once per pooled connection.
async fn prepare(tx: &Transaction<'_>, sql: &str) -> Result<Statement> {
    tracing::trace!("{}", sql);
    tx.prepare_cached(sql)
        .await
        .with_context(|| format!("Failed to prepare statement: {}", sql))
}
