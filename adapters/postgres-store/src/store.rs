use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leaflet_cep::{
    parse_stream_id, ArchiveUnit, ColdStore, Error, LineageEntry, Metadata, MonoEvent, MonoFilter,
    MultiEvent, MultiFilter,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use crate::error::{is_unique_violation, StoreError};

/// `sqlx`-embedded migrations for `mono_events`, `multi_events`, and
/// `archive_checkpoints`, matching the teacher's `eventually-postgres`
/// `MIGRATIONS` pattern.
pub static MIGRATIONS: sqlx::migrate::Migrator = sqlx::migrate!("./src/migrations");

/// PostgreSQL implementation of [`ColdStore`].
#[derive(Clone)]
pub struct PgColdStore {
    pool: PgPool,
}

impl PgColdStore {
    /// Connects to `database_url` and runs the embedded migrations before
    /// returning, so the store is always ready to use.
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| Error::from(StoreError::from(e)))?;
        MIGRATIONS.run(&pool).await.map_err(|e| Error::from(StoreError::from(e)))?;
        Ok(Self { pool })
    }
}

fn row_to_mono(row: &PgRow) -> Result<MonoEvent, StoreError> {
    let event_id: Uuid = row.try_get("event_id").map_err(|_| StoreError::Column("event_id"))?;
    let timestamp: DateTime<Utc> = row
        .try_get("timestamp")
        .map_err(|_| StoreError::Column("timestamp"))?;
    let source_stream: String = row
        .try_get("source_stream")
        .map_err(|_| StoreError::Column("source_stream"))?;
    let event_type: String = row
        .try_get("event_type")
        .map_err(|_| StoreError::Column("event_type"))?;
    let value: f64 = row.try_get("value").map_err(|_| StoreError::Column("value"))?;
    let metadata: sqlx::types::Json<Metadata> = row
        .try_get("metadata")
        .map_err(|_| StoreError::Column("metadata"))?;

    Ok(MonoEvent {
        event_id,
        timestamp,
        source_stream,
        event_type: leaflet_cep::EventType::new(event_type),
        value,
        metadata: metadata.0,
    })
}

fn row_to_multi(row: &PgRow) -> Result<MultiEvent, StoreError> {
    let event_id: Uuid = row.try_get("event_id").map_err(|_| StoreError::Column("event_id"))?;
    let timestamp: DateTime<Utc> = row
        .try_get("timestamp")
        .map_err(|_| StoreError::Column("timestamp"))?;
    let correlation_rule: String = row
        .try_get("correlation_rule")
        .map_err(|_| StoreError::Column("correlation_rule"))?;
    let source_events: sqlx::types::Json<Vec<Uuid>> = row
        .try_get("source_events")
        .map_err(|_| StoreError::Column("source_events"))?;
    let integrated_value: f64 = row
        .try_get("integrated_value")
        .map_err(|_| StoreError::Column("integrated_value"))?;
    let confidence: f64 = row
        .try_get("confidence")
        .map_err(|_| StoreError::Column("confidence"))?;
    let lineage: sqlx::types::Json<std::collections::HashMap<String, LineageEntry>> = row
        .try_get("lineage")
        .map_err(|_| StoreError::Column("lineage"))?;

    Ok(MultiEvent {
        event_id,
        timestamp,
        source_events: source_events.0,
        correlation_rule,
        integrated_value,
        confidence,
        lineage: lineage.0,
    })
}

async fn insert_mono(executor: impl sqlx::PgExecutor<'_>, event: &MonoEvent) -> Result<(), StoreError> {
    sqlx::query(
        r#"INSERT INTO mono_events (event_id, "timestamp", source_stream, event_type, value, metadata)
           VALUES ($1, $2, $3, $4, $5, $6)
           ON CONFLICT (event_id) DO NOTHING"#,
    )
    .bind(event.event_id)
    .bind(event.timestamp)
    .bind(&event.source_stream)
    .bind(event.event_type.as_str())
    .bind(event.value)
    .bind(sqlx::types::Json(&event.metadata))
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_multi(executor: impl sqlx::PgExecutor<'_>, event: &MultiEvent) -> Result<(), StoreError> {
    sqlx::query(
        r#"INSERT INTO multi_events
               (event_id, "timestamp", event_type, correlation_rule, source_events, integrated_value, confidence, lineage)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
           ON CONFLICT (event_id) DO NOTHING"#,
    )
    .bind(event.event_id)
    .bind(event.timestamp)
    .bind(event.event_type())
    .bind(&event.correlation_rule)
    .bind(sqlx::types::Json(&event.source_events))
    .bind(event.integrated_value)
    .bind(event.confidence)
    .bind(sqlx::types::Json(&event.lineage))
    .execute(executor)
    .await?;
    Ok(())
}

async fn try_mark_archived(
    executor: impl sqlx::PgExecutor<'_>,
    stream: &str,
    broker_message_id: &str,
    event_id: Uuid,
) -> Result<bool, StoreError> {
    let (stream_ms, stream_seq) = parse_stream_id(broker_message_id);

    let result = sqlx::query(
        r#"INSERT INTO archive_checkpoints
               (stream_name, broker_message_id, stream_ms, stream_seq, archived_at, event_id)
           VALUES ($1, $2, $3, $4, $5, $6)"#,
    )
    .bind(stream)
    .bind(broker_message_id)
    .bind(stream_ms as i64)
    .bind(stream_seq as i64)
    .bind(Utc::now())
    .bind(event_id)
    .execute(executor)
    .await;

    match result {
        Ok(_) => Ok(true),
        Err(err) if is_unique_violation(&err) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl ColdStore for PgColdStore {
    async fn insert_mono(&self, event: &MonoEvent) -> Result<(), Error> {
        insert_mono(&self.pool, event).await.map_err(Error::from)
    }

    async fn insert_multi(&self, event: &MultiEvent) -> Result<(), Error> {
        insert_multi(&self.pool, event).await.map_err(Error::from)
    }

    async fn try_mark_archived(
        &self,
        stream: &str,
        broker_message_id: &str,
        event_id: Uuid,
    ) -> Result<bool, Error> {
        try_mark_archived(&self.pool, stream, broker_message_id, event_id)
            .await
            .map_err(Error::from)
    }

    async fn latest_checkpoint_id(&self, stream: &str) -> Result<Option<String>, Error> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"SELECT broker_message_id FROM archive_checkpoints
               WHERE stream_name = $1
               ORDER BY stream_ms DESC, stream_seq DESC
               LIMIT 1"#,
        )
        .bind(stream)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::from(StoreError::from(e)))?;

        Ok(row.map(|(id,)| id))
    }

    async fn query_mono(
        &self,
        filter: &MonoFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MonoEvent>, Error> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT event_id, \"timestamp\", source_stream, event_type, value, metadata FROM mono_events WHERE 1=1");

        if let Some(start) = filter.start_time {
            builder.push(" AND \"timestamp\" >= ").push_bind(start);
        }
        if let Some(end) = filter.end_time {
            builder.push(" AND \"timestamp\" <= ").push_bind(end);
        }
        if let Some(source_stream) = &filter.source_stream {
            builder.push(" AND source_stream = ").push_bind(source_stream.clone());
        }
        if let Some(event_type) = &filter.event_type {
            builder.push(" AND event_type = ").push_bind(event_type.as_str().to_owned());
        }

        builder
            .push(" ORDER BY \"timestamp\" DESC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::from(StoreError::from(e)))?;

        rows.iter()
            .map(|row| row_to_mono(row).map_err(Error::from))
            .collect()
    }

    async fn query_multi(
        &self,
        filter: &MultiFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MultiEvent>, Error> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT event_id, \"timestamp\", event_type, correlation_rule, source_events, integrated_value, confidence, lineage FROM multi_events WHERE 1=1",
        );

        if let Some(start) = filter.start_time {
            builder.push(" AND \"timestamp\" >= ").push_bind(start);
        }
        if let Some(end) = filter.end_time {
            builder.push(" AND \"timestamp\" <= ").push_bind(end);
        }
        if let Some(correlation_rule) = &filter.correlation_rule {
            builder
                .push(" AND correlation_rule = ")
                .push_bind(correlation_rule.clone());
        }
        if let Some(min_confidence) = filter.min_confidence {
            builder.push(" AND confidence >= ").push_bind(min_confidence);
        }

        builder
            .push(" ORDER BY \"timestamp\" DESC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::from(StoreError::from(e)))?;

        rows.iter()
            .map(|row| row_to_multi(row).map_err(Error::from))
            .collect()
    }

    async fn begin_archive_unit(&self) -> Result<Box<dyn ArchiveUnit>, Error> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::from(StoreError::from(e)))?;
        Ok(Box::new(PgArchiveUnit { tx: Some(tx) }))
    }
}

/// One archival entry's transaction: insert, then checkpoint, committed or
/// rolled back together (§4.3, §4.7).
struct PgArchiveUnit {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgArchiveUnit {
    fn tx(&mut self) -> &mut Transaction<'static, Postgres> {
        self.tx.as_mut().expect("archive unit used after commit/rollback")
    }
}

#[async_trait]
impl ArchiveUnit for PgArchiveUnit {
    async fn insert_mono(&mut self, event: &MonoEvent) -> Result<(), Error> {
        insert_mono(&mut **self.tx(), event).await.map_err(Error::from)
    }

    async fn insert_multi(&mut self, event: &MultiEvent) -> Result<(), Error> {
        insert_multi(&mut **self.tx(), event).await.map_err(Error::from)
    }

    async fn try_mark_archived(
        &mut self,
        stream: &str,
        broker_message_id: &str,
        event_id: Uuid,
    ) -> Result<bool, Error> {
        try_mark_archived(&mut **self.tx(), stream, broker_message_id, event_id)
            .await
            .map_err(Error::from)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), Error> {
        let tx = self.tx.take().expect("archive unit used after commit/rollback");
        tx.commit().await.map_err(|e| Error::from(StoreError::from(e)))
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), Error> {
        let tx = self.tx.take().expect("archive unit used after commit/rollback");
        tx.rollback().await.map_err(|e| Error::from(StoreError::from(e)))
    }
}
