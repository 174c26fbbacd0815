use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    HistoryEvent, HistoryRecord, HistoryStoreError, InstanceId, Result, Sequence,
    store::{AppendOptions, HistoryStore, StoredInstance},
};

/// PostgreSQL-backed history store.
///
/// Appends run in a transaction that locks the instance row, so writers to
/// the same instance queue behind each other while other instances proceed.
#[derive(Clone)]
pub struct PostgresHistoryStore {
    pool: PgPool,
}

impl PostgresHistoryStore {
    /// Creates a new PostgreSQL history store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: PgRow) -> Result<HistoryRecord> {
        let payload: serde_json::Value = row.try_get("payload")?;
        let event: HistoryEvent = serde_json::from_value(payload)?;

        Ok(HistoryRecord {
            instance_id: InstanceId::from_uuid(row.try_get::<Uuid, _>("instance_id")?),
            sequence: Sequence::new(row.try_get("sequence")?),
            recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at")?,
            event,
        })
    }

    async fn fetch_records(&self, instance_id: InstanceId) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, sequence, recorded_at, payload
            FROM history_events
            WHERE instance_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(instance_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    async fn create_instance(
        &self,
        instance_id: InstanceId,
        input: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orchestration_instances (id, input, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(instance_id.as_uuid())
        .bind(&input)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return HistoryStoreError::InstanceAlreadyExists(instance_id);
            }
            HistoryStoreError::Database(e)
        })?;

        Ok(())
    }

    async fn append(
        &self,
        instance_id: InstanceId,
        event: HistoryEvent,
        options: AppendOptions,
    ) -> Result<Sequence> {
        let mut tx = self.pool.begin().await?;

        // Lock the instance row; concurrent appends to this instance wait here
        let terminal: Option<bool> = sqlx::query_scalar(
            "SELECT terminal FROM orchestration_instances WHERE id = $1 FOR UPDATE",
        )
        .bind(instance_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        match terminal {
            None => return Err(HistoryStoreError::InstanceNotFound(instance_id)),
            Some(true) => return Err(HistoryStoreError::InstanceTerminated(instance_id)),
            Some(false) => {}
        }

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM history_events WHERE instance_id = $1")
                .bind(instance_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
        let current = Sequence::new(current.unwrap_or(0));

        if let Some(expected) = options.expected_sequence
            && current != expected
        {
            return Err(HistoryStoreError::ConcurrencyConflict {
                instance_id,
                expected,
                actual: current,
            });
        }

        let sequence = current.next();
        let payload = serde_json::to_value(&event)?;

        sqlx::query(
            r#"
            INSERT INTO history_events (instance_id, sequence, event_type, recorded_at, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(instance_id.as_uuid())
        .bind(sequence.as_i64())
        .bind(event.event_type())
        .bind(Utc::now())
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_instance_sequence")
            {
                return HistoryStoreError::ConcurrencyConflict {
                    instance_id,
                    expected: options.expected_sequence.unwrap_or(current),
                    actual: sequence,
                };
            }
            HistoryStoreError::Database(e)
        })?;

        if event.is_terminal() {
            sqlx::query("UPDATE orchestration_instances SET terminal = TRUE WHERE id = $1")
                .bind(instance_id.as_uuid())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        metrics::counter!("history_events_appended_total", "event_type" => event.event_type())
            .increment(1);
        tracing::debug!(%instance_id, %sequence, event_type = event.event_type(), "history event appended");

        Ok(sequence)
    }

    async fn read(&self, instance_id: InstanceId) -> Result<Vec<HistoryRecord>> {
        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM orchestration_instances WHERE id = $1")
                .bind(instance_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Err(HistoryStoreError::InstanceNotFound(instance_id));
        }

        self.fetch_records(instance_id).await
    }

    async fn load_instance(&self, instance_id: InstanceId) -> Result<Option<StoredInstance>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT input, created_at
            FROM orchestration_instances
            WHERE id = $1
            "#,
        )
        .bind(instance_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(StoredInstance {
            instance_id,
            input: row.try_get("input")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            records: self.fetch_records(instance_id).await?,
        }))
    }

    async fn list_active_instances(&self) -> Result<Vec<InstanceId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM orchestration_instances
            WHERE NOT terminal
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(InstanceId::from_uuid).collect())
    }
}
