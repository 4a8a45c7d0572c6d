use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use super::{
    ExecutionMetadata, InstanceInfo, InstanceStatus, OrchestrationItem, Provider, ProviderError, WorkItem,
    new_lock_token, now_millis, validate_delta,
};
use crate::{Error, Event, EventKind};

/// Durable provider backed by a single SQLite database.
///
/// The pool holds one connection, so every store operation runs as one serialized
/// transaction. That is the single-writer discipline the history log relies on.
pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    /// Open (creating if needed) the database at `database_url`, e.g. `sqlite:agentflow.db`
    /// or `sqlite::memory:`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            // An in-memory database lives exactly as long as its connection
            .idle_timeout(None)
            .max_lifetime(None)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(target: "agentflow::providers::sqlite", database_url, "sqlite provider ready");
        Ok(Self { pool })
    }

    /// Private in-memory database, mainly for tests.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                orchestration_name TEXT NOT NULL,
                input TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'Running',
                output TEXT,
                error TEXT,
                parent_instance_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (instance_id, event_id),
                FOREIGN KEY (instance_id) REFERENCES instances(instance_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                work_item TEXT NOT NULL,
                lock_token TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instance_locks (
                instance_id TEXT PRIMARY KEY,
                lock_token TEXT NOT NULL,
                locked_until INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS worker_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                work_item TEXT NOT NULL,
                lock_token TEXT,
                locked_until INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_queue_instance ON orchestrator_queue(instance_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_queue_lock ON orchestrator_queue(lock_token)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_worker_queue_lock ON worker_queue(lock_token)")
            .execute(pool)
            .await?;
        Ok(())
    }

    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("database locked: {error_msg}"));
        }
        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("constraint violation: {error_msg}"));
        }
        if matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) {
            return ProviderError::retryable(operation, format!("connection error: {error_msg}"));
        }
        ProviderError::retryable(operation, error_msg)
    }

    fn decode_json<T: serde::de::DeserializeOwned>(operation: &str, data: &str) -> Result<T, ProviderError> {
        serde_json::from_str(data).map_err(|e| ProviderError::permanent(operation, format!("corrupt row: {e}")))
    }

    fn encode_json<T: serde::Serialize>(operation: &str, value: &T) -> Result<String, ProviderError> {
        serde_json::to_string(value)
            .map_err(|e| ProviderError::permanent(operation, format!("serialization error: {e}")))
    }

    async fn read_history_with(
        conn: &mut SqliteConnection,
        operation: &str,
        instance: &str,
    ) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query("SELECT event_data FROM history WHERE instance_id = ? ORDER BY event_id")
            .bind(instance)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        rows.iter()
            .map(|row| {
                let data: String = row.try_get("event_data").map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
                Self::decode_json(operation, &data)
            })
            .collect()
    }

    async fn last_event_id(conn: &mut SqliteConnection, operation: &str, instance: &str) -> Result<u64, ProviderError> {
        let last: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(event_id), 0) FROM history WHERE instance_id = ?")
            .bind(instance)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(last as u64)
    }

    async fn insert_event(
        conn: &mut SqliteConnection,
        operation: &str,
        instance: &str,
        event: &Event,
    ) -> Result<(), ProviderError> {
        sqlx::query(
            "INSERT INTO history (instance_id, event_id, event_type, event_data, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(instance)
        .bind(event.event_id as i64)
        .bind(event.kind.name())
        .bind(Self::encode_json(operation, event)?)
        .bind(now_millis() as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(())
    }

    async fn insert_instance(
        conn: &mut SqliteConnection,
        operation: &str,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent_instance: Option<&str>,
        or_ignore: bool,
    ) -> Result<u64, ProviderError> {
        let sql = if or_ignore {
            "INSERT OR IGNORE INTO instances (instance_id, orchestration_name, input, status, parent_instance_id, created_at, updated_at) VALUES (?, ?, ?, 'Running', ?, ?, ?)"
        } else {
            "INSERT INTO instances (instance_id, orchestration_name, input, status, parent_instance_id, created_at, updated_at) VALUES (?, ?, ?, 'Running', ?, ?, ?)"
        };
        let now = now_millis() as i64;
        let result = sqlx::query(sql)
            .bind(instance)
            .bind(orchestration)
            .bind(input)
            .bind(parent_instance)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(result.rows_affected())
    }

    async fn enqueue_orchestrator_with(
        conn: &mut SqliteConnection,
        operation: &str,
        item: &WorkItem,
    ) -> Result<(), ProviderError> {
        sqlx::query("INSERT INTO orchestrator_queue (instance_id, work_item) VALUES (?, ?)")
            .bind(item.instance())
            .bind(Self::encode_json(operation, item)?)
            .execute(&mut *conn)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(())
    }

    fn row_to_info(row: &sqlx::sqlite::SqliteRow) -> Result<InstanceInfo, ProviderError> {
        let op = "get_instance_info";
        let get_err = |e| Self::sqlx_to_provider_error(op, e);
        let status: String = row.try_get("status").map_err(get_err)?;
        let error: Option<String> = row.try_get("error").map_err(get_err)?;
        let created_at: i64 = row.try_get("created_at").map_err(get_err)?;
        let updated_at: i64 = row.try_get("updated_at").map_err(get_err)?;
        Ok(InstanceInfo {
            instance_id: row.try_get("instance_id").map_err(get_err)?,
            orchestration_name: row.try_get("orchestration_name").map_err(get_err)?,
            input: row.try_get("input").map_err(get_err)?,
            status: status
                .parse::<InstanceStatus>()
                .map_err(|m| ProviderError::permanent(op, m))?,
            output: row.try_get("output").map_err(get_err)?,
            error: error
                .map(|e| Self::decode_json::<Error>(op, &e))
                .transpose()?,
            parent_instance: row.try_get("parent_instance_id").map_err(get_err)?,
            created_at_ms: created_at as u64,
            updated_at_ms: updated_at as u64,
        })
    }
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_instance(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent_instance: Option<&str>,
    ) -> Result<(), ProviderError> {
        let op = "create_instance";
        let mut conn = self.pool.acquire().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let inserted =
            Self::insert_instance(&mut conn, op, instance, orchestration, input, parent_instance, true).await?;
        if inserted == 0 {
            return Err(ProviderError::permanent(op, format!("instance already exists: {instance}")));
        }
        Ok(())
    }

    async fn start_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError> {
        let op = "start_instance";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let inserted = Self::insert_instance(&mut tx, op, instance, orchestration, input, None, true).await?;
        if inserted == 0 {
            return Err(ProviderError::permanent(op, format!("instance already exists: {instance}")));
        }
        let start = WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input: input.to_string(),
            parent_instance: None,
            parent_id: None,
        };
        Self::enqueue_orchestrator_with(&mut tx, op, &start).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Ok(())
    }

    async fn append_event(
        &self,
        instance: &str,
        source_event_id: Option<u64>,
        kind: EventKind,
    ) -> Result<Event, ProviderError> {
        let op = "append_event";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let exists: Option<String> = sqlx::query_scalar("SELECT instance_id FROM instances WHERE instance_id = ?")
            .bind(instance)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        if exists.is_none() {
            return Err(ProviderError::permanent(op, format!("instance not found: {instance}")));
        }
        let event = Event::new(Self::last_event_id(&mut tx, op, instance).await? + 1, source_event_id, kind);
        Self::insert_event(&mut tx, op, instance, &event).await?;
        sqlx::query("UPDATE instances SET updated_at = ? WHERE instance_id = ?")
            .bind(now_millis() as i64)
            .bind(instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Ok(event)
    }

    async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let op = "read_history";
        let mut conn = self.pool.acquire().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Self::read_history_with(&mut conn, op, instance).await
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<InstanceInfo>, ProviderError> {
        let row = sqlx::query(
            "SELECT instance_id, orchestration_name, input, status, output, error, parent_instance_id, created_at, updated_at FROM instances WHERE instance_id = ?",
        )
        .bind(instance)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("get_instance_info", e))?;
        row.as_ref().map(Self::row_to_info).transpose()
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        sqlx::query_scalar("SELECT instance_id FROM instances ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let op = "enqueue_orchestrator_work";
        debug!(target: "agentflow::providers::sqlite", instance_id = %item.instance(), kind = item.kind(), "enqueue");
        let mut conn = self.pool.acquire().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Self::enqueue_orchestrator_with(&mut conn, op, &item).await
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError> {
        let op = "fetch_orchestration_item";
        let now = now_millis() as i64;
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        // Expired locks give their messages back
        sqlx::query(
            "UPDATE orchestrator_queue SET lock_token = NULL WHERE lock_token IN (SELECT lock_token FROM instance_locks WHERE locked_until <= ?)",
        )
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        sqlx::query("DELETE FROM instance_locks WHERE locked_until <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        let instance: Option<String> = sqlx::query_scalar(
            r#"
            SELECT q.instance_id FROM orchestrator_queue q
            WHERE q.lock_token IS NULL
              AND NOT EXISTS (SELECT 1 FROM instance_locks l WHERE l.instance_id = q.instance_id)
            ORDER BY q.id
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        let Some(instance) = instance else {
            tx.rollback().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
            return Ok(None);
        };

        let lock_token = new_lock_token();
        let locked_until = now.saturating_add(lock_timeout.as_millis() as i64);
        sqlx::query("INSERT INTO instance_locks (instance_id, lock_token, locked_until) VALUES (?, ?, ?)")
            .bind(&instance)
            .bind(&lock_token)
            .bind(locked_until)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        sqlx::query("UPDATE orchestrator_queue SET lock_token = ? WHERE instance_id = ? AND lock_token IS NULL")
            .bind(&lock_token)
            .bind(&instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        let rows = sqlx::query("SELECT work_item FROM orchestrator_queue WHERE lock_token = ? ORDER BY id")
            .bind(&lock_token)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let data: String = row.try_get("work_item").map_err(|e| Self::sqlx_to_provider_error(op, e))?;
            messages.push(Self::decode_json::<WorkItem>(op, &data)?);
        }

        let history = Self::read_history_with(&mut tx, op, &instance).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        debug!(
            target: "agentflow::providers::sqlite",
            instance_id = %instance,
            messages = messages.len(),
            history_len = history.len(),
            "fetched orchestration item"
        );
        Ok(Some(OrchestrationItem {
            instance,
            history,
            messages,
            lock_token,
        }))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let op = "ack_orchestration_item";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        let instance: Option<String> = sqlx::query_scalar("SELECT instance_id FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let Some(instance) = instance else {
            return Err(ProviderError::permanent(op, "invalid lock token"));
        };

        let last = Self::last_event_id(&mut tx, op, &instance).await?;
        validate_delta(last, &history_delta).map_err(|m| ProviderError::permanent(op, m))?;
        for event in &history_delta {
            Self::insert_event(&mut tx, op, &instance, event).await?;
        }

        sqlx::query("DELETE FROM orchestrator_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        for item in &worker_items {
            sqlx::query("INSERT INTO worker_queue (instance_id, work_item) VALUES (?, ?)")
                .bind(item.instance())
                .bind(Self::encode_json(op, item)?)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        }

        for item in &orchestrator_items {
            if let WorkItem::StartOrchestration {
                instance: child,
                orchestration,
                input,
                parent_instance,
                ..
            } = item
            {
                Self::insert_instance(&mut tx, op, child, orchestration, input, parent_instance.as_deref(), true)
                    .await?;
            }
            Self::enqueue_orchestrator_with(&mut tx, op, item).await?;
        }

        let now = now_millis() as i64;
        if let Some(status) = metadata.status {
            let error = metadata.error.as_ref().map(|e| Self::encode_json(op, e)).transpose()?;
            sqlx::query("UPDATE instances SET status = ?, output = ?, error = ?, updated_at = ? WHERE instance_id = ?")
                .bind(status.as_str())
                .bind(metadata.output.as_deref())
                .bind(error)
                .bind(now)
                .bind(&instance)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        } else {
            sqlx::query("UPDATE instances SET updated_at = ? WHERE instance_id = ?")
                .bind(now)
                .bind(&instance)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        }

        sqlx::query("DELETE FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        debug!(
            target: "agentflow::providers::sqlite",
            instance_id = %instance,
            history_delta = history_delta.len(),
            worker_items = worker_items.len(),
            orchestrator_items = orchestrator_items.len(),
            "acked orchestration item"
        );
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let op = "abandon_orchestration_item";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        sqlx::query("UPDATE orchestrator_queue SET lock_token = NULL WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let released = sqlx::query("DELETE FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        if released.rows_affected() == 0 {
            return Err(ProviderError::permanent(op, "invalid lock token"));
        }
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Ok(())
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let op = "fetch_work_item";
        let now = now_millis() as i64;
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let row = sqlx::query(
            "SELECT id, work_item FROM worker_queue WHERE lock_token IS NULL OR locked_until <= ? ORDER BY id LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let Some(row) = row else {
            tx.rollback().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
            return Ok(None);
        };
        let id: i64 = row.try_get("id").map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let data: String = row.try_get("work_item").map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let item: WorkItem = Self::decode_json(op, &data)?;

        let lock_token = new_lock_token();
        sqlx::query("UPDATE worker_queue SET lock_token = ?, locked_until = ? WHERE id = ?")
            .bind(&lock_token)
            .bind(now.saturating_add(lock_timeout.as_millis() as i64))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Ok(Some((item, lock_token)))
    }

    async fn ack_work_item(&self, lock_token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        let op = "ack_work_item";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let deleted = sqlx::query("DELETE FROM worker_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        if deleted.rows_affected() == 0 {
            return Err(ProviderError::permanent(op, "invalid lock token"));
        }
        Self::enqueue_orchestrator_with(&mut tx, op, &completion).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Ok(())
    }

    async fn abandon_work_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let op = "abandon_work_item";
        let released = sqlx::query("UPDATE worker_queue SET lock_token = NULL, locked_until = NULL WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        if released.rows_affected() == 0 {
            return Err(ProviderError::permanent(op, "invalid lock token"));
        }
        Ok(())
    }
}
