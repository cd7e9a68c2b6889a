//! Postgres-backed Entity Store.
//!
//! Each entity table carries the serialized record as JSONB plus the
//! columns the orchestrator filters on, and a `version BIGINT` bumped on
//! every write. Conditional updates are a single
//! `UPDATE ... WHERE key = $1 AND version = $2`; zero rows affected means
//! somebody else won and the caller sees [`StoreError::Conflict`].

use std::time::Duration;

use async_trait::async_trait;
use fleet_id::{JobId, MachineId, ScalesetId, TaskId};
use fleet_lifecycle::{JobState, NodeState, TaskState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::model::{Job, Node, NodeTask, Pool, Scaleset, Task, TaskEventRecord};

use super::{
    EntityStore, NodeTaskSelector, StoreError, Version, Versioned, WriteBatch,
};

/// Postgres store configuration.
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/fuzzfleet".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PgStoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("FLEET_DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/fuzzfleet".to_string());

        let max_connections = std::env::var("FLEET_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        Self {
            database_url,
            max_connections,
            ..Default::default()
        }
    }
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

/// Row shape shared by every versioned entity table.
#[derive(Debug)]
struct EntityRow {
    entity: serde_json::Value,
    version: i64,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EntityRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            entity: row.try_get("entity")?,
            version: row.try_get("version")?,
        })
    }
}

fn decode<T: DeserializeOwned>(row: EntityRow) -> Result<Versioned<T>, StoreError> {
    let value = serde_json::from_value(row.entity)?;
    Ok(Versioned::new(value, Version(row.version as u64)))
}

fn decode_all<T: DeserializeOwned>(rows: Vec<EntityRow>) -> Result<Vec<Versioned<T>>, StoreError> {
    rows.into_iter().map(decode).collect()
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

fn state_strings<S: std::fmt::Display>(states: &[S]) -> Vec<String> {
    states.iter().map(|s| s.to_string()).collect()
}

impl PgStore {
    /// Create a new store over a connection pool.
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        info!(
            max_connections = config.max_connections,
            "Connecting to entity store"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;

        info!("Entity store connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the store is reachable.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Run pending migrations.
    ///
    /// Note: in production, migrations run as part of deployment; this
    /// entry point covers dev mode.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running entity store migrations");

        let dir = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations");
        let migrator = sqlx::migrate::Migrator::new(dir)
            .await
            .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))?;
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))?;

        info!("Entity store migrations complete");
        Ok(())
    }
}

/// Applies one version-conditioned update inside a transaction. Zero rows
/// affected distinguishes between a stale version and a missing row.
async fn conditional_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    sql: &str,
    exists_sql: &str,
    key: uuid::Uuid,
    entity: serde_json::Value,
    state: Option<String>,
    version: Version,
    name: &'static str,
) -> Result<(), StoreError> {
    let mut query = sqlx::query(sql).bind(key).bind(entity);
    if let Some(state) = state {
        query = query.bind(state);
    }
    let result = query.bind(version.0 as i64).execute(&mut **tx).await?;

    if result.rows_affected() == 0 {
        let exists: bool = sqlx::query_scalar(exists_sql)
            .bind(key)
            .fetch_one(&mut **tx)
            .await?;
        return Err(if exists {
            StoreError::Conflict { entity: name }
        } else {
            StoreError::NotFound { entity: name }
        });
    }

    Ok(())
}

#[async_trait]
impl EntityStore for PgStore {
    async fn insert_job(&self, job: Job) -> Result<Versioned<Job>, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (job_id, state, entity, version, created_at)
            VALUES ($1, $2, $3, 1, $4)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(job.state.to_string())
        .bind(encode(&job)?)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists { entity: "job" });
        }
        Ok(Versioned::new(job, Version::FIRST))
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Versioned<Job>>, StoreError> {
        let row = sqlx::query_as::<_, EntityRow>(
            "SELECT entity, version FROM jobs WHERE job_id = $1",
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode).transpose()
    }

    async fn update_job(&self, job: Versioned<Job>) -> Result<Versioned<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;
        conditional_update(
            &mut tx,
            "UPDATE jobs SET entity = $2, state = $3, version = version + 1 \
             WHERE job_id = $1 AND version = $4",
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE job_id = $1)",
            job.value.job_id.as_uuid(),
            encode(&job.value)?,
            Some(job.value.state.to_string()),
            job.version,
            "job",
        )
        .await?;
        tx.commit().await?;
        Ok(Versioned::new(job.value, job.version.next()))
    }

    async fn list_jobs_by_state(
        &self,
        states: &[JobState],
    ) -> Result<Vec<Versioned<Job>>, StoreError> {
        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT entity, version FROM jobs WHERE state = ANY($1) ORDER BY created_at, job_id",
        )
        .bind(state_strings(states))
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    async fn insert_task(&self, task: Task) -> Result<Versioned<Task>, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (task_id, job_id, state, pool_name, entity, version, created_at)
            VALUES ($1, $2, $3, $4, $5, 1, $6)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(task.task_id.as_uuid())
        .bind(task.job_id.as_uuid())
        .bind(task.state.to_string())
        .bind(&task.config.pool_name)
        .bind(encode(&task)?)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists { entity: "task" });
        }
        Ok(Versioned::new(task, Version::FIRST))
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Versioned<Task>>, StoreError> {
        let row = sqlx::query_as::<_, EntityRow>(
            "SELECT entity, version FROM tasks WHERE task_id = $1",
        )
        .bind(task_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode).transpose()
    }

    async fn update_task(&self, task: Versioned<Task>) -> Result<Versioned<Task>, StoreError> {
        let mut tx = self.pool.begin().await?;
        conditional_update(
            &mut tx,
            "UPDATE tasks SET entity = $2, state = $3, version = version + 1 \
             WHERE task_id = $1 AND version = $4",
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE task_id = $1)",
            task.value.task_id.as_uuid(),
            encode(&task.value)?,
            Some(task.value.state.to_string()),
            task.version,
            "task",
        )
        .await?;
        tx.commit().await?;
        Ok(Versioned::new(task.value, task.version.next()))
    }

    async fn list_tasks_by_state(
        &self,
        states: &[TaskState],
    ) -> Result<Vec<Versioned<Task>>, StoreError> {
        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT entity, version FROM tasks WHERE state = ANY($1) ORDER BY created_at, task_id",
        )
        .bind(state_strings(states))
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    async fn list_tasks_by_job(&self, job_id: JobId) -> Result<Vec<Versioned<Task>>, StoreError> {
        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT entity, version FROM tasks WHERE job_id = $1 ORDER BY created_at, task_id",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    async fn insert_pool(&self, pool: Pool) -> Result<Versioned<Pool>, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO pools (name, entity, version, created_at)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&pool.name)
        .bind(encode(&pool)?)
        .bind(pool.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists { entity: "pool" });
        }
        Ok(Versioned::new(pool, Version::FIRST))
    }

    async fn get_pool(&self, name: &str) -> Result<Option<Versioned<Pool>>, StoreError> {
        let row = sqlx::query_as::<_, EntityRow>(
            "SELECT entity, version FROM pools WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode).transpose()
    }

    async fn list_pools(&self) -> Result<Vec<Versioned<Pool>>, StoreError> {
        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT entity, version FROM pools ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    async fn delete_pool(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pools WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_scaleset(&self, scaleset: Scaleset) -> Result<Versioned<Scaleset>, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO scalesets (scaleset_id, pool_name, entity, version, created_at)
            VALUES ($1, $2, $3, 1, $4)
            ON CONFLICT (scaleset_id) DO NOTHING
            "#,
        )
        .bind(scaleset.scaleset_id.as_uuid())
        .bind(&scaleset.pool_name)
        .bind(encode(&scaleset)?)
        .bind(scaleset.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists { entity: "scaleset" });
        }
        Ok(Versioned::new(scaleset, Version::FIRST))
    }

    async fn get_scaleset(
        &self,
        scaleset_id: ScalesetId,
    ) -> Result<Option<Versioned<Scaleset>>, StoreError> {
        let row = sqlx::query_as::<_, EntityRow>(
            "SELECT entity, version FROM scalesets WHERE scaleset_id = $1",
        )
        .bind(scaleset_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode).transpose()
    }

    async fn update_scaleset(
        &self,
        scaleset: Versioned<Scaleset>,
    ) -> Result<Versioned<Scaleset>, StoreError> {
        let mut tx = self.pool.begin().await?;
        conditional_update(
            &mut tx,
            "UPDATE scalesets SET entity = $2, version = version + 1 \
             WHERE scaleset_id = $1 AND version = $3",
            "SELECT EXISTS(SELECT 1 FROM scalesets WHERE scaleset_id = $1)",
            scaleset.value.scaleset_id.as_uuid(),
            encode(&scaleset.value)?,
            None,
            scaleset.version,
            "scaleset",
        )
        .await?;
        tx.commit().await?;
        Ok(Versioned::new(scaleset.value, scaleset.version.next()))
    }

    async fn list_scalesets_by_pool(
        &self,
        pool_name: &str,
    ) -> Result<Vec<Versioned<Scaleset>>, StoreError> {
        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT entity, version FROM scalesets WHERE pool_name = $1 \
             ORDER BY created_at, scaleset_id",
        )
        .bind(pool_name)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    async fn insert_node(&self, node: Node) -> Result<Versioned<Node>, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO nodes (machine_id, pool_name, state, entity, version, registered_at)
            VALUES ($1, $2, $3, $4, 1, $5)
            ON CONFLICT (machine_id) DO NOTHING
            "#,
        )
        .bind(node.machine_id.as_uuid())
        .bind(&node.pool_name)
        .bind(node.state.to_string())
        .bind(encode(&node)?)
        .bind(node.registered_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists { entity: "node" });
        }
        Ok(Versioned::new(node, Version::FIRST))
    }

    async fn get_node(
        &self,
        machine_id: MachineId,
    ) -> Result<Option<Versioned<Node>>, StoreError> {
        let row = sqlx::query_as::<_, EntityRow>(
            "SELECT entity, version FROM nodes WHERE machine_id = $1",
        )
        .bind(machine_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode).transpose()
    }

    async fn update_node(&self, node: Versioned<Node>) -> Result<Versioned<Node>, StoreError> {
        let mut tx = self.pool.begin().await?;
        conditional_update(
            &mut tx,
            "UPDATE nodes SET entity = $2, state = $3, version = version + 1 \
             WHERE machine_id = $1 AND version = $4",
            "SELECT EXISTS(SELECT 1 FROM nodes WHERE machine_id = $1)",
            node.value.machine_id.as_uuid(),
            encode(&node.value)?,
            Some(node.value.state.to_string()),
            node.version,
            "node",
        )
        .await?;
        tx.commit().await?;
        Ok(Versioned::new(node.value, node.version.next()))
    }

    async fn delete_node(&self, machine_id: MachineId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM node_tasks WHERE machine_id = $1")
            .bind(machine_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM nodes WHERE machine_id = $1")
            .bind(machine_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_nodes_by_state(
        &self,
        pool_name: Option<&str>,
        states: &[NodeState],
    ) -> Result<Vec<Versioned<Node>>, StoreError> {
        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT entity, version FROM nodes \
             WHERE state = ANY($1) AND ($2::TEXT IS NULL OR pool_name = $2) \
             ORDER BY registered_at, machine_id",
        )
        .bind(state_strings(states))
        .bind(pool_name)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    async fn list_node_tasks_by_task(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<NodeTask>, StoreError> {
        let rows = sqlx::query_as::<_, NodeTaskRow>(
            "SELECT machine_id, task_id, entity FROM node_tasks WHERE task_id = $1 \
             ORDER BY machine_id",
        )
        .bind(task_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(NodeTaskRow::decode).collect()
    }

    async fn list_node_tasks_by_node(
        &self,
        machine_id: MachineId,
    ) -> Result<Vec<NodeTask>, StoreError> {
        let rows = sqlx::query_as::<_, NodeTaskRow>(
            "SELECT machine_id, task_id, entity FROM node_tasks WHERE machine_id = $1 \
             ORDER BY task_id",
        )
        .bind(machine_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(NodeTaskRow::decode).collect()
    }

    async fn list_task_events(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<TaskEventRecord>, StoreError> {
        let rows: Vec<serde_json::Value> = sqlx::query_scalar(
            "SELECT entity FROM task_events WHERE task_id = $1 ORDER BY id",
        )
        .bind(task_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for job in &batch.jobs {
            conditional_update(
                &mut tx,
                "UPDATE jobs SET entity = $2, state = $3, version = version + 1 \
                 WHERE job_id = $1 AND version = $4",
                "SELECT EXISTS(SELECT 1 FROM jobs WHERE job_id = $1)",
                job.value.job_id.as_uuid(),
                encode(&job.value)?,
                Some(job.value.state.to_string()),
                job.version,
                "job",
            )
            .await?;
        }

        for task in &batch.tasks {
            conditional_update(
                &mut tx,
                "UPDATE tasks SET entity = $2, state = $3, version = version + 1 \
                 WHERE task_id = $1 AND version = $4",
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE task_id = $1)",
                task.value.task_id.as_uuid(),
                encode(&task.value)?,
                Some(task.value.state.to_string()),
                task.version,
                "task",
            )
            .await?;
        }

        for node in &batch.nodes {
            conditional_update(
                &mut tx,
                "UPDATE nodes SET entity = $2, state = $3, version = version + 1 \
                 WHERE machine_id = $1 AND version = $4",
                "SELECT EXISTS(SELECT 1 FROM nodes WHERE machine_id = $1)",
                node.value.machine_id.as_uuid(),
                encode(&node.value)?,
                Some(node.value.state.to_string()),
                node.version,
                "node",
            )
            .await?;
        }

        for scaleset in &batch.scalesets {
            conditional_update(
                &mut tx,
                "UPDATE scalesets SET entity = $2, version = version + 1 \
                 WHERE scaleset_id = $1 AND version = $3",
                "SELECT EXISTS(SELECT 1 FROM scalesets WHERE scaleset_id = $1)",
                scaleset.value.scaleset_id.as_uuid(),
                encode(&scaleset.value)?,
                None,
                scaleset.version,
                "scaleset",
            )
            .await?;
        }

        for nt in &batch.node_task_upserts {
            sqlx::query(
                r#"
                INSERT INTO node_tasks (machine_id, task_id, entity)
                VALUES ($1, $2, $3)
                ON CONFLICT (machine_id, task_id) DO UPDATE SET entity = EXCLUDED.entity
                "#,
            )
            .bind(nt.machine_id.as_uuid())
            .bind(nt.task_id.as_uuid())
            .bind(encode(nt)?)
            .execute(&mut *tx)
            .await?;
        }

        for selector in &batch.node_task_deletes {
            match selector {
                NodeTaskSelector::ByTask(task_id) => {
                    sqlx::query("DELETE FROM node_tasks WHERE task_id = $1")
                        .bind(task_id.as_uuid())
                        .execute(&mut *tx)
                        .await?;
                }
                NodeTaskSelector::ByNode(machine_id) => {
                    sqlx::query("DELETE FROM node_tasks WHERE machine_id = $1")
                        .bind(machine_id.as_uuid())
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        for record in &batch.task_events {
            sqlx::query(
                "INSERT INTO task_events (task_id, machine_id, entity, recorded_at) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(record.task_id.as_uuid())
            .bind(record.machine_id.as_uuid())
            .bind(encode(record)?)
            .bind(record.recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug)]
struct NodeTaskRow {
    entity: serde_json::Value,
}

impl NodeTaskRow {
    fn decode(self) -> Result<NodeTask, StoreError> {
        Ok(serde_json::from_value(self.entity)?)
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeTaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            entity: row.try_get("entity")?,
        })
    }
}
