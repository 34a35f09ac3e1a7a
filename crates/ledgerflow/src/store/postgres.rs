//! PostgreSQL checkpoint store.

use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::Result;
use crate::flow::FlowId;

use super::{CheckpointStore, StoreTransaction};

/// PostgreSQL-backed checkpoint store for production use.
///
/// Blobs are stored opaque; the codec owns their layout and versioning.
///
/// # Database Schema
///
/// Requires tables in the `ledgerflow` schema:
///
/// | Table               | Purpose                                        |
/// |---------------------|------------------------------------------------|
/// | `checkpoints`       | One blob per live flow, keyed by flow UUID     |
/// | `deduplication_ids` | Processed inbound message keys for replay drops|
///
/// ```sql
/// CREATE SCHEMA IF NOT EXISTS ledgerflow;
/// CREATE TABLE ledgerflow.checkpoints (
///     flow_id    UUID PRIMARY KEY,
///     blob       BYTEA NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
/// );
/// CREATE TABLE ledgerflow.deduplication_ids (
///     id          TEXT PRIMARY KEY,
///     recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
/// );
/// ```
///
/// # Concurrency
///
/// Each flow's checkpoint is one row; the per-flow single-threaded worker is
/// the only writer, so row contention only arises between a worker and the
/// manager's startup scan, which the row lock serializes.
///
/// # Example
///
/// ```ignore
/// use ledgerflow::{FlowManager, PgCheckpointStore};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let store = PgCheckpointStore::new(pool);
/// let manager = FlowManager::builder(store, "alice").build()?;
/// ```
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    /// Create a new PostgreSQL store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CheckpointStore for PgCheckpointStore {
    type Tx = PgStoreTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        let tx = self.pool.begin().await?;
        Ok(PgStoreTransaction { tx })
    }
}

/// One open PostgreSQL transaction.
pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

impl StoreTransaction for PgStoreTransaction {
    async fn add(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<()> {
        sqlx::query(
            "INSERT INTO ledgerflow.checkpoints (flow_id, blob)
             VALUES ($1, $2)",
        )
        .bind(flow_id.as_uuid())
        .bind(blob)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<()> {
        // Upsert: a restored flow's first persisted revision after its
        // checkpoint was manually repaired must not fail.
        sqlx::query(
            "INSERT INTO ledgerflow.checkpoints (flow_id, blob)
             VALUES ($1, $2)
             ON CONFLICT (flow_id)
             DO UPDATE SET blob = EXCLUDED.blob, updated_at = now()",
        )
        .bind(flow_id.as_uuid())
        .bind(blob)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn remove(&mut self, flow_id: FlowId) -> Result<()> {
        sqlx::query("DELETE FROM ledgerflow.checkpoints WHERE flow_id = $1")
            .bind(flow_id.as_uuid())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get(&mut self, flow_id: FlowId) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            "SELECT blob FROM ledgerflow.checkpoints WHERE flow_id = $1 FOR UPDATE",
        )
        .bind(flow_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("blob")))
    }

    async fn list(&mut self) -> Result<Vec<(FlowId, Vec<u8>)>> {
        let rows = sqlx::query(
            "SELECT flow_id, blob FROM ledgerflow.checkpoints ORDER BY created_at",
        )
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    FlowId::from_uuid(r.get::<Uuid, _>("flow_id")),
                    r.get::<Vec<u8>, _>("blob"),
                )
            })
            .collect())
    }

    async fn record_deduplication_ids(&mut self, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query(
                "INSERT INTO ledgerflow.deduplication_ids (id)
                 VALUES ($1)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn is_duplicate(&mut self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS hit FROM ledgerflow.deduplication_ids WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.is_some())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
