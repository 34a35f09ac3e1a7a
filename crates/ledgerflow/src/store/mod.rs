//! Storage abstraction for flow checkpoints.
//!
//! This module provides the [`CheckpointStore`] and [`StoreTransaction`]
//! traits that abstract over different storage backends. Two implementations
//! are provided:
//!
//! - [`InMemoryStore`] — process-local storage for tests and embedded hosts
//! - [`PgCheckpointStore`] — PostgreSQL storage (requires the `postgres`
//!   feature)

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::future::Future;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgCheckpointStore;

use crate::error::Result;
use crate::flow::FlowId;

/// Storage backend for checkpoint blobs.
///
/// The store never interprets blob contents; encoding and versioning are the
/// checkpoint codec's concern. Transaction handles are explicit values — the
/// worker threads one through the transition and action layers rather than
/// hiding it in ambient context, so "a transaction is open on entry" is a
/// typed fact instead of a runtime check.
pub trait CheckpointStore: Send + Sync + Clone + 'static {
    /// The transaction type produced by this store.
    type Tx: StoreTransaction;

    /// Open a new transaction.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;
}

/// One open store transaction.
///
/// All operations stage changes; nothing is visible to other transactions
/// until [`commit`](Self::commit). Dropping the value without committing
/// rolls everything back.
pub trait StoreTransaction: Send {
    /// Insert the checkpoint for a new flow.
    fn add(&mut self, flow_id: FlowId, blob: Vec<u8>)
        -> impl Future<Output = Result<()>> + Send;

    /// Replace the checkpoint of an existing flow.
    fn update(
        &mut self,
        flow_id: FlowId,
        blob: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete a flow's checkpoint.
    fn remove(&mut self, flow_id: FlowId) -> impl Future<Output = Result<()>> + Send;

    /// Fetch a flow's checkpoint blob, observing staged changes.
    fn get(&mut self, flow_id: FlowId) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// List every stored checkpoint.
    fn list(&mut self) -> impl Future<Output = Result<Vec<(FlowId, Vec<u8>)>>> + Send;

    /// Record deduplication keys of processed inbound messages, so replays
    /// are dropped after a restart.
    fn record_deduplication_ids(
        &mut self,
        ids: &[String],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Whether an inbound message with this deduplication key was already
    /// processed by a committed transaction.
    fn is_duplicate(&mut self, id: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Commit all staged changes.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    /// Discard all staged changes.
    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}
