//! # Strata Storage
//!
//! Event storage engine for a relay: an ordered keyspace of raw records and
//! secondary indices, a streaming query executor, access-driven garbage
//! collection and an optional secondary tier for demoted payloads.
//!
//! ## Features
//!
//! - **Store trait**: The four-operation contract consumed by the protocol layer
//! - **EventStore**: Local tier backed by a single redb file
//! - **TieredStore**: Local tier plus a secondary tier, with demotion and revival
//! - **StoreHooks**: Adapter exposing any store as a pipeline sink and source
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         TieredStore                          │
//! │  ┌──────────────────────────────┐   ┌─────────────────────┐  │
//! │  │          EventStore          │   │  secondary: Store   │  │
//! │  │  planner ─► scans ─► merge   │   │                     │  │
//! │  │  mutation   access   gc      │◄──┤  revival on stubs   │  │
//! │  └──────────────┬───────────────┘   └─────────────────────┘  │
//! │                 ▼                                            │
//! │        redb: events (keys + records), meta (serial)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_storage::{EventStore, Store, StoreConfig};
//! use strata_core::Filter;
//! use tokio_util::sync::CancellationToken;
//!
//! let store = EventStore::open(StoreConfig::with_path("relay.redb")).await?;
//! store.init().await?;
//!
//! store.save(&event).await?;
//! let filter = Filter::new().with_authors([event.pubkey]).with_limit(10);
//! let events = store.query(&filter, CancellationToken::new()).await?.events().await;
//!
//! store.close().await?;
//! ```

pub mod access;
pub mod config;
pub mod error;
pub mod gc;
pub mod keys;
pub mod mutation;
pub mod pipeline;
pub mod planner;
pub mod query;
pub mod record;
pub mod serial;
pub mod store;
pub mod tables;
pub mod tiered;

// Re-exports
pub use access::{Access, AccessTracker};
pub use config::{AccessConfig, GcConfig, PollConfig, StoreConfig};
pub use error::StoreError;
pub use gc::GcReport;
pub use mutation::{DeleteOutcome, SaveOutcome};
pub use pipeline::StoreHooks;
pub use planner::{QueryPlan, ScanSpec};
pub use query::{QueryOutcome, QuerySender, QueryStream};
pub use record::Record;
pub use serial::SerialAllocator;
pub use store::EventStore;
pub use tiered::TieredStore;

use async_trait::async_trait;
use strata_core::{Event, Filter};
use tokio_util::sync::CancellationToken;

/// Storage contract consumed by the protocol layer
///
/// Implemented by the local [`EventStore`], by [`TieredStore`] and by any
/// secondary tier. All operations are cancellation-aware where they can
/// run long.
#[async_trait]
pub trait Store: Send + Sync {
    /// Start background work
    async fn init(&self) -> Result<(), StoreError>;

    /// Stop background work and flush state
    ///
    /// Further operations fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;

    /// Persist an event
    ///
    /// An id that is already stored yields [`SaveOutcome::Duplicate`];
    /// ephemeral kinds yield [`SaveOutcome::Ephemeral`] and are not written.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails; nothing is written.
    async fn save(&self, event: &Event) -> Result<SaveOutcome, StoreError>;

    /// Remove an event and every index entry derived from it
    ///
    /// Deleting an absent event is a success ([`DeleteOutcome::NotFound`]).
    async fn delete(&self, event: &Event) -> Result<DeleteOutcome, StoreError>;

    /// Stream the records matching a filter, newest first
    ///
    /// The stream is lazy and finite. Cancelling `cancel` stops every scan
    /// promptly and ends the stream with [`QueryOutcome::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidFilter`] if the filter cannot be planned.
    async fn query(
        &self,
        filter: &Filter,
        cancel: CancellationToken,
    ) -> Result<QueryStream, StoreError>;

    /// Number of records matching a filter, ignoring its limit
    async fn count(&self, filter: &Filter, cancel: CancellationToken) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The store contract must stay usable behind `Arc<dyn Store>`
    fn _assert_object_safe(_: &dyn Store) {}

    #[test]
    fn test_reexports() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert!(QueryOutcome::Complete.is_complete());
    }
}
