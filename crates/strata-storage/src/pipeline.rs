//! Hook pipeline adapter
//!
//! Exposes any [`Store`] as an [`EventSink`] and [`EventSource`] so it can
//! be registered with a [`HookPipeline`](strata_core::HookPipeline).

use async_trait::async_trait;
use strata_core::{Event, EventSink, EventSource, Filter, HookError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Store;
use crate::mutation::SaveOutcome;
use crate::query::QueryOutcome;

/// Pipeline sink and source backed by a store
pub struct StoreHooks<S> {
    store: S,
}

impl<S: Store> StoreHooks<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: Store> EventSink for StoreHooks<S> {
    /// Duplicates, superseded replaceables and ephemeral events are accepted
    /// without error; only storage failures are reported.
    async fn store(&self, event: &Event) -> Result<(), HookError> {
        match self.store.save(event).await {
            Ok(SaveOutcome::Stored | SaveOutcome::Revived) => Ok(()),
            Ok(outcome) => {
                debug!(id = %event.id, ?outcome, "event not written");
                Ok(())
            }
            Err(e) => Err(HookError::Sink(e.to_string())),
        }
    }
}

#[async_trait]
impl<S: Store> EventSource for StoreHooks<S> {
    /// Full events only; stubs carry no payload to hand out
    async fn fetch(&self, filter: &Filter) -> Result<Vec<Event>, HookError> {
        let stream = self
            .store
            .query(filter, CancellationToken::new())
            .await
            .map_err(|e| HookError::Source(e.to_string()))?;

        let (records, outcome) = stream.collect().await;
        if let QueryOutcome::Partial { failed_scans } = outcome {
            debug!(failed_scans, "partial results");
        }
        Ok(records.into_iter().filter_map(|r| r.into_event()).collect())
    }
}
