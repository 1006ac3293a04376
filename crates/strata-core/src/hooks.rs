//! Capability traits for the relay's event pipeline
//!
//! The protocol layer composes admission checks, storage destinations and
//! query providers as ordered lists of trait objects. Storage backends plug
//! in as sinks and sources without knowing about the pipeline.
//!
//! ## Pipeline Flow
//!
//! ```text
//! publish(event)
//!     ├── gates, in order: first Reject wins
//!     └── sinks, in order: every sink runs, errors collected
//!
//! query(filter)
//!     └── sources, in order: results merged newest-first, de-duplicated by id
//! ```

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::HookError;
use crate::event::Event;
use crate::filter::Filter;

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Admission check run before an event reaches any sink
#[async_trait]
pub trait EventGate: Send + Sync {
    /// Decide whether the event may be accepted
    async fn check(&self, event: &Event) -> Verdict;
}

/// Destination for accepted events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Persist or forward an accepted event
    ///
    /// # Errors
    ///
    /// Returns [`HookError::Sink`] if the destination failed.
    async fn store(&self, event: &Event) -> Result<(), HookError>;
}

/// Provider of events for a filter
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetch events matching the filter, newest first
    ///
    /// # Errors
    ///
    /// Returns [`HookError::Source`] if the provider failed.
    async fn fetch(&self, filter: &Filter) -> Result<Vec<Event>, HookError>;
}

/// Ordered lists of gates, sinks and sources
#[derive(Default)]
pub struct HookPipeline {
    gates: Vec<Box<dyn EventGate>>,
    sinks: Vec<Box<dyn EventSink>>,
    sources: Vec<Box<dyn EventSource>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gate(mut self, gate: impl EventGate + 'static) -> Self {
        self.gates.push(Box::new(gate));
        self
    }

    pub fn with_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn with_source(mut self, source: impl EventSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Run every gate in order; the first rejection wins
    pub async fn admit(&self, event: &Event) -> Verdict {
        for gate in &self.gates {
            if let Verdict::Reject(reason) = gate.check(event).await {
                debug!(id = %event.id, %reason, "event rejected");
                return Verdict::Reject(reason);
            }
        }
        Verdict::Accept
    }

    /// Admit the event and hand it to every sink
    ///
    /// A rejected event reaches no sink. Sink failures do not stop later
    /// sinks; they are returned together once all sinks have run.
    pub async fn publish(&self, event: &Event) -> Result<Verdict, HookError> {
        let verdict = self.admit(event).await;
        if !verdict.is_accept() {
            return Ok(verdict);
        }

        let mut errors = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.store(event).await {
                warn!(id = %event.id, error = %e, "sink failed");
                errors.push(e);
            }
        }

        match errors.len() {
            0 => Ok(Verdict::Accept),
            1 => Err(errors.remove(0)),
            _ => Err(HookError::Multiple(errors)),
        }
    }

    /// Gather events from every source
    ///
    /// Failing sources are logged and skipped.
    pub async fn query(&self, filter: &Filter) -> Vec<Event> {
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for source in &self.sources {
            match source.fetch(filter).await {
                Ok(batch) => {
                    events.extend(batch.into_iter().filter(|ev| seen.insert(ev.id)));
                }
                Err(e) => warn!(error = %e, "source failed"),
            }
        }

        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit.filter(|l| *l > 0) {
            events.truncate(limit);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::event::{EventId, PublicKey, Signature};
    use crate::kind::Kind;

    fn event(id: u8, created_at: i64) -> Event {
        Event {
            id: EventId::new([id; 32]),
            pubkey: PublicKey::new([1; 32]),
            created_at,
            kind: Kind::TEXT_NOTE,
            tags: vec![],
            content: String::new(),
            sig: Signature::new([0; 64]),
        }
    }

    struct KindGate(Kind);

    #[async_trait]
    impl EventGate for KindGate {
        async fn check(&self, event: &Event) -> Verdict {
            if event.kind == self.0 {
                Verdict::Accept
            } else {
                Verdict::Reject(format!("kind {} not allowed", event.kind))
            }
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<EventId>>);

    #[async_trait]
    impl EventSink for std::sync::Arc<Recorder> {
        async fn store(&self, event: &Event) -> Result<(), HookError> {
            self.0.lock().unwrap().push(event.id);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl EventSink for Broken {
        async fn store(&self, _event: &Event) -> Result<(), HookError> {
            Err(HookError::Sink("disk full".into()))
        }
    }

    struct Fixed(Vec<Event>);

    #[async_trait]
    impl EventSource for Fixed {
        async fn fetch(&self, _filter: &Filter) -> Result<Vec<Event>, HookError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_rejected_event_reaches_no_sink() {
        let recorder = std::sync::Arc::new(Recorder::default());
        let pipeline = HookPipeline::new()
            .with_gate(KindGate(Kind(7)))
            .with_sink(recorder.clone());

        let verdict = pipeline.publish(&event(1, 1)).await.unwrap();
        assert!(matches!(verdict, Verdict::Reject(_)));
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_errors_do_not_stop_later_sinks() {
        let recorder = std::sync::Arc::new(Recorder::default());
        let pipeline = HookPipeline::new()
            .with_sink(Broken)
            .with_sink(recorder.clone());

        let err = pipeline.publish(&event(1, 1)).await.unwrap_err();
        assert!(matches!(err, HookError::Sink(_)));
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_query_merges_sources() {
        let pipeline = HookPipeline::new()
            .with_source(Fixed(vec![event(1, 10), event(2, 30)]))
            .with_source(Fixed(vec![event(2, 30), event(3, 20)]));

        let events = pipeline.query(&Filter::new().with_limit(2)).await;
        let ids: Vec<u8> = events.iter().map(|e| e.id.as_bytes()[0]).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_admit_without_gates_accepts() {
        let pipeline = HookPipeline::new();
        let verdict = tokio_test::block_on(pipeline.admit(&event(1, 1)));
        assert_eq!(verdict, Verdict::Accept);
    }
}
