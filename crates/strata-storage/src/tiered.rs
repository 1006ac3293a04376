//! Local tier plus a secondary tier
//!
//! ## Query Flow
//!
//! ```text
//! query(filter)
//!   ├─ local stream ──────┐
//!   │    └─ stub ──► point query to secondary ──► revive locally (async)
//!   │                     │           │
//!   └─ secondary stream ──┼───────────┴──► heap merge ──► de-duplicate ──► QueryStream
//! ```
//!
//! Both inner streams and the fetched payloads merge newest first, in the
//! order the local executor uses. A record is held back while a lookup for
//! a newer stub is still running.
//!
//! Wrapping an [`EventStore`] switches its garbage collector to demotion:
//! swept records keep their indices and leave a stub, and the payload is
//! fetched from the secondary tier on the next hit.
//!
//! With `poll.interval_secs` set, a background task also pulls recent
//! records from the secondary tier into the local one and announces them
//! through [`TieredStore::subscribe`].

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool};

use async_trait::async_trait;
use dashmap::DashSet;
use strata_core::{Event, EventId, Filter};
use tokio::sync::broadcast;
use tokio::task::{self, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

use crate::Store;
use crate::config::PollConfig;
use crate::error::StoreError;
use crate::mutation::{DeleteOutcome, SaveOutcome};
use crate::query::{QueryOutcome, QuerySender, QueryStream};
use crate::record::Record;
use crate::store::EventStore;

/// Pulled records buffered per subscriber before the oldest are skipped
const SYNC_CHANNEL_DEPTH: usize = 256;

/// Two-tier store: a local [`EventStore`] backed by a secondary [`Store`]
pub struct TieredStore {
    local: EventStore,
    secondary: Arc<dyn Store>,
    /// Background re-saves of revived records
    revivals: TaskTracker,
    /// Ids with a revival in flight
    reviving: Arc<DashSet<EventId>>,
    /// Secondary-tier polling
    background: TaskTracker,
    shutdown: CancellationToken,
    polling: AtomicBool,
    synced: broadcast::Sender<Event>,
}

impl TieredStore {
    pub fn new(local: EventStore, secondary: Arc<dyn Store>) -> Self {
        local.set_demotion(true);
        let (synced, _) = broadcast::channel(SYNC_CHANNEL_DEPTH);
        Self {
            local,
            secondary,
            revivals: TaskTracker::new(),
            reviving: Arc::new(DashSet::new()),
            background: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            polling: AtomicBool::new(false),
            synced,
        }
    }

    pub fn local(&self) -> &EventStore {
        &self.local
    }

    pub fn secondary(&self) -> &Arc<dyn Store> {
        &self.secondary
    }

    /// Records that polling copied from the secondary tier into the local one
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.synced.subscribe()
    }

    /// Wait for every revival started so far
    pub async fn settle(&self) {
        self.revivals.close();
        self.revivals.wait().await;
        self.revivals.reopen();
    }
}

#[async_trait]
impl Store for TieredStore {
    async fn init(&self) -> Result<(), StoreError> {
        let (local, secondary) = tokio::join!(self.local.init(), self.secondary.init());
        collect_errors([local, secondary])?;

        let poll = &self.local.config().poll;
        if poll.enabled() && !self.polling.swap(true, atomic::Ordering::AcqRel) {
            let poller = Poller {
                local: self.local.clone(),
                secondary: self.secondary.clone(),
                config: poll.clone(),
                synced: self.synced.clone(),
            };
            self.background.spawn(poller.run(self.shutdown.clone()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.shutdown.cancel();
        self.background.close();
        self.background.wait().await;
        self.settle().await;
        let (local, secondary) = tokio::join!(self.local.close(), self.secondary.close());
        collect_errors([local, secondary])
    }

    #[instrument(skip(self, event), fields(id = %event.id))]
    async fn save(&self, event: &Event) -> Result<SaveOutcome, StoreError> {
        let (local, secondary) = tokio::join!(self.local.save(event), self.secondary.save(event));
        match (local, secondary) {
            (Ok(outcome), Ok(_)) => Ok(outcome),
            (local, secondary) => Err(StoreError::Tiers(
                [local.err(), secondary.err()].into_iter().flatten().collect(),
            )),
        }
    }

    #[instrument(skip(self, event), fields(id = %event.id))]
    async fn delete(&self, event: &Event) -> Result<DeleteOutcome, StoreError> {
        let (local, secondary) =
            tokio::join!(self.local.delete(event), self.secondary.delete(event));
        match (local, secondary) {
            (Ok(DeleteOutcome::NotFound), Ok(DeleteOutcome::NotFound)) => Ok(DeleteOutcome::NotFound),
            (Ok(_), Ok(_)) => Ok(DeleteOutcome::Deleted),
            (local, secondary) => Err(StoreError::Tiers(
                [local.err(), secondary.err()].into_iter().flatten().collect(),
            )),
        }
    }

    #[instrument(skip(self, filter, cancel))]
    async fn query(
        &self,
        filter: &Filter,
        cancel: CancellationToken,
    ) -> Result<QueryStream, StoreError> {
        let local = self.local.query(filter, cancel.child_token()).await?;
        let secondary = match self.secondary.query(filter, cancel.child_token()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "secondary tier query failed");
                QueryStream::empty(QueryOutcome::Partial { failed_scans: 1 })
            }
        };

        let (sender, stream) = QueryStream::channel(self.local.config().scan_queue_depth);
        let forward = Forward {
            filter: filter.clone(),
            limit: self.local.config().effective_limit(filter.limit),
            local: self.local.clone(),
            secondary: self.secondary.clone(),
            revivals: self.revivals.clone(),
            reviving: self.reviving.clone(),
            cancel,
        };
        tokio::spawn(forward.run(local, secondary, sender));
        Ok(stream)
    }

    /// The larger of the two tiers' counts
    ///
    /// A failing tier is logged and ignored while the other one answers.
    async fn count(&self, filter: &Filter, cancel: CancellationToken) -> Result<usize, StoreError> {
        let (local, secondary) = tokio::join!(
            self.local.count(filter, cancel.child_token()),
            self.secondary.count(filter, cancel.child_token()),
        );
        match (local, secondary) {
            (Ok(a), Ok(b)) => Ok(a.max(b)),
            (Ok(n), Err(e)) | (Err(e), Ok(n)) => {
                warn!(error = %e, "tier count failed");
                Ok(n)
            }
            (Err(a), Err(b)) => Err(StoreError::Tiers(vec![a, b])),
        }
    }
}

fn collect_errors<const N: usize>(results: [Result<(), StoreError>; N]) -> Result<(), StoreError> {
    let errors: Vec<_> = results.into_iter().filter_map(Result::err).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StoreError::Tiers(errors))
    }
}

/// Merge position: newest first, then smaller id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rank {
    created_at: i64,
    id: EventId,
}

impl Rank {
    fn of(record: &Record) -> Self {
        Self {
            created_at: record.created_at(),
            id: *record.id(),
        }
    }
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Local,
    Secondary,
    Lookup,
}

/// A record waiting in the merge heap
struct Ranked {
    rank: Rank,
    source: Source,
    record: Record,
}

impl Ranked {
    fn new(record: Record, source: Source) -> Self {
        Self {
            rank: Rank::of(&record),
            source,
            record,
        }
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank.cmp(&other.rank)
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank
    }
}

impl Eq for Ranked {}

/// The query was cancelled or its consumer went away
struct Stopped;

/// Mutable state of one tiered merge
///
/// The heap holds at most one record per inner stream, plus every fetched
/// payload not yet emitted.
struct Merge {
    local: QueryStream,
    secondary: QueryStream,
    heap: BinaryHeap<Ranked>,
    /// Stubs whose payload is still being fetched
    pending: BTreeSet<Rank>,
    lookups: JoinSet<Result<Option<Event>, StoreError>>,
    lookup_ranks: HashMap<task::Id, Rank>,
    failed_lookups: usize,
}

impl Merge {
    fn new(local: QueryStream, secondary: QueryStream) -> Self {
        Self {
            local,
            secondary,
            heap: BinaryHeap::new(),
            pending: BTreeSet::new(),
            lookups: JoinSet::new(),
            lookup_ranks: HashMap::new(),
            failed_lookups: 0,
        }
    }

    /// Whether a stub newer than every ready record is still unresolved
    fn awaiting_lookup(&self) -> bool {
        self.pending
            .last()
            .is_some_and(|newest| self.heap.peek().is_none_or(|top| *newest > top.rank))
    }
}

/// State of one tiered query
struct Forward {
    filter: Filter,
    limit: usize,
    local: EventStore,
    secondary: Arc<dyn Store>,
    revivals: TaskTracker,
    reviving: Arc<DashSet<EventId>>,
    cancel: CancellationToken,
}

impl Forward {
    async fn run(self, local: QueryStream, secondary: QueryStream, sender: QuerySender) {
        let mut merge = Merge::new(local, secondary);
        let mut seen = HashSet::new();
        let mut delivered = 0;

        let stopped = 'merge: {
            for source in [Source::Local, Source::Secondary] {
                if self.pull(&mut merge, source).await.is_err() {
                    break 'merge true;
                }
            }

            while delivered < self.limit {
                if merge.awaiting_lookup() {
                    if self.resolve(&mut merge).await.is_err() {
                        break 'merge true;
                    }
                    continue;
                }

                let Some(Ranked { record, source, .. }) = merge.heap.pop() else {
                    break;
                };
                if self.pull(&mut merge, source).await.is_err() {
                    break 'merge true;
                }
                if !seen.insert(*record.id()) {
                    continue;
                }

                let sent = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => false,
                    ok = sender.send(record) => ok,
                };
                if !sent {
                    break 'merge true;
                }
                delivered += 1;
            }
            false
        };

        let limit_reached = delivered >= self.limit;
        merge.lookups.abort_all();
        let outcomes = [merge.local.finish().await, merge.secondary.finish().await];
        let outcome = if stopped {
            QueryOutcome::Cancelled
        } else {
            combine(outcomes, limit_reached, merge.failed_lookups)
        };
        sender.finish(outcome);
    }

    /// Refill the heap from the stream a record was just taken from
    ///
    /// Local stubs go to the secondary tier and leave the stream's slot to
    /// the next record.
    async fn pull(&self, merge: &mut Merge, source: Source) -> Result<(), Stopped> {
        loop {
            let stream = match source {
                Source::Local => &mut merge.local,
                Source::Secondary => &mut merge.secondary,
                Source::Lookup => return Ok(()),
            };
            let record = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Stopped),
                record = stream.next() => record,
            };
            match record {
                None => return Ok(()),
                Some(Record::Stub { id, created_at }) if source == Source::Local => {
                    self.lookup(merge, Rank { created_at, id });
                }
                Some(record) => {
                    merge.heap.push(Ranked::new(record, source));
                    return Ok(());
                }
            }
        }
    }

    fn lookup(&self, merge: &mut Merge, rank: Rank) {
        if !merge.pending.insert(rank) {
            return;
        }
        trace!(id = %rank.id, "local stub, fetching from secondary");
        let handle = merge.lookups.spawn(fetch_full(
            self.secondary.clone(),
            rank.id,
            self.cancel.child_token(),
        ));
        merge.lookup_ranks.insert(handle.id(), rank);
    }

    /// Wait for one lookup and queue its payload
    async fn resolve(&self, merge: &mut Merge) -> Result<(), Stopped> {
        let joined = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Stopped),
            joined = merge.lookups.join_next_with_id() => joined,
        };
        let Some(joined) = joined else {
            merge.pending.clear();
            return Ok(());
        };

        let task = match &joined {
            Ok((task, _)) => *task,
            Err(e) => e.id(),
        };
        if let Some(rank) = merge.lookup_ranks.remove(&task) {
            merge.pending.remove(&rank);
        }

        match joined {
            Ok((_, Ok(Some(event)))) => {
                self.revive(event.clone());
                if self.filter.matches(&event) {
                    merge.heap.push(Ranked::new(Record::Full(event), Source::Lookup));
                }
            }
            Ok((_, Ok(None))) => debug!("stub has no payload in the secondary tier"),
            Ok((_, Err(e))) => {
                warn!(error = %e, "secondary point query failed");
                merge.failed_lookups += 1;
            }
            Err(e) => {
                warn!(error = %e, "secondary point query panicked");
                merge.failed_lookups += 1;
            }
        }
        Ok(())
    }

    /// Re-save a payload fetched from the secondary tier
    fn revive(&self, event: Event) {
        if !self.reviving.insert(event.id) {
            trace!(id = %event.id, "revival already running");
            return;
        }
        let local = self.local.clone();
        let reviving = self.reviving.clone();
        self.revivals.spawn(async move {
            match local.save(&event).await {
                Ok(outcome) => debug!(id = %event.id, ?outcome, "revived record"),
                Err(e) => warn!(id = %event.id, error = %e, "revival failed"),
            }
            reviving.remove(&event.id);
        });
    }
}

async fn fetch_full(
    secondary: Arc<dyn Store>,
    id: EventId,
    cancel: CancellationToken,
) -> Result<Option<Event>, StoreError> {
    let filter = Filter::new().with_ids([id]).with_limit(1);
    let mut stream = secondary.query(&filter, cancel).await?;
    while let Some(record) = stream.next().await {
        if let Record::Full(event) = record {
            if event.id == id {
                return Ok(Some(event));
            }
        }
    }
    Ok(None)
}

/// Copies recent secondary-tier records into the local tier
struct Poller {
    local: EventStore,
    secondary: Arc<dyn Store>,
    config: PollConfig,
    synced: broadcast::Sender<Event>,
}

impl Poller {
    /// Poll every interval until `shutdown` fires
    ///
    /// Each window starts `overlap` intervals before the previous one
    /// ended, so records that reach the secondary tier late are still seen.
    async fn run(self, shutdown: CancellationToken) {
        let period = self.config.interval();
        let overlap = i64::try_from(self.config.overlap().as_secs()).unwrap_or(i64::MAX);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = period.as_secs(),
            overlap_secs = overlap,
            "secondary tier polling started"
        );

        let mut since = chrono::Utc::now().timestamp();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let until = chrono::Utc::now().timestamp();
            match self.poll(since, until, &shutdown).await {
                Ok(pulled) => {
                    if pulled > 0 {
                        debug!(pulled, since, until, "pulled records from secondary tier");
                    }
                    since = until.saturating_sub(overlap);
                }
                Err(StoreError::Cancelled) => break,
                Err(e) => warn!(error = %e, "secondary tier poll failed"),
            }
        }
        debug!("secondary tier polling stopped");
    }

    /// Save every secondary record in `[since, until]` locally
    ///
    /// Returns how many were new to the local tier.
    async fn poll(
        &self,
        since: i64,
        until: i64,
        shutdown: &CancellationToken,
    ) -> Result<usize, StoreError> {
        let filter = Filter::new().with_since(since).with_until(until);
        let mut stream = self.secondary.query(&filter, shutdown.child_token()).await?;

        let mut pulled = 0;
        while let Some(record) = stream.next().await {
            let Record::Full(event) = record else {
                continue;
            };
            match self.local.save(&event).await? {
                SaveOutcome::Stored | SaveOutcome::Revived => {
                    pulled += 1;
                    // No subscribers is fine
                    let _ = self.synced.send(event);
                }
                outcome => trace!(id = %event.id, ?outcome, "already local"),
            }
        }

        match stream.finish().await {
            QueryOutcome::Cancelled => Err(StoreError::Cancelled),
            QueryOutcome::Partial { failed_scans } => {
                debug!(failed_scans, "partial secondary poll");
                Ok(pulled)
            }
            _ => Ok(pulled),
        }
    }
}

/// Terminal status of a tiered query from its two inner streams
///
/// Inner streams stopped by reaching the limit report `Cancelled`; that
/// counts as a normal end.
fn combine(outcomes: [QueryOutcome; 2], limit_reached: bool, failed_lookups: usize) -> QueryOutcome {
    let mut failed = failed_lookups;
    let mut aborted = false;
    let mut cancelled = false;
    for outcome in outcomes {
        match outcome {
            QueryOutcome::Complete => {}
            QueryOutcome::Partial { failed_scans } => failed += failed_scans,
            QueryOutcome::Aborted => aborted = true,
            QueryOutcome::Cancelled => cancelled |= !limit_reached,
        }
    }

    if failed > 0 {
        QueryOutcome::Partial {
            failed_scans: failed,
        }
    } else if aborted {
        QueryOutcome::Aborted
    } else if cancelled {
        QueryOutcome::Cancelled
    } else {
        QueryOutcome::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(id: u8, created_at: i64) -> Record {
        Record::Stub {
            id: EventId::new([id; 32]),
            created_at,
        }
    }

    #[test]
    fn test_rank_newest_then_smaller_id() {
        let mut heap: BinaryHeap<Ranked> = [stub(3, 100), stub(1, 300), stub(2, 100), stub(4, 200)]
            .into_iter()
            .map(|record| Ranked::new(record, Source::Local))
            .collect();
        let mut order = Vec::new();
        while let Some(ranked) = heap.pop() {
            order.push(ranked.record.id().as_bytes()[0]);
        }
        assert_eq!(order, vec![1, 4, 2, 3]);
    }

    #[test]
    fn test_newer_pending_lookup_holds_back_records() {
        let done = || QueryStream::empty(QueryOutcome::Complete);
        let mut merge = Merge::new(done(), done());
        assert!(!merge.awaiting_lookup());

        merge.heap.push(Ranked::new(stub(2, 200), Source::Secondary));
        merge.pending.insert(Rank::of(&stub(1, 100)));
        assert!(!merge.awaiting_lookup());

        merge.pending.insert(Rank::of(&stub(3, 300)));
        assert!(merge.awaiting_lookup());

        merge.heap.clear();
        merge.pending.clear();
        merge.pending.insert(Rank::of(&stub(1, 100)));
        assert!(merge.awaiting_lookup());
    }

    #[test]
    fn test_combine_complete() {
        let outcome = combine([QueryOutcome::Complete, QueryOutcome::Complete], false, 0);
        assert_eq!(outcome, QueryOutcome::Complete);
    }

    #[test]
    fn test_combine_limit_masks_cancel() {
        let outcome = combine([QueryOutcome::Cancelled, QueryOutcome::Complete], true, 0);
        assert_eq!(outcome, QueryOutcome::Complete);

        let outcome = combine([QueryOutcome::Cancelled, QueryOutcome::Complete], false, 0);
        assert_eq!(outcome, QueryOutcome::Cancelled);
    }

    #[test]
    fn test_combine_failures_add_up() {
        let outcome = combine(
            [
                QueryOutcome::Partial { failed_scans: 2 },
                QueryOutcome::Aborted,
            ],
            false,
            1,
        );
        assert_eq!(outcome, QueryOutcome::Partial { failed_scans: 3 });
    }

    #[test]
    fn test_collect_errors() {
        assert!(collect_errors([Ok(()), Ok(())]).is_ok());
        match collect_errors([Err(StoreError::Closed), Ok(())]) {
            Err(StoreError::Tiers(errors)) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
