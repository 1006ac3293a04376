//! Query execution
//!
//! ## Query Flow
//!
//! ```text
//! plan ──► scan worker 0 ──► bounded queue ──┐
//!      ──► scan worker 1 ──► bounded queue ──┼──► heap merge ──► QueryStream
//!      ──► scan worker n ──► bounded queue ──┘        │
//!                                                      └──► access tracker
//! ```
//!
//! Each worker walks its prefix newest-first in pages. A page is read in its
//! own short read transaction on the blocking pool, so no transaction is
//! ever held while a worker waits on its queue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use redb::{Database, ReadableTable};
use strata_core::{Event, Filter};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::access::AccessTracker;
use crate::error::StoreError;
use crate::keys::{event_key, serial_of, timestamp_of};
use crate::planner::{QueryPlan, ScanSpec};
use crate::record::{Record, StoredValue, decode_value};
use crate::tables::EVENTS;

/// How a query stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Every scan ran to its end or the limit was reached
    Complete,
    /// The caller cancelled or dropped the stream
    Cancelled,
    /// Some scans failed; results may be missing
    Partial { failed_scans: usize },
    /// The producer stopped without reporting
    Aborted,
}

impl QueryOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, QueryOutcome::Complete)
    }
}

/// Lazy, finite stream of query results
///
/// Records arrive newest-first. After the last record, [`finish`](Self::finish)
/// tells a normal end apart from a cancelled or degraded one.
pub struct QueryStream {
    records: mpsc::Receiver<Record>,
    outcome: oneshot::Receiver<QueryOutcome>,
}

impl QueryStream {
    /// Create a stream and the handle that feeds it
    pub fn channel(buffer: usize) -> (QuerySender, QueryStream) {
        let (records_tx, records) = mpsc::channel(buffer.max(1));
        let (outcome_tx, outcome) = oneshot::channel();
        (
            QuerySender {
                records: records_tx,
                outcome: Some(outcome_tx),
            },
            QueryStream { records, outcome },
        )
    }

    /// A stream that yields nothing and reports `outcome`
    pub fn empty(outcome: QueryOutcome) -> QueryStream {
        let (sender, stream) = Self::channel(1);
        sender.finish(outcome);
        stream
    }

    /// Next record, or `None` once the producer is done
    pub async fn next(&mut self) -> Option<Record> {
        self.records.recv().await
    }

    /// Stop reading and wait for the terminal status
    pub async fn finish(mut self) -> QueryOutcome {
        self.records.close();
        self.outcome.await.unwrap_or(QueryOutcome::Aborted)
    }

    /// Drain every record and the terminal status
    pub async fn collect(mut self) -> (Vec<Record>, QueryOutcome) {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record);
        }
        let outcome = self.finish().await;
        (records, outcome)
    }

    /// Drain the full events, dropping stubs
    pub async fn events(self) -> Vec<Event> {
        let (records, _) = self.collect().await;
        records.into_iter().filter_map(Record::into_event).collect()
    }
}

/// Producer half of a [`QueryStream`]
pub struct QuerySender {
    records: mpsc::Sender<Record>,
    outcome: Option<oneshot::Sender<QueryOutcome>>,
}

impl QuerySender {
    /// Deliver a record; `false` once the consumer has gone away
    pub async fn send(&self, record: Record) -> bool {
        self.records.send(record).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.records.is_closed()
    }

    /// Report the terminal status and close the stream
    pub fn finish(mut self, outcome: QueryOutcome) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Settings shared by every scan of a store
#[derive(Clone)]
pub(crate) struct ScanContext {
    pub db: Arc<Database>,
    pub page_size: usize,
    pub queue_depth: usize,
}

/// One resolved index hit
#[derive(Debug)]
struct Hit {
    serial: u64,
    created_at: i64,
    record: Record,
}

struct Page {
    hits: Vec<Hit>,
    /// Exclusive upper bound for the next page; `None` once exhausted
    resume: Option<Vec<u8>>,
}

/// Start executing a plan and return its stream immediately
pub(crate) fn execute(
    ctx: ScanContext,
    plan: QueryPlan,
    limit: usize,
    access: Option<AccessTracker>,
    cancel: CancellationToken,
) -> QueryStream {
    let (sender, stream) = QueryStream::channel(ctx.queue_depth);
    tokio::spawn(run_query(ctx, plan, limit, access, cancel, sender));
    stream
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeEnd {
    Exhausted,
    Limit,
    Cancelled,
}

async fn run_query(
    ctx: ScanContext,
    plan: QueryPlan,
    limit: usize,
    access: Option<AccessTracker>,
    cancel: CancellationToken,
    sender: QuerySender,
) {
    let scan_token = cancel.child_token();
    let residual = plan.residual.map(Arc::new);

    let mut receivers = Vec::with_capacity(plan.scans.len());
    let mut workers = Vec::with_capacity(plan.scans.len());
    for spec in plan.scans {
        let (tx, rx) = mpsc::channel(ctx.queue_depth.max(1));
        workers.push(tokio::spawn(scan_worker(
            ctx.clone(),
            Arc::new(spec),
            residual.clone(),
            plan.since,
            tx,
            scan_token.clone(),
        )));
        receivers.push(rx);
    }

    let end = merge(&mut receivers, &sender, limit, access.as_ref(), &cancel).await;
    scan_token.cancel();
    drop(receivers);

    let mut failed_scans = 0;
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "scan worker failed");
                failed_scans += 1;
            }
            Err(e) => {
                warn!(error = %e, "scan worker panicked");
                failed_scans += 1;
            }
        }
    }

    let outcome = match end {
        MergeEnd::Cancelled => QueryOutcome::Cancelled,
        _ if failed_scans > 0 => QueryOutcome::Partial { failed_scans },
        _ => QueryOutcome::Complete,
    };
    debug!(?outcome, ?end, "query finished");
    sender.finish(outcome);
}

/// Merge order: newest first, then smaller id, then earlier scan
struct Head {
    hit: Hit,
    scan: usize,
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hit
            .created_at
            .cmp(&other.hit.created_at)
            .then_with(|| other.hit.record.id().cmp(self.hit.record.id()))
            .then_with(|| other.scan.cmp(&self.scan))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

async fn recv(rx: &mut mpsc::Receiver<Hit>, cancel: &CancellationToken) -> Result<Option<Hit>, ()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(()),
        hit = rx.recv() => Ok(hit),
    }
}

async fn merge(
    receivers: &mut [mpsc::Receiver<Hit>],
    sender: &QuerySender,
    limit: usize,
    access: Option<&AccessTracker>,
    cancel: &CancellationToken,
) -> MergeEnd {
    let mut heap = BinaryHeap::with_capacity(receivers.len());
    for (scan, rx) in receivers.iter_mut().enumerate() {
        match recv(rx, cancel).await {
            Ok(Some(hit)) => heap.push(Head { hit, scan }),
            Ok(None) => {}
            Err(()) => return MergeEnd::Cancelled,
        }
    }

    let mut seen = HashSet::new();
    let mut emitted = 0;
    while let Some(Head { hit, scan }) = heap.pop() {
        match recv(&mut receivers[scan], cancel).await {
            Ok(Some(next)) => heap.push(Head { hit: next, scan }),
            Ok(None) => {}
            Err(()) => return MergeEnd::Cancelled,
        }

        if !seen.insert(hit.serial) {
            continue;
        }
        if let (Some(access), Record::Full(event)) = (access, &hit.record) {
            access.record(event.id, hit.serial);
        }
        trace!(serial = hit.serial, created_at = hit.created_at, "emit");

        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            ok = sender.send(hit.record) => ok,
        };
        if !delivered {
            return MergeEnd::Cancelled;
        }

        emitted += 1;
        if emitted >= limit {
            return MergeEnd::Limit;
        }
    }
    MergeEnd::Exhausted
}

async fn scan_worker(
    ctx: ScanContext,
    spec: Arc<ScanSpec>,
    residual: Option<Arc<Filter>>,
    since: u64,
    tx: mpsc::Sender<Hit>,
    cancel: CancellationToken,
) -> Result<(), StoreError> {
    let mut upper = spec.start_key();
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let page = {
            let db = ctx.db.clone();
            let spec = spec.clone();
            let residual = residual.clone();
            let page_size = ctx.page_size;
            tokio::task::spawn_blocking(move || {
                read_page(&db, &spec, &upper, since, residual.as_deref(), page_size)
            })
            .await??
        };

        for hit in page.hits {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = tx.send(hit) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        match page.resume {
            Some(next) => upper = next,
            None => return Ok(()),
        }
    }
}

fn read_page(
    db: &Database,
    spec: &ScanSpec,
    upper: &[u8],
    since: u64,
    residual: Option<&Filter>,
    page_size: usize,
) -> Result<Page, StoreError> {
    let txn = db.begin_read()?;
    let table = txn.open_table(EVENTS)?;
    let key_len = spec.key_len();

    let mut hits = Vec::new();
    let mut scanned = 0;
    for entry in table.range::<&[u8]>(spec.prefix.as_slice()..upper)?.rev() {
        let (key, _) = entry?;
        let key = key.value();
        scanned += 1;

        if key.len() == key_len {
            let ts = if spec.skip_timestamp {
                None
            } else {
                let ts = timestamp_of(key).unwrap_or(0);
                if ts < since {
                    return Ok(Page { hits, resume: None });
                }
                Some(ts)
            };
            if let Some(hit) = resolve(&table, key, ts, residual)? {
                hits.push(hit);
            }
        }

        if scanned >= page_size {
            return Ok(Page {
                hits,
                resume: Some(key.to_vec()),
            });
        }
    }
    Ok(Page { hits, resume: None })
}

/// Fetch the record behind an index key and apply the residual filter
fn resolve<T>(
    table: &T,
    key: &[u8],
    ts: Option<u64>,
    residual: Option<&Filter>,
) -> Result<Option<Hit>, StoreError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let Some(serial) = serial_of(key) else {
        return Ok(None);
    };
    // Tag entries of a displaced demoted record wait for the index tier
    let Some(value) = table.get(event_key(serial).as_slice())? else {
        trace!(serial, "index entry without record");
        return Ok(None);
    };

    match decode_value(value.value()) {
        Ok(StoredValue::Stub(id)) => {
            if residual.is_some_and(|f| !f.matches_stub(&id)) {
                return Ok(None);
            }
            let created_at = ts.map(|t| i64::try_from(t).unwrap_or(i64::MAX)).unwrap_or(0);
            Ok(Some(Hit {
                serial,
                created_at,
                record: Record::Stub { id, created_at },
            }))
        }
        Ok(StoredValue::Full(event)) => {
            if residual.is_some_and(|f| !f.matches(&event)) {
                return Ok(None);
            }
            Ok(Some(Hit {
                serial,
                created_at: event.created_at,
                record: Record::Full(event),
            }))
        }
        Err(e) => {
            warn!(serial, error = %e, "skipping corrupt record");
            Ok(None)
        }
    }
}

/// Count distinct records matched by a plan, ignoring any limit
pub(crate) fn count_blocking(
    db: &Database,
    plan: &QueryPlan,
    cancel: &CancellationToken,
) -> Result<usize, StoreError> {
    let txn = db.begin_read()?;
    let table = txn.open_table(EVENTS)?;
    let residual = plan.residual.as_ref();

    let mut seen = HashSet::new();
    for spec in &plan.scans {
        let upper = spec.start_key();
        let key_len = spec.key_len();
        for entry in table.range::<&[u8]>(spec.prefix.as_slice()..upper.as_slice())?.rev() {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let (key, _) = entry?;
            let key = key.value();
            if key.len() != key_len {
                continue;
            }
            let ts = if spec.skip_timestamp {
                None
            } else {
                let ts = timestamp_of(key).unwrap_or(0);
                if ts < plan.since {
                    break;
                }
                Some(ts)
            };
            let Some(serial) = serial_of(key) else {
                continue;
            };
            if seen.contains(&serial) {
                continue;
            }
            if residual.is_none() || resolve(&table, key, ts, residual)?.is_some() {
                seen.insert(serial);
            }
        }
    }
    Ok(seen.len())
}
