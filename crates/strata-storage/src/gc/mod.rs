//! Garbage collection
//!
//! ## Cycle
//!
//! ```text
//! event tier:  count ─► mark (LRU over counters) ─► sweep (delete | demote)
//! index tier:  count ─► mark (oldest demoted)    ─► sweep (purge serial)
//! ```
//!
//! A failure anywhere skips the rest of the cycle; the next tick retries.

mod event_tier;
mod index_tier;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use redb::Database;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::GcConfig;
use crate::error::StoreError;

/// What one collection cycle measured and changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Bytes of live `Event` entries before the sweep
    pub live_bytes: u64,
    pub live_records: usize,
    pub demoted_records: usize,
    /// Records chosen by the event tier
    pub marked: usize,
    pub demoted: usize,
    pub deleted: usize,
    /// Index bytes held by demoted records before the index sweep
    pub index_bytes: u64,
    pub index_serials_pruned: usize,
    pub index_entries_removed: usize,
}

impl GcReport {
    pub fn changed_anything(&self) -> bool {
        self.demoted + self.deleted + self.index_entries_removed > 0
    }
}

/// Run one full cycle against the database
#[instrument(skip(db, config), fields(limit = config.size_limit))]
pub(crate) fn run_cycle(
    db: &Database,
    config: &GcConfig,
    demote: bool,
) -> Result<GcReport, StoreError> {
    let mut report = GcReport::default();

    let census = event_tier::count(db)?;
    report.live_bytes = census.total;
    report.live_records = census.live.len();
    report.demoted_records = census.demoted;

    let victims = event_tier::mark(&census, config);
    report.marked = victims.len();
    let swept = event_tier::sweep(db, &victims, demote)?;
    report.demoted = swept.demoted;
    report.deleted = swept.deleted;

    let pruned = index_tier::count(db)?;
    report.index_bytes = pruned.total;
    let victims = index_tier::mark(&pruned, config);
    report.index_serials_pruned = victims.len();
    report.index_entries_removed = index_tier::sweep(db, &victims)?;

    Ok(report)
}

/// Periodic collector bound to a store
pub(crate) struct GarbageCollector {
    db: Arc<Database>,
    config: GcConfig,
    demote: Arc<AtomicBool>,
}

impl GarbageCollector {
    pub fn new(db: Arc<Database>, config: GcConfig, demote: Arc<AtomicBool>) -> Self {
        Self { db, config, demote }
    }

    /// Collect every interval until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        let period = self.config.interval();
        // First cycle one period after start
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            limit = self.config.size_limit,
            interval_secs = self.config.interval_secs,
            "garbage collector started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let db = self.db.clone();
            let config = self.config.clone();
            let demote = self.demote.load(Ordering::Relaxed);
            match tokio::task::spawn_blocking(move || run_cycle(&db, &config, demote)).await {
                Ok(Ok(report)) if report.changed_anything() => {
                    info!(
                        live_bytes = report.live_bytes,
                        demoted = report.demoted,
                        deleted = report.deleted,
                        index_entries_removed = report.index_entries_removed,
                        "gc cycle complete"
                    );
                }
                Ok(Ok(report)) => debug!(live_bytes = report.live_bytes, "gc cycle idle"),
                Ok(Err(e)) => warn!(error = %e, "gc cycle skipped"),
                Err(e) => warn!(error = %e, "gc task failed"),
            }
        }
        debug!("garbage collector stopped");
    }
}
