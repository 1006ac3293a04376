//! Last-access tracking for garbage collection
//!
//! Query hits are queued without waiting; a background task batches them
//! and stamps the matching `Counter` entries with the current time.
//! Demoted or deleted records have no counter and are skipped.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use redb::{Database, ReadableTable};
use strata_core::EventId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::AccessConfig;
use crate::error::StoreError;
use crate::keys::counter_key;
use crate::record::{CounterValue, now};
use crate::tables::EVENTS;

/// One query hit to stamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub id: EventId,
    pub serial: u64,
}

/// Handle for queueing access records
#[derive(Clone)]
pub struct AccessTracker {
    tx: mpsc::Sender<Access>,
}

impl AccessTracker {
    /// Start the background task that applies queued accesses
    pub fn spawn(
        db: Arc<Database>,
        config: AccessConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let handle = tokio::spawn(run(db, config, rx, shutdown));
        (Self { tx }, handle)
    }

    /// Queue an access without waiting
    ///
    /// A full queue drops the record; recency is best-effort.
    pub fn record(&self, id: EventId, serial: u64) {
        match self.tx.try_send(Access { id, serial }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(access)) => {
                trace!(serial = access.serial, "access queue full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

async fn run(
    db: Arc<Database>,
    config: AccessConfig,
    mut rx: mpsc::Receiver<Access>,
    shutdown: CancellationToken,
) {
    let batch_size = config.batch_size.max(1);
    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            access = rx.recv() => match access {
                Some(access) => access,
                None => break,
            },
        };

        let mut batch = vec![first];
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(access) => batch.push(access),
                Err(_) => break,
            }
        }
        flush(&db, &config, batch).await;
    }

    // Apply whatever was queued before shutdown
    rx.close();
    let mut rest = Vec::new();
    while let Ok(access) = rx.try_recv() {
        rest.push(access);
    }
    if !rest.is_empty() {
        flush(&db, &config, rest).await;
    }
    debug!("access tracker stopped");
}

/// Apply a batch, retrying with jittered backoff up to the attempt limit
async fn flush(db: &Arc<Database>, config: &AccessConfig, batch: Vec<Access>) {
    let batch = Arc::new(batch);
    let attempts = config.max_attempts.max(1);
    for attempt in 1..=attempts {
        let db = db.clone();
        let work = batch.clone();
        let result = tokio::task::spawn_blocking(move || touch(&db, &work, now())).await;
        match result {
            Ok(Ok(updated)) => {
                trace!(updated, attempt, "access batch applied");
                return;
            }
            Ok(Err(e)) => {
                debug!(attempt, error = %e, "access batch failed, retrying");
            }
            Err(e) => {
                warn!(error = %e, "access batch task failed");
                return;
            }
        }
        let jitter = rand::rng().random_range(0..=config.retry_base_ms);
        let delay = config.retry_base_ms.saturating_mul(u64::from(attempt)) + jitter;
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    warn!(
        dropped = batch.len(),
        error = %StoreError::Conflict(attempts),
        "access batch abandoned"
    );
}

/// Stamp the counters of a batch with `at`; returns the number updated
pub(crate) fn touch(db: &Database, batch: &[Access], at: u64) -> Result<usize, StoreError> {
    let txn = db.begin_write()?;
    let mut updated = 0;
    {
        let mut table = txn.open_table(EVENTS)?;
        for access in batch {
            let key = counter_key(&access.id, access.serial);
            let current = match table.get(key.as_slice())? {
                Some(value) => CounterValue::decode(value.value())?,
                None => continue,
            };
            if current.last_access >= at {
                continue;
            }
            let stamped = CounterValue {
                last_access: at,
                ..current
            };
            table.insert(key.as_slice(), stamped.encode().as_slice())?;
            updated += 1;
        }
    }
    txn.commit()?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::StoreConfig;
    use crate::tables::open_database;

    fn create_test_db(dir: &TempDir) -> Arc<Database> {
        let config = StoreConfig::with_path(dir.path().join("access.redb"));
        Arc::new(open_database(&config).unwrap())
    }

    fn put_counter(db: &Database, id: &EventId, serial: u64, counter: CounterValue) {
        let txn = db.begin_write().unwrap();
        {
            let mut table = txn.open_table(EVENTS).unwrap();
            table
                .insert(counter_key(id, serial).as_slice(), counter.encode().as_slice())
                .unwrap();
        }
        txn.commit().unwrap();
    }

    fn read_counter(db: &Database, id: &EventId, serial: u64) -> Option<CounterValue> {
        let txn = db.begin_read().unwrap();
        let table = txn.open_table(EVENTS).unwrap();
        table
            .get(counter_key(id, serial).as_slice())
            .unwrap()
            .map(|v| CounterValue::decode(v.value()).unwrap())
    }

    #[test]
    fn test_touch_updates_existing_counters_only() {
        let dir = TempDir::new().unwrap();
        let db = create_test_db(&dir);
        let live = EventId::new([1; 32]);
        let demoted = EventId::new([2; 32]);
        put_counter(&db, &live, 10, CounterValue::new(100, 64));

        let batch = [
            Access { id: live, serial: 10 },
            Access { id: demoted, serial: 11 },
        ];
        assert_eq!(touch(&db, &batch, 500).unwrap(), 1);
        assert_eq!(read_counter(&db, &live, 10), Some(CounterValue::new(500, 64)));
        assert_eq!(read_counter(&db, &demoted, 11), None);
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let dir = TempDir::new().unwrap();
        let db = create_test_db(&dir);
        let id = EventId::new([1; 32]);
        put_counter(&db, &id, 1, CounterValue::new(900, 8));
        assert_eq!(touch(&db, &[Access { id, serial: 1 }], 500).unwrap(), 0);
        assert_eq!(read_counter(&db, &id, 1).unwrap().last_access, 900);
    }

    #[tokio::test]
    async fn test_tracker_applies_accesses_while_running() {
        let dir = TempDir::new().unwrap();
        let db = create_test_db(&dir);
        let id = EventId::new([3; 32]);
        put_counter(&db, &id, 7, CounterValue::new(1, 16));

        let shutdown = CancellationToken::new();
        let (tracker, handle) = AccessTracker::spawn(db.clone(), AccessConfig::default(), shutdown.clone());
        tracker.record(id, 7);

        let mut stamped = false;
        for _ in 0..100 {
            if read_counter(&db, &id, 7).is_some_and(|c| c.last_access > 1) {
                stamped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stamped);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_tracker_drains_queue_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let db = create_test_db(&dir);
        let first = EventId::new([4; 32]);
        let second = EventId::new([5; 32]);
        put_counter(&db, &first, 1, CounterValue::new(1, 16));
        put_counter(&db, &second, 2, CounterValue::new(1, 32));

        // Nothing yields before the cancel, so the task is first polled
        // after shutdown and only the drain applies these
        let shutdown = CancellationToken::new();
        let (tracker, handle) = AccessTracker::spawn(db.clone(), AccessConfig::default(), shutdown.clone());
        tracker.record(first, 1);
        tracker.record(second, 2);
        shutdown.cancel();
        handle.await.unwrap();

        let first = read_counter(&db, &first, 1).unwrap();
        let second = read_counter(&db, &second, 2).unwrap();
        assert!(first.last_access > 1);
        assert!(second.last_access > 1);
        assert_eq!(first.size, 16);
        assert_eq!(second.size, 32);
    }

    #[tokio::test]
    async fn test_record_after_shutdown_is_harmless() {
        let dir = TempDir::new().unwrap();
        let shutdown = CancellationToken::new();
        let (tracker, handle) =
            AccessTracker::spawn(create_test_db(&dir), AccessConfig::default(), shutdown.clone());
        shutdown.cancel();
        handle.await.unwrap();
        tracker.record(EventId::new([0; 32]), 0);
    }
}
