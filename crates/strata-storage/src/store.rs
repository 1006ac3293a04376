//! Local event store backed by redb

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use redb::Database;
use strata_core::{Event, Filter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::Store;
use crate::access::AccessTracker;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::gc::{GarbageCollector, GcReport, run_cycle};
use crate::mutation::{self, DeleteOutcome, SaveOutcome};
use crate::planner;
use crate::query::{self, QueryStream, ScanContext};
use crate::serial::SerialAllocator;
use crate::tables::open_database;

/// Event store over a single redb file
///
/// Cheap to clone; clones share the database and background tasks.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<Database>,
    config: StoreConfig,
    serials: SerialAllocator,
    access: AccessTracker,
    /// Sweep demotes instead of deleting; set when a secondary tier exists
    demote: Arc<AtomicBool>,
    /// Process-lifetime signal for background tasks
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    gc_started: AtomicBool,
    closed: AtomicBool,
}

impl EventStore {
    /// Open or create the database and start the access tracker
    ///
    /// Garbage collection starts with [`Store::init`].
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let (db, serials) = {
            let config = config.clone();
            tokio::task::spawn_blocking(move || {
                let db = Arc::new(open_database(&config)?);
                let serials = SerialAllocator::open(db.clone(), config.serial_batch)?;
                Ok::<_, StoreError>((db, serials))
            })
            .await??
        };

        let shutdown = CancellationToken::new();
        let (access, access_task) =
            AccessTracker::spawn(db.clone(), config.access.clone(), shutdown.clone());

        info!("Event store opened");
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                config,
                serials,
                access,
                demote: Arc::new(AtomicBool::new(false)),
                shutdown,
                tasks: Mutex::new(vec![access_task]),
                gc_started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Demote swept records to stubs instead of deleting them
    ///
    /// Only meaningful when another tier still holds the full payloads.
    pub fn set_demotion(&self, enabled: bool) {
        self.inner.demote.store(enabled, Ordering::Relaxed);
    }

    pub fn demotes(&self) -> bool {
        self.inner.demote.load(Ordering::Relaxed)
    }

    /// Run one garbage collection cycle now
    pub async fn collect_garbage(&self) -> Result<GcReport, StoreError> {
        self.ensure_open()?;
        let db = self.inner.db.clone();
        let config = self.inner.config.gc.clone();
        let demote = self.demotes();
        tokio::task::spawn_blocking(move || run_cycle(&db, &config, demote)).await?
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn scan_context(&self) -> ScanContext {
        ScanContext {
            db: self.inner.db.clone(),
            page_size: self.inner.config.scan_page_size,
            queue_depth: self.inner.config.scan_queue_depth,
        }
    }

    #[cfg(test)]
    pub(crate) fn database(&self) -> &Arc<Database> {
        &self.inner.db
    }
}

#[async_trait]
impl Store for EventStore {
    async fn init(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let gc = &self.inner.config.gc;
        if gc.enabled() && !self.inner.gc_started.swap(true, Ordering::AcqRel) {
            let collector =
                GarbageCollector::new(self.inner.db.clone(), gc.clone(), self.inner.demote.clone());
            let handle = tokio::spawn(collector.run(self.inner.shutdown.clone()));
            self.inner.tasks.lock().push(handle);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.serials.release()).await??;
        info!("Event store closed");
        Ok(())
    }

    #[instrument(skip(self, event), fields(id = %event.id, kind = %event.kind))]
    async fn save(&self, event: &Event) -> Result<SaveOutcome, StoreError> {
        self.ensure_open()?;
        let inner = self.inner.clone();
        let event = event.clone();
        tokio::task::spawn_blocking(move || mutation::save(&inner.db, &inner.serials, &event))
            .await?
    }

    #[instrument(skip(self, event), fields(id = %event.id))]
    async fn delete(&self, event: &Event) -> Result<DeleteOutcome, StoreError> {
        self.ensure_open()?;
        let db = self.inner.db.clone();
        let event = event.clone();
        tokio::task::spawn_blocking(move || mutation::delete(&db, &event)).await?
    }

    #[instrument(skip(self, filter, cancel))]
    async fn query(
        &self,
        filter: &Filter,
        cancel: CancellationToken,
    ) -> Result<QueryStream, StoreError> {
        self.ensure_open()?;
        let plan = planner::plan(filter)?;
        let limit = self.inner.config.effective_limit(filter.limit);
        debug!(index = ?plan.index(), scans = plan.scans.len(), limit, "query planned");
        Ok(query::execute(
            self.scan_context(),
            plan,
            limit,
            Some(self.inner.access.clone()),
            cancel,
        ))
    }

    #[instrument(skip(self, filter, cancel))]
    async fn count(&self, filter: &Filter, cancel: CancellationToken) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let plan = planner::plan(filter)?;
        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || query::count_blocking(&db, &plan, &cancel)).await?
    }
}

#[cfg(test)]
mod tests {
    use strata_core::{EventId, Kind, PublicKey, Signature};
    use tempfile::TempDir;

    use super::*;
    use crate::access::{Access, touch};
    use crate::query::QueryOutcome;

    fn event(id: u8, created_at: i64) -> Event {
        Event {
            id: EventId::new([id; 32]),
            pubkey: PublicKey::new([3; 32]),
            created_at,
            kind: Kind::TEXT_NOTE,
            tags: vec![],
            content: "x".repeat(200),
            sig: Signature::new([0; 64]),
        }
    }

    async fn open_store(dir: &TempDir) -> EventStore {
        EventStore::open(StoreConfig::with_path(dir.path().join("store.redb")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.init().await.unwrap();
        store.close().await.unwrap();
        // Second close is a no-op
        store.close().await.unwrap();

        assert!(matches!(store.save(&event(1, 1)).await, Err(StoreError::Closed)));
        assert!(matches!(
            store.query(&Filter::new(), CancellationToken::new()).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::with_path(dir.path().join("bad.redb"));
        config.max_limit = 0;
        assert!(matches!(
            EventStore::open(config).await,
            Err(StoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_serials_resume_after_reopen() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.save(&event(1, 10)).await.unwrap();
        let next = store.inner.serials.peek();
        store.close().await.unwrap();
        drop(store);

        let store = open_store(&dir).await;
        assert_eq!(store.inner.serials.peek(), next);
        store.save(&event(2, 20)).await.unwrap();
        let events = store
            .query(&Filter::new(), CancellationToken::new())
            .await
            .unwrap()
            .events()
            .await;
        assert_eq!(events.len(), 2);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_collect_garbage_evicts_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::with_path(dir.path().join("gc.redb"));
        // Roughly four records fit under the high mark
        config.gc.size_limit = 1600;
        let store = EventStore::open(config).await.unwrap();

        for id in 1..=6u8 {
            store.save(&event(id, i64::from(id))).await.unwrap();
        }

        // Event 1 is the oldest but the most recently read
        let serial = {
            let txn = store.database().begin_read().unwrap();
            let table = txn.open_table(crate::tables::EVENTS).unwrap();
            crate::tables::locate(&table, &EventId::new([1; 32]))
                .unwrap()
                .unwrap()
                .serial
        };
        let touched = touch(
            store.database(),
            &[Access {
                id: EventId::new([1; 32]),
                serial,
            }],
            u64::MAX / 2,
        )
        .unwrap();
        assert_eq!(touched, 1);

        let report = store.collect_garbage().await.unwrap();
        assert!(report.deleted > 0);
        assert_eq!(report.demoted, 0);

        let stream = store
            .query(&Filter::new().with_ids([EventId::new([1; 32])]), CancellationToken::new())
            .await
            .unwrap();
        let (records, outcome) = stream.collect().await;
        assert_eq!(outcome, QueryOutcome::Complete);
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_stub());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_demotion_toggle() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        assert!(!store.demotes());
        store.set_demotion(true);
        assert!(store.clone().demotes());
        store.close().await.unwrap();
    }
}
