//! Monotonic serial allocation
//!
//! Serials are leased from a persistent upper bound in batches. The bound is
//! committed before any serial of the batch is handed out, so a crash can
//! waste at most one batch but never reissue a serial.

use std::sync::Arc;

use parking_lot::Mutex;
use redb::Database;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::tables::{META, META_SERIAL};

#[derive(Debug)]
struct Lease {
    /// Next serial to hand out
    next: u64,
    /// First serial not covered by the persisted bound
    limit: u64,
}

/// Allocator of unique, strictly increasing serials
pub struct SerialAllocator {
    db: Arc<Database>,
    batch: u64,
    lease: Mutex<Lease>,
}

impl SerialAllocator {
    /// Resume from the persisted bound
    pub fn open(db: Arc<Database>, batch: u64) -> Result<Self, StoreError> {
        let start = read_bound(&db)?;
        debug!(start, batch, "Serial allocator opened");
        Ok(Self {
            db,
            batch: batch.max(1),
            lease: Mutex::new(Lease {
                next: start,
                limit: start,
            }),
        })
    }

    /// Allocate the next serial
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SerialAllocation`] if a new lease cannot be
    /// persisted; no serial is issued in that case.
    pub fn next(&self) -> Result<u64, StoreError> {
        let mut lease = self.lease.lock();
        if lease.next >= lease.limit {
            let limit = lease
                .next
                .checked_add(self.batch)
                .ok_or_else(|| StoreError::SerialAllocation("serial space exhausted".into()))?;
            write_bound(&self.db, limit)?;
            trace!(from = lease.next, to = limit, "Leased serials");
            lease.limit = limit;
        }
        let serial = lease.next;
        lease.next += 1;
        Ok(serial)
    }

    /// Persist the first unissued serial as the bound
    ///
    /// Called on clean shutdown so the unused remainder of the lease is
    /// handed out again after restart.
    pub fn release(&self) -> Result<(), StoreError> {
        let mut lease = self.lease.lock();
        write_bound(&self.db, lease.next)?;
        lease.limit = lease.next;
        debug!(next = lease.next, "Serial lease released");
        Ok(())
    }

    /// Serial the next call to [`next`](Self::next) will return
    pub fn peek(&self) -> u64 {
        self.lease.lock().next
    }
}

fn read_bound(db: &Database) -> Result<u64, StoreError> {
    let txn = db.begin_read().map_err(allocation)?;
    let meta = txn.open_table(META).map_err(allocation)?;
    let bound = meta.get(META_SERIAL).map_err(allocation)?;
    Ok(bound.map(|v| v.value()).unwrap_or(0))
}

fn write_bound(db: &Database, bound: u64) -> Result<(), StoreError> {
    let txn = db.begin_write().map_err(allocation)?;
    {
        let mut meta = txn.open_table(META).map_err(allocation)?;
        meta.insert(META_SERIAL, bound).map_err(allocation)?;
    }
    txn.commit().map_err(allocation)?;
    Ok(())
}

fn allocation(err: impl std::fmt::Display) -> StoreError {
    StoreError::SerialAllocation(err.to_string())
}
