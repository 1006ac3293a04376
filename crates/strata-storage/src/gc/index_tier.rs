//! Index-tier collection: bound what demoted records leave behind
//!
//! A demoted record keeps every index entry so it stays discoverable. Those
//! entries get their own budget, the headroom above the event tier's
//! high-water mark. Once over it, the oldest demoted records lose all of
//! their keys and become unreachable through this store.
//!
//! Demotion drops the access counter, so recency here is approximated by
//! `created_at`, then serial.
//!
//! The sweep also drops tag entries left behind by demoted records that a
//! replaceable save displaced.

use std::collections::{HashMap, HashSet};

use redb::{Database, ReadableTable};
use tracing::debug;

use crate::config::GcConfig;
use crate::error::StoreError;
use crate::keys::{IndexKind, event_key, kind_of, serial_of, timestamp_of};
use crate::mutation::purge_serials;
use crate::record::is_stub;
use crate::tables::{EVENTS, PURGE};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PrunedRecord {
    pub serial: u64,
    pub created_at: u64,
    /// Bytes of the record's index keys
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Census {
    pub records: Vec<PrunedRecord>,
    pub total: u64,
}

pub(crate) fn count(db: &Database) -> Result<Census, StoreError> {
    let txn = db.begin_read()?;
    let table = txn.open_table(EVENTS)?;

    let events = IndexKind::Event;
    let mut pruned: HashMap<u64, PrunedRecord> = HashMap::new();
    for entry in table.range::<&[u8]>(events.lower_bound().as_slice()..events.upper_bound().as_slice())? {
        let (key, value) = entry?;
        if !is_stub(value.value()) {
            continue;
        }
        if let Some(serial) = serial_of(key.value()) {
            pruned.insert(
                serial,
                PrunedRecord {
                    serial,
                    ..Default::default()
                },
            );
        }
    }
    if pruned.is_empty() {
        return Ok(Census::default());
    }

    let lower = IndexKind::CreatedAt.lower_bound();
    let upper = IndexKind::Counter.lower_bound();
    let mut total = 0;
    for entry in table.range::<&[u8]>(lower.as_slice()..upper.as_slice())? {
        let (key, _) = entry?;
        let key = key.value();
        let Some(record) = serial_of(key).and_then(|s| pruned.get_mut(&s)) else {
            continue;
        };
        record.bytes += key.len() as u64;
        total += key.len() as u64;
        if kind_of(key) == Some(IndexKind::CreatedAt) {
            record.created_at = timestamp_of(key).unwrap_or(0);
        }
    }

    Ok(Census {
        records: pruned.into_values().collect(),
        total,
    })
}

/// Demoted serials to drop, oldest first
pub(crate) fn mark(census: &Census, config: &GcConfig) -> Vec<u64> {
    if !config.enabled() || census.total < config.index_high_mark() {
        return Vec::new();
    }

    let low = config.index_low_mark();
    let mut candidates: Vec<&PrunedRecord> = census.records.iter().collect();
    candidates.sort_by_key(|r| (r.created_at, r.serial));

    let mut remaining = census.total;
    let mut victims = Vec::new();
    for record in candidates {
        if remaining <= low {
            break;
        }
        victims.push(record.serial);
        remaining = remaining.saturating_sub(record.bytes);
    }
    debug!(
        total = census.total,
        target = low,
        victims = victims.len(),
        "index tier marked"
    );
    victims
}

/// Remove every key of the victims that are still demoted, plus the
/// leftovers of displaced demoted records
///
/// A victim revived since the count keeps its keys. All serials go through
/// one pass over the index layouts. Returns the number of keys removed.
pub(crate) fn sweep(db: &Database, victims: &[u64]) -> Result<usize, StoreError> {
    let txn = db.begin_write()?;
    let removed = {
        let mut table = txn.open_table(EVENTS)?;
        let mut purge = txn.open_table(PURGE)?;

        let mut doomed = HashSet::with_capacity(victims.len());
        for entry in purge.iter()? {
            doomed.insert(entry?.0.value());
        }
        let queued = doomed.len();
        for &serial in victims {
            let still_demoted = table
                .get(event_key(serial).as_slice())?
                .is_some_and(|value| is_stub(value.value()));
            if still_demoted {
                doomed.insert(serial);
            }
        }
        if doomed.is_empty() {
            None
        } else {
            let removed = purge_serials(&mut table, &doomed)?;
            purge.retain(|_, _| false)?;
            debug!(serials = doomed.len(), queued, removed, "index tier swept");
            Some(removed)
        }
    };

    match removed {
        Some(removed) => {
            txn.commit()?;
            Ok(removed)
        }
        None => {
            txn.abort()?;
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use strata_core::{Event, EventId, Kind, PublicKey, Signature, Tag};
    use tempfile::TempDir;

    use super::*;
    use crate::config::StoreConfig;
    use crate::keys::counter_key;
    use crate::mutation::{SaveOutcome, save};
    use crate::serial::SerialAllocator;
    use crate::tables::{locate, open_database};

    fn profile(id: u8, created_at: i64) -> Event {
        Event {
            id: EventId::new([id; 32]),
            pubkey: PublicKey::new([0x0d; 32]),
            created_at,
            kind: Kind(0),
            tags: vec![Tag::new(["t", "profile"]), Tag::new(["r", "wss://relay"])],
            content: String::new(),
            sig: Signature::new([0; 64]),
        }
    }

    fn keys_of(db: &Database, serial: u64) -> usize {
        let txn = db.begin_read().unwrap();
        let table = txn.open_table(EVENTS).unwrap();
        table
            .iter()
            .unwrap()
            .filter(|entry| serial_of(entry.as_ref().unwrap().0.value()) == Some(serial))
            .count()
    }

    #[test]
    fn test_sweep_drops_displaced_leftovers() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(open_database(&StoreConfig::with_path(dir.path().join("gc.redb"))).unwrap());
        let serials = SerialAllocator::open(db.clone(), 10).unwrap();

        let old = profile(1, 10);
        save(&db, &serials, &old).unwrap();
        let serial = {
            let txn = db.begin_write().unwrap();
            let serial = {
                let mut table = txn.open_table(EVENTS).unwrap();
                let serial = locate(&table, &old.id).unwrap().unwrap().serial;
                table
                    .insert(event_key(serial).as_slice(), old.id.as_bytes().as_slice())
                    .unwrap();
                table.remove(counter_key(&old.id, serial).as_slice()).unwrap();
                serial
            };
            txn.commit().unwrap();
            serial
        };

        assert_eq!(save(&db, &serials, &profile(2, 20)).unwrap(), SaveOutcome::Stored);
        assert_eq!(keys_of(&db, serial), 2);

        assert_eq!(sweep(&db, &[]).unwrap(), 2);
        assert_eq!(keys_of(&db, serial), 0);
        assert_eq!(sweep(&db, &[]).unwrap(), 0);
    }

    fn census(records: &[(u64, u64, u64)]) -> Census {
        let records: Vec<PrunedRecord> = records
            .iter()
            .map(|&(serial, created_at, bytes)| PrunedRecord {
                serial,
                created_at,
                bytes,
            })
            .collect();
        let total = records.iter().map(|r| r.bytes).sum();
        Census { records, total }
    }

    #[test]
    fn test_headroom_budget() {
        // limit 1000, event high 80 => headroom 200; index marks 100 / 50
        let config = GcConfig {
            size_limit: 1000,
            low_water: 50,
            high_water: 80,
            index_low_water: 25,
            index_high_water: 50,
            ..GcConfig::default()
        };
        let under = census(&[(1, 10, 40), (2, 20, 40)]);
        assert!(mark(&under, &config).is_empty());

        let over = census(&[(1, 30, 40), (2, 10, 40), (3, 20, 40)]);
        assert_eq!(mark(&over, &config), vec![2, 3]);
    }
}
