//! Event-tier collection: bound the bytes held by full records
//!
//! Count sums the `Event` entries of live records and joins their counters.
//! Mark picks least recently accessed records until the total would fall
//! to the low-water mark. Sweep either deletes victims outright or, when a
//! secondary tier holds the payloads, demotes them to stubs.

use std::collections::HashMap;

use redb::{Database, ReadableTable};
use strata_core::EventId;
use tracing::{debug, warn};

use crate::config::GcConfig;
use crate::error::StoreError;
use crate::keys::{IndexKind, counter_key, event_key, serial_of};
use crate::mutation::remove_record;
use crate::record::{CounterValue, StoredValue, decode_value, is_stub};
use crate::tables::EVENTS;

/// Victims swept per write transaction
const SWEEP_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LiveEntry {
    pub serial: u64,
    /// Key plus value bytes of the `Event` entry
    pub size: u64,
    pub last_access: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Census {
    pub live: Vec<LiveEntry>,
    pub demoted: usize,
    pub total: u64,
}

pub(crate) fn count(db: &Database) -> Result<Census, StoreError> {
    let txn = db.begin_read()?;
    let table = txn.open_table(EVENTS)?;

    let mut last_access = HashMap::new();
    let counters = IndexKind::Counter;
    for entry in table.range::<&[u8]>(counters.lower_bound().as_slice()..counters.upper_bound().as_slice())? {
        let (key, value) = entry?;
        let Some(serial) = serial_of(key.value()) else {
            continue;
        };
        match CounterValue::decode(value.value()) {
            Ok(counter) => {
                last_access.insert(serial, counter.last_access);
            }
            Err(e) => warn!(serial, error = %e, "unreadable counter, treating as never accessed"),
        }
    }

    let mut census = Census::default();
    let events = IndexKind::Event;
    for entry in table.range::<&[u8]>(events.lower_bound().as_slice()..events.upper_bound().as_slice())? {
        let (key, value) = entry?;
        let (key, value) = (key.value(), value.value());
        let Some(serial) = serial_of(key) else {
            continue;
        };
        if is_stub(value) {
            census.demoted += 1;
            continue;
        }
        let size = (key.len() + value.len()) as u64;
        census.total += size;
        census.live.push(LiveEntry {
            serial,
            size,
            last_access: last_access.get(&serial).copied().unwrap_or(0),
        });
    }
    Ok(census)
}

/// Serials to evict, least recently accessed first
pub(crate) fn mark(census: &Census, config: &GcConfig) -> Vec<u64> {
    if !config.enabled() || census.total < config.high_mark() {
        return Vec::new();
    }

    let low = config.low_mark();
    let mut candidates: Vec<&LiveEntry> = census.live.iter().collect();
    candidates.sort_by_key(|e| (e.last_access, e.serial));

    let mut remaining = census.total;
    let mut victims = Vec::new();
    for entry in candidates {
        if remaining <= low {
            break;
        }
        victims.push(entry.serial);
        remaining = remaining.saturating_sub(entry.size);
    }
    debug!(
        total = census.total,
        target = low,
        victims = victims.len(),
        "event tier marked"
    );
    victims
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Swept {
    pub demoted: usize,
    pub deleted: usize,
}

pub(crate) fn sweep(db: &Database, victims: &[u64], demote: bool) -> Result<Swept, StoreError> {
    let mut swept = Swept::default();
    for chunk in victims.chunks(SWEEP_BATCH) {
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(EVENTS)?;
            for &serial in chunk {
                let key = event_key(serial);
                let decoded = match table.get(key.as_slice())? {
                    Some(value) => decode_value(value.value()),
                    None => continue,
                };
                match decoded {
                    Ok(StoredValue::Full(event)) if demote => {
                        demote_record(&mut table, &event.id, serial)?;
                        swept.demoted += 1;
                    }
                    Ok(StoredValue::Full(event)) => {
                        remove_record(&mut table, &event, serial)?;
                        swept.deleted += 1;
                    }
                    Ok(StoredValue::Stub(_)) => {}
                    Err(e) => warn!(serial, error = %e, "cannot sweep corrupt record"),
                }
            }
        }
        txn.commit()?;
    }
    Ok(swept)
}

/// Replace the payload with the id stub and drop the counter
fn demote_record(
    table: &mut redb::Table<'_, &'static [u8], &'static [u8]>,
    id: &EventId,
    serial: u64,
) -> Result<(), StoreError> {
    table.insert(event_key(serial).as_slice(), id.as_bytes().as_slice())?;
    table.remove(counter_key(id, serial).as_slice())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn census(entries: &[(u64, u64, u64)]) -> Census {
        let live: Vec<LiveEntry> = entries
            .iter()
            .map(|&(serial, size, last_access)| LiveEntry {
                serial,
                size,
                last_access,
            })
            .collect();
        let total = live.iter().map(|e| e.size).sum();
        Census {
            live,
            demoted: 0,
            total,
        }
    }

    fn config(size_limit: u64, low: u8, high: u8) -> GcConfig {
        GcConfig {
            size_limit,
            low_water: low,
            high_water: high,
            ..GcConfig::default()
        }
    }

    #[test]
    fn test_below_high_water_marks_nothing() {
        let c = census(&[(1, 100, 5), (2, 100, 6)]);
        assert!(mark(&c, &config(1000, 50, 80)).is_empty());
    }

    #[test]
    fn test_oldest_access_marked_first() {
        // total 400 of limit 400: high 320, low 200
        let c = census(&[(1, 100, 30), (2, 100, 10), (3, 100, 20), (4, 100, 40)]);
        let victims = mark(&c, &config(400, 50, 80));
        assert_eq!(victims, vec![2, 3]);
    }

    #[test]
    fn test_ties_broken_by_serial() {
        let c = census(&[(9, 100, 0), (4, 100, 0), (7, 100, 0)]);
        let victims = mark(&c, &config(300, 60, 90));
        assert_eq!(victims, vec![4, 7]);
    }

    #[test]
    fn test_disabled_without_size_limit() {
        let c = census(&[(1, 100, 0)]);
        assert!(mark(&c, &config(0, 50, 80)).is_empty());
    }
}
