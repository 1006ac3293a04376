//! Save and delete
//!
//! Every mutation runs in a single write transaction, so a record and all
//! of its index entries appear and disappear together.

use std::collections::HashSet;

use redb::{Database, ReadableTable, Table};
use strata_core::{Event, EventId, is_older};
use tracing::{debug, trace, warn};

use crate::error::StoreError;
use crate::keys::{
    IndexKind, SERIAL_LEN, TIMESTAMP_LEN, counter_key, event_key, index_keys,
    pubkey_kind_prefix, serial_of, timestamp_of, untagged_keys,
};
use crate::record::{CounterValue, StoredValue, decode_value, encode_event, now};
use crate::serial::SerialAllocator;
use crate::tables::{EMPTY, EVENTS, Located, PURGE, locate};

type EventsTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;
pub(crate) type PurgeTable<'txn> = Table<'txn, u64, ()>;

/// Result of a save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// New record written with a fresh serial
    Stored,
    /// A record with this id already exists
    Duplicate,
    /// A demoted record got its payload and counter back
    Revived,
    /// A newer replaceable record exists; nothing written
    Superseded,
    /// Ephemeral kinds are never persisted
    Ephemeral,
}

/// Result of a delete; both variants are success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Earlier record displaced by a replaceable save
#[derive(Debug)]
enum Prior {
    Full { serial: u64, event: Event },
    Stub {
        serial: u64,
        id: EventId,
        created_at: i64,
    },
}

#[derive(Debug, Default)]
struct Replacement {
    displaced: Vec<Prior>,
    superseded: bool,
}

pub(crate) fn save(
    db: &Database,
    serials: &SerialAllocator,
    event: &Event,
) -> Result<SaveOutcome, StoreError> {
    if event.kind.is_ephemeral() {
        trace!(id = %event.id, "ephemeral event not persisted");
        return Ok(SaveOutcome::Ephemeral);
    }
    let value = encode_event(event)?;

    let existing = {
        let txn = db.begin_read()?;
        let table = txn.open_table(EVENTS)?;
        locate(&table, &event.id)?
    };
    if matches!(existing, Some(Located { stub: false, .. })) {
        return Ok(SaveOutcome::Duplicate);
    }

    // Allocated outside the write transaction; the allocator commits its
    // own lease and redb admits one writer at a time.
    let serial = serials.next()?;

    let txn = db.begin_write()?;
    let outcome = {
        let mut table = txn.open_table(EVENTS)?;
        match locate(&table, &event.id)? {
            Some(Located { stub: false, .. }) => SaveOutcome::Duplicate,
            Some(Located {
                serial: found,
                stub: true,
            }) => {
                restore(&mut table, event, found, &value)?;
                SaveOutcome::Revived
            }
            None => {
                let replacement = find_priors(&table, event)?;
                if replacement.superseded {
                    SaveOutcome::Superseded
                } else {
                    if !replacement.displaced.is_empty() {
                        let mut purge = txn.open_table(PURGE)?;
                        for prior in replacement.displaced {
                            remove_prior(&mut table, &mut purge, event, prior)?;
                        }
                    }
                    insert_record(&mut table, event, serial, &value)?;
                    SaveOutcome::Stored
                }
            }
        }
    };

    match outcome {
        SaveOutcome::Stored | SaveOutcome::Revived => txn.commit()?,
        _ => txn.abort()?,
    }
    debug!(id = %event.id, kind = %event.kind, ?outcome, "save");
    Ok(outcome)
}

pub(crate) fn delete(db: &Database, event: &Event) -> Result<DeleteOutcome, StoreError> {
    let txn = db.begin_write()?;
    let outcome = {
        let mut table = txn.open_table(EVENTS)?;
        match locate(&table, &event.id)? {
            None => DeleteOutcome::NotFound,
            Some(found) => {
                remove_record(&mut table, event, found.serial)?;
                DeleteOutcome::Deleted
            }
        }
    };

    match outcome {
        DeleteOutcome::Deleted => txn.commit()?,
        DeleteOutcome::NotFound => txn.abort()?,
    }
    debug!(id = %event.id, ?outcome, "delete");
    Ok(outcome)
}

fn insert_record(
    table: &mut EventsTable<'_>,
    event: &Event,
    serial: u64,
    value: &[u8],
) -> Result<(), StoreError> {
    table.insert(event_key(serial).as_slice(), value)?;
    for key in index_keys(event, serial) {
        table.insert(key.as_slice(), EMPTY)?;
    }
    let counter = CounterValue::new(now(), value.len());
    table.insert(
        counter_key(&event.id, serial).as_slice(),
        counter.encode().as_slice(),
    )?;
    Ok(())
}

/// Put a demoted record's payload and counter back
///
/// Index entries were never removed by demotion and are left as they are.
fn restore(
    table: &mut EventsTable<'_>,
    event: &Event,
    serial: u64,
    value: &[u8],
) -> Result<(), StoreError> {
    table.insert(event_key(serial).as_slice(), value)?;
    let counter = CounterValue::new(now(), value.len());
    table.insert(
        counter_key(&event.id, serial).as_slice(),
        counter.encode().as_slice(),
    )?;
    Ok(())
}

/// Remove the `Event`, `Counter` and every index entry of a record
pub(crate) fn remove_record(
    table: &mut EventsTable<'_>,
    event: &Event,
    serial: u64,
) -> Result<(), StoreError> {
    table.remove(event_key(serial).as_slice())?;
    for key in index_keys(event, serial) {
        table.remove(key.as_slice())?;
    }
    table.remove(counter_key(&event.id, serial).as_slice())?;
    Ok(())
}

/// Remove a displaced prior of `event`'s slot
///
/// A demoted prior's tag values are unknown. Its other keys are rebuilt
/// from the slot and removed here; the serial is queued so the index tier
/// drops the tag entries on its next pass.
fn remove_prior(
    table: &mut EventsTable<'_>,
    purge: &mut PurgeTable<'_>,
    event: &Event,
    prior: Prior,
) -> Result<(), StoreError> {
    match prior {
        Prior::Full { serial, event } => {
            debug!(id = %event.id, serial, "replacing older event");
            remove_record(table, &event, serial)
        }
        Prior::Stub {
            serial,
            id,
            created_at,
        } => {
            debug!(%id, serial, "replacing older demoted event");
            table.remove(event_key(serial).as_slice())?;
            for key in untagged_keys(&id, &event.pubkey, event.kind, created_at, serial) {
                table.remove(key.as_slice())?;
            }
            purge.insert(serial, ())?;
            Ok(())
        }
    }
}

/// Earlier records of the same replaceable slot
///
/// The slot is author and kind, plus the `d` identifier for parameterized
/// kinds. A demoted prior is judged by its index timestamp and stub id;
/// its identifier is unknown, so parameterized slots ignore stubs.
fn find_priors<T>(table: &T, event: &Event) -> Result<Replacement, StoreError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut replacement = Replacement::default();
    let identifier = event.identifier();
    let parameterized = event.kind.is_parameterized_replaceable() && identifier.is_some();
    if !event.kind.is_replaceable() && !parameterized {
        return Ok(replacement);
    }

    let prefix = pubkey_kind_prefix(&event.pubkey, event.kind);
    let key_len = prefix.len() + TIMESTAMP_LEN + SERIAL_LEN;
    let mut upper = prefix.clone();
    upper.extend_from_slice(&[0xff; TIMESTAMP_LEN + SERIAL_LEN]);

    for entry in table.range::<&[u8]>(prefix.as_slice()..=upper.as_slice())? {
        let (key, _) = entry?;
        let key = key.value();
        if key.len() != key_len {
            continue;
        }
        let (Some(serial), Some(ts)) = (serial_of(key), timestamp_of(key)) else {
            continue;
        };
        let Some(value) = table.get(event_key(serial).as_slice())? else {
            continue;
        };

        match decode_value(value.value()) {
            Ok(StoredValue::Full(prior)) => {
                if prior.pubkey != event.pubkey || prior.kind != event.kind {
                    continue;
                }
                if parameterized && prior.identifier() != identifier {
                    continue;
                }
                if prior.is_older_than(event) {
                    replacement.displaced.push(Prior::Full {
                        serial,
                        event: prior,
                    });
                } else {
                    replacement.superseded = true;
                }
            }
            Ok(StoredValue::Stub(id)) => {
                if parameterized {
                    trace!(serial, "demoted prior has unknown identifier, keeping");
                    continue;
                }
                let created_at = i64::try_from(ts).unwrap_or(i64::MAX);
                if is_older(created_at, &id, event.created_at, &event.id) {
                    replacement.displaced.push(Prior::Stub {
                        serial,
                        id,
                        created_at,
                    });
                } else {
                    replacement.superseded = true;
                }
            }
            Err(e) => warn!(serial, error = %e, "skipping corrupt prior"),
        }
    }
    Ok(replacement)
}

/// Remove the `Event` entry and every secondary index entry of `serials`
///
/// For demoted records, whose payload is gone and whose keys cannot be
/// rebuilt. The secondary layouts are walked once for the whole batch.
/// Demoted records carry no `Counter` entry. Returns the number of keys
/// removed.
pub(crate) fn purge_serials(
    table: &mut EventsTable<'_>,
    serials: &HashSet<u64>,
) -> Result<usize, StoreError> {
    if serials.is_empty() {
        return Ok(0);
    }

    let mut removed = 0;
    for &serial in serials {
        if table.remove(event_key(serial).as_slice())?.is_some() {
            removed += 1;
        }
    }

    let lower = IndexKind::CreatedAt.lower_bound();
    let upper = IndexKind::Counter.lower_bound();
    let mut doomed = Vec::new();
    for entry in table.range::<&[u8]>(lower.as_slice()..upper.as_slice())? {
        let (key, _) = entry?;
        let key = key.value();
        if serial_of(key).is_some_and(|s| serials.contains(&s)) {
            doomed.push(key.to_vec());
        }
    }
    for key in &doomed {
        table.remove(key.as_slice())?;
    }
    Ok(removed + doomed.len())
}
