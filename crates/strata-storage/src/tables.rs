//! redb table definitions and database bootstrap

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use strata_core::EventId;
use tracing::{debug, info, instrument};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::keys::{self, id_prefix, serial_of};
use crate::record::value_id;

// Key: layout-tagged key bytes, Value: record, stub, counter or empty
pub const EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("events");

// Key: setting name, Value: u64 setting
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

// Key: serial of a removed record whose tag entries are still present
pub const PURGE: TableDefinition<u64, ()> = TableDefinition::new("purge");

/// Value of every index entry
pub const EMPTY: &[u8] = &[];

pub const META_VERSION: &str = "version";
pub const META_SERIAL: &str = "serial";

/// Layout version written into new databases
pub const LAYOUT_VERSION: u64 = 1;

/// Open or create the database and its tables
#[instrument(skip(config), fields(path = %config.db_path.display()))]
pub fn open_database(config: &StoreConfig) -> Result<Database, StoreError> {
    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::builder()
        .set_cache_size(config.cache_size)
        .create(&config.db_path)?;
    info!("Opened redb database");

    init_tables(&db)?;
    Ok(db)
}

fn init_tables(db: &Database) -> Result<(), StoreError> {
    let txn = db.begin_write()?;
    {
        txn.open_table(EVENTS)?;
        txn.open_table(PURGE)?;
        let mut meta = txn.open_table(META)?;
        let stored = meta.get(META_VERSION)?.map(|v| v.value());
        match stored {
            None => {
                meta.insert(META_VERSION, LAYOUT_VERSION)?;
            }
            Some(LAYOUT_VERSION) => {}
            Some(other) => {
                return Err(StoreError::config(format!(
                    "database layout version {other} is not supported (expected {LAYOUT_VERSION})"
                )));
            }
        }
    }
    txn.commit()?;
    debug!("Initialized redb tables");
    Ok(())
}

/// Whether a database file exists at `path`
pub fn exists(path: &Path) -> bool {
    path.is_file()
}

/// Location of an event found through the `Id` index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub serial: u64,
    pub stub: bool,
}

/// Resolve an event id to its serial
///
/// The `Id` index only holds an 8-byte prefix, so every candidate is
/// confirmed against the id stored at the head of its `Event` value.
pub fn locate<T>(table: &T, id: &EventId) -> Result<Option<Located>, StoreError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let prefix = id_prefix(id);
    let mut upper = prefix.clone();
    upper.extend_from_slice(&[0xff; keys::SERIAL_LEN]);

    for entry in table.range::<&[u8]>(prefix.as_slice()..=upper.as_slice())? {
        let (key, _) = entry?;
        let key = key.value();
        if key.len() != prefix.len() + keys::SERIAL_LEN {
            continue;
        }
        let Some(serial) = serial_of(key) else {
            continue;
        };
        let Some(value) = table.get(keys::event_key(serial).as_slice())? else {
            continue;
        };
        let value = value.value();
        if value_id(value) == Some(&id.as_bytes()[..]) {
            return Ok(Some(Located {
                serial,
                stub: crate::record::is_stub(value),
            }));
        }
    }
    Ok(None)
}
