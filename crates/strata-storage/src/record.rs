//! Stored values: full records, demotion stubs and access counters

use serde::{Deserialize, Serialize};
use strata_core::{Event, EventId, Kind, PublicKey, Signature, Tag};

use crate::error::StoreError;
use crate::keys::{Size, Timestamp, read_key, write_key};

/// Byte length of a demotion stub: the bare event id
pub const STUB_LEN: usize = EventId::LEN;

/// Byte length of a counter value
pub const COUNTER_LEN: usize = Timestamp::LEN + Size::LEN;

/// On-disk shape of a full record
///
/// `id` is serialized first as 32 raw bytes, so the first [`STUB_LEN`]
/// bytes of any `Event` value, full or stub, are the event id.
#[derive(Serialize, Deserialize)]
struct StoredEvent {
    id: [u8; 32],
    pubkey: [u8; 32],
    created_at: i64,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
    sig: Vec<u8>,
}

/// Encode an event as an `Event` entry value
pub fn encode_event(event: &Event) -> Result<Vec<u8>, StoreError> {
    let stored = StoredEvent {
        id: *event.id.as_bytes(),
        pubkey: *event.pubkey.as_bytes(),
        created_at: event.created_at,
        kind: event.kind.as_u16(),
        tags: event.tags.iter().map(|t| t.0.clone()).collect(),
        content: event.content.clone(),
        sig: event.sig.as_bytes().to_vec(),
    };
    postcard::to_allocvec(&stored).map_err(|e| StoreError::serialization(e.to_string()))
}

/// Decoded `Event` entry value
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Full(Event),
    Stub(EventId),
}

/// Decode an `Event` entry value
pub fn decode_value(bytes: &[u8]) -> Result<StoredValue, StoreError> {
    if bytes.len() == STUB_LEN {
        return EventId::from_slice(bytes)
            .map(StoredValue::Stub)
            .map_err(|e| StoreError::corrupt(e.to_string()));
    }
    if bytes.len() < STUB_LEN {
        return Err(StoreError::corrupt(format!(
            "event value of {} bytes is shorter than a stub",
            bytes.len()
        )));
    }

    let stored: StoredEvent =
        postcard::from_bytes(bytes).map_err(|e| StoreError::corrupt(e.to_string()))?;
    let sig = Signature::from_slice(&stored.sig).map_err(|e| StoreError::corrupt(e.to_string()))?;
    Ok(StoredValue::Full(Event {
        id: EventId::new(stored.id),
        pubkey: PublicKey::new(stored.pubkey),
        created_at: stored.created_at,
        kind: Kind(stored.kind),
        tags: stored.tags.into_iter().map(Tag).collect(),
        content: stored.content,
        sig,
    }))
}

/// Id carried by an `Event` entry value without decoding the rest
pub fn value_id(bytes: &[u8]) -> Option<&[u8]> {
    bytes.get(..STUB_LEN)
}

pub fn is_stub(bytes: &[u8]) -> bool {
    bytes.len() == STUB_LEN
}

/// `Counter` entry value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterValue {
    /// Unix seconds of the last query hit
    pub last_access: u64,
    /// Encoded size of the `Event` value
    pub size: u32,
}

impl CounterValue {
    pub fn new(last_access: u64, size: usize) -> Self {
        Self {
            last_access,
            size: u32::try_from(size).unwrap_or(u32::MAX),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        write_key(&[&Timestamp(self.last_access), &Size(self.size)])
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut ts = Timestamp::default();
        let mut size = Size::default();
        read_key(bytes, &mut [&mut ts, &mut size])
            .map_err(|e| StoreError::corrupt(format!("counter value: {e}")))?;
        Ok(Self {
            last_access: ts.0,
            size: size.0,
        })
    }
}

/// A query hit: the full event, or the stub of a demoted one
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Full(Event),
    /// Demoted record; the payload lives only in a secondary tier
    Stub {
        id: EventId,
        /// Timestamp from the index entry; zero when the index has none
        created_at: i64,
    },
}

impl Record {
    pub fn id(&self) -> &EventId {
        match self {
            Record::Full(event) => &event.id,
            Record::Stub { id, .. } => id,
        }
    }

    pub fn created_at(&self) -> i64 {
        match self {
            Record::Full(event) => event.created_at,
            Record::Stub { created_at, .. } => *created_at,
        }
    }

    pub fn is_stub(&self) -> bool {
        matches!(self, Record::Stub { .. })
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Record::Full(event) => Some(event),
            Record::Stub { .. } => None,
        }
    }

    pub fn into_event(self) -> Option<Event> {
        match self {
            Record::Full(event) => Some(event),
            Record::Stub { .. } => None,
        }
    }
}

/// Current unix time in seconds
pub fn now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
