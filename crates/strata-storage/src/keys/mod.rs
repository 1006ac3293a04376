//! Key space shared by raw records and every secondary index
//!
//! ## Layouts
//!
//! ```text
//! Event       [0][serial]                                   -> record | 32-byte id stub
//! CreatedAt   [1][created_at][serial]
//! Id          [2][id8][serial]
//! Kind        [3][kind][created_at][serial]
//! Pubkey      [4][pubkey8][created_at][serial]
//! PubkeyKind  [5][pubkey8][kind][created_at][serial]
//! Tag         [6][value][created_at][serial]
//! Tag32       [7][pubkey8][created_at][serial]
//! TagAddr     [8][kind][pubkey8][identifier][created_at][serial]
//! Counter     [9][id8][serial]                              -> [last_access][size]
//! ```
//!
//! Index entries carry an empty value. Timestamps sit right before the
//! serial so a reverse range scan over one prefix is newest-first.

pub mod codec;

use strata_core::{Event, EventId, Kind, PublicKey};

pub use codec::{
    Bytes, Field, KeyError, KindField, KindPrefix, Prefix8, Serial, Size, Timestamp, read_key,
    write_key,
};

/// Length of the trailing serial
pub const SERIAL_LEN: usize = 8;
/// Length of an embedded timestamp
pub const TIMESTAMP_LEN: usize = 8;
/// Longest tag value that gets an index entry
pub const MAX_TAG_VALUE_LEN: usize = 100;

/// Leading byte of every key
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKind {
    Event = 0,
    CreatedAt = 1,
    Id = 2,
    Kind = 3,
    Pubkey = 4,
    PubkeyKind = 5,
    Tag = 6,
    Tag32 = 7,
    TagAddr = 8,
    Counter = 9,
}

impl IndexKind {
    pub const ALL: [IndexKind; 10] = [
        IndexKind::Event,
        IndexKind::CreatedAt,
        IndexKind::Id,
        IndexKind::Kind,
        IndexKind::Pubkey,
        IndexKind::PubkeyKind,
        IndexKind::Tag,
        IndexKind::Tag32,
        IndexKind::TagAddr,
        IndexKind::Counter,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.get(usize::from(byte)).copied()
    }

    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Whether keys of this kind embed a created_at timestamp
    pub const fn has_timestamp(self) -> bool {
        !matches!(self, IndexKind::Event | IndexKind::Id | IndexKind::Counter)
    }

    /// Whether entries of this kind are secondary indices over a record
    pub const fn is_secondary(self) -> bool {
        !matches!(self, IndexKind::Event | IndexKind::Counter)
    }

    /// Smallest key of this kind
    pub fn lower_bound(self) -> Vec<u8> {
        vec![self.byte()]
    }

    /// Smallest key past every key of this kind
    pub fn upper_bound(self) -> Vec<u8> {
        vec![self.byte() + 1]
    }
}

pub fn event_key(serial: u64) -> Vec<u8> {
    write_key(&[&KindPrefix(IndexKind::Event), &Serial(serial)])
}

pub fn counter_key(id: &EventId, serial: u64) -> Vec<u8> {
    write_key(&[
        &KindPrefix(IndexKind::Counter),
        &Prefix8(id.prefix()),
        &Serial(serial),
    ])
}

pub fn id_key(id: &EventId, serial: u64) -> Vec<u8> {
    let mut key = id_prefix(id);
    Serial(serial).write(&mut key);
    key
}

pub fn id_prefix(id: &EventId) -> Vec<u8> {
    write_key(&[&KindPrefix(IndexKind::Id), &Prefix8(id.prefix())])
}

pub fn created_at_prefix() -> Vec<u8> {
    IndexKind::CreatedAt.lower_bound()
}

pub fn kind_prefix(kind: Kind) -> Vec<u8> {
    write_key(&[&KindPrefix(IndexKind::Kind), &KindField(kind.as_u16())])
}

pub fn pubkey_prefix(pubkey: &PublicKey) -> Vec<u8> {
    write_key(&[&KindPrefix(IndexKind::Pubkey), &Prefix8(pubkey.prefix())])
}

pub fn pubkey_kind_prefix(pubkey: &PublicKey, kind: Kind) -> Vec<u8> {
    write_key(&[
        &KindPrefix(IndexKind::PubkeyKind),
        &Prefix8(pubkey.prefix()),
        &KindField(kind.as_u16()),
    ])
}

/// Append `[created_at][serial]` to a prefix
pub fn timed_key(prefix: &[u8], created_at: i64, serial: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + TIMESTAMP_LEN + SERIAL_LEN);
    key.extend_from_slice(prefix);
    Timestamp::from_created_at(created_at).write(&mut key);
    Serial(serial).write(&mut key);
    key
}

/// Shape of an indexable tag value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue {
    /// 64 hex characters decoding to a 32-byte key
    Key32([u8; 8]),
    /// `kind:pubkey:identifier`
    Address {
        kind: u16,
        pubkey: [u8; 8],
        identifier: Vec<u8>,
    },
    /// Anything else, stored verbatim
    Raw(Vec<u8>),
}

impl TagValue {
    pub fn classify(value: &str) -> Self {
        if let Some(prefix) = decode_key_prefix(value) {
            return TagValue::Key32(prefix);
        }

        let parts: Vec<&str> = value.split(':').collect();
        if let [kind, pubkey, identifier] = parts.as_slice() {
            if let (Ok(kind), Some(pubkey)) = (kind.parse::<u16>(), decode_key_prefix(pubkey)) {
                return TagValue::Address {
                    kind,
                    pubkey,
                    identifier: identifier.as_bytes().to_vec(),
                };
            }
        }

        TagValue::Raw(value.as_bytes().to_vec())
    }

    pub fn index_kind(&self) -> IndexKind {
        match self {
            TagValue::Key32(_) => IndexKind::Tag32,
            TagValue::Address { .. } => IndexKind::TagAddr,
            TagValue::Raw(_) => IndexKind::Tag,
        }
    }

    /// Key prefix up to, not including, the timestamp
    pub fn prefix(&self) -> Vec<u8> {
        match self {
            TagValue::Key32(pubkey) => {
                write_key(&[&KindPrefix(IndexKind::Tag32), &Prefix8(*pubkey)])
            }
            TagValue::Address {
                kind,
                pubkey,
                identifier,
            } => {
                let mut key = write_key(&[
                    &KindPrefix(IndexKind::TagAddr),
                    &KindField(*kind),
                    &Prefix8(*pubkey),
                ]);
                key.extend_from_slice(identifier);
                key
            }
            TagValue::Raw(value) => {
                let mut key = IndexKind::Tag.lower_bound();
                key.extend_from_slice(value);
                key
            }
        }
    }
}

fn decode_key_prefix(value: &str) -> Option<[u8; 8]> {
    if value.len() != 64 {
        return None;
    }
    let bytes = hex::decode(value).ok()?;
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&bytes[..8]);
    Some(prefix)
}

/// Tag values of an event that receive index entries
///
/// A tag qualifies when it has a one-byte name and a value of 1 to 100
/// bytes. Each distinct value is indexed once.
pub fn indexable_tag_values(event: &Event) -> Vec<&str> {
    let mut values: Vec<&str> = Vec::new();
    for tag in &event.tags {
        let (Some(name), Some(value)) = (tag.name(), tag.value()) else {
            continue;
        };
        if name.len() != 1 || value.is_empty() || value.len() > MAX_TAG_VALUE_LEN {
            continue;
        }
        if !values.contains(&value) {
            values.push(value);
        }
    }
    values
}

/// Every secondary index key for an event stored at `serial`
///
/// Excludes the `Event` and `Counter` entries.
pub fn index_keys(event: &Event, serial: u64) -> Vec<Vec<u8>> {
    let mut keys = untagged_keys(&event.id, &event.pubkey, event.kind, event.created_at, serial);
    for value in indexable_tag_values(event) {
        keys.push(timed_key(
            &TagValue::classify(value).prefix(),
            event.created_at,
            serial,
        ));
    }
    keys
}

/// The `Id`, `Pubkey`, `Kind`, `PubkeyKind` and `CreatedAt` keys of a record
///
/// These need no tag values, so they can be rebuilt for a demoted record
/// from its stub id and the slot it was found in.
pub fn untagged_keys(
    id: &EventId,
    pubkey: &PublicKey,
    kind: Kind,
    created_at: i64,
    serial: u64,
) -> Vec<Vec<u8>> {
    vec![
        id_key(id, serial),
        timed_key(&pubkey_prefix(pubkey), created_at, serial),
        timed_key(&kind_prefix(kind), created_at, serial),
        timed_key(&pubkey_kind_prefix(pubkey, kind), created_at, serial),
        timed_key(&created_at_prefix(), created_at, serial),
    ]
}

/// Index kind of a raw key
pub fn kind_of(key: &[u8]) -> Option<IndexKind> {
    key.first().copied().and_then(IndexKind::from_byte)
}

/// Trailing serial of any key
pub fn serial_of(key: &[u8]) -> Option<u64> {
    let start = key.len().checked_sub(SERIAL_LEN)?;
    let mut serial = Serial::default();
    serial.read(&key[start..]).ok()?;
    Some(serial.0)
}

/// Embedded timestamp of a timed index key
pub fn timestamp_of(key: &[u8]) -> Option<u64> {
    let end = key.len().checked_sub(SERIAL_LEN)?;
    let start = end.checked_sub(TIMESTAMP_LEN)?;
    let mut ts = Timestamp::default();
    ts.read(&key[start..end]).ok()?;
    Some(ts.0)
}

#[cfg(test)]
mod tests {
    use strata_core::{Signature, Tag};

    use super::*;

    const PUBKEY_HEX: &str = "82341f882b6eabcd2ba7f1ef90aad961cf074af15b9ef44a09f9d2a8fbfbe6a2";

    fn event(tags: Vec<Tag>) -> Event {
        Event {
            id: EventId::new([0xaa; 32]),
            pubkey: PublicKey::new([0xbb; 32]),
            created_at: 1_700_000_000,
            kind: Kind(1),
            tags,
            content: String::new(),
            sig: Signature::new([0; 64]),
        }
    }

    #[test]
    fn test_kind_bytes() {
        for kind in IndexKind::ALL {
            assert_eq!(IndexKind::from_byte(kind.byte()), Some(kind));
        }
        assert_eq!(IndexKind::from_byte(10), None);
        assert!(!IndexKind::Id.has_timestamp());
        assert!(IndexKind::TagAddr.has_timestamp());
    }

    #[test]
    fn test_classify_key32() {
        let value = TagValue::classify(PUBKEY_HEX);
        assert_eq!(value.index_kind(), IndexKind::Tag32);
        let expected = [&[7u8][..], &hex::decode(&PUBKEY_HEX[..16]).unwrap()[..]].concat();
        assert_eq!(value.prefix(), expected);
    }

    #[test]
    fn test_classify_address() {
        let value = TagValue::classify(&format!("30023:{PUBKEY_HEX}:my-article"));
        let TagValue::Address {
            kind, identifier, ..
        } = &value
        else {
            panic!("expected address, got {value:?}");
        };
        assert_eq!(*kind, 30023);
        assert_eq!(identifier, b"my-article");
        assert_eq!(value.prefix().len(), 1 + 2 + 8 + identifier.len());
    }

    #[test]
    fn test_classify_raw_fallbacks() {
        assert!(matches!(TagValue::classify("rust"), TagValue::Raw(_)));
        assert!(matches!(
            TagValue::classify(&format!("notakind:{PUBKEY_HEX}:x")),
            TagValue::Raw(_)
        ));
        assert!(matches!(
            TagValue::classify(&format!("1:{PUBKEY_HEX}:x:y")),
            TagValue::Raw(_)
        ));
        let not_hex = "z".repeat(64);
        assert!(matches!(TagValue::classify(&not_hex), TagValue::Raw(_)));
    }

    #[test]
    fn test_tag_eligibility_and_dedup() {
        let ev = event(vec![
            Tag::new(["t", "rust"]),
            Tag::new(["t", "rust"]),
            Tag::new(["r", "rust"]),
            Tag::new(["title", "long name"]),
            Tag::new(["t", ""]),
            Tag::new(["t"]),
            Tag::new(["t".to_string(), "x".repeat(101)]),
            Tag::new(["t".to_string(), "x".repeat(100)]),
        ]);
        let values = indexable_tag_values(&ev);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], "rust");
        assert_eq!(values[1].len(), 100);
    }

    #[test]
    fn test_index_keys_share_serial_and_timestamp() {
        let ev = event(vec![Tag::new(["p", PUBKEY_HEX]), Tag::new(["t", "rust"])]);
        let keys = index_keys(&ev, 77);
        assert_eq!(keys.len(), 7);
        for key in &keys {
            assert_eq!(serial_of(key), Some(77));
            let kind = kind_of(key).unwrap();
            assert!(kind.is_secondary());
            if kind.has_timestamp() {
                assert_eq!(timestamp_of(key), Some(1_700_000_000));
            }
        }
        assert_eq!(kind_of(&keys[0]), Some(IndexKind::Id));
        assert!(keys.iter().any(|k| kind_of(k) == Some(IndexKind::CreatedAt)));
        assert!(keys.iter().any(|k| kind_of(k) == Some(IndexKind::Tag32)));
    }

    #[test]
    fn test_untagged_keys_rebuild_without_payload() {
        let ev = event(vec![Tag::new(["t", "rust"])]);
        let rebuilt = untagged_keys(&ev.id, &ev.pubkey, ev.kind, ev.created_at, 3);
        let all = index_keys(&ev, 3);
        assert_eq!(rebuilt.len(), 5);
        assert!(rebuilt.iter().all(|k| all.contains(k)));

        let missing: Vec<_> = all.iter().filter(|k| !rebuilt.contains(k)).collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(kind_of(missing[0]), Some(IndexKind::Tag));
    }

    #[test]
    fn test_reverse_order_within_prefix() {
        let prefix = kind_prefix(Kind(1));
        let older = timed_key(&prefix, 100, 9);
        let newer = timed_key(&prefix, 200, 1);
        assert!(older < newer);
        assert!(prefix < older);
    }

    #[test]
    fn test_point_keys() {
        let id = EventId::new([0x11; 32]);
        assert_eq!(event_key(5), [0, 0, 0, 0, 0, 0, 0, 0, 5]);
        assert_eq!(counter_key(&id, 5)[0], 9);
        assert_eq!(counter_key(&id, 5).len(), 17);
        assert_eq!(id_key(&id, 5)[..9], id_prefix(&id)[..]);
    }
}
