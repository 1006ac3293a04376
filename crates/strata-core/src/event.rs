//! Signed events and their fixed-size identifiers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::EventError;
use crate::kind::Kind;

/// Length of the index prefix taken from ids and public keys
pub const PREFIX_LEN: usize = 8;

macro_rules! hex_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr, $field:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, EventError> {
                let array: [u8; $len] = bytes.try_into().map_err(|_| EventError::InvalidLength {
                    field: $field,
                    expected: $len,
                    actual: bytes.len(),
                })?;
                Ok(Self(array))
            }

            pub fn from_hex(s: &str) -> Result<Self, EventError> {
                let bytes = hex::decode(s)?;
                Self::from_slice(&bytes)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = EventError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_bytes!(
    /// Content hash identifying an event
    EventId, 32, "id"
);

hex_bytes!(
    /// Author key
    PublicKey, 32, "pubkey"
);

hex_bytes!(
    /// Signature over the event id
    Signature, 64, "sig"
);

impl EventId {
    /// First bytes of the id, as stored in `Id` and `Counter` keys
    pub fn prefix(&self) -> [u8; PREFIX_LEN] {
        prefix_of(&self.0)
    }
}

impl PublicKey {
    /// First bytes of the key, as stored in author and tag keys
    pub fn prefix(&self) -> [u8; PREFIX_LEN] {
        prefix_of(&self.0)
    }
}

fn prefix_of(bytes: &[u8; 32]) -> [u8; PREFIX_LEN] {
    let mut out = [0u8; PREFIX_LEN];
    out.copy_from_slice(&bytes[..PREFIX_LEN]);
    out
}

/// A single tag: a name followed by values
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// An immutable signed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: i64,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: Signature,
}

impl Event {
    /// Value of the first `d` tag
    ///
    /// A `d` tag without a value yields the empty identifier.
    pub fn identifier(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some("d"))
            .map(|t| t.value().unwrap_or(""))
    }

    /// Whether `self` loses to `other` under replacement
    ///
    /// The earlier event is older. On equal timestamps the event with the
    /// lexicographically greater id is older.
    pub fn is_older_than(&self, other: &Event) -> bool {
        is_older(self.created_at, &self.id, other.created_at, &other.id)
    }

    /// Iterate over tags with the given single-letter name
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Replacement ordering on bare `(created_at, id)` pairs
///
/// Used when only an index entry of the prior event is available.
pub fn is_older(created_at: i64, id: &EventId, other_created_at: i64, other_id: &EventId) -> bool {
    created_at < other_created_at || (created_at == other_created_at && id > other_id)
}
