//! Composable binary fields
//!
//! Every key and counter value is a concatenation of fields. Integers are
//! big-endian so byte order equals numeric order. At most one field of a
//! layout may be arbitrary-length; its size is whatever remains after the
//! fixed-length fields are accounted for.

use thiserror::Error;

use super::IndexKind;

/// Failure to decode a key against a layout
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key of {actual} bytes is shorter than the {fixed} fixed bytes of its layout")]
    Truncated { fixed: usize, actual: usize },

    #[error("key has {0} trailing bytes and its layout has no arbitrary field")]
    Trailing(usize),

    #[error("unknown index kind byte {0}")]
    UnknownKind(u8),

    #[error("expected index kind {expected:?}, found {found:?}")]
    WrongKind { expected: IndexKind, found: IndexKind },
}

/// One encodable component of a key
pub trait Field {
    /// Append the encoded field
    fn write(&self, buf: &mut Vec<u8>);

    /// Decode from exactly the bytes assigned to this field
    fn read(&mut self, buf: &[u8]) -> Result<(), KeyError>;

    /// Encoded length, or `None` for the arbitrary-length field
    fn fixed_len(&self) -> Option<usize>;

    /// Encoded length of the current value
    fn len(&self) -> usize;
}

/// Concatenate fields into a fresh buffer
pub fn write_key(fields: &[&dyn Field]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(fields.iter().map(|f| f.len()).sum());
    for field in fields {
        field.write(&mut buf);
    }
    buf
}

/// Split `key` across `fields` in order
///
/// # Panics
///
/// Panics if more than one field is arbitrary-length. That is a layout
/// definition error, never a property of the data being read.
pub fn read_key(key: &[u8], fields: &mut [&mut dyn Field]) -> Result<(), KeyError> {
    let arbitrary = fields.iter().filter(|f| f.fixed_len().is_none()).count();
    assert!(
        arbitrary <= 1,
        "key layout declares {arbitrary} arbitrary-length fields"
    );

    let fixed: usize = fields.iter().filter_map(|f| f.fixed_len()).sum();
    if key.len() < fixed {
        return Err(KeyError::Truncated {
            fixed,
            actual: key.len(),
        });
    }
    let remainder = key.len() - fixed;
    if arbitrary == 0 && remainder != 0 {
        return Err(KeyError::Trailing(remainder));
    }

    let mut offset = 0;
    for field in fields.iter_mut() {
        let len = field.fixed_len().unwrap_or(remainder);
        field.read(&key[offset..offset + len])?;
        offset += len;
    }
    Ok(())
}

macro_rules! be_field {
    ($(#[$meta:meta])* $name:ident, $ty:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(pub $ty);

        impl $name {
            pub const LEN: usize = std::mem::size_of::<$ty>();
        }

        impl Field for $name {
            fn write(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.0.to_be_bytes());
            }

            fn read(&mut self, buf: &[u8]) -> Result<(), KeyError> {
                let bytes = buf.try_into().map_err(|_| KeyError::Truncated {
                    fixed: Self::LEN,
                    actual: buf.len(),
                })?;
                self.0 = <$ty>::from_be_bytes(bytes);
                Ok(())
            }

            fn fixed_len(&self) -> Option<usize> {
                Some(Self::LEN)
            }

            fn len(&self) -> usize {
                Self::LEN
            }
        }
    };
}

be_field!(
    /// Storage location of an event
    Serial,
    u64
);

be_field!(
    /// Unix seconds, clamped to zero for negative timestamps
    Timestamp,
    u64
);

be_field!(
    /// Event kind
    KindField,
    u16
);

be_field!(
    /// Encoded byte size of a record
    Size,
    u32
);

impl Timestamp {
    pub fn from_created_at(created_at: i64) -> Self {
        Timestamp(u64::try_from(created_at).unwrap_or(0))
    }
}

/// First eight bytes of an id or public key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefix8(pub [u8; 8]);

impl Field for Prefix8 {
    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    fn read(&mut self, buf: &[u8]) -> Result<(), KeyError> {
        self.0 = buf.try_into().map_err(|_| KeyError::Truncated {
            fixed: 8,
            actual: buf.len(),
        })?;
        Ok(())
    }

    fn fixed_len(&self) -> Option<usize> {
        Some(8)
    }

    fn len(&self) -> usize {
        8
    }
}

/// Arbitrary-length bytes; length inferred at read time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bytes(pub Vec<u8>);

impl Field for Bytes {
    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    fn read(&mut self, buf: &[u8]) -> Result<(), KeyError> {
        self.0 = buf.to_vec();
        Ok(())
    }

    fn fixed_len(&self) -> Option<usize> {
        None
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Leading index kind byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPrefix(pub IndexKind);

impl Field for KindPrefix {
    fn write(&self, buf: &mut Vec<u8>) {
        buf.push(self.0 as u8);
    }

    fn read(&mut self, buf: &[u8]) -> Result<(), KeyError> {
        let [byte] = buf else {
            return Err(KeyError::Truncated {
                fixed: 1,
                actual: buf.len(),
            });
        };
        let found = IndexKind::from_byte(*byte).ok_or(KeyError::UnknownKind(*byte))?;
        if found != self.0 {
            return Err(KeyError::WrongKind {
                expected: self.0,
                found,
            });
        }
        Ok(())
    }

    fn fixed_len(&self) -> Option<usize> {
        Some(1)
    }

    fn len(&self) -> usize {
        1
    }
}
