//! Event kinds and their storage classes

use std::fmt;

use serde::{Deserialize, Serialize};

/// Event category
///
/// The numeric range of a kind decides how the store treats it:
///
/// | Range | Class |
/// |-------|-------|
/// | `0`, `3`, `10000..20000` | replaceable (one per author) |
/// | `20000..30000` | ephemeral (never persisted) |
/// | `30000..40000` | parameterized replaceable (one per author and `d` value) |
/// | everything else | regular |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(pub u16);

impl Kind {
    pub const METADATA: Kind = Kind(0);
    pub const TEXT_NOTE: Kind = Kind(1);
    pub const CONTACTS: Kind = Kind(3);
    pub const DELETION: Kind = Kind(5);

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    pub const fn is_replaceable(self) -> bool {
        matches!(self.0, 0 | 3 | 10000..20000)
    }

    pub const fn is_ephemeral(self) -> bool {
        matches!(self.0, 20000..30000)
    }

    pub const fn is_parameterized_replaceable(self) -> bool {
        matches!(self.0, 30000..40000)
    }
}

impl From<u16> for Kind {
    fn from(value: u16) -> Self {
        Kind(value)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
