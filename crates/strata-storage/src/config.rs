//! Store configuration
//!
//! Loaded from TOML; every field has a default so partial files work:
//!
//! ```toml
//! db_path = "/var/lib/strata/events.redb"
//! max_limit = 500
//!
//! [gc]
//! size_limit = 4294967296
//! low_water = 86
//! high_water = 92
//! interval_secs = 300
//!
//! [poll]
//! interval_secs = 30
//! overlap = 4
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Configuration for an [`EventStore`](crate::EventStore)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Page cache size in bytes
    pub cache_size: usize,
    /// Upper bound on results per query
    pub max_limit: usize,
    /// Serials leased from the persistent counter per round trip
    pub serial_batch: u64,
    /// Bounded queue depth between each scan worker and the merge
    pub scan_queue_depth: usize,
    /// Keys read per short-lived read transaction
    pub scan_page_size: usize,
    /// Garbage collection budgets
    pub gc: GcConfig,
    /// Access tracker tuning
    pub access: AccessConfig,
    /// Secondary-tier polling of a tiered store
    pub poll: PollConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("strata.redb"),
            cache_size: 64 * 1024 * 1024,
            max_limit: 500,
            serial_batch: 1000,
            scan_queue_depth: 12,
            scan_page_size: 64,
            gc: GcConfig::default(),
            access: AccessConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create a configuration storing the database at the given path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Default::default()
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self, StoreError> {
        let config: StoreConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.max_limit == 0 {
            return Err(StoreError::config("max_limit must be positive"));
        }
        if self.serial_batch == 0 {
            return Err(StoreError::config("serial_batch must be positive"));
        }
        if self.scan_queue_depth == 0 || self.scan_page_size == 0 {
            return Err(StoreError::config("scan queue depth and page size must be positive"));
        }
        if self.access.queue_depth == 0 || self.access.batch_size == 0 {
            return Err(StoreError::config("access queue depth and batch size must be positive"));
        }
        if self.access.max_attempts == 0 {
            return Err(StoreError::config("access max_attempts must be positive"));
        }
        self.gc.validate()
    }

    /// Effective result cap for a requested limit
    ///
    /// A missing or zero limit means the configured maximum.
    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(limit) if limit > 0 => limit.min(self.max_limit),
            _ => self.max_limit,
        }
    }
}

/// Watermarks for the event tier and the pruned-index tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Total size budget in bytes; zero disables collection
    pub size_limit: u64,
    /// Target percentage of `size_limit` after a sweep
    pub low_water: u8,
    /// Percentage of `size_limit` that triggers a sweep
    pub high_water: u8,
    /// Seconds between collection cycles
    pub interval_secs: u64,
    /// Target percentage of the index headroom after a sweep
    pub index_low_water: u8,
    /// Percentage of the index headroom that triggers a sweep
    pub index_high_water: u8,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            size_limit: 0,
            low_water: 86,
            high_water: 92,
            interval_secs: 300,
            index_low_water: 86,
            index_high_water: 92,
        }
    }
}

impl GcConfig {
    pub fn enabled(&self) -> bool {
        self.size_limit > 0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Byte threshold that triggers an event-tier sweep
    pub fn high_mark(&self) -> u64 {
        percent_of(self.size_limit, self.high_water)
    }

    /// Byte target of an event-tier sweep
    pub fn low_mark(&self) -> u64 {
        percent_of(self.size_limit, self.low_water)
    }

    /// Budget left for pruned indices: the size limit above the high-water mark
    pub fn index_headroom(&self) -> u64 {
        percent_of(self.size_limit, 100 - self.high_water.min(100))
    }

    pub fn index_high_mark(&self) -> u64 {
        percent_of(self.index_headroom(), self.index_high_water)
    }

    pub fn index_low_mark(&self) -> u64 {
        percent_of(self.index_headroom(), self.index_low_water)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.low_water >= self.high_water || self.high_water > 100 {
            return Err(StoreError::config(format!(
                "gc watermarks must satisfy low < high <= 100, got {} and {}",
                self.low_water, self.high_water
            )));
        }
        if self.index_low_water >= self.index_high_water || self.index_high_water > 100 {
            return Err(StoreError::config(format!(
                "index watermarks must satisfy low < high <= 100, got {} and {}",
                self.index_low_water, self.index_high_water
            )));
        }
        Ok(())
    }
}

/// How a tiered store pulls recent records from its secondary tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Seconds between polls; zero disables polling
    pub interval_secs: u64,
    /// Intervals each poll window reaches back past the previous one
    ///
    /// Values below 2 fall back to 4.
    pub overlap: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0,
            overlap: 4,
        }
    }
}

impl PollConfig {
    pub fn enabled(&self) -> bool {
        self.interval_secs > 0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// How far each poll window starts before the end of the previous one
    pub fn overlap(&self) -> Duration {
        let factor = if self.overlap < 2 { 4 } else { self.overlap };
        self.interval().saturating_mul(factor)
    }
}

fn percent_of(total: u64, percent: u8) -> u64 {
    (u128::from(total) * u128::from(percent) / 100) as u64
}

/// Access tracker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Pending access records before new ones are dropped
    pub queue_depth: usize,
    /// Counter updates applied per write transaction
    pub batch_size: usize,
    /// Attempts per batch before it is dropped
    pub max_attempts: u32,
    /// Base delay between attempts, jittered
    pub retry_base_ms: u64,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            batch_size: 64,
            max_attempts: 8,
            retry_base_ms: 5,
        }
    }
}
