//! Filter to index-scan planning
//!
//! The most selective dimension present picks the index:
//!
//! | Filter has | Index | Scans | Residual |
//! |------------|-------|-------|----------|
//! | ids | `Id` | one per id | whole filter |
//! | authors | `Pubkey` / `PubkeyKind` | per author (per kind) | authors, tags |
//! | tags | `Tag` / `Tag32` / `TagAddr` | per value | kinds, tags |
//! | kinds | `Kind` | one per kind | none |
//! | nothing selective | `CreatedAt` | one | none |
//!
//! Several layouts store 8-byte prefixes of ids and keys, so the residual
//! re-checks those dimensions against the decoded record.

use strata_core::Filter;

use crate::error::StoreError;
use crate::keys::{
    self, IndexKind, SERIAL_LEN, TIMESTAMP_LEN, TagValue, Timestamp, created_at_prefix,
    id_prefix, kind_prefix, pubkey_kind_prefix, pubkey_prefix,
};

/// One reverse range scan over a single key prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSpec {
    pub index: IndexKind,
    /// Keys of this scan start with these bytes
    pub prefix: Vec<u8>,
    /// Skip the `since` check; the layout carries no timestamp
    pub skip_timestamp: bool,
    /// Newest timestamp to include
    pub until: u64,
}

impl ScanSpec {
    fn timed(index: IndexKind, prefix: Vec<u8>, until: u64) -> Self {
        Self {
            index,
            prefix,
            skip_timestamp: false,
            until,
        }
    }

    /// Exclusive upper bound of the scan: `prefix ‖ (until + 1)`
    ///
    /// Untimed layouts and an unbounded `until` scan to the end of the prefix.
    pub fn start_key(&self) -> Vec<u8> {
        let mut key = self.prefix.clone();
        if self.skip_timestamp || self.until == u64::MAX {
            key.extend_from_slice(&[0xff; TIMESTAMP_LEN + SERIAL_LEN]);
            key.push(0xff);
        } else {
            keys::Field::write(&Timestamp(self.until + 1), &mut key);
        }
        key
    }

    /// Length of every key that belongs to this scan
    ///
    /// `Tag` prefixes are variable-length; a longer value sharing the
    /// prefix produces keys of a different length.
    pub fn key_len(&self) -> usize {
        let timestamp = if self.skip_timestamp { 0 } else { TIMESTAMP_LEN };
        self.prefix.len() + timestamp + SERIAL_LEN
    }
}

/// Scans plus the checks the chosen index cannot express
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub scans: Vec<ScanSpec>,
    pub residual: Option<Filter>,
    /// Oldest timestamp to include
    pub since: u64,
}

impl QueryPlan {
    /// A plan that matches nothing
    pub fn empty() -> Self {
        Self {
            scans: Vec::new(),
            residual: None,
            since: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    pub fn index(&self) -> Option<IndexKind> {
        self.scans.first().map(|s| s.index)
    }
}

/// Choose the scans for a filter
///
/// # Errors
///
/// Returns [`StoreError::InvalidFilter`] when a tag constraint lists no
/// values, which can match nothing.
pub fn plan(filter: &Filter) -> Result<QueryPlan, StoreError> {
    if let Some((name, _)) = filter.tags.iter().find(|(_, values)| values.is_empty()) {
        return Err(StoreError::invalid_filter(format!(
            "tag filter #{name} has no values"
        )));
    }

    // Stored timestamps are never negative
    if let Some(until) = filter.until {
        if until < 0 || filter.since.is_some_and(|since| since > until) {
            return Ok(QueryPlan::empty());
        }
    }
    let since = filter.since.map(clamp).unwrap_or(0);
    let until = filter.until.map(clamp).unwrap_or(u64::MAX);

    if !filter.ids.is_empty() {
        let scans = dedup(filter.ids.iter().map(|id| ScanSpec {
            index: IndexKind::Id,
            prefix: id_prefix(id),
            skip_timestamp: true,
            until: u64::MAX,
        }));
        let residual = Filter {
            limit: None,
            ..filter.clone()
        };
        return Ok(QueryPlan {
            scans,
            residual: Some(residual),
            since,
        });
    }

    if !filter.authors.is_empty() {
        let scans = if filter.kinds.is_empty() {
            dedup(filter.authors.iter().map(|pk| {
                ScanSpec::timed(IndexKind::Pubkey, pubkey_prefix(pk), until)
            }))
        } else {
            dedup(filter.authors.iter().flat_map(|pk| {
                filter.kinds.iter().map(move |kind| {
                    ScanSpec::timed(IndexKind::PubkeyKind, pubkey_kind_prefix(pk, *kind), until)
                })
            }))
        };
        let residual = Filter {
            authors: filter.authors.clone(),
            tags: filter.tags.clone(),
            ..Filter::default()
        };
        return Ok(QueryPlan {
            scans,
            residual: Some(residual),
            since,
        });
    }

    if !filter.tags.is_empty() {
        let scans = dedup(filter.tags.values().flatten().map(|value| {
            let value = TagValue::classify(value);
            ScanSpec::timed(value.index_kind(), value.prefix(), until)
        }));
        let residual = Filter {
            kinds: filter.kinds.clone(),
            tags: filter.tags.clone(),
            ..Filter::default()
        };
        return Ok(QueryPlan {
            scans,
            residual: Some(residual),
            since,
        });
    }

    if !filter.kinds.is_empty() {
        let scans = dedup(
            filter
                .kinds
                .iter()
                .map(|kind| ScanSpec::timed(IndexKind::Kind, kind_prefix(*kind), until)),
        );
        return Ok(QueryPlan {
            scans,
            residual: None,
            since,
        });
    }

    Ok(QueryPlan {
        scans: vec![ScanSpec::timed(IndexKind::CreatedAt, created_at_prefix(), until)],
        residual: None,
        since,
    })
}

fn clamp(ts: i64) -> u64 {
    u64::try_from(ts).unwrap_or(0)
}

fn dedup(scans: impl Iterator<Item = ScanSpec>) -> Vec<ScanSpec> {
    let mut out: Vec<ScanSpec> = Vec::new();
    for scan in scans {
        if !out.contains(&scan) {
            out.push(scan);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use strata_core::{EventId, Kind, PublicKey};

    use super::*;

    const KEY_HEX: &str = "82341f882b6eabcd2ba7f1ef90aad961cf074af15b9ef44a09f9d2a8fbfbe6a2";

    #[test]
    fn test_ids_win() {
        let filter = Filter::new()
            .with_ids([EventId::new([1; 32]), EventId::new([2; 32])])
            .with_authors([PublicKey::new([3; 32])])
            .with_limit(5);
        let plan = plan(&filter).unwrap();
        assert_eq!(plan.index(), Some(IndexKind::Id));
        assert_eq!(plan.scans.len(), 2);
        assert!(plan.scans.iter().all(|s| s.skip_timestamp));
        let residual = plan.residual.unwrap();
        assert_eq!(residual.authors.len(), 1);
        assert_eq!(residual.limit, None);
    }

    #[test]
    fn test_authors_with_kinds_cross_product() {
        let filter = Filter::new()
            .with_authors([PublicKey::new([1; 32]), PublicKey::new([2; 32])])
            .with_kinds([Kind(0), Kind(3), Kind(0)])
            .with_tag('t', ["x"]);
        let plan = plan(&filter).unwrap();
        assert_eq!(plan.index(), Some(IndexKind::PubkeyKind));
        assert_eq!(plan.scans.len(), 4);
        let residual = plan.residual.unwrap();
        assert!(residual.kinds.is_empty());
        assert_eq!(residual.tags.len(), 1);
    }

    #[test]
    fn test_authors_without_kinds() {
        let plan = plan(&Filter::new().with_authors([PublicKey::new([1; 32])])).unwrap();
        assert_eq!(plan.index(), Some(IndexKind::Pubkey));
        assert_eq!(plan.scans[0].prefix.len(), 9);
    }

    #[test]
    fn test_tag_shapes() {
        let filter = Filter::new()
            .with_tag('p', [KEY_HEX])
            .with_tag('a', [format!("30023:{KEY_HEX}:post")])
            .with_tag('t', ["rust"])
            .with_kinds([Kind(1)]);
        let plan = plan(&filter).unwrap();
        let kinds: Vec<IndexKind> = plan.scans.iter().map(|s| s.index).collect();
        assert_eq!(kinds, vec![IndexKind::TagAddr, IndexKind::Tag32, IndexKind::Tag]);
        assert_eq!(plan.residual.unwrap().kinds, vec![Kind(1)]);
    }

    #[test]
    fn test_kinds_only_and_fallback() {
        let plan_kinds = plan(&Filter::new().with_kinds([Kind(1)])).unwrap();
        assert_eq!(plan_kinds.index(), Some(IndexKind::Kind));
        assert!(plan_kinds.residual.is_none());

        let fallback = plan(&Filter::new().with_since(10)).unwrap();
        assert_eq!(fallback.index(), Some(IndexKind::CreatedAt));
        assert_eq!(fallback.since, 10);
        assert!(fallback.residual.is_none());
    }

    #[test]
    fn test_empty_tag_values_rejected() {
        let mut filter = Filter::new();
        filter.tags.insert('e', vec![]);
        assert!(matches!(plan(&filter), Err(StoreError::InvalidFilter(_))));
    }

    #[test]
    fn test_start_key_bounds() {
        let plan = plan(&Filter::new().with_kinds([Kind(1)]).with_until(100)).unwrap();
        let scan = &plan.scans[0];
        assert_eq!(scan.until, 100);
        let start = scan.start_key();
        assert_eq!(start, keys::timed_key(&scan.prefix, 101, 0)[..scan.prefix.len() + 8]);
        assert!(keys::timed_key(&scan.prefix, 100, u64::MAX) < start);
        assert!(keys::timed_key(&scan.prefix, 101, 0) >= start);
        assert_eq!(scan.key_len(), 3 + 8 + 8);
    }

    #[test]
    fn test_unbounded_start_covers_prefix() {
        let plan = plan(&Filter::new().with_kinds([Kind(1)])).unwrap();
        let scan = &plan.scans[0];
        assert!(keys::timed_key(&scan.prefix, i64::MAX, u64::MAX) < scan.start_key());
    }

    #[test]
    fn test_impossible_window_plans_nothing() {
        assert!(plan(&Filter::new().with_until(-5)).unwrap().is_empty());
        assert!(plan(&Filter::new().with_kinds([Kind(1)]).with_until(-1)).unwrap().is_empty());
        assert!(plan(&Filter::new().with_since(20).with_until(10)).unwrap().is_empty());

        let zero = plan(&Filter::new().with_until(0)).unwrap();
        assert_eq!(zero.scans[0].until, 0);
        let point = plan(&Filter::new().with_since(10).with_until(10)).unwrap();
        assert_eq!(point.scans[0].until, 10);
        assert_eq!(point.since, 10);
    }
}
