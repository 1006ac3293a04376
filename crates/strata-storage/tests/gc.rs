//! Garbage collection of the event tier and the pruned-index tier

use std::time::Duration;

use strata_core::{Event, EventId, Filter, Kind, PublicKey, Signature, Tag};
use strata_storage::{EventStore, Record, Store, StoreConfig};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn event(id: u8, created_at: i64) -> Event {
    Event {
        id: EventId::new([id; 32]),
        pubkey: PublicKey::new([0x42; 32]),
        created_at,
        kind: Kind::TEXT_NOTE,
        tags: vec![Tag::new(["t", "gc"])],
        content: "payload ".repeat(50),
        sig: Signature::new([id; 64]),
    }
}

async fn open_store(dir: &TempDir, size_limit: u64) -> EventStore {
    strata_logging::init_testing();
    let mut config = StoreConfig::with_path(dir.path().join("gc.redb"));
    config.gc.size_limit = size_limit;
    EventStore::open(config).await.expect("open store")
}

async fn fill(store: &EventStore, count: u8) {
    for id in 1..=count {
        store.save(&event(id, i64::from(id) * 100)).await.unwrap();
    }
}

async fn lookup(store: &EventStore, id: u8) -> Vec<Record> {
    let filter = Filter::new().with_ids([EventId::new([id; 32])]);
    let (records, _) = store
        .query(&filter, CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    records
}

async fn count_all(store: &EventStore) -> usize {
    store
        .count(&Filter::new(), CancellationToken::new())
        .await
        .unwrap()
}

// ============================================================================
// Event Tier
// ============================================================================

#[tokio::test]
async fn test_cycle_converges_below_low_water() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 4000).await;
    fill(&store, 12).await;
    let low_mark = store.config().gc.low_mark();

    let first = store.collect_garbage().await.unwrap();
    assert!(first.live_bytes >= store.config().gc.high_mark());
    assert!(first.deleted > 0);
    assert_eq!(first.demoted, 0);

    let second = store.collect_garbage().await.unwrap();
    assert!(second.live_bytes <= low_mark);
    assert_eq!(second.marked, 0);
    assert!(!second.changed_anything());

    // Deleted records are gone from every index
    assert_eq!(count_all(&store).await, 12 - first.deleted);
    assert!(lookup(&store, 1).await.is_empty());
    let tagged = store
        .count(&Filter::new().with_tag('t', ["gc"]), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tagged, 12 - first.deleted);

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_under_budget_is_untouched() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 1_000_000).await;
    fill(&store, 5).await;

    let report = store.collect_garbage().await.unwrap();
    assert_eq!(report.live_records, 5);
    assert_eq!(report.marked, 0);
    assert_eq!(count_all(&store).await, 5);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_demotion_keeps_records_discoverable() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 4000).await;
    store.set_demotion(true);
    fill(&store, 10).await;

    let report = store.collect_garbage().await.unwrap();
    assert!(report.demoted > 0);
    assert_eq!(report.deleted, 0);

    // The newest demoted record keeps its keys in this cycle
    let demoted = u8::try_from(report.demoted).unwrap();
    let records = lookup(&store, demoted).await;
    assert_eq!(records.len(), 1);
    assert!(records[0].is_stub());
    assert_eq!(records[0].id(), &EventId::new([demoted; 32]));

    let records = lookup(&store, 10).await;
    assert!(!records[0].is_stub());

    store.close().await.unwrap();
}

// ============================================================================
// Index Tier
// ============================================================================

#[tokio::test]
async fn test_index_tier_prunes_oldest_demoted() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 4000).await;
    store.set_demotion(true);
    fill(&store, 10).await;

    let report = store.collect_garbage().await.unwrap();
    assert!(report.demoted >= 2);
    assert!(report.index_serials_pruned >= 1);
    assert!(report.index_serials_pruned < report.demoted);
    assert!(report.index_entries_removed > 0);

    // Oldest demoted record is unreachable, a newer one is still a stub
    assert!(lookup(&store, 1).await.is_empty());
    let kept = u8::try_from(report.demoted).unwrap();
    assert!(lookup(&store, kept).await[0].is_stub());
    assert_eq!(count_all(&store).await, 10 - report.index_serials_pruned);

    store.close().await.unwrap();
}

// ============================================================================
// Background Loop
// ============================================================================

#[tokio::test]
async fn test_background_loop_collects() {
    let dir = TempDir::new().unwrap();
    let mut config = StoreConfig::with_path(dir.path().join("loop.redb"));
    config.gc.size_limit = 4000;
    config.gc.interval_secs = 1;
    strata_logging::init_testing();
    let store = EventStore::open(config).await.unwrap();
    fill(&store, 12).await;

    store.init().await.unwrap();
    let mut remaining = count_all(&store).await;
    for _ in 0..50 {
        if remaining < 12 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        remaining = count_all(&store).await;
    }
    assert!(remaining < 12);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_replacing_demoted_profile_hides_old_entries() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 4000).await;
    store.set_demotion(true);

    let profile = |id: u8, author: u8, created_at: i64| Event {
        id: EventId::new([id; 32]),
        pubkey: PublicKey::new([author; 32]),
        created_at,
        kind: Kind(0),
        tags: vec![Tag::new(["t", "profile"])],
        content: "payload ".repeat(50),
        sig: Signature::new([id; 64]),
    };
    for n in 1..=10u8 {
        store.save(&profile(n, n, i64::from(n) * 100)).await.unwrap();
    }
    let report = store.collect_garbage().await.unwrap();
    assert!(report.demoted > 0);

    // Newest demoted profile that still has its keys
    let mut demoted = None;
    for n in (1..=u8::try_from(report.demoted).unwrap()).rev() {
        if lookup(&store, n).await.first().is_some_and(Record::is_stub) {
            demoted = Some(n);
            break;
        }
    }
    let demoted = demoted.expect("a demoted profile keeps its keys");

    let newer = profile(200, demoted, 5000);
    store.save(&newer).await.unwrap();
    assert!(lookup(&store, demoted).await.is_empty());

    let by_tag = Filter::new().with_tag('t', ["profile"]);
    let (records, _) = store
        .query(&by_tag, CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    assert!(records.iter().all(|r| r.id() != &EventId::new([demoted; 32])));
    assert!(records.iter().any(|r| r.id() == &newer.id));
    let tagged = store.count(&by_tag, CancellationToken::new()).await.unwrap();
    assert_eq!(tagged, records.len());

    // The leftover tag entry goes with the next cycle
    let report = store.collect_garbage().await.unwrap();
    assert!(report.index_entries_removed >= 1);
    store.close().await.unwrap();
}
