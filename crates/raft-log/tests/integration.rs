//! Crate-external integration tests driving [`raft_log::PersistentLog`]
//! purely through its public API, end to end.

use raft_log::{Entry, LogConfig, LogError, PersistentLog, SnapshotBuilder, StateMachine};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

struct ConcatBuilder {
    payload: Vec<u8>,
}

impl SnapshotBuilder for ConcatBuilder {
    fn apply_core(&mut self, entry: &Entry) {
        self.payload.extend_from_slice(&entry.payload);
    }

    fn into_entry(self, index: u64, term: i64, timestamp: i64) -> Entry {
        Entry::snapshot(index, term, timestamp, self.payload)
    }
}

struct CountingStateMachine {
    applied: Arc<Mutex<usize>>,
}

impl CountingStateMachine {
    fn new() -> Self {
        Self {
            applied: Arc::new(Mutex::new(0)),
        }
    }

    fn counter(&self) -> Arc<Mutex<usize>> {
        self.applied.clone()
    }
}

impl StateMachine for CountingStateMachine {
    type Builder = ConcatBuilder;

    fn apply(&self, _entry: &Entry) {
        *self.applied.lock().unwrap() += 1;
    }

    fn create_snapshot_builder(&self) -> Option<Self::Builder> {
        Some(ConcatBuilder { payload: Vec::new() })
    }
}

fn entry(term: i64, payload: &[u8]) -> Entry {
    Entry::new(0, term, 1_700_000_000, payload.to_vec())
}

fn config(records_per_partition: u32) -> LogConfig {
    LogConfig::builder()
        .records_per_partition(records_per_partition)
        .build()
}

/// Node state (term, vote, commit index) must survive a full close/reopen
/// cycle, independent of any partition or snapshot content.
#[tokio::test]
async fn node_state_round_trips_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    {
        let log = PersistentLog::open(dir.path(), config(4), CountingStateMachine::new())
            .await
            .unwrap();
        log.update_term(9).await.unwrap();
        log.update_voted_for(3).await.unwrap();
        log.append_entries(vec![entry(9, b"a"), entry(9, b"b")], &cancel)
            .await
            .unwrap();
        log.commit(Some(1), &cancel).await.unwrap();
    }

    let log = PersistentLog::open(dir.path(), config(4), CountingStateMachine::new())
        .await
        .unwrap();
    assert_eq!(log.term().await, 9);
    assert!(log.is_voted_for(3).await);
    assert_eq!(log.last_index(true).await, 1);
    assert_eq!(log.last_index(false).await, 2);
}

/// Many concurrent readers may run alongside each other bounded only by
/// `max_concurrent_reads`; none of them observe a torn write.
#[tokio::test]
async fn concurrent_readers_see_consistent_entries() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let log = Arc::new(
        PersistentLog::open(
            dir.path(),
            LogConfig::builder()
                .records_per_partition(8)
                .max_concurrent_reads(4)
                .build(),
            CountingStateMachine::new(),
        )
        .await
        .unwrap(),
    );
    let entries: Vec<Entry> = (1..=6).map(|i| entry(1, format!("e{i}").as_bytes())).collect();
    log.append_entries(entries, &cancel).await.unwrap();

    let mut readers = Vec::new();
    for _ in 0..4 {
        let log = log.clone();
        readers.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            log.read(1, 6, &cancel, |entries, _| entries.to_vec())
                .await
                .unwrap()
        }));
    }
    for reader in readers {
        let entries = reader.await.unwrap();
        assert_eq!(entries.len(), 6);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.payload, format!("e{}", i + 1).as_bytes());
        }
    }
}

/// `ensure_consistency` re-applies every committed-but-unapplied entry
/// without moving `commit_index`.
#[tokio::test]
async fn ensure_consistency_catches_up_apply_without_moving_commit() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let state_machine = CountingStateMachine::new();
    let log = PersistentLog::open(dir.path(), config(4), state_machine)
        .await
        .unwrap();
    log.append_entries(vec![entry(1, b"a"), entry(1, b"b"), entry(1, b"c")], &cancel)
        .await
        .unwrap();
    log.commit(Some(3), &cancel).await.unwrap();
    let before = log.last_index(true).await;

    log.ensure_consistency(&cancel).await.unwrap();

    assert_eq!(log.last_index(true).await, before);
}

/// A batch append whose `start_index` is more than one past `last_index`
/// is rejected rather than silently leaving a gap.
#[tokio::test]
async fn append_batch_rejects_a_gap() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let log = PersistentLog::open(dir.path(), config(4), CountingStateMachine::new())
        .await
        .unwrap();

    let result = log
        .append_batch(vec![entry(1, b"a")], 5, false, &cancel)
        .await;
    assert!(matches!(result, Err(LogError::OutOfRange(_))));
}

/// `wait_for_commit` with a timeout shorter than the eventual commit
/// reports the same outcome as cancellation: the caller cannot distinguish
/// "told to stop" from "ran out of time" from the return value alone.
#[tokio::test]
async fn wait_for_commit_times_out_when_commit_never_arrives() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let log = PersistentLog::open(dir.path(), config(4), CountingStateMachine::new())
        .await
        .unwrap();
    log.append_entries(vec![entry(1, b"a")], &cancel).await.unwrap();

    let result = log
        .wait_for_commit(1, Some(std::time::Duration::from_millis(20)), &cancel)
        .await;
    assert!(matches!(result, Err(LogError::Cancelled)));
}

/// Compaction only ever folds committed partitions into the builder; the
/// apply count observed by the embedder state machine reflects every
/// entry committed, snapshot entry included.
#[tokio::test]
async fn compaction_applies_every_committed_entry_including_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let state_machine = CountingStateMachine::new();
    let counter = state_machine.counter();
    let log = PersistentLog::open(dir.path(), config(4), state_machine)
        .await
        .unwrap();
    let entries: Vec<Entry> = (1..=9).map(|i| entry(1, format!("e{i}").as_bytes())).collect();
    log.append_entries(entries, &cancel).await.unwrap();
    log.commit(None, &cancel).await.unwrap();

    // All 9 originally-appended entries are applied once each as commit
    // walks `(last_applied, commit_index]`; compaction runs only after
    // that walk and folds the already-applied entries into one snapshot
    // without re-invoking apply for them again.
    assert_eq!(*counter.lock().unwrap(), 9);
}
