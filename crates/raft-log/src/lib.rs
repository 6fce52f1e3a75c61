//! A persistent, partitioned audit trail for a Raft-style consensus
//! implementation.
//!
//! Durable, ordered storage of replicated log entries with a single
//! writer and many concurrent readers, log compaction via snapshots, and
//! persisted node-local Raft state (current term, vote). The consensus
//! algorithm itself (leader election, heartbeats, RPC) lives outside this
//! crate and drives the log through [`PersistentLog`].
//!
//! ```no_run
//! use raft_log::{Entry, LogConfig, PersistentLog, SnapshotBuilder, StateMachine};
//! use tokio_util::sync::CancellationToken;
//!
//! struct NoopBuilder;
//! impl SnapshotBuilder for NoopBuilder {
//!     fn apply_core(&mut self, _entry: &Entry) {}
//!     fn into_entry(self, index: u64, term: i64, timestamp: i64) -> Entry {
//!         Entry::snapshot(index, term, timestamp, Vec::new())
//!     }
//! }
//!
//! struct Noop;
//! impl StateMachine for Noop {
//!     type Builder = NoopBuilder;
//!     fn apply(&self, _entry: &Entry) {}
//!     fn create_snapshot_builder(&self) -> Option<Self::Builder> {
//!         None
//!     }
//! }
//!
//! # async fn run() -> raft_log::Result<()> {
//! let config = LogConfig::builder().records_per_partition(64).build();
//! let log = PersistentLog::open("./data/raft-log", config, Noop).await?;
//! let cancel = CancellationToken::new();
//! log.append_entries(vec![Entry::new(0, 1, 0, b"hello".to_vec())], &cancel)
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod commit_waiter;
mod config;
mod entry;
mod error;
mod log;
mod metadata;
mod node_state;
mod partition;
mod session;
mod snapshot;
mod state_machine;

pub use config::LogConfig;
pub use entry::{sentinel, Entry};
pub use error::{LogError, Result};
pub use log::PersistentLog;
pub use node_state::MemberId;
pub use state_machine::{SnapshotBuilder, StateMachine};
