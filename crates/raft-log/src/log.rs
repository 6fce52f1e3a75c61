//! The coordinator: partition lookup, append/read/commit/drop, snapshot
//! install, and compaction.
//!
//! One struct owns the on-disk state - partitioned log files, the
//! snapshot, and a binary node-state record - and exposes the operations
//! an external Raft implementation drives it through.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::commit_waiter;
use crate::config::LogConfig;
use crate::entry::{self, Entry};
use crate::error::{LogError, Result};
use crate::node_state::{MemberId, NodeStateFile};
use crate::partition::Partition;
use crate::session::{Session, SessionPool};
use crate::snapshot::Snapshot;
use crate::state_machine::StateMachine;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CoordinatorState {
    Open,
    Compacting,
    InstallingSnapshot,
    Disposed,
}

/// The persistent audit trail. One instance owns an entire on-disk
/// directory; construct with [`PersistentLog::open`].
pub struct PersistentLog<S: StateMachine> {
    directory: PathBuf,
    records_per_partition: u32,
    initial_partition_size: u64,
    use_caching: bool,
    buffer_size: u32,
    max_concurrent_reads: u32,
    lock: RwLock<()>,
    partitions: Mutex<BTreeMap<u64, Arc<Partition>>>,
    snapshot: Mutex<Arc<Snapshot>>,
    node_state: Mutex<NodeStateFile>,
    commit_tx: tokio::sync::watch::Sender<u64>,
    commit_rx: tokio::sync::watch::Receiver<u64>,
    sessions: SessionPool,
    state_machine: S,
    state: Mutex<CoordinatorState>,
}

impl<S: StateMachine> PersistentLog<S> {
    /// Opens (or creates) the log rooted at `directory`. Scans existing
    /// partition files, the snapshot, and the node-state record; warns
    /// (without truncating) if a partition holds entries past the
    /// persisted `last_index` - the signature of a crash between a
    /// partition write and the following node-state flush.
    pub async fn open(directory: impl AsRef<Path>, config: LogConfig, state_machine: S) -> Result<Self> {
        config.validate()?;
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;

        let mut partition_numbers = Vec::new();
        for dir_entry in std::fs::read_dir(&directory)? {
            let dir_entry = dir_entry?;
            if let Some(name) = dir_entry.file_name().to_str() {
                if let Ok(n) = name.parse::<u64>() {
                    partition_numbers.push(n);
                }
            }
        }
        partition_numbers.sort_unstable();

        let mut partitions = BTreeMap::new();
        for n in partition_numbers {
            let partition = Partition::open(
                &directory,
                config.buffer_size,
                config.records_per_partition,
                n,
                config.use_caching,
            )
            .await?;
            partition.populate_cache().await?;
            partitions.insert(n, Arc::new(partition));
        }

        let stale_temp = directory.join("snapshot.new");
        if stale_temp.exists() {
            tracing::warn!(
                path = %stale_temp.display(),
                "removing stale snapshot.new left by an interrupted install"
            );
            std::fs::remove_file(&stale_temp)?;
        }

        let snapshot = Snapshot::open(&directory, config.buffer_size, config.max_concurrent_reads, false).await?;
        snapshot.populate_cache().await?;

        let node_state = NodeStateFile::open(&directory).await?;

        if let Some((_, highest)) = partitions.iter().next_back() {
            if highest.last_index() > node_state.last_index() {
                tracing::warn!(
                    persisted_last_index = node_state.last_index(),
                    partition_last_index = highest.last_index(),
                    "partition data extends past the persisted last_index; entries beyond \
                     last_index are orphaned by a crash between write and flush and are left \
                     in place rather than truncated"
                );
            }
        }

        let (commit_tx, commit_rx) = commit_waiter::channel(node_state.commit_index());

        Ok(Self {
            directory,
            records_per_partition: config.records_per_partition,
            initial_partition_size: config.initial_partition_size,
            use_caching: config.use_caching,
            buffer_size: config.buffer_size,
            max_concurrent_reads: config.max_concurrent_reads,
            lock: RwLock::new(()),
            partitions: Mutex::new(partitions),
            snapshot: Mutex::new(Arc::new(snapshot)),
            node_state: Mutex::new(node_state),
            commit_tx,
            commit_rx,
            sessions: SessionPool::new(config.max_concurrent_reads as usize, config.buffer_size as usize),
            state_machine,
            state: Mutex::new(CoordinatorState::Open),
        })
    }

    async fn ensure_open(&self) -> Result<()> {
        if *self.state.lock().await == CoordinatorState::Disposed {
            return Err(LogError::InvalidState("operation on a disposed log".into()));
        }
        Ok(())
    }

    async fn partition_for(&self, index: u64) -> Option<Arc<Partition>> {
        let n = index / self.records_per_partition as u64;
        self.partitions.lock().await.get(&n).cloned()
    }

    async fn get_or_create_partition(&self, index: u64) -> Result<Arc<Partition>> {
        let n = index / self.records_per_partition as u64;
        let mut partitions = self.partitions.lock().await;
        if let Some(p) = partitions.get(&n) {
            return Ok(p.clone());
        }
        let partition = Partition::open(
            &self.directory,
            self.buffer_size,
            self.records_per_partition,
            n,
            self.use_caching,
        )
        .await?;
        if self.initial_partition_size > 0 {
            partition.allocate(self.initial_partition_size).await?;
        }
        if self.use_caching {
            partition.populate_cache().await?;
        }
        let partition = Arc::new(partition);
        partitions.insert(n, partition.clone());
        Ok(partition)
    }

    /// Appends `entries` starting right after the current `last_index`.
    /// Returns the index assigned to the first entry.
    pub async fn append_entries(&self, entries: Vec<Entry>, cancel: &CancellationToken) -> Result<u64> {
        self.ensure_open().await?;
        let _guard = self.lock.write().await;
        let start_index = self.node_state.lock().await.last_index() + 1;
        tracing::debug!(start_index, count = entries.len(), "appending entries");
        self.append_batch_locked(entries, start_index, false, cancel).await?;
        Ok(start_index)
    }

    /// Appends `entries` starting at `start_index`. When `skip_committed`
    /// is set, entries at or before the current commit index are skipped
    /// rather than rejected - used when replaying a leader's log.
    pub async fn append_batch(
        &self,
        entries: Vec<Entry>,
        start_index: u64,
        skip_committed: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_open().await?;
        let _guard = self.lock.write().await;
        self.append_batch_locked(entries, start_index, skip_committed, cancel).await
    }

    async fn append_batch_locked(
        &self,
        entries: impl IntoIterator<Item = Entry>,
        mut start_index: u64,
        skip_committed: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut node_state = self.node_state.lock().await;
        if start_index > node_state.last_index() + 1 {
            return Err(LogError::OutOfRange(format!(
                "start_index {start_index} exceeds last_index+1 ({})",
                node_state.last_index() + 1
            )));
        }

        let mut session = self.sessions.open_session().await;
        let mut touched: Option<Arc<Partition>> = None;
        let mut cancelled = false;
        for entry in entries {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if entry.is_snapshot {
                return Err(LogError::InvalidState(
                    "snapshot entry forbidden inside a batch append".into(),
                ));
            }
            if start_index > node_state.commit_index() {
                drop(node_state);
                let partition = self.get_or_create_partition(start_index).await?;
                let to_write = Entry::new(start_index, entry.term, entry.timestamp, entry.payload);
                partition.write(&mut session, &to_write, start_index).await?;
                node_state = self.node_state.lock().await;
                node_state.set_last_index(start_index)?;
                touched = Some(partition);
                start_index += 1;
            } else if skip_committed {
                start_index += 1;
            } else {
                return Err(LogError::InvalidState(
                    "append would overwrite a committed entry".into(),
                ));
            }
        }

        if let Some(partition) = touched {
            partition.flush().await?;
        }
        node_state.flush()?;
        if cancelled {
            return Err(LogError::Cancelled);
        }
        Ok(())
    }

    /// Appends a single entry at `start_index`, or installs it as a
    /// snapshot when `entry.is_snapshot` is set.
    pub async fn append_one(&self, entry: Entry, start_index: u64) -> Result<()> {
        self.ensure_open().await?;
        let _guard = self.lock.write().await;

        let commit_index = self.node_state.lock().await.commit_index();
        if start_index <= commit_index && !entry.is_snapshot {
            return Err(LogError::InvalidState(
                "append would overwrite a committed entry".into(),
            ));
        }
        if entry.is_snapshot {
            return self.install_snapshot_locked(entry, start_index).await;
        }

        let mut node_state = self.node_state.lock().await;
        if start_index > node_state.last_index() + 1 {
            return Err(LogError::OutOfRange(format!(
                "start_index {start_index} exceeds last_index+1 ({})",
                node_state.last_index() + 1
            )));
        }
        drop(node_state);
        let partition = self.get_or_create_partition(start_index).await?;
        let mut session = self.sessions.open_session().await;
        partition.write(&mut session, &entry, start_index).await?;
        partition.flush().await?;

        let mut node_state = self.node_state.lock().await;
        node_state.set_last_index(start_index)?;
        node_state.flush()?;
        Ok(())
    }

    async fn install_snapshot_locked(&self, entry: Entry, snapshot_index: u64) -> Result<()> {
        if (snapshot_index + 1) % self.records_per_partition as u64 != 0 {
            return Err(LogError::OutOfRange(format!(
                "snapshot index {snapshot_index} does not align with a partition boundary"
            )));
        }
        tracing::info!(snapshot_index, "installing snapshot");
        *self.state.lock().await = CoordinatorState::InstallingSnapshot;

        let temp = Snapshot::open(&self.directory, self.buffer_size, self.max_concurrent_reads, true).await?;
        let cancel = CancellationToken::new();
        {
            let mut session = self.sessions.open_session().await;
            temp.write(&mut session, &entry, snapshot_index, &cancel).await?;
        }
        temp.flush().await?;

        let final_path = self.directory.join("snapshot");
        let temp_path = self.directory.join("snapshot.new");
        if let Err(e) = std::fs::remove_file(&final_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                std::process::abort();
            }
        }
        if std::fs::rename(&temp_path, &final_path).is_err() {
            // Either filename now holds a recoverable snapshot; the only
            // unsafe state is holding neither. Not recoverable in-process.
            std::process::abort();
        }

        let reopened = Snapshot::open(&self.directory, self.buffer_size, self.max_concurrent_reads, false).await?;
        reopened.populate_cache().await?;
        *self.snapshot.lock().await = Arc::new(reopened);

        {
            let mut partitions = self.partitions.lock().await;
            let stale: Vec<u64> = partitions
                .iter()
                .filter(|(_, p)| p.last_index() <= snapshot_index)
                .map(|(&n, _)| n)
                .collect();
            for n in stale {
                if let Some(p) = partitions.remove(&n) {
                    p.delete()?;
                }
            }
        }

        let mut node_state = self.node_state.lock().await;
        node_state.set_commit_index(snapshot_index)?;
        let new_last = std::cmp::max(snapshot_index, node_state.last_index());
        node_state.set_last_index(new_last)?;
        self.state_machine.apply(&entry);
        node_state.set_last_applied(snapshot_index)?;
        node_state.flush()?;
        drop(node_state);

        let _ = self.commit_tx.send(snapshot_index);
        *self.state.lock().await = CoordinatorState::Open;
        tracing::info!(snapshot_index, "snapshot installed");
        Ok(())
    }

    /// Invokes `reader` with the entries in `[start_index, end_index]` and
    /// the snapshot index if the range was served partly or wholly from
    /// the snapshot.
    pub async fn read<F, T>(
        &self,
        start_index: u64,
        end_index: u64,
        cancel: &CancellationToken,
        reader: F,
    ) -> Result<T>
    where
        F: FnOnce(&[Entry], Option<u64>) -> T,
    {
        self.ensure_open().await?;
        if end_index < start_index {
            return Ok(reader(&[], None));
        }
        let _guard = self.lock.read().await;
        let mut session = self.sessions.open_session().await;

        let last_index = self.node_state.lock().await.last_index();
        if start_index > last_index || end_index > last_index {
            return Err(LogError::OutOfRange(format!(
                "requested range [{start_index}, {end_index}] exceeds last_index {last_index}"
            )));
        }
        let span = end_index - start_index + 1;
        if span > u32::MAX as u64 {
            return Err(LogError::BufferOverflow(format!(
                "requested span of {span} entries exceeds 2^31 entries"
            )));
        }

        let mut collected = Vec::with_capacity(span as usize);
        let mut snapshot_index = None;
        let mut index = start_index;
        let mut last_partition_number: Option<u64> = None;
        while index <= end_index {
            if cancel.is_cancelled() {
                return Err(LogError::Cancelled);
            }
            if index == 0 {
                collected.push(entry::sentinel().clone());
                index += 1;
                continue;
            }
            if let Some(partition) = self.partition_for(index).await {
                let partition_number = partition.partition_number();
                let refresh = last_partition_number != Some(partition_number);
                last_partition_number = Some(partition_number);
                match partition.read(&mut session, index, true, refresh).await? {
                    Some(found) => collected.push(found),
                    None => break,
                }
                index += 1;
                continue;
            }
            let commit_index = self.node_state.lock().await.commit_index();
            let snapshot = self.snapshot.lock().await.clone();
            if index <= commit_index && snapshot.is_present().await {
                let found = snapshot.read(&mut session, cancel).await?;
                snapshot_index = Some(found.index);
                collected.push(found);
                let rpp = self.records_per_partition as u64;
                index = commit_index - (commit_index + 1) % rpp + 1;
                continue;
            }
            break;
        }
        Ok(reader(&collected, snapshot_index))
    }

    /// Equivalent to [`Self::read`] with `end_index` set to the current
    /// `last_index`.
    pub async fn read_to_end<F, T>(&self, start_index: u64, cancel: &CancellationToken, reader: F) -> Result<T>
    where
        F: FnOnce(&[Entry], Option<u64>) -> T,
    {
        let last_index = self.node_state.lock().await.last_index();
        self.read(start_index, last_index, cancel, reader).await
    }

    async fn apply_range(
        &self,
        from_exclusive: u64,
        to_inclusive: u64,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut last_partition_number: Option<u64> = None;
        for i in (from_exclusive + 1)..=to_inclusive {
            if cancel.is_cancelled() {
                return Err(LogError::Cancelled);
            }
            let applied = if i == 0 {
                entry::sentinel().clone()
            } else if let Some(partition) = self.partition_for(i).await {
                let partition_number = partition.partition_number();
                let refresh = last_partition_number != Some(partition_number);
                last_partition_number = Some(partition_number);
                partition.read(session, i, true, refresh).await?.ok_or_else(|| {
                    LogError::InvalidState(format!("entry {i} missing from its partition during apply"))
                })?
            } else {
                let snapshot = self.snapshot.lock().await.clone();
                snapshot.read(session, cancel).await?
            };
            self.state_machine.apply(&applied);
            self.node_state.lock().await.set_last_applied(i)?;
        }
        Ok(())
    }

    /// Advances `commit_index` to `end_index` (or `last_index` if
    /// unspecified), applying every newly committed entry, then runs
    /// compaction if it is due. Returns the number of entries committed.
    pub async fn commit(&self, end_index: Option<u64>, cancel: &CancellationToken) -> Result<u64> {
        self.ensure_open().await?;
        let _guard = self.lock.write().await;

        let mut node_state = self.node_state.lock().await;
        let target = end_index.unwrap_or(node_state.last_index());
        let commit_index = node_state.commit_index();
        if target <= commit_index {
            return Ok(0);
        }
        let count = target - commit_index;
        node_state.set_commit_index(target)?;
        let last_applied = node_state.last_applied();
        drop(node_state);

        let mut session = self.sessions.open_session().await;
        self.apply_range(last_applied, target, &mut session, cancel).await?;
        drop(session);

        self.node_state.lock().await.flush()?;
        tracing::debug!(commit_index = target, count, "advanced commit index");
        self.maybe_compact(target, cancel).await?;
        let _ = self.commit_tx.send(target);
        Ok(count)
    }

    async fn maybe_compact(&self, commit_index: u64, cancel: &CancellationToken) -> Result<()> {
        let Some(mut builder) = self.state_machine.create_snapshot_builder() else {
            return Ok(());
        };
        let snapshot = self.snapshot.lock().await.clone();
        let snapshot_last_index = snapshot.last_index().await.unwrap_or(0);
        if commit_index.saturating_sub(snapshot_last_index) <= self.records_per_partition as u64 {
            return Ok(());
        }

        tracing::info!(
            commit_index,
            snapshot_last_index,
            "force compaction threshold reached"
        );
        *self.state.lock().await = CoordinatorState::Compacting;

        let compactable: Vec<Arc<Partition>> = {
            let partitions = self.partitions.lock().await;
            partitions
                .values()
                .filter(|p| p.last_index() <= commit_index)
                .cloned()
                .collect()
        };
        if compactable.is_empty() {
            *self.state.lock().await = CoordinatorState::Open;
            return Ok(());
        }

        let mut session = self.sessions.open_session().await;
        let mut snapshot_index = snapshot_last_index;
        let mut snapshot_term = 0i64;
        let mut snapshot_timestamp = 0i64;
        for partition in &compactable {
            if cancel.is_cancelled() {
                *self.state.lock().await = CoordinatorState::Open;
                return Err(LogError::Cancelled);
            }
            partition.flush().await?;
            let first_slot = if partition.partition_number() == 0 { 1 } else { 0 };
            for slot in first_slot..self.records_per_partition as u64 {
                let absolute = partition.first_index() + slot;
                if let Some(found) = partition.read(&mut session, absolute, true, false).await? {
                    snapshot_term = found.term;
                    snapshot_timestamp = found.timestamp;
                    builder.apply_core(&found);
                }
            }
            snapshot_index = partition.last_index();
        }

        let snapshot_entry = builder.into_entry(snapshot_index, snapshot_term, snapshot_timestamp);
        snapshot
            .write(&mut session, &snapshot_entry, snapshot_index, cancel)
            .await?;
        snapshot.flush().await?;

        {
            let mut partitions = self.partitions.lock().await;
            for partition in &compactable {
                partitions.remove(&partition.partition_number());
                partition.delete()?;
            }
        }

        *self.state.lock().await = CoordinatorState::Open;
        tracing::info!(
            snapshot_index,
            partitions_compacted = compactable.len(),
            "compaction complete"
        );
        Ok(())
    }

    /// Drops every entry at or after `start_index`. Fails if `start_index`
    /// is at or before `commit_index`.
    pub async fn drop_from(&self, start_index: u64, cancel: &CancellationToken) -> Result<u64> {
        self.ensure_open().await?;
        let _guard = self.lock.write().await;

        let mut node_state = self.node_state.lock().await;
        if start_index <= node_state.commit_index() {
            return Err(LogError::InvalidState(format!(
                "cannot drop committed index {start_index} (commit_index={})",
                node_state.commit_index()
            )));
        }
        let last_index = node_state.last_index();
        if start_index > last_index {
            return Ok(0);
        }
        let count = last_index - start_index + 1;
        node_state.set_last_index(start_index - 1)?;
        node_state.flush()?;
        drop(node_state);
        tracing::debug!(start_index, count, "dropping log tail");

        let rpp = self.records_per_partition as u64;
        let partition_number = start_index / rpp;
        let first_fully_after = if start_index == partition_number * rpp {
            partition_number
        } else {
            partition_number + 1
        };

        let mut partitions = self.partitions.lock().await;
        let to_remove: Vec<u64> = partitions.range(first_fully_after..).map(|(&n, _)| n).collect();
        for n in to_remove {
            if let Some(p) = partitions.remove(&n) {
                p.delete()?;
            }
        }
        drop(partitions);

        if cancel.is_cancelled() {
            return Err(LogError::Cancelled);
        }
        Ok(count)
    }

    /// Blocks until `commit_index >= index`, or cancellation, or `timeout`
    /// elapses.
    pub async fn wait_for_commit(
        &self,
        index: u64,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut rx = self.commit_rx.clone();
        commit_waiter::wait_for_commit(&mut rx, index, timeout, cancel).await
    }

    /// The ephemeral sentinel entry at index 0.
    pub fn first(&self) -> &'static Entry {
        entry::sentinel()
    }

    /// `commit_index` if `committed`, else `last_index`.
    pub async fn last_index(&self, committed: bool) -> u64 {
        let node_state = self.node_state.lock().await;
        if committed {
            node_state.commit_index()
        } else {
            node_state.last_index()
        }
    }

    pub async fn term(&self) -> i64 {
        self.node_state.lock().await.term()
    }

    pub async fn increment_term(&self) -> Result<i64> {
        self.ensure_open().await?;
        let _guard = self.lock.write().await;
        let mut node_state = self.node_state.lock().await;
        let term = node_state.increment_term()?;
        node_state.flush()?;
        Ok(term)
    }

    pub async fn update_term(&self, term: i64) -> Result<()> {
        self.ensure_open().await?;
        let _guard = self.lock.write().await;
        let mut node_state = self.node_state.lock().await;
        node_state.update_term(term)?;
        node_state.flush()?;
        Ok(())
    }

    /// True when either no vote has been cast this term or the existing
    /// vote matches `member`.
    pub async fn is_voted_for(&self, member: MemberId) -> bool {
        match self.node_state.lock().await.voted_for() {
            None => true,
            Some(voted) => voted == member,
        }
    }

    pub async fn update_voted_for(&self, member: MemberId) -> Result<()> {
        self.ensure_open().await?;
        let _guard = self.lock.write().await;
        let mut node_state = self.node_state.lock().await;
        node_state.update_voted_for(member)?;
        node_state.flush()?;
        Ok(())
    }

    /// Forces a re-apply of every committed entry not yet reflected in
    /// `last_applied`, without moving `commit_index`.
    pub async fn ensure_consistency(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open().await?;
        let _guard = self.lock.write().await;
        let (last_applied, commit_index) = {
            let node_state = self.node_state.lock().await;
            (node_state.last_applied(), node_state.commit_index())
        };
        if last_applied >= commit_index {
            return Ok(());
        }
        let mut session = self.sessions.open_session().await;
        self.apply_range(last_applied, commit_index, &mut session, cancel).await?;
        drop(session);
        self.node_state.lock().await.flush()?;
        Ok(())
    }

    /// Marks the log disposed; subsequent operations fail with
    /// [`LogError::InvalidState`].
    pub async fn dispose(&self) {
        *self.state.lock().await = CoordinatorState::Disposed;
    }
}
