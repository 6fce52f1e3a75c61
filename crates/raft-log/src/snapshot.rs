//! The compacted-state file: a fixed header followed by payload bytes.
//!
//! Installed with a temp-file-then-rename discipline, laid out as
//! header-then-payload in a single file rather than a snapshot directory,
//! since this format only ever holds one compacted entry at a time.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::entry::Entry;
use crate::error::{LogError, Result};
use crate::metadata::{SnapshotMetadata, SNAPSHOT_METADATA_LEN};
use crate::session::Session;

/// The snapshot file, in either its live (`snapshot`) or staged
/// (`snapshot.new`) form.
pub struct Snapshot {
    path: PathBuf,
    readers: Arc<Semaphore>,
    cache: RwLock<Option<SnapshotMetadata>>,
}

impl Snapshot {
    /// Opens (creating if absent) the snapshot file. `temp` selects
    /// `snapshot.new` over `snapshot`. `readers_count` bounds concurrent
    /// snapshot reads independently of the coordinator's general session
    /// pool, since snapshot reads during compaction replay can run
    /// alongside ordinary partition reads.
    pub async fn open(directory: &Path, _buffer_size: u32, readers_count: u32, temp: bool) -> Result<Self> {
        let filename = if temp { "snapshot.new" } else { "snapshot" };
        let path = directory.join(filename);
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            path,
            readers: Arc::new(Semaphore::new(readers_count.max(1) as usize)),
            cache: RwLock::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the header (if the file is non-empty) into the in-memory
    /// cache; an empty file means no snapshot has been installed yet.
    pub async fn populate_cache(&self) -> Result<()> {
        let mut file = OpenOptions::new().read(true).open(&self.path)?;
        let len = file.metadata()?.len();
        let meta = if len > 0 {
            let mut buf = [0u8; SNAPSHOT_METADATA_LEN];
            file.read_exact(&mut buf)?;
            Some(SnapshotMetadata::from_bytes(&buf))
        } else {
            None
        };
        *self.cache.write().await = meta;
        Ok(())
    }

    /// `true` once a snapshot has been written and its cache populated.
    pub async fn is_present(&self) -> bool {
        self.cache.read().await.is_some()
    }

    /// The last index this snapshot replaces, if present.
    pub async fn last_index(&self) -> Option<u64> {
        self.cache.read().await.map(|m| m.index)
    }

    /// Writes `entry` as the compacted snapshot replacing everything up to
    /// and including `index`. Does not flush; the caller flushes once the
    /// write (and any subsequent rename) has completed.
    pub async fn write(
        &self,
        session: &mut Session,
        entry: &Entry,
        index: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(LogError::Cancelled);
        }
        let _permit = self.readers.acquire().await.expect("semaphore never closed");
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(SNAPSHOT_METADATA_LEN as u64))?;
        file.write_all(&entry.payload)?;
        let meta = SnapshotMetadata {
            offset: SNAPSHOT_METADATA_LEN as u64,
            length: entry.payload.len() as u64,
            term: entry.term,
            timestamp: entry.timestamp,
            index,
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&meta.to_bytes())?;
        *self.cache.write().await = Some(meta);
        let _ = session;
        Ok(())
    }

    /// Reads the current snapshot entry. The file is re-synced first so a
    /// reader observes the writer's most recent complete write.
    pub async fn read(&self, session: &mut Session, cancel: &CancellationToken) -> Result<Entry> {
        if cancel.is_cancelled() {
            return Err(LogError::Cancelled);
        }
        let _permit = self.readers.acquire().await.expect("semaphore never closed");
        let mut file = OpenOptions::new().read(true).open(&self.path)?;
        file.sync_data()?;
        file.seek(SeekFrom::Start(0))?;
        let mut header_buf = [0u8; SNAPSHOT_METADATA_LEN];
        file.read_exact(&mut header_buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                LogError::UnexpectedEof("snapshot header missing".into())
            } else {
                LogError::Io(e)
            }
        })?;
        let meta = SnapshotMetadata::from_bytes(&header_buf);
        let len = meta.length as usize;
        if session.buffer.len() < len {
            session.buffer.resize(len, 0);
        }
        file.read_exact(&mut session.buffer[..len])?;
        Ok(Entry::snapshot(
            meta.index,
            meta.term,
            meta.timestamp,
            session.buffer[..len].to_vec(),
        ))
    }

    /// Fsyncs the snapshot file for durability.
    pub async fn flush(&self) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.sync_all()?;
        Ok(())
    }

    /// Removes the underlying file, used when discarding a stale
    /// `snapshot.new` left over from an interrupted install.
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_snapshot_has_no_cached_header() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = Snapshot::open(dir.path(), 2048, 2, false).await.unwrap();
        snapshot.populate_cache().await.unwrap();
        assert!(!snapshot.is_present().await);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = Snapshot::open(dir.path(), 2048, 2, false).await.unwrap();
        let mut session = Session::new(2048);
        let cancel = CancellationToken::new();
        let entry = Entry::new(7, 9, 123, b"compacted state".to_vec());
        snapshot.write(&mut session, &entry, 7, &cancel).await.unwrap();

        let read_back = snapshot.read(&mut session, &cancel).await.unwrap();
        assert_eq!(read_back.index, 7);
        assert_eq!(read_back.term, 9);
        assert!(read_back.is_snapshot);
        assert_eq!(read_back.payload, b"compacted state");
    }

    #[tokio::test]
    async fn cache_reflects_latest_write() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = Snapshot::open(dir.path(), 2048, 2, false).await.unwrap();
        let mut session = Session::new(2048);
        let cancel = CancellationToken::new();
        snapshot
            .write(&mut session, &Entry::new(3, 1, 0, b"a".to_vec()), 3, &cancel)
            .await
            .unwrap();
        snapshot
            .write(&mut session, &Entry::new(7, 2, 0, b"bb".to_vec()), 7, &cancel)
            .await
            .unwrap();
        assert_eq!(snapshot.last_index().await, Some(7));
    }
}
