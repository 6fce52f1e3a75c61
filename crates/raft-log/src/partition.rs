//! A single partition file: a fixed-size allocation table of slot metadata
//! followed by a payload region holding the entries themselves. Each call
//! opens a plain `std::fs::File` fresh, seeks to the position it needs, and
//! reads or writes directly - no `tokio::fs`.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

use crate::entry::Entry;
use crate::error::{LogError, Result};
use crate::metadata::{LogEntryMetadata, LOG_ENTRY_METADATA_LEN};
use crate::session::Session;

/// A contiguous range of `records_per_partition` log entries, stored as one
/// file named by its decimal partition number.
pub struct Partition {
    path: PathBuf,
    partition_number: u64,
    records_per_partition: u32,
    buffer_size: u32,
    cache: Option<RwLock<Vec<LogEntryMetadata>>>,
}

impl Partition {
    /// Opens (creating if absent) the partition file, ensuring its
    /// allocation table is fully present (zero-filled) so a later
    /// `populate_cache` can tell a genuinely truncated table apart from a
    /// brand-new, empty one.
    pub async fn open(
        directory: &Path,
        buffer_size: u32,
        records_per_partition: u32,
        partition_number: u64,
        use_caching: bool,
    ) -> Result<Self> {
        let path = directory.join(partition_number.to_string());
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let table_len = records_per_partition as u64 * LOG_ENTRY_METADATA_LEN as u64;
        if file.metadata()?.len() < table_len {
            file.set_len(table_len)?;
        }
        let cache = if use_caching {
            Some(RwLock::new(vec![
                LogEntryMetadata::default();
                records_per_partition as usize
            ]))
        } else {
            None
        };
        Ok(Self {
            path,
            partition_number,
            records_per_partition,
            buffer_size,
            cache,
        })
    }

    pub fn partition_number(&self) -> u64 {
        self.partition_number
    }

    pub fn first_index(&self) -> u64 {
        self.partition_number * self.records_per_partition as u64
    }

    pub fn last_index(&self) -> u64 {
        self.first_index() + self.records_per_partition as u64 - 1
    }

    fn payload_offset(&self) -> u64 {
        self.records_per_partition as u64 * LOG_ENTRY_METADATA_LEN as u64
    }

    fn slot_of(&self, index: u64, absolute: bool) -> u64 {
        if absolute {
            index - self.first_index()
        } else {
            index
        }
    }

    /// Extends the file so its payload region is at least `initial_size`
    /// bytes, to reduce fragmentation from repeated small growths.
    pub async fn allocate(&self, initial_size: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        let target = self.payload_offset() + initial_size;
        if file.metadata()?.len() < target {
            file.set_len(target)?;
        }
        Ok(())
    }

    /// Reads the on-disk allocation table into the in-memory cache, in
    /// chunks sized by the session buffer. A short read indicates a
    /// genuinely truncated (corrupt) table, since `open` always ensures
    /// the table region is fully present.
    pub async fn populate_cache(&self) -> Result<()> {
        let Some(cache_lock) = &self.cache else {
            return Ok(());
        };
        let mut file = OpenOptions::new().read(true).open(&self.path)?;
        let table_len = self.payload_offset() as usize;
        let chunk_records = (self.buffer_size as usize / LOG_ENTRY_METADATA_LEN).max(1);
        let chunk_bytes = chunk_records * LOG_ENTRY_METADATA_LEN;
        let mut buf = vec![0u8; chunk_bytes];
        let mut cache = Vec::with_capacity(self.records_per_partition as usize);
        let mut read_total = 0usize;
        while read_total < table_len {
            let this_chunk = (table_len - read_total).min(chunk_bytes);
            file.read_exact(&mut buf[..this_chunk]).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    LogError::UnexpectedEof(format!(
                        "partition {} allocation table truncated at byte {read_total}",
                        self.partition_number
                    ))
                } else {
                    LogError::Io(e)
                }
            })?;
            for rec in buf[..this_chunk].chunks_exact(LOG_ENTRY_METADATA_LEN) {
                let arr: [u8; LOG_ENTRY_METADATA_LEN] = rec.try_into().unwrap();
                cache.push(LogEntryMetadata::from_bytes(&arr));
            }
            read_total += this_chunk;
        }
        *cache_lock.write().await = cache;
        Ok(())
    }

    fn read_metadata_at(file: &mut std::fs::File, slot: u64) -> Result<LogEntryMetadata> {
        let mut buf = [0u8; LOG_ENTRY_METADATA_LEN];
        file.seek(SeekFrom::Start(slot * LOG_ENTRY_METADATA_LEN as u64))?;
        file.read_exact(&mut buf)?;
        Ok(LogEntryMetadata::from_bytes(&buf))
    }

    fn write_metadata_at(
        file: &mut std::fs::File,
        slot: u64,
        meta: LogEntryMetadata,
    ) -> Result<()> {
        file.seek(SeekFrom::Start(slot * LOG_ENTRY_METADATA_LEN as u64))?;
        file.write_all(&meta.to_bytes())?;
        Ok(())
    }

    fn is_first_writable_slot(&self, slot: u64) -> bool {
        (self.partition_number == 0 && slot == 1) || (self.partition_number != 0 && slot == 0)
    }

    /// Reads the entry at `index` (absolute or partition-relative per
    /// `absolute`). Returns `None` if the slot is unused. When
    /// `refresh_stream` is set, the reader's view is synchronized with any
    /// concurrent write before the slot is consulted - the coordinator sets
    /// this whenever a read crosses into a new partition.
    pub async fn read(
        &self,
        session: &mut Session,
        index: u64,
        absolute: bool,
        refresh_stream: bool,
    ) -> Result<Option<Entry>> {
        let slot = self.slot_of(index, absolute);
        debug_assert!(
            slot < self.records_per_partition as u64,
            "slot {slot} out of range for partition {}",
            self.partition_number
        );
        let mut file = OpenOptions::new().read(true).open(&self.path)?;
        if refresh_stream {
            file.sync_data()?;
        }
        let meta = if let Some(cache) = &self.cache {
            cache.read().await[slot as usize]
        } else {
            Self::read_metadata_at(&mut file, slot)?
        };
        if meta.is_unused() {
            return Ok(None);
        }
        let len = meta.length as usize;
        if session.buffer.len() < len {
            session.buffer.resize(len, 0);
        }
        file.seek(SeekFrom::Start(meta.offset))?;
        file.read_exact(&mut session.buffer[..len])?;
        let absolute_index = if absolute {
            index
        } else {
            self.first_index() + index
        };
        Ok(Some(Entry::new(
            absolute_index,
            meta.term,
            meta.timestamp,
            session.buffer[..len].to_vec(),
        )))
    }

    /// Writes `entry` into the slot for `absolute_index`. Does not flush -
    /// the coordinator batches flushes across partitions.
    pub async fn write(&self, _session: &mut Session, entry: &Entry, absolute_index: u64) -> Result<()> {
        let slot = self.slot_of(absolute_index, true);
        debug_assert!(
            slot < self.records_per_partition as u64,
            "slot {slot} out of range for partition {}",
            self.partition_number
        );
        debug_assert!(
            !(self.partition_number == 0 && slot == 0),
            "index 0 is the ephemeral sentinel and is never persisted"
        );
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let offset = if self.is_first_writable_slot(slot) {
            self.payload_offset()
        } else {
            let prev = if let Some(cache) = &self.cache {
                cache.read().await[(slot - 1) as usize]
            } else {
                Self::read_metadata_at(&mut file, slot - 1)?
            };
            prev.offset + prev.length
        };
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&entry.payload)?;
        let meta = LogEntryMetadata {
            offset,
            length: entry.payload.len() as u64,
            term: entry.term,
            timestamp: entry.timestamp,
        };
        Self::write_metadata_at(&mut file, slot, meta)?;
        if let Some(cache) = &self.cache {
            cache.write().await[slot as usize] = meta;
        }
        Ok(())
    }

    /// Fsyncs the partition file for durability.
    pub async fn flush(&self) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.sync_all()?;
        Ok(())
    }

    /// Removes the partition's backing file. Used during compaction and
    /// drop.
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
    use crate::entry::Entry;

    #[tokio::test]
    async fn write_then_read_first_real_slot_of_partition_zero() {
        let dir = tempfile::tempdir().unwrap();
        let partition = Partition::open(dir.path(), 2048, 4, 0, true).await.unwrap();
        let mut session = Session::new(2048);
        let entry = Entry::new(1, 42, 1_000, b"hello".to_vec());
        partition.write(&mut session, &entry, 1).await.unwrap();

        let read_back = partition
            .read(&mut session, 1, true, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_back.payload, b"hello");
        assert_eq!(read_back.term, 42);
        assert_eq!(read_back.index, 1);
    }

    #[tokio::test]
    async fn unused_slot_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let partition = Partition::open(dir.path(), 2048, 4, 1, true).await.unwrap();
        let mut session = Session::new(2048);
        assert!(partition
            .read(&mut session, partition.first_index(), true, false)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn sequential_writes_pack_payload_region_contiguously() {
        let dir = tempfile::tempdir().unwrap();
        let partition = Partition::open(dir.path(), 2048, 4, 1, true).await.unwrap();
        let mut session = Session::new(2048);
        let base = partition.first_index();
        partition
            .write(&mut session, &Entry::new(base, 1, 10, b"aa".to_vec()), base)
            .await
            .unwrap();
        partition
            .write(
                &mut session,
                &Entry::new(base + 1, 1, 11, b"bbb".to_vec()),
                base + 1,
            )
            .await
            .unwrap();

        let first = partition.read(&mut session, base, true, false).await.unwrap().unwrap();
        let second = partition
            .read(&mut session, base + 1, true, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload, b"aa");
        assert_eq!(second.payload, b"bbb");
    }

    #[tokio::test]
    async fn reopen_without_cache_reads_from_table_directly() {
        let dir = tempfile::tempdir().unwrap();
        {
            let partition = Partition::open(dir.path(), 2048, 4, 2, false).await.unwrap();
            let mut session = Session::new(2048);
            let base = partition.first_index();
            partition
                .write(&mut session, &Entry::new(base, 3, 5, b"x".to_vec()), base)
                .await
                .unwrap();
        }
        let partition = Partition::open(dir.path(), 2048, 4, 2, false).await.unwrap();
        let mut session = Session::new(2048);
        let base = partition.first_index();
        let e = partition.read(&mut session, base, true, false).await.unwrap().unwrap();
        assert_eq!(e.payload, b"x");
    }
}
