//! Durable node-local state: current term, last vote, and the replay
//! cursors the coordinator needs on restart.
//!
//! Laid out as one fixed-size little-endian record, small and fixed enough
//! to round-trip with a plain byte layout rather than a general-purpose
//! serialization format.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// A member identifier in the consensus group.
pub type MemberId = u64;

const RECORD_LEN: usize = 40;
const NO_VOTE: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NodeState {
    term: i64,
    voted_for: Option<MemberId>,
    commit_index: u64,
    last_index: u64,
    last_applied: u64,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            term: 0,
            voted_for: None,
            commit_index: 0,
            last_index: 0,
            last_applied: 0,
        }
    }
}

impl NodeState {
    fn to_bytes(self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..8].copy_from_slice(&self.term.to_le_bytes());
        buf[8..16].copy_from_slice(&self.voted_for.unwrap_or(NO_VOTE).to_le_bytes());
        buf[16..24].copy_from_slice(&self.commit_index.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_index.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_applied.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; RECORD_LEN]) -> Self {
        let voted_for_raw = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        Self {
            term: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            voted_for: if voted_for_raw == NO_VOTE {
                None
            } else {
                Some(voted_for_raw)
            },
            commit_index: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            last_index: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            last_applied: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        }
    }
}

/// File-backed handle on the node's durable state. Mutators update the
/// in-memory copy and write its bytes through immediately; none of them
/// fsync - the coordinator calls [`NodeStateFile::flush`] explicitly once
/// it has finished a batch of related mutations.
pub struct NodeStateFile {
    path: PathBuf,
    state: NodeState,
}

impl NodeStateFile {
    /// Opens the node-state file, creating it with defaults if absent.
    pub async fn open(directory: &Path) -> Result<Self> {
        let path = directory.join("node.state");
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        let state = if len >= RECORD_LEN as u64 {
            let mut buf = [0u8; RECORD_LEN];
            file.read_exact(&mut buf)?;
            NodeState::from_bytes(&buf)
        } else {
            let state = NodeState::default();
            file.set_len(0)?;
            file.write_all(&state.to_bytes())?;
            file.sync_all()?;
            state
        };
        Ok(Self { path, state })
    }

    fn persist(&self) -> Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.state.to_bytes())?;
        Ok(())
    }

    pub fn term(&self) -> i64 {
        self.state.term
    }

    pub fn voted_for(&self) -> Option<MemberId> {
        self.state.voted_for
    }

    pub fn is_voted_for(&self, member: MemberId) -> bool {
        self.state.voted_for == Some(member)
    }

    pub fn commit_index(&self) -> u64 {
        self.state.commit_index
    }

    pub fn last_index(&self) -> u64 {
        self.state.last_index
    }

    pub fn last_applied(&self) -> u64 {
        self.state.last_applied
    }

    pub fn increment_term(&mut self) -> Result<i64> {
        self.state.term += 1;
        self.state.voted_for = None;
        self.persist()?;
        Ok(self.state.term)
    }

    pub fn update_term(&mut self, term: i64) -> Result<()> {
        if term > self.state.term {
            self.state.term = term;
            self.state.voted_for = None;
            self.persist()?;
        }
        Ok(())
    }

    pub fn update_voted_for(&mut self, member: MemberId) -> Result<()> {
        self.state.voted_for = Some(member);
        self.persist()
    }

    pub fn set_commit_index(&mut self, index: u64) -> Result<()> {
        self.state.commit_index = index;
        self.persist()
    }

    pub fn set_last_index(&mut self, index: u64) -> Result<()> {
        self.state.last_index = index;
        self.persist()
    }

    pub fn set_last_applied(&mut self, index: u64) -> Result<()> {
        self.state.last_applied = index;
        self.persist()
    }

    /// Fsyncs the most recent in-memory state to disk.
    pub fn flush(&self) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_on_fresh_directory() {
        let dir = tempfile::tempdir().unwrap();
        let state = NodeStateFile::open(dir.path()).await.unwrap();
        assert_eq!(state.term(), 0);
        assert_eq!(state.voted_for(), None);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut state = NodeStateFile::open(dir.path()).await.unwrap();
            state.increment_term().unwrap();
            state.update_voted_for(7).unwrap();
            state.set_commit_index(12).unwrap();
            state.flush().unwrap();
        }
        let state = NodeStateFile::open(dir.path()).await.unwrap();
        assert_eq!(state.term(), 1);
        assert!(state.is_voted_for(7));
        assert_eq!(state.commit_index(), 12);
    }

    #[tokio::test]
    async fn update_term_clears_vote_only_when_term_advances() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = NodeStateFile::open(dir.path()).await.unwrap();
        state.update_voted_for(3).unwrap();
        state.update_term(0).unwrap();
        assert!(state.is_voted_for(3), "stale term must not clear the vote");
        state.update_term(5).unwrap();
        assert_eq!(state.voted_for(), None);
    }
}
