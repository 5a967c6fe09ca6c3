//! # raft-storage
//!
//! why: provide the durable persistence sink for a raft peer's hard state
//! relations: stores the blob raft-peer hands it; HardState wraps raft-core's log
//! what: Persister trait, FilePersister, MemoryPersister, HardState codec

use parking_lot::Mutex;
use raft_core::LogEntry;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use thiserror::Error;

/// failures raised by the persistence sink or the hard state codec
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] io::Error),
    #[error("hard state encoding: {0}")]
    Codec(#[from] serde_json::Error),
}

/// trait for durable storage of a peer's persistent state
///
/// the blob is opaque to the sink; an empty blob means the peer has never
/// persisted anything and should bootstrap from defaults
pub trait Persister: Send + Sync {
    /// durably replace the stored blob
    fn save_state(&self, blob: &[u8]) -> Result<(), StorageError>;

    /// return the last stored blob, empty if nothing was ever saved
    fn read_state(&self) -> Result<Vec<u8>, StorageError>;
}

/// the fields a peer must carry across a crash, framed as one blob
///
/// commit and apply progress are deliberately absent: the protocol
/// rediscovers them after restart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardState {
    /// latest term the peer has seen
    pub current_term: u64,
    /// candidate that received the vote in current_term, if any
    pub voted_for: Option<u64>,
    /// the full log including the index-0 sentinel
    pub log: Vec<LogEntry>,
}

impl HardState {
    /// serialize to the blob handed to a Persister
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// deserialize a non-empty blob returned by a Persister
    pub fn decode(blob: &[u8]) -> Result<Self, StorageError> {
        Ok(serde_json::from_slice(blob)?)
    }
}

// -- file persister --

/// file-backed persister using std::fs
///
/// stores the blob as a single file inside a directory; writes go to a temp
/// file first and are renamed into place after a sync, so a crash mid-write
/// leaves the previous blob intact
pub struct FilePersister {
    /// directory holding the state file
    dir: PathBuf,
}

impl FilePersister {
    /// create a persister rooted at the given directory, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// path of the current state file
    fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }
}

impl Persister for FilePersister {
    fn save_state(&self, blob: &[u8]) -> Result<(), StorageError> {
        // atomic write: write to temp file then rename
        let temp_path = self.dir.join("state.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(blob)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;

        Ok(())
    }

    fn read_state(&self) -> Result<Vec<u8>, StorageError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(Vec::new()); // bootstrap
        }

        let mut file = File::open(&path)?;
        let mut blob = Vec::new();
        file.read_to_end(&mut blob)?;

        Ok(blob)
    }
}

// -- in-memory persister --

/// in-memory persister for tests and restart harnesses
///
/// survives a peer being torn down and rebuilt against the same instance,
/// but not the process
#[derive(Default)]
pub struct MemoryPersister {
    blob: Mutex<Vec<u8>>,
}

impl MemoryPersister {
    /// create an empty in-memory persister
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn save_state(&self, blob: &[u8]) -> Result<(), StorageError> {
        *self.blob.lock() = blob.to_vec();
        Ok(())
    }

    fn read_state(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self.blob.lock().clone())
    }
}
