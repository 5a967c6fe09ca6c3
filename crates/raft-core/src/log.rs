//! # log
//!
//! why: represent the append-only log of commands that raft replicates
//! relations: stored positionally in node.rs, carried over the wire in message.rs
//! what: LogEntry struct and the index-0 sentinel

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
///
/// entries are identified by their position in the log, 1-indexed; the
/// command payload is opaque to the consensus core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// the term under which this entry was created
    pub term: u64,
    /// the command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// create a new log entry
    pub fn new(term: u64, command: Vec<u8>) -> Self {
        Self { term, command }
    }

    /// the synthetic entry occupying index 0 of every log
    ///
    /// term 0 is below every real term, so prev-log checks against the
    /// sentinel always succeed for a genuinely empty log
    pub fn sentinel() -> Self {
        Self {
            term: 0,
            command: Vec::new(),
        }
    }
}
