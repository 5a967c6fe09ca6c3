//! # message
//!
//! why: define the raft rpc argument and reply types exchanged between peers
//! relations: produced and consumed by node.rs, shipped by the transport in raft-peer
//! what: RequestVote and AppendEntries argument/reply pairs

use crate::LogEntry;
use serde::{Deserialize, Serialize};

/// arguments for the RequestVote rpc
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// candidate's term
    pub term: u64,
    /// candidate requesting the vote
    pub candidate_id: u64,
    /// index of the candidate's last log entry
    pub last_log_index: u64,
    /// term of the candidate's last log entry
    pub last_log_term: u64,
}

/// reply to a RequestVote rpc
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// receiver's current term, for the candidate to update itself
    pub term: u64,
    /// true means the candidate received the vote
    pub vote_granted: bool,
}

/// arguments for the AppendEntries rpc (empty entries = heartbeat)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// leader's term
    pub term: u64,
    /// leader's id, so followers can point clients at it
    pub leader_id: u64,
    /// index of the log entry immediately preceding the new ones
    pub prev_log_index: u64,
    /// term of the entry at prev_log_index
    pub prev_log_term: u64,
    /// entries to store, empty for heartbeats
    pub entries: Vec<LogEntry>,
    /// leader's commit index
    pub leader_commit: u64,
}

/// reply to an AppendEntries rpc
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// receiver's current term, for the leader to update itself
    pub term: u64,
    /// true if the follower held an entry matching prev_log_index/prev_log_term
    pub success: bool,
}
