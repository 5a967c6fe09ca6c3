//! # raft-core
//!
//! why: implement the raft consensus state machine in pure, portable rust
//! relations: driven by raft-peer's loops, persisted via raft-storage
//! what: node state machine, election logic, log management, rpc types

pub mod log;
pub mod message;
pub mod node;

pub use log::LogEntry;
pub use message::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
pub use node::{NodeState, RaftConfig, RaftNode};
