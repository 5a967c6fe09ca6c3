//! # raft-peer
//!
//! why: run a live raft peer: timers, elections, replication, the apply stream
//! relations: drives raft-core's state machine, persists through raft-storage
//! what: RaftPeer, the RaftTransport contract, ApplyMsg host records

pub mod apply;
pub mod peer;
pub mod transport;

pub use apply::ApplyMsg;
pub use peer::RaftPeer;
pub use transport::RaftTransport;

pub use raft_core::{LogEntry, NodeState, RaftConfig};
