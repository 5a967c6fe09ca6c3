//! # transport
//!
//! why: define the contract between a peer and the rpc substrate carrying its messages
//! relations: implemented by hosts and test harnesses, consumed by peer.rs
//! what: RaftTransport trait with lossy request/reply semantics

use raft_core::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};

/// addressable, lossy request/reply delivery to other peers
///
/// a call blocks until the reply arrives or the substrate gives up on its
/// own timeout; `None` covers every transport failure (lost request, lost
/// reply, dead target) and is purely advisory, the protocol retries on its
/// next tick or election
pub trait RaftTransport: Send + Sync + 'static {
    /// deliver a vote request to `target` and wait for its reply
    fn request_vote(&self, target: u64, args: &RequestVoteArgs) -> Option<RequestVoteReply>;

    /// deliver an append-entries request to `target` and wait for its reply
    fn append_entries(&self, target: u64, args: &AppendEntriesArgs) -> Option<AppendEntriesReply>;
}
