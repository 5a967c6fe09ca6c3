//! # node
//!
//! why: define the raft per-peer state machine and its transitions
//! relations: uses message.rs for rpc types, log.rs for entries; driven by raft-peer
//! what: NodeState enum, RaftConfig, RaftNode with rpc handlers and commit logic

use crate::message::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::LogEntry;
use std::collections::HashMap;
use std::time::Instant;

/// the three possible states a raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// passive state - listens for heartbeats, votes when asked
    Follower,
    /// transitional state - requesting votes to become leader
    Candidate,
    /// active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// configuration for raft timing (in milliseconds)
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// minimum election timeout in ms (default: 500)
    pub election_timeout_min: u64,
    /// maximum election timeout in ms (default: 1000)
    pub election_timeout_max: u64,
    /// heartbeat interval in ms (default: 150)
    pub heartbeat_interval: u64,
    /// election timer granularity in ms (default: 300);
    /// keep it small relative to the election timeouts
    pub check_period: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 500,
            election_timeout_max: 1000,
            heartbeat_interval: 150,
            check_period: 300,
        }
    }
}

/// a single raft node in the cluster
///
/// implements the raft consensus state machine:
/// - leader election with up-to-date log checks
/// - log replication with consistency checks
/// - commit index management
///
/// this type is sans-IO: the surrounding peer owns the lock, the clock
/// loops, the transport and the persistence sink
#[derive(Debug)]
pub struct RaftNode {
    // -- persistent state (must survive restarts) --
    /// unique identifier for this node
    pub id: u64,
    /// current term number (monotonically increasing)
    pub current_term: u64,
    /// node id that received our vote in current term (if any)
    pub voted_for: Option<u64>,
    /// the replicated log; index 0 holds a term-0 sentinel, real entries
    /// start at index 1
    pub log: Vec<LogEntry>,

    // -- volatile state (all nodes) --
    /// current state (follower, candidate, or leader)
    pub state: NodeState,
    /// index of highest log entry known to be committed
    pub commit_index: u64,
    /// index of highest log entry delivered to the host
    pub last_applied: u64,
    /// last time a valid leader contact or a granted vote reset the election clock
    pub last_contact: Instant,
    /// most recently observed leader, for client redirection
    pub leader_hint: Option<u64>,

    // -- volatile state (leaders only, reinitialized after election) --
    /// for each server, index of next log entry to send (leader only)
    pub next_index: HashMap<u64, u64>,
    /// for each server, index of highest log entry known to be replicated (leader only)
    pub match_index: HashMap<u64, u64>,

    // -- cluster configuration --
    /// list of all node ids in the cluster (including self)
    pub cluster_nodes: Vec<u64>,
    /// timing configuration
    pub config: RaftConfig,
}

impl RaftNode {
    /// create a new raft node in follower state with an empty (sentinel-only) log
    pub fn new(id: u64, cluster_nodes: Vec<u64>) -> Self {
        Self {
            id,
            current_term: 0,
            voted_for: None,
            log: vec![LogEntry::sentinel()],
            state: NodeState::Follower,
            commit_index: 0,
            last_applied: 0,
            last_contact: Instant::now(),
            leader_hint: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            cluster_nodes,
            config: RaftConfig::default(),
        }
    }

    /// create a node with custom timing configuration
    pub fn with_config(id: u64, cluster_nodes: Vec<u64>, config: RaftConfig) -> Self {
        let mut node = Self::new(id, cluster_nodes);
        node.config = config;
        node
    }

    // -- state transitions --

    /// get the number of nodes needed for quorum (majority)
    pub fn quorum_size(&self) -> usize {
        (self.cluster_nodes.len() / 2) + 1
    }

    /// revert to follower on observing term `term`
    ///
    /// the vote is cleared only when the term actually advances: a vote
    /// belongs to exactly one term and an equal-term demotion (candidate
    /// hearing from this term's leader) must keep it
    pub fn step_down(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_hint = None;
        }
        self.state = NodeState::Follower;
    }

    /// start an election: become candidate, increment term, vote for self
    ///
    /// returns the vote request to broadcast to every other peer
    pub fn begin_election(&mut self) -> RequestVoteArgs {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_hint = None;
        self.last_contact = Instant::now();

        RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    /// become leader: initialize replication bookkeeping
    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_hint = Some(self.id);

        let next = self.log.len() as u64;
        for &peer in &self.cluster_nodes {
            if peer != self.id {
                self.next_index.insert(peer, next);
                self.match_index.insert(peer, 0);
            }
        }
    }

    // -- log helpers --

    /// index of the last log entry (0 when only the sentinel is present)
    pub fn last_log_index(&self) -> u64 {
        self.log.len() as u64 - 1
    }

    /// term of the last log entry (0 when only the sentinel is present)
    pub fn last_log_term(&self) -> u64 {
        self.log[self.log.len() - 1].term
    }

    /// get the log entry at a 1-based index; the sentinel is not an entry
    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get(index as usize)
    }

    /// append a new command under the current term (leader only), returning
    /// the index it will occupy if it ever commits
    pub fn append_command(&mut self, command: Vec<u8>) -> u64 {
        self.log.push(LogEntry::new(self.current_term, command));
        self.last_log_index()
    }

    // -- rpc ingress --

    /// handle a vote request from a candidate
    ///
    /// returns (reply, persistent state changed)
    pub fn handle_request_vote(&mut self, args: &RequestVoteArgs) -> (RequestVoteReply, bool) {
        // a candidate behind on terms is refused outright
        if args.term < self.current_term {
            return (
                RequestVoteReply {
                    term: self.current_term,
                    vote_granted: false,
                },
                false,
            );
        }

        let mut changed = false;
        if args.term > self.current_term {
            self.step_down(args.term);
            changed = true;
        }

        // grant iff we have no conflicting vote this term and the
        // candidate's log is at least as up-to-date as ours
        let can_vote = self.voted_for.is_none() || self.voted_for == Some(args.candidate_id);
        let granted = can_vote && self.is_log_up_to_date(args.last_log_index, args.last_log_term);

        if granted {
            self.voted_for = Some(args.candidate_id);
            // the election clock resets only on a granted vote; a refused
            // candidate must not keep this peer from timing out itself
            self.last_contact = Instant::now();
            changed = true;
        }

        (
            RequestVoteReply {
                term: self.current_term,
                vote_granted: granted,
            },
            changed,
        )
    }

    /// handle an append-entries request from a leader (also the heartbeat path)
    ///
    /// returns (reply, persistent state changed)
    pub fn handle_append_entries(&mut self, args: &AppendEntriesArgs) -> (AppendEntriesReply, bool) {
        if args.term < self.current_term {
            return (
                AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                },
                false,
            );
        }

        let mut changed = false;
        if args.term > self.current_term {
            self.step_down(args.term);
            changed = true;
        } else if self.state == NodeState::Candidate {
            // this term already has a leader; our candidacy is over
            self.step_down(args.term);
        }

        // valid contact from the current leader
        self.leader_hint = Some(args.leader_id);
        self.last_contact = Instant::now();

        // we must hold an entry at prev_log_index with the matching term
        if args.prev_log_index >= self.log.len() as u64
            || self.log[args.prev_log_index as usize].term != args.prev_log_term
        {
            return (
                AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                },
                changed,
            );
        }

        // delete conflicting entries, append what is missing; entries already
        // present with matching terms stay untouched, so replaying a stale
        // batch never truncates acknowledged entries
        for (k, entry) in args.entries.iter().enumerate() {
            let index = args.prev_log_index + 1 + k as u64;
            if (index as usize) < self.log.len() {
                if self.log[index as usize].term != entry.term {
                    self.log.truncate(index as usize);
                    self.log.push(entry.clone());
                    changed = true;
                }
            } else {
                self.log.push(entry.clone());
                changed = true;
            }
        }

        // commit up to what the leader has committed, bounded by the last
        // entry this particular rpc accounted for
        let last_resolved = args.prev_log_index + args.entries.len() as u64;
        if args.leader_commit > self.commit_index {
            let bound = args.leader_commit.min(last_resolved);
            if bound > self.commit_index {
                self.commit_index = bound;
            }
        }

        (
            AppendEntriesReply {
                term: self.current_term,
                success: true,
            },
            changed,
        )
    }

    /// check if a candidate's log is at least as up-to-date as ours
    /// (raft paper section 5.4.1)
    fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();

        // compare by term first, then by length
        if last_log_term != our_last_term {
            last_log_term > our_last_term
        } else {
            last_log_index >= self.last_log_index()
        }
    }

    // -- replication bookkeeping (leader only) --

    /// build the append-entries rpc for a follower from its next_index;
    /// degenerates to a heartbeat when the follower is caught up
    pub fn build_append_args(&self, follower: u64) -> AppendEntriesArgs {
        let limit = self.log.len() as u64;
        let next = self
            .next_index
            .get(&follower)
            .copied()
            .unwrap_or(limit)
            .clamp(1, limit);
        let prev_log_index = next - 1;

        AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log[prev_log_index as usize].term,
            entries: self.log[next as usize..].to_vec(),
            leader_commit: self.commit_index,
        }
    }

    /// a follower acknowledged the log through `matched`; indices only move
    /// forward so a late reply cannot regress them
    pub fn record_replicated(&mut self, follower: u64, matched: u64) {
        let known = self.match_index.entry(follower).or_insert(0);
        if matched > *known {
            *known = matched;
        }
        let next = self.next_index.entry(follower).or_insert(1);
        if matched + 1 > *next {
            *next = matched + 1;
        }
    }

    /// a follower refused the consistency check; probe one entry earlier on
    /// the next tick (floor at 1)
    pub fn backtrack(&mut self, follower: u64) {
        if let Some(next) = self.next_index.get_mut(&follower) {
            if *next > 1 {
                *next -= 1;
            }
        }
    }

    /// try to advance commit_index from follower match indices
    ///
    /// returns true if commit_index advanced
    pub fn try_advance_commit(&mut self) -> bool {
        let old_commit = self.commit_index;

        for n in (self.commit_index + 1)..=self.last_log_index() {
            // a leader only counts replicas of its own-term entries toward
            // commitment; earlier-term entries commit as a side effect
            if self.log[n as usize].term != self.current_term {
                continue;
            }

            let mut count = 1; // the leader itself holds every entry
            for (&peer, &matched) in &self.match_index {
                if peer != self.id && matched >= n {
                    count += 1;
                }
            }

            if count >= self.quorum_size() {
                self.commit_index = n;
            }
        }

        self.commit_index > old_commit
    }
}
