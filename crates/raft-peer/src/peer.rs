//! # peer
//!
//! why: animate the raft state machine with timers, rpc dispatch and the apply pump
//! relations: owns a raft-core node behind one mutex, talks through transport.rs,
//!            persists via raft-storage, streams commits through apply.rs
//! what: RaftPeer with election loop, election driver, replication loop, apply pump

use crate::apply::ApplyMsg;
use crate::transport::RaftTransport;
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, NodeState, RaftConfig, RaftNode, RequestVoteArgs,
    RequestVoteReply,
};
use raft_storage::{HardState, Persister, StorageError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// everything the peer's loops share; one mutex guards the whole state block
struct Shared {
    me: u64,
    node: Mutex<RaftNode>,
    /// signalled whenever commit_index moves past last_applied, and on kill
    commit_ready: Condvar,
    dead: AtomicBool,
    transport: Arc<dyn RaftTransport>,
    persister: Arc<dyn Persister>,
    apply_tx: Sender<ApplyMsg>,
}

/// grant tally for one election; lives only as long as its ballot
///
/// lock order is ballot before peer state, never the reverse
struct Ballot {
    granted: usize,
    decided: bool,
}

/// a live raft peer
///
/// cheap to clone; every clone is a handle onto the same peer. background
/// loops (election timer, apply pump, replication while leading, one thread
/// per outbound rpc) hold clones and exit once `kill` is called
#[derive(Clone)]
pub struct RaftPeer {
    shared: Arc<Shared>,
}

impl RaftPeer {
    /// construct and start a peer with default timing
    ///
    /// restores term, vote and log from the persister when it holds a blob,
    /// then launches the background loops; returns promptly
    pub fn new(
        cluster: Vec<u64>,
        me: u64,
        transport: Arc<dyn RaftTransport>,
        persister: Arc<dyn Persister>,
        apply_tx: Sender<ApplyMsg>,
    ) -> Result<Self, StorageError> {
        Self::with_config(cluster, me, transport, persister, apply_tx, RaftConfig::default())
    }

    /// construct and start a peer with custom timing configuration
    pub fn with_config(
        cluster: Vec<u64>,
        me: u64,
        transport: Arc<dyn RaftTransport>,
        persister: Arc<dyn Persister>,
        apply_tx: Sender<ApplyMsg>,
        config: RaftConfig,
    ) -> Result<Self, StorageError> {
        let mut node = RaftNode::with_config(me, cluster, config);

        let blob = persister.read_state()?;
        if !blob.is_empty() {
            let hard = HardState::decode(&blob)?;
            node.current_term = hard.current_term;
            node.voted_for = hard.voted_for;
            node.log = hard.log;
            info!(
                peer = me,
                term = node.current_term,
                log_len = node.log.len(),
                "restored persisted state"
            );
        }

        let peer = Self {
            shared: Arc::new(Shared {
                me,
                node: Mutex::new(node),
                commit_ready: Condvar::new(),
                dead: AtomicBool::new(false),
                transport,
                persister,
                apply_tx,
            }),
        };

        let p = peer.clone();
        thread::spawn(move || p.election_loop());
        let p = peer.clone();
        thread::spawn(move || p.apply_loop());

        Ok(peer)
    }

    // -- host surface --

    /// submit a command for agreement
    ///
    /// returns (index, term, true) when this peer is leader and appended the
    /// command, (0, 0, false) otherwise; an accepted command carries no
    /// commit guarantee, the leader may still lose its term
    pub fn start(&self, command: Vec<u8>) -> (u64, u64, bool) {
        if self.killed() {
            return (0, 0, false);
        }

        let mut node = self.shared.node.lock();
        if node.state != NodeState::Leader {
            return (0, 0, false);
        }

        let index = node.append_command(command);
        let term = node.current_term;
        if !self.persist(&node) {
            return (0, 0, false);
        }
        debug!(peer = self.shared.me, index, term, "command accepted");

        // a single-peer cluster is its own majority
        if node.try_advance_commit() {
            self.shared.commit_ready.notify_all();
        }

        (index, term, true)
    }

    /// current term and whether this peer believes it is leader
    pub fn get_state(&self) -> (u64, bool) {
        let node = self.shared.node.lock();
        (node.current_term, node.state == NodeState::Leader)
    }

    /// the peer most recently seen acting as leader, for client redirection
    pub fn leader_hint(&self) -> Option<u64> {
        self.shared.node.lock().leader_hint
    }

    /// shut the peer down; idempotent, all loops observe the flag and exit
    pub fn kill(&self) {
        self.shared.dead.store(true, Ordering::SeqCst);
        self.shared.commit_ready.notify_all();
    }

    /// true once `kill` has been called
    pub fn killed(&self) -> bool {
        self.shared.dead.load(Ordering::SeqCst)
    }

    // -- rpc ingress (invoked by the transport substrate) --

    /// RequestVote handler
    pub fn request_vote(&self, args: &RequestVoteArgs) -> RequestVoteReply {
        let mut node = self.shared.node.lock();
        let (reply, changed) = node.handle_request_vote(args);
        if changed {
            // durable before the reply escapes
            self.persist(&node);
        }
        debug!(
            peer = self.shared.me,
            candidate = args.candidate_id,
            term = reply.term,
            granted = reply.vote_granted,
            "vote request handled"
        );
        reply
    }

    /// AppendEntries handler
    pub fn append_entries(&self, args: &AppendEntriesArgs) -> AppendEntriesReply {
        let mut node = self.shared.node.lock();
        let commit_before = node.commit_index;
        let (reply, changed) = node.handle_append_entries(args);
        if changed {
            self.persist(&node);
        }
        if node.commit_index > commit_before {
            self.shared.commit_ready.notify_all();
        }
        reply
    }

    // -- election timer loop --

    /// periodically check whether the randomized election timeout elapsed
    /// without leader contact, and launch an election driver when it did
    fn election_loop(&self) {
        let (check_period, timeout_min, timeout_max) = {
            let node = self.shared.node.lock();
            (
                node.config.check_period,
                node.config.election_timeout_min,
                node.config.election_timeout_max,
            )
        };

        // per-peer seed so lockstep startups do not split the vote forever
        let clock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seed = self
            .shared
            .me
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ u64::from(clock.subsec_nanos());
        let mut rng = StdRng::seed_from_u64(seed);

        while !self.killed() {
            thread::sleep(Duration::from_millis(check_period));

            // a fresh draw every pass keeps colliding candidates apart
            let timeout = Duration::from_millis(rng.gen_range(timeout_min..=timeout_max));
            let due = {
                let node = self.shared.node.lock();
                node.state != NodeState::Leader && node.last_contact.elapsed() > timeout
            };

            if due {
                // run the election on its own thread: if it stalls on slow
                // peers and the timer fires again, a fresh election starts
                let peer = self.clone();
                thread::spawn(move || peer.run_election());
            }
        }
    }

    // -- election driver --

    /// become candidate, solicit votes in parallel, promote on majority
    fn run_election(&self) {
        let (args, majority, others) = {
            let mut node = self.shared.node.lock();
            if self.killed() || node.state == NodeState::Leader {
                return;
            }
            let args = node.begin_election();
            if !self.persist(&node) {
                return;
            }
            info!(peer = self.shared.me, term = args.term, "election started");
            let others: Vec<u64> = node
                .cluster_nodes
                .iter()
                .copied()
                .filter(|&p| p != node.id)
                .collect();
            (args, node.quorum_size(), others)
        };

        // our own vote is already banked; a single-peer cluster wins here
        let ballot = Arc::new(Mutex::new(Ballot {
            granted: 1,
            decided: false,
        }));
        {
            let mut tally = ballot.lock();
            self.promote_if_elected(&mut tally, args.term, majority);
        }

        for target in others {
            let peer = self.clone();
            let ballot = Arc::clone(&ballot);
            let args = args.clone();
            thread::spawn(move || {
                let Some(reply) = peer.shared.transport.request_vote(target, &args) else {
                    return; // lost rpc; the next election retries
                };

                let mut tally = ballot.lock();
                let mut node = peer.shared.node.lock();
                if peer.killed() {
                    return;
                }
                if reply.term > node.current_term {
                    node.step_down(reply.term);
                    peer.persist(&node);
                    return;
                }
                // drop grants that belong to an older ballot of ours
                if node.current_term != args.term || node.state != NodeState::Candidate {
                    return;
                }
                if reply.vote_granted {
                    drop(node);
                    tally.granted += 1;
                    peer.promote_if_elected(&mut tally, args.term, majority);
                }
            });
        }
    }

    /// close the ballot and take leadership if the grants reached majority
    /// while we are still the candidate of that same term
    fn promote_if_elected(&self, tally: &mut Ballot, ballot_term: u64, majority: usize) {
        if tally.decided || tally.granted < majority {
            return;
        }
        tally.decided = true;

        let lead_term = {
            let mut node = self.shared.node.lock();
            if node.current_term != ballot_term || node.state != NodeState::Candidate {
                return; // the ballot went stale while grants trickled in
            }
            node.become_leader();
            info!(peer = self.shared.me, term = ballot_term, "won election");
            node.current_term
        };

        let peer = self.clone();
        thread::spawn(move || peer.replicate_loop(lead_term));
    }

    // -- replication loop (leader only) --

    /// every heartbeat tick, send each follower the log suffix its
    /// next_index calls for; runs until leadership or the term is lost
    fn replicate_loop(&self, lead_term: u64) {
        let heartbeat = {
            let node = self.shared.node.lock();
            Duration::from_millis(node.config.heartbeat_interval)
        };

        loop {
            let batch = {
                let node = self.shared.node.lock();
                if self.killed()
                    || node.state != NodeState::Leader
                    || node.current_term != lead_term
                {
                    return;
                }
                let mut batch = Vec::new();
                for &target in &node.cluster_nodes {
                    if target != node.id {
                        batch.push((target, node.build_append_args(target)));
                    }
                }
                batch
            };

            for (target, args) in batch {
                let peer = self.clone();
                thread::spawn(move || peer.dispatch_append(target, args));
            }

            thread::sleep(heartbeat);
        }
    }

    /// one outbound append-entries rpc and its reply bookkeeping
    fn dispatch_append(&self, target: u64, args: AppendEntriesArgs) {
        let Some(reply) = self.shared.transport.append_entries(target, &args) else {
            return; // lost rpc; the next tick retries
        };

        let mut node = self.shared.node.lock();
        if self.killed() {
            return;
        }
        // drop replies from a term we are no longer leading
        if node.current_term != args.term {
            return;
        }
        if reply.term > node.current_term {
            info!(
                peer = self.shared.me,
                follower = target,
                term = reply.term,
                "stepping down: follower is ahead"
            );
            node.step_down(reply.term);
            self.persist(&node);
            return;
        }
        if node.state != NodeState::Leader {
            return;
        }

        if reply.success {
            let matched = args.prev_log_index + args.entries.len() as u64;
            node.record_replicated(target, matched);
            if node.try_advance_commit() {
                self.shared.commit_ready.notify_all();
            }
        } else {
            debug!(
                peer = self.shared.me,
                follower = target,
                "append refused, backing up next_index"
            );
            node.backtrack(target);
        }
    }

    // -- apply pump --

    /// deliver committed entries to the host in strict index order, one at
    /// a time, never holding the state lock across the channel send
    fn apply_loop(&self) {
        loop {
            let (index, command) = {
                let mut node = self.shared.node.lock();
                while !self.killed() && node.last_applied >= node.commit_index {
                    self.shared.commit_ready.wait(&mut node);
                }
                if self.killed() {
                    return;
                }
                let index = node.last_applied + 1;
                (index, node.log[index as usize].command.clone())
            };

            let msg = ApplyMsg {
                command_valid: true,
                command,
                command_index: index,
            };
            if self.shared.apply_tx.send(msg).is_err() {
                return; // host dropped its end of the channel
            }

            let mut node = self.shared.node.lock();
            node.last_applied = index;
        }
    }

    // -- persistence --

    /// push term, vote and log to the sink; a failed write is fatal because
    /// state already visible in memory would otherwise outrun durability
    fn persist(&self, node: &RaftNode) -> bool {
        let hard = HardState {
            current_term: node.current_term,
            voted_for: node.voted_for,
            log: node.log.clone(),
        };
        let saved = hard
            .encode()
            .and_then(|blob| self.shared.persister.save_state(&blob));

        if let Err(err) = saved {
            error!(peer = self.shared.me, %err, "persist failed, shutting down");
            self.shared.dead.store(true, Ordering::SeqCst);
            self.shared.commit_ready.notify_all();
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use raft_storage::MemoryPersister;
    use std::time::Instant;

    /// every vote granted, every append acknowledged
    struct GrantAll;

    impl RaftTransport for GrantAll {
        fn request_vote(&self, _target: u64, args: &RequestVoteArgs) -> Option<RequestVoteReply> {
            Some(RequestVoteReply {
                term: args.term,
                vote_granted: true,
            })
        }

        fn append_entries(
            &self,
            _target: u64,
            args: &AppendEntriesArgs,
        ) -> Option<AppendEntriesReply> {
            Some(AppendEntriesReply {
                term: args.term,
                success: true,
            })
        }
    }

    /// every vote refused at the candidate's own term
    struct RefuseAll;

    impl RaftTransport for RefuseAll {
        fn request_vote(&self, _target: u64, args: &RequestVoteArgs) -> Option<RequestVoteReply> {
            Some(RequestVoteReply {
                term: args.term,
                vote_granted: false,
            })
        }

        fn append_entries(
            &self,
            _target: u64,
            args: &AppendEntriesArgs,
        ) -> Option<AppendEntriesReply> {
            Some(AppendEntriesReply {
                term: args.term,
                success: false,
            })
        }
    }

    /// peers pretending to live several terms in the future
    struct AheadOfUs;

    impl RaftTransport for AheadOfUs {
        fn request_vote(&self, _target: u64, args: &RequestVoteArgs) -> Option<RequestVoteReply> {
            Some(RequestVoteReply {
                term: args.term + 5,
                vote_granted: false,
            })
        }

        fn append_entries(
            &self,
            _target: u64,
            args: &AppendEntriesArgs,
        ) -> Option<AppendEntriesReply> {
            Some(AppendEntriesReply {
                term: args.term + 5,
                success: false,
            })
        }
    }

    /// votes granted, but every append reply claims a higher term
    struct GrantThenOutrank;

    impl RaftTransport for GrantThenOutrank {
        fn request_vote(&self, _target: u64, args: &RequestVoteArgs) -> Option<RequestVoteReply> {
            Some(RequestVoteReply {
                term: args.term,
                vote_granted: true,
            })
        }

        fn append_entries(
            &self,
            _target: u64,
            args: &AppendEntriesArgs,
        ) -> Option<AppendEntriesReply> {
            Some(AppendEntriesReply {
                term: args.term + 2,
                success: false,
            })
        }
    }

    /// the network eats everything
    struct BlackHole;

    impl RaftTransport for BlackHole {
        fn request_vote(&self, _target: u64, _args: &RequestVoteArgs) -> Option<RequestVoteReply> {
            None
        }

        fn append_entries(
            &self,
            _target: u64,
            _args: &AppendEntriesArgs,
        ) -> Option<AppendEntriesReply> {
            None
        }
    }

    fn fast_config() -> RaftConfig {
        RaftConfig {
            election_timeout_min: 100,
            election_timeout_max: 200,
            heartbeat_interval: 30,
            check_period: 30,
        }
    }

    fn launch(
        cluster: Vec<u64>,
        me: u64,
        transport: Arc<dyn RaftTransport>,
    ) -> (RaftPeer, Receiver<ApplyMsg>) {
        let (tx, rx) = unbounded();
        let peer = RaftPeer::with_config(
            cluster,
            me,
            transport,
            Arc::new(MemoryPersister::new()),
            tx,
            fast_config(),
        )
        .unwrap();
        (peer, rx)
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn peer_with_granting_peers_becomes_leader() {
        let (peer, _rx) = launch(vec![1, 2, 3], 1, Arc::new(GrantAll));

        assert!(wait_until(Duration::from_secs(5), || peer.get_state().1));

        peer.kill();
    }

    #[test]
    fn peer_with_refusing_peers_never_leads() {
        let (peer, _rx) = launch(vec![1, 2, 3], 1, Arc::new(RefuseAll));

        // elections keep firing and keep losing
        assert!(wait_until(Duration::from_secs(5), || peer.get_state().0 >= 2));
        assert!(!peer.get_state().1);

        peer.kill();
    }

    #[test]
    fn higher_term_vote_reply_forces_step_down() {
        let (peer, _rx) = launch(vec![1, 2, 3], 1, Arc::new(AheadOfUs));

        // first election runs at term 1 and adopts the reply's term 6
        assert!(wait_until(Duration::from_secs(5), || peer.get_state().0 >= 6));
        assert!(!peer.get_state().1);

        peer.kill();
    }

    #[test]
    fn outranked_append_reply_forces_leader_step_down() {
        let (peer, _rx) = launch(vec![1, 2, 3], 1, Arc::new(GrantThenOutrank));

        // every win is answered by an outranking append reply, so the term
        // keeps climbing; a leader that ignored those replies would sit at
        // its first winning term forever
        assert!(wait_until(Duration::from_secs(5), || peer.get_state().0 >= 10));

        peer.kill();
    }

    #[test]
    fn start_rejected_on_follower() {
        let (peer, _rx) = launch(vec![1, 2, 3], 1, Arc::new(BlackHole));

        let (index, term, is_leader) = peer.start(b"cmd".to_vec());

        assert_eq!((index, term, is_leader), (0, 0, false));

        peer.kill();
    }

    #[test]
    fn start_rejected_after_kill() {
        let (peer, _rx) = launch(vec![1, 2, 3], 1, Arc::new(GrantAll));
        assert!(wait_until(Duration::from_secs(5), || peer.get_state().1));

        peer.kill();
        let (_, _, is_leader) = peer.start(b"cmd".to_vec());

        assert!(!is_leader);
    }

    #[test]
    fn kill_is_idempotent() {
        let (peer, _rx) = launch(vec![1, 2, 3], 1, Arc::new(BlackHole));

        peer.kill();
        peer.kill();

        assert!(peer.killed());
    }

    #[test]
    fn single_peer_cluster_elects_itself_and_commits() {
        let (peer, rx) = launch(vec![1], 1, Arc::new(BlackHole));

        assert!(wait_until(Duration::from_secs(5), || peer.get_state().1));

        let (index, _term, is_leader) = peer.start(b"solo".to_vec());
        assert!(is_leader);
        assert_eq!(index, 1);

        let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(msg.command_valid);
        assert_eq!(msg.command, b"solo".to_vec());
        assert_eq!(msg.command_index, 1);

        peer.kill();
    }

    #[test]
    fn restart_restores_term_vote_and_log() {
        let persister: Arc<MemoryPersister> = Arc::new(MemoryPersister::new());

        // first life: win, append, commit
        let (tx, rx) = unbounded();
        let peer = RaftPeer::with_config(
            vec![1],
            1,
            Arc::new(BlackHole),
            persister.clone(),
            tx,
            fast_config(),
        )
        .unwrap();
        assert!(wait_until(Duration::from_secs(5), || peer.get_state().1));
        let (index, term, _) = peer.start(b"durable".to_vec());
        assert_eq!(index, 1);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        peer.kill();

        // second life against the same persister
        let (tx, rx) = unbounded();
        let reborn = RaftPeer::with_config(
            vec![1],
            1,
            Arc::new(BlackHole),
            persister,
            tx,
            fast_config(),
        )
        .unwrap();

        // the term survived and the log survived
        assert!(reborn.get_state().0 >= term);
        assert!(wait_until(Duration::from_secs(5), || reborn.get_state().1));

        // the restored entry is from an older term, so it only re-commits
        // behind a fresh entry of the new leader's term
        let (next_index, _, is_leader) = reborn.start(b"after".to_vec());
        assert!(is_leader);
        assert_eq!(next_index, 2);

        let replayed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(replayed.command, b"durable".to_vec());
        assert_eq!(replayed.command_index, 1);
        let fresh = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fresh.command, b"after".to_vec());
        assert_eq!(fresh.command_index, 2);

        reborn.kill();
    }
}
