//! # node
//!
//! why: define the per-node consensus state machine and its transitions
//! relations: uses message.rs for rpc types, log.rs for the durable log seam, store.rs for applied state
//! what: Role variants, ConsensusConfig, ConsensusNode with election/replication/commit logic

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::log::{LogEntry, LogStore, Operation};
use crate::message::{AppendReply, Request, VoteReply};
use crate::store::KvStore;

/// timing and compaction configuration (durations in milliseconds)
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// minimum election timeout in ms (default: 150)
    pub election_timeout_min: u64,
    /// maximum election timeout in ms (default: 300)
    pub election_timeout_max: u64,
    /// heartbeat interval in ms (default: 50)
    pub heartbeat_interval: u64,
    /// take a snapshot once this many applied entries are live in the log
    pub snapshot_threshold: u64,
    /// bytes per snapshot transfer chunk
    pub snapshot_chunk_size: usize,
    /// how many snapshot files to keep per node
    pub snapshot_retain: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            snapshot_threshold: 100,
            snapshot_chunk_size: 64 * 1024,
            snapshot_retain: 2,
        }
    }
}

/// an in-flight snapshot transfer to one lagging peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTransfer {
    /// byte offset of the next chunk to send
    pub offset: u64,
    /// last index covered by the snapshot being streamed
    pub last_index: u64,
    /// term of that index
    pub last_term: u64,
}

/// replication bookkeeping the leader keeps per peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// next log index to send
    pub next_index: u64,
    /// highest index known replicated on the peer
    pub match_index: u64,
    /// highest commit index the peer has acknowledged seeing
    pub acked_commit: u64,
    /// set while the peer is being caught up from a snapshot
    pub snapshot: Option<SnapshotTransfer>,
}

/// the three roles a node can be in
///
/// per-role data lives inside the variant, so candidate votes cannot leak
/// into a leader and follower deadlines cannot outlive an election win
#[derive(Debug)]
pub enum Role {
    /// passive state, waits for leader contact and votes when asked
    Follower { deadline: Instant },
    /// transitional state, soliciting votes to become leader
    Candidate { votes: usize, deadline: Instant },
    /// active state, drives replication and commit advancement
    Leader { peers: HashMap<String, Progress> },
}

/// what the leader should send to one peer on a replication tick
#[derive(Debug)]
pub enum PeerAction {
    /// send this request line (entries batch or plain heartbeat)
    Rpc(Request),
    /// the peer is behind the compacted prefix, stream it a snapshot chunk
    Snapshot,
}

/// A node participating in consensus: owns its role, the durable log and
/// the applied state machine, and encodes every protocol rule
///
/// all mutating operations that must be durable (term bumps, votes, entry
/// appends, truncations) call into the [`LogStore`] before they return, so a
/// reply built from the returned value is always backed by disk.
pub struct ConsensusNode<L: LogStore> {
    id: u64,
    peers: Vec<String>,
    config: ConsensusConfig,
    current_term: u64,
    voted_for: Option<u64>,
    role: Role,
    commit_index: u64,
    applied_index: u64,
    log: Arc<L>,
    store: Arc<KvStore>,
}

impl<L: LogStore> ConsensusNode<L> {
    /// create a node in follower state, recovering persisted election metadata
    pub fn new(
        id: u64,
        peers: Vec<String>,
        config: ConsensusConfig,
        log: Arc<L>,
        store: Arc<KvStore>,
    ) -> io::Result<Self> {
        let (current_term, voted_for) = log.load_meta()?;
        let deadline = random_deadline(&config);
        Ok(Self {
            id,
            peers,
            config,
            current_term,
            voted_for,
            role: Role::Follower { deadline },
            commit_index: 0,
            applied_index: 0,
            log,
            store,
        })
    }

    // -- accessors --

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<u64> {
        self.voted_for
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    /// leader-side progress for one peer, if this node leads
    pub fn progress(&self, peer: &str) -> Option<&Progress> {
        match &self.role {
            Role::Leader { peers } => peers.get(peer),
            _ => None,
        }
    }

    /// votes needed to win: a strict majority of the whole cluster
    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// seed commit/applied after the bootstrap installed a local snapshot
    pub fn bootstrap_applied(&mut self, index: u64) {
        self.commit_index = index;
        self.applied_index = index;
    }

    // -- elections --

    /// true when a follower or candidate has waited past its deadline
    pub fn election_due(&self, now: Instant) -> bool {
        match &self.role {
            Role::Follower { deadline } | Role::Candidate { deadline, .. } => now >= *deadline,
            Role::Leader { .. } => false,
        }
    }

    /// become candidate for the next term and build the vote solicitation.
    /// the new term and self-vote are durable before this returns
    pub fn start_election(&mut self) -> io::Result<Request> {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.log.save_meta(self.current_term, self.voted_for)?;
        self.role = Role::Candidate {
            votes: 0,
            deadline: random_deadline(&self.config),
        };
        let (last_log_index, last_log_term) = self.log.last_info();
        info!(term = self.current_term, "starting election");
        // a singleton cluster is its own majority
        if self.quorum_size() == 1 {
            self.become_leader();
        }
        Ok(Request::RequestVote {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index,
            last_log_term,
        })
    }

    /// tally one vote reply; returns true when this node just won
    pub fn record_vote(&mut self, reply: VoteReply) -> io::Result<bool> {
        let (term, granted) = match reply {
            VoteReply::Granted { term } => (term, true),
            VoteReply::Denied { term } => (term, false),
        };
        if term > self.current_term {
            self.step_down(term)?;
            return Ok(false);
        }
        if term < self.current_term || !granted {
            return Ok(false);
        }
        let quorum = self.quorum_size();
        let won = match &mut self.role {
            Role::Candidate { votes, .. } => {
                *votes += 1;
                // the candidate's own vote is implicit
                *votes + 1 >= quorum
            }
            _ => false,
        };
        if won {
            self.become_leader();
        }
        Ok(won)
    }

    fn become_leader(&mut self) {
        let (last_index, _) = self.log.last_info();
        let peers = self
            .peers
            .iter()
            .map(|addr| {
                (
                    addr.clone(),
                    Progress {
                        next_index: last_index + 1,
                        match_index: 0,
                        acked_commit: 0,
                        snapshot: None,
                    },
                )
            })
            .collect();
        self.role = Role::Leader { peers };
        info!(term = self.current_term, "became leader");
    }

    /// adopt `new_term` if higher, clear the vote, fall back to follower.
    /// metadata is durable before any further outbound message
    pub fn step_down(&mut self, new_term: u64) -> io::Result<()> {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = None;
            self.log.save_meta(self.current_term, self.voted_for)?;
        }
        if !matches!(self.role, Role::Follower { .. }) {
            info!(term = self.current_term, "stepping down to follower");
        }
        self.role = Role::Follower {
            deadline: random_deadline(&self.config),
        };
        Ok(())
    }

    fn reset_deadline(&mut self) {
        let next = random_deadline(&self.config);
        match &mut self.role {
            Role::Follower { deadline } | Role::Candidate { deadline, .. } => *deadline = next,
            Role::Leader { .. } => {}
        }
    }

    /// a live leader of the current term spoke; candidates yield to it
    fn acknowledge_leader(&mut self) {
        if matches!(self.role, Role::Candidate { .. }) {
            self.role = Role::Follower {
                deadline: random_deadline(&self.config),
            };
        } else {
            self.reset_deadline();
        }
    }

    // -- inbound rpc --

    /// decide a vote request; a granted vote is durable before the reply
    pub fn handle_request_vote(
        &mut self,
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) -> io::Result<VoteReply> {
        if term > self.current_term {
            self.step_down(term)?;
        }
        if term < self.current_term {
            return Ok(VoteReply::Denied { term: self.current_term });
        }

        let can_vote = self.voted_for.is_none() || self.voted_for == Some(candidate_id);
        let (our_last_index, our_last_term) = self.log.last_info();
        let log_ok = last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index);

        if can_vote && log_ok {
            self.voted_for = Some(candidate_id);
            self.log.save_meta(self.current_term, self.voted_for)?;
            self.reset_deadline();
            debug!(term, candidate_id, "granted vote");
            Ok(VoteReply::Granted { term: self.current_term })
        } else {
            Ok(VoteReply::Denied { term: self.current_term })
        }
    }

    /// follower side of log replication: consistency check, conflict
    /// truncation, append, commit advancement
    pub fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        leader_commit: u64,
        entries: Vec<LogEntry>,
    ) -> io::Result<AppendReply> {
        if term < self.current_term {
            return Ok(AppendReply::Nack { term: self.current_term });
        }
        if term > self.current_term {
            self.step_down(term)?;
        }
        if self.is_leader() {
            // two leaders in one term cannot happen; refuse rather than obey
            warn!(term, leader_id, "append entries from a leader of our own term");
            return Ok(AppendReply::Nack { term: self.current_term });
        }
        self.acknowledge_leader();

        if prev_log_index > 0 {
            match self.log.term_at(prev_log_index) {
                Some(t) if t == prev_log_term => {}
                _ => {
                    debug!(prev_log_index, prev_log_term, "log mismatch, rejecting entries");
                    return Ok(AppendReply::Nack { term: self.current_term });
                }
            }
        }

        let first_index = self.log.first_index();
        let last_new_index = prev_log_index + entries.len() as u64;
        for entry in entries {
            if entry.index < first_index {
                // already covered by our snapshot
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    self.log.truncate_from(entry.index)?;
                    self.log.append(entry)?;
                }
                None => self.log.append(entry)?,
            }
        }

        if leader_commit > self.commit_index {
            self.commit_index = leader_commit.min(last_new_index);
        }

        Ok(AppendReply::Ack {
            term: self.current_term,
            match_index: last_new_index,
        })
    }

    /// liveness signal from a leader; a stale term does not reset the deadline
    pub fn handle_heartbeat(&mut self, term: u64) -> io::Result<()> {
        if term > self.current_term {
            self.step_down(term)?;
        }
        if term == self.current_term && !self.is_leader() {
            self.acknowledge_leader();
        }
        Ok(())
    }

    /// term gate for an inbound snapshot chunk; returns false when the
    /// sender is stale and the chunk must be ignored
    pub fn handle_snapshot_offer(&mut self, term: u64) -> io::Result<bool> {
        if term < self.current_term {
            return Ok(false);
        }
        if term > self.current_term {
            self.step_down(term)?;
        }
        self.acknowledge_leader();
        Ok(true)
    }

    /// adopt a fully received snapshot: replace the state machine, clear the
    /// live log, and move commit/applied to the snapshot boundary
    pub fn install_snapshot(
        &mut self,
        state: HashMap<String, String>,
        last_index: u64,
        last_term: u64,
    ) -> io::Result<()> {
        self.store.install(state);
        self.log.install_snapshot_meta(last_index, last_term)?;
        self.commit_index = last_index;
        self.applied_index = last_index;
        info!(last_index, last_term, "installed snapshot");
        Ok(())
    }

    // -- leader side --

    /// accept a client mutation: append it to the durable log under the
    /// current term. returns None on a non-leader
    pub fn propose(&mut self, key: String, value: String) -> io::Result<Option<u64>> {
        if !self.is_leader() {
            return Ok(None);
        }
        let (last_index, _) = self.log.last_info();
        let index = last_index + 1;
        self.log.append(LogEntry {
            index,
            term: self.current_term,
            op: Operation::Put,
            key,
            value,
        })?;
        Ok(Some(index))
    }

    /// decide what to send to every peer on this tick
    ///
    /// entries batches also flow when the peer has not yet acknowledged the
    /// current commit index, so followers learn commits promptly; a plain
    /// heartbeat goes to peers that are fully caught up
    pub fn replication_plan(&self) -> Vec<(String, PeerAction)> {
        let Role::Leader { peers } = &self.role else {
            return Vec::new();
        };
        let (last_index, _) = self.log.last_info();
        let first_index = self.log.first_index();
        let mut plan = Vec::with_capacity(peers.len());
        for (addr, progress) in peers {
            let action = if progress.snapshot.is_some() || progress.next_index < first_index {
                PeerAction::Snapshot
            } else if progress.next_index <= last_index
                || progress.acked_commit < self.commit_index
            {
                let prev_log_index = progress.next_index - 1;
                let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
                PeerAction::Rpc(Request::AppendEntries {
                    term: self.current_term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term,
                    leader_commit: self.commit_index,
                    entries: self.log.entries_from(progress.next_index),
                })
            } else {
                PeerAction::Rpc(Request::Heartbeat { term: self.current_term })
            };
            plan.push((addr.clone(), action));
        }
        plan
    }

    /// record a successful entries ack from `peer`
    pub fn record_append_ok(&mut self, peer: &str, match_index: u64, sent_commit: u64) {
        let (last_index, _) = self.log.last_info();
        if let Role::Leader { peers } = &mut self.role {
            if let Some(p) = peers.get_mut(peer) {
                p.match_index = p.match_index.max(match_index.min(last_index));
                p.next_index = p.next_index.max(p.match_index + 1);
                p.acked_commit = p.acked_commit.max(sent_commit);
            }
        }
        self.advance_commit();
    }

    /// record a rejected entries batch: back off one index and retry, or
    /// step down if the peer is ahead of us
    pub fn record_append_rejected(&mut self, peer: &str, reply_term: u64) -> io::Result<()> {
        if reply_term > self.current_term {
            return self.step_down(reply_term);
        }
        if let Role::Leader { peers } = &mut self.role {
            if let Some(p) = peers.get_mut(peer) {
                if p.next_index > 1 {
                    p.next_index -= 1;
                }
                debug!(peer, next_index = p.next_index, "entries rejected, backing off");
            }
        }
        Ok(())
    }

    /// current transfer state for `peer`, if a snapshot stream is active
    pub fn snapshot_transfer(&self, peer: &str) -> Option<SnapshotTransfer> {
        self.progress(peer).and_then(|p| p.snapshot)
    }

    /// begin (or restart) streaming the snapshot covering `last_index`
    pub fn begin_snapshot_transfer(&mut self, peer: &str, last_index: u64, last_term: u64) {
        if let Role::Leader { peers } = &mut self.role {
            if let Some(p) = peers.get_mut(peer) {
                info!(peer, last_index, "switching peer to snapshot transfer");
                p.snapshot = Some(SnapshotTransfer { offset: 0, last_index, last_term });
            }
        }
    }

    /// record the ack for one streamed chunk; on the final chunk the peer
    /// resumes normal replication right after the snapshot boundary.
    /// acks for an offset the stream has already moved past are dropped, so
    /// duplicate deliveries cannot skip bytes
    pub fn record_snapshot_ack(
        &mut self,
        peer: &str,
        reply_term: u64,
        sent_offset: u64,
        sent_len: usize,
        done: bool,
    ) -> io::Result<()> {
        if reply_term > self.current_term {
            return self.step_down(reply_term);
        }
        if let Role::Leader { peers } = &mut self.role {
            if let Some(p) = peers.get_mut(peer) {
                if let Some(transfer) = &mut p.snapshot {
                    if transfer.offset != sent_offset {
                        return Ok(());
                    }
                    if done {
                        let boundary = transfer.last_index;
                        p.snapshot = None;
                        p.match_index = p.match_index.max(boundary);
                        p.next_index = boundary + 1;
                        p.acked_commit = p.acked_commit.max(boundary);
                        info!(peer, boundary, "snapshot transfer complete");
                    } else {
                        transfer.offset += sent_len as u64;
                    }
                }
            }
        }
        Ok(())
    }

    /// advance the commit index to the highest entry of the current term
    /// replicated on a majority; earlier-term entries commit transitively
    pub fn advance_commit(&mut self) {
        let Role::Leader { peers } = &self.role else {
            return;
        };
        let (last_index, _) = self.log.last_info();
        let quorum = self.quorum_size();
        let mut commit = self.commit_index;
        for n in (self.commit_index + 1)..=last_index {
            if self.log.term_at(n) != Some(self.current_term) {
                continue;
            }
            let replicas = 1 + peers.values().filter(|p| p.match_index >= n).count();
            if replicas >= quorum {
                commit = n;
            }
        }
        if commit > self.commit_index {
            self.commit_index = commit;
            debug!(commit_index = commit, "commit index advanced");
        }
    }

    // -- apply and compaction --

    /// fold every newly committed entry into the state machine, in order
    pub fn apply_committed(&mut self) -> io::Result<u64> {
        while self.applied_index < self.commit_index {
            let next = self.applied_index + 1;
            let entry = self.log.get(next).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("committed entry {next} missing from the log"),
                )
            })?;
            self.store.apply(&entry);
            self.applied_index = next;
        }
        Ok(self.applied_index)
    }

    /// true once enough applied entries are live to warrant compaction
    pub fn should_snapshot(&self) -> bool {
        let first = self.log.first_index();
        self.applied_index >= first
            && self.applied_index - first + 1 >= self.config.snapshot_threshold
    }

    /// capture the applied state and the boundary it corresponds to
    pub fn snapshot_payload(&self) -> Option<(HashMap<String, String>, u64, u64)> {
        let term = self.log.term_at(self.applied_index)?;
        Some((self.store.export(), self.applied_index, term))
    }
}

fn random_deadline(config: &ConsensusConfig) -> Instant {
    let ms = rand::thread_rng()
        .gen_range(config.election_timeout_min..=config.election_timeout_max);
    Instant::now() + Duration::from_millis(ms)
}
