//! CFT engine: leader-based log replication
//!
//! A Raft variant where commit boundaries are signature entries
//! ("committable" indices): a vote compares committable logs, a new
//! leader rolls back to its last committable index, and `commit_idx`
//! advances only across committable entries replicated on a majority of
//! every active configuration.
//!
//! One lock guards the engine's volatile state, acquired at the start
//! of every public operation and inbound-message handler. Channel sends
//! go through [`Outbound::send`], which must not block.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use quill_kv::{ApplyOutcome, ReplicationSink, Store};
use quill_ledger::FrameCursor;
use quill_merkle::CommitSource;
use quill_model::{NodeId, Term, TxId, Version, NO_NODE};

use crate::config::{Configuration, NodeInfo};
use crate::messages::{
    AppendEntries, AppendEntriesResponse, Message, RequestVote, RequestVoteResponse,
};
use crate::traits::{LedgerSink, Outbound, Snapshotter};
use crate::view_history::{ViewHistory, VIEW_UNKNOWN};

/// Size budget for one AppendEntries batch.
pub const APPEND_ENTRIES_SIZE_LIMIT: usize = 20_000;
const BATCH_WINDOW_SIZE: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Leader,
    Follower,
    Candidate,
    Retired,
}

struct NodeState {
    info: NodeInfo,
    /// Highest index sent to the node.
    sent_idx: Version,
    /// Highest index confirmed to match on the node.
    match_idx: Version,
}

pub struct CftConsensus {
    inner: Mutex<Inner>,
    /// Configurations announced by map hooks while the engine lock is
    /// held; drained at the next engine entry point.
    pending_configs: Mutex<Vec<Configuration>>,
    node_id: NodeId,
    request_timeout_ms: u64,
    election_timeout_ms: u64,
}

struct Inner {
    store: Arc<Store>,
    ledger: Box<dyn LedgerSink>,
    outbound: Arc<dyn Outbound>,
    snapshotter: Arc<dyn Snapshotter>,

    state: ReplicaState,
    current_view: Term,
    voted_for: NodeId,
    leader_id: NodeId,
    votes_for_me: BTreeSet<NodeId>,
    timeout_elapsed: u64,
    /// Last committable index preceding this node's election; signing
    /// is meaningless until commit catches up with it.
    election_index: Version,

    last_idx: Version,
    commit_idx: Version,
    commit_watermark_idx: Version,

    view_history: ViewHistory,
    configurations: VecDeque<Configuration>,
    nodes: BTreeMap<NodeId, NodeState>,
    committable_indices: VecDeque<Version>,

    /// Only the public domain is deserialised (recovery).
    public_only: bool,

    // AppendEntries batch sizing: exponential moving average of entry
    // sizes against the fixed budget.
    entry_size_not_limited: usize,
    entry_count: usize,
    entries_batch_size: u64,
    batch_window_sum: i64,
}

impl CftConsensus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        store: Arc<Store>,
        ledger: Box<dyn LedgerSink>,
        outbound: Arc<dyn Outbound>,
        snapshotter: Arc<dyn Snapshotter>,
        request_timeout_ms: u64,
        election_timeout_ms: u64,
        public_only: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            pending_configs: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner {
                store,
                ledger,
                outbound,
                snapshotter,
                state: ReplicaState::Follower,
                current_view: 0,
                voted_for: NO_NODE,
                leader_id: NO_NODE,
                votes_for_me: BTreeSet::new(),
                timeout_elapsed: 0,
                election_index: 0,
                last_idx: 0,
                commit_idx: 0,
                commit_watermark_idx: 0,
                view_history: ViewHistory::new(),
                configurations: VecDeque::new(),
                nodes: BTreeMap::new(),
                committable_indices: VecDeque::new(),
                public_only,
                entry_size_not_limited: 0,
                entry_count: 0,
                entries_batch_size: 1,
                batch_window_sum: 0,
            }),
            node_id,
            request_timeout_ms,
            election_timeout_ms,
        })
    }

    pub fn id(&self) -> NodeId {
        self.node_id
    }

    pub fn leader(&self) -> NodeId {
        self.inner.lock().leader_id
    }

    pub fn is_leader(&self) -> bool {
        self.inner.lock().state == ReplicaState::Leader
    }

    pub fn is_follower(&self) -> bool {
        self.inner.lock().state == ReplicaState::Follower
    }

    pub fn is_retired(&self) -> bool {
        self.inner.lock().state == ReplicaState::Retired
    }

    pub fn get_term(&self) -> Term {
        self.inner.lock().current_view
    }

    pub fn get_last_idx(&self) -> Version {
        self.inner.lock().last_idx
    }

    pub fn get_commit_idx(&self) -> Version {
        self.inner.lock().commit_idx
    }

    pub fn last_committable_index(&self) -> Version {
        self.inner.lock().last_committable_index()
    }

    pub fn get_term_at(&self, idx: Version) -> Term {
        self.inner.lock().term_at(idx)
    }

    pub fn committed_txid(&self) -> TxId {
        let inner = self.inner.lock();
        TxId::new(inner.term_at(inner.commit_idx), inner.commit_idx)
    }

    /// All security domains will be deserialised from here on
    /// (recovery finished).
    pub fn enable_all_domains(&self) {
        self.inner.lock().public_only = false;
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().latest_configuration_len()
    }

    pub fn get_latest_configuration(&self) -> BTreeMap<NodeId, NodeInfo> {
        self.inner
            .lock()
            .configurations
            .back()
            .map(|c| c.nodes.clone())
            .unwrap_or_default()
    }

    /// Enqueue a configuration effective from `idx`. Safe to call from
    /// map hooks (which fire while the engine lock is held): the
    /// configuration is folded in at the next engine entry point.
    pub fn add_configuration(&self, idx: Version, nodes: BTreeMap<NodeId, NodeInfo>) {
        self.pending_configs
            .lock()
            .push(Configuration::new(idx, nodes));
        // Fold immediately when the engine is idle.
        if let Some(mut inner) = self.inner.try_lock() {
            self.drain_pending_configs(&mut inner);
        }
    }

    fn drain_pending_configs(&self, inner: &mut Inner) {
        let pending: Vec<Configuration> = self.pending_configs.lock().drain(..).collect();
        for conf in pending {
            inner.configurations.push_back(conf);
            inner.create_and_remove_node_state(self.node_id);
        }
    }

    /// Unsafe bootstrap: only when the node is certain there is no
    /// leader and no other node will attempt to force leadership.
    pub fn force_become_leader(&self) {
        let mut inner = self.inner.lock();
        inner.current_view += 2;
        inner.become_leader(self.node_id);
    }

    /// Resume from a snapshot as a follower; no entries received yet.
    pub fn init_as_follower(&self, idx: Version, term: Term, term_history: Vec<Version>) {
        let mut inner = self.inner.lock();
        inner.last_idx = idx;
        inner.commit_idx = idx;
        inner.view_history.initialise(term_history);
        inner.ledger.init(idx);
        inner.snapshotter.set_last_snapshot_idx(idx);
        inner.become_follower(term, self.node_id, self.election_timeout_ms);
    }

    // ------------------------------------------------------------------
    // Event sources: replicate / periodic / recv_message
    // ------------------------------------------------------------------

    pub fn replicate(
        &self,
        entries: Vec<(Version, Arc<Vec<u8>>, bool)>,
        term: Term,
    ) -> bool {
        let mut inner = self.inner.lock();
        self.drain_pending_configs(&mut inner);

        if inner.state != ReplicaState::Leader {
            warn!(count = entries.len(), "failed to replicate: not leader");
            let last = inner.last_idx;
            inner.rollback(last);
            return false;
        }

        if term != inner.current_view {
            warn!(
                term,
                current = inner.current_view,
                "failed to replicate: stale term"
            );
            return false;
        }

        debug!(count = entries.len(), "replicating entries");

        for (index, data, committable) in entries {
            if index != inner.last_idx + 1 {
                return false;
            }

            debug!(
                index,
                committable,
                "replicated on leader {}",
                self.node_id
            );

            let mut force_ledger_chunk = false;
            if committable {
                inner.committable_indices.push_back(index);
                // Only a committable entry can seal a chunk for a
                // snapshot.
                force_ledger_chunk = inner.snapshotter.requires_snapshot(index);
            }

            inner.last_idx = index;
            inner.ledger.put_entry(&data, committable, force_ledger_chunk);
            inner.entry_size_not_limited += data.len();
            inner.entry_count += 1;

            let view = inner.current_view;
            inner.view_history.update(index, view);

            if inner.entry_size_not_limited >= APPEND_ENTRIES_SIZE_LIMIT {
                inner.update_batch_size();
                inner.entry_count = 0;
                inner.entry_size_not_limited = 0;
                let peers: Vec<(NodeId, Version)> = inner
                    .nodes
                    .iter()
                    .map(|(id, n)| (*id, n.sent_idx + 1))
                    .collect();
                for (peer, start) in peers {
                    debug!(peer, "sending updates to follower");
                    inner.send_append_entries(self.node_id, peer, start);
                }
            }
        }

        // A lone node commits immediately.
        if inner.nodes.is_empty() {
            inner.update_commit(self.node_id);
        }

        true
    }

    pub fn periodic(&self, elapsed_ms: u64) {
        let mut inner = self.inner.lock();
        self.drain_pending_configs(&mut inner);
        inner.timeout_elapsed += elapsed_ms;

        if inner.state == ReplicaState::Leader {
            if inner.timeout_elapsed >= self.request_timeout_ms {
                inner.timeout_elapsed = 0;
                inner.update_batch_size();
                let peers: Vec<(NodeId, Version)> = inner
                    .nodes
                    .iter()
                    .map(|(id, n)| (*id, n.sent_idx + 1))
                    .collect();
                for (peer, start) in peers {
                    inner.send_append_entries(self.node_id, peer, start);
                }
            }
        } else if inner.state != ReplicaState::Retired
            && inner.timeout_elapsed >= self.election_timeout_ms
        {
            inner.become_candidate(self.node_id, self.election_timeout_ms);
        }
    }

    /// Dispatch one channel-verified message. Malformed messages are
    /// dropped silently.
    pub fn recv_message(&self, data: &[u8]) {
        let (header, msg) = match Message::decode(data) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "dropping malformed message");
                return;
            }
        };

        match msg {
            Message::AppendEntries(m) => self.recv_append_entries(header.from, m),
            Message::AppendEntriesResponse(m) => {
                self.recv_append_entries_response(header.from, m)
            }
            Message::RequestVote(m) => self.recv_request_vote(header.from, m),
            Message::RequestVoteResponse(m) => {
                self.recv_request_vote_response(header.from, m)
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // AppendEntries
    // ------------------------------------------------------------------

    fn recv_append_entries(&self, from: NodeId, r: AppendEntries) {
        let mut inner = self.inner.lock();
        self.drain_pending_configs(&mut inner);

        debug!(
            prev_term = r.prev_term,
            prev_idx = r.prev_idx,
            term = r.term,
            idx = r.idx,
            "received append entries"
        );

        // Accept anything that passed the channel integrity check, even
        // from nodes not yet in our configuration: the entries may hold
        // the topology change that adds them.

        // First, term checks.
        if inner.current_view == r.term && inner.state == ReplicaState::Candidate {
            inner.become_follower(r.term, self.node_id, self.election_timeout_ms);
        } else if inner.current_view < r.term {
            inner.become_follower(r.term, self.node_id, self.election_timeout_ms);
        } else if inner.current_view > r.term {
            debug!(
                ours = inner.current_view,
                theirs = r.term,
                "append entries from stale term"
            );
            inner.send_append_entries_response(self.node_id, from, false);
            return;
        }

        // Second, log matching on the previous entry.
        let prev_term = inner.term_at(r.prev_idx);
        if prev_term != r.prev_term {
            debug!(
                prev_idx = r.prev_idx,
                ours = prev_term,
                theirs = r.prev_term,
                "log mismatch at previous index"
            );
            inner.send_append_entries_response(self.node_id, from, false);
            return;
        }

        // Matching terms are proof enough the sender leads our term.
        inner.restart_election_timeout(self.election_timeout_ms);
        if inner.leader_id != from {
            inner.leader_id = from;
            debug!(leader = from, "follower accepted leader");
        }

        // Third, index sanity: nothing in the past or future.
        if r.prev_idx < inner.commit_idx {
            debug!(
                prev_idx = r.prev_idx,
                commit_idx = inner.commit_idx,
                "append entries behind commit"
            );
            return;
        }
        if r.prev_idx > inner.last_idx {
            debug!(
                prev_idx = r.prev_idx,
                last_idx = inner.last_idx,
                "append entries ahead of log"
            );
            return;
        }

        // Finally, apply each entry in the batch.
        let mut cursor = FrameCursor::new(&r.entries);
        for i in (r.prev_idx + 1)..=r.idx {
            if i <= inner.last_idx {
                // Already deserialised: skip the payload.
                if cursor.skip_entry().is_err() {
                    inner.send_append_entries_response(self.node_id, from, false);
                    return;
                }
                continue;
            }

            let entry = match cursor.next_entry() {
                Ok(e) => e.to_vec(),
                Err(e) => {
                    warn!(index = i, error = %e, "malformed entry in append entries");
                    inner.send_append_entries_response(self.node_id, from, false);
                    return;
                }
            };

            debug!(index = i, "replicating on follower {}", self.node_id);
            inner.last_idx = i;

            let public_only = inner.public_only;
            let outcome = inner.store.deserialise(&entry, public_only);

            let outcome = match outcome {
                Ok(o) => o,
                Err(e) => {
                    warn!(index = i, error = %e, "follower failed to apply entry");
                    inner.last_idx = i - 1;
                    inner.ledger.truncate(i - 1);
                    inner.send_append_entries_response(self.node_id, from, false);
                    return;
                }
            };

            let committable = matches!(outcome, ApplyOutcome::PassSignature(_));
            let mut force_ledger_chunk = false;
            if committable {
                force_ledger_chunk = inner.snapshotter.requires_snapshot(i);
            }
            inner.ledger.put_entry(&entry, committable, force_ledger_chunk);

            if let ApplyOutcome::PassSignature(sig_term) = outcome {
                debug!(index = i, "deserialised signature");
                let prev_lci = inner.last_committable_index();
                inner.committable_indices.push_back(i);

                if sig_term != 0 {
                    // A signature for sig_term puts every entry since
                    // the previous signature in that term.
                    if r.term_of_idx == VIEW_UNKNOWN {
                        inner.view_history.update(1, r.term);
                    } else {
                        inner.view_history.update(prev_lci + 1, sig_term);
                    }
                    inner.commit_if_possible(r.leader_commit_idx, self.node_id);
                }
            }
        }

        // Try to commit at the leader's commit index, then extend the
        // term history to cover what we just accepted.
        inner.commit_if_possible(r.leader_commit_idx, self.node_id);

        let lci = inner.last_committable_index();
        if r.term_of_idx == VIEW_UNKNOWN {
            inner.view_history.update(1, r.term);
        } else {
            inner.view_history.update(lci + 1, r.term_of_idx);
        }

        inner.send_append_entries_response(self.node_id, from, true);
    }

    fn recv_append_entries_response(&self, from: NodeId, r: AppendEntriesResponse) {
        let mut inner = self.inner.lock();
        if inner.state != ReplicaState::Leader {
            return;
        }

        let Some(node) = inner.nodes.get(&from) else {
            warn!(from, "append entries response from unknown node");
            return;
        };
        let match_idx = node.match_idx;

        if inner.current_view < r.term {
            debug!(from, "response from a newer term");
            inner.become_follower(r.term, self.node_id, self.election_timeout_ms);
            return;
        } else if inner.current_view != r.term {
            debug!(from, "response from a stale term");
            if r.success {
                return;
            }
        } else if r.last_log_idx < match_idx && r.success {
            // Stale success, discard; failures still reset sent_idx.
            debug!(from, "stale append entries response");
            return;
        }

        let new_match = r.last_log_idx.min(inner.last_idx);
        if let Some(node) = inner.nodes.get_mut(&from) {
            node.match_idx = new_match;
        }

        if !r.success {
            // Log inconsistency: back off to the follower's match index.
            debug!(from, "append entries rejected, resending");
            inner.send_append_entries(self.node_id, from, new_match + 1);
            return;
        }

        debug!(from, last_log_idx = r.last_log_idx, "append entries accepted");
        inner.update_commit(self.node_id);
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    fn recv_request_vote(&self, from: NodeId, r: RequestVote) {
        let mut inner = self.inner.lock();

        if !inner.nodes.contains_key(&from) {
            warn!(from, "vote request from unknown node");
            return;
        }

        if inner.current_view > r.term {
            debug!(
                ours = inner.current_view,
                theirs = r.term,
                "vote request from stale term"
            );
            inner.send_request_vote_response(self.node_id, from, false);
            return;
        } else if inner.current_view < r.term {
            debug!("vote request from newer term");
            inner.become_follower(r.term, self.node_id, self.election_timeout_ms);
        }

        if inner.voted_for != NO_NODE && inner.voted_for != from {
            debug!(voted_for = inner.voted_for, "already voted this term");
            inner.send_request_vote_response(self.node_id, from, false);
            return;
        }

        // Grant iff the candidate's committable log is at least as
        // up-to-date as ours, by (term, idx).
        let lci = inner.last_committable_index();
        let our_term = inner.term_at(lci);

        let answer = (r.term_of_last_committable_idx > our_term)
            || (r.term_of_last_committable_idx == our_term
                && r.last_committable_idx >= lci);

        if answer {
            // Granting the vote acknowledges an election in progress.
            inner.restart_election_timeout(self.election_timeout_ms);
            inner.leader_id = NO_NODE;
            inner.voted_for = from;
        }

        inner.send_request_vote_response(self.node_id, from, answer);
    }

    fn recv_request_vote_response(&self, from: NodeId, r: RequestVoteResponse) {
        let mut inner = self.inner.lock();

        if inner.state != ReplicaState::Candidate {
            debug!("vote response while not a candidate");
            return;
        }
        if !inner.nodes.contains_key(&from) {
            warn!(from, "vote response from unknown node");
            return;
        }

        if inner.current_view < r.term {
            inner.become_follower(r.term, self.node_id, self.election_timeout_ms);
            return;
        } else if inner.current_view != r.term {
            debug!(from, "stale vote response");
            return;
        } else if !r.vote_granted {
            debug!(from, "vote denied");
            return;
        }

        info!(from, "vote granted");
        inner.add_vote_for_me(from, self.node_id);
    }
}

// ---------------------------------------------------------------------------
// Inner: everything below runs with the engine lock held
// ---------------------------------------------------------------------------

impl Inner {
    fn last_committable_index(&self) -> Version {
        self.committable_indices
            .back()
            .copied()
            .unwrap_or(self.commit_idx)
    }

    fn term_at(&self, idx: Version) -> Term {
        if idx > self.last_idx {
            return VIEW_UNKNOWN;
        }
        self.view_history.view_at(idx)
    }

    fn latest_configuration_len(&self) -> usize {
        self.configurations
            .back()
            .map(|c| c.nodes.len())
            .unwrap_or(0)
    }

    fn update_batch_size(&mut self) {
        let avg_entry_size = if self.entry_count == 0 {
            APPEND_ENTRIES_SIZE_LIMIT
        } else {
            self.entry_size_not_limited / self.entry_count
        };

        let batch_size = if avg_entry_size == 0 {
            APPEND_ENTRIES_SIZE_LIMIT / 2
        } else {
            APPEND_ENTRIES_SIZE_LIMIT / avg_entry_size
        };

        // Balance the new estimate across the window.
        let batch_avg = self.batch_window_sum / BATCH_WINDOW_SIZE;
        self.batch_window_sum += batch_size as i64 - batch_avg;
        self.entries_batch_size = (self.batch_window_sum / BATCH_WINDOW_SIZE).max(1) as u64;
    }

    fn restart_election_timeout(&mut self, election_timeout_ms: u64) {
        // Random elapsed time gives an effective timeout between 0.5x
        // and 1x the configured value.
        self.timeout_elapsed = rand::thread_rng().gen_range(0..=election_timeout_ms / 2);
    }

    fn send(&self, msg: Message, my_id: NodeId, to: NodeId) {
        let frame = msg.encode(my_id);
        if !self.outbound.send(to, &frame) {
            debug!(to, "message send refused by channel layer");
        }
    }

    fn send_append_entries(&mut self, my_id: NodeId, to: NodeId, start_idx: Version) {
        let last = self.last_idx;
        let batch = self.entries_batch_size.max(1);
        let mut start = start_idx;

        if last > 0 {
            let mut end = (start + batch).min(last);
            while end < last {
                self.send_append_entries_range(my_id, to, start, end);
                start = (end + 1).min(last);
                end += batch;
            }
        }
        self.send_append_entries_range(my_id, to, start, last);
    }

    fn send_append_entries_range(
        &mut self,
        my_id: NodeId,
        to: NodeId,
        start_idx: Version,
        end_idx: Version,
    ) {
        let prev_idx = start_idx - 1;
        let prev_term = self.term_at(prev_idx);
        let term_of_idx = self.term_at(end_idx);

        debug!(
            to,
            start_idx,
            end_idx,
            commit_idx = self.commit_idx,
            "sending append entries"
        );

        let entries = if end_idx >= start_idx {
            self.ledger
                .framed_entries(start_idx, end_idx)
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let ae = AppendEntries {
            idx: end_idx,
            prev_idx,
            term: self.current_view,
            prev_term,
            leader_commit_idx: self.commit_idx,
            term_of_idx,
            entries,
        };

        self.send(Message::AppendEntries(ae), my_id, to);

        if let Some(node) = self.nodes.get_mut(&to) {
            node.sent_idx = end_idx;
        }
    }

    fn send_append_entries_response(&mut self, my_id: NodeId, to: NodeId, success: bool) {
        debug!(
            to,
            last_idx = self.last_idx,
            success,
            "sending append entries response"
        );
        let response = AppendEntriesResponse {
            term: self.current_view,
            last_log_idx: self.last_idx,
            success,
        };
        self.send(Message::AppendEntriesResponse(response), my_id, to);
    }

    fn send_request_vote(&mut self, my_id: NodeId, to: NodeId) {
        info!(to, "requesting vote");
        let lci = self.last_committable_index();
        debug_assert!(lci >= self.commit_idx);
        let rv = RequestVote {
            term: self.current_view,
            last_committable_idx: lci,
            term_of_last_committable_idx: self.term_at(lci),
        };
        self.send(Message::RequestVote(rv), my_id, to);
    }

    fn send_request_vote_response(&mut self, my_id: NodeId, to: NodeId, answer: bool) {
        info!(to, answer, "sending vote response");
        let response = RequestVoteResponse {
            term: self.current_view,
            vote_granted: answer,
        };
        self.send(Message::RequestVoteResponse(response), my_id, to);
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    fn become_candidate(&mut self, my_id: NodeId, election_timeout_ms: u64) {
        self.state = ReplicaState::Candidate;
        self.leader_id = NO_NODE;
        self.voted_for = my_id;
        self.votes_for_me.clear();
        self.current_view += 1;

        self.restart_election_timeout(election_timeout_ms);

        info!(term = self.current_view, "becoming candidate {}", my_id);

        let peers: Vec<(NodeId, NodeInfo)> = self
            .nodes
            .iter()
            .map(|(id, n)| (*id, n.info.clone()))
            .collect();
        for (peer, info) in peers {
            self.outbound.create_channel(peer, &info.hostname, &info.port);
            self.send_request_vote(my_id, peer);
        }

        self.add_vote_for_me(my_id, my_id);
    }

    fn become_leader(&mut self, my_id: NodeId) {
        self.election_index = self.last_committable_index();
        debug!(election_index = self.election_index, "election index");

        // Discard unsigned uncommitted work; there is no signature to
        // commit it under. At startup the genesis transaction stays.
        if self.commit_idx > 0 {
            let idx = self.election_index;
            self.rollback(idx);
        } else {
            let view = self.current_view;
            self.store.set_term(view);
        }

        self.state = ReplicaState::Leader;
        self.leader_id = my_id;
        self.timeout_elapsed = 0;

        info!(term = self.current_view, "becoming leader {}", my_id);

        if self.nodes.is_empty() {
            let last = self.last_idx;
            self.commit(last, my_id);
            return;
        }

        let next = self.last_idx + 1;
        let peers: Vec<NodeId> = self.nodes.keys().copied().collect();
        for peer in &peers {
            if let Some(node) = self.nodes.get_mut(peer) {
                node.match_idx = 0;
                node.sent_idx = next - 1;
            }
        }
        for peer in peers {
            self.send_append_entries(my_id, peer, next);
        }
    }

    fn become_follower(&mut self, term: Term, my_id: NodeId, election_timeout_ms: u64) {
        self.state = ReplicaState::Follower;
        self.leader_id = NO_NODE;
        self.restart_election_timeout(election_timeout_ms);

        self.current_view = term;
        self.voted_for = NO_NODE;
        self.votes_for_me.clear();

        let lci = self.last_committable_index();
        self.rollback(lci);

        info!(term = self.current_view, "becoming follower {}", my_id);
        self.outbound.close_all_outgoing();
    }

    fn become_retired(&mut self, my_id: NodeId) {
        self.state = ReplicaState::Retired;
        self.leader_id = NO_NODE;

        info!(term = self.current_view, "becoming retired {}", my_id);
        self.outbound.destroy_all();
    }

    fn add_vote_for_me(&mut self, from: NodeId, my_id: NodeId) {
        self.votes_for_me.insert(from);
        // 50% + 1 of the other nodes plus us.
        if self.votes_for_me.len() >= (self.nodes.len() + 1) / 2 + 1 {
            self.become_leader(my_id);
        }
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    fn update_commit(&mut self, my_id: NodeId) {
        // The highest index replicated on a majority of every active
        // configuration (joint consensus).
        let mut new_commit_idx = Version::MAX;

        for c in &self.configurations {
            let mut match_idxs: Vec<Version> = c
                .nodes
                .keys()
                .map(|id| {
                    if *id == my_id {
                        self.last_idx
                    } else {
                        self.nodes.get(id).map(|n| n.match_idx).unwrap_or(0)
                    }
                })
                .collect();
            match_idxs.sort_unstable();
            let confirmed = match_idxs[(match_idxs.len() - 1) / 2];
            if confirmed < new_commit_idx {
                new_commit_idx = confirmed;
            }
        }

        debug!(
            confirmed = new_commit_idx,
            last_idx = self.last_idx,
            "updating commit"
        );

        if new_commit_idx != Version::MAX {
            self.commit_watermark_idx = new_commit_idx;
        }

        if self.commit_watermark_idx > self.last_idx {
            panic!("followers appear to have later match indices than leader");
        }

        let watermark = self.commit_watermark_idx;
        self.commit_if_possible(watermark, my_id);
    }

    fn commit_if_possible(&mut self, idx: Version, my_id: NodeId) {
        debug!(
            idx,
            commit_idx = self.commit_idx,
            term = self.term_at(idx),
            "commit if possible"
        );
        if idx > self.commit_idx && self.term_at(idx) <= self.current_view {
            let mut highest_committable = 0;
            let mut can_commit = false;
            while let Some(front) = self.committable_indices.front() {
                if *front > idx {
                    break;
                }
                highest_committable = *front;
                self.committable_indices.pop_front();
                can_commit = true;
            }
            if can_commit {
                self.commit(highest_committable, my_id);
            }
        }
    }

    fn commit(&mut self, idx: Version, my_id: NodeId) {
        if idx > self.last_idx {
            panic!(
                "tried to commit {} but last_idx is {}",
                idx, self.last_idx
            );
        }

        // A follower promoted with fewer committed entries can see a
        // stale commit index here.
        if idx <= self.commit_idx {
            return;
        }

        self.commit_idx = idx;

        debug!(idx, "committing");
        self.snapshotter.compact(idx);
        if self.state == ReplicaState::Leader {
            self.snapshotter.snapshot(idx);
        }
        self.store.compact(idx);
        self.ledger.commit(idx);

        debug!(idx, "commit on {}", my_id);

        // Retire configurations wholly superseded by a committed one.
        let mut changed = false;
        while self.configurations.len() >= 2 {
            let next_idx = self.configurations[1].idx;
            if idx < next_idx {
                break;
            }
            self.configurations.pop_front();
            changed = true;
        }
        if changed {
            self.create_and_remove_node_state(my_id);
        }
    }

    fn rollback(&mut self, idx: Version) {
        self.snapshotter.rollback(idx);
        let view = self.current_view;
        if let Err(e) = self.store.rollback(idx, Some(view)) {
            warn!(idx, error = %e, "store rollback refused");
            return;
        }
        self.ledger.truncate(idx);
        self.last_idx = idx;
        debug!(idx, "rolled back");

        while let Some(back) = self.committable_indices.back() {
            if *back <= idx {
                break;
            }
            self.committable_indices.pop_back();
        }

        let mut changed = false;
        while let Some(back) = self.configurations.back() {
            if back.idx <= idx {
                break;
            }
            self.configurations.pop_back();
            changed = true;
        }
        if changed {
            self.create_and_remove_node_state(NO_NODE);
        }
    }

    /// Reconcile per-peer state with the union of active
    /// configurations: add missing peers, drop departed ones, retire
    /// ourselves if no configuration names us.
    fn create_and_remove_node_state(&mut self, my_id: NodeId) {
        let mut active: BTreeMap<NodeId, NodeInfo> = BTreeMap::new();
        for conf in &self.configurations {
            for (id, info) in &conf.nodes {
                active.entry(*id).or_insert_with(|| info.clone());
            }
        }

        let to_remove: Vec<NodeId> = self
            .nodes
            .keys()
            .filter(|id| !active.contains_key(id))
            .copied()
            .collect();
        for id in to_remove {
            if self.state == ReplicaState::Leader {
                self.outbound.destroy_channel(id);
            }
            self.nodes.remove(&id);
            info!(node = id, "removed replication peer");
        }

        let mut self_is_active = false;
        for (id, info) in active {
            if id == my_id {
                self_is_active = true;
                continue;
            }
            if !self.nodes.contains_key(&id) {
                // A new node starts from future entries only; it reports
                // back if it is missing earlier data.
                let index = self.last_idx + 1;
                self.nodes.insert(
                    id,
                    NodeState {
                        info: info.clone(),
                        sent_idx: index - 1,
                        match_idx: 0,
                    },
                );

                if self.state == ReplicaState::Leader {
                    self.outbound.create_channel(id, &info.hostname, &info.port);
                    self.send_append_entries(my_id, id, index);
                }
                info!(node = id, "added replication peer");
            }
        }

        if !self_is_active && my_id != NO_NODE {
            info!("this node is absent from every active configuration");
            if self.state == ReplicaState::Leader {
                self.become_retired(my_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store-facing trait impls
// ---------------------------------------------------------------------------

impl ReplicationSink for CftConsensus {
    fn replicate(&self, entries: Vec<(Version, Arc<Vec<u8>>, bool)>, term: Term) -> bool {
        CftConsensus::replicate(self, entries, term)
    }

    fn view_history_until(&self, version: Version) -> Vec<Version> {
        self.inner.lock().view_history.history_until(version)
    }
}

impl CommitSource for CftConsensus {
    fn signable_txid(&self) -> Option<TxId> {
        let inner = self.inner.lock();
        // Only the leader signs, and only once commit has caught up
        // with its election index.
        if inner.state != ReplicaState::Leader || inner.commit_idx < inner.election_index {
            return None;
        }
        Some(TxId::new(inner.term_at(inner.commit_idx), inner.commit_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_tracks_entry_sizes() {
        let mut inner_batch = (0usize, 0usize, 1u64, 0i64);
        // Mirror of update_batch_size on a bare tuple, driven with
        // small entries: the batch size should grow well above 1.
        let (ref mut size, ref mut count, ref mut batch, ref mut window) = inner_batch;
        *size = 200 * 100;
        *count = 100;
        for _ in 0..200 {
            let avg = if *count == 0 {
                APPEND_ENTRIES_SIZE_LIMIT
            } else {
                *size / *count
            };
            let bs = if avg == 0 {
                APPEND_ENTRIES_SIZE_LIMIT / 2
            } else {
                APPEND_ENTRIES_SIZE_LIMIT / avg
            };
            let avg_w = *window / BATCH_WINDOW_SIZE;
            *window += bs as i64 - avg_w;
            *batch = (*window / BATCH_WINDOW_SIZE).max(1) as u64;
        }
        assert!(*batch > 10, "batch size should converge upward, got {}", batch);
    }
}
