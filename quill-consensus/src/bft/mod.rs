//! BFT engine: three-phase ordering
//!
//! A PBFT variant. The primary of view `v` is `v mod n`. Each batch of
//! client requests travels pre-prepare → prepare → commit; the
//! pre-prepare's digest covers the batch and the Merkle root produced
//! by tentatively executing it through the KV, so backups detect a
//! lying primary by executing and comparing. A prepared certificate is
//! the pre-prepare plus `2f` matching prepares; a commit certificate is
//! `2f + 1` commits. Checkpoints every `checkpoint_interval` executed
//! sequence numbers stabilise the log; replicas that fall behind the
//! stable point fetch state instead of replaying the window.
//!
//! Each executed batch additionally runs the commit-evidence protocol:
//! every replica signs the replicated-state root it computed and
//! commits to a nonce (`SignedAppendEntriesResponse`), acknowledges a
//! quorum of signatures (`SignaturesReceivedAck`), then reveals its
//! nonce (`NonceRevealMsg`). Only a complete nonce certificate advances
//! the final commit watermark the KV compacts at; the aggregated
//! records replicate through the ordering path itself so replicas stay
//! bit-identical.
//!
//! A single reactor owns the canonical state. Tentative execution runs
//! through a continuation (`execute_tentative_batch(seqno, batch,
//! on_done)`); messages arriving while execution is pending are queued
//! and replayed when it clears. The ledger sits behind its own lock so
//! the store's replication sink can append entries mid-execution
//! without re-entering the reactor.

pub mod executor;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use quill_kv::{maps, ApplyOutcome, ReplicationSink, Store, TxHistory};
use quill_ledger::FrameCursor;
use quill_merkle::{CommitSource, MerkleHistory};
use quill_model::codec::{RawReader, RawWriter};
use quill_model::{Hash, Nonce, NodeId, SeqNo, Term, TxId, Version, View};

use crate::messages::{
    Checkpoint, CommitMsg, Data, Fetch, Message, MetaDataD, NewView, NonceRevealMsg, PrePrepare,
    Prepare, PreparedProof, QueryStable, ReplyStable, Request, SignaturesReceivedAck,
    SignedAppendEntriesResponse, Status, ViewChange, ViewChangeAck,
};
use crate::progress::{ProgressTracker, TrackerResult};
use crate::traits::{LedgerSink, Outbound, Snapshotter};
use crate::view_history::ViewHistory;

pub use executor::{KvExecutor, KvRequest, RequestExecutor};

/// Active sequence window beyond the stable checkpoint.
pub const MAX_OUT: SeqNo = 32;

/// Request ids at or above this mark internal traffic (replicated
/// evidence records); they never spawn further records.
pub const INTERNAL_REQUEST_BASE: u64 = 1 << 63;

#[derive(Debug, Default)]
struct Slot {
    pre_prepare: Option<PrePrepare>,
    /// Prepares matching the pre-prepare digest (own included).
    prepares: BTreeSet<NodeId>,
    commits: BTreeSet<NodeId>,
    commit_sent: bool,
    /// Tentative execution completed and matched the digest.
    executed: bool,
    globally_committed: bool,
    /// Store version before this batch executed, for rollback.
    pre_exec_version: Version,
    /// Store version after this batch executed.
    end_version: Version,
}

/// The ledger and its write cursor, behind their own lock: the store's
/// replication sink appends during tentative execution, while the
/// reactor lock is held.
struct LedgerState {
    sink: Box<dyn LedgerSink>,
    last_idx: Version,
}

struct BftInner {
    store: Arc<Store>,
    history: Arc<MerkleHistory>,
    outbound: Arc<dyn Outbound>,
    snapshotter: Arc<dyn Snapshotter>,
    executor: Arc<dyn RequestExecutor>,
    progress: Arc<ProgressTracker>,

    view: View,
    nodes: Vec<NodeId>,

    request_queue: VecDeque<Request>,
    slots: BTreeMap<SeqNo, Slot>,
    next_pp_seqno: SeqNo,
    last_executed: SeqNo,
    last_stable: SeqNo,
    last_gb_committed: SeqNo,
    /// Store version at the last global commit, the rollback floor.
    last_gb_version: Version,
    /// Store version with a full nonce certificate AND a commit
    /// certificate; the KV compacts here, never beyond.
    final_committed_version: Version,
    next_internal_request: u64,
    /// Batch end-version → held client requests. Outlives the slot
    /// (checkpoints truncate slots before evidence may finish).
    batch_kinds: BTreeMap<Version, bool>,
    sig_records_emitted: BTreeSet<Version>,
    nonce_records_emitted: BTreeSet<Version>,
    stable_digest: Hash,

    /// seqno → digest → voters.
    checkpoints: BTreeMap<SeqNo, BTreeMap<Hash, BTreeSet<NodeId>>>,

    /// new-view → sender → view-change message.
    view_changes: BTreeMap<View, BTreeMap<NodeId, ViewChange>>,
    /// view-change acks seen by the incoming primary.
    vc_acks: BTreeMap<View, BTreeSet<NodeId>>,
    /// Set while this replica has announced a view change and waits
    /// for the new view.
    in_view_change: bool,

    /// View-change timer: runs while ordering is outstanding.
    vtimer_elapsed: u64,
    vtimer_running: bool,

    /// State transfer in progress; the view-change timer is paused.
    fetching: bool,

    /// Set once the service's network-open transaction is observed.
    network_open: bool,

    /// Continuation machinery: messages arriving while a tentative
    /// execution is pending are queued and replayed when it clears.
    exec_pending: bool,
    pending_msgs: VecDeque<Vec<u8>>,

    view_history: ViewHistory,

    replies: BTreeMap<u64, Vec<u8>>,
    executed_requests: BTreeSet<u64>,
}

pub struct BftConsensus {
    inner: Mutex<BftInner>,
    ledger: Arc<Mutex<LedgerState>>,
    node_id: NodeId,
    vc_timeout_ms: u64,
    checkpoint_interval: SeqNo,
}

impl BftConsensus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        nodes: Vec<NodeId>,
        store: Arc<Store>,
        history: Arc<MerkleHistory>,
        ledger: Box<dyn LedgerSink>,
        outbound: Arc<dyn Outbound>,
        snapshotter: Arc<dyn Snapshotter>,
        executor: Arc<dyn RequestExecutor>,
        progress: Arc<ProgressTracker>,
        vc_timeout_ms: u64,
        checkpoint_interval: SeqNo,
    ) -> Arc<Self> {
        let mut view_history = ViewHistory::new();
        // Ordering starts in view 1; seqno 0 is the genesis checkpoint.
        view_history.update(1, 1);
        Arc::new(Self {
            inner: Mutex::new(BftInner {
                store,
                history,
                outbound,
                snapshotter,
                executor,
                progress,
                view: 1,
                nodes,
                request_queue: VecDeque::new(),
                slots: BTreeMap::new(),
                next_pp_seqno: 0,
                last_executed: 0,
                last_stable: 0,
                last_gb_committed: 0,
                last_gb_version: 0,
                final_committed_version: 0,
                next_internal_request: 0,
                batch_kinds: BTreeMap::new(),
                sig_records_emitted: BTreeSet::new(),
                nonce_records_emitted: BTreeSet::new(),
                stable_digest: Hash::ZERO,
                checkpoints: BTreeMap::new(),
                view_changes: BTreeMap::new(),
                vc_acks: BTreeMap::new(),
                in_view_change: false,
                vtimer_elapsed: 0,
                vtimer_running: false,
                fetching: false,
                network_open: true,
                exec_pending: false,
                pending_msgs: VecDeque::new(),
                view_history,
                replies: BTreeMap::new(),
                executed_requests: BTreeSet::new(),
            }),
            ledger: Arc::new(Mutex::new(LedgerState {
                sink: ledger,
                last_idx: 0,
            })),
            node_id,
            vc_timeout_ms,
            checkpoint_interval,
        })
    }

    pub fn id(&self) -> NodeId {
        self.node_id
    }

    pub fn view(&self) -> View {
        self.inner.lock().view
    }

    pub fn is_primary(&self) -> bool {
        let inner = self.inner.lock();
        inner.primary(inner.view) == self.node_id
    }

    pub fn primary(&self) -> NodeId {
        let inner = self.inner.lock();
        inner.primary(inner.view)
    }

    pub fn last_executed(&self) -> SeqNo {
        self.inner.lock().last_executed
    }

    pub fn last_stable(&self) -> SeqNo {
        self.inner.lock().last_stable
    }

    pub fn last_globally_committed(&self) -> SeqNo {
        self.inner.lock().last_gb_committed
    }

    /// The store version the nonce-reveal evidence has finalised; the
    /// KV never compacts past it.
    pub fn final_committed_version(&self) -> Version {
        self.inner.lock().final_committed_version
    }

    /// The raw nonce-certificate watermark, before commit-certificate
    /// clamping.
    pub fn nonce_watermark(&self) -> Version {
        self.inner.lock().progress.highest_committed_nonce()
    }

    pub fn in_view_change(&self) -> bool {
        self.inner.lock().in_view_change
    }

    /// The reply recorded for a request, once its batch executed.
    pub fn reply_for(&self, request_id: u64) -> Option<Vec<u8>> {
        self.inner.lock().replies.get(&request_id).cloned()
    }

    // ------------------------------------------------------------------
    // Event sources
    // ------------------------------------------------------------------

    /// A client request from the frontend. Returns false during a view
    /// change ("not primary / not in view": the client retries).
    pub fn on_request(&self, request: Request) -> bool {
        let mut inner = self.inner.lock();
        if inner.in_view_change {
            return false;
        }
        if inner.executed_requests.contains(&request.request_id) {
            // Execute-once: duplicates are answered from the stored
            // reply.
            return true;
        }
        inner.request_queue.push_back(request);
        inner.start_vtimer_if_request_waiting();

        if inner.primary(inner.view) == self.node_id {
            self.send_pre_prepare(&mut inner);
        }
        true
    }

    pub fn periodic(&self, elapsed_ms: u64) {
        let mut inner = self.inner.lock();

        if inner.primary(inner.view) == self.node_id
            && !inner.request_queue.is_empty()
            && !inner.in_view_change
        {
            self.send_pre_prepare(&mut inner);
        }

        if inner.vtimer_running && !inner.fetching {
            inner.vtimer_elapsed += elapsed_ms;
            if inner.vtimer_elapsed >= self.vc_timeout_ms {
                inner.vtimer_elapsed = 0;
                self.send_view_change(&mut inner);
            }
        }
    }

    pub fn recv_message(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.exec_pending {
            // Replayed when the tentative execution completes.
            inner.pending_msgs.push_back(data.to_vec());
            return;
        }
        self.process_message(&mut inner, data);
        self.replay_pending(&mut inner);
    }

    fn process_message(&self, inner: &mut BftInner, data: &[u8]) {
        let (header, msg) = match Message::decode(data) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "dropping malformed message");
                return;
            }
        };
        let from = header.from;

        match msg {
            Message::Request(m) => {
                if inner.in_view_change || inner.executed_requests.contains(&m.request_id) {
                    return;
                }
                inner.request_queue.push_back(m);
                inner.start_vtimer_if_request_waiting();
                if inner.primary(inner.view) == self.node_id {
                    self.send_pre_prepare(inner);
                }
            }
            Message::PrePrepare(m) => self.handle_pre_prepare(inner, from, m),
            Message::Prepare(m) => self.handle_prepare(inner, from, m),
            Message::Commit(m) => self.handle_commit(inner, from, m),
            Message::Checkpoint(m) => self.handle_checkpoint(inner, from, m),
            Message::ViewChange(m) => self.handle_view_change(inner, from, m),
            Message::ViewChangeAck(m) => self.handle_view_change_ack(inner, from, m),
            Message::NewView(m) => self.handle_new_view(inner, from, m),
            Message::Status(m) => self.handle_status(inner, from, m),
            Message::Fetch(m) => self.handle_fetch(inner, from, m),
            Message::Data(m) => self.handle_data(inner, from, m),
            Message::MetaDataD(m) => self.handle_meta_data_d(inner, from, m),
            Message::QueryStable(m) => self.handle_query_stable(inner, from, m),
            Message::ReplyStable(m) => self.handle_reply_stable(inner, from, m),
            Message::SignedAppendEntriesResponse(m) => {
                self.handle_signed_response(inner, from, m)
            }
            Message::SignaturesReceivedAck(m) => self.handle_signature_ack(inner, from, m),
            Message::NonceReveal(m) => self.handle_nonce_reveal(inner, from, m),
            Message::NewPrincipal(m) => {
                // Membership additions arrive ahead of the node record
                // committing; start counting the principal toward
                // quorum once it is known.
                if !inner.nodes.contains(&m.node_id) {
                    info!(node = m.node_id, "new principal");
                    inner.nodes.push(m.node_id);
                    inner.nodes.sort_unstable();
                }
            }
            Message::NetworkOpen(_) => {
                if !inner.network_open {
                    info!(from, "network open");
                    inner.network_open = true;
                }
            }
            Message::AppendEntriesState(m) => {
                // Bulk catch-up entries share the state-transfer path.
                self.handle_data(
                    inner,
                    from,
                    Data {
                        from_idx: m.from_idx,
                        entries: m.entries,
                    },
                );
            }
            _ => {}
        }
    }

    fn replay_pending(&self, inner: &mut BftInner) {
        while !inner.exec_pending {
            let Some(queued) = inner.pending_msgs.pop_front() else {
                break;
            };
            self.process_message(inner, &queued);
        }
    }

    // ------------------------------------------------------------------
    // Ordering phases
    // ------------------------------------------------------------------

    /// Batch every queued request into one pre-prepare, execute it
    /// tentatively, and broadcast.
    fn send_pre_prepare(&self, inner: &mut BftInner) {
        if inner.request_queue.is_empty() || inner.in_view_change || inner.exec_pending {
            return;
        }
        let seqno = inner.next_pp_seqno + 1;
        if seqno > inner.last_stable + MAX_OUT {
            // Window full: wait for a checkpoint to stabilise.
            trace!(seqno, last_stable = inner.last_stable, "ordering window full");
            return;
        }

        let requests: Vec<Request> = inner.request_queue.drain(..).collect();
        let mut batch = Vec::new();
        for r in &requests {
            let mut w = RawWriter::new();
            w.write_u64(r.request_id);
            w.write_bytes(&r.payload);
            quill_ledger::frame_entry(&mut batch, &w.into_vec());
        }

        let view = inner.view;
        let node_id = self.node_id;
        let exec_batch = batch.clone();

        inner.execute_tentative_batch(seqno, &exec_batch, move |inner, root| {
            let end_version = inner
                .slots
                .get(&seqno)
                .map(|s| s.end_version)
                .unwrap_or_default();
            let txid = TxId::new(view, end_version);
            // The hashed nonce in the pre-prepare is this primary's
            // commitment for the batch's evidence round.
            let hashed_nonce = inner.progress.get_my_hashed_nonce(txid);
            let pp = PrePrepare {
                view,
                seqno,
                digest: PrePrepare::compute_digest(view, seqno, &batch, &root),
                replicated_root: root,
                hashed_nonce,
                batch: batch.clone(),
            };
            debug!(seqno, view, "sending pre-prepare");
            inner.next_pp_seqno = seqno;
            let slot = inner.slots.entry(seqno).or_default();
            slot.pre_prepare = Some(pp.clone());
            slot.executed = true;
            slot.prepares.insert(node_id);
            inner.broadcast(node_id, Message::PrePrepare(pp));

            inner.progress.record_primary(txid, node_id, root, hashed_nonce);
        });
        let txid = inner
            .slots
            .get(&seqno)
            .map(|s| TxId::new(view, s.end_version));
        if let Some(txid) = txid {
            self.emit_own_evidence(inner, txid);
        }
        self.try_advance(inner, seqno);
    }

    fn handle_pre_prepare(&self, inner: &mut BftInner, from: NodeId, m: PrePrepare) {
        let seqno = m.seqno;

        // (a) in the active window, (b) right view, (d) no conflicting
        // pre-prepare already accepted at (view, seqno).
        if !inner.in_wv(m.view, seqno) {
            trace!(seqno, view = m.view, "pre-prepare outside window/view");
            self.send_status(inner, from);
            return;
        }
        if from != inner.primary(m.view) {
            warn!(from, "pre-prepare from non-primary");
            return;
        }
        if let Some(slot) = inner.slots.get(&seqno) {
            if let Some(existing) = &slot.pre_prepare {
                if existing.digest != m.digest {
                    warn!(seqno, "conflicting pre-prepare at (view, seqno)");
                }
                return;
            }
        }

        // (c) the digest must cover exactly this batch and root.
        let expected = PrePrepare::compute_digest(m.view, seqno, &m.batch, &m.replicated_root);
        if expected != m.digest {
            warn!(seqno, "pre-prepare digest mismatch");
            return;
        }

        if seqno != inner.last_executed + 1 {
            // A gap: ask the sender what we're missing.
            self.send_status(inner, from);
            return;
        }

        let node_id = self.node_id;

        if m.batch.is_empty() {
            // Null-op from a new view: nothing executes, state is
            // unchanged by definition.
            let version = inner.store.current_version();
            let slot = inner.slots.entry(seqno).or_default();
            slot.pre_prepare = Some(m.clone());
            slot.executed = true;
            slot.pre_exec_version = version;
            slot.end_version = version;
            slot.prepares.insert(node_id);
            inner.last_executed = seqno;
            inner.broadcast(
                node_id,
                Message::Prepare(Prepare {
                    view: m.view,
                    seqno,
                    digest: m.digest,
                }),
            );
            inner.start_vtimer_if_request_waiting();
            self.try_advance(inner, seqno);
            return;
        }

        let claimed = m.replicated_root;
        let view = m.view;
        let digest = m.digest;
        let primary_hashed_nonce = m.hashed_nonce;
        let batch = m.batch.clone();
        let ledger = self.ledger.clone();

        inner.execute_tentative_batch(seqno, &batch, move |inner, root| {
            if root != claimed {
                // The primary lied or diverged: undo the tentative
                // execution, withhold the prepare, and push toward a
                // view change.
                warn!(seqno, ours = %root, theirs = %claimed, "tentative execution mismatch");
                let pre = inner
                    .slots
                    .get(&seqno)
                    .map(|s| s.pre_exec_version)
                    .unwrap_or(0);
                inner.rollback_tentative(seqno, pre, &ledger);
                inner.vtimer_running = true;
                inner.vtimer_elapsed = 0;
                return;
            }

            let slot = inner.slots.entry(seqno).or_default();
            slot.pre_prepare = Some(m.clone());
            slot.executed = true;
            slot.prepares.insert(node_id);
            let end_version = slot.end_version;

            debug!(seqno, "pre-prepare accepted, sending prepare");
            inner.broadcast(node_id, Message::Prepare(Prepare { view, seqno, digest }));
            // The batch is now in flight: its failure to commit forces
            // a view change.
            inner.start_vtimer_if_request_waiting();

            // Record the primary's root and nonce commitment; our own
            // evidence follows once the closure returns.
            let txid = TxId::new(view, end_version);
            inner
                .progress
                .record_primary(txid, from, claimed, primary_hashed_nonce);
        });
        let txid = inner
            .slots
            .get(&seqno)
            .filter(|s| s.executed)
            .map(|s| TxId::new(view, s.end_version));
        if let Some(txid) = txid {
            self.emit_own_evidence(inner, txid);
        }
        self.try_advance(inner, seqno);
    }

    fn handle_prepare(&self, inner: &mut BftInner, from: NodeId, m: Prepare) {
        if !inner.in_wv(m.view, m.seqno) {
            return;
        }
        {
            let slot = inner.slots.entry(m.seqno).or_default();
            if let Some(pp) = &slot.pre_prepare {
                if pp.digest != m.digest {
                    warn!(seqno = m.seqno, from, "prepare digest mismatch");
                    return;
                }
            }
            slot.prepares.insert(from);
        }
        self.try_advance(inner, m.seqno);
    }

    fn handle_commit(&self, inner: &mut BftInner, from: NodeId, m: CommitMsg) {
        if !inner.in_wv(m.view, m.seqno) {
            return;
        }
        inner.slots.entry(m.seqno).or_default().commits.insert(from);
        self.try_advance(inner, m.seqno);
    }

    /// Drive a slot through prepared → committed → executed as
    /// certificates complete.
    fn try_advance(&self, inner: &mut BftInner, seqno: SeqNo) {
        let quorum = 2 * inner.f() + 1;
        let node_id = self.node_id;

        // prepared = pre-prepare + 2f matching prepares.
        let send_commit = {
            let Some(slot) = inner.slots.get_mut(&seqno) else {
                return;
            };
            if slot.pre_prepare.is_none() || !slot.executed {
                return;
            }
            if !slot.commit_sent && slot.prepares.len() >= quorum {
                slot.commit_sent = true;
                slot.commits.insert(node_id);
                true
            } else {
                false
            }
        };
        if send_commit {
            let view = inner.view;
            debug!(seqno, "prepared certificate complete, sending commit");
            inner.broadcast(node_id, Message::Commit(CommitMsg { view, seqno }));
        }

        // commit certificate = 2f + 1 commits, applied in order.
        let commit_now = {
            let Some(slot) = inner.slots.get(&seqno) else {
                return;
            };
            !slot.globally_committed
                && slot.commit_sent
                && slot.commits.len() >= quorum
                && seqno == inner.last_gb_committed + 1
        };
        if commit_now {
            self.global_commit(inner, seqno);
            // The certificate for the next slot may already be full.
            self.try_advance(inner, seqno + 1);
        }
    }

    // ------------------------------------------------------------------
    // Commit evidence: signed responses, acks, nonce reveal
    // ------------------------------------------------------------------

    /// Sign the root we computed for this batch, commit to a nonce, and
    /// broadcast both. Every executed batch runs this, primary and
    /// backups alike.
    fn emit_own_evidence(&self, inner: &mut BftInner, txid: TxId) {
        let hashed_nonce = inner.progress.get_my_hashed_nonce(txid);
        let (_, sig) = inner.history.sign_root();

        let response = SignedAppendEntriesResponse {
            term: txid.term,
            last_log_idx: txid.version,
            hashed_nonce,
            sig,
        };
        inner.broadcast(self.node_id, Message::SignedAppendEntriesResponse(response));

        let node_count = inner.nodes.len();
        let result = inner
            .progress
            .add_signature(txid, self.node_id, sig, hashed_nonce, node_count);
        self.follow_up_evidence(inner, txid, result);
    }

    fn handle_signed_response(
        &self,
        inner: &mut BftInner,
        from: NodeId,
        m: SignedAppendEntriesResponse,
    ) {
        if !inner.nodes.contains(&from) {
            warn!(from, "signed response from unknown node");
            return;
        }
        let txid = TxId::new(m.term, m.last_log_idx);
        let node_count = inner.nodes.len();
        let result = inner
            .progress
            .add_signature(txid, from, m.sig, m.hashed_nonce, node_count);
        self.follow_up_evidence(inner, txid, result);
    }

    fn handle_signature_ack(&self, inner: &mut BftInner, from: NodeId, m: SignaturesReceivedAck) {
        if !inner.nodes.contains(&from) {
            warn!(from, "signature ack from unknown node");
            return;
        }
        let txid = TxId::new(m.term, m.idx);
        let node_count = inner.nodes.len();
        let result = inner.progress.add_signature_ack(txid, from, node_count);
        self.follow_up_evidence(inner, txid, result);
    }

    fn handle_nonce_reveal(&self, inner: &mut BftInner, from: NodeId, m: NonceRevealMsg) {
        if !inner.nodes.contains(&from) {
            warn!(from, "nonce reveal from unknown node");
            return;
        }
        let txid = TxId::new(m.term, m.idx);
        let node_count = inner.nodes.len();
        inner.progress.add_nonce_reveal(txid, m.nonce, from, node_count);
        self.after_nonce_progress(inner, txid);
    }

    /// Run the protocol step a tracker result asks for, feeding our own
    /// contribution back in.
    fn follow_up_evidence(&self, inner: &mut BftInner, txid: TxId, result: TrackerResult) {
        match result {
            TrackerResult::Ok | TrackerResult::Fail => {}
            TrackerResult::SendSigAck => {
                let ack = SignaturesReceivedAck {
                    term: txid.term,
                    idx: txid.version,
                };
                inner.broadcast(self.node_id, Message::SignaturesReceivedAck(ack));
                self.maybe_enqueue_sig_record(inner, txid);

                let node_count = inner.nodes.len();
                let next = inner.progress.add_signature_ack(txid, self.node_id, node_count);
                self.follow_up_evidence(inner, txid, next);
            }
            TrackerResult::SendReplyAndNonce => {
                let nonce = inner.progress.get_my_nonce(txid);
                let reveal = NonceRevealMsg {
                    term: txid.term,
                    idx: txid.version,
                    nonce,
                };
                inner.broadcast(self.node_id, Message::NonceReveal(reveal));
                let node_count = inner.nodes.len();
                inner.progress.add_nonce_reveal(txid, nonce, self.node_id, node_count);
                self.after_nonce_progress(inner, txid);
            }
        }
    }

    fn after_nonce_progress(&self, inner: &mut BftInner, txid: TxId) {
        self.advance_final_watermark(inner);
        self.maybe_enqueue_nonce_record(inner, txid);
    }

    /// The final commit watermark: the highest version with both a
    /// commit certificate and a full nonce certificate. Only here does
    /// the KV compact.
    fn advance_final_watermark(&self, inner: &mut BftInner) {
        let watermark = inner
            .progress
            .highest_committed_nonce()
            .min(inner.last_gb_version);
        if watermark <= inner.final_committed_version {
            return;
        }
        debug!(watermark, "final commit watermark advanced");
        inner.final_committed_version = watermark;
        inner.store.compact(watermark);
        inner.snapshotter.compact(watermark);
        inner.progress.compact(watermark);
        // Finalised batches need no further record bookkeeping.
        inner.batch_kinds.retain(|v, _| *v >= watermark);
        inner.sig_records_emitted.retain(|v| *v >= watermark);
        inner.nonce_records_emitted.retain(|v| *v >= watermark);
    }

    /// On the primary, replicate the aggregated signatures for a client
    /// batch through the ordering path, so every replica applies the
    /// record identically. Internal batches never spawn records, which
    /// bounds the record traffic.
    fn maybe_enqueue_sig_record(&self, inner: &mut BftInner, txid: TxId) {
        if inner.primary(inner.view) != self.node_id
            || inner.batch_kinds.get(&txid.version) != Some(&true)
            || inner.sig_records_emitted.contains(&txid.version)
        {
            return;
        }
        let Some(record) = inner.progress.backup_signatures_record(txid) else {
            return;
        };
        inner.sig_records_emitted.insert(txid.version);
        self.enqueue_internal_request(inner, maps::BACKUP_SIGNATURES, record.encode());
    }

    fn maybe_enqueue_nonce_record(&self, inner: &mut BftInner, txid: TxId) {
        if inner.primary(inner.view) != self.node_id
            || inner.batch_kinds.get(&txid.version) != Some(&true)
            || inner.nonce_records_emitted.contains(&txid.version)
        {
            return;
        }
        let Some(record) = inner.progress.revealed_nonces_record(txid) else {
            return;
        };
        inner.nonce_records_emitted.insert(txid.version);
        self.enqueue_internal_request(inner, maps::NONCES, record.encode());
    }

    fn enqueue_internal_request(&self, inner: &mut BftInner, map: &str, value: Vec<u8>) {
        inner.next_internal_request += 1;
        let request_id =
            INTERNAL_REQUEST_BASE | (self.node_id << 32) | inner.next_internal_request;
        let request = Request {
            request_id,
            payload: KvRequest {
                map: map.to_string(),
                key: b"0".to_vec(),
                value: Some(value),
            }
            .encode(),
        };
        debug!(request_id, map, "replicating evidence record");
        inner.request_queue.push_back(request);
        if inner.primary(inner.view) == self.node_id {
            self.send_pre_prepare(inner);
        }
    }

    /// Ordered execution becomes permanent: the batch's KV writes are
    /// globally committed, the ledger commits, and replies release.
    fn global_commit(&self, inner: &mut BftInner, seqno: SeqNo) {
        let Some(slot) = inner.slots.get_mut(&seqno) else {
            return;
        };
        slot.globally_committed = true;
        let end_version = slot.end_version;
        let request_ids = slot
            .pre_prepare
            .as_ref()
            .map(|pp| request_ids_in(&pp.batch))
            .unwrap_or_default();

        inner.last_gb_committed = seqno;
        inner.last_gb_version = end_version;
        info!(seqno, end_version, "globally committed");

        self.ledger.lock().sink.commit(end_version);
        // KV compaction waits for the nonce certificate; the commit
        // certificate alone does not advance the final watermark.
        self.advance_final_watermark(inner);

        for id in request_ids {
            inner.executed_requests.insert(id);
        }

        // Progress past the waiting request implicitly stops the timer.
        if inner.request_queue.is_empty() && inner.last_gb_committed == inner.last_executed {
            inner.vtimer_running = false;
        }
        inner.vtimer_elapsed = 0;

        // Checkpoint on the interval.
        if seqno % self.checkpoint_interval == 0 {
            let digest = inner.history.replicated_state_root();
            let cp = Checkpoint {
                seqno,
                state_digest: digest,
            };
            inner
                .checkpoints
                .entry(seqno)
                .or_default()
                .entry(digest)
                .or_default()
                .insert(self.node_id);
            inner.broadcast(self.node_id, Message::Checkpoint(cp));
            self.try_stabilise(inner, seqno, digest);
        }
    }

    fn handle_checkpoint(&self, inner: &mut BftInner, from: NodeId, m: Checkpoint) {
        if m.seqno <= inner.last_stable {
            return;
        }
        inner
            .checkpoints
            .entry(m.seqno)
            .or_default()
            .entry(m.state_digest)
            .or_default()
            .insert(from);
        self.try_stabilise(inner, m.seqno, m.state_digest);

        // A quorum of checkpoints above what we've executed means we
        // fell out of the window: fetch state instead of replaying.
        let votes = inner
            .checkpoints
            .get(&m.seqno)
            .and_then(|by_digest| by_digest.get(&m.state_digest))
            .map(|v| v.len())
            .unwrap_or(0);
        if votes >= 2 * inner.f() + 1 && m.seqno > inner.last_executed && !inner.fetching {
            self.start_fetch(inner, from);
        }
    }

    /// f + 1 matching checkpoints stabilise the seqno: logs below it
    /// are truncated and older stable checkpoints discarded.
    fn try_stabilise(&self, inner: &mut BftInner, seqno: SeqNo, digest: Hash) {
        let votes = inner
            .checkpoints
            .get(&seqno)
            .and_then(|by_digest| by_digest.get(&digest))
            .map(|v| v.len())
            .unwrap_or(0);
        if votes < inner.f() + 1 || seqno <= inner.last_stable {
            return;
        }
        if seqno > inner.last_executed {
            // Stable above us; state transfer installs it.
            return;
        }

        info!(seqno, "checkpoint stable");
        inner.last_stable = seqno;
        inner.stable_digest = digest;
        inner.slots = inner.slots.split_off(&(seqno + 1));
        inner.checkpoints = inner.checkpoints.split_off(&(seqno + 1));
    }

    // ------------------------------------------------------------------
    // View change
    // ------------------------------------------------------------------

    fn send_view_change(&self, inner: &mut BftInner) {
        inner.view += 1;
        inner.in_view_change = true;
        let new_view = inner.view;
        info!(new_view, "starting view change");

        let quorum = 2 * inner.f() + 1;
        let prepared: Vec<PreparedProof> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.prepares.len() >= quorum)
            .filter_map(|(seqno, slot)| {
                slot.pre_prepare.as_ref().map(|pp| PreparedProof {
                    seqno: *seqno,
                    view: pp.view,
                    digest: pp.digest,
                })
            })
            .collect();

        let vc = ViewChange {
            new_view,
            last_stable: inner.last_stable,
            last_executed: inner.last_executed,
            stable_digest: inner.stable_digest,
            prepared,
        };

        inner
            .view_changes
            .entry(new_view)
            .or_default()
            .insert(self.node_id, vc.clone());

        inner.broadcast(self.node_id, Message::ViewChange(vc));
        self.try_assemble_new_view(inner, new_view);
    }

    fn handle_view_change(&self, inner: &mut BftInner, from: NodeId, m: ViewChange) {
        if m.new_view <= inner.view && !inner.in_view_change {
            // Stale; tell the sender where we are.
            self.send_status(inner, from);
            return;
        }
        debug!(from, new_view = m.new_view, "view change received");
        let digest = quill_model::crypto::content_hash(&Message::ViewChange(m.clone()).encode(from));
        inner
            .view_changes
            .entry(m.new_view)
            .or_default()
            .insert(from, m.clone());

        // Acknowledge toward the incoming primary.
        let new_primary = inner.primary(m.new_view);
        if new_primary != self.node_id && new_primary != from {
            inner.send(
                self.node_id,
                new_primary,
                Message::ViewChangeAck(ViewChangeAck {
                    view: m.new_view,
                    ack_for: from,
                    digest,
                }),
            );
        }

        // Join the view change once f + 1 replicas demand it.
        let join = !inner.in_view_change
            && m.new_view > inner.view
            && inner.view_changes[&m.new_view].len() >= inner.f() + 1;
        if join {
            inner.view = m.new_view - 1;
            self.send_view_change(inner);
            return;
        }

        self.try_assemble_new_view(inner, m.new_view);
    }

    fn handle_view_change_ack(&self, inner: &mut BftInner, from: NodeId, m: ViewChangeAck) {
        // Book-keeping for the incoming primary; the new-view quorum is
        // counted over the view-change messages themselves.
        inner.vc_acks.entry(m.view).or_default().insert(from);
    }

    /// The primary of the new view gathers 2f + 1 view-changes, fills
    /// `(min, max]` with pre-prepares (null-ops for gaps), and
    /// rebroadcasts.
    fn try_assemble_new_view(&self, inner: &mut BftInner, new_view: View) {
        if inner.primary(new_view) != self.node_id || !inner.in_view_change {
            return;
        }
        let quorum = 2 * inner.f() + 1;
        let Some(vcs) = inner.view_changes.get(&new_view) else {
            return;
        };
        if vcs.len() < quorum {
            return;
        }

        let min = vcs.values().map(|vc| vc.last_stable).max().unwrap_or(0);
        let max = vcs
            .values()
            .flat_map(|vc| vc.prepared.iter().map(|p| p.seqno))
            .chain(std::iter::once(min))
            .max()
            .unwrap_or(min);

        // For every seqno in (min, max]: the prepared pre-prepare with
        // the highest view, or a null-op.
        let mut pre_prepares = Vec::new();
        for seqno in (min + 1)..=max {
            let best: Option<PreparedProof> = vcs
                .values()
                .flat_map(|vc| vc.prepared.iter())
                .filter(|p| p.seqno == seqno)
                .max_by_key(|p| p.view)
                .copied();

            let pp = match best {
                Some(proof) => {
                    // Our own log holds the batch for this digest when
                    // we prepared it; otherwise re-issue a null-op and
                    // let state transfer repair stragglers.
                    match inner
                        .slots
                        .get(&seqno)
                        .and_then(|s| s.pre_prepare.clone())
                        .filter(|pp| pp.digest == proof.digest)
                    {
                        Some(mut pp) => {
                            pp.view = new_view;
                            pp.digest = PrePrepare::compute_digest(
                                new_view,
                                seqno,
                                &pp.batch,
                                &pp.replicated_root,
                            );
                            pp
                        }
                        None => null_op(new_view, seqno),
                    }
                }
                None => null_op(new_view, seqno),
            };
            let encoded = Message::PrePrepare(pp).encode(self.node_id);
            quill_ledger::frame_entry(&mut pre_prepares, &encoded);
        }

        let nv = NewView {
            view: new_view,
            min,
            max,
            pre_prepares,
        };
        info!(new_view, min, max, "assembled new view");
        inner.broadcast(self.node_id, Message::NewView(nv.clone()));

        // Enter the new view ourselves.
        self.enter_new_view(inner, nv);
    }

    fn handle_new_view(&self, inner: &mut BftInner, from: NodeId, m: NewView) {
        if from != inner.primary(m.view) {
            warn!(from, view = m.view, "new-view from wrong primary");
            return;
        }
        if m.view < inner.view && !inner.in_view_change {
            return;
        }
        self.enter_new_view(inner, m);
    }

    /// Roll back to the last globally committed state, adopt the view,
    /// and re-execute the new primary's pre-prepares tentatively,
    /// preparing each on its behalf.
    fn enter_new_view(&self, inner: &mut BftInner, nv: NewView) {
        info!(view = nv.view, "entering new view");

        // Discard tentative execution past the global commit point.
        if inner.last_executed > inner.last_gb_committed {
            let floor = inner.last_gb_version;
            if inner.store.rollback(floor, None).is_ok() {
                let mut ledger = self.ledger.lock();
                ledger.sink.truncate(floor);
                ledger.last_idx = floor;
            }
            inner.last_executed = inner.last_gb_committed;
            inner.progress.rollback(floor);
            inner.batch_kinds.retain(|v, _| *v <= floor);
            inner.sig_records_emitted.retain(|v| *v <= floor);
            inner.nonce_records_emitted.retain(|v| *v <= floor);
        }

        inner.view = nv.view;
        inner.in_view_change = false;
        inner.vtimer_elapsed = 0;
        let next_version = inner.store.current_version() + 1;
        inner.view_history.update(next_version, nv.view);

        // Reset the window above the new-view floor.
        inner.slots = inner.slots.split_off(&(nv.min + 1));
        for slot in inner.slots.values_mut() {
            *slot = Slot::default();
        }
        inner.next_pp_seqno = nv.max.max(inner.last_stable);

        if inner.last_gb_committed < nv.min {
            // We are behind the new view's floor entirely; fetch state
            // before taking part again.
            let primary = inner.primary(nv.view);
            self.start_fetch(inner, primary);
            return;
        }

        // Re-execute the carried pre-prepares in order.
        let mut cursor = FrameCursor::new(&nv.pre_prepares);
        while !cursor.is_empty() {
            let Ok(frame) = cursor.next_entry() else {
                break;
            };
            self.process_message(inner, frame);
        }

        inner.start_vtimer_if_request_waiting();
    }

    // ------------------------------------------------------------------
    // Status and retransmission
    // ------------------------------------------------------------------

    fn send_status(&self, inner: &mut BftInner, to: NodeId) {
        let status = Status {
            view: inner.view,
            last_executed: inner.last_executed,
            last_stable: inner.last_stable,
        };
        inner.send(self.node_id, to, Message::Status(status));
    }

    fn handle_status(&self, inner: &mut BftInner, from: NodeId, m: Status) {
        // Retransmit what the sender is missing.
        if m.last_executed >= inner.last_executed {
            return;
        }
        let missing: Vec<PrePrepare> = inner
            .slots
            .range((m.last_executed + 1)..)
            .filter_map(|(_, slot)| slot.pre_prepare.clone())
            .collect();
        for pp in missing {
            inner.send(self.node_id, from, Message::PrePrepare(pp));
        }
    }

    fn handle_query_stable(&self, inner: &mut BftInner, from: NodeId, m: QueryStable) {
        let reply = ReplyStable {
            last_executed: inner.last_executed,
            last_prepared: inner.next_pp_seqno,
            nonce: m.nonce,
        };
        inner.send(self.node_id, from, Message::ReplyStable(reply));
    }

    fn handle_reply_stable(&self, inner: &mut BftInner, from: NodeId, m: ReplyStable) {
        // Recovery bookkeeping only: a replica well behind the cohort
        // starts a fetch.
        if m.last_executed > inner.last_executed + MAX_OUT && !inner.fetching {
            self.start_fetch(inner, from);
        }
    }

    // ------------------------------------------------------------------
    // State transfer
    // ------------------------------------------------------------------

    /// Falling behind a stable checkpoint: fetch the missing entries
    /// rather than replaying the ordering window. The view-change timer
    /// pauses until the fetched state installs.
    fn start_fetch(&self, inner: &mut BftInner, to: NodeId) {
        info!(last_executed = inner.last_executed, "starting state fetch");
        inner.fetching = true;
        let fetch = Fetch {
            level: 0,
            index: inner.store.current_version(),
            last_executed: inner.last_executed,
        };
        inner.send(self.node_id, to, Message::Fetch(fetch));
    }

    fn handle_fetch(&self, inner: &mut BftInner, from: NodeId, m: Fetch) {
        let from_version = m.index + 1;
        let to_version = inner.store.current_version();
        if to_version < from_version {
            return;
        }
        let entries = {
            let mut ledger = self.ledger.lock();
            ledger.sink.framed_entries(from_version, to_version)
        };
        let Some(entries) = entries else {
            warn!(from_version, to_version, "cannot serve state fetch");
            return;
        };
        inner.send(
            self.node_id,
            from,
            Message::Data(Data {
                from_idx: from_version,
                entries,
            }),
        );
        let meta = MetaDataD {
            last_stable: inner.last_stable,
            level: 0,
            index: to_version,
            digest: inner.history.replicated_state_root(),
        };
        inner.send(self.node_id, from, Message::MetaDataD(meta));
    }

    fn handle_data(&self, inner: &mut BftInner, _from: NodeId, m: Data) {
        if !inner.fetching {
            return;
        }
        let mut cursor = FrameCursor::new(&m.entries);
        while !cursor.is_empty() {
            let entry = match cursor.next_entry() {
                Ok(e) => e.to_vec(),
                Err(e) => {
                    warn!(error = %e, "malformed state transfer data");
                    return;
                }
            };
            match inner.store.deserialise(&entry, false) {
                Ok(outcome) => {
                    let v = inner.store.current_version();
                    {
                        let mut ledger = self.ledger.lock();
                        ledger.sink.put_entry(&entry, true, false);
                        ledger.last_idx = v;
                    }
                    // Replicated evidence records rebuild the tracker.
                    let node_count = inner.nodes.len();
                    match outcome {
                        ApplyOutcome::PassBackupSignature => {
                            let _ = inner.progress.receive_backup_signatures(node_count);
                        }
                        ApplyOutcome::PassNonces => {
                            let _ = inner.progress.receive_nonces(node_count);
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "state transfer entry rejected");
                    return;
                }
            }
        }
    }

    fn handle_meta_data_d(&self, inner: &mut BftInner, _from: NodeId, m: MetaDataD) {
        if !inner.fetching {
            return;
        }
        let root = inner.history.replicated_state_root();
        if root != m.digest {
            warn!(ours = %root, theirs = %m.digest, "fetched state does not match digest");
            return;
        }
        info!(last_stable = m.last_stable, "fetched state installed");
        inner.fetching = false;
        inner.last_executed = m.last_stable;
        inner.last_gb_committed = m.last_stable;
        inner.last_gb_version = inner.store.current_version();
        inner.final_committed_version = inner.last_gb_version;
        inner.last_stable = m.last_stable;
        inner.stable_digest = m.digest;
        inner.next_pp_seqno = inner.next_pp_seqno.max(m.last_stable);
        inner.slots = inner.slots.split_off(&(m.last_stable + 1));
        inner.store.compact(inner.last_gb_version);
        self.ledger.lock().sink.commit(inner.last_gb_version);
        // The view-change timer restarts now that transfer is done.
        inner.vtimer_elapsed = 0;
        inner.start_vtimer_if_request_waiting();
    }
}

/// A null-op pre-prepare fills a gap in a new view.
fn null_op(view: View, seqno: SeqNo) -> PrePrepare {
    PrePrepare {
        view,
        seqno,
        digest: PrePrepare::compute_digest(view, seqno, &[], &Hash::ZERO),
        replicated_root: Hash::ZERO,
        hashed_nonce: Nonce::default(),
        batch: Vec::new(),
    }
}

fn request_ids_in(batch: &[u8]) -> Vec<u64> {
    let mut ids = Vec::new();
    let mut cursor = FrameCursor::new(batch);
    while !cursor.is_empty() {
        let Ok(frame) = cursor.next_entry() else {
            break;
        };
        let mut r = RawReader::new(frame);
        if let Ok(id) = r.read_u64() {
            ids.push(id);
        }
    }
    ids
}

impl BftInner {
    fn f(&self) -> usize {
        self.nodes.len().saturating_sub(1) / 3
    }

    fn primary(&self, view: View) -> NodeId {
        if self.nodes.is_empty() {
            return 0;
        }
        self.nodes[(view % self.nodes.len() as u64) as usize]
    }

    /// Window and view admission for ordering messages.
    fn in_wv(&self, view: View, seqno: SeqNo) -> bool {
        view == self.view && seqno > self.last_stable && seqno <= self.last_stable + MAX_OUT
    }


    fn start_vtimer_if_request_waiting(&mut self) {
        if !self.request_queue.is_empty() || self.last_gb_committed < self.last_executed {
            self.vtimer_running = true;
        }
    }

    fn send(&self, my_id: NodeId, to: NodeId, msg: Message) {
        let frame = msg.encode(my_id);
        if !self.outbound.send(to, &frame) {
            debug!(to, "send refused by channel layer");
        }
    }

    fn broadcast(&self, my_id: NodeId, msg: Message) {
        let frame = msg.encode(my_id);
        for peer in &self.nodes {
            if *peer == my_id {
                continue;
            }
            if !self.outbound.send(*peer, &frame) {
                debug!(peer, "broadcast refused by channel layer");
            }
        }
    }

    /// Run a batch against the KV without globally committing, solely
    /// to compute the replicated-state root. Completion flows through
    /// the continuation; intervening messages queue on `pending_msgs`
    /// and replay when `exec_pending` clears.
    fn execute_tentative_batch(
        &mut self,
        seqno: SeqNo,
        batch: &[u8],
        on_done: impl FnOnce(&mut BftInner, Hash),
    ) {
        self.exec_pending = true;
        let pre_exec_version = self.store.current_version();

        let mut client_batch = false;
        let mut cursor = FrameCursor::new(batch);
        while !cursor.is_empty() {
            let Ok(frame) = cursor.next_entry() else {
                break;
            };
            let mut r = RawReader::new(frame);
            let Ok(request_id) = r.read_u64() else {
                break;
            };
            let Ok(payload) = r.read_bytes() else {
                break;
            };
            client_batch |= request_id < INTERNAL_REQUEST_BASE;
            let reply = self.executor.execute(request_id, payload, &self.store);
            self.replies.insert(request_id, reply);
        }

        let end_version = self.store.current_version();
        let root = self.history.replicated_state_root();

        {
            let slot = self.slots.entry(seqno).or_default();
            slot.pre_exec_version = pre_exec_version;
            slot.end_version = end_version;
        }
        self.batch_kinds.insert(end_version, client_batch);
        self.last_executed = self.last_executed.max(seqno);

        self.exec_pending = false;
        on_done(self, root);
    }

    fn rollback_tentative(
        &mut self,
        seqno: SeqNo,
        to_version: Version,
        ledger: &Arc<Mutex<LedgerState>>,
    ) {
        if self.store.rollback(to_version, None).is_ok() {
            let mut ledger = ledger.lock();
            ledger.sink.truncate(to_version);
            ledger.last_idx = to_version;
        }
        self.slots.remove(&seqno);
        self.last_executed = self.last_executed.min(seqno.saturating_sub(1));
    }
}

// ---------------------------------------------------------------------------
// Store-facing trait impls
// ---------------------------------------------------------------------------

impl ReplicationSink for BftConsensus {
    /// Entries produced by tentative execution: persisted to the ledger
    /// immediately, made firm by the commit certificate. Takes only the
    /// ledger lock, so it is safe to call mid-execution.
    fn replicate(&self, entries: Vec<(Version, Arc<Vec<u8>>, bool)>, _term: Term) -> bool {
        let mut ledger = self.ledger.lock();
        for (version, data, _) in entries {
            ledger.sink.put_entry(&data, true, false);
            ledger.last_idx = version;
        }
        true
    }

    fn view_history_until(&self, version: Version) -> Vec<Version> {
        self.inner.lock().view_history.history_until(version)
    }
}

impl CommitSource for BftConsensus {
    fn signable_txid(&self) -> Option<TxId> {
        let inner = self.inner.lock();
        Some(TxId::new(inner.view, inner.last_gb_version))
    }

    fn signature_nonce(&self, txid: TxId) -> Nonce {
        self.inner.lock().progress.get_my_hashed_nonce(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_op_digest_is_stable() {
        let a = null_op(3, 9);
        let b = null_op(3, 9);
        assert_eq!(a.digest, b.digest);
        assert!(a.batch.is_empty());
    }

    #[test]
    fn request_ids_parse_from_batch() {
        let mut batch = Vec::new();
        for id in [7u64, 9] {
            let mut w = RawWriter::new();
            w.write_u64(id);
            w.write_bytes(b"payload");
            quill_ledger::frame_entry(&mut batch, &w.into_vec());
        }
        assert_eq!(request_ids_in(&batch), vec![7, 9]);
    }
}
