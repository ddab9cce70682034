//! Wire messages
//!
//! Every frame begins with a one-byte tag and the sender's node id,
//! followed by the tag's packed body. Tags have stable numeric values.
//! Fixed-layout messages must consume the frame exactly; variable
//! messages carry length-prefixed sections. A frame whose length
//! disagrees with its tag's declared layout is refused.
//!
//! The channel layer authenticates the whole frame (tag and sender
//! included) as AAD, so nothing here is trusted until the channel
//! check has passed.

use quill_model::codec::{RawReader, RawWriter};
use quill_model::{Hash, Nonce, NodeId, SeqNo, Signature, Term, Version, View};

use crate::ConsensusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgTag {
    // CFT consensus
    AppendEntries = 0,
    AppendEntriesResponse = 1,
    RequestVote = 2,
    RequestVoteResponse = 3,

    // BFT ordering
    Request = 10,
    Reply = 11,
    PrePrepare = 12,
    Prepare = 13,
    Commit = 14,
    Checkpoint = 15,

    // BFT view change
    ViewChange = 20,
    NewView = 21,
    ViewChangeAck = 22,

    // BFT state transfer
    Fetch = 30,
    MetaData = 31,
    MetaDataD = 32,
    Data = 33,
    QueryStable = 34,
    ReplyStable = 35,

    // BFT membership
    NewPrincipal = 40,
    NetworkOpen = 41,
    AppendEntriesState = 42,

    // Commit evidence
    SignedAppendEntriesResponse = 50,
    SignaturesReceivedAck = 51,
    NonceReveal = 52,
    Status = 53,
}

impl MsgTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MsgTag::*;
        Some(match v {
            0 => AppendEntries,
            1 => AppendEntriesResponse,
            2 => RequestVote,
            3 => RequestVoteResponse,
            10 => Request,
            11 => Reply,
            12 => PrePrepare,
            13 => Prepare,
            14 => Commit,
            15 => Checkpoint,
            20 => ViewChange,
            21 => NewView,
            22 => ViewChangeAck,
            30 => Fetch,
            31 => MetaData,
            32 => MetaDataD,
            33 => Data,
            34 => QueryStable,
            35 => ReplyStable,
            40 => NewPrincipal,
            41 => NetworkOpen,
            42 => AppendEntriesState,
            50 => SignedAppendEntriesResponse,
            51 => SignaturesReceivedAck,
            52 => NonceReveal,
            53 => Status,
            _ => return None,
        })
    }
}

/// Common frame header: tag + sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub tag: MsgTag,
    pub from: NodeId,
}

impl MsgHeader {
    fn write(&self, w: &mut RawWriter) {
        w.write_u8(self.tag as u8);
        w.write_u64(self.from);
    }
}

/// Peek at a frame's tag and sender without decoding the body.
pub fn peek_header(data: &[u8]) -> Result<MsgHeader, ConsensusError> {
    let mut r = RawReader::new(data);
    let tag = r.read_u8()?;
    let from = r.read_u64()?;
    let tag = MsgTag::from_u8(tag).ok_or(ConsensusError::UnknownTag(tag))?;
    Ok(MsgHeader { tag, from })
}

// ---------------------------------------------------------------------------
// CFT messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntries {
    pub idx: Version,
    pub prev_idx: Version,
    pub term: Term,
    pub prev_term: Term,
    pub leader_commit_idx: Version,
    pub term_of_idx: Term,
    /// Framed serialised entries for `prev_idx + 1 ..= idx`.
    pub entries: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub last_log_idx: Version,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVote {
    pub term: Term,
    pub last_committable_idx: Version,
    pub term_of_last_committable_idx: Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedAppendEntriesResponse {
    pub term: Term,
    pub last_log_idx: Version,
    pub hashed_nonce: Nonce,
    pub sig: Signature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignaturesReceivedAck {
    pub term: Term,
    pub idx: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceRevealMsg {
    pub term: Term,
    pub idx: Version,
    pub nonce: Nonce,
}

// ---------------------------------------------------------------------------
// BFT ordering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_id: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub view: View,
    pub request_id: u64,
    pub result: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrePrepare {
    pub view: View,
    pub seqno: SeqNo,
    /// Digest over the batch and the replicated-state root.
    pub digest: Hash,
    /// Root after tentatively executing the batch.
    pub replicated_root: Hash,
    pub hashed_nonce: Nonce,
    /// Framed client requests.
    pub batch: Vec<u8>,
}

impl PrePrepare {
    /// The digest a receiver must recompute and match.
    pub fn compute_digest(view: View, seqno: SeqNo, batch: &[u8], replicated_root: &Hash) -> Hash {
        let mut w = RawWriter::with_capacity(batch.len() + 48);
        w.write_u64(view);
        w.write_u64(seqno);
        w.write_bytes(batch);
        w.write_array(replicated_root.as_bytes());
        quill_model::crypto::content_hash(&w.into_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prepare {
    pub view: View,
    pub seqno: SeqNo,
    pub digest: Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitMsg {
    pub view: View,
    pub seqno: SeqNo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub seqno: SeqNo,
    pub state_digest: Hash,
}

// ---------------------------------------------------------------------------
// BFT view change
// ---------------------------------------------------------------------------

/// A prepared certificate carried in a view change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedProof {
    pub seqno: SeqNo,
    pub view: View,
    pub digest: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewChange {
    pub new_view: View,
    pub last_stable: SeqNo,
    pub last_executed: SeqNo,
    pub stable_digest: Hash,
    pub prepared: Vec<PreparedProof>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewView {
    pub view: View,
    pub min: SeqNo,
    pub max: SeqNo,
    /// Framed pre-prepare message bodies for `(min, max]`, null-ops
    /// included.
    pub pre_prepares: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewChangeAck {
    pub view: View,
    /// The node whose view-change this acknowledges.
    pub ack_for: NodeId,
    pub digest: Hash,
}

// ---------------------------------------------------------------------------
// BFT state transfer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fetch {
    pub level: u64,
    pub index: u64,
    pub last_executed: SeqNo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaData {
    pub last_stable: SeqNo,
    pub level: u64,
    pub index: u64,
    pub digests: Vec<Hash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaDataD {
    pub last_stable: SeqNo,
    pub level: u64,
    pub index: u64,
    pub digest: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub from_idx: u64,
    /// Framed serialised entries.
    pub entries: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryStable {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyStable {
    pub last_executed: SeqNo,
    pub last_prepared: SeqNo,
    pub nonce: u64,
}

// ---------------------------------------------------------------------------
// BFT membership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPrincipal {
    pub node_id: NodeId,
    pub hostname: String,
    pub port: String,
    pub public_key: Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkOpen;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesState {
    pub from_idx: u64,
    pub to_idx: u64,
    pub entries: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub view: View,
    pub last_executed: SeqNo,
    pub last_stable: SeqNo,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    Request(Request),
    Reply(Reply),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(CommitMsg),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    NewView(NewView),
    ViewChangeAck(ViewChangeAck),
    Fetch(Fetch),
    MetaData(MetaData),
    MetaDataD(MetaDataD),
    Data(Data),
    QueryStable(QueryStable),
    ReplyStable(ReplyStable),
    NewPrincipal(NewPrincipal),
    NetworkOpen(NetworkOpen),
    AppendEntriesState(AppendEntriesState),
    SignedAppendEntriesResponse(SignedAppendEntriesResponse),
    SignaturesReceivedAck(SignaturesReceivedAck),
    NonceReveal(NonceRevealMsg),
    Status(Status),
}

impl Message {
    pub fn tag(&self) -> MsgTag {
        match self {
            Message::AppendEntries(_) => MsgTag::AppendEntries,
            Message::AppendEntriesResponse(_) => MsgTag::AppendEntriesResponse,
            Message::RequestVote(_) => MsgTag::RequestVote,
            Message::RequestVoteResponse(_) => MsgTag::RequestVoteResponse,
            Message::Request(_) => MsgTag::Request,
            Message::Reply(_) => MsgTag::Reply,
            Message::PrePrepare(_) => MsgTag::PrePrepare,
            Message::Prepare(_) => MsgTag::Prepare,
            Message::Commit(_) => MsgTag::Commit,
            Message::Checkpoint(_) => MsgTag::Checkpoint,
            Message::ViewChange(_) => MsgTag::ViewChange,
            Message::NewView(_) => MsgTag::NewView,
            Message::ViewChangeAck(_) => MsgTag::ViewChangeAck,
            Message::Fetch(_) => MsgTag::Fetch,
            Message::MetaData(_) => MsgTag::MetaData,
            Message::MetaDataD(_) => MsgTag::MetaDataD,
            Message::Data(_) => MsgTag::Data,
            Message::QueryStable(_) => MsgTag::QueryStable,
            Message::ReplyStable(_) => MsgTag::ReplyStable,
            Message::NewPrincipal(_) => MsgTag::NewPrincipal,
            Message::NetworkOpen(_) => MsgTag::NetworkOpen,
            Message::AppendEntriesState(_) => MsgTag::AppendEntriesState,
            Message::SignedAppendEntriesResponse(_) => MsgTag::SignedAppendEntriesResponse,
            Message::SignaturesReceivedAck(_) => MsgTag::SignaturesReceivedAck,
            Message::NonceReveal(_) => MsgTag::NonceReveal,
            Message::Status(_) => MsgTag::Status,
        }
    }

    /// Encode a frame: header then body.
    pub fn encode(&self, from: NodeId) -> Vec<u8> {
        let mut w = RawWriter::new();
        MsgHeader {
            tag: self.tag(),
            from,
        }
        .write(&mut w);

        match self {
            Message::AppendEntries(m) => {
                w.write_u64(m.idx);
                w.write_u64(m.prev_idx);
                w.write_u64(m.term);
                w.write_u64(m.prev_term);
                w.write_u64(m.leader_commit_idx);
                w.write_u64(m.term_of_idx);
                w.write_array(&m.entries);
            }
            Message::AppendEntriesResponse(m) => {
                w.write_u64(m.term);
                w.write_u64(m.last_log_idx);
                w.write_bool(m.success);
            }
            Message::RequestVote(m) => {
                w.write_u64(m.term);
                w.write_u64(m.last_committable_idx);
                w.write_u64(m.term_of_last_committable_idx);
            }
            Message::RequestVoteResponse(m) => {
                w.write_u64(m.term);
                w.write_bool(m.vote_granted);
            }
            Message::Request(m) => {
                w.write_u64(m.request_id);
                w.write_bytes(&m.payload);
            }
            Message::Reply(m) => {
                w.write_u64(m.view);
                w.write_u64(m.request_id);
                w.write_bytes(&m.result);
            }
            Message::PrePrepare(m) => {
                w.write_u64(m.view);
                w.write_u64(m.seqno);
                w.write_array(m.digest.as_bytes());
                w.write_array(m.replicated_root.as_bytes());
                w.write_array(m.hashed_nonce.as_bytes());
                w.write_bytes(&m.batch);
            }
            Message::Prepare(m) => {
                w.write_u64(m.view);
                w.write_u64(m.seqno);
                w.write_array(m.digest.as_bytes());
            }
            Message::Commit(m) => {
                w.write_u64(m.view);
                w.write_u64(m.seqno);
            }
            Message::Checkpoint(m) => {
                w.write_u64(m.seqno);
                w.write_array(m.state_digest.as_bytes());
            }
            Message::ViewChange(m) => {
                w.write_u64(m.new_view);
                w.write_u64(m.last_stable);
                w.write_u64(m.last_executed);
                w.write_array(m.stable_digest.as_bytes());
                w.write_u64(m.prepared.len() as u64);
                for p in &m.prepared {
                    w.write_u64(p.seqno);
                    w.write_u64(p.view);
                    w.write_array(p.digest.as_bytes());
                }
            }
            Message::NewView(m) => {
                w.write_u64(m.view);
                w.write_u64(m.min);
                w.write_u64(m.max);
                w.write_bytes(&m.pre_prepares);
            }
            Message::ViewChangeAck(m) => {
                w.write_u64(m.view);
                w.write_u64(m.ack_for);
                w.write_array(m.digest.as_bytes());
            }
            Message::Fetch(m) => {
                w.write_u64(m.level);
                w.write_u64(m.index);
                w.write_u64(m.last_executed);
            }
            Message::MetaData(m) => {
                w.write_u64(m.last_stable);
                w.write_u64(m.level);
                w.write_u64(m.index);
                w.write_u64(m.digests.len() as u64);
                for d in &m.digests {
                    w.write_array(d.as_bytes());
                }
            }
            Message::MetaDataD(m) => {
                w.write_u64(m.last_stable);
                w.write_u64(m.level);
                w.write_u64(m.index);
                w.write_array(m.digest.as_bytes());
            }
            Message::Data(m) => {
                w.write_u64(m.from_idx);
                w.write_array(&m.entries);
            }
            Message::QueryStable(m) => {
                w.write_u64(m.nonce);
            }
            Message::ReplyStable(m) => {
                w.write_u64(m.last_executed);
                w.write_u64(m.last_prepared);
                w.write_u64(m.nonce);
            }
            Message::NewPrincipal(m) => {
                w.write_u64(m.node_id);
                w.write_bytes(m.hostname.as_bytes());
                w.write_bytes(m.port.as_bytes());
                w.write_array(m.public_key.as_bytes());
            }
            Message::NetworkOpen(_) => {}
            Message::AppendEntriesState(m) => {
                w.write_u64(m.from_idx);
                w.write_u64(m.to_idx);
                w.write_array(&m.entries);
            }
            Message::SignedAppendEntriesResponse(m) => {
                w.write_u64(m.term);
                w.write_u64(m.last_log_idx);
                w.write_array(m.hashed_nonce.as_bytes());
                w.write_array(m.sig.as_bytes());
            }
            Message::SignaturesReceivedAck(m) => {
                w.write_u64(m.term);
                w.write_u64(m.idx);
            }
            Message::NonceReveal(m) => {
                w.write_u64(m.term);
                w.write_u64(m.idx);
                w.write_array(m.nonce.as_bytes());
            }
            Message::Status(m) => {
                w.write_u64(m.view);
                w.write_u64(m.last_executed);
                w.write_u64(m.last_stable);
            }
        }
        w.into_vec()
    }

    /// Decode a frame. Fixed-layout tags must consume the frame
    /// exactly; trailing or missing bytes refuse the message.
    pub fn decode(data: &[u8]) -> Result<(MsgHeader, Message), ConsensusError> {
        let mut r = RawReader::new(data);
        let tag_byte = r.read_u8()?;
        let from = r.read_u64()?;
        let tag = MsgTag::from_u8(tag_byte).ok_or(ConsensusError::UnknownTag(tag_byte))?;
        let header = MsgHeader { tag, from };

        let exact = |r: RawReader<'_>| -> Result<(), ConsensusError> {
            r.finish().map_err(|_| ConsensusError::BadLength {
                tag,
                got: data.len(),
            })
        };

        let msg = match tag {
            MsgTag::AppendEntries => {
                let m = AppendEntries {
                    idx: r.read_u64()?,
                    prev_idx: r.read_u64()?,
                    term: r.read_u64()?,
                    prev_term: r.read_u64()?,
                    leader_commit_idx: r.read_u64()?,
                    term_of_idx: r.read_u64()?,
                    entries: {
                        let n = r.remaining();
                        let mut out = vec![0u8; n];
                        out.copy_from_slice(&data[data.len() - n..]);
                        out
                    },
                };
                return Ok((header, Message::AppendEntries(m)));
            }
            MsgTag::AppendEntriesResponse => {
                let m = AppendEntriesResponse {
                    term: r.read_u64()?,
                    last_log_idx: r.read_u64()?,
                    success: r.read_bool()?,
                };
                exact(r)?;
                Message::AppendEntriesResponse(m)
            }
            MsgTag::RequestVote => {
                let m = RequestVote {
                    term: r.read_u64()?,
                    last_committable_idx: r.read_u64()?,
                    term_of_last_committable_idx: r.read_u64()?,
                };
                exact(r)?;
                Message::RequestVote(m)
            }
            MsgTag::RequestVoteResponse => {
                let m = RequestVoteResponse {
                    term: r.read_u64()?,
                    vote_granted: r.read_bool()?,
                };
                exact(r)?;
                Message::RequestVoteResponse(m)
            }
            MsgTag::Request => {
                let m = Request {
                    request_id: r.read_u64()?,
                    payload: r.read_bytes()?.to_vec(),
                };
                exact(r)?;
                Message::Request(m)
            }
            MsgTag::Reply => {
                let m = Reply {
                    view: r.read_u64()?,
                    request_id: r.read_u64()?,
                    result: r.read_bytes()?.to_vec(),
                };
                exact(r)?;
                Message::Reply(m)
            }
            MsgTag::PrePrepare => {
                let m = PrePrepare {
                    view: r.read_u64()?,
                    seqno: r.read_u64()?,
                    digest: Hash::from(r.read_array::<32>()?),
                    replicated_root: Hash::from(r.read_array::<32>()?),
                    hashed_nonce: Nonce::from(r.read_array::<32>()?),
                    batch: r.read_bytes()?.to_vec(),
                };
                exact(r)?;
                Message::PrePrepare(m)
            }
            MsgTag::Prepare => {
                let m = Prepare {
                    view: r.read_u64()?,
                    seqno: r.read_u64()?,
                    digest: Hash::from(r.read_array::<32>()?),
                };
                exact(r)?;
                Message::Prepare(m)
            }
            MsgTag::Commit => {
                let m = CommitMsg {
                    view: r.read_u64()?,
                    seqno: r.read_u64()?,
                };
                exact(r)?;
                Message::Commit(m)
            }
            MsgTag::Checkpoint => {
                let m = Checkpoint {
                    seqno: r.read_u64()?,
                    state_digest: Hash::from(r.read_array::<32>()?),
                };
                exact(r)?;
                Message::Checkpoint(m)
            }
            MsgTag::ViewChange => {
                let new_view = r.read_u64()?;
                let last_stable = r.read_u64()?;
                let last_executed = r.read_u64()?;
                let stable_digest = Hash::from(r.read_array::<32>()?);
                let n = r.read_u64()?;
                let mut prepared = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    prepared.push(PreparedProof {
                        seqno: r.read_u64()?,
                        view: r.read_u64()?,
                        digest: Hash::from(r.read_array::<32>()?),
                    });
                }
                exact(r)?;
                Message::ViewChange(ViewChange {
                    new_view,
                    last_stable,
                    last_executed,
                    stable_digest,
                    prepared,
                })
            }
            MsgTag::NewView => {
                let m = NewView {
                    view: r.read_u64()?,
                    min: r.read_u64()?,
                    max: r.read_u64()?,
                    pre_prepares: r.read_bytes()?.to_vec(),
                };
                exact(r)?;
                Message::NewView(m)
            }
            MsgTag::ViewChangeAck => {
                let m = ViewChangeAck {
                    view: r.read_u64()?,
                    ack_for: r.read_u64()?,
                    digest: Hash::from(r.read_array::<32>()?),
                };
                exact(r)?;
                Message::ViewChangeAck(m)
            }
            MsgTag::Fetch => {
                let m = Fetch {
                    level: r.read_u64()?,
                    index: r.read_u64()?,
                    last_executed: r.read_u64()?,
                };
                exact(r)?;
                Message::Fetch(m)
            }
            MsgTag::MetaData => {
                let last_stable = r.read_u64()?;
                let level = r.read_u64()?;
                let index = r.read_u64()?;
                let n = r.read_u64()?;
                let mut digests = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    digests.push(Hash::from(r.read_array::<32>()?));
                }
                exact(r)?;
                Message::MetaData(MetaData {
                    last_stable,
                    level,
                    index,
                    digests,
                })
            }
            MsgTag::MetaDataD => {
                let m = MetaDataD {
                    last_stable: r.read_u64()?,
                    level: r.read_u64()?,
                    index: r.read_u64()?,
                    digest: Hash::from(r.read_array::<32>()?),
                };
                exact(r)?;
                Message::MetaDataD(m)
            }
            MsgTag::Data => {
                let from_idx = r.read_u64()?;
                let n = r.remaining();
                let entries = data[data.len() - n..].to_vec();
                return Ok((header, Message::Data(Data { from_idx, entries })));
            }
            MsgTag::QueryStable => {
                let m = QueryStable {
                    nonce: r.read_u64()?,
                };
                exact(r)?;
                Message::QueryStable(m)
            }
            MsgTag::ReplyStable => {
                let m = ReplyStable {
                    last_executed: r.read_u64()?,
                    last_prepared: r.read_u64()?,
                    nonce: r.read_u64()?,
                };
                exact(r)?;
                Message::ReplyStable(m)
            }
            MsgTag::NewPrincipal => {
                let m = NewPrincipal {
                    node_id: r.read_u64()?,
                    hostname: String::from_utf8_lossy(r.read_bytes()?).into_owned(),
                    port: String::from_utf8_lossy(r.read_bytes()?).into_owned(),
                    public_key: Hash::from(r.read_array::<32>()?),
                };
                exact(r)?;
                Message::NewPrincipal(m)
            }
            MsgTag::NetworkOpen => {
                exact(r)?;
                Message::NetworkOpen(NetworkOpen)
            }
            MsgTag::AppendEntriesState => {
                let from_idx = r.read_u64()?;
                let to_idx = r.read_u64()?;
                let n = r.remaining();
                let entries = data[data.len() - n..].to_vec();
                return Ok((
                    header,
                    Message::AppendEntriesState(AppendEntriesState {
                        from_idx,
                        to_idx,
                        entries,
                    }),
                ));
            }
            MsgTag::SignedAppendEntriesResponse => {
                let m = SignedAppendEntriesResponse {
                    term: r.read_u64()?,
                    last_log_idx: r.read_u64()?,
                    hashed_nonce: Nonce::from(r.read_array::<32>()?),
                    sig: Signature::from(r.read_array::<64>()?),
                };
                exact(r)?;
                Message::SignedAppendEntriesResponse(m)
            }
            MsgTag::SignaturesReceivedAck => {
                let m = SignaturesReceivedAck {
                    term: r.read_u64()?,
                    idx: r.read_u64()?,
                };
                exact(r)?;
                Message::SignaturesReceivedAck(m)
            }
            MsgTag::NonceReveal => {
                let m = NonceRevealMsg {
                    term: r.read_u64()?,
                    idx: r.read_u64()?,
                    nonce: Nonce::from(r.read_array::<32>()?),
                };
                exact(r)?;
                Message::NonceReveal(m)
            }
            MsgTag::Status => {
                let m = Status {
                    view: r.read_u64()?,
                    last_executed: r.read_u64()?,
                    last_stable: r.read_u64()?,
                };
                exact(r)?;
                Message::Status(m)
            }
        };

        Ok((header, msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let frame = msg.encode(7);
        let (header, back) = Message::decode(&frame).unwrap();
        assert_eq!(header.from, 7);
        assert_eq!(header.tag, msg.tag());
        assert_eq!(back, msg);
    }

    #[test]
    fn cft_roundtrips() {
        roundtrip(Message::AppendEntries(AppendEntries {
            idx: 9,
            prev_idx: 6,
            term: 2,
            prev_term: 1,
            leader_commit_idx: 5,
            term_of_idx: 2,
            entries: vec![1, 2, 3],
        }));
        roundtrip(Message::AppendEntriesResponse(AppendEntriesResponse {
            term: 2,
            last_log_idx: 9,
            success: true,
        }));
        roundtrip(Message::RequestVote(RequestVote {
            term: 3,
            last_committable_idx: 8,
            term_of_last_committable_idx: 2,
        }));
        roundtrip(Message::RequestVoteResponse(RequestVoteResponse {
            term: 3,
            vote_granted: false,
        }));
    }

    #[test]
    fn bft_roundtrips() {
        roundtrip(Message::PrePrepare(PrePrepare {
            view: 1,
            seqno: 7,
            digest: Hash::from([1u8; 32]),
            replicated_root: Hash::from([2u8; 32]),
            hashed_nonce: Nonce::from([3u8; 32]),
            batch: vec![9, 9],
        }));
        roundtrip(Message::Prepare(Prepare {
            view: 1,
            seqno: 7,
            digest: Hash::from([1u8; 32]),
        }));
        roundtrip(Message::Commit(CommitMsg { view: 1, seqno: 7 }));
        roundtrip(Message::Checkpoint(Checkpoint {
            seqno: 100,
            state_digest: Hash::from([5u8; 32]),
        }));
        roundtrip(Message::ViewChange(ViewChange {
            new_view: 2,
            last_stable: 90,
            last_executed: 95,
            stable_digest: Hash::from([6u8; 32]),
            prepared: vec![PreparedProof {
                seqno: 95,
                view: 1,
                digest: Hash::from([7u8; 32]),
            }],
        }));
        roundtrip(Message::NewView(NewView {
            view: 2,
            min: 90,
            max: 96,
            pre_prepares: vec![4, 4, 4],
        }));
        roundtrip(Message::Status(Status {
            view: 2,
            last_executed: 95,
            last_stable: 90,
        }));
    }

    #[test]
    fn evidence_roundtrips() {
        roundtrip(Message::SignedAppendEntriesResponse(
            SignedAppendEntriesResponse {
                term: 2,
                last_log_idx: 10,
                hashed_nonce: Nonce::from([8u8; 32]),
                sig: Signature::from([9u8; 64]),
            },
        ));
        roundtrip(Message::SignaturesReceivedAck(SignaturesReceivedAck {
            term: 2,
            idx: 10,
        }));
        roundtrip(Message::NonceReveal(NonceRevealMsg {
            term: 2,
            idx: 10,
            nonce: Nonce::from([1u8; 32]),
        }));
    }

    #[test]
    fn fixed_layout_is_exact() {
        let mut frame = Message::Prepare(Prepare {
            view: 1,
            seqno: 2,
            digest: Hash::ZERO,
        })
        .encode(1);

        // Trailing byte refuses the message.
        frame.push(0);
        assert!(matches!(
            Message::decode(&frame),
            Err(ConsensusError::BadLength { .. })
        ));

        // Truncation refuses it too.
        frame.truncate(frame.len() - 10);
        assert!(Message::decode(&frame).is_err());
    }

    #[test]
    fn unknown_tag_refused() {
        let mut w = RawWriter::new();
        w.write_u8(99);
        w.write_u64(1);
        assert!(matches!(
            Message::decode(&w.into_vec()),
            Err(ConsensusError::UnknownTag(99))
        ));
    }

    #[test]
    fn digest_binds_batch_and_root() {
        let root = Hash::from([1u8; 32]);
        let a = PrePrepare::compute_digest(1, 5, b"batch", &root);
        let b = PrePrepare::compute_digest(1, 5, b"other", &root);
        let c = PrePrepare::compute_digest(1, 5, b"batch", &Hash::from([2u8; 32]));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
