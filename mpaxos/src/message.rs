//! Wire contract between peers. Field meanings are fixed; the encoding is
//! bincode behind a length prefix (see `util`).

use serde::{Deserialize, Serialize};

use crate::types::{Pnum, ReplicaId, Seq};

/// Phase 1a: ask every acceptor to promise round `pnum` for slot `seq`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prepare {
    pub seq: Seq,
    pub pnum: Pnum,
}

/// Phase 1b. Whether the promise was granted, plus whatever this acceptor
/// has already accepted for the slot so the proposer can recover it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareReply<C> {
    pub ok: bool,
    pub accept_pnum: Option<Pnum>,
    pub accept_value: Option<C>,
}

/// Phase 2a: ask every acceptor to accept `value` under round `pnum`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accept<C> {
    pub seq: Seq,
    pub pnum: Pnum,
    pub value: C,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptReply {
    pub ok: bool,
}

/// Dissemination of a chosen value. Carries the sender's done-through
/// value so the garbage-collection horizon can advance without dedicated
/// traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decide<C> {
    pub seq: Seq,
    pub value: C,
    pub pnum: Pnum,
    pub sender: ReplicaId,
    pub done: Seq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecideReply {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request<C> {
    Prepare(Prepare),
    Accept(Accept<C>),
    Decide(Decide<C>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply<C> {
    Prepare(PrepareReply<C>),
    Accept(AcceptReply),
    Decide(DecideReply),
}
