use std::collections::HashMap;
use std::fmt::Debug;
use std::time::{SystemTime, UNIX_EPOCH};

use pro_macro::FromInner;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::message::{Accept, AcceptReply, Decide, Prepare, PrepareReply};

/// Marker trait for the application payload carried through agreement.
/// The engine never interprets the value, it only moves and stores it.
pub trait Value: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// The peer id, an index into the configured endpoint list
#[derive(Debug, Copy, Clone, FromInner, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaId(usize);

/// One slot in the logical log
#[derive(Debug, Copy, Clone, FromInner, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(i64);

/// Round number for one proposer attempt at one slot.
///
/// Ordered by `(nanos, peer)`, so numbers from different peers are always
/// distinct and the comparison is a strict total order. "No round yet" is
/// represented as `Option::None`, which orders below every real number.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pnum {
    nanos: u64,
    peer: usize,
}

/// What this peer knows about one slot
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fate {
    Decided,
    Pending,
    /// Decided long ago and reclaimed; inferred at the query boundary,
    /// never stored.
    Forgotten,
}

/// Per-slot acceptor state
#[derive(Debug, Clone)]
pub(crate) struct Instance<C> {
    pub(crate) state: Fate,
    /// Highest round this acceptor promised not to fall below
    pub(crate) n_p: Option<Pnum>,
    /// Round under which `v_a` was accepted
    pub(crate) n_a: Option<Pnum>,
    pub(crate) v_a: Option<C>,
}

impl<C> Instance<C> {
    fn new() -> Self {
        Self {
            state: Fate::Pending,
            n_p: None,
            n_a: None,
            v_a: None,
        }
    }
}

/// All mutable state of one peer. Lives behind the server's single mutex;
/// every method here assumes the caller holds it.
pub(crate) struct Replica<C> {
    pub(crate) id: ReplicaId,
    pub(crate) peer_cnt: usize,
    /// Sparse map from slot to acceptor state. An absent key at or above
    /// the forget horizon reads as Pending.
    instances: HashMap<Seq, Instance<C>>,
    /// Highest seq each peer has passed to Done, -1 if never. Our own slot
    /// moves on local Done calls, remote slots only on inbound Decides.
    dones: Vec<Seq>,
    /// Last round number handed out, so successive generations are
    /// strictly increasing even within one clock tick
    last_pnum: Option<Pnum>,
}

impl<C> Replica<C>
where
    C: Value,
{
    pub(crate) fn new(id: usize, peer_cnt: usize) -> Self {
        Self {
            id: id.into(),
            peer_cnt,
            instances: HashMap::new(),
            dones: vec![Seq::from(-1); peer_cnt],
            last_pnum: None,
        }
    }

    pub(crate) fn majority(&self) -> usize {
        self.peer_cnt / 2 + 1
    }

    /// Generate a round number strictly greater than any this peer has
    /// generated before, and distinct from every other peer's numbers.
    pub(crate) fn next_pnum(&mut self) -> Pnum {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        let fresh = Pnum {
            nanos,
            peer: *self.id,
        };
        let fresh = match self.last_pnum {
            Some(last) if fresh <= last => Pnum {
                nanos: last.nanos + 1,
                peer: last.peer,
            },
            _ => fresh,
        };
        self.last_pnum = Some(fresh);
        fresh
    }

    /// Phase 1b. Promise not to accept anything below `pnum` if we have
    /// not already promised higher. The reply always carries the accepted
    /// round and value so a proposer can recover earlier choices.
    pub(crate) fn handle_prepare(&mut self, msg: Prepare) -> PrepareReply<C> {
        let ins = self.instances.entry(msg.seq).or_insert_with(Instance::new);
        // round numbers are globally unique, so an equal pnum can only be
        // a replay of this same attempt
        let ok = ins.n_p.map_or(true, |np| msg.pnum >= np);
        if ok {
            ins.n_p = Some(msg.pnum);
        }
        PrepareReply {
            ok,
            accept_pnum: ins.n_a,
            accept_value: ins.v_a.clone(),
        }
    }

    /// Phase 2b. An accept for a slot we were never prepared on must not
    /// bind this acceptor, so it is rejected without creating state.
    pub(crate) fn handle_accept(&mut self, msg: Accept<C>) -> AcceptReply {
        let Some(ins) = self.instances.get_mut(&msg.seq) else {
            return AcceptReply { ok: false };
        };
        let ok = ins.n_p.map_or(true, |np| msg.pnum >= np);
        if ok {
            ins.n_p = Some(msg.pnum);
            ins.n_a = Some(msg.pnum);
            ins.v_a = Some(msg.value);
        }
        AcceptReply { ok }
    }

    /// The sender has a majority's agreement, so the decision is taken as
    /// authoritative and overwrites whatever was here. Also folds in the
    /// sender's piggybacked done-through value.
    pub(crate) fn handle_decide(&mut self, msg: Decide<C>) {
        let ins = self.instances.entry(msg.seq).or_insert_with(Instance::new);
        ins.n_p = Some(msg.pnum);
        ins.n_a = Some(msg.pnum);
        ins.v_a = Some(msg.value);
        ins.state = Fate::Decided;

        let sender = *msg.sender;
        if msg.done > self.dones[sender] {
            self.dones[sender] = msg.done;
        }
    }

    /// The application no longer needs slots at or below `seq`. Takes
    /// effect remotely only once piggybacked on our next Decide.
    pub(crate) fn record_done(&mut self, seq: Seq) {
        let me = *self.id;
        if seq > self.dones[me] {
            self.dones[me] = seq;
        }
    }

    pub(crate) fn done_through(&self) -> Seq {
        self.dones[*self.id]
    }

    /// Highest slot this peer has heard anything about, -1 if none
    pub(crate) fn max_seq(&self) -> Seq {
        self.instances
            .keys()
            .copied()
            .max()
            .unwrap_or_else(|| Seq::from(-1))
    }

    /// One greater than the cluster-wide minimum done-through. Reclaims
    /// every decided slot at or below that minimum on the way: any peer
    /// that could still ask for them has already passed Done through them.
    pub(crate) fn forget_horizon(&mut self) -> Seq {
        let m = self
            .dones
            .iter()
            .copied()
            .min()
            .unwrap_or_else(|| Seq::from(-1));
        self.instances
            .retain(|&seq, ins| seq > m || ins.state != Fate::Decided);
        Seq::from(*m + 1)
    }

    /// Purely local read of one slot
    pub(crate) fn status(&mut self, seq: Seq) -> (Fate, Option<C>) {
        if seq < self.forget_horizon() {
            return (Fate::Forgotten, None);
        }
        match self.instances.get(&seq) {
            None => (Fate::Pending, None),
            Some(ins) => (ins.state, ins.v_a.clone()),
        }
    }
}
