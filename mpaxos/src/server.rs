use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use log::{debug, trace, warn};
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::Configure;
use crate::error::RpcError;
use crate::message::{Accept, AcceptReply, Decide, DecideReply, Prepare, Reply, Request};
use crate::types::{Fate, Pnum, Replica, Seq, Value};
use crate::util;

/// Chance that an unreliable peer discards an inbound request outright
const DROP_REQUEST_RATE: f64 = 0.1;
/// Chance that an unreliable peer processes a request but discards the reply
const DROP_REPLY_RATE: f64 = 0.1;

/// One Paxos peer, embedded in an application.
///
/// The handle is cheap to share; all agreement work happens on background
/// tasks. `start` kicks off agreement and returns immediately, the
/// application polls `status` to observe the outcome.
pub struct Peer<C>
where
    C: Value,
{
    inner: Arc<InnerPeer<C>>,
    serve_handle: JoinHandle<()>,
}

impl<C> Peer<C>
where
    C: Value,
{
    /// Bind the endpoint at `peer[index]`, start the accept loop and
    /// return the application handle.
    pub async fn new(conf: Configure) -> Result<Self, RpcError> {
        let inner = Arc::new(InnerPeer::new(conf));
        let rpc_server = RpcServer::new(inner.clone()).await?;
        let serve_handle = tokio::spawn(async move {
            rpc_server.serve().await;
        });
        Ok(Self {
            inner,
            serve_handle,
        })
    }

    /// Start agreement on slot `seq` with proposed value `value`, then
    /// return without waiting for the outcome. A seq below the forget
    /// horizon is permanently settled and the call is ignored.
    pub async fn start(&self, seq: i64, value: C) {
        let seq = Seq::from(seq);
        {
            let mut replica = self.inner.replica.lock().await;
            if seq < replica.forget_horizon() {
                return;
            }
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.propose(seq, value).await;
        });
    }

    /// What this peer knows about slot `seq`. Local state only, no
    /// messages are sent.
    pub async fn status(&self, seq: i64) -> (Fate, Option<C>) {
        self.inner.replica.lock().await.status(seq.into())
    }

    /// The application is done with every slot at or below `seq`. The new
    /// mark reaches other peers piggybacked on our next outbound Decide.
    pub async fn done(&self, seq: i64) {
        self.inner.replica.lock().await.record_done(seq.into());
    }

    /// Highest slot this peer has heard anything about, or -1
    pub async fn max(&self) -> i64 {
        *self.inner.replica.lock().await.max_seq()
    }

    /// One greater than the cluster-wide done-through minimum. Slots
    /// below it are reclaimed and read as Forgotten from now on.
    pub async fn min(&self) -> i64 {
        *self.inner.replica.lock().await.forget_horizon()
    }

    pub fn me(&self) -> usize {
        self.inner.conf.index
    }

    /// Shut the peer down. In-flight proposers notice the flag and stop;
    /// nothing is cleaned up beyond that.
    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::Relaxed);
        self.serve_handle.abort();
    }

    /// Test hook: make the listener drop requests and replies at random
    pub fn set_unreliable(&self, unreliable: bool) {
        self.inner.unreliable.store(unreliable, Ordering::Relaxed);
    }

    /// Test hook: number of inbound RPCs this peer has processed
    pub fn rpc_count(&self) -> u64 {
        self.inner.rpc_count.load(Ordering::Relaxed)
    }
}

pub(crate) struct InnerPeer<C>
where
    C: Value,
{
    conf: Configure,
    replica: Mutex<Replica<C>>,
    dead: AtomicBool,
    unreliable: AtomicBool,
    rpc_count: AtomicU64,
}

impl<C> InnerPeer<C>
where
    C: Value,
{
    fn new(conf: Configure) -> Self {
        let replica = Replica::new(conf.index, conf.peer_cnt);
        Self {
            conf,
            replica: Mutex::new(replica),
            dead: AtomicBool::new(false),
            unreliable: AtomicBool::new(false),
            rpc_count: AtomicU64::new(0),
        }
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    fn is_unreliable(&self) -> bool {
        self.unreliable.load(Ordering::Relaxed)
    }

    /// Acceptor dispatch, shared by the listener and the proposer's
    /// self-call. Each arm takes the peer mutex for its whole duration, so
    /// the caller must not hold it.
    pub(crate) async fn handle_request(&self, request: Request<C>) -> Reply<C> {
        match request {
            Request::Prepare(p) => {
                trace!("peer {} handle prepare seq {}", self.conf.index, *p.seq);
                Reply::Prepare(self.replica.lock().await.handle_prepare(p))
            }
            Request::Accept(a) => {
                trace!("peer {} handle accept seq {}", self.conf.index, *a.seq);
                Reply::Accept(self.replica.lock().await.handle_accept(a))
            }
            Request::Decide(d) => {
                trace!("peer {} handle decide seq {}", self.conf.index, *d.seq);
                self.replica.lock().await.handle_decide(d);
                Reply::Decide(DecideReply {})
            }
        }
    }

    /// Send `request` to every peer at once. The local peer is reached by
    /// a direct handler call instead of the loopback; a remote peer that
    /// does not answer within the RPC budget shows up as None.
    async fn broadcast(&self, request: Request<C>) -> Vec<Option<Reply<C>>> {
        let me = self.conf.index;
        stream::iter(0..self.conf.peer_cnt)
            .map(|i| {
                let request = request.clone();
                async move {
                    if i == me {
                        Some(self.handle_request(request).await)
                    } else {
                        util::call(&self.conf[i], &request).await
                    }
                }
            })
            .buffer_unordered(self.conf.peer_cnt)
            .collect()
            .await
    }

    /// Drive slot `seq` to a decision. Loops through prepare/accept
    /// rounds under ever-fresh round numbers until either we push a value
    /// through a majority or somebody else's decision lands here.
    pub(crate) async fn propose(self: Arc<Self>, seq: Seq, value: C) {
        let me = self.conf.index;
        debug!("peer {} proposing seq {}", me, *seq);

        loop {
            if self.is_dead() {
                return;
            }
            let (pnum, majority) = {
                let mut replica = self.replica.lock().await;
                if replica.status(seq).0 == Fate::Decided {
                    debug!("peer {} sees seq {} decided, proposer exits", me, *seq);
                    return;
                }
                (replica.next_pnum(), replica.majority())
            };

            // phase 1: collect promises
            let replies = self.broadcast(Request::Prepare(Prepare { seq, pnum })).await;
            let mut promised = 0;
            let mut max_accept: Option<Pnum> = None;
            let mut adopted: Option<C> = None;
            for reply in replies.into_iter().flatten() {
                if let Reply::Prepare(p) = reply {
                    if p.ok {
                        promised += 1;
                        if p.accept_pnum > max_accept {
                            max_accept = p.accept_pnum;
                            adopted = p.accept_value;
                        }
                    }
                }
            }

            if promised >= majority {
                // a promise that carries an accepted value binds us to the
                // highest of them; our own value only rides a clean slate
                let candidate = adopted.unwrap_or_else(|| value.clone());

                // phase 2: collect accepts
                let replies = self
                    .broadcast(Request::Accept(Accept {
                        seq,
                        pnum,
                        value: candidate.clone(),
                    }))
                    .await;
                let accepted = replies
                    .into_iter()
                    .flatten()
                    .filter(|r| matches!(r, Reply::Accept(AcceptReply { ok: true })))
                    .count();

                if accepted >= majority {
                    let done = self.replica.lock().await.done_through();
                    debug!("peer {} decided seq {}", me, *seq);
                    self.broadcast(Request::Decide(Decide {
                        seq,
                        value: candidate,
                        pnum,
                        sender: me.into(),
                        done,
                    }))
                    .await;
                    return;
                }
            }

            // a competing proposer outbid us; back off a random moment so
            // the duel ends
            let pause = rand::thread_rng().gen_range(10..40);
            sleep(Duration::from_millis(pause)).await;
        }
    }
}

pub(crate) struct RpcServer<C>
where
    C: Value,
{
    inner: Arc<InnerPeer<C>>,
    listener: TcpListener,
}

impl<C> RpcServer<C>
where
    C: Value,
{
    pub(crate) async fn new(inner: Arc<InnerPeer<C>>) -> Result<Self, RpcError> {
        let listener = TcpListener::bind(&inner.conf[inner.conf.index]).await?;
        Ok(Self { inner, listener })
    }

    /// Accept loop: one connection per request/reply exchange. When the
    /// peer is flagged unreliable, a request may be dropped on the floor
    /// before processing, or processed with its reply discarded. The
    /// protocol has to survive both.
    pub(crate) async fn serve(&self) {
        loop {
            match self.listener.accept().await {
                Ok((mut stream, _)) => {
                    if self.inner.is_dead() {
                        break;
                    }
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        if inner.is_unreliable()
                            && rand::thread_rng().gen_bool(DROP_REQUEST_RATE)
                        {
                            return;
                        }
                        let drop_reply = inner.is_unreliable()
                            && rand::thread_rng().gen_bool(DROP_REPLY_RATE);

                        let request: Request<C> = match util::recv_message(&mut stream).await {
                            Ok(request) => request,
                            Err(e) => {
                                trace!("peer {} dropped a request: {}", inner.conf.index, e);
                                return;
                            }
                        };
                        inner.rpc_count.fetch_add(1, Ordering::Relaxed);

                        let reply = inner.handle_request(request).await;
                        if !drop_reply {
                            if let Err(e) = util::send_message(&mut stream, &reply).await {
                                trace!("peer {} failed to reply: {}", inner.conf.index, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    if self.inner.is_dead() {
                        break;
                    }
                    warn!("peer {} accept error: {}", self.inner.conf.index, e);
                }
            }
        }
    }
}
