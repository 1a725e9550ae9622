//! Relay broker — pairs two sockets offered under the same connect id and
//! splices them into one bidirectional pipe
//!
//! A parked socket is owned by its own task until claimed. The task watches
//! the socket so a client that hangs up while waiting is forgotten instead
//! of being paired later, and it enforces the pending timeout.

use crate::channel::ConnectId;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Frames a parked socket may buffer; past this it is no longer read
const MAX_EARLY_FRAMES: usize = 64;

/// Statistics about relay pairing
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    /// Offers currently waiting for their counterpart
    pub pending: usize,
    /// Tunnels spliced since start
    pub tunnels_opened: u64,
    /// Pending offers dropped by the eviction timer
    pub evicted: u64,
    /// Pending offers whose client hung up before being matched
    pub abandoned: u64,
}

/// What happened to an offered socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Stored, waiting for the second socket
    Pending,
    /// Paired and spliced; the tunnel has since closed
    Spliced,
}

/// A parked socket as handed to the offer that claims it
struct Handover<S, M> {
    socket: S,
    /// Frames read while parked, in arrival order
    early: Vec<M>,
    /// The socket's stream already ended
    ended: bool,
}

type Claim<S, M> = oneshot::Sender<oneshot::Sender<Handover<S, M>>>;
type Claimed<S, M> = oneshot::Receiver<oneshot::Sender<Handover<S, M>>>;

struct PendingRelay<S, M> {
    ticket: u64,
    claim: Claim<S, M>,
}

struct BrokerState<S, M> {
    pending: HashMap<ConnectId, PendingRelay<S, M>>,
    next_ticket: u64,
    tunnels_opened: u64,
    evicted: u64,
    abandoned: u64,
}

#[derive(Debug, Clone, Copy)]
enum Release {
    Evicted,
    Abandoned,
}

/// Pairs relay sockets by connect id.
///
/// `S` is any message socket (a websocket in production); `M` is its frame
/// type. At most one socket waits per id. With a pending timeout configured,
/// an unmatched socket is closed and forgotten once the timeout elapses.
pub struct RelayBroker<S, M> {
    state: Arc<Mutex<BrokerState<S, M>>>,
    pending_timeout: Option<Duration>,
}

impl<S, M> Clone for RelayBroker<S, M> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            pending_timeout: self.pending_timeout,
        }
    }
}

impl<S, M> RelayBroker<S, M>
where
    S: Stream<Item = Result<M, <S as Sink<M>>::Error>> + Sink<M> + Send + Unpin + 'static,
    <S as Sink<M>>::Error: fmt::Display + Send,
    M: Send + 'static,
{
    pub fn new(pending_timeout: Option<Duration>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                pending: HashMap::new(),
                next_ticket: 0,
                tunnels_opened: 0,
                evicted: 0,
                abandoned: 0,
            })),
            pending_timeout,
        }
    }

    /// Offer a socket for `id`.
    ///
    /// The first offer is parked and this returns immediately. The second
    /// offer takes the parked socket out and runs the splice until either end
    /// closes, so for that caller this resolves when the tunnel is gone.
    pub async fn offer(&self, id: ConnectId, socket: S) -> OfferOutcome {
        let claim = {
            let mut state = self.state.lock();
            match state.pending.remove(&id) {
                Some(waiting) => {
                    state.tunnels_opened += 1;
                    waiting.claim
                }
                None => {
                    state.next_ticket += 1;
                    let ticket = state.next_ticket;
                    let (claim, claimed) = oneshot::channel();
                    state.pending.insert(id.clone(), PendingRelay { ticket, claim });
                    tokio::spawn(self.clone().park(id.clone(), ticket, socket, claimed));
                    debug!("pending connect {}", id);
                    return OfferOutcome::Pending;
                }
            }
        };

        let (reply, handover) = oneshot::channel();
        let parked = match claim.send(reply) {
            Ok(()) => handover.await.ok(),
            Err(_) => None,
        };
        let parked = match parked {
            Some(parked) => parked,
            None => {
                warn!("parked socket for {} vanished before pairing", id);
                let mut socket = socket;
                let _ = socket.close().await;
                return OfferOutcome::Spliced;
            }
        };

        info!("connect {}", id);
        if let Err(e) = splice_parked(parked, socket).await {
            debug!("tunnel {} ended with error: {}", id, e);
        }
        debug!("tunnel {} closed", id);
        OfferOutcome::Spliced
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_pending(&self, id: &ConnectId) -> bool {
        self.state.lock().pending.contains_key(id)
    }

    pub fn get_stats(&self) -> BrokerStats {
        let state = self.state.lock();
        BrokerStats {
            pending: state.pending.len(),
            tunnels_opened: state.tunnels_opened,
            evicted: state.evicted,
            abandoned: state.abandoned,
        }
    }

    /// Own a parked socket until it is claimed, evicted or hung up
    async fn park(self, id: ConnectId, ticket: u64, mut socket: S, mut claimed: Claimed<S, M>) {
        let timeout = self.pending_timeout;
        let expiry = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        let mut early = Vec::new();
        let mut ended = false;
        let mut expired = false;

        let reply = loop {
            tokio::select! {
                reply = &mut claimed => match reply {
                    Ok(reply) => break reply,
                    // The claiming offer went away before asking
                    Err(_) => return,
                },
                frame = socket.next(), if !ended && early.len() < MAX_EARLY_FRAMES => match frame {
                    Some(Ok(frame)) => early.push(frame),
                    Some(Err(e)) => {
                        debug!("parked connect {} failed: {}", id, e);
                        ended = true;
                        if self.release(&id, ticket, Release::Abandoned) {
                            return;
                        }
                    }
                    None => {
                        ended = true;
                        if self.release(&id, ticket, Release::Abandoned) {
                            debug!("parked connect {} hung up", id);
                            return;
                        }
                    }
                },
                _ = &mut expiry, if !expired => {
                    expired = true;
                    if self.release(&id, ticket, Release::Evicted) {
                        warn!("evicting unmatched connect {} after {:?}", id, timeout);
                        if let Err(e) = socket.close().await {
                            debug!("closing evicted socket {} failed: {}", id, e);
                        }
                        return;
                    }
                }
            }
        };

        let _ = reply.send(Handover {
            socket,
            early,
            ended,
        });
    }

    /// Forget the pending entry if it is still this ticket's
    fn release(&self, id: &ConnectId, ticket: u64, reason: Release) -> bool {
        let mut state = self.state.lock();
        if state.pending.get(id).map(|p| p.ticket) != Some(ticket) {
            return false;
        }
        state.pending.remove(id);
        match reason {
            Release::Evicted => state.evicted += 1,
            Release::Abandoned => state.abandoned += 1,
        }
        true
    }
}

/// Deliver what the parked side sent while waiting, then splice
async fn splice_parked<S, M>(parked: Handover<S, M>, mut b: S) -> Result<(), <S as Sink<M>>::Error>
where
    S: Stream<Item = Result<M, <S as Sink<M>>::Error>> + Sink<M> + Unpin,
{
    let Handover {
        socket: mut a,
        early,
        ended,
    } = parked;

    let mut delivered = Ok(());
    for frame in early {
        delivered = b.send(frame).await;
        if delivered.is_err() {
            break;
        }
    }
    if delivered.is_err() || ended {
        let _ = a.close().await;
        let _ = b.close().await;
        return delivered;
    }
    splice(a, b).await
}

/// Pump frames both ways until either side ends or errors, then close both.
///
/// `forward` waits on the destination sink before pulling the next frame, so
/// a slow reader on one end pauses reads from the other.
pub async fn splice<S, M>(a: S, b: S) -> Result<(), <S as Sink<M>>::Error>
where
    S: Stream<Item = Result<M, <S as Sink<M>>::Error>> + Sink<M> + Unpin,
{
    let (mut a_tx, a_rx) = a.split::<M>();
    let (mut b_tx, b_rx) = b.split::<M>();

    let outcome = {
        let a_to_b = a_rx.forward(&mut b_tx);
        let b_to_a = b_rx.forward(&mut a_tx);
        tokio::select! {
            result = a_to_b => result,
            result = b_to_a => result,
        }
    };

    let _ = a_tx.close().await;
    let _ = b_tx.close().await;
    outcome
}

// ============================================================================
// TESTS
// ============================================================================
