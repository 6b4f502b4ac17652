//! Request/response correlation.
//!
//! Every request gets a connection-unique id from an atomic counter. The caller holds
//! the receiving half of a oneshot; the read loop completes it when the response
//! arrives. Whatever happens first (response, deadline, connection loss) settles the
//! entry and removes it, so a late response finds nothing and is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{LostReason, ProtocolError, Result};

struct Pending<R> {
    sent_at: Instant,
    slot: oneshot::Sender<Result<R>>,
}

pub struct Correlator<R> {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending<R>>>,
}

/// Receiving side of one outstanding request.
pub struct PendingReply<R> {
    pub id: u64,
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> Default for Correlator<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Correlator<R> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Mint an id and park a completion slot under it.
    pub fn register(&self) -> PendingReply<R> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                id,
                Pending {
                    sent_at: Instant::now(),
                    slot,
                },
            );
        }
        PendingReply { id, rx }
    }

    /// Deliver a response. Returns false if nothing was waiting for `id`.
    pub fn complete(&self, id: u64, reply: R) -> bool {
        let entry = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
        match entry {
            Some(entry) => {
                debug!(
                    correlation_id = id,
                    elapsed_ms = entry.sent_at.elapsed().as_millis() as u64,
                    "Response matched"
                );
                // the waiter may have given up in the same instant
                entry.slot.send(Ok(reply)).is_ok()
            }
            None => {
                warn!(correlation_id = id, "Discarding response with no pending request");
                false
            }
        }
    }

    /// Forget a request whose frame never made it out.
    pub fn cancel(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    /// Fail every outstanding request with `ConnectionLost(reason)`.
    pub fn fail_all(&self, reason: &LostReason) {
        let drained: Vec<Pending<R>> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, p)| p).collect(),
            Err(_) => return,
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), %reason, "Failing pending requests");
        }
        for entry in drained {
            let _ = entry
                .slot
                .send(Err(ProtocolError::ConnectionLost(reason.clone())));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Wait for the reply, removing the entry if the deadline passes first.
    pub async fn wait(&self, pending: PendingReply<R>, deadline: Duration) -> Result<R> {
        let PendingReply { id, rx } = pending;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.cancel(id);
                debug!(correlation_id = id, "Request timed out");
                Err(ProtocolError::Timeout)
            }
        }
    }
}
