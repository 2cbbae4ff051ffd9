use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{JanusError, JanusResult};
use crate::protocol::{HandleId, ServerMessage};

const TRANSACTION_ID_LEN: usize = 12;

pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Fresh id for a request that is sent without waiting for its reply.
pub fn transaction_id() -> String {
    random_string(TRANSACTION_ID_LEN)
}

/// Correlates outbound requests with the reply carrying the same transaction id.
///
/// Each entry is single-use: whichever of [`resolve`](Self::resolve),
/// [`cancel`](Self::cancel) or [`clear`](Self::clear) reaches it first removes
/// it, so a waiter observes at most one outcome.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    pending: Mutex<HashMap<String, Entry>>,
}

#[derive(Debug)]
struct Entry {
    owner: Option<HandleId>,
    tx: oneshot::Sender<ServerMessage>,
}

pub struct PendingTransaction {
    pub id: String,
    rx: oneshot::Receiver<ServerMessage>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh id that is not currently pending and registers a waiter for it.
    pub fn begin(&self) -> PendingTransaction {
        self.begin_owned(None)
    }

    /// Like [`begin`](Self::begin), tagging the entry with the handle that issued it.
    pub fn begin_owned(&self, owner: Option<HandleId>) -> PendingTransaction {
        let mut pending = self.pending.lock();
        let id = loop {
            let candidate = random_string(TRANSACTION_ID_LEN);
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        let (tx, rx) = oneshot::channel();
        pending.insert(id.clone(), Entry { owner, tx });
        PendingTransaction { id, rx }
    }

    /// Registers a waiter under a caller-chosen id.
    pub fn register(&self, id: impl Into<String>) -> JanusResult<PendingTransaction> {
        let id = id.into();
        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            return Err(JanusError::State(format!(
                "transaction {id} is already pending"
            )));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id.clone(), Entry { owner: None, tx });
        Ok(PendingTransaction { id, rx })
    }

    /// Delivers a reply to its waiter. Unknown ids are dropped; returns whether a waiter existed.
    pub fn resolve(&self, id: &str, reply: ServerMessage) -> bool {
        let entry = self.pending.lock().remove(id);
        match entry {
            Some(entry) => {
                if entry.tx.send(reply).is_err() {
                    trace!(transaction = id, "waiter gone before reply arrived");
                }
                true
            }
            None => {
                debug!(transaction = id, "reply for unknown transaction dropped");
                false
            }
        }
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    /// Drops every waiter issued on behalf of `owner`.
    pub fn cancel_owned(&self, owner: HandleId) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, entry| entry.owner != Some(owner));
        before - pending.len()
    }

    /// Drops every pending waiter; their futures complete with [`JanusError::Cancelled`].
    pub fn clear(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PendingTransaction {
    pub async fn wait(self) -> JanusResult<ServerMessage> {
        self.rx.await.map_err(|_| JanusError::Cancelled)
    }

    /// Waits up to `timeout`; on expiry the registry entry is removed so a late reply is dropped.
    pub async fn wait_timeout(
        self,
        registry: &TransactionRegistry,
        timeout: Duration,
    ) -> JanusResult<ServerMessage> {
        let PendingTransaction { id, mut rx } = self;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(result) => result.map_err(|_| JanusError::Cancelled),
            Err(_) => {
                if registry.cancel(&id) {
                    return Err(JanusError::Timeout(format!("transaction {id}")));
                }
                // Resolve won the race after the deadline fired.
                rx.try_recv()
                    .map_err(|_| JanusError::Timeout(format!("transaction {id}")))
            }
        }
    }
}
