use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::protocol::SessionId;
use crate::session::{Session, SessionInner};

/// Process-wide lookup of live sessions by id.
///
/// Sessions enrol themselves once `create`/`claim` succeeds and leave on
/// destroy. Entries are weak, so the registry never keeps a session alive.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Weak<SessionInner>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(&self, session_id: SessionId, session: &Arc<SessionInner>) {
        debug!(session_id, "registering session");
        self.sessions
            .write()
            .insert(session_id, Arc::downgrade(session));
    }

    pub fn get(&self, session_id: SessionId) -> Option<Session> {
        let inner = self.sessions.read().get(&session_id)?.upgrade()?;
        Some(Session::from_inner(inner))
    }

    pub fn remove(&self, session_id: SessionId) -> bool {
        self.sessions.write().remove(&session_id).is_some()
    }

    /// Ids of sessions that are still alive.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, session)| session.strong_count() > 0)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
