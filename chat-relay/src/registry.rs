use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    error::{RelayError, RelayResult},
    session::{Session, SessionId},
};

/// The set of live sessions, keyed by session id.
///
/// Every operation takes the same lock and none of them hold it across an
/// `.await`. Callers never see the live map, only snapshots.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<BTreeMap<SessionId, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session unless another live session already uses its name.
    pub fn register(&self, session: Arc<Session>) -> RelayResult<()> {
        let mut sessions = self.sessions.lock();
        if sessions
            .values()
            .any(|existing| existing.name() == session.name())
        {
            return Err(RelayError::DuplicateName {
                name: session.name().to_string(),
            });
        }
        sessions.insert(session.id(), session);
        Ok(())
    }

    /// Removes a session. Returns it only if this call actually removed it.
    pub fn deregister(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().remove(&id)
    }

    /// Point-in-time copy of the live sessions, in join order.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Removes every session at once.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        std::mem::take(&mut *self.sessions.lock())
            .into_values()
            .collect()
    }

    #[cfg(test)]
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    pub fn names(&self) -> Vec<String> {
        self.sessions
            .lock()
            .values()
            .map(|session| session.name().to_string())
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
