//! Active session storage.
//!
//! An `ActiveSession` is the result of a successful match. The map here is
//! pure bookkeeping; the broker drives the lifecycle (creation, message
//! fan-out, idempotent teardown) on top of it.

use crate::ids::now_ms;
use crate::registry::ConnectionId;
use std::collections::HashMap;
use tracing::debug;

/// A live conversation between one client and one counselor.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    /// Session id; reuses the client's session token.
    pub id: String,
    /// The client's connection at match time.
    pub client_connection: ConnectionId,
    /// The counselor in the session.
    pub counselor_id: String,
    /// Session type hint.
    pub session_type: String,
    /// Start time, Unix millis.
    pub started_at: u64,
}

impl ActiveSession {
    /// Create a new active session.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        client_connection: impl Into<ConnectionId>,
        counselor_id: impl Into<String>,
        session_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            client_connection: client_connection.into(),
            counselor_id: counselor_id.into(),
            session_type: session_type.into(),
            started_at: now_ms(),
        }
    }
}

/// Storage for active sessions, keyed by session id.
#[derive(Default)]
pub struct SessionStore {
    sessions: HashMap<String, ActiveSession>,
}

impl SessionStore {
    /// Create an empty session store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check whether there are no active sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Insert a newly created session.
    pub fn insert(&mut self, session: ActiveSession) {
        debug!(session = %session.id, counselor = %session.counselor_id, "Session active");
        self.sessions.insert(session.id.clone(), session);
    }

    /// Get an active session by id.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<&ActiveSession> {
        self.sessions.get(session_id)
    }

    /// Remove a session. Removing an unknown id yields `None`, which makes
    /// teardown idempotent for racing enders.
    pub fn remove(&mut self, session_id: &str) -> Option<ActiveSession> {
        let session = self.sessions.remove(session_id);
        if let Some(s) = &session {
            debug!(session = %s.id, "Session removed");
        }
        session
    }

    /// Find the session a counselor is currently in, if any.
    #[must_use]
    pub fn session_for_counselor(&self, counselor_id: &str) -> Option<&ActiveSession> {
        self.sessions
            .values()
            .find(|s| s.counselor_id == counselor_id)
    }

    /// Check whether a counselor is referenced by any active session.
    #[must_use]
    pub fn counselor_in_session(&self, counselor_id: &str) -> bool {
        self.session_for_counselor(counselor_id).is_some()
    }

    /// All session ids naming the given counselor.
    #[must_use]
    pub fn session_ids_for_counselor(&self, counselor_id: &str) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.counselor_id == counselor_id)
            .map(|s| s.id.clone())
            .collect()
    }

    /// All active session ids.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }
}
