//! Waiting pools for the Haven broker.
//!
//! Two insertion-ordered collections: counselors that have declared
//! themselves available, and clients that are still unmatched. "First
//! available wins" ordering falls out of the insertion order, so both pools
//! are kept as vectors keyed by identifier.

use crate::ids::now_ms;
use crate::registry::ConnectionId;
use std::time::Duration;
use tracing::debug;

/// A counselor waiting for (or between) sessions.
#[derive(Debug, Clone)]
pub struct CounselorEntry {
    /// Owning connection.
    pub connection_id: ConnectionId,
    /// Declared specialty tags.
    pub specialties: Vec<String>,
    /// Whether the counselor can enter a new session.
    pub available: bool,
    /// When the counselor joined, Unix millis.
    pub joined_at: u64,
    /// Last liveness signal, Unix millis.
    pub last_seen: u64,
}

impl CounselorEntry {
    /// Create a new entry, available and live as of now.
    #[must_use]
    pub fn new(connection_id: impl Into<ConnectionId>, specialties: Vec<String>) -> Self {
        let now = now_ms();
        Self {
            connection_id: connection_id.into(),
            specialties,
            available: true,
            joined_at: now,
            last_seen: now,
        }
    }

    /// Check if this entry is stale as of `now` (no signal within `timeout`).
    #[must_use]
    pub fn is_stale(&self, now: u64, timeout: Duration) -> bool {
        now.saturating_sub(self.last_seen) > timeout.as_millis() as u64
    }
}

/// A client waiting to be matched.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    /// Owning connection.
    pub connection_id: ConnectionId,
    /// Free-form matching preferences.
    pub preferences: Option<serde_json::Value>,
    /// Preferred counselor, if the client named one at join.
    pub preferred_counselor: Option<String>,
    /// When the client joined, Unix millis.
    pub created_at: u64,
    /// Last liveness signal, Unix millis.
    pub last_seen: u64,
}

impl ClientEntry {
    /// Create a new entry, live as of now.
    #[must_use]
    pub fn new(
        connection_id: impl Into<ConnectionId>,
        preferences: Option<serde_json::Value>,
        preferred_counselor: Option<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            connection_id: connection_id.into(),
            preferences,
            preferred_counselor,
            created_at: now,
            last_seen: now,
        }
    }

    /// Check if this entry is stale as of `now` (no signal within `timeout`).
    #[must_use]
    pub fn is_stale(&self, now: u64, timeout: Duration) -> bool {
        now.saturating_sub(self.last_seen) > timeout.as_millis() as u64
    }
}

/// The two waiting pools, ordered by insertion.
#[derive(Default)]
pub struct WaitingPools {
    counselors: Vec<(String, CounselorEntry)>,
    clients: Vec<(String, ClientEntry)>,
}

impl WaitingPools {
    /// Create empty pools.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pooled counselors (available or not).
    #[must_use]
    pub fn counselor_count(&self) -> usize {
        self.counselors.len()
    }

    /// Number of counselors currently available for matching.
    #[must_use]
    pub fn available_counselor_count(&self) -> usize {
        self.counselors.iter().filter(|(_, e)| e.available).count()
    }

    /// Number of waiting clients.
    #[must_use]
    pub fn waiting_client_count(&self) -> usize {
        self.clients.len()
    }

    /// Add a counselor. A re-join with the same id replaces the entry in
    /// place, keeping its original position in the queue.
    pub fn add_counselor(&mut self, id: impl Into<String>, entry: CounselorEntry) {
        let id = id.into();
        if let Some((_, existing)) = self.counselors.iter_mut().find(|(k, _)| *k == id) {
            *existing = entry;
            debug!(counselor = %id, "Counselor entry replaced");
        } else {
            debug!(counselor = %id, "Counselor entry added");
            self.counselors.push((id, entry));
        }
    }

    /// Remove a counselor outright (disconnect or eviction).
    pub fn remove_counselor(&mut self, id: &str) -> Option<CounselorEntry> {
        let pos = self.counselors.iter().position(|(k, _)| k == id)?;
        let (_, entry) = self.counselors.remove(pos);
        debug!(counselor = %id, "Counselor entry removed");
        Some(entry)
    }

    /// Get a counselor entry by id.
    #[must_use]
    pub fn counselor(&self, id: &str) -> Option<&CounselorEntry> {
        self.counselors
            .iter()
            .find(|(k, _)| k == id)
            .map(|(_, e)| e)
    }

    /// The earliest-inserted counselor with `available == true`, if any.
    #[must_use]
    pub fn first_available_counselor(&self) -> Option<(&str, &CounselorEntry)> {
        self.counselors
            .iter()
            .find(|(_, e)| e.available)
            .map(|(id, e)| (id.as_str(), e))
    }

    /// Check whether a counselor is present and available.
    #[must_use]
    pub fn is_counselor_available(&self, id: &str) -> bool {
        self.counselor(id).is_some_and(|e| e.available)
    }

    /// Flip a counselor's availability. Silently a no-op when the id is
    /// absent: eviction races with availability updates are expected.
    pub fn set_counselor_availability(&mut self, id: &str, available: bool) {
        if let Some((_, entry)) = self.counselors.iter_mut().find(|(k, _)| k == id) {
            entry.available = available;
            debug!(counselor = %id, available, "Counselor availability updated");
        }
    }

    /// Refresh a counselor's liveness timestamp.
    pub fn touch_counselor(&mut self, id: &str) {
        if let Some((_, entry)) = self.counselors.iter_mut().find(|(k, _)| k == id) {
            entry.last_seen = now_ms();
        }
    }

    /// Add a waiting client.
    pub fn add_client(&mut self, token: impl Into<String>, entry: ClientEntry) {
        let token = token.into();
        debug!(client = %token, "Client entry added");
        self.clients.push((token, entry));
    }

    /// Remove a client (matched, disconnected, or evicted).
    pub fn remove_client(&mut self, token: &str) -> Option<ClientEntry> {
        let pos = self.clients.iter().position(|(k, _)| k == token)?;
        let (_, entry) = self.clients.remove(pos);
        debug!(client = %token, "Client entry removed");
        Some(entry)
    }

    /// Get a client entry by session token.
    #[must_use]
    pub fn client(&self, token: &str) -> Option<&ClientEntry> {
        self.clients.iter().find(|(k, _)| k == token).map(|(_, e)| e)
    }

    /// The earliest-inserted unmatched client, if any.
    #[must_use]
    pub fn first_waiting_client(&self) -> Option<(&str, &ClientEntry)> {
        self.clients.first().map(|(token, e)| (token.as_str(), e))
    }

    /// Waiting client tokens in insertion order.
    #[must_use]
    pub fn waiting_client_tokens(&self) -> Vec<String> {
        self.clients.iter().map(|(token, _)| token.clone()).collect()
    }

    /// Refresh a client's liveness timestamp.
    pub fn touch_client(&mut self, token: &str) {
        if let Some((_, entry)) = self.clients.iter_mut().find(|(k, _)| k == token) {
            entry.last_seen = now_ms();
        }
    }

    /// Counselor ids with no liveness signal within `timeout` as of `now`.
    #[must_use]
    pub fn stale_counselors(&self, now: u64, timeout: Duration) -> Vec<String> {
        self.counselors
            .iter()
            .filter(|(_, e)| e.is_stale(now, timeout))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Waiting client tokens with no liveness signal within `timeout`.
    #[must_use]
    pub fn stale_clients(&self, now: u64, timeout: Duration) -> Vec<String> {
        self.clients
            .iter()
            .filter(|(_, e)| e.is_stale(now, timeout))
            .map(|(token, _)| token.clone())
            .collect()
    }
}
