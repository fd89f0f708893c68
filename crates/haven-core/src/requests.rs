//! Pending session requests.
//!
//! A request is a proposal from one client to one named counselor. At most
//! one outcome is ever delivered per request id: once taken for resolution
//! or cancelled, it is gone and never resurrected.

use crate::ids::now_ms;
use crate::registry::ConnectionId;
use std::collections::HashMap;
use tracing::debug;

/// A proposal awaiting the target counselor's accept/decline.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Unique request id.
    pub id: String,
    /// Session token of the originating client.
    pub client_token: String,
    /// Connection the request was issued on.
    pub origin_connection: ConnectionId,
    /// The counselor the request is addressed to.
    pub counselor_id: String,
    /// Session type hint.
    pub session_type: String,
    /// Free-text message from the client.
    pub message: String,
    /// Creation time, Unix millis.
    pub created_at: u64,
}

impl PendingRequest {
    /// Create a new pending request.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        client_token: impl Into<String>,
        origin_connection: impl Into<ConnectionId>,
        counselor_id: impl Into<String>,
        session_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            client_token: client_token.into(),
            origin_connection: origin_connection.into(),
            counselor_id: counselor_id.into(),
            session_type: session_type.into(),
            message: message.into(),
            created_at: now_ms(),
        }
    }
}

/// Storage for pending requests, keyed by request id.
#[derive(Default)]
pub struct RequestBroker {
    pending: HashMap<String, PendingRequest>,
}

impl RequestBroker {
    /// Create an empty request store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check whether there are no pending requests.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Store a new pending request.
    pub fn insert(&mut self, request: PendingRequest) {
        debug!(request = %request.id, counselor = %request.counselor_id, "Request pending");
        self.pending.insert(request.id.clone(), request);
    }

    /// Peek at a pending request without resolving it.
    #[must_use]
    pub fn get(&self, request_id: &str) -> Option<&PendingRequest> {
        self.pending.get(request_id)
    }

    /// Check whether a client has any request still pending.
    #[must_use]
    pub fn client_has_pending(&self, client_token: &str) -> bool {
        self.pending
            .values()
            .any(|r| r.client_token == client_token)
    }

    /// Take a request for resolution. A second take of the same id yields
    /// `None`, which callers surface as `NotFound`.
    pub fn take(&mut self, request_id: &str) -> Option<PendingRequest> {
        let request = self.pending.remove(request_id);
        if let Some(req) = &request {
            debug!(request = %req.id, "Request taken for resolution");
        }
        request
    }

    /// Cancel every pending request originated by a client, returning them.
    pub fn cancel_for_client(&mut self, client_token: &str) -> Vec<PendingRequest> {
        let ids: Vec<String> = self
            .pending
            .values()
            .filter(|r| r.client_token == client_token)
            .map(|r| r.id.clone())
            .collect();

        ids.iter()
            .filter_map(|id| {
                debug!(request = %id, client = %client_token, "Request cancelled (client gone)");
                self.pending.remove(id)
            })
            .collect()
    }

    /// Cancel every pending request addressed to a counselor, returning them.
    pub fn cancel_for_counselor(&mut self, counselor_id: &str) -> Vec<PendingRequest> {
        let ids: Vec<String> = self
            .pending
            .values()
            .filter(|r| r.counselor_id == counselor_id)
            .map(|r| r.id.clone())
            .collect();

        ids.iter()
            .filter_map(|id| {
                debug!(request = %id, counselor = %counselor_id, "Request cancelled (counselor gone)");
                self.pending.remove(id)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, client: &str, counselor: &str) -> PendingRequest {
        PendingRequest::new(id, client, "conn-1", counselor, "chat", "hello")
    }

    #[test]
    fn test_take_is_single_shot() {
        let mut broker = RequestBroker::new();
        broker.insert(request("req_1", "sess_1", "coun_1"));

        assert!(broker.take("req_1").is_some());
        // Resolved requests are never resurrected
        assert!(broker.take("req_1").is_none());
    }

    #[test]
    fn test_cancel_for_client() {
        let mut broker = RequestBroker::new();
        broker.insert(request("req_1", "sess_1", "coun_1"));
        broker.insert(request("req_2", "sess_1", "coun_2"));
        broker.insert(request("req_3", "sess_2", "coun_1"));

        let cancelled = broker.cancel_for_client("sess_1");
        assert_eq!(cancelled.len(), 2);
        assert_eq!(broker.len(), 1);
        assert!(broker.get("req_3").is_some());
    }

    #[test]
    fn test_cancel_for_counselor() {
        let mut broker = RequestBroker::new();
        broker.insert(request("req_1", "sess_1", "coun_1"));
        broker.insert(request("req_2", "sess_2", "coun_1"));

        let cancelled = broker.cancel_for_counselor("coun_1");
        assert_eq!(cancelled.len(), 2);
        assert!(broker.is_empty());
    }
}
