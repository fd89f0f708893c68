//! Connection registry for the Haven broker.
//!
//! Tracks every live duplex connection, the role it has claimed, and the
//! outbound delivery channel used to push events to it. The registry is the
//! single owner of connection state; every other component refers to
//! connections by identifier only.

use crate::broker::BrokerError;
use haven_protocol::ServerEvent;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Opaque connection identifier assigned by the transport layer.
pub type ConnectionId = String;

/// Outbound delivery channel for one connection.
pub type EventSender = UnboundedSender<ServerEvent>;

/// The role a connection has claimed via its join event.
///
/// A connection claims a role exactly once; the tagged variant replaces
/// ad hoc role/identifier fields so handlers can match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RoleClaim {
    /// Connected but not yet joined.
    #[default]
    Unset,
    /// Joined as an anonymous client.
    Client {
        /// Broker-assigned session token.
        token: String,
    },
    /// Joined as a counselor.
    Counselor {
        /// Caller-supplied counselor id.
        id: String,
    },
}

/// State held for one live connection.
struct ConnectionEntry {
    sender: EventSender,
    role: RoleClaim,
}

/// Registry of live connections with identifier indexes for delivery.
#[derive(Default)]
pub struct ConnectionRegistry {
    /// All live connections.
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Client session token -> connection id.
    clients: HashMap<String, ConnectionId>,
    /// Counselor id -> connection id.
    counselors: HashMap<String, ConnectionId>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check whether the registry has no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Register a newly opened connection with its delivery channel.
    pub fn open(&mut self, connection_id: impl Into<ConnectionId>, sender: EventSender) {
        let conn_id = connection_id.into();
        if self
            .connections
            .insert(
                conn_id.clone(),
                ConnectionEntry {
                    sender,
                    role: RoleClaim::Unset,
                },
            )
            .is_some()
        {
            warn!(connection = %conn_id, "Connection id reused while still registered");
        }
        debug!(connection = %conn_id, "Connection opened");
    }

    /// Record the role a connection claims at join time.
    ///
    /// A counselor id that is already registered is remapped to the new
    /// connection (last writer wins), which keeps reconnects cheap.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyClaimed` if the connection already holds a role, and
    /// `NotFound` if the connection is not registered.
    pub fn claim_role(
        &mut self,
        connection_id: &str,
        claim: RoleClaim,
    ) -> Result<(), BrokerError> {
        let entry = self
            .connections
            .get_mut(connection_id)
            .ok_or(BrokerError::NotFound)?;

        if entry.role != RoleClaim::Unset {
            return Err(BrokerError::AlreadyClaimed);
        }

        match &claim {
            RoleClaim::Client { token } => {
                self.clients
                    .insert(token.clone(), connection_id.to_string());
            }
            RoleClaim::Counselor { id } => {
                if let Some(previous) = self
                    .counselors
                    .insert(id.clone(), connection_id.to_string())
                {
                    debug!(counselor = %id, previous = %previous, "Counselor id remapped to new connection");
                }
            }
            RoleClaim::Unset => {}
        }

        entry.role = claim;
        Ok(())
    }

    /// Remove a closed connection and return whatever role it had claimed.
    ///
    /// Always succeeds; a never-claimed or unknown connection yields
    /// `RoleClaim::Unset` so callers can route cleanup uniformly.
    pub fn on_close(&mut self, connection_id: &str) -> RoleClaim {
        let Some(entry) = self.connections.remove(connection_id) else {
            return RoleClaim::Unset;
        };

        // Only drop an index entry that still points at this connection;
        // a reconnect may have remapped the identifier already.
        match &entry.role {
            RoleClaim::Client { token } => {
                if self.clients.get(token).map(String::as_str) == Some(connection_id) {
                    self.clients.remove(token);
                }
            }
            RoleClaim::Counselor { id } => {
                if self.counselors.get(id).map(String::as_str) == Some(connection_id) {
                    self.counselors.remove(id);
                }
            }
            RoleClaim::Unset => {}
        }

        debug!(connection = %connection_id, role = ?entry.role, "Connection closed");
        entry.role
    }

    /// Get the claimed role for a connection.
    #[must_use]
    pub fn role(&self, connection_id: &str) -> Option<&RoleClaim> {
        self.connections.get(connection_id).map(|e| &e.role)
    }

    /// Get the delivery channel for a connection.
    ///
    /// A missing peer is a soft miss, never an error.
    #[must_use]
    pub fn sender(&self, connection_id: &str) -> Option<&EventSender> {
        self.connections.get(connection_id).map(|e| &e.sender)
    }

    /// Get the delivery channel for a client by session token.
    #[must_use]
    pub fn client_sender(&self, token: &str) -> Option<&EventSender> {
        self.clients.get(token).and_then(|conn| self.sender(conn))
    }

    /// Get the delivery channel for a counselor by id.
    #[must_use]
    pub fn counselor_sender(&self, counselor_id: &str) -> Option<&EventSender> {
        self.counselors
            .get(counselor_id)
            .and_then(|conn| self.sender(conn))
    }

    /// Check whether a counselor currently has a live connection.
    #[must_use]
    pub fn counselor_connected(&self, counselor_id: &str) -> bool {
        self.counselors.contains_key(counselor_id)
    }

    /// Get the connection id currently bound to a counselor id.
    #[must_use]
    pub fn counselor_connection(&self, counselor_id: &str) -> Option<&ConnectionId> {
        self.counselors.get(counselor_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sender() -> EventSender {
        let (tx, _rx) = mpsc::unbounded_channel();
        tx
    }

    #[test]
    fn test_claim_role_once() {
        let mut registry = ConnectionRegistry::new();
        registry.open("conn-1", sender());

        registry
            .claim_role(
                "conn-1",
                RoleClaim::Client {
                    token: "sess_a".to_string(),
                },
            )
            .unwrap();

        let err = registry
            .claim_role(
                "conn-1",
                RoleClaim::Counselor {
                    id: "coun_b".to_string(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyClaimed));
    }

    #[test]
    fn test_on_close_returns_claim() {
        let mut registry = ConnectionRegistry::new();
        registry.open("conn-1", sender());
        registry
            .claim_role(
                "conn-1",
                RoleClaim::Counselor {
                    id: "coun_1".to_string(),
                },
            )
            .unwrap();

        assert!(registry.counselor_connected("coun_1"));
        let claim = registry.on_close("conn-1");
        assert_eq!(
            claim,
            RoleClaim::Counselor {
                id: "coun_1".to_string()
            }
        );
        assert!(!registry.counselor_connected("coun_1"));

        // Unknown connections close without error
        assert_eq!(registry.on_close("conn-404"), RoleClaim::Unset);
    }

    #[test]
    fn test_counselor_reconnect_remaps() {
        let mut registry = ConnectionRegistry::new();
        registry.open("conn-1", sender());
        registry
            .claim_role(
                "conn-1",
                RoleClaim::Counselor {
                    id: "coun_1".to_string(),
                },
            )
            .unwrap();

        registry.open("conn-2", sender());
        registry
            .claim_role(
                "conn-2",
                RoleClaim::Counselor {
                    id: "coun_1".to_string(),
                },
            )
            .unwrap();

        assert_eq!(
            registry.counselor_connection("coun_1").map(String::as_str),
            Some("conn-2")
        );

        // Closing the stale connection must not evict the remapped index
        registry.on_close("conn-1");
        assert!(registry.counselor_connected("coun_1"));
    }

    #[test]
    fn test_lookup_is_soft() {
        let registry = ConnectionRegistry::new();
        assert!(registry.client_sender("sess_missing").is_none());
        assert!(registry.counselor_sender("coun_missing").is_none());
    }
}
