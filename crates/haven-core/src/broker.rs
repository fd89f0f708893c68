//! The Haven broker state machine.
//!
//! One `Broker` instance owns every registry and processes one inbound
//! event (or one sweep tick) to completion before the next. That single
//! thread of execution is what makes the pairing steps atomic: pool
//! removal, availability flip, and session creation happen as plain
//! sequential statements with no suspension point between them.

use crate::ids::{generate_id, now_ms};
use crate::pools::{ClientEntry, CounselorEntry, WaitingPools};
use crate::registry::{ConnectionId, ConnectionRegistry, EventSender, RoleClaim};
use crate::requests::{PendingRequest, RequestBroker};
use crate::sessions::{ActiveSession, SessionStore};
use haven_protocol::{ClientEvent, SenderRole, ServerEvent};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Session type used for pool matches, where no hint was given.
const DEFAULT_SESSION_TYPE: &str = "chat";

/// Broker errors. All of them are local conditions resolved by notifying
/// the caller; none terminate the connection or the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The connection already claimed a role.
    #[error("Connection has already joined")]
    AlreadyClaimed,

    /// The target counselor is absent or busy.
    #[error("Counselor is not available")]
    CounselorUnavailable,

    /// The target counselor's connection vanished mid-delivery.
    #[error("Counselor could not be reached")]
    CounselorUnreachable,

    /// The caller may not perform this operation.
    #[error("Operation not permitted")]
    Forbidden,

    /// No such request (already resolved, cancelled, or never existed).
    #[error("No such request")]
    NotFound,

    /// Message content is blank after trimming.
    #[error("Message content is empty")]
    EmptyContent,

    /// Unknown or already ended session.
    #[error("No active session with that id")]
    NoActiveSession,
}

impl BrokerError {
    /// Wire error code for this condition.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            BrokerError::AlreadyClaimed => 1001,
            BrokerError::CounselorUnavailable => 1002,
            BrokerError::CounselorUnreachable => 1003,
            BrokerError::Forbidden => 1004,
            BrokerError::NotFound => 1005,
            BrokerError::EmptyContent => 1006,
            BrokerError::NoActiveSession => 1007,
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long an entry may go without a liveness signal before the sweep
    /// evicts it.
    pub stale_after: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_millis(90_000),
        }
    }
}

/// The broker: owner of all connection, pool, request, and session state.
pub struct Broker {
    registry: ConnectionRegistry,
    pools: WaitingPools,
    requests: RequestBroker,
    sessions: SessionStore,
    config: BrokerConfig,
}

impl Broker {
    /// Create a new broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a new broker with custom configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        info!("Creating broker with config: {:?}", config);
        Self {
            registry: ConnectionRegistry::new(),
            pools: WaitingPools::new(),
            requests: RequestBroker::new(),
            sessions: SessionStore::new(),
            config,
        }
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connections: self.registry.len(),
            waiting_clients: self.pools.waiting_client_count(),
            pooled_counselors: self.pools.counselor_count(),
            available_counselors: self.pools.available_counselor_count(),
            pending_requests: self.requests.len(),
            active_sessions: self.sessions.len(),
        }
    }

    /// Register a newly opened connection with its delivery channel.
    pub fn connection_opened(&mut self, connection_id: impl Into<ConnectionId>, sender: EventSender) {
        self.registry.open(connection_id, sender);
    }

    /// Process one inbound event to completion.
    ///
    /// Rejections are pushed back to the caller as `error` events; they
    /// never close the connection.
    pub fn handle_event(&mut self, connection_id: &str, event: ClientEvent) {
        let result = match event {
            ClientEvent::JoinAsClient {
                preferences,
                preferred_counselor_id,
            } => self.join_as_client(connection_id, preferences, preferred_counselor_id),
            ClientEvent::JoinAsCounselor {
                counselor_id,
                specialties,
            } => self.join_as_counselor(connection_id, counselor_id, specialties),
            ClientEvent::RequestSession {
                counselor_id,
                session_type,
                message,
            } => self.request_session(connection_id, &counselor_id, &session_type, &message),
            ClientEvent::AcceptRequest { request_id } => {
                self.accept_request(connection_id, &request_id)
            }
            ClientEvent::DeclineRequest { request_id, reason } => {
                self.decline_request(connection_id, &request_id, reason)
            }
            ClientEvent::SendMessage {
                session_id,
                content,
            } => self.send_message(connection_id, &session_id, &content),
            ClientEvent::EndSession { session_id } => {
                self.end_session(connection_id, &session_id)
            }
            ClientEvent::LivenessSignal { available } => {
                self.liveness_signal(connection_id, available)
            }
        };

        if let Err(e) = result {
            warn!(connection = %connection_id, error = %e, "Event rejected");
            self.push_to_connection(
                connection_id,
                ServerEvent::error(e.code(), e.to_string()),
            );
        }
    }

    /// Route a connection close into every component that references it.
    pub fn connection_closed(&mut self, connection_id: &str) {
        match self.registry.on_close(connection_id) {
            RoleClaim::Client { token } => {
                self.pools.remove_client(&token);
                // Pending requests die silently; a later resolve sees NotFound
                self.requests.cancel_for_client(&token);

                if let Some(session) = self.sessions.get(&token) {
                    let counselor_id = session.counselor_id.clone();
                    self.push_to_counselor(
                        &counselor_id,
                        ServerEvent::ParticipantDisconnected {
                            message: "The client disconnected".to_string(),
                        },
                    );
                }
                info!(client = %token, "Client connection closed");
            }
            RoleClaim::Counselor { id } => {
                // A reconnect may already own this counselor id; only tear
                // down state that still belongs to the closing connection.
                if self
                    .pools
                    .counselor(&id)
                    .is_some_and(|e| e.connection_id == connection_id)
                {
                    self.pools.remove_counselor(&id);
                }

                if !self.registry.counselor_connected(&id) {
                    for request in self.requests.cancel_for_counselor(&id) {
                        self.push_to_client(
                            &request.client_token,
                            ServerEvent::request_failed(
                                Some(request.id.clone()),
                                "The counselor is no longer reachable",
                            ),
                        );
                    }

                    // The session stays open for a possible reconnect; the
                    // sweep reaps it if the counselor never returns.
                    for session_id in self.sessions.session_ids_for_counselor(&id) {
                        self.push_to_client(
                            &session_id,
                            ServerEvent::ParticipantDisconnected {
                                message: "The counselor disconnected".to_string(),
                            },
                        );
                    }
                }
                info!(counselor = %id, "Counselor connection closed");
            }
            RoleClaim::Unset => {
                debug!(connection = %connection_id, "Unclaimed connection closed");
            }
        }
    }

    /// Run one liveness sweep as of now.
    pub fn sweep(&mut self) {
        self.sweep_at(now_ms());
    }

    /// Run one liveness sweep as of the given Unix millis timestamp.
    pub fn sweep_at(&mut self, now: u64) {
        let timeout = self.config.stale_after;

        for counselor_id in self.pools.stale_counselors(now, timeout) {
            info!(counselor = %counselor_id, "Evicting stale counselor");
            self.pools.remove_counselor(&counselor_id);

            for request in self.requests.cancel_for_counselor(&counselor_id) {
                self.push_to_client(
                    &request.client_token,
                    ServerEvent::request_failed(
                        Some(request.id.clone()),
                        "The counselor is no longer reachable",
                    ),
                );
            }

            for session_id in self.sessions.session_ids_for_counselor(&counselor_id) {
                self.finish_session(
                    &session_id,
                    "The counselor disconnected",
                    "counselor-disconnected",
                );
            }
        }

        // Stale waiting clients vanish silently; their connection is
        // already gone or unresponsive.
        for token in self.pools.stale_clients(now, timeout) {
            info!(client = %token, "Evicting stale client");
            self.pools.remove_client(&token);
            self.requests.cancel_for_client(&token);
        }

        // Sessions whose counselor dropped its connection and never came
        // back are reaped here rather than lingering forever.
        for session_id in self.sessions.session_ids() {
            let counselor_id = match self.sessions.get(&session_id) {
                Some(s) => s.counselor_id.clone(),
                None => continue,
            };
            if !self.registry.counselor_connected(&counselor_id) {
                self.finish_session(
                    &session_id,
                    "The counselor disconnected",
                    "counselor-disconnected",
                );
            }
        }
    }

    // ---- join handlers ----

    fn join_as_client(
        &mut self,
        connection_id: &str,
        preferences: Option<serde_json::Value>,
        preferred_counselor_id: Option<String>,
    ) -> Result<(), BrokerError> {
        let token = generate_id("sess");
        self.registry.claim_role(
            connection_id,
            RoleClaim::Client {
                token: token.clone(),
            },
        )?;

        self.push_to_connection(
            connection_id,
            ServerEvent::SessionCreated {
                session_id: token.clone(),
            },
        );

        self.pools.add_client(
            token.clone(),
            ClientEntry::new(connection_id, preferences, preferred_counselor_id),
        );
        info!(client = %token, "Client joined");

        self.try_match_client(&token);
        Ok(())
    }

    fn join_as_counselor(
        &mut self,
        connection_id: &str,
        counselor_id: String,
        specialties: Vec<String>,
    ) -> Result<(), BrokerError> {
        self.registry.claim_role(
            connection_id,
            RoleClaim::Counselor {
                id: counselor_id.clone(),
            },
        )?;

        let mut entry = CounselorEntry::new(connection_id, specialties);
        // A reconnecting counselor may still be mid-session; keep the
        // one-session invariant by joining unavailable in that case.
        if self.sessions.counselor_in_session(&counselor_id) {
            entry.available = false;
        }
        self.pools.add_counselor(counselor_id.clone(), entry);

        self.push_to_connection(
            connection_id,
            ServerEvent::CounselorRegistered {
                counselor_id: counselor_id.clone(),
            },
        );
        info!(counselor = %counselor_id, "Counselor joined");

        self.try_match_waiting();
        Ok(())
    }

    // ---- matching engine ----

    /// Attempt to match one pooled client against the live pool state.
    ///
    /// Honors the client's preferred counselor when that counselor is
    /// available right now, falls back to the general first-available
    /// strategy otherwise, and tells the client when the fallback happened.
    fn try_match_client(&mut self, token: &str) {
        let Some(entry) = self.pools.client(token) else {
            return;
        };
        let preferred = entry.preferred_counselor.clone();

        match preferred {
            Some(pref) if self.pools.is_counselor_available(&pref) => {
                self.open_session(
                    token,
                    &pref,
                    DEFAULT_SESSION_TYPE,
                    "Matched with your preferred counselor".to_string(),
                );
            }
            Some(pref) => {
                let fallback = self
                    .pools
                    .first_available_counselor()
                    .map(|(id, _)| id.to_string());
                match fallback {
                    Some(counselor_id) => {
                        self.open_session(
                            token,
                            &counselor_id,
                            DEFAULT_SESSION_TYPE,
                            format!(
                                "Preferred counselor {pref} is unavailable; matched with another available counselor"
                            ),
                        );
                    }
                    None => {
                        self.push_to_client(
                            token,
                            ServerEvent::waiting(format!(
                                "Preferred counselor {pref} is unavailable; waiting for the next available counselor"
                            )),
                        );
                    }
                }
            }
            None => {
                let first = self
                    .pools
                    .first_available_counselor()
                    .map(|(id, _)| id.to_string());
                match first {
                    Some(counselor_id) => {
                        self.open_session(
                            token,
                            &counselor_id,
                            DEFAULT_SESSION_TYPE,
                            "Matched with an available counselor".to_string(),
                        );
                    }
                    None => {
                        self.push_to_client(
                            token,
                            ServerEvent::waiting(
                                "No counselor is available yet; you are in the waiting queue",
                            ),
                        );
                    }
                }
            }
        }
    }

    /// Match waiting clients, oldest first, against current pool state.
    ///
    /// Clients with a pending targeted request are committed to that
    /// proposal and skipped until it resolves.
    fn try_match_waiting(&mut self) {
        for token in self.pools.waiting_client_tokens() {
            if self.pools.available_counselor_count() == 0 {
                break;
            }
            if self.requests.client_has_pending(&token) {
                continue;
            }
            self.try_match_client(&token);
        }
    }

    /// Create an `ActiveSession` and notify both parties.
    ///
    /// This is the single place that flips a counselor's availability to
    /// false; the pool removal, flip, and session insert form one
    /// synchronous step, so no other match attempt can grab the counselor
    /// in between.
    fn open_session(
        &mut self,
        client_token: &str,
        counselor_id: &str,
        session_type: &str,
        note: String,
    ) -> Option<String> {
        let Some(client) = self.pools.remove_client(client_token) else {
            warn!(client = %client_token, "Match attempted for a client no longer pooled");
            return None;
        };

        self.pools.set_counselor_availability(counselor_id, false);
        let session = ActiveSession::new(
            client_token,
            client.connection_id,
            counselor_id,
            session_type,
        );
        let session_id = session.id.clone();
        self.sessions.insert(session);

        info!(session = %session_id, counselor = %counselor_id, "Session matched");

        let event = ServerEvent::matched(&session_id, session_type, note);
        self.push_to_client(client_token, event.clone());
        self.push_to_counselor(counselor_id, event);
        Some(session_id)
    }

    // ---- targeted requests ----

    fn request_session(
        &mut self,
        connection_id: &str,
        counselor_id: &str,
        session_type: &str,
        message: &str,
    ) -> Result<(), BrokerError> {
        let token = match self.registry.role(connection_id) {
            Some(RoleClaim::Client { token }) => token.clone(),
            _ => return Err(BrokerError::Forbidden),
        };

        // A matched client has left the pool; it cannot court another
        // counselor until its session ends.
        if self.pools.client(&token).is_none() {
            return Err(BrokerError::Forbidden);
        }

        // Availability check and delivery are one logical step; both
        // failure modes terminate with a single request-failed event.
        if !self.pools.is_counselor_available(counselor_id) {
            debug!(counselor = %counselor_id, "Request target unavailable");
            self.push_to_connection(
                connection_id,
                ServerEvent::request_failed(
                    None,
                    format!("Counselor {counselor_id} is not available"),
                ),
            );
            return Ok(());
        }

        let request_id = generate_id("req");
        let delivered = self.push_to_counselor(
            counselor_id,
            ServerEvent::SessionRequest {
                request_id: request_id.clone(),
                session_id: token.clone(),
                session_type: session_type.to_string(),
                message: message.to_string(),
            },
        );

        if !delivered {
            warn!(counselor = %counselor_id, "Request target vanished mid-delivery");
            self.push_to_connection(
                connection_id,
                ServerEvent::request_failed(
                    Some(request_id),
                    "Counselor could not be reached",
                ),
            );
            return Ok(());
        }

        self.requests.insert(PendingRequest::new(
            &request_id,
            &token,
            connection_id,
            counselor_id,
            session_type,
            message,
        ));
        self.push_to_connection(
            connection_id,
            ServerEvent::RequestSent {
                request_id,
                message: format!("Request delivered to counselor {counselor_id}"),
            },
        );
        Ok(())
    }

    fn accept_request(
        &mut self,
        connection_id: &str,
        request_id: &str,
    ) -> Result<(), BrokerError> {
        let counselor_id = match self.registry.role(connection_id) {
            Some(RoleClaim::Counselor { id }) => id.clone(),
            _ => return Err(BrokerError::Forbidden),
        };

        let (client_token, session_type) = {
            let request = self.requests.get(request_id).ok_or(BrokerError::NotFound)?;
            if request.counselor_id != counselor_id {
                // Addressed to someone else; leave it pending for its target
                return Err(BrokerError::Forbidden);
            }
            (request.client_token.clone(), request.session_type.clone())
        };

        if !self.pools.is_counselor_available(&counselor_id) {
            // Accepting while busy would double-book; the request is spent
            // and the client gets its one terminal notification.
            if let Some(request) = self.requests.take(request_id) {
                self.push_to_client(
                    &request.client_token,
                    ServerEvent::request_failed(
                        Some(request.id),
                        "The counselor is no longer available",
                    ),
                );
            }
            return Err(BrokerError::CounselorUnavailable);
        }

        if self.pools.client(&client_token).is_none() {
            // The client left after requesting; the cancel path usually
            // removes the request first, but a sweep can race it. If the
            // client is somehow still reachable it gets its terminal
            // notification here.
            if let Some(request) = self.requests.take(request_id) {
                self.push_to_client(
                    &request.client_token,
                    ServerEvent::request_failed(
                        Some(request.id),
                        "The request is no longer valid",
                    ),
                );
            }
            return Err(BrokerError::NotFound);
        }

        self.requests.take(request_id);
        self.open_session(
            &client_token,
            &counselor_id,
            &session_type,
            "The counselor accepted your session request".to_string(),
        );
        Ok(())
    }

    fn decline_request(
        &mut self,
        connection_id: &str,
        request_id: &str,
        reason: Option<String>,
    ) -> Result<(), BrokerError> {
        let counselor_id = match self.registry.role(connection_id) {
            Some(RoleClaim::Counselor { id }) => id.clone(),
            _ => return Err(BrokerError::Forbidden),
        };

        {
            let request = self.requests.get(request_id).ok_or(BrokerError::NotFound)?;
            if request.counselor_id != counselor_id {
                return Err(BrokerError::Forbidden);
            }
        }

        let Some(request) = self.requests.take(request_id) else {
            return Err(BrokerError::NotFound);
        };

        info!(request = %request.id, counselor = %counselor_id, "Request declined");
        // No automatic retry: the client stays pooled and acts on its own.
        self.push_to_client(
            &request.client_token,
            ServerEvent::RequestDeclined {
                request_id: request.id,
                message: reason
                    .unwrap_or_else(|| "The counselor declined your request".to_string()),
            },
        );
        Ok(())
    }

    // ---- session lifecycle ----

    fn send_message(
        &mut self,
        connection_id: &str,
        session_id: &str,
        content: &str,
    ) -> Result<(), BrokerError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or(BrokerError::NoActiveSession)?;

        let (sender_role, sender_id) = match self.registry.role(connection_id) {
            Some(RoleClaim::Client { token }) if *token == session.id => {
                (SenderRole::Client, token.clone())
            }
            Some(RoleClaim::Counselor { id }) if *id == session.counselor_id => {
                (SenderRole::Counselor, id.clone())
            }
            _ => return Err(BrokerError::Forbidden),
        };

        let content = content.trim();
        if content.is_empty() {
            return Err(BrokerError::EmptyContent);
        }

        let counselor_id = session.counselor_id.clone();
        let event = ServerEvent::NewMessage {
            id: generate_id("msg"),
            session_id: session_id.to_string(),
            sender_role,
            sender_id,
            content: content.to_string(),
            timestamp: now_ms(),
        };

        // Fan out to every participant, sender included, so both sides see
        // the same server-assigned ordering.
        self.push_to_client(session_id, event.clone());
        self.push_to_counselor(&counselor_id, event);
        Ok(())
    }

    fn end_session(
        &mut self,
        connection_id: &str,
        session_id: &str,
    ) -> Result<(), BrokerError> {
        let Some(session) = self.sessions.get(session_id) else {
            // Racing enders are expected; a second end is a no-op.
            debug!(session = %session_id, "End of unknown or already ended session ignored");
            return Ok(());
        };

        let role = match self.registry.role(connection_id) {
            Some(RoleClaim::Client { token }) if *token == session.id => SenderRole::Client,
            Some(RoleClaim::Counselor { id }) if *id == session.counselor_id => {
                SenderRole::Counselor
            }
            _ => return Err(BrokerError::Forbidden),
        };

        self.finish_session(
            session_id,
            &format!("Session ended by the {}", role.as_str()),
            &format!("ended-by-{}", role.as_str()),
        );
        Ok(())
    }

    /// Tear a session down once: notify both parties, restore the
    /// counselor's availability, and drop the session. Safe to call with an
    /// id that is already gone.
    fn finish_session(&mut self, session_id: &str, message: &str, reason: &str) {
        let Some(session) = self.sessions.remove(session_id) else {
            return;
        };

        let event = ServerEvent::session_ended(message, reason);
        self.push_to_client(&session.id, event.clone());
        self.push_to_counselor(&session.counselor_id, event);

        // No-op if the counselor has already disconnected or been evicted.
        self.pools
            .set_counselor_availability(&session.counselor_id, true);
        info!(session = %session_id, reason = %reason, "Session ended");
    }

    // ---- liveness ----

    fn liveness_signal(
        &mut self,
        connection_id: &str,
        available: Option<bool>,
    ) -> Result<(), BrokerError> {
        let status = match self.registry.role(connection_id).cloned() {
            Some(RoleClaim::Client { token }) => {
                self.pools.touch_client(&token);
                if self.sessions.get(&token).is_some() {
                    "in-session"
                } else {
                    "waiting"
                }
            }
            Some(RoleClaim::Counselor { id }) => {
                // A counselor the sweep evicted while its connection
                // survived re-enters the pool on its next signal instead
                // of being stranded until a full reconnect.
                if self.pools.counselor(&id).is_none() {
                    let mut entry = CounselorEntry::new(connection_id, Vec::new());
                    entry.available = false;
                    self.pools.add_counselor(id.clone(), entry);
                    info!(counselor = %id, "Counselor re-entered pool after eviction");
                }
                self.pools.touch_counselor(&id);
                if let Some(want) = available {
                    // Availability cannot be declared while mid-session;
                    // the session teardown restores it.
                    if !self.sessions.counselor_in_session(&id) {
                        self.pools.set_counselor_availability(&id, want);
                        if want {
                            self.try_match_waiting();
                        }
                    }
                }
                if self.pools.is_counselor_available(&id) {
                    "available"
                } else {
                    "busy"
                }
            }
            _ => "idle",
        };

        self.push_to_connection(
            connection_id,
            ServerEvent::LivenessAck {
                timestamp: now_ms(),
                status: status.to_string(),
            },
        );
        Ok(())
    }

    // ---- delivery ----

    /// Push an event to a connection. A vanished peer is a soft failure.
    fn push_to_connection(&self, connection_id: &str, event: ServerEvent) -> bool {
        match self.registry.sender(connection_id) {
            Some(sender) => {
                if sender.send(event).is_ok() {
                    true
                } else {
                    warn!(connection = %connection_id, "Delivery channel closed");
                    false
                }
            }
            None => {
                debug!(connection = %connection_id, "Delivery to unknown connection skipped");
                false
            }
        }
    }

    /// Push an event to a client by session token.
    fn push_to_client(&self, token: &str, event: ServerEvent) -> bool {
        match self.registry.client_sender(token) {
            Some(sender) => sender.send(event).is_ok(),
            None => {
                debug!(client = %token, "Client vanished before delivery");
                false
            }
        }
    }

    /// Push an event to a counselor by id.
    fn push_to_counselor(&self, counselor_id: &str, event: ServerEvent) -> bool {
        match self.registry.counselor_sender(counselor_id) {
            Some(sender) => sender.send(event).is_ok(),
            None => {
                debug!(counselor = %counselor_id, "Counselor vanished before delivery");
                false
            }
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

/// Broker statistics.
#[derive(Debug, Clone)]
pub struct BrokerStats {
    /// Live connections.
    pub connections: usize,
    /// Unmatched clients in the pool.
    pub waiting_clients: usize,
    /// Counselors in the pool, available or not.
    pub pooled_counselors: usize,
    /// Counselors available for matching.
    pub available_counselors: usize,
    /// Pending targeted requests.
    pub pending_requests: usize,
    /// Active sessions.
    pub active_sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn open(broker: &mut Broker, conn: &str) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        broker.connection_opened(conn, tx);
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn join_client(
        broker: &mut Broker,
        conn: &str,
        rx: &mut UnboundedReceiver<ServerEvent>,
    ) -> String {
        broker.handle_event(
            conn,
            ClientEvent::JoinAsClient {
                preferences: None,
                preferred_counselor_id: None,
            },
        );
        match rx.try_recv().unwrap() {
            ServerEvent::SessionCreated { session_id } => session_id,
            other => panic!("expected session-created, got {other:?}"),
        }
    }

    fn join_counselor(broker: &mut Broker, conn: &str, id: &str) {
        broker.handle_event(
            conn,
            ClientEvent::JoinAsCounselor {
                counselor_id: id.to_string(),
                specialties: vec![],
            },
        );
    }

    /// Reach the state "one client waiting, one counselor available": a
    /// matched pair ends its session (which does not auto-drain the pool)
    /// while a second client waits.
    ///
    /// Returns (broker, rx_waiting_client, waiting_token, rx_counselor).
    fn waiting_client_and_free_counselor() -> (
        Broker,
        UnboundedReceiver<ServerEvent>,
        String,
        UnboundedReceiver<ServerEvent>,
    ) {
        let mut broker = Broker::new();

        let mut rx_a = open(&mut broker, "conn-a");
        let token_a = join_client(&mut broker, "conn-a", &mut rx_a);

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        drain(&mut rx_a);
        drain(&mut rx_c);

        let mut rx_b = open(&mut broker, "conn-b");
        let token_b = join_client(&mut broker, "conn-b", &mut rx_b);
        drain(&mut rx_b);

        broker.handle_event(
            "conn-a",
            ClientEvent::EndSession {
                session_id: token_a,
            },
        );
        drain(&mut rx_a);
        drain(&mut rx_c);

        let stats = broker.stats();
        assert_eq!(stats.waiting_clients, 1);
        assert_eq!(stats.available_counselors, 1);
        assert_eq!(stats.active_sessions, 0);

        (broker, rx_b, token_b, rx_c)
    }

    fn request_session(broker: &mut Broker, conn: &str, counselor: &str) {
        broker.handle_event(
            conn,
            ClientEvent::RequestSession {
                counselor_id: counselor.to_string(),
                session_type: "video".to_string(),
                message: "I would like to talk".to_string(),
            },
        );
    }

    #[test]
    fn test_waiting_then_matched_on_counselor_join() {
        let mut broker = Broker::new();

        let mut rx_a = open(&mut broker, "conn-a");
        let token = join_client(&mut broker, "conn-a", &mut rx_a);
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerEvent::WaitingForMatch { .. }
        ));

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");

        let client_events = drain(&mut rx_a);
        let counselor_events = drain(&mut rx_c);

        let ServerEvent::SessionMatched { session_id, .. } = &client_events[0] else {
            panic!("client expected session-matched, got {client_events:?}");
        };
        assert_eq!(*session_id, token);

        // Counselor sees registration then the same session id
        assert!(matches!(
            counselor_events[0],
            ServerEvent::CounselorRegistered { .. }
        ));
        let ServerEvent::SessionMatched {
            session_id: counselor_side,
            ..
        } = &counselor_events[1]
        else {
            panic!("counselor expected session-matched, got {counselor_events:?}");
        };
        assert_eq!(*counselor_side, token);

        let stats = broker.stats();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.waiting_clients, 0);
        assert_eq!(stats.available_counselors, 0);
    }

    #[test]
    fn test_immediate_match_when_counselor_available() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        drain(&mut rx_c);

        let mut rx_a = open(&mut broker, "conn-a");
        join_client(&mut broker, "conn-a", &mut rx_a);

        // Straight to matched, no waiting notification
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerEvent::SessionMatched { .. }
        ));
    }

    #[test]
    fn test_counselor_never_double_booked() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");

        let mut rx_a = open(&mut broker, "conn-a");
        join_client(&mut broker, "conn-a", &mut rx_a);

        let mut rx_b = open(&mut broker, "conn-b");
        join_client(&mut broker, "conn-b", &mut rx_b);
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerEvent::WaitingForMatch { .. }
        ));

        let stats = broker.stats();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.waiting_clients, 1);
    }

    #[test]
    fn test_preferred_counselor_direct_match() {
        let mut broker = Broker::new();

        let mut rx_c1 = open(&mut broker, "conn-c1");
        join_counselor(&mut broker, "conn-c1", "coun_1");
        let mut rx_c2 = open(&mut broker, "conn-c2");
        join_counselor(&mut broker, "conn-c2", "coun_2");
        drain(&mut rx_c1);
        drain(&mut rx_c2);

        let mut rx_a = open(&mut broker, "conn-a");
        broker.handle_event(
            "conn-a",
            ClientEvent::JoinAsClient {
                preferences: None,
                preferred_counselor_id: Some("coun_2".to_string()),
            },
        );
        drain(&mut rx_a);

        // The preference wins over first-available ordering
        assert!(drain(&mut rx_c1).is_empty());
        assert!(matches!(
            rx_c2.try_recv().unwrap(),
            ServerEvent::SessionMatched { .. }
        ));
        assert_eq!(broker.stats().available_counselors, 1);
    }

    #[test]
    fn test_preferred_unavailable_falls_back_to_general() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        drain(&mut rx_c);

        let mut rx_a = open(&mut broker, "conn-a");
        broker.handle_event(
            "conn-a",
            ClientEvent::JoinAsClient {
                preferences: None,
                preferred_counselor_id: Some("coun_ghost".to_string()),
            },
        );

        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerEvent::SessionCreated { .. }
        ));
        let ServerEvent::SessionMatched { message, .. } = rx_a.try_recv().unwrap() else {
            panic!("expected fallback match");
        };
        // The client is told the fallback happened
        assert!(message.contains("unavailable"));
    }

    #[test]
    fn test_preferred_unavailable_no_counselors_waits() {
        let mut broker = Broker::new();

        let mut rx_a = open(&mut broker, "conn-a");
        broker.handle_event(
            "conn-a",
            ClientEvent::JoinAsClient {
                preferences: None,
                preferred_counselor_id: Some("coun_ghost".to_string()),
            },
        );
        drain(&mut rx_a);

        // Placed in the general pool, not an error
        assert_eq!(broker.stats().waiting_clients, 1);
    }

    #[test]
    fn test_request_accept_flow() {
        let (mut broker, mut rx_b, token_b, mut rx_c) = waiting_client_and_free_counselor();

        request_session(&mut broker, "conn-b", "coun_1");

        let ServerEvent::SessionRequest {
            request_id,
            session_id,
            session_type,
            ..
        } = rx_c.try_recv().unwrap()
        else {
            panic!("counselor expected session-request");
        };
        assert_eq!(session_id, token_b);
        assert_eq!(session_type, "video");
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerEvent::RequestSent { .. }
        ));

        broker.handle_event(
            "conn-c",
            ClientEvent::AcceptRequest {
                request_id: request_id.clone(),
            },
        );

        let ServerEvent::SessionMatched {
            session_id: client_side,
            session_type,
            ..
        } = rx_b.try_recv().unwrap()
        else {
            panic!("client expected session-matched");
        };
        assert_eq!(client_side, token_b);
        assert_eq!(session_type, "video");
        assert!(matches!(
            rx_c.try_recv().unwrap(),
            ServerEvent::SessionMatched { .. }
        ));

        let stats = broker.stats();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.available_counselors, 0);
        assert_eq!(stats.pending_requests, 0);

        // A second resolve of the same id collapses to NotFound
        broker.handle_event(
            "conn-c",
            ClientEvent::AcceptRequest { request_id },
        );
        let ServerEvent::Error { code, .. } = rx_c.try_recv().unwrap() else {
            panic!("expected error event");
        };
        assert_eq!(code, BrokerError::NotFound.code());
    }

    #[test]
    fn test_request_decline_flow() {
        let (mut broker, mut rx_b, _token_b, mut rx_c) = waiting_client_and_free_counselor();

        request_session(&mut broker, "conn-b", "coun_1");
        let ServerEvent::SessionRequest { request_id, .. } = rx_c.try_recv().unwrap() else {
            panic!("counselor expected session-request");
        };
        drain(&mut rx_b);

        broker.handle_event(
            "conn-c",
            ClientEvent::DeclineRequest {
                request_id: request_id.clone(),
                reason: Some("Not taking new sessions today".to_string()),
            },
        );

        let ServerEvent::RequestDeclined { message, .. } = rx_b.try_recv().unwrap() else {
            panic!("client expected request-declined");
        };
        assert_eq!(message, "Not taking new sessions today");

        // Counselor stays available; no retry is automatic
        let stats = broker.stats();
        assert_eq!(stats.available_counselors, 1);
        assert_eq!(stats.waiting_clients, 1);
        assert_eq!(stats.active_sessions, 0);

        // The request id is no longer resolvable
        broker.handle_event(
            "conn-c",
            ClientEvent::DeclineRequest {
                request_id,
                reason: None,
            },
        );
        let ServerEvent::Error { code, .. } = rx_c.try_recv().unwrap() else {
            panic!("expected error event");
        };
        assert_eq!(code, BrokerError::NotFound.code());
    }

    #[test]
    fn test_request_to_busy_counselor_fails() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        let mut rx_a = open(&mut broker, "conn-a");
        join_client(&mut broker, "conn-a", &mut rx_a);

        let mut rx_b = open(&mut broker, "conn-b");
        join_client(&mut broker, "conn-b", &mut rx_b);
        drain(&mut rx_b);
        drain(&mut rx_c);

        request_session(&mut broker, "conn-b", "coun_1");
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerEvent::RequestFailed { .. }
        ));
        // Nothing was left pending and the counselor saw nothing
        assert_eq!(broker.stats().pending_requests, 0);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn test_resolution_forbidden_for_wrong_counselor() {
        let (mut broker, mut rx_b, _token_b, mut rx_c1) = waiting_client_and_free_counselor();

        request_session(&mut broker, "conn-b", "coun_1");
        let ServerEvent::SessionRequest { request_id, .. } = rx_c1.try_recv().unwrap() else {
            panic!("counselor expected session-request");
        };
        drain(&mut rx_b);

        // A second counselor joins; the requesting client is committed to
        // its proposal and must not be auto-matched.
        let mut rx_c2 = open(&mut broker, "conn-c2");
        join_counselor(&mut broker, "conn-c2", "coun_2");
        drain(&mut rx_c2);
        assert_eq!(broker.stats().waiting_clients, 1);

        broker.handle_event(
            "conn-c2",
            ClientEvent::AcceptRequest {
                request_id: request_id.clone(),
            },
        );
        let ServerEvent::Error { code, .. } = rx_c2.try_recv().unwrap() else {
            panic!("expected error event");
        };
        assert_eq!(code, BrokerError::Forbidden.code());
        // Still pending for its real target
        assert_eq!(broker.stats().pending_requests, 1);

        broker.handle_event("conn-c", ClientEvent::AcceptRequest { request_id });
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerEvent::SessionMatched { .. }
        ));
    }

    #[test]
    fn test_client_disconnect_cancels_pending_request() {
        let (mut broker, mut rx_b, _token_b, mut rx_c) = waiting_client_and_free_counselor();

        request_session(&mut broker, "conn-b", "coun_1");
        let ServerEvent::SessionRequest { request_id, .. } = rx_c.try_recv().unwrap() else {
            panic!("counselor expected session-request");
        };
        drain(&mut rx_b);

        broker.connection_closed("conn-b");
        assert_eq!(broker.stats().pending_requests, 0);

        broker.handle_event("conn-c", ClientEvent::AcceptRequest { request_id });
        let ServerEvent::Error { code, .. } = rx_c.try_recv().unwrap() else {
            panic!("expected error event");
        };
        assert_eq!(code, BrokerError::NotFound.code());
    }

    #[test]
    fn test_message_fanout_includes_sender() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        let mut rx_a = open(&mut broker, "conn-a");
        let token = join_client(&mut broker, "conn-a", &mut rx_a);
        drain(&mut rx_a);
        drain(&mut rx_c);

        broker.handle_event(
            "conn-a",
            ClientEvent::SendMessage {
                session_id: token.clone(),
                content: "  hello there  ".to_string(),
            },
        );

        for rx in [&mut rx_a, &mut rx_c] {
            let ServerEvent::NewMessage {
                sender_role,
                sender_id,
                content,
                session_id,
                ..
            } = rx.try_recv().unwrap()
            else {
                panic!("expected new-message on both sides");
            };
            assert_eq!(sender_role, SenderRole::Client);
            assert_eq!(sender_id, token);
            assert_eq!(content, "hello there");
            assert_eq!(session_id, token);
        }

        broker.handle_event(
            "conn-c",
            ClientEvent::SendMessage {
                session_id: token,
                content: "hello back".to_string(),
            },
        );
        let ServerEvent::NewMessage { sender_role, .. } = rx_a.try_recv().unwrap() else {
            panic!("expected new-message");
        };
        assert_eq!(sender_role, SenderRole::Counselor);
    }

    #[test]
    fn test_message_rejections() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        let mut rx_a = open(&mut broker, "conn-a");
        let token = join_client(&mut broker, "conn-a", &mut rx_a);
        drain(&mut rx_a);
        drain(&mut rx_c);

        // Blank after trimming
        broker.handle_event(
            "conn-a",
            ClientEvent::SendMessage {
                session_id: token.clone(),
                content: "   ".to_string(),
            },
        );
        let ServerEvent::Error { code, .. } = rx_a.try_recv().unwrap() else {
            panic!("expected error event");
        };
        assert_eq!(code, BrokerError::EmptyContent.code());

        // Unknown session
        broker.handle_event(
            "conn-a",
            ClientEvent::SendMessage {
                session_id: "sess_bogus".to_string(),
                content: "hello".to_string(),
            },
        );
        let ServerEvent::Error { code, .. } = rx_a.try_recv().unwrap() else {
            panic!("expected error event");
        };
        assert_eq!(code, BrokerError::NoActiveSession.code());

        // A connection that never joined cannot post into the session
        let mut rx_x = open(&mut broker, "conn-x");
        broker.handle_event(
            "conn-x",
            ClientEvent::SendMessage {
                session_id: token,
                content: "intruding".to_string(),
            },
        );
        let ServerEvent::Error { code, .. } = rx_x.try_recv().unwrap() else {
            panic!("expected error event");
        };
        assert_eq!(code, BrokerError::Forbidden.code());
    }

    #[test]
    fn test_end_session_is_idempotent() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        let mut rx_a = open(&mut broker, "conn-a");
        let token = join_client(&mut broker, "conn-a", &mut rx_a);
        drain(&mut rx_a);
        drain(&mut rx_c);

        broker.handle_event(
            "conn-a",
            ClientEvent::EndSession {
                session_id: token.clone(),
            },
        );
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerEvent::SessionEnded { .. }
        ));
        assert!(matches!(
            rx_c.try_recv().unwrap(),
            ServerEvent::SessionEnded { .. }
        ));
        assert_eq!(broker.stats().available_counselors, 1);

        // Second end: no events, no error
        broker.handle_event(
            "conn-c",
            ClientEvent::EndSession {
                session_id: token,
            },
        );
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn test_counselor_disconnect_keeps_session_until_sweep() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        let mut rx_a = open(&mut broker, "conn-a");
        join_client(&mut broker, "conn-a", &mut rx_a);
        drain(&mut rx_a);
        drain(&mut rx_c);

        broker.connection_closed("conn-c");

        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerEvent::ParticipantDisconnected { .. }
        ));
        // Not ended yet: disconnect and explicit end are different signals
        assert_eq!(broker.stats().active_sessions, 1);

        broker.sweep();
        let ServerEvent::SessionEnded { reason, .. } = rx_a.try_recv().unwrap() else {
            panic!("expected session-ended after sweep");
        };
        assert_eq!(reason, "counselor-disconnected");
        assert_eq!(broker.stats().active_sessions, 0);
    }

    #[test]
    fn test_liveness_eviction() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        let mut rx_a = open(&mut broker, "conn-a");
        join_client(&mut broker, "conn-a", &mut rx_a);
        let mut rx_b = open(&mut broker, "conn-b");
        join_client(&mut broker, "conn-b", &mut rx_b);
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        // Past the staleness threshold with no signals
        broker.sweep_at(now_ms() + 120_000);

        // The stale counselor's session is force-ended with the client told
        let ServerEvent::SessionEnded { reason, .. } = rx_a.try_recv().unwrap() else {
            panic!("expected session-ended");
        };
        assert_eq!(reason, "counselor-disconnected");

        // The stale waiting client is removed silently
        assert!(drain(&mut rx_b).is_empty());

        let stats = broker.stats();
        assert_eq!(stats.pooled_counselors, 0);
        assert_eq!(stats.waiting_clients, 0);
        assert_eq!(stats.active_sessions, 0);
    }

    #[test]
    fn test_liveness_signal_refresh_prevents_eviction() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        drain(&mut rx_c);

        broker.handle_event("conn-c", ClientEvent::LivenessSignal { available: None });
        let ServerEvent::LivenessAck { status, .. } = rx_c.try_recv().unwrap() else {
            panic!("expected liveness-ack");
        };
        assert_eq!(status, "available");

        broker.sweep_at(now_ms() + 1_000);
        assert_eq!(broker.stats().pooled_counselors, 1);
    }

    #[test]
    fn test_liveness_availability_toggle_gates_matching() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        broker.handle_event(
            "conn-c",
            ClientEvent::LivenessSignal {
                available: Some(false),
            },
        );
        drain(&mut rx_c);

        let mut rx_a = open(&mut broker, "conn-a");
        join_client(&mut broker, "conn-a", &mut rx_a);
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerEvent::WaitingForMatch { .. }
        ));

        // Declaring availability triggers a match attempt
        broker.handle_event(
            "conn-c",
            ClientEvent::LivenessSignal {
                available: Some(true),
            },
        );
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerEvent::SessionMatched { .. }
        ));
    }

    #[test]
    fn test_role_claimed_exactly_once() {
        let mut broker = Broker::new();

        let mut rx = open(&mut broker, "conn-1");
        join_client(&mut broker, "conn-1", &mut rx);
        drain(&mut rx);

        join_counselor(&mut broker, "conn-1", "coun_1");
        let ServerEvent::Error { code, .. } = rx.try_recv().unwrap() else {
            panic!("expected error event");
        };
        assert_eq!(code, BrokerError::AlreadyClaimed.code());
    }

    #[test]
    fn test_request_while_in_session_rejected() {
        let mut broker = Broker::new();

        let mut rx_c1 = open(&mut broker, "conn-c1");
        join_counselor(&mut broker, "conn-c1", "coun_1");
        let mut rx_a = open(&mut broker, "conn-a");
        join_client(&mut broker, "conn-a", &mut rx_a);
        drain(&mut rx_a);
        drain(&mut rx_c1);

        let mut rx_c2 = open(&mut broker, "conn-c2");
        join_counselor(&mut broker, "conn-c2", "coun_2");
        drain(&mut rx_c2);

        // The matched client tries to court a second counselor
        request_session(&mut broker, "conn-a", "coun_2");

        // Exactly one notification, the rejection; nothing is pending and
        // the target counselor saw nothing
        let ServerEvent::Error { code, .. } = rx_a.try_recv().unwrap() else {
            panic!("expected error event");
        };
        assert_eq!(code, BrokerError::Forbidden.code());
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_c2).is_empty());
        assert_eq!(broker.stats().pending_requests, 0);
    }

    #[test]
    fn test_counselor_disconnect_cancels_inbound_requests() {
        let (mut broker, mut rx_b, _token_b, mut rx_c) = waiting_client_and_free_counselor();

        request_session(&mut broker, "conn-b", "coun_1");
        let ServerEvent::SessionRequest { request_id, .. } = rx_c.try_recv().unwrap() else {
            panic!("counselor expected session-request");
        };
        drain(&mut rx_b);

        broker.connection_closed("conn-c");

        // The client is told its proposal died with the counselor
        let ServerEvent::RequestFailed {
            request_id: failed_id,
            ..
        } = rx_b.try_recv().unwrap()
        else {
            panic!("client expected request-failed");
        };
        assert_eq!(failed_id, Some(request_id));
        assert_eq!(broker.stats().pending_requests, 0);
        // Still pooled and eligible for future matches
        assert_eq!(broker.stats().waiting_clients, 1);
    }

    #[test]
    fn test_counselor_rejoin_mid_session_stays_unavailable() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        let mut rx_a = open(&mut broker, "conn-a");
        join_client(&mut broker, "conn-a", &mut rx_a);
        drain(&mut rx_a);
        drain(&mut rx_c);

        broker.connection_closed("conn-c");
        drain(&mut rx_a);
        assert_eq!(broker.stats().active_sessions, 1);

        // Reconnect on a fresh connection while the session is still open
        let mut rx_c2 = open(&mut broker, "conn-c2");
        join_counselor(&mut broker, "conn-c2", "coun_1");
        drain(&mut rx_c2);

        assert_eq!(broker.stats().pooled_counselors, 1);
        assert_eq!(broker.stats().available_counselors, 0);

        // A new client waits instead of double-booking the counselor
        let mut rx_b = open(&mut broker, "conn-b");
        join_client(&mut broker, "conn-b", &mut rx_b);
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerEvent::WaitingForMatch { .. }
        ));
    }

    #[test]
    fn test_evicted_counselor_reenters_pool_on_liveness_signal() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        drain(&mut rx_c);

        // Evicted for silence, but the connection itself is still open
        broker.sweep_at(now_ms() + 120_000);
        assert_eq!(broker.stats().pooled_counselors, 0);

        broker.handle_event(
            "conn-c",
            ClientEvent::LivenessSignal {
                available: Some(true),
            },
        );
        let ServerEvent::LivenessAck { status, .. } = rx_c.try_recv().unwrap() else {
            panic!("expected liveness-ack");
        };
        assert_eq!(status, "available");
        assert_eq!(broker.stats().available_counselors, 1);

        // Back in business for matching
        let mut rx_a = open(&mut broker, "conn-a");
        join_client(&mut broker, "conn-a", &mut rx_a);
        drain(&mut rx_a);
        assert!(matches!(
            rx_c.try_recv().unwrap(),
            ServerEvent::SessionMatched { .. }
        ));
    }

    #[test]
    fn test_liveness_ack_status_reflects_state() {
        let mut broker = Broker::new();

        let mut rx_c = open(&mut broker, "conn-c");
        join_counselor(&mut broker, "conn-c", "coun_1");
        let mut rx_a = open(&mut broker, "conn-a");
        join_client(&mut broker, "conn-a", &mut rx_a);
        drain(&mut rx_a);
        drain(&mut rx_c);

        broker.handle_event("conn-c", ClientEvent::LivenessSignal { available: None });
        let ServerEvent::LivenessAck { status, .. } = rx_c.try_recv().unwrap() else {
            panic!("expected liveness-ack");
        };
        assert_eq!(status, "busy");

        broker.handle_event("conn-a", ClientEvent::LivenessSignal { available: None });
        let ServerEvent::LivenessAck { status, .. } = rx_a.try_recv().unwrap() else {
            panic!("expected liveness-ack");
        };
        assert_eq!(status, "in-session");
    }
}
