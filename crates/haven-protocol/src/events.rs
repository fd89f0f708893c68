//! Event types for the Haven protocol.
//!
//! Events are the fundamental unit of communication between callers and the
//! broker. Each event is serialized using MessagePack with a `type` tag so
//! both sides agree on a closed set of message shapes.

use serde::{Deserialize, Serialize};

/// The role a connection has claimed, as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Client,
    Counselor,
}

impl SenderRole {
    /// Human-readable role name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SenderRole::Client => "client",
            SenderRole::Counselor => "counselor",
        }
    }
}

/// An event sent from a caller to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Join the broker as an anonymous client and start matching.
    #[serde(rename = "join-as-client")]
    JoinAsClient {
        /// Free-form matching preferences.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferences: Option<serde_json::Value>,
        /// Preferred counselor for the direct-preference shortcut.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferred_counselor_id: Option<String>,
    },

    /// Join the broker as an available counselor.
    #[serde(rename = "join-as-counselor")]
    JoinAsCounselor {
        /// Caller-supplied counselor identifier.
        counselor_id: String,
        /// Declared specialty tags.
        #[serde(default)]
        specialties: Vec<String>,
    },

    /// Propose a session to one named counselor.
    #[serde(rename = "request-session")]
    RequestSession {
        /// Target counselor.
        counselor_id: String,
        /// Session type hint (e.g. "chat", "audio", "video").
        session_type: String,
        /// Free-text message shown to the counselor.
        message: String,
    },

    /// Accept a pending session request (counselor only).
    #[serde(rename = "accept-request")]
    AcceptRequest {
        /// The request being resolved.
        request_id: String,
    },

    /// Decline a pending session request (counselor only).
    #[serde(rename = "decline-request")]
    DeclineRequest {
        /// The request being resolved.
        request_id: String,
        /// Optional reason relayed to the client.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Send a message inside an active session.
    #[serde(rename = "send-message")]
    SendMessage {
        /// Target session.
        session_id: String,
        /// Message body.
        content: String,
    },

    /// Explicitly end an active session.
    #[serde(rename = "end-session")]
    EndSession {
        /// Target session.
        session_id: String,
    },

    /// Refresh the liveness timestamp, optionally updating availability.
    #[serde(rename = "liveness-signal")]
    LivenessSignal {
        /// For counselors: declare availability for new matches.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        available: Option<bool>,
    },
}

/// An event pushed from the broker to a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A client joined; carries its broker-assigned session token.
    #[serde(rename = "session-created")]
    SessionCreated {
        /// Session token, later reused as the session id on match.
        session_id: String,
    },

    /// A counselor joined and is available.
    #[serde(rename = "counselor-registered")]
    CounselorRegistered {
        /// The registered counselor id.
        counselor_id: String,
    },

    /// A match succeeded; sent to both parties.
    #[serde(rename = "session-matched")]
    SessionMatched {
        /// Shared session id.
        session_id: String,
        /// Session type hint carried from the match.
        session_type: String,
        /// Human-readable match context.
        message: String,
    },

    /// No counselor is available yet; the client stays pooled.
    #[serde(rename = "waiting-for-match")]
    WaitingForMatch {
        /// Human-readable status.
        message: String,
        /// Estimated wait in seconds, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_wait: Option<u64>,
    },

    /// A targeted session proposal, delivered to the counselor.
    #[serde(rename = "session-request")]
    SessionRequest {
        /// Request id the counselor resolves with.
        request_id: String,
        /// The requesting client's session token.
        session_id: String,
        /// Session type hint.
        session_type: String,
        /// Free-text message from the client.
        message: String,
    },

    /// The proposal was delivered to the counselor.
    #[serde(rename = "request-sent")]
    RequestSent {
        /// The created request id.
        request_id: String,
        /// Human-readable status.
        message: String,
    },

    /// The proposal failed terminally (unavailable or unreachable target).
    #[serde(rename = "request-failed")]
    RequestFailed {
        /// Request id, when one was allocated before the failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Human-readable reason.
        message: String,
    },

    /// The counselor declined the proposal.
    #[serde(rename = "request-declined")]
    RequestDeclined {
        /// The declined request id.
        request_id: String,
        /// Decline reason, as given by the counselor or a default.
        message: String,
    },

    /// A session message, fanned out to every participant.
    #[serde(rename = "new-message")]
    NewMessage {
        /// Broker-assigned message id.
        id: String,
        /// Session the message belongs to.
        session_id: String,
        /// Role of the sender.
        sender_role: SenderRole,
        /// Identifier of the sender (session token or counselor id).
        sender_id: String,
        /// Message body.
        content: String,
        /// Server-assigned Unix millis timestamp.
        timestamp: u64,
    },

    /// The other participant's connection dropped; the session stays open.
    #[serde(rename = "participant-disconnected")]
    ParticipantDisconnected {
        /// Human-readable status.
        message: String,
    },

    /// The session ended.
    #[serde(rename = "session-ended")]
    SessionEnded {
        /// Human-readable status.
        message: String,
        /// Machine-readable reason ("ended-by-client", "counselor-disconnected", ...).
        reason: String,
    },

    /// Response to a liveness signal.
    #[serde(rename = "liveness-ack")]
    LivenessAck {
        /// Server-assigned Unix millis timestamp.
        timestamp: u64,
        /// Current state of the sender ("available", "busy", "waiting", "in-session").
        status: String,
    },

    /// A request was rejected; the connection stays open.
    #[serde(rename = "error")]
    Error {
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },
}

impl ServerEvent {
    /// Create a new Error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a new SessionMatched event.
    #[must_use]
    pub fn matched(
        session_id: impl Into<String>,
        session_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ServerEvent::SessionMatched {
            session_id: session_id.into(),
            session_type: session_type.into(),
            message: message.into(),
        }
    }

    /// Create a new WaitingForMatch event without a wait estimate.
    #[must_use]
    pub fn waiting(message: impl Into<String>) -> Self {
        ServerEvent::WaitingForMatch {
            message: message.into(),
            estimated_wait: None,
        }
    }

    /// Create a new RequestFailed event.
    #[must_use]
    pub fn request_failed(request_id: Option<String>, message: impl Into<String>) -> Self {
        ServerEvent::RequestFailed {
            request_id,
            message: message.into(),
        }
    }

    /// Create a new SessionEnded event.
    #[must_use]
    pub fn session_ended(message: impl Into<String>, reason: impl Into<String>) -> Self {
        ServerEvent::SessionEnded {
            message: message.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_tags() {
        let event = ClientEvent::JoinAsClient {
            preferences: Some(json!({"topic": "anxiety"})),
            preferred_counselor_id: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "join-as-client");
        // Absent optional fields must not appear on the wire
        assert!(value.get("preferred_counselor_id").is_none());

        let event = ServerEvent::waiting("no counselor available yet");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "waiting-for-match");
    }

    #[test]
    fn test_sender_role_serialization() {
        let value = serde_json::to_value(SenderRole::Counselor).unwrap();
        assert_eq!(value, "counselor");
        assert_eq!(SenderRole::Client.as_str(), "client");
    }

    #[test]
    fn test_specialties_default() {
        // Counselors may omit specialties entirely
        let event: ClientEvent = serde_json::from_value(json!({
            "type": "join-as-counselor",
            "counselor_id": "coun_1",
        }))
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinAsCounselor {
                counselor_id: "coun_1".to_string(),
                specialties: vec![],
            }
        );
    }
}
