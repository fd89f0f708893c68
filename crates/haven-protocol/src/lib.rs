//! # haven-protocol
//!
//! Wire protocol definitions for the Haven session broker.
//!
//! This crate defines the binary protocol spoken between callers (clients
//! and counselors) and the broker: the closed set of event types and the
//! codec that frames them.
//!
//! ## Event Types
//!
//! - `join-as-client` / `join-as-counselor` - Enter the matching pools
//! - `request-session` / `accept-request` / `decline-request` - Targeted proposals
//! - `send-message` / `end-session` - Active session control
//! - `liveness-signal` - Keepalive and availability updates
//!
//! ## Example
//!
//! ```rust
//! use haven_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::SendMessage {
//!     session_id: "sess_1".to_string(),
//!     content: "Hello".to_string(),
//! };
//!
//! // Encode and decode
//! let encoded = codec::encode(&event).unwrap();
//! let decoded: ClientEvent = codec::decode(&encoded).unwrap();
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, encode, ProtocolError};
pub use events::{ClientEvent, SenderRole, ServerEvent};
