//! # haven-core
//!
//! Matching, session lifecycle, and liveness for the Haven broker.
//!
//! This crate provides the broker's components:
//!
//! - **ConnectionRegistry** - Live connections and their claimed roles
//! - **WaitingPools** - Ordered pools of available counselors and waiting clients
//! - **RequestBroker** - Targeted session proposals (accept/decline)
//! - **SessionStore** - Active sessions between one client and one counselor
//! - **Broker** - The event-driven state machine tying them together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Connection │────▶│   Broker    │────▶│ WaitingPools │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!                        │       │
//!                        ▼       ▼
//!               ┌──────────┐   ┌──────────┐
//!               │ Requests │   │ Sessions │
//!               └──────────┘   └──────────┘
//! ```
//!
//! All state is owned by one `Broker` and mutated from a single task; see
//! `Broker` for the concurrency contract.

pub mod broker;
pub mod ids;
pub mod pools;
pub mod registry;
pub mod requests;
pub mod sessions;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerStats};
pub use pools::{ClientEntry, CounselorEntry, WaitingPools};
pub use registry::{ConnectionId, ConnectionRegistry, EventSender, RoleClaim};
pub use requests::{PendingRequest, RequestBroker};
pub use sessions::{ActiveSession, SessionStore};
