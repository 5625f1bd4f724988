//! Peer Relay Core
//!
//! This crate provides the connection engine of the ICE adapter:
//! - ICE negotiation per remote player (gathering, candidate exchange, checks)
//! - Peer lifecycle and the game session registry
//! - Liveness monitoring and automatic reconnection
//! - The GPGNet protocol spoken by the local game process
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  GPGNet (TCP)   ┌──────────────────────────────────────┐
//! │  Game        │◄───────────────►│ GpgnetServer                         │
//! │  process     │                 │                                      │
//! │              │  game UDP       │ GameSession ── Peer ── IceEngine ────┼──► remote
//! │              │◄───────────────►│   (registry)   (socket)  (agent)     │    adapter
//! └──────────────┘                 └──────────────────────────────────────┘
//! ```
//!
//! The outer orchestrator (RPC, option parsing) lives in the `ice-adapter`
//! binary and reaches in through [`events::AdapterEvents`] and the public
//! operations of [`session::GameSession`] and [`gpgnet::GpgnetServer`].

// ============================================================================
// Modules
// ============================================================================

/// Engine configuration (timeouts, port ranges)
pub mod config;

/// Outbound notification capability and latency oracle
pub mod events;

/// GPGNet wire protocol and the local game server
pub mod gpgnet;

/// ICE: candidates, servers, agent, checker and negotiation engine
pub mod ice;

/// Lock-free counters rendered in Prometheus text format
pub mod metrics;

/// Local interface enumeration and port binding helpers
pub mod net;

/// One remote player coupled to a local UDP socket
pub mod peer;

/// Registry of peers for the active game
pub mod session;

/// Scheduler, clock and cancellation primitives
pub mod timer;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::EngineConfig;
pub use events::{AdapterEvents, LatencyOracle};
pub use gpgnet::{GameState, GpgnetArg, GpgnetMessage, GpgnetServer, LobbyInitMode};
pub use ice::candidate::{CandidatePolicy, CandidatesMessage};
pub use ice::engine::IceState;
pub use ice::server::{IceServerConfig, IceServers, LatencyConfig};
pub use metrics::Metrics;
pub use peer::Peer;
pub use session::{GameSession, RelayContext, SessionSlot};
