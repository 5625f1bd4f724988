//! ICE negotiation for one remote player per engine
//!
//! Leaf modules first: candidate codec, STUN binding, connectivity checks and
//! the server list feed the UDP agent; the engine drives an agent through the
//! negotiation state machine and the checker watches the link once it is up.

pub mod agent;
pub mod candidate;
pub mod checker;
pub mod connectivity;
pub mod engine;
pub mod server;
pub mod stun;
