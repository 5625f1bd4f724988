//! Outbound notifications and the latency oracle
//!
//! The core never talks to the control client directly. Whatever owns the
//! RPC channel implements [`AdapterEvents`] and hands it to the session and
//! the GPGNet server.

use serde_json::Value;

use crate::ice::candidate::CandidatesMessage;

/// Notifications emitted towards the controlling client
pub trait AdapterEvents: Send + Sync {
    /// Local candidates ready to be forwarded to the remote adapter
    fn on_ice_msg(&self, message: &CandidatesMessage);

    /// ICE state of the link to `remote_id` changed
    fn on_ice_connection_state_changed(&self, local_id: i32, remote_id: i32, state: &str);

    /// Link to `remote_id` connected or lost
    fn on_connected(&self, local_id: i32, remote_id: i32, connected: bool);

    /// A GPGNet message arrived from the game
    fn on_gpgnet_message_received(&self, header: &str, args: &[Value]);

    /// The game connected to or disconnected from the GPGNet server
    fn on_connection_state_changed(&self, state: &str);

    /// A working link was lost and is being re-established
    fn on_reconnecting(&self, remote_id: i32, remote_login: &str) {
        log::info!("Reconnecting to {}({}) (connection lost)", remote_login, remote_id);
    }
}

/// Source of round-trip-time estimates for candidate servers
pub trait LatencyOracle: Send + Sync {
    /// Average round trip to `host` over `count` probes, in milliseconds
    ///
    /// `None` when the host could not be measured.
    fn round_trip_time(&self, host: &str, count: u32) -> Option<f64>;
}

/// Oracle that never measures anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLatency;

impl LatencyOracle for NoLatency {
    fn round_trip_time(&self, _host: &str, _count: u32) -> Option<f64> {
        None
    }
}
