//! Engine configuration
//!
//! Every timing constant of the negotiation engine is an explicit field so
//! tests can shrink them and the binary can expose them.

use std::ops::RangeInclusive;
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Lowest port used for ICE agent sockets
pub const MINIMUM_ICE_PORT: u16 = 6112;

/// Width of the ICE port range above the minimum
pub const ICE_PORT_SPAN: u16 = 1000;

const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_AWAITING_CANDIDATES_TIMEOUT: Duration = Duration::from_secs(6);
const DEFAULT_CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_CONNECTIVITY_POLL_INTERVAL: Duration = Duration::from_millis(20);
const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_ECHO_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_ECHO_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ATTEMPT_WINDOW: Duration = Duration::from_secs(2 * 60);
const DEFAULT_RELAY_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Engine Configuration
// ============================================================================

/// Timeouts and intervals of one negotiation engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Hard limit on candidate harvesting
    pub gather_timeout: Duration,
    /// How long an offer waits for the remote candidates
    pub awaiting_candidates_timeout: Duration,
    /// Limit on connectivity establishment
    pub connectivity_timeout: Duration,
    /// Agent state poll interval during establishment
    pub connectivity_poll_interval: Duration,
    /// Delay before re-offering after an attempt that never connected
    pub reconnect_backoff: Duration,
    /// Echo send interval of the connectivity checker
    pub echo_interval: Duration,
    /// Silence after which the checker declares the link lost
    pub echo_timeout: Duration,
    /// Window in which connectivity attempts narrow the candidate policy
    pub attempt_window: Duration,
    /// Interval at which a relayed allocation is refreshed
    pub relay_refresh_interval: Duration,
    /// Ports the ICE agent binds in
    pub ice_port_range: RangeInclusive<u16>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
            awaiting_candidates_timeout: DEFAULT_AWAITING_CANDIDATES_TIMEOUT,
            connectivity_timeout: DEFAULT_CONNECTIVITY_TIMEOUT,
            connectivity_poll_interval: DEFAULT_CONNECTIVITY_POLL_INTERVAL,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            echo_interval: DEFAULT_ECHO_INTERVAL,
            echo_timeout: DEFAULT_ECHO_TIMEOUT,
            attempt_window: DEFAULT_ATTEMPT_WINDOW,
            relay_refresh_interval: DEFAULT_RELAY_REFRESH_INTERVAL,
            ice_port_range: MINIMUM_ICE_PORT..=MINIMUM_ICE_PORT + ICE_PORT_SPAN,
        }
    }
}
