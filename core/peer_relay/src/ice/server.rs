//! Configured STUN/TURN servers and their measured latency
//!
//! The control client pushes a fresh list whenever it likes; the list is
//! replaced wholesale and negotiation engines read a snapshot of it. Each
//! distinct host is probed for round-trip time once per list, in the
//! background, through the injected [`LatencyOracle`].
//!
//! # URL Format
//!
//! ```text
//! stun:host[:port][?transport=udp|tcp]
//! turn:host[:port][?transport=udp|tcp]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::candidate::Transport;
use crate::events::LatencyOracle;
use crate::timer::lock;

// ============================================================================
// Constants
// ============================================================================

/// Port used when a server URL carries none
pub const DEFAULT_SERVER_PORT: u16 = 3478;

/// Default latency threshold for preferring a server, in milliseconds
pub const DEFAULT_ACCEPTABLE_LATENCY_MS: f64 = 250.0;

/// Upper bound on waiting for a pending latency probe during selection
const RTT_WAIT_LIMIT: Duration = Duration::from_secs(5);

// ============================================================================
// Errors
// ============================================================================

/// Errors when parsing a server URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceServerError {
    /// Not of the form `scheme:host[:port][?query]`
    MalformedUrl(String),
    /// Scheme other than `stun` or `turn`
    UnsupportedScheme(String),
}

impl fmt::Display for IceServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IceServerError::MalformedUrl(url) => write!(f, "malformed ICE server URL: {}", url),
            IceServerError::UnsupportedScheme(scheme) => {
                write!(f, "unsupported ICE server scheme: {}", scheme)
            }
        }
    }
}

impl std::error::Error for IceServerError {}

// ============================================================================
// Configuration
// ============================================================================

/// Latency probing settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyConfig {
    /// Probes per host, 0 disables probing
    pub ping_count: u32,
    /// Servers at or above this round trip are avoided when possible
    pub acceptable_latency_ms: f64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            ping_count: 1,
            acceptable_latency_ms: DEFAULT_ACCEPTABLE_LATENCY_MS,
        }
    }
}

/// One or many URLs, as the control client may send either
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Urls {
    One(String),
    Many(Vec<String>),
}

/// A server entry as received from the control client
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServerConfig {
    #[serde(default)]
    pub urls: Option<Urls>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// All URLs of this entry, `urls` taking precedence over `url`
    pub fn url_list(&self) -> Vec<String> {
        match (&self.urls, &self.url) {
            (Some(Urls::Many(urls)), _) => urls.clone(),
            (Some(Urls::One(url)), _) => vec![url.clone()],
            (None, Some(url)) => vec![url.clone()],
            (None, None) => Vec::new(),
        }
    }
}

// ============================================================================
// Server Addresses
// ============================================================================

/// Scheme of a server URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Stun,
    Turn,
}

/// A parsed server URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub kind: ServerKind,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
}

impl ServerAddress {
    /// `host:port` suitable for `ToSocketAddrs`
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host_port(), self.transport)
    }
}

/// Parse `stun|turn:host[:port][?transport=udp|tcp]`
pub fn parse_server_url(url: &str) -> Result<ServerAddress, IceServerError> {
    let malformed = || IceServerError::MalformedUrl(url.to_string());

    let (scheme, rest) = url.split_once(':').ok_or_else(malformed)?;
    let kind = match scheme.to_ascii_lowercase().as_str() {
        "stun" => ServerKind::Stun,
        "turn" => ServerKind::Turn,
        other => return Err(IceServerError::UnsupportedScheme(other.to_string())),
    };

    let rest = rest.trim_start_matches("//");
    let (authority, query) = match rest.split_once('?') {
        Some((authority, query)) => (authority, Some(query)),
        None => (rest, None),
    };

    let (host, port) = split_host_port(authority).ok_or_else(malformed)?;
    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'))
    {
        return Err(malformed());
    }

    let transport = query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| *key == "transport")
        .and_then(|(_, value)| Transport::parse(value))
        .unwrap_or(Transport::Udp);

    Ok(ServerAddress {
        kind,
        host: host.to_string(),
        port,
        transport,
    })
}

fn split_host_port(authority: &str) -> Option<(&str, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if after.is_empty() => DEFAULT_SERVER_PORT,
            None => return None,
        };
        return Some((host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, port.parse().ok()?)),
        None => Some((authority, DEFAULT_SERVER_PORT)),
    }
}

// ============================================================================
// Round Trip Time
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum RttState {
    Pending,
    Done(Option<f64>),
}

/// Asynchronously resolved round-trip time of one host
#[derive(Debug)]
pub struct RttCell {
    state: Mutex<RttState>,
    ready: Condvar,
}

impl RttCell {
    /// A cell still waiting for its probe
    pub fn pending() -> Self {
        Self {
            state: Mutex::new(RttState::Pending),
            ready: Condvar::new(),
        }
    }

    /// A cell that already holds its result
    pub fn resolved(rtt: Option<f64>) -> Self {
        Self {
            state: Mutex::new(RttState::Done(rtt)),
            ready: Condvar::new(),
        }
    }

    pub fn resolve(&self, rtt: Option<f64>) {
        *lock(&self.state) = RttState::Done(rtt);
        self.ready.notify_all();
    }

    /// Current value without waiting
    pub fn get(&self) -> Option<f64> {
        match *lock(&self.state) {
            RttState::Done(rtt) => rtt,
            RttState::Pending => None,
        }
    }

    /// Wait up to `limit` for the probe, then return what is known
    pub fn wait(&self, limit: Duration) -> Option<f64> {
        let deadline = Instant::now() + limit;
        let mut state = lock(&self.state);
        loop {
            match *state {
                RttState::Done(rtt) => return rtt,
                RttState::Pending => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    state = self
                        .ready
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
            }
        }
    }
}

// ============================================================================
// Ice Server
// ============================================================================

/// One configured STUN/TURN endpoint set
#[derive(Debug, Clone)]
pub struct IceServer {
    pub stun_addresses: Vec<ServerAddress>,
    pub turn_addresses: Vec<ServerAddress>,
    pub turn_username: String,
    pub turn_credential: String,
    rtt: Arc<RttCell>,
}

impl IceServer {
    /// Server without a latency measurement
    pub fn new(stun_addresses: Vec<ServerAddress>, turn_addresses: Vec<ServerAddress>) -> Self {
        Self {
            stun_addresses,
            turn_addresses,
            turn_username: String::new(),
            turn_credential: String::new(),
            rtt: Arc::new(RttCell::resolved(None)),
        }
    }

    /// Measured round trip, if already known
    pub fn round_trip_time(&self) -> Option<f64> {
        self.rtt.get()
    }

    /// Unmeasured servers count as acceptable
    pub fn has_acceptable_latency(&self, threshold_ms: f64) -> bool {
        match self.rtt.wait(RTT_WAIT_LIMIT) {
            Some(rtt) => rtt < threshold_ms,
            None => true,
        }
    }

    pub fn address_count(&self) -> usize {
        self.stun_addresses.len() + self.turn_addresses.len()
    }
}

// ============================================================================
// Server Registry
// ============================================================================

/// Process-wide list of candidate-harvesting servers
pub struct IceServers {
    servers: RwLock<Arc<Vec<IceServer>>>,
    oracle: Arc<dyn LatencyOracle>,
    latency: LatencyConfig,
}

impl IceServers {
    pub fn new(oracle: Arc<dyn LatencyOracle>, latency: LatencyConfig) -> Self {
        Self {
            servers: RwLock::new(Arc::new(Vec::new())),
            oracle,
            latency,
        }
    }

    pub fn latency_config(&self) -> LatencyConfig {
        self.latency
    }

    /// Replace the list
    ///
    /// Malformed URLs are logged and skipped. Every distinct host is probed
    /// once, the result shared by every server naming it.
    pub fn set(&self, configs: &[IceServerConfig]) {
        let mut rtt_cache: HashMap<String, Arc<RttCell>> = HashMap::new();
        let mut servers = Vec::with_capacity(configs.len());

        for config in configs {
            let mut server = IceServer::new(Vec::new(), Vec::new());
            server.turn_username = config.username.clone().unwrap_or_default();
            server.turn_credential = config.credential.clone().unwrap_or_default();

            for url in config.url_list() {
                let address = match parse_server_url(&url) {
                    Ok(address) => address,
                    Err(e) => {
                        log::warn!("Invalid ICE server URI: {} ({})", url, e);
                        continue;
                    }
                };

                if self.latency.ping_count > 0 {
                    let cell = rtt_cache
                        .entry(address.host.clone())
                        .or_insert_with(|| self.probe(&address.host));
                    server.rtt = Arc::clone(cell);
                }

                match address.kind {
                    ServerKind::Stun => server.stun_addresses.push(address),
                    ServerKind::Turn => server.turn_addresses.push(address),
                }
            }

            servers.push(server);
        }

        let total: usize = servers.iter().map(IceServer::address_count).sum();
        *self
            .servers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(servers);

        log::info!("Ice Servers set, total addresses: {}", total);
    }

    fn probe(&self, host: &str) -> Arc<RttCell> {
        let cell = Arc::new(RttCell::pending());
        let oracle = Arc::clone(&self.oracle);
        let target = Arc::clone(&cell);
        let host = host.to_string();
        let count = self.latency.ping_count;

        let spawned = thread::Builder::new()
            .name(format!("rtt-{}", host))
            .spawn(move || {
                let rtt = oracle.round_trip_time(&host, count);
                log::debug!("Round trip to {}: {:?} ms", host, rtt);
                target.resolve(rtt);
            });
        if let Err(e) = spawned {
            log::warn!("Could not start latency probe: {}", e);
            cell.resolve(None);
        }

        cell
    }

    /// Snapshot of every configured server
    pub fn all(&self) -> Arc<Vec<IceServer>> {
        Arc::clone(
            &self
                .servers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Servers to harvest against
    ///
    /// Prefers those with acceptable latency and falls back to all when none
    /// qualify or probing is disabled.
    pub fn viable(&self) -> Vec<IceServer> {
        let all = self.all();
        if self.latency.ping_count == 0 || all.is_empty() {
            return all.as_ref().clone();
        }

        let viable: Vec<IceServer> = all
            .iter()
            .filter(|s| s.has_acceptable_latency(self.latency.acceptable_latency_ms))
            .cloned()
            .collect();

        if viable.is_empty() {
            log::info!("Using all ice servers: {}", describe(&all));
            return all.as_ref().clone();
        }

        log::info!("Using all viable ice servers: {}", describe(&viable));
        viable
    }

    /// Number of configured servers
    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.all().is_empty()
    }
}

fn describe(servers: &[IceServer]) -> String {
    servers
        .iter()
        .map(|s| {
            let addrs: Vec<String> = s.turn_addresses.iter().map(|a| a.to_string()).collect();
            format!("[{}]", addrs.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Tests
// ============================================================================
