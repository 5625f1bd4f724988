//! ICE candidates and the candidate codec
//!
//! Candidate types and priority calculation follow RFC 8445. The codec packs
//! local candidates into the `CandidatesMessage` exchanged over signaling and
//! unpacks a remote message into candidates the agent can check against.
//!
//! # Wire Shape (JSON)
//!
//! ```text
//! {"srcId":1,"destId":2,"password":"..","ufrag":"..",
//!  "candidates":[{"foundation":"..","protocol":"udp","priority":2130706431,
//!                 "ip":"192.168.1.10","port":6120,"type":"HOST_CANDIDATE",
//!                 "generation":0,"id":"7","relAddr":null,"relPort":0}]}
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants (RFC 8445 Section 5.1.2.1)
// ============================================================================

/// Type preference for host candidates (highest priority)
const HOST_TYPE_PREF: u32 = 126;

/// Type preference for server reflexive candidates
const SRFLX_TYPE_PREF: u32 = 100;

/// Type preference for peer reflexive candidates
const PRFLX_TYPE_PREF: u32 = 110;

/// Type preference for relayed candidates (lowest priority)
const RELAY_TYPE_PREF: u32 = 0;

/// Local preference for IPv4 addresses
pub const IPV4_LOCAL_PREF: u32 = 65535;

/// Local preference for IPv6 addresses
pub const IPV6_LOCAL_PREF: u32 = 65534;

/// Component ID (game data uses a single component)
const COMPONENT_ID: u32 = 1;

/// Host candidates are only offered on the first attempt inside the window
pub const FORCE_SRFLX_COUNT: usize = 1;

/// Reflexive candidates are only offered on the first two attempts inside the window
pub const FORCE_RELAY_COUNT: usize = 2;

// ============================================================================
// Candidate Types
// ============================================================================

/// Type of ICE candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Local network interface address
    #[serde(rename = "HOST_CANDIDATE")]
    Host,
    /// Public address learned from a STUN server
    #[serde(rename = "SERVER_REFLEXIVE_CANDIDATE")]
    ServerReflexive,
    /// Address discovered during connectivity checks
    #[serde(rename = "PEER_REFLEXIVE_CANDIDATE")]
    PeerReflexive,
    /// Address allocated on a TURN server
    #[serde(rename = "RELAYED_CANDIDATE")]
    Relayed,
}

impl CandidateType {
    /// Get the type preference value for priority calculation
    pub fn type_preference(&self) -> u32 {
        match self {
            CandidateType::Host => HOST_TYPE_PREF,
            CandidateType::ServerReflexive => SRFLX_TYPE_PREF,
            CandidateType::PeerReflexive => PRFLX_TYPE_PREF,
            CandidateType::Relayed => RELAY_TYPE_PREF,
        }
    }

    /// Server and peer reflexive candidates share one policy switch
    pub fn is_reflexive(&self) -> bool {
        matches!(
            self,
            CandidateType::ServerReflexive | CandidateType::PeerReflexive
        )
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateType::Host => write!(f, "host"),
            CandidateType::ServerReflexive => write!(f, "srflx"),
            CandidateType::PeerReflexive => write!(f, "prflx"),
            CandidateType::Relayed => write!(f, "relay"),
        }
    }
}

/// Transport protocol of a candidate or server address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    /// Parse a protocol name, case-insensitive
    pub fn parse(name: &str) -> Option<Transport> {
        match name.to_ascii_lowercase().as_str() {
            "udp" => Some(Transport::Udp),
            "tcp" => Some(Transport::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

// ============================================================================
// Candidate
// ============================================================================

/// An ICE candidate representing a potential address for connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Type of candidate (host, srflx, prflx, relay)
    pub candidate_type: CandidateType,
    /// Transport protocol
    pub transport: Transport,
    /// Transport address (IP:port)
    pub address: SocketAddr,
    /// Priority (higher = more preferred)
    pub priority: u32,
    /// Foundation string for candidate pairing
    pub foundation: String,
    /// Related address (host base for srflx, srflx for relay)
    pub related_address: Option<SocketAddr>,
}

impl Candidate {
    /// Create a new candidate with calculated priority
    pub fn new(
        candidate_type: CandidateType,
        address: SocketAddr,
        related_address: Option<SocketAddr>,
    ) -> Self {
        Self::with_local_preference(
            candidate_type,
            address,
            related_address,
            local_preference(&address),
        )
    }

    /// Create a candidate with an explicit local preference
    ///
    /// Agents use this to give each interface a distinct priority.
    pub fn with_local_preference(
        candidate_type: CandidateType,
        address: SocketAddr,
        related_address: Option<SocketAddr>,
        local_pref: u32,
    ) -> Self {
        let priority = calculate_priority(candidate_type.type_preference(), local_pref, COMPONENT_ID);
        let foundation = generate_foundation(candidate_type, &address);

        Self {
            candidate_type,
            transport: Transport::Udp,
            address,
            priority,
            foundation,
            related_address,
        }
    }

    /// Create a host candidate from a local address
    pub fn host(address: SocketAddr) -> Self {
        Self::new(CandidateType::Host, address, None)
    }

    /// Create a server reflexive candidate from a STUN response
    pub fn server_reflexive(public_address: SocketAddr, base_address: SocketAddr) -> Self {
        Self::new(CandidateType::ServerReflexive, public_address, Some(base_address))
    }

    /// Create a peer reflexive candidate learned from an inbound check
    pub fn peer_reflexive(address: SocketAddr) -> Self {
        Self::new(CandidateType::PeerReflexive, address, None)
    }

    /// Create a relayed candidate
    pub fn relayed(relay_address: SocketAddr, base_address: SocketAddr) -> Self {
        Self::new(CandidateType::Relayed, relay_address, Some(base_address))
    }

    /// Check if this is a loopback candidate
    pub fn is_loopback(&self) -> bool {
        self.address.ip().is_loopback()
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} priority {} foundation {}",
            self.candidate_type, self.address, self.priority, self.foundation
        )
    }
}

// ============================================================================
// Priority Calculation (RFC 8445 Section 5.1.2.1)
// ============================================================================

/// Calculate candidate priority per RFC 8445
///
/// Formula: priority = (2^24 * type_preference) + (2^8 * local_preference) + (256 - component_id)
pub fn calculate_priority(type_pref: u32, local_pref: u32, component_id: u32) -> u32 {
    let type_pref = type_pref.min(126);
    let local_pref = local_pref.min(65535);
    let component_id = component_id.clamp(1, 256);

    (type_pref << 24) | (local_pref << 8) | (256 - component_id)
}

/// Calculate local preference based on address family
fn local_preference(addr: &SocketAddr) -> u32 {
    match addr.ip() {
        IpAddr::V4(_) => IPV4_LOCAL_PREF,
        IpAddr::V6(_) => IPV6_LOCAL_PREF,
    }
}

/// Same foundation = same type and base IP (port doesn't matter)
fn generate_foundation(candidate_type: CandidateType, addr: &SocketAddr) -> String {
    format!("{}_{}", candidate_type, addr.ip())
}

/// Gather host candidates from local interface addresses
///
/// Each address gets a distinct local preference so no two host candidates
/// share a priority.
pub fn gather_host_candidates(local_addrs: &[SocketAddr], include_loopback: bool) -> Vec<Candidate> {
    local_addrs
        .iter()
        .filter(|addr| include_loopback || !addr.ip().is_loopback())
        .enumerate()
        .map(|(idx, &addr)| {
            let local_pref = local_preference(&addr).saturating_sub(idx as u32);
            Candidate::with_local_preference(CandidateType::Host, addr, None, local_pref)
        })
        .collect()
}

/// Build a server reflexive candidate from a STUN mapped address
///
/// Returns `None` when the mapped address equals the base (no NAT present).
pub fn gather_reflexive_candidate(
    reflexive_addr: SocketAddr,
    base_addr: SocketAddr,
) -> Option<Candidate> {
    if reflexive_addr == base_addr {
        return None;
    }
    Some(Candidate::server_reflexive(reflexive_addr, base_addr))
}

/// Sort candidates by priority (highest first)
pub fn sort_candidates_by_priority(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
}

// ============================================================================
// Candidate Policy
// ============================================================================

/// Which candidate types may be offered to / accepted from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePolicy {
    pub allow_host: bool,
    pub allow_reflexive: bool,
    pub allow_relay: bool,
}

impl CandidatePolicy {
    /// Every candidate type allowed
    pub fn allow_all() -> Self {
        Self {
            allow_host: true,
            allow_reflexive: true,
            allow_relay: true,
        }
    }

    /// Relayed candidates only
    pub fn force_relay() -> Self {
        Self {
            allow_host: false,
            allow_reflexive: false,
            allow_relay: true,
        }
    }

    /// Whether a candidate of this type passes the policy
    pub fn allows(&self, candidate_type: CandidateType) -> bool {
        match candidate_type {
            CandidateType::Host => self.allow_host,
            CandidateType::ServerReflexive | CandidateType::PeerReflexive => self.allow_reflexive,
            CandidateType::Relayed => self.allow_relay,
        }
    }

    /// Narrow the policy by the number of recent connectivity attempts
    ///
    /// Host candidates survive only the first attempt in the window, reflexive
    /// candidates the first two. Relay is never narrowed.
    pub fn narrowed(&self, previous_attempts: usize) -> Self {
        Self {
            allow_host: self.allow_host && previous_attempts < FORCE_SRFLX_COUNT,
            allow_reflexive: self.allow_reflexive && previous_attempts < FORCE_RELAY_COUNT,
            allow_relay: self.allow_relay,
        }
    }

    /// True if at least one type is disallowed
    pub fn is_restricted(&self) -> bool {
        !(self.allow_host && self.allow_reflexive && self.allow_relay)
    }
}

impl Default for CandidatePolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

// ============================================================================
// Candidate Messages
// ============================================================================

/// Short-lived ICE credentials of one side of a negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub password: String,
}

/// A candidate as carried inside a `CandidatesMessage`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePacket {
    pub foundation: String,
    pub protocol: String,
    pub priority: i64,
    #[serde(default)]
    pub ip: Option<String>,
    pub port: i32,
    #[serde(rename = "type")]
    pub candidate_type: CandidateType,
    pub generation: i32,
    pub id: String,
    #[serde(default)]
    pub rel_addr: Option<String>,
    #[serde(default)]
    pub rel_port: i32,
}

/// Candidates of one side, exchanged over the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatesMessage {
    pub src_id: i32,
    pub dest_id: i32,
    pub password: String,
    pub ufrag: String,
    pub candidates: Vec<CandidatePacket>,
}

impl CandidatesMessage {
    /// Parse from the JSON form used on the signaling channel
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to the JSON form used on the signaling channel
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Short summary for logs, e.g. `HOST_CANDIDATE(udp), RELAYED_CANDIDATE(udp)`
    pub fn describe(&self) -> String {
        self.candidates
            .iter()
            .map(|c| format!("{:?}({})", c.candidate_type, c.protocol))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Process-wide source of stable candidate ids
#[derive(Debug, Default)]
pub struct CandidateIds {
    next: AtomicU64,
}

impl CandidateIds {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// Remote side of a negotiation as unpacked from a `CandidatesMessage`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCandidates {
    pub credentials: IceCredentials,
    pub candidates: Vec<Candidate>,
}

// ============================================================================
// Pack / Unpack
// ============================================================================

/// Pack local candidates into a message for the remote peer
///
/// Disallowed types are dropped, the rest get fresh ids and are ordered by
/// descending priority.
pub fn pack_candidates(
    src_id: i32,
    dest_id: i32,
    credentials: &IceCredentials,
    generation: i32,
    local_candidates: &[Candidate],
    policy: CandidatePolicy,
    ids: &CandidateIds,
) -> CandidatesMessage {
    if policy.is_restricted() {
        log::info!(
            "Peer {}: Disallowing own candidates, host: {}, reflexive: {}, relay: {}",
            dest_id,
            policy.allow_host,
            policy.allow_reflexive,
            policy.allow_relay
        );
    }

    let mut packets: Vec<CandidatePacket> = local_candidates
        .iter()
        .filter(|c| policy.allows(c.candidate_type))
        .map(|c| CandidatePacket {
            foundation: c.foundation.clone(),
            protocol: c.transport.to_string(),
            priority: i64::from(c.priority),
            ip: Some(c.address.ip().to_string()),
            port: i32::from(c.address.port()),
            candidate_type: c.candidate_type,
            generation,
            id: ids.next_id(),
            rel_addr: c.related_address.map(|a| a.ip().to_string()),
            rel_port: c.related_address.map(|a| i32::from(a.port())).unwrap_or(0),
        })
        .collect();

    packets.sort_by(|a, b| b.priority.cmp(&a.priority));

    CandidatesMessage {
        src_id,
        dest_id,
        password: credentials.password.clone(),
        ufrag: credentials.ufrag.clone(),
        candidates: packets,
    }
}

/// Unpack a remote message into candidates accepted by the policy
///
/// Candidates of another generation or without a usable address are skipped
/// one by one. A related address is kept only when it names a remote
/// candidate already known (from `known` or earlier in the same message).
pub fn unpack_candidates(
    message: &CandidatesMessage,
    generation: i32,
    policy: CandidatePolicy,
    known: &[Candidate],
) -> RemoteCandidates {
    if policy.is_restricted() {
        log::info!(
            "Peer {}: Disallowing incoming candidates, host: {}, reflexive: {}, relay: {}",
            message.src_id,
            policy.allow_host,
            policy.allow_reflexive,
            policy.allow_relay
        );
    }

    let mut packets: Vec<&CandidatePacket> = message.candidates.iter().collect();
    packets.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut resolved: Vec<Candidate> = Vec::new();
    let mut accepted: Vec<Candidate> = Vec::new();

    for packet in packets {
        let candidate = match decode_packet(packet, generation) {
            Ok(candidate) => candidate,
            Err(reason) => {
                log::debug!("Skipping remote candidate {}: {}", packet.id, reason);
                continue;
            }
        };

        let related = related_address(packet).filter(|addr| {
            known
                .iter()
                .chain(resolved.iter())
                .any(|c| c.address == *addr)
        });

        let candidate = Candidate {
            related_address: related,
            ..candidate
        };
        resolved.push(candidate.clone());

        if policy.allows(candidate.candidate_type) {
            accepted.push(candidate);
        }
    }

    RemoteCandidates {
        credentials: IceCredentials {
            ufrag: message.ufrag.clone(),
            password: message.password.clone(),
        },
        candidates: accepted,
    }
}

/// Why a remote candidate was skipped during unpacking
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpackError {
    /// Candidate belongs to another generation
    GenerationMismatch { expected: i32, actual: i32 },
    /// No IP given
    MissingIp,
    /// IP does not parse
    InvalidIp(String),
    /// Port outside 1..=65535
    InvalidPort(i32),
    /// Transport other than UDP/TCP
    UnknownProtocol(String),
    /// Priority does not fit in 32 bits
    InvalidPriority(i64),
}

impl fmt::Display for UnpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnpackError::GenerationMismatch { expected, actual } => {
                write!(f, "generation {} does not match {}", actual, expected)
            }
            UnpackError::MissingIp => write!(f, "missing ip"),
            UnpackError::InvalidIp(ip) => write!(f, "invalid ip {}", ip),
            UnpackError::InvalidPort(port) => write!(f, "invalid port {}", port),
            UnpackError::UnknownProtocol(p) => write!(f, "unknown protocol {}", p),
            UnpackError::InvalidPriority(p) => write!(f, "invalid priority {}", p),
        }
    }
}

impl std::error::Error for UnpackError {}

fn decode_packet(packet: &CandidatePacket, generation: i32) -> Result<Candidate, UnpackError> {
    if packet.generation != generation {
        return Err(UnpackError::GenerationMismatch {
            expected: generation,
            actual: packet.generation,
        });
    }

    let ip = packet.ip.as_deref().ok_or(UnpackError::MissingIp)?;
    if packet.port <= 0 || packet.port > i32::from(u16::MAX) {
        return Err(UnpackError::InvalidPort(packet.port));
    }
    let ip: IpAddr = ip.parse().map_err(|_| UnpackError::InvalidIp(ip.to_string()))?;
    let transport = Transport::parse(&packet.protocol)
        .ok_or_else(|| UnpackError::UnknownProtocol(packet.protocol.clone()))?;
    let priority =
        u32::try_from(packet.priority).map_err(|_| UnpackError::InvalidPriority(packet.priority))?;

    Ok(Candidate {
        candidate_type: packet.candidate_type,
        transport,
        address: SocketAddr::new(ip, packet.port as u16),
        priority,
        foundation: packet.foundation.clone(),
        related_address: None,
    })
}

fn related_address(packet: &CandidatePacket) -> Option<SocketAddr> {
    let ip: IpAddr = packet.rel_addr.as_deref()?.parse().ok()?;
    if packet.rel_port <= 0 || packet.rel_port > i32::from(u16::MAX) {
        return None;
    }
    Some(SocketAddr::new(ip, packet.rel_port as u16))
}

// ============================================================================
// Tests
// ============================================================================
