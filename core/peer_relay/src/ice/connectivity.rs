//! Connectivity checks between candidate pairs
//!
//! Implements ICE-style connectivity checks using authenticated binding
//! requests/responses exchanged directly between two agents.
//!
//! # Protocol Overview
//!
//! ```text
//! Controlling                                        Controlled
//!   │                                                    │
//!   │─── BindingRequest (txn, username, HMAC) ─────────►│
//!   │◄── BindingResponse (txn, mapped, HMAC) ───────────│
//!   │                                                    │
//!   │   (first succeeded pair is nominated)              │
//!   │─── BindingRequest (use_candidate) ───────────────►│  selects pair
//!   │◄── BindingResponse ───────────────────────────────│
//!   │   selects pair                                     │
//! ```
//!
//! # Candidate Pair Priority (RFC 8445 Section 6.1.2.3)
//!
//! ```text
//! pair_priority = 2^32 * MIN(G,D) + 2 * MAX(G,D) + (G > D ? 1 : 0)
//! ```
//! where G = controlling agent priority, D = controlled agent priority
//!
//! # Integrity
//!
//! Both directions are signed with the password of the answering agent:
//! `HMAC-SHA256(password, transaction_id || fields)`.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ring::hmac;
use serde::{Deserialize, Serialize};

use super::candidate::{Candidate, CandidateType};
use super::stun::{generate_transaction_id, TRANSACTION_ID_LEN};

// ============================================================================
// Constants
// ============================================================================

/// Prefix that marks a connectivity-check datagram on the agent socket
pub const CHECK_MAGIC: [u8; 4] = [0x00, b'I', b'C', b'E'];

/// Initial retransmit interval
pub const INITIAL_RTO: Duration = Duration::from_millis(100);

/// Maximum retransmit interval
pub const MAX_RTO: Duration = Duration::from_millis(1600);

/// Maximum number of transmissions per check
pub const MAX_RETRANSMITS: u32 = 5;

/// Default limit for the whole check list
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between sending binding requests to different pairs
pub const PACE_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Binding Messages
// ============================================================================

/// Binding request sent to verify connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRequest {
    /// Unique transaction identifier
    pub transaction_id: [u8; TRANSACTION_ID_LEN],
    /// `remote_ufrag:local_ufrag` from the sender's point of view
    pub username: String,
    /// Priority a peer reflexive candidate learned from this request gets
    pub priority: u32,
    /// Whether the sender is the controlling agent
    pub controlling: bool,
    /// Nomination flag (controlling agent only)
    pub use_candidate: bool,
    /// HMAC-SHA256 over the fields above
    pub integrity: Vec<u8>,
}

/// Binding response confirming connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingResponse {
    /// Transaction ID from the request
    pub transaction_id: [u8; TRANSACTION_ID_LEN],
    /// Whether the check succeeded
    pub success: bool,
    /// Source address the request was seen from
    pub mapped_address: Option<SocketAddr>,
    /// HMAC-SHA256 over the fields above
    pub integrity: Vec<u8>,
}

/// Binding message (request or response)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingMessage {
    Request(BindingRequest),
    Response(BindingResponse),
}

impl BindingRequest {
    /// Create a signed request
    ///
    /// `password` is the remote agent's password.
    pub fn signed(
        transaction_id: [u8; TRANSACTION_ID_LEN],
        username: String,
        priority: u32,
        controlling: bool,
        use_candidate: bool,
        password: &str,
    ) -> Self {
        let mut request = Self {
            transaction_id,
            username,
            priority,
            controlling,
            use_candidate,
            integrity: Vec::new(),
        };
        request.integrity = sign(password, &request.signed_bytes());
        request
    }

    /// Check the integrity against our own password
    pub fn verify(&self, password: &str) -> bool {
        verify(password, &self.signed_bytes(), &self.integrity)
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TRANSACTION_ID_LEN + self.username.len() + 6);
        buf.extend_from_slice(&self.transaction_id);
        buf.extend_from_slice(self.username.as_bytes());
        buf.extend_from_slice(&self.priority.to_be_bytes());
        buf.push(self.controlling as u8);
        buf.push(self.use_candidate as u8);
        buf
    }
}

impl BindingResponse {
    /// Create a signed success response
    ///
    /// `password` is our own password (the one the requester signed with).
    pub fn success(
        transaction_id: [u8; TRANSACTION_ID_LEN],
        mapped_address: SocketAddr,
        password: &str,
    ) -> Self {
        let mut response = Self {
            transaction_id,
            success: true,
            mapped_address: Some(mapped_address),
            integrity: Vec::new(),
        };
        response.integrity = sign(password, &response.signed_bytes());
        response
    }

    /// Create a signed failure response
    pub fn failure(transaction_id: [u8; TRANSACTION_ID_LEN], password: &str) -> Self {
        let mut response = Self {
            transaction_id,
            success: false,
            mapped_address: None,
            integrity: Vec::new(),
        };
        response.integrity = sign(password, &response.signed_bytes());
        response
    }

    /// Check the integrity against the remote agent's password
    pub fn verify(&self, password: &str) -> bool {
        verify(password, &self.signed_bytes(), &self.integrity)
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TRANSACTION_ID_LEN + 32);
        buf.extend_from_slice(&self.transaction_id);
        buf.push(self.success as u8);
        if let Some(addr) = self.mapped_address {
            buf.extend_from_slice(addr.to_string().as_bytes());
        }
        buf
    }
}

fn sign(password: &str, data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, password.as_bytes());
    hmac::sign(&key, data).as_ref().to_vec()
}

fn verify(password: &str, data: &[u8], tag: &[u8]) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, password.as_bytes());
    hmac::verify(&key, data, tag).is_ok()
}

// ============================================================================
// Candidate Pairs
// ============================================================================

/// State of a connectivity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    /// Waiting to be scheduled
    Frozen,
    /// Ready to send binding request
    Waiting,
    /// Request sent, awaiting response
    InProgress,
    /// Check succeeded
    Succeeded,
    /// Check failed
    Failed,
}

/// A pair of local and remote candidates for connectivity checking
#[derive(Debug, Clone)]
pub struct CandidatePair {
    /// Local candidate
    pub local: Candidate,
    /// Remote candidate
    pub remote: Candidate,
    /// Pair priority (higher = try first)
    pub priority: u64,
    /// Foundation string (for frozen/unfrozen logic)
    pub foundation: String,
    /// Current state of the check
    pub state: CheckState,
    /// Number of times the current request has been sent
    pub transmit_count: u32,
    /// When the last request was sent
    pub last_sent: Option<Instant>,
    /// Transaction ID of outstanding request
    pub transaction_id: Option<[u8; TRANSACTION_ID_LEN]>,
    /// Whether this is the nominated pair
    pub nominated: bool,
}

impl CandidatePair {
    /// Create a new candidate pair
    pub fn new(local: Candidate, remote: Candidate, is_controlling: bool) -> Self {
        let priority = calculate_pair_priority(local.priority, remote.priority, is_controlling);
        let foundation = format!("{}:{}", local.foundation, remote.foundation);

        Self {
            local,
            remote,
            priority,
            foundation,
            state: CheckState::Frozen,
            transmit_count: 0,
            last_sent: None,
            transaction_id: None,
            nominated: false,
        }
    }

    /// Check if this pair needs retransmission
    pub fn needs_retransmit(&self) -> bool {
        if self.state != CheckState::InProgress || self.transmit_count >= MAX_RETRANSMITS {
            return false;
        }

        match self.last_sent {
            Some(sent) => sent.elapsed() >= self.current_rto(),
            None => true,
        }
    }

    /// Get current retransmit timeout (exponential backoff)
    pub fn current_rto(&self) -> Duration {
        let multiplier = 1u32 << self.transmit_count.min(4);
        (INITIAL_RTO * multiplier).min(MAX_RTO)
    }

    /// Whether every transmission went unanswered
    fn is_exhausted(&self) -> bool {
        self.state == CheckState::InProgress
            && self.transmit_count >= MAX_RETRANSMITS
            && self
                .last_sent
                .map(|sent| sent.elapsed() >= self.current_rto())
                .unwrap_or(true)
    }

    /// Mark as in progress with a fresh transaction ID
    fn start_check(&mut self) -> Outgoing {
        let transaction_id = generate_transaction_id();
        self.transaction_id = Some(transaction_id);
        self.state = CheckState::InProgress;
        self.transmit_count = 1;
        self.last_sent = Some(Instant::now());
        self.outgoing(transaction_id)
    }

    /// Record a retransmission
    fn record_retransmit(&mut self) {
        self.transmit_count += 1;
        self.last_sent = Some(Instant::now());
    }

    fn outgoing(&self, transaction_id: [u8; TRANSACTION_ID_LEN]) -> Outgoing {
        Outgoing {
            transaction_id,
            remote: self.remote.address,
            use_candidate: self.nominated,
        }
    }
}

/// Calculate pair priority per RFC 8445 Section 6.1.2.3
///
/// Formula: 2^32 * MIN(G,D) + 2 * MAX(G,D) + (G > D ? 1 : 0)
/// where G = controlling priority, D = controlled priority
pub fn calculate_pair_priority(
    local_priority: u32,
    remote_priority: u32,
    is_controlling: bool,
) -> u64 {
    let (g, d) = if is_controlling {
        (local_priority as u64, remote_priority as u64)
    } else {
        (remote_priority as u64, local_priority as u64)
    };

    let min = g.min(d);
    let max = g.max(d);
    let tie_breaker = if g > d { 1u64 } else { 0u64 };

    (1u64 << 32) * min + 2 * max + tie_breaker
}

/// A binding request the agent should put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outgoing {
    pub transaction_id: [u8; TRANSACTION_ID_LEN],
    pub remote: SocketAddr,
    pub use_candidate: bool,
}

// ============================================================================
// Check List
// ============================================================================

/// Manages all candidate pairs and their connectivity checks
#[derive(Debug)]
pub struct CheckList {
    /// All candidate pairs, sorted by priority
    pairs: Vec<CandidatePair>,
    /// Pairs to check ahead of the ordinary schedule
    triggered: VecDeque<usize>,
    /// When checking started
    start_time: Option<Instant>,
    /// Limit for the whole list
    timeout: Duration,
    /// Whether we are the controlling agent
    is_controlling: bool,
    /// Index of next pair to check
    next_check_index: usize,
    /// When last check was sent
    last_check_time: Option<Instant>,
}

impl CheckList {
    /// Create a new check list
    pub fn new(is_controlling: bool, timeout: Duration) -> Self {
        Self {
            pairs: Vec::new(),
            triggered: VecDeque::new(),
            start_time: None,
            timeout,
            is_controlling,
            next_check_index: 0,
            last_check_time: None,
        }
    }

    /// Add candidate pairs from local and remote candidates
    pub fn add_pairs(&mut self, local_candidates: &[Candidate], remote_candidates: &[Candidate]) {
        for local in local_candidates {
            for remote in remote_candidates {
                // Only pair candidates of same IP family
                if local.address.is_ipv4() != remote.address.is_ipv4() {
                    continue;
                }

                // A signaled candidate replaces one learned from an inbound check
                if let Some(existing) = self
                    .pairs
                    .iter_mut()
                    .find(|p| p.local.address == local.address && p.remote.address == remote.address)
                {
                    if existing.remote.candidate_type == CandidateType::PeerReflexive {
                        let upgraded =
                            CandidatePair::new(local.clone(), remote.clone(), self.is_controlling);
                        existing.remote = upgraded.remote;
                        existing.priority = upgraded.priority;
                        existing.foundation = upgraded.foundation;
                    }
                    continue;
                }

                let pair = CandidatePair::new(local.clone(), remote.clone(), self.is_controlling);
                self.pairs.push(pair);
            }
        }

        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.triggered.clear();
        self.next_check_index = 0;
        self.unfreeze_initial_pairs();
    }

    /// Unfreeze the first pair with each unique foundation
    fn unfreeze_initial_pairs(&mut self) {
        let mut seen_foundations = HashSet::new();

        for pair in &mut self.pairs {
            if pair.state == CheckState::Frozen && seen_foundations.insert(pair.foundation.clone()) {
                pair.state = CheckState::Waiting;
            }
        }
    }

    /// Start the checking process
    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
        self.last_check_time = None;
        self.next_check_index = 0;
    }

    /// Whether `start` has been called
    pub fn is_started(&self) -> bool {
        self.start_time.is_some()
    }

    /// Get the next binding request to send (if any)
    ///
    /// Order: retransmissions, triggered checks, then waiting pairs by
    /// priority. Paced at one request per `PACE_INTERVAL`.
    pub fn next_request(&mut self) -> Option<Outgoing> {
        self.start_time?;

        if let Some(last) = self.last_check_time {
            if last.elapsed() < PACE_INTERVAL {
                return None;
            }
        }

        for pair in self.pairs.iter_mut() {
            if pair.needs_retransmit() {
                pair.record_retransmit();
                if let Some(txn_id) = pair.transaction_id {
                    self.last_check_time = Some(Instant::now());
                    return Some(pair.outgoing(txn_id));
                }
            }
        }

        while let Some(idx) = self.triggered.pop_front() {
            if let Some(pair) = self.pairs.get_mut(idx) {
                if matches!(pair.state, CheckState::Waiting | CheckState::Frozen | CheckState::Failed) {
                    self.last_check_time = Some(Instant::now());
                    return Some(pair.start_check());
                }
            }
        }

        while self.next_check_index < self.pairs.len() {
            let idx = self.next_check_index;
            self.next_check_index += 1;

            if self.pairs[idx].state == CheckState::Waiting {
                self.last_check_time = Some(Instant::now());
                return Some(self.pairs[idx].start_check());
            }
        }

        // Nothing waiting in order: pick up pairs unfrozen after the sweep
        if let Some(idx) = self
            .pairs
            .iter()
            .position(|p| p.state == CheckState::Waiting)
        {
            self.last_check_time = Some(Instant::now());
            return Some(self.pairs[idx].start_check());
        }

        None
    }

    /// Handle a verified binding response
    ///
    /// Returns the index of the pair that matched (if any)
    pub fn handle_response(&mut self, response: &BindingResponse) -> Option<usize> {
        let idx = self
            .pairs
            .iter()
            .position(|p| p.transaction_id == Some(response.transaction_id))?;

        let pair = &mut self.pairs[idx];
        if pair.state != CheckState::InProgress {
            return Some(idx);
        }

        pair.state = if response.success {
            CheckState::Succeeded
        } else {
            CheckState::Failed
        };

        if pair.state == CheckState::Succeeded {
            let foundation = pair.foundation.clone();
            self.unfreeze_by_foundation(&foundation);
        }

        Some(idx)
    }

    /// Unfreeze all frozen pairs with the given foundation
    fn unfreeze_by_foundation(&mut self, foundation: &str) {
        for pair in &mut self.pairs {
            if pair.state == CheckState::Frozen && pair.foundation == foundation {
                pair.state = CheckState::Waiting;
            }
        }
    }

    /// Schedule a triggered check towards `remote` after an inbound request
    ///
    /// Unknown sources become peer reflexive remote candidates paired with
    /// `base`. Returns the pair index.
    pub fn trigger_check(&mut self, remote: SocketAddr, priority: u32, base: &Candidate) -> usize {
        let idx = match self.find_remote(remote) {
            Some(idx) => idx,
            None => {
                let prflx = Candidate {
                    priority,
                    ..Candidate::new(CandidateType::PeerReflexive, remote, None)
                };
                let pair = CandidatePair::new(base.clone(), prflx, self.is_controlling);
                self.pairs.push(pair);
                self.pairs.len() - 1
            }
        };

        if matches!(
            self.pairs[idx].state,
            CheckState::Frozen | CheckState::Waiting | CheckState::Failed
        ) {
            self.pairs[idx].state = CheckState::Waiting;
            if !self.triggered.contains(&idx) {
                self.triggered.push_back(idx);
            }
        }

        idx
    }

    fn find_remote(&self, remote: SocketAddr) -> Option<usize> {
        self.pairs.iter().position(|p| p.remote.address == remote)
    }

    /// Handle timeout for all in-progress pairs
    pub fn handle_timeouts(&mut self) {
        let timed_out = self.is_timed_out();

        for pair in &mut self.pairs {
            if pair.state == CheckState::InProgress && (pair.is_exhausted() || timed_out) {
                pair.state = CheckState::Failed;
            }
        }
    }

    /// Nominate a successful pair (controlling side)
    ///
    /// Restarts the check on that pair with the nomination flag and returns
    /// the request to send.
    pub fn nominate(&mut self, index: usize) -> Option<Outgoing> {
        let pair = self.pairs.get_mut(index)?;
        if pair.state != CheckState::Succeeded || pair.nominated {
            return None;
        }
        pair.nominated = true;
        self.last_check_time = Some(Instant::now());
        Some(pair.start_check())
    }

    /// Accept a nomination received from the controlling side
    ///
    /// Returns the pair index if `remote` names a known pair.
    pub fn remote_nominated(&mut self, remote: SocketAddr) -> Option<usize> {
        let idx = self.find_remote(remote)?;
        let pair = &mut self.pairs[idx];
        pair.nominated = true;
        pair.state = CheckState::Succeeded;
        Some(idx)
    }

    /// The nominated pair once its check has succeeded
    pub fn selected(&self) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .filter(|p| p.nominated && p.state == CheckState::Succeeded)
            .max_by_key(|p| p.priority)
    }

    /// Index of the best succeeded pair (if any)
    pub fn best_succeeded(&self) -> Option<usize> {
        self.pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == CheckState::Succeeded)
            .max_by_key(|(_, p)| p.priority)
            .map(|(idx, _)| idx)
    }

    /// Check if all checks are complete
    pub fn is_complete(&self) -> bool {
        self.pairs
            .iter()
            .all(|p| matches!(p.state, CheckState::Succeeded | CheckState::Failed))
    }

    /// Whether no pair can succeed anymore
    pub fn is_failed(&self) -> bool {
        if self.is_timed_out() {
            return self.selected().is_none();
        }
        !self.pairs.is_empty()
            && self.pairs.iter().all(|p| p.state == CheckState::Failed)
            && self.triggered.is_empty()
    }

    /// Check if checking has timed out overall
    pub fn is_timed_out(&self) -> bool {
        match self.start_time {
            Some(start) => start.elapsed() >= self.timeout,
            None => false,
        }
    }

    /// Get number of pairs
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Get pairs by state
    pub fn pairs_by_state(&self, state: CheckState) -> impl Iterator<Item = &CandidatePair> {
        self.pairs.iter().filter(move |p| p.state == state)
    }

    /// Get a pair by index
    pub fn get_pair(&self, index: usize) -> Option<&CandidatePair> {
        self.pairs.get(index)
    }
}

// ============================================================================
// Message Encoding
// ============================================================================

/// Encode a binding message with the check prefix
pub fn encode_check(msg: &BindingMessage) -> Result<Vec<u8>, String> {
    let payload = bincode::serialize(msg).map_err(|e| e.to_string())?;
    let mut buf = Vec::with_capacity(CHECK_MAGIC.len() + payload.len());
    buf.extend_from_slice(&CHECK_MAGIC);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Whether a datagram carries a connectivity check
pub fn is_check(data: &[u8]) -> bool {
    data.starts_with(&CHECK_MAGIC)
}

/// Decode a binding message (prefix included)
pub fn decode_check(data: &[u8]) -> Result<BindingMessage, String> {
    if !is_check(data) {
        return Err("missing check prefix".to_string());
    }
    bincode::deserialize(&data[CHECK_MAGIC.len()..]).map_err(|e| e.to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWORD: &str = "0123456789abcdefghijkl";

    fn host_candidate(addr: &str) -> Candidate {
        Candidate::host(addr.parse().unwrap())
    }

    fn srflx_candidate(public: &str, base: &str) -> Candidate {
        Candidate::server_reflexive(public.parse().unwrap(), base.parse().unwrap())
    }

    fn started_list(local: &[&str], remote: &[&str]) -> CheckList {
        let mut list = CheckList::new(true, CHECK_TIMEOUT);
        let local: Vec<Candidate> = local.iter().map(|a| host_candidate(a)).collect();
        let remote: Vec<Candidate> = remote.iter().map(|a| host_candidate(a)).collect();
        list.add_pairs(&local, &remote);
        list.start();
        list
    }

    fn success(out: &Outgoing) -> BindingResponse {
        BindingResponse::success(out.transaction_id, "203.0.113.9:7000".parse().unwrap(), PASSWORD)
    }

    #[test]
    fn test_request_integrity() {
        let req = BindingRequest::signed([3u8; 12], "ab:cd".to_string(), 1000, true, false, PASSWORD);
        assert!(req.verify(PASSWORD));
        assert!(!req.verify("wrong-password"));

        let mut tampered = req.clone();
        tampered.use_candidate = true;
        assert!(!tampered.verify(PASSWORD));
    }

    #[test]
    fn test_response_integrity() {
        let resp = BindingResponse::success([4u8; 12], "192.168.1.1:5000".parse().unwrap(), PASSWORD);
        assert!(resp.success);
        assert!(resp.verify(PASSWORD));

        let mut tampered = resp.clone();
        tampered.mapped_address = Some("192.168.1.2:5000".parse().unwrap());
        assert!(!tampered.verify(PASSWORD));

        let failure = BindingResponse::failure([5u8; 12], PASSWORD);
        assert!(!failure.success);
        assert!(failure.mapped_address.is_none());
        assert!(failure.verify(PASSWORD));
    }

    #[test]
    fn test_check_encoding_has_prefix() {
        let req = BindingRequest::signed([1u8; 12], "a:b".to_string(), 1, false, false, PASSWORD);
        let msg = BindingMessage::Request(req);

        let encoded = encode_check(&msg).unwrap();
        assert!(is_check(&encoded));
        assert_eq!(decode_check(&encoded).unwrap(), msg);

        assert!(!is_check(b"dgame payload"));
        assert!(decode_check(b"dgame payload").is_err());
    }

    #[test]
    fn test_pair_priority_controlling() {
        let priority = calculate_pair_priority(100, 50, true);
        let expected = (1u64 << 32) * 50 + 2 * 100 + 1;
        assert_eq!(priority, expected);
    }

    #[test]
    fn test_pair_priority_controlled() {
        // Controlled agent: remote is G, local is D
        let priority = calculate_pair_priority(50, 100, false);
        let expected = (1u64 << 32) * 50 + 2 * 100 + 1;
        assert_eq!(priority, expected);
    }

    #[test]
    fn test_check_list_priority_sorting() {
        let mut list = CheckList::new(true, CHECK_TIMEOUT);

        let local = vec![
            srflx_candidate("203.0.113.1:5000", "192.168.1.100:5000"),
            host_candidate("192.168.1.100:5000"),
        ];
        let remote = vec![host_candidate("192.168.1.200:5000")];
        list.add_pairs(&local, &remote);

        assert_eq!(list.pair_count(), 2);
        assert_eq!(list.get_pair(0).unwrap().local.candidate_type, CandidateType::Host);
    }

    #[test]
    fn test_ipv4_ipv6_separation() {
        let mut list = CheckList::new(true, CHECK_TIMEOUT);
        let local = vec![host_candidate("192.168.1.100:5000"), host_candidate("[::1]:5000")];
        let remote = vec![host_candidate("192.168.1.200:5000")];

        list.add_pairs(&local, &remote);
        assert_eq!(list.pair_count(), 1);
    }

    #[test]
    fn test_check_list_success_and_nomination() {
        let mut list = started_list(&["192.168.1.100:5000"], &["192.168.1.200:5000"]);

        let out = list.next_request().unwrap();
        assert_eq!(out.remote, "192.168.1.200:5000".parse::<SocketAddr>().unwrap());
        assert!(!out.use_candidate);

        assert_eq!(list.handle_response(&success(&out)), Some(0));
        assert_eq!(list.best_succeeded(), Some(0));
        assert!(list.selected().is_none());

        let nomination = list.nominate(0).unwrap();
        assert!(nomination.use_candidate);
        assert_ne!(nomination.transaction_id, out.transaction_id);
        assert!(list.nominate(0).is_none());

        list.handle_response(&success(&nomination));
        let selected = list.selected().unwrap();
        assert!(selected.nominated);
        assert!(list.is_complete());
    }

    #[test]
    fn test_check_list_pacing() {
        let mut list = started_list(
            &["192.168.1.100:5000"],
            &["192.168.1.200:5000", "192.168.1.201:5000"],
        );

        assert!(list.next_request().is_some());
        assert!(list.next_request().is_none());

        std::thread::sleep(PACE_INTERVAL + Duration::from_millis(5));
        assert!(list.next_request().is_some());
    }

    #[test]
    fn test_triggered_check_for_unknown_source() {
        let mut list = started_list(&["192.168.1.100:5000"], &["192.168.1.200:5000"]);
        let base = host_candidate("192.168.1.100:5000");
        let source: SocketAddr = "203.0.113.77:40000".parse().unwrap();

        let idx = list.trigger_check(source, 12345, &base);
        let pair = list.get_pair(idx).unwrap();
        assert_eq!(pair.remote.candidate_type, CandidateType::PeerReflexive);
        assert_eq!(pair.remote.priority, 12345);

        // Triggered check goes out before the ordinary schedule
        let out = list.next_request().unwrap();
        assert_eq!(out.remote, source);
    }

    #[test]
    fn test_signaled_candidate_upgrades_peer_reflexive() {
        let mut list = CheckList::new(false, CHECK_TIMEOUT);
        let base = host_candidate("192.168.1.100:5000");
        let source: SocketAddr = "192.168.1.200:5000".parse().unwrap();

        list.trigger_check(source, 1, &base);
        list.add_pairs(&[base], &[host_candidate("192.168.1.200:5000")]);

        assert_eq!(list.pair_count(), 1);
        assert_eq!(list.get_pair(0).unwrap().remote.candidate_type, CandidateType::Host);
    }

    #[test]
    fn test_remote_nomination_selects_pair() {
        let mut list = CheckList::new(false, CHECK_TIMEOUT);
        list.add_pairs(
            &[host_candidate("192.168.1.100:5000")],
            &[host_candidate("192.168.1.200:5000")],
        );

        assert!(list.remote_nominated("10.0.0.1:1".parse().unwrap()).is_none());
        let idx = list.remote_nominated("192.168.1.200:5000".parse().unwrap()).unwrap();
        assert_eq!(list.selected().unwrap().remote.address, list.get_pair(idx).unwrap().remote.address);
    }

    #[test]
    fn test_failed_response_fails_list() {
        let mut list = started_list(&["192.168.1.100:5000"], &["192.168.1.200:5000"]);
        let out = list.next_request().unwrap();

        list.handle_response(&BindingResponse::failure(out.transaction_id, PASSWORD));
        assert!(list.is_failed());
        assert!(list.best_succeeded().is_none());
    }

    #[test]
    fn test_overall_timeout() {
        let mut list = CheckList::new(true, Duration::from_millis(10));
        list.add_pairs(
            &[host_candidate("192.168.1.100:5000")],
            &[host_candidate("192.168.1.200:5000")],
        );
        list.start();
        list.next_request().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        list.handle_timeouts();
        assert!(list.is_timed_out());
        assert!(list.is_failed());
        assert_eq!(list.pairs_by_state(CheckState::Failed).count(), 1);
    }

    #[test]
    fn test_exponential_backoff() {
        let mut pair = CandidatePair::new(
            host_candidate("192.168.1.100:5000"),
            host_candidate("192.168.1.200:5000"),
            true,
        );

        pair.state = CheckState::Waiting;
        pair.start_check();
        assert_eq!(pair.current_rto(), Duration::from_millis(200));

        pair.record_retransmit();
        assert_eq!(pair.current_rto(), Duration::from_millis(400));

        pair.record_retransmit();
        pair.record_retransmit();
        assert_eq!(pair.current_rto(), Duration::from_millis(1600));

        pair.record_retransmit();
        assert_eq!(pair.current_rto(), Duration::from_millis(1600));
        assert!(!pair.needs_retransmit());
    }
}
