//! ICE agent abstraction and the built-in UDP agent
//!
//! The negotiation engine only sees [`IceAgent`]: harvest candidates, accept
//! the remote side, run checks, then move datagrams over the selected pair.
//! [`UdpIceAgent`] implements it over a single UDP socket with host and
//! server reflexive candidates.
//!
//! # Agent Socket Demultiplexing
//!
//! ```text
//! ┌─────────────────────┬───────────────────────────────────────────┐
//! │ First bytes         │ Handling                                  │
//! ├─────────────────────┼───────────────────────────────────────────┤
//! │ 00 'I' 'C' 'E'      │ connectivity check (request / response)   │
//! │ STUN magic cookie   │ late STUN response, ignored               │
//! │ anything else       │ payload, queued if from the selected pair │
//! └─────────────────────┴───────────────────────────────────────────┘
//! ```

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket as StdUdpSocket};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use ring::rand::{SecureRandom, SystemRandom};

use super::candidate::{
    calculate_priority, gather_host_candidates, gather_reflexive_candidate,
    sort_candidates_by_priority, Candidate, CandidateType, IceCredentials, RemoteCandidates,
    Transport, IPV4_LOCAL_PREF,
};
use super::connectivity::{
    decode_check, encode_check, is_check, BindingMessage, BindingRequest, BindingResponse,
    CheckList, CheckState, Outgoing, CHECK_TIMEOUT,
};
use super::server::IceServer;
use super::stun;
use crate::config::{ICE_PORT_SPAN, MINIMUM_ICE_PORT};
use crate::net::{bind_udp_in_range, enumerate_local_addresses};
use crate::timer::lock;

// ============================================================================
// Constants
// ============================================================================

/// Token for the agent socket
const SOCKET_TOKEN: Token = Token(0);

/// Token used to interrupt the I/O loop
const WAKER_TOKEN: Token = Token(1);

/// Maximum UDP payload
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Datagrams held for the reader; newer ones are dropped once full
pub const DATA_QUEUE_CAPACITY: usize = 256;

/// I/O loop tick while checks are running
const IO_TICK: Duration = Duration::from_millis(10);

/// How often a blocked reader re-checks for closure
const RECV_POLL: Duration = Duration::from_millis(100);

/// Default time to wait for STUN answers while gathering
const DEFAULT_STUN_TIMEOUT: Duration = Duration::from_secs(3);

/// ICE ufrag length (RFC 8445: at least 4 characters)
const UFRAG_LEN: usize = 8;

/// ICE password length (RFC 8445: at least 22 characters)
const PASSWORD_LEN: usize = 24;

// ============================================================================
// Agent Interface
// ============================================================================

/// Processing state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    /// Created, checks not started
    Waiting,
    /// Checks running
    Running,
    /// A pair has been selected
    Completed,
    /// No pair can succeed
    Failed,
    /// Freed
    Terminated,
}

/// The candidate pair data flows over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPair {
    pub local: Candidate,
    pub remote: Candidate,
}

/// Errors reported by an agent
#[derive(Debug)]
pub enum AgentError {
    /// Could not bind the agent socket
    Bind(io::Error),
    /// Candidate harvesting failed
    Gather(String),
    /// Operation needs a state the agent is not in yet
    NotReady(&'static str),
    /// Agent has been freed
    Closed,
    /// Socket I/O failed
    Io(io::Error),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Bind(e) => write!(f, "failed to bind agent socket: {}", e),
            AgentError::Gather(reason) => write!(f, "candidate gathering failed: {}", reason),
            AgentError::NotReady(what) => write!(f, "agent not ready: {}", what),
            AgentError::Closed => write!(f, "agent closed"),
            AgentError::Io(e) => write!(f, "agent I/O error: {}", e),
        }
    }
}

impl std::error::Error for AgentError {}

/// Candidate harvesting and connectivity checks for one peer link
pub trait IceAgent: Send + Sync {
    /// Whether this agent nominates
    fn is_controlling(&self) -> bool;

    /// Local ufrag/password
    fn credentials(&self) -> IceCredentials;

    /// Candidate generation carried in candidate messages
    fn generation(&self) -> i32 {
        0
    }

    /// Harvest local candidates against `servers` (blocking)
    fn gather_candidates(&self, servers: &[IceServer]) -> Result<Vec<Candidate>, AgentError>;

    /// Remote candidates accepted so far
    fn remote_candidates(&self) -> Vec<Candidate>;

    /// Apply the remote credentials and candidates
    fn set_remote(&self, remote: RemoteCandidates) -> Result<(), AgentError>;

    /// Begin connectivity checks
    fn start_connectivity_establishment(&self) -> Result<(), AgentError>;

    fn state(&self) -> ProcessingState;

    fn selected_pair(&self) -> Option<SelectedPair>;

    /// Send one datagram over the selected pair
    fn send(&self, data: &[u8]) -> Result<(), AgentError>;

    /// Receive one datagram from the selected pair (blocking)
    ///
    /// Fails with `Closed` promptly once the agent is freed.
    fn recv(&self, buf: &mut [u8]) -> Result<usize, AgentError>;

    /// Refresh a relayed allocation
    fn refresh_relay(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Release the socket and stop background work
    fn free(&self);
}

/// Creates agents for negotiation attempts
pub trait AgentFactory: Send + Sync {
    fn create_agent(&self, controlling: bool) -> Result<Arc<dyn IceAgent>, AgentError>;
}

/// Generate fresh ICE credentials from the system CSPRNG
pub fn generate_credentials() -> IceCredentials {
    IceCredentials {
        ufrag: random_ice_chars(UFRAG_LEN),
        password: random_ice_chars(PASSWORD_LEN),
    }
}

fn random_ice_chars(len: usize) -> String {
    const ALPHABET: &[u8; 64] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut bytes = vec![0u8; len];
    if SystemRandom::new().fill(&mut bytes).is_err() {
        let seed = stun::generate_transaction_id();
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = seed[i % seed.len()].wrapping_add(i as u8);
        }
    }
    bytes
        .iter()
        .map(|b| ALPHABET[(*b & 0x3F) as usize] as char)
        .collect()
}

// ============================================================================
// UDP Agent
// ============================================================================

/// Settings of the built-in agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpAgentConfig {
    /// Port range for the agent socket (`0..=0` for OS-assigned)
    pub port_range: RangeInclusive<u16>,
    /// Offer loopback host candidates
    pub include_loopback: bool,
    /// How long to wait for STUN answers
    pub stun_timeout: Duration,
    /// Limit for the check list
    pub check_timeout: Duration,
}

impl Default for UdpAgentConfig {
    fn default() -> Self {
        Self {
            port_range: MINIMUM_ICE_PORT..=MINIMUM_ICE_PORT + ICE_PORT_SPAN,
            include_loopback: false,
            stun_timeout: DEFAULT_STUN_TIMEOUT,
            check_timeout: CHECK_TIMEOUT,
        }
    }
}

/// Factory for [`UdpIceAgent`]
#[derive(Debug, Clone, Default)]
pub struct UdpAgentFactory {
    config: UdpAgentConfig,
}

impl UdpAgentFactory {
    pub fn new(config: UdpAgentConfig) -> Self {
        Self { config }
    }
}

impl AgentFactory for UdpAgentFactory {
    fn create_agent(&self, controlling: bool) -> Result<Arc<dyn IceAgent>, AgentError> {
        Ok(Arc::new(UdpIceAgent::new(controlling, self.config.clone())))
    }
}

/// Check and selection state shared with the I/O thread
struct AgentInner {
    state: ProcessingState,
    /// Local host candidates checks are sent from
    base: Option<Candidate>,
    remote_credentials: Option<IceCredentials>,
    remote_candidates: Vec<Candidate>,
    check_list: CheckList,
    selected: Option<SelectedPair>,
}

/// Everything the I/O thread owns or shares
struct IoContext {
    controlling: bool,
    credentials: IceCredentials,
    socket: Arc<UdpSocket>,
    inner: Arc<Mutex<AgentInner>>,
    closed: Arc<AtomicBool>,
    data_tx: mpsc::SyncSender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

/// ICE agent over one UDP socket
pub struct UdpIceAgent {
    controlling: bool,
    credentials: IceCredentials,
    config: UdpAgentConfig,
    inner: Arc<Mutex<AgentInner>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    waker: Mutex<Option<Waker>>,
    closed: Arc<AtomicBool>,
    data_tx: Mutex<Option<mpsc::SyncSender<Vec<u8>>>>,
    data_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    dropped: Arc<AtomicU64>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl UdpIceAgent {
    pub fn new(controlling: bool, config: UdpAgentConfig) -> Self {
        let (data_tx, data_rx) = mpsc::sync_channel(DATA_QUEUE_CAPACITY);
        let check_list = CheckList::new(controlling, config.check_timeout);

        Self {
            controlling,
            credentials: generate_credentials(),
            config,
            inner: Arc::new(Mutex::new(AgentInner {
                state: ProcessingState::Waiting,
                base: None,
                remote_credentials: None,
                remote_candidates: Vec::new(),
                check_list,
                selected: None,
            })),
            socket: Mutex::new(None),
            waker: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            data_tx: Mutex::new(Some(data_tx)),
            data_rx: Mutex::new(data_rx),
            dropped: Arc::new(AtomicU64::new(0)),
            io_thread: Mutex::new(None),
        }
    }

    /// Datagrams dropped because the reader fell behind
    pub fn dropped_datagrams(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Local address of the agent socket, once gathered
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.socket).as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Ask every UDP STUN server for our mapped address
    fn gather_reflexive(
        &self,
        socket: &StdUdpSocket,
        servers: &[IceServer],
        base: SocketAddr,
    ) -> Vec<Candidate> {
        let mut targets: Vec<SocketAddr> = Vec::new();
        for server in servers {
            for address in &server.stun_addresses {
                if address.transport != Transport::Udp {
                    continue;
                }
                match resolve_ipv4(&address.host_port()) {
                    Some(target) if !targets.contains(&target) => targets.push(target),
                    Some(_) => {}
                    None => log::debug!("Could not resolve STUN server {}", address),
                }
            }
            if !server.turn_addresses.is_empty() {
                log::debug!(
                    "Skipping relay allocation on {} TURN address(es), not supported by the UDP agent",
                    server.turn_addresses.len()
                );
            }
        }

        if targets.is_empty() {
            return Vec::new();
        }

        let mut pending: Vec<[u8; stun::TRANSACTION_ID_LEN]> = Vec::new();
        for target in &targets {
            let txn = stun::generate_transaction_id();
            match socket.send_to(&stun::build_binding_request(&txn), target) {
                Ok(_) => pending.push(txn),
                Err(e) => log::debug!("STUN request to {} failed: {}", target, e),
            }
        }

        if let Err(e) = socket.set_read_timeout(Some(Duration::from_millis(50))) {
            log::warn!("Failed to set STUN read timeout: {}", e);
            return Vec::new();
        }

        let mut found = Vec::new();
        let mut buf = [0u8; 1500];
        let deadline = Instant::now() + self.config.stun_timeout;

        while !pending.is_empty() && Instant::now() < deadline && !self.closed.load(Ordering::SeqCst) {
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => {
                    log::debug!("STUN receive failed: {}", e);
                    break;
                }
            };

            let matched = pending
                .iter()
                .position(|txn| stun::parse_binding_response(&buf[..len], txn).is_some());
            if let Some(idx) = matched {
                let txn = pending.remove(idx);
                if let Some(mapped) = stun::parse_binding_response(&buf[..len], &txn) {
                    log::debug!("STUN server {} sees us as {}", from, mapped);
                    if let Some(candidate) = gather_reflexive_candidate(mapped, base) {
                        if !found.iter().any(|c: &Candidate| c.address == candidate.address) {
                            found.push(candidate);
                        }
                    }
                }
            }
        }

        found
    }
}

fn resolve_ipv4(host_port: &str) -> Option<SocketAddr> {
    host_port
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
}

impl IceAgent for UdpIceAgent {
    fn is_controlling(&self) -> bool {
        self.controlling
    }

    fn credentials(&self) -> IceCredentials {
        self.credentials.clone()
    }

    fn gather_candidates(&self, servers: &[IceServer]) -> Result<Vec<Candidate>, AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Closed);
        }
        if lock(&self.socket).is_some() {
            return Err(AgentError::Gather("candidates already gathered".to_string()));
        }

        let std_socket = bind_udp_in_range(IpAddr::V4(Ipv4Addr::UNSPECIFIED), &self.config.port_range)
            .map_err(AgentError::Bind)?;
        let local_addr = std_socket.local_addr().map_err(AgentError::Bind)?;

        let addrs = enumerate_local_addresses(local_addr.port(), self.config.include_loopback);
        let hosts = gather_host_candidates(&addrs, self.config.include_loopback);
        let base = hosts.first().cloned();

        let mut candidates = hosts;
        let reflexive_base = base.as_ref().map(|c| c.address).unwrap_or(local_addr);
        candidates.extend(self.gather_reflexive(&std_socket, servers, reflexive_base));
        sort_candidates_by_priority(&mut candidates);

        let base = match base {
            Some(base) => base,
            None => return Err(AgentError::Gather("no usable local interface".to_string())),
        };

        log::debug!(
            "Agent on {} gathered {} candidate(s)",
            local_addr,
            candidates.len()
        );

        std_socket.set_read_timeout(None).map_err(AgentError::Io)?;
        std_socket.set_nonblocking(true).map_err(AgentError::Io)?;
        let mut socket = UdpSocket::from_std(std_socket);

        let poll = Poll::new().map_err(AgentError::Io)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)
            .map_err(AgentError::Io)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(AgentError::Io)?;
        let socket = Arc::new(socket);

        lock(&self.inner).base = Some(base);

        let data_tx = lock(&self.data_tx).take().ok_or(AgentError::Closed)?;
        let ctx = IoContext {
            controlling: self.controlling,
            credentials: self.credentials.clone(),
            socket: Arc::clone(&socket),
            inner: Arc::clone(&self.inner),
            closed: Arc::clone(&self.closed),
            data_tx,
            dropped: Arc::clone(&self.dropped),
        };

        let handle = thread::Builder::new()
            .name(format!("ice-agent-{}", local_addr.port()))
            .spawn(move || run_io(poll, ctx))
            .map_err(AgentError::Io)?;

        *lock(&self.socket) = Some(socket);
        *lock(&self.waker) = Some(waker);
        *lock(&self.io_thread) = Some(handle);

        // Freed while we were gathering
        if self.closed.load(Ordering::SeqCst) {
            self.free();
            return Err(AgentError::Closed);
        }

        Ok(candidates)
    }

    fn remote_candidates(&self) -> Vec<Candidate> {
        lock(&self.inner).remote_candidates.clone()
    }

    fn set_remote(&self, remote: RemoteCandidates) -> Result<(), AgentError> {
        let mut inner = lock(&self.inner);
        let base = inner
            .base
            .clone()
            .ok_or(AgentError::NotReady("candidates not gathered"))?;

        inner.check_list.add_pairs(&[base], &remote.candidates);
        inner.remote_credentials = Some(remote.credentials);
        inner.remote_candidates.extend(remote.candidates);
        Ok(())
    }

    fn start_connectivity_establishment(&self) -> Result<(), AgentError> {
        let mut inner = lock(&self.inner);
        match inner.state {
            ProcessingState::Terminated => return Err(AgentError::Closed),
            ProcessingState::Waiting => {}
            _ => return Ok(()),
        }
        if inner.remote_credentials.is_none() {
            return Err(AgentError::NotReady("remote candidates not set"));
        }

        inner.check_list.start();
        inner.state = ProcessingState::Running;
        drop(inner);

        if let Some(waker) = lock(&self.waker).as_ref() {
            let _ = waker.wake();
        }
        Ok(())
    }

    fn state(&self) -> ProcessingState {
        lock(&self.inner).state
    }

    fn selected_pair(&self) -> Option<SelectedPair> {
        lock(&self.inner).selected.clone()
    }

    fn send(&self, data: &[u8]) -> Result<(), AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Closed);
        }
        let remote = lock(&self.inner)
            .selected
            .as_ref()
            .map(|pair| pair.remote.address)
            .ok_or(AgentError::NotReady("no selected pair"))?;
        let socket = lock(&self.socket)
            .clone()
            .ok_or(AgentError::NotReady("no socket"))?;

        match socket.send_to(data, remote) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::trace!("Agent socket full, dropping {} bytes", data.len());
                Ok(())
            }
            Err(e) => Err(AgentError::Io(e)),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, AgentError> {
        let rx = lock(&self.data_rx);
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(AgentError::Closed);
            }
            match rx.recv_timeout(RECV_POLL) {
                Ok(data) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    return Ok(len);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(AgentError::Closed),
            }
        }
    }

    fn free(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.inner).state = ProcessingState::Terminated;
        lock(&self.data_tx).take();

        if let Some(waker) = lock(&self.waker).as_ref() {
            let _ = waker.wake();
        }

        let handle = lock(&self.io_thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        lock(&self.socket).take();
    }
}

impl Drop for UdpIceAgent {
    fn drop(&mut self) {
        self.free();
    }
}

// ============================================================================
// I/O Loop
// ============================================================================

fn run_io(mut poll: Poll, ctx: IoContext) {
    let mut events = Events::with_capacity(64);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        if let Err(e) = poll.poll(&mut events, Some(IO_TICK)) {
            if e.kind() != io::ErrorKind::Interrupted {
                log::error!("Agent poll failed: {}", e);
                break;
            }
        }
        if ctx.closed.load(Ordering::SeqCst) {
            break;
        }

        // Drain regardless of events, mio is edge-triggered
        loop {
            let (len, from) = match ctx.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("Agent receive error: {}", e);
                    break;
                }
            };
            handle_datagram(&ctx, &buf[..len], from);
        }

        drive_checks(&ctx);
    }

    log::trace!("Agent I/O loop stopped");
}

fn handle_datagram(ctx: &IoContext, data: &[u8], from: SocketAddr) {
    if is_check(data) {
        match decode_check(data) {
            Ok(BindingMessage::Request(request)) => handle_request(ctx, request, from),
            Ok(BindingMessage::Response(response)) => handle_response(ctx, response, from),
            Err(e) => log::debug!("Malformed check from {}: {}", from, e),
        }
        return;
    }

    if stun::is_stun_message(data) {
        log::trace!("Ignoring late STUN message from {}", from);
        return;
    }

    let from_selected = lock(&ctx.inner)
        .selected
        .as_ref()
        .map(|pair| pair.remote.address == from)
        .unwrap_or(false);

    if from_selected {
        match ctx.data_tx.try_send(data.to_vec()) {
            Ok(()) => {}
            Err(mpsc::TrySendError::Full(_)) => {
                ctx.dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("Reader behind, dropping {} bytes from {}", data.len(), from);
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {}
        }
    } else {
        log::trace!("Dropping {} bytes from unselected source {}", data.len(), from);
    }
}

fn handle_request(ctx: &IoContext, request: BindingRequest, from: SocketAddr) {
    let expected_prefix = format!("{}:", ctx.credentials.ufrag);
    if !request.username.starts_with(&expected_prefix) || !request.verify(&ctx.credentials.password) {
        log::debug!("Rejecting unauthenticated check from {}", from);
        return;
    }

    let response = BindingResponse::success(request.transaction_id, from, &ctx.credentials.password);
    send_message(ctx, &BindingMessage::Response(response), from);

    let mut inner = lock(&ctx.inner);
    let base = match inner.base.clone() {
        Some(base) => base,
        None => return,
    };
    inner.check_list.trigger_check(from, request.priority, &base);

    if request.use_candidate && !ctx.controlling {
        if inner.check_list.remote_nominated(from).is_some() {
            log::debug!("Remote nominated pair towards {}", from);
        }
    }
}

fn handle_response(ctx: &IoContext, response: BindingResponse, from: SocketAddr) {
    let mut inner = lock(&ctx.inner);
    let password = match inner.remote_credentials.as_ref() {
        Some(creds) => creds.password.clone(),
        None => return,
    };
    if !response.verify(&password) {
        log::debug!("Rejecting unauthenticated response from {}", from);
        return;
    }
    inner.check_list.handle_response(&response);
}

fn drive_checks(ctx: &IoContext) {
    let mut outgoing: Vec<Outgoing> = Vec::new();
    let (username, password) = {
        let mut inner = lock(&ctx.inner);
        if inner.state != ProcessingState::Running {
            return;
        }

        inner.check_list.handle_timeouts();
        if let Some(out) = inner.check_list.next_request() {
            outgoing.push(out);
        }

        if ctx.controlling && inner.check_list.selected().is_none() {
            let nominating = inner
                .check_list
                .pairs_by_state(CheckState::InProgress)
                .any(|p| p.nominated);
            if !nominating {
                if let Some(idx) = inner.check_list.best_succeeded() {
                    if let Some(out) = inner.check_list.nominate(idx) {
                        outgoing.push(out);
                    }
                }
            }
        }

        if let Some(pair) = inner.check_list.selected() {
            let selected = SelectedPair {
                local: pair.local.clone(),
                remote: pair.remote.clone(),
            };
            log::debug!(
                "Selected pair {} <-> {}",
                selected.local.address,
                selected.remote.address
            );
            inner.selected = Some(selected);
            inner.state = ProcessingState::Completed;
        } else if inner.check_list.is_failed() {
            inner.state = ProcessingState::Failed;
        }

        match inner.remote_credentials.as_ref() {
            Some(remote) => (
                format!("{}:{}", remote.ufrag, ctx.credentials.ufrag),
                remote.password.clone(),
            ),
            None => return,
        }
    };

    let priority = calculate_priority(
        CandidateType::PeerReflexive.type_preference(),
        IPV4_LOCAL_PREF,
        1,
    );

    for out in outgoing {
        let request = BindingRequest::signed(
            out.transaction_id,
            username.clone(),
            priority,
            ctx.controlling,
            out.use_candidate,
            &password,
        );
        send_message(ctx, &BindingMessage::Request(request), out.remote);
    }
}

fn send_message(ctx: &IoContext, message: &BindingMessage, to: SocketAddr) {
    match encode_check(message) {
        Ok(bytes) => {
            if let Err(e) = ctx.socket.send_to(&bytes, to) {
                log::debug!("Failed to send check to {}: {}", to, e);
            }
        }
        Err(e) => log::warn!("Failed to encode check: {}", e),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::server::{ServerAddress, ServerKind};

    fn loopback_config() -> UdpAgentConfig {
        UdpAgentConfig {
            port_range: 0..=0,
            include_loopback: true,
            stun_timeout: Duration::from_millis(500),
            check_timeout: Duration::from_secs(5),
        }
    }

    fn loopback_only(candidates: Vec<Candidate>) -> Vec<Candidate> {
        candidates.into_iter().filter(|c| c.is_loopback()).collect()
    }

    fn wait_for_state(agent: &UdpIceAgent, state: ProcessingState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if agent.state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_generate_credentials() {
        let a = generate_credentials();
        let b = generate_credentials();

        assert_eq!(a.ufrag.len(), UFRAG_LEN);
        assert_eq!(a.password.len(), PASSWORD_LEN);
        assert_ne!(a, b);
        assert!(a
            .password
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/'));
    }

    #[test]
    fn test_gather_loopback_host_candidate() {
        let agent = UdpIceAgent::new(true, loopback_config());
        let candidates = agent.gather_candidates(&[]).unwrap();

        let local_port = agent.local_addr().unwrap().port();
        let loopback = loopback_only(candidates);
        assert!(!loopback.is_empty());
        assert!(loopback.iter().all(|c| c.candidate_type == CandidateType::Host));
        assert!(loopback.iter().all(|c| c.address.port() == local_port));

        assert!(matches!(
            agent.gather_candidates(&[]),
            Err(AgentError::Gather(_))
        ));
        agent.free();
    }

    #[test]
    fn test_gather_server_reflexive_via_stun() {
        let stun_server = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let stun_port = stun_server.local_addr().unwrap().port();
        let mapped: SocketAddr = "203.0.113.5:40000".parse().unwrap();

        let responder = thread::spawn(move || {
            let mut buf = [0u8; 1500];
            let (len, from) = stun_server.recv_from(&mut buf).unwrap();
            assert_eq!(len, stun::HEADER_LEN);
            let mut txn = [0u8; stun::TRANSACTION_ID_LEN];
            txn.copy_from_slice(&buf[8..20]);
            stun_server
                .send_to(&stun::build_binding_response(&txn, mapped), from)
                .unwrap();
        });

        let server = IceServer::new(
            vec![ServerAddress {
                kind: ServerKind::Stun,
                host: "127.0.0.1".to_string(),
                port: stun_port,
                transport: Transport::Udp,
            }],
            Vec::new(),
        );

        let agent = UdpIceAgent::new(true, loopback_config());
        let candidates = agent.gather_candidates(&[server]).unwrap();
        responder.join().unwrap();

        let srflx: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.candidate_type == CandidateType::ServerReflexive)
            .collect();
        assert_eq!(srflx.len(), 1);
        assert_eq!(srflx[0].address, mapped);
        assert!(srflx[0].related_address.is_some());
        agent.free();
    }

    #[test]
    fn test_set_remote_before_gather_fails() {
        let agent = UdpIceAgent::new(false, loopback_config());
        let remote = RemoteCandidates {
            credentials: generate_credentials(),
            candidates: Vec::new(),
        };
        assert!(matches!(
            agent.set_remote(remote),
            Err(AgentError::NotReady(_))
        ));
    }

    #[test]
    fn test_two_agents_connect_and_exchange_data() {
        let controlling = UdpIceAgent::new(true, loopback_config());
        let controlled = UdpIceAgent::new(false, loopback_config());

        let offer = loopback_only(controlling.gather_candidates(&[]).unwrap());
        let answer = loopback_only(controlled.gather_candidates(&[]).unwrap());

        controlled
            .set_remote(RemoteCandidates {
                credentials: controlling.credentials(),
                candidates: offer,
            })
            .unwrap();
        controlled.start_connectivity_establishment().unwrap();

        controlling
            .set_remote(RemoteCandidates {
                credentials: controlled.credentials(),
                candidates: answer,
            })
            .unwrap();
        controlling.start_connectivity_establishment().unwrap();

        assert!(wait_for_state(&controlling, ProcessingState::Completed));
        assert!(wait_for_state(&controlled, ProcessingState::Completed));

        let pair = controlling.selected_pair().unwrap();
        assert_eq!(pair.remote.address.port(), controlled.local_addr().unwrap().port());

        controlling.send(b"dhello").unwrap();
        let mut buf = [0u8; 64];
        let len = controlled.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"dhello");

        controlled.send(b"dworld").unwrap();
        let len = controlling.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"dworld");

        controlling.free();
        controlled.free();
    }

    #[test]
    fn test_slow_reader_drops_overflow() {
        let controlling = UdpIceAgent::new(true, loopback_config());
        let controlled = UdpIceAgent::new(false, loopback_config());

        let offer = loopback_only(controlling.gather_candidates(&[]).unwrap());
        let answer = loopback_only(controlled.gather_candidates(&[]).unwrap());
        controlled
            .set_remote(RemoteCandidates {
                credentials: controlling.credentials(),
                candidates: offer,
            })
            .unwrap();
        controlled.start_connectivity_establishment().unwrap();
        controlling
            .set_remote(RemoteCandidates {
                credentials: controlled.credentials(),
                candidates: answer,
            })
            .unwrap();
        controlling.start_connectivity_establishment().unwrap();
        assert!(wait_for_state(&controlling, ProcessingState::Completed));
        assert!(wait_for_state(&controlled, ProcessingState::Completed));

        for _ in 0..DATA_QUEUE_CAPACITY + 64 {
            controlling.send(b"dpayload").unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while controlled.dropped_datagrams() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(controlled.dropped_datagrams() > 0);

        // The queue filled up before anything was dropped
        let mut buf = [0u8; 64];
        for _ in 0..DATA_QUEUE_CAPACITY {
            let len = controlled.recv(&mut buf).unwrap();
            assert_eq!(&buf[..len], b"dpayload");
        }

        controlling.free();
        controlled.free();
    }

    #[test]
    fn test_free_unblocks_recv() {
        let agent = Arc::new(UdpIceAgent::new(true, loopback_config()));
        agent.gather_candidates(&[]).unwrap();

        let reader = Arc::clone(&agent);
        let handle = thread::spawn(move || reader.recv(&mut [0u8; 16]));

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        agent.free();

        assert!(matches!(handle.join().unwrap(), Err(AgentError::Closed)));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(agent.state(), ProcessingState::Terminated);
    }

    #[test]
    fn test_wrong_credentials_never_connect() {
        let controlling = UdpIceAgent::new(true, loopback_config());
        let controlled = UdpIceAgent::new(false, UdpAgentConfig {
            check_timeout: Duration::from_millis(600),
            ..loopback_config()
        });

        let offer = loopback_only(controlling.gather_candidates(&[]).unwrap());
        loopback_only(controlled.gather_candidates(&[]).unwrap());

        // Controlled side believes in a password the controlling side never used
        controlled
            .set_remote(RemoteCandidates {
                credentials: generate_credentials(),
                candidates: offer,
            })
            .unwrap();
        controlled.start_connectivity_establishment().unwrap();

        assert!(wait_for_state(&controlled, ProcessingState::Failed));
        controlling.free();
        controlled.free();
    }
}
