//! ICE negotiation state machine for one remote player
//!
//! # States
//!
//! ```text
//!            initiate_ice()            candidates packed
//!   NEW ─────────────────► GATHERING ───────────────────► AWAITING_CANDIDATES
//!    ▲                         │                                  │
//!    │                         │ gather error/timeout             │ remote candidates
//!    │                         ▼                                  ▼
//!    │                    DISCONNECTED ◄──────────────────── CHECKING
//!    │                      ▲    │   failure/timeout              │
//!    │                      │    │                                │ pair selected
//!    │     connection lost  │    └── offerer re-initiates         ▼
//!    └──────────────────────┴───────────────────────────────  CONNECTED
//! ```
//!
//! Locks are taken in the order `message_lock` → `init_lock` → `lost_lock`
//! → `negotiation` → checker. Delayed work always goes through the
//! [`Scheduler`]. Notifications raised under `negotiation` are queued and
//! emitted in order once it is released.
//!
//! # Data Channel Framing
//!
//! Every datagram over the selected pair starts with a one-byte tag:
//! `'d'` game payload, `'e'` echo (see [`super::checker`]).

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::agent::{AgentError, IceAgent, ProcessingState, SelectedPair};
use super::candidate::{
    pack_candidates, unpack_candidates, CandidatePolicy, CandidateType, CandidatesMessage,
};
use super::checker::{turn_around, CheckerLink, ConnectivityChecker, ECHO_TAG};
use crate::session::RelayContext;
use crate::timer::{lock, CancelToken};

// ============================================================================
// Constants
// ============================================================================

/// Tag of game payload datagrams on the data channel
pub const DATA_TAG: u8 = b'd';

/// Largest datagram read from the agent
const MAX_DATAGRAM_SIZE: usize = 65536;

// ============================================================================
// State
// ============================================================================

/// Negotiation state of one peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IceState {
    #[serde(rename = "new")]
    New,
    #[serde(rename = "gathering")]
    Gathering,
    #[serde(rename = "awaitingCandidates")]
    AwaitingCandidates,
    #[serde(rename = "checking")]
    Checking,
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "disconnected")]
    Disconnected,
}

impl IceState {
    /// Name reported to the control client
    pub fn as_str(&self) -> &'static str {
        match self {
            IceState::New => "new",
            IceState::Gathering => "gathering",
            IceState::AwaitingCandidates => "awaitingCandidates",
            IceState::Checking => "checking",
            IceState::Connected => "connected",
            IceState::Disconnected => "disconnected",
        }
    }

    /// A fresh negotiation may start from here
    pub fn is_idle(&self) -> bool {
        matches!(self, IceState::New | IceState::Disconnected)
    }
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives game payload that arrived over ICE
pub trait IceDataSink: Send + Sync {
    fn on_ice_data_received(&self, data: &[u8]);
}

/// Notification raised under the negotiation lock
enum Notice {
    State(IceState),
    Connected(bool),
    IceMsg(CandidatesMessage),
    Reconnecting,
}

/// Mutable state of the current attempt
struct Negotiation {
    state: IceState,
    agent: Option<Arc<dyn IceAgent>>,
    /// Bumped by every `initiate_ice`; callbacks of older attempts are stale
    generation: u64,
    /// Bumped every time local candidates go out
    awaiting_epoch: u64,
    connected: bool,
    selected: Option<SelectedPair>,
    /// Interrupts the connectivity wait and the relay listener
    cancel: Option<Arc<CancelToken>>,
    refresher: Option<Arc<CancelToken>>,
    /// Notifications waiting to be emitted
    outbox: VecDeque<Notice>,
    /// A thread is emitting the outbox
    flushing: bool,
}

/// Serializable view of an engine for the status report
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: IceState,
    pub connected: bool,
    pub local_candidate: Option<String>,
    pub remote_candidate: Option<String>,
    pub local_type: Option<CandidateType>,
    pub remote_type: Option<CandidateType>,
    pub average_rtt: Option<f64>,
    pub last_packet_received: u64,
    pub echos_received: u64,
    pub recent_attempts: usize,
}

// ============================================================================
// Engine
// ============================================================================

/// Drives one ICE agent at a time through negotiation, relay and recovery
pub struct IceEngine {
    ctx: Arc<RelayContext>,
    remote_id: i32,
    remote_login: String,
    local_offer: bool,
    closing: AtomicBool,
    game_ended: Arc<AtomicBool>,
    sink: Arc<dyn IceDataSink>,
    negotiation: Mutex<Negotiation>,
    init_lock: Mutex<()>,
    lost_lock: Mutex<()>,
    message_lock: Mutex<()>,
    /// Millisecond timestamps of connectivity attempts, newest last
    attempts: Mutex<VecDeque<u64>>,
    checker: Arc<ConnectivityChecker>,
    self_ref: Weak<IceEngine>,
}

impl IceEngine {
    pub fn new(
        ctx: Arc<RelayContext>,
        remote_id: i32,
        remote_login: String,
        local_offer: bool,
        game_ended: Arc<AtomicBool>,
        sink: Arc<dyn IceDataSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<IceEngine>| {
            let link: Weak<dyn CheckerLink> = weak.clone();
            let checker = Arc::new(ConnectivityChecker::new(
                format!("{}({})", remote_login, remote_id),
                ctx.config.echo_interval,
                ctx.config.echo_timeout,
                Arc::clone(&ctx.scheduler),
                Arc::clone(&ctx.clock),
                link,
            ));

            IceEngine {
                ctx,
                remote_id,
                remote_login,
                local_offer,
                closing: AtomicBool::new(false),
                game_ended,
                sink,
                negotiation: Mutex::new(Negotiation {
                    state: IceState::New,
                    agent: None,
                    generation: 0,
                    awaiting_epoch: 0,
                    connected: false,
                    selected: None,
                    cancel: None,
                    refresher: None,
                    outbox: VecDeque::new(),
                    flushing: false,
                }),
                init_lock: Mutex::new(()),
                lost_lock: Mutex::new(()),
                message_lock: Mutex::new(()),
                attempts: Mutex::new(VecDeque::new()),
                checker,
                self_ref: weak.clone(),
            }
        })
    }

    pub fn state(&self) -> IceState {
        lock(&self.negotiation).state
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.negotiation).connected
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn selected_pair(&self) -> Option<SelectedPair> {
        lock(&self.negotiation).selected.clone()
    }

    pub fn checker(&self) -> &Arc<ConnectivityChecker> {
        &self.checker
    }

    fn prefix(&self) -> String {
        format!("ICE {}({}): ", self.remote_login, self.remote_id)
    }

    /// Store a new state; the control client hears of it on the next flush
    fn set_state(&self, neg: &mut Negotiation, state: IceState) {
        neg.state = state;
        neg.outbox.push_back(Notice::State(state));
    }

    fn notify(&self, notice: Notice) {
        lock(&self.negotiation).outbox.push_back(notice);
        self.flush_notices();
    }

    /// Emit queued notifications with no lock held
    ///
    /// One thread drains at a time so notifications keep their order. A
    /// callback that causes another transition leaves it to the drainer.
    fn flush_notices(&self) {
        {
            let mut neg = lock(&self.negotiation);
            if neg.flushing {
                return;
            }
            neg.flushing = true;
        }

        loop {
            let notice = {
                let mut neg = lock(&self.negotiation);
                match neg.outbox.pop_front() {
                    Some(notice) => notice,
                    None => {
                        neg.flushing = false;
                        return;
                    }
                }
            };

            let events = &self.ctx.events;
            match notice {
                Notice::State(state) => events.on_ice_connection_state_changed(
                    self.ctx.local_id,
                    self.remote_id,
                    state.as_str(),
                ),
                Notice::Connected(connected) => {
                    events.on_connected(self.ctx.local_id, self.remote_id, connected)
                }
                Notice::IceMsg(message) => events.on_ice_msg(&message),
                Notice::Reconnecting => events.on_reconnecting(self.remote_id, &self.remote_login),
            }
        }
    }

    /// Connectivity attempts inside the trailing window
    pub fn recent_attempts(&self) -> usize {
        let window = self.ctx.config.attempt_window.as_millis() as u64;
        let cutoff = self.ctx.clock.now_millis().saturating_sub(window);
        let mut attempts = lock(&self.attempts);
        while attempts.front().map(|t| *t <= cutoff).unwrap_or(false) {
            attempts.pop_front();
        }
        attempts.len()
    }

    fn record_attempt(&self) {
        lock(&self.attempts).push_back(self.ctx.clock.now_millis());
        self.ctx
            .metrics
            .connectivity_attempts_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Policy for this attempt: the global one narrowed by recent attempts
    fn current_policy(&self) -> CandidatePolicy {
        self.ctx.policy.narrowed(self.recent_attempts())
    }

    // ========================================================================
    // Initiation
    // ========================================================================

    /// Start a fresh negotiation
    ///
    /// No-op while one is in progress or once the peer is closing. Blocks for
    /// candidate gathering.
    pub fn initiate_ice(&self) {
        self.initiate(None);
    }

    /// Re-initiate only if no other attempt started since `generation`
    fn initiate(&self, expected_generation: Option<u64>) {
        let _init = lock(&self.init_lock);

        if self.is_closing() {
            log::warn!(
                "{}Peer not connected anymore, aborting reinitiation of ICE",
                self.prefix()
            );
            return;
        }

        let generation = {
            let mut neg = lock(&self.negotiation);
            if let Some(expected) = expected_generation {
                if neg.generation != expected {
                    log::debug!("{}Stale re-initiation, ignoring", self.prefix());
                    return;
                }
            }
            if !neg.state.is_idle() {
                log::warn!(
                    "{}ICE already in progress, aborting re initiation. current state: {}",
                    self.prefix(),
                    neg.state
                );
                return;
            }

            self.set_state(&mut neg, IceState::Gathering);
            neg.generation += 1;
            neg.generation
        };
        self.flush_notices();
        log::info!("{}Initiating ICE for peer", self.prefix());

        let agent = match self.ctx.agents.create_agent(self.local_offer) {
            Ok(agent) => agent,
            Err(e) => {
                log::error!("{}Could not create ICE agent: {}", self.prefix(), e);
                self.connection_lost_async(generation);
                return;
            }
        };

        {
            let mut neg = lock(&self.negotiation);
            if neg.generation != generation {
                drop(neg);
                agent.free();
                return;
            }
            if let Some(previous) = neg.agent.replace(Arc::clone(&agent)) {
                previous.free();
            }
        }

        self.gather(agent, generation);
    }

    /// Harvest, pack and hand local candidates to the signaling channel
    fn gather(&self, agent: Arc<dyn IceAgent>, generation: u64) {
        log::info!("{}Gathering ice candidates", self.prefix());

        let servers = self.ctx.ice_servers.viable();
        let (tx, rx) = mpsc::channel();
        let harvester = Arc::clone(&agent);
        let spawned = thread::Builder::new()
            .name(format!("gather-{}", self.remote_id))
            .spawn(move || {
                let _ = tx.send(harvester.gather_candidates(&servers));
            });
        if let Err(e) = spawned {
            log::error!("{}Could not start gathering: {}", self.prefix(), e);
            self.connection_lost_async(generation);
            return;
        }

        let candidates = match rx.recv_timeout(self.ctx.config.gather_timeout) {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                log::error!(
                    "{}Error while creating stream component/gathering candidates: {}",
                    self.prefix(),
                    e
                );
                self.connection_lost_async(generation);
                return;
            }
            Err(_) => {
                log::error!("{}Gathering candidates timed out", self.prefix());
                agent.free();
                self.connection_lost_async(generation);
                return;
            }
        };

        let policy = self.current_policy();
        let message = pack_candidates(
            self.ctx.local_id,
            self.remote_id,
            &agent.credentials(),
            agent.generation(),
            &candidates,
            policy,
            &self.ctx.candidate_ids,
        );

        let epoch = {
            let mut neg = lock(&self.negotiation);
            if neg.generation != generation || neg.state != IceState::Gathering {
                log::debug!("{}Attempt superseded during gathering", self.prefix());
                return;
            }
            log::debug!(
                "{}Sending own candidates to {}, offered candidates: {}",
                self.prefix(),
                self.remote_id,
                message.describe()
            );
            self.set_state(&mut neg, IceState::AwaitingCandidates);
            neg.outbox.push_back(Notice::IceMsg(message));
            neg.awaiting_epoch += 1;
            neg.awaiting_epoch
        };
        self.flush_notices();

        // The candidate message may have been lost on the way
        let engine = self.self_ref.clone();
        self.ctx.scheduler.schedule(
            self.ctx.config.awaiting_candidates_timeout,
            Box::new(move || {
                if let Some(engine) = engine.upgrade() {
                    engine.awaiting_candidates_expired(generation, epoch);
                }
            }),
        );
    }

    fn awaiting_candidates_expired(&self, generation: u64, epoch: u64) {
        if self.is_closing() {
            log::warn!(
                "{}Peer not connected anymore, aborting reinitiation of ICE",
                self.prefix()
            );
            return;
        }

        let expired = {
            let neg = lock(&self.negotiation);
            neg.state == IceState::AwaitingCandidates
                && neg.awaiting_epoch == epoch
                && neg.generation == generation
        };
        if expired {
            log::info!("{}No answer to our candidates, retrying", self.prefix());
            self.connection_lost(Some(generation));
        }
    }

    // ========================================================================
    // Remote Candidates
    // ========================================================================

    /// Remote candidates arrived over signaling; handled on a worker thread
    pub fn on_ice_message_received(&self, message: CandidatesMessage) {
        if self.is_closing() {
            log::warn!(
                "{}Peer not connected anymore, discarding ice message",
                self.prefix()
            );
            return;
        }

        let engine = self.self_ref.clone();
        let spawned = thread::Builder::new()
            .name(format!("ice-msg-{}", self.remote_id))
            .spawn(move || {
                if let Some(engine) = engine.upgrade() {
                    engine.handle_remote_message(message);
                }
            });
        if let Err(e) = spawned {
            log::error!("{}Could not handle ice message: {}", self.prefix(), e);
        }
    }

    /// Apply remote candidates and run connectivity establishment (blocking)
    pub fn handle_remote_message(&self, message: CandidatesMessage) {
        let (agent, generation) = {
            let _message = lock(&self.message_lock);
            if self.is_closing() {
                log::warn!(
                    "{}Peer not connected anymore, discarding ice message",
                    self.prefix()
                );
                return;
            }

            log::debug!(
                "{}Got IceMsg for peer, offered candidates: {}",
                self.prefix(),
                message.describe()
            );

            if self.local_offer {
                let state = self.state();
                if state != IceState::AwaitingCandidates {
                    log::warn!(
                        "{}Received candidates unexpectedly, current state: {}",
                        self.prefix(),
                        state
                    );
                    return;
                }
            } else {
                if !self.state().is_idle() {
                    log::info!("{}Received new candidates/offer, stopping...", self.prefix());
                    self.connection_lost(None);
                }
                self.initiate_ice();
            }

            let (agent, generation) = {
                let mut neg = lock(&self.negotiation);
                let agent = match (&neg.agent, neg.state) {
                    (Some(agent), IceState::AwaitingCandidates) => Arc::clone(agent),
                    _ => {
                        log::warn!(
                            "{}No negotiation to apply candidates to, current state: {}",
                            self.prefix(),
                            neg.state
                        );
                        return;
                    }
                };
                self.set_state(&mut neg, IceState::Checking);
                (agent, neg.generation)
            };
            self.flush_notices();

            let remote = unpack_candidates(
                &message,
                agent.generation(),
                self.current_policy(),
                &agent.remote_candidates(),
            );
            if let Err(e) = agent.set_remote(remote) {
                log::warn!("{}Could not apply remote candidates: {}", self.prefix(), e);
                self.connection_lost(Some(generation));
                return;
            }

            (agent, generation)
        };

        self.start_ice(agent, generation);
    }

    // ========================================================================
    // Connectivity
    // ========================================================================

    /// Run connectivity establishment and wait for a selected pair
    fn start_ice(&self, agent: Arc<dyn IceAgent>, generation: u64) {
        self.record_attempt();
        log::debug!("{}Starting ICE for peer {}", self.prefix(), self.remote_id);

        let token = Arc::new(CancelToken::new());
        {
            let mut neg = lock(&self.negotiation);
            if neg.generation != generation {
                return;
            }
            if let Some(previous) = neg.cancel.replace(Arc::clone(&token)) {
                previous.cancel();
            }
        }

        if let Err(e) = agent.start_connectivity_establishment() {
            log::error!("{}Could not start connectivity checks: {}", self.prefix(), e);
            self.connection_lost(Some(generation));
            return;
        }

        let deadline = Instant::now() + self.ctx.config.connectivity_timeout;
        loop {
            match agent.state() {
                ProcessingState::Completed => break,
                ProcessingState::Failed => {
                    log::warn!("{}ICE failed", self.prefix());
                    self.connection_lost(Some(generation));
                    return;
                }
                ProcessingState::Terminated => {
                    log::debug!("{}Agent freed while checking", self.prefix());
                    return;
                }
                ProcessingState::Waiting | ProcessingState::Running => {}
            }

            if Instant::now() >= deadline {
                log::error!("{}ABORTING ICE DUE TO TIMEOUT", self.prefix());
                self.connection_lost(Some(generation));
                return;
            }

            if token.wait_timeout(self.ctx.config.connectivity_poll_interval) {
                log::debug!("{}Connectivity wait cancelled", self.prefix());
                return;
            }
        }

        let selected = match agent.selected_pair() {
            Some(pair) => pair,
            None => {
                log::error!("{}Agent completed without a selected pair", self.prefix());
                self.connection_lost(Some(generation));
                return;
            }
        };

        {
            let mut neg = lock(&self.negotiation);
            if neg.generation != generation || neg.state != IceState::Checking {
                log::debug!("{}Attempt superseded while checking", self.prefix());
                return;
            }

            log::debug!(
                "{}ICE terminated, connected, selected candidate pair: {} <-> {}",
                self.prefix(),
                selected.local.candidate_type,
                selected.remote.candidate_type
            );

            neg.connected = true;
            neg.selected = Some(selected.clone());
            neg.outbox.push_back(Notice::Connected(true));
            self.set_state(&mut neg, IceState::Connected);
            self.ctx.metrics.connections_total.fetch_add(1, Ordering::Relaxed);

            if selected.local.candidate_type == CandidateType::Relayed {
                neg.refresher = self.start_relay_refresher(Arc::clone(&agent));
            }

            // Started under the lock so a concurrent loss always stops it
            if self.local_offer {
                self.checker.start(generation);
            }
        }
        self.flush_notices();

        let engine = self.self_ref.clone();
        let spawned = thread::Builder::new()
            .name(format!("ice-listener-{}", self.remote_id))
            .spawn(move || {
                if let Some(engine) = engine.upgrade() {
                    engine.listen(agent, generation, token);
                }
            });
        if let Err(e) = spawned {
            log::error!("{}Could not start ICE listener: {}", self.prefix(), e);
            self.connection_lost(Some(generation));
        }
    }

    fn start_relay_refresher(&self, agent: Arc<dyn IceAgent>) -> Option<Arc<CancelToken>> {
        let token = Arc::new(CancelToken::new());
        let stop = Arc::clone(&token);
        let interval = self.ctx.config.relay_refresh_interval;
        let prefix = self.prefix();

        let spawned = thread::Builder::new()
            .name(format!("relay-refresh-{}", self.remote_id))
            .spawn(move || {
                while !stop.wait_timeout(interval) {
                    if let Err(e) = agent.refresh_relay() {
                        log::warn!("{}Relay refresh failed: {}", prefix, e);
                    }
                }
            });
        match spawned {
            Ok(_) => Some(token),
            Err(e) => {
                log::warn!("{}Could not start relay refresher: {}", self.prefix(), e);
                None
            }
        }
    }

    // ========================================================================
    // Data Channel
    // ========================================================================

    /// Forward ICE datagrams until the agent is freed
    fn listen(&self, agent: Arc<dyn IceAgent>, generation: u64, token: Arc<CancelToken>) {
        log::debug!("{}Now forwarding data from ICE to FA for peer", self.prefix());
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        while !token.is_cancelled() && !self.is_closing() {
            let len = match agent.recv(&mut buf) {
                Ok(0) => continue,
                Ok(len) => len,
                Err(AgentError::Closed) => break,
                Err(e) => {
                    log::warn!("{}Error while reading from ICE adapter: {}", self.prefix(), e);
                    self.connection_lost(Some(generation));
                    break;
                }
            };

            self.checker.packet_received();
            match buf[0] {
                DATA_TAG => {
                    self.ctx.metrics.record_ice_to_game(len - 1);
                    self.sink.on_ice_data_received(&buf[1..len]);
                }
                ECHO_TAG => {
                    if self.local_offer {
                        self.checker.echo_received(&buf[..len]);
                    } else {
                        self.send_via_ice(&turn_around(&buf[..len]));
                    }
                }
                other => {
                    log::warn!(
                        "{}Received invalid packet, first byte: 0x{:02x}, length: {}",
                        self.prefix(),
                        other,
                        len
                    );
                }
            }
        }

        log::debug!("{}No longer listening for messages from ICE", self.prefix());
    }

    /// Send one framed datagram over the selected pair
    ///
    /// Silently dropped while not connected. A send failure counts as a lost
    /// connection.
    pub fn send_via_ice(&self, data: &[u8]) {
        let (agent, generation) = {
            let neg = lock(&self.negotiation);
            match (&neg.agent, neg.connected) {
                (Some(agent), true) => (Arc::clone(agent), neg.generation),
                _ => {
                    log::trace!("{}Not connected, dropping {} bytes", self.prefix(), data.len());
                    return;
                }
            }
        };

        if let Err(e) = agent.send(data) {
            log::warn!("{}Failed to send data via ICE: {}", self.prefix(), e);
            self.connection_lost(Some(generation));
        }
    }

    /// Game payload read from the local socket
    pub fn on_game_data_received(&self, payload: &[u8]) {
        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(DATA_TAG);
        data.extend_from_slice(payload);
        self.ctx.metrics.record_game_to_ice(payload.len());
        self.send_via_ice(&data);
    }

    // ========================================================================
    // Failure And Teardown
    // ========================================================================

    fn connection_lost_async(&self, generation: u64) {
        let engine = self.self_ref.clone();
        self.ctx.scheduler.schedule(
            Duration::ZERO,
            Box::new(move || {
                if let Some(engine) = engine.upgrade() {
                    engine.connection_lost(Some(generation));
                }
            }),
        );
    }

    /// Tear down the current attempt and schedule recovery
    ///
    /// `expected_generation` guards callbacks of an older attempt. No-op when
    /// already disconnected.
    pub fn connection_lost(&self, expected_generation: Option<u64>) {
        let _lost = lock(&self.lost_lock);

        let (previous, agent, cancel, refresher, generation) = {
            let mut neg = lock(&self.negotiation);
            if let Some(expected) = expected_generation {
                if neg.generation != expected {
                    log::debug!("{}Stale connection loss, ignoring", self.prefix());
                    return;
                }
            }
            if neg.state == IceState::Disconnected {
                log::warn!(
                    "{}Lost connection, albeit already in ice state disconnected",
                    self.prefix()
                );
                return;
            }

            let previous = neg.state;
            if neg.connected {
                neg.connected = false;
                log::warn!("{}ICE connection has been lost for peer", self.prefix());
                neg.outbox.push_back(Notice::Connected(false));
                self.ctx
                    .metrics
                    .connection_losses_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            neg.selected = None;
            self.set_state(&mut neg, IceState::Disconnected);
            self.checker.stop();

            (
                previous,
                neg.agent.take(),
                neg.cancel.take(),
                neg.refresher.take(),
                neg.generation,
            )
        };
        self.flush_notices();

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(refresher) = refresher {
            refresher.cancel();
        }
        if let Some(agent) = agent {
            agent.free();
        }

        if self.is_closing() {
            log::warn!(
                "{}Peer not connected anymore, aborting onConnectionLost of ICE",
                self.prefix()
            );
            return;
        }
        if self.game_ended.load(Ordering::SeqCst) {
            log::warn!(
                "{}GAME ENDED, ABORTING onConnectionLost of ICE for peer",
                self.prefix()
            );
            return;
        }

        if previous == IceState::Connected {
            self.notify(Notice::Reconnecting);
        }

        if self.local_offer {
            // A working link retries at once, a failed attempt backs off
            let delay = if previous == IceState::Connected {
                Duration::ZERO
            } else {
                self.ctx.config.reconnect_backoff
            };
            let engine = self.self_ref.clone();
            self.ctx.scheduler.schedule(
                delay,
                Box::new(move || {
                    if let Some(engine) = engine.upgrade() {
                        engine.initiate(Some(generation));
                    }
                }),
            );
        }
    }

    /// Terminal shutdown; never reconnects
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let (agent, cancel, refresher) = {
            let mut neg = lock(&self.negotiation);
            neg.connected = false;
            self.checker.stop();
            (neg.agent.take(), neg.cancel.take(), neg.refresher.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(refresher) = refresher {
            refresher.cancel();
        }
        if let Some(agent) = agent {
            agent.free();
        }
    }

    pub fn status(&self) -> EngineStatus {
        let (state, connected, selected) = {
            let neg = lock(&self.negotiation);
            (neg.state, neg.connected, neg.selected.clone())
        };
        let stats = self.checker.stats();

        EngineStatus {
            state,
            connected,
            local_candidate: selected.as_ref().map(|p| p.local.address.to_string()),
            remote_candidate: selected.as_ref().map(|p| p.remote.address.to_string()),
            local_type: selected.as_ref().map(|p| p.local.candidate_type),
            remote_type: selected.as_ref().map(|p| p.remote.candidate_type),
            average_rtt: stats.average_rtt,
            last_packet_received: self.checker.last_packet_received(),
            echos_received: stats.echos_received,
            recent_attempts: self.recent_attempts(),
        }
    }
}

impl CheckerLink for IceEngine {
    fn send_echo(&self, data: &[u8]) {
        self.send_via_ice(data);
    }

    fn echo_timed_out(&self, link_generation: u64) {
        self.connection_lost(Some(link_generation));
    }
}

// ============================================================================
// Tests
// ============================================================================
