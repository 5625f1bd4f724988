//! Test doubles for the injection seams

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::EngineConfig;
use crate::events::{AdapterEvents, NoLatency};
use crate::ice::agent::{AgentError, AgentFactory, IceAgent, ProcessingState, SelectedPair};
use crate::ice::candidate::{
    Candidate, CandidateIds, CandidatePacket, CandidatePolicy, CandidateType, CandidatesMessage,
    IceCredentials, RemoteCandidates,
};
use crate::ice::server::{IceServer, IceServers, LatencyConfig};
use crate::metrics::Metrics;
use crate::session::RelayContext;
use crate::timer::{lock, Clock, Scheduler, Task};

/// Poll `condition` for up to five seconds
pub fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Answer from `src_id` carrying one remote host candidate
pub fn host_answer(src_id: i32) -> CandidatesMessage {
    CandidatesMessage {
        src_id,
        dest_id: 1,
        password: "remotepasswordremotepass".to_string(),
        ufrag: "remufrag".to_string(),
        candidates: vec![CandidatePacket {
            foundation: "HOST_CANDIDATE_192.0.2.7".to_string(),
            protocol: "udp".to_string(),
            priority: 2_130_706_431,
            ip: Some("192.0.2.7".to_string()),
            port: 6200,
            candidate_type: CandidateType::Host,
            generation: 0,
            id: "0".to_string(),
            rel_addr: None,
            rel_port: 0,
        }],
    }
}

// ============================================================================
// Clock And Scheduler
// ============================================================================

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

struct ManualTask {
    deadline: u64,
    seq: u64,
    task: Task,
}

/// Scheduler whose tasks run only inside `advance`
pub struct ManualScheduler {
    clock: Arc<ManualClock>,
    tasks: Mutex<Vec<ManualTask>>,
    next_seq: AtomicU64,
}

impl ManualScheduler {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            tasks: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    /// Tasks not yet run
    pub fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Move the clock and run every task due at the new time
    ///
    /// Tasks scheduled while these run wait for the next call, even with
    /// zero delay.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
        let now = self.clock.now_millis();

        let mut due: Vec<ManualTask> = {
            let mut tasks = lock(&self.tasks);
            let (due, later): (Vec<ManualTask>, Vec<ManualTask>) =
                tasks.drain(..).partition(|t| t.deadline <= now);
            *tasks = later;
            due
        };
        due.sort_by_key(|t| (t.deadline, t.seq));

        for entry in due {
            (entry.task)();
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        lock(&self.tasks).push(ManualTask {
            deadline: self.clock.now_millis() + delay.as_millis() as u64,
            seq,
            task,
        });
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone)]
pub enum RecordedEvent {
    IceMsg(CandidatesMessage),
    IceState { remote_id: i32, state: String },
    Connected { remote_id: i32, connected: bool },
    Gpgnet { header: String, args: Vec<Value> },
    ConnectionState(String),
    Reconnecting(i32),
}

/// Records every notification in order
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn ice_messages(&self) -> Vec<CandidatesMessage> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::IceMsg(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn ice_states(&self, remote: i32) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::IceState { remote_id, state } if remote_id == remote => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn connected(&self, remote: i32) -> Vec<bool> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::Connected {
                    remote_id,
                    connected,
                } if remote_id == remote => Some(connected),
                _ => None,
            })
            .collect()
    }

    pub fn gpgnet_messages(&self) -> Vec<(String, Vec<Value>)> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::Gpgnet { header, args } => Some((header, args)),
                _ => None,
            })
            .collect()
    }

    pub fn connection_states(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::ConnectionState(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn reconnecting(&self) -> Vec<i32> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::Reconnecting(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

impl AdapterEvents for RecordingEvents {
    fn on_ice_msg(&self, message: &CandidatesMessage) {
        lock(&self.events).push(RecordedEvent::IceMsg(message.clone()));
    }

    fn on_ice_connection_state_changed(&self, _local_id: i32, remote_id: i32, state: &str) {
        lock(&self.events).push(RecordedEvent::IceState {
            remote_id,
            state: state.to_string(),
        });
    }

    fn on_connected(&self, _local_id: i32, remote_id: i32, connected: bool) {
        lock(&self.events).push(RecordedEvent::Connected {
            remote_id,
            connected,
        });
    }

    fn on_gpgnet_message_received(&self, header: &str, args: &[Value]) {
        lock(&self.events).push(RecordedEvent::Gpgnet {
            header: header.to_string(),
            args: args.to_vec(),
        });
    }

    fn on_connection_state_changed(&self, state: &str) {
        lock(&self.events).push(RecordedEvent::ConnectionState(state.to_string()));
    }

    fn on_reconnecting(&self, remote_id: i32, _remote_login: &str) {
        lock(&self.events).push(RecordedEvent::Reconnecting(remote_id));
    }
}

// ============================================================================
// Agents
// ============================================================================

/// Agent that connects instantly to the first remote candidate
pub struct FakeAgent {
    controlling: bool,
    candidates: Vec<Candidate>,
    fail: bool,
    state: Mutex<ProcessingState>,
    remote: Mutex<Vec<Candidate>>,
    selected: Mutex<Option<SelectedPair>>,
    sent: Mutex<Vec<Vec<u8>>>,
    inbox: Mutex<VecDeque<Vec<u8>>>,
    arrived: Condvar,
    freed: AtomicBool,
}

impl FakeAgent {
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::SeqCst)
    }

    pub fn is_controlling_agent(&self) -> bool {
        self.controlling
    }

    /// Datagrams sent over the selected pair
    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.sent).clone()
    }

    /// Queue a datagram for `recv`
    pub fn deliver(&self, data: Vec<u8>) {
        lock(&self.inbox).push_back(data);
        self.arrived.notify_all();
    }
}

impl IceAgent for FakeAgent {
    fn is_controlling(&self) -> bool {
        self.controlling
    }

    fn credentials(&self) -> IceCredentials {
        IceCredentials {
            ufrag: "fakeufrag".to_string(),
            password: "fakepasswordfakepassword".to_string(),
        }
    }

    fn gather_candidates(&self, _servers: &[IceServer]) -> Result<Vec<Candidate>, AgentError> {
        if self.is_freed() {
            return Err(AgentError::Closed);
        }
        Ok(self.candidates.clone())
    }

    fn remote_candidates(&self) -> Vec<Candidate> {
        lock(&self.remote).clone()
    }

    fn set_remote(&self, remote: RemoteCandidates) -> Result<(), AgentError> {
        lock(&self.remote).extend(remote.candidates);
        Ok(())
    }

    fn start_connectivity_establishment(&self) -> Result<(), AgentError> {
        let pair = match (self.candidates.first(), lock(&self.remote).first()) {
            (Some(local), Some(remote)) if !self.fail => Some(SelectedPair {
                local: local.clone(),
                remote: remote.clone(),
            }),
            _ => None,
        };

        let mut state = lock(&self.state);
        *state = match pair {
            Some(pair) => {
                *lock(&self.selected) = Some(pair);
                ProcessingState::Completed
            }
            None => ProcessingState::Failed,
        };
        Ok(())
    }

    fn state(&self) -> ProcessingState {
        *lock(&self.state)
    }

    fn selected_pair(&self) -> Option<SelectedPair> {
        lock(&self.selected).clone()
    }

    fn send(&self, data: &[u8]) -> Result<(), AgentError> {
        if self.is_freed() {
            return Err(AgentError::Closed);
        }
        lock(&self.sent).push(data.to_vec());
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, AgentError> {
        let mut inbox = lock(&self.inbox);
        loop {
            if self.is_freed() {
                return Err(AgentError::Closed);
            }
            if let Some(data) = inbox.pop_front() {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                return Ok(len);
            }
            inbox = self
                .arrived
                .wait_timeout(inbox, Duration::from_millis(20))
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn free(&self) {
        self.freed.store(true, Ordering::SeqCst);
        *lock(&self.state) = ProcessingState::Terminated;
        self.arrived.notify_all();
    }
}

/// Hands out [`FakeAgent`]s and keeps them for inspection
pub struct FakeAgentFactory {
    agents: Mutex<Vec<Arc<FakeAgent>>>,
    candidates: Mutex<Vec<Candidate>>,
    fail: AtomicBool,
}

impl Default for FakeAgentFactory {
    fn default() -> Self {
        Self {
            agents: Mutex::new(Vec::new()),
            candidates: Mutex::new(vec![Candidate::host(
                "192.168.1.10:6112".parse().expect("static address"),
            )]),
            fail: AtomicBool::new(false),
        }
    }
}

impl FakeAgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        lock(&self.agents).len()
    }

    pub fn agent(&self, index: usize) -> Option<Arc<FakeAgent>> {
        lock(&self.agents).get(index).cloned()
    }

    /// Local candidates of agents created from now on
    pub fn with_candidates(&self, candidates: Vec<Candidate>) {
        *lock(&self.candidates) = candidates;
    }

    /// Make connectivity establishment fail
    pub fn fail_connectivity(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl AgentFactory for FakeAgentFactory {
    fn create_agent(&self, controlling: bool) -> Result<Arc<dyn IceAgent>, AgentError> {
        let agent = Arc::new(FakeAgent {
            controlling,
            candidates: lock(&self.candidates).clone(),
            fail: self.fail.load(Ordering::SeqCst),
            state: Mutex::new(ProcessingState::Waiting),
            remote: Mutex::new(Vec::new()),
            selected: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            inbox: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
            freed: AtomicBool::new(false),
        });
        lock(&self.agents).push(Arc::clone(&agent));
        Ok(agent)
    }
}

// ============================================================================
// Relay Context
// ============================================================================

/// A relay context wired to fakes, with handles to each
pub struct TestRelay {
    pub ctx: Arc<RelayContext>,
    pub events: Arc<RecordingEvents>,
    pub agents: Arc<FakeAgentFactory>,
    pub scheduler: Arc<ManualScheduler>,
    pub clock: Arc<ManualClock>,
}

impl TestRelay {
    pub fn new() -> Self {
        Self::build(CandidatePolicy::allow_all(), 0)
    }

    pub fn with_policy(policy: CandidatePolicy) -> Self {
        Self::build(policy, 0)
    }

    pub fn with_lobby_port(lobby_port: u16) -> Self {
        Self::build(CandidatePolicy::allow_all(), lobby_port)
    }

    fn build(policy: CandidatePolicy, lobby_port: u16) -> Self {
        let events = Arc::new(RecordingEvents::new());
        let agents = Arc::new(FakeAgentFactory::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let scheduler = Arc::new(ManualScheduler::new(Arc::clone(&clock)));

        let ctx = Arc::new(RelayContext {
            local_id: 1,
            lobby_port,
            config: EngineConfig::default(),
            policy,
            ice_servers: Arc::new(IceServers::new(
                Arc::new(NoLatency),
                LatencyConfig::default(),
            )),
            agents: agents.clone(),
            events: events.clone(),
            scheduler: scheduler.clone(),
            clock: clock.clone(),
            metrics: Arc::new(Metrics::new()),
            candidate_ids: CandidateIds::new(),
        });

        Self {
            ctx,
            events,
            agents,
            scheduler,
            clock,
        }
    }
}
