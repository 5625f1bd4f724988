//! Registry of peers for the active game
//!
//! A [`GameSession`] lives from host/join until the game's GPGNet connection
//! drops. Every registry mutation runs under one session-wide lock, and the
//! process-wide collaborators the peers need travel in a shared
//! [`RelayContext`].

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::EngineConfig;
use crate::events::AdapterEvents;
use crate::ice::agent::AgentFactory;
use crate::ice::candidate::{CandidateIds, CandidatePolicy, CandidatesMessage};
use crate::ice::server::{IceServerConfig, IceServers};
use crate::metrics::Metrics;
use crate::peer::{Peer, PeerStatus};
use crate::timer::{lock, Clock, Scheduler};

/// Process-wide collaborators shared by every peer
pub struct RelayContext {
    /// Our player id
    pub local_id: i32,
    /// UDP port the game receives peer traffic on
    pub lobby_port: u16,
    pub config: EngineConfig,
    /// Global candidate policy before per-peer narrowing
    pub policy: CandidatePolicy,
    pub ice_servers: Arc<IceServers>,
    pub agents: Arc<dyn AgentFactory>,
    pub events: Arc<dyn AdapterEvents>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
    pub candidate_ids: CandidateIds,
}

// ============================================================================
// Game Session
// ============================================================================

/// Peers of one game instance
pub struct GameSession {
    ctx: Arc<RelayContext>,
    peers: Mutex<HashMap<i32, Arc<Peer>>>,
    game_ended: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl GameSession {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self {
            ctx,
            peers: Mutex::new(HashMap::new()),
            game_ended: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a peer and return the local port the game must address
    ///
    /// A peer already registered under `remote_id` is closed and replaced.
    pub fn connect(
        &self,
        remote_login: &str,
        remote_id: i32,
        offer: bool,
        preferred_port: u16,
    ) -> io::Result<u16> {
        let mut peers = lock(&self.peers);
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "game session closed",
            ));
        }

        if let Some(previous) = peers.remove(&remote_id) {
            log::info!("Replacing peer {}", previous.identifier());
            previous.close();
        }

        let peer = Peer::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.game_ended),
            remote_id,
            remote_login,
            offer,
            preferred_port,
        )?;
        let port = peer.local_port();
        peers.insert(remote_id, peer);
        Ok(port)
    }

    /// Remove and close a peer; returns whether it existed
    pub fn disconnect(&self, remote_id: i32) -> bool {
        let removed = lock(&self.peers).remove(&remote_id);
        match removed {
            Some(peer) => {
                peer.close();
                true
            }
            None => false,
        }
    }

    /// Disconnect and connect again with the same role and local port
    ///
    /// `Ok(None)` if the peer is unknown.
    pub fn reconnect(&self, remote_id: i32) -> io::Result<Option<u16>> {
        let mut peers = lock(&self.peers);
        let previous = match peers.remove(&remote_id) {
            Some(peer) => peer,
            None => return Ok(None),
        };

        let login = previous.remote_login().to_string();
        let offer = previous.is_local_offer();
        let port = previous.local_port();
        log::info!("Reconnecting to peer {}", previous.identifier());
        previous.close();
        drop(previous);

        let peer = Peer::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.game_ended),
            remote_id,
            &login,
            offer,
            port,
        )?;
        let port = peer.local_port();
        peers.insert(remote_id, peer);
        Ok(Some(port))
    }

    /// Close every peer; returns how many were closed
    pub fn close(&self) -> usize {
        let drained: Vec<Arc<Peer>> = {
            let mut peers = lock(&self.peers);
            self.closed.store(true, Ordering::SeqCst);
            peers.drain().map(|(_, peer)| peer).collect()
        };

        log::info!("Closing gameSession");
        for peer in &drained {
            peer.close();
        }
        drained.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Replace the candidate server list
    pub fn set_ice_servers(&self, servers: &[IceServerConfig]) {
        self.ctx.ice_servers.set(servers);
    }

    /// Route remote candidates to the peer that sent them
    ///
    /// Returns false when no such peer is registered.
    pub fn on_ice_message(&self, message: CandidatesMessage) -> bool {
        match self.peer(message.src_id) {
            Some(peer) => {
                peer.on_ice_message_received(message);
                true
            }
            None => {
                log::warn!(
                    "Received ice message for non existing peer {}",
                    message.src_id
                );
                false
            }
        }
    }

    /// Peers stop reconnecting once the game has ended
    pub fn set_game_ended(&self, ended: bool) {
        self.game_ended.store(ended, Ordering::SeqCst);
    }

    pub fn is_game_ended(&self) -> bool {
        self.game_ended.load(Ordering::SeqCst)
    }

    pub fn peer(&self, remote_id: i32) -> Option<Arc<Peer>> {
        lock(&self.peers).get(&remote_id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn status(&self) -> Vec<PeerStatus> {
        let peers: Vec<Arc<Peer>> = lock(&self.peers).values().cloned().collect();
        let mut status: Vec<PeerStatus> = peers.iter().map(|p| p.status()).collect();
        status.sort_by_key(|s| s.id);
        status
    }
}

// ============================================================================
// Session Slot
// ============================================================================

/// Holder of the one active game session
#[derive(Default)]
pub struct SessionSlot {
    current: Mutex<Option<Arc<GameSession>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The active session, if any
    pub fn get(&self) -> Option<Arc<GameSession>> {
        lock(&self.current).clone()
    }

    /// Install `session`, closing the one it replaces
    pub fn replace(&self, session: Arc<GameSession>) {
        let previous = lock(&self.current).replace(session);
        if let Some(previous) = previous {
            log::info!("Replacing active game session");
            previous.close();
        }
    }

    /// Remove and close the active session; returns whether there was one
    pub fn close(&self) -> bool {
        let previous = lock(&self.current).take();
        match previous {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Mark the active session's game as ended
    pub fn set_game_ended(&self) -> bool {
        match self.get() {
            Some(session) => {
                session.set_game_ended(true);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::engine::IceState;
    use crate::testing::{wait_for, TestRelay};
    use std::net::UdpSocket as StdUdpSocket;
    use std::thread;

    fn session(relay: &TestRelay) -> Arc<GameSession> {
        Arc::new(GameSession::new(Arc::clone(&relay.ctx)))
    }

    #[test]
    fn test_connect_returns_local_port() {
        let relay = TestRelay::new();
        let session = session(&relay);

        let port = session.connect("bob", 7, false, 0).unwrap();
        assert_ne!(port, 0);
        assert_eq!(session.peer(7).unwrap().local_port(), port);
        assert_eq!(session.peer_count(), 1);
        session.close();
    }

    #[test]
    fn test_connect_offer_starts_negotiation() {
        let relay = TestRelay::new();
        let session = session(&relay);

        session.connect("bob", 7, true, 0).unwrap();
        assert!(wait_for(|| relay.events.ice_messages().len() == 1));

        session.connect("carol", 8, false, 0).unwrap();
        assert_eq!(relay.agents.created(), 1);
        session.close();
    }

    #[test]
    fn test_connect_replaces_existing_peer() {
        let relay = TestRelay::new();
        let session = session(&relay);

        session.connect("bob", 7, false, 0).unwrap();
        let first = session.peer(7).unwrap();
        session.connect("bob", 7, false, 0).unwrap();

        assert!(first.is_closing());
        assert!(!session.peer(7).unwrap().is_closing());
        assert_eq!(session.peer_count(), 1);
        session.close();
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let relay = TestRelay::new();
        let session = session(&relay);
        session.connect("bob", 7, false, 0).unwrap();
        let peer = session.peer(7).unwrap();

        assert!(session.disconnect(7));
        assert!(!session.disconnect(7));
        assert!(!session.disconnect(99));
        assert!(peer.is_closing());
        assert_eq!(session.peer_count(), 0);
    }

    #[test]
    fn test_reconnect_preserves_port_and_role() {
        let relay = TestRelay::new();
        let session = session(&relay);

        let port = session.connect("bob", 7, true, 0).unwrap();
        let before = session.peer(7).unwrap();

        assert_eq!(session.reconnect(7).unwrap(), Some(port));
        let after = session.peer(7).unwrap();

        assert!(before.is_closing());
        assert_eq!(after.local_port(), port);
        assert!(after.is_local_offer());
        assert_eq!(after.remote_login(), "bob");
        assert!(wait_for(|| after.engine().state() == IceState::AwaitingCandidates));
        session.close();
    }

    #[test]
    fn test_reconnect_unknown_peer_is_noop() {
        let relay = TestRelay::new();
        let session = session(&relay);

        assert_eq!(session.reconnect(7).unwrap(), None);
        assert_eq!(session.peer_count(), 0);
    }

    #[test]
    fn test_connect_with_preferred_port() {
        let relay = TestRelay::new();
        let session = session(&relay);
        let free_port = StdUdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        assert_eq!(session.connect("bob", 7, false, free_port).unwrap(), free_port);
        session.close();
    }

    #[test]
    fn test_close_closes_every_peer_once() {
        let relay = TestRelay::new();
        let session = session(&relay);
        for id in 1..=4 {
            session.connect(&format!("player{}", id), id, false, 0).unwrap();
        }
        let peers: Vec<Arc<Peer>> = (1..=4).filter_map(|id| session.peer(id)).collect();

        let racer = Arc::clone(&session);
        let disconnect = thread::spawn(move || racer.disconnect(2));
        let closed = session.close();
        let disconnected = disconnect.join().unwrap();

        // Peer 2 is closed by exactly one of the two calls
        assert_eq!(closed + usize::from(disconnected), 4);
        assert!(peers.iter().all(|p| p.is_closing()));
        assert_eq!(session.peer_count(), 0);
        assert!(session.connect("late", 9, false, 0).is_err());
    }

    #[test]
    fn test_ice_message_routed_by_source() {
        let relay = TestRelay::new();
        let session = session(&relay);
        session.connect("bob", 7, false, 0).unwrap();

        let mut message = crate::testing::host_answer(7);
        assert!(session.on_ice_message(message.clone()));
        let peer = session.peer(7).unwrap();
        assert!(wait_for(|| peer.engine().state() == IceState::Connected));

        message.src_id = 99;
        assert!(!session.on_ice_message(message));
        session.close();
    }

    #[test]
    fn test_game_ended_flag() {
        let relay = TestRelay::new();
        let slot = SessionSlot::new();
        assert!(!slot.set_game_ended());

        slot.replace(session(&relay));
        assert!(slot.set_game_ended());
        assert!(slot.get().unwrap().is_game_ended());
    }

    #[test]
    fn test_slot_replace_closes_previous() {
        let relay = TestRelay::new();
        let slot = SessionSlot::new();

        let first = session(&relay);
        first.connect("bob", 7, false, 0).unwrap();
        slot.replace(Arc::clone(&first));

        slot.replace(session(&relay));
        assert!(first.is_closed());
        assert_eq!(first.peer_count(), 0);

        assert!(slot.close());
        assert!(slot.get().is_none());
        assert!(!slot.close());
    }
}
