//! One remote player coupled to a local UDP socket
//!
//! The game addresses its traffic for a remote player to the peer's local
//! port. A reader thread forwards every datagram into the negotiation engine;
//! payload arriving over ICE goes back out the same socket to the game's
//! lobby port.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use serde::Serialize;

use crate::ice::candidate::CandidatesMessage;
use crate::ice::engine::{EngineStatus, IceDataSink, IceEngine};
use crate::net::bind_loopback_udp;
use crate::session::RelayContext;
use crate::timer::lock;

const GAME_SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

/// Largest datagram read from the game
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Write side of the game socket, shared with the engine
struct GameSocket {
    label: String,
    /// `None` once the peer is closed
    socket: Mutex<Option<Arc<UdpSocket>>>,
    lobby_addr: SocketAddr,
    closing: Arc<AtomicBool>,
}

impl IceDataSink for GameSocket {
    fn on_ice_data_received(&self, data: &[u8]) {
        // Held for the send so writes to the game are serialized
        let socket = lock(&self.socket);
        let socket = match socket.as_ref() {
            Some(socket) => socket,
            None => {
                log::debug!("Dropping data for closed peer {}", self.label);
                return;
            }
        };

        match socket.send_to(data, self.lobby_addr) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::trace!("Game socket of {} full, dropping {} bytes", self.label, data.len());
            }
            Err(e) if self.closing.load(Ordering::SeqCst) => {
                log::debug!(
                    "Ignoring error the send packet because the connection was closed {}: {}",
                    self.label,
                    e
                );
            }
            Err(e) => {
                log::error!(
                    "Error while writing to local FA as peer (probably disconnecting from peer) {}: {}",
                    self.label,
                    e
                );
            }
        }
    }
}

/// Serializable view of a peer for the status report
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub id: i32,
    pub login: String,
    pub local_port: u16,
    pub offer: bool,
    pub closing: bool,
    pub ice: EngineStatus,
}

/// A remote player in the current game
pub struct Peer {
    remote_id: i32,
    remote_login: String,
    local_offer: bool,
    local_port: u16,
    closing: Arc<AtomicBool>,
    game: Arc<GameSocket>,
    engine: Arc<IceEngine>,
    waker: Waker,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Bind the game socket and start forwarding
    ///
    /// `preferred_port` of 0 binds an ephemeral port. An offering peer starts
    /// negotiating right away.
    pub fn new(
        ctx: Arc<RelayContext>,
        game_ended: Arc<AtomicBool>,
        remote_id: i32,
        remote_login: &str,
        local_offer: bool,
        preferred_port: u16,
    ) -> io::Result<Arc<Peer>> {
        let label = format!("{}({})", remote_login, remote_id);
        log::debug!(
            "Peer created: {}, localOffer: {}, preferredPort: {}",
            label,
            local_offer,
            preferred_port
        );

        let std_socket = bind_loopback_udp(preferred_port).map_err(|e| {
            log::error!("Could not create socket for peer: {}: {}", label, e);
            e
        })?;
        let local_port = std_socket.local_addr()?.port();
        std_socket.set_nonblocking(true)?;
        let mut socket = UdpSocket::from_std(std_socket);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, GAME_SOCKET, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let socket = Arc::new(socket);

        let closing = Arc::new(AtomicBool::new(false));
        let game = Arc::new(GameSocket {
            label: label.clone(),
            socket: Mutex::new(Some(Arc::clone(&socket))),
            lobby_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), ctx.lobby_port),
            closing: Arc::clone(&closing),
        });

        let engine = IceEngine::new(
            ctx,
            remote_id,
            remote_login.to_string(),
            local_offer,
            game_ended,
            game.clone(),
        );

        let reader = {
            let engine = Arc::clone(&engine);
            let closing = Arc::clone(&closing);
            let label = label.clone();
            thread::Builder::new()
                .name(format!("game-reader-{}", remote_id))
                .spawn(move || run_reader(poll, socket, engine, closing, label))?
        };
        log::debug!("Now forwarding data to peer {}", label);

        if local_offer {
            let engine = Arc::clone(&engine);
            let spawned = thread::Builder::new()
                .name(format!("initiate-ice-{}", remote_id))
                .spawn(move || engine.initiate_ice());
            if let Err(e) = spawned {
                log::error!("Could not start ICE for {}: {}", label, e);
            }
        }

        Ok(Arc::new(Peer {
            remote_id,
            remote_login: remote_login.to_string(),
            local_offer,
            local_port,
            closing,
            game,
            engine,
            waker,
            reader: Mutex::new(Some(reader)),
        }))
    }

    pub fn remote_id(&self) -> i32 {
        self.remote_id
    }

    pub fn remote_login(&self) -> &str {
        &self.remote_login
    }

    pub fn is_local_offer(&self) -> bool {
        self.local_offer
    }

    /// Port the game sends this player's traffic to
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn engine(&self) -> &Arc<IceEngine> {
        &self.engine
    }

    /// `login(id)`
    pub fn identifier(&self) -> String {
        format!("{}({})", self.remote_login, self.remote_id)
    }

    /// Write payload received over ICE to the game
    pub fn on_ice_data_received(&self, data: &[u8]) {
        self.game.on_ice_data_received(data);
    }

    /// Hand remote candidates to the engine
    pub fn on_ice_message_received(&self, message: CandidatesMessage) {
        self.engine.on_ice_message_received(message);
    }

    /// Stop forwarding, release the port and close the engine
    ///
    /// Idempotent. The port is free again once this returns.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Closing peer for player {}", self.identifier());

        if let Err(e) = self.waker.wake() {
            log::warn!("Failed to wake game reader of {}: {}", self.identifier(), e);
        }
        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            if reader.join().is_err() {
                log::error!("Game reader of {} panicked", self.identifier());
            }
        }
        lock(&self.game.socket).take();

        self.engine.close();
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            id: self.remote_id,
            login: self.remote_login.clone(),
            local_port: self.local_port,
            offer: self.local_offer,
            closing: self.is_closing(),
            ice: self.engine.status(),
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_reader(
    mut poll: Poll,
    socket: Arc<UdpSocket>,
    engine: Arc<IceEngine>,
    closing: Arc<AtomicBool>,
    label: String,
) {
    let mut events = Events::with_capacity(16);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    'outer: loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("Game socket poll failed for {}: {}", label, e);
            break;
        }
        if closing.load(Ordering::SeqCst) {
            break;
        }

        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, _)) => engine.on_game_data_received(&buf[..len]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    if closing.load(Ordering::SeqCst) {
                        log::debug!(
                            "Ignoring error the receive packet because the connection was closed as peer {}",
                            label
                        );
                    } else {
                        log::debug!(
                            "Error while reading from local FA as peer (probably disconnecting from peer) {}: {}",
                            label,
                            e
                        );
                    }
                    break 'outer;
                }
            }
        }
    }

    log::debug!("No longer listening for messages from FA");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::candidate::{CandidatePacket, CandidateType};
    use crate::ice::engine::IceState;
    use crate::testing::{wait_for, TestRelay};
    use std::net::UdpSocket as StdUdpSocket;
    use std::time::Duration;

    fn game_socket() -> StdUdpSocket {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        socket
    }

    fn answer() -> CandidatesMessage {
        CandidatesMessage {
            src_id: 7,
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

    #[test]
    fn test_binds_ephemeral_port() {
        let relay = TestRelay::new();
        let peer = Peer::new(
            Arc::clone(&relay.ctx),
            Arc::new(AtomicBool::new(false)),
            7,
            "bob",
            false,
            0,
        )
        .unwrap();

        assert_ne!(peer.local_port(), 0);
        assert_eq!(peer.identifier(), "bob(7)");
        assert!(!peer.is_local_offer());
        peer.close();
    }

    #[test]
    fn test_offerer_starts_negotiation() {
        let relay = TestRelay::new();
        let peer = Peer::new(
            Arc::clone(&relay.ctx),
            Arc::new(AtomicBool::new(false)),
            7,
            "bob",
            true,
            0,
        )
        .unwrap();

        assert!(wait_for(|| relay.events.ice_messages().len() == 1));
        assert_eq!(peer.engine().state(), IceState::AwaitingCandidates);
        peer.close();
    }

    #[test]
    fn test_relays_between_game_and_ice() {
        let game = game_socket();
        let relay = TestRelay::with_lobby_port(game.local_addr().unwrap().port());
        let peer = Peer::new(
            Arc::clone(&relay.ctx),
            Arc::new(AtomicBool::new(false)),
            7,
            "bob",
            true,
            0,
        )
        .unwrap();

        assert!(wait_for(|| peer.engine().state() == IceState::AwaitingCandidates));
        peer.engine().handle_remote_message(answer());
        assert!(wait_for(|| peer.engine().is_connected()));
        let agent = relay.agents.agent(0).unwrap();

        // game -> ICE
        game.send_to(b"ping", ("127.0.0.1", peer.local_port())).unwrap();
        assert!(wait_for(|| agent.sent().contains(&b"dping".to_vec())));

        // ICE -> game
        agent.deliver(b"dpong".to_vec());
        let mut buf = [0u8; 64];
        let (len, from) = game.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"pong");
        assert_eq!(from.port(), peer.local_port());

        peer.close();
    }

    #[test]
    fn test_close_releases_port_and_engine() {
        let relay = TestRelay::new();
        let peer = Peer::new(
            Arc::clone(&relay.ctx),
            Arc::new(AtomicBool::new(false)),
            7,
            "bob",
            true,
            0,
        )
        .unwrap();
        let port = peer.local_port();
        assert!(wait_for(|| relay.agents.created() == 1));

        peer.close();
        peer.close();

        assert!(peer.is_closing());
        assert!(peer.engine().is_closing());
        assert!(wait_for(|| relay.agents.agent(0).unwrap().is_freed()));

        // Same port can be bound again right away
        let again = StdUdpSocket::bind(("127.0.0.1", port));
        assert!(again.is_ok());
    }

    #[test]
    fn test_data_after_close_is_dropped() {
        let game = game_socket();
        game.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let relay = TestRelay::with_lobby_port(game.local_addr().unwrap().port());
        let peer = Peer::new(
            Arc::clone(&relay.ctx),
            Arc::new(AtomicBool::new(false)),
            7,
            "bob",
            false,
            0,
        )
        .unwrap();

        peer.close();
        peer.on_ice_data_received(b"late");

        let mut buf = [0u8; 16];
        assert!(game.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_status_snapshot() {
        let relay = TestRelay::new();
        let peer = Peer::new(
            Arc::clone(&relay.ctx),
            Arc::new(AtomicBool::new(false)),
            7,
            "bob",
            false,
            0,
        )
        .unwrap();

        let status = serde_json::to_value(peer.status()).unwrap();
        assert_eq!(status["id"], 7);
        assert_eq!(status["login"], "bob");
        assert_eq!(status["offer"], false);
        assert_eq!(status["ice"]["state"], "new");
        peer.close();
    }
}
