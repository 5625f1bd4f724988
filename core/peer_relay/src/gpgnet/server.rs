//! TCP server the game process connects to
//!
//! Exactly one game may be attached. A new connection evicts the previous
//! one, and losing the connection tears down the active game session.
//! Outbound commands are held until the game reports `Lobby`.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;

use super::codec::{decode_message, write_message, DecodeError, GpgnetArg, GpgnetMessage};
use super::{GameState, LobbyInitMode};
use crate::events::AdapterEvents;
use crate::metrics::Metrics;
use crate::session::SessionSlot;
use crate::timer::{lock, CancelToken};

/// How often the acceptor checks for shutdown between connections
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const READ_CHUNK: usize = 4096;

/// Resolved settings for the GPGNet server
#[derive(Debug, Clone)]
pub struct GpgnetConfig {
    /// TCP port to listen on, 0 for any
    pub port: u16,
    /// UDP port the game receives peer traffic on
    pub lobby_port: u16,
    pub local_id: i32,
    pub login: String,
    pub lobby_init_mode: LobbyInitMode,
}

/// Serializable view of the server for the status report
#[derive(Debug, Clone, Serialize)]
pub struct GpgnetStatus {
    pub local_port: u16,
    pub connected: bool,
    pub game_state: String,
    pub lobby_init_mode: LobbyInitMode,
    pub queued: usize,
}

// ============================================================================
// Client
// ============================================================================

/// The attached game
struct GpgnetClient {
    id: u64,
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    game_state: Mutex<GameState>,
    /// Set under the server lock; gates outbound commands
    in_lobby: AtomicBool,
    closed: AtomicBool,
}

impl GpgnetClient {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("Closing GPGNetClient");
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("Error while closing GPGNetClient socket: {}", e);
        }
    }
}

#[derive(Default)]
struct ServerState {
    client: Option<Arc<GpgnetClient>>,
    /// Commands waiting for the game to reach the lobby
    pending: VecDeque<GpgnetMessage>,
    next_client_id: u64,
}

// ============================================================================
// Server
// ============================================================================

pub struct GpgnetServer {
    local_addr: SocketAddr,
    lobby_port: u16,
    local_id: i32,
    login: String,
    lobby_init_mode: Mutex<LobbyInitMode>,
    slot: Arc<SessionSlot>,
    events: Arc<dyn AdapterEvents>,
    metrics: Arc<Metrics>,
    state: Mutex<ServerState>,
    cancel: Arc<CancelToken>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl GpgnetServer {
    /// Bind the listener and start accepting game connections
    pub fn bind(
        config: GpgnetConfig,
        slot: Arc<SessionSlot>,
        events: Arc<dyn AdapterEvents>,
        metrics: Arc<Metrics>,
    ) -> io::Result<Arc<GpgnetServer>> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        if config.port == 0 {
            log::info!("Generated GPGNET_PORT: {}", local_addr.port());
        } else {
            log::info!("Using GPGNET_PORT: {}", local_addr.port());
        }

        let cancel = Arc::new(CancelToken::new());
        let server = Arc::new(GpgnetServer {
            local_addr,
            lobby_port: config.lobby_port,
            local_id: config.local_id,
            login: config.login,
            lobby_init_mode: Mutex::new(config.lobby_init_mode),
            slot,
            events,
            metrics,
            state: Mutex::new(ServerState::default()),
            cancel: Arc::clone(&cancel),
            acceptor: Mutex::new(None),
        });

        let weak = Arc::downgrade(&server);
        let handle = thread::Builder::new()
            .name("gpgnet-accept".to_string())
            .spawn(move || run_acceptor(listener, weak, cancel))?;
        *lock(&server.acceptor) = Some(handle);

        log::info!("GPGNetServer started");
        Ok(server)
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn lobby_port(&self) -> u16 {
        self.lobby_port
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).client.is_some()
    }

    /// State reported by the attached game, `None` when detached
    pub fn game_state(&self) -> GameState {
        let client = lock(&self.state).client.clone();
        client
            .map(|c| *lock(&c.game_state))
            .unwrap_or(GameState::None)
    }

    pub fn lobby_init_mode(&self) -> LobbyInitMode {
        *lock(&self.lobby_init_mode)
    }

    pub fn set_lobby_init_mode(&self, mode: LobbyInitMode) {
        log::info!("Lobby init mode set to {}", mode);
        *lock(&self.lobby_init_mode) = mode;
    }

    /// Deliver a command to the game once it is in the lobby
    ///
    /// Commands are written in call order.
    pub fn send_to_gpgnet(&self, message: GpgnetMessage) {
        let mut state = lock(&self.state);
        let client = match state.client.clone() {
            Some(client) if client.in_lobby.load(Ordering::SeqCst) => client,
            _ => {
                log::debug!("Queueing GPGNet message until lobby: {}", message.describe());
                state.pending.push_back(message);
                return;
            }
        };

        let result = self.write_to(&client, &message);
        drop(state);
        if let Err(e) = result {
            log::error!("Error while communicating with FA (output), assuming shutdown: {}", e);
            self.connection_lost(client.id);
        }
    }

    pub fn status(&self) -> GpgnetStatus {
        let (connected, queued) = {
            let state = lock(&self.state);
            (state.client.is_some(), state.pending.len())
        };
        GpgnetStatus {
            local_port: self.port(),
            connected,
            game_state: self.game_state().name().to_string(),
            lobby_init_mode: self.lobby_init_mode(),
            queued,
        }
    }

    /// Stop listening and drop the attached game
    pub fn close(&self) {
        self.cancel.cancel();
        let acceptor = lock(&self.acceptor).take();
        if let Some(acceptor) = acceptor {
            if acceptor.join().is_err() {
                log::error!("GPGNet acceptor panicked");
            }
        }

        let client = lock(&self.state).client.take();
        if let Some(client) = client {
            client.close();
        }
        log::info!("GPGNetServer stopped");
    }

    // ------------------------------------------------------------------------
    // Connection handling
    // ------------------------------------------------------------------------

    fn on_accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        let reader = stream.try_clone()?;

        let previous = lock(&self.state).client.as_ref().map(|c| c.id);
        if let Some(previous) = previous {
            log::info!("New game connection from {}, evicting the current one", addr);
            self.connection_lost(previous);
        }

        let client = {
            let mut state = lock(&self.state);
            let id = state.next_client_id;
            state.next_client_id += 1;
            let client = Arc::new(GpgnetClient {
                id,
                stream,
                writer: Mutex::new(writer),
                game_state: Mutex::new(GameState::None),
                in_lobby: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            });
            state.client = Some(Arc::clone(&client));
            client
        };

        let server = Arc::downgrade(self);
        let reader_client = Arc::clone(&client);
        let spawned = thread::Builder::new()
            .name(format!("gpgnet-client-{}", client.id))
            .spawn(move || run_client_reader(server, reader_client, reader));
        if let Err(e) = spawned {
            self.connection_lost(client.id);
            return Err(e);
        }

        log::info!("GPGNetClient has connected");
        self.events.on_connection_state_changed("Connected");
        Ok(())
    }

    /// Tear down client `client_id` and the active game session
    ///
    /// No-op when that client is no longer current.
    fn connection_lost(&self, client_id: u64) {
        let client = {
            let mut state = lock(&self.state);
            match &state.client {
                Some(current) if current.id == client_id => {
                    state.pending.clear();
                    state.client.take()
                }
                _ => None,
            }
        };
        let client = match client {
            Some(client) => client,
            None => return,
        };

        log::info!("GPGNet connection lost");
        client.close();
        self.events.on_connection_state_changed("Disconnected");

        if self.slot.close() {
            log::info!("Game session closed");
        }
    }

    fn process_message(&self, client: &Arc<GpgnetClient>, message: GpgnetMessage) {
        self.metrics
            .gpgnet_messages_in_total
            .fetch_add(1, Ordering::Relaxed);

        match message.header.as_str() {
            "GameState" => {
                match message.args.first().and_then(GpgnetArg::as_str).and_then(GameState::from_name) {
                    Some(state) => self.on_game_state(client, state),
                    None => log::warn!("Unknown game state: {}", message.describe()),
                }
            }
            "GameEnded" => {
                if self.slot.set_game_ended() {
                    log::info!("GameEnded received, stopping reconnects...");
                }
            }
            _ => {}
        }

        log::info!("Received GPGNet message: {}", message.describe());
        self.events
            .on_gpgnet_message_received(&message.header, &message.json_args());
    }

    fn on_game_state(&self, client: &Arc<GpgnetClient>, state: GameState) {
        let previous = std::mem::replace(&mut *lock(&client.game_state), state);
        log::debug!("New GameState: {}", state);

        match state {
            // Every entry into Idle asks for a lobby, repeated reports do not
            GameState::Idle => {
                if previous == GameState::Idle {
                    return;
                }
                let message = GpgnetMessage::new(
                    "CreateLobby",
                    vec![
                        GpgnetArg::Int(self.lobby_init_mode().id()),
                        GpgnetArg::Int(i32::from(self.lobby_port)),
                        GpgnetArg::Str(self.login.clone()),
                        GpgnetArg::Int(self.local_id),
                        GpgnetArg::Int(1),
                    ],
                );
                if let Err(e) = self.write_to(client, &message) {
                    log::error!("Error while communicating with FA (output), assuming shutdown: {}", e);
                    self.connection_lost(client.id);
                }
            }
            GameState::Lobby => self.open_lobby(client),
            _ => {}
        }
    }

    /// Let commands through and flush everything queued so far
    fn open_lobby(&self, client: &Arc<GpgnetClient>) {
        let mut state = lock(&self.state);
        let current = matches!(&state.client, Some(c) if c.id == client.id);
        if !current || client.in_lobby.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut failed = None;
        while let Some(message) = state.pending.pop_front() {
            if let Err(e) = self.write_to(client, &message) {
                failed = Some(e);
                break;
            }
        }
        drop(state);

        if let Some(e) = failed {
            log::error!("Error while communicating with FA (output), assuming shutdown: {}", e);
            self.connection_lost(client.id);
        }
    }

    fn write_to(&self, client: &GpgnetClient, message: &GpgnetMessage) -> io::Result<()> {
        let mut writer = lock(&client.writer);
        write_message(&mut *writer, message)?;
        self.metrics
            .gpgnet_messages_out_total
            .fetch_add(1, Ordering::Relaxed);
        log::info!("Sent GPGNet message: {}", message.describe());
        Ok(())
    }
}

// ============================================================================
// Threads
// ============================================================================

fn run_acceptor(listener: TcpListener, server: Weak<GpgnetServer>, cancel: Arc<CancelToken>) {
    log::info!("Listening for incoming connections from game");
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                let server = match server.upgrade() {
                    Some(server) => server,
                    None => break,
                };
                if let Err(e) = server.on_accept(stream, addr) {
                    log::error!("Game connection from {} failed: {}", addr, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if cancel.wait_timeout(ACCEPT_POLL_INTERVAL) {
                    break;
                }
            }
            Err(e) => {
                log::error!("Could not listen on socket: {}", e);
                if cancel.wait_timeout(ACCEPT_POLL_INTERVAL) {
                    break;
                }
            }
        }
    }
    log::debug!("GPGNet acceptor stopped");
}

fn run_client_reader(server: Weak<GpgnetServer>, client: Arc<GpgnetClient>, mut stream: TcpStream) {
    log::debug!("Listening for GPG messages");
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    let reason = 'read: loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => break 'read "connection closed by game".to_string(),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break 'read e.to_string(),
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match decode_message(&buf) {
                Ok((message, consumed)) => {
                    buf.drain(..consumed);
                    match server.upgrade() {
                        Some(server) => server.process_message(&client, message),
                        None => return,
                    }
                    if client.closed.load(Ordering::SeqCst) {
                        return;
                    }
                }
                Err(DecodeError::Incomplete(_)) => break,
                Err(e) => break 'read e.to_string(),
            }
        }
    };

    if client.closed.load(Ordering::SeqCst) {
        log::debug!("No longer listening for GPGNET from FA");
        return;
    }
    log::error!("Error while communicating with FA (input), assuming shutdown: {}", reason);
    if let Some(server) = server.upgrade() {
        server.connection_lost(client.id);
    }
}

// ============================================================================
// Tests
// ============================================================================
