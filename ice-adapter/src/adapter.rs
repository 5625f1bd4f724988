//! The orchestrator: wires the core together and serves the RPC methods

use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use peer_relay::gpgnet::server::{GpgnetConfig, GpgnetStatus};
use peer_relay::ice::agent::{UdpAgentConfig, UdpAgentFactory};
use peer_relay::ice::candidate::CandidateIds;
use peer_relay::peer::PeerStatus;
use peer_relay::timer::{SystemClock, ThreadScheduler};
use peer_relay::{
    AdapterEvents, CandidatePolicy, CandidatesMessage, EngineConfig, GameSession, GameState,
    GpgnetArg, GpgnetMessage, GpgnetServer, IceServerConfig, IceServers, LatencyConfig,
    LatencyOracle, LobbyInitMode, Metrics, RelayContext, SessionSlot,
};

use crate::options::AdapterOptions;
use crate::rpc::{param, param_bool, param_i32, param_str, RpcError, RpcHandler, METHOD_NOT_FOUND};

/// Snapshot returned by the `status` method
#[derive(Debug, Serialize)]
pub struct AdapterStatus {
    pub version: &'static str,
    pub ice_servers_size: usize,
    pub lobby_port: u16,
    pub init_mode: LobbyInitMode,
    pub options: StatusOptions,
    pub gpgnet: GpgnetStatus,
    pub relays: Vec<PeerStatus>,
    pub metrics: String,
}

#[derive(Debug, Serialize)]
pub struct StatusOptions {
    pub player_id: i32,
    pub player_login: String,
    pub game_id: i32,
    pub rpc_port: u16,
    pub gpgnet_port: u16,
    pub force_relay: bool,
}

pub struct Adapter {
    options: AdapterOptions,
    ctx: Arc<RelayContext>,
    slot: Arc<SessionSlot>,
    gpgnet: Arc<GpgnetServer>,
    scheduler: Arc<ThreadScheduler>,
    shutdown: Arc<AtomicBool>,
    on_first_client_lost: Box<dyn Fn(GameState) + Send + Sync>,
}

impl Adapter {
    /// Bind the game-facing ports and assemble the relay context
    ///
    /// `on_first_client_lost` decides what happens when the controlling
    /// client goes away, given the current game state.
    pub fn start(
        options: AdapterOptions,
        events: Arc<dyn AdapterEvents>,
        oracle: Arc<dyn LatencyOracle>,
        shutdown: Arc<AtomicBool>,
        on_first_client_lost: Box<dyn Fn(GameState) + Send + Sync>,
    ) -> io::Result<Arc<Adapter>> {
        let lobby_port = if options.lobby_port == 0 {
            let port = UdpSocket::bind("127.0.0.1:0")?.local_addr()?.port();
            log::info!("Generated LOBBY_PORT: {}", port);
            port
        } else {
            log::info!("Using LOBBY_PORT: {}", options.lobby_port);
            options.lobby_port
        };

        let config = EngineConfig::default();
        let scheduler = Arc::new(ThreadScheduler::new());
        let metrics = Arc::new(Metrics::new());
        let policy = if options.force_relay {
            CandidatePolicy::force_relay()
        } else {
            CandidatePolicy::allow_all()
        };

        let agents = UdpAgentFactory::new(UdpAgentConfig {
            port_range: config.ice_port_range.clone(),
            ..UdpAgentConfig::default()
        });

        let ctx = Arc::new(RelayContext {
            local_id: options.id,
            lobby_port,
            config,
            policy,
            ice_servers: Arc::new(IceServers::new(
                oracle,
                LatencyConfig {
                    ping_count: options.ping_count,
                    acceptable_latency_ms: options.acceptable_latency,
                },
            )),
            agents: Arc::new(agents),
            events: Arc::clone(&events),
            scheduler: scheduler.clone(),
            clock: Arc::new(SystemClock),
            metrics: Arc::clone(&metrics),
            candidate_ids: CandidateIds::new(),
        });

        let slot = Arc::new(SessionSlot::new());
        let gpgnet = GpgnetServer::bind(
            GpgnetConfig {
                port: options.gpgnet_port,
                lobby_port,
                local_id: options.id,
                login: options.login.clone(),
                lobby_init_mode: options.lobby_init_mode,
            },
            Arc::clone(&slot),
            events,
            metrics,
        )?;

        Ok(Arc::new(Adapter {
            options,
            ctx,
            slot,
            gpgnet,
            scheduler,
            shutdown,
            on_first_client_lost,
        }))
    }

    pub fn gpgnet_port(&self) -> u16 {
        self.gpgnet.port()
    }

    pub fn lobby_port(&self) -> u16 {
        self.ctx.lobby_port
    }

    pub fn session(&self) -> Option<Arc<GameSession>> {
        self.slot.get()
    }

    fn create_game_session(&self) -> Arc<GameSession> {
        let session = Arc::new(GameSession::new(Arc::clone(&self.ctx)));
        self.slot.replace(Arc::clone(&session));
        session
    }

    fn active_session(&self) -> Result<Arc<GameSession>, RpcError> {
        self.slot
            .get()
            .ok_or_else(|| RpcError::internal("no active game session"))
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    pub fn host_game(&self, map_name: &str) {
        log::info!("onHostGame {}", map_name);
        self.create_game_session();
        self.gpgnet
            .send_to_gpgnet(GpgnetMessage::new("HostGame", vec![map_name.into()]));
    }

    pub fn join_game(&self, remote_login: &str, remote_id: i32) -> io::Result<u16> {
        log::info!("onJoinGame {} {}", remote_id, remote_login);
        let session = self.create_game_session();
        let port = session.connect(remote_login, remote_id, false, 0)?;

        self.gpgnet.send_to_gpgnet(GpgnetMessage::new(
            "JoinGame",
            vec![
                format!("127.0.0.1:{}", port).into(),
                remote_login.into(),
                remote_id.into(),
            ],
        ));
        Ok(port)
    }

    /// Returns the local port, `None` when refused in the current game state
    pub fn connect_to_peer(
        &self,
        remote_login: &str,
        remote_id: i32,
        offer: bool,
    ) -> Result<Option<u16>, RpcError> {
        if self.gpgnet.is_connected() && self.gpgnet.game_state().refuses_peers() {
            log::warn!("Game ended or in progress, ABORTING connectToPeer");
            return Ok(None);
        }

        log::info!(
            "onConnectToPeer {} {}, offer: {}",
            remote_id,
            remote_login,
            offer
        );
        let port = self
            .active_session()?
            .connect(remote_login, remote_id, offer, 0)
            .map_err(|e| RpcError::internal(e.to_string()))?;

        self.gpgnet.send_to_gpgnet(GpgnetMessage::new(
            "ConnectToPeer",
            vec![
                format!("127.0.0.1:{}", port).into(),
                remote_login.into(),
                remote_id.into(),
            ],
        ));
        Ok(Some(port))
    }

    pub fn disconnect_from_peer(&self, remote_id: i32) -> Result<(), RpcError> {
        log::info!("onDisconnectFromPeer {}", remote_id);
        self.active_session()?.disconnect(remote_id);
        self.gpgnet
            .send_to_gpgnet(GpgnetMessage::new("DisconnectFromPeer", vec![remote_id.into()]));
        Ok(())
    }

    pub fn reconnect_to_peer(&self, remote_id: i32) -> Result<Option<u16>, RpcError> {
        self.active_session()?
            .reconnect(remote_id)
            .map_err(|e| RpcError::internal(e.to_string()))
    }

    /// Route a candidates message to its peer; false when dropped
    pub fn ice_msg(&self, remote_id: i32, msg: &Value) -> bool {
        let parsed = match msg {
            Value::String(json) => CandidatesMessage::from_json(json),
            other => serde_json::from_value(other.clone()),
        };
        let message = match parsed {
            Ok(message) => message,
            Err(e) => {
                log::error!("Failed to parse iceMsg {}: {}", msg, e);
                return false;
            }
        };

        let routed = match self.slot.get().and_then(|s| s.peer(remote_id)) {
            Some(peer) => {
                peer.on_ice_message_received(message);
                true
            }
            None => false,
        };
        if !routed {
            log::error!("ICE MESSAGE IGNORED for id: {}", remote_id);
        }
        log::info!("IceMsg received {}", msg);
        routed
    }

    pub fn send_to_gpgnet(&self, header: &str, args: &[Value]) {
        let args = args
            .iter()
            .filter_map(|arg| {
                let converted = GpgnetArg::from_json(arg);
                if converted.is_none() {
                    log::warn!("Dropping GPGNet argument without wire form: {}", arg);
                }
                converted
            })
            .collect();
        self.gpgnet.send_to_gpgnet(GpgnetMessage::new(header, args));
    }

    pub fn set_ice_servers(&self, servers: &[IceServerConfig]) {
        self.ctx.ice_servers.set(servers);
    }

    pub fn set_lobby_init_mode(&self, mode: LobbyInitMode) {
        self.gpgnet.set_lobby_init_mode(mode);
    }

    pub fn status(&self) -> AdapterStatus {
        let ice_servers_size = self
            .ctx
            .ice_servers
            .all()
            .iter()
            .map(|s| s.address_count())
            .sum();

        AdapterStatus {
            version: env!("CARGO_PKG_VERSION"),
            ice_servers_size,
            lobby_port: self.ctx.lobby_port,
            init_mode: self.gpgnet.lobby_init_mode(),
            options: StatusOptions {
                player_id: self.options.id,
                player_login: self.options.login.clone(),
                game_id: self.options.game_id,
                rpc_port: self.options.rpc_port,
                gpgnet_port: self.gpgnet.port(),
                force_relay: self.options.force_relay,
            },
            gpgnet: self.gpgnet.status(),
            relays: self.slot.get().map(|s| s.status()).unwrap_or_default(),
            metrics: self.ctx.metrics.render(),
        }
    }

    /// Ask the main loop to stop
    pub fn quit(&self) {
        log::warn!("Close requested, stopping...");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Close the game session and release every port
    pub fn close(&self) {
        log::info!("close() - stopping the adapter");
        self.slot.close();
        self.gpgnet.close();
        self.scheduler.shutdown();
    }
}

impl RpcHandler for Adapter {
    fn handle(&self, method: &str, params: &[Value]) -> Result<Value, RpcError> {
        match method {
            "hostGame" => {
                self.host_game(param_str(params, 0)?);
                Ok(Value::Null)
            }
            "joinGame" => {
                let port = self
                    .join_game(param_str(params, 0)?, param_i32(params, 1)?)
                    .map_err(|e| RpcError::internal(e.to_string()))?;
                Ok(json!(port))
            }
            "connectToPeer" => {
                let port = self.connect_to_peer(
                    param_str(params, 0)?,
                    param_i32(params, 1)?,
                    param_bool(params, 2)?,
                )?;
                Ok(json!(port))
            }
            "disconnectFromPeer" => {
                self.disconnect_from_peer(param_i32(params, 0)?)?;
                Ok(Value::Null)
            }
            "reconnectToPeer" => Ok(json!(self.reconnect_to_peer(param_i32(params, 0)?)?)),
            "iceMsg" => Ok(json!(self.ice_msg(param_i32(params, 0)?, param(params, 1)?))),
            "sendToGpgNet" => {
                let header = param_str(params, 0)?;
                match params.get(1) {
                    Some(Value::Array(args)) if params.len() == 2 => {
                        self.send_to_gpgnet(header, args)
                    }
                    _ => self.send_to_gpgnet(header, &params[1..]),
                }
                Ok(Value::Null)
            }
            "setIceServers" => {
                let servers: Vec<IceServerConfig> =
                    serde_json::from_value(param(params, 0)?.clone())
                        .map_err(|e| RpcError::invalid_params(e.to_string()))?;
                self.set_ice_servers(&servers);
                Ok(Value::Null)
            }
            "setLobbyInitMode" => {
                let name = param_str(params, 0)?;
                let mode = LobbyInitMode::from_name(name).ok_or_else(|| {
                    RpcError::invalid_params(format!("unknown lobby init mode {}", name))
                })?;
                self.set_lobby_init_mode(mode);
                Ok(Value::Null)
            }
            "status" => serde_json::to_value(self.status())
                .map_err(|e| RpcError::internal(e.to_string())),
            "quit" => {
                self.quit();
                Ok(Value::Null)
            }
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("unknown method {}", other),
            )),
        }
    }

    fn on_first_client_lost(&self) {
        (self.on_first_client_lost)(self.gpgnet.game_state());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use peer_relay::events::NoLatency;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Silent {
        states: Mutex<Vec<String>>,
    }

    impl AdapterEvents for Silent {
        fn on_ice_msg(&self, _message: &CandidatesMessage) {}
        fn on_ice_connection_state_changed(&self, _l: i32, _r: i32, _state: &str) {}
        fn on_connected(&self, _l: i32, _r: i32, _connected: bool) {}
        fn on_gpgnet_message_received(&self, _header: &str, _args: &[Value]) {}
        fn on_connection_state_changed(&self, state: &str) {
            self.states.lock().unwrap().push(state.to_string());
        }
    }

    fn options() -> AdapterOptions {
        AdapterOptions {
            id: 10,
            game_id: 99,
            login: "alice".to_string(),
            rpc_port: 0,
            gpgnet_port: 0,
            lobby_port: 0,
            force_relay: false,
            ping_count: 0,
            acceptable_latency: 250.0,
            lobby_init_mode: LobbyInitMode::Normal,
        }
    }

    fn adapter() -> (Arc<Adapter>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let adapter = Adapter::start(
            options(),
            Arc::new(Silent::default()),
            Arc::new(NoLatency),
            Arc::clone(&shutdown),
            Box::new(|_| {}),
        )
        .unwrap();
        (adapter, shutdown)
    }

    #[test]
    fn test_host_game_creates_session() {
        let (adapter, _) = adapter();
        assert!(adapter.session().is_none());

        adapter.handle("hostGame", &[json!("setons")]).unwrap();
        let first = adapter.session().unwrap();

        adapter.handle("hostGame", &[json!("setons")]).unwrap();
        assert!(first.is_closed());
        assert!(!adapter.session().unwrap().is_closed());
        assert_eq!(adapter.gpgnet.status().queued, 2);
        adapter.close();
    }

    #[test]
    fn test_join_and_connect() {
        let (adapter, _) = adapter();

        let port = adapter
            .handle("joinGame", &[json!("host"), json!(2)])
            .unwrap();
        assert!(port.as_u64().unwrap() > 0);

        adapter
            .handle("connectToPeer", &[json!("carol"), json!(3), json!(false)])
            .unwrap();
        let session = adapter.session().unwrap();
        assert_eq!(session.peer_count(), 2);
        assert!(!session.peer(2).unwrap().is_local_offer());

        adapter.handle("disconnectFromPeer", &[json!(3)]).unwrap();
        assert_eq!(session.peer_count(), 1);

        let status = adapter.handle("status", &[]).unwrap();
        assert_eq!(status["relays"].as_array().unwrap().len(), 1);
        assert_eq!(status["options"]["player_login"], "alice");
        assert_eq!(status["init_mode"], "normal");
        adapter.close();
    }

    #[test]
    fn test_reconnect_keeps_port() {
        let (adapter, _) = adapter();
        let port = adapter.join_game("host", 2).unwrap();

        let again = adapter.handle("reconnectToPeer", &[json!(2)]).unwrap();
        assert_eq!(again, json!(port));
        assert_eq!(adapter.handle("reconnectToPeer", &[json!(7)]).unwrap(), Value::Null);
        adapter.close();
    }

    #[test]
    fn test_connect_without_session_fails() {
        let (adapter, _) = adapter();
        let err = adapter
            .handle("connectToPeer", &[json!("carol"), json!(3), json!(true)])
            .unwrap_err();
        assert_eq!(err.code, crate::rpc::INTERNAL_ERROR);
        adapter.close();
    }

    #[test]
    fn test_ice_msg_for_unknown_peer_is_dropped() {
        let (adapter, _) = adapter();
        adapter.host_game("setons");

        let msg = json!({
            "srcId": 4, "destId": 10, "password": "p", "ufrag": "u", "candidates": []
        });
        assert_eq!(adapter.handle("iceMsg", &[json!(4), msg]).unwrap(), json!(false));
        assert_eq!(
            adapter.handle("iceMsg", &[json!(4), json!("{broken")]).unwrap(),
            json!(false)
        );
        adapter.close();
    }

    #[test]
    fn test_settings_methods() {
        let (adapter, _) = adapter();

        adapter
            .handle("setLobbyInitMode", &[json!("auto")])
            .unwrap();
        assert_eq!(adapter.gpgnet.lobby_init_mode(), LobbyInitMode::Auto);
        assert!(adapter
            .handle("setLobbyInitMode", &[json!("ladder")])
            .is_err());

        adapter
            .handle(
                "setIceServers",
                &[json!([{ "urls": ["stun:127.0.0.1:3478"] }])],
            )
            .unwrap();
        assert_eq!(adapter.status().ice_servers_size, 1);

        adapter
            .handle("sendToGpgNet", &[json!("Chat"), json!(["hi", 3])])
            .unwrap();
        assert_eq!(adapter.gpgnet.status().queued, 1);

        assert_eq!(
            adapter.handle("bogus", &[]).unwrap_err().code,
            METHOD_NOT_FOUND
        );
        adapter.close();
    }

    #[test]
    fn test_quit_requests_shutdown() {
        let (adapter, shutdown) = adapter();
        adapter.handle("quit", &[]).unwrap();
        assert!(shutdown.load(Ordering::SeqCst));
        adapter.close();
    }
}
