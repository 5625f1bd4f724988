//! JSON-RPC 2.0 control channel
//!
//! The client connects over TCP and exchanges one JSON object per line.
//! Requests are dispatched to an [`RpcHandler`]; adapter notifications fan
//! out to every connected client through the [`RpcHub`]. Notifications
//! raised before the first client connects are held for it.

use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{json, Value};

use peer_relay::ice::candidate::CandidatesMessage;
use peer_relay::timer::{lock, CancelToken};
use peer_relay::AdapterEvents;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Errors
// ============================================================================

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Error object returned to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

// ============================================================================
// Parameters
// ============================================================================

pub fn param<'a>(params: &'a [Value], index: usize) -> Result<&'a Value, RpcError> {
    params
        .get(index)
        .ok_or_else(|| RpcError::invalid_params(format!("missing parameter {}", index)))
}

pub fn param_str(params: &[Value], index: usize) -> Result<&str, RpcError> {
    param(params, index)?
        .as_str()
        .ok_or_else(|| RpcError::invalid_params(format!("parameter {} must be a string", index)))
}

pub fn param_i32(params: &[Value], index: usize) -> Result<i32, RpcError> {
    let value = param(params, index)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .map(|i| i as i32)
        .ok_or_else(|| RpcError::invalid_params(format!("parameter {} must be a number", index)))
}

pub fn param_bool(params: &[Value], index: usize) -> Result<bool, RpcError> {
    param(params, index)?
        .as_bool()
        .ok_or_else(|| RpcError::invalid_params(format!("parameter {} must be a boolean", index)))
}

// ============================================================================
// Dispatch
// ============================================================================

/// Implements the methods the client may call
pub trait RpcHandler: Send + Sync {
    fn handle(&self, method: &str, params: &[Value]) -> Result<Value, RpcError>;

    /// The first client ever connected has gone away
    fn on_first_client_lost(&self) {}
}

fn error_response(id: Value, error: &RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": error.code, "message": error.message },
    })
}

/// Process one request line; returns the response, if one is due
pub fn handle_line(handler: &dyn RpcHandler, line: &str) -> Option<Value> {
    let request: Value = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("Unparseable RPC request: {}", e);
            return Some(error_response(Value::Null, &RpcError::new(PARSE_ERROR, e.to_string())));
        }
    };

    let id = request.get("id").cloned();
    let method = match request.get("method").and_then(Value::as_str) {
        Some(method) => method,
        None => {
            let error = RpcError::new(INVALID_REQUEST, "missing method");
            return Some(error_response(id.unwrap_or(Value::Null), &error));
        }
    };

    let params: Vec<Value> = match request.get("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(params)) => params.clone(),
        Some(_) => {
            let error = RpcError::invalid_params("params must be an array");
            return id.map(|id| error_response(id, &error));
        }
    };

    log::debug!("RPC call {} {:?}", method, params);
    let result = handler.handle(method, &params);

    let id = id?;
    Some(match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(error) => {
            log::warn!("RPC call {} failed: {}", method, error);
            error_response(id, &error)
        }
    })
}

// ============================================================================
// Hub
// ============================================================================

struct RpcClient {
    id: u64,
    stream: TcpStream,
    writer: Mutex<TcpStream>,
}

impl RpcClient {
    fn send_line(&self, line: &str) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

#[derive(Default)]
struct HubState {
    clients: Vec<Arc<RpcClient>>,
    /// Notifications waiting for the first client
    backlog: Vec<String>,
    seen_client: bool,
    next_id: u64,
}

/// Connected clients and the notification fan-out
#[derive(Default)]
pub struct RpcHub {
    state: Mutex<HubState>,
    muted: AtomicBool,
}

impl RpcHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a notification to every client
    pub fn notify(&self, method: &str, params: Value) {
        if self.muted.load(Ordering::SeqCst) {
            return;
        }
        let line = json!({ "jsonrpc": "2.0", "method": method, "params": params }).to_string();

        let mut state = lock(&self.state);
        if !state.seen_client {
            state.backlog.push(line);
            return;
        }

        state.clients.retain(|client| match client.send_line(&line) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Dropping RPC client {}: {}", client.id, e);
                let _ = client.stream.shutdown(Shutdown::Both);
                false
            }
        });
    }

    /// Stop sending notifications for good
    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    pub fn client_count(&self) -> usize {
        lock(&self.state).clients.len()
    }

    /// Register a client; returns its id and whether it is the first
    fn attach(&self, stream: TcpStream) -> io::Result<(Arc<RpcClient>, bool)> {
        let writer = stream.try_clone()?;
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        let client = Arc::new(RpcClient {
            id,
            stream,
            writer: Mutex::new(writer),
        });

        let first = !state.seen_client;
        state.seen_client = true;
        for line in state.backlog.drain(..) {
            client.send_line(&line)?;
        }
        state.clients.push(Arc::clone(&client));
        Ok((client, first))
    }

    fn detach(&self, id: u64) {
        lock(&self.state).clients.retain(|client| client.id != id);
    }

    fn close_all(&self) {
        let clients: Vec<Arc<RpcClient>> = lock(&self.state).clients.drain(..).collect();
        for client in clients {
            let _ = client.stream.shutdown(Shutdown::Both);
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Adapter notifications forwarded over RPC
pub struct RpcEvents {
    hub: Arc<RpcHub>,
}

impl RpcEvents {
    pub fn new(hub: Arc<RpcHub>) -> Self {
        Self { hub }
    }
}

impl AdapterEvents for RpcEvents {
    fn on_ice_msg(&self, message: &CandidatesMessage) {
        match message.to_json() {
            Ok(json) => self.hub.notify(
                "onIceMsg",
                json!([message.src_id, message.dest_id, json]),
            ),
            Err(e) => log::error!("Could not serialize candidates message: {}", e),
        }
    }

    fn on_ice_connection_state_changed(&self, local_id: i32, remote_id: i32, state: &str) {
        self.hub.notify(
            "onIceConnectionStateChanged",
            json!([local_id, remote_id, state]),
        );
    }

    fn on_connected(&self, local_id: i32, remote_id: i32, connected: bool) {
        self.hub
            .notify("onConnected", json!([local_id, remote_id, connected]));
    }

    fn on_gpgnet_message_received(&self, header: &str, args: &[Value]) {
        self.hub
            .notify("onGpgNetMessageReceived", json!([header, args]));
    }

    fn on_connection_state_changed(&self, state: &str) {
        self.hub.notify("onConnectionStateChanged", json!([state]));
    }
}

// ============================================================================
// Server
// ============================================================================

/// TCP listener for RPC clients
pub struct RpcServer {
    local_addr: SocketAddr,
    hub: Arc<RpcHub>,
    cancel: Arc<CancelToken>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    pub fn bind(port: u16, hub: Arc<RpcHub>, handler: Arc<dyn RpcHandler>) -> io::Result<RpcServer> {
        log::info!("Creating RPC server on port {}", port);
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let cancel = Arc::new(CancelToken::new());
        let acceptor = {
            let hub = Arc::clone(&hub);
            let cancel = Arc::clone(&cancel);
            thread::Builder::new()
                .name("rpc-accept".to_string())
                .spawn(move || run_acceptor(listener, hub, handler, cancel))?
        };

        Ok(RpcServer {
            local_addr,
            hub,
            cancel,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn close(&self) {
        self.cancel.cancel();
        let acceptor = lock(&self.acceptor).take();
        if let Some(acceptor) = acceptor {
            if acceptor.join().is_err() {
                log::error!("RPC acceptor panicked");
            }
        }
        self.hub.close_all();
    }
}

fn run_acceptor(
    listener: TcpListener,
    hub: Arc<RpcHub>,
    handler: Arc<dyn RpcHandler>,
    cancel: Arc<CancelToken>,
) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                log::info!("RPC client connected from {}", addr);
                if let Err(e) = start_client(stream, &hub, &handler) {
                    log::error!("RPC client {} failed: {}", addr, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if cancel.wait_timeout(ACCEPT_POLL_INTERVAL) {
                    break;
                }
            }
            Err(e) => {
                log::error!("RPC accept failed: {}", e);
                if cancel.wait_timeout(ACCEPT_POLL_INTERVAL) {
                    break;
                }
            }
        }
    }
}

fn start_client(
    stream: TcpStream,
    hub: &Arc<RpcHub>,
    handler: &Arc<dyn RpcHandler>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let reader = stream.try_clone()?;
    let (client, first) = hub.attach(stream)?;

    let hub = Arc::clone(hub);
    let handler = Arc::clone(handler);
    thread::Builder::new()
        .name(format!("rpc-client-{}", client.id))
        .spawn(move || {
            serve_client(reader, &client, handler.as_ref());
            hub.detach(client.id);
            if first {
                handler.on_first_client_lost();
            }
        })?;
    Ok(())
}

fn serve_client(stream: TcpStream, client: &RpcClient, handler: &dyn RpcHandler) {
    for line in BufReader::new(stream).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::debug!("RPC client {} read failed: {}", client.id, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        if let Some(response) = handle_line(handler, &line) {
            if let Err(e) = client.send_line(&response.to_string()) {
                log::debug!("RPC client {} write failed: {}", client.id, e);
                break;
            }
        }
    }
    log::info!("RPC client {} disconnected", client.id);
}

// ============================================================================
// Tests
// ============================================================================
