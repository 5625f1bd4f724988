//! ICE Adapter
//!
//! A local bridge between the game and remote players:
//! - Serves GPGNet to the game process on a loopback TCP port
//! - Takes host/join/connect commands from the client over JSON-RPC
//! - Negotiates an ICE link per remote player and relays game datagrams
//! - Re-establishes broken links until the game ends

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use peer_relay::GameState;

mod adapter;
mod latency;
mod options;
mod rpc;

use adapter::Adapter;
use latency::StunLatencyOracle;
use options::{AdapterOptions, OptionsError, USAGE};
use rpc::{RpcEvents, RpcHub, RpcServer};

/// How often the main thread checks for a shutdown request
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let options = match AdapterOptions::parse(&args) {
        Ok(options) => options,
        Err(OptionsError::HelpRequested) => {
            print!("{}", USAGE);
            return Ok(());
        }
        Err(e) => {
            eprintln!("error: {}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    log::info!("ICE adapter {} starting...", env!("CARGO_PKG_VERSION"));
    log::info!("  Player:      {}({})", options.login, options.id);
    log::info!("  Game:        {}", options.game_id);
    log::info!("  RPC port:    {}", options.rpc_port);
    log::info!("  Force relay: {}", options.force_relay);
    log::info!("  Lobby mode:  {}", options.lobby_init_mode);

    // SIGINT/SIGTERM and the quit method all raise this flag
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let hub = Arc::new(RpcHub::new());
    let on_first_client_lost = {
        let hub = Arc::clone(&hub);
        let shutdown = Arc::clone(&shutdown);
        Box::new(move |state: GameState| {
            if state == GameState::Launching {
                log::warn!("Lost connection to first RPC Peer. GameState: LAUNCHING, NOT STOPPING!");
                hub.mute();
            } else {
                log::info!(
                    "Lost connection to first RPC Peer. GameState: {}, Stopping adapter...",
                    state
                );
                shutdown.store(true, Ordering::SeqCst);
            }
        })
    };

    let adapter = Adapter::start(
        options.clone(),
        Arc::new(RpcEvents::new(Arc::clone(&hub))),
        Arc::new(StunLatencyOracle::new()),
        Arc::clone(&shutdown),
        on_first_client_lost,
    )
    .map_err(|e| {
        log::error!("Couldn't start GPGNetServer: {}", e);
        e
    })?;
    log::info!("  GPGNet port: {}", adapter.gpgnet_port());
    log::info!("  Lobby port:  {}", adapter.lobby_port());

    let rpc = RpcServer::bind(options.rpc_port, hub, adapter.clone()).map_err(|e| {
        log::error!("Couldn't start RPC server: {}", e);
        adapter.close();
        e
    })?;

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(SHUTDOWN_POLL_INTERVAL);
    }

    adapter.close();
    rpc.close();
    log::info!("ICE adapter stopped");
    Ok(())
}
