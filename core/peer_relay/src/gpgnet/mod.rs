//! GPGNet: the local protocol spoken by the game process
//!
//! The game connects once over TCP, reports its lifecycle through
//! `GameState` messages and receives lobby commands from the adapter.

pub mod codec;
pub mod server;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use codec::{GpgnetArg, GpgnetMessage};
pub use server::GpgnetServer;

/// Game lifecycle as reported by the game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameState {
    None,
    Idle,
    Lobby,
    Launching,
    Ended,
}

impl GameState {
    pub fn name(&self) -> &'static str {
        match self {
            GameState::None => "None",
            GameState::Idle => "Idle",
            GameState::Lobby => "Lobby",
            GameState::Launching => "Launching",
            GameState::Ended => "Ended",
        }
    }

    pub fn from_name(name: &str) -> Option<GameState> {
        match name {
            "None" => Some(GameState::None),
            "Idle" => Some(GameState::Idle),
            "Lobby" => Some(GameState::Lobby),
            "Launching" => Some(GameState::Launching),
            "Ended" => Some(GameState::Ended),
            _ => None,
        }
    }

    /// Whether new peer connections should be refused
    pub fn refuses_peers(&self) -> bool {
        matches!(self, GameState::Launching | GameState::Ended)
    }
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the game shows its lobby, sent with `CreateLobby`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LobbyInitMode {
    /// Normal lobby screen with game options
    #[default]
    Normal,
    /// Skip the lobby screen (matchmaker games)
    Auto,
}

impl LobbyInitMode {
    pub fn name(&self) -> &'static str {
        match self {
            LobbyInitMode::Normal => "normal",
            LobbyInitMode::Auto => "auto",
        }
    }

    /// Wire value of the mode
    pub fn id(&self) -> i32 {
        match self {
            LobbyInitMode::Normal => 0,
            LobbyInitMode::Auto => 1,
        }
    }

    pub fn from_name(name: &str) -> Option<LobbyInitMode> {
        match name {
            "normal" => Some(LobbyInitMode::Normal),
            "auto" => Some(LobbyInitMode::Auto),
            _ => None,
        }
    }
}

impl fmt::Display for LobbyInitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
