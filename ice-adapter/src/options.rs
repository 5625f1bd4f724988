//! Command line options
//!
//! Flags take the `--flag value` form; boolean flags stand alone.

use std::fmt;

use peer_relay::LobbyInitMode;

/// Default JSON-RPC port
pub const DEFAULT_RPC_PORT: u16 = 7236;

/// Default number of latency probes per server
pub const DEFAULT_PING_COUNT: u32 = 1;

/// Default acceptable server round trip in milliseconds
pub const DEFAULT_ACCEPTABLE_LATENCY: f64 = 250.0;

pub const USAGE: &str = "\
Usage: ice-adapter --id <ID> --game-id <ID> --login <LOGIN> [options]

An ICE (RFC 5245) based network bridge between the client and the game

Options:
  --id <ID>                    ID of the local player
  --game-id <ID>               ID of the game
  --login <LOGIN>              login of the local player
  --rpc-port <PORT>            port of the JSON-RPC server [default: 7236]
  --gpgnet-port <PORT>         port of the GPGNet server, 0 for any [default: 0]
  --lobby-port <PORT>          UDP port the game lobby receives peer traffic on, 0 for any [default: 0]
  --force-relay                offer relayed candidates only
  --ping-count <N>             latency probes per ICE server, 0 to disable [default: 1]
  --acceptable-latency <MS>    preferred ICE server round trip [default: 250.0]
  --lobby-init-mode <MODE>     'normal' or 'auto' (matchmaker) [default: normal]
  --help                       print this help
";

/// Resolved adapter options
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterOptions {
    pub id: i32,
    pub game_id: i32,
    pub login: String,
    pub rpc_port: u16,
    pub gpgnet_port: u16,
    pub lobby_port: u16,
    pub force_relay: bool,
    pub ping_count: u32,
    pub acceptable_latency: f64,
    pub lobby_init_mode: LobbyInitMode,
}

/// Why the command line could not be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    /// `--help` was given
    HelpRequested,
    /// A required flag is absent
    Missing(&'static str),
    /// A flag value could not be parsed
    Invalid { flag: &'static str, value: String },
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionsError::HelpRequested => write!(f, "help requested"),
            OptionsError::Missing(flag) => write!(f, "missing required option {}", flag),
            OptionsError::Invalid { flag, value } => {
                write!(f, "invalid value '{}' for {}", value, flag)
            }
        }
    }
}

impl std::error::Error for OptionsError {}

impl AdapterOptions {
    /// Parse `args` (program name first)
    pub fn parse(args: &[String]) -> Result<Self, OptionsError> {
        if has_flag(args, "--help") {
            return Err(OptionsError::HelpRequested);
        }

        let lobby_init_mode = match parse_arg(args, "--lobby-init-mode") {
            Some(name) => LobbyInitMode::from_name(&name).ok_or(OptionsError::Invalid {
                flag: "--lobby-init-mode",
                value: name,
            })?,
            None => LobbyInitMode::Normal,
        };

        Ok(AdapterOptions {
            id: required(args, "--id")?,
            game_id: required(args, "--game-id")?,
            login: parse_arg(args, "--login").ok_or(OptionsError::Missing("--login"))?,
            rpc_port: optional(args, "--rpc-port", DEFAULT_RPC_PORT)?,
            gpgnet_port: optional(args, "--gpgnet-port", 0)?,
            lobby_port: optional(args, "--lobby-port", 0)?,
            force_relay: has_flag(args, "--force-relay"),
            ping_count: optional(args, "--ping-count", DEFAULT_PING_COUNT)?,
            acceptable_latency: optional(
                args,
                "--acceptable-latency",
                DEFAULT_ACCEPTABLE_LATENCY,
            )?,
            lobby_init_mode,
        })
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn required<T: std::str::FromStr>(args: &[String], flag: &'static str) -> Result<T, OptionsError> {
    let value = parse_arg(args, flag).ok_or(OptionsError::Missing(flag))?;
    value
        .parse()
        .map_err(|_| OptionsError::Invalid { flag, value })
}

fn optional<T: std::str::FromStr>(
    args: &[String],
    flag: &'static str,
    default: T,
) -> Result<T, OptionsError> {
    match parse_arg(args, flag) {
        Some(value) => value
            .parse()
            .map_err(|_| OptionsError::Invalid { flag, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        std::iter::once("ice-adapter")
            .chain(line.split_whitespace())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_defaults() {
        let options = AdapterOptions::parse(&args("--id 5 --game-id 77 --login alice")).unwrap();

        assert_eq!(options.id, 5);
        assert_eq!(options.game_id, 77);
        assert_eq!(options.login, "alice");
        assert_eq!(options.rpc_port, DEFAULT_RPC_PORT);
        assert_eq!(options.gpgnet_port, 0);
        assert_eq!(options.lobby_port, 0);
        assert!(!options.force_relay);
        assert_eq!(options.ping_count, 1);
        assert_eq!(options.acceptable_latency, 250.0);
        assert_eq!(options.lobby_init_mode, LobbyInitMode::Normal);
    }

    #[test]
    fn test_parse_everything() {
        let options = AdapterOptions::parse(&args(
            "--id 1 --game-id 2 --login bob --rpc-port 9000 --gpgnet-port 9001 \
             --lobby-port 9002 --force-relay --ping-count 0 --acceptable-latency 80.5 \
             --lobby-init-mode auto",
        ))
        .unwrap();

        assert_eq!(options.rpc_port, 9000);
        assert_eq!(options.gpgnet_port, 9001);
        assert_eq!(options.lobby_port, 9002);
        assert!(options.force_relay);
        assert_eq!(options.ping_count, 0);
        assert_eq!(options.acceptable_latency, 80.5);
        assert_eq!(options.lobby_init_mode, LobbyInitMode::Auto);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            AdapterOptions::parse(&args("--game-id 2 --login bob")),
            Err(OptionsError::Missing("--id"))
        );
        assert_eq!(
            AdapterOptions::parse(&args("--id x --game-id 2 --login bob")),
            Err(OptionsError::Invalid {
                flag: "--id",
                value: "x".to_string()
            })
        );
        assert!(matches!(
            AdapterOptions::parse(&args("--id 1 --game-id 2 --login bob --lobby-init-mode ladder")),
            Err(OptionsError::Invalid { flag: "--lobby-init-mode", .. })
        ));
        assert_eq!(
            AdapterOptions::parse(&args("--help")),
            Err(OptionsError::HelpRequested)
        );
    }
}
