//! Round trip estimates for ICE servers
//!
//! Each probe is a STUN binding request to the server's default port; the
//! estimate is the mean over the probes that were answered.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use peer_relay::ice::server::DEFAULT_SERVER_PORT;
use peer_relay::ice::stun;
use peer_relay::LatencyOracle;

/// How long to wait for each probe's answer
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Measures round trips with STUN binding requests
#[derive(Debug, Clone)]
pub struct StunLatencyOracle {
    port: u16,
    timeout: Duration,
}

impl StunLatencyOracle {
    pub fn new() -> Self {
        Self {
            port: DEFAULT_SERVER_PORT,
            timeout: PROBE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_port(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    fn probe(&self, socket: &UdpSocket, server: SocketAddr) -> io::Result<Option<Duration>> {
        let txn = stun::generate_transaction_id();
        let start = Instant::now();
        socket.send_to(&stun::build_binding_request(&txn), server)?;

        let mut buf = [0u8; 512];
        loop {
            let remaining = match self.timeout.checked_sub(start.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return Ok(None),
            };
            socket.set_read_timeout(Some(remaining))?;

            match socket.recv_from(&mut buf) {
                Ok((len, from)) if from == server => {
                    if stun::parse_binding_response(&buf[..len], &txn).is_some() {
                        return Ok(Some(start.elapsed()));
                    }
                }
                Ok(_) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for StunLatencyOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyOracle for StunLatencyOracle {
    fn round_trip_time(&self, host: &str, count: u32) -> Option<f64> {
        let server = match (host, self.port).to_socket_addrs() {
            Ok(mut addrs) => addrs.find(SocketAddr::is_ipv4)?,
            Err(e) => {
                log::warn!("Could not resolve {}: {}", host, e);
                return None;
            }
        };

        let socket = match UdpSocket::bind("0.0.0.0:0") {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!("Could not bind latency probe socket: {}", e);
                return None;
            }
        };

        let mut samples = Vec::new();
        for _ in 0..count {
            match self.probe(&socket, server) {
                Ok(Some(rtt)) => samples.push(rtt.as_secs_f64() * 1000.0),
                Ok(None) => log::debug!("Latency probe to {} timed out", host),
                Err(e) => {
                    log::debug!("Latency probe to {} failed: {}", host, e);
                    break;
                }
            }
        }

        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}
