//! Local interface enumeration and UDP binding helpers

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::ops::RangeInclusive;

use ring::rand::{SecureRandom, SystemRandom};

/// Enumerate local IPv4 addresses with the given port
///
/// Loopback addresses are only included when asked for.
#[cfg(unix)]
pub fn enumerate_local_addresses(port: u16, include_loopback: bool) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return addrs;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            // Only process AF_INET (IPv4) for now
            if !ifa.ifa_addr.is_null() {
                let family = (*ifa.ifa_addr).sa_family as i32;
                if family == libc::AF_INET {
                    let sockaddr_in = ifa.ifa_addr as *const libc::sockaddr_in;
                    let ip_bytes = (*sockaddr_in).sin_addr.s_addr.to_ne_bytes();
                    let ip = Ipv4Addr::new(ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]);

                    if include_loopback || !ip.is_loopback() {
                        let addr = SocketAddr::new(IpAddr::V4(ip), port);
                        if !addrs.contains(&addr) {
                            addrs.push(addr);
                        }
                    }
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    addrs
}

#[cfg(not(unix))]
pub fn enumerate_local_addresses(port: u16, include_loopback: bool) -> Vec<SocketAddr> {
    if include_loopback {
        vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)]
    } else {
        Vec::new()
    }
}

/// Bind a UDP socket on `ip` inside `range`, starting at a random port
///
/// Walks the range once (wrapping) and falls back to an OS-assigned port when
/// every port in the range is taken.
pub fn bind_udp_in_range(ip: IpAddr, range: &RangeInclusive<u16>) -> io::Result<UdpSocket> {
    let start = *range.start();
    let end = *range.end();

    if start <= end && start != 0 {
        let span = u32::from(end - start) + 1;
        let offset = random_u32() % span;

        for step in 0..span {
            let port = start as u32 + (offset + step) % span;
            match UdpSocket::bind(SocketAddr::new(ip, port as u16)) {
                Ok(socket) => return Ok(socket),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e),
            }
        }

        log::warn!(
            "No free UDP port in {}-{}, falling back to an ephemeral port",
            start,
            end
        );
    }

    UdpSocket::bind(SocketAddr::new(ip, 0))
}

/// Bind a UDP socket on loopback, on `preferred_port` when nonzero
pub fn bind_loopback_udp(preferred_port: u16) -> io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), preferred_port))
}

/// Random value from the system CSPRNG (zero if the RNG is unavailable)
pub fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    match SystemRandom::new().fill(&mut buf) {
        Ok(()) => u32::from_ne_bytes(buf),
        Err(_) => 0,
    }
}

// ============================================================================
// Tests
// ============================================================================
