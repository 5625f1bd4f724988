//! Minimal STUN binding (RFC 5389) for server-reflexive discovery
//!
//! Only what harvesting needs: build a Binding Request and pull the mapped
//! address out of a Binding Success Response.
//!
//! # Message Layout
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────┬─────────────────────┐
//! │ Type (2B)    │ Length (2B)  │ Magic cookie (4B)│ Transaction ID (12B)│
//! └──────────────┴──────────────┴──────────────────┴─────────────────────┘
//! followed by TLV attributes padded to 4 bytes
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ring::rand::{SecureRandom, SystemRandom};

// ============================================================================
// Constants
// ============================================================================

/// Fixed STUN header length
pub const HEADER_LEN: usize = 20;

/// RFC 5389 magic cookie
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Transaction ID length
pub const TRANSACTION_ID_LEN: usize = 12;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

// ============================================================================
// Encoding
// ============================================================================

/// Generate a random transaction ID using CSPRNG
pub fn generate_transaction_id() -> [u8; TRANSACTION_ID_LEN] {
    let mut id = [0u8; TRANSACTION_ID_LEN];
    if SystemRandom::new().fill(&mut id).is_err() {
        // Fall back to time-derived bytes
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        id[0..8].copy_from_slice(&nanos.to_le_bytes());
        id[8..12].copy_from_slice(&std::process::id().to_le_bytes());
    }
    id
}

/// Build a Binding Request without attributes
pub fn build_binding_request(transaction_id: &[u8; TRANSACTION_ID_LEN]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    buf
}

/// Build a Binding Success Response carrying XOR-MAPPED-ADDRESS
pub fn build_binding_response(
    transaction_id: &[u8; TRANSACTION_ID_LEN],
    mapped: SocketAddr,
) -> Vec<u8> {
    let mut value = Vec::with_capacity(20);
    value.push(0);
    let port = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match mapped.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_IPV4);
            value.extend_from_slice(&port.to_be_bytes());
            let xored = u32::from(ip) ^ MAGIC_COOKIE;
            value.extend_from_slice(&xored.to_be_bytes());
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_IPV6);
            value.extend_from_slice(&port.to_be_bytes());
            let mask = xor_mask(transaction_id);
            for (b, m) in ip.octets().iter().zip(mask.iter()) {
                value.push(b ^ m);
            }
        }
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + 4 + value.len());
    buf.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    buf.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    buf.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(&value);
    buf
}

// ============================================================================
// Decoding
// ============================================================================

/// Whether `data` looks like a STUN message (RFC 5389 Section 6)
pub fn is_stun_message(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

/// Parse a Binding Success Response for `transaction_id`
///
/// Returns the mapped address, preferring XOR-MAPPED-ADDRESS. `None` if the
/// message is not a matching success response.
pub fn parse_binding_response(
    data: &[u8],
    transaction_id: &[u8; TRANSACTION_ID_LEN],
) -> Option<SocketAddr> {
    if !is_stun_message(data) {
        return None;
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_SUCCESS {
        return None;
    }
    if &data[8..HEADER_LEN] != transaction_id {
        return None;
    }

    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = (HEADER_LEN + length).min(data.len());

    let mut mapped = None;
    let mut offset = HEADER_LEN;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > end {
            return mapped;
        }
        let value = &data[value_start..value_end];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_address(value, Some(transaction_id)) {
                    return Some(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => {
                mapped = parse_address(value, None).or(mapped);
            }
            _ => {}
        }

        // Attributes are padded to a multiple of 4 bytes
        offset = value_start + (attr_len + 3) / 4 * 4;
    }

    mapped
}

fn parse_address(value: &[u8], xor_with: Option<&[u8; TRANSACTION_ID_LEN]>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor_with.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    match family {
        FAMILY_IPV4 if value.len() >= 8 => {
            let mut raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            if xor_with.is_some() {
                raw ^= MAGIC_COOKIE;
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(raw)), port))
        }
        FAMILY_IPV6 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(txn) = xor_with {
                let mask = xor_mask(txn);
                for (b, m) in octets.iter_mut().zip(mask.iter()) {
                    *b ^= m;
                }
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn xor_mask(transaction_id: &[u8; TRANSACTION_ID_LEN]) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..16].copy_from_slice(transaction_id);
    mask
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_request_layout() {
        let txn = [7u8; TRANSACTION_ID_LEN];
        let req = build_binding_request(&txn);

        assert_eq!(req.len(), HEADER_LEN);
        assert_eq!(&req[0..2], &[0x00, 0x01]);
        assert_eq!(&req[2..4], &[0x00, 0x00]);
        assert_eq!(&req[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&req[8..20], &txn);
        assert!(is_stun_message(&req));
    }

    #[test]
    fn test_parse_xor_mapped_ipv4() {
        let txn = generate_transaction_id();
        let mapped: SocketAddr = "203.0.113.50:54321".parse().unwrap();
        let resp = build_binding_response(&txn, mapped);

        assert_eq!(parse_binding_response(&resp, &txn), Some(mapped));
    }

    #[test]
    fn test_parse_xor_mapped_ipv6() {
        let txn = generate_transaction_id();
        let mapped: SocketAddr = "[2001:db8::1]:3478".parse().unwrap();
        let resp = build_binding_response(&txn, mapped);

        assert_eq!(parse_binding_response(&resp, &txn), Some(mapped));
    }

    #[test]
    fn test_parse_rfc5769_sample_mapped_address() {
        // Plain MAPPED-ADDRESS 192.0.2.1:32853
        let txn = [0xAAu8; TRANSACTION_ID_LEN];
        let mut resp = vec![0x01, 0x01, 0x00, 0x0C, 0x21, 0x12, 0xA4, 0x42];
        resp.extend_from_slice(&txn);
        resp.extend_from_slice(&[0x00, 0x01, 0x00, 0x08, 0x00, 0x01, 0x80, 0x55, 192, 0, 2, 1]);

        assert_eq!(
            parse_binding_response(&resp, &txn),
            Some("192.0.2.1:32853".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_rejects_wrong_transaction() {
        let txn = [1u8; TRANSACTION_ID_LEN];
        let other = [2u8; TRANSACTION_ID_LEN];
        let resp = build_binding_response(&txn, "203.0.113.50:1000".parse().unwrap());

        assert_eq!(parse_binding_response(&resp, &other), None);
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let txn = [1u8; TRANSACTION_ID_LEN];
        let resp = build_binding_response(&txn, "203.0.113.50:1000".parse().unwrap());

        assert_eq!(parse_binding_response(&resp[..10], &txn), None);
        assert_eq!(parse_binding_response(&resp[..HEADER_LEN + 6], &txn), None);
    }

    #[test]
    fn test_is_stun_message_rejects_game_data() {
        assert!(!is_stun_message(b"dhello world, this is game data"));
        assert!(!is_stun_message(&[0u8; 4]));
    }
}
