//! Legacy Address Formatting
//!
//! Clients only understand IPv4. Status strings carry the peer address as a
//! signed 32-bit integer of the dotted quad read big-endian, and matchmaking
//! replies carry it as upper-case hex.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

/// Address conversion errors. Always recoverable per request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Peer is reachable only over IPv6.
    #[error("peer address {0} has no IPv4 form")]
    NotIpv4(IpAddr),
}

/// IPv4 form of a peer address, unwrapping v4-mapped IPv6.
pub fn peer_ipv4(addr: &SocketAddr) -> Result<Ipv4Addr, AddressError> {
    match addr.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped().ok_or(AddressError::NotIpv4(addr.ip())),
    }
}

/// `1.2.3.4` -> `16909060`; addresses above `127.255.255.255` come out negative.
pub fn legacy_signed_ip(addr: &SocketAddr) -> Result<i32, AddressError> {
    Ok(u32::from(peer_ipv4(addr)?) as i32)
}

/// Observed address split into the textual `publicip` / `publicport` pair.
pub fn observed_ip_port(addr: &SocketAddr) -> (String, String) {
    let ip = match peer_ipv4(addr) {
        Ok(v4) => v4.to_string(),
        Err(_) => addr.ip().to_string(),
    };
    (ip, addr.port().to_string())
}

/// `00` + 8 hex digits of IP + 4 hex digits of port, as appended to challenges.
pub fn hex_ip_port(addr: &SocketAddr) -> Result<String, AddressError> {
    let ip = peer_ipv4(addr)?;
    Ok(format!("00{:08X}{:04X}", u32::from(ip), addr.port()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_signed_ip_positive() {
        assert_eq!(legacy_signed_ip(&sock("1.2.3.4:6500")).unwrap(), 16909060);
    }

    #[test]
    fn test_signed_ip_wraps_negative() {
        assert_eq!(legacy_signed_ip(&sock("192.168.1.1:80")).unwrap(), -1062731519);
        assert_eq!(legacy_signed_ip(&sock("255.255.255.255:1")).unwrap(), -1);
    }

    #[test]
    fn test_mapped_ipv6_is_accepted() {
        assert_eq!(legacy_signed_ip(&sock("[::ffff:1.2.3.4]:6500")).unwrap(), 16909060);
    }

    #[test]
    fn test_pure_ipv6_is_an_error_not_a_panic() {
        let result = legacy_signed_ip(&sock("[2001:db8::1]:6500"));
        assert!(matches!(result, Err(AddressError::NotIpv4(_))));
    }

    #[test]
    fn test_hex_ip_port() {
        assert_eq!(hex_ip_port(&sock("1.2.3.4:6500")).unwrap(), "00010203041964");
    }

    #[test]
    fn test_observed_ip_port() {
        let (ip, port) = observed_ip_port(&sock("1.2.3.4:6500"));
        assert_eq!(ip, "1.2.3.4");
        assert_eq!(port, "6500");
    }
}
