//! # Discovery Engine
//!
//! The pure decision logic behind spec.md §4.7: recognizing our own
//! broadcast traffic so we don't "discover" ourselves, and deciding when a
//! `DISCOVERED` peer has gone stale. [`crate::context::Context`] owns the
//! socket I/O and the peer table; this module stays free of both so the
//! dedup/aging rules can be unit tested without a network.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::codec::DiscoveryPacket;

/// Whether an incoming `ANNOUNCE`/`QUERY` is traffic we sent ourselves.
///
/// spec.md §4.7: "Reject if the packet's name equals our local name AND the
/// sender's port equals our TCP port AND the source address equals any
/// local address."
pub fn is_own_traffic(
    packet: &DiscoveryPacket,
    local_name: &str,
    local_tcp_port: u16,
    source: SocketAddr,
    local_addrs: &[IpAddr],
) -> bool {
    packet.name == local_name
        && packet.tcp_port == local_tcp_port
        && local_addrs.contains(&source.ip())
}

/// Whether a `DISCOVERED` peer last seen at `last_seen_ticks` has exceeded
/// `timeout_ms` as of `now_ticks` (both millisecond tick counters, per
/// [`crate::compat::TickClock`]). Saturating so a tick counter wraparound
/// never reads as "ancient".
pub fn is_stale(last_seen_ticks: u32, now_ticks: u32, timeout_ms: u32) -> bool {
    now_ticks.saturating_sub(last_seen_ticks) > timeout_ms
}

/// Whether the periodic `ANNOUNCE` broadcast is due.
pub fn announce_due(last_broadcast_ticks: u32, now_ticks: u32, interval_ms: u32) -> bool {
    now_ticks.saturating_sub(last_broadcast_ticks) >= interval_ms
}

/// Best-effort discovery of this host's outbound LAN address(es), used to
/// populate the "local address" set [`is_own_traffic`] compares against.
///
/// Uses the standard connect-a-UDP-socket-and-read-`local_addr` trick (no
/// packets actually leave the host for UDP `connect`); falls back to
/// loopback-only if the host has no route to the chosen rendezvous address
/// (e.g. a sandboxed or offline CI box).
pub fn discover_local_addrs() -> Vec<IpAddr> {
    let mut addrs = vec![
        IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
    ];
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                addrs.push(addr.ip());
            }
        }
    }
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DiscoveryType;

    #[test]
    fn recognizes_own_traffic() {
        let packet = DiscoveryPacket::new(DiscoveryType::Announce, 17391, 0, "Alpha");
        let local_addrs = [IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)];
        let src: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(is_own_traffic(&packet, "Alpha", 17391, src, &local_addrs));
    }

    #[test]
    fn different_name_is_not_own_traffic() {
        let packet = DiscoveryPacket::new(DiscoveryType::Announce, 17391, 0, "Beta");
        let local_addrs = [IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)];
        let src: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(!is_own_traffic(&packet, "Alpha", 17391, src, &local_addrs));
    }

    #[test]
    fn different_port_is_not_own_traffic() {
        let packet = DiscoveryPacket::new(DiscoveryType::Announce, 17392, 0, "Alpha");
        let local_addrs = [IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)];
        let src: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(!is_own_traffic(&packet, "Alpha", 17391, src, &local_addrs));
    }

    #[test]
    fn staleness_respects_timeout() {
        assert!(!is_stale(1_000, 20_000, 30_000));
        assert!(is_stale(1_000, 40_000, 30_000));
    }

    #[test]
    fn announce_due_respects_interval() {
        assert!(!announce_due(1_000, 1_500, 1_000));
        assert!(announce_due(1_000, 2_000, 1_000));
    }
}
