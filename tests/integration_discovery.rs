//! Drives the discovery engine directly over loopback UDP: a hand-built
//! `ANNOUNCE` packet from a simulated remote peer must surface through
//! `on_discovered` and appear in `get_peers()`, and a `GOODBYE` for that same
//! peer must remove it again.
//!
//! Real LAN broadcast delivery isn't exercised here — sandboxed CI hosts
//! often have only a loopback interface, where limited broadcast to
//! 255.255.255.255 is not guaranteed to reach other local sockets. Unicast
//! UDP to the context's own discovery port exercises the same decode/dedup/
//! dispatch path ([`peertalk::context::Context`]'s `handle_discovery_datagram`)
//! without depending on that.

use std::cell::RefCell;
use std::net::{TcpListener, UdpSocket};
use std::time::{Duration, Instant};

use peertalk::codec::{DiscoveryPacket, DiscoveryType};
use peertalk::{Callbacks, Config, Context};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

thread_local! {
    static DISCOVERED: RefCell<Vec<(u16, String)>> = RefCell::new(Vec::new());
}

#[test]
fn announce_is_discovered_and_goodbye_removes_it() {
    let discovery_port = free_port();
    let config = Config {
        local_name: "listener".to_string(),
        tcp_port: free_port(),
        udp_port: free_port(),
        discovery_port,
        ..Config::default()
    }
    .validated()
    .unwrap();
    let mut ctx = Context::init(config).unwrap();

    DISCOVERED.with(|cell| cell.borrow_mut().clear());
    ctx.set_callbacks(Callbacks {
        on_discovered: Some(Box::new(|id, name| {
            DISCOVERED.with(|cell| cell.borrow_mut().push((id.0, name.to_string())));
        })),
        ..Callbacks::default()
    })
    .unwrap();
    ctx.start_discovery().unwrap();

    let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
    let remote_tcp_port = free_port();
    let announce = DiscoveryPacket::new(DiscoveryType::Announce, remote_tcp_port, 0, "remote-peer");
    let bytes = announce.encode().unwrap();
    remote
        .send_to(&bytes, ("127.0.0.1", discovery_port))
        .unwrap();

    let start = Instant::now();
    loop {
        ctx.poll(Duration::from_millis(10)).unwrap();
        if DISCOVERED.with(|cell| !cell.borrow().is_empty()) {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "announce was never observed");
    }

    DISCOVERED.with(|cell| {
        assert_eq!(cell.borrow()[0].1, "remote-peer");
    });
    assert_eq!(ctx.get_peers().len(), 1);

    let goodbye = DiscoveryPacket::new(DiscoveryType::Goodbye, remote_tcp_port, 0, "remote-peer");
    let bytes = goodbye.encode().unwrap();
    remote
        .send_to(&bytes, ("127.0.0.1", discovery_port))
        .unwrap();

    let start = Instant::now();
    loop {
        ctx.poll(Duration::from_millis(10)).unwrap();
        if ctx.get_peers().is_empty() {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "goodbye never removed the peer");
    }
}
