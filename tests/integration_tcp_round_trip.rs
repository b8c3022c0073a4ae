//! Two real `Context`s talking over loopback TCP: explicit connect, a single
//! small message, and a large message that must be transparently
//! fragmented and reassembled on the other side.

use std::cell::RefCell;
use std::net::{SocketAddr, TcpListener};
use std::time::{Duration, Instant};

use peertalk::queue::Priority;
use peertalk::{Callbacks, Config, Context, PeerState};

/// Grab an ephemeral port by briefly binding to it, then releasing it. Racy
/// in theory, fine for a test suite that doesn't run under hostile
/// concurrent port scanners.
fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn context_on(name: &str, tcp_port: u16) -> Context {
    context_with_max_message(name, tcp_port, peertalk::config::DEFAULT_MAX_MESSAGE_SIZE)
}

fn context_with_max_message(name: &str, tcp_port: u16, max_message_size: usize) -> Context {
    let config = Config {
        local_name: name.to_string(),
        tcp_port,
        udp_port: free_port(),
        discovery_port: free_port(),
        max_message_size,
        ..Config::default()
    }
    .validated()
    .unwrap();
    Context::init(config).unwrap()
}

thread_local! {
    static RECEIVED: RefCell<Vec<u8>> = RefCell::new(Vec::new());
}

fn recording_callbacks() -> Callbacks {
    RECEIVED.with(|cell| cell.borrow_mut().clear());
    Callbacks {
        on_message_received: Some(Box::new(|_id, data| {
            RECEIVED.with(|cell| cell.borrow_mut().extend_from_slice(data));
        })),
        ..Callbacks::default()
    }
}

#[test]
fn explicit_connect_and_single_message_round_trip() {
    let server_port = free_port();
    let mut server = context_on("server", server_port);
    server.set_callbacks(recording_callbacks()).unwrap();
    server.start_listening().unwrap();

    let mut client = context_on("client", free_port());
    client.start_listening().unwrap();

    let server_addr: SocketAddr = format!("127.0.0.1:{server_port}").parse().unwrap();
    let client_peer = client.connect(server_addr, "client").unwrap();

    let start = Instant::now();
    loop {
        client.poll(Duration::from_millis(10)).unwrap();
        server.poll(Duration::from_millis(10)).unwrap();
        if client.get_peer_by_id(client_peer).map(|p| p.state).ok() == Some(PeerState::Connected) {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "peers never connected");
    }

    client.send(client_peer, b"hello from client").unwrap();

    let start = Instant::now();
    loop {
        client.poll(Duration::from_millis(10)).unwrap();
        server.poll(Duration::from_millis(10)).unwrap();
        if RECEIVED.with(|cell| !cell.borrow().is_empty()) {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "message never arrived");
    }

    RECEIVED.with(|cell| {
        assert_eq!(cell.borrow().as_slice(), b"hello from client");
    });
}

#[test]
fn oversized_message_is_fragmented_and_reassembled() {
    // Mirrors spec scenario 5: a receiver with a smaller configured
    // `max_message_size` negotiates `effective_max_msg = 512` on the
    // sender's side, so a 2000-byte send (well under the sender's own
    // 8192-byte ceiling, but over the negotiated limit) must be fragmented.
    let server_port = free_port();
    let mut server = context_with_max_message("server-frag", server_port, 512);
    server.set_callbacks(recording_callbacks()).unwrap();
    server.start_listening().unwrap();

    let mut client = context_on("client-frag", free_port());
    client.start_listening().unwrap();

    let server_addr: SocketAddr = format!("127.0.0.1:{server_port}").parse().unwrap();
    let client_peer = client.connect(server_addr, "client-frag").unwrap();

    let start = Instant::now();
    loop {
        client.poll(Duration::from_millis(10)).unwrap();
        server.poll(Duration::from_millis(10)).unwrap();
        if client.get_peer_by_id(client_peer).map(|p| p.state).ok() == Some(PeerState::Connected) {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "peers never connected");
    }

    assert_eq!(client.get_peer_max_message(client_peer).unwrap(), 512);

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
    client
        .send_ex(client_peer, &payload, Priority::Normal, None)
        .unwrap();

    let start = Instant::now();
    loop {
        client.poll(Duration::from_millis(10)).unwrap();
        server.poll(Duration::from_millis(10)).unwrap();
        if RECEIVED.with(|cell| cell.borrow().len() >= payload.len()) {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(10), "fragmented message never fully arrived");
    }

    RECEIVED.with(|cell| {
        assert_eq!(cell.borrow().as_slice(), payload.as_slice());
    });
}
