//! # Context — the Public API and the Poll Loop
//!
//! [`Context`] is the single-threaded, cooperative owner of one participant's
//! state (spec.md §3/§5): the peer table, the transport, discovery timing,
//! registered callbacks, and running statistics. Every mutating method is
//! fallible and every callback fires synchronously from inside [`Context::poll`]
//! / [`Context::poll_fast`] — nothing here spawns a thread, blocks, or
//! re-enters `poll`.
//!
//! This module is the "hardest engineering" spec.md §1 calls out: it wires
//! the send engine (§4.5), receive engine (§4.6), discovery engine (§4.7),
//! capability/flow control (§4.8) and the poll loop (§4.9) together over the
//! leaf data structures in [`crate::queue`], [`crate::direct_buffer`],
//! [`crate::peer`] and [`crate::fragment`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::callbacks::Callbacks;
use crate::codec::{
    CapabilityPayload, DiscoveryPacket, DiscoveryType, FrameHeader, FrameType, PressurePayload,
    UdpDatagram, MESSAGE_HEADER_LEN,
};
use crate::compat::PeerFlag;
use crate::config::{Config, FragmentationMode, DEFAULT_QUEUE_CAPACITY};
use crate::direct_buffer::DirectBufferState;
use crate::discovery;
use crate::error::{Error, Result};
use crate::flow;
use crate::fragment;
use crate::peer::{Capabilities, PeerId, PeerState, PeerTable};
use crate::queue::{Priority, SLOT_PAYLOAD_LEN};
use crate::stats::GlobalStats;
use crate::transport::{ConnectStatus, StdTransport, TcpHandle, Transport};

/// Bit set in the discovery packet's `transports` byte and returned by
/// [`Context::get_available_transports`]: this context can speak TCP.
pub const TRANSPORT_TCP: u8 = 0b01;
/// This context can speak UDP (always true: discovery itself is UDP).
pub const TRANSPORT_UDP: u8 = 0b10;

/// A message that fits in a single Tier 1 slot must leave room for the
/// 10-byte frame header inside the queue's fixed 256-byte slot payload
/// (spec.md §3's "256-byte payload area" describes the slot, not the
/// pre-framing message length) — see `DESIGN.md` for the full writeup of
/// this resolution.
pub const DIRECT_THRESHOLD: usize = SLOT_PAYLOAD_LEN - MESSAGE_HEADER_LEN;

/// Consecutive full-budget writes required before [`crate::flow::adjust_chunk`]
/// doubles a peer's effective chunk size.
const CHUNK_DOUBLE_THRESHOLD: u32 = 4;

/// The crate's stable API version string (spec.md §7: "begins with `1.`"),
/// independent of the Cargo package version.
pub const VERSION: &str = "1.0.0";

/// Which outbound tier a peer's current in-flight write came from, so
/// [`Context::finish_in_flight_send`] knows which bookkeeping to retire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendTier {
    Tier1,
    Tier2,
}

/// A snapshot of one peer's public-facing state, returned by the
/// peer-listing/lookup entry points.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
    pub state: PeerState,
    pub addr: Option<SocketAddr>,
}

/// A snapshot of one peer's outbound/inbound pipeline pressure.
#[derive(Debug, Clone, Copy)]
pub struct QueueStatus {
    pub send_pressure: u8,
    pub recv_pressure: u8,
    pub direct_state: DirectBufferState,
}

const CONTEXT_MAGIC: u32 = 0x5054_4C4B; // "PTLK"

/// The top-level owner of one local participant's state (spec.md §3
/// "Context"). Not `Sync`/`Send` by convention — see `DESIGN.md` — since a
/// context is meant to be driven from a single owning task via [`Context::poll`].
pub struct Context {
    magic: u32,
    config: Config,
    transport: Option<Box<dyn Transport>>,
    peers: PeerTable,
    callbacks: Callbacks,
    stats: GlobalStats,
    discovery_active: bool,
    listening_active: bool,
    local_addrs: Vec<IpAddr>,
    last_discovery_broadcast_ticks: u32,
}

impl Context {
    /// Initialize a context backed by the default [`StdTransport`] (`mio` +
    /// `std::net` + `socket2`). Requires a non-empty `config.local_name`
    /// (spec.md §6 `init`).
    pub fn init(config: Config) -> Result<Self> {
        let transport: Box<dyn Transport> = Box::new(StdTransport::new()?);
        Self::init_with_transport(config, transport)
    }

    /// Initialize a context against a caller-supplied [`Transport`] — the
    /// hook a platform integrator uses to target something other than
    /// `StdTransport` (spec.md §9's "polymorphism over platforms").
    pub fn init_with_transport(config: Config, transport: Box<dyn Transport>) -> Result<Self> {
        let config = config.validated()?;
        let peers = PeerTable::new(
            config.max_peers,
            DEFAULT_QUEUE_CAPACITY,
            config.direct_buffer_size,
            config.reassembly_limit(),
        )?;
        info!(name = %config.local_name, "context initialized");
        Ok(Self {
            magic: CONTEXT_MAGIC,
            config,
            transport: Some(transport),
            peers,
            callbacks: Callbacks::default(),
            stats: GlobalStats::default(),
            discovery_active: false,
            listening_active: false,
            local_addrs: Vec::new(),
            last_discovery_broadcast_ticks: 0,
        })
    }

    fn ensure_active(&self) -> Result<()> {
        if self.magic != CONTEXT_MAGIC || self.transport.is_none() {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    fn transport_mut(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.transport.as_mut().ok_or(Error::NotInitialized)
    }

    fn now_ticks(&self) -> u32 {
        self.transport.as_ref().map(|t| t.now_ticks()).unwrap_or(0)
    }

    /// Tear down every socket and drop all internal state. Idempotent and
    /// safe to call on an already-shut-down context (spec.md §8 "idempotent
    /// shutdown").
    pub fn shutdown(&mut self) -> Result<()> {
        if self.magic != CONTEXT_MAGIC {
            return Ok(());
        }
        if let Some(transport) = self.transport.as_mut() {
            for peer in self.peers.iter_mut() {
                if let Some(handle) = peer.cold.tcp_handle.take() {
                    transport.tcp_close(handle);
                }
            }
        }
        self.transport = None;
        self.magic = 0;
        info!("context shut down");
        Ok(())
    }

    /// Register the callback set for this context (spec.md §6 `set_callbacks`).
    pub fn set_callbacks(&mut self, callbacks: Callbacks) -> Result<()> {
        self.ensure_active()?;
        self.callbacks = callbacks;
        Ok(())
    }

    // ---- Discovery ---------------------------------------------------

    pub fn start_discovery(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.discovery_active {
            return Err(Error::DiscoveryActive);
        }
        let port = self.config.discovery_port;
        self.transport_mut()?.open_discovery_socket(port)?;
        self.local_addrs = discovery::discover_local_addrs();
        let now = self.now_ticks();
        // Back-date the last broadcast so the first `poll()` announces
        // immediately rather than waiting a full interval.
        self.last_discovery_broadcast_ticks = now.wrapping_sub(self.config.discovery_interval_ms);
        self.discovery_active = true;
        info!(port, "discovery started");
        Ok(())
    }

    pub fn stop_discovery(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.discovery_active = false;
        Ok(())
    }

    // ---- Listening -----------------------------------------------------

    pub fn start_listening(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.listening_active {
            return Ok(());
        }
        let port = self.config.tcp_port;
        self.transport_mut()?.tcp_listen(port)?;
        self.listening_active = true;
        info!(port, "listening for inbound connections");
        Ok(())
    }

    pub fn stop_listening(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.listening_active = false;
        Ok(())
    }

    // ---- Connection lifecycle ------------------------------------------

    /// Create (if needed) a peer record for `addr` and begin a non-blocking
    /// TCP connect to it (spec.md §6 `connect`; scenario 2 creates the
    /// record and connects in the same call, the idiomatic-Rust collapse of
    /// the C API's separate create-then-connect steps — see `DESIGN.md`).
    pub fn connect(&mut self, addr: SocketAddr, name: &str) -> Result<PeerId> {
        self.ensure_active()?;
        let id = match self.peers.find_by_address(addr) {
            Some(id) => id,
            None => self.peers.create(name, Some(addr))?,
        };
        self.peers.set_state(id, PeerState::Connecting)?;
        let handle = match self.transport_mut()?.tcp_connect_nonblocking(addr) {
            Ok(h) => h,
            Err(e) => {
                let _ = self.peers.set_state(id, PeerState::Failed);
                return Err(e);
            }
        };
        if let Ok(peer) = self.peers.get_mut(id) {
            peer.cold.tcp_handle = Some(handle);
        }
        Ok(id)
    }

    /// Gracefully disconnect a peer: best-effort `DISCONNECT` frame, close
    /// the socket, and remove the peer record.
    pub fn disconnect(&mut self, id: PeerId) -> Result<()> {
        self.ensure_active()?;
        let (state, handle) = {
            let peer = self.peers.get(id)?;
            (peer.hot.state, peer.cold.tcp_handle)
        };
        if matches!(state, PeerState::Connected | PeerState::Connecting) {
            if let Some(h) = handle {
                let frame = FrameHeader::new(FrameType::Disconnect, 0, 0, 0).encode();
                if let Some(t) = self.transport.as_mut() {
                    let _ = t.tcp_send_nonblocking(h, &frame);
                }
            }
        }
        self.close_peer_socket(id);
        self.peers.destroy(id)
    }

    fn close_peer_socket(&mut self, id: PeerId) {
        let handle = self
            .peers
            .get_mut(id)
            .ok()
            .and_then(|p| p.cold.tcp_handle.take());
        if let (Some(h), Some(t)) = (handle, self.transport.as_mut()) {
            t.tcp_close(h);
        }
    }

    fn fail_peer(&mut self, id: PeerId, err: Error) {
        warn!(?err, peer = id.0, "peer marked failed");
        let _ = self.peers.set_state(id, PeerState::Failed);
        self.close_peer_socket(id);
        self.callbacks.fire_disconnected(id, err);
    }

    // ---- Send engine (spec.md §4.5) ------------------------------------

    pub fn send(&mut self, id: PeerId, data: &[u8]) -> Result<()> {
        self.send_ex(id, data, Priority::Normal, None)
    }

    /// Route `data` by size: Tier 1 queue for small messages, fragmented
    /// Tier 1 frames for oversized messages, or the Tier 2 direct buffer
    /// otherwise (spec.md §4.5).
    pub fn send_ex(
        &mut self,
        id: PeerId,
        data: &[u8],
        priority: Priority,
        coalesce_key: Option<u16>,
    ) -> Result<()> {
        self.ensure_active()?;
        if data.len() > self.config.max_message_size {
            return Err(Error::MessageTooLarge);
        }
        let (state, pressure, effective_max) = {
            let peer = self.peers.get(id)?;
            (
                peer.hot.state,
                peer.cold.caps.buffer_pressure,
                peer.cold.caps.effective_max_msg as usize,
            )
        };
        if state != PeerState::Connected {
            return Err(Error::NotConnected);
        }
        if flow::should_throttle(pressure, priority) {
            return Err(Error::Backpressure);
        }

        if data.len() <= DIRECT_THRESHOLD {
            let header = FrameHeader::new(FrameType::Data, 0, 0, data.len() as u16).encode();
            let mut framed = Vec::with_capacity(header.len() + data.len());
            framed.extend_from_slice(&header);
            framed.extend_from_slice(data);
            let peer = self.peers.get_mut(id)?;
            peer.cold.send_queue.push_coalesce(&framed, priority, coalesce_key)?;
            self.check_pressure_threshold(id);
            return Ok(());
        }

        let fragmentation_enabled = self.config.enable_fragmentation != FragmentationMode::Off;
        if fragmentation_enabled && data.len() > effective_max {
            self.enqueue_fragments(id, data, priority, effective_max)?;
            self.check_pressure_threshold(id);
            return Ok(());
        }

        let peer = self.peers.get_mut(id)?;
        match peer.cold.send_direct.queue_with(data, priority, 0) {
            Ok(()) => Ok(()),
            Err(Error::Busy) => Err(Error::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Split `data` into `FRAGMENT-START`/`-CONT`/`-END` frames and enqueue
    /// all of them onto Tier 1 in order, or none at all if the queue can't
    /// hold every fragment (spec.md §4.5's bounded-fragmentation rule).
    ///
    /// Each fragment is capped to [`DIRECT_THRESHOLD`] (the Tier 1 slot
    /// capacity), not `effective_max`, so every fragment fits a single
    /// queue slot regardless of how large the negotiated message ceiling
    /// is — see `DESIGN.md` for why the spec's two size constants can't
    /// both be satisfied literally.
    fn enqueue_fragments(
        &mut self,
        id: PeerId,
        data: &[u8],
        priority: Priority,
        effective_max: usize,
    ) -> Result<()> {
        let chunk_size = DIRECT_THRESHOLD.min(effective_max.max(1));
        let chunks = fragment::split_into_fragments(data, chunk_size)?;
        let n = chunks.len();
        let peer = self.peers.get_mut(id)?;
        if peer.cold.send_queue.free_slots() < n {
            return Err(Error::BufferFull);
        }
        for (i, chunk) in chunks.into_iter().enumerate() {
            let frame_type = if i == 0 {
                FrameType::FragmentStart
            } else if i == n - 1 {
                FrameType::FragmentEnd
            } else {
                FrameType::FragmentCont
            };
            let header = FrameHeader::new(frame_type, 0, i as u8, chunk.len() as u16).encode();
            let mut framed = Vec::with_capacity(header.len() + chunk.len());
            framed.extend_from_slice(&header);
            framed.extend_from_slice(chunk);
            peer.cold.send_queue.push(&framed, priority)?;
        }
        Ok(())
    }

    fn check_pressure_threshold(&mut self, id: PeerId) {
        let Ok(peer) = self.peers.get_mut(id) else {
            return;
        };
        let combined = flow::combined_pressure(peer.cold.send_queue.pressure(), peer.cold.recv_queue.pressure());
        if flow::crossed_reporting_threshold(combined, peer.cold.caps.last_reported_pressure) {
            peer.hot.flags.set(PeerFlag::PressureUpdatePending);
        }
    }

    pub fn send_udp(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<usize> {
        self.ensure_active()?;
        let bytes = UdpDatagram::encode(self.config.tcp_port, payload)?;
        self.transport_mut()?.send_udp(addr, &bytes)
    }

    /// Send raw bytes over UDP without the [`UdpDatagram`] framing
    /// envelope, for callers doing their own out-of-band framing.
    pub fn send_udp_fast(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<usize> {
        self.ensure_active()?;
        self.transport_mut()?.send_udp(addr, payload)
    }

    /// Send `data` to every currently connected peer. Returns
    /// [`Error::PeerNotFound`] if none are connected.
    pub fn broadcast(&mut self, data: &[u8], priority: Priority) -> Result<()> {
        self.ensure_active()?;
        let ids: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| p.hot.state == PeerState::Connected)
            .map(|p| p.hot.id)
            .collect();
        if ids.is_empty() {
            return Err(Error::PeerNotFound);
        }
        let mut any_ok = false;
        let mut last_err = None;
        for id in ids {
            match self.send_ex(id, data, priority, None) {
                Ok(()) => any_ok = true,
                Err(e) => {
                    warn!(peer = id.0, ?e, "broadcast send failed for peer");
                    last_err = Some(e);
                }
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(last_err.unwrap_or(Error::PeerNotFound))
        }
    }

    // ---- Streaming (Tier 2) ---------------------------------------------

    /// Stage a large message directly on the Tier 2 buffer, bypassing the
    /// size classifier (for callers that already know they want the
    /// single-slot path). `stream_active`/`stream_cancel` track it.
    pub fn stream_send(&mut self, id: PeerId, data: &[u8], priority: Priority) -> Result<()> {
        self.ensure_active()?;
        let state = self.peers.get(id)?.hot.state;
        if state != PeerState::Connected {
            return Err(Error::NotConnected);
        }
        let peer = self.peers.get_mut(id)?;
        peer.cold.stream_cancel_requested = false;
        match peer.cold.send_direct.queue_with(data, priority, 0) {
            Ok(()) => Ok(()),
            Err(Error::Busy) => Err(Error::WouldBlock),
            Err(e) => Err(e),
        }
    }

    pub fn stream_cancel(&mut self, id: PeerId) -> Result<()> {
        self.ensure_active()?;
        let peer = self.peers.get_mut(id)?;
        if peer.cold.send_direct.is_idle() {
            return Ok(());
        }
        peer.cold.stream_cancel_requested = true;
        Ok(())
    }

    pub fn stream_active(&self, id: PeerId) -> bool {
        self.peers
            .get(id)
            .map(|p| !p.cold.send_direct.is_idle())
            .unwrap_or(false)
    }

    // ---- Poll loop (spec.md §4.9) ---------------------------------------

    /// The single entry point that advances all I/O: drains discovery
    /// datagrams, accepts inbound connections, drives every peer's
    /// connect/read/write progress, and advances the discovery timer.
    pub fn poll(&mut self, timeout: Duration) -> Result<()> {
        self.ensure_active()?;
        self.transport_mut()?.wait_ready(timeout)?;
        self.drain_discovery();
        self.accept_inbound();
        self.drive_peers();
        self.advance_discovery_timer();
        self.age_out_stale_peers();
        Ok(())
    }

    /// Drive per-peer connect/read/write progress without the socket-level
    /// `select` (spec.md §4.9's "for tight inner loops when the host does
    /// its own readiness detection").
    pub fn poll_fast(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.drive_peers();
        Ok(())
    }

    fn drain_discovery(&mut self) {
        if !self.discovery_active {
            return;
        }
        let mut buf = [0u8; 2048];
        loop {
            let received = match self.transport.as_mut() {
                Some(t) => t.recv_udp_nonblocking(&mut buf),
                None => return,
            };
            match received {
                Ok(Some((n, src))) => self.handle_discovery_datagram(&buf[..n], src),
                Ok(None) => break,
                Err(e) => {
                    warn!(?e, "discovery socket read error");
                    break;
                }
            }
        }
    }

    fn handle_discovery_datagram(&mut self, data: &[u8], src: SocketAddr) {
        let packet = match DiscoveryPacket::decode(data) {
            Ok(p) => p,
            Err(e) => {
                warn!(?e, %src, "dropping malformed discovery packet");
                return;
            }
        };
        if discovery::is_own_traffic(&packet, &self.config.local_name, self.config.tcp_port, src, &self.local_addrs) {
            return;
        }
        match packet.packet_type {
            DiscoveryType::Announce => self.handle_announce(&packet, src),
            DiscoveryType::Query => self.handle_query(&packet, src),
            DiscoveryType::Goodbye => self.handle_goodbye(&packet, src),
        }
    }

    fn handle_announce(&mut self, packet: &DiscoveryPacket, src: SocketAddr) {
        let addr = SocketAddr::new(src.ip(), packet.tcp_port);
        let now = self.now_ticks();
        if let Some(id) = self.peers.find_by_address(addr) {
            if let Ok(peer) = self.peers.get_mut(id) {
                peer.hot.last_seen_ticks = now;
            }
            return;
        }
        match self.peers.create(&packet.name, Some(addr)) {
            Ok(id) => {
                if let Ok(peer) = self.peers.get_mut(id) {
                    peer.hot.last_seen_ticks = now;
                }
                self.stats.peers_discovered += 1;
                debug!(peer = id.0, name = %packet.name, "peer discovered");
                self.callbacks.fire_discovered(id, &packet.name);
            }
            Err(e) => warn!(?e, %addr, "peer table full, dropping discovered peer"),
        }
    }

    fn handle_query(&mut self, _packet: &DiscoveryPacket, src: SocketAddr) {
        let reply = DiscoveryPacket::new(
            DiscoveryType::Announce,
            self.config.tcp_port,
            self.available_transports(),
            &self.config.local_name,
        );
        let Ok(bytes) = reply.encode() else { return };
        if let Some(t) = self.transport.as_mut() {
            let _ = t.send_udp(src, &bytes);
        }
    }

    fn handle_goodbye(&mut self, packet: &DiscoveryPacket, src: SocketAddr) {
        let addr = SocketAddr::new(src.ip(), packet.tcp_port);
        if let Some(id) = self.peers.find_by_address(addr) {
            let _ = self.peers.destroy(id);
            self.stats.peers_lost += 1;
            self.callbacks.fire_lost(id);
        }
    }

    fn accept_inbound(&mut self) {
        if !self.listening_active {
            return;
        }
        loop {
            let accepted = match self.transport.as_mut() {
                Some(t) => t.tcp_accept_nonblocking(),
                None => return,
            };
            match accepted {
                Ok(Some((handle, addr))) => self.handle_inbound_connection(handle, addr),
                Ok(None) => break,
                Err(e) => {
                    warn!(?e, "accept error");
                    break;
                }
            }
        }
    }

    fn handle_inbound_connection(&mut self, handle: TcpHandle, addr: SocketAddr) {
        let id = match self.peers.find_by_address(addr) {
            Some(id) => id,
            None => {
                let placeholder_name = format!("peer-{addr}");
                match self.peers.create(&placeholder_name, Some(addr)) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(?e, %addr, "peer table full, rejecting inbound connection");
                        if let Some(t) = self.transport.as_mut() {
                            t.tcp_close(handle);
                        }
                        return;
                    }
                }
            }
        };
        let already_wired = self
            .peers
            .get(id)
            .map(|p| matches!(p.hot.state, PeerState::Connected | PeerState::Connecting))
            .unwrap_or(false);
        if already_wired || self.peers.set_state(id, PeerState::Connecting).is_err() {
            if let Some(t) = self.transport.as_mut() {
                t.tcp_close(handle);
            }
            return;
        }
        if let Ok(peer) = self.peers.get_mut(id) {
            peer.cold.tcp_handle = Some(handle);
        }
        self.send_capability(id, handle);
    }

    fn send_capability(&mut self, id: PeerId, handle: TcpHandle) {
        let payload = CapabilityPayload {
            max_message: self.config.max_message_size as u32,
            preferred_chunk: self.config.default_chunk,
            buffer_pressure: 0,
        }
        .encode();
        let header = FrameHeader::new(FrameType::Capability, 0, 0, payload.len() as u16).encode();
        let mut framed = Vec::with_capacity(header.len() + payload.len());
        framed.extend_from_slice(&header);
        framed.extend_from_slice(&payload);
        if let Some(t) = self.transport.as_mut() {
            // Capability frames are tiny (19 bytes) and sent once, right
            // after a fresh socket's send buffer is empty; a best-effort
            // single write is enough in practice. A dropped capability
            // frame simply leaves the peer in `Connecting` until the next
            // attempt, rather than corrupting state.
            if let Err(e) = t.tcp_send_nonblocking(handle, &framed) {
                let _ = id; // id retained for symmetry/future retry bookkeeping
                debug!(?e, "capability send did not complete immediately");
            }
        }
    }

    fn drive_peers(&mut self) {
        let ids = self.peers.ids();
        for id in ids {
            self.progress_connect(id);
            self.read_peer(id);
            self.write_peer(id);
        }
        #[cfg(debug_assertions)]
        if !self.peers.debug_invariants_hold() {
            tracing::error!("peer table invariants violated");
        }
    }

    fn progress_connect(&mut self, id: PeerId) {
        let Ok(peer) = self.peers.get(id) else { return };
        if peer.hot.state != PeerState::Connecting {
            return;
        }
        let Some(handle) = peer.cold.tcp_handle else { return };
        let already_signaled = peer.hot.flags.test(PeerFlag::ConnectComplete);

        let status = match self.transport.as_mut() {
            Some(t) => t.tcp_connect_status(handle),
            None => return,
        };
        match status {
            Ok(ConnectStatus::Connected) => {
                if !already_signaled {
                    if let Ok(peer) = self.peers.get(id) {
                        peer.hot.flags.set(PeerFlag::ConnectComplete);
                    }
                    self.send_capability(id, handle);
                }
            }
            Ok(ConnectStatus::Pending) => {}
            Err(e) => self.fail_peer(id, e),
        }
    }

    fn read_peer(&mut self, id: PeerId) {
        let Ok(peer) = self.peers.get(id) else { return };
        if !matches!(
            peer.hot.state,
            PeerState::Connecting | PeerState::Connected | PeerState::Disconnecting
        ) {
            return;
        }
        let Some(handle) = peer.cold.tcp_handle else { return };
        let mut buf = [0u8; 4096];
        loop {
            let result = match self.transport.as_mut() {
                Some(t) => t.tcp_recv_nonblocking(handle, &mut buf),
                None => return,
            };
            match result {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(peer) = self.peers.get_mut(id) {
                        peer.cold.recv_cursor.extend_from_slice(&buf[..n]);
                    }
                }
                Err(e) => {
                    self.fail_peer(id, e);
                    return;
                }
            }
        }
        self.process_recv_buffer(id);
    }

    fn process_recv_buffer(&mut self, id: PeerId) {
        loop {
            let header_bytes: [u8; MESSAGE_HEADER_LEN] = {
                let Ok(peer) = self.peers.get(id) else { return };
                if peer.cold.recv_cursor.len() < MESSAGE_HEADER_LEN {
                    return;
                }
                let mut buf = [0u8; MESSAGE_HEADER_LEN];
                buf.copy_from_slice(&peer.cold.recv_cursor[..MESSAGE_HEADER_LEN]);
                buf
            };
            let header = match FrameHeader::decode(&header_bytes) {
                Ok(h) => h,
                Err(e) => {
                    self.fail_peer(id, e);
                    return;
                }
            };
            let total_len = MESSAGE_HEADER_LEN + header.payload_len as usize;
            let payload = {
                let Ok(peer) = self.peers.get_mut(id) else { return };
                if peer.cold.recv_cursor.len() < total_len {
                    return;
                }
                let payload = peer.cold.recv_cursor[MESSAGE_HEADER_LEN..total_len].to_vec();
                peer.cold.recv_cursor.drain(0..total_len);
                payload
            };
            self.dispatch_frame(id, header, payload);
        }
    }

    fn dispatch_frame(&mut self, id: PeerId, header: FrameHeader, payload: Vec<u8>) {
        match header.frame_type {
            FrameType::Data => {
                self.stats.record_receive(payload.len());
                if let Ok(peer) = self.peers.get_mut(id) {
                    peer.cold.stats.bytes_received += payload.len() as u64;
                    peer.cold.stats.messages_received += 1;
                }
                self.callbacks.fire_message_received(id, &payload);
            }
            FrameType::FragmentStart => {
                let outcome = self.peers.get_mut(id).map(|p| p.cold.reassembly.start(&payload));
                if let Some(Err(e)) = outcome {
                    self.fail_peer(id, e);
                }
            }
            FrameType::FragmentCont => {
                let outcome = self.peers.get_mut(id).map(|p| p.cold.reassembly.append(&payload));
                if let Some(Err(e)) = outcome {
                    self.fail_peer(id, e);
                }
            }
            FrameType::FragmentEnd => {
                let outcome = self.peers.get_mut(id).map(|p| p.cold.reassembly.finish(&payload));
                match outcome {
                    Some(Ok(assembled)) => {
                        self.stats.record_receive(assembled.len());
                        if let Ok(peer) = self.peers.get_mut(id) {
                            peer.cold.stats.bytes_received += assembled.len() as u64;
                            peer.cold.stats.messages_received += 1;
                        }
                        self.callbacks.fire_message_received(id, &assembled);
                    }
                    Some(Err(e)) => self.fail_peer(id, e),
                    None => {}
                }
            }
            FrameType::Capability => match CapabilityPayload::decode(&payload) {
                Ok(cap) => self.apply_capability(id, cap),
                Err(e) => self.fail_peer(id, e),
            },
            FrameType::Ack => {
                if let Ok(p) = PressurePayload::decode(&payload) {
                    if let Ok(peer) = self.peers.get_mut(id) {
                        peer.cold.caps.buffer_pressure = p.pressure;
                    }
                }
            }
            FrameType::Disconnect => {
                self.close_peer_socket(id);
                let _ = self.peers.destroy(id);
                self.callbacks.fire_lost(id);
            }
        }
    }

    fn apply_capability(&mut self, id: PeerId, cap: CapabilityPayload) {
        let local_max = self.config.max_message_size as u32;
        let local_chunk = self.config.default_chunk;
        if let Ok(peer) = self.peers.get_mut(id) {
            peer.cold.caps.max_message = cap.max_message;
            peer.cold.caps.preferred_chunk = cap.preferred_chunk;
            peer.cold.caps.buffer_pressure = cap.buffer_pressure;
            peer.cold.caps.effective_max_msg = local_max.min(cap.max_message);
            peer.cold.caps.effective_chunk = local_chunk.min(cap.preferred_chunk);
        }
        let was_connecting = self
            .peers
            .get(id)
            .map(|p| p.hot.state == PeerState::Connecting)
            .unwrap_or(false);
        if was_connecting && self.peers.set_state(id, PeerState::Connected).is_ok() {
            self.stats.peers_connected += 1;
            debug!(peer = id.0, "peer connected");
            self.callbacks.fire_connected(id);
        }
    }

    fn write_peer(&mut self, id: PeerId) {
        let Ok(peer) = self.peers.get(id) else { return };
        if peer.hot.state != PeerState::Connected {
            return;
        }
        let Some(handle) = peer.cold.tcp_handle else { return };

        self.drain_pressure_update(id, handle);
        let pressure_in_flight = self
            .peers
            .get(id)
            .map(|p| !p.cold.pressure_partial.is_empty())
            .unwrap_or(false);
        if pressure_in_flight {
            // A would-block on the control frame itself; don't risk
            // sandwiching a Tier 1/Tier 2 frame between its two halves.
            // Finish flushing it on a later poll before writing anything
            // else.
            self.check_pressure_threshold(id);
            return;
        }

        let budget = self
            .peers
            .get(id)
            .map(|p| (p.cold.caps.effective_chunk as usize).max(1))
            .unwrap_or(flow::MIN_CHUNK as usize);
        let mut written = 0usize;
        let mut would_block = false;

        while written < budget {
            let has_in_flight = self
                .peers
                .get(id)
                .map(|p| !p.cold.send_partial.is_empty())
                .unwrap_or(false);
            if !has_in_flight && !self.stage_next_send(id) {
                break;
            }
            let pending = match self.peers.get(id) {
                Ok(p) => p.cold.send_partial.clone(),
                Err(_) => break,
            };
            if pending.is_empty() {
                break;
            }
            let result = match self.transport.as_mut() {
                Some(t) => t.tcp_send_nonblocking(handle, &pending),
                None => return,
            };
            match result {
                Ok(n) if n >= pending.len() => {
                    written += n;
                    self.stats.bytes_sent += n as u64;
                    self.finish_in_flight_send(id);
                }
                Ok(n) => {
                    written += n;
                    self.stats.bytes_sent += n as u64;
                    if let Ok(p) = self.peers.get_mut(id) {
                        p.cold.send_partial.drain(0..n);
                    }
                    would_block = true;
                    break;
                }
                Err(Error::WouldBlock) => {
                    would_block = true;
                    break;
                }
                Err(e) => {
                    self.fail_peer(id, e);
                    return;
                }
            }
        }
        self.check_pressure_threshold(id);
        self.update_chunk_size(id, would_block, written);
    }

    /// Stage the next outbound unit (Tier 2 before Tier 1, per spec.md
    /// §4.5's drain order) into `send_partial`. Returns `false` if there was
    /// nothing to stage.
    fn stage_next_send(&mut self, id: PeerId) -> bool {
        let direct_state = self.peers.get(id).map(|p| p.cold.send_direct.state());
        if direct_state == Some(DirectBufferState::Queued) {
            let cancelled = self
                .peers
                .get(id)
                .map(|p| p.cold.stream_cancel_requested)
                .unwrap_or(false);
            if cancelled {
                if let Ok(p) = self.peers.get_mut(id) {
                    p.cold.send_direct.cancel();
                    p.cold.stream_cancel_requested = false;
                }
                self.callbacks.fire_stream_complete(id, Some(Error::Cancelled));
                return self.stage_next_send(id);
            }
            let Ok(peer) = self.peers.get_mut(id) else { return false };
            let Ok(payload) = peer.cold.send_direct.begin_send().map(|p| p.to_vec()) else {
                return false;
            };
            // Partial-write resumption across poll calls is tracked by
            // `send_partial` below, not by `DirectBuffer`'s own sent/remaining
            // cursor — hand the whole payload off now so `is_complete()`
            // reads true as soon as `send_partial` finishes draining to the
            // transport (see `finish_in_flight_send`).
            let _ = peer.cold.send_direct.advance(payload.len());
            let header = FrameHeader::new(FrameType::Data, 0, 0, payload.len() as u16).encode();
            peer.cold.send_partial.clear();
            peer.cold.send_partial.extend_from_slice(&header);
            peer.cold.send_partial.extend_from_slice(&payload);
            return true;
        }

        let popped = self.peers.get_mut(id).ok().and_then(|p| {
            let mut buf = [0u8; SLOT_PAYLOAD_LEN];
            p.cold.send_queue.pop_priority(&mut buf).ok().map(|n| buf[..n].to_vec())
        });
        match popped {
            Some(bytes) => {
                if let Ok(p) = self.peers.get_mut(id) {
                    p.cold.send_partial = bytes;
                }
                true
            }
            None => false,
        }
    }

    fn finish_in_flight_send(&mut self, id: PeerId) {
        let was_direct = self
            .peers
            .get(id)
            .map(|p| p.cold.send_direct.state() == DirectBufferState::Sending)
            .unwrap_or(false);
        if let Ok(p) = self.peers.get_mut(id) {
            p.cold.send_partial.clear();
        }
        if was_direct {
            if let Ok(p) = self.peers.get_mut(id) {
                if p.cold.send_direct.is_complete() {
                    let _ = p.cold.send_direct.complete();
                    p.cold.stats.messages_sent += 1;
                }
            }
            self.stats.messages_sent += 1;
            self.callbacks.fire_stream_complete(id, None);
        } else if let Ok(p) = self.peers.get_mut(id) {
            p.cold.stats.messages_sent += 1;
            self.stats.messages_sent += 1;
        }
    }

    fn update_chunk_size(&mut self, id: PeerId, would_block: bool, written: usize) {
        let Ok(peer) = self.peers.get_mut(id) else { return };
        if would_block {
            peer.cold.consecutive_full_writes = 0;
            peer.cold.caps.effective_chunk = flow::adjust_chunk(
                peer.cold.caps.effective_chunk,
                true,
                0,
                CHUNK_DOUBLE_THRESHOLD,
                peer.cold.caps.effective_max_msg,
            );
        } else if written > 0 {
            peer.cold.consecutive_full_writes += 1;
            peer.cold.caps.effective_chunk = flow::adjust_chunk(
                peer.cold.caps.effective_chunk,
                false,
                peer.cold.consecutive_full_writes,
                CHUNK_DOUBLE_THRESHOLD,
                peer.cold.caps.effective_max_msg,
            );
            if peer.cold.consecutive_full_writes >= CHUNK_DOUBLE_THRESHOLD {
                peer.cold.consecutive_full_writes = 0;
            }
        }
    }

    /// Drains any in-flight PRESSURE (Ack) control frame, staging a fresh
    /// one first if the peer's pressure changed and nothing is already in
    /// flight. Kept off `send_partial` so a control frame can never land in
    /// the middle of a partially written Tier 1/Tier 2 frame — wire order
    /// would desync and the receiver would fail the peer on a bad frame
    /// type. Only ever staged while `send_partial` is empty, and always
    /// drained to completion (across polls, if need be) before any further
    /// Tier 1/Tier 2 bytes are written.
    fn drain_pressure_update(&mut self, id: PeerId, handle: TcpHandle) {
        let has_partial = self
            .peers
            .get(id)
            .map(|p| !p.cold.pressure_partial.is_empty())
            .unwrap_or(false);
        if !has_partial {
            let pending = self
                .peers
                .get(id)
                .map(|p| p.hot.flags.test(PeerFlag::PressureUpdatePending))
                .unwrap_or(false);
            if !pending {
                return;
            }
            let message_in_flight = self
                .peers
                .get(id)
                .map(|p| !p.cold.send_partial.is_empty())
                .unwrap_or(false);
            if message_in_flight {
                return;
            }
            let Ok(peer) = self.peers.get(id) else { return };
            let pressure =
                flow::combined_pressure(peer.cold.send_queue.pressure(), peer.cold.recv_queue.pressure());
            let payload = PressurePayload { pressure }.encode();
            let header = FrameHeader::new(FrameType::Ack, 0, 0, payload.len() as u16).encode();
            if let Ok(peer) = self.peers.get_mut(id) {
                peer.cold.pressure_partial.clear();
                peer.cold.pressure_partial.extend_from_slice(&header);
                peer.cold.pressure_partial.extend_from_slice(&payload);
                peer.cold.pending_pressure_value = pressure;
            }
        }

        let framed = match self.peers.get(id) {
            Ok(p) => p.cold.pressure_partial.clone(),
            Err(_) => return,
        };
        if framed.is_empty() {
            return;
        }
        let result = match self.transport.as_mut() {
            Some(t) => t.tcp_send_nonblocking(handle, &framed),
            None => return,
        };
        match result {
            Ok(n) if n >= framed.len() => {
                self.stats.bytes_sent += n as u64;
                if let Ok(peer) = self.peers.get_mut(id) {
                    peer.cold.pressure_partial.clear();
                    peer.hot.flags.clear(PeerFlag::PressureUpdatePending);
                    peer.cold.caps.last_reported_pressure = peer.cold.pending_pressure_value;
                }
            }
            Ok(n) => {
                self.stats.bytes_sent += n as u64;
                if let Ok(peer) = self.peers.get_mut(id) {
                    peer.cold.pressure_partial.drain(0..n);
                }
            }
            Err(Error::WouldBlock) => {}
            Err(e) => self.fail_peer(id, e),
        }
    }

    fn age_out_stale_peers(&mut self) {
        let now = self.now_ticks();
        let timeout = self.config.discovery_timeout_ms;
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| p.hot.state == PeerState::Discovered)
            .filter(|p| discovery::is_stale(p.hot.last_seen_ticks, now, timeout))
            .map(|p| p.hot.id)
            .collect();
        for id in stale {
            let _ = self.peers.destroy(id);
            self.stats.peers_lost += 1;
            debug!(peer = id.0, "peer aged out");
            self.callbacks.fire_lost(id);
        }
    }

    fn advance_discovery_timer(&mut self) {
        if !self.discovery_active {
            return;
        }
        let now = self.now_ticks();
        if discovery::announce_due(self.last_discovery_broadcast_ticks, now, self.config.discovery_interval_ms) {
            if let Err(e) = self.broadcast_announce() {
                warn!(?e, "failed to broadcast announce");
            }
            self.last_discovery_broadcast_ticks = now;
        }
    }

    fn broadcast_announce(&mut self) -> Result<()> {
        let packet = DiscoveryPacket::new(
            DiscoveryType::Announce,
            self.config.tcp_port,
            self.available_transports(),
            &self.config.local_name,
        );
        let bytes = packet.encode()?;
        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.config.discovery_port);
        self.transport_mut()?.send_udp(dest, &bytes)?;
        Ok(())
    }

    fn available_transports(&self) -> u8 {
        TRANSPORT_TCP | TRANSPORT_UDP
    }

    pub fn get_available_transports(&self) -> u8 {
        self.available_transports()
    }

    // ---- Queries ----------------------------------------------------------

    pub fn get_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|p| PeerInfo {
                id: p.hot.id,
                name: p.cold.name.clone(),
                state: p.hot.state,
                addr: p.cold.addr,
            })
            .collect()
    }

    pub fn get_peers_version(&self) -> u64 {
        self.peers.version()
    }

    pub fn get_peer_by_id(&self, id: PeerId) -> Result<PeerInfo> {
        let peer = self.peers.get(id)?;
        Ok(PeerInfo {
            id: peer.hot.id,
            name: peer.cold.name.clone(),
            state: peer.hot.state,
            addr: peer.cold.addr,
        })
    }

    pub fn get_peer(&self, addr: SocketAddr) -> Result<PeerInfo> {
        let id = self.peers.find_by_address(addr).ok_or(Error::PeerNotFound)?;
        self.get_peer_by_id(id)
    }

    pub fn find_peer_by_name(&self, name: &str) -> Option<PeerId> {
        self.peers.find_by_name(name)
    }

    pub fn find_peer_by_address(&self, addr: SocketAddr) -> Option<PeerId> {
        self.peers.find_by_address(addr)
    }

    pub fn get_queue_status(&self, id: PeerId) -> Result<QueueStatus> {
        let peer = self.peers.get(id)?;
        Ok(QueueStatus {
            send_pressure: peer.cold.send_queue.pressure(),
            recv_pressure: peer.cold.recv_queue.pressure(),
            direct_state: peer.cold.send_direct.state(),
        })
    }

    pub fn get_global_stats(&self) -> GlobalStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    pub fn get_peer_capabilities(&self, id: PeerId) -> Result<Capabilities> {
        Ok(self.peers.get(id)?.cold.caps)
    }

    pub fn get_peer_max_message(&self, id: PeerId) -> Result<u32> {
        Ok(self.peers.get(id)?.cold.caps.effective_max_msg)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Free function form of the C API's `version()` (spec.md §7: "begins with `1.`").
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config(name: &str) -> Config {
        let mut c = Config::new(name);
        c.discovery_port = 0;
        c.tcp_port = 0;
        c.udp_port = 0;
        c
    }

    #[test]
    fn init_and_shutdown_is_idempotent() {
        let mut ctx = Context::init(config("Alpha")).unwrap();
        assert!(ctx.shutdown().is_ok());
        assert!(ctx.shutdown().is_ok());
    }

    #[test]
    fn methods_on_shutdown_context_return_not_initialized() {
        let mut ctx = Context::init(config("Alpha")).unwrap();
        ctx.shutdown().unwrap();
        assert_eq!(ctx.start_discovery().unwrap_err(), Error::NotInitialized);
        assert_eq!(ctx.get_peers().len(), 0);
    }

    #[test]
    fn send_to_unknown_peer_is_peer_not_found() {
        let mut ctx = Context::init(config("Alpha")).unwrap();
        assert_eq!(ctx.send(PeerId(5), b"hi").unwrap_err(), Error::PeerNotFound);
    }

    #[test]
    fn send_oversized_message_rejected() {
        let mut ctx = Context::init(config("Alpha")).unwrap();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let id = ctx.peers.create("Beta", Some(addr)).unwrap();
        ctx.peers.set_state(id, PeerState::Connecting).unwrap();
        ctx.peers.set_state(id, PeerState::Connected).unwrap();
        let huge = vec![0u8; ctx.config.max_message_size + 1];
        assert_eq!(ctx.send(id, &huge).unwrap_err(), Error::MessageTooLarge);
    }

    #[test]
    fn send_to_non_connected_peer_rejected() {
        let mut ctx = Context::init(config("Alpha")).unwrap();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let id = ctx.peers.create("Beta", Some(addr)).unwrap();
        assert_eq!(ctx.send(id, b"hi").unwrap_err(), Error::NotConnected);
    }

    #[test]
    fn version_string_begins_with_1() {
        assert!(version().starts_with("1."));
    }

    #[test]
    fn double_start_discovery_is_rejected() {
        let mut ctx = Context::init(config("Alpha")).unwrap();
        ctx.start_discovery().unwrap();
        assert_eq!(ctx.start_discovery().unwrap_err(), Error::DiscoveryActive);
    }
}
