//! # Peer Table & State Machine
//!
//! A fixed-capacity array of peer records with O(1) id-to-index lookup,
//! linear name/address lookup, and the peer lifecycle state machine
//! (spec.md §4.4). Records are split hot/cold: [`PeerHot`] carries the
//! small, frequently-touched, atomics-backed fields the platform layer and
//! poll loop hit on every pass; [`PeerCold`] carries the larger, rarely
//! touched buffers and bookkeeping. The split is logical, not a forced
//! cache-line layout — see the open question in `DESIGN.md`.

use std::net::SocketAddr;

use crate::compat::AtomicFlags;
use crate::direct_buffer::DirectBuffer;
use crate::error::{Error, Result};
use crate::fragment::Reassembler;
use crate::queue::BoundedQueue;
use crate::transport::TcpHandle;

pub const MAX_NAME: usize = 31;
/// Matches the id→index map size the context reserves regardless of the
/// configured `max_peers`, so ids remain stable across a context's life.
pub const MAX_PEER_IDS: usize = 256;

/// Stable identifier for a peer slot, valid until the slot is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unused,
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl PeerState {
    /// Whether `self -> next` is a legal transition under spec.md §4.4.
    /// Setting a state equal to itself is always accepted (idempotent
    /// refresh), independent of the table below.
    fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Unused, Discovered)
                | (Discovered, Connecting)
                | (Discovered, Unused)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Connected, Failed)
                | (Disconnecting, Unused)
                | (Disconnecting, Failed)
                | (Failed, Discovered)
                | (Failed, Unused)
        )
    }
}

/// Per-peer capability negotiation state (spec.md §4.8).
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub max_message: u32,
    pub preferred_chunk: u32,
    pub effective_max_msg: u32,
    pub effective_chunk: u32,
    pub buffer_pressure: u8,
    pub last_reported_pressure: u8,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_message: 8192,
            preferred_chunk: 1024,
            effective_max_msg: 8192,
            effective_chunk: 1024,
            buffer_pressure: 0,
            last_reported_pressure: 0,
        }
    }
}

const PEER_MAGIC: u32 = 0x5045_4552; // "PEER"

/// The cache-line-sized, frequently-touched half of a peer record.
pub struct PeerHot {
    pub magic: u32,
    pub id: PeerId,
    pub state: PeerState,
    pub flags: AtomicFlags,
    pub last_seen_ticks: u32,
}

/// The larger, rarely-touched half of a peer record.
pub struct PeerCold {
    pub name: String,
    pub addr: Option<SocketAddr>,
    pub caps: Capabilities,
    pub recv_cursor: Vec<u8>,
    pub reassembly: Reassembler,
    pub send_queue: BoundedQueue,
    pub recv_queue: BoundedQueue,
    pub send_direct: DirectBuffer,
    pub consecutive_full_writes: u32,
    pub stats: PeerStats,
    /// Opaque transport handle for this peer's TCP connection, once one
    /// exists (absent for a peer that is only `DISCOVERED`).
    pub tcp_handle: Option<TcpHandle>,
    /// Tail bytes of a Tier 1 frame whose write to the transport only
    /// partially completed; written out before any further Tier 1 item is
    /// popped, so frames are never interleaved or reordered.
    pub send_partial: Vec<u8>,
    /// Tail bytes of an in-flight PRESSURE (Ack) control frame. Kept
    /// separate from `send_partial` so a control frame is never staged in
    /// the middle of a partially written Tier 1/Tier 2 frame, and so its
    /// completion never counts toward `messages_sent`.
    pub pressure_partial: Vec<u8>,
    /// Pressure value carried by `pressure_partial`, applied to
    /// `caps.last_reported_pressure` once the frame is fully written.
    pub pending_pressure_value: u8,
    /// Set by [`crate::context::Context::stream_cancel`]; observed and
    /// cleared by the poll loop's Tier 2 drain.
    pub stream_cancel_requested: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PeerStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_errors: u64,
}

pub struct Peer {
    pub hot: PeerHot,
    pub cold: PeerCold,
}

impl Peer {
    fn new_unused(
        id: PeerId,
        queue_capacity: usize,
        direct_buffer_capacity: usize,
        reassembly_limit: usize,
    ) -> Result<Self> {
        Ok(Self {
            hot: PeerHot {
                magic: PEER_MAGIC,
                id,
                state: PeerState::Unused,
                flags: AtomicFlags::new(),
                last_seen_ticks: 0,
            },
            cold: PeerCold {
                name: String::new(),
                addr: None,
                caps: Capabilities::default(),
                recv_cursor: Vec::new(),
                reassembly: Reassembler::new(reassembly_limit),
                send_queue: BoundedQueue::new(queue_capacity)?,
                recv_queue: BoundedQueue::new(queue_capacity)?,
                send_direct: DirectBuffer::new(direct_buffer_capacity),
                consecutive_full_writes: 0,
                stats: PeerStats::default(),
                tcp_handle: None,
                send_partial: Vec::new(),
                pressure_partial: Vec::new(),
                pending_pressure_value: 0,
                stream_cancel_requested: false,
            },
        })
    }

    pub fn is_magic_valid(&self) -> bool {
        self.hot.magic == PEER_MAGIC
    }

    /// Attempt the state transition, per the legality table in spec.md §4.4.
    pub fn set_state(&mut self, next: PeerState) -> Result<()> {
        if !self.hot.state.can_transition_to(next) {
            return Err(Error::InvalidState);
        }
        self.hot.state = next;
        Ok(())
    }

    fn reset(&mut self) {
        self.hot.state = PeerState::Unused;
        self.hot.last_seen_ticks = 0;
        self.cold.name.clear();
        self.cold.addr = None;
        self.cold.caps = Capabilities::default();
        self.cold.recv_cursor.clear();
        self.cold.reassembly.cancel();
        self.cold.send_queue.reset();
        self.cold.recv_queue.reset();
        self.cold.send_direct.cancel();
        self.cold.consecutive_full_writes = 0;
        self.cold.stats = PeerStats::default();
        self.cold.tcp_handle = None;
        self.cold.send_partial.clear();
        self.cold.pressure_partial.clear();
        self.cold.pending_pressure_value = 0;
        self.cold.stream_cancel_requested = false;
    }
}

/// Fixed-capacity table of peer records plus the O(1) id→index map and a
/// monotonic version counter bumped on any add/remove/state change.
pub struct PeerTable {
    peers: Vec<Peer>,
    id_to_index: [Option<u16>; MAX_PEER_IDS],
    next_id_hint: u16,
    max_peers: usize,
    version: u64,
}

impl PeerTable {
    pub fn new(
        max_peers: usize,
        queue_capacity: usize,
        direct_buffer_capacity: usize,
        reassembly_limit: usize,
    ) -> Result<Self> {
        if max_peers == 0 || max_peers > MAX_PEER_IDS {
            return Err(Error::InvalidParam);
        }
        let mut peers = Vec::with_capacity(max_peers);
        for i in 0..max_peers {
            peers.push(Peer::new_unused(
                PeerId(i as u16),
                queue_capacity,
                direct_buffer_capacity,
                reassembly_limit,
            )?);
        }
        Ok(Self {
            peers,
            id_to_index: [None; MAX_PEER_IDS],
            next_id_hint: 0,
            max_peers,
            version: 0,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.hot.state != PeerState::Unused)
            .count()
    }

    /// Allocate a fresh peer slot in `DISCOVERED`. Fails with `Resource` if
    /// the table is full.
    pub fn create(&mut self, name: &str, addr: Option<SocketAddr>) -> Result<PeerId> {
        if name.len() > MAX_NAME {
            return Err(Error::InvalidParam);
        }
        let slot = self
            .peers
            .iter()
            .position(|p| p.hot.state == PeerState::Unused)
            .ok_or(Error::Resource)?;

        let id = self.allocate_id()?;
        let peer = &mut self.peers[slot];
        peer.reset();
        peer.hot.id = id;
        peer.hot.magic = PEER_MAGIC;
        peer.hot.state = PeerState::Discovered;
        peer.cold.name = name.to_string();
        peer.cold.addr = addr;
        self.id_to_index[id.0 as usize] = Some(slot as u16);
        self.version += 1;
        Ok(id)
    }

    fn allocate_id(&mut self) -> Result<PeerId> {
        for _ in 0..MAX_PEER_IDS {
            let candidate = self.next_id_hint;
            self.next_id_hint = self.next_id_hint.wrapping_add(1) % MAX_PEER_IDS as u16;
            if self.id_to_index[candidate as usize].is_none() {
                return Ok(PeerId(candidate));
            }
        }
        Err(Error::Resource)
    }

    /// Destroy a peer slot: zero its magic, free the id mapping, return it
    /// to `Unused`. Idempotent on an already-unused id.
    pub fn destroy(&mut self, id: PeerId) -> Result<()> {
        let index = self.index_of(id)?;
        self.peers[index].hot.magic = 0;
        self.peers[index].reset();
        self.id_to_index[id.0 as usize] = None;
        self.version += 1;
        Ok(())
    }

    fn index_of(&self, id: PeerId) -> Result<usize> {
        let idx = self.id_to_index[id.0 as usize].ok_or(Error::PeerNotFound)?;
        Ok(idx as usize)
    }

    pub fn get(&self, id: PeerId) -> Result<&Peer> {
        let idx = self.index_of(id)?;
        Ok(&self.peers[idx])
    }

    pub fn get_mut(&mut self, id: PeerId) -> Result<&mut Peer> {
        let idx = self.index_of(id)?;
        Ok(&mut self.peers[idx])
    }

    pub fn set_state(&mut self, id: PeerId, next: PeerState) -> Result<()> {
        let peer = self.get_mut(id)?;
        peer.set_state(next)?;
        self.version += 1;
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|p| p.hot.state != PeerState::Unused && p.cold.name == name)
            .map(|p| p.hot.id)
    }

    pub fn find_by_address(&self, addr: SocketAddr) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|p| p.hot.state != PeerState::Unused && p.cold.addr == Some(addr))
            .map(|p| p.hot.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.hot.state != PeerState::Unused)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers
            .iter_mut()
            .filter(|p| p.hot.state != PeerState::Unused)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.iter().map(|p| p.hot.id).collect()
    }

    #[cfg(debug_assertions)]
    pub(crate) fn debug_invariants_hold(&self) -> bool {
        for (i, peer) in self.peers.iter().enumerate() {
            if peer.hot.state == PeerState::Unused {
                continue;
            }
            if !peer.is_magic_valid() {
                return false;
            }
            match self.id_to_index[peer.hot.id.0 as usize] {
                Some(idx) if idx as usize == i => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PeerTable {
        PeerTable::new(4, 8, 64, 8192).unwrap()
    }

    #[test]
    fn create_and_lookup() {
        let mut t = table();
        let id = t.create("Alpha", None).unwrap();
        assert_eq!(t.get(id).unwrap().cold.name, "Alpha");
        assert_eq!(t.find_by_name("Alpha"), Some(id));
        assert_eq!(t.peer_count(), 1);
    }

    #[test]
    fn table_full_returns_resource_error() {
        let mut t = PeerTable::new(1, 8, 64, 8192).unwrap();
        t.create("a", None).unwrap();
        assert_eq!(t.create("b", None).unwrap_err(), Error::Resource);
    }

    #[test]
    fn legal_state_transitions_succeed() {
        let mut t = table();
        let id = t.create("Alpha", None).unwrap();
        t.set_state(id, PeerState::Connecting).unwrap();
        t.set_state(id, PeerState::Connected).unwrap();
        t.set_state(id, PeerState::Disconnecting).unwrap();
        t.set_state(id, PeerState::Unused).unwrap();
    }

    #[test]
    fn illegal_state_transition_rejected_without_mutation() {
        let mut t = table();
        let id = t.create("Alpha", None).unwrap();
        let err = t.set_state(id, PeerState::Failed);
        // Discovered -> Failed is not in the legal table.
        assert!(err.is_err());
        assert_eq!(t.get(id).unwrap().hot.state, PeerState::Discovered);
    }

    #[test]
    fn idempotent_refresh_allowed() {
        let mut t = table();
        let id = t.create("Alpha", None).unwrap();
        t.set_state(id, PeerState::Discovered).unwrap();
        assert_eq!(t.get(id).unwrap().hot.state, PeerState::Discovered);
    }

    #[test]
    fn destroy_frees_id_and_zeroes_magic() {
        let mut t = table();
        let id = t.create("Alpha", None).unwrap();
        t.destroy(id).unwrap();
        assert_eq!(t.get(id).unwrap_err(), Error::PeerNotFound);
    }

    #[test]
    fn recovery_from_failed_to_discovered() {
        let mut t = table();
        let id = t.create("Alpha", None).unwrap();
        t.set_state(id, PeerState::Connecting).unwrap();
        t.set_state(id, PeerState::Failed).unwrap();
        t.set_state(id, PeerState::Discovered).unwrap();
    }

    #[test]
    fn version_bumps_on_mutation() {
        let mut t = table();
        let before = t.version();
        let id = t.create("Alpha", None).unwrap();
        assert!(t.version() > before);
        let after_create = t.version();
        t.set_state(id, PeerState::Connecting).unwrap();
        assert!(t.version() > after_create);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn invariants_hold_after_typical_use() {
        let mut t = table();
        let id1 = t.create("Alpha", None).unwrap();
        let _id2 = t.create("Beta", None).unwrap();
        t.set_state(id1, PeerState::Connecting).unwrap();
        assert!(t.debug_invariants_hold());
        t.destroy(id1).unwrap();
        assert!(t.debug_invariants_hold());
    }
}
