//! # Protocol Codec
//!
//! Encode/decode for the three wire formats defined in spec.md §3:
//! discovery packets (CRC-guarded, UDP broadcast), message frames (TCP,
//! no CRC — TCP already guarantees byte integrity), and plain UDP
//! datagrams. All multi-byte fields are big-endian ("network byte
//! order"), matching spec.md §6.
//!
//! Grounded on the teacher's `Message::to_bytes`/`from_bytes` pair
//! (`src/ipc/mod.rs`) for the encode/decode contract shape, but hand-rolled
//! rather than `serde`/`bincode`-driven: these layouts are wire-exact byte
//! positions, not a Rust type's derived serialization.

use crate::error::{Error, Result};

/// 4-byte magic identifying a discovery packet: `"PTLK"`.
pub const DISCOVERY_MAGIC: [u8; 4] = *b"PTLK";
/// 4-byte magic identifying a TCP message frame: `"PTMG"`.
pub const MESSAGE_MAGIC: [u8; 4] = *b"PTMG";
/// 4-byte magic identifying a plain UDP datagram: `"PTUD"`.
pub const DATAGRAM_MAGIC: [u8; 4] = *b"PTUD";

/// The only protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum name length embeddable in a discovery packet (1 byte length
/// field, and spec.md bounds display names to this anyway).
pub const MAX_NAME: usize = 31;

/// Fixed header size of a discovery packet before the variable-length name
/// and trailing CRC.
const DISCOVERY_HEADER_LEN: usize = 12;
/// Message frame header size (spec.md §3).
pub const MESSAGE_HEADER_LEN: usize = 10;
/// UDP datagram header size (spec.md §3).
pub const DATAGRAM_HEADER_LEN: usize = 8;

/// CRC-16/KERMIT: polynomial 0x8408 (reflected 0x1021), initial 0x0000, no
/// final XOR. Test vector: `crc16(b"123456789") == 0x2189` (spec.md §4.1).
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(0x0000, data)
}

/// Incremental form of [`crc16`]: composes over any split of the input, i.e.
/// `crc16_update(crc16_update(0, a), b) == crc16(&[a, b].concat())`.
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Discovery packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoveryType {
    Announce = 1,
    Query = 2,
    Goodbye = 3,
}

impl DiscoveryType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(DiscoveryType::Announce),
            2 => Ok(DiscoveryType::Query),
            3 => Ok(DiscoveryType::Goodbye),
            _ => Err(Error::InvalidParam),
        }
    }
}

/// A decoded/to-be-encoded discovery packet (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub version: u8,
    pub packet_type: DiscoveryType,
    pub flags: u16,
    pub tcp_port: u16,
    pub transports: u8,
    pub name: String,
}

impl DiscoveryPacket {
    pub fn new(packet_type: DiscoveryType, tcp_port: u16, transports: u8, name: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            flags: 0,
            tcp_port,
            transports,
            name: name.to_string(),
        }
    }

    /// Encode into a freshly allocated buffer, returning the byte count
    /// written. Refuses an oversized name with [`Error::InvalidParam`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name_bytes = self.name.as_bytes();
        if name_bytes.len() > MAX_NAME {
            return Err(Error::InvalidParam);
        }
        let mut buf = Vec::with_capacity(DISCOVERY_HEADER_LEN + name_bytes.len() + 2);
        buf.extend_from_slice(&DISCOVERY_MAGIC);
        buf.push(self.version);
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.tcp_port.to_be_bytes());
        buf.push(self.transports);
        buf.push(name_bytes.len() as u8);
        buf.extend_from_slice(name_bytes);

        let crc = crc16(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }

    /// Decode a discovery packet, validating magic, version, name length,
    /// and the trailing CRC-16 over everything preceding it. Never reads
    /// past `data.len()`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < DISCOVERY_HEADER_LEN + 2 {
            return Err(Error::Truncated);
        }
        if data[0..4] != DISCOVERY_MAGIC {
            return Err(Error::Magic);
        }
        let version = data[4];
        if version != PROTOCOL_VERSION {
            return Err(Error::Version);
        }
        let packet_type = DiscoveryType::from_u8(data[5])?;
        let flags = u16::from_be_bytes([data[6], data[7]]);
        let tcp_port = u16::from_be_bytes([data[8], data[9]]);
        let transports = data[10];
        let name_len = data[11] as usize;
        if name_len > MAX_NAME {
            return Err(Error::InvalidParam);
        }
        let body_end = DISCOVERY_HEADER_LEN + name_len;
        if data.len() < body_end + 2 {
            return Err(Error::Truncated);
        }
        let name = std::str::from_utf8(&data[DISCOVERY_HEADER_LEN..body_end])
            .map_err(|_| Error::InvalidParam)?
            .to_string();

        let expected_crc = crc16(&data[0..body_end]);
        let actual_crc = u16::from_be_bytes([data[body_end], data[body_end + 1]]);
        if expected_crc != actual_crc {
            return Err(Error::Crc);
        }

        Ok(Self {
            version,
            packet_type,
            flags,
            tcp_port,
            transports,
            name,
        })
    }
}

/// TCP message frame type byte (spec.md §3). Values 8..=255 are reserved
/// and rejected by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 1,
    Capability = 2,
    Ack = 3,
    Disconnect = 4,
    FragmentStart = 5,
    FragmentCont = 6,
    FragmentEnd = 7,
}

impl FrameType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Capability),
            3 => Ok(FrameType::Ack),
            4 => Ok(FrameType::Disconnect),
            5 => Ok(FrameType::FragmentStart),
            6 => Ok(FrameType::FragmentCont),
            7 => Ok(FrameType::FragmentEnd),
            _ => Err(Error::InvalidParam),
        }
    }
}

/// A decoded message frame header; the payload is handled separately by the
/// receive engine's streaming parser (spec.md §4.6), since a frame's
/// payload may arrive split across multiple reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: u8,
    pub sequence: u8,
    pub payload_len: u16,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, flags: u8, sequence: u8, payload_len: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            flags,
            sequence,
            payload_len,
        }
    }

    /// Encode the 10-byte header. The payload is appended by the caller
    /// (the send engine writes header and payload as two `write` calls
    /// rather than concatenating, to avoid an extra copy of large payloads).
    pub fn encode(&self) -> [u8; MESSAGE_HEADER_LEN] {
        let mut buf = [0u8; MESSAGE_HEADER_LEN];
        buf[0..4].copy_from_slice(&MESSAGE_MAGIC);
        buf[4] = self.version;
        buf[5] = self.frame_type as u8;
        buf[6] = self.flags;
        buf[7] = self.sequence;
        buf[8..10].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Decode a fixed 10-byte header slice.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MESSAGE_HEADER_LEN {
            return Err(Error::Truncated);
        }
        if data[0..4] != MESSAGE_MAGIC {
            return Err(Error::Magic);
        }
        let version = data[4];
        if version != PROTOCOL_VERSION {
            return Err(Error::Version);
        }
        let frame_type = FrameType::from_u8(data[5])?;
        let flags = data[6];
        let sequence = data[7];
        let payload_len = u16::from_be_bytes([data[8], data[9]]);
        Ok(Self {
            version,
            frame_type,
            flags,
            sequence,
            payload_len,
        })
    }
}

/// A plain (non-discovery) UDP datagram (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub sender_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    pub fn encode(sender_port: u16, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > u16::MAX as usize {
            return Err(Error::MessageTooLarge);
        }
        let mut buf = Vec::with_capacity(DATAGRAM_HEADER_LEN + payload.len());
        buf.extend_from_slice(&DATAGRAM_MAGIC);
        buf.extend_from_slice(&sender_port.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    pub fn decode(data: &'a [u8]) -> Result<Self> {
        if data.len() < DATAGRAM_HEADER_LEN {
            return Err(Error::Truncated);
        }
        if data[0..4] != DATAGRAM_MAGIC {
            return Err(Error::Magic);
        }
        let sender_port = u16::from_be_bytes([data[4], data[5]]);
        let payload_len = u16::from_be_bytes([data[6], data[7]]) as usize;
        let body_end = DATAGRAM_HEADER_LEN + payload_len;
        if data.len() < body_end {
            return Err(Error::Truncated);
        }
        Ok(Self {
            sender_port,
            payload: &data[DATAGRAM_HEADER_LEN..body_end],
        })
    }
}

/// Payload carried inside a `CAPABILITY` frame (spec.md §4.8): the sender's
/// own limits, used by the receiver to recompute `effective_max_msg`/
/// `effective_chunk` as `min(local, remote)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityPayload {
    pub max_message: u32,
    pub preferred_chunk: u32,
    pub buffer_pressure: u8,
}

impl CapabilityPayload {
    pub const ENCODED_LEN: usize = 9;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.max_message.to_be_bytes());
        buf[4..8].copy_from_slice(&self.preferred_chunk.to_be_bytes());
        buf[8] = self.buffer_pressure;
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::ENCODED_LEN {
            return Err(Error::Truncated);
        }
        Ok(Self {
            max_message: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            preferred_chunk: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            buffer_pressure: data[8],
        })
    }
}

/// Payload carried inside an `ACK`/pressure-report frame: a single
/// percentage-fullness byte (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressurePayload {
    pub pressure: u8,
}

impl PressurePayload {
    pub const ENCODED_LEN: usize = 1;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        [self.pressure]
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Truncated);
        }
        Ok(Self { pressure: data[0] })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_test_vector() {
        assert_eq!(crc16(b"123456789"), 0x2189);
    }

    #[test]
    fn crc16_incremental_matches_single_shot() {
        let data = b"peertalk discovery framing";
        let whole = crc16(data);
        let (a, b) = data.split_at(11);
        let incremental = crc16_update(crc16_update(0, a), b);
        assert_eq!(whole, incremental);
    }

    #[test]
    fn discovery_round_trip() {
        let packet = DiscoveryPacket::new(DiscoveryType::Announce, 17391, 0b11, "Alpha");
        let encoded = packet.encode().unwrap();
        let decoded = DiscoveryPacket::decode(&encoded).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn discovery_rejects_oversized_name() {
        let long_name = "x".repeat(MAX_NAME + 1);
        let packet = DiscoveryPacket::new(DiscoveryType::Announce, 1, 0, &long_name);
        assert_eq!(packet.encode().unwrap_err(), Error::InvalidParam);
    }

    #[test]
    fn discovery_single_bit_flip_always_errors() {
        let packet = DiscoveryPacket::new(DiscoveryType::Query, 7354, 1, "TestPeer");
        let encoded = packet.encode().unwrap();

        for byte_idx in 0..encoded.len() {
            for bit in 0..8u8 {
                let mut corrupted = encoded.clone();
                corrupted[byte_idx] ^= 1 << bit;
                let result = DiscoveryPacket::decode(&corrupted);
                if let Ok(decoded) = result {
                    // A corruption that still "decodes" must not silently
                    // change the semantic content (would mean our CRC
                    // didn't actually cover that byte/bit).
                    assert_eq!(
                        decoded, packet,
                        "bit flip at byte {byte_idx} bit {bit} decoded to a different packet"
                    );
                }
            }
        }
    }

    #[test]
    fn discovery_truncated_is_rejected() {
        let packet = DiscoveryPacket::new(DiscoveryType::Announce, 1, 0, "A");
        let encoded = packet.encode().unwrap();
        assert_eq!(
            DiscoveryPacket::decode(&encoded[..encoded.len() - 1]).unwrap_err(),
            Error::Truncated
        );
    }

    #[test]
    fn message_frame_round_trip() {
        let header = FrameHeader::new(FrameType::Data, 0, 5, 1234);
        let encoded = header.encode();
        let decoded = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn message_frame_rejects_bad_type() {
        let mut encoded = FrameHeader::new(FrameType::Data, 0, 0, 0).encode();
        encoded[5] = 0xFF;
        assert_eq!(FrameHeader::decode(&encoded).unwrap_err(), Error::InvalidParam);
    }

    #[test]
    fn message_frame_rejects_bad_magic() {
        let mut encoded = FrameHeader::new(FrameType::Ack, 0, 0, 0).encode();
        encoded[0] = b'X';
        assert_eq!(FrameHeader::decode(&encoded).unwrap_err(), Error::Magic);
    }

    #[test]
    fn datagram_round_trip() {
        let payload = b"hello over udp";
        let encoded = UdpDatagram::encode(4242, payload).unwrap();
        let decoded = UdpDatagram::decode(&encoded).unwrap();
        assert_eq!(decoded.sender_port, 4242);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn capability_payload_round_trip() {
        let cap = CapabilityPayload {
            max_message: 8192,
            preferred_chunk: 1024,
            buffer_pressure: 42,
        };
        let encoded = cap.encode();
        assert_eq!(CapabilityPayload::decode(&encoded).unwrap(), cap);
    }

    #[test]
    fn pressure_payload_round_trip() {
        let p = PressurePayload { pressure: 77 };
        assert_eq!(PressurePayload::decode(&p.encode()).unwrap(), p);
    }
}
