//! # Configuration Surface
//!
//! The tunables accepted by [`crate::Context::init`] (spec.md §6), with the
//! same validate-then-apply-defaults shape the teacher's
//! `BenchmarkConfig::from_args` uses: fields are taken largely as given,
//! a handful are clamped or defaulted, and anything genuinely invalid is
//! rejected up front rather than discovered mid-run.

use crate::error::{Error, Result};
use crate::peer::MAX_NAME;

pub const DEFAULT_DISCOVERY_PORT: u16 = 7353;
pub const DEFAULT_TCP_PORT: u16 = 7354;
pub const DEFAULT_UDP_PORT: u16 = 7355;
pub const DEFAULT_MAX_PEERS: usize = 32;
pub const DEFAULT_DIRECT_BUFFER_SIZE: usize = 4096;
pub const MAX_DIRECT_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8192;
pub const DEFAULT_FRAGMENT_CAP: usize = 16;
pub const DEFAULT_DISCOVERY_INTERVAL_MS: u32 = 1000;
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u32 = 30_000;
pub const DEFAULT_CHUNK: u32 = 1024;
/// The bounded-queue capacity backing each peer's Tier 1 pipeline. Must stay
/// a power of two; 64 comfortably covers the default `max_message_size`
/// fragmented at 256-byte slots (32 fragments) with headroom.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Whether fragmentation of oversized messages is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentationMode {
    /// Fragment only when the message exceeds `effective_max_msg`.
    #[default]
    Auto,
    /// Always honor `enable_fragmentation`-gated behavior (same as `Auto`
    /// for sends under the limit; kept distinct to mirror the C config's
    /// three-way knob rather than collapsing it to a bool).
    On,
    /// Reject oversized sends instead of fragmenting them.
    Off,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub local_name: String,
    pub max_peers: usize,
    pub discovery_port: u16,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub direct_buffer_size: usize,
    pub max_message_size: usize,
    pub enable_fragmentation: FragmentationMode,
    pub fragment_cap: usize,
    pub discovery_interval_ms: u32,
    pub discovery_timeout_ms: u32,
    pub default_chunk: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_name: String::new(),
            max_peers: DEFAULT_MAX_PEERS,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            direct_buffer_size: DEFAULT_DIRECT_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            enable_fragmentation: FragmentationMode::Auto,
            fragment_cap: DEFAULT_FRAGMENT_CAP,
            discovery_interval_ms: DEFAULT_DISCOVERY_INTERVAL_MS,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            default_chunk: DEFAULT_CHUNK,
        }
    }
}

impl Config {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            ..Self::default()
        }
    }

    /// Validate and normalize this configuration, applying defaults for
    /// zero-valued tunables the way spec.md §6 describes.
    ///
    /// `local_name` must be non-empty and at most [`MAX_NAME`] bytes.
    /// `max_peers` must fall in `1..=256`. `direct_buffer_size` of `0`
    /// becomes [`DEFAULT_DIRECT_BUFFER_SIZE`]; any value is then capped to
    /// [`MAX_DIRECT_BUFFER_SIZE`].
    pub fn validated(mut self) -> Result<Self> {
        if self.local_name.is_empty() || self.local_name.len() > MAX_NAME {
            return Err(Error::InvalidParam);
        }
        if self.max_peers == 0 || self.max_peers > crate::peer::MAX_PEER_IDS {
            return Err(Error::InvalidParam);
        }
        if self.direct_buffer_size == 0 {
            self.direct_buffer_size = DEFAULT_DIRECT_BUFFER_SIZE;
        }
        self.direct_buffer_size = self.direct_buffer_size.min(MAX_DIRECT_BUFFER_SIZE);
        if self.max_message_size == 0 {
            self.max_message_size = DEFAULT_MAX_MESSAGE_SIZE;
        }
        if self.fragment_cap == 0 {
            return Err(Error::InvalidParam);
        }
        if self.default_chunk == 0 {
            self.default_chunk = DEFAULT_CHUNK;
        }
        Ok(self)
    }

    /// The bound passed to each peer's [`crate::fragment::Reassembler`]:
    /// `effective_max_msg * fragment_cap`, using the configured
    /// `max_message_size` as the pre-negotiation ceiling.
    pub fn reassembly_limit(&self) -> usize {
        self.max_message_size.saturating_mul(self.fragment_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_rejected() {
        assert_eq!(Config::new("").validated().unwrap_err(), Error::InvalidParam);
    }

    #[test]
    fn overlong_name_rejected() {
        let name = "x".repeat(MAX_NAME + 1);
        assert_eq!(Config::new(name).validated().unwrap_err(), Error::InvalidParam);
    }

    #[test]
    fn zero_direct_buffer_defaults() {
        let mut c = Config::new("peer");
        c.direct_buffer_size = 0;
        let c = c.validated().unwrap();
        assert_eq!(c.direct_buffer_size, DEFAULT_DIRECT_BUFFER_SIZE);
    }

    #[test]
    fn oversized_direct_buffer_capped() {
        let mut c = Config::new("peer");
        c.direct_buffer_size = 100_000;
        let c = c.validated().unwrap();
        assert_eq!(c.direct_buffer_size, MAX_DIRECT_BUFFER_SIZE);
    }

    #[test]
    fn max_peers_out_of_range_rejected() {
        let mut c = Config::new("peer");
        c.max_peers = 0;
        assert_eq!(c.clone().validated().unwrap_err(), Error::InvalidParam);
        c.max_peers = 1000;
        assert_eq!(c.validated().unwrap_err(), Error::InvalidParam);
    }

    #[test]
    fn reassembly_limit_multiplies_max_message_by_fragment_cap() {
        let c = Config::new("peer").validated().unwrap();
        assert_eq!(c.reassembly_limit(), DEFAULT_MAX_MESSAGE_SIZE * DEFAULT_FRAGMENT_CAP);
    }
}
