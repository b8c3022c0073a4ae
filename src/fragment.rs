//! # Fragmentation & Reassembly
//!
//! Splits an outbound message larger than a peer's effective maximum into
//! `FRAGMENT-START`/`FRAGMENT-CONT`/`FRAGMENT-END` pieces (spec.md §4.5),
//! and reassembles an inbound fragment stream back into a single buffer,
//! refusing to grow past `effective_max_msg * fragment_cap` bytes
//! (spec.md §4.6).

use crate::error::{Error, Result};

/// Split `data` into chunks of at most `max_chunk` bytes each. The caller
/// is responsible for tagging the first chunk `FRAGMENT-START`, the middle
/// ones `FRAGMENT-CONT`, and the last `FRAGMENT-END` (even when there is
/// only one chunk, which is both start and end).
pub fn split_into_fragments(data: &[u8], max_chunk: usize) -> Result<Vec<&[u8]>> {
    if max_chunk == 0 {
        return Err(Error::InvalidParam);
    }
    if data.is_empty() {
        return Ok(vec![&data[..0]]);
    }
    Ok(data.chunks(max_chunk).collect())
}

/// Accumulates an inbound fragment stream for one peer at a time.
///
/// Only one reassembly may be in progress per peer (spec.md §4.6: "Refuse
/// to start a second reassembly while one is in progress (protocol error →
/// FAILED)"), so this has no peer-id bookkeeping of its own — one instance
/// lives inside each peer's cold record.
pub struct Reassembler {
    buffer: Vec<u8>,
    limit: usize,
    active: bool,
}

impl Reassembler {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn bytes_so_far(&self) -> usize {
        self.buffer.len()
    }

    /// Begin a new reassembly with the first (`FRAGMENT-START`) chunk.
    pub fn start(&mut self, chunk: &[u8]) -> Result<()> {
        if self.active {
            return Err(Error::InvalidState);
        }
        if chunk.len() > self.limit {
            return Err(Error::MessageTooLarge);
        }
        self.buffer.clear();
        self.buffer.extend_from_slice(chunk);
        self.active = true;
        Ok(())
    }

    /// Append a `FRAGMENT-CONT` chunk to the in-progress reassembly.
    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        if !self.active {
            return Err(Error::InvalidState);
        }
        if self.buffer.len() + chunk.len() > self.limit {
            self.cancel();
            return Err(Error::MessageTooLarge);
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Append the final (`FRAGMENT-END`) chunk and return the fully
    /// assembled message, resetting this reassembler to idle.
    pub fn finish(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        self.append(chunk)?;
        self.active = false;
        Ok(std::mem::take(&mut self.buffer))
    }

    /// Abandon an in-progress reassembly (used on disconnect/failure).
    pub fn cancel(&mut self) {
        self.buffer.clear();
        self.active = false;
    }
}
