//! # Direct (Tier 2) Buffer
//!
//! A single-slot staging area for large messages that would be wasteful to
//! copy through the small fixed-size [`crate::queue::BoundedQueue`] slots.
//! Exactly one large send may be outstanding per peer at a time; a second
//! attempt while one is in flight is rejected with [`Error::Busy`] rather
//! than queued, since there is nowhere to put it (spec.md §3/§4.3).
//!
//! ## State machine
//!
//! ```text
//! Idle --queue()--> Queued --begin_send()--> Sending --complete()--> Idle
//!                                                \--cancel()-------> Idle
//!    \--cancel() (no-op, already idle)
//! ```
//!
//! `Queued` means the payload is staged and waiting for the send engine to
//! pick it up; `Sending` means the send engine owns an in-progress partial
//! write and tracks its own cursor via [`DirectBuffer::advance`].

use crate::error::{Error, Result};
use crate::queue::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectBufferState {
    Idle,
    Queued,
    Sending,
}

pub struct DirectBuffer {
    state: DirectBufferState,
    data: Vec<u8>,
    len: usize,
    sent: usize,
    capacity: usize,
    priority: Priority,
    flags: u8,
}

impl DirectBuffer {
    /// `capacity` is the configured direct-buffer size (spec.md's
    /// `direct_buffer_size`, already clamped and defaulted by
    /// [`crate::config::Config`]).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: DirectBufferState::Idle,
            data: vec![0u8; capacity],
            len: 0,
            sent: 0,
            capacity,
            priority: Priority::Normal,
            flags: 0,
        }
    }

    pub fn state(&self) -> DirectBufferState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == DirectBufferState::Idle
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Stage `data` for sending at the given priority/flags. Fails if a send
    /// is already queued or in flight, or if `data` exceeds the configured
    /// capacity.
    pub fn queue_with(&mut self, data: &[u8], priority: Priority, flags: u8) -> Result<()> {
        if self.state != DirectBufferState::Idle {
            return Err(Error::Busy);
        }
        if data.len() > self.capacity {
            return Err(Error::MessageTooLarge);
        }
        self.data[..data.len()].copy_from_slice(data);
        self.len = data.len();
        self.sent = 0;
        self.priority = priority;
        self.flags = flags;
        self.state = DirectBufferState::Queued;
        Ok(())
    }

    /// Convenience form of [`Self::queue_with`] at `Normal` priority with no
    /// flags, used by direct tests of this module.
    pub fn queue(&mut self, data: &[u8]) -> Result<()> {
        self.queue_with(data, Priority::Normal, 0)
    }

    /// Hand the staged payload to the send engine, transitioning to
    /// `Sending`. Returns the full unsent slice.
    pub fn begin_send(&mut self) -> Result<&[u8]> {
        if self.state != DirectBufferState::Queued {
            return Err(Error::InvalidState);
        }
        self.state = DirectBufferState::Sending;
        Ok(&self.data[..self.len])
    }

    /// The remaining unsent tail, for a transport that performs a partial
    /// write and needs to resume later in the same `Sending` state.
    pub fn remaining(&self) -> Result<&[u8]> {
        if self.state != DirectBufferState::Sending {
            return Err(Error::InvalidState);
        }
        Ok(&self.data[self.sent..self.len])
    }

    /// Record that `n` more bytes were written to the wire.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        if self.state != DirectBufferState::Sending {
            return Err(Error::InvalidState);
        }
        self.sent = (self.sent + n).min(self.len);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.state == DirectBufferState::Sending && self.sent >= self.len
    }

    /// Retire a fully-sent buffer back to `Idle`.
    pub fn complete(&mut self) -> Result<()> {
        if self.state != DirectBufferState::Sending {
            return Err(Error::InvalidState);
        }
        if self.sent < self.len {
            return Err(Error::InvalidState);
        }
        self.reset();
        Ok(())
    }

    /// Abandon whatever is staged or in flight, returning immediately to
    /// `Idle`. A no-op if already idle.
    pub fn cancel(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.state = DirectBufferState::Idle;
        self.len = 0;
        self.sent = 0;
        self.priority = Priority::Normal;
        self.flags = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_then_send_then_complete_round_trip() {
        let mut buf = DirectBuffer::new(64);
        assert!(buf.is_idle());
        buf.queue(b"hello world").unwrap();
        assert_eq!(buf.state(), DirectBufferState::Queued);

        let payload = buf.begin_send().unwrap().to_vec();
        assert_eq!(payload, b"hello world");
        assert_eq!(buf.state(), DirectBufferState::Sending);

        buf.advance(5).unwrap();
        assert!(!buf.is_complete());
        assert_eq!(buf.remaining().unwrap(), b" world");

        buf.advance(6).unwrap();
        assert!(buf.is_complete());
        buf.complete().unwrap();
        assert!(buf.is_idle());
    }

    #[test]
    fn second_queue_while_busy_is_rejected() {
        let mut buf = DirectBuffer::new(64);
        buf.queue(b"first").unwrap();
        assert_eq!(buf.queue(b"second").unwrap_err(), Error::Busy);
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut buf = DirectBuffer::new(4);
        assert_eq!(buf.queue(b"too big").unwrap_err(), Error::MessageTooLarge);
    }

    #[test]
    fn cancel_from_any_state_returns_to_idle() {
        let mut buf = DirectBuffer::new(32);
        buf.cancel();
        assert!(buf.is_idle());

        buf.queue(b"data").unwrap();
        buf.cancel();
        assert!(buf.is_idle());

        buf.queue(b"data").unwrap();
        buf.begin_send().unwrap();
        buf.cancel();
        assert!(buf.is_idle());
    }

    #[test]
    fn complete_before_fully_sent_is_rejected() {
        let mut buf = DirectBuffer::new(32);
        buf.queue(b"0123456789").unwrap();
        buf.begin_send().unwrap();
        buf.advance(3).unwrap();
        assert_eq!(buf.complete().unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn begin_send_requires_queued_state() {
        let mut buf = DirectBuffer::new(32);
        assert_eq!(buf.begin_send().unwrap_err(), Error::InvalidState);
    }
}
