//! # Compatibility Layer
//!
//! The C implementation this crate is grounded on carries a small
//! portability layer — fixed-width integer byte-swap helpers, a
//! zeroing allocator, and atomic bit-set/clear/test on a single word —
//! because it targets everything from retro Mac stacks to POSIX hosts.
//! Rust's `u16`/`u32::to_be_bytes` and `std::sync::atomic` make most of
//! that layer disappear, but we keep the same logical surface area so the
//! rest of the crate reads against named operations rather than scattered
//! shifts, and so a platform integrator porting this to a target without
//! `std::sync::atomic` support has one small module to replace.

use std::sync::atomic::{AtomicU32, Ordering};

/// Named bit positions in a peer's hot-block flags word (see
/// [`crate::peer::PeerHot::flags`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PeerFlag {
    /// Set by the platform layer when unread bytes are available; cleared
    /// by the poll loop after a drain pass.
    DataAvailable = 0,
    /// Set once a non-blocking `connect()` resolves.
    ConnectComplete = 1,
    /// Set when the platform layer observes a fatal socket error.
    Error = 2,
    /// Set when this peer's advertised pressure crossed a reporting
    /// threshold and a PRESSURE message is owed on the next drain.
    PressureUpdatePending = 3,
}

/// A single word of independently-settable/clearable/testable bits.
///
/// Mirrors the C core's `atomic_bit_set`/`atomic_bit_clear`/`atomic_bit_test`
/// trio: callers from the platform layer (which may run in an interrupt
/// handler or a notifier callback on another thread) set or clear bits with
/// `Release` ordering; the poll loop tests and clears them with `Acquire`.
#[derive(Debug, Default)]
pub struct AtomicFlags(AtomicU32);

impl AtomicFlags {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn set(&self, flag: PeerFlag) {
        self.0.fetch_or(1 << (flag as u32), Ordering::Release);
    }

    pub fn clear(&self, flag: PeerFlag) {
        self.0.fetch_and(!(1 << (flag as u32)), Ordering::Release);
    }

    pub fn test(&self, flag: PeerFlag) -> bool {
        self.0.load(Ordering::Acquire) & (1 << (flag as u32)) != 0
    }

    /// Test-and-clear in a single operation, used by the poll loop to drain
    /// a flag without racing a concurrent setter.
    pub fn test_and_clear(&self, flag: PeerFlag) -> bool {
        let prev = self.0.fetch_and(!(1 << (flag as u32)), Ordering::AcqRel);
        prev & (1 << (flag as u32)) != 0
    }
}

/// Round a capacity up to the next power of two, or `None` on overflow.
///
/// Used by [`crate::queue::BoundedQueue::new`] only to produce a clear
/// error message; the queue itself *rejects* non-power-of-two capacities
/// rather than silently rounding (spec.md §4.2), so callers that want
/// "give me a queue of at least N slots" should round explicitly with this
/// helper before calling `new`.
pub fn next_power_of_two(n: usize) -> Option<usize> {
    if n == 0 {
        return Some(1);
    }
    n.checked_next_power_of_two()
}

/// A monotonic millisecond tick counter backed by a process-local
/// [`std::time::Instant`] epoch.
///
/// Stands in for the C core's `now_ticks()` transport-interface call when a
/// platform-provided clock isn't otherwise available; [`crate::transport::Transport`]
/// implementations are free to source ticks from elsewhere (e.g. a hardware
/// timer) as long as they're monotonic and roughly millisecond-scaled.
#[derive(Debug)]
pub struct TickClock {
    epoch: std::time::Instant,
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock {
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }

    pub fn now_ticks(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_set_clear_test() {
        let flags = AtomicFlags::new();
        assert!(!flags.test(PeerFlag::DataAvailable));
        flags.set(PeerFlag::DataAvailable);
        assert!(flags.test(PeerFlag::DataAvailable));
        assert!(!flags.test(PeerFlag::Error));
        flags.clear(PeerFlag::DataAvailable);
        assert!(!flags.test(PeerFlag::DataAvailable));
    }

    #[test]
    fn test_and_clear_observes_once() {
        let flags = AtomicFlags::new();
        flags.set(PeerFlag::PressureUpdatePending);
        assert!(flags.test_and_clear(PeerFlag::PressureUpdatePending));
        assert!(!flags.test_and_clear(PeerFlag::PressureUpdatePending));
    }

    #[test]
    fn power_of_two_rounding() {
        assert_eq!(next_power_of_two(0), Some(1));
        assert_eq!(next_power_of_two(1), Some(1));
        assert_eq!(next_power_of_two(5), Some(8));
        assert_eq!(next_power_of_two(16), Some(16));
    }

    #[test]
    fn tick_clock_is_monotonic() {
        let clock = TickClock::new();
        let a = clock.now_ticks();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.now_ticks();
        assert!(b >= a);
    }
}
