//! # Flow Control & Pressure
//!
//! Throttling rules keyed on a peer's advertised buffer pressure (spec.md
//! §4.5/§4.8), plus the pressure-reporting-threshold logic that decides
//! when the poll loop owes the peer a `PRESSURE` message and the adaptive
//! chunk-size adjustment used while draining the outbound pipeline.

use crate::queue::Priority;

/// Thresholds pressure is compared against when deciding whether to emit a
/// new `PRESSURE` report. Crossing any of these (in either direction)
/// relative to `last_reported_pressure` sets the pending-update flag.
pub const PRESSURE_REPORT_THRESHOLDS: [u8; 5] = [0, 25, 50, 75, 90];

pub const MIN_CHUNK: u32 = 256;
pub const MAX_CHUNK_CEILING: u32 = 8192;

/// Whether a message at `priority` must be rejected with backpressure,
/// given the peer's currently reported `pressure` (0..=100).
///
/// ```text
/// p < 25          -> throttle nothing
/// 25  <= p < 75    -> throttle LOW
/// 75  <= p < 90    -> throttle LOW and NORMAL
/// 90  <= p < 100   -> throttle LOW, NORMAL and HIGH
/// p == 100         -> only CRITICAL passes
/// ```
pub fn should_throttle(pressure: u8, priority: Priority) -> bool {
    let ceiling = match pressure {
        0..=24 => return false,
        25..=74 => Priority::Low,
        75..=89 => Priority::Normal,
        // Both "90 <= p < 100" and "p == 100" throttle the same set: only
        // CRITICAL is ever accepted once pressure reaches 90.
        _ => Priority::High,
    };
    priority <= ceiling
}

/// Find the highest reporting threshold that `pressure` has crossed
/// relative to `last_reported`, signaling whether a fresh `PRESSURE`
/// message is owed. Crossing in either direction counts.
pub fn crossed_reporting_threshold(pressure: u8, last_reported: u8) -> bool {
    for &t in PRESSURE_REPORT_THRESHOLDS.iter() {
        let now_above = pressure >= t;
        let was_above = last_reported >= t;
        if now_above != was_above {
            return true;
        }
    }
    false
}

/// Combine a peer's outbound and inbound queue pressure into the single
/// value that gets advertised (spec.md §4.8: "after every push/pop, compute
/// `max(send_queue_pressure, recv_queue_pressure)`").
pub fn combined_pressure(send_pressure: u8, recv_pressure: u8) -> u8 {
    send_pressure.max(recv_pressure)
}

/// Adjust `effective_chunk` after a drain step.
///
/// Halves (floor `MIN_CHUNK`) immediately on a would-block write. Doubles
/// (ceiling the smaller of `effective_max_msg` and `MAX_CHUNK_CEILING`)
/// only after `consecutive_full_writes` reaches `threshold`, at which point
/// the caller should also reset its counter.
pub fn adjust_chunk(
    current: u32,
    would_block: bool,
    consecutive_full_writes: u32,
    threshold: u32,
    effective_max_msg: u32,
) -> u32 {
    if would_block {
        return current.saturating_div(2).max(MIN_CHUNK);
    }
    if consecutive_full_writes >= threshold {
        let ceiling = effective_max_msg.min(MAX_CHUNK_CEILING);
        return (current.saturating_mul(2)).min(ceiling);
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_matches_pressure_bands() {
        assert!(!should_throttle(0, Priority::Low));
        assert!(!should_throttle(24, Priority::Low));
        assert!(should_throttle(25, Priority::Low));
        assert!(!should_throttle(25, Priority::Normal));
        assert!(should_throttle(75, Priority::Normal));
        assert!(!should_throttle(75, Priority::High));
        assert!(should_throttle(90, Priority::High));
        assert!(!should_throttle(90, Priority::Critical));
        assert!(should_throttle(100, Priority::High));
        assert!(!should_throttle(100, Priority::Critical));
        assert!(!should_throttle(50, Priority::Normal));
        assert!(should_throttle(50, Priority::Low));
    }

    #[test]
    fn throttling_monotonicity_as_pressure_rises() {
        // The accepted set must never grow as pressure increases.
        let priorities = [Priority::Low, Priority::Normal, Priority::High, Priority::Critical];
        let mut prev_accepted: Option<usize> = None;
        for p in [0u8, 10, 25, 50, 75, 80, 90, 95, 100] {
            let accepted = priorities.iter().filter(|&&pr| !should_throttle(p, pr)).count();
            if let Some(prev) = prev_accepted {
                assert!(accepted <= prev, "accepted set grew at pressure {p}");
            }
            prev_accepted = Some(accepted);
        }
    }

    #[test]
    fn reporting_threshold_crossing_detected() {
        assert!(crossed_reporting_threshold(30, 10));
        assert!(!crossed_reporting_threshold(30, 26));
        assert!(crossed_reporting_threshold(10, 30));
    }

    #[test]
    fn chunk_halves_on_would_block_and_floors() {
        assert_eq!(adjust_chunk(1024, true, 0, 4, 8192), 512);
        assert_eq!(adjust_chunk(256, true, 0, 4, 8192), 256);
    }

    #[test]
    fn chunk_doubles_after_threshold_and_ceilings() {
        assert_eq!(adjust_chunk(1024, false, 4, 4, 8192), 2048);
        assert_eq!(adjust_chunk(1024, false, 3, 4, 8192), 1024);
        assert_eq!(adjust_chunk(4096, false, 4, 4, 512), 512);
    }
}
