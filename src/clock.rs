//! The wrapping 31-bit timestamp clock that paces both link peers.
//!
//! Both sides advance a local timestamp once per 2^21 emulated cycles and
//! include it in every packet they send. A side may only perform a bit
//! transfer while its local clock has not run past the peer's last reported
//! timestamp, which throttles the faster emulator down to the slower one.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::packet::TIMESTAMP_MASK;

/// Emulated cycles per timestamp increment (timestamps count 2 MiHz clocks).
pub const TIMESTAMP_WINDOW: u32 = 1 << 21;

/// Shared between the tick loop (advances `local`) and the receiver thread
/// (records `last_received`, samples `local` for outgoing packets).
#[derive(Debug, Default)]
pub struct LinkClock {
    local: AtomicU32,
    last_received: AtomicU32,
}

impl LinkClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds elapsed cycles into the accumulator owned by the tick loop.
    /// Every full window bumps the local timestamp by one; the excess is
    /// carried into the next window, never dropped.
    pub fn advance(&self, accumulator: &mut u32, cycles: u32) {
        *accumulator += cycles;
        while *accumulator >= TIMESTAMP_WINDOW {
            *accumulator -= TIMESTAMP_WINDOW;
            let next = self.local.load(Ordering::Relaxed).wrapping_add(1) & TIMESTAMP_MASK;
            self.local.store(next, Ordering::Release);
        }
    }

    pub fn local(&self) -> u32 {
        self.local.load(Ordering::Acquire)
    }

    /// Records the timestamp of a received packet. Called for every packet,
    /// recognized or not.
    pub fn record_remote(&self, timestamp: u32) {
        self.last_received
            .store(timestamp & TIMESTAMP_MASK, Ordering::Release);
    }

    pub fn last_received(&self) -> u32 {
        self.last_received.load(Ordering::Acquire)
    }

    /// Whether a bit transfer may proceed. True while the local clock is at
    /// or behind the peer's last reported timestamp, computed over the
    /// 31-bit circle so the wrap boundary does not stall the link.
    pub fn transfer_allowed(&self) -> bool {
        let lead = self.local().wrapping_sub(self.last_received()) & TIMESTAMP_MASK;
        lead == 0 || lead > TIMESTAMP_MASK / 2
    }

    /// Restores the local timestamp from a save state.
    pub fn restore_local(&self, timestamp: u32) {
        self.local
            .store(timestamp & TIMESTAMP_MASK, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_window_increments_once_and_zeroes_accumulator() {
        let clock = LinkClock::new();
        let mut acc = 0;
        clock.advance(&mut acc, TIMESTAMP_WINDOW);
        assert_eq!(clock.local(), 1);
        assert_eq!(acc, 0);
    }

    #[test]
    fn overshoot_is_carried_not_dropped() {
        let clock = LinkClock::new();
        let mut acc = 0;
        clock.advance(&mut acc, TIMESTAMP_WINDOW + 100);
        assert_eq!(clock.local(), 1);
        assert_eq!(acc, 100);
    }

    #[test]
    fn partial_windows_accumulate_across_calls() {
        let clock = LinkClock::new();
        let mut acc = 0;
        clock.advance(&mut acc, TIMESTAMP_WINDOW - 1);
        assert_eq!(clock.local(), 0);
        clock.advance(&mut acc, 1);
        assert_eq!(clock.local(), 1);
        assert_eq!(acc, 0);
    }

    #[test]
    fn local_timestamp_wraps_at_31_bits() {
        let clock = LinkClock::new();
        clock.restore_local(TIMESTAMP_MASK);
        let mut acc = 0;
        clock.advance(&mut acc, TIMESTAMP_WINDOW);
        assert_eq!(clock.local(), 0);
    }

    #[test]
    fn transfer_gated_while_local_is_ahead() {
        let clock = LinkClock::new();
        assert!(clock.transfer_allowed());

        let mut acc = 0;
        clock.advance(&mut acc, TIMESTAMP_WINDOW);
        // local = 1, last_received = 0: we are ahead, wait for the peer.
        assert!(!clock.transfer_allowed());

        clock.record_remote(1);
        assert!(clock.transfer_allowed());

        clock.record_remote(5);
        assert!(clock.transfer_allowed());
    }

    #[test]
    fn gate_is_wrap_aware_at_the_31_bit_boundary() {
        let clock = LinkClock::new();

        // Local just wrapped to 0, peer still reports the top of the range:
        // local is one step ahead, so the transfer must wait.
        clock.restore_local(0);
        clock.record_remote(TIMESTAMP_MASK);
        assert!(!clock.transfer_allowed());

        // Peer wrapped first: local is behind, transfer may proceed.
        clock.restore_local(TIMESTAMP_MASK);
        clock.record_remote(0);
        assert!(clock.transfer_allowed());
    }
}
