//! RFC 6479 (WireGuard-style) sliding-window anti-replay filter.

use latchkey_types::{BIT_MASK, BLOCK_MASK, RING_BLOCKS, WINDOW_SIZE};

/// Tracks which counters in a trailing window ending at `last` have already
/// been accepted. `validate_counter` is the only mutating operation; a
/// rejection always leaves the filter unchanged.
#[derive(Debug, Clone)]
pub struct SlidingWindowFilter {
    last: u64,
    ring: [u64; RING_BLOCKS],
}

impl Default for SlidingWindowFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindowFilter {
    /// Builds a fresh, empty filter.
    pub fn new() -> Self {
        Self {
            last: 0,
            ring: [0u64; RING_BLOCKS],
        }
    }

    /// Restores a filter from a previously serialized `last` and ring.
    pub fn from_parts(last: u64, ring: [u64; RING_BLOCKS]) -> Self {
        Self { last, ring }
    }

    /// The highest counter ever accepted.
    pub fn last(&self) -> u64 {
        self.last
    }

    /// The raw ring blocks, for serialization.
    pub fn ring(&self) -> &[u64; RING_BLOCKS] {
        &self.ring
    }

    /// Zeroes `last` and every ring block.
    pub fn reset(&mut self) {
        self.last = 0;
        self.ring = [0u64; RING_BLOCKS];
    }

    /// Attempts to accept `counter`. Returns `true` if it was newly
    /// recorded, `false` if it is rejected (too old, too new, or a
    /// duplicate within the window). On `false` the filter is unchanged.
    pub fn validate_counter(&mut self, counter: u64, limit: u64) -> bool {
        if counter >= limit {
            return false;
        }

        let mut index_block = counter >> 6;

        if counter > self.last {
            // Fast path: new high-water mark. Clear every ring block in
            // (last>>6, index_block], capped at RING_BLOCKS clears so a
            // huge forward jump costs no more than a full reset.
            let last_block = self.last >> 6;
            let diff = index_block.saturating_sub(last_block);
            let clears = diff.min(RING_BLOCKS as u64);
            for i in 1..=clears {
                let block = (last_block.wrapping_add(i)) as usize & BLOCK_MASK;
                self.ring[block] = 0;
            }
            self.last = counter;
        } else if self.last - counter >= WINDOW_SIZE {
            // Too old: falls outside the trailing window. `last - WINDOW_SIZE`
            // itself is rejected; `last - WINDOW_SIZE + 1` is the oldest
            // counter still in range (§4.A "Exactly-at-boundary").
            return false;
        }

        index_block &= BLOCK_MASK as u64;
        let index_bit = counter & BIT_MASK;
        let block = index_block as usize;
        let old = self.ring[block];
        let updated = old | (1u64 << index_bit);
        self.ring[block] = updated;

        old != updated
    }
}
