//! Sliding counter window for datagram replay protection.
//!
//! Tracks 64-bit packet counters the way the WireGuard anti-replay
//! filter does: a ring of bitmap words trailing the highest counter
//! seen. Packets older than the window are rejected, packets inside the
//! window are rejected if their bit is already set, and packets ahead of
//! the window advance it.
//!
//! # Thread Safety
//!
//! This implementation is NOT thread-safe. Wrap in a Mutex if needed.

const BLOCK_BITS: u64 = 64;
const BLOCK_BIT_LOG: u64 = 6;
const RING_BLOCKS: u64 = 128;

/// Counters this far behind the highest accepted one are rejected.
pub const WINDOW_SIZE: u64 = (RING_BLOCKS - 1) * BLOCK_BITS;

/// Sliding window over 64-bit packet counters.
#[derive(Debug, Clone)]
pub struct CounterWindow {
    last: u64,
    ring: [u64; RING_BLOCKS as usize],
}

impl Default for CounterWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterWindow {
    pub fn new() -> Self {
        Self {
            last: 0,
            ring: [0u64; RING_BLOCKS as usize],
        }
    }

    /// Accept `counter` if it has not been seen and is within the window.
    ///
    /// `limit` is the maximum admissible counter; anything at or above it
    /// is rejected outright, which also covers wraparound.
    pub fn validate(&mut self, counter: u64, limit: u64) -> bool {
        if counter >= limit {
            return false;
        }

        let index_block = counter >> BLOCK_BIT_LOG;
        if counter >= self.last {
            // Ahead of the window: zero the blocks we skip over.
            let current = self.last >> BLOCK_BIT_LOG;
            let diff = (index_block - current).min(RING_BLOCKS);
            for i in 1..=diff {
                self.ring[((current + i) & (RING_BLOCKS - 1)) as usize] = 0;
            }
            self.last = counter;
        } else if self.last - counter > WINDOW_SIZE {
            return false;
        }

        let bit = 1u64 << (counter & (BLOCK_BITS - 1));
        let block = &mut self.ring[(index_block & (RING_BLOCKS - 1)) as usize];
        if *block & bit != 0 {
            return false;
        }
        *block |= bit;
        true
    }
}
