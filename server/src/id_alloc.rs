//! Bitmap-based dense ID allocation.
//!
//! Rooms and, inside each room, user IDs come from this allocator. IDs are
//! dense small integers so they stay friendly to client-side arrays and the
//! wire format. The bitmap grows in 64-bit blocks on demand up to a fixed
//! capacity; ID 0 is pre-reserved so that 0 can mean "unset" everywhere.

use std::sync::Mutex;

use crate::error::ServerError;

const BLOCK_BITS: u32 = 64;

/// Rounds `n` up to the nearest multiple of 64 so the allocator capacity
/// always covers whole bitmap blocks.
pub fn round_up_to_64(n: u32) -> u32 {
    (n + 63) & !63u32
}

/// An allocator for dense u32 IDs, implemented as a bitmap that is grown as
/// necessary. Not thread-safe on its own; see [`SafeIdAllocator`].
pub struct IdAllocator {
    bits: Vec<u64>,
    max_blocks: u32,
}

impl IdAllocator {
    /// Creates an allocator that may hand out up to `num_ids` values.
    /// `num_ids` must be non-zero and divisible by 64.
    pub fn new(num_ids: u32) -> IdAllocator {
        assert!(
            num_ids != 0 && num_ids % BLOCK_BITS == 0,
            "num_ids must be non-zero and divisible by {}",
            BLOCK_BITS
        );

        let mut alloc = IdAllocator {
            bits: vec![0u64; 1],
            max_blocks: num_ids / BLOCK_BITS,
        };
        // Reserve ID 0 so it never leaves the allocator.
        alloc.bits[0] |= 1;
        alloc
    }

    /// Finds an unused ID, marks it used and returns it.
    pub fn allocate(&mut self) -> Result<u32, ServerError> {
        let mut i = 0usize;
        loop {
            let block = self.bits[i];
            if block != u64::MAX {
                let bit = (!block).trailing_zeros();
                self.bits[i] = block | (1u64 << bit);
                return Ok(i as u32 * BLOCK_BITS + bit);
            }

            i += 1;
            if i == self.bits.len() && !self.grow() {
                return Err(ServerError::IdsExhausted);
            }
        }
    }

    /// Marks `id` as unused. `id` must have come from a successful
    /// [`allocate`](Self::allocate); freeing twice is a logic error but
    /// harmless.
    pub fn free(&mut self, id: u32) {
        let (block, mask) = (id / BLOCK_BITS, 1u64 << (id % BLOCK_BITS));
        if (block as usize) < self.bits.len() {
            self.bits[block as usize] &= !mask;
        }
    }

    /// Returns true if `id` is currently allocated.
    pub fn is_allocated(&self, id: u32) -> bool {
        let (block, mask) = (id / BLOCK_BITS, 1u64 << (id % BLOCK_BITS));
        self.bits
            .get(block as usize)
            .map(|b| b & mask != 0)
            .unwrap_or(false)
    }

    /// Marks a specific `id` as used, growing the bitmap if needed. Returns
    /// false when the id is beyond capacity or already taken. Used to
    /// re-reserve a uid recovered from a reconnect token.
    pub fn reserve(&mut self, id: u32) -> bool {
        if id >= self.max_blocks * BLOCK_BITS {
            return false;
        }
        let (block, mask) = (id / BLOCK_BITS, 1u64 << (id % BLOCK_BITS));
        while (block as usize) >= self.bits.len() {
            if !self.grow() {
                return false;
            }
        }
        if self.bits[block as usize] & mask != 0 {
            return false;
        }
        self.bits[block as usize] |= mask;
        true
    }

    fn grow(&mut self) -> bool {
        let (n, m) = (self.bits.len() as u32, self.max_blocks);
        if n >= m {
            return false;
        }
        // Double, clamped to capacity.
        let added = if 2 * n > m { m - n } else { n };
        self.bits.extend(std::iter::repeat(0u64).take(added as usize));
        true
    }
}

/// A `Mutex`-wrapped [`IdAllocator`] shared between the admission path and a
/// room loop.
pub struct SafeIdAllocator {
    inner: Mutex<IdAllocator>,
}

impl SafeIdAllocator {
    pub fn new(num_ids: u32) -> SafeIdAllocator {
        SafeIdAllocator {
            inner: Mutex::new(IdAllocator::new(num_ids)),
        }
    }

    pub fn allocate(&self) -> Result<u32, ServerError> {
        self.inner.lock().unwrap().allocate()
    }

    pub fn free(&self, id: u32) {
        self.inner.lock().unwrap().free(id);
    }

    pub fn reserve(&self, id: u32) -> bool {
        self.inner.lock().unwrap().reserve(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ids_are_dense_and_skip_zero() {
        let mut alloc = IdAllocator::new(64);
        assert_eq!(alloc.allocate().unwrap(), 1);
        assert_eq!(alloc.allocate().unwrap(), 2);
        assert_eq!(alloc.allocate().unwrap(), 3);
    }

    #[test]
    fn freed_id_may_be_reallocated() {
        let mut alloc = IdAllocator::new(64);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        alloc.free(a);
        let c = alloc.allocate().unwrap();
        assert_eq!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut alloc = IdAllocator::new(64);
        // 63 usable ids; id 0 is reserved.
        for _ in 0..63 {
            alloc.allocate().unwrap();
        }
        assert!(matches!(
            alloc.allocate(),
            Err(ServerError::IdsExhausted)
        ));
    }

    #[test]
    fn grows_past_one_block() {
        let mut alloc = IdAllocator::new(192);
        let mut last = 0;
        for _ in 0..191 {
            last = alloc.allocate().unwrap();
        }
        assert_eq!(last, 191);
        assert!(alloc.allocate().is_err());
    }

    #[test]
    fn reserve_specific_id() {
        let mut alloc = IdAllocator::new(128);
        assert!(alloc.reserve(100));
        assert!(!alloc.reserve(100));
        assert!(alloc.is_allocated(100));
        assert!(!alloc.reserve(128)); // beyond capacity
        alloc.free(100);
        assert!(alloc.reserve(100));
    }

    #[test]
    fn round_up() {
        assert_eq!(round_up_to_64(0), 0);
        assert_eq!(round_up_to_64(1), 64);
        assert_eq!(round_up_to_64(64), 64);
        assert_eq!(round_up_to_64(65), 128);
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let alloc = Arc::new(SafeIdAllocator::new(256));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                (0..16)
                    .map(|_| alloc.allocate().unwrap())
                    .collect::<Vec<u32>>()
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "id {} handed out twice", id);
            }
        }
        assert_eq!(seen.len(), 128);
    }
}
