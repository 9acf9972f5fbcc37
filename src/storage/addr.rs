//! Bit-range addresses within blocks.

use crate::storage::disk::NBITBLOCK;
use std::fmt;

/// Identifies `bit_length` bits starting at `bit_offset` inside `block`.
///
/// Collaborators give distinct logical objects non-overlapping addresses
/// (or whole-block addresses); the journal relies on that to lock by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr {
    pub block: u64,
    pub bit_offset: u64,
    pub bit_length: u64,
}

impl Addr {
    /// Creates an address. Panics if the range is empty or leaves the block.
    pub fn new(block: u64, bit_offset: u64, bit_length: u64) -> Self {
        assert!(
            bit_length > 0 && bit_offset + bit_length <= NBITBLOCK,
            "bit range {}+{} does not fit in a block",
            bit_offset,
            bit_length
        );
        Self {
            block,
            bit_offset,
            bit_length,
        }
    }

    /// The address covering all of `block`.
    pub fn block_addr(block: u64) -> Self {
        Self::new(block, 0, NBITBLOCK)
    }

    /// Address of bit `n` of a bitmap that starts at block `start`.
    pub fn bit_addr(start: u64, n: u64) -> Self {
        Self::new(start + n / NBITBLOCK, n % NBITBLOCK, 1)
    }

    /// Address of the byte holding bit `n` of a bitmap that starts at `start`.
    pub fn byte_addr(start: u64, n: u64) -> Self {
        let bit = n % NBITBLOCK;
        Self::new(start + n / NBITBLOCK, bit - bit % 8, 8)
    }

    /// Flattens the address into a single integer used as the lock key.
    pub fn flat_id(&self) -> u64 {
        self.block * NBITBLOCK + self.bit_offset
    }

    pub fn is_whole_block(&self) -> bool {
        self.bit_offset == 0 && self.bit_length == NBITBLOCK
    }

    /// Number of bytes needed to hold the addressed bits.
    pub fn byte_len(&self) -> usize {
        self.bit_length.div_ceil(8) as usize
    }

    /// Returns true if both addresses name intersecting bits of one block.
    pub fn overlaps(&self, other: &Addr) -> bool {
        self.block == other.block
            && self.bit_offset < other.bit_offset + other.bit_length
            && other.bit_offset < self.bit_offset + self.bit_length
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}+{}",
            self.block, self.bit_offset, self.bit_length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::BLOCK_SIZE;

    #[test]
    fn test_block_addr() {
        let addr = Addr::block_addr(7);
        assert!(addr.is_whole_block());
        assert_eq!(addr.byte_len(), BLOCK_SIZE);
        assert_eq!(addr.flat_id(), 7 * NBITBLOCK);
    }

    #[test]
    fn test_bit_and_byte_addr() {
        let addr = Addr::bit_addr(10, NBITBLOCK + 13);
        assert_eq!(addr, Addr::new(11, 13, 1));
        assert_eq!(addr.byte_len(), 1);

        let byte = Addr::byte_addr(10, NBITBLOCK + 13);
        assert_eq!(byte, Addr::new(11, 8, 8));
        assert!(byte.overlaps(&addr));
    }

    #[test]
    fn test_overlaps() {
        let a = Addr::new(1, 0, 16);
        let b = Addr::new(1, 8, 8);
        let c = Addr::new(1, 16, 8);
        let d = Addr::new(2, 0, 16);

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&d));
    }

    #[test]
    fn test_flat_ids_distinct_within_block() {
        assert_ne!(Addr::new(3, 0, 8).flat_id(), Addr::new(3, 8, 8).flat_id());
        assert_ne!(Addr::new(3, 0, 8).flat_id(), Addr::new(4, 0, 8).flat_id());
    }

    #[test]
    fn test_ordering_groups_by_block() {
        let mut addrs = vec![Addr::new(2, 0, 8), Addr::new(1, 64, 8), Addr::new(1, 0, 8)];
        addrs.sort();
        assert_eq!(
            addrs,
            vec![Addr::new(1, 0, 8), Addr::new(1, 64, 8), Addr::new(2, 0, 8)]
        );
    }

    #[test]
    #[should_panic]
    fn test_range_past_block_end() {
        Addr::new(0, NBITBLOCK - 4, 8);
    }
}
