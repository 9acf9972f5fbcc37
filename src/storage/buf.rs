//! Transaction-local staged updates.
//!
//! Bit convention: bit `i` of an address is bit `(bit_offset + i) % 8` of
//! byte `(bit_offset + i) / 8` in the block (least-significant bit first),
//! and bit `i % 8` of byte `i / 8` in the buffer payload. Unused high bits of
//! the last payload byte are zero when loaded and ignored when installed.

use crate::storage::addr::Addr;
use crate::storage::disk::Block;
use std::fmt;

/// A staged update for one address, owned by exactly one transaction.
pub struct Buf {
    addr: Addr,
    data: Vec<u8>,
    dirty: bool,
}

impl Buf {
    /// Creates a clean buffer holding `data`.
    pub fn new(addr: Addr, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            addr.byte_len(),
            "payload size does not match address {}",
            addr
        );
        Self {
            addr,
            data,
            dirty: false,
        }
    }

    /// Creates a clean buffer by copying the addressed bits out of `blk`.
    pub fn load(addr: Addr, blk: &Block) -> Self {
        Self::new(addr, extract_bits(blk, addr.bit_offset, addr.bit_length))
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the payload. Callers that change it must call
    /// [`Buf::set_dirty`].
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replaces the payload and marks the buffer dirty.
    pub fn write(&mut self, data: &[u8]) {
        assert_eq!(
            data.len(),
            self.data.len(),
            "payload size does not match address {}",
            self.addr
        );
        self.data.copy_from_slice(data);
        self.dirty = true;
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Splices the payload into `blk` if dirty. Returns whether it did.
    pub fn install(&self, blk: &mut Block) -> bool {
        if self.dirty {
            install_bits(blk, &self.data, self.addr.bit_offset, self.addr.bit_length);
        }
        self.dirty
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("addr", &self.addr)
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Copies `bit_length` bits of `src` into `blk` starting at `bit_offset`.
/// Every other bit of `blk` is preserved.
pub fn install_bits(blk: &mut Block, src: &[u8], bit_offset: u64, bit_length: u64) {
    if bit_offset % 8 == 0 && bit_length % 8 == 0 {
        let start = (bit_offset / 8) as usize;
        let len = (bit_length / 8) as usize;
        blk[start..start + len].copy_from_slice(&src[..len]);
        return;
    }

    for i in 0..bit_length {
        let bit = (src[(i / 8) as usize] >> (i % 8)) & 1;
        let pos = bit_offset + i;
        let byte = &mut blk[(pos / 8) as usize];
        let mask = 1u8 << (pos % 8);
        *byte = (*byte & !mask) | (bit << (pos % 8));
    }
}

/// Copies `bit_length` bits of `blk` starting at `bit_offset` into a new
/// payload.
pub fn extract_bits(blk: &Block, bit_offset: u64, bit_length: u64) -> Vec<u8> {
    let mut out = vec![0u8; bit_length.div_ceil(8) as usize];
    if bit_offset % 8 == 0 && bit_length % 8 == 0 {
        let start = (bit_offset / 8) as usize;
        let len = out.len();
        out.copy_from_slice(&blk[start..start + len]);
        return out;
    }

    for i in 0..bit_length {
        let pos = bit_offset + i;
        let bit = (blk[(pos / 8) as usize] >> (pos % 8)) & 1;
        out[(i / 8) as usize] |= bit << (i % 8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::{zero_block, BLOCK_SIZE, NBITBLOCK};
    use proptest::prelude::*;

    #[test]
    fn test_install_whole_bytes() {
        let mut blk = zero_block();
        install_bits(&mut blk, &[0xAB, 0xCD], 16, 16);
        assert_eq!(&blk[0..5], &[0, 0, 0xAB, 0xCD, 0]);
    }

    #[test]
    fn test_install_single_bit() {
        let mut blk = Box::new([0xFFu8; BLOCK_SIZE]);
        install_bits(&mut blk, &[0], 11, 1);
        assert_eq!(blk[1], 0b1111_0111);
        assert_eq!(blk[0], 0xFF);
        assert_eq!(blk[2], 0xFF);

        install_bits(&mut blk, &[1], 11, 1);
        assert_eq!(blk[1], 0xFF);
    }

    #[test]
    fn test_install_unaligned_range_spans_bytes() {
        let mut blk = zero_block();
        // 6 bits 0b101101 at bit 5: bits 5..=10
        install_bits(&mut blk, &[0b0010_1101], 5, 6);
        assert_eq!(blk[0], 0b1010_0000);
        assert_eq!(blk[1], 0b0000_0101);
        assert_eq!(extract_bits(&blk, 5, 6), vec![0b0010_1101]);
    }

    #[test]
    fn test_extract_aligned_bytes() {
        let mut blk = zero_block();
        blk[4..7].copy_from_slice(&[0x12, 0x34, 0x56]);
        assert_eq!(extract_bits(&blk, 32, 24), vec![0x12, 0x34, 0x56]);
        assert_eq!(extract_bits(&blk, 0, NBITBLOCK).len(), BLOCK_SIZE);
    }

    #[test]
    fn test_extract_pads_high_bits_with_zero() {
        let blk = Box::new([0xFFu8; BLOCK_SIZE]);
        assert_eq!(extract_bits(&blk, 3, 3), vec![0b0000_0111]);
    }

    #[test]
    fn test_clean_buf_does_not_install() {
        let mut blk = zero_block();
        let buf = Buf::new(Addr::new(0, 0, 8), vec![0xFF]);
        assert!(!buf.install(&mut blk));
        assert_eq!(blk[0], 0);
    }

    #[test]
    fn test_write_marks_dirty() {
        let mut blk = zero_block();
        let mut buf = Buf::load(Addr::new(0, 8, 8), &blk);
        assert!(!buf.is_dirty());
        buf.write(&[0x5A]);
        assert!(buf.is_dirty());
        assert!(buf.install(&mut blk));
        assert_eq!(blk[1], 0x5A);
    }

    #[test]
    #[should_panic]
    fn test_write_wrong_size() {
        let mut buf = Buf::new(Addr::new(0, 0, 8), vec![0]);
        buf.write(&[1, 2]);
    }

    proptest! {
        #[test]
        fn prop_install_preserves_outside_bits(
            fill in any::<u8>(),
            payload in prop::collection::vec(any::<u8>(), 4),
            offset in 0u64..(NBITBLOCK - 32),
            length in 1u64..=32,
        ) {
            let mut blk = Box::new([fill; BLOCK_SIZE]);
            let before = blk.clone();
            let src = &payload[..length.div_ceil(8) as usize];
            install_bits(&mut blk, src, offset, length);

            for pos in 0..NBITBLOCK {
                let got = (blk[(pos / 8) as usize] >> (pos % 8)) & 1;
                if pos >= offset && pos < offset + length {
                    let i = pos - offset;
                    let want = (src[(i / 8) as usize] >> (i % 8)) & 1;
                    prop_assert_eq!(got, want);
                } else {
                    let want = (before[(pos / 8) as usize] >> (pos % 8)) & 1;
                    prop_assert_eq!(got, want);
                }
            }
        }
    }
}
