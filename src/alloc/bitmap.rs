//! Bit operations on bitmap byte slices.
//!
//! Bit `idx` lives in byte `idx / 8`, bit `idx % 8` (least-significant first).
//! A set bit means the number is in use.

/// Test bit `idx`. Bits past the end of the slice read as clear.
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let byte_idx = (idx / 8) as usize;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> (idx % 8)) & 1 == 1
}

pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    bitmap[(idx / 8) as usize] |= 1 << (idx % 8);
}

pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    bitmap[(idx / 8) as usize] &= !(1 << (idx % 8));
}

/// Count clear bits among the first `count` bits of `bitmap`.
pub fn bitmap_count_free(bitmap: &[u8], count: u64) -> u64 {
    let full_bytes = (count / 8) as usize;
    let mut free: u64 = bitmap
        .iter()
        .take(full_bytes)
        .map(|b| u64::from(b.count_zeros()))
        .sum();
    for idx in (full_bytes as u64 * 8)..count {
        if !bitmap_get(bitmap, idx) {
            free += 1;
        }
    }
    free
}

/// Lowest clear bit of `byte`.
pub fn first_zero(byte: u8) -> Option<u32> {
    if byte == u8::MAX {
        None
    } else {
        Some((!byte).trailing_zeros())
    }
}
