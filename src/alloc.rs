//! Bitmap-backed allocation of small integers (block or inode numbers).

pub mod allocator;
pub mod bitmap;

pub use allocator::Allocator;
