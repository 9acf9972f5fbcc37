//! On-disk log layout and the records stored in it.
//!
//! ```text
//! block 0                  header: end position, then HDRADDRS destination block numbers
//! block 1                  marker: start (tail) position
//! blocks 2..2+capacity     circular payload region, one block per log slot
//! ```
//!
//! All integers are little-endian u64.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::storage::disk::{zero_block, Block, BLOCK_SIZE};

/// Block holding the log header.
pub const LOGHDR: u64 = 0;

/// Block holding the installed-position marker.
pub const LOGHDR2: u64 = 1;

/// First block of the circular payload region.
pub const LOGSTART: u64 = 2;

/// Number of destination block numbers that fit in the header, which bounds
/// the log capacity.
pub const HDRADDRS: u64 = ((BLOCK_SIZE - 8) / 8) as u64;

/// A logical position in the log. Positions grow forever; the slot a position
/// occupies on disk is the position modulo the log capacity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogPosition(pub u64);

impl LogPosition {
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn advance(&self, n: u64) -> Self {
        LogPosition(self.0 + n)
    }

    /// Number of positions from `earlier` up to `self`.
    pub fn distance_from(&self, earlier: LogPosition) -> u64 {
        self.0 - earlier.0
    }

    /// Block on disk where this position's payload lives.
    pub fn slot_block(&self, capacity: u64) -> u64 {
        LOGSTART + self.0 % capacity
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pos({})", self.0)
    }
}

/// A full block image destined for home location `blkno`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub blkno: u64,
    pub data: Arc<Block>,
}

impl BlockData {
    pub fn new(blkno: u64, data: Box<Block>) -> Self {
        Self {
            blkno,
            data: Arc::from(data),
        }
    }
}

/// Contents of the header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// End of the durable log.
    pub end: LogPosition,
    /// Destination block number for each slot, indexed by slot.
    pub addrs: Vec<u64>,
}

impl Header {
    pub fn empty() -> Self {
        Self {
            end: LogPosition(0),
            addrs: vec![0; HDRADDRS as usize],
        }
    }

    pub fn encode(&self) -> Box<Block> {
        assert!(self.addrs.len() as u64 <= HDRADDRS);
        let mut blk = zero_block();
        LittleEndian::write_u64(&mut blk[0..8], self.end.0);
        for (i, addr) in self.addrs.iter().enumerate() {
            let off = 8 + i * 8;
            LittleEndian::write_u64(&mut blk[off..off + 8], *addr);
        }
        blk
    }

    pub fn decode(blk: &Block) -> Self {
        let end = LogPosition(LittleEndian::read_u64(&blk[0..8]));
        let addrs = blk[8..8 + HDRADDRS as usize * 8]
            .chunks_exact(8)
            .map(LittleEndian::read_u64)
            .collect();
        Self { end, addrs }
    }
}

/// Contents of the marker block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    /// Oldest position not yet installed.
    pub start: LogPosition,
}

impl Marker {
    pub fn encode(&self) -> Box<Block> {
        let mut blk = zero_block();
        LittleEndian::write_u64(&mut blk[0..8], self.start.0);
        blk
    }

    pub fn decode(blk: &Block) -> Self {
        Self {
            start: LogPosition(LittleEndian::read_u64(&blk[0..8])),
        }
    }
}
