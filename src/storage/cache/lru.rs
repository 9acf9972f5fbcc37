use super::replacer::Replacer;
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub struct LruReplacer {
    /// Queue of evictable blocks (least recently released at front)
    lru_list: VecDeque<u64>,
    /// Blocks currently in `lru_list`, with their insertion stamp
    members: HashMap<u64, u64>,
    /// Stamp of the next unpin; entries in `lru_list` whose stamp no longer
    /// matches `members` are stale and skipped
    stamps: VecDeque<u64>,
    next_stamp: u64,
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            lru_list: VecDeque::with_capacity(max_size),
            members: HashMap::with_capacity(max_size),
            stamps: VecDeque::with_capacity(max_size),
            next_stamp: 0,
            max_size,
        }
    }

    fn compact(&mut self) {
        let members = &self.members;
        let mut kept_list = VecDeque::with_capacity(members.len());
        let mut kept_stamps = VecDeque::with_capacity(members.len());
        for (blkno, stamp) in self.lru_list.drain(..).zip(self.stamps.drain(..)) {
            if members.get(&blkno) == Some(&stamp) {
                kept_list.push_back(blkno);
                kept_stamps.push_back(stamp);
            }
        }
        self.lru_list = kept_list;
        self.stamps = kept_stamps;
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self) -> Option<u64> {
        while let (Some(blkno), Some(stamp)) = (self.lru_list.pop_front(), self.stamps.pop_front()) {
            if self.members.get(&blkno) == Some(&stamp) {
                self.members.remove(&blkno);
                return Some(blkno);
            }
        }
        None
    }

    fn pin(&mut self, blkno: u64) {
        // Lazy removal: the queue entry becomes stale
        self.members.remove(&blkno);
        if self.lru_list.len() > 2 * self.max_size.max(1) {
            self.compact();
        }
    }

    fn unpin(&mut self, blkno: u64) {
        if self.members.contains_key(&blkno) || self.members.len() >= self.max_size {
            return;
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.members.insert(blkno, stamp);
        self.lru_list.push_back(blkno);
        self.stamps.push_back(stamp);
    }

    fn size(&self) -> usize {
        self.members.len()
    }
}
