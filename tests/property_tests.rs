use blockjournal::storage::disk::{BLOCK_SIZE, NBITBLOCK};
use blockjournal::storage::wal::WalConfig;
use blockjournal::{Addr, EngineConfig, MemDisk, TxnManager};
use proptest::prelude::*;
use std::sync::Arc;

const HOME: u64 = 10;
const NBLOCKS: u64 = 3;

#[derive(Debug, Clone)]
struct Write {
    block: u64,
    bit_offset: u64,
    bit_length: u64,
    seed: u8,
}

impl Write {
    fn addr(&self) -> Addr {
        Addr::new(HOME + self.block, self.bit_offset, self.bit_length)
    }

    fn payload(&self) -> Vec<u8> {
        let len = self.bit_length.div_ceil(8) as usize;
        (0..len)
            .map(|i| self.seed.wrapping_mul(31).wrapping_add(i as u8))
            .collect()
    }
}

fn arb_write() -> impl Strategy<Value = Write> {
    (0..NBLOCKS, 0..NBITBLOCK - 1, 1u64..96, any::<u8>()).prop_map(
        |(block, bit_offset, len, seed)| Write {
            block,
            bit_offset,
            bit_length: len.min(NBITBLOCK - bit_offset),
            seed,
        },
    )
}

/// Applies `w` to the model the way a committed buffer lands in its block.
fn apply(model: &mut [Vec<u8>], w: &Write) {
    let payload = w.payload();
    let blk = &mut model[w.block as usize];
    for i in 0..w.bit_length {
        let bit = (payload[(i / 8) as usize] >> (i % 8)) & 1;
        let pos = w.bit_offset + i;
        let byte = &mut blk[(pos / 8) as usize];
        *byte = (*byte & !(1 << (pos % 8))) | (bit << (pos % 8));
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        wal: WalConfig { log_capacity: 4 },
        cache_capacity: 2,
        lock_shards: 5,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_committed_writes_survive_crash(
        txns in prop::collection::vec(
            (prop::collection::vec(arb_write(), 1..5), any::<bool>()),
            1..12,
        )
    ) {
        let disk = Arc::new(MemDisk::new(HOME + NBLOCKS));
        let manager = TxnManager::format(disk.clone(), config()).unwrap();
        let mut model = vec![vec![0u8; BLOCK_SIZE]; NBLOCKS as usize];

        for (writes, wait) in &txns {
            // One buffer per address: a later write to the same address in
            // the same transaction replaces the earlier one.
            let mut txn = manager.begin();
            let mut staged: Vec<&Write> = Vec::new();
            for w in writes {
                txn.overwrite(w.addr(), &w.payload());
                staged.retain(|s| s.addr() != w.addr());
                staged.push(w);
            }
            txn.commit(*wait).unwrap();
            // Buffers are installed per block in address order.
            staged.sort_by_key(|w| w.addr());
            for w in staged {
                apply(&mut model, w);
            }
        }
        manager.flush().unwrap();

        let recovered = TxnManager::open(Arc::new(disk.crash_image()), config()).unwrap();
        let mut txn = recovered.begin();
        for b in 0..NBLOCKS {
            let data = txn.read(Addr::block_addr(HOME + b)).unwrap();
            prop_assert_eq!(&data, &model[b as usize], "block {}", HOME + b);
        }
    }
}
