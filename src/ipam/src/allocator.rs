use sha2::{Digest, Sha256};

use super::error::Error;

const WORD_BITS: u32 = u64::BITS;

/// Dense bitmap allocator handing out 32-bit ids.
///
/// The backing store starts with a single 64 bit word and doubles on demand
/// until it covers `num_ids` ids. Slot 0 is reserved at construction and is
/// never handed out. The allocator is not synchronized; callers serialize
/// access themselves.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    blocks: Vec<u64>,
    num_ids: u32,
    max_blocks: usize,
}

impl IdAllocator {
    /// Panics unless `num_ids` is a non-zero multiple of 64.
    pub fn new(num_ids: u32) -> IdAllocator {
        assert!(
            num_ids > 0 && num_ids % WORD_BITS == 0,
            "num_ids must be a non-zero multiple of {WORD_BITS}, got {num_ids}"
        );
        IdAllocator {
            blocks: vec![1],
            num_ids,
            max_blocks: (num_ids / WORD_BITS) as usize,
        }
    }

    pub fn num_ids(&self) -> u32 {
        self.num_ids
    }

    pub fn allocate(&mut self) -> Result<u32, Error> {
        let mut start = 0;
        loop {
            let found = self.blocks[start..]
                .iter()
                .position(|b| *b != u64::MAX)
                .map(|p| p + start);
            if let Some(i) = found {
                let bit = self.blocks[i].trailing_ones();
                self.blocks[i] |= 1 << bit;
                return Ok(i as u32 * WORD_BITS + bit);
            }
            start = self.blocks.len();
            if !self.grow(start * 2) {
                return Err(Error::IdsExhausted);
            }
        }
    }

    /// Places an id at a position derived from `digest`.
    ///
    /// The first probe is the big-endian value of the first four bytes modulo
    /// `num_ids`, so the same digest always starts at the same slot. Taken
    /// slots are skipped by linear probing.
    pub fn allocate_with_hash(&mut self, digest: &[u8; 32]) -> Result<u32, Error> {
        let initial = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % self.num_ids;
        for i in 0..self.num_ids {
            let id = ((initial as u64 + i as u64) % self.num_ids as u64) as u32;
            self.cover(id);
            let (block, mask) = locate(id);
            if self.blocks[block] & mask == 0 {
                self.blocks[block] |= mask;
                return Ok(id);
            }
        }
        Err(Error::IdsExhausted)
    }

    /// Marks a specific id as allocated. Returns whether the bit was clear.
    /// Used to rebuild state from objects stored in the cluster.
    pub fn allocate_at(&mut self, id: u32) -> Result<bool, Error> {
        if id >= self.num_ids {
            return Err(Error::OutOfRange(id));
        }
        self.cover(id);
        let (block, mask) = locate(id);
        let was_clear = self.blocks[block] & mask == 0;
        self.blocks[block] |= mask;
        Ok(was_clear)
    }

    pub fn is_allocated(&self, id: u32) -> bool {
        let (block, mask) = locate(id);
        id < self.num_ids && block < self.blocks.len() && self.blocks[block] & mask != 0
    }

    /// Panics when `id` is out of range. Freeing a clear bit is a no-op and
    /// slot 0 stays reserved.
    pub fn free(&mut self, id: u32) {
        assert!(
            id < self.num_ids,
            "id {id} is out of range for an allocator of {} ids",
            self.num_ids
        );
        if id == 0 {
            return;
        }
        let (block, mask) = locate(id);
        if let Some(b) = self.blocks.get_mut(block) {
            *b &= !mask;
        }
    }

    fn cover(&mut self, id: u32) {
        let (block, _) = locate(id);
        let mut want = self.blocks.len();
        while want <= block {
            want *= 2;
        }
        self.grow(want);
    }

    fn grow(&mut self, want: usize) -> bool {
        let target = want.min(self.max_blocks);
        if target <= self.blocks.len() {
            return false;
        }
        self.blocks.resize(target, 0);
        true
    }
}

fn locate(id: u32) -> (usize, u64) {
    ((id / WORD_BITS) as usize, 1 << (id % WORD_BITS))
}

pub fn digest(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashSet;

    fn digest_at(initial: u32) -> [u8; 32] {
        let mut d = [0u8; 32];
        d[..4].copy_from_slice(&initial.to_be_bytes());
        d
    }

    // not counting the reserved slot
    fn live(alloc: &IdAllocator) -> u32 {
        alloc.blocks.iter().map(|b| b.count_ones()).sum::<u32>() - 1
    }

    #[rstest(num_ids, case(64), case(128), case(65536))]
    fn works_new(num_ids: u32) {
        let alloc = IdAllocator::new(num_ids);
        assert_eq!(alloc.blocks.len(), 1);
        assert_eq!(alloc.max_blocks, (num_ids / 64) as usize);
        assert!(alloc.is_allocated(0));
        assert_eq!(live(&alloc), 0);
    }

    #[test]
    #[should_panic]
    fn fail_new_zero() {
        IdAllocator::new(0);
    }

    #[test]
    #[should_panic]
    fn fail_new_not_multiple_of_word() {
        IdAllocator::new(127);
    }

    #[rstest(num_ids, case(64), case(128), case(320))]
    fn works_allocate_until_exhausted(num_ids: u32) {
        let mut alloc = IdAllocator::new(num_ids);
        let mut seen = HashSet::new();
        for expected in 1..num_ids {
            let id = alloc.allocate().unwrap();
            assert_eq!(id, expected);
            assert!(seen.insert(id));
        }
        assert_eq!(alloc.allocate(), Err(Error::IdsExhausted));
        assert_eq!(alloc.blocks.len(), alloc.max_blocks);
    }

    #[test]
    fn works_allocate_grows_by_doubling() {
        let mut alloc = IdAllocator::new(512);
        for _ in 0..63 {
            alloc.allocate().unwrap();
        }
        assert_eq!(alloc.blocks.len(), 1);
        assert_eq!(alloc.allocate().unwrap(), 64);
        assert_eq!(alloc.blocks.len(), 2);
        for _ in 0..64 {
            alloc.allocate().unwrap();
        }
        assert_eq!(alloc.blocks.len(), 4);
    }

    #[test]
    fn works_free_and_reuse() {
        let mut alloc = IdAllocator::new(128);
        for _ in 0..10 {
            alloc.allocate().unwrap();
        }
        alloc.free(5);
        assert!(!alloc.is_allocated(5));
        assert_eq!(alloc.allocate().unwrap(), 5);
        assert_eq!(alloc.allocate().unwrap(), 11);

        // idempotent
        alloc.free(7);
        alloc.free(7);
        assert_eq!(live(&alloc), 10);

        // never materialized
        alloc.free(100);
        assert_eq!(alloc.blocks.len(), 1);
    }

    #[test]
    fn works_free_keeps_reserved_slot() {
        let mut alloc = IdAllocator::new(64);
        alloc.free(0);
        assert_eq!(alloc.allocate().unwrap(), 1);
    }

    #[test]
    #[should_panic]
    fn fail_free_out_of_range() {
        let mut alloc = IdAllocator::new(64);
        alloc.free(64);
    }

    #[test]
    fn works_allocate_with_hash_is_stable() {
        let d = digest("default/svc-1");
        let mut a = IdAllocator::new(1024);
        let mut b = IdAllocator::new(1024);
        assert_eq!(a.allocate_with_hash(&d), b.allocate_with_hash(&d));
        assert_eq!(d, digest("default/svc-1"));
    }

    #[rstest(
        num_ids,
        initial,
        taken,
        expected,
        case(128, 10, vec![], 10),
        case(128, 10, vec![10], 11),
        case(128, 10, vec![10, 11, 12], 13),
        case(128, 138, vec![], 10),
        case(128, 127, vec![127], 1),
        case(128, 0, vec![], 1),
        case(1024, 700, vec![], 700),
    )]
    fn works_allocate_with_hash_probe(num_ids: u32, initial: u32, taken: Vec<u32>, expected: u32) {
        let mut alloc = IdAllocator::new(num_ids);
        for t in taken.iter() {
            alloc.allocate_at(*t).unwrap();
        }
        assert_eq!(alloc.allocate_with_hash(&digest_at(initial)).unwrap(), expected);
        assert!(alloc.is_allocated(expected));
    }

    #[test]
    fn fail_allocate_with_hash_exhausted() {
        let mut alloc = IdAllocator::new(64);
        for _ in 1..64 {
            alloc.allocate().unwrap();
        }
        assert_eq!(
            alloc.allocate_with_hash(&digest_at(3)),
            Err(Error::IdsExhausted)
        );
    }

    #[rstest(
        id,
        expected,
        case(1, Ok(true)),
        case(0, Ok(false)),
        case(1000, Ok(true)),
        case(1024, Err(Error::OutOfRange(1024))),
    )]
    fn works_allocate_at(id: u32, expected: Result<bool, Error>) {
        let mut alloc = IdAllocator::new(1024);
        assert_eq!(alloc.allocate_at(id), expected);
    }
}
