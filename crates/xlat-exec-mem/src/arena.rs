use crate::bitmap::SubBlockBitmap;

/// One OS mapping carved into `granularity`-sized sub-blocks.
#[derive(Debug)]
pub(crate) struct Arena {
    base: usize,
    size: usize,
    granularity: usize,
    map: SubBlockBitmap,
}

impl Arena {
    pub(crate) fn new(base: usize, size: usize, granularity: usize) -> Self {
        Self {
            base,
            size,
            granularity,
            map: SubBlockBitmap::new(size / granularity),
        }
    }

    pub(crate) fn base(&self) -> usize {
        self.base
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn used_sub_blocks(&self) -> usize {
        self.map.count_set()
    }

    pub(crate) fn is_sub_block_used(&self, idx: usize) -> bool {
        self.map.is_set(idx)
    }

    /// Whether `[addr, addr + blocks * granularity)` lies inside this arena.
    pub(crate) fn contains(&self, addr: usize, blocks: usize) -> bool {
        let Some(len) = blocks.checked_mul(self.granularity) else {
            return false;
        };
        addr >= self.base
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.base + self.size)
    }

    pub(crate) fn try_alloc(&mut self, blocks: usize) -> Option<usize> {
        let start = self.map.find_free_run(blocks)?;
        self.map.set_run(start, blocks);
        Some(self.base + start * self.granularity)
    }

    /// Clears the run starting at `addr`. Returns `false` for an address that is not on a
    /// sub-block boundary.
    pub(crate) fn release(&mut self, addr: usize, blocks: usize) -> bool {
        let offset = addr - self.base;
        if offset % self.granularity != 0 {
            return false;
        }
        let start = offset / self.granularity;
        let run = blocks.min(self.map.len() - start);
        self.map.clear_run(start, run);
        true
    }
}
