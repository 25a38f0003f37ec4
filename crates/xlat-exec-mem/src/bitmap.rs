/// One bit per sub-block: set = allocated.
#[derive(Debug, Clone)]
pub(crate) struct SubBlockBitmap {
    words: Box<[u64]>,
    len: usize,
}

impl SubBlockBitmap {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(64)].into_boxed_slice(),
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_set(&self, idx: usize) -> bool {
        idx < self.len && self.words[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    pub(crate) fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub(crate) fn set_run(&mut self, start: usize, run: usize) {
        debug_assert!(start + run <= self.len);
        for idx in start..start + run {
            self.words[idx / 64] |= 1u64 << (idx % 64);
        }
    }

    pub(crate) fn clear_run(&mut self, start: usize, run: usize) {
        debug_assert!(start + run <= self.len);
        for idx in start..start + run {
            self.words[idx / 64] &= !(1u64 << (idx % 64));
        }
    }

    /// Lowest index starting a run of at least `run` clear bits (first fit).
    ///
    /// Adjacent freed runs merge naturally here; there is no separate coalescing pass.
    pub(crate) fn find_free_run(&self, run: usize) -> Option<usize> {
        if run == 0 || run > self.len {
            return None;
        }
        let mut start = 0;
        let mut idx = 0;
        while idx < self.len {
            let word = self.words[idx / 64];
            if idx % 64 == 0 && word == u64::MAX {
                idx += 64;
                start = idx;
                continue;
            }
            if word & (1u64 << (idx % 64)) != 0 {
                idx += 1;
                start = idx;
                continue;
            }
            idx += 1;
            if idx - start >= run {
                return Some(start);
            }
        }
        None
    }
}
