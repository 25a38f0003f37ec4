use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::region::RegionBlockList;

struct Leaf {
    slots: Box<[AtomicPtr<RegionBlockList>]>,
}

impl Leaf {
    fn new(len: usize) -> Box<Self> {
        Box::new(Self {
            slots: (0..len).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        })
    }
}

/// Two-level slice-index table.
///
/// Readers walk it with acquire loads only. Writers (leaf creation, slot publication and
/// retirement) must hold the owning map's structural lock. The table owns its leaves; the lists
/// behind slot pointers are owned by the map.
pub(crate) struct SliceTable {
    leaf_bits: u32,
    root: Box<[AtomicPtr<Leaf>]>,
}

impl SliceTable {
    /// Builds a table for `index_bits`-bit slice indices.
    ///
    /// Small index spaces get a single eagerly-allocated leaf; larger ones split the index roughly
    /// in half and allocate leaves on first use.
    pub(crate) fn new(index_bits: u32) -> Self {
        let leaf_bits = index_bits.min(index_bits.div_ceil(2).max(16));
        let root_len = 1usize << (index_bits - leaf_bits);
        let root: Box<[AtomicPtr<Leaf>]> =
            (0..root_len).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        if root_len == 1 {
            root[0].store(Box::into_raw(Leaf::new(1 << leaf_bits)), Ordering::Release);
        }
        Self { leaf_bits, root }
    }

    #[inline]
    fn split(&self, index: u64) -> (usize, usize) {
        let hi = (index >> self.leaf_bits) as usize;
        let lo = (index & ((1u64 << self.leaf_bits) - 1)) as usize;
        (hi, lo)
    }

    /// Lock-free load of the list published for `index`.
    #[inline]
    pub(crate) fn get(&self, index: u64) -> *mut RegionBlockList {
        let (hi, lo) = self.split(index);
        let Some(root) = self.root.get(hi) else {
            return ptr::null_mut();
        };
        let leaf = root.load(Ordering::Acquire);
        if leaf.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: leaves are never freed before the table is dropped.
        unsafe { (*leaf).slots[lo].load(Ordering::Acquire) }
    }

    /// Slot for `index`, creating its leaf if needed. Structural lock required.
    fn slot(&self, index: u64) -> &AtomicPtr<RegionBlockList> {
        let (hi, lo) = self.split(index);
        let root = &self.root[hi];
        let mut leaf = root.load(Ordering::Acquire);
        if leaf.is_null() {
            leaf = Box::into_raw(Leaf::new(1 << self.leaf_bits));
            root.store(leaf, Ordering::Release);
        }
        // SAFETY: as in `get`.
        unsafe { &(*leaf).slots[lo] }
    }

    /// Publishes `list` at `index`. Structural lock required; the slot must be empty.
    pub(crate) fn publish(&self, index: u64, list: *mut RegionBlockList) {
        let slot = self.slot(index);
        debug_assert!(slot.load(Ordering::Relaxed).is_null());
        slot.store(list, Ordering::Release);
    }

    /// Detaches and returns the list at `index`. Structural lock required.
    pub(crate) fn take(&self, index: u64) -> *mut RegionBlockList {
        let (hi, lo) = self.split(index);
        let Some(root) = self.root.get(hi) else {
            return ptr::null_mut();
        };
        let leaf = root.load(Ordering::Acquire);
        if leaf.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: as in `get`.
        unsafe { (*leaf).slots[lo].swap(ptr::null_mut(), Ordering::AcqRel) }
    }

    /// Calls `f` with every published list and its index, in index order.
    pub(crate) fn for_each_present(&self, mut f: impl FnMut(u64, *mut RegionBlockList)) {
        for (hi, root) in self.root.iter().enumerate() {
            let leaf = root.load(Ordering::Acquire);
            if leaf.is_null() {
                continue;
            }
            // SAFETY: as in `get`.
            let slots = unsafe { &(*leaf).slots };
            for (lo, slot) in slots.iter().enumerate() {
                let list = slot.load(Ordering::Acquire);
                if !list.is_null() {
                    f(((hi as u64) << self.leaf_bits) | lo as u64, list);
                }
            }
        }
    }
}

impl Drop for SliceTable {
    fn drop(&mut self) {
        for root in self.root.iter() {
            let leaf = root.swap(ptr::null_mut(), Ordering::AcqRel);
            if !leaf.is_null() {
                // SAFETY: leaves are created by `Box::into_raw` and only freed here.
                drop(unsafe { Box::from_raw(leaf) });
            }
        }
    }
}
