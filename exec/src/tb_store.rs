use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::RwLock;
use smtcg_core::tb::{TranslationBlock, TB_HASH_SIZE};

/// Outcome of publishing a TB.
#[derive(Debug)]
pub enum TbInsert {
    /// Published under this index.
    Inserted(usize),
    /// A live TB with the same key was already published; the offered
    /// one is handed back unpublished.
    Existing(usize, TranslationBlock),
    /// The slab is full; the caller must flush.
    Full(TranslationBlock),
}

/// Thread-safe storage and hash-table lookup for TBs.
///
/// TBs live in a fixed slab of heap slots addressed by index. Slots are
/// published with a Release store and never change until [`flush`],
/// so readers get plain `&TranslationBlock`s without locking. The hash
/// table is a read-mostly `RwLock` over bucket lists.
///
/// [`flush`]: TbStore::flush
pub struct TbStore {
    slots: Box<[AtomicPtr<TranslationBlock>]>,
    len: AtomicUsize,
    hash: RwLock<Box<[Vec<usize>]>>,
}

impl TbStore {
    pub fn new(max_tbs: usize) -> Self {
        Self {
            slots: (0..max_tbs).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            len: AtomicUsize::new(0),
            hash: RwLock::new(vec![Vec::new(); TB_HASH_SIZE].into_boxed_slice()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Get a shared reference to a TB by index.
    ///
    /// Panics on an index that was never published since the last
    /// flush: holding one means a flush raced with its user.
    pub fn get(&self, idx: usize) -> &TranslationBlock {
        let p = self.slots[idx].load(Ordering::Acquire);
        assert!(!p.is_null(), "stale TB index {idx}");
        // SAFETY: non-null slots point to boxed TBs that stay alive
        // until `flush`, which requires every reader to be quiescent.
        unsafe { &*p }
    }

    /// Lookup a valid TB by key in the hash table.
    pub fn lookup(&self, pc: u64, flags: u32, cflags: u32) -> Option<usize> {
        let hash = self.hash.read();
        hash[TranslationBlock::hash(pc, flags, cflags)]
            .iter()
            .copied()
            .find(|&idx| self.get(idx).matches(pc, flags, cflags))
    }

    /// Publish `tb` unless a live TB with the same key exists.
    ///
    /// The duplicate check and the publication happen under the hash
    /// write lock, so at most one TB per key is ever reachable.
    pub fn insert(&self, tb: TranslationBlock) -> TbInsert {
        let bucket = TranslationBlock::hash(tb.pc, tb.flags, tb.cflags);
        let mut hash = self.hash.write();
        if let Some(&idx) = hash[bucket]
            .iter()
            .find(|&&idx| self.get(idx).matches(tb.pc, tb.flags, tb.cflags))
        {
            return TbInsert::Existing(idx, tb);
        }
        let idx = self.len.load(Ordering::Relaxed);
        if idx >= self.slots.len() {
            return TbInsert::Full(tb);
        }
        self.slots[idx].store(Box::into_raw(Box::new(tb)), Ordering::Release);
        self.len.store(idx + 1, Ordering::Release);
        hash[bucket].push(idx);
        TbInsert::Inserted(idx)
    }

    /// Remove a TB from its hash chain. The slot stays allocated.
    pub fn remove(&self, idx: usize) {
        let tb = self.get(idx);
        let bucket = TranslationBlock::hash(tb.pc, tb.flags, tb.cflags);
        self.hash.write()[bucket].retain(|&i| i != idx);
    }

    /// Drop every TB and clear the hash table.
    ///
    /// # Safety
    /// No reference obtained from [`get`](TbStore::get) may be alive,
    /// and no other thread may use the store concurrently. Callers
    /// hold an exclusive section.
    pub unsafe fn flush(&self) {
        let mut hash = self.hash.write();
        hash.iter_mut().for_each(Vec::clear);
        let len = self.len.swap(0, Ordering::AcqRel);
        for slot in &self.slots[..len] {
            let p = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                drop(Box::from_raw(p));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of every published TB.
    pub fn indices(&self) -> std::ops::Range<usize> {
        0..self.len()
    }
}

impl Drop for TbStore {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out outstanding references.
        unsafe { self.flush() }
    }
}
