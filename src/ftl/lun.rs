use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use num_integer::Integer;
use parking_lot::{Mutex, MutexGuard};

use crate::bitmap::InvalidBitmap;
use crate::config::{BlockId, Counter, Geometry, LunId, Ppa};

/// Non-owning handle to a block: the LUN it lives in and its index in that
/// LUN's block array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub lun: LunId,
    pub index: BlockId,
}

/// Mutable page bookkeeping of a block, guarded by the block lock.
#[derive(Debug)]
pub(crate) struct BlockState {
    pub(crate) invalid_pages: InvalidBitmap,
    /// Next writable page within the block.
    pub(crate) next_page: usize,
    pub(crate) nr_invalid_pages: Counter,
}

#[derive(Debug)]
pub struct Block {
    id: BlockRef,
    /// Position of the block in the target's linear physical space.
    seq: usize,
    pages: usize,
    state: Mutex<BlockState>,
    /// Pages durably written.
    committed: AtomicUsize,
}

/// Point-in-time copy of a block's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub next_page: usize,
    pub nr_invalid_pages: Counter,
    pub invalid_bits: Counter,
    pub committed: Counter,
}

impl Block {
    fn new(id: BlockRef, seq: usize, pages: usize) -> Self {
        Block {
            id,
            seq,
            pages,
            state: Mutex::new(BlockState {
                invalid_pages: InvalidBitmap::new(pages),
                next_page: 0,
                nr_invalid_pages: 0,
            }),
            committed: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> BlockRef {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.pages
    }

    pub fn base_ppa(&self) -> Ppa {
        self.seq * self.pages
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BlockState> {
        self.state.lock()
    }

    /// Hands out the next page of the block, or `None` once it is full.
    pub(crate) fn alloc_addr(&self) -> Option<Ppa> {
        let mut state = self.state.lock();
        if state.next_page == self.pages {
            return None;
        }
        let ppa = self.base_ppa() + state.next_page;
        state.next_page += 1;
        Some(ppa)
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().next_page == self.pages
    }

    /// Marks the page at `offset` invalid. Returns false, leaving the counters
    /// untouched, when it already was.
    pub(crate) fn invalidate(state: &mut BlockState, offset: usize) -> bool {
        if state.invalid_pages.test_and_set(offset) {
            return false;
        }
        state.nr_invalid_pages += 1;
        true
    }

    /// Counts one more committed page; true when that completes the block.
    pub(crate) fn commit_page(&self) -> bool {
        self.committed.fetch_add(1, Ordering::AcqRel) + 1 == self.pages
    }

    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        state.invalid_pages.clear();
        state.next_page = 0;
        state.nr_invalid_pages = 0;
        self.committed.store(0, Ordering::Release);
    }

    /// Treats the block as fully written. Only used when adopting blocks
    /// populated before mount.
    pub(crate) fn mark_written(&self) {
        self.state.lock().next_page = self.pages;
        self.committed.store(self.pages, Ordering::Release);
    }

    pub fn nr_invalid_pages(&self) -> Counter {
        self.state.lock().nr_invalid_pages
    }

    pub fn info(&self) -> BlockInfo {
        let state = self.state.lock();
        BlockInfo {
            next_page: state.next_page,
            nr_invalid_pages: state.nr_invalid_pages,
            invalid_bits: state.invalid_pages.count_ones(),
            committed: self.committed.load(Ordering::Acquire),
        }
    }
}

/// Allocation pointers and GC candidates of a LUN, guarded by the LUN lock.
#[derive(Debug, Default)]
pub(crate) struct LunState {
    /// Open block serving regular writes.
    pub(crate) cur: Option<BlockId>,
    /// Open block reserved for GC writes.
    pub(crate) gc_cur: Option<BlockId>,
    /// Full blocks that may be reclaimed, in the order they filled up.
    pub(crate) victims: Vec<BlockId>,
}

#[derive(Debug)]
pub struct Lun {
    id: LunId,
    blocks: Vec<Block>,
    nr_free_blocks: AtomicUsize,
    state: Mutex<LunState>,
    gc_pending: AtomicBool,
}

impl Lun {
    pub(crate) fn new(id: LunId, geometry: &Geometry) -> Self {
        let blocks = (0..geometry.blocks_per_lun)
            .map(|index| {
                Block::new(
                    BlockRef { lun: id, index },
                    id * geometry.blocks_per_lun + index,
                    geometry.pages_per_block,
                )
            })
            .collect();

        Lun {
            id,
            blocks,
            nr_free_blocks: AtomicUsize::new(0),
            state: Mutex::new(LunState::default()),
            gc_pending: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> LunId {
        self.id
    }

    pub fn block(&self, index: BlockId) -> &Block {
        &self.blocks[index]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Free blocks in the LUN; an unsynchronised estimate.
    pub fn nr_free_blocks(&self) -> usize {
        self.nr_free_blocks.load(Ordering::Relaxed)
    }

    pub(crate) fn set_free_blocks(&self, n: usize) {
        self.nr_free_blocks.store(n, Ordering::Relaxed);
    }

    pub(crate) fn took_free_block(&self) {
        self.nr_free_blocks.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn returned_free_block(&self) {
        self.nr_free_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LunState> {
        self.state.lock()
    }

    /// Queues a full block as a GC candidate.
    pub(crate) fn push_victim(&self, index: BlockId) {
        self.state.lock().victims.push(index);
    }

    /// Drops `index` from the candidate list; false if it was not queued.
    pub(crate) fn remove_victim(&self, index: BlockId) -> bool {
        let mut state = self.state.lock();
        let before = state.victims.len();
        state.victims.retain(|&b| b != index);
        state.victims.len() != before
    }

    pub fn victims(&self) -> Vec<BlockRef> {
        self.state
            .lock()
            .victims
            .iter()
            .map(|&index| BlockRef { lun: self.id, index })
            .collect()
    }

    pub fn current(&self) -> Option<BlockRef> {
        self.state.lock().cur.map(|index| BlockRef { lun: self.id, index })
    }

    pub fn gc_reserve(&self) -> Option<BlockRef> {
        self.state.lock().gc_cur.map(|index| BlockRef { lun: self.id, index })
    }

    /// Claims the pending-evaluation flag; false if an evaluation is already queued.
    pub(crate) fn mark_gc_pending(&self) -> bool {
        !self.gc_pending.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_gc_pending(&self) {
        self.gc_pending.store(false, Ordering::Release);
    }
}

/// Every LUN owned by the target, addressed by `BlockRef` or physical address.
#[derive(Debug)]
pub struct Luns {
    luns: Vec<Lun>,
    blocks_per_lun: usize,
    pages_per_block: usize,
}

impl Luns {
    pub(crate) fn new(geometry: &Geometry) -> Self {
        Luns {
            luns: (0..geometry.luns).map(|id| Lun::new(id, geometry)).collect(),
            blocks_per_lun: geometry.blocks_per_lun,
            pages_per_block: geometry.pages_per_block,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.luns.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lun> {
        self.luns.iter()
    }

    pub fn lun(&self, id: LunId) -> &Lun {
        &self.luns[id]
    }

    pub fn block(&self, r: BlockRef) -> &Block {
        self.luns[r.lun].block(r.index)
    }

    /// Resolves a physical address to its block and in-block page offset.
    pub fn locate(&self, ppa: Ppa) -> (BlockRef, usize) {
        let (seq, offset) = ppa.div_rem(&self.pages_per_block);
        let (lun, index) = seq.div_rem(&self.blocks_per_lun);
        (BlockRef { lun, index }, offset)
    }
}
