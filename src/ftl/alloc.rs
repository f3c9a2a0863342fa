use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};

use crate::config::{BlockId, Ppa};
use crate::error::{FtlError, Result};
use crate::ftl::lun::{BlockRef, Lun, LunState, Luns};
use crate::media::Media;

/// Round-robin page allocator over the target's LUNs.
pub struct Allocator {
    luns: Luns,
    media: Arc<dyn Media>,
    next_lun: AtomicUsize,
    /// Free blocks a LUN keeps back from regular writes.
    reserve: usize,
}

impl Allocator {
    pub fn new(luns: Luns, media: Arc<dyn Media>, reserve: usize) -> Self {
        Allocator {
            luns,
            media,
            next_lun: AtomicUsize::new(0),
            reserve,
        }
    }

    pub fn luns(&self) -> &Luns {
        &self.luns
    }

    pub fn reserve(&self) -> usize {
        self.reserve
    }

    /// Regular writes rotate over the LUNs. GC writes go to the LUN with the
    /// most free blocks, read without locking, so migration does not drain a
    /// LUN that is already short on space.
    pub fn pick_lun(&self, is_gc: bool) -> &Lun {
        if !is_gc {
            let next = self.next_lun.fetch_add(1, Ordering::Relaxed);
            return self.luns.lun(next % self.luns.len());
        }

        let mut max_free = self.luns.lun(0);
        for lun in self.luns.iter() {
            if lun.nr_free_blocks() > max_free.nr_free_blocks() {
                max_free = lun;
            }
        }
        max_free
    }

    /// Takes an erased block from the media and resets its bookkeeping.
    pub(crate) fn get_blk(&self, lun: &Lun) -> Option<BlockId> {
        let index = self.media.allocate_block(lun.id())?;
        lun.block(index).reset();
        lun.took_free_block();
        debug!("lun {}: took block {} ({} free)", lun.id(), index, lun.nr_free_blocks());
        Some(index)
    }

    pub(crate) fn put_blk(&self, lun: &Lun, index: BlockId) {
        self.media.free_block(lun.id(), index);
        lun.returned_free_block();
        debug!("lun {}: returned block {} ({} free)", lun.id(), index, lun.nr_free_blocks());
    }

    fn set_lun_cur(lun: &Lun, state: &mut LunState, index: BlockId) {
        if let Some(cur) = state.cur {
            if !lun.block(cur).is_full() {
                warn!("lun {}: replacing block {} before it filled up", lun.id(), cur);
            }
        }
        state.cur = Some(index);
    }

    /// Gives every LUN its first open block and its GC reserve block.
    pub(crate) fn configure(&self) -> Result<()> {
        for lun in self.luns.iter() {
            let mut state = lun.lock();
            let cur = self
                .get_blk(lun)
                .ok_or(FtlError::OutOfSpace { lun: lun.id() })?;
            Self::set_lun_cur(lun, &mut state, cur);

            let gc_cur = self
                .get_blk(lun)
                .ok_or(FtlError::OutOfSpace { lun: lun.id() })?;
            state.gc_cur = Some(gc_cur);
        }
        Ok(())
    }

    /// Allocates the next physical page on `lun`.
    ///
    /// Regular writes are refused while the LUN is below its reserve. GC
    /// writes may fall back to the LUN's GC reserve block once the free pool
    /// is empty.
    pub fn alloc_page(&self, lun: &Lun, is_gc: bool) -> Result<(Ppa, BlockRef)> {
        if !is_gc && lun.nr_free_blocks() < self.reserve {
            return Err(FtlError::OutOfSpace { lun: lun.id() });
        }

        let mut state = lun.lock();
        loop {
            if let Some(cur) = state.cur {
                if let Some(ppa) = lun.block(cur).alloc_addr() {
                    return Ok((ppa, BlockRef { lun: lun.id(), index: cur }));
                }
            }
            match self.get_blk(lun) {
                Some(index) => Self::set_lun_cur(lun, &mut state, index),
                None => break,
            }
        }

        if !is_gc {
            return Err(FtlError::OutOfSpace { lun: lun.id() });
        }

        // emergency path: the GC reserve block
        if let Some(gc_cur) = state.gc_cur {
            if let Some(ppa) = lun.block(gc_cur).alloc_addr() {
                return Ok((ppa, BlockRef { lun: lun.id(), index: gc_cur }));
            }
        }
        let Some(index) = self.get_blk(lun) else {
            error!("lun {}: no more blocks", lun.id());
            return Err(FtlError::OutOfSpace { lun: lun.id() });
        };
        state.gc_cur = Some(index);
        match lun.block(index).alloc_addr() {
            Some(ppa) => Ok((ppa, BlockRef { lun: lun.id(), index })),
            None => Err(FtlError::OutOfSpace { lun: lun.id() }),
        }
    }

    /// Drops `index` from the open-block roles of its LUN, so a block on its
    /// way back to the free pool is not written through a stale pointer.
    pub(crate) fn detach(&self, lun: &Lun, index: BlockId) {
        let mut state = lun.lock();
        if state.cur == Some(index) {
            state.cur = None;
        }
        if state.gc_cur == Some(index) {
            state.gc_cur = None;
        }
    }
}
