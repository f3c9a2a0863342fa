//! Physical-media abstraction consumed by the translation layer.
//!
//! A [`Media`] owns the per-LUN pool of erased blocks and performs page
//! program/read and block erase. Physical page addresses are linear over the
//! LUNs assigned to the target: `(lun * blocks_per_lun + block) * pages_per_block + page`.
//!
//! [`MemMedia`] keeps every page in memory. It enforces program-once
//! semantics (a page must be erased before it is written again) and can inject
//! read, write and erase failures.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use num_integer::Integer;
use parking_lot::Mutex;

use crate::config::{BlockId, Geometry, LunId, Ppa};
use crate::error::MediaError;

pub trait Media: Send + Sync {
    fn geometry(&self) -> Geometry;

    /// Takes an erased block out of the LUN's free pool.
    fn allocate_block(&self, lun: LunId) -> Option<BlockId>;

    /// Marks a specific block as in use, returning false if it was not free.
    /// Used when blocks already hold data imported at mount.
    fn claim_block(&self, lun: LunId, block: BlockId) -> bool;

    fn free_block(&self, lun: LunId, block: BlockId);

    fn nr_free_blocks(&self, lun: LunId) -> usize;

    fn erase_block(&self, lun: LunId, block: BlockId) -> Result<(), MediaError>;

    fn read_page(&self, ppa: Ppa) -> Result<Vec<u8>, MediaError>;

    fn write_page(&self, ppa: Ppa, data: &[u8]) -> Result<(), MediaError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStats {
    pub reads: u64,
    pub writes: u64,
    pub erases: u64,
}

#[derive(Default)]
struct Faults {
    reads: HashSet<Ppa>,
    writes: HashSet<Ppa>,
    erases: HashSet<(LunId, BlockId)>,
}

pub struct MemMedia {
    geometry: Geometry,
    free: Vec<Mutex<VecDeque<BlockId>>>,
    pages: Vec<Mutex<Option<Vec<u8>>>>,
    faults: Mutex<Faults>,
    reads: AtomicU64,
    writes: AtomicU64,
    erases: AtomicU64,
}

impl MemMedia {
    pub fn new(geometry: Geometry) -> Self {
        let free = (0..geometry.luns)
            .map(|_| Mutex::new((0..geometry.blocks_per_lun).collect()))
            .collect();
        let pages = (0..geometry.total_pages()).map(|_| Mutex::new(None)).collect();

        MemMedia {
            geometry,
            free,
            pages,
            faults: Mutex::new(Faults::default()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            erases: AtomicU64::new(0),
        }
    }

    /// Splits a physical address into `(lun, block, page)`.
    pub fn locate(&self, ppa: Ppa) -> (LunId, BlockId, usize) {
        let (seq, page) = ppa.div_rem(&self.geometry.pages_per_block);
        let (lun, block) = seq.div_rem(&self.geometry.blocks_per_lun);
        (lun, block, page)
    }

    fn page(&self, ppa: Ppa) -> Result<&Mutex<Option<Vec<u8>>>, MediaError> {
        self.pages.get(ppa).ok_or(MediaError::OutOfBounds(ppa))
    }

    /// Writes a page directly, bypassing fault injection. Used to seed media
    /// that accompanies an imported L2P table.
    pub fn program(&self, ppa: Ppa, data: &[u8]) -> Result<(), MediaError> {
        *self.page(ppa)?.lock() = Some(data.to_vec());
        Ok(())
    }

    pub fn fail_read(&self, ppa: Ppa) {
        self.faults.lock().reads.insert(ppa);
    }

    pub fn fail_write(&self, ppa: Ppa) {
        self.faults.lock().writes.insert(ppa);
    }

    pub fn fail_erase(&self, lun: LunId, block: BlockId) {
        self.faults.lock().erases.insert((lun, block));
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    pub fn is_programmed(&self, ppa: Ppa) -> bool {
        self.pages.get(ppa).map_or(false, |p| p.lock().is_some())
    }

    pub fn stats(&self) -> MediaStats {
        MediaStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            erases: self.erases.load(Ordering::Relaxed),
        }
    }
}

impl Media for MemMedia {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn allocate_block(&self, lun: LunId) -> Option<BlockId> {
        let block = self.free.get(lun)?.lock().pop_front();
        trace!("media: lun {} handed out block {:?}", lun, block);
        block
    }

    fn claim_block(&self, lun: LunId, block: BlockId) -> bool {
        let Some(free) = self.free.get(lun) else {
            return false;
        };
        let mut free = free.lock();
        match free.iter().position(|&b| b == block) {
            Some(pos) => {
                free.remove(pos);
                true
            }
            None => false,
        }
    }

    fn free_block(&self, lun: LunId, block: BlockId) {
        if let Some(free) = self.free.get(lun) {
            free.lock().push_back(block);
        }
    }

    fn nr_free_blocks(&self, lun: LunId) -> usize {
        self.free.get(lun).map_or(0, |f| f.lock().len())
    }

    fn erase_block(&self, lun: LunId, block: BlockId) -> Result<(), MediaError> {
        if self.faults.lock().erases.contains(&(lun, block)) {
            return Err(MediaError::Erase { lun, block });
        }
        let ppb = self.geometry.pages_per_block;
        let base = (lun * self.geometry.blocks_per_lun + block) * ppb;
        for ppa in base..base + ppb {
            *self.page(ppa)?.lock() = None;
        }
        self.erases.fetch_add(1, Ordering::Relaxed);
        debug!("media: erased block {} on lun {}", block, lun);
        Ok(())
    }

    fn read_page(&self, ppa: Ppa) -> Result<Vec<u8>, MediaError> {
        if self.faults.lock().reads.contains(&ppa) {
            return Err(MediaError::Read(ppa));
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        let page = self.page(ppa)?.lock();
        Ok(page
            .clone()
            .unwrap_or_else(|| vec![0xff; self.geometry.page_size]))
    }

    fn write_page(&self, ppa: Ppa, data: &[u8]) -> Result<(), MediaError> {
        if self.faults.lock().writes.contains(&ppa) {
            return Err(MediaError::Write(ppa));
        }
        let mut page = self.page(ppa)?.lock();
        if page.is_some() {
            return Err(MediaError::Overwrite(ppa));
        }
        *page = Some(data.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
