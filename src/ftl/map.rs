//! Forward (logical to physical) and reverse (physical to logical) tables.
//!
//! Both tables live behind one lock, the map-exclusivity section. Whenever a
//! physical page is invalidated its block lock is taken *inside* that section,
//! never the other way around; the allocator nests LUN lock -> block lock and
//! never touches the map while holding either.

use std::collections::HashMap;

use log::{trace, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::config::{Lpa, Ppa, L2P_EMPTY};
use crate::error::{FtlError, Result};
use crate::ftl::lun::{Block, BlockRef, Luns};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2PValue {
    Unmapped,
    Mapped { ppa: Ppa, block: BlockRef },
}

impl L2PValue {
    pub fn ppa(&self) -> Option<Ppa> {
        match self {
            L2PValue::Unmapped => None,
            L2PValue::Mapped { ppa, .. } => Some(*ppa),
        }
    }
}

/// One run of an imported logical-to-physical table: `entries[i]` is the
/// physical address of logical page `slba + i`, or `L2P_EMPTY`.
#[derive(Debug, Clone)]
pub struct L2pChunk {
    pub slba: Lpa,
    pub entries: Vec<u64>,
}

struct Tables {
    l2p: Vec<L2PValue>,
    p2l: Vec<Option<Lpa>>,
}

impl Tables {
    /// Invalidates the physical page `lpa` currently maps to, if any, and
    /// drops its reverse entry. The forward entry is left for the caller.
    fn page_invalidate(&mut self, luns: &Luns, lpa: Lpa) {
        if let L2PValue::Mapped { ppa, block } = self.l2p[lpa] {
            invalidate_page(luns, block, ppa);
            self.p2l[ppa] = None;
        }
    }

    fn map(&mut self, luns: &Luns, lpa: Lpa, ppa: Ppa, block: BlockRef) {
        self.page_invalidate(luns, lpa);
        self.l2p[lpa] = L2PValue::Mapped { ppa, block };
        self.p2l[ppa] = Some(lpa);
    }
}

fn invalidate_page(luns: &Luns, block: BlockRef, ppa: Ppa) {
    let blk = luns.block(block);
    let offset = ppa - blk.base_ppa();
    if !Block::invalidate(&mut blk.lock(), offset) {
        trace!("ppa {} already invalid in block {:?}", ppa, block);
    }
}

pub struct AddressMap {
    tables: Mutex<Tables>,
}

impl AddressMap {
    pub fn new(nr_lpas: usize, nr_ppas: usize) -> Self {
        AddressMap {
            tables: Mutex::new(Tables {
                l2p: vec![L2PValue::Unmapped; nr_lpas],
                p2l: vec![None; nr_ppas],
            }),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock()
    }

    pub fn nr_lpas(&self) -> usize {
        self.tables().l2p.len()
    }

    /// Forward entry of `lpa`; addresses past the map read as unmapped.
    pub fn lookup(&self, lpa: Lpa) -> L2PValue {
        self.tables().l2p.get(lpa).copied().unwrap_or(L2PValue::Unmapped)
    }

    /// Logical owner of a physical page, as GC sees it.
    pub fn reverse(&self, ppa: Ppa) -> Option<Lpa> {
        self.tables().p2l.get(ppa).copied().flatten()
    }

    /// Points `lpa` at `ppa`, invalidating whatever page it mapped before.
    pub fn update(&self, luns: &Luns, lpa: Lpa, ppa: Ppa, block: BlockRef) {
        trace!("map lpa {} -> ppa {}", lpa, ppa);
        self.tables().map(luns, lpa, ppa, block);
    }

    /// Moves `lpa` from `from` to `to` only if it still maps to `from`.
    ///
    /// When the mapping changed while the copy was in flight, the copy at `to`
    /// is invalidated instead and false is returned.
    pub fn relocate(&self, luns: &Luns, lpa: Lpa, from: Ppa, to: Ppa, block: BlockRef) -> bool {
        let mut tables = self.tables();
        if tables.l2p[lpa].ppa() == Some(from) {
            tables.map(luns, lpa, to, block);
            return true;
        }
        invalidate_page(luns, block, to);
        false
    }

    /// Drops the mapping of `lpa` to `ppa` after programming `ppa` failed.
    /// Returns false if `lpa` has moved on since.
    pub fn unmap_failed(&self, luns: &Luns, lpa: Lpa, ppa: Ppa) -> bool {
        let mut tables = self.tables();
        if tables.l2p[lpa].ppa() != Some(ppa) {
            return false;
        }
        tables.page_invalidate(luns, lpa);
        tables.l2p[lpa] = L2PValue::Unmapped;
        true
    }

    /// Invalidates a page that was allocated but never mapped.
    pub fn invalidate_orphan(&self, luns: &Luns, ppa: Ppa) {
        let _tables = self.tables();
        let (block, _) = luns.locate(ppa);
        invalidate_page(luns, block, ppa);
    }

    /// Unmaps `len` logical pages starting at `start` (discard).
    pub fn invalidate_range(&self, luns: &Luns, start: Lpa, len: usize) {
        let mut tables = self.tables();
        for lpa in start..start + len {
            tables.page_invalidate(luns, lpa);
            tables.l2p[lpa] = L2PValue::Unmapped;
        }
    }

    /// Loads one chunk of a bootstrap L2P table.
    pub fn import(&self, luns: &Luns, chunk: &L2pChunk) -> Result<()> {
        let mut tables = self.tables();
        let nr_lpas = tables.l2p.len();
        let nr_ppas = tables.p2l.len();

        let end = chunk.slba.checked_add(chunk.entries.len());
        if end.map_or(true, |end| end > nr_lpas) {
            return Err(FtlError::MapConsistency(format!(
                "L2P chunk at lpa {} with {} entries exceeds {} logical pages",
                chunk.slba,
                chunk.entries.len(),
                nr_lpas
            )));
        }

        for (i, &pba) in chunk.entries.iter().enumerate() {
            let lpa = chunk.slba + i;
            if pba == L2P_EMPTY {
                continue;
            }
            if pba >= nr_ppas as u64 {
                return Err(FtlError::L2pOutOfBounds {
                    lpa,
                    ppa: pba,
                    max: nr_ppas,
                });
            }
            let ppa = pba as Ppa;
            if let Some(owner) = tables.p2l[ppa] {
                if owner != lpa {
                    return Err(FtlError::MapConsistency(format!(
                        "ppa {} claimed by lpa {} and lpa {}",
                        ppa, owner, lpa
                    )));
                }
            }
            if let Some(old) = tables.l2p[lpa].ppa() {
                tables.p2l[old] = None;
            }
            let (block, _) = luns.locate(ppa);
            tables.l2p[lpa] = L2PValue::Mapped { ppa, block };
            tables.p2l[ppa] = Some(lpa);
        }
        Ok(())
    }

    /// Rebuilds block state from imported mappings.
    ///
    /// Every block holding at least one live page is treated as fully written:
    /// its other pages are marked invalid so the block can be reclaimed. Returns
    /// the adopted blocks.
    pub fn adopt_blocks(&self, luns: &Luns) -> Vec<BlockRef> {
        let mut tables = self.tables();
        let mut adopted = Vec::new();

        for lun in luns.iter() {
            for blk in lun.blocks() {
                let base = blk.base_ppa();
                let live: Vec<bool> = (0..blk.capacity())
                    .map(|offset| {
                        let ppa = base + offset;
                        match tables.p2l[ppa] {
                            Some(lpa) => tables.l2p[lpa].ppa() == Some(ppa),
                            None => false,
                        }
                    })
                    .collect();
                if !live.contains(&true) {
                    continue;
                }

                blk.mark_written();
                let mut state = blk.lock();
                for (offset, _) in live.iter().enumerate().filter(|(_, l)| !**l) {
                    tables.p2l[base + offset] = None;
                    Block::invalidate(&mut state, offset);
                }
                adopted.push(blk.id());
            }
        }
        adopted
    }

    /// Checks the map invariants: forward and reverse entries mirror each
    /// other, no two logical pages share a physical page, live pages are not
    /// marked invalid, and every block's invalid count matches its bitmap.
    pub fn verify(&self, luns: &Luns) -> Result<()> {
        let tables = self.tables();
        let mut owners: HashMap<Ppa, Lpa> = HashMap::new();

        for (lpa, entry) in tables.l2p.iter().enumerate() {
            let L2PValue::Mapped { ppa, block } = *entry else {
                continue;
            };
            if let Some(other) = owners.insert(ppa, lpa) {
                return Err(FtlError::MapConsistency(format!(
                    "lpa {} and lpa {} both map to ppa {}",
                    other, lpa, ppa
                )));
            }
            if tables.p2l[ppa] != Some(lpa) {
                return Err(FtlError::MapConsistency(format!(
                    "lpa {} maps to ppa {} whose reverse entry is {:?}",
                    lpa, ppa, tables.p2l[ppa]
                )));
            }
            let (owner, offset) = luns.locate(ppa);
            if owner != block {
                return Err(FtlError::MapConsistency(format!(
                    "lpa {} names block {:?} but ppa {} lives in {:?}",
                    lpa, block, ppa, owner
                )));
            }
            if luns.block(block).lock().invalid_pages.get(offset) {
                return Err(FtlError::MapConsistency(format!(
                    "lpa {} maps to ppa {} which is marked invalid",
                    lpa, ppa
                )));
            }
        }

        for (ppa, rev) in tables.p2l.iter().enumerate() {
            if let Some(lpa) = rev {
                if tables.l2p[*lpa].ppa() != Some(ppa) {
                    return Err(FtlError::MapConsistency(format!(
                        "reverse entry of ppa {} names lpa {} which maps elsewhere",
                        ppa, lpa
                    )));
                }
            }
        }

        for lun in luns.iter() {
            for blk in lun.blocks() {
                let state = blk.lock();
                if state.nr_invalid_pages != state.invalid_pages.count_ones() {
                    warn!("block {:?} invalid count drifted from its bitmap", blk.id());
                    return Err(FtlError::MapConsistency(format!(
                        "block {:?} counts {} invalid pages but its bitmap has {}",
                        blk.id(),
                        state.nr_invalid_pages,
                        state.invalid_pages.count_ones()
                    )));
                }
            }
        }
        Ok(())
    }
}
