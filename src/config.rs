use std::time::Duration;

use crate::error::{FtlError, Result};

pub type BaseType = usize;

pub type Lpa = BaseType;
pub type Ppa = BaseType;
pub type LunId = BaseType;
pub type BlockId = BaseType;
pub type Counter = BaseType;

pub const LUNS: BaseType = 4;
pub const BLOCKS_PER_LUN: BaseType = 128;
pub const PAGES_PER_BLOCK: BaseType = 256;

pub const PAGE_SIZE: BaseType = 4096;
pub const SECTOR_SIZE: BaseType = 512;

/// Bits available in a block's invalid-page bitmap.
pub const MAX_INVALID_PAGES: BaseType = 8 * 64;

/// Largest request the I/O path accepts, in pages.
pub const MAX_REQUEST_PAGES: BaseType = 64;

/// Run GC only while fewer than 1/X of the pages-per-block are free blocks.
pub const GC_LIMIT_INVERSE: BaseType = 10;
pub const GC_INTERVAL_MS: u64 = 10;

/// Regular writes stop once a LUN has fewer than `RESERVE_FACTOR * luns` free blocks.
pub const RESERVE_FACTOR: BaseType = 4;

/// Address value marking an unmapped or reserved entry in an imported L2P table.
pub const L2P_EMPTY: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub luns: BaseType,
    pub blocks_per_lun: BaseType,
    pub pages_per_block: BaseType,
    pub page_size: BaseType,
    pub sector_size: BaseType,
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            luns: LUNS,
            blocks_per_lun: BLOCKS_PER_LUN,
            pages_per_block: PAGES_PER_BLOCK,
            page_size: PAGE_SIZE,
            sector_size: SECTOR_SIZE,
        }
    }
}

impl Geometry {
    pub fn total_blocks(&self) -> BaseType {
        self.luns * self.blocks_per_lun
    }

    pub fn pages_per_lun(&self) -> BaseType {
        self.blocks_per_lun * self.pages_per_block
    }

    pub fn total_pages(&self) -> BaseType {
        self.total_blocks() * self.pages_per_block
    }

    pub fn capacity(&self) -> BaseType {
        self.total_pages() * self.page_size
    }

    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("luns", self.luns),
            ("blocks_per_lun", self.blocks_per_lun),
            ("pages_per_block", self.pages_per_block),
            ("page_size", self.page_size),
            ("sector_size", self.sector_size),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(FtlError::InvalidGeometry(format!("{} must be non-zero", name)));
        }
        if self.pages_per_block > MAX_INVALID_PAGES {
            return Err(FtlError::InvalidGeometry(format!(
                "{} pages per block exceeds the {} page bitmap",
                self.pages_per_block, MAX_INVALID_PAGES
            )));
        }
        if self.page_size % self.sector_size != 0 {
            return Err(FtlError::InvalidGeometry(format!(
                "page size {} is not a multiple of sector size {}",
                self.page_size, self.sector_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FtlConfig {
    pub geometry: Geometry,
    /// Percent of physical pages withheld from the logical address space.
    pub over_provisioning: f64,
    pub gc_interval: Duration,
    /// Spawn the GC timer and workers. When off, GC only runs through `Ftl::run_gc`.
    pub background_gc: bool,
    /// Reclaim workers; 0 means one per LUN.
    pub gc_workers: BaseType,
}

impl Default for FtlConfig {
    fn default() -> Self {
        FtlConfig {
            geometry: Geometry::default(),
            over_provisioning: 0.0,
            gc_interval: Duration::from_millis(GC_INTERVAL_MS),
            background_gc: true,
            gc_workers: 0,
        }
    }
}

impl FtlConfig {
    pub fn with_geometry(geometry: Geometry) -> Self {
        FtlConfig {
            geometry,
            ..FtlConfig::default()
        }
    }

    pub fn new_with_op(op: f64) -> Self {
        FtlConfig {
            over_provisioning: op,
            ..FtlConfig::default()
        }
    }

    pub fn nr_lpas(&self) -> BaseType {
        let all_pages = self.geometry.total_pages();
        let op_pages = (all_pages as f64 * (self.over_provisioning / 100.)).trunc() as BaseType;
        all_pages - op_pages.min(all_pages)
    }

    /// Free blocks a LUN must keep before regular writes are refused.
    pub fn reserve_blocks(&self) -> BaseType {
        RESERVE_FACTOR * self.geometry.luns
    }

    /// Free blocks GC tries to restore per LUN.
    pub fn gc_target_free(&self) -> BaseType {
        (self.geometry.pages_per_block / GC_LIMIT_INVERSE).max(self.geometry.luns)
    }

    pub fn workers(&self) -> BaseType {
        if self.gc_workers == 0 {
            self.geometry.luns
        } else {
            self.gc_workers
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        if !(0.0..100.0).contains(&self.over_provisioning) {
            return Err(FtlError::InvalidGeometry(format!(
                "over-provisioning {}% out of range",
                self.over_provisioning
            )));
        }
        Ok(())
    }
}
