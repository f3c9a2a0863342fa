//! Round-robin, page-mapped translation layer with cost-based GC.

pub mod alloc;
pub mod gc;
pub mod inflight;
mod io;
pub mod lun;
pub mod map;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byte_unit::Byte;
use crossbeam::channel::{self, Sender};
use log::{debug, info, trace, warn};

use crate::config::{FtlConfig, Lpa, Ppa};
use crate::error::{FtlError, Result};
use crate::media::Media;
use crate::request::{Request, Response};

use self::alloc::Allocator;
use self::gc::{GcJob, GcReport, GcWorkers};
use self::inflight::InflightRanges;
use self::lun::{BlockRef, Luns};
use self::map::{AddressMap, L2PValue, L2pChunk};

/// Result of an I/O submission that may have to be retried later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submit<T> {
    Done(T),
    Requeue,
}

impl<T> Submit<T> {
    pub fn is_requeue(&self) -> bool {
        matches!(self, Submit::Requeue)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Submit::Done(v) => Some(v),
            Submit::Requeue => None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    requeues: AtomicU64,
    gc_kicks: AtomicU64,
    gc_blocks_reclaimed: AtomicU64,
    gc_pages_moved: AtomicU64,
    gc_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FtlStats {
    pub requeues: u64,
    pub gc_kicks: u64,
    pub gc_blocks_reclaimed: u64,
    pub gc_pages_moved: u64,
    pub gc_failures: u64,
}

impl Stats {
    pub(crate) fn requeue(&self) {
        self.requeues.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn kick(&self) {
        self.gc_kicks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn gc_reclaimed(&self, moved: usize) {
        self.gc_blocks_reclaimed.fetch_add(1, Ordering::Relaxed);
        self.gc_pages_moved.fetch_add(moved as u64, Ordering::Relaxed);
    }

    pub(crate) fn gc_failed(&self) {
        self.gc_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> FtlStats {
        FtlStats {
            requeues: self.requeues.load(Ordering::Relaxed),
            gc_kicks: self.gc_kicks.load(Ordering::Relaxed),
            gc_blocks_reclaimed: self.gc_blocks_reclaimed.load(Ordering::Relaxed),
            gc_pages_moved: self.gc_pages_moved.load(Ordering::Relaxed),
            gc_failures: self.gc_failures.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the I/O path and the GC threads.
pub(crate) struct FtlCore {
    pub(crate) config: FtlConfig,
    pub(crate) media: Arc<dyn Media>,
    pub(crate) map: AddressMap,
    pub(crate) alloc: Allocator,
    pub(crate) inflight: InflightRanges,
    pub(crate) stats: Stats,
    pub(crate) gc_tx: Option<Sender<GcJob>>,
}

impl FtlCore {
    /// Counts one durably written page of `block`. The page that completes
    /// the block makes it a GC candidate.
    pub(crate) fn commit_page(&self, block: BlockRef) {
        let luns = self.alloc.luns();
        if luns.block(block).commit_page() {
            luns.lun(block.lun).push_victim(block.index);
            debug!("block {:?} is full, allow GC", block);
        }
    }
}

pub struct Ftl {
    core: Arc<FtlCore>,
    gc: Option<GcWorkers>,
}

impl Ftl {
    pub fn new(media: Arc<dyn Media>, config: FtlConfig) -> Result<Self> {
        Ftl::mount(media, config, std::iter::empty())
    }

    /// Brings up a target on `media`, seeding the address map from an
    /// existing L2P table.
    pub fn mount<I>(media: Arc<dyn Media>, config: FtlConfig, l2p: I) -> Result<Self>
    where
        I: IntoIterator<Item = L2pChunk>,
    {
        config.validate()?;
        let geometry = config.geometry;
        if media.geometry() != geometry {
            return Err(FtlError::InvalidGeometry(format!(
                "media reports {:?}, target configured for {:?}",
                media.geometry(),
                geometry
            )));
        }
        if config.gc_target_free() <= config.reserve_blocks() {
            warn!(
                "GC targets {} free blocks per lun but writes stop below {}",
                config.gc_target_free(),
                config.reserve_blocks()
            );
        }

        let nr_lpas = config.nr_lpas();
        let luns = Luns::new(&geometry);
        let map = AddressMap::new(nr_lpas, geometry.total_pages());

        for chunk in l2p {
            map.import(&luns, &chunk)?;
        }
        let adopted = map.adopt_blocks(&luns);
        for blk in &adopted {
            if !media.claim_block(blk.lun, blk.index) {
                return Err(FtlError::MapConsistency(format!(
                    "block {:?} holds mapped pages but is not free on the media",
                    blk
                )));
            }
        }
        for lun in luns.iter() {
            lun.set_free_blocks(media.nr_free_blocks(lun.id()));
        }

        let alloc = Allocator::new(luns, Arc::clone(&media), config.reserve_blocks());
        alloc.configure()?;
        for blk in &adopted {
            alloc.luns().lun(blk.lun).push_victim(blk.index);
        }

        let (tx, rx) = if config.background_gc {
            let (tx, rx) = channel::unbounded();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let core = Arc::new(FtlCore {
            config,
            media,
            map,
            alloc,
            inflight: InflightRanges::new(),
            stats: Stats::default(),
            gc_tx: tx.clone(),
        });

        let gc = match (tx, rx) {
            (Some(tx), Some(rx)) => Some(GcWorkers::spawn(
                &core,
                tx,
                rx,
                core.config.workers(),
                core.config.gc_interval,
            )?),
            _ => None,
        };

        info!(
            "rrpc initialized with {} luns and {} pages ({}), {} blocks adopted",
            geometry.luns,
            nr_lpas,
            Byte::from_bytes((nr_lpas * geometry.page_size) as u128).get_appropriate_unit(true),
            adopted.len()
        );
        Ok(Ftl { core, gc })
    }

    pub fn config(&self) -> &FtlConfig {
        &self.core.config
    }

    /// Logical pages exposed to the host.
    pub fn nr_lpas(&self) -> usize {
        self.core.map.nr_lpas()
    }

    /// Exposed capacity in sectors.
    pub fn capacity(&self) -> u64 {
        let geo = &self.core.config.geometry;
        (self.nr_lpas() * (geo.page_size / geo.sector_size)) as u64
    }

    pub fn read(&self, lpa: Lpa, len: usize) -> Result<Submit<Vec<u8>>> {
        self.core.read(lpa, len)
    }

    pub fn write(&self, lpa: Lpa, data: &[u8]) -> Result<Submit<()>> {
        self.core.write(lpa, data)
    }

    pub fn discard(&self, lpa: Lpa, len: usize) -> Result<()> {
        self.core.discard(lpa, len)
    }

    /// Services one request from the request-issuing layer.
    pub fn submit(&self, req: Request) -> Response {
        trace!("submit {} at lpa {}", req.kind(), req.lpa());
        let res = match req {
            Request::Read { lpa, len } => self.read(lpa, len).map(|s| match s {
                Submit::Done(data) => Response::Ok(Some(data)),
                Submit::Requeue => Response::Requeue,
            }),
            Request::Write { lpa, data } => self.write(lpa, &data).map(|s| match s {
                Submit::Done(()) => Response::Ok(None),
                Submit::Requeue => Response::Requeue,
            }),
            Request::Discard { lpa, len } => self.discard(lpa, len).map(|()| Response::Ok(None)),
        };
        res.unwrap_or_else(Response::Error)
    }

    /// Asks every LUN to evaluate reclamation. Without background GC this
    /// only records the kick.
    pub fn gc_kick(&self) {
        self.core.gc_kick();
    }

    /// Runs one GC pass over all LUNs on the calling thread.
    pub fn run_gc(&self) -> GcReport {
        self.core.run_gc()
    }

    /// Reclaims `block` now. It must be a full block waiting for GC.
    pub fn reclaim_block(&self, block: BlockRef) -> Result<()> {
        self.core.reclaim_candidate(block)
    }

    pub fn lookup(&self, lpa: Lpa) -> L2PValue {
        self.core.map.lookup(lpa)
    }

    pub fn reverse(&self, ppa: Ppa) -> Option<Lpa> {
        self.core.map.reverse(ppa)
    }

    pub fn luns(&self) -> &Luns {
        self.core.alloc.luns()
    }

    pub fn inflight(&self) -> &InflightRanges {
        &self.core.inflight
    }

    /// Checks the address-map invariants against current block state.
    pub fn verify(&self) -> Result<()> {
        self.core.map.verify(self.core.alloc.luns())
    }

    pub fn stats(&self) -> FtlStats {
        self.core.stats.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &FtlCore {
        &self.core
    }
}

impl Drop for Ftl {
    fn drop(&mut self) {
        if let Some(mut gc) = self.gc.take() {
            gc.shutdown();
        }
        debug!("rrpc target torn down");
    }
}

#[cfg(test)]
mod test {
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use rand::prelude::*;
    use simplelog::{Config, LevelFilter, TestLogger};

    use super::*;
    use crate::config::{Geometry, L2P_EMPTY};
    use crate::error::MediaError;
    use crate::media::MemMedia;

    const PAGE: usize = 512;

    fn init_log() {
        let _ = TestLogger::init(LevelFilter::Debug, Config::default());
    }

    fn geo(luns: usize, blocks_per_lun: usize, pages_per_block: usize) -> Geometry {
        Geometry {
            luns,
            blocks_per_lun,
            pages_per_block,
            page_size: PAGE,
            sector_size: PAGE,
        }
    }

    fn foreground(geometry: Geometry) -> FtlConfig {
        FtlConfig {
            background_gc: false,
            ..FtlConfig::with_geometry(geometry)
        }
    }

    fn setup(geometry: Geometry) -> (Arc<MemMedia>, Ftl) {
        init_log();
        let media = Arc::new(MemMedia::new(geometry));
        let ftl = Ftl::new(media.clone(), foreground(geometry)).unwrap();
        (media, ftl)
    }

    fn payload(lpa: Lpa, gen: u8) -> Vec<u8> {
        vec![(lpa as u8) ^ gen; PAGE]
    }

    fn write(ftl: &Ftl, lpa: Lpa, data: &[u8]) {
        assert_eq!(ftl.write(lpa, data).unwrap(), Submit::Done(()));
    }

    fn read(ftl: &Ftl, lpa: Lpa) -> Vec<u8> {
        ftl.read(lpa, 1).unwrap().done().unwrap()
    }

    fn blk(index: usize) -> BlockRef {
        BlockRef { lun: 0, index }
    }

    #[test]
    fn first_write_lands_on_page_zero() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        write(&ftl, 0, &payload(0, 0xa0));

        assert_eq!(ftl.lookup(0).ppa(), Some(0));
        assert_eq!(ftl.reverse(0), Some(0));
        assert_eq!(read(&ftl, 0), payload(0, 0xa0));
        assert_eq!(ftl.capacity(), 512);
        ftl.verify().unwrap();
    }

    #[test]
    fn multi_page_io() {
        let (_media, ftl) = setup(geo(2, 16, 64));
        let mut data = payload(7, 1);
        data.extend(payload(8, 1));
        data.extend(payload(9, 1));
        write(&ftl, 7, &data);

        // pages rotate over both luns
        let luns: Vec<_> = (7..10)
            .map(|lpa| match ftl.lookup(lpa) {
                L2PValue::Mapped { block, .. } => block.lun,
                L2PValue::Unmapped => panic!("lpa {} unmapped", lpa),
            })
            .collect();
        assert_eq!(luns, vec![0, 1, 0]);
        assert_eq!(ftl.read(7, 3).unwrap(), Submit::Done(data));
    }

    #[test]
    fn overwrite_invalidates_old_page() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        write(&ftl, 5, &payload(5, 0));
        write(&ftl, 5, &payload(5, 1));

        assert_eq!(ftl.lookup(5).ppa(), Some(1));
        assert_eq!(ftl.reverse(0), None);
        assert_eq!(ftl.luns().block(blk(0)).nr_invalid_pages(), 1);
        assert_eq!(read(&ftl, 5), payload(5, 1));
        ftl.verify().unwrap();
    }

    #[test]
    fn discard_unmaps() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        let mut data = payload(0, 0);
        data.extend(payload(1, 0));
        write(&ftl, 0, &data);

        ftl.discard(0, 2).unwrap();
        assert!(matches!(ftl.read(0, 1), Err(FtlError::Unmapped { lpa: 0 })));
        assert_eq!(ftl.lookup(1), L2PValue::Unmapped);
        assert_eq!(ftl.luns().block(blk(0)).nr_invalid_pages(), 2);

        // discarding unmapped pages is a no-op
        ftl.discard(0, 4).unwrap();
        assert_eq!(ftl.luns().block(blk(0)).nr_invalid_pages(), 2);
        ftl.verify().unwrap();
    }

    #[test]
    fn rejects_malformed_requests() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        assert!(matches!(ftl.read(0, 0), Err(FtlError::InvalidRequest(_))));
        assert!(matches!(ftl.read(0, 65), Err(FtlError::InvalidRequest(_))));
        assert!(matches!(
            ftl.read(511, 2),
            Err(FtlError::OutOfRange { lpa: 511, len: 2, max: 512 })
        ));
        assert!(matches!(ftl.write(0, &[0; 100]), Err(FtlError::InvalidRequest(_))));
        assert!(matches!(ftl.write(0, &[]), Err(FtlError::InvalidRequest(_))));
        assert!(matches!(ftl.discard(510, 3), Err(FtlError::OutOfRange { .. })));

        let resp = ftl.submit(Request::Write { lpa: 512, data: payload(0, 0) });
        assert!(matches!(resp, Response::Error(FtlError::OutOfRange { .. })));
    }

    #[test]
    fn submit_dispatches_requests() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        assert!(ftl.submit(Request::Write { lpa: 3, data: payload(3, 9) }).is_ok());
        match ftl.submit(Request::Read { lpa: 3, len: 1 }) {
            Response::Ok(Some(data)) => assert_eq!(data, payload(3, 9)),
            other => panic!("unexpected response {:?}", other),
        }
        assert!(ftl.submit(Request::Discard { lpa: 3, len: 1 }).is_ok());
        assert!(matches!(
            ftl.submit(Request::Read { lpa: 3, len: 1 }),
            Response::Error(FtlError::Unmapped { lpa: 3 })
        ));
    }

    #[test]
    fn enclosed_request_is_requeued() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        let held = ftl.inflight().try_acquire(0, 8).unwrap();

        assert!(ftl.write(2, &payload(2, 0)).unwrap().is_requeue());
        assert!(ftl.read(2, 1).unwrap().is_requeue());
        assert!(ftl.submit(Request::Read { lpa: 0, len: 8 }).is_requeue());

        // straddles the held range, so it is admitted
        let mut data = Vec::new();
        for lpa in 6..10 {
            data.extend(payload(lpa, 0));
        }
        write(&ftl, 6, &data);

        held.release();
        write(&ftl, 2, &payload(2, 0));
        assert_eq!(ftl.stats().requeues, 3);
        assert!(ftl.inflight().active().is_empty());
    }

    /// One LUN of 8 blocks, 64 pages each: GC aims for 6 free blocks and
    /// regular writes stop below 4.
    fn fill_for_gc(ftl: &Ftl) {
        for lpa in 0..128 {
            write(ftl, lpa, &payload(lpa, 0));
        }
        write(ftl, 0, &payload(0, 0x80));
        write(ftl, 1, &payload(1, 0x80));
        for lpa in 64..122 {
            write(ftl, lpa, &payload(lpa, 0x80));
        }
    }

    fn expected(lpa: Lpa) -> Vec<u8> {
        if lpa < 2 || (64..122).contains(&lpa) {
            payload(lpa, 0x80)
        } else {
            payload(lpa, 0)
        }
    }

    #[test]
    fn gc_selects_most_invalid_first() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        fill_for_gc(&ftl);

        let lun = ftl.luns().lun(0);
        assert_eq!(lun.nr_free_blocks(), 4);
        assert_eq!(lun.victims(), vec![blk(0), blk(2)]);
        assert_eq!(ftl.luns().block(blk(0)).nr_invalid_pages(), 2);
        assert_eq!(ftl.luns().block(blk(2)).nr_invalid_pages(), 58);

        assert_eq!(ftl.core().select_victims(0), vec![blk(2), blk(0)]);
        assert!(lun.victims().is_empty());
    }

    #[test]
    fn gc_reclaims_and_keeps_data() {
        let (media, ftl) = setup(geo(1, 8, 64));
        fill_for_gc(&ftl);
        let erases = media.stats().erases;

        let report = ftl.run_gc();
        assert_eq!(report.selected, vec![blk(2), blk(0)]);
        assert_eq!((report.reclaimed, report.failed), (2, 0));

        let stats = ftl.stats();
        assert_eq!(stats.gc_blocks_reclaimed, 2);
        assert_eq!(stats.gc_pages_moved, 6 + 62);
        assert_eq!(media.stats().erases, erases + 2);

        for index in [0, 2] {
            let info = ftl.luns().block(blk(index)).info();
            assert_eq!(info.next_page, 0);
            assert_eq!(info.nr_invalid_pages, 0);
            assert_eq!(info.invalid_bits, 0);
            assert_eq!(info.committed, 0);
            let base = index * 64;
            assert!((base..base + 64).all(|ppa| ftl.reverse(ppa).is_none()));
        }
        // block 4 was opened for the migrated pages
        assert_eq!(ftl.luns().lun(0).nr_free_blocks(), 5);

        for lpa in 0..128 {
            assert_eq!(read(&ftl, lpa), expected(lpa), "lpa {}", lpa);
        }
        ftl.verify().unwrap();
    }

    #[test]
    fn gc_runs_only_below_target() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        for lpa in 0..64 {
            write(&ftl, lpa, &payload(lpa, 0));
        }
        write(&ftl, 0, &payload(0, 1));
        // 5 free blocks, target 6, but the only candidate is block 0
        assert_eq!(ftl.run_gc().selected, vec![blk(0)]);

        let (_media, ftl) = setup(geo(1, 16, 64));
        for lpa in 0..64 {
            write(&ftl, lpa, &payload(lpa, 0));
        }
        write(&ftl, 0, &payload(0, 1));
        assert_eq!(ftl.run_gc(), GcReport::default());
    }

    #[test]
    fn reserve_refuses_writes_and_kicks_gc() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        // the write at lpa 192 opens block 4 and leaves 3 free blocks
        for lpa in 0..193 {
            write(&ftl, lpa, &payload(lpa, 0));
        }
        assert_eq!(ftl.luns().lun(0).nr_free_blocks(), 3);

        assert!(ftl.write(193, &payload(193, 0)).unwrap().is_requeue());
        let stats = ftl.stats();
        assert_eq!((stats.requeues, stats.gc_kicks), (1, 1));

        // every candidate is fully valid
        assert_eq!(ftl.run_gc(), GcReport::default());

        ftl.discard(0, 64).unwrap();
        let report = ftl.run_gc();
        assert_eq!(report.selected, vec![blk(0)]);
        assert_eq!(ftl.stats().gc_pages_moved, 0);
        assert_eq!(ftl.luns().lun(0).nr_free_blocks(), 4);

        write(&ftl, 193, &payload(193, 0));
        ftl.verify().unwrap();
    }

    #[test]
    fn refused_write_leaves_no_mapping() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        for lpa in 0..192 {
            write(&ftl, lpa, &payload(lpa, 0));
        }

        // the first page opens block 4, dropping the lun below its reserve
        let mut data = payload(192, 0);
        data.extend(payload(193, 0));
        assert!(ftl.write(192, &data).unwrap().is_requeue());

        assert_eq!(ftl.lookup(192), L2PValue::Unmapped);
        assert_eq!(ftl.lookup(193), L2PValue::Unmapped);
        let info = ftl.luns().block(blk(4)).info();
        assert_eq!((info.next_page, info.nr_invalid_pages, info.committed), (1, 1, 1));
        assert_eq!(ftl.reverse(256), None);
        ftl.verify().unwrap();
    }

    #[test]
    fn overwrite_races_reclaim() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        for lpa in 0..64 {
            write(&ftl, lpa, &payload(lpa, 0));
        }

        let barrier = Barrier::new(2);
        let last = thread::scope(|s| {
            let writer = s.spawn(|| {
                barrier.wait();
                let mut last = Vec::new();
                for gen in 1..=50u8 {
                    let data = payload(10, gen);
                    while ftl.write(10, &data).unwrap().is_requeue() {
                        thread::yield_now();
                    }
                    last = data;
                }
                last
            });

            barrier.wait();
            ftl.reclaim_block(blk(0)).unwrap();
            writer.join().unwrap()
        });

        ftl.verify().unwrap();
        assert_eq!(read(&ftl, 10), last);
        for lpa in (0..64).filter(|&l| l != 10) {
            assert_eq!(read(&ftl, lpa), payload(lpa, 0));
        }
        assert_eq!(ftl.luns().block(blk(0)).info().next_page, 0);
    }

    #[test]
    fn mount_imports_l2p() {
        init_log();
        let g = geo(1, 8, 64);
        let media = Arc::new(MemMedia::new(g));
        media.program(64, &payload(0, 3)).unwrap();
        media.program(65, &payload(1, 3)).unwrap();
        media.program(130, &payload(3, 3)).unwrap();

        let chunk = L2pChunk {
            slba: 0,
            entries: vec![64, 65, L2P_EMPTY, 130],
        };
        let ftl = Ftl::mount(media.clone(), foreground(g), vec![chunk]).unwrap();

        assert_eq!(read(&ftl, 0), payload(0, 3));
        assert_eq!(read(&ftl, 3), payload(3, 3));
        assert!(matches!(ftl.read(2, 1), Err(FtlError::Unmapped { lpa: 2 })));

        let lun = ftl.luns().lun(0);
        assert_eq!(lun.victims(), vec![blk(1), blk(2)]);
        assert_eq!(lun.current(), Some(blk(0)));
        assert_eq!(lun.gc_reserve(), Some(blk(3)));
        assert_eq!(lun.nr_free_blocks(), 4);
        assert_eq!(ftl.luns().block(blk(1)).nr_invalid_pages(), 62);

        write(&ftl, 0, &payload(0, 4));
        assert_eq!(ftl.lookup(0).ppa(), Some(0));
        assert_eq!(ftl.luns().block(blk(1)).nr_invalid_pages(), 63);
        ftl.verify().unwrap();
    }

    #[test]
    fn mount_rejects_bad_l2p() {
        init_log();
        let g = geo(1, 8, 64);
        let media = Arc::new(MemMedia::new(g));
        let chunk = L2pChunk {
            slba: 0,
            entries: vec![512],
        };
        assert!(matches!(
            Ftl::mount(media.clone(), foreground(g), vec![chunk]),
            Err(FtlError::L2pOutOfBounds { lpa: 0, ppa: 512, max: 512 })
        ));

        let chunk = L2pChunk {
            slba: 511,
            entries: vec![0, 1],
        };
        assert!(matches!(
            Ftl::mount(media, foreground(g), vec![chunk]),
            Err(FtlError::MapConsistency(_))
        ));
    }

    #[test]
    fn mount_needs_two_blocks_per_lun() {
        init_log();
        let g = geo(2, 1, 64);
        let media = Arc::new(MemMedia::new(g));
        assert!(matches!(
            Ftl::new(media, foreground(g)),
            Err(FtlError::OutOfSpace { lun: 0 })
        ));
    }

    #[test]
    fn mount_checks_geometry() {
        init_log();
        let media = Arc::new(MemMedia::new(geo(1, 8, 64)));
        assert!(matches!(
            Ftl::new(media, foreground(geo(1, 16, 64))),
            Err(FtlError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn media_write_error_is_reported() {
        let (media, ftl) = setup(geo(1, 8, 64));
        media.fail_write(0);
        assert!(matches!(
            ftl.write(0, &payload(0, 0)),
            Err(FtlError::Media(MediaError::Write(0)))
        ));
        assert!(ftl.inflight().active().is_empty());
        assert_eq!(ftl.lookup(0), L2PValue::Unmapped);
        write(&ftl, 1, &payload(1, 0));
        assert_eq!(ftl.lookup(1).ppa(), Some(1));
    }

    #[test]
    fn failed_overwrite_does_not_read_erased_data() {
        let (media, ftl) = setup(geo(1, 8, 64));
        write(&ftl, 0, &payload(0, 0xab));
        media.fail_write(1);

        assert!(matches!(
            ftl.write(0, &payload(0, 0xcd)),
            Err(FtlError::Media(MediaError::Write(1)))
        ));
        assert!(matches!(ftl.read(0, 1), Err(FtlError::Unmapped { lpa: 0 })));
        assert_eq!(ftl.lookup(0), L2PValue::Unmapped);
        assert_eq!(ftl.reverse(1), None);

        let info = ftl.luns().block(blk(0)).info();
        assert_eq!((info.nr_invalid_pages, info.committed), (2, 2));
        ftl.verify().unwrap();
    }

    #[test]
    fn gc_read_error_aborts_reclaim() {
        let (media, ftl) = setup(geo(1, 8, 64));
        for lpa in 0..64 {
            write(&ftl, lpa, &payload(lpa, 0));
        }
        write(&ftl, 0, &payload(0, 1));
        media.fail_read(1);

        assert!(matches!(
            ftl.reclaim_block(blk(0)),
            Err(FtlError::Media(MediaError::Read(1)))
        ));
        assert_eq!(ftl.stats().gc_failures, 1);
        assert_eq!(ftl.luns().block(blk(0)).info().next_page, 64);
        assert!(media.is_programmed(2));
        assert_eq!(ftl.luns().lun(0).nr_free_blocks(), 5);

        // the block is out of rotation, so it is not reclaimed again
        media.clear_faults();
        assert!(ftl.luns().lun(0).victims().is_empty());
        assert!(matches!(ftl.reclaim_block(blk(0)), Err(FtlError::MapConsistency(_))));
        assert_eq!(read(&ftl, 1), payload(1, 0));
        ftl.verify().unwrap();
    }

    #[test]
    fn gc_write_error_aborts_reclaim() {
        let (media, ftl) = setup(geo(1, 8, 64));
        for lpa in 0..64 {
            write(&ftl, lpa, &payload(lpa, 0));
        }
        write(&ftl, 0, &payload(0, 1));
        // lpa 1 is the first live page and its copy lands at ppa 129
        media.fail_write(129);

        assert!(matches!(
            ftl.reclaim_block(blk(0)),
            Err(FtlError::Media(MediaError::Write(129)))
        ));
        let stats = ftl.stats();
        assert_eq!((stats.gc_failures, stats.gc_blocks_reclaimed), (1, 0));

        let copy = ftl.luns().block(blk(2)).info();
        assert_eq!((copy.next_page, copy.nr_invalid_pages, copy.committed), (2, 1, 2));
        assert_eq!(ftl.reverse(129), None);

        let victim = ftl.luns().block(blk(0)).info();
        assert_eq!((victim.next_page, victim.nr_invalid_pages), (64, 1));
        assert!(media.is_programmed(1));
        assert_eq!(ftl.lookup(1).ppa(), Some(1));
        assert_eq!(ftl.luns().lun(0).nr_free_blocks(), 5);

        media.clear_faults();
        assert_eq!(read(&ftl, 1), payload(1, 0));
        ftl.verify().unwrap();
    }

    #[test]
    fn gc_erase_error_keeps_block() {
        let (media, ftl) = setup(geo(1, 8, 64));
        for lpa in 0..64 {
            write(&ftl, lpa, &payload(lpa, 0));
        }
        write(&ftl, 0, &payload(0, 1));
        media.fail_erase(0, 0);

        assert!(matches!(
            ftl.reclaim_block(blk(0)),
            Err(FtlError::Media(MediaError::Erase { lun: 0, block: 0 }))
        ));
        let stats = ftl.stats();
        assert_eq!((stats.gc_failures, stats.gc_blocks_reclaimed), (1, 0));

        // pages were moved before the erase, so block 0 is fully invalid
        let info = ftl.luns().block(blk(0)).info();
        assert_eq!((info.next_page, info.nr_invalid_pages), (64, 64));
        assert!(media.is_programmed(1));

        let lun = ftl.luns().lun(0);
        assert_eq!(lun.nr_free_blocks(), 5);
        assert_eq!(lun.victims(), vec![blk(2)]);
        for lpa in 0..64 {
            assert_eq!(read(&ftl, lpa), payload(lpa, u8::from(lpa == 0)));
        }
        ftl.verify().unwrap();
    }

    #[test]
    fn reclaim_refuses_open_block() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        write(&ftl, 0, &payload(0, 0));

        assert!(matches!(ftl.reclaim_block(blk(0)), Err(FtlError::MapConsistency(_))));
        assert!(matches!(
            ftl.core().reclaim_block(blk(0)),
            Err(FtlError::MapConsistency(_))
        ));
        assert!(matches!(
            ftl.reclaim_block(BlockRef { lun: 3, index: 0 }),
            Err(FtlError::InvalidRequest(_))
        ));

        let stats = ftl.stats();
        assert_eq!((stats.gc_pages_moved, stats.gc_blocks_reclaimed), (0, 0));
        let lun = ftl.luns().lun(0);
        assert_eq!(lun.current(), Some(blk(0)));
        assert!(lun.victims().is_empty());
        assert_eq!(lun.nr_free_blocks(), 6);
        assert_eq!(ftl.luns().block(blk(0)).info().next_page, 1);
        assert_eq!(read(&ftl, 0), payload(0, 0));
        ftl.verify().unwrap();
    }

    #[test]
    fn reclaim_refuses_block_taken_by_gc() {
        let (_media, ftl) = setup(geo(1, 8, 64));
        fill_for_gc(&ftl);

        // selection hands both candidates to GC
        assert_eq!(ftl.core().select_victims(0), vec![blk(2), blk(0)]);
        assert!(matches!(ftl.reclaim_block(blk(2)), Err(FtlError::MapConsistency(_))));
        assert_eq!(ftl.luns().block(blk(2)).info().next_page, 64);

        ftl.core().reclaim_block(blk(2)).unwrap();
        assert!(matches!(ftl.reclaim_block(blk(2)), Err(FtlError::MapConsistency(_))));
        assert_eq!(ftl.stats().gc_blocks_reclaimed, 1);
        ftl.verify().unwrap();
    }

    #[test]
    fn background_gc_sustains_random_overwrites() {
        init_log();
        let g = geo(1, 32, 64);
        let media = Arc::new(MemMedia::new(g));
        let config = FtlConfig {
            over_provisioning: 50.0,
            gc_interval: Duration::from_millis(1),
            ..FtlConfig::with_geometry(g)
        };
        let ftl = Ftl::new(media, config).unwrap();
        let nr_lpas = ftl.nr_lpas();
        assert_eq!(nr_lpas, 1024);

        let mut gens = vec![0u8; nr_lpas];
        let mut rng = SmallRng::seed_from_u64(7);
        let submit = |lpa: Lpa, gen: u8| {
            let data = payload(lpa, gen);
            for _ in 0..100_000 {
                if !ftl.write(lpa, &data).unwrap().is_requeue() {
                    return;
                }
                thread::sleep(Duration::from_micros(100));
            }
            panic!("write at lpa {} never admitted", lpa);
        };

        for lpa in 0..nr_lpas {
            submit(lpa, 0);
        }
        for _ in 0..3 * nr_lpas {
            let lpa = rng.gen_range(0..nr_lpas);
            gens[lpa] = gens[lpa].wrapping_add(1);
            submit(lpa, gens[lpa]);
        }

        assert!(ftl.stats().gc_blocks_reclaimed > 0);
        ftl.verify().unwrap();
        for (lpa, gen) in gens.iter().enumerate() {
            let data = loop {
                match ftl.read(lpa, 1).unwrap() {
                    Submit::Done(data) => break data,
                    Submit::Requeue => thread::yield_now(),
                }
            };
            assert_eq!(data, payload(lpa, *gen), "lpa {}", lpa);
        }
    }
}
