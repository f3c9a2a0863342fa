//! Garbage collection: victim selection per LUN and block reclamation.
//!
//! A timer asks every LUN to evaluate itself each `gc_interval`, and writes
//! refused for lack of space kick the same evaluation. Evaluation picks full
//! blocks with the most invalid pages until the LUN is expected to reach its
//! free-block target. Each chosen block is handed to a reclaim worker, which
//! migrates the pages still live in it and then erases it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, trace, warn};

use crate::config::{Counter, LunId};
use crate::error::{FtlError, Result};
use crate::ftl::lun::BlockRef;
use crate::ftl::FtlCore;

#[derive(Debug)]
pub(crate) enum GcJob {
    Evaluate(LunId),
    Reclaim(BlockRef),
    Shutdown,
}

/// Outcome of a foreground GC pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub selected: Vec<BlockRef>,
    pub reclaimed: usize,
    pub failed: usize,
}

/// Position and count of the first candidate with the strictly largest
/// invalid-page count. Earlier candidates win ties.
pub fn select_max_invalid<I>(counts: I) -> Option<(usize, Counter)>
where
    I: IntoIterator<Item = Counter>,
{
    let mut max: Option<(usize, Counter)> = None;
    for (pos, count) in counts.into_iter().enumerate() {
        match max {
            Some((_, best)) if count <= best => {}
            _ => max = Some((pos, count)),
        }
    }
    max
}

impl FtlCore {
    /// Removes and returns the blocks `lun` should reclaim now, best first.
    pub(crate) fn select_victims(&self, lun_id: LunId) -> Vec<BlockRef> {
        let lun = self.alloc.luns().lun(lun_id);
        let mut nr_blocks_need = self.config.gc_target_free();
        let mut selected = Vec::new();

        let mut state = lun.lock();
        while nr_blocks_need > lun.nr_free_blocks() && !state.victims.is_empty() {
            let counts = state.victims.iter().map(|&i| lun.block(i).nr_invalid_pages());
            let Some((pos, nr_invalid)) = select_max_invalid(counts) else {
                break;
            };
            if nr_invalid == 0 {
                break;
            }

            let index = state.victims.remove(pos);
            if !lun.block(index).is_full() {
                error!("lun {}: GC candidate block {} is not full", lun_id, index);
                continue;
            }
            debug!("lun {}: selected block {} for GC ({} invalid)", lun_id, index, nr_invalid);
            selected.push(BlockRef { lun: lun_id, index });
            nr_blocks_need -= 1;
        }
        selected
    }

    /// Evaluates one LUN and dispatches what it selects.
    pub(crate) fn lun_gc(&self, lun_id: LunId) {
        self.alloc.luns().lun(lun_id).clear_gc_pending();
        for victim in self.select_victims(lun_id) {
            self.dispatch_reclaim(victim);
        }
    }

    fn dispatch_reclaim(&self, victim: BlockRef) {
        if let Some(tx) = &self.gc_tx {
            if tx.send(GcJob::Reclaim(victim)).is_ok() {
                return;
            }
        }
        let _ = self.reclaim_block(victim);
    }

    /// Queues an evaluation of every LUN that does not already have one pending.
    pub(crate) fn gc_kick(&self) {
        self.stats.kick();
        let Some(tx) = &self.gc_tx else {
            return;
        };
        for lun in self.alloc.luns().iter() {
            if lun.mark_gc_pending() && tx.send(GcJob::Evaluate(lun.id())).is_err() {
                lun.clear_gc_pending();
            }
        }
    }

    /// Evaluates and reclaims every LUN on the calling thread.
    pub(crate) fn run_gc(&self) -> GcReport {
        let mut report = GcReport::default();
        for lun in 0..self.alloc.luns().len() {
            for victim in self.select_victims(lun) {
                report.selected.push(victim);
                match self.reclaim_block(victim) {
                    Ok(()) => report.reclaimed += 1,
                    Err(_) => report.failed += 1,
                }
            }
        }
        report
    }

    /// Reclaims a block still queued as a GC candidate, outside victim
    /// selection. Blocks that are open, unknown or already taken by GC are refused.
    pub(crate) fn reclaim_candidate(&self, victim: BlockRef) -> Result<()> {
        let luns = self.alloc.luns();
        if victim.lun >= luns.len() || victim.index >= luns.lun(victim.lun).blocks().len() {
            return Err(FtlError::InvalidRequest(format!("no block {:?}", victim)));
        }
        if !luns.lun(victim.lun).remove_victim(victim.index) {
            return Err(FtlError::MapConsistency(format!(
                "block {:?} is not a GC candidate",
                victim
            )));
        }
        self.reclaim_block(victim)
    }

    /// Migrates the live pages of `victim`, erases it and returns it to the
    /// free pool. On failure the block stays out of rotation, unerased.
    pub(crate) fn reclaim_block(&self, victim: BlockRef) -> Result<()> {
        let info = self.alloc.luns().block(victim).info();
        let pages = self.config.geometry.pages_per_block;
        if info.next_page != pages || info.committed != pages {
            error!("block {:?} is not fully written, refusing to reclaim it", victim);
            return Err(FtlError::MapConsistency(format!(
                "block {:?} reclaimed with {} of {} pages committed",
                victim, info.committed, pages
            )));
        }
        debug!("block {:?} being reclaimed", victim);

        let moved = match self.move_valid_pages(victim) {
            Ok(moved) => moved,
            Err(err) => {
                self.stats.gc_failed();
                warn!("GC of block {:?} aborted: {}", victim, err);
                return Err(err);
            }
        };

        let lun = self.alloc.luns().lun(victim.lun);
        self.alloc.detach(lun, victim.index);
        if let Err(err) = self.media.erase_block(victim.lun, victim.index) {
            self.stats.gc_failed();
            error!("GC of block {:?} failed to erase: {}", victim, err);
            return Err(err.into());
        }
        lun.block(victim.index).reset();
        self.alloc.put_blk(lun, victim.index);
        self.stats.gc_reclaimed(moved);
        debug!("block {:?} reclaimed, {} pages moved", victim, moved);
        Ok(())
    }

    /// Copies every still-valid page of `victim` to a fresh GC allocation and
    /// repoints its logical owner. Returns the number of pages moved.
    fn move_valid_pages(&self, victim: BlockRef) -> Result<usize> {
        let luns = self.alloc.luns();
        let blk = luns.block(victim);
        let base = blk.base_ppa();
        let mut moved = 0;
        let mut offset = 0;

        loop {
            let next = blk.lock().invalid_pages.first_zero_from(offset);
            let Some(slot) = next else {
                break;
            };
            offset = slot + 1;
            let ppa = base + slot;

            // already superseded by a regular write or discard
            let Some(lpa) = self.map.reverse(ppa) else {
                continue;
            };
            let _guard = self.inflight.acquire(lpa, 1);
            if self.map.reverse(ppa) != Some(lpa) {
                continue;
            }

            let data = self.media.read_page(ppa).map_err(|err| {
                error!("gc read of ppa {} failed: {}", ppa, err);
                FtlError::from(err)
            })?;

            let lun = self.alloc.pick_lun(true);
            let (new_ppa, new_blk) = self.alloc.alloc_page(lun, true)?;
            if let Err(err) = self.media.write_page(new_ppa, &data) {
                error!("gc write of ppa {} failed: {}", new_ppa, err);
                self.map.invalidate_orphan(luns, new_ppa);
                self.commit_page(new_blk);
                return Err(err.into());
            }

            if self.map.relocate(luns, lpa, ppa, new_ppa, new_blk) {
                trace!("gc moved lpa {} from ppa {} to {}", lpa, ppa, new_ppa);
                moved += 1;
            } else {
                trace!("gc copy of lpa {} lost to a newer write", lpa);
            }
            self.commit_page(new_blk);
        }

        if !blk.lock().invalid_pages.is_full() {
            return Err(FtlError::MapConsistency(format!(
                "block {:?} still holds valid pages after migration",
                victim
            )));
        }
        Ok(moved)
    }
}

/// Background GC: a timer thread plus a pool of workers that evaluate LUNs
/// and reclaim blocks.
pub(crate) struct GcWorkers {
    jobs: Sender<GcJob>,
    stop: Option<Sender<()>>,
    timer: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl GcWorkers {
    pub(crate) fn spawn(
        core: &Arc<FtlCore>,
        jobs: Sender<GcJob>,
        rx: Receiver<GcJob>,
        nr_workers: usize,
        interval: Duration,
    ) -> Result<Self> {
        // threads already started are stopped by Drop if a later spawn fails
        let mut gc = GcWorkers {
            jobs,
            stop: None,
            timer: None,
            workers: Vec::with_capacity(nr_workers),
        };
        for i in 0..nr_workers {
            let core = Arc::clone(core);
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("rrpc-gc-{}", i))
                .spawn(move || gc_worker(&core, &rx))?;
            gc.workers.push(handle);
        }

        let (stop, stop_rx) = channel::bounded::<()>(1);
        let timer_core = Arc::clone(core);
        let timer = thread::Builder::new()
            .name("rrpc-gc-timer".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => timer_core.gc_kick(),
                    _ => break,
                }
            })?;
        gc.stop = Some(stop);
        gc.timer = Some(timer);

        info!("GC started with {} workers, every {:?}", nr_workers, interval);
        Ok(gc)
    }

    pub(crate) fn shutdown(&mut self) {
        // dropping the sender wakes the timer with a disconnect
        self.stop.take();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        for _ in 0..self.workers.len() {
            let _ = self.jobs.send(GcJob::Shutdown);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("GC worker panicked");
            }
        }
    }
}

impl Drop for GcWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn gc_worker(core: &FtlCore, rx: &Receiver<GcJob>) {
    for job in rx.iter() {
        match job {
            GcJob::Evaluate(lun) => core.lun_gc(lun),
            GcJob::Reclaim(victim) => {
                let _ = core.reclaim_block(victim);
            }
            GcJob::Shutdown => break,
        }
    }
}
