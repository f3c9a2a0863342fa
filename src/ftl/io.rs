use log::{error, trace, warn};

use crate::config::{Lpa, MAX_REQUEST_PAGES};
use crate::error::{FtlError, Result};
use crate::ftl::map::L2PValue;
use crate::ftl::{FtlCore, Submit};

impl FtlCore {
    fn check_range(&self, lpa: Lpa, len: usize) -> Result<()> {
        if len == 0 {
            return Err(FtlError::InvalidRequest("zero-length request".to_string()));
        }
        let max = self.map.nr_lpas();
        if lpa.checked_add(len).map_or(true, |end| end > max) {
            return Err(FtlError::OutOfRange { lpa, len, max });
        }
        Ok(())
    }

    fn check_io(&self, lpa: Lpa, len: usize) -> Result<()> {
        if len > MAX_REQUEST_PAGES {
            return Err(FtlError::InvalidRequest(format!(
                "{} pages exceeds the {} page request limit",
                len, MAX_REQUEST_PAGES
            )));
        }
        self.check_range(lpa, len)
    }

    pub(crate) fn read(&self, lpa: Lpa, len: usize) -> Result<Submit<Vec<u8>>> {
        self.check_io(lpa, len)?;
        let Some(_guard) = self.inflight.try_acquire(lpa, len) else {
            self.stats.requeue();
            return Ok(Submit::Requeue);
        };

        let mut ppas = Vec::with_capacity(len);
        for i in 0..len {
            match self.map.lookup(lpa + i) {
                L2PValue::Mapped { ppa, .. } => ppas.push(ppa),
                L2PValue::Unmapped => return Err(FtlError::Unmapped { lpa: lpa + i }),
            }
        }

        let mut buf = Vec::with_capacity(len * self.config.geometry.page_size);
        for ppa in ppas {
            let page = self.media.read_page(ppa).map_err(|err| {
                error!("read of ppa {} failed: {}", ppa, err);
                FtlError::from(err)
            })?;
            buf.extend_from_slice(&page);
        }
        Ok(Submit::Done(buf))
    }

    /// Maps and programs `data` at `lpa`. Requeues when the range is busy or a
    /// LUN is down to its reserve, kicking GC in the latter case.
    pub(crate) fn write(&self, lpa: Lpa, data: &[u8]) -> Result<Submit<()>> {
        let page_size = self.config.geometry.page_size;
        if data.len() % page_size != 0 {
            return Err(FtlError::InvalidRequest(format!(
                "write of {} bytes is not a multiple of the {} byte page",
                data.len(),
                page_size
            )));
        }
        let len = data.len() / page_size;
        self.check_io(lpa, len)?;

        let Some(guard) = self.inflight.try_acquire(lpa, len) else {
            self.stats.requeue();
            return Ok(Submit::Requeue);
        };

        // place every page before touching the map, so a refused allocation
        // leaves the old mappings intact
        let luns = self.alloc.luns();
        let mut placed = Vec::with_capacity(len);
        for _ in 0..len {
            let lun = self.alloc.pick_lun(false);
            match self.alloc.alloc_page(lun, false) {
                Ok(page) => placed.push(page),
                Err(FtlError::OutOfSpace { lun }) => {
                    warn!("lun {} is at its reserve, requeueing write at lpa {}", lun, lpa);
                    for &(ppa, block) in &placed {
                        self.map.invalidate_orphan(luns, ppa);
                        self.commit_page(block);
                    }
                    drop(guard);
                    self.stats.requeue();
                    self.gc_kick();
                    return Ok(Submit::Requeue);
                }
                Err(err) => return Err(err),
            }
        }

        for (i, &(ppa, block)) in placed.iter().enumerate() {
            self.map.update(luns, lpa + i, ppa, block);
        }

        let mut failed = None;
        for (i, (chunk, &(ppa, _))) in data.chunks(page_size).zip(&placed).enumerate() {
            if let Err(err) = self.media.write_page(ppa, chunk) {
                error!("write of ppa {} failed: {}", ppa, err);
                // later reads fail as unmapped instead of returning erased data
                self.map.unmap_failed(luns, lpa + i, ppa);
                failed.get_or_insert(err);
            }
        }
        drop(guard);

        for &(_, block) in &placed {
            self.commit_page(block);
        }
        trace!("wrote {} pages at lpa {}", len, lpa);

        match failed {
            Some(err) => Err(err.into()),
            None => Ok(Submit::Done(())),
        }
    }

    /// Unmaps `[lpa, lpa + len)`, waiting for any conflicting I/O to finish.
    pub(crate) fn discard(&self, lpa: Lpa, len: usize) -> Result<()> {
        self.check_range(lpa, len)?;
        let _guard = self.inflight.acquire(lpa, len);
        self.map.invalidate_range(self.alloc.luns(), lpa, len);
        trace!("discarded {} pages at lpa {}", len, lpa);
        Ok(())
    }
}
