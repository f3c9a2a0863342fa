//! Registry of logical ranges with an operation in flight.
//!
//! A request conflicts with a held range only when *both* of its endpoints
//! fall inside that range. A request that merely straddles a held range is
//! admitted. Regular I/O uses [`InflightRanges::try_acquire`] and requeues on
//! conflict. GC migration and discard use [`InflightRanges::acquire`], which
//! parks the caller until the range frees up. A parked caller is queued as a
//! waiter, and `try_acquire` also refuses ranges that conflict with a queued
//! waiter, so a stream of regular I/O cannot starve it. Parked callers are
//! admitted in queue order.

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::config::Lpa;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflightRange {
    pub start: Lpa,
    /// Inclusive.
    pub end: Lpa,
}

impl InflightRange {
    pub fn new(start: Lpa, len: usize) -> Self {
        debug_assert!(len > 0);
        InflightRange {
            start,
            end: start + len - 1,
        }
    }

    fn contains(&self, lpa: Lpa) -> bool {
        lpa >= self.start && lpa <= self.end
    }

    /// Whether `req` must wait for `self`: both of its endpoints lie within `self`.
    pub fn blocks(&self, req: &InflightRange) -> bool {
        self.contains(req.start) && self.contains(req.end)
    }
}

#[derive(Default)]
struct Registry {
    active: Vec<(u64, InflightRange)>,
    waiting: Vec<(u64, InflightRange)>,
    next_id: u64,
}

impl Registry {
    fn conflicts(&self, req: &InflightRange) -> bool {
        self.active.iter().any(|(_, r)| r.blocks(req))
    }

    /// Whether a waiter queued before `ticket` must go ahead of `req`.
    fn queued_ahead(&self, req: &InflightRange, ticket: u64) -> bool {
        self.waiting.iter().any(|(t, w)| *t < ticket && w.blocks(req))
    }

    fn insert(&mut self, range: InflightRange) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.active.push((id, range));
        id
    }
}

#[derive(Default)]
pub struct InflightRanges {
    registry: Mutex<Registry>,
    released: Condvar,
}

/// A held range; released on drop.
#[must_use = "the range is released as soon as the guard is dropped"]
pub struct InflightGuard<'a> {
    owner: &'a InflightRanges,
    id: u64,
    range: InflightRange,
}

impl InflightGuard<'_> {
    pub fn range(&self) -> InflightRange {
        self.range
    }

    pub fn release(self) {}
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.owner.release(self.id);
    }
}

impl InflightRanges {
    pub fn new() -> Self {
        InflightRanges::default()
    }

    /// Registers `[start, start + len)` unless a held range or a queued waiter
    /// blocks it.
    pub fn try_acquire(&self, start: Lpa, len: usize) -> Option<InflightGuard<'_>> {
        let range = InflightRange::new(start, len);
        let mut reg = self.registry.lock();
        if reg.conflicts(&range) || reg.queued_ahead(&range, u64::MAX) {
            trace!("inflight: [{}, {}] busy", range.start, range.end);
            return None;
        }
        let id = reg.insert(range);
        Some(InflightGuard {
            owner: self,
            id,
            range,
        })
    }

    /// Registers `[start, start + len)`, waiting for conflicting holders to
    /// release first.
    pub fn acquire(&self, start: Lpa, len: usize) -> InflightGuard<'_> {
        let range = InflightRange::new(start, len);
        let mut reg = self.registry.lock();
        if !reg.conflicts(&range) && !reg.queued_ahead(&range, u64::MAX) {
            let id = reg.insert(range);
            return InflightGuard {
                owner: self,
                id,
                range,
            };
        }

        let ticket = reg.next_id;
        reg.next_id += 1;
        reg.waiting.push((ticket, range));
        while reg.conflicts(&range) || reg.queued_ahead(&range, ticket) {
            self.released.wait(&mut reg);
        }
        reg.waiting.retain(|(t, _)| *t != ticket);
        let id = reg.insert(range);
        InflightGuard {
            owner: self,
            id,
            range,
        }
    }

    fn release(&self, id: u64) {
        let mut reg = self.registry.lock();
        if let Some(pos) = reg.active.iter().position(|(i, _)| *i == id) {
            reg.active.swap_remove(pos);
        }
        let wake = !reg.waiting.is_empty();
        drop(reg);
        if wake {
            self.released.notify_all();
        }
    }

    pub fn active(&self) -> Vec<InflightRange> {
        self.registry.lock().active.iter().map(|(_, r)| *r).collect()
    }

    pub fn waiters(&self) -> usize {
        self.registry.lock().waiting.len()
    }
}
