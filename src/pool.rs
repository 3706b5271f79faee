//! The VU pool of one scenario.
//!
//! A [`Semaphore`] with one permit per allowed VU bounds how many VUs can be
//! held at once, so the number of outstanding [`PooledVu`] guards never exceeds
//! the pool maximum. Idle VUs wait in a stack and are reused before new ones
//! are created.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{IterationError, PoolError},
    event::{EventBus, Events},
    vu::{Vu, VuFactory},
};

/// Hands out run-wide unique VU ids, starting at 1.
#[derive(Debug, Clone)]
pub struct VuIds(Arc<AtomicU64>);

impl Default for VuIds {
    fn default() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }
}

impl VuIds {
    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

struct VuSlot {
    vu: Box<dyn Vu>,
    iterations: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// VUs currently checked out.
    pub held: usize,
    /// VUs in existence, held or idle.
    pub alive: usize,
    pub created: u64,
    pub discarded: u64,
}

pub struct VuPool {
    scenario: Arc<str>,
    factory: Arc<dyn VuFactory>,
    ids: VuIds,
    events: EventBus,
    max: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<VuSlot>>,
    held: AtomicUsize,
    alive: AtomicUsize,
    created: AtomicU64,
    discarded: AtomicU64,
}

impl std::fmt::Debug for VuPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VuPool")
            .field("scenario", &self.scenario)
            .field("max", &self.max)
            .field("stats", &self.stats())
            .finish()
    }
}

impl VuPool {
    pub fn new(
        scenario: Arc<str>,
        factory: Arc<dyn VuFactory>,
        ids: VuIds,
        events: EventBus,
        max: usize,
    ) -> Self {
        Self {
            scenario,
            factory,
            ids,
            events,
            max,
            permits: Arc::new(Semaphore::new(max.min(Semaphore::MAX_PERMITS))),
            idle: Mutex::new(Vec::new()),
            held: AtomicUsize::new(0),
            alive: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            held: self.held.load(Ordering::Acquire),
            alive: self.alive.load(Ordering::Acquire),
            created: self.created.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    async fn create(&self) -> Result<VuSlot, PoolError> {
        let id = self.ids.next();
        let vu = self
            .factory
            .new_vu(id, Events::for_vu(&self.events))
            .await
            .map_err(PoolError::Init)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        self.alive.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(scenario = %self.scenario, vu = id, "VU initialized");
        Ok(VuSlot { vu, iterations: 0 })
    }

    /// Eagerly creates VUs until `n` exist (capped at the pool maximum).
    pub async fn preallocate(&self, n: usize) -> Result<(), PoolError> {
        let target = n.min(self.max);
        let missing = target.saturating_sub(self.alive.load(Ordering::Acquire));
        if missing == 0 {
            return Ok(());
        }
        tracing::debug!(scenario = %self.scenario, vus = missing, "pre-allocating VUs");
        for _ in 0..missing {
            let slot = self.create().await?;
            self.idle.lock().push(slot);
        }
        Ok(())
    }

    /// Waits for a free slot, then hands out an idle VU or creates one.
    ///
    /// Fails with [`PoolError::AllocationTimeout`] when this takes longer than
    /// `timeout`, and with [`PoolError::Cancelled`] when `cancel` fires first.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<PooledVu, PoolError> {
        let acquire = async {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| PoolError::Closed)?;
            self.checkout(permit).await
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            res = tokio::time::timeout(timeout, acquire) => {
                res.map_err(|_| PoolError::AllocationTimeout(timeout))?
            }
        }
    }

    /// Reserves a slot without waiting. `None` means every VU is busy.
    pub fn try_acquire(self: &Arc<Self>) -> Result<Option<VuReservation>, PoolError> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Ok(Some(VuReservation {
                pool: Arc::clone(self),
                permit,
            })),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(PoolError::Closed),
        }
    }

    async fn checkout(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Result<PooledVu, PoolError> {
        let idle = self.idle.lock().pop();
        let slot = match idle {
            Some(slot) => slot,
            None => self.create().await?,
        };
        self.held.fetch_add(1, Ordering::AcqRel);
        Ok(PooledVu {
            slot,
            lease: Lease {
                pool: Arc::clone(self),
                _permit: permit,
                returned: false,
            },
        })
    }

    /// Refuses further acquisitions and drops idle VUs.
    pub fn close(&self) {
        self.permits.close();
        let idle = std::mem::take(&mut *self.idle.lock());
        self.alive.fetch_sub(idle.len(), Ordering::AcqRel);
        drop(idle);
    }
}

/// A free slot obtained through [`VuPool::try_acquire`].
pub struct VuReservation {
    pool: Arc<VuPool>,
    permit: OwnedSemaphorePermit,
}

impl VuReservation {
    pub async fn checkout(self) -> Result<PooledVu, PoolError> {
        self.pool.checkout(self.permit).await
    }
}

struct Lease {
    pool: Arc<VuPool>,
    _permit: OwnedSemaphorePermit,
    returned: bool,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.held.fetch_sub(1, Ordering::AcqRel);
        if !self.returned {
            self.pool.alive.fetch_sub(1, Ordering::AcqRel);
            self.pool.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Exclusive possession of one VU.
///
/// Hand it back with [`PooledVu::release`]. Dropping the guard instead
/// discards the VU, which is what happens to an iteration cancelled midway.
pub struct PooledVu {
    slot: VuSlot,
    lease: Lease,
}

impl std::fmt::Debug for PooledVu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledVu")
            .field("id", &self.slot.vu.id())
            .field("iterations", &self.slot.iterations)
            .finish_non_exhaustive()
    }
}

impl PooledVu {
    pub fn id(&self) -> u64 {
        self.slot.vu.id()
    }

    pub fn events(&self) -> &Events {
        self.slot.vu.events()
    }

    /// Returns the per-VU iteration number and advances the counter.
    pub(crate) fn next_iteration(&mut self) -> u64 {
        let n = self.slot.iterations;
        self.slot.iterations += 1;
        n
    }

    pub fn vu_mut(&mut self) -> &mut dyn Vu {
        self.slot.vu.as_mut()
    }

    /// Returns the VU to the idle set, unless `outcome` says its state can no
    /// longer be trusted.
    pub fn release(self, outcome: Option<&IterationError>) {
        let PooledVu { slot, mut lease } = self;
        if outcome.is_some_and(IterationError::discards_vu) {
            tracing::debug!(vu = slot.vu.id(), "discarding VU");
            return;
        }
        lease.returned = true;
        if lease.pool.permits.is_closed() {
            lease.pool.alive.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        lease.pool.idle.lock().push(slot);
    }
}
