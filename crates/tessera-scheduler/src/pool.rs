//! Bounded pool of reusable request slots.
//!
//! Admission control for the scheduler: a slot is acquired before every fill
//! and returned after its completion routine ran (or after a failed
//! dispatch).  Acquisition suspends only while every slot is busy.
//!
//! Slots are added once at model initialization.  After [`SlotPool::close`]
//! waiters fail with [`EngineError::PoolClosed`] and returned slots are
//! handed back to the caller to be dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;

use tessera_core::backend::InferRequest;
use tessera_core::error::{EngineError, Result};

use crate::queue::SubInference;

/// One engine request plus the sub-inferences packed into it.
pub(crate) struct RequestSlot {
    pub id: usize,
    pub request: Box<dyn InferRequest>,
    /// Pack order; empty while the slot is idle.
    pub occupants: Vec<SubInference>,
}

impl std::fmt::Debug for RequestSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSlot")
            .field("id", &self.id)
            .field("occupancy", &self.occupants.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct SlotPool {
    idle: Mutex<VecDeque<RequestSlot>>,
    permits: Semaphore,
    capacity: AtomicUsize,
    busy: AtomicUsize,
    peak_busy: AtomicUsize,
    closed: AtomicBool,
}

impl SlotPool {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(0),
            capacity: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            peak_busy: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<RequestSlot>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand freshly created slots to the pool.
    pub fn populate(&self, slots: Vec<RequestSlot>) {
        let n = slots.len();
        self.idle().extend(slots);
        self.capacity.fetch_add(n, Ordering::AcqRel);
        self.permits.add_permits(n);
    }

    /// Take an idle slot, waiting while all are busy.
    pub async fn acquire(&self) -> Result<RequestSlot> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::PoolClosed)?;
        permit.forget();
        let Some(slot) = self.idle().pop_front() else {
            return Err(EngineError::InvariantViolation(
                "slot permit granted with no idle slot".into(),
            ));
        };
        let busy = self.busy.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_busy.fetch_max(busy, Ordering::AcqRel);
        Ok(slot)
    }

    /// Return a slot.  A closed pool refuses it and gives it back.
    pub fn release(&self, mut slot: RequestSlot) -> std::result::Result<(), RequestSlot> {
        self.busy.fetch_sub(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            return Err(slot);
        }
        slot.occupants.clear();
        self.idle().push_back(slot);
        self.permits.add_permits(1);
        Ok(())
    }

    /// Refuse further acquires and releases; returns the idle slots.
    pub fn close(&self) -> Vec<RequestSlot> {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        self.idle().drain(..).collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    pub fn peak_busy(&self) -> usize {
        self.peak_busy.load(Ordering::Acquire)
    }
}
