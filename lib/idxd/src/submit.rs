// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Descriptor allocation and submission.

use core::sync::atomic::Ordering;
use core::time::Duration;
use std::sync::Arc;

use crossbeam_utils::Backoff;
use log::{trace, warn};

use crate::descriptor::{CompletionOutcome, DescriptorFlags};
use crate::device::Device;
use crate::error::IdxdError;
use crate::wq::{DescriptorPool, Descriptor, WorkQueue};

/// How long a submitter sleeps between retries on a full shared queue.
const SHARED_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Whether allocation and submission may sleep.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpType {
    Block,
    NonBlock,
}

/// Memory barrier types.
#[allow(unused)]
pub(crate) enum Barrier {
    Read,
    Write,
    ReadWrite,
}

pub(crate) fn barrier(typ: Barrier) {
    #[cfg(target_arch = "x86_64")]
    match typ {
        Barrier::Read => x86::fence::lfence(),
        Barrier::Write => x86::fence::sfence(),
        Barrier::ReadWrite => x86::fence::mfence(),
    }
    #[cfg(not(target_arch = "x86_64"))]
    match typ {
        Barrier::Read => core::sync::atomic::fence(Ordering::Acquire),
        Barrier::Write => core::sync::atomic::fence(Ordering::Release),
        Barrier::ReadWrite => core::sync::atomic::fence(Ordering::SeqCst),
    }
}

impl WorkQueue {
    /// Allocates a descriptor (`idxd_alloc_desc`).
    ///
    /// For a dedicated queue at most `size` descriptors are outstanding. A
    /// `NonBlock` caller gets [`IdxdError::Busy`] if a blocked allocation or
    /// a teardown holds the queue and [`IdxdError::TryAgain`] if the queue
    /// is full. A `Block` caller sleeps until a descriptor is freed, the
    /// queue goes away ([`IdxdError::DeviceNotReady`]) or it is
    /// interrupted ([`IdxdError::Interrupted`]).
    pub fn alloc_descriptor(&self, optype: OpType) -> Result<Descriptor, IdxdError> {
        let dev = self.device()?;
        if !self.ready(&dev) {
            return Err(IdxdError::DeviceNotReady);
        }
        let pool = self.current_pool().ok_or(IdxdError::DeviceNotReady)?;

        let id = if pool.dedicated {
            self.reserve_dedicated(&dev, &pool, optype)?;
            match pool.bitmap.get() {
                Some(id) => id,
                None => {
                    pool.inflight.dec();
                    return Err(IdxdError::TryAgain);
                }
            }
        } else {
            self.claim_shared(&dev, &pool, optype)?
        };

        Ok(self.get_desc(&dev, pool, id))
    }

    fn reserve_dedicated(
        &self,
        dev: &Device,
        pool: &DescriptorPool,
        optype: OpType,
    ) -> Result<(), IdxdError> {
        let guard = match optype {
            OpType::Block => self.submit_lock.read(),
            OpType::NonBlock => self.submit_lock.try_read().ok_or(IdxdError::Busy)?,
        };
        if pool.inflight.try_inc() {
            return Ok(());
        }
        if optype == OpType::NonBlock {
            return Err(IdxdError::TryAgain);
        }
        drop(guard);

        // Hold the queue exclusively while sleeping, so non-blocking
        // allocations don't steal the freed descriptor.
        let _guard = self.submit_lock.write();
        let mut reserved = false;
        let rc = self.submit_waitq.wait_event_interruptible(|| {
            if !self.ready(dev) {
                return true;
            }
            reserved = pool.inflight.try_inc();
            reserved
        });
        rc?;

        if !self.ready(dev) {
            if reserved {
                pool.inflight.dec();
            }
            return Err(IdxdError::DeviceNotReady);
        }
        Ok(())
    }

    fn claim_shared(
        &self,
        dev: &Device,
        pool: &DescriptorPool,
        optype: OpType,
    ) -> Result<usize, IdxdError> {
        if let Some(id) = pool.bitmap.get() {
            return Ok(id);
        }
        if optype == OpType::NonBlock {
            return Err(IdxdError::TryAgain);
        }

        let mut slot = None;
        self.submit_waitq.wait_event_interruptible(|| {
            if !self.ready(dev) {
                return true;
            }
            slot = pool.bitmap.get();
            slot.is_some()
        })?;

        match slot {
            Some(id) if self.ready(dev) => Ok(id),
            Some(id) => {
                pool.release(id);
                Err(IdxdError::DeviceNotReady)
            }
            None => Err(IdxdError::DeviceNotReady),
        }
    }

    fn get_desc(&self, dev: &Device, pool: Arc<DescriptorPool>, id: usize) -> Descriptor {
        let nvec = dev.num_wq_irqs();
        let prev = self
            .vec_ptr
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v % nvec + 1))
            .unwrap_or(0);
        let vector = prev % nvec + 1;

        pool.prepare(id, vector);
        let mut desc = Descriptor::new(pool, id);
        let hw = desc.hw_mut();
        if let Some(pasid) = dev.pasid() {
            hw.set_pasid(pasid, false);
        }
        hw.int_handle = dev.int_handle(vector);
        trace!("wq {} desc {} vector {}", self.id(), id, vector);
        desc
    }

    /// Submits a prepared descriptor (`idxd_submit_desc`).
    ///
    /// A descriptor asking for a completion interrupt is handed to the
    /// completion tracking of its vector before the portal write, so the
    /// interrupt thread can't miss it. Such a descriptor can't be submitted
    /// again before it completed ([`IdxdError::Busy`]).
    pub fn submit(&self, desc: &Descriptor, optype: OpType) -> Result<(), IdxdError> {
        let dev = self.device()?;
        if desc.wq_id() != self.id() {
            return Err(IdxdError::InvalidArgument);
        }
        if !self.ready(&dev) {
            return Err(IdxdError::DeviceNotReady);
        }

        let tracked = desc.hw().wants_interrupt();
        if tracked {
            let entry = dev
                .irq_entry(desc.vector())
                .ok_or(IdxdError::InvalidArgument)?;
            if !desc.pool().mark_submitted(desc.id()) {
                return Err(IdxdError::Busy);
            }
            entry.pending.push(desc.current_ref());
        }

        barrier(Barrier::ReadWrite);

        let rc = if desc.pool().dedicated {
            dev.backing().submit_dedicated(self.id(), desc.hw());
            Ok(())
        } else {
            self.submit_shared(&dev, desc, optype)
        };

        if rc.is_err() && tracked {
            desc.pool().invalidate(desc.id());
        }
        rc
    }

    fn submit_shared(&self, dev: &Device, desc: &Descriptor, optype: OpType) -> Result<(), IdxdError> {
        let backoff = Backoff::new();
        loop {
            let err = match dev.backing().submit_shared(self.id(), desc.hw()) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if optype == OpType::NonBlock {
                return Err(err.into());
            }
            if !self.ready(dev) {
                return Err(IdxdError::DeviceNotReady);
            }

            if backoff.is_completed() {
                self.submit_waitq
                    .wait_timeout(|| !self.ready(dev), SHARED_RETRY_INTERVAL)?;
            } else {
                backoff.snooze();
            }
        }
    }

    /// Submits `desc` and invokes `cb` from the interrupt thread once it
    /// completes. The descriptor is freed after `cb` ran; if the submission
    /// fails it is freed right away and `cb` is dropped.
    pub fn submit_with_callback<F>(&self, mut desc: Descriptor, optype: OpType, cb: F) -> Result<(), IdxdError>
    where
        F: FnOnce(CompletionOutcome) + Send + 'static,
    {
        if !desc.hw().wants_interrupt() {
            let flags = desc.hw().flags() | DescriptorFlags::RCI;
            desc.hw_mut().set_flags(flags);
        }
        desc.set_callback(Box::new(cb));

        match self.submit(&desc, optype) {
            Ok(()) => {
                desc.forget();
                Ok(())
            }
            Err(e) => {
                warn!("wq {} submission failed: {}", self.id(), e);
                Err(e)
            }
        }
    }
}
