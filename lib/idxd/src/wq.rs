// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Work queues and their descriptor pools.
//!
//! A kernel owned work queue has a pool of `size` descriptors. Each slot
//! consists of a 64 byte hardware descriptor, a completion record in
//! coherent memory and the software bookkeeping ([`SwDescriptor`]) the
//! interrupt path uses to signal the submitter.

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::{Arc, Weak};

use log::{debug, trace};
use parking_lot::{Mutex, RwLock};

use crate::bitmap::SlotBitmap;
use crate::config::{WqConf, WqSettings, WqType};
use crate::descriptor::{CompletionOutcome, CompletionRecord, DescriptorFlags, HwDescriptor, Opcode};
use crate::device::Device;
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::error::IdxdError;
use crate::registers::WqCfg;
use crate::sync::{BoundedCounter, Completion, WaitQueue};

/// Software state of a work queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum WqState {
    Disabled = 0,
    Enabled = 1,
}

impl From<u8> for WqState {
    fn from(v: u8) -> Self {
        match v {
            1 => WqState::Enabled,
            _ => WqState::Disabled,
        }
    }
}

/// Invoked (once) from the interrupt thread when a descriptor submitted
/// with [`WorkQueue::submit_with_callback`] completes.
pub type DescriptorCallback = Box<dyn FnOnce(CompletionOutcome) + Send>;

/// Bookkeeping of one descriptor slot.
pub(crate) struct SwDescriptor {
    /// Submitted for tracked completion and not completed yet.
    submitted: AtomicBool,
    /// Byte offset of the completion record in the pool's completion buffer.
    compl_offset: usize,
    compl_dma: u64,
    /// Bumped whenever the slot is freed, references taken for an earlier
    /// use of the slot become stale.
    generation: AtomicU32,
    vector: AtomicUsize,
    done: spin::Mutex<Option<Arc<Completion>>>,
    callback: spin::Mutex<Option<DescriptorCallback>>,
    outcome: spin::Mutex<Option<CompletionOutcome>>,
}

/// The descriptor slots of a kernel work queue.
pub(crate) struct DescriptorPool {
    pub wq_id: usize,
    pub dedicated: bool,
    hw: Box<[UnsafeCell<HwDescriptor>]>,
    compls: DmaBuffer,
    compl_size: usize,
    descs: Box<[SwDescriptor]>,
    pub bitmap: SlotBitmap,
    /// Descriptors handed out of a dedicated queue, at most `size`.
    pub inflight: BoundedCounter,
    waitq: Arc<WaitQueue>,
}

// Safety: A hardware descriptor is only written by the owner of its slot
// (whoever claimed the bit in `bitmap`), everything else is atomic or
// behind a lock.
unsafe impl Sync for DescriptorPool {}
unsafe impl Send for DescriptorPool {}

impl DescriptorPool {
    fn new<D: DmaAllocator + ?Sized>(
        wq_id: usize,
        size: usize,
        dedicated: bool,
        compl_size: usize,
        compl_align: usize,
        dma: &D,
        waitq: Arc<WaitQueue>,
    ) -> Result<Arc<DescriptorPool>, IdxdError> {
        let mut hw = Vec::new();
        hw.try_reserve_exact(size)?;
        hw.extend((0..size).map(|_| UnsafeCell::new(HwDescriptor::new())));

        // Over-allocate and align by IO address, the device only checks
        // the alignment of the address it is given.
        let compls = dma.alloc_coherent(size * compl_size + compl_align, compl_align)?;
        let aligned = (compls.iova() + compl_align as u64 - 1) & !(compl_align as u64 - 1);
        let compl_base = (aligned - compls.iova()) as usize;

        let mut descs = Vec::new();
        descs.try_reserve_exact(size)?;
        descs.extend((0..size).map(|id| SwDescriptor {
            submitted: AtomicBool::new(false),
            compl_offset: compl_base + id * compl_size,
            compl_dma: aligned + (id * compl_size) as u64,
            generation: AtomicU32::new(0),
            vector: AtomicUsize::new(0),
            done: spin::Mutex::new(None),
            callback: spin::Mutex::new(None),
            outcome: spin::Mutex::new(None),
        }));

        trace!(
            "wq {} pool: {} descriptors, completions at {:#x}",
            wq_id,
            size,
            aligned
        );

        Ok(Arc::new(DescriptorPool {
            wq_id,
            dedicated,
            hw: hw.into_boxed_slice(),
            compls,
            compl_size,
            descs: descs.into_boxed_slice(),
            bitmap: SlotBitmap::new(size),
            inflight: BoundedCounter::new(size),
            waitq,
        }))
    }

    fn hw_ptr(&self, id: usize) -> *mut HwDescriptor {
        self.hw[id].get()
    }

    fn compl_ptr(&self, id: usize) -> *mut u8 {
        unsafe { self.compls.vaddr().add(self.descs[id].compl_offset) }
    }

    fn status(&self, id: usize) -> u8 {
        // Safety: The record lies within `compls` which lives as long as we do.
        unsafe { CompletionRecord::status_at(self.compl_ptr(id)) }
    }

    /// Resets a claimed slot for a new user.
    pub fn prepare(&self, id: usize, vector: usize) {
        // Safety: The caller just claimed `id` in the bitmap.
        unsafe { (*self.hw_ptr(id)).clear() };
        self.compls
            .clear_n(self.descs[id].compl_offset, self.compl_size);
        self.descs[id].vector.store(vector, Ordering::Relaxed);
    }

    /// Returns a slot to the pool (`idxd_free_desc`).
    pub fn release(&self, id: usize) {
        let sw = &self.descs[id];
        {
            let mut outcome = sw.outcome.lock();
            sw.generation.fetch_add(1, Ordering::AcqRel);
            sw.submitted.store(false, Ordering::Release);
            *outcome = None;
            *sw.done.lock() = None;
            *sw.callback.lock() = None;
        }
        self.bitmap.clear(id);
        if self.dedicated {
            self.inflight.dec();
        }
        self.waitq.wake_all();
    }

    /// Invalidates references handed to the interrupt path for the current
    /// use of the slot (after a failed submission).
    pub fn invalidate(&self, id: usize) {
        let sw = &self.descs[id];
        let _outcome = sw.outcome.lock();
        sw.generation.fetch_add(1, Ordering::AcqRel);
        sw.submitted.store(false, Ordering::Release);
    }

    /// Claims the slot for a tracked submission. Fails while an earlier
    /// submission of the slot has not completed.
    pub fn mark_submitted(&self, id: usize) -> bool {
        !self.descs[id].submitted.swap(true, Ordering::AcqRel)
    }

    pub fn current_ref(self: &Arc<Self>, id: usize) -> DescRef {
        DescRef {
            pool: self.clone(),
            id,
            generation: self.descs[id].generation.load(Ordering::Acquire),
        }
    }
}

/// A reference to one submission of a descriptor slot, held by the
/// completion lists of an interrupt vector.
#[derive(Clone)]
pub(crate) struct DescRef {
    pool: Arc<DescriptorPool>,
    id: usize,
    generation: u32,
}

impl fmt::Debug for DescRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescRef")
            .field("wq", &self.pool.wq_id)
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl DescRef {
    fn sw(&self) -> &SwDescriptor {
        &self.pool.descs[self.id]
    }

    /// The slot was freed (and maybe reused) since this reference was taken.
    pub fn is_stale(&self) -> bool {
        self.sw().generation.load(Ordering::Acquire) != self.generation
    }

    pub fn wq_id(&self) -> usize {
        self.pool.wq_id
    }

    pub fn status(&self) -> u8 {
        self.pool.status(self.id)
    }

    /// Does a fault address reported by the device name this descriptor or
    /// its completion record?
    pub fn matches_addr(&self, addr: u64) -> bool {
        addr == self.pool.hw_ptr(self.id) as u64
            || addr == self.sw().compl_dma
            || addr == self.pool.compl_ptr(self.id) as u64
    }

    /// Signals the submitter. Returns false (and does nothing) for a stale
    /// reference.
    pub fn complete(&self, outcome: CompletionOutcome) -> bool {
        let sw = self.sw();
        let mut recorded = sw.outcome.lock();
        if self.is_stale() {
            return false;
        }
        *recorded = Some(outcome);
        sw.submitted.store(false, Ordering::Release);
        let done = sw.done.lock().clone();
        let callback = if done.is_none() {
            sw.callback.lock().take()
        } else {
            None
        };
        drop(recorded);

        if let Some(done) = done {
            done.complete();
        } else if let Some(cb) = callback {
            self.pool.release(self.id);
            cb(outcome);
        }
        true
    }
}

/// A descriptor allocated from a work queue.
///
/// Dropping the descriptor returns it to its queue.
pub struct Descriptor {
    pool: Arc<DescriptorPool>,
    id: usize,
    owned: bool,
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("wq", &self.pool.wq_id)
            .field("id", &self.id)
            .field("vector", &self.vector())
            .finish()
    }
}

impl Descriptor {
    pub(crate) fn new(pool: Arc<DescriptorPool>, id: usize) -> Descriptor {
        Descriptor {
            pool,
            id,
            owned: true,
        }
    }

    /// Slot index within the queue's pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn wq_id(&self) -> usize {
        self.pool.wq_id
    }

    /// Interrupt vector completions of this descriptor are delivered on.
    pub fn vector(&self) -> usize {
        self.pool.descs[self.id].vector.load(Ordering::Relaxed)
    }

    pub fn hw(&self) -> &HwDescriptor {
        unsafe { &*self.pool.hw_ptr(self.id) }
    }

    pub fn hw_mut(&mut self) -> &mut HwDescriptor {
        unsafe { &mut *self.pool.hw_ptr(self.id) }
    }

    /// IO address of the hardware descriptor.
    pub fn hw_addr(&self) -> u64 {
        self.pool.hw_ptr(self.id) as u64
    }

    /// IO address of the completion record.
    pub fn completion_addr(&self) -> u64 {
        self.pool.descs[self.id].compl_dma
    }

    pub fn completion_record(&self) -> *const u8 {
        self.pool.compl_ptr(self.id)
    }

    /// Current completion status byte, 0 while the device has not written
    /// the record.
    pub fn status(&self) -> u8 {
        self.pool.status(self.id)
    }

    /// Completion signalled by the interrupt path once the descriptor is
    /// done.
    pub fn set_done(&mut self, done: Option<Arc<Completion>>) {
        *self.pool.descs[self.id].done.lock() = done;
    }

    /// How the descriptor finished, `None` until it was completed by the
    /// interrupt path.
    pub fn outcome(&self) -> Option<CompletionOutcome> {
        *self.pool.descs[self.id].outcome.lock()
    }

    /// Fills in an operation, the completion record of the slot is used.
    pub fn prep(&mut self, opcode: Opcode, src: u64, dst: u64, len: u32, flags: DescriptorFlags) {
        let compl = self.completion_addr();
        self.hw_mut().prep(opcode, src, dst, len, flags, compl);
    }

    pub(crate) fn pool(&self) -> &Arc<DescriptorPool> {
        &self.pool
    }

    pub(crate) fn current_ref(&self) -> DescRef {
        self.pool.current_ref(self.id)
    }

    pub(crate) fn set_callback(&mut self, cb: DescriptorCallback) {
        *self.pool.descs[self.id].done.lock() = None;
        *self.pool.descs[self.id].callback.lock() = Some(cb);
    }

    /// Hands the slot over to the interrupt path, which frees it after
    /// running the callback.
    pub(crate) fn forget(mut self) {
        self.owned = false;
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        if self.owned {
            self.pool.release(self.id);
        }
    }
}

/// A hardware work queue.
pub struct WorkQueue {
    id: usize,
    dev: Weak<Device>,
    pub(crate) conf: Mutex<WqConf>,
    state: AtomicU8,
    /// Cleared first when the queue is torn down so no new descriptor is
    /// handed out.
    pub(crate) accepting: AtomicBool,
    /// Taken for writing by a blocked allocation (and by teardown), so
    /// non-blocking allocations back off with `Busy`.
    pub(crate) submit_lock: RwLock<()>,
    pub(crate) submit_waitq: Arc<WaitQueue>,
    pub(crate) pool: spin::RwLock<Option<Arc<DescriptorPool>>>,
    /// Round-robin interrupt vector selection.
    pub(crate) vec_ptr: AtomicUsize,
    err_events: AtomicU64,
    err_waitq: WaitQueue,
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl WorkQueue {
    pub(crate) fn new(id: usize, dev: Weak<Device>) -> WorkQueue {
        WorkQueue {
            id,
            dev,
            conf: Mutex::new(WqConf::default()),
            state: AtomicU8::new(WqState::Disabled as u8),
            accepting: AtomicBool::new(false),
            submit_lock: RwLock::new(()),
            submit_waitq: Arc::new(WaitQueue::new()),
            pool: spin::RwLock::new(None),
            vec_ptr: AtomicUsize::new(0),
            err_events: AtomicU64::new(0),
            err_waitq: WaitQueue::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WqState {
        WqState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: WqState) {
        self.state.store(state as u8, Ordering::Release);
        if state == WqState::Disabled {
            self.accepting.store(false, Ordering::Release);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == WqState::Enabled
    }

    pub fn settings(&self) -> WqSettings {
        self.conf.lock().settings.clone()
    }

    /// Last WQCFG value written to (or loaded from) the device.
    pub fn wqcfg(&self) -> WqCfg {
        self.conf.lock().wqcfg
    }

    pub(crate) fn device(&self) -> Result<Arc<Device>, IdxdError> {
        self.dev.upgrade().ok_or(IdxdError::NoDevice)
    }

    pub(crate) fn current_pool(&self) -> Option<Arc<DescriptorPool>> {
        self.pool.read().clone()
    }

    /// Can descriptors be handed out and submitted?
    pub(crate) fn ready(&self, dev: &Device) -> bool {
        dev.is_enabled() && self.is_enabled() && self.accepting.load(Ordering::Acquire)
    }

    /// Allocates the descriptor pool of a kernel queue. Does nothing for
    /// other queue types.
    pub fn allocate_resources(&self) -> Result<(), IdxdError> {
        let conf = self.conf.lock();
        if conf.settings.wq_type != WqType::Kernel {
            return Ok(());
        }
        let size = conf.settings.size as usize;
        if size == 0 {
            return Err(IdxdError::InvalidConfig);
        }

        let dev = self.device()?;
        let dtype = dev.device_type();
        let pool = DescriptorPool::new(
            self.id,
            size,
            conf.settings.is_dedicated(),
            dtype.compl_size(),
            dtype.compl_align(),
            dev.backing(),
            self.submit_waitq.clone(),
        )?;
        *self.pool.write() = Some(pool);
        debug!("wq {} allocated {} descriptors", self.id, size);
        Ok(())
    }

    /// Drops the descriptor pool. Descriptors still held by users keep
    /// their slot memory alive until they are freed.
    pub fn free_resources(&self) {
        if self.pool.write().take().is_some() {
            debug!("wq {} descriptors freed", self.id);
        }
    }

    pub fn has_resources(&self) -> bool {
        self.pool.read().is_some()
    }

    /// Descriptors currently allocated from the pool.
    pub fn descriptors_in_use(&self) -> usize {
        self.pool.read().as_ref().map_or(0, |p| p.bitmap.weight())
    }

    /// Returns a descriptor to the queue (`idxd_free_desc`), same as
    /// dropping it.
    pub fn free_descriptor(&self, desc: Descriptor) {
        debug_assert_eq!(desc.wq_id(), self.id);
        drop(desc);
    }

    /// Wakes blocked allocations and submissions of this queue with
    /// [`IdxdError::Interrupted`].
    pub fn interrupt_waiters(&self) {
        self.submit_waitq.interrupt_all();
    }

    pub(crate) fn notify_error(&self) {
        self.err_events.fetch_add(1, Ordering::AcqRel);
        self.err_waitq.wake_all();
    }

    /// Number of software errors reported against this queue so far.
    pub fn error_events(&self) -> u64 {
        self.err_events.load(Ordering::Acquire)
    }

    /// Waits until more than `seen` errors were reported. Returns false on
    /// timeout.
    pub fn wait_error_event(&self, seen: u64, timeout: Duration) -> Result<bool, IdxdError> {
        self.err_waitq
            .wait_timeout(|| self.error_events() > seen, timeout)
    }
}
