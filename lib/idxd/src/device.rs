// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! The device: probing, the administrative command interface and the
//! device/work queue state machine.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use arrayvec::ArrayVec;
use crossbeam_utils::Backoff;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::{Group, WqType};
use crate::descriptor::{
    CompletionOutcome, DSA_COMPLETION_ALIGN, DSA_COMPLETION_SIZE, IAX_COMPLETION_ALIGN,
    IAX_COMPLETION_SIZE,
};
use crate::error::IdxdError;
use crate::irq::{InterruptHandler, IrqEntry};
use crate::pci::DeviceBacking;
use crate::registers::*;
use crate::sync::Completion;
use crate::wq::{WorkQueue, WqState};

/// PCI device id of DSA.
pub const PCI_DEVICE_ID_INTEL_DSA_SPR0: u16 = 0x0b25;
/// PCI device id of IAX.
pub const PCI_DEVICE_ID_INTEL_IAX_SPR0: u16 = 0x0cfe;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceType {
    /// Data Streaming Accelerator.
    Dsa,
    /// In-Memory Analytics Accelerator.
    Iax,
}

impl DeviceType {
    pub fn from_pci_id(device_id: u16) -> Result<DeviceType, IdxdError> {
        match device_id {
            PCI_DEVICE_ID_INTEL_DSA_SPR0 => Ok(DeviceType::Dsa),
            PCI_DEVICE_ID_INTEL_IAX_SPR0 => Ok(DeviceType::Iax),
            _ => Err(IdxdError::NoDevice),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::Dsa => "dsa",
            DeviceType::Iax => "iax",
        }
    }

    pub fn compl_size(&self) -> usize {
        match self {
            DeviceType::Dsa => DSA_COMPLETION_SIZE,
            DeviceType::Iax => IAX_COMPLETION_SIZE,
        }
    }

    pub fn compl_align(&self) -> usize {
        match self {
            DeviceType::Dsa => DSA_COMPLETION_ALIGN,
            DeviceType::Iax => IAX_COMPLETION_ALIGN,
        }
    }
}

/// Software state of the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    /// Needs a reset (or a restart after a software reset failed).
    Halted = 0,
    Disabled = 1,
    /// Configuration was accepted, the device can be enabled.
    ConfigReady = 2,
    Enabled = 3,
}

impl From<u8> for DeviceState {
    fn from(v: u8) -> Self {
        match v {
            1 => DeviceState::Disabled,
            2 => DeviceState::ConfigReady,
            3 => DeviceState::Enabled,
            _ => DeviceState::Halted,
        }
    }
}

/// Result of an enable/disable request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StateChange {
    Transitioned,
    /// The target already was in the requested state, nothing was done.
    AlreadyInState,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    /// PASID used for kernel queues and descriptors (`None` disables PASID
    /// use and with it shared queues).
    pub pasid: Option<u32>,
}

/// A decoded software error record (SWERR).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SwError {
    pub raw: [u64; 4],
    pub valid: bool,
    pub overflow: bool,
    pub desc_valid: bool,
    pub wq_index: Option<usize>,
    pub error_code: u8,
    pub operation: u8,
    pub pasid: u32,
    pub fault_address: Option<u64>,
}

impl From<SwErrReg> for SwError {
    fn from(reg: SwErrReg) -> SwError {
        SwError {
            raw: reg.0,
            valid: reg.valid(),
            overflow: reg.overflow(),
            desc_valid: reg.desc_valid(),
            wq_index: if reg.wq_idx_valid() {
                Some(reg.wq_idx())
            } else {
                None
            },
            error_code: reg.error(),
            operation: reg.operation(),
            pasid: reg.pasid(),
            fault_address: match reg.fault_addr() {
                0 => None,
                addr => Some(addr),
            },
        }
    }
}

/// Capabilities read from the device at probe time.
#[derive(Debug, Copy, Clone)]
pub struct HwCaps {
    pub version: u32,
    pub gen_cap: GenCap,
    pub wq_cap: WqCap,
    pub group_cap: GroupCap,
    pub engine_cap: EngineCap,
    pub opcap: [u64; 4],
    pub offsets: TableOffsets,
    pub max_wqs: usize,
    pub max_groups: usize,
    pub max_engines: usize,
    pub max_tokens: u32,
    pub max_wq_size: u32,
    pub max_xfer_bytes: u64,
    pub max_batch_size: u32,
}

impl HwCaps {
    fn read(regs: &dyn DeviceBacking) -> Result<HwCaps, IdxdError> {
        let gen_cap = GenCap(regs.read64(IDXD_GENCAP_OFFSET));
        let wq_cap = WqCap(regs.read64(IDXD_WQCAP_OFFSET));
        let group_cap = GroupCap(regs.read64(IDXD_GRPCAP_OFFSET));
        let engine_cap = EngineCap(regs.read64(IDXD_ENGCAP_OFFSET));
        let mut opcap = [0u64; 4];
        for (i, op) in opcap.iter_mut().enumerate() {
            *op = regs.read64(IDXD_OPCAP_OFFSET + i as u64 * 8);
        }

        let caps = HwCaps {
            version: regs.read32(IDXD_VERSION_OFFSET),
            gen_cap,
            wq_cap,
            group_cap,
            engine_cap,
            opcap,
            offsets: TableOffsets(regs.read64(IDXD_TABLE_OFFSET)),
            max_wqs: wq_cap.num_wqs(),
            max_groups: group_cap.num_groups(),
            max_engines: engine_cap.num_engines(),
            max_tokens: group_cap.total_tokens(),
            max_wq_size: wq_cap.total_wq_size(),
            max_xfer_bytes: 1u64 << gen_cap.max_xfer_shift(),
            max_batch_size: 1u32 << gen_cap.max_batch_shift(),
        };

        if caps.max_wqs == 0
            || caps.max_wqs > IDXD_MAX_WQS
            || caps.max_groups == 0
            || caps.max_groups > IDXD_MAX_GROUPS
            || caps.max_engines == 0
            || caps.max_engines > IDXD_MAX_ENGINES
        {
            error!("Unsupported device capabilities: {:?}", caps);
            return Err(IdxdError::NotSupported);
        }
        Ok(caps)
    }
}

/// Device state guarded by the device lock.
pub(crate) struct DeviceInner {
    /// An administrative command is in flight.
    pub cmd_running: bool,
    /// Signalled by the misc interrupt when the command finished.
    pub cmd_done: Option<Arc<Completion>>,
    /// The misc interrupt thread is restarting a halted device, it owns
    /// the command interface until the restart finished.
    pub restarting: bool,
    pub groups: ArrayVec<Group, IDXD_MAX_GROUPS>,
    /// Group of each engine.
    pub engines: ArrayVec<Option<usize>, IDXD_MAX_ENGINES>,
    pub token_limit: u32,
    pub sw_err: Option<SwError>,
}

/// An idxd device.
pub struct Device {
    pub(crate) backing: Box<dyn DeviceBacking>,
    pub(crate) dtype: DeviceType,
    pub(crate) pasid: Option<u32>,
    pub(crate) hw: HwCaps,
    state: AtomicU8,
    pub(crate) inner: Mutex<DeviceInner>,
    /// Command issuers waiting for `cmd_running` to clear.
    cmd_waitq: Condvar,
    pub(crate) wqs: ArrayVec<Arc<WorkQueue>, IDXD_MAX_WQS>,
    pub(crate) irq_entries: Box<[IrqEntry]>,
    /// Interrupt handles, indexed by vector (vector 0 unused).
    int_handles: spin::RwLock<Vec<u16>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("type", &self.dtype)
            .field("state", &self.state())
            .field("wqs", &self.wqs.len())
            .field("vectors", &self.irq_entries.len())
            .finish()
    }
}

impl Device {
    /// Brings up a device (`idxd_probe`): reads the capabilities, resets
    /// the device, enables its interrupts and requests interrupt handles.
    ///
    /// The device is in [`DeviceState::ConfigReady`] afterwards.
    pub fn probe(
        backing: Box<dyn DeviceBacking>,
        dtype: DeviceType,
        opts: ProbeOptions,
    ) -> Result<Arc<Device>, IdxdError> {
        let hw = HwCaps::read(&*backing)?;
        let msix = backing.msix_count();
        if msix < 2 {
            error!("Need at least 2 MSI-X vectors, device has {}", msix);
            return Err(IdxdError::NotSupported);
        }
        info!(
            "{} version {:#x}: {} wqs (total size {}), {} groups, {} engines, {} vectors",
            dtype.name(),
            hw.version,
            hw.max_wqs,
            hw.max_wq_size,
            hw.max_groups,
            hw.max_engines,
            msix
        );

        let dev = Arc::new_cyclic(|weak: &Weak<Device>| Device {
            backing,
            dtype,
            pasid: opts.pasid,
            hw,
            state: AtomicU8::new(DeviceState::Disabled as u8),
            inner: Mutex::new(DeviceInner {
                cmd_running: false,
                cmd_done: None,
                restarting: false,
                groups: (0..hw.max_groups).map(Group::new).collect(),
                engines: (0..hw.max_engines).map(|_| None).collect(),
                token_limit: 0,
                sw_err: None,
            }),
            cmd_waitq: Condvar::new(),
            wqs: (0..hw.max_wqs)
                .map(|id| Arc::new(WorkQueue::new(id, weak.clone())))
                .collect(),
            irq_entries: (0..msix).map(IrqEntry::new).collect(),
            int_handles: spin::RwLock::new(Vec::new()),
        });

        let handler: Weak<Device> = Arc::downgrade(&dev);
        dev.backing
            .register_interrupt_handler(handler as Weak<dyn InterruptHandler>);

        dev.init_reset()?;
        if !hw.gen_cap.config_en() {
            let mut inner = dev.inner.lock();
            dev.load_config(&mut inner);
        }

        dev.unmask_error_interrupts();
        for v in 0..msix {
            dev.unmask_msix_vector(v)?;
        }

        if hw.gen_cap.int_handle_req() {
            let mut handles = vec![0u16; msix];
            for (v, handle) in handles.iter_mut().enumerate().skip(1) {
                *handle = dev.request_int_handle(v)?;
            }
            *dev.int_handles.write() = handles;
        }

        dev.set_state(DeviceState::ConfigReady);
        info!("{} device probed", dtype.name());
        Ok(dev)
    }

    pub fn device_type(&self) -> DeviceType {
        self.dtype
    }

    pub fn pasid(&self) -> Option<u32> {
        self.pasid
    }

    pub fn caps(&self) -> &HwCaps {
        &self.hw
    }

    pub(crate) fn backing(&self) -> &dyn DeviceBacking {
        &*self.backing
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: DeviceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == DeviceState::Enabled
    }

    pub fn num_wqs(&self) -> usize {
        self.wqs.len()
    }

    pub fn wq(&self, id: usize) -> Result<Arc<WorkQueue>, IdxdError> {
        self.wqs.get(id).cloned().ok_or(IdxdError::InvalidArgument)
    }

    /// Number of vectors available for completions (all but the misc one).
    pub fn num_wq_irqs(&self) -> usize {
        self.irq_entries.len() - 1
    }

    pub(crate) fn irq_entry(&self, vector: usize) -> Option<&IrqEntry> {
        self.irq_entries.get(vector)
    }

    /// Interrupt handle a descriptor completing on `vector` must carry.
    pub(crate) fn int_handle(&self, vector: usize) -> u16 {
        self.int_handles
            .read()
            .get(vector)
            .copied()
            .unwrap_or(vector as u16)
    }

    /// The last software error reported by the device.
    pub fn last_error(&self) -> Option<SwError> {
        self.inner.lock().sw_err
    }

    fn hw_state(&self) -> HwDeviceState {
        GenStatus(self.backing.read32(IDXD_GENSTATS_OFFSET)).state()
    }

    /// Issues an administrative command and waits for the misc interrupt
    /// signalling its completion. Returns the command status (CMDSTS).
    ///
    /// Commands are serialized, a second issuer waits until the first one
    /// has read its status. Fails with [`IdxdError::DeviceNotReady`] while
    /// the device is halted (only a reset is accepted then) or being
    /// restarted.
    pub fn execute_command(&self, cmd: Command, operand: u32) -> Result<u32, IdxdError> {
        let done = Arc::new(Completion::new());
        let mut inner = self.inner.lock();
        loop {
            if !self.accepts_command(&inner, cmd) {
                debug!("rejecting cmd {:?}, device {:?}", cmd, self.state());
                return Err(IdxdError::DeviceNotReady);
            }
            if !inner.cmd_running {
                break;
            }
            self.cmd_waitq.wait(&mut inner);
        }

        debug!("sending cmd: {:?} operand: {:#x}", cmd, operand);
        inner.cmd_running = true;
        inner.cmd_done = Some(done.clone());
        self.backing
            .write32(IDXD_CMD_OFFSET, CommandReg::new(cmd, operand, true).0);
        drop(inner);

        done.wait();

        let mut inner = self.inner.lock();
        let status = self.backing.read32(IDXD_CMDSTS_OFFSET);
        inner.cmd_running = false;
        inner.cmd_done = None;
        self.cmd_waitq.notify_all();
        debug!("cmd {:?} status: {:#x}", cmd, status);
        Ok(status)
    }

    /// Takes the locked state, a halt is entered under the same lock.
    fn accepts_command(&self, inner: &DeviceInner, cmd: Command) -> bool {
        if inner.restarting {
            return false;
        }
        self.state() != DeviceState::Halted || cmd == Command::ResetDevice
    }

    /// Marks the device halted. A pending command is completed, nobody
    /// else will. With `restart` set the caller owns the command interface
    /// until [`Device::finish_restart`].
    pub(crate) fn enter_halt(&self, restart: bool) {
        let mut inner = self.inner.lock();
        self.set_state(DeviceState::Halted);
        inner.restarting = restart;
        if let Some(done) = inner.cmd_done.take() {
            done.complete();
        }
        self.cmd_waitq.notify_all();
    }

    pub(crate) fn finish_restart(&self) {
        let mut inner = self.inner.lock();
        inner.restarting = false;
        self.cmd_waitq.notify_all();
    }

    /// Issues a command without asking for a completion interrupt and
    /// polls CMDSTS. Used while interrupts can't be relied upon (reset and
    /// restart from the misc interrupt thread).
    pub(crate) fn execute_command_polled(&self, cmd: Command, operand: u32) -> u32 {
        let mut inner = self.inner.lock();
        while inner.cmd_running {
            // The issuer may wait for an interrupt only the caller of this
            // function can service.
            if let Some(done) = inner.cmd_done.take() {
                done.complete();
            }
            self.cmd_waitq.wait(&mut inner);
        }

        debug!("sending cmd (polled): {:?} operand: {:#x}", cmd, operand);
        self.backing
            .write32(IDXD_CMD_OFFSET, CommandReg::new(cmd, operand, false).0);
        let backoff = Backoff::new();
        let mut status = self.backing.read32(IDXD_CMDSTS_OFFSET);
        while status & IDXD_CMDSTS_ACTIVE != 0 {
            backoff.snooze();
            status = self.backing.read32(IDXD_CMDSTS_OFFSET);
        }
        drop(inner);
        debug!("cmd {:?} status: {:#x}", cmd, status);
        status
    }

    /// Resets the device at probe time.
    pub fn init_reset(&self) -> Result<(), IdxdError> {
        let status = self.execute_command_polled(Command::ResetDevice, 0);
        if status != IDXD_CMDSTS_SUCCESS {
            error!("Device reset failed: {:#x}", status);
            return Err(IdxdError::CommandFailed { status });
        }
        self.clear_wq_states();
        self.set_state(DeviceState::Disabled);
        debug!("Device reset complete");
        Ok(())
    }

    pub fn enable_device(&self) -> Result<StateChange, IdxdError> {
        if self.is_enabled() || self.hw_state() == HwDeviceState::Enabled {
            return Ok(StateChange::AlreadyInState);
        }
        if self.state() != DeviceState::ConfigReady {
            return Err(IdxdError::InvalidState);
        }

        match self.execute_command(Command::EnableDevice, 0)? {
            IDXD_CMDSTS_SUCCESS => {}
            IDXD_CMDSTS_ERR_DEV_ENABLED => return Ok(StateChange::AlreadyInState),
            status => {
                error!("Enabling device failed: {:#x}", status);
                return Err(IdxdError::CommandFailed { status });
            }
        }

        self.set_state(DeviceState::Enabled);
        info!("{} device enabled", self.dtype.name());
        Ok(StateChange::Transitioned)
    }

    /// Disables the device. All work queues are disabled implicitly,
    /// blocked allocations return [`IdxdError::DeviceNotReady`].
    pub fn disable_device(&self) -> Result<StateChange, IdxdError> {
        if self.hw_state() != HwDeviceState::Enabled {
            return Ok(StateChange::AlreadyInState);
        }

        let status = self.execute_command(Command::DisableDevice, 0)?;
        if status != IDXD_CMDSTS_SUCCESS && status & IDXD_CMDSTS_ERR_DIS_DEV_EN == 0 {
            error!("Disabling device failed: {:#x}", status);
            return Err(IdxdError::CommandFailed { status });
        }

        self.set_state(DeviceState::ConfigReady);
        self.clear_wq_states();
        info!("{} device disabled", self.dtype.name());
        Ok(StateChange::Transitioned)
    }

    /// Resets the device, its configuration has to be written again.
    pub fn reset_device(&self) -> Result<(), IdxdError> {
        let status = self.execute_command(Command::ResetDevice, 0)?;
        if status != IDXD_CMDSTS_SUCCESS {
            error!("Resetting device failed: {:#x}", status);
            return Err(IdxdError::CommandFailed { status });
        }
        self.set_state(DeviceState::Disabled);
        self.clear_wq_states();
        Ok(())
    }

    pub(crate) fn clear_wq_states(&self) {
        for wq in self.wqs.iter() {
            wq.set_state(WqState::Disabled);
            wq.submit_waitq.wake_all();
        }
    }

    /// Marks the device halted and shuts every queue.
    pub(crate) fn halt_wqs(&self) {
        self.set_state(DeviceState::Halted);
        self.clear_wq_states();
    }

    /// Brings a device back after a halt that only needs a software reset.
    /// Queues that were enabled before get enabled again.
    pub(crate) fn restart(&self) -> Result<(), IdxdError> {
        let enabled: Vec<usize> = self
            .wqs
            .iter()
            .filter(|wq| wq.is_enabled())
            .map(|wq| wq.id())
            .collect();

        let rc = self.reset_and_reenable(&enabled);
        if rc.is_err() {
            self.halt_wqs();
        }
        rc
    }

    fn reset_and_reenable(&self, enabled: &[usize]) -> Result<(), IdxdError> {
        let status = self.execute_command_polled(Command::ResetDevice, 0);
        if status != IDXD_CMDSTS_SUCCESS {
            return Err(IdxdError::CommandFailed { status });
        }

        {
            let mut inner = self.inner.lock();
            self.device_config(&mut inner)?;
        }

        let status = self.execute_command_polled(Command::EnableDevice, 0);
        if status != IDXD_CMDSTS_SUCCESS {
            return Err(IdxdError::CommandFailed { status });
        }
        self.set_state(DeviceState::Enabled);

        for id in enabled.iter().copied() {
            let status = self.execute_command_polled(Command::EnableWq, id as u32);
            if status != IDXD_CMDSTS_SUCCESS && status != IDXD_CMDSTS_ERR_WQ_ENABLED {
                warn!("Unable to re-enable wq {} after restart: {:#x}", id, status);
                self.wqs[id].set_state(WqState::Disabled);
            }
        }
        info!("{} device restarted", self.dtype.name());
        Ok(())
    }

    /// Enables a work queue. The device must be enabled.
    pub fn enable_queue(&self, wq_id: usize) -> Result<StateChange, IdxdError> {
        let wq = self.wq(wq_id)?;
        if wq.is_enabled() {
            return Ok(StateChange::AlreadyInState);
        }
        if !self.is_enabled() {
            return Err(IdxdError::DeviceNotReady);
        }

        match self.execute_command(Command::EnableWq, wq_id as u32)? {
            IDXD_CMDSTS_SUCCESS => {}
            IDXD_CMDSTS_ERR_WQ_ENABLED => {
                debug!("wq {} already enabled", wq_id);
                wq.set_state(WqState::Enabled);
                wq.accepting.store(true, Ordering::Release);
                return Ok(StateChange::AlreadyInState);
            }
            status => {
                error!("WQ {} enable failed: {:#x}", wq_id, status);
                return Err(IdxdError::CommandFailed { status });
            }
        }

        wq.set_state(WqState::Enabled);
        wq.accepting.store(true, Ordering::Release);
        debug!("WQ {} enabled", wq_id);
        Ok(StateChange::Transitioned)
    }

    /// Disables a work queue, no command is issued if it is not enabled.
    pub fn disable_queue(&self, wq_id: usize) -> Result<StateChange, IdxdError> {
        let wq = self.wq(wq_id)?;
        if !wq.is_enabled() {
            return Ok(StateChange::AlreadyInState);
        }

        let status = self.execute_command(Command::DisableWq, wq_operand(wq_id))?;
        if status != IDXD_CMDSTS_SUCCESS {
            error!("WQ {} disable failed: {:#x}", wq_id, status);
            return Err(IdxdError::CommandFailed { status });
        }

        wq.set_state(WqState::Disabled);
        wq.submit_waitq.wake_all();
        debug!("WQ {} disabled", wq_id);
        Ok(StateChange::Transitioned)
    }

    /// Waits until the device processed every descriptor submitted to the
    /// queue.
    pub fn drain_queue(&self, wq_id: usize) -> Result<(), IdxdError> {
        let wq = self.wq(wq_id)?;
        if !wq.is_enabled() {
            return Ok(());
        }
        let status = self.execute_command(Command::DrainWq, wq_operand(wq_id))?;
        debug!("WQ {} drained: {:#x}", wq_id, status);
        Ok(())
    }

    /// Aborts the descriptors queued in the device. Tracked descriptors of
    /// the queue the device did not finish complete as
    /// [`CompletionOutcome::Aborted`].
    pub fn abort_queue(&self, wq_id: usize) -> Result<(), IdxdError> {
        let wq = self.wq(wq_id)?;
        if !wq.is_enabled() {
            return Err(IdxdError::InvalidState);
        }

        let status = self.execute_command(Command::AbortWq, wq_operand(wq_id))?;
        if status != IDXD_CMDSTS_SUCCESS {
            error!("WQ {} abort failed: {:#x}", wq_id, status);
            return Err(IdxdError::CommandFailed { status });
        }
        let flushed = self.flush_wq_descriptors(wq_id, CompletionOutcome::Aborted);
        debug!("WQ {} aborted, {} descriptors flushed", wq_id, flushed);
        Ok(())
    }

    pub fn drain_pasid(&self, pasid: u32) -> Result<(), IdxdError> {
        let status = self.execute_command(Command::DrainPasid, pasid & 0xf_ffff)?;
        if status != IDXD_CMDSTS_SUCCESS {
            return Err(IdxdError::CommandFailed { status });
        }
        Ok(())
    }

    pub fn abort_pasid(&self, pasid: u32) -> Result<(), IdxdError> {
        let status = self.execute_command(Command::AbortPasid, pasid & 0xf_ffff)?;
        if status != IDXD_CMDSTS_SUCCESS {
            return Err(IdxdError::CommandFailed { status });
        }
        Ok(())
    }

    /// Asks the device for the interrupt handle of MSI-X vector `idx`.
    pub fn request_int_handle(&self, idx: usize) -> Result<u16, IdxdError> {
        if !self.hw.gen_cap.int_handle_req() {
            return Err(IdxdError::NotSupported);
        }

        let status = self.execute_command(Command::RequestIntHandle, idx as u32 & 0xffff)?;
        if status & 0xff != IDXD_CMDSTS_SUCCESS {
            error!("Requesting interrupt handle for vector {} failed: {:#x}", idx, status);
            return Err(IdxdError::CommandFailed { status });
        }
        let handle = ((status >> 8) & 0xffff) as u16;
        debug!("interrupt handle for vector {}: {:#x}", idx, handle);
        Ok(handle)
    }

    fn msix_perm_offset(&self, vector: usize) -> Result<u64, IdxdError> {
        if vector >= self.irq_entries.len() {
            return Err(IdxdError::InvalidArgument);
        }
        Ok(self.hw.offsets.msix_perm() + vector as u64 * MSIX_PERM_STRIDE)
    }

    pub fn mask_msix_vector(&self, vector: usize) -> Result<(), IdxdError> {
        let offset = self.msix_perm_offset(vector)?;
        let mut perm = MsixPerm(self.backing.read32(offset));
        perm.set_ignore(true);
        self.backing.write32(offset, perm.0);
        Ok(())
    }

    pub fn unmask_msix_vector(&self, vector: usize) -> Result<(), IdxdError> {
        let offset = self.msix_perm_offset(vector)?;
        let mut perm = MsixPerm(self.backing.read32(offset));
        perm.set_ignore(false);
        self.backing.write32(offset, perm.0);
        // Flush the posted write.
        let _ = self.backing.read32(offset);
        Ok(())
    }

    pub fn mask_msix_vectors(&self) {
        for v in 0..self.irq_entries.len() {
            let _ = self.mask_msix_vector(v);
        }
    }

    pub fn unmask_error_interrupts(&self) {
        let mut ctrl = GenCtrl(self.backing.read32(IDXD_GENCTRL_OFFSET));
        ctrl.set_softerr_int_en(true);
        self.backing.write32(IDXD_GENCTRL_OFFSET, ctrl.0);
    }

    pub fn mask_error_interrupts(&self) {
        let mut ctrl = GenCtrl(self.backing.read32(IDXD_GENCTRL_OFFSET));
        ctrl.set_softerr_int_en(false);
        self.backing.write32(IDXD_GENCTRL_OFFSET, ctrl.0);
    }

    /// Configures, allocates and enables a kernel work queue.
    pub fn enable_kernel_wq(&self, wq_id: usize) -> Result<(), IdxdError> {
        let wq = self.wq(wq_id)?;
        if !self.is_enabled() {
            return Err(IdxdError::DeviceNotReady);
        }
        if wq.is_enabled() {
            return Err(IdxdError::Busy);
        }
        let settings = wq.settings();
        if settings.wq_type != WqType::Kernel || settings.group.is_none() || settings.size == 0 {
            return Err(IdxdError::InvalidConfig);
        }

        if self.hw.gen_cap.config_en() {
            let mut inner = self.inner.lock();
            self.device_config(&mut inner)?;
        }

        wq.allocate_resources()?;
        if let Err(e) = self.enable_queue(wq_id) {
            wq.free_resources();
            return Err(e);
        }
        info!("wq {} ({}) enabled for kernel use", wq_id, settings.name);
        Ok(())
    }

    /// Tears down a kernel work queue: stops new submissions, drains and
    /// disables it, completes leftovers as aborted and frees the pool.
    pub fn disable_kernel_wq(&self, wq_id: usize) -> Result<(), IdxdError> {
        let wq = self.wq(wq_id)?;
        wq.accepting.store(false, Ordering::Release);
        wq.submit_waitq.wake_all();

        let _guard = wq.submit_lock.write();
        self.drain_queue(wq_id)?;
        let rc = self.disable_queue(wq_id);
        let flushed = self.flush_wq_descriptors(wq_id, CompletionOutcome::Aborted);
        if flushed > 0 {
            debug!("wq {}: {} descriptors aborted", wq_id, flushed);
        }
        wq.free_resources();
        rc.map(|_| ())
    }
}
