// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! A software model of an idxd device.
//!
//! Implements the register file, the administrative command engine, work
//! queue portals and MSI-X delivery closely enough to run the driver core
//! against it. Descriptors either complete automatically on submission or
//! are completed explicitly (with any status) through
//! [`EmulatedDevice::complete_next`]. Software errors and halts can be
//! injected.
//!
//! Interrupts are delivered from one thread per vector: the handler's top
//! half runs first and, if it asks for it, its thread part right after.

use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread;

use bit_field::BitField;
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::descriptor::{
    CompletionRecord, DescriptorFlags, HwDescriptor, DSA_COMPLETION_SIZE,
    DSA_COMP_PAGE_FAULT_NOBOF, DSA_COMP_SUCCESS,
};
use crate::dma::{DmaAllocator, DmaBuffer, DmaMemory, HeapDmaAllocator};
use crate::error::{IdxdError, PortalError};
use crate::irq::{InterruptHandler, IrqReturn};
use crate::pci::{DeviceBacking, PortalIo, RegisterIo};
use crate::registers::*;

const GRPCFG_BASE: u64 = 0x400;
const WQCFG_BASE: u64 = 0x800;
const MSIX_PERM_BASE: u64 = 0x2800;

/// Interrupt handles handed out are the vector index plus this.
pub const INT_HANDLE_BASE: u16 = 0x100;

/// Shape of the emulated device.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub num_wqs: usize,
    pub total_wq_size: u32,
    pub num_groups: usize,
    pub num_engines: usize,
    pub total_tokens: u32,
    pub msix_vectors: usize,
    /// Configuration registers are writable.
    pub config_en: bool,
    pub int_handle_req: bool,
    pub shared_mode: bool,
    pub block_on_fault: bool,
    /// Complete descriptors as soon as they are submitted.
    pub auto_complete: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        EmulatorConfig {
            num_wqs: 8,
            total_wq_size: 128,
            num_groups: 4,
            num_engines: 4,
            total_tokens: 96,
            msix_vectors: 3,
            config_en: true,
            int_handle_req: false,
            shared_mode: true,
            block_on_fault: true,
            auto_complete: false,
        }
    }
}

impl EmulatorConfig {
    fn gen_cap(&self) -> GenCap {
        let mut cap = 0u64;
        cap.set_bit(0, self.block_on_fault);
        cap.set_bit(7, self.int_handle_req);
        cap.set_bits(16..21, 31);
        cap.set_bits(21..25, 10);
        cap.set_bit(31, self.config_en);
        GenCap(cap)
    }

    fn wq_cap(&self) -> WqCap {
        let mut cap = 0u64;
        cap.set_bits(0..16, self.total_wq_size as u64);
        cap.set_bits(16..24, self.num_wqs as u64);
        cap.set_bit(48, self.shared_mode);
        cap.set_bit(49, true);
        WqCap(cap)
    }

    fn group_cap(&self) -> GroupCap {
        let mut cap = 0u64;
        cap.set_bits(0..8, self.num_groups as u64);
        cap.set_bits(16..24, self.total_tokens as u64);
        GroupCap(cap)
    }

    fn table_offsets(&self) -> TableOffsets {
        let mut off = 0u64;
        off.set_bits(0..16, GRPCFG_BASE / IDXD_TABLE_MULT);
        off.set_bits(16..32, WQCFG_BASE / IDXD_TABLE_MULT);
        off.set_bits(32..48, MSIX_PERM_BASE / IDXD_TABLE_MULT);
        TableOffsets(off)
    }
}

/// An access to the command interface, in the order the device saw them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    Write(Command, u32),
    StatusRead(u32),
}

struct EmuQueue {
    enabled: bool,
    cfg: WqCfg,
    queued: VecDeque<HwDescriptor>,
}

struct EmuRegs {
    gencfg: u32,
    genctrl: u32,
    gensts: GenStatus,
    intcause: u32,
    cmd: u32,
    cmdsts: u32,
    swerr: [u64; 4],
    /// 16 dwords per group.
    grpcfg: Vec<u32>,
    wqs: Vec<EmuQueue>,
    auto_complete: bool,
    fail_next: Option<(Command, u32)>,
    cmd_log: Vec<CommandEvent>,
}

struct IrqState {
    perm: Vec<u32>,
    pending: Vec<bool>,
    delivered: Vec<u64>,
}

struct EmuInner {
    cfg: EmulatorConfig,
    regs: Mutex<EmuRegs>,
    irq: Mutex<IrqState>,
    irq_cv: Condvar,
    handler: spin::RwLock<Option<Weak<dyn InterruptHandler>>>,
    dma: Mutex<Vec<Weak<DmaMemory>>>,
    shutdown: AtomicBool,
}

/// Stops the delivery threads once the last [`EmulatedDevice`] handle is
/// gone.
struct ShutdownGuard(Arc<EmuInner>);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.shutdown.store(true, Ordering::Release);
        let _irq = self.0.irq.lock();
        self.0.irq_cv.notify_all();
    }
}

/// Handle to an emulated device. Clones refer to the same device.
#[derive(Clone)]
pub struct EmulatedDevice {
    inner: Arc<EmuInner>,
    _guard: Arc<ShutdownGuard>,
}

impl EmulatedDevice {
    pub fn new(cfg: EmulatorConfig) -> EmulatedDevice {
        let wqs = (0..cfg.num_wqs)
            .map(|_| EmuQueue {
                enabled: false,
                cfg: WqCfg::default(),
                queued: VecDeque::new(),
            })
            .collect();
        let regs = EmuRegs {
            gencfg: 0,
            genctrl: 0,
            gensts: GenStatus::new(HwDeviceState::Disabled, ResetType::Software),
            intcause: 0,
            cmd: 0,
            cmdsts: 0,
            swerr: [0; 4],
            grpcfg: vec![0; cfg.num_groups * 16],
            wqs,
            auto_complete: cfg.auto_complete,
            fail_next: None,
            cmd_log: Vec::new(),
        };
        let irq = IrqState {
            perm: vec![MsixPerm(0).0; cfg.msix_vectors],
            pending: vec![false; cfg.msix_vectors],
            delivered: vec![0; cfg.msix_vectors],
        };

        let inner = Arc::new(EmuInner {
            cfg,
            regs: Mutex::new(regs),
            irq: Mutex::new(irq),
            irq_cv: Condvar::new(),
            handler: spin::RwLock::new(None),
            dma: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });
        EmulatedDevice {
            _guard: Arc::new(ShutdownGuard(inner.clone())),
            inner,
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.inner.cfg
    }

    pub fn set_auto_complete(&self, on: bool) {
        self.inner.regs.lock().auto_complete = on;
    }

    /// Descriptors accepted by `wq` the device has not completed yet.
    pub fn queued(&self, wq: usize) -> usize {
        self.inner.regs.lock().wqs[wq].queued.len()
    }

    pub fn wq_enabled(&self, wq: usize) -> bool {
        self.inner.regs.lock().wqs[wq].enabled
    }

    /// Completes the oldest queued descriptor of `wq` with `status`.
    /// Returns false if the queue was empty.
    pub fn complete_next(&self, wq: usize, status: u8) -> bool {
        let mut regs = self.inner.regs.lock();
        match regs.wqs[wq].queued.pop_front() {
            Some(desc) => {
                self.inner.complete(&desc, status);
                true
            }
            None => false,
        }
    }

    /// Completes every queued descriptor of `wq`.
    pub fn complete_all(&self, wq: usize, status: u8) -> usize {
        let mut regs = self.inner.regs.lock();
        let descs: Vec<HwDescriptor> = regs.wqs[wq].queued.drain(..).collect();
        for desc in descs.iter() {
            self.inner.complete(desc, status);
        }
        descs.len()
    }

    /// Makes the next `cmd` fail with `status`.
    pub fn fail_next_command(&self, cmd: Command, status: u32) {
        self.inner.regs.lock().fail_next = Some((cmd, status));
    }

    /// Accesses to CMD/CMDSTS so far.
    pub fn command_log(&self) -> Vec<CommandEvent> {
        self.inner.regs.lock().cmd_log.clone()
    }

    /// Commands written so far.
    pub fn commands(&self) -> Vec<Command> {
        self.command_log()
            .into_iter()
            .filter_map(|e| match e {
                CommandEvent::Write(cmd, _) => Some(cmd),
                CommandEvent::StatusRead(_) => None,
            })
            .collect()
    }

    pub fn clear_command_log(&self) {
        self.inner.regs.lock().cmd_log.clear();
    }

    /// Current WQCFG of `wq` as the device reports it.
    pub fn wqcfg(&self, wq: usize) -> WqCfg {
        let regs = self.inner.regs.lock();
        let mut cfg = regs.wqs[wq].cfg;
        cfg.0[6].set_bits(30..32, regs.wqs[wq].enabled as u32);
        cfg
    }

    pub fn grpcfg(&self, group: usize) -> GroupCfg {
        let regs = self.inner.regs.lock();
        let words = &regs.grpcfg[group * 16..group * 16 + 16];
        let qword = |i: usize| words[i * 2] as u64 | (words[i * 2 + 1] as u64) << 32;
        GroupCfg {
            wqs: [qword(0), qword(1), qword(2), qword(3)],
            engines: qword(4),
            flags: GroupFlags(words[10]),
        }
    }

    /// Programs `wq` into `group` (together with `engines`) behind the
    /// driver's back, the way firmware sets up devices whose configuration
    /// is read-only.
    pub fn preload_wq(&self, wq: usize, cfg: WqCfg, group: usize, engines: u64) {
        let mut regs = self.inner.regs.lock();
        regs.wqs[wq].cfg = cfg;
        let words = &mut regs.grpcfg[group * 16..group * 16 + 16];
        let idx = (wq / 64) * 2;
        let mut wqs = words[idx] as u64 | (words[idx + 1] as u64) << 32;
        wqs.set_bit(wq % 64, true);
        words[idx] = wqs as u32;
        words[idx + 1] = (wqs >> 32) as u32;
        let engines = engines | words[8] as u64 | (words[9] as u64) << 32;
        words[8] = engines as u32;
        words[9] = (engines >> 32) as u32;
    }

    pub fn gencfg(&self) -> GenCfg {
        GenCfg(self.inner.regs.lock().gencfg)
    }

    pub fn is_masked(&self, vector: usize) -> bool {
        MsixPerm(self.inner.irq.lock().perm[vector]).ignore()
    }

    /// Interrupts delivered on `vector` so far.
    pub fn delivered(&self, vector: usize) -> u64 {
        self.inner.irq.lock().delivered[vector]
    }

    /// Reports a software error, as if a descriptor submitted to `wq`
    /// failed (at `fault_addr`, if given).
    pub fn inject_error(&self, wq: Option<usize>, code: u8, fault_addr: Option<u64>) {
        let mut regs = self.inner.regs.lock();
        let mut word = 0u64;
        word.set_bit(0, true);
        word.set_bit(1, regs.swerr[0].get_bit(0));
        word.set_bit(2, fault_addr.is_some());
        word.set_bit(3, wq.is_some());
        word.set_bits(8..16, code as u64);
        word.set_bits(16..24, wq.unwrap_or(0) as u64);
        regs.swerr = [word, 0, fault_addr.unwrap_or(0), 0];
        self.inner.raise_error(&mut regs);
    }

    /// Halts the device. A halt that needs more than a software reset
    /// keeps the device halted until it is reset.
    pub fn inject_halt(&self, reset: ResetType) {
        let mut regs = self.inner.regs.lock();
        regs.gensts = GenStatus::new(HwDeviceState::Halt, reset);
        for wq in regs.wqs.iter_mut() {
            wq.enabled = false;
            wq.queued.clear();
        }
        let mut word = 0u64;
        word.set_bit(0, true);
        word.set_bits(8..16, 0x1f);
        regs.swerr = [word, 0, 0, 0];
        self.inner.raise_error(&mut regs);
    }
}

impl EmuInner {
    fn raise(&self, vector: usize) {
        let mut irq = self.irq.lock();
        if let Some(p) = irq.pending.get_mut(vector) {
            *p = true;
            self.irq_cv.notify_all();
        }
    }

    fn raise_error(&self, regs: &mut EmuRegs) {
        regs.intcause |= IntCause::ERR.bits();
        if GenCtrl(regs.genctrl).softerr_int_en() {
            self.raise(0);
        }
    }

    fn deliver_loop(self: Arc<Self>, vector: usize) {
        loop {
            {
                let mut irq = self.irq.lock();
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    if irq.pending[vector] && !MsixPerm(irq.perm[vector]).ignore() {
                        irq.pending[vector] = false;
                        irq.delivered[vector] += 1;
                        break;
                    }
                    self.irq_cv.wait(&mut irq);
                }
            }

            let handler = self.handler.read().as_ref().and_then(|h| h.upgrade());
            if let Some(handler) = handler {
                trace!("delivering vector {}", vector);
                if handler.top_half(vector) == IrqReturn::WakeThread {
                    handler.thread(vector);
                }
            }
        }
    }

    /// Finds the memory `iova` belongs to.
    fn translate(&self, iova: u64, len: usize) -> Option<(Arc<DmaMemory>, usize)> {
        let dma = self.dma.lock();
        dma.iter()
            .filter_map(|m| m.upgrade())
            .find(|m| m.contains(iova, len))
            .map(|m| {
                let offset = (iova - m.iova()) as usize;
                (m, offset)
            })
    }

    /// Executes `desc` and writes its completion. `status` overrides the
    /// outcome of the operation unless it is a success status.
    fn complete(&self, desc: &HwDescriptor, status: u8) {
        let status = if status == DSA_COMP_SUCCESS {
            self.execute(desc)
        } else {
            status
        };

        let flags = desc.flags();
        if flags.contains(DescriptorFlags::CRAV) {
            match self.translate(desc.completion_addr, DSA_COMPLETION_SIZE) {
                Some((mem, offset)) => unsafe {
                    let record = mem.vaddr().add(offset);
                    if status != DSA_COMP_SUCCESS {
                        ptr::write_unaligned(record.add(8) as *mut u64, desc.src_addr);
                    }
                    CompletionRecord::set_status_at(record, status);
                },
                None => warn!(
                    "completion record {:#x} is not device memory",
                    desc.completion_addr
                ),
            }
        }

        if flags.contains(DescriptorFlags::RCI) {
            let vector = if self.cfg.int_handle_req {
                desc.int_handle.wrapping_sub(INT_HANDLE_BASE) as usize
            } else {
                desc.int_handle as usize
            };
            self.raise(vector);
        }
    }

    /// Performs the data movement of simple operations on device memory.
    fn execute(&self, desc: &HwDescriptor) -> u8 {
        let len = desc.xfer_size as usize;
        if len == 0 {
            return DSA_COMP_SUCCESS;
        }
        match desc.opcode() {
            op if op == crate::descriptor::Opcode::MemMove as u8 => {
                match (
                    self.translate(desc.src_addr, len),
                    self.translate(desc.dst_addr, len),
                ) {
                    (Some((src, so)), Some((dst, doff))) => {
                        unsafe { ptr::copy(src.vaddr().add(so), dst.vaddr().add(doff), len) };
                        DSA_COMP_SUCCESS
                    }
                    _ => DSA_COMP_PAGE_FAULT_NOBOF,
                }
            }
            op if op == crate::descriptor::Opcode::MemFill as u8 => {
                match self.translate(desc.dst_addr, len) {
                    Some((dst, doff)) => {
                        let pattern = desc.src_addr.to_le_bytes();
                        for i in 0..len {
                            unsafe { *dst.vaddr().add(doff + i) = pattern[i % 8] };
                        }
                        DSA_COMP_SUCCESS
                    }
                    None => DSA_COMP_PAGE_FAULT_NOBOF,
                }
            }
            _ => DSA_COMP_SUCCESS,
        }
    }

    fn accept(&self, regs: &mut EmuRegs, wq: usize, desc: &HwDescriptor) {
        if regs.auto_complete {
            self.complete(desc, DSA_COMP_SUCCESS);
        } else {
            regs.wqs[wq].queued.push_back(*desc);
        }
    }

    fn drain(&self, regs: &mut EmuRegs, wq: usize) {
        let descs: Vec<HwDescriptor> = regs.wqs[wq].queued.drain(..).collect();
        for desc in descs.iter() {
            self.complete(desc, DSA_COMP_SUCCESS);
        }
    }

    fn config_valid(&self, regs: &EmuRegs) -> bool {
        let mut total = 0;
        let mut any = false;
        for (id, wq) in regs.wqs.iter().enumerate() {
            let size = wq.cfg.wq_size();
            if size == 0 {
                continue;
            }
            total += size;
            let in_group = (0..self.cfg.num_groups).find(|g| {
                let base = g * 16 + (id / 64) * 2;
                let qword = regs.grpcfg[base] as u64 | (regs.grpcfg[base + 1] as u64) << 32;
                qword.get_bit(id % 64)
            });
            match in_group {
                Some(g) => {
                    let engines = regs.grpcfg[g * 16 + 8] as u64 | (regs.grpcfg[g * 16 + 9] as u64) << 32;
                    if engines == 0 {
                        return false;
                    }
                    any = true;
                }
                None => continue,
            }
        }
        any && total <= self.cfg.total_wq_size
    }

    fn execute_command(&self, regs: &mut EmuRegs, reg: CommandReg) -> u32 {
        let cmd = match Command::from_code(reg.code()) {
            Some(cmd) => cmd,
            None => return IDXD_CMDSTS_INVAL_CMD,
        };
        regs.cmd_log.push(CommandEvent::Write(cmd, reg.operand()));
        if let Some((fail, status)) = regs.fail_next {
            if fail == cmd {
                regs.fail_next = None;
                return status;
            }
        }

        let halted = regs.gensts.state() == HwDeviceState::Halt;
        let enabled = regs.gensts.state() == HwDeviceState::Enabled;
        if halted && cmd != Command::ResetDevice {
            return IDXD_CMDSTS_HW_ERR;
        }

        let operand = reg.operand();
        match cmd {
            Command::EnableDevice => {
                if enabled {
                    return IDXD_CMDSTS_ERR_DEV_ENABLED;
                }
                if !self.config_valid(regs) {
                    return IDXD_CMDSTS_ERR_CONFIG;
                }
                regs.gensts = GenStatus::new(HwDeviceState::Enabled, ResetType::Software);
            }
            Command::DisableDevice => {
                if !enabled {
                    return IDXD_CMDSTS_ERR_DIS_DEV_EN;
                }
                for id in 0..regs.wqs.len() {
                    self.drain(regs, id);
                    regs.wqs[id].enabled = false;
                }
                regs.gensts = GenStatus::new(HwDeviceState::Disabled, ResetType::Software);
            }
            Command::ResetDevice => {
                // Read-only configuration survives a reset.
                let config_en = self.cfg.config_en;
                for wq in regs.wqs.iter_mut() {
                    wq.enabled = false;
                    if config_en {
                        wq.cfg = WqCfg::default();
                    }
                    wq.queued.clear();
                }
                if config_en {
                    regs.grpcfg.iter_mut().for_each(|w| *w = 0);
                    regs.gencfg = 0;
                }
                regs.swerr = [0; 4];
                regs.gensts = GenStatus::new(HwDeviceState::Disabled, ResetType::Software);
            }
            Command::EnableWq => {
                let id = operand as usize;
                if !enabled {
                    return IDXD_CMDSTS_ERR_DEV_NOTEN;
                }
                let wq = match regs.wqs.get_mut(id) {
                    Some(wq) => wq,
                    None => return IDXD_CMDSTS_INVAL_WQIDX,
                };
                if wq.enabled {
                    return IDXD_CMDSTS_ERR_WQ_ENABLED;
                }
                if wq.cfg.wq_size() == 0 {
                    return IDXD_CMDSTS_ERR_WQ_SIZE;
                }
                if !wq.cfg.mode() && !self.cfg.shared_mode {
                    return IDXD_CMDSTS_ERR_WQ_MODE;
                }
                wq.enabled = true;
            }
            Command::DisableWq | Command::DrainWq | Command::AbortWq | Command::ResetWq => {
                let ids: Vec<usize> = wq_operand_ids(operand).collect();
                if ids.iter().any(|id| *id >= regs.wqs.len()) {
                    return IDXD_CMDSTS_INVAL_WQIDX;
                }
                for id in ids {
                    match cmd {
                        Command::DisableWq => {
                            if !regs.wqs[id].enabled {
                                return IDXD_CMDSTS_ERR_DEV_NOT_EN;
                            }
                            self.drain(regs, id);
                            regs.wqs[id].enabled = false;
                        }
                        Command::DrainWq => self.drain(regs, id),
                        Command::AbortWq => regs.wqs[id].queued.clear(),
                        _ => {
                            if regs.wqs[id].enabled {
                                return IDXD_CMDSTS_ERR_WQ_ENABLED;
                            }
                            if self.cfg.config_en {
                                regs.wqs[id].cfg = WqCfg::default();
                            }
                        }
                    }
                }
            }
            Command::DrainAll | Command::DrainPasid => {
                for id in 0..regs.wqs.len() {
                    self.drain(regs, id);
                }
            }
            Command::AbortAll | Command::AbortPasid => {
                for wq in regs.wqs.iter_mut() {
                    wq.queued.clear();
                }
            }
            Command::RequestIntHandle => {
                if !self.cfg.int_handle_req {
                    return IDXD_CMDSTS_INVAL_CMD;
                }
                let idx = operand & 0xffff;
                if idx as usize >= self.cfg.msix_vectors {
                    return IDXD_CMDSTS_ERR_INVAL_INT_IDX;
                }
                return ((idx + INT_HANDLE_BASE as u32) << 8) | IDXD_CMDSTS_SUCCESS;
            }
        }
        IDXD_CMDSTS_SUCCESS
    }

    fn read_qword(&self, regs: &EmuRegs, offset: u64) -> Option<u64> {
        let cfg = &self.cfg;
        Some(match offset {
            IDXD_VERSION_OFFSET => 0x100,
            IDXD_GENCAP_OFFSET => cfg.gen_cap().0,
            IDXD_WQCAP_OFFSET => cfg.wq_cap().0,
            IDXD_GRPCAP_OFFSET => cfg.group_cap().0,
            IDXD_ENGCAP_OFFSET => cfg.num_engines as u64,
            o if (IDXD_OPCAP_OFFSET..IDXD_OPCAP_OFFSET + 32).contains(&o) => {
                if o == IDXD_OPCAP_OFFSET {
                    0x1f
                } else {
                    0
                }
            }
            IDXD_TABLE_OFFSET => cfg.table_offsets().0,
            IDXD_GENCFG_OFFSET => regs.gencfg as u64,
            IDXD_GENCTRL_OFFSET => regs.genctrl as u64,
            IDXD_GENSTATS_OFFSET => regs.gensts.0 as u64,
            IDXD_INTCAUSE_OFFSET => regs.intcause as u64,
            IDXD_CMD_OFFSET => regs.cmd as u64,
            IDXD_CMDSTS_OFFSET => regs.cmdsts as u64,
            o if (IDXD_SWERR_OFFSET..IDXD_SWERR_OFFSET + 32).contains(&o) => {
                regs.swerr[((o - IDXD_SWERR_OFFSET) / 8) as usize]
            }
            _ => return None,
        })
    }
}

impl RegisterIo for EmulatedDevice {
    fn read32(&self, offset: u64) -> u32 {
        let inner = &self.inner;
        if (MSIX_PERM_BASE..MSIX_PERM_BASE + (inner.cfg.msix_vectors as u64) * MSIX_PERM_STRIDE)
            .contains(&offset)
        {
            let rel = offset - MSIX_PERM_BASE;
            if rel % MSIX_PERM_STRIDE != 0 {
                return 0;
            }
            return inner.irq.lock().perm[(rel / MSIX_PERM_STRIDE) as usize];
        }

        let mut regs = inner.regs.lock();
        if (GRPCFG_BASE..GRPCFG_BASE + inner.cfg.num_groups as u64 * GRPCFG_STRIDE).contains(&offset) {
            return regs.grpcfg[((offset - GRPCFG_BASE) / 4) as usize];
        }
        if (WQCFG_BASE..WQCFG_BASE + inner.cfg.num_wqs as u64 * WQCFG_STRIDE).contains(&offset) {
            let rel = offset - WQCFG_BASE;
            let wq = &regs.wqs[(rel / WQCFG_STRIDE) as usize];
            let dword = ((rel % WQCFG_STRIDE) / 4) as usize;
            let mut v = wq.cfg.0[dword];
            if dword == 6 {
                v.set_bits(30..32, wq.enabled as u32);
            }
            return v;
        }

        if offset == IDXD_CMDSTS_OFFSET {
            let status = regs.cmdsts;
            regs.cmd_log.push(CommandEvent::StatusRead(status));
        }
        match inner.read_qword(&regs, offset & !0x7) {
            Some(q) if offset & 0x4 != 0 => (q >> 32) as u32,
            Some(q) => q as u32,
            None => {
                warn!("read from unknown register {:#x}", offset);
                0
            }
        }
    }

    fn write32(&self, offset: u64, value: u32) {
        let inner = &self.inner;
        if (MSIX_PERM_BASE..MSIX_PERM_BASE + (inner.cfg.msix_vectors as u64) * MSIX_PERM_STRIDE)
            .contains(&offset)
        {
            let rel = offset - MSIX_PERM_BASE;
            if rel % MSIX_PERM_STRIDE == 0 {
                let mut irq = inner.irq.lock();
                irq.perm[(rel / MSIX_PERM_STRIDE) as usize] = value;
                if !MsixPerm(value).ignore() {
                    inner.irq_cv.notify_all();
                }
            }
            return;
        }

        let mut regs = inner.regs.lock();
        let enabled = regs.gensts.state() == HwDeviceState::Enabled;
        if (GRPCFG_BASE..GRPCFG_BASE + inner.cfg.num_groups as u64 * GRPCFG_STRIDE).contains(&offset) {
            if !enabled && inner.cfg.config_en {
                regs.grpcfg[((offset - GRPCFG_BASE) / 4) as usize] = value;
            }
            return;
        }
        if (WQCFG_BASE..WQCFG_BASE + inner.cfg.num_wqs as u64 * WQCFG_STRIDE).contains(&offset) {
            let rel = offset - WQCFG_BASE;
            let dword = ((rel % WQCFG_STRIDE) / 4) as usize;
            let wq = &mut regs.wqs[(rel / WQCFG_STRIDE) as usize];
            // WQCFG is read-only while the queue is enabled, the state
            // field always is. Only PASID and privilege are writable on
            // devices without configuration support.
            if wq.enabled || dword == 6 || (!inner.cfg.config_en && dword != 2) {
                return;
            }
            wq.cfg.0[dword] = value;
            return;
        }

        match offset {
            IDXD_GENCFG_OFFSET => {
                if !enabled {
                    regs.gencfg = value;
                }
            }
            IDXD_GENCTRL_OFFSET => regs.genctrl = value,
            IDXD_INTCAUSE_OFFSET => regs.intcause &= !value,
            IDXD_CMD_OFFSET => {
                let reg = CommandReg(value);
                regs.cmd = value;
                let status = inner.execute_command(&mut regs, reg);
                regs.cmdsts = status;
                debug!("emulated cmd {:#x} -> status {:#x}", value, status);
                if reg.int_req() {
                    regs.intcause |= IntCause::CMD.bits();
                    inner.raise(0);
                }
            }
            IDXD_SWERR_OFFSET => {
                // Valid and overflow are write-one-to-clear.
                regs.swerr[0] &= !(value as u64 & 0x3);
            }
            o if (IDXD_SWERR_OFFSET + 4..IDXD_SWERR_OFFSET + 32).contains(&o) => {}
            _ => warn!("write to unknown register {:#x} = {:#x}", offset, value),
        }
    }
}

impl PortalIo for EmulatedDevice {
    fn submit_dedicated(&self, wq: usize, desc: &HwDescriptor) {
        let mut regs = self.inner.regs.lock();
        let q = &regs.wqs[wq];
        if !q.enabled || q.queued.len() >= q.cfg.wq_size() as usize {
            warn!("wq {}: descriptor dropped (enabled: {})", wq, q.enabled);
            return;
        }
        self.inner.accept(&mut regs, wq, desc);
    }

    fn submit_shared(&self, wq: usize, desc: &HwDescriptor) -> Result<(), PortalError> {
        let mut regs = self.inner.regs.lock();
        let q = &regs.wqs[wq];
        if !q.enabled || q.queued.len() >= q.cfg.wq_size() as usize {
            return Err(PortalError::Retry);
        }
        self.inner.accept(&mut regs, wq, desc);
        Ok(())
    }
}

impl DmaAllocator for EmulatedDevice {
    fn alloc_coherent(&self, len: usize, align: usize) -> Result<DmaBuffer, IdxdError> {
        let buf = HeapDmaAllocator.alloc_coherent(len, align)?;
        let mut dma = self.inner.dma.lock();
        dma.retain(|m| m.strong_count() > 0);
        dma.push(buf.downgrade());
        Ok(buf)
    }
}

impl DeviceBacking for EmulatedDevice {
    fn msix_count(&self) -> usize {
        self.inner.cfg.msix_vectors
    }

    fn register_interrupt_handler(&self, handler: Weak<dyn InterruptHandler>) {
        *self.inner.handler.write() = Some(handler);
        for v in 0..self.inner.cfg.msix_vectors {
            let inner = self.inner.clone();
            thread::Builder::new()
                .name(format!("idxd-emu-irq{}", v))
                .spawn(move || inner.deliver_loop(v))
                .map(|_| ())
                .unwrap_or_else(|e| warn!("Unable to spawn interrupt thread: {}", e));
        }
    }
}
