// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Access to the device: BAR0 registers, work queue portals, DMA memory and
//! interrupt delivery.

use core::ptr;
use std::sync::Weak;

#[cfg(feature = "trace-mmio")]
use log::trace;

use crate::descriptor::HwDescriptor;
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::error::{IdxdError, PortalError};
use crate::irq::InterruptHandler;
use crate::registers::IDXD_PORTAL_SIZE;

/// Register (BAR0) access.
pub trait RegisterIo {
    fn read32(&self, offset: u64) -> u32;
    fn write32(&self, offset: u64, value: u32);

    fn read64(&self, offset: u64) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        lo | (hi << 32)
    }

    fn write64(&self, offset: u64, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// Descriptor submission through a work queue portal.
pub trait PortalIo {
    /// Posted 64 byte write (MOVDIR64B) to a dedicated queue, the device
    /// gives no feedback.
    fn submit_dedicated(&self, wq: usize, desc: &HwDescriptor);

    /// Non-posted enqueue (ENQCMDS) to a shared queue. Fails with
    /// [`PortalError::Retry`] when the queue did not accept the descriptor.
    fn submit_shared(&self, wq: usize, desc: &HwDescriptor) -> Result<(), PortalError>;
}

/// Everything the driver core needs from a device.
pub trait DeviceBacking: RegisterIo + PortalIo + DmaAllocator + Send + Sync {
    /// Number of MSI-X vectors (vector 0 is the misc interrupt).
    fn msix_count(&self) -> usize;

    /// Called once at probe time with the handler interrupts should be
    /// routed to. Backings where the host dispatches interrupts itself
    /// (e.g., an eventfd loop calling [`crate::Device::irq_handler`]) can
    /// ignore it.
    fn register_interrupt_handler(&self, _handler: Weak<dyn InterruptHandler>) {}
}

/// Offset of a queue's portal inside the portal BAR.
pub fn portal_offset(wq: usize, limited: bool) -> u64 {
    wq as u64 * IDXD_PORTAL_SIZE + if limited { 0x1000 } else { 0 }
}

/// A memory mapped BAR, accessed with volatile loads and stores.
#[derive(Debug)]
pub struct MappedBar {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for MappedBar {}
unsafe impl Sync for MappedBar {}

impl MappedBar {
    /// # Safety
    /// `base` must map `len` bytes of device registers (or memory) that stay
    /// valid for the lifetime of the returned object.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        MappedBar { base, len }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl RegisterIo for MappedBar {
    fn read32(&self, offset: u64) -> u32 {
        assert!(offset as usize + 4 <= self.len);
        let v = unsafe { ptr::read_volatile(self.base.add(offset as usize) as *const u32) };
        #[cfg(feature = "trace-mmio")]
        trace!("busread ({:p} + {:#x}) val = {:#x}", self.base, offset, v);
        v
    }

    fn write32(&self, offset: u64, value: u32) {
        assert!(offset as usize + 4 <= self.len);
        #[cfg(feature = "trace-mmio")]
        trace!("buswrite ({:p} + {:#x}) = value({:#x})", self.base, offset, value);
        unsafe { ptr::write_volatile(self.base.add(offset as usize) as *mut u32, value) }
    }

    fn read64(&self, offset: u64) -> u64 {
        assert!(offset as usize + 8 <= self.len);
        let v = unsafe { ptr::read_volatile(self.base.add(offset as usize) as *const u64) };
        #[cfg(feature = "trace-mmio")]
        trace!("busread64 ({:p} + {:#x}) val = {:#x}", self.base, offset, v);
        v
    }

    fn write64(&self, offset: u64, value: u64) {
        assert!(offset as usize + 8 <= self.len);
        #[cfg(feature = "trace-mmio")]
        trace!("buswrite64 ({:p} + {:#x}) = value({:#x})", self.base, offset, value);
        unsafe { ptr::write_volatile(self.base.add(offset as usize) as *mut u64, value) }
    }
}

/// MOVDIR64B: 64 byte direct store of `desc` to `portal`.
///
/// # Safety
/// `portal` must be a mapped, 64 byte aligned work queue portal.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn movdir64b(portal: *mut u8, desc: &HwDescriptor) {
    // 66 0F 38 F8 /r, rax = destination, [rdx] = source
    core::arch::asm!(
        ".byte 0x66, 0x0f, 0x38, 0xf8, 0x02",
        in("rax") portal,
        in("rdx") desc as *const HwDescriptor,
        options(nostack, preserves_flags)
    );
}

/// ENQCMDS: supervisor enqueue of `desc` to a shared queue `portal`.
/// Returns false if the device asked to retry (ZF set).
///
/// # Safety
/// `portal` must be a mapped, 64 byte aligned work queue portal and the
/// caller must run at ring 0.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn enqcmds(portal: *mut u8, desc: &HwDescriptor) -> bool {
    // F3 0F 38 F8 /r with ModRM 0x02
    let retry: u8;
    core::arch::asm!(
        ".byte 0xf3, 0x0f, 0x38, 0xf8, 0x02",
        "setz {retry}",
        in("rax") portal,
        in("rdx") desc as *const HwDescriptor,
        retry = out(reg_byte) retry,
        options(nostack)
    );
    retry == 0
}

/// A device whose BARs are mapped into our address space.
#[cfg(target_arch = "x86_64")]
pub struct MappedDevice<A: DmaAllocator + Send + Sync> {
    regs: MappedBar,
    portals: MappedBar,
    dma: A,
    msix_vectors: usize,
}

#[cfg(target_arch = "x86_64")]
impl<A: DmaAllocator + Send + Sync> MappedDevice<A> {
    /// # Safety
    /// `regs` must map BAR0 and `portals` the portal BAR (BAR2) of the
    /// device, `dma` must hand out memory the device can access at the
    /// returned IO addresses.
    pub unsafe fn new(regs: MappedBar, portals: MappedBar, dma: A, msix_vectors: usize) -> Self {
        MappedDevice {
            regs,
            portals,
            dma,
            msix_vectors,
        }
    }

    fn portal(&self, wq: usize) -> *mut u8 {
        let offset = portal_offset(wq, true) as usize;
        assert!(offset + 64 <= self.portals.len());
        unsafe { self.portals.base().add(offset) }
    }
}

#[cfg(target_arch = "x86_64")]
impl<A: DmaAllocator + Send + Sync> RegisterIo for MappedDevice<A> {
    fn read32(&self, offset: u64) -> u32 {
        self.regs.read32(offset)
    }

    fn write32(&self, offset: u64, value: u32) {
        self.regs.write32(offset, value)
    }

    fn read64(&self, offset: u64) -> u64 {
        self.regs.read64(offset)
    }

    fn write64(&self, offset: u64, value: u64) {
        self.regs.write64(offset, value)
    }
}

#[cfg(target_arch = "x86_64")]
impl<A: DmaAllocator + Send + Sync> PortalIo for MappedDevice<A> {
    fn submit_dedicated(&self, wq: usize, desc: &HwDescriptor) {
        unsafe { movdir64b(self.portal(wq), desc) }
    }

    fn submit_shared(&self, wq: usize, desc: &HwDescriptor) -> Result<(), PortalError> {
        if unsafe { enqcmds(self.portal(wq), desc) } {
            Ok(())
        } else {
            Err(PortalError::Retry)
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl<A: DmaAllocator + Send + Sync> DmaAllocator for MappedDevice<A> {
    fn alloc_coherent(&self, len: usize, align: usize) -> Result<DmaBuffer, IdxdError> {
        self.dma.alloc_coherent(len, align)
    }
}

#[cfg(target_arch = "x86_64")]
impl<A: DmaAllocator + Send + Sync> DeviceBacking for MappedDevice<A> {
    fn msix_count(&self) -> usize {
        self.msix_vectors
    }
}
