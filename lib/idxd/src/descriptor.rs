// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Hardware descriptor and completion record formats.
//!
//! A descriptor is a 64 byte instruction written through a work queue portal.
//! The device reports its result by writing a completion record to the
//! address in the descriptor; a non-zero status byte is the only signal that
//! the descriptor finished.

use core::mem;
use core::sync::atomic::{AtomicU8, Ordering};

use bit_field::BitField;
use bitflags::bitflags;
use static_assertions as sa;

bitflags! {
    /// Descriptor flags (low 24 bits of the flags/opcode word).
    pub struct DescriptorFlags: u32 {
        const FENCE = 0x0001;
        /// Block on fault.
        const BOF = 0x0002;
        /// Completion record address valid.
        const CRAV = 0x0004;
        /// Request completion record.
        const RCR = 0x0008;
        /// Request completion interrupt.
        const RCI = 0x0010;
        /// Create completion record on success.
        const CRSTS = 0x0020;
        /// Cache control.
        const CC = 0x0100;
        /// Destination readback.
        const DRDBK = 0x4000;
        const DSTS = 0x8000;
    }
}

/// Operations understood by the device.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Opcode {
    Noop = 0x00,
    Batch = 0x01,
    Drain = 0x02,
    MemMove = 0x03,
    MemFill = 0x04,
    Compare = 0x05,
    CompareValue = 0x06,
    CreateDelta = 0x07,
    ApplyDelta = 0x08,
    Dualcast = 0x09,
    CrcGen = 0x10,
    CopyCrc = 0x11,
    DifCheck = 0x12,
    CacheFlush = 0x20,
}

/// A 64 byte hardware descriptor.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
pub struct HwDescriptor {
    /// PASID in bits 0..20, privileged in bit 31.
    pub pasid: u32,
    /// Flags in bits 0..24, opcode in bits 24..32.
    pub flags_opcode: u32,
    pub completion_addr: u64,
    pub src_addr: u64,
    pub dst_addr: u64,
    pub xfer_size: u32,
    pub int_handle: u16,
    rsvd: u16,
    pub op_specific: [u8; 24],
}

sa::const_assert_eq!(mem::size_of::<HwDescriptor>(), 64);
sa::const_assert_eq!(mem::align_of::<HwDescriptor>(), 64);

impl Default for HwDescriptor {
    fn default() -> Self {
        HwDescriptor::new()
    }
}

impl HwDescriptor {
    pub const fn new() -> Self {
        HwDescriptor {
            pasid: 0,
            flags_opcode: 0,
            completion_addr: 0,
            src_addr: 0,
            dst_addr: 0,
            xfer_size: 0,
            int_handle: 0,
            rsvd: 0,
            op_specific: [0; 24],
        }
    }

    pub fn clear(&mut self) {
        *self = HwDescriptor::new();
    }

    pub fn opcode(&self) -> u8 {
        self.flags_opcode.get_bits(24..32) as u8
    }

    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.flags_opcode.set_bits(24..32, opcode as u32);
    }

    pub fn flags(&self) -> DescriptorFlags {
        DescriptorFlags::from_bits_truncate(self.flags_opcode.get_bits(0..24))
    }

    pub fn set_flags(&mut self, flags: DescriptorFlags) {
        self.flags_opcode.set_bits(0..24, flags.bits());
    }

    pub fn set_pasid(&mut self, pasid: u32, privileged: bool) {
        self.pasid.set_bits(0..20, pasid & 0xf_ffff);
        self.pasid.set_bit(31, privileged);
    }

    /// Does this descriptor ask for a completion interrupt?
    pub fn wants_interrupt(&self) -> bool {
        self.flags().contains(DescriptorFlags::RCI)
    }

    /// Fill in a plain operation. The completion record address and the
    /// CRAV/RCR flags are always set since completion is tracked through it.
    pub fn prep(
        &mut self,
        opcode: Opcode,
        src: u64,
        dst: u64,
        len: u32,
        flags: DescriptorFlags,
        completion_addr: u64,
    ) {
        self.set_opcode(opcode);
        self.set_flags(flags | DescriptorFlags::CRAV | DescriptorFlags::RCR);
        self.src_addr = src;
        self.dst_addr = dst;
        self.xfer_size = len;
        self.completion_addr = completion_addr;
    }
}

/// Completion record status codes (low 7 bits of the status byte).
pub const DSA_COMP_NONE: u8 = 0;
pub const DSA_COMP_SUCCESS: u8 = 1;
pub const DSA_COMP_SUCCESS_PRED: u8 = 2;
pub const DSA_COMP_PAGE_FAULT_NOBOF: u8 = 3;
pub const DSA_COMP_PAGE_FAULT_IR: u8 = 4;
pub const DSA_COMP_BATCH_FAIL: u8 = 5;
pub const DSA_COMP_BATCH_PAGE_FAULT: u8 = 6;
pub const DSA_COMP_BAD_OPCODE: u8 = 0x10;
pub const DSA_COMP_INVALID_FLAGS: u8 = 0x11;
pub const DSA_COMP_HW_ERR1: u8 = 0x1f;
pub const DSA_COMP_STATUS_MASK: u8 = 0x7f;
/// Set by hardware when the faulting access was a write.
pub const DSA_COMP_STATUS_WRITE: u8 = 0x80;

/// Completion record of a DSA device (IAX uses a 64 byte record with the
/// same header).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, align(32))]
pub struct CompletionRecord {
    pub status: u8,
    pub result: u8,
    rsvd: u16,
    pub bytes_completed: u32,
    pub fault_addr: u64,
    pub op_specific: [u8; 16],
}

sa::const_assert_eq!(mem::size_of::<CompletionRecord>(), 32);

pub const DSA_COMPLETION_SIZE: usize = 32;
pub const DSA_COMPLETION_ALIGN: usize = 32;
pub const IAX_COMPLETION_SIZE: usize = 64;
pub const IAX_COMPLETION_ALIGN: usize = 64;

impl CompletionRecord {
    /// Reads the status byte of a record the device may be writing to
    /// concurrently.
    ///
    /// # Safety
    /// `record` must point to a live, byte-aligned completion record.
    pub unsafe fn status_at(record: *const u8) -> u8 {
        (*(record as *const AtomicU8)).load(Ordering::Acquire)
    }

    /// Publishes a status byte, the device side of [`Self::status_at`].
    ///
    /// # Safety
    /// `record` must point to a live completion record.
    pub unsafe fn set_status_at(record: *mut u8, status: u8) {
        (*(record as *const AtomicU8)).store(status, Ordering::Release)
    }
}

/// How a descriptor finished, as seen by the waiter or callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The device wrote the completion record (status byte, masked).
    Normal(u8),
    /// The queue was aborted or drained before the device got to it.
    Aborted,
    /// Force-completed by the fault path after a device error.
    DeviceFailure,
}

impl CompletionOutcome {
    pub fn from_status(status: u8) -> Self {
        CompletionOutcome::Normal(status & DSA_COMP_STATUS_MASK)
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            CompletionOutcome::Normal(DSA_COMP_SUCCESS) | CompletionOutcome::Normal(DSA_COMP_SUCCESS_PRED)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_fields() {
        let mut hw = HwDescriptor::new();
        hw.prep(
            Opcode::MemMove,
            0x1000,
            0x2000,
            4096,
            DescriptorFlags::RCI,
            0xdead_b000,
        );
        assert_eq!(hw.opcode(), Opcode::MemMove as u8);
        assert!(hw.wants_interrupt());
        assert!(hw
            .flags()
            .contains(DescriptorFlags::CRAV | DescriptorFlags::RCR));
        assert_eq!(hw.completion_addr, 0xdead_b000);

        hw.set_pasid(0x12345, true);
        assert_eq!(hw.pasid, 0x8001_2345);

        hw.clear();
        assert_eq!(hw.flags_opcode, 0);
        assert!(!hw.wants_interrupt());
    }

    #[test]
    fn outcome_masks_status() {
        assert!(CompletionOutcome::from_status(DSA_COMP_SUCCESS | DSA_COMP_STATUS_WRITE).is_success());
        assert!(!CompletionOutcome::from_status(DSA_COMP_PAGE_FAULT_NOBOF).is_success());
        assert!(!CompletionOutcome::DeviceFailure.is_success());
    }

    #[test]
    fn status_byte_access() {
        let mut rec = CompletionRecord::default();
        let p = &mut rec as *mut CompletionRecord as *mut u8;
        unsafe {
            assert_eq!(CompletionRecord::status_at(p), DSA_COMP_NONE);
            CompletionRecord::set_status_at(p, DSA_COMP_SUCCESS);
            assert_eq!(CompletionRecord::status_at(p), DSA_COMP_SUCCESS);
        }
        assert_eq!(rec.status, DSA_COMP_SUCCESS);
    }
}
