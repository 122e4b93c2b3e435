// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! A driver core for Intel DSA/IAX style accelerators ("idxd").
//!
//! The crate implements the descriptor submission and completion engine of
//! the device: work-queue descriptor pools, submission through memory-mapped
//! portals, interrupt driven completion tracking and the administrative
//! command state machine that enables, disables and configures the device.
//!
//! Hardware access goes through [`pci::DeviceBacking`]. For a device that is
//! mapped into the process use [`pci::MappedDevice`], for tests (or as a
//! device simulator) use [`emulated::EmulatedDevice`].
//!
//! # Online Documentation / Sources
//! - https://www.intel.com/content/www/us/en/develop/articles/intel-data-streaming-accelerator-architecture-specification.html
//! - https://elixir.bootlin.com/linux/latest/source/drivers/dma/idxd

pub mod bitmap;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod dma;
pub mod emulated;
pub mod error;
pub mod irq;
pub mod list;
pub mod pci;
pub mod registers;
pub mod submit;
pub mod sync;
pub mod wq;

pub use config::{GroupSettings, WqMode, WqSettings, WqType};
pub use descriptor::{CompletionOutcome, CompletionRecord, DescriptorFlags, HwDescriptor, Opcode};
pub use device::{Device, DeviceState, DeviceType, ProbeOptions, StateChange, SwError};
pub use error::IdxdError;
pub use irq::IrqReturn;
pub use submit::OpType;
pub use sync::Completion;
pub use wq::{Descriptor, WorkQueue, WqState};

/// A `u32` clamped to `LOW..=HIGH`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BoundedU32<const LOW: u32, const HIGH: u32>(u32);

impl<const LOW: u32, const HIGH: u32> BoundedU32<{ LOW }, { HIGH }> {
    pub const LOW: u32 = LOW;
    pub const HIGH: u32 = HIGH;

    pub fn new(n: u32) -> Self {
        BoundedU32(n.min(Self::HIGH).max(Self::LOW))
    }

    pub fn fallible_new(n: u32) -> Result<Self, IdxdError> {
        match n {
            n if n < Self::LOW => Err(IdxdError::InvalidArgument),
            n if n > Self::HIGH => Err(IdxdError::InvalidArgument),
            n => Ok(BoundedU32(n)),
        }
    }

    pub fn set(&mut self, n: u32) {
        *self = BoundedU32(n.min(Self::HIGH).max(Self::LOW))
    }
}

impl<const LOW: u32, const HIGH: u32> core::ops::Deref for BoundedU32<{ LOW }, { HIGH }> {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A `usize` clamped to `LOW..=HIGH`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BoundedUSize<const LOW: usize, const HIGH: usize>(usize);

impl<const LOW: usize, const HIGH: usize> BoundedUSize<{ LOW }, { HIGH }> {
    pub const LOW: usize = LOW;
    pub const HIGH: usize = HIGH;

    pub fn new(n: usize) -> Self {
        BoundedUSize(n.min(Self::HIGH).max(Self::LOW))
    }

    pub fn fallible_new(n: usize) -> Result<Self, IdxdError> {
        match n {
            n if n < Self::LOW => Err(IdxdError::InvalidArgument),
            n if n > Self::HIGH => Err(IdxdError::InvalidArgument),
            n => Ok(BoundedUSize(n)),
        }
    }

    pub fn set(&mut self, n: usize) {
        *self = BoundedUSize(n.min(Self::HIGH).max(Self::LOW))
    }
}

impl<const LOW: usize, const HIGH: usize> core::ops::Deref for BoundedUSize<{ LOW }, { HIGH }> {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_clamps() {
        let p = BoundedU32::<0, 15>::new(42);
        assert_eq!(*p, 15);
        assert!(BoundedU32::<0, 15>::fallible_new(16).is_err());
        assert_eq!(*BoundedUSize::<1, 8>::new(0), 1);

        let mut s = BoundedUSize::<1, 8>::new(3);
        s.set(100);
        assert_eq!(*s, 8);
    }
}
