// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Device visible (coherent) memory.

use core::ptr;
use core::slice;
use std::alloc::{self, Layout};
use std::sync::{Arc, Weak};

use crate::error::IdxdError;

/// The raw allocation behind a [`DmaBuffer`].
///
/// Kept behind an `Arc` so a device model can hold a `Weak` reference and
/// write completion records without outliving the memory.
#[derive(Debug)]
pub struct DmaMemory {
    buf: *mut u8,
    layout: Layout,
    iova: u64,
}

// Safety: The allocation is owned exclusively by this struct, concurrent
// access to the contents is synchronized by the users (atomics on the
// completion status byte).
unsafe impl Send for DmaMemory {}
unsafe impl Sync for DmaMemory {}

impl DmaMemory {
    pub fn vaddr(&self) -> *mut u8 {
        self.buf
    }

    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Does `[iova, iova + len)` fall within this allocation?
    pub fn contains(&self, iova: u64, len: usize) -> bool {
        iova >= self.iova && iova + len as u64 <= self.iova + self.layout.size() as u64
    }
}

impl Drop for DmaMemory {
    fn drop(&mut self) {
        unsafe {
            debug_assert!(!self.buf.is_null());
            alloc::dealloc(self.buf, self.layout);
        }
    }
}

/// A zeroed, coherent buffer the device can read and write.
#[derive(Debug, Clone)]
pub struct DmaBuffer {
    inner: Arc<DmaMemory>,
}

impl DmaBuffer {
    /// Allocates zeroed memory from the heap. `iova` is derived from the
    /// virtual address through `translate`.
    pub fn new_with(
        len: usize,
        align: usize,
        translate: impl FnOnce(*mut u8) -> u64,
    ) -> Result<Self, IdxdError> {
        let layout = Layout::from_size_align(len.max(1), align)?;
        let buf = unsafe { alloc::alloc_zeroed(layout) };
        if buf.is_null() {
            return Err(IdxdError::OutOfMemory);
        }

        let iova = translate(buf);
        Ok(DmaBuffer {
            inner: Arc::new(DmaMemory { buf, layout, iova }),
        })
    }

    pub fn vaddr(&self) -> *mut u8 {
        self.inner.vaddr()
    }

    pub fn iova(&self) -> u64 {
        self.inner.iova()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn downgrade(&self) -> Weak<DmaMemory> {
        Arc::downgrade(&self.inner)
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.inner.buf, self.len()) }
    }

    pub fn clear_n(&self, offset: usize, n: usize) {
        let n = n.min(self.len().saturating_sub(offset));
        unsafe { ptr::write_bytes(self.inner.buf.add(offset), 0, n) }
    }

    pub fn clear(&self) {
        self.clear_n(0, self.len())
    }
}

/// Allocation of coherent memory (`dma_alloc_coherent`).
pub trait DmaAllocator {
    fn alloc_coherent(&self, len: usize, align: usize) -> Result<DmaBuffer, IdxdError>;
}

/// Heap backed allocator where the IO virtual address equals the virtual
/// address (identity mapped IOMMU domain, or a software device model).
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapDmaAllocator;

impl DmaAllocator for HeapDmaAllocator {
    fn alloc_coherent(&self, len: usize, align: usize) -> Result<DmaBuffer, IdxdError> {
        DmaBuffer::new_with(len, align, |va| va as u64)
    }
}
