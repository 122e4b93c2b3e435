// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Fixed size atomic bitmap used to hand out descriptor slots.

use core::sync::atomic::{AtomicU64, Ordering};

const BITS: usize = 64;

/// A lock-free set of `size` slots. [`SlotBitmap::get`] always claims the
/// lowest free slot so a free followed by a get from the same thread returns
/// the slot that was just freed.
#[derive(Debug)]
pub struct SlotBitmap {
    words: Box<[AtomicU64]>,
    size: usize,
}

impl SlotBitmap {
    pub fn new(size: usize) -> SlotBitmap {
        let words = (0..(size + BITS - 1) / BITS)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        SlotBitmap { words, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bits of word `w` that are beyond `size`.
    fn tail_mask(&self, w: usize) -> u64 {
        let valid = self.size - w * BITS;
        if valid >= BITS {
            0
        } else {
            !((1u64 << valid) - 1)
        }
    }

    /// Claims a free slot, `None` if all are in use.
    pub fn get(&self) -> Option<usize> {
        for (w, word) in self.words.iter().enumerate() {
            let tail = self.tail_mask(w);
            let mut cur = word.load(Ordering::Relaxed);
            loop {
                let free = !(cur | tail);
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros() as usize;
                match word.compare_exchange_weak(
                    cur,
                    cur | (1 << bit),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(w * BITS + bit),
                    Err(actual) => cur = actual,
                }
            }
        }
        None
    }

    pub fn clear(&self, slot: usize) {
        debug_assert!(slot < self.size);
        let prev = self.words[slot / BITS].fetch_and(!(1 << (slot % BITS)), Ordering::Release);
        debug_assert!(prev & (1 << (slot % BITS)) != 0, "double free of slot {}", slot);
    }

    pub fn is_set(&self, slot: usize) -> bool {
        self.words[slot / BITS].load(Ordering::Acquire) & (1 << (slot % BITS)) != 0
    }

    /// Number of claimed slots.
    pub fn weight(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    pub fn reset(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Release);
        }
    }
}
