// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! The two lists used to track in-flight descriptors of an interrupt vector.
//!
//! Submitters append to a [`ConcurrentAppendList`] without taking a lock.
//! The interrupt thread of the vector detaches it as a whole and moves
//! entries that are not yet complete into its private [`SingleConsumerList`]
//! where they are re-scanned on later sweeps.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::collections::VecDeque;

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// Multi-producer, single-consumer list (`llist`). Producers push, the
/// consumer takes everything in one atomic swap.
pub struct ConcurrentAppendList<T> {
    head: AtomicPtr<Node<T>>,
}

unsafe impl<T: Send> Send for ConcurrentAppendList<T> {}
unsafe impl<T: Send> Sync for ConcurrentAppendList<T> {}

impl<T> Default for ConcurrentAppendList<T> {
    fn default() -> Self {
        ConcurrentAppendList::new()
    }
}

impl<T> ConcurrentAppendList<T> {
    pub const fn new() -> Self {
        ConcurrentAppendList {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: `node` is not published yet, we own it.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Detaches every entry. The returned batch yields the most recently
    /// pushed entry first.
    pub fn take_all(&self) -> Detached<T> {
        Detached {
            head: self.head.swap(ptr::null_mut(), Ordering::Acquire),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for ConcurrentAppendList<T> {
    fn drop(&mut self) {
        drop(self.take_all());
    }
}

/// Entries removed from a [`ConcurrentAppendList`] by
/// [`ConcurrentAppendList::take_all`].
pub struct Detached<T> {
    head: *mut Node<T>,
}

unsafe impl<T: Send> Send for Detached<T> {}

impl<T> Iterator for Detached<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.head.is_null() {
            return None;
        }
        // Safety: Every node was created by `Box::into_raw` in `push` and is
        // owned by this batch after the swap.
        let node = unsafe { Box::from_raw(self.head) };
        self.head = node.next;
        Some(node.value)
    }
}

impl<T> Drop for Detached<T> {
    fn drop(&mut self) {
        for _ in self.by_ref() {}
    }
}

/// Ordinary list with exclusive (`&mut`) access, owned by the interrupt
/// thread of a vector.
#[derive(Debug)]
pub struct SingleConsumerList<T> {
    entries: VecDeque<T>,
}

impl<T> Default for SingleConsumerList<T> {
    fn default() -> Self {
        SingleConsumerList::new()
    }
}

impl<T> SingleConsumerList<T> {
    pub const fn new() -> Self {
        SingleConsumerList {
            entries: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, value: T) {
        self.entries.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Removes and returns (in list order) every entry for which `done`
    /// returns true, the others stay in place.
    pub fn sweep<F: FnMut(&T) -> bool>(&mut self, mut done: F) -> Vec<T> {
        let mut completed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for e in self.entries.drain(..) {
            if done(&e) {
                completed.push(e);
            } else {
                kept.push_back(e);
            }
        }
        self.entries = kept;
        completed
    }

    /// Removes the first entry matching `pred`.
    pub fn remove_first<F: FnMut(&T) -> bool>(&mut self, pred: F) -> Option<T> {
        let pos = self.entries.iter().position(pred)?;
        self.entries.remove(pos)
    }
}
