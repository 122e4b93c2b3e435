// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Blocking primitives used by the driver: a one-shot completion, a wait
//! queue with interruptible waits and an atomic bounded counter.

use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::time::Instant;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::error::IdxdError;

/// A completion a submitter can wait on (`struct completion`).
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    pub fn new() -> Completion {
        Completion {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    /// Returns false if the timeout expired before completion.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cv.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }

    pub fn reinit(&self) {
        *self.done.lock() = false;
    }
}

#[derive(Debug, Default)]
struct WaitState {
    interrupts: u64,
}

/// A wait queue (`wait_queue_head_t`).
///
/// The condition of a waiter is evaluated with the queue lock held, a waker
/// must change the condition before calling [`WaitQueue::wake_all`].
#[derive(Debug, Default)]
pub struct WaitQueue {
    state: Mutex<WaitState>,
    cv: Condvar,
}

impl WaitQueue {
    pub fn new() -> WaitQueue {
        WaitQueue {
            state: Mutex::new(WaitState::default()),
            cv: Condvar::new(),
        }
    }

    /// Sleeps until `cond` holds.
    pub fn wait_event<F: FnMut() -> bool>(&self, mut cond: F) {
        let mut state = self.state.lock();
        while !cond() {
            self.cv.wait(&mut state);
        }
    }

    /// Sleeps until `cond` holds or [`WaitQueue::interrupt_all`] is called.
    pub fn wait_event_interruptible<F: FnMut() -> bool>(
        &self,
        mut cond: F,
    ) -> Result<(), IdxdError> {
        let mut state = self.state.lock();
        let start = state.interrupts;
        loop {
            if cond() {
                return Ok(());
            }
            if state.interrupts != start {
                return Err(IdxdError::Interrupted);
            }
            self.cv.wait(&mut state);
        }
    }

    /// Like [`WaitQueue::wait_event_interruptible`], gives up after
    /// `timeout` and returns whether `cond` held.
    pub fn wait_timeout<F: FnMut() -> bool>(
        &self,
        mut cond: F,
        timeout: Duration,
    ) -> Result<bool, IdxdError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let start = state.interrupts;
        loop {
            if cond() {
                return Ok(true);
            }
            if state.interrupts != start {
                return Err(IdxdError::Interrupted);
            }
            if self.cv.wait_until(&mut state, deadline).timed_out() {
                return Ok(cond());
            }
        }
    }

    pub fn wake_all(&self) {
        let _state = self.state.lock();
        self.cv.notify_all();
    }

    /// Interrupts every interruptible sleeper (a pending signal).
    pub fn interrupt_all(&self) {
        let mut state = self.state.lock();
        state.interrupts = state.interrupts.wrapping_add(1);
        self.cv.notify_all();
    }
}

/// Counter that can only be incremented up to a limit
/// (`atomic_add_unless(v, 1, limit)`).
#[derive(Debug)]
pub struct BoundedCounter {
    count: CachePadded<AtomicUsize>,
    limit: usize,
}

impl BoundedCounter {
    pub fn new(limit: usize) -> BoundedCounter {
        BoundedCounter {
            count: CachePadded::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// Returns false if the counter is already at its limit.
    pub fn try_inc(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c < self.limit {
                    Some(c + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    pub fn dec(&self) {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        debug_assert!(prev.is_ok(), "BoundedCounter underflow");
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }
}
