// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Descriptor allocation from kernel work queues.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use idxd::{Device, IdxdError, OpType, ProbeOptions, WqMode};

use common::*;

#[test]
fn exhaust_dedicated_queue() {
    let (_emu, dev) = dedicated(16);
    let wq = dev.wq(0).unwrap();

    let descs: Vec<_> = (0..16)
        .map(|_| wq.alloc_descriptor(OpType::NonBlock).unwrap())
        .collect();
    let ids: HashSet<usize> = descs.iter().map(|d| d.id()).collect();
    assert_eq!(ids, (0..16).collect::<HashSet<usize>>());
    assert_eq!(wq.descriptors_in_use(), 16);

    assert_eq!(
        wq.alloc_descriptor(OpType::NonBlock).unwrap_err(),
        IdxdError::TryAgain
    );
}

#[test]
fn freed_slot_is_reused() {
    let (_emu, dev) = dedicated(16);
    let wq = dev.wq(0).unwrap();

    let mut descs: Vec<_> = (0..16)
        .map(|_| Some(wq.alloc_descriptor(OpType::NonBlock).unwrap()))
        .collect();
    let five = descs[5].take().unwrap();
    assert_eq!(five.id(), 5);
    wq.free_descriptor(five);

    let again = wq.alloc_descriptor(OpType::NonBlock).unwrap();
    assert_eq!(again.id(), 5);
    assert_eq!(
        wq.alloc_descriptor(OpType::NonBlock).unwrap_err(),
        IdxdError::TryAgain
    );
}

#[test]
fn vectors_are_assigned_round_robin() {
    let (_emu, dev) = dedicated(8);
    let wq = dev.wq(0).unwrap();
    let n = dev.num_wq_irqs();

    let descs: Vec<_> = (0..2 * n)
        .map(|_| wq.alloc_descriptor(OpType::NonBlock).unwrap())
        .collect();
    for (i, d) in descs.iter().enumerate() {
        assert_eq!(d.vector(), i % n + 1);
        assert_eq!(d.hw().int_handle as usize, d.vector());
    }
}

#[test]
fn blocking_alloc_woken_by_free() {
    let (_emu, dev) = dedicated(2);
    let wq = dev.wq(0).unwrap();
    let a = wq.alloc_descriptor(OpType::NonBlock).unwrap();
    let _b = wq.alloc_descriptor(OpType::NonBlock).unwrap();

    let wq2 = wq.clone();
    let t = thread::spawn(move || wq2.alloc_descriptor(OpType::Block).map(|d| d.id()));

    // The sleeper holds the queue, non-blocking callers back off.
    assert!(wait_until(|| {
        wq.alloc_descriptor(OpType::NonBlock).unwrap_err() == IdxdError::Busy
    }));
    assert!(!t.is_finished());

    let id = a.id();
    drop(a);
    assert_eq!(t.join().unwrap(), Ok(id));
}

#[test]
fn blocking_alloc_fails_when_device_goes_away() {
    let (_emu, dev) = dedicated(1);
    let wq = dev.wq(0).unwrap();
    let _a = wq.alloc_descriptor(OpType::NonBlock).unwrap();

    let wq2 = wq.clone();
    let t = thread::spawn(move || wq2.alloc_descriptor(OpType::Block).map(|d| d.id()));
    assert!(wait_until(|| {
        wq.alloc_descriptor(OpType::NonBlock).unwrap_err() == IdxdError::Busy
    }));

    dev.disable_device().unwrap();
    assert_eq!(t.join().unwrap(), Err(IdxdError::DeviceNotReady));
    assert_eq!(
        wq.alloc_descriptor(OpType::NonBlock).unwrap_err(),
        IdxdError::DeviceNotReady
    );
}

#[test]
fn blocking_alloc_can_be_interrupted() {
    let (_emu, dev) = dedicated(1);
    let wq = dev.wq(0).unwrap();
    let _a = wq.alloc_descriptor(OpType::NonBlock).unwrap();

    let wq2 = wq.clone();
    let t = thread::spawn(move || wq2.alloc_descriptor(OpType::Block).map(|d| d.id()));
    while !t.is_finished() {
        wq.interrupt_waiters();
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(t.join().unwrap(), Err(IdxdError::Interrupted));
    assert_eq!(wq.descriptors_in_use(), 1);
}

#[test]
fn concurrent_allocations_stay_bounded() {
    let (_emu, dev) = dedicated(16);
    let wq = dev.wq(0).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let wq = wq.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    match wq.alloc_descriptor(OpType::NonBlock) {
                        Ok(d) => {
                            assert!(d.id() < 16);
                            assert!(wq.descriptors_in_use() <= 16);
                        }
                        Err(e) => assert!(e == IdxdError::TryAgain || e == IdxdError::Busy),
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(wq.descriptors_in_use(), 0);
}

/// A device with one enabled shared kernel queue (id 0) of `size`.
fn shared(size: u32) -> Arc<Device> {
    let (_emu, dev) = probe_with(Default::default(), ProbeOptions { pasid: Some(1) });
    enable_kernel_wq(&dev, 0, WqMode::Shared, size);
    dev
}

#[test]
fn blocking_shared_alloc_woken_by_free() {
    let dev = shared(2);
    let wq = dev.wq(0).unwrap();
    let a = wq.alloc_descriptor(OpType::NonBlock).unwrap();
    let _b = wq.alloc_descriptor(OpType::NonBlock).unwrap();
    assert_eq!(
        wq.alloc_descriptor(OpType::NonBlock).unwrap_err(),
        IdxdError::TryAgain
    );

    let wq2 = wq.clone();
    let t = thread::spawn(move || wq2.alloc_descriptor(OpType::Block).map(|d| d.id()));
    thread::sleep(Duration::from_millis(20));
    assert!(!t.is_finished());

    let id = a.id();
    drop(a);
    assert_eq!(t.join().unwrap(), Ok(id));
}

#[test]
fn blocking_shared_alloc_fails_when_device_goes_away() {
    let dev = shared(1);
    let wq = dev.wq(0).unwrap();
    let _a = wq.alloc_descriptor(OpType::NonBlock).unwrap();

    let wq2 = wq.clone();
    let t = thread::spawn(move || wq2.alloc_descriptor(OpType::Block).map(|d| d.id()));
    thread::sleep(Duration::from_millis(20));
    assert!(!t.is_finished());

    dev.disable_device().unwrap();
    assert_eq!(t.join().unwrap(), Err(IdxdError::DeviceNotReady));
    assert_eq!(wq.descriptors_in_use(), 1);
}

#[test]
fn blocking_shared_alloc_can_be_interrupted() {
    let dev = shared(1);
    let wq = dev.wq(0).unwrap();
    let _a = wq.alloc_descriptor(OpType::NonBlock).unwrap();

    let wq2 = wq.clone();
    let t = thread::spawn(move || wq2.alloc_descriptor(OpType::Block).map(|d| d.id()));
    while !t.is_finished() {
        wq.interrupt_waiters();
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(t.join().unwrap(), Err(IdxdError::Interrupted));
    assert_eq!(wq.descriptors_in_use(), 1);
}

#[test]
fn contended_shared_pool_stays_bounded() {
    let dev = shared(2);
    let wq = dev.wq(0).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let wq = wq.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let d = wq.alloc_descriptor(OpType::Block).unwrap();
                    assert!(d.id() < 2);
                    assert!(wq.descriptors_in_use() <= 2);
                    thread::yield_now();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(wq.descriptors_in_use(), 0);
}

#[test]
fn shared_queue_without_pasid_is_rejected() {
    let (_emu, dev) = probe(Default::default());
    dev.set_wq_settings(0, idxd::WqSettings::kernel(WqMode::Shared, 8, 0))
        .unwrap();
    dev.assign_engine(0, Some(0)).unwrap();
    assert_eq!(dev.configure_device(), Err(IdxdError::InvalidConfig));
}

#[test]
fn no_descriptors_before_enable() {
    let (_emu, dev) = probe(Default::default());
    let wq = dev.wq(0).unwrap();
    assert_eq!(
        wq.alloc_descriptor(OpType::NonBlock).unwrap_err(),
        IdxdError::DeviceNotReady
    );
}
