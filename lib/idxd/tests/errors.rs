// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Software errors, faulting descriptors and device halts.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use idxd::registers::{Command, ResetType};
use idxd::{
    Completion, CompletionOutcome, DescriptorFlags, DeviceState, IdxdError, OpType, Opcode,
    StateChange, WqState,
};

use common::*;

#[test]
fn error_is_reported_against_queue() {
    let (emu, dev) = dedicated(4);
    let wq0 = dev.wq(0).unwrap();
    let wq3 = dev.wq(3).unwrap();
    let seen = wq3.error_events();

    emu.inject_error(Some(3), 0x20, None);
    assert_eq!(wq3.wait_error_event(seen, TIMEOUT), Ok(true));
    assert_eq!(wq0.error_events(), 0);

    let err = dev.last_error().unwrap();
    assert!(err.valid);
    assert!(!err.desc_valid);
    assert_eq!(err.wq_index, Some(3));
    assert_eq!(err.error_code, 0x20);
    assert_eq!(err.fault_address, None);

    // Misc vector is re-armed and the device keeps working.
    assert!(wait_until(|| !emu.is_masked(0)));
    assert_eq!(dev.state(), DeviceState::Enabled);
    assert_eq!(dev.disable_queue(0), Ok(StateChange::Transitioned));
}

#[test]
fn error_without_queue_reaches_every_queue() {
    let (emu, dev) = dedicated(4);
    emu.inject_error(None, 0x01, None);
    for id in [0, 5] {
        let wq = dev.wq(id).unwrap();
        assert_eq!(wq.wait_error_event(0, TIMEOUT), Ok(true));
    }
    assert_eq!(dev.last_error().unwrap().wq_index, None);
}

#[test]
fn masked_error_interrupts_are_not_delivered() {
    let (emu, dev) = dedicated(4);
    dev.mask_error_interrupts();
    let before = emu.delivered(0);

    emu.inject_error(Some(0), 0x20, None);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(emu.delivered(0), before);
    assert_eq!(dev.last_error(), None);
    assert_eq!(dev.wq(0).unwrap().error_events(), 0);
}

#[test]
fn faulting_descriptor_completes_with_failure() {
    let (emu, dev) = dedicated(4);
    let wq = dev.wq(0).unwrap();

    let descs: Vec<_> = (0..3)
        .map(|_| {
            let mut desc = wq.alloc_descriptor(OpType::NonBlock).unwrap();
            desc.prep(Opcode::Noop, 0, 0, 0, DescriptorFlags::RCI);
            let done = Arc::new(Completion::new());
            desc.set_done(Some(done.clone()));
            wq.submit(&desc, OpType::NonBlock).unwrap();
            (desc, done)
        })
        .collect();

    let (faulting, done) = &descs[1];
    emu.inject_error(Some(0), 0x03, Some(faulting.completion_addr()));
    assert!(done.wait_timeout(TIMEOUT));
    assert_eq!(faulting.outcome(), Some(CompletionOutcome::DeviceFailure));
    assert_eq!(dev.last_error().unwrap().fault_address, Some(faulting.completion_addr()));

    // The others are still tracked and complete normally.
    assert_eq!(descs[0].0.outcome(), None);
    assert_eq!(descs[2].0.outcome(), None);
    assert_eq!(emu.complete_all(0, idxd::descriptor::DSA_COMP_SUCCESS), 3);
    for (desc, done) in [&descs[0], &descs[2]] {
        assert!(done.wait_timeout(TIMEOUT));
        assert!(desc.outcome().unwrap().is_success());
    }
    for v in 1..=dev.num_wq_irqs() {
        assert!(wait_until(|| !emu.is_masked(v)));
    }
}

#[test]
fn halt_needing_software_reset_restarts_device() {
    let (emu, dev) = dedicated(4);
    let wq = dev.wq(0).unwrap();
    emu.clear_command_log();

    emu.inject_halt(ResetType::Software);
    assert!(wait_until(|| emu.wq_enabled(0)));
    assert_eq!(dev.state(), DeviceState::Enabled);
    assert_eq!(wq.state(), WqState::Enabled);
    assert_eq!(
        emu.commands(),
        vec![Command::ResetDevice, Command::EnableDevice, Command::EnableWq]
    );
    assert_eq!(emu.wqcfg(0).wq_size(), 4);
    assert!(wait_until(|| !emu.is_masked(0)));

    // Usable again.
    let mut desc = wq.alloc_descriptor(OpType::NonBlock).unwrap();
    desc.prep(Opcode::Noop, 0, 0, 0, DescriptorFlags::RCI);
    let done = Arc::new(Completion::new());
    desc.set_done(Some(done.clone()));
    wq.submit(&desc, OpType::NonBlock).unwrap();
    emu.complete_next(0, idxd::descriptor::DSA_COMP_SUCCESS);
    assert!(done.wait_timeout(TIMEOUT));
}

#[test]
fn halt_needing_flr_stops_device() {
    let (emu, dev) = dedicated(4);
    let wq = dev.wq(0).unwrap();

    emu.inject_halt(ResetType::Flr);
    assert!(wait_until(|| {
        dev.state() == DeviceState::Halted && wq.state() == WqState::Disabled
    }));
    assert!(wait_until(|| !emu.is_masked(0)));

    assert_eq!(
        wq.alloc_descriptor(OpType::NonBlock).unwrap_err(),
        IdxdError::DeviceNotReady
    );
    assert_eq!(dev.enable_queue(0), Err(IdxdError::DeviceNotReady));
    assert_eq!(dev.enable_device(), Err(IdxdError::InvalidState));
    // Only a reset is accepted.
    assert_eq!(dev.drain_pasid(1), Err(IdxdError::DeviceNotReady));
    assert_eq!(emu.commands().last(), Some(&Command::EnableWq));

    // A reset brings it back.
    dev.reset_device().unwrap();
    assert_eq!(dev.state(), DeviceState::Disabled);
    dev.configure_device().unwrap();
    assert_eq!(dev.enable_device(), Ok(StateChange::Transitioned));
    assert_eq!(dev.enable_queue(0), Ok(StateChange::Transitioned));
    assert!(wq.alloc_descriptor(OpType::NonBlock).is_ok());
}

#[test]
fn restart_with_concurrent_commands() {
    let (emu, dev) = dedicated(4);
    let stop = Arc::new(AtomicBool::new(false));

    let issuers: Vec<_> = (0..4)
        .map(|_| {
            let (dev, stop) = (dev.clone(), stop.clone());
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    match dev.drain_pasid(1) {
                        Ok(()) | Err(IdxdError::DeviceNotReady) => {}
                        // Issued just before the device halted.
                        Err(IdxdError::CommandFailed { status }) => {
                            assert_eq!(status, idxd::registers::IDXD_CMDSTS_HW_ERR)
                        }
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            })
        })
        .collect();

    for round in 0..10 {
        emu.inject_halt(ResetType::Software);
        assert!(
            wait_until(|| emu.wq_enabled(0) && !emu.is_masked(0)),
            "round {}: restart did not finish, state {:?}",
            round,
            dev.state()
        );
        assert!(wait_until(|| dev.state() == DeviceState::Enabled));
    }

    stop.store(true, Ordering::Relaxed);
    for t in issuers {
        t.join().unwrap();
    }
    assert_eq!(dev.wq(0).unwrap().state(), WqState::Enabled);
    assert_eq!(dev.drain_pasid(1), Ok(()));
}
