// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Administrative commands, the device/queue state machine and
//! configuration write-out.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use idxd::descriptor::DSA_COMP_SUCCESS;
use idxd::emulated::{CommandEvent, EmulatedDevice, EmulatorConfig, INT_HANDLE_BASE};
use idxd::registers::*;
use idxd::{
    Completion, DescriptorFlags, Device, DeviceState, DeviceType, GroupSettings, IdxdError,
    OpType, Opcode, StateChange, WqMode, WqSettings, WqState, WqType,
};

use common::*;

#[test]
fn enable_device_twice() {
    let (emu, dev) = probe(Default::default());
    dev.set_wq_settings(0, WqSettings::kernel(WqMode::Dedicated, 16, 0))
        .unwrap();
    dev.assign_engine(0, Some(0)).unwrap();
    dev.configure_device().unwrap();

    assert_eq!(dev.enable_device(), Ok(StateChange::Transitioned));
    assert_eq!(dev.state(), DeviceState::Enabled);
    emu.clear_command_log();

    assert_eq!(dev.enable_device(), Ok(StateChange::AlreadyInState));
    assert_eq!(dev.state(), DeviceState::Enabled);
    assert!(emu.commands().is_empty());
}

#[test]
fn device_enabled_behind_our_back() {
    let (emu, dev) = probe(Default::default());
    dev.set_wq_settings(0, WqSettings::kernel(WqMode::Dedicated, 16, 0))
        .unwrap();
    dev.assign_engine(0, Some(0)).unwrap();
    dev.configure_device().unwrap();

    emu.fail_next_command(Command::EnableDevice, IDXD_CMDSTS_ERR_DEV_ENABLED);
    assert_eq!(dev.enable_device(), Ok(StateChange::AlreadyInState));
    assert_eq!(emu.commands(), vec![Command::EnableDevice]);
}

#[test]
fn enable_device_needs_configuration() {
    let (_emu, dev) = probe(Default::default());
    // Nothing was configured, the device refuses.
    assert_eq!(
        dev.enable_device(),
        Err(IdxdError::CommandFailed {
            status: IDXD_CMDSTS_ERR_CONFIG
        })
    );
    assert_eq!(dev.state(), DeviceState::ConfigReady);

    dev.set_wq_settings(0, WqSettings::kernel(WqMode::Dedicated, 16, 0))
        .unwrap();
    // Group 0 has a queue but no engine.
    assert_eq!(dev.configure_device(), Err(IdxdError::InvalidConfig));
}

#[test]
fn failed_enable_reports_status() {
    let (emu, dev) = probe(Default::default());
    dev.set_wq_settings(0, WqSettings::kernel(WqMode::Dedicated, 16, 0))
        .unwrap();
    dev.assign_engine(0, Some(0)).unwrap();
    dev.configure_device().unwrap();

    emu.fail_next_command(Command::EnableDevice, IDXD_CMDSTS_ERR_CONFIG);
    assert_eq!(
        dev.enable_device(),
        Err(IdxdError::CommandFailed {
            status: IDXD_CMDSTS_ERR_CONFIG
        })
    );
    assert_eq!(dev.state(), DeviceState::ConfigReady);
}

#[test]
fn enable_queue_twice() {
    let (emu, dev) = dedicated(8);
    let wq = dev.wq(0).unwrap();
    assert_eq!(wq.state(), WqState::Enabled);
    emu.clear_command_log();

    assert_eq!(dev.enable_queue(0), Ok(StateChange::AlreadyInState));
    assert_eq!(wq.state(), WqState::Enabled);
    assert!(emu.wq_enabled(0));
    assert!(emu.commands().is_empty());
}

#[test]
fn disable_disabled_queue_issues_no_command() {
    let (emu, dev) = dedicated(8);
    emu.clear_command_log();

    assert_eq!(dev.disable_queue(3), Ok(StateChange::AlreadyInState));
    assert!(emu.command_log().is_empty());

    assert_eq!(dev.disable_queue(0), Ok(StateChange::Transitioned));
    assert_eq!(dev.disable_queue(0), Ok(StateChange::AlreadyInState));
    assert_eq!(emu.commands(), vec![Command::DisableWq]);
}

#[test]
fn queue_needs_enabled_device() {
    let (_emu, dev) = probe(Default::default());
    dev.set_wq_settings(0, WqSettings::kernel(WqMode::Dedicated, 8, 0))
        .unwrap();
    assert_eq!(dev.enable_queue(0), Err(IdxdError::DeviceNotReady));
    assert_eq!(dev.enable_kernel_wq(0), Err(IdxdError::DeviceNotReady));
}

#[test]
fn commands_do_not_interleave() {
    let (emu, dev) = probe(Default::default());
    for wq in [1, 2] {
        dev.set_wq_settings(wq, WqSettings::kernel(WqMode::Dedicated, 8, 0))
            .unwrap();
    }
    dev.assign_engine(0, Some(0)).unwrap();
    dev.configure_device().unwrap();
    dev.enable_device().unwrap();
    dev.enable_queue(2).unwrap();

    for _ in 0..20 {
        emu.clear_command_log();
        let start = Arc::new(Barrier::new(2));
        let (d1, s1) = (dev.clone(), start.clone());
        let t1 = thread::spawn(move || {
            s1.wait();
            d1.enable_queue(1)
        });
        let (d2, s2) = (dev.clone(), start.clone());
        let t2 = thread::spawn(move || {
            s2.wait();
            d2.disable_queue(2)
        });
        assert_eq!(t1.join().unwrap(), Ok(StateChange::Transitioned));
        assert_eq!(t2.join().unwrap(), Ok(StateChange::Transitioned));

        // Every command write is followed by its status read before the
        // next write.
        let log = emu.command_log();
        assert_eq!(log.len(), 4, "{:?}", log);
        for pair in log.chunks(2) {
            assert!(matches!(pair[0], CommandEvent::Write(_, _)), "{:?}", log);
            assert_eq!(pair[1], CommandEvent::StatusRead(IDXD_CMDSTS_SUCCESS), "{:?}", log);
        }

        dev.disable_queue(1).unwrap();
        dev.enable_queue(2).unwrap();
    }
}

#[test]
fn configure_is_idempotent() {
    let (emu, dev) = probe(Default::default());
    dev.set_wq_settings(0, WqSettings::kernel(WqMode::Dedicated, 16, 0))
        .unwrap();
    dev.set_wq_settings(3, WqSettings::kernel(WqMode::Dedicated, 32, 1))
        .unwrap();
    dev.assign_engine(0, Some(0)).unwrap();
    dev.assign_engine(1, Some(1)).unwrap();
    dev.set_group_settings(
        1,
        GroupSettings {
            use_token_limit: true,
            tokens_reserved: 4,
            ..Default::default()
        },
    )
    .unwrap();
    dev.set_token_limit(40).unwrap();

    let snapshot = |emu: &EmulatedDevice| {
        let wqs: Vec<WqCfg> = (0..emu.config().num_wqs).map(|i| emu.wqcfg(i)).collect();
        let groups: Vec<GroupCfg> = (0..emu.config().num_groups).map(|i| emu.grpcfg(i)).collect();
        (wqs, groups, emu.gencfg())
    };

    dev.configure_device().unwrap();
    let first = snapshot(&emu);
    dev.configure_device().unwrap();
    assert_eq!(snapshot(&emu), first);

    let (wqs, groups, gencfg) = first;
    assert_eq!(wqs[0].wq_size(), 16);
    assert!(wqs[0].mode());
    assert!(wqs[0].priv_());
    assert_eq!(wqs[3].wq_size(), 32);
    assert_eq!(groups[0].wqs[0], 1);
    assert_eq!(groups[0].engines, 1);
    assert_eq!(groups[1].wqs[0], 1 << 3);
    assert_eq!(groups[1].engines, 1 << 1);
    assert!(groups[1].flags.use_token_limit());
    assert_eq!(groups[1].flags.tokens_reserved(), 4);
    assert_eq!(groups[0].flags.tc_b(), 1);
    assert_eq!(groups[0].flags.tokens_allowed(), emu.config().total_tokens);
    assert_eq!(gencfg.token_limit(), 40);
}

#[test]
fn zero_sized_queue_is_rejected() {
    let (_emu, dev) = probe(Default::default());
    dev.set_wq_settings(0, WqSettings::kernel(WqMode::Dedicated, 0, 0))
        .unwrap();
    dev.set_wq_settings(1, WqSettings::kernel(WqMode::Dedicated, 8, 0))
        .unwrap();
    dev.assign_engine(0, Some(0)).unwrap();
    assert_eq!(dev.configure_device(), Err(IdxdError::InvalidConfig));
    assert_eq!(dev.state(), DeviceState::ConfigReady);
    assert_eq!(dev.enable_kernel_wq(0), Err(IdxdError::DeviceNotReady));
}

#[test]
fn failed_configuration_is_not_rolled_back() {
    let (emu, dev) = probe(Default::default());
    dev.set_wq_settings(0, WqSettings::kernel(WqMode::Dedicated, 16, 0))
        .unwrap();
    dev.set_wq_settings(2, WqSettings::kernel(WqMode::Dedicated, 0, 0))
        .unwrap();
    dev.assign_engine(0, Some(0)).unwrap();

    assert_eq!(dev.configure_device(), Err(IdxdError::InvalidConfig));
    // Queue 0 was written before queue 2 was found to be empty and keeps
    // its new configuration, the group tables were never written.
    assert_eq!(emu.wqcfg(0).wq_size(), 16);
    assert_eq!(emu.grpcfg(0).wqs[0], 0);
    assert_eq!(emu.grpcfg(0).engines, 0);
}

#[test]
fn settings_validation() {
    let (_emu, dev) = dedicated(8);
    assert_eq!(
        dev.set_wq_settings(0, WqSettings::kernel(WqMode::Dedicated, 4, 0)),
        Err(IdxdError::InvalidState)
    );
    assert_eq!(
        dev.set_wq_settings(1, WqSettings::kernel(WqMode::Dedicated, 4, 99)),
        Err(IdxdError::InvalidArgument)
    );
    assert_eq!(
        dev.set_wq_settings(1, WqSettings::kernel(WqMode::Dedicated, 1000, 0)),
        Err(IdxdError::InvalidArgument)
    );
    assert_eq!(dev.assign_engine(1, Some(1)), Err(IdxdError::InvalidState));
    assert!(matches!(dev.wq(1000), Err(IdxdError::InvalidArgument)));
    assert_eq!(dev.wq(0).unwrap().settings().wq_type, WqType::Kernel);
}

#[test]
fn disable_device_disables_queues() {
    let (emu, dev) = dedicated(8);
    assert_eq!(dev.disable_device(), Ok(StateChange::Transitioned));
    assert_eq!(dev.state(), DeviceState::ConfigReady);
    assert!(!dev.wq(0).unwrap().is_enabled());
    assert!(!emu.wq_enabled(0));

    emu.clear_command_log();
    assert_eq!(dev.disable_device(), Ok(StateChange::AlreadyInState));
    assert!(emu.commands().is_empty());

    // Re-enable with the same configuration.
    assert_eq!(dev.enable_device(), Ok(StateChange::Transitioned));
    assert_eq!(dev.enable_queue(0), Ok(StateChange::Transitioned));
}

#[test]
fn disable_device_accepts_not_enabled_status() {
    let (emu, dev) = dedicated(8);
    emu.fail_next_command(Command::DisableDevice, IDXD_CMDSTS_ERR_DIS_DEV_EN | 0x100);
    assert_eq!(dev.disable_device(), Ok(StateChange::Transitioned));
    assert_eq!(dev.state(), DeviceState::ConfigReady);
    assert_eq!(dev.wq(0).unwrap().state(), WqState::Disabled);
    assert_eq!(emu.commands().last(), Some(&Command::DisableDevice));
}

#[test]
fn reset_requires_reconfiguration() {
    let (emu, dev) = dedicated(8);
    dev.disable_device().unwrap();
    dev.reset_device().unwrap();
    assert_eq!(dev.state(), DeviceState::Disabled);
    assert_eq!(emu.wqcfg(0).wq_size(), 0);
    assert_eq!(dev.enable_device(), Err(IdxdError::InvalidState));

    dev.configure_device().unwrap();
    assert_eq!(dev.state(), DeviceState::ConfigReady);
    assert_eq!(emu.wqcfg(0).wq_size(), 8);
    assert_eq!(dev.enable_device(), Ok(StateChange::Transitioned));
}

#[test]
fn interrupt_handles_are_used() {
    let (emu, dev) = dedicated_with(
        EmulatorConfig {
            int_handle_req: true,
            msix_vectors: 4,
            ..Default::default()
        },
        4,
    );
    assert_eq!(dev.request_int_handle(1), Ok(INT_HANDLE_BASE + 1));

    let wq = dev.wq(0).unwrap();
    let mut desc = wq.alloc_descriptor(OpType::NonBlock).unwrap();
    assert_eq!(desc.hw().int_handle, INT_HANDLE_BASE + desc.vector() as u16);

    desc.prep(Opcode::Noop, 0, 0, 0, DescriptorFlags::RCI);
    let done = Arc::new(Completion::new());
    desc.set_done(Some(done.clone()));
    wq.submit(&desc, OpType::NonBlock).unwrap();
    emu.complete_next(0, DSA_COMP_SUCCESS);
    assert!(done.wait_timeout(TIMEOUT));
    assert_eq!(emu.delivered(desc.vector()), 1);
}

#[test]
fn interrupt_handles_not_supported() {
    let (_emu, dev) = probe(Default::default());
    assert_eq!(dev.request_int_handle(1), Err(IdxdError::NotSupported));
}

#[test]
fn pasid_commands() {
    let (emu, dev) = dedicated(8);
    emu.clear_command_log();
    dev.drain_pasid(5).unwrap();
    dev.abort_pasid(5).unwrap();
    dev.drain_queue(0).unwrap();
    assert_eq!(
        emu.commands(),
        vec![Command::DrainPasid, Command::AbortPasid, Command::DrainWq]
    );

    dev.set_wq_pasid(0, 7).unwrap();
    assert!(emu.wqcfg(0).pasid_en());
    assert_eq!(emu.wqcfg(0).pasid(), 7);
    assert!(emu.wq_enabled(0));

    dev.disable_wq_pasid(0).unwrap();
    assert!(!emu.wqcfg(0).pasid_en());
}

#[test]
fn read_only_configuration_is_loaded() {
    let _r = env_logger::try_init();
    let emu = EmulatedDevice::new(EmulatorConfig {
        config_en: false,
        ..Default::default()
    });
    let mut cfg = WqCfg::default();
    cfg.set_wq_size(8);
    cfg.set_mode(true);
    cfg.set_priv(true);
    emu.preload_wq(2, cfg, 1, 0b10);

    let dev = Device::probe(Box::new(emu.clone()), DeviceType::Dsa, Default::default()).unwrap();
    let settings = dev.wq(2).unwrap().settings();
    assert_eq!(settings.size, 8);
    assert_eq!(settings.group, Some(1));
    assert_eq!(settings.wq_type, WqType::Kernel);
    assert_eq!(settings.mode, WqMode::Dedicated);
    assert_eq!(dev.wq(0).unwrap().settings().group, None);

    assert_eq!(
        dev.set_wq_settings(2, WqSettings::kernel(WqMode::Dedicated, 4, 1)),
        Err(IdxdError::NotSupported)
    );

    assert_eq!(dev.enable_device(), Ok(StateChange::Transitioned));
    dev.enable_kernel_wq(2).unwrap();
    assert!(emu.wq_enabled(2));
    assert_eq!(emu.wqcfg(2).wq_size(), 8);
}
