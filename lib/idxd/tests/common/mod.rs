// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

#![allow(unused)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use idxd::emulated::{EmulatedDevice, EmulatorConfig};
use idxd::{Device, DeviceState, DeviceType, ProbeOptions, WqMode, WqSettings};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Probes an emulated device, nothing configured yet.
pub fn probe(cfg: EmulatorConfig) -> (EmulatedDevice, Arc<Device>) {
    probe_with(cfg, ProbeOptions::default())
}

pub fn probe_with(cfg: EmulatorConfig, opts: ProbeOptions) -> (EmulatedDevice, Arc<Device>) {
    let _r = env_logger::try_init();
    let emu = EmulatedDevice::new(cfg);
    let dev = Device::probe(Box::new(emu.clone()), DeviceType::Dsa, opts).expect("probe");
    assert_eq!(dev.state(), DeviceState::ConfigReady);
    (emu, dev)
}

/// Configures `wq` as a kernel queue in group 0 (with engine 0) and
/// enables device and queue.
pub fn enable_kernel_wq(dev: &Device, wq: usize, mode: WqMode, size: u32) {
    dev.set_wq_settings(wq, WqSettings::kernel(mode, size, 0))
        .expect("wq settings");
    dev.assign_engine(0, Some(0)).expect("engine");
    if dev.state() != DeviceState::Enabled {
        dev.configure_device().expect("configure");
        dev.enable_device().expect("enable device");
    }
    dev.enable_kernel_wq(wq).expect("enable wq");
}

/// A device with one enabled dedicated kernel queue (id 0) of `size`.
pub fn dedicated(size: u32) -> (EmulatedDevice, Arc<Device>) {
    dedicated_with(EmulatorConfig::default(), size)
}

pub fn dedicated_with(cfg: EmulatorConfig, size: u32) -> (EmulatedDevice, Arc<Device>) {
    let (emu, dev) = probe(cfg);
    enable_kernel_wq(&dev, 0, WqMode::Dedicated, size);
    (emu, dev)
}

/// Polls `cond` until it holds or [`TIMEOUT`] expires.
pub fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
