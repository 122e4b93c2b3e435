// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Work queue, group and engine configuration and its write-out to the
//! WQCFG/GRPCFG/GENCFG registers.

use log::{debug, trace, warn};

use crate::device::{Device, DeviceInner, DeviceState, DeviceType};
use crate::error::IdxdError;
use crate::registers::*;
use crate::BoundedU32;

/// Who owns a work queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WqType {
    /// Not configured for any user.
    None,
    /// Used by the driver itself, descriptors are allocated from the queue's
    /// descriptor pool.
    Kernel,
    /// Mapped to user-space, the driver only configures it.
    User,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WqMode {
    Dedicated,
    Shared,
}

pub type WqPriority = BoundedU32<0, 15>;
pub type TrafficClass = BoundedU32<0, 7>;

/// Software configuration of a work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WqSettings {
    pub name: String,
    pub wq_type: WqType,
    pub mode: WqMode,
    /// Number of descriptors (entries in the hardware queue).
    pub size: u32,
    /// Shared queue occupancy threshold.
    pub threshold: u32,
    pub priority: WqPriority,
    pub group: Option<usize>,
    pub block_on_fault: bool,
}

impl Default for WqSettings {
    fn default() -> Self {
        WqSettings {
            name: String::new(),
            wq_type: WqType::None,
            mode: WqMode::Dedicated,
            size: 0,
            threshold: 0,
            priority: WqPriority::new(0),
            group: None,
            block_on_fault: false,
        }
    }
}

impl WqSettings {
    /// A kernel owned queue of `size` descriptors in `group`.
    pub fn kernel(mode: WqMode, size: u32, group: usize) -> Self {
        WqSettings {
            name: String::from("dmaengine"),
            wq_type: WqType::Kernel,
            mode,
            size,
            threshold: if mode == WqMode::Shared { size } else { 0 },
            priority: WqPriority::new(10),
            group: Some(group),
            block_on_fault: false,
        }
    }

    pub fn is_dedicated(&self) -> bool {
        self.mode == WqMode::Dedicated
    }
}

/// Software configuration of a group. Unset values get device defaults
/// when the configuration is written out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GroupSettings {
    pub tc_a: Option<TrafficClass>,
    pub tc_b: Option<TrafficClass>,
    pub use_token_limit: bool,
    pub tokens_reserved: u8,
    pub tokens_allowed: Option<u8>,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Group {
    pub id: usize,
    pub settings: GroupSettings,
    pub grpcfg: GroupCfg,
}

impl Group {
    pub fn new(id: usize) -> Group {
        Group {
            id,
            ..Default::default()
        }
    }
}

/// Per queue configuration state, guarded by the queue's configuration lock.
#[derive(Debug, Default, Clone)]
pub(crate) struct WqConf {
    pub settings: WqSettings,
    /// Last value written to (or read from) the queue's WQCFG.
    pub wqcfg: WqCfg,
}

impl Device {
    fn wqcfg_offset(&self, wq: usize, dword: usize) -> u64 {
        self.hw.offsets.wqcfg() + wq as u64 * WQCFG_STRIDE + dword as u64 * 4
    }

    fn grpcfg_offset(&self, group: usize, byte: u64) -> u64 {
        self.hw.offsets.grpcfg() + group as u64 * GRPCFG_STRIDE + byte
    }

    /// Writes the complete software configuration to the device.
    ///
    /// Validation happens step by step while holding the device lock: a
    /// failing step writes nothing, but registers written by earlier steps
    /// (e.g., the WQCFG of queues preceding a queue with size 0) keep their
    /// new values.
    pub fn configure_device(&self) -> Result<(), IdxdError> {
        let mut inner = self.inner.lock();
        if self.state() == DeviceState::Enabled {
            return Err(IdxdError::InvalidState);
        }
        self.device_config(&mut inner)?;
        if self.state() == DeviceState::Disabled {
            self.set_state(DeviceState::ConfigReady);
        }
        Ok(())
    }

    pub(crate) fn device_config(&self, inner: &mut DeviceInner) -> Result<(), IdxdError> {
        if !self.hw.gen_cap.config_en() {
            return self.device_ro_config();
        }

        self.wqs_setup(inner)?;
        self.engines_setup(inner)?;
        self.group_flags_setup(inner);
        self.wqs_config_write()?;
        self.groups_config_write(inner);
        Ok(())
    }

    /// For devices with read-only configuration only PASID and privilege
    /// settings of each queue are written.
    fn device_ro_config(&self) -> Result<(), IdxdError> {
        for wq in self.wqs.iter() {
            let mut conf = wq.conf.lock();
            if conf.settings.group.is_none() {
                continue;
            }

            match self.pasid {
                Some(pasid) => {
                    conf.wqcfg.set_pasid_en(true);
                    if conf.settings.wq_type == WqType::Kernel && conf.settings.is_dedicated() {
                        conf.wqcfg.set_pasid(pasid);
                    }
                }
                None => conf.wqcfg.set_pasid_en(false),
            }
            if conf.settings.wq_type == WqType::Kernel {
                conf.wqcfg.set_priv(true);
            }
            if self.bof_allowed(&conf.settings) {
                conf.wqcfg.set_bof(true);
            }

            self.backing
                .write32(self.wqcfg_offset(wq.id(), 2), conf.wqcfg.0[2]);
        }
        Ok(())
    }

    fn bof_allowed(&self, settings: &WqSettings) -> bool {
        self.dtype == DeviceType::Dsa && self.hw.gen_cap.block_on_fault() && settings.block_on_fault
    }

    fn wqs_setup(&self, inner: &mut DeviceInner) -> Result<(), IdxdError> {
        for group in inner.groups.iter_mut() {
            group.grpcfg.wqs = [0; 4];
        }

        let mut configured = 0;
        for wq in self.wqs.iter() {
            let conf = wq.conf.lock();
            let group = match conf.settings.group {
                Some(g) => g,
                None => continue,
            };
            if conf.settings.size == 0 {
                continue;
            }

            if !conf.settings.is_dedicated() && self.pasid.is_none() {
                warn!("No shared wq support but configured.");
                return Err(IdxdError::InvalidConfig);
            }

            inner.groups[group].grpcfg.wqs[wq.id() / 64] |= 1 << (wq.id() % 64);
            configured += 1;
        }

        if configured == 0 {
            return Err(IdxdError::InvalidConfig);
        }
        Ok(())
    }

    fn engines_setup(&self, inner: &mut DeviceInner) -> Result<(), IdxdError> {
        for group in inner.groups.iter_mut() {
            group.grpcfg.engines = 0;
        }

        let mut engines = 0;
        for id in 0..inner.engines.len() {
            if let Some(g) = inner.engines[id] {
                inner.groups[g].grpcfg.engines |= 1 << id;
                engines += 1;
            }
        }
        if engines == 0 {
            return Err(IdxdError::InvalidConfig);
        }

        for group in inner.groups.iter() {
            let has_wqs = group.grpcfg.wqs.iter().any(|w| *w != 0);
            if has_wqs && group.grpcfg.engines == 0 {
                warn!("Group {} has work queues but no engine.", group.id);
                return Err(IdxdError::InvalidConfig);
            }
        }
        Ok(())
    }

    fn group_flags_setup(&self, inner: &mut DeviceInner) {
        let max_tokens = self.hw.max_tokens;
        for group in inner.groups.iter_mut() {
            let s = group.settings;
            let flags = &mut group.grpcfg.flags;
            flags.set_tc_a(s.tc_a.map(|tc| *tc).unwrap_or(0));
            flags.set_tc_b(s.tc_b.map(|tc| *tc).unwrap_or(1));
            flags.set_use_token_limit(s.use_token_limit);
            flags.set_tokens_reserved(s.tokens_reserved as u32);
            match s.tokens_allowed {
                Some(n) if n > 0 => flags.set_tokens_allowed(n as u32),
                _ => flags.set_tokens_allowed(max_tokens),
            }
        }
    }

    fn wqs_config_write(&self) -> Result<(), IdxdError> {
        for wq in self.wqs.iter() {
            let mut conf = wq.conf.lock();
            if conf.settings.group.is_none() {
                continue;
            }

            let mut cfg = WqCfg::default();
            cfg.set_wq_size(conf.settings.size);
            if conf.settings.size == 0 {
                warn!("Incorrect work queue size: 0 (wq {})", wq.id());
                return Err(IdxdError::InvalidConfig);
            }

            cfg.set_wq_thresh(conf.settings.threshold);
            cfg.set_priv(conf.settings.wq_type == WqType::Kernel);
            cfg.set_mode(conf.settings.is_dedicated());
            if let Some(pasid) = self.pasid {
                cfg.set_pasid_en(true);
                if conf.settings.wq_type == WqType::Kernel && conf.settings.is_dedicated() {
                    cfg.set_pasid(pasid);
                }
            }
            cfg.set_priority(*conf.settings.priority);
            if self.bof_allowed(&conf.settings) {
                cfg.set_bof(true);
            }
            cfg.set_max_xfer_shift(self.hw.gen_cap.max_xfer_shift());
            cfg.set_max_batch_shift(self.hw.gen_cap.max_batch_shift());

            debug!("WQ {} CFGs", wq.id());
            for (i, dw) in cfg.0.iter().enumerate() {
                let offset = self.wqcfg_offset(wq.id(), i);
                self.backing.write32(offset, *dw);
                trace!("WQ[{}][{}][{:#x}]: {:#x}", wq.id(), i, offset, dw);
            }
            conf.wqcfg = cfg;
        }
        Ok(())
    }

    fn groups_config_write(&self, inner: &DeviceInner) {
        if inner.token_limit != 0 {
            let mut reg = GenCfg(self.backing.read32(IDXD_GENCFG_OFFSET));
            reg.set_token_limit(inner.token_limit);
            self.backing.write32(IDXD_GENCFG_OFFSET, reg.0);
        }
        debug!(
            "GENCFG({:#x}): {:#x}",
            IDXD_GENCFG_OFFSET,
            self.backing.read32(IDXD_GENCFG_OFFSET)
        );

        for group in inner.groups.iter() {
            debug!("Writing group {} cfg registers", group.id);
            for (i, wqs) in group.grpcfg.wqs.iter().enumerate() {
                self.backing
                    .write64(self.grpcfg_offset(group.id, i as u64 * 8), *wqs);
            }
            self.backing
                .write64(self.grpcfg_offset(group.id, 32), group.grpcfg.engines);
            self.backing
                .write32(self.grpcfg_offset(group.id, 40), group.grpcfg.flags.0);
            trace!(
                "GRPCFG[{}] wqs {:x?} engines {:#x} flags {:#x}",
                group.id,
                group.grpcfg.wqs,
                group.grpcfg.engines,
                group.grpcfg.flags.0
            );
        }
    }

    /// Reads the configuration back from the device (for devices whose
    /// configuration registers are not writable).
    pub(crate) fn load_config(&self, inner: &mut DeviceInner) {
        inner.token_limit = GenCfg(self.backing.read32(IDXD_GENCFG_OFFSET)).token_limit();

        for engine in inner.engines.iter_mut() {
            *engine = None;
        }
        for wq in self.wqs.iter() {
            wq.conf.lock().settings.group = None;
        }

        for group in inner.groups.iter_mut() {
            for i in 0..4 {
                let wqs = self.backing.read64(self.grpcfg_offset(group.id, i as u64 * 8));
                group.grpcfg.wqs[i] = wqs;
                for bit in 0..64 {
                    let wq_id = i * 64 + bit;
                    if wq_id >= self.wqs.len() {
                        break;
                    }
                    if wqs & (1 << bit) != 0 {
                        self.wqs[wq_id].conf.lock().settings.group = Some(group.id);
                    }
                }
            }

            let engines = self.backing.read64(self.grpcfg_offset(group.id, 32));
            group.grpcfg.engines = engines;
            for (id, engine) in inner.engines.iter_mut().enumerate() {
                if engines & (1 << id) != 0 {
                    *engine = Some(group.id);
                }
            }

            let flags = GroupFlags(self.backing.read32(self.grpcfg_offset(group.id, 40)));
            group.grpcfg.flags = flags;
            group.settings = GroupSettings {
                tc_a: Some(TrafficClass::new(flags.tc_a())),
                tc_b: Some(TrafficClass::new(flags.tc_b())),
                use_token_limit: flags.use_token_limit(),
                tokens_reserved: flags.tokens_reserved() as u8,
                tokens_allowed: Some(flags.tokens_allowed() as u8),
            };
            debug!("GRPCFG[{}] loaded: {:?}", group.id, group.grpcfg);
        }

        for wq in self.wqs.iter() {
            let mut cfg = WqCfg::default();
            for i in 0..8 {
                cfg.0[i] = self.backing.read32(self.wqcfg_offset(wq.id(), i));
            }

            let mut conf = wq.conf.lock();
            conf.settings.size = cfg.wq_size();
            conf.settings.threshold = cfg.wq_thresh();
            if cfg.priv_() {
                conf.settings.wq_type = WqType::Kernel;
            }
            conf.settings.mode = if cfg.mode() {
                WqMode::Dedicated
            } else {
                WqMode::Shared
            };
            conf.settings.priority = WqPriority::new(cfg.priority());
            conf.settings.block_on_fault = cfg.bof();

            if self.pasid.is_some() {
                cfg.set_pasid_en(true);
                self.backing.write32(self.wqcfg_offset(wq.id(), 2), cfg.0[2]);
            }
            conf.wqcfg = cfg;
            trace!("WQ[{}] loaded: {:x?}", wq.id(), cfg.0);
        }
    }

    /// Changes the configuration of a disabled work queue. Takes effect with
    /// the next [`Device::configure_device`].
    pub fn set_wq_settings(&self, wq_id: usize, settings: WqSettings) -> Result<(), IdxdError> {
        let wq = self.wq(wq_id)?;
        if !self.hw.gen_cap.config_en() {
            return Err(IdxdError::NotSupported);
        }
        if wq.is_enabled() {
            return Err(IdxdError::InvalidState);
        }
        if let Some(g) = settings.group {
            if g >= self.hw.max_groups {
                return Err(IdxdError::InvalidArgument);
            }
        }
        if settings.threshold > settings.size {
            return Err(IdxdError::InvalidArgument);
        }

        let others: u32 = self
            .wqs
            .iter()
            .filter(|w| w.id() != wq_id)
            .map(|w| w.conf.lock().settings.size)
            .sum();
        if others + settings.size > self.hw.max_wq_size {
            return Err(IdxdError::InvalidArgument);
        }

        wq.conf.lock().settings = settings;
        Ok(())
    }

    pub fn set_group_settings(&self, group: usize, settings: GroupSettings) -> Result<(), IdxdError> {
        let mut inner = self.inner.lock();
        if self.state() == DeviceState::Enabled {
            return Err(IdxdError::InvalidState);
        }
        let max_tokens = self.hw.max_tokens;
        if settings.tokens_reserved as u32 > max_tokens
            || settings.tokens_allowed.map_or(false, |n| n as u32 > max_tokens)
        {
            return Err(IdxdError::InvalidArgument);
        }
        inner
            .groups
            .get_mut(group)
            .ok_or(IdxdError::InvalidArgument)?
            .settings = settings;
        Ok(())
    }

    /// Assigns an engine to a group (or removes it from any group).
    pub fn assign_engine(&self, engine: usize, group: Option<usize>) -> Result<(), IdxdError> {
        let mut inner = self.inner.lock();
        if self.state() == DeviceState::Enabled {
            return Err(IdxdError::InvalidState);
        }
        if group.map_or(false, |g| g >= inner.groups.len()) {
            return Err(IdxdError::InvalidArgument);
        }
        *inner
            .engines
            .get_mut(engine)
            .ok_or(IdxdError::InvalidArgument)? = group;
        Ok(())
    }

    /// Device wide bandwidth token limit, 0 leaves GENCFG untouched.
    pub fn set_token_limit(&self, limit: u32) -> Result<(), IdxdError> {
        let mut inner = self.inner.lock();
        if limit > self.hw.max_tokens {
            return Err(IdxdError::InvalidArgument);
        }
        inner.token_limit = limit;
        Ok(())
    }

    /// Resets the configuration of a (disabled) queue and clears its WQCFG.
    pub fn wq_disable_cleanup(&self, wq_id: usize) -> Result<(), IdxdError> {
        let wq = self.wq(wq_id)?;
        let _inner = self.inner.lock();
        let mut conf = wq.conf.lock();
        *conf = WqConf::default();
        for i in 0..8 {
            let offset = self.wqcfg_offset(wq_id, i);
            self.backing.write32(offset, 0);
            trace!(
                "WQ[{}][{}][{:#x}]: {:#x}",
                wq_id,
                i,
                offset,
                self.backing.read32(offset)
            );
        }
        Ok(())
    }

    /// Disables the queue, programs `pasid` into its WQCFG and re-enables it.
    pub fn set_wq_pasid(&self, wq_id: usize, pasid: u32) -> Result<(), IdxdError> {
        self.update_wq_pasid(wq_id, Some(pasid))
    }

    pub fn disable_wq_pasid(&self, wq_id: usize) -> Result<(), IdxdError> {
        self.update_wq_pasid(wq_id, None)
    }

    fn update_wq_pasid(&self, wq_id: usize, pasid: Option<u32>) -> Result<(), IdxdError> {
        let wq = self.wq(wq_id)?;
        self.disable_queue(wq_id)?;
        {
            let _inner = self.inner.lock();
            let mut conf = wq.conf.lock();
            let offset = self.wqcfg_offset(wq_id, 2);
            let mut cfg = WqCfg::default();
            cfg.0[2] = self.backing.read32(offset);
            cfg.set_pasid_en(pasid.is_some());
            cfg.set_pasid(pasid.unwrap_or(0));
            self.backing.write32(offset, cfg.0[2]);
            conf.wqcfg.0[2] = cfg.0[2];
        }
        self.enable_queue(wq_id)?;
        Ok(())
    }
}
