// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Register layout of the device (BAR0).
//!
//! ```text
//!         --------------------------------------------------------------
//!         | VERSION | GENCAP | WQCAP | GRPCAP | ENGCAP | OPCAP | OFFSETS |
//!         --------------------------------------------------------------
//!         | GENCFG | GENCTRL | GENSTS | INTCAUSE | CMD | CMDSTS | SWERR  |
//!         --------------------------------------------------------------
//! ```
//!
//! The group configuration, work queue configuration and MSI-X permission
//! tables live at offsets published in the OFFSETS register (in units of
//! [`IDXD_TABLE_MULT`]).

#![allow(non_upper_case_globals)]

use bit_field::BitField;
use bitflags::bitflags;

pub const IDXD_VERSION_OFFSET: u64 = 0x00;
pub const IDXD_GENCAP_OFFSET: u64 = 0x10;
pub const IDXD_WQCAP_OFFSET: u64 = 0x20;
pub const IDXD_GRPCAP_OFFSET: u64 = 0x30;
pub const IDXD_ENGCAP_OFFSET: u64 = 0x38;
pub const IDXD_OPCAP_OFFSET: u64 = 0x40;
pub const IDXD_TABLE_OFFSET: u64 = 0x60;
pub const IDXD_GENCFG_OFFSET: u64 = 0x80;
pub const IDXD_GENCTRL_OFFSET: u64 = 0x88;
pub const IDXD_GENSTATS_OFFSET: u64 = 0x90;
pub const IDXD_INTCAUSE_OFFSET: u64 = 0x98;
pub const IDXD_CMD_OFFSET: u64 = 0xa0;
pub const IDXD_CMDSTS_OFFSET: u64 = 0xa8;
pub const IDXD_SWERR_OFFSET: u64 = 0xc0;

/// Table offsets in OFFSETS are expressed in multiples of this.
pub const IDXD_TABLE_MULT: u64 = 0x100;

/// Size of one WQCFG entry (eight dwords).
pub const WQCFG_STRIDE: u64 = 32;
/// Size of one GRPCFG entry.
pub const GRPCFG_STRIDE: u64 = 64;
/// Size of one MSI-X permission entry.
pub const MSIX_PERM_STRIDE: u64 = 8;

/// Size of the per work queue portal window.
pub const IDXD_PORTAL_SIZE: u64 = 0x4000;

pub const IDXD_MAX_WQS: usize = 256;
pub const IDXD_MAX_GROUPS: usize = 16;
pub const IDXD_MAX_ENGINES: usize = 64;

/// Administrative commands understood by the device.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    EnableDevice = 1,
    DisableDevice = 2,
    DrainAll = 3,
    AbortAll = 4,
    ResetDevice = 5,
    EnableWq = 6,
    DisableWq = 7,
    DrainWq = 8,
    AbortWq = 9,
    ResetWq = 10,
    DrainPasid = 11,
    AbortPasid = 12,
    RequestIntHandle = 13,
}

impl Command {
    pub fn from_code(code: u32) -> Option<Command> {
        use Command::*;
        Some(match code {
            1 => EnableDevice,
            2 => DisableDevice,
            3 => DrainAll,
            4 => AbortAll,
            5 => ResetDevice,
            6 => EnableWq,
            7 => DisableWq,
            8 => DrainWq,
            9 => AbortWq,
            10 => ResetWq,
            11 => DrainPasid,
            12 => AbortPasid,
            13 => RequestIntHandle,
            _ => return None,
        })
    }
}

// Command status (CMDSTS) values.
pub const IDXD_CMDSTS_SUCCESS: u32 = 0x0;
pub const IDXD_CMDSTS_INVAL_CMD: u32 = 0x1;
pub const IDXD_CMDSTS_INVAL_WQIDX: u32 = 0x2;
pub const IDXD_CMDSTS_HW_ERR: u32 = 0x3;
pub const IDXD_CMDSTS_ERR_DEV_ENABLED: u32 = 0x10;
pub const IDXD_CMDSTS_ERR_CONFIG: u32 = 0x11;
pub const IDXD_CMDSTS_ERR_BUSMASTER_EN: u32 = 0x12;
pub const IDXD_CMDSTS_ERR_PASID_INVAL: u32 = 0x13;
pub const IDXD_CMDSTS_ERR_WQ_SIZE_ERANGE: u32 = 0x14;
pub const IDXD_CMDSTS_ERR_GRP_CONFIG: u32 = 0x15;
pub const IDXD_CMDSTS_ERR_DEV_NOTEN: u32 = 0x20;
pub const IDXD_CMDSTS_ERR_WQ_ENABLED: u32 = 0x21;
pub const IDXD_CMDSTS_ERR_WQ_SIZE: u32 = 0x22;
pub const IDXD_CMDSTS_ERR_WQ_MODE: u32 = 0x24;
pub const IDXD_CMDSTS_ERR_DIS_DEV_EN: u32 = 0x31;
pub const IDXD_CMDSTS_ERR_DEV_NOT_EN: u32 = 0x32;
pub const IDXD_CMDSTS_ERR_INVAL_INT_IDX: u32 = 0x41;
pub const IDXD_CMDSTS_ERR_NO_HANDLE: u32 = 0x42;
/// Set while a command is executing.
pub const IDXD_CMDSTS_ACTIVE: u32 = 0x8000_0000;

/// Value written to SWERR to acknowledge (valid | overflow).
pub const IDXD_SWERR_ACK: u64 = 0x3;

bitflags! {
    /// Interrupt cause register (INTCAUSE), write-one-to-clear.
    pub struct IntCause: u32 {
        const ERR = 1 << 0;
        const CMD = 1 << 1;
        const OCCUPY = 1 << 2;
        const PERFMON_OVFL = 1 << 3;
        const HALT_STATE = 1 << 4;
    }
}

/// The command register (CMD).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CommandReg(pub u32);

impl CommandReg {
    pub fn new(cmd: Command, operand: u32, int_req: bool) -> Self {
        let mut reg = CommandReg(0);
        reg.0.set_bits(0..20, operand & 0xf_ffff);
        reg.0.set_bits(20..25, cmd as u32);
        reg.0.set_bit(31, int_req);
        reg
    }

    pub fn operand(&self) -> u32 {
        self.0.get_bits(0..20)
    }

    pub fn code(&self) -> u32 {
        self.0.get_bits(20..25)
    }

    pub fn int_req(&self) -> bool {
        self.0.get_bit(31)
    }
}

/// Operand encoding used by the DISABLE/DRAIN/ABORT/RESET_WQ commands.
pub fn wq_operand(wq_id: usize) -> u32 {
    (1u32 << (wq_id % 16)) | (((wq_id / 16) as u32) << 16)
}

/// Decodes a [`wq_operand`] back into the work queue ids it names.
pub fn wq_operand_ids(operand: u32) -> impl Iterator<Item = usize> {
    let base = operand.get_bits(16..20) as usize * 16;
    let mask = operand.get_bits(0..16);
    (0..16usize)
        .filter(move |bit| mask.get_bit(*bit))
        .map(move |bit| base + bit)
}

/// General capabilities (GENCAP).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GenCap(pub u64);

impl GenCap {
    pub fn block_on_fault(&self) -> bool {
        self.0.get_bit(0)
    }

    pub fn int_handle_req(&self) -> bool {
        self.0.get_bit(7)
    }

    pub fn max_xfer_shift(&self) -> u32 {
        self.0.get_bits(16..21) as u32
    }

    pub fn max_batch_shift(&self) -> u32 {
        self.0.get_bits(21..25) as u32
    }

    /// Configuration registers are writable by software.
    pub fn config_en(&self) -> bool {
        self.0.get_bit(31)
    }
}

/// Work queue capabilities (WQCAP).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WqCap(pub u64);

impl WqCap {
    pub fn total_wq_size(&self) -> u32 {
        self.0.get_bits(0..16) as u32
    }

    pub fn num_wqs(&self) -> usize {
        self.0.get_bits(16..24) as usize
    }

    pub fn shared_mode(&self) -> bool {
        self.0.get_bit(48)
    }

    pub fn dedicated_mode(&self) -> bool {
        self.0.get_bit(49)
    }
}

/// Group capabilities (GRPCAP).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GroupCap(pub u64);

impl GroupCap {
    pub fn num_groups(&self) -> usize {
        self.0.get_bits(0..8) as usize
    }

    pub fn total_tokens(&self) -> u32 {
        self.0.get_bits(16..24) as u32
    }
}

/// Engine capabilities (ENGCAP).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct EngineCap(pub u64);

impl EngineCap {
    pub fn num_engines(&self) -> usize {
        self.0.get_bits(0..8) as usize
    }
}

/// Table offsets (first quadword of OFFSETS).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TableOffsets(pub u64);

impl TableOffsets {
    pub fn grpcfg(&self) -> u64 {
        self.0.get_bits(0..16) * IDXD_TABLE_MULT
    }

    pub fn wqcfg(&self) -> u64 {
        self.0.get_bits(16..32) * IDXD_TABLE_MULT
    }

    pub fn msix_perm(&self) -> u64 {
        self.0.get_bits(32..48) * IDXD_TABLE_MULT
    }
}

/// General configuration (GENCFG).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GenCfg(pub u32);

impl GenCfg {
    pub fn token_limit(&self) -> u32 {
        self.0.get_bits(8..16)
    }

    pub fn set_token_limit(&mut self, limit: u32) {
        self.0.set_bits(8..16, limit & 0xff);
    }
}

/// General control (GENCTRL).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GenCtrl(pub u32);

impl GenCtrl {
    pub fn softerr_int_en(&self) -> bool {
        self.0.get_bit(0)
    }

    pub fn set_softerr_int_en(&mut self, en: bool) {
        self.0.set_bit(0, en);
    }
}

/// Hardware device state as reported in GENSTS.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HwDeviceState {
    Disabled,
    Enabled,
    Drain,
    Halt,
}

/// How a halted device must be reset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetType {
    Software,
    Flr,
    Warm,
    Cold,
}

/// General status (GENSTS).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GenStatus(pub u32);

impl GenStatus {
    pub fn new(state: HwDeviceState, reset: ResetType) -> Self {
        let mut reg = GenStatus(0);
        reg.0.set_bits(0..2, state as u32);
        reg.0.set_bits(2..4, reset as u32);
        reg
    }

    pub fn state(&self) -> HwDeviceState {
        match self.0.get_bits(0..2) {
            0 => HwDeviceState::Disabled,
            1 => HwDeviceState::Enabled,
            2 => HwDeviceState::Drain,
            _ => HwDeviceState::Halt,
        }
    }

    pub fn reset_type(&self) -> ResetType {
        match self.0.get_bits(2..4) {
            0 => ResetType::Software,
            1 => ResetType::Flr,
            2 => ResetType::Warm,
            _ => ResetType::Cold,
        }
    }
}

/// One MSI-X permission table entry.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MsixPerm(pub u32);

impl MsixPerm {
    pub fn ignore(&self) -> bool {
        self.0.get_bit(2)
    }

    pub fn set_ignore(&mut self, ignore: bool) {
        self.0.set_bit(2, ignore);
    }
}

/// Software error register (SWERR), four quadwords.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SwErrReg(pub [u64; 4]);

impl SwErrReg {
    pub fn valid(&self) -> bool {
        self.0[0].get_bit(0)
    }

    pub fn overflow(&self) -> bool {
        self.0[0].get_bit(1)
    }

    pub fn desc_valid(&self) -> bool {
        self.0[0].get_bit(2)
    }

    pub fn wq_idx_valid(&self) -> bool {
        self.0[0].get_bit(3)
    }

    pub fn error(&self) -> u8 {
        self.0[0].get_bits(8..16) as u8
    }

    pub fn wq_idx(&self) -> usize {
        self.0[0].get_bits(16..24) as usize
    }

    pub fn operation(&self) -> u8 {
        self.0[0].get_bits(32..40) as u8
    }

    pub fn pasid(&self) -> u32 {
        self.0[0].get_bits(40..60) as u32
    }

    pub fn fault_addr(&self) -> u64 {
        self.0[2]
    }
}

/// Work queue configuration table entry (WQCFG), eight dwords.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WqCfg(pub [u32; 8]);

impl WqCfg {
    pub fn wq_size(&self) -> u32 {
        self.0[0].get_bits(0..16)
    }

    pub fn set_wq_size(&mut self, size: u32) {
        self.0[0].set_bits(0..16, size & 0xffff);
    }

    pub fn wq_thresh(&self) -> u32 {
        self.0[1].get_bits(0..16)
    }

    pub fn set_wq_thresh(&mut self, thresh: u32) {
        self.0[1].set_bits(0..16, thresh & 0xffff);
    }

    /// Dedicated mode when set, shared otherwise.
    pub fn mode(&self) -> bool {
        self.0[2].get_bit(0)
    }

    pub fn set_mode(&mut self, dedicated: bool) {
        self.0[2].set_bit(0, dedicated);
    }

    pub fn bof(&self) -> bool {
        self.0[2].get_bit(1)
    }

    pub fn set_bof(&mut self, bof: bool) {
        self.0[2].set_bit(1, bof);
    }

    pub fn priority(&self) -> u32 {
        self.0[2].get_bits(4..8)
    }

    pub fn set_priority(&mut self, prio: u32) {
        self.0[2].set_bits(4..8, prio & 0xf);
    }

    pub fn pasid(&self) -> u32 {
        self.0[2].get_bits(8..28)
    }

    pub fn set_pasid(&mut self, pasid: u32) {
        self.0[2].set_bits(8..28, pasid & 0xf_ffff);
    }

    pub fn pasid_en(&self) -> bool {
        self.0[2].get_bit(28)
    }

    pub fn set_pasid_en(&mut self, en: bool) {
        self.0[2].set_bit(28, en);
    }

    pub fn priv_(&self) -> bool {
        self.0[2].get_bit(29)
    }

    pub fn set_priv(&mut self, privileged: bool) {
        self.0[2].set_bit(29, privileged);
    }

    pub fn set_max_xfer_shift(&mut self, shift: u32) {
        self.0[3].set_bits(0..5, shift & 0x1f);
    }

    pub fn set_max_batch_shift(&mut self, shift: u32) {
        self.0[3].set_bits(5..9, shift & 0xf);
    }

    /// Hardware reported queue state (1 == enabled).
    pub fn wq_state(&self) -> u32 {
        self.0[6].get_bits(30..32)
    }
}

/// Group flags (GRPFLAGS) inside a GRPCFG entry.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GroupFlags(pub u32);

impl GroupFlags {
    pub fn tc_a(&self) -> u32 {
        self.0.get_bits(0..3)
    }

    pub fn set_tc_a(&mut self, tc: u32) {
        self.0.set_bits(0..3, tc & 0x7);
    }

    pub fn tc_b(&self) -> u32 {
        self.0.get_bits(3..6)
    }

    pub fn set_tc_b(&mut self, tc: u32) {
        self.0.set_bits(3..6, tc & 0x7);
    }

    pub fn use_token_limit(&self) -> bool {
        self.0.get_bit(7)
    }

    pub fn set_use_token_limit(&mut self, en: bool) {
        self.0.set_bit(7, en);
    }

    pub fn tokens_reserved(&self) -> u32 {
        self.0.get_bits(8..16)
    }

    pub fn set_tokens_reserved(&mut self, n: u32) {
        self.0.set_bits(8..16, n & 0xff);
    }

    pub fn tokens_allowed(&self) -> u32 {
        self.0.get_bits(20..28)
    }

    pub fn set_tokens_allowed(&mut self, n: u32) {
        self.0.set_bits(20..28, n & 0xff);
    }
}

/// The software copy of a GRPCFG entry.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GroupCfg {
    pub wqs: [u64; 4],
    pub engines: u64,
    pub flags: GroupFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_reg_layout() {
        let cmd = CommandReg::new(Command::DisableWq, wq_operand(17), true);
        assert_eq!(cmd.code(), Command::DisableWq as u32);
        assert_eq!(cmd.operand(), (1 << 1) | (1 << 16));
        assert!(cmd.int_req());
        assert_eq!(cmd.0 >> 31, 1);
        assert_eq!(Command::from_code(cmd.code()), Some(Command::DisableWq));
    }

    #[test]
    fn wq_operand_decodes() {
        for id in [0usize, 5, 15, 16, 31, 200] {
            let ids: Vec<usize> = wq_operand_ids(wq_operand(id)).collect();
            assert_eq!(ids, vec![id]);
        }
    }

    #[test]
    fn wqcfg_fields() {
        let mut cfg = WqCfg::default();
        cfg.set_wq_size(16);
        cfg.set_mode(true);
        cfg.set_priority(7);
        cfg.set_pasid(0x1234);
        cfg.set_pasid_en(true);
        cfg.set_priv(true);
        assert_eq!(cfg.wq_size(), 16);
        assert!(cfg.mode());
        assert_eq!(cfg.priority(), 7);
        assert_eq!(cfg.pasid(), 0x1234);
        assert!(cfg.pasid_en() && cfg.priv_());
        assert_eq!(cfg.0[2] & 0x1, 1);
    }

    #[test]
    fn gensts_roundtrips_state() {
        let sts = GenStatus::new(HwDeviceState::Halt, ResetType::Flr);
        assert_eq!(sts.state(), HwDeviceState::Halt);
        assert_eq!(sts.reset_type(), ResetType::Flr);
    }
}
