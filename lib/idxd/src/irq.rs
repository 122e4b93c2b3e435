// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: BSD-2-Clause

//! Interrupt handling.
//!
//! Vector 0 signals errors and command completion (the "misc" interrupt),
//! vectors 1.. signal descriptor completions. Every vector has a top half
//! that masks the vector and a thread that does the work and unmasks it
//! again.

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::descriptor::CompletionOutcome;
use crate::device::{Device, SwError};
use crate::list::{ConcurrentAppendList, SingleConsumerList};
use crate::registers::*;
use crate::wq::DescRef;

/// How often the completion thread re-scans its lists before it gives up
/// and waits for the next interrupt.
const IRQ_SWEEP_RETRIES: usize = 10;

/// Result of an interrupt handler (`irqreturn_t`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IrqReturn {
    /// Nothing to do for us.
    None,
    Handled,
    /// The top half handled the interrupt, the thread must run next.
    WakeThread,
}

/// Entry point for interrupt delivery.
pub trait InterruptHandler: Send + Sync {
    /// Called in interrupt context.
    fn top_half(&self, vector: usize) -> IrqReturn;
    /// Called afterwards in thread context when the top half returned
    /// [`IrqReturn::WakeThread`].
    fn thread(&self, vector: usize) -> IrqReturn;
}

/// Completion tracking of one interrupt vector.
pub(crate) struct IrqEntry {
    pub id: usize,
    /// Submitters push here without a lock.
    pub pending: ConcurrentAppendList<DescRef>,
    /// Submitted but not yet complete, only touched by the vector's thread
    /// (and the fault path).
    pub work: Mutex<SingleConsumerList<DescRef>>,
}

/// What a list sweep looks for.
#[derive(Debug, Copy, Clone)]
enum IrqWork {
    /// Descriptors whose completion record was written.
    Normal,
    /// The descriptor at a faulting address.
    Fault(u64),
}

impl IrqEntry {
    pub fn new(id: usize) -> IrqEntry {
        IrqEntry {
            id,
            pending: ConcurrentAppendList::new(),
            work: Mutex::new(SingleConsumerList::new()),
        }
    }

    /// Completes finished descriptors of the work list. Returns how many
    /// were completed.
    fn process_work_list(&self, work: &mut SingleConsumerList<DescRef>, wtype: IrqWork) -> usize {
        match wtype {
            IrqWork::Normal => {
                let done = work.sweep(|d| d.is_stale() || d.status() != 0);
                done.iter()
                    .filter(|d| d.complete(CompletionOutcome::from_status(d.status())))
                    .count()
            }
            IrqWork::Fault(addr) => {
                match work.remove_first(|d| !d.is_stale() && d.matches_addr(addr)) {
                    Some(d) => d.complete(CompletionOutcome::DeviceFailure) as usize,
                    None => 0,
                }
            }
        }
    }

    /// Detaches the pending list, completes what is finished and moves the
    /// rest to the work list.
    fn process_pending_list(&self, work: &mut SingleConsumerList<DescRef>, wtype: IrqWork) -> usize {
        let mut completed = 0;
        let mut fault_found = false;
        for d in self.pending.take_all() {
            if d.is_stale() {
                continue;
            }
            let finished = match wtype {
                IrqWork::Normal => d.status() != 0,
                IrqWork::Fault(addr) => !fault_found && d.matches_addr(addr),
            };
            if !finished {
                work.push_back(d);
                continue;
            }

            let outcome = match wtype {
                IrqWork::Normal => CompletionOutcome::from_status(d.status()),
                IrqWork::Fault(_) => {
                    fault_found = true;
                    CompletionOutcome::DeviceFailure
                }
            };
            if d.complete(outcome) {
                completed += 1;
            }
        }
        completed
    }

    /// Completes every tracked descriptor of `wq_id` with `outcome` (or
    /// with its status if the device finished it after all).
    fn flush(&self, wq_id: usize, outcome: CompletionOutcome) -> usize {
        let mut work = self.work.lock();
        for d in self.pending.take_all() {
            work.push_back(d);
        }
        work.sweep(|d| d.is_stale() || d.wq_id() == wq_id)
            .iter()
            .filter(|d| match d.status() {
                0 => d.complete(outcome),
                status => d.complete(CompletionOutcome::from_status(status)),
            })
            .count()
    }
}

impl InterruptHandler for Device {
    fn top_half(&self, vector: usize) -> IrqReturn {
        self.irq_handler(vector)
    }

    fn thread(&self, vector: usize) -> IrqReturn {
        self.irq_thread(vector)
    }
}

impl Device {
    /// Top half of every vector: mask it and defer to the thread.
    pub fn irq_handler(&self, vector: usize) -> IrqReturn {
        match self.mask_msix_vector(vector) {
            Ok(()) => IrqReturn::WakeThread,
            Err(_) => IrqReturn::None,
        }
    }

    pub fn irq_thread(&self, vector: usize) -> IrqReturn {
        if vector == 0 {
            self.misc_thread()
        } else {
            self.wq_thread(vector)
        }
    }

    fn wq_thread(&self, vector: usize) -> IrqReturn {
        let processed = self.process_completions(vector);
        if let Err(e) = self.unmask_msix_vector(vector) {
            warn!("Unable to unmask vector {}: {}", vector, e);
        }
        if processed == 0 {
            IrqReturn::None
        } else {
            IrqReturn::Handled
        }
    }

    /// Sweeps the completion lists of `vector`, returns the number of
    /// descriptors completed.
    pub fn process_completions(&self, vector: usize) -> usize {
        let entry = match self.irq_entry(vector) {
            Some(e) if vector != 0 => e,
            _ => return 0,
        };

        let mut work = entry.work.lock();
        let mut processed = 0;
        for _ in 0..IRQ_SWEEP_RETRIES {
            let completed = entry.process_work_list(&mut work, IrqWork::Normal)
                + entry.process_pending_list(&mut work, IrqWork::Normal);
            processed += completed;
            if completed == 0 || (work.is_empty() && entry.pending.is_empty()) {
                break;
            }
        }
        if processed > 0 {
            debug!("vector {}: {} descriptors completed", entry.id, processed);
        }
        processed
    }

    /// Force-completes the descriptor at `addr` with
    /// [`CompletionOutcome::DeviceFailure`]. Returns whether one was found.
    pub(crate) fn complete_fault_descriptor(&self, addr: u64) -> bool {
        let vectors = 1..self.irq_entries.len();
        for v in vectors.clone() {
            let _ = self.mask_msix_vector(v);
        }

        let mut found = false;
        for v in vectors.clone() {
            let entry = &self.irq_entries[v];
            let mut work = entry.work.lock();
            let wtype = IrqWork::Fault(addr);
            if entry.process_work_list(&mut work, wtype) > 0
                || entry.process_pending_list(&mut work, wtype) > 0
            {
                info!("Completed faulting descriptor at {:#x} (vector {})", addr, v);
                found = true;
                break;
            }
        }

        // Also after a match: a vector masked here is re-armed by nobody
        // else, its completions would never be delivered.
        for v in vectors {
            let _ = self.unmask_msix_vector(v);
        }
        found
    }

    /// Completes every tracked descriptor of a queue, see
    /// [`IrqEntry::flush`].
    pub(crate) fn flush_wq_descriptors(&self, wq_id: usize, outcome: CompletionOutcome) -> usize {
        self.irq_entries
            .iter()
            .skip(1)
            .map(|e| e.flush(wq_id, outcome))
            .sum()
    }

    /// Handles error, command completion and halt interrupts.
    fn misc_thread(&self) -> IrqReturn {
        let raw = self.backing.read32(IDXD_INTCAUSE_OFFSET);
        let cause = IntCause::from_bits_truncate(raw);
        let mut handled = IntCause::empty();
        let mut sw_err = None;

        if cause.contains(IntCause::ERR) {
            let err = self.read_sw_error();
            handled |= IntCause::ERR;

            match err.wq_index {
                Some(id) if err.valid && id < self.wqs.len() => self.wqs[id].notify_error(),
                _ => self.wqs.iter().for_each(|wq| wq.notify_error()),
            }
            for (i, word) in err.raw.iter().enumerate() {
                warn!("err[{}]: {:#018x}", i, word);
            }
            sw_err = Some(err);
        }

        if cause.contains(IntCause::CMD) {
            handled |= IntCause::CMD;
            if let Some(done) = self.inner.lock().cmd_done.take() {
                done.complete();
            }
        }

        // Nothing to do for these.
        handled |= cause & (IntCause::OCCUPY | IntCause::PERFMON_OVFL | IntCause::HALT_STATE);

        let unexpected = raw & !handled.bits();
        if unexpected != 0 {
            warn!("Unexpected interrupt cause bits set: {:#x}", unexpected);
        }
        self.backing.write32(IDXD_INTCAUSE_OFFSET, raw);

        if let Some(err) = sw_err {
            if err.valid && err.desc_valid {
                if let Some(addr) = err.fault_address {
                    self.complete_fault_descriptor(addr);
                }
            }
        }
        if sw_err.is_some() || cause.contains(IntCause::HALT_STATE) {
            self.check_halt();
        }

        if let Err(e) = self.unmask_msix_vector(0) {
            warn!("Unable to unmask misc vector: {}", e);
        }
        IrqReturn::Handled
    }

    fn read_sw_error(&self) -> SwError {
        let mut inner = self.inner.lock();
        let mut words = [0u64; 4];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.backing.read64(IDXD_SWERR_OFFSET + i as u64 * 8);
        }
        self.backing.write64(IDXD_SWERR_OFFSET, IDXD_SWERR_ACK);

        let err = SwError::from(SwErrReg(words));
        inner.sw_err = Some(err);
        err
    }

    fn check_halt(&self) {
        let gensts = GenStatus(self.backing.read32(IDXD_GENSTATS_OFFSET));
        if gensts.state() != HwDeviceState::Halt {
            return;
        }

        // Nobody will complete a command on a halted device.
        let restart = gensts.reset_type() == ResetType::Software;
        self.enter_halt(restart);

        if restart {
            // A software reset is enough, bring the device back the way
            // it was.
            if self.restart().is_err() {
                error!("idxd restart failed, device halt.");
            }
            self.finish_restart();
        } else {
            self.halt_wqs();
            error!(
                "idxd halted, need {}.",
                if gensts.reset_type() == ResetType::Flr {
                    "FLR"
                } else {
                    "system reset"
                }
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::{WqMode, WqSettings};
    use crate::descriptor::{DescriptorFlags, Opcode, DSA_COMP_SUCCESS};
    use crate::device::{DeviceType, ProbeOptions};
    use crate::emulated::{EmulatedDevice, EmulatorConfig};
    use crate::submit::OpType;
    use crate::sync::Completion;
    use crate::wq::Descriptor;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn dedicated(cfg: EmulatorConfig, size: u32) -> (EmulatedDevice, Arc<Device>) {
        let _r = env_logger::try_init();
        let emu = EmulatedDevice::new(cfg);
        let dev = Device::probe(Box::new(emu.clone()), DeviceType::Dsa, ProbeOptions::default())
            .expect("probe");
        dev.set_wq_settings(0, WqSettings::kernel(WqMode::Dedicated, size, 0))
            .unwrap();
        dev.assign_engine(0, Some(0)).unwrap();
        dev.configure_device().unwrap();
        dev.enable_device().unwrap();
        dev.enable_kernel_wq(0).unwrap();
        (emu, dev)
    }

    fn submit_tracked(dev: &Device, desc: &mut Descriptor) -> Arc<Completion> {
        let wq = dev.wq(desc.wq_id()).unwrap();
        desc.prep(Opcode::Noop, 0, 0, 0, DescriptorFlags::RCI);
        let done = Arc::new(Completion::new());
        desc.set_done(Some(done.clone()));
        wq.submit(desc, OpType::NonBlock).unwrap();
        done
    }

    /// Descriptors tracked on any completion vector. Moves pending entries
    /// to the work lists the way the completion thread does.
    fn tracked(dev: &Device) -> usize {
        dev.irq_entries
            .iter()
            .skip(1)
            .map(|e| {
                let mut work = e.work.lock();
                for d in e.pending.take_all() {
                    work.push_back(d);
                }
                work.len()
            })
            .sum()
    }

    #[test]
    fn completion_found_on_masked_vector() {
        let (emu, dev) = dedicated(
            EmulatorConfig {
                msix_vectors: 4,
                ..Default::default()
            },
            8,
        );
        let wq = dev.wq(0).unwrap();
        let _first = wq.alloc_descriptor(OpType::NonBlock).unwrap();
        let _second = wq.alloc_descriptor(OpType::NonBlock).unwrap();
        let mut desc = wq.alloc_descriptor(OpType::NonBlock).unwrap();
        assert_eq!(desc.vector(), 3);

        dev.mask_msix_vector(3).unwrap();
        let done = submit_tracked(&dev, &mut desc);
        assert!(!dev.irq_entries[3].pending.is_empty());
        assert!(emu.complete_next(0, DSA_COMP_SUCCESS));
        assert_eq!(emu.delivered(3), 0);

        assert_eq!(dev.process_completions(3), 1);
        assert!(done.is_done());
        assert_eq!(desc.outcome(), Some(CompletionOutcome::Normal(DSA_COMP_SUCCESS)));
        assert!(dev.irq_entries[3].pending.is_empty());
        assert!(dev.irq_entries[3].work.lock().is_empty());

        // Nothing left once the interrupt comes through.
        dev.unmask_msix_vector(3).unwrap();
        assert_eq!(dev.process_completions(3), 0);
        assert!(done.wait_timeout(TIMEOUT));
    }

    #[test]
    fn unfinished_descriptors_stay_tracked() {
        let (emu, dev) = dedicated(EmulatorConfig::default(), 8);
        let wq = dev.wq(0).unwrap();
        let mut descs: Vec<_> = (0..4)
            .map(|_| wq.alloc_descriptor(OpType::NonBlock).unwrap())
            .collect();
        let vector = descs[0].vector();
        dev.mask_msix_vector(vector).unwrap();

        let done: Vec<_> = descs.iter_mut().map(|d| submit_tracked(&dev, d)).collect();
        assert!(emu.complete_next(0, DSA_COMP_SUCCESS));
        assert_eq!(dev.process_completions(vector), 1);
        assert!(done[0].is_done());
        assert!(done[1..].iter().all(|d| !d.is_done()));
        assert_eq!(tracked(&dev), 3);
        dev.unmask_msix_vector(vector).unwrap();

        assert_eq!(emu.complete_all(0, DSA_COMP_SUCCESS), 3);
        for d in done.iter() {
            assert!(d.wait_timeout(TIMEOUT));
        }
    }

    #[test]
    fn fault_completes_only_matching_descriptor() {
        let (emu, dev) = dedicated(EmulatorConfig::default(), 16);
        let wq = dev.wq(0).unwrap();
        let mut descs: Vec<_> = (0..10)
            .map(|_| wq.alloc_descriptor(OpType::NonBlock).unwrap())
            .collect();
        assert!(descs.iter().enumerate().all(|(i, d)| d.id() == i));

        let done: Vec<_> = [3, 7, 9]
            .iter()
            .map(|i| submit_tracked(&dev, &mut descs[*i]))
            .collect();
        assert_eq!(tracked(&dev), 3);

        assert!(dev.complete_fault_descriptor(descs[7].completion_addr()));
        assert!(done[1].is_done());
        assert_eq!(descs[7].outcome(), Some(CompletionOutcome::DeviceFailure));
        assert_eq!(descs[3].outcome(), None);
        assert_eq!(descs[9].outcome(), None);
        assert!(!done[0].is_done() && !done[2].is_done());
        assert_eq!(tracked(&dev), 2);

        // The descriptor address matches as well, but 7 is gone now.
        assert!(!dev.complete_fault_descriptor(descs[7].hw_addr()));
        assert!(dev.complete_fault_descriptor(descs[3].hw_addr()));
        assert_eq!(descs[3].outcome(), Some(CompletionOutcome::DeviceFailure));
        assert_eq!(tracked(&dev), 1);

        for v in 1..=dev.num_wq_irqs() {
            assert!(!emu.is_masked(v));
        }
    }

    #[test]
    fn flush_completes_leftovers() {
        let (emu, dev) = dedicated(EmulatorConfig::default(), 8);
        let wq = dev.wq(0).unwrap();
        let mut a = wq.alloc_descriptor(OpType::NonBlock).unwrap();
        let mut b = wq.alloc_descriptor(OpType::NonBlock).unwrap();
        dev.mask_msix_vector(a.vector()).unwrap();
        dev.mask_msix_vector(b.vector()).unwrap();
        let done_a = submit_tracked(&dev, &mut a);
        let done_b = submit_tracked(&dev, &mut b);

        // The device finished one of them before the flush.
        assert!(emu.complete_next(0, DSA_COMP_SUCCESS));
        assert_eq!(dev.flush_wq_descriptors(0, CompletionOutcome::Aborted), 2);
        assert!(done_a.is_done() && done_b.is_done());
        assert_eq!(a.outcome(), Some(CompletionOutcome::Normal(DSA_COMP_SUCCESS)));
        assert_eq!(b.outcome(), Some(CompletionOutcome::Aborted));
        assert_eq!(tracked(&dev), 0);
    }
}
