//! Per-cycle observation intake.
//!
//! The RTL shim pushes one event per observed signal group between clock
//! edges; the ingest pipeline drains the whole intake once per engine cycle.
//! Vector writebacks arrive one lane at a time and scalar register-file
//! samples one word at a time, so those two kinds are aggregated on push.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use log::error;

use crate::warp::{LaneMask, MAX_THREADS};

/// One new warp handed to an SM by the CTA dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cta2Warp {
    pub software_wg_id: u32,
    pub software_warp_id: u32,
    pub sm_id: u32,
    pub hardware_warp_id: u32,
    pub sgpr_base: u32,
    pub vgpr_base: u32,
    pub wg_slot_id: u32,
    pub num_threads_in_warp: u32,
}

/// One instruction injected into an SM pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnDispatch {
    pub sm_id: u32,
    pub hardware_warp_id: u32,
    pub pc: u32,
    pub insn: u32,
    pub dispatch_id: u32,
    pub is_extended: bool,
}

/// Scalar register writeback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XRegWb {
    pub sm_id: u32,
    pub hardware_warp_id: u32,
    pub pc: u32,
    pub insn: u32,
    pub dispatch_id: u32,
    pub reg_idx: u32,
    pub rd: u32,
}

/// One lane of a vector register writeback. Lanes of one instruction arrive
/// independently, in any order, possibly cycles apart from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VRegWbLane {
    pub sm_id: u32,
    pub hardware_warp_id: u32,
    pub pc: u32,
    pub insn: u32,
    pub dispatch_id: u32,
    pub reg_idx: u32,
    pub thread_idx: u32,
    pub rd: u32,
    pub mask: bool,
}

/// One word of the banked scalar register file. Every bank of every SM is
/// sampled every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XRegSample {
    pub sm_id: u32,
    pub bank_id: u32,
    pub num_banks: u32,
    pub num_sgpr_slots: u32,
    /// Slot index within the bank.
    pub word_idx: u32,
    pub word: u32,
}

/// Barrier quorum reached on one workgroup slot of an SM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierDone {
    pub sm_id: u32,
    pub wg_slot_id: u32,
    pub pc: u32,
    pub insn: u32,
    pub dispatch_id: u32,
}

/// A vector writeback with all lanes seen so far folded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VRegWb {
    pub sm_id: u32,
    pub hardware_warp_id: u32,
    pub pc: u32,
    pub insn: u32,
    pub dispatch_id: u32,
    pub reg_idx: u32,
    pub rd: [u32; MAX_THREADS],
    pub mask: LaneMask,
}

/// Image of one register-file bank, rebuilt from samples each cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XRegBank {
    pub num_banks: u32,
    pub num_sgpr_slots: u32,
    pub words: Vec<u32>,
}

/// The cycle's buffered observations. One instance is owned by the engine;
/// the RTL shim gets a `&mut` to push into and the ingest pipeline takes the
/// whole thing at the cycle's start, leaving fresh empty buffers behind.
#[derive(Debug, Default)]
pub struct EventIntake {
    pub(crate) cta2warp: Vec<Cta2Warp>,
    pub(crate) dispatch: Vec<InsnDispatch>,
    pub(crate) xreg_wb: Vec<XRegWb>,
    pub(crate) vreg_wb: IndexMap<(u32, u32, u32), VRegWb>,
    pub(crate) xreg_banks: BTreeMap<(u32, u32), XRegBank>,
    pub(crate) bar_done: Vec<BarrierDone>,
}

impl EventIntake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cta2warp.is_empty()
            && self.dispatch.is_empty()
            && self.xreg_wb.is_empty()
            && self.vreg_wb.is_empty()
            && self.xreg_banks.is_empty()
            && self.bar_done.is_empty()
    }

    pub fn push_cta2warp(&mut self, ev: Cta2Warp) {
        self.cta2warp.push(ev);
    }

    pub fn push_insn_dispatch(&mut self, ev: InsnDispatch) {
        self.dispatch.push(ev);
    }

    pub fn push_xreg_wb(&mut self, ev: XRegWb) {
        self.xreg_wb.push(ev);
    }

    /// Fold one lane into the writeback record of its owning instruction,
    /// keyed by `(sm_id, hardware_warp_id, dispatch_id)`.
    pub fn push_vreg_wb_lane(&mut self, ev: VRegWbLane) {
        let lane = ev.thread_idx as usize;
        if lane >= MAX_THREADS {
            error!(
                "GVM: vreg writeback lane {} out of range (sm {}, hw_warp {}, dispatch_id {})",
                ev.thread_idx, ev.sm_id, ev.hardware_warp_id, ev.dispatch_id
            );
            return;
        }
        let agg = self
            .vreg_wb
            .entry((ev.sm_id, ev.hardware_warp_id, ev.dispatch_id))
            .or_insert_with(|| VRegWb {
                sm_id: ev.sm_id,
                hardware_warp_id: ev.hardware_warp_id,
                pc: ev.pc,
                insn: ev.insn,
                dispatch_id: ev.dispatch_id,
                reg_idx: ev.reg_idx,
                rd: [0; MAX_THREADS],
                mask: LaneMask::ZERO,
            });
        agg.rd[lane] = ev.rd;
        agg.mask.set(lane, ev.mask);
    }

    /// Fold one sampled word into its bank image.
    pub fn push_xreg_sample(&mut self, ev: XRegSample) {
        let bank = self
            .xreg_banks
            .entry((ev.sm_id, ev.bank_id))
            .or_default();
        bank.num_banks = ev.num_banks;
        bank.num_sgpr_slots = ev.num_sgpr_slots;
        let slots = if ev.num_banks == 0 {
            0
        } else {
            (ev.num_sgpr_slots / ev.num_banks) as usize
        };
        let idx = ev.word_idx as usize;
        if idx >= slots {
            error!(
                "GVM: xreg sample slot {} out of range for sm {} bank {} ({} slots)",
                ev.word_idx, ev.sm_id, ev.bank_id, slots
            );
            return;
        }
        if bank.words.len() != slots {
            bank.words.resize(slots, 0);
        }
        bank.words[idx] = ev.word;
    }

    pub fn push_barrier_done(&mut self, ev: BarrierDone) {
        self.bar_done.push(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lane(thread_idx: u32, rd: u32, mask: bool) -> VRegWbLane {
        VRegWbLane {
            sm_id: 0,
            hardware_warp_id: 3,
            pc: 0x1000,
            insn: 0x0000_0057,
            dispatch_id: 7,
            reg_idx: 5,
            thread_idx,
            rd,
            mask,
        }
    }

    #[test]
    fn vector_lanes_aggregate_regardless_of_arrival_order() {
        let mut intake = EventIntake::new();
        intake.push_vreg_wb_lane(lane(31, 0xdead, true));
        intake.push_vreg_wb_lane(lane(0, 0xbeef, true));
        intake.push_vreg_wb_lane(lane(1, 0, false));

        assert_eq!(intake.vreg_wb.len(), 1);
        let agg = &intake.vreg_wb[&(0, 3, 7)];
        assert_eq!(agg.rd[0], 0xbeef);
        assert_eq!(agg.rd[31], 0xdead);
        assert!(agg.mask[0] && agg.mask[31]);
        assert!(!agg.mask[1]);
        assert_eq!(agg.mask.count_ones(), 2);
    }

    #[test]
    fn out_of_range_lanes_are_dropped() {
        let mut intake = EventIntake::new();
        intake.push_vreg_wb_lane(lane(32, 1, true));
        assert!(intake.vreg_wb.is_empty());
    }

    #[test]
    fn samples_build_per_bank_images() {
        let mut intake = EventIntake::new();
        for (bank_id, word_idx, word) in [(0, 0, 10), (1, 0, 11), (0, 3, 13)] {
            intake.push_xreg_sample(XRegSample {
                sm_id: 1,
                bank_id,
                num_banks: 2,
                num_sgpr_slots: 8,
                word_idx,
                word,
            });
        }
        let bank0 = &intake.xreg_banks[&(1, 0)];
        assert_eq!(bank0.words, vec![10, 0, 0, 13]);
        let bank1 = &intake.xreg_banks[&(1, 1)];
        assert_eq!(bank1.words[0], 11);
    }

    #[test]
    fn taking_the_intake_leaves_it_empty() {
        let mut intake = EventIntake::new();
        intake.push_barrier_done(BarrierDone {
            sm_id: 0,
            wg_slot_id: 0,
            pc: 0x1000,
            insn: 0x0400_400b,
            dispatch_id: 4,
        });
        assert!(!intake.is_empty());
        let taken = std::mem::take(&mut intake);
        assert!(intake.is_empty());
        assert_eq!(taken.bar_done.len(), 1);
    }
}
