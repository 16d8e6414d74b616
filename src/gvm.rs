//! The verification engine.
//!
//! Once per simulated clock the driver calls [`Gvm::ingest`] to fold the
//! cycle's RTL observations into per-warp shadow state, then [`Gvm::step`]
//! to retire eligible instruction prefixes against the reference model and
//! compare results. Pipeline timing is invisible here: only architectural
//! order (dispatch ids) and completion events matter.

use std::collections::BTreeMap;
use std::ops::Bound;

use console::style;
use indexmap::IndexMap;
use log::{debug, error, trace, warn};

use crate::config::GvmConfig;
use crate::error::GvmError;
use crate::events::{
    BarrierDone, Cta2Warp, EventIntake, InsnDispatch, VRegWb, XRegBank, XRegWb,
};
use crate::insn::Classifier;
use crate::reference::{RefResult, ReferenceModel};
use crate::stats::GvmStats;
use crate::warp::{
    lane_mask_string, unpack_lane_mask, CmpVerdict, InsnEntry, InsnResult, SingleCmp, WarpKey,
    WarpRecord,
};

/// One warp's share of a retire batch: how far the reference may advance
/// this cycle, and whether the prefix ends on a barrier that needs the
/// rendezvous pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetireItem {
    pub key: WarpKey,
    pub sm_id: u32,
    pub hardware_warp_id: u32,
    pub retire_cnt: u32,
    pub barrier_included: bool,
    pub barrier_retry: bool,
}

pub struct Gvm<R: ReferenceModel> {
    config: GvmConfig,
    classifier: Classifier,
    intake: EventIntake,
    warps: BTreeMap<WarpKey, WarpRecord>,
    reference: R,
    /// Scalar registers used per warp by the currently dispatched kernel.
    /// The CTA dispatch event only carries the window base.
    sgpr_usage: u32,
    stats: GvmStats,
}

impl<R: ReferenceModel> Gvm<R> {
    pub fn new(config: GvmConfig, reference: R) -> Self {
        Self {
            config,
            classifier: Classifier::default(),
            intake: EventIntake::new(),
            warps: BTreeMap::new(),
            reference,
            sgpr_usage: 32,
            stats: GvmStats::default(),
        }
    }

    /// Build with caller-supplied classifier tables (already validated by
    /// [`Classifier::from_tables`]).
    pub fn with_classifier(config: GvmConfig, classifier: Classifier, reference: R) -> Self {
        let mut gvm = Self::new(config, reference);
        gvm.classifier = classifier;
        gvm
    }

    /// Tell the engine how many scalar registers each warp of the current
    /// kernel uses. Applies to warps created afterwards.
    pub fn set_sgpr_usage(&mut self, usage: u32) {
        self.sgpr_usage = usage;
    }

    /// Buffer the RTL shim pushes observations into.
    pub fn intake_mut(&mut self) -> &mut EventIntake {
        &mut self.intake
    }

    pub fn stats(&self) -> &GvmStats {
        &self.stats
    }

    pub fn reference(&self) -> &R {
        &self.reference
    }

    pub fn warp(&self, key: &WarpKey) -> Option<&WarpRecord> {
        self.warps.get(key)
    }

    pub fn live_warps(&self) -> impl Iterator<Item = &WarpRecord> {
        self.warps.values()
    }

    /// Run one full engine cycle.
    pub fn cycle(&mut self) -> Result<(), GvmError> {
        self.ingest()?;
        self.step()
    }

    //
    // ------------------------- ingest ---------------------------------
    //

    /// Drain the intake and fold the cycle's observations into the warp
    /// registry, in fixed phase order: warp create, warp destroy, dispatch,
    /// completions (scalar, vector, barrier), register sampling, reference
    /// seeding for new warps.
    pub fn ingest(&mut self) -> Result<(), GvmError> {
        let events = std::mem::take(&mut self.intake);
        self.warp_create(&events.cta2warp)?;
        self.warp_destroy(&events.dispatch)?;
        self.insn_dispatch(&events.dispatch)?;
        self.xreg_wb_finish(&events.xreg_wb)?;
        self.vreg_wb_finish(&events.vreg_wb)?;
        self.barrier_done(&events.bar_done)?;
        self.sample_xreg(&events.xreg_banks)?;
        self.seed_new_warps(&events.cta2warp)?;
        Ok(())
    }

    fn warp_create(&mut self, events: &[Cta2Warp]) -> Result<(), GvmError> {
        for ev in events {
            let key = WarpKey::new(ev.software_wg_id, ev.software_warp_id);
            if self.warps.contains_key(&key) {
                error!("GVM error: repeated CTA dispatch for warp {key}");
                return Err(GvmError::DuplicateWarpKey { key });
            }
            if self
                .warps
                .values()
                .any(|w| w.sm_id == ev.sm_id && w.hardware_warp_id == ev.hardware_warp_id)
            {
                error!(
                    "GVM error: repeated CTA dispatch onto sm {} hw_warp {}",
                    ev.sm_id, ev.hardware_warp_id
                );
                return Err(GvmError::DuplicateWarpBinding {
                    sm_id: ev.sm_id,
                    hw_warp_id: ev.hardware_warp_id,
                });
            }
            let num_threads = ev.num_threads_in_warp as usize;
            if num_threads == 0 || num_threads > self.config.num_threads_max {
                return Err(GvmError::BadThreadCount { key, num_threads });
            }
            debug!(
                "GVM: warp {key} bound to sm {} hw_warp {} (wg_slot {}, {} threads, xreg window {}+{})",
                ev.sm_id, ev.hardware_warp_id, ev.wg_slot_id, num_threads, ev.sgpr_base, self.sgpr_usage
            );
            self.warps.insert(
                key,
                WarpRecord {
                    key,
                    sm_id: ev.sm_id,
                    hardware_warp_id: ev.hardware_warp_id,
                    wg_slot_id: ev.wg_slot_id,
                    num_threads,
                    xreg_base: ev.sgpr_base,
                    xreg_usage: self.sgpr_usage,
                    curr_xreg: Vec::new(),
                    insns: BTreeMap::new(),
                    base_dispatch_id: None,
                    next_retire_dispatch_id: 0,
                },
            );
            self.stats.warps_created += 1;
        }
        Ok(())
    }

    fn warp_destroy(&mut self, dispatches: &[InsnDispatch]) -> Result<(), GvmError> {
        for ev in dispatches {
            if ev.insn != self.config.endprg_opcode {
                continue;
            }
            let key = self
                .warps
                .values()
                .find(|w| w.sm_id == ev.sm_id && w.hardware_warp_id == ev.hardware_warp_id)
                .map(|w| w.key);
            match key {
                Some(key) => {
                    debug!(
                        "GVM: endprg dispatched, tearing down warp {key} on sm {} hw_warp {}",
                        ev.sm_id, ev.hardware_warp_id
                    );
                    self.warps.remove(&key);
                    self.stats.warps_finished += 1;
                }
                None => {
                    error!(
                        "GVM error: endprg on sm {} hw_warp {} without a live warp",
                        ev.sm_id, ev.hardware_warp_id
                    );
                    return Err(GvmError::EndprgWithoutWarp {
                        sm_id: ev.sm_id,
                        hw_warp_id: ev.hardware_warp_id,
                    });
                }
            }
        }
        Ok(())
    }

    fn insn_dispatch(&mut self, dispatches: &[InsnDispatch]) -> Result<(), GvmError> {
        for ev in dispatches {
            let retire_care = self.classifier.is_retire_care(ev.insn);
            let single_cmp_care = self.classifier.is_single_cmp_care(ev.insn);
            let Some(warp) =
                Self::warp_by_binding_mut(&mut self.warps, ev.sm_id, ev.hardware_warp_id)?
            else {
                // dispatches keep arriving between endprg dispatch and teardown
                debug!(
                    "GVM: dispatch for unbound sm {} hw_warp {} ignored (dispatch_id {}, pc {:#010x})",
                    ev.sm_id, ev.hardware_warp_id, ev.dispatch_id, ev.pc
                );
                continue;
            };
            if warp.insns.contains_key(&ev.dispatch_id) {
                error!(
                    "GVM error: dispatch_id {} reused on warp {} (pc {:#010x}, insn {:#010x})",
                    ev.dispatch_id, warp.key, ev.pc, ev.insn
                );
                return Err(GvmError::DispatchIdReused {
                    key: warp.key,
                    dispatch_id: ev.dispatch_id,
                });
            }
            if warp.base_dispatch_id.is_none() {
                warp.base_dispatch_id = Some(ev.dispatch_id);
                warp.next_retire_dispatch_id = ev.dispatch_id;
            }
            warp.insns.insert(
                ev.dispatch_id,
                InsnEntry {
                    pc: ev.pc,
                    insn: ev.insn,
                    dispatch_id: ev.dispatch_id,
                    extended: ev.is_extended,
                    retire_care,
                    done: false,
                    retired: false,
                    cmp: SingleCmp::new(single_cmp_care),
                },
            );
            self.stats.insns_dispatched += 1;
        }
        Ok(())
    }

    fn xreg_wb_finish(&mut self, events: &[XRegWb]) -> Result<(), GvmError> {
        for ev in events {
            if !self.classifier.is_retire_care(ev.insn) || self.classifier.is_barrier(ev.insn) {
                error!(
                    "GVM error: scalar writeback from an instruction outside the scalar retire set \
                     (pc {:#010x}, insn {:#010x})",
                    ev.pc, ev.insn
                );
                return Err(GvmError::CompletionChannelMismatch {
                    channel: "scalar-writeback",
                    pc: ev.pc,
                    insn: ev.insn,
                });
            }
            let single_cmp_care = self.classifier.is_single_cmp_care(ev.insn);
            let Some(warp) =
                Self::warp_by_binding_mut(&mut self.warps, ev.sm_id, ev.hardware_warp_id)?
            else {
                debug!(
                    "GVM: scalar writeback for unbound sm {} hw_warp {} ignored \
                     (dispatch_id {}, pc {:#010x})",
                    ev.sm_id, ev.hardware_warp_id, ev.dispatch_id, ev.pc
                );
                continue;
            };
            match warp.insns.get_mut(&ev.dispatch_id) {
                Some(entry) if !entry.done => {
                    if entry.pc != ev.pc || entry.insn != ev.insn {
                        return Err(GvmError::DispatchRecordMismatch {
                            key: warp.key,
                            dispatch_id: ev.dispatch_id,
                            pc: ev.pc,
                            insn: ev.insn,
                        });
                    }
                    entry.done = true;
                    if single_cmp_care {
                        entry.cmp.dut_done = true;
                        entry.cmp.dut_result = InsnResult::XReg {
                            reg_idx: ev.reg_idx,
                            rd: ev.rd,
                        };
                    }
                }
                _ => {
                    debug!(
                        "GVM: scalar writeback without a pending entry: sm {} hw_warp {} \
                         dispatch_id {} pc {:#010x} insn {:#010x}",
                        ev.sm_id, ev.hardware_warp_id, ev.dispatch_id, ev.pc, ev.insn
                    );
                }
            }
        }
        Ok(())
    }

    fn vreg_wb_finish(
        &mut self,
        events: &IndexMap<(u32, u32, u32), VRegWb>,
    ) -> Result<(), GvmError> {
        for ev in events.values() {
            if self.classifier.is_retire_care(ev.insn) || self.classifier.is_barrier(ev.insn) {
                error!(
                    "GVM error: vector writeback from a retire-relevant instruction \
                     (pc {:#010x}, insn {:#010x})",
                    ev.pc, ev.insn
                );
                return Err(GvmError::CompletionChannelMismatch {
                    channel: "vector-writeback",
                    pc: ev.pc,
                    insn: ev.insn,
                });
            }
            if !self.classifier.is_single_cmp_care(ev.insn) {
                debug!(
                    "GVM: ignoring vector writeback outside the compare set \
                     (pc {:#010x}, insn {:#010x})",
                    ev.pc, ev.insn
                );
                continue;
            }
            let Some(warp) =
                Self::warp_by_binding_mut(&mut self.warps, ev.sm_id, ev.hardware_warp_id)?
            else {
                debug!(
                    "GVM: vector writeback for unbound sm {} hw_warp {} ignored \
                     (dispatch_id {}, pc {:#010x})",
                    ev.sm_id, ev.hardware_warp_id, ev.dispatch_id, ev.pc
                );
                continue;
            };
            match warp.insns.get_mut(&ev.dispatch_id) {
                Some(entry) if !entry.cmp.dut_done => {
                    if entry.pc != ev.pc || entry.insn != ev.insn {
                        return Err(GvmError::DispatchRecordMismatch {
                            key: warp.key,
                            dispatch_id: ev.dispatch_id,
                            pc: ev.pc,
                            insn: ev.insn,
                        });
                    }
                    entry.cmp.dut_done = true;
                    entry.cmp.dut_result = InsnResult::VReg {
                        reg_idx: ev.reg_idx,
                        rd: ev.rd,
                        mask: ev.mask,
                    };
                }
                _ => {
                    debug!(
                        "GVM: vector writeback without a pending entry: sm {} hw_warp {} \
                         dispatch_id {} pc {:#010x} insn {:#010x}",
                        ev.sm_id, ev.hardware_warp_id, ev.dispatch_id, ev.pc, ev.insn
                    );
                }
            }
        }
        Ok(())
    }

    fn barrier_done(&mut self, events: &[BarrierDone]) -> Result<(), GvmError> {
        for ev in events {
            if !self.classifier.is_barrier(ev.insn)
                || !self.classifier.is_retire_care(ev.insn)
                || self.classifier.is_single_cmp_care(ev.insn)
            {
                error!(
                    "GVM error: barrier completion from a non-barrier instruction \
                     (pc {:#010x}, insn {:#010x})",
                    ev.pc, ev.insn
                );
                return Err(GvmError::CompletionChannelMismatch {
                    channel: "barrier-done",
                    pc: ev.pc,
                    insn: ev.insn,
                });
            }
            // Identified by (sm, wg_slot, pc), not dispatch_id: divergent
            // warps reach one barrier with different dispatch_ids, and the
            // reported id belongs to whichever warp arrived last. Assumes
            // two unretired barriers never share a pc on one warp.
            let mut found = false;
            for warp in self
                .warps
                .values_mut()
                .filter(|w| w.sm_id == ev.sm_id && w.wg_slot_id == ev.wg_slot_id)
            {
                for entry in warp.insns.values_mut().filter(|e| e.pc == ev.pc) {
                    if !entry.retire_care {
                        return Err(GvmError::CompletionChannelMismatch {
                            channel: "barrier-done",
                            pc: ev.pc,
                            insn: entry.insn,
                        });
                    }
                    if !entry.done {
                        found = true;
                    }
                    entry.done = true;
                }
            }
            if !found {
                debug!(
                    "GVM: barrier completion without a pending barrier entry: sm {} wg_slot {} \
                     pc {:#010x} insn {:#010x}",
                    ev.sm_id, ev.wg_slot_id, ev.pc, ev.insn
                );
            }
        }
        Ok(())
    }

    /// Pull every live warp's scalar window out of the interleaved bank
    /// images. Register i of a warp lives in bank
    /// `(i + hw_warp_id) % num_banks` at slot `(base + i) / num_banks`.
    fn sample_xreg(&mut self, banks: &BTreeMap<(u32, u32), XRegBank>) -> Result<(), GvmError> {
        for warp in self.warps.values_mut() {
            let sm_banks: BTreeMap<u32, &XRegBank> = banks
                .range((warp.sm_id, 0)..=(warp.sm_id, u32::MAX))
                .map(|(&(_, bank_id), bank)| (bank_id, bank))
                .collect();
            let Some(first) = sm_banks.values().next() else {
                error!(
                    "GVM error: no scalar register-file sample covers sm {} this cycle",
                    warp.sm_id
                );
                return Err(GvmError::MissingXRegSample { sm_id: warp.sm_id });
            };
            let num_banks = first.num_banks;
            if !num_banks.is_power_of_two()
                || warp.xreg_base % num_banks != 0
                || warp.xreg_usage % num_banks != 0
            {
                return Err(GvmError::BankMisaligned {
                    key: warp.key,
                    xreg_base: warp.xreg_base,
                    xreg_usage: warp.xreg_usage,
                    num_banks,
                });
            }
            let shift = num_banks.trailing_zeros();
            warp.curr_xreg.clear();
            warp.curr_xreg.reserve(warp.xreg_usage as usize);
            for i in 0..warp.xreg_usage {
                let bank_id = (i + warp.hardware_warp_id) % num_banks;
                let slot = ((warp.xreg_base + i) >> shift) as usize;
                let word = sm_banks
                    .get(&bank_id)
                    .and_then(|bank| bank.words.get(slot))
                    .copied()
                    .ok_or(GvmError::MissingXRegSample { sm_id: warp.sm_id })?;
                warp.curr_xreg.push(word);
            }
            // the DUT special-cases x0; mirror that rather than verify it
            if let Some(x0) = warp.curr_xreg.first_mut() {
                *x0 = 0;
            }
        }
        Ok(())
    }

    /// Push each freshly created warp's sampled window into the reference,
    /// which zero-initialises registers the hardware leaves as residue.
    fn seed_new_warps(&mut self, events: &[Cta2Warp]) -> Result<(), GvmError> {
        for ev in events {
            let key = WarpKey::new(ev.software_wg_id, ev.software_warp_id);
            let Some(warp) = self.warps.get(&key) else {
                error!("GVM error: warp {key} vanished before its registers were seeded");
                return Err(GvmError::SeedWarpMissing { key });
            };
            self.reference.set_warp_xreg(key, &warp.curr_xreg);
        }
        Ok(())
    }

    fn warp_by_binding_mut<'a>(
        warps: &'a mut BTreeMap<WarpKey, WarpRecord>,
        sm_id: u32,
        hw_warp_id: u32,
    ) -> Result<Option<&'a mut WarpRecord>, GvmError> {
        let mut matches = warps
            .values_mut()
            .filter(|w| w.sm_id == sm_id && w.hardware_warp_id == hw_warp_id);
        let first = matches.next();
        if matches.next().is_some() {
            return Err(GvmError::DuplicateWarpBinding { sm_id, hw_warp_id });
        }
        Ok(first)
    }

    //
    // ------------------------- step -----------------------------------
    //

    /// Retire every eligible prefix against the reference and compare.
    pub fn step(&mut self) -> Result<(), GvmError> {
        let mut batch = self.check_retire()?;
        self.step_reference(&mut batch)?;
        self.single_insn_cmp();
        self.retire_cmp(&batch);
        self.collect_retired();
        self.stats.cycles += 1;
        Ok(())
    }

    /// Per warp, choose the maximal in-order prefix that may retire: it must
    /// end on a completed retire-relevant entry (non-relevant entries ride
    /// along), a completed barrier cuts it, and any completed retire-relevant
    /// entry beyond the prefix means the DUT finished something the reference
    /// cannot reach yet, so the warp waits.
    fn check_retire(&self) -> Result<Vec<RetireItem>, GvmError> {
        let mut batch = Vec::new();
        for warp in self.warps.values() {
            let Some(head) = warp.insns.get(&warp.next_retire_dispatch_id) else {
                continue;
            };
            debug_assert!(!head.retired);

            let mut final_cnt: u32 = 0;
            let mut uncommitted: u32 = 0;
            let mut barriered = false;
            let mut stop_id = None;
            for (&id, entry) in warp.insns.range(warp.next_retire_dispatch_id..) {
                if !entry.retire_care {
                    uncommitted += 1;
                } else if entry.done {
                    final_cnt += uncommitted + 1;
                    uncommitted = 0;
                    if self.classifier.is_barrier(entry.insn) {
                        barriered = true;
                        stop_id = Some(id);
                        break;
                    }
                } else {
                    stop_id = Some(id);
                    break;
                }
            }

            let mut closable = true;
            if let Some(stop) = stop_id {
                for entry in warp
                    .insns
                    .range((Bound::Excluded(stop), Bound::Unbounded))
                    .map(|(_, e)| e)
                {
                    if barriered {
                        if entry.retire_care && entry.done {
                            error!(
                                "GVM error: completion past a completed barrier on warp {} \
                                 (dispatch_id {}, pc {:#010x})",
                                warp.key, entry.dispatch_id, entry.pc
                            );
                            return Err(GvmError::CompletionPastBarrier {
                                key: warp.key,
                                dispatch_id: entry.dispatch_id,
                            });
                        }
                    } else if entry.retire_care && entry.done {
                        closable = false;
                        break;
                    }
                }
            }
            if final_cnt == 0 || !closable {
                continue;
            }

            for entry in warp
                .insns
                .range(warp.next_retire_dispatch_id..)
                .map(|(_, e)| e)
                .take(final_cnt as usize)
            {
                let name = self.classifier.disasm(entry.insn)?.unwrap_or(" ");
                debug!(
                    "GVM retire: sm_id: {}, hardware_warp_id: {}, software_wg_id: {}, \
                     software_warp_id: {}, dispatch_id: {}, pc: {:#010x}, insn: {:#010x} {}",
                    warp.sm_id,
                    warp.hardware_warp_id,
                    warp.key.wg_id,
                    warp.key.warp_id,
                    entry.dispatch_id,
                    entry.pc,
                    entry.insn,
                    name
                );
            }
            batch.push(RetireItem {
                key: warp.key,
                sm_id: warp.sm_id,
                hardware_warp_id: warp.hardware_warp_id,
                retire_cnt: final_cnt,
                barrier_included: barriered,
                barrier_retry: false,
            });
        }
        Ok(batch)
    }

    /// Walk the reference through each retired prefix.
    ///
    /// Pass A steps every warp through its whole prefix; a barrier whose
    /// step leaves the reference PC in place parks the warp instead of
    /// advancing the retire pointer. Pass B then steps each parked warp
    /// once more: with every sibling now arrived, the quorum is complete
    /// and the barrier must fall in the same cycle.
    fn step_reference(&mut self, batch: &mut [RetireItem]) -> Result<(), GvmError> {
        for item in batch.iter_mut() {
            let warp = self
                .warps
                .get_mut(&item.key)
                .expect("retire batch names a live warp");
            for _ in 0..item.retire_cnt {
                let id = warp.next_retire_dispatch_id;
                let entry = warp.insns.get_mut(&id).expect("retire prefix entry");

                if entry.extended {
                    // the regext prefix costs a reference step of its own
                    let _ = self.reference.step(item.key);
                }

                let ref_pc = self.reference.next_pc(item.key);
                if ref_pc != entry.pc {
                    error!(
                        "GVM error: DUT and REF next PC mismatch on sm_id {}, hardware_warp_id {}, \
                         warp {}: DUT {:#010x}, REF {:#010x}",
                        item.sm_id, item.hardware_warp_id, item.key, entry.pc, ref_pc
                    );
                    return Err(GvmError::PcMismatch {
                        key: item.key,
                        dut_pc: entry.pc,
                        ref_pc,
                    });
                }

                let info = self.reference.step(item.key);
                let pc_after = self.reference.next_pc(item.key);
                if pc_after == ref_pc {
                    debug!(
                        "GVM: REF PC held at {:#010x} after step on warp {}",
                        ref_pc, item.key
                    );
                    if self.classifier.is_barrier(entry.insn) {
                        debug_assert!(!item.barrier_retry);
                        item.barrier_retry = true;
                    }
                }

                if entry.cmp.care {
                    debug_assert_eq!(entry.cmp.verdict, CmpVerdict::Pending);
                    match info.result {
                        RefResult::XReg { reg_idx, rd } => {
                            entry.cmp.ref_done = true;
                            entry.cmp.ref_result = InsnResult::XReg { reg_idx, rd };
                        }
                        RefResult::VReg { reg_idx, rd, mask } => {
                            entry.cmp.ref_done = true;
                            entry.cmp.ref_result = InsnResult::VReg {
                                reg_idx,
                                rd,
                                mask: unpack_lane_mask(mask, warp.num_threads),
                            };
                        }
                        RefResult::DontCare => {
                            warn!(
                                "GVM warning: suspected DUT/REF instruction-kind mismatch at \
                                 pc {:#010x}, insn {:#010x}",
                                entry.pc, entry.insn
                            );
                            // marked done with no payload so the entry can
                            // still be reclaimed; the comparator records the
                            // unknown kind
                            entry.cmp.ref_done = true;
                        }
                    }
                }

                if !item.barrier_retry {
                    entry.retired = true;
                    warp.next_retire_dispatch_id = id + 1;
                    self.stats.insns_retired += 1;
                }
            }
        }

        // rendezvous pass: every parked sibling has stepped once by now
        for item in batch.iter().filter(|i| i.barrier_included && i.barrier_retry) {
            let warp = self
                .warps
                .get_mut(&item.key)
                .expect("retire batch names a live warp");
            let id = warp.next_retire_dispatch_id;
            let entry = warp.insns.get_mut(&id).expect("parked barrier entry");
            debug_assert!(!entry.extended && !entry.cmp.care);

            let ref_pc = self.reference.next_pc(item.key);
            if ref_pc != entry.pc {
                error!(
                    "GVM error: DUT and REF next PC mismatch at barrier on warp {}: \
                     DUT {:#010x}, REF {:#010x}",
                    item.key, entry.pc, ref_pc
                );
                return Err(GvmError::PcMismatch {
                    key: item.key,
                    dut_pc: entry.pc,
                    ref_pc,
                });
            }
            let _ = self.reference.step(item.key);
            let pc_after = self.reference.next_pc(item.key);
            if pc_after == ref_pc {
                error!(
                    "GVM error: REF did not advance over the barrier at pc {:#010x} on warp {}",
                    entry.pc, item.key
                );
                return Err(GvmError::BarrierDeadlock {
                    key: item.key,
                    pc: entry.pc,
                });
            }
            entry.retired = true;
            warp.next_retire_dispatch_id = id + 1;
            self.stats.insns_retired += 1;
        }
        Ok(())
    }

    /// Compare instruction results wherever both sides have reported one.
    fn single_insn_cmp(&mut self) {
        for warp in self.warps.values_mut() {
            let (sm_id, hw_warp_id, key, num_threads) = (
                warp.sm_id,
                warp.hardware_warp_id,
                warp.key,
                warp.num_threads,
            );
            for entry in warp.insns.values_mut() {
                if !(entry.cmp.care && entry.cmp.dut_done && entry.cmp.ref_done) {
                    continue;
                }
                if entry.cmp.verdict != CmpVerdict::Pending {
                    continue;
                }
                let verdict = match (&entry.cmp.dut_result, &entry.cmp.ref_result) {
                    (
                        InsnResult::XReg {
                            reg_idx: dut_idx,
                            rd: dut_rd,
                        },
                        InsnResult::XReg {
                            reg_idx: ref_idx,
                            rd: ref_rd,
                        },
                    ) => {
                        if dut_idx != ref_idx || dut_rd != ref_rd {
                            error!(
                                "GVM error: DUT and REF insn result mismatch at sm_id {}, \
                                 hardware_warp_id {}, warp {}, dispatch_id {}, pc {:#010x}, \
                                 insn {:#010x}: DUT x{} = {}, REF x{} = {}",
                                sm_id,
                                hw_warp_id,
                                key,
                                entry.dispatch_id,
                                entry.pc,
                                entry.insn,
                                dut_idx,
                                style(format!("{dut_rd:#010x}")).red(),
                                ref_idx,
                                style(format!("{ref_rd:#010x}")).green(),
                            );
                            CmpVerdict::Fail
                        } else {
                            CmpVerdict::Pass
                        }
                    }
                    (
                        InsnResult::VReg {
                            reg_idx: dut_idx,
                            rd: dut_rd,
                            mask: dut_mask,
                        },
                        InsnResult::VReg {
                            reg_idx: ref_idx,
                            rd: ref_rd,
                            mask: ref_mask,
                        },
                    ) => {
                        // lanes past the warp width must stay silent on the DUT side
                        let high_lanes_active = dut_mask[num_threads..].any();
                        if dut_idx != ref_idx
                            || dut_mask[..num_threads] != ref_mask[..num_threads]
                            || high_lanes_active
                        {
                            error!(
                                "GVM error: DUT and REF vreg writeback mask or reg_idx mismatch \
                                 at sm_id {}, hardware_warp_id {}, warp {}, dispatch_id {}, \
                                 pc {:#010x}, insn {:#010x}: DUT v{} mask {}, REF v{} mask {}",
                                sm_id,
                                hw_warp_id,
                                key,
                                entry.dispatch_id,
                                entry.pc,
                                entry.insn,
                                dut_idx,
                                lane_mask_string(dut_mask, num_threads),
                                ref_idx,
                                lane_mask_string(ref_mask, num_threads),
                            );
                            CmpVerdict::Fail
                        } else {
                            let fp32 = self.classifier.is_fp32_vreg(entry.insn);
                            let mut verdict = CmpVerdict::Pass;
                            for lane in (0..num_threads).filter(|&i| dut_mask[i]) {
                                let (dut, reference) = (dut_rd[lane], ref_rd[lane]);
                                let lane_ok = if fp32 {
                                    let dut = f32::from_bits(dut);
                                    let reference = f32::from_bits(reference);
                                    (dut - reference).abs()
                                        <= self.config.fp32_atol
                                            + self.config.fp32_rtol * reference.abs()
                                } else {
                                    dut == reference
                                };
                                if !lane_ok {
                                    error!(
                                        "GVM error: DUT and REF vreg lane mismatch at sm_id {}, \
                                         hardware_warp_id {}, warp {}, dispatch_id {}, \
                                         pc {:#010x}, insn {:#010x}: v{} lane {}: DUT {}, REF {}",
                                        sm_id,
                                        hw_warp_id,
                                        key,
                                        entry.dispatch_id,
                                        entry.pc,
                                        entry.insn,
                                        dut_idx,
                                        lane,
                                        style(format!("{:#010x}", dut_rd[lane])).red(),
                                        style(format!("{:#010x}", ref_rd[lane])).green(),
                                    );
                                    verdict = CmpVerdict::Fail;
                                }
                            }
                            verdict
                        }
                    }
                    _ => {
                        warn!(
                            "GVM: cannot compare result kinds at pc {:#010x}, insn {:#010x}",
                            entry.pc, entry.insn
                        );
                        CmpVerdict::UnknownInsn
                    }
                };
                entry.cmp.verdict = verdict;
                trace!(
                    "GVM: single-insn compare verdict {verdict} for dispatch_id {} on warp {key}",
                    entry.dispatch_id
                );
                match verdict {
                    CmpVerdict::Pass => self.stats.single_cmp_pass += 1,
                    CmpVerdict::Fail => self.stats.single_cmp_fail += 1,
                    CmpVerdict::UnknownInsn => self.stats.single_cmp_unknown += 1,
                    CmpVerdict::Pending => {}
                }
            }
        }
    }

    /// After a warp advanced, its sampled scalar window must agree with the
    /// reference register file. Divergence is reported but not fatal.
    fn retire_cmp(&mut self, batch: &[RetireItem]) {
        for item in batch {
            let Some(warp) = self.warps.get(&item.key) else {
                continue;
            };
            let ref_xreg = self.reference.get_xreg(item.key);
            for (i, (&dut, &reference)) in warp.curr_xreg.iter().zip(&ref_xreg).enumerate() {
                if dut != reference {
                    self.stats.retire_cmp_mismatch_words += 1;
                    error!(
                        "GVM error: DUT and REF xreg mismatch at sm_id {}, hardware_warp_id {}, \
                         warp {}: x{}: DUT = {}, REF = {}",
                        warp.sm_id,
                        warp.hardware_warp_id,
                        warp.key,
                        i,
                        style(format!("{dut:#010x}")).red(),
                        style(format!("{reference:#010x}")).green(),
                    );
                }
            }
        }
    }

    /// Drop retired-and-compared entries from the front of each warp's
    /// in-flight map, never reclaiming past a pending entry.
    fn collect_retired(&mut self) {
        for warp in self.warps.values_mut() {
            while let Some((&id, entry)) = warp.insns.first_key_value() {
                if entry.reclaimable() {
                    warp.insns.remove(&id);
                } else {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{VRegWbLane, XRegSample};
    use crate::testing::{init_test, ScriptedInsn, ScriptedRef};
    use pretty_assertions::assert_eq;

    const ADD: u32 = 0x0020_8133; // add x2, x1, x2
    const LUI: u32 = 0x0001_00b7; // lui x1, 0x10
    const VADD_VV: u32 = 0x0220_81d7; // vadd.vv v3, v2, v1
    const VFADD_VV: u32 = 0x0210_11d7; // vfadd.vv v3, v2, v1
    const BARRIER: u32 = 0x0400_400b;
    const ENDPRG: u32 = 0x0000_400b;
    const REGEXT: u32 = 0x0000_000b;

    fn cta(wg: u32, warp: u32, sm: u32, hw: u32, sgpr_base: u32, slot: u32, threads: u32) -> Cta2Warp {
        Cta2Warp {
            software_wg_id: wg,
            software_warp_id: warp,
            sm_id: sm,
            hardware_warp_id: hw,
            sgpr_base,
            vgpr_base: 0,
            wg_slot_id: slot,
            num_threads_in_warp: threads,
        }
    }

    fn disp(sm: u32, hw: u32, pc: u32, insn: u32, id: u32) -> InsnDispatch {
        InsnDispatch {
            sm_id: sm,
            hardware_warp_id: hw,
            pc,
            insn,
            dispatch_id: id,
            is_extended: false,
        }
    }

    fn wb(sm: u32, hw: u32, pc: u32, insn: u32, id: u32, reg_idx: u32, rd: u32) -> XRegWb {
        XRegWb {
            sm_id: sm,
            hardware_warp_id: hw,
            pc,
            insn,
            dispatch_id: id,
            reg_idx,
            rd,
        }
    }

    fn vlane(
        sm: u32,
        hw: u32,
        pc: u32,
        insn: u32,
        id: u32,
        reg_idx: u32,
        lane: u32,
        rd: u32,
        mask: bool,
    ) -> VRegWbLane {
        VRegWbLane {
            sm_id: sm,
            hardware_warp_id: hw,
            pc,
            insn,
            dispatch_id: id,
            reg_idx,
            thread_idx: lane,
            rd,
            mask,
        }
    }

    fn bar(sm: u32, slot: u32, pc: u32, id: u32) -> BarrierDone {
        BarrierDone {
            sm_id: sm,
            wg_slot_id: slot,
            pc,
            insn: BARRIER,
            dispatch_id: id,
        }
    }

    /// Sample one SM's register file as a single flat bank.
    fn sample_sm(gvm: &mut Gvm<ScriptedRef>, sm: u32, words: &[u32]) {
        for (i, &word) in words.iter().enumerate() {
            gvm.intake_mut().push_xreg_sample(XRegSample {
                sm_id: sm,
                bank_id: 0,
                num_banks: 1,
                num_sgpr_slots: words.len() as u32,
                word_idx: i as u32,
                word,
            });
        }
    }

    #[test]
    fn solo_scalar_add_retires_and_matches() {
        init_test();
        let key = WarpKey::new(0, 0);
        let mut reference = ScriptedRef::new();
        reference.load_warp(key, vec![ScriptedInsn::xreg(0x1000, ADD, 2, 2)]);
        let mut gvm = Gvm::new(GvmConfig::default(), reference);

        gvm.intake_mut().push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        gvm.intake_mut().push_insn_dispatch(disp(0, 0, 0x1000, ADD, 0));
        sample_sm(&mut gvm, 0, &[0; 32]);
        gvm.cycle().unwrap();
        assert_eq!(gvm.stats().insns_retired, 0);
        assert_eq!(gvm.reference().steps_taken, 0);

        gvm.intake_mut().push_xreg_wb(wb(0, 0, 0x1000, ADD, 0, 2, 2));
        let mut window = [0u32; 32];
        window[2] = 2;
        sample_sm(&mut gvm, 0, &window);
        gvm.cycle().unwrap();

        assert_eq!(gvm.stats().insns_retired, 1);
        assert_eq!(gvm.stats().retire_cmp_mismatch_words, 0);
        // a scalar op never enters single-instruction compare
        assert_eq!(gvm.stats().single_cmp_pass, 0);
        assert_eq!(gvm.reference().xreg_word(key, 2), 2);
        let warp = gvm.warp(&key).unwrap();
        assert!(warp.insns.is_empty());
        assert_eq!(warp.next_retire_dispatch_id, 1);
    }

    #[test]
    fn vector_writeback_rides_behind_a_closing_scalar() {
        init_test();
        let key = WarpKey::new(0, 0);
        let mut rd = [0u32; 32];
        rd[0] = 7;
        rd[31] = 9;
        let mut reference = ScriptedRef::new();
        reference.load_warp(
            key,
            vec![
                ScriptedInsn::xreg(0x1000, LUI, 1, 0x10000),
                ScriptedInsn::vreg(0x1004, VADD_VV, 3, rd, 0x8000_0001),
                ScriptedInsn::xreg(0x1008, ADD, 2, 5),
            ],
        );
        let mut gvm = Gvm::new(GvmConfig::default(), reference);

        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        intake.push_insn_dispatch(disp(0, 0, 0x1000, LUI, 0));
        intake.push_insn_dispatch(disp(0, 0, 0x1004, VADD_VV, 1));
        intake.push_insn_dispatch(disp(0, 0, 0x1008, ADD, 2));
        // lanes arrive out of order, high lane first, while the leading
        // scalar is still outstanding
        intake.push_vreg_wb_lane(vlane(0, 0, 0x1004, VADD_VV, 1, 3, 31, 9, true));
        intake.push_vreg_wb_lane(vlane(0, 0, 0x1004, VADD_VV, 1, 3, 0, 7, true));
        sample_sm(&mut gvm, 0, &[0; 32]);
        gvm.cycle().unwrap();
        assert_eq!(gvm.reference().steps_taken, 0);
        assert_eq!(gvm.stats().insns_retired, 0);

        gvm.intake_mut().push_xreg_wb(wb(0, 0, 0x1000, LUI, 0, 1, 0x10000));
        let mut window = [0u32; 32];
        window[1] = 0x10000;
        sample_sm(&mut gvm, 0, &window);
        gvm.cycle().unwrap();
        assert_eq!(gvm.stats().insns_retired, 1);
        assert_eq!(gvm.warp(&key).unwrap().next_retire_dispatch_id, 1);
        assert_eq!(gvm.stats().single_cmp_pass, 0);

        gvm.intake_mut().push_xreg_wb(wb(0, 0, 0x1008, ADD, 2, 2, 5));
        window[2] = 5;
        sample_sm(&mut gvm, 0, &window);
        gvm.cycle().unwrap();
        assert_eq!(gvm.stats().insns_retired, 3);
        assert_eq!(gvm.stats().single_cmp_pass, 1);
        assert_eq!(gvm.stats().single_cmp_fail, 0);
        assert!(gvm.warp(&key).unwrap().insns.is_empty());
    }

    #[test]
    fn barrier_rendezvous_releases_all_warps_in_one_cycle() {
        init_test();
        let a = WarpKey::new(0, 0);
        let b = WarpKey::new(0, 1);
        let mut reference = ScriptedRef::new();
        for key in [a, b] {
            let mut program: Vec<ScriptedInsn> = (0..5)
                .map(|i| ScriptedInsn::xreg(0x1000 + 4 * i, ADD, 2, i + 1))
                .collect();
            program.push(ScriptedInsn::barrier(0x1014, BARRIER, 0));
            reference.load_warp(key, program);
        }
        let mut gvm = Gvm::new(GvmConfig::default(), reference);

        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        intake.push_cta2warp(cta(0, 1, 0, 1, 32, 0, 32));
        for (hw, id_base) in [(0u32, 0u32), (1, 0)] {
            for i in 0..5 {
                intake.push_insn_dispatch(disp(0, hw, 0x1000 + 4 * i, ADD, id_base + i));
                intake.push_xreg_wb(wb(0, hw, 0x1000 + 4 * i, ADD, id_base + i, 2, i + 1));
            }
            intake.push_insn_dispatch(disp(0, hw, 0x1014, BARRIER, id_base + 5));
        }
        intake.push_barrier_done(bar(0, 0, 0x1014, 5));
        let mut file = [0u32; 64];
        file[2] = 5; // warp a window
        file[32 + 2] = 5; // warp b window
        sample_sm(&mut gvm, 0, &file);
        gvm.cycle().unwrap();

        assert_eq!(gvm.stats().insns_retired, 12);
        // 5 scalar steps + a parked barrier step + the rendezvous step, per warp
        assert_eq!(gvm.reference().steps_taken, 14);
        assert_eq!(gvm.stats().retire_cmp_mismatch_words, 0);
        for key in [a, b] {
            let warp = gvm.warp(&key).unwrap();
            assert_eq!(warp.next_retire_dispatch_id, 6);
            assert!(warp.insns.is_empty());
        }
    }

    #[test]
    fn completion_past_a_completed_barrier_is_fatal() {
        init_test();
        let key = WarpKey::new(0, 0);
        let mut reference = ScriptedRef::new();
        reference.load_warp(key, vec![ScriptedInsn::barrier(0x1000, BARRIER, 0)]);
        let mut gvm = Gvm::new(GvmConfig::default(), reference);

        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        intake.push_insn_dispatch(disp(0, 0, 0x1000, BARRIER, 0));
        intake.push_insn_dispatch(disp(0, 0, 0x1004, ADD, 1));
        intake.push_barrier_done(bar(0, 0, 0x1000, 0));
        intake.push_xreg_wb(wb(0, 0, 0x1004, ADD, 1, 2, 1));
        sample_sm(&mut gvm, 0, &[0; 32]);
        let err = gvm.cycle().unwrap_err();
        assert_eq!(
            err,
            GvmError::CompletionPastBarrier {
                key,
                dispatch_id: 1
            }
        );
    }

    fn run_fp32(atol: f32, rtol: f32) -> GvmStats {
        let key = WarpKey::new(0, 0);
        let mut rd = [0u32; 32];
        rd[0] = 0x3f80_0000; // 1.0
        let mut reference = ScriptedRef::new();
        reference.load_warp(
            key,
            vec![
                ScriptedInsn::vreg(0x1000, VFADD_VV, 1, rd, 0x1),
                ScriptedInsn::xreg(0x1004, ADD, 2, 1),
            ],
        );
        let config = GvmConfig {
            fp32_atol: atol,
            fp32_rtol: rtol,
            ..GvmConfig::default()
        };
        let mut gvm = Gvm::new(config, reference);
        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        intake.push_insn_dispatch(disp(0, 0, 0x1000, VFADD_VV, 0));
        intake.push_insn_dispatch(disp(0, 0, 0x1004, ADD, 1));
        intake.push_vreg_wb_lane(vlane(0, 0, 0x1000, VFADD_VV, 0, 1, 0, 0x3f80_0001, true));
        intake.push_xreg_wb(wb(0, 0, 0x1004, ADD, 1, 2, 1));
        let mut window = [0u32; 32];
        window[2] = 1;
        sample_sm(&mut gvm, 0, &window);
        gvm.cycle().unwrap();
        gvm.stats().clone()
    }

    #[test]
    fn fp32_lanes_compare_within_tolerance() {
        init_test();
        // 1.0000001 vs 1.0 passes the default 1e-3 tolerance
        let stats = run_fp32(1e-3, 1e-3);
        assert_eq!(stats.single_cmp_pass, 1);
        assert_eq!(stats.single_cmp_fail, 0);

        // and fails a zero tolerance
        let stats = run_fp32(0.0, 0.0);
        assert_eq!(stats.single_cmp_pass, 0);
        assert_eq!(stats.single_cmp_fail, 1);
    }

    #[test]
    fn scalar_file_divergence_logs_and_continues() {
        init_test();
        let key = WarpKey::new(0, 0);
        let mut reference = ScriptedRef::new();
        reference.load_warp(key, vec![ScriptedInsn::xreg(0x1000, ADD, 5, 0x10)]);
        let mut gvm = Gvm::new(GvmConfig::default(), reference);

        gvm.intake_mut().push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        gvm.intake_mut().push_insn_dispatch(disp(0, 0, 0x1000, ADD, 0));
        sample_sm(&mut gvm, 0, &[0; 32]);
        gvm.cycle().unwrap();

        gvm.intake_mut().push_xreg_wb(wb(0, 0, 0x1000, ADD, 0, 5, 0x11));
        let mut window = [0u32; 32];
        window[5] = 0x11; // DUT disagrees with the reference's 0x10
        sample_sm(&mut gvm, 0, &window);
        gvm.cycle().unwrap();

        assert_eq!(gvm.stats().insns_retired, 1);
        assert_eq!(gvm.stats().retire_cmp_mismatch_words, 1);
        assert_eq!(gvm.stats().single_cmp_fail, 0);
        assert!(gvm.warp(&key).is_some());
        assert!(gvm.warp(&key).unwrap().insns.is_empty());
    }

    #[test]
    fn endprg_tears_down_and_strays_are_tolerated() {
        init_test();
        let key = WarpKey::new(0, 0);
        let mut gvm = Gvm::new(GvmConfig::default(), ScriptedRef::new());

        gvm.intake_mut().push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        sample_sm(&mut gvm, 0, &[0; 32]);
        gvm.cycle().unwrap();
        assert!(gvm.warp(&key).is_some());

        gvm.intake_mut().push_insn_dispatch(disp(0, 0, 0x1000, ENDPRG, 0));
        gvm.cycle().unwrap();
        assert_eq!(gvm.stats().warps_finished, 1);
        assert!(gvm.warp(&key).is_none());

        // completions and dispatches keep trickling in after teardown
        gvm.intake_mut().push_xreg_wb(wb(0, 0, 0x0ff0, ADD, 7, 2, 1));
        gvm.intake_mut().push_insn_dispatch(disp(0, 0, 0x0ff4, ADD, 8));
        gvm.cycle().unwrap();
        assert_eq!(gvm.stats().insns_dispatched, 0);
    }

    #[test]
    fn out_of_order_completion_defers_the_batch() {
        init_test();
        let key = WarpKey::new(0, 0);
        let mut reference = ScriptedRef::new();
        reference.load_warp(
            key,
            vec![
                ScriptedInsn::xreg(0x1000, ADD, 2, 1),
                ScriptedInsn::xreg(0x1004, ADD, 3, 2),
                ScriptedInsn::xreg(0x1008, ADD, 4, 3),
            ],
        );
        let mut gvm = Gvm::new(GvmConfig::default(), reference);

        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        for i in 0..3 {
            intake.push_insn_dispatch(disp(0, 0, 0x1000 + 4 * i, ADD, i));
        }
        // the first and third complete; the second is still in the pipeline
        intake.push_xreg_wb(wb(0, 0, 0x1000, ADD, 0, 2, 1));
        intake.push_xreg_wb(wb(0, 0, 0x1008, ADD, 2, 4, 3));
        sample_sm(&mut gvm, 0, &[0; 32]);
        gvm.cycle().unwrap();
        // a completed entry beyond the prefix holds the whole warp back
        assert_eq!(gvm.reference().steps_taken, 0);
        assert_eq!(gvm.stats().insns_retired, 0);

        gvm.intake_mut().push_xreg_wb(wb(0, 0, 0x1004, ADD, 1, 3, 2));
        let mut window = [0u32; 32];
        window[2] = 1;
        window[3] = 2;
        window[4] = 3;
        sample_sm(&mut gvm, 0, &window);
        gvm.cycle().unwrap();
        assert_eq!(gvm.stats().insns_retired, 3);
        assert_eq!(gvm.stats().retire_cmp_mismatch_words, 0);
    }

    #[test]
    fn extended_instructions_cost_one_extra_reference_step() {
        init_test();
        let key = WarpKey::new(0, 0);
        let mut reference = ScriptedRef::new();
        reference.load_warp(
            key,
            vec![
                ScriptedInsn::plain(0x1000, REGEXT),
                ScriptedInsn::xreg(0x1004, ADD, 2, 1),
            ],
        );
        let mut gvm = Gvm::new(GvmConfig::default(), reference);

        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        intake.push_insn_dispatch(InsnDispatch {
            is_extended: true,
            ..disp(0, 0, 0x1004, ADD, 0)
        });
        intake.push_xreg_wb(wb(0, 0, 0x1004, ADD, 0, 2, 1));
        let mut window = [0u32; 32];
        window[2] = 1;
        sample_sm(&mut gvm, 0, &window);
        gvm.cycle().unwrap();

        assert_eq!(gvm.stats().insns_retired, 1);
        assert_eq!(gvm.reference().steps_taken, 2);
        assert_eq!(gvm.stats().retire_cmp_mismatch_words, 0);
    }

    #[test]
    fn reference_pc_divergence_is_fatal() {
        init_test();
        let key = WarpKey::new(0, 0);
        let mut reference = ScriptedRef::new();
        reference.load_warp(key, vec![ScriptedInsn::xreg(0x2000, ADD, 2, 1)]);
        let mut gvm = Gvm::new(GvmConfig::default(), reference);

        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        intake.push_insn_dispatch(disp(0, 0, 0x1000, ADD, 0));
        intake.push_xreg_wb(wb(0, 0, 0x1000, ADD, 0, 2, 1));
        sample_sm(&mut gvm, 0, &[0; 32]);
        let err = gvm.cycle().unwrap_err();
        assert_eq!(
            err,
            GvmError::PcMismatch {
                key,
                dut_pc: 0x1000,
                ref_pc: 0x2000
            }
        );
    }

    #[test]
    fn reference_stuck_on_a_barrier_rendezvous_is_fatal() {
        init_test();
        let a = WarpKey::new(0, 0);
        let b = WarpKey::new(0, 1);
        let mut reference = ScriptedRef::new();
        reference.load_warp(a, vec![ScriptedInsn::barrier(0x1000, BARRIER, 0)]);
        // the sibling participates in the quorum but never runs
        reference.load_warp(b, vec![ScriptedInsn::barrier(0x1000, BARRIER, 0)]);
        let mut gvm = Gvm::new(GvmConfig::default(), reference);

        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        intake.push_insn_dispatch(disp(0, 0, 0x1000, BARRIER, 0));
        intake.push_barrier_done(bar(0, 0, 0x1000, 0));
        sample_sm(&mut gvm, 0, &[0; 32]);
        let err = gvm.cycle().unwrap_err();
        assert_eq!(err, GvmError::BarrierDeadlock { key: a, pc: 0x1000 });
    }

    #[test]
    fn collector_stops_at_the_first_pending_entry() {
        init_test();
        let key = WarpKey::new(0, 0);
        let mut rd = [0u32; 32];
        rd[0] = 4;
        let mut reference = ScriptedRef::new();
        reference.load_warp(
            key,
            vec![
                ScriptedInsn::vreg(0x1000, VADD_VV, 3, rd, 0x1),
                ScriptedInsn::xreg(0x1004, ADD, 2, 1),
            ],
        );
        let mut gvm = Gvm::new(GvmConfig::default(), reference);

        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        intake.push_insn_dispatch(disp(0, 0, 0x1000, VADD_VV, 0));
        intake.push_insn_dispatch(disp(0, 0, 0x1004, ADD, 1));
        intake.push_xreg_wb(wb(0, 0, 0x1004, ADD, 1, 2, 1));
        let mut window = [0u32; 32];
        window[2] = 1;
        sample_sm(&mut gvm, 0, &window);
        gvm.cycle().unwrap();
        // both retired, but the vector op has no DUT result yet: nothing
        // may be reclaimed past it
        assert_eq!(gvm.stats().insns_retired, 2);
        assert_eq!(gvm.warp(&key).unwrap().insns.len(), 2);

        // the lane writeback drains late, after retire
        gvm.intake_mut()
            .push_vreg_wb_lane(vlane(0, 0, 0x1000, VADD_VV, 0, 3, 0, 4, true));
        sample_sm(&mut gvm, 0, &window);
        gvm.cycle().unwrap();
        assert_eq!(gvm.stats().single_cmp_pass, 1);
        assert!(gvm.warp(&key).unwrap().insns.is_empty());
    }

    #[test]
    fn unknown_reference_result_kind_is_a_soft_verdict() {
        init_test();
        let key = WarpKey::new(0, 0);
        let mut reference = ScriptedRef::new();
        reference.load_warp(
            key,
            vec![
                ScriptedInsn::plain(0x1000, VADD_VV),
                ScriptedInsn::xreg(0x1004, ADD, 2, 1),
            ],
        );
        let mut gvm = Gvm::new(GvmConfig::default(), reference);

        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        intake.push_insn_dispatch(disp(0, 0, 0x1000, VADD_VV, 0));
        intake.push_insn_dispatch(disp(0, 0, 0x1004, ADD, 1));
        intake.push_vreg_wb_lane(vlane(0, 0, 0x1000, VADD_VV, 0, 3, 0, 4, true));
        intake.push_xreg_wb(wb(0, 0, 0x1004, ADD, 1, 2, 1));
        let mut window = [0u32; 32];
        window[2] = 1;
        sample_sm(&mut gvm, 0, &window);
        gvm.cycle().unwrap();

        assert_eq!(gvm.stats().single_cmp_unknown, 1);
        // the undecidable entry is still reclaimable
        assert!(gvm.warp(&key).unwrap().insns.is_empty());
    }

    #[test]
    fn silent_high_lanes_are_enforced_for_narrow_warps() {
        init_test();
        let key = WarpKey::new(0, 0);
        let mut rd = [0u32; 32];
        rd[0] = 1;
        let mut reference = ScriptedRef::new();
        reference.load_warp(
            key,
            vec![
                ScriptedInsn::vreg(0x1000, VADD_VV, 3, rd, 0x1),
                ScriptedInsn::xreg(0x1004, ADD, 2, 1),
            ],
        );
        let mut gvm = Gvm::new(GvmConfig::default(), reference);

        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 4));
        intake.push_insn_dispatch(disp(0, 0, 0x1000, VADD_VV, 0));
        intake.push_insn_dispatch(disp(0, 0, 0x1004, ADD, 1));
        intake.push_vreg_wb_lane(vlane(0, 0, 0x1000, VADD_VV, 0, 3, 0, 1, true));
        // a lane beyond the 4-thread warp claims to have written back
        intake.push_vreg_wb_lane(vlane(0, 0, 0x1000, VADD_VV, 0, 3, 5, 0, true));
        intake.push_xreg_wb(wb(0, 0, 0x1004, ADD, 1, 2, 1));
        let mut window = [0u32; 32];
        window[2] = 1;
        sample_sm(&mut gvm, 0, &window);
        gvm.cycle().unwrap();

        assert_eq!(gvm.stats().single_cmp_fail, 1);
    }

    #[test]
    fn duplicate_warp_identities_are_fatal() {
        init_test();
        let mut gvm = Gvm::new(GvmConfig::default(), ScriptedRef::new());
        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        intake.push_cta2warp(cta(0, 0, 1, 1, 0, 0, 32));
        assert_eq!(
            gvm.cycle().unwrap_err(),
            GvmError::DuplicateWarpKey {
                key: WarpKey::new(0, 0)
            }
        );

        let mut gvm = Gvm::new(GvmConfig::default(), ScriptedRef::new());
        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        intake.push_cta2warp(cta(0, 1, 0, 0, 32, 0, 32));
        assert_eq!(
            gvm.cycle().unwrap_err(),
            GvmError::DuplicateWarpBinding {
                sm_id: 0,
                hw_warp_id: 0
            }
        );
    }

    #[test]
    fn dispatch_id_reuse_and_orphan_endprg_are_fatal() {
        init_test();
        let mut gvm = Gvm::new(GvmConfig::default(), ScriptedRef::new());
        let intake = gvm.intake_mut();
        intake.push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        intake.push_insn_dispatch(disp(0, 0, 0x1000, ADD, 0));
        intake.push_insn_dispatch(disp(0, 0, 0x1004, ADD, 0));
        assert_eq!(
            gvm.cycle().unwrap_err(),
            GvmError::DispatchIdReused {
                key: WarpKey::new(0, 0),
                dispatch_id: 0
            }
        );

        let mut gvm = Gvm::new(GvmConfig::default(), ScriptedRef::new());
        gvm.intake_mut().push_insn_dispatch(disp(0, 3, 0x1000, ENDPRG, 0));
        assert_eq!(
            gvm.cycle().unwrap_err(),
            GvmError::EndprgWithoutWarp {
                sm_id: 0,
                hw_warp_id: 3
            }
        );
    }

    #[test]
    fn completions_on_the_wrong_channel_are_fatal() {
        init_test();
        // a vector op cannot report through the scalar writeback port
        let mut gvm = Gvm::new(GvmConfig::default(), ScriptedRef::new());
        gvm.intake_mut().push_xreg_wb(wb(0, 0, 0x1000, VADD_VV, 0, 2, 1));
        assert!(matches!(
            gvm.cycle().unwrap_err(),
            GvmError::CompletionChannelMismatch {
                channel: "scalar-writeback",
                ..
            }
        ));

        // nor a scalar op through the vector one
        let mut gvm = Gvm::new(GvmConfig::default(), ScriptedRef::new());
        gvm.intake_mut().push_vreg_wb_lane(vlane(0, 0, 0x1000, ADD, 0, 2, 0, 1, true));
        assert!(matches!(
            gvm.cycle().unwrap_err(),
            GvmError::CompletionChannelMismatch {
                channel: "vector-writeback",
                ..
            }
        ));

        // and barrier completions must name a barrier instruction
        let mut gvm = Gvm::new(GvmConfig::default(), ScriptedRef::new());
        gvm.intake_mut().push_barrier_done(BarrierDone {
            sm_id: 0,
            wg_slot_id: 0,
            pc: 0x1000,
            insn: ADD,
            dispatch_id: 0,
        });
        assert!(matches!(
            gvm.cycle().unwrap_err(),
            GvmError::CompletionChannelMismatch {
                channel: "barrier-done",
                ..
            }
        ));
    }

    #[test]
    fn empty_cycles_touch_nothing() {
        init_test();
        let mut gvm = Gvm::new(GvmConfig::default(), ScriptedRef::new());
        gvm.cycle().unwrap();
        gvm.cycle().unwrap();
        assert_eq!(gvm.stats().cycles, 2);
        let reference = gvm.reference();
        assert_eq!(reference.steps_taken, 0);
        assert_eq!(reference.next_pc_calls, 0);
        assert_eq!(reference.set_xreg_calls, 0);
        assert_eq!(reference.get_xreg_calls, 0);
    }

    #[test]
    fn banked_sampling_deinterleaves_the_window() {
        init_test();
        let key = WarpKey::new(0, 0);
        let mut gvm = Gvm::new(GvmConfig::default(), ScriptedRef::new());
        gvm.set_sgpr_usage(8);
        gvm.intake_mut().push_cta2warp(cta(0, 0, 0, 1, 8, 0, 32));
        for bank_id in 0..4u32 {
            for slot in 0..8u32 {
                gvm.intake_mut().push_xreg_sample(XRegSample {
                    sm_id: 0,
                    bank_id,
                    num_banks: 4,
                    num_sgpr_slots: 32,
                    word_idx: slot,
                    word: bank_id * 100 + slot,
                });
            }
        }
        gvm.cycle().unwrap();
        // register i of hw_warp 1 lives in bank (i + 1) % 4, slot (8 + i) / 4;
        // index 0 is forced to zero regardless of what was sampled
        assert_eq!(
            gvm.warp(&key).unwrap().curr_xreg,
            vec![0, 202, 302, 2, 103, 203, 303, 3]
        );
    }

    #[test]
    fn missing_or_misaligned_samples_are_fatal() {
        init_test();
        let mut gvm = Gvm::new(GvmConfig::default(), ScriptedRef::new());
        gvm.intake_mut().push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        assert_eq!(
            gvm.cycle().unwrap_err(),
            GvmError::MissingXRegSample { sm_id: 0 }
        );

        let mut gvm = Gvm::new(GvmConfig::default(), ScriptedRef::new());
        gvm.set_sgpr_usage(6); // not a multiple of the bank count
        gvm.intake_mut().push_cta2warp(cta(0, 0, 0, 0, 0, 0, 32));
        for bank_id in 0..4u32 {
            gvm.intake_mut().push_xreg_sample(XRegSample {
                sm_id: 0,
                bank_id,
                num_banks: 4,
                num_sgpr_slots: 32,
                word_idx: 0,
                word: 0,
            });
        }
        assert!(matches!(
            gvm.cycle().unwrap_err(),
            GvmError::BankMisaligned { num_banks: 4, .. }
        ));
    }
}
