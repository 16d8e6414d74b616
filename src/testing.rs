//! Test support: logging/bootstrap plus a deterministic reference oracle.

use std::collections::{BTreeMap, BTreeSet};

use crate::reference::{RefResult, RefStepInfo, ReferenceModel};
use crate::warp::{WarpKey, MAX_THREADS};

static INIT: std::sync::Once = std::sync::Once::new();

pub fn init_test() {
    INIT.call_once(|| {
        env_logger::builder().is_test(true).init();
        color_eyre::install().unwrap();
    });
}

/// One instruction of a scripted warp program.
#[derive(Debug, Clone)]
pub struct ScriptedInsn {
    pub pc: u32,
    pub insn: u32,
    pub result: RefResult,
    /// Barrier group this instruction rendezvouses on, if any.
    pub barrier: Option<u32>,
}

impl ScriptedInsn {
    pub fn plain(pc: u32, insn: u32) -> Self {
        Self {
            pc,
            insn,
            result: RefResult::DontCare,
            barrier: None,
        }
    }

    pub fn xreg(pc: u32, insn: u32, reg_idx: u32, rd: u32) -> Self {
        Self {
            pc,
            insn,
            result: RefResult::XReg { reg_idx, rd },
            barrier: None,
        }
    }

    pub fn vreg(pc: u32, insn: u32, reg_idx: u32, rd: [u32; MAX_THREADS], mask: u32) -> Self {
        Self {
            pc,
            insn,
            result: RefResult::VReg { reg_idx, rd, mask },
            barrier: None,
        }
    }

    pub fn barrier(pc: u32, insn: u32, group: u32) -> Self {
        Self {
            pc,
            insn,
            result: RefResult::DontCare,
            barrier: Some(group),
        }
    }
}

#[derive(Debug, Default)]
struct ScriptedWarp {
    program: Vec<ScriptedInsn>,
    pos: usize,
    xreg: Vec<u32>,
}

#[derive(Debug, Default)]
struct BarrierGroup {
    participants: BTreeSet<WarpKey>,
    arrived: BTreeSet<WarpKey>,
    passed: BTreeSet<WarpKey>,
}

/// Deterministic [`ReferenceModel`] driven by per-warp scripts.
///
/// Barrier semantics mirror the real reference: a step that registers a
/// warp's arrival at a barrier never advances its PC, even when that
/// arrival completes the quorum; only a step taken after the quorum is
/// complete moves the warp past the barrier.
#[derive(Debug, Default)]
pub struct ScriptedRef {
    warps: BTreeMap<WarpKey, ScriptedWarp>,
    barriers: BTreeMap<u32, BarrierGroup>,
    pub steps_taken: u64,
    pub next_pc_calls: u64,
    pub set_xreg_calls: u64,
    pub get_xreg_calls: u64,
}

/// PC reported once a scripted program has run out.
pub const END_OF_SCRIPT_PC: u32 = 0xffff_ffff;

/// Scalar register file size of the oracle, matching the real reference.
const XREG_FILE_SIZE: usize = 256;

impl ScriptedRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_warp(&mut self, key: WarpKey, program: Vec<ScriptedInsn>) {
        for insn in &program {
            if let Some(group) = insn.barrier {
                self.barriers.entry(group).or_default().participants.insert(key);
            }
        }
        self.warps.insert(
            key,
            ScriptedWarp {
                program,
                pos: 0,
                xreg: vec![0; XREG_FILE_SIZE],
            },
        );
    }

    /// Plant a register value directly, bypassing execution. Handy for
    /// provoking retire-compare divergence.
    pub fn poke_xreg(&mut self, key: WarpKey, idx: usize, value: u32) {
        self.warps.get_mut(&key).expect("scripted warp").xreg[idx] = value;
    }

    pub fn xreg_word(&self, key: WarpKey, idx: usize) -> u32 {
        self.warps[&key].xreg[idx]
    }

    fn warp_mut(&mut self, key: WarpKey) -> &mut ScriptedWarp {
        self.warps.entry(key).or_insert_with(|| ScriptedWarp {
            program: Vec::new(),
            pos: 0,
            xreg: vec![0; XREG_FILE_SIZE],
        })
    }
}

impl ReferenceModel for ScriptedRef {
    fn set_warp_xreg(&mut self, key: WarpKey, values: &[u32]) {
        self.set_xreg_calls += 1;
        let warp = self.warp_mut(key);
        warp.xreg[..values.len()].copy_from_slice(values);
    }

    fn next_pc(&mut self, key: WarpKey) -> u32 {
        self.next_pc_calls += 1;
        let warp = &self.warps[&key];
        warp.program
            .get(warp.pos)
            .map(|i| i.pc)
            .unwrap_or(END_OF_SCRIPT_PC)
    }

    fn step(&mut self, key: WarpKey) -> RefStepInfo {
        self.steps_taken += 1;
        let warp = &self.warps[&key];
        let Some(cur) = warp.program.get(warp.pos).cloned() else {
            return RefStepInfo {
                pc: END_OF_SCRIPT_PC,
                insn: 0,
                result: RefResult::DontCare,
            };
        };

        if let Some(group_id) = cur.barrier {
            let group = self.barriers.get_mut(&group_id).expect("barrier group");
            if !group.arrived.contains(&key) {
                // arrival registration is always a no-op step
                group.arrived.insert(key);
                return RefStepInfo {
                    pc: cur.pc,
                    insn: cur.insn,
                    result: RefResult::DontCare,
                };
            }
            if group.arrived != group.participants {
                // parked: siblings still on their way
                return RefStepInfo {
                    pc: cur.pc,
                    insn: cur.insn,
                    result: RefResult::DontCare,
                };
            }
            group.passed.insert(key);
            if group.passed == group.participants {
                group.arrived.clear();
                group.passed.clear();
            }
        }

        if let RefResult::XReg { reg_idx, rd } = &cur.result {
            if *reg_idx != 0 {
                self.warp_mut(key).xreg[*reg_idx as usize] = *rd;
            }
        }
        self.warp_mut(key).pos += 1;
        RefStepInfo {
            pc: cur.pc,
            insn: cur.insn,
            result: cur.result,
        }
    }

    fn get_xreg(&mut self, key: WarpKey) -> Vec<u32> {
        self.get_xreg_calls += 1;
        self.warps[&key].xreg.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn seed_then_read_back_round_trips() {
        let mut r = ScriptedRef::new();
        let key = WarpKey::new(0, 0);
        r.load_warp(key, vec![]);
        let seed: Vec<u32> = (0..32).map(|i| i * 3).collect();
        r.set_warp_xreg(key, &seed);
        let readback = r.get_xreg(key);
        assert_eq!(&readback[..32], &seed[..]);
        assert_eq!(readback.len(), 256);
    }

    #[test]
    fn barrier_parks_until_quorum_then_releases() {
        let mut r = ScriptedRef::new();
        let a = WarpKey::new(0, 0);
        let b = WarpKey::new(0, 1);
        r.load_warp(a, vec![ScriptedInsn::barrier(0x100, 0x0400_400b, 0)]);
        r.load_warp(b, vec![ScriptedInsn::barrier(0x100, 0x0400_400b, 0)]);

        // arrivals: no-ops for both, including the quorum-completing one
        r.step(a);
        assert_eq!(r.next_pc(a), 0x100);
        r.step(b);
        assert_eq!(r.next_pc(b), 0x100);

        // quorum complete: the next step of each warp crosses the barrier
        r.step(a);
        assert_eq!(r.next_pc(a), END_OF_SCRIPT_PC);
        r.step(b);
        assert_eq!(r.next_pc(b), END_OF_SCRIPT_PC);
    }

    #[test]
    fn xreg_results_update_the_file_but_never_x0() {
        let mut r = ScriptedRef::new();
        let key = WarpKey::new(1, 0);
        r.load_warp(
            key,
            vec![
                ScriptedInsn::xreg(0x0, 0x13, 5, 42),
                ScriptedInsn::xreg(0x4, 0x13, 0, 99),
            ],
        );
        r.step(key);
        r.step(key);
        assert_eq!(r.xreg_word(key, 5), 42);
        assert_eq!(r.xreg_word(key, 0), 0);
    }
}
