use std::collections::BTreeMap;
use std::fmt;

use bitvec::{array::BitArray, BitArr};

/// Hardware warp width. Vector payloads are always carried at this width;
/// `WarpRecord::num_threads` says how many low lanes are meaningful.
pub const MAX_THREADS: usize = 32;

/// Per-lane mask over one warp's threads, lane 0 at the least significant bit.
pub type LaneMask = BitArr!(for MAX_THREADS, in u32);

/// Expand a packed mask word into a [`LaneMask`] over the low `lanes` bits.
pub fn unpack_lane_mask(packed: u32, lanes: usize) -> LaneMask {
    let mut mask: LaneMask = BitArray::ZERO;
    for i in 0..lanes.min(MAX_THREADS) {
        mask.set(i, packed & (1 << i) != 0);
    }
    mask
}

/// Render the low `lanes` bits of a mask as a `01`-string, lane 0 first.
pub fn lane_mask_string(mask: &LaneMask, lanes: usize) -> String {
    (0..lanes.min(MAX_THREADS))
        .map(|i| if mask[i] { '1' } else { '0' })
        .collect()
}

/// Software identity of a warp: stable across its lifetime, unlike the
/// hardware binding which the dispatcher reuses across CTA lifecycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WarpKey {
    pub wg_id: u32,
    pub warp_id: u32,
}

impl WarpKey {
    pub fn new(wg_id: u32, warp_id: u32) -> Self {
        Self { wg_id, warp_id }
    }
}

impl fmt::Display for WarpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(wg {}, warp {})", self.wg_id, self.warp_id)
    }
}

/// Writeback payload of one instruction, as observed on either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsnResult {
    /// Nothing captured (yet, or the instruction kind is unknown).
    None,
    XReg {
        reg_idx: u32,
        rd: u32,
    },
    VReg {
        reg_idx: u32,
        rd: [u32; MAX_THREADS],
        mask: LaneMask,
    },
}

/// Outcome of a single-instruction comparison.
///
/// The numeric representation is part of the engine's reporting contract:
/// 0 = not compared yet, 1 = pass, -1 = fail, -2 = unknown instruction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(i8)]
pub enum CmpVerdict {
    Pending = 0,
    Pass = 1,
    Fail = -1,
    UnknownInsn = -2,
}

/// Single-instruction comparison state of one in-flight entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleCmp {
    /// Whether this instruction participates in single-instruction compare.
    pub care: bool,
    pub dut_done: bool,
    pub ref_done: bool,
    /// Valid once `dut_done` holds.
    pub dut_result: InsnResult,
    /// Valid once `ref_done` holds.
    pub ref_result: InsnResult,
    pub verdict: CmpVerdict,
}

impl SingleCmp {
    /// Entries outside the compare set are born with a pass verdict so the
    /// collector can reclaim them on retire.
    pub fn new(care: bool) -> Self {
        Self {
            care,
            dut_done: false,
            ref_done: false,
            dut_result: InsnResult::None,
            ref_result: InsnResult::None,
            verdict: if care {
                CmpVerdict::Pending
            } else {
                CmpVerdict::Pass
            },
        }
    }
}

/// One dispatched instruction tracked until it is retired and compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsnEntry {
    pub pc: u32,
    pub insn: u32,
    /// Monotonic per hardware-warp binding; never reset when the SM trades
    /// an old warp for a new one.
    pub dispatch_id: u32,
    /// A regext prefix preceded this instruction: REF sees two steps where
    /// the DUT exposes one dispatch.
    pub extended: bool,
    /// Whether completion of this instruction drives retire.
    pub retire_care: bool,
    /// Retire-relevant completion observed from the DUT.
    pub done: bool,
    /// REF has consumed this instruction.
    pub retired: bool,
    pub cmp: SingleCmp,
}

impl InsnEntry {
    /// Retired and carrying a verdict: safe for the collector to drop.
    pub fn reclaimable(&self) -> bool {
        self.retired && self.cmp.verdict != CmpVerdict::Pending
    }
}

/// Mutable record of one live warp.
#[derive(Debug, Clone)]
pub struct WarpRecord {
    pub key: WarpKey,
    pub sm_id: u32,
    pub hardware_warp_id: u32,
    /// Slot in the warp scheduler's workgroup table; barrier completions are
    /// reported against this, not against the hardware warp id.
    pub wg_slot_id: u32,
    pub num_threads: usize,
    /// First scalar register of this warp's window in the banked file.
    pub xreg_base: u32,
    /// Scalar registers the kernel uses per warp.
    pub xreg_usage: u32,
    /// Scalar register shadow sampled from the DUT this cycle; index 0 is
    /// forced to zero.
    pub curr_xreg: Vec<u32>,
    /// In-flight instructions, ordered by dispatch id.
    pub insns: BTreeMap<u32, InsnEntry>,
    /// Dispatch id of the first instruction ever seen on this warp.
    pub base_dispatch_id: Option<u32>,
    /// Smallest dispatch id not yet retired.
    pub next_retire_dispatch_id: u32,
}
