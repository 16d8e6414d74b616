//! Interface to the golden reference model.
//!
//! The reference executes one warp at a time, one instruction per step, and
//! implements workgroup barriers as a synchronous quorum: stepping a warp
//! parked on a barrier is a no-op until every participating warp has been
//! stepped to it.

use crate::warp::{WarpKey, MAX_THREADS};

/// Writeback payload reported by one reference step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefResult {
    /// The instruction wrote neither register file (or the reference does
    /// not report it).
    DontCare,
    XReg {
        reg_idx: u32,
        rd: u32,
    },
    VReg {
        reg_idx: u32,
        rd: [u32; MAX_THREADS],
        /// Packed per-lane writeback mask, lane 0 at bit 0.
        mask: u32,
    },
}

/// What one reference step executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefStepInfo {
    /// PC of the executed instruction.
    pub pc: u32,
    pub insn: u32,
    pub result: RefResult,
}

/// The engine's view of the reference model. Owned exclusively by the
/// engine and driven serially (one step at a time, no reentrancy).
pub trait ReferenceModel {
    /// Overwrite the first `values.len()` scalar registers of a warp.
    ///
    /// Used once per warp at creation: the reference zero-initialises its
    /// register files while the hardware allocates windows with residual
    /// data, so the DUT's sampled window is pushed in to align them.
    fn set_warp_xreg(&mut self, key: WarpKey, values: &[u32]);

    /// PC of the next instruction the warp will execute.
    fn next_pc(&mut self, key: WarpKey) -> u32;

    /// Execute one instruction on the warp. May be a no-op at a barrier;
    /// callers detect that through [`ReferenceModel::next_pc`].
    fn step(&mut self, key: WarpKey) -> RefStepInfo;

    /// The warp's full scalar register file.
    fn get_xreg(&mut self, key: WarpKey) -> Vec<u32>;
}
