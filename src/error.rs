use crate::warp::WarpKey;

/// Fatal invariant violations.
///
/// Anything that indicates the observation stream, the classifier tables or
/// the reference model can no longer be trusted surfaces as an `Err` from
/// [`crate::Gvm::ingest`] or [`crate::Gvm::step`]. Recoverable anomalies
/// (stray completions for torn-down warps, unknown reference result kinds)
/// are logged and never reach this enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GvmError {
    #[error("warp {key} dispatched twice")]
    DuplicateWarpKey { key: WarpKey },

    #[error("sm {sm_id} hw_warp {hw_warp_id} already bound to a live warp")]
    DuplicateWarpBinding { sm_id: u32, hw_warp_id: u32 },

    #[error("endprg dispatched on sm {sm_id} hw_warp {hw_warp_id} but nothing is bound there")]
    EndprgWithoutWarp { sm_id: u32, hw_warp_id: u32 },

    #[error("warp {key} dispatched with {num_threads} threads")]
    BadThreadCount { key: WarpKey, num_threads: usize },

    #[error("dispatch_id {dispatch_id} reused on warp {key}")]
    DispatchIdReused { key: WarpKey, dispatch_id: u32 },

    #[error("{channel} completion for pc {pc:#010x} insn {insn:#010x} violates its instruction class")]
    CompletionChannelMismatch {
        channel: &'static str,
        pc: u32,
        insn: u32,
    },

    #[error(
        "completion for dispatch_id {dispatch_id} on warp {key} disagrees with the \
         dispatched pc/insn ({pc:#010x}/{insn:#010x})"
    )]
    DispatchRecordMismatch {
        key: WarpKey,
        dispatch_id: u32,
        pc: u32,
        insn: u32,
    },

    #[error("completion observed past a completed barrier on warp {key} (dispatch_id {dispatch_id})")]
    CompletionPastBarrier { key: WarpKey, dispatch_id: u32 },

    #[error("classifier tables conflict on {name}: {why}")]
    ClassifierTableConflict { name: &'static str, why: &'static str },

    #[error("multiple distinct disasm matches for insn {insn:#010x}: {names}")]
    AmbiguousDisasm { insn: u32, names: String },

    #[error("DUT/REF next-pc mismatch on warp {key}: dut {dut_pc:#010x}, ref {ref_pc:#010x}")]
    PcMismatch {
        key: WarpKey,
        dut_pc: u32,
        ref_pc: u32,
    },

    #[error("REF did not advance over the barrier at pc {pc:#010x} on warp {key}")]
    BarrierDeadlock { key: WarpKey, pc: u32 },

    #[error("no scalar register-file sample covers sm {sm_id} this cycle")]
    MissingXRegSample { sm_id: u32 },

    #[error(
        "scalar register window of warp {key} misaligned: base {xreg_base}, \
         usage {xreg_usage}, {num_banks} banks"
    )]
    BankMisaligned {
        key: WarpKey,
        xreg_base: u32,
        xreg_usage: u32,
        num_banks: u32,
    },

    #[error("warp {key} vanished before its registers were seeded into REF")]
    SeedWarpMissing { key: WarpKey },
}
