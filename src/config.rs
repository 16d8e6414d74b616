use serde::{Deserialize, Serialize};

/// Raw instruction word that terminates a warp's program.
pub const ENDPRG_OPCODE: u32 = 0x0000_400b;

/// Engine configuration.
///
/// The embedding driver owns config loading; every field has a working
/// default for the RTL generation this engine was written against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GvmConfig {
    /// Absolute tolerance for fp32 vector-lane comparison.
    pub fp32_atol: f32,
    /// Relative tolerance for fp32 vector-lane comparison.
    pub fp32_rtol: f32,
    /// Scalar register file size of the reference model, per warp.
    pub xreg_file_size: usize,
    /// Upper bound on threads per warp.
    pub num_threads_max: usize,
    /// Instruction word whose dispatch tears the issuing warp down.
    pub endprg_opcode: u32,
}

impl Default for GvmConfig {
    fn default() -> Self {
        Self {
            fp32_atol: 1e-3,
            fp32_rtol: 1e-3,
            xreg_file_size: 256,
            num_threads_max: 32,
            endprg_opcode: ENDPRG_OPCODE,
        }
    }
}
