//! Instruction classification.
//!
//! Everything the engine knows about the ISA lives in four mask/value
//! pattern tables: which instructions drive retire, which carry a vector
//! writeback worth comparing instruction-by-instruction, which of those are
//! fp32 (compared with a tolerance), and which synchronise a workgroup.
//! The union of the tables doubles as the disassembly table for log lines.

use itertools::Itertools;
use once_cell::sync::Lazy;

use crate::error::GvmError;

/// One row of a classifier table: an instruction `i` matches iff
/// `(i & mask) == value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnPattern {
    pub mask: u32,
    pub value: u32,
    pub name: &'static str,
}

const fn pat(mask: u32, value: u32, name: &'static str) -> InsnPattern {
    InsnPattern { mask, value, name }
}

/// Scalar writeback instructions: their completion drives retire.
pub const XREG_INSNS: &[InsnPattern] = &[
    pat(0x0000_007f, 0x0000_0037, "lui"),
    pat(0x0000_007f, 0x0000_0017, "auipc"),
    pat(0x0000_007f, 0x0000_006f, "jal"),
    pat(0x0000_707f, 0x0000_0067, "jalr"),
    pat(0x0000_707f, 0x0000_0013, "addi"),
    pat(0x0000_707f, 0x0000_2013, "slti"),
    pat(0x0000_707f, 0x0000_3013, "sltiu"),
    pat(0x0000_707f, 0x0000_4013, "xori"),
    pat(0xfe00_707f, 0x0000_1013, "slli"),
    pat(0xfe00_707f, 0x0000_5013, "srli"),
    pat(0xfe00_707f, 0x4000_5013, "srai"),
    pat(0xfe00_707f, 0x0000_0033, "add"),
    pat(0xfe00_707f, 0x4000_0033, "sub"),
    pat(0xfe00_707f, 0x0000_1033, "sll"),
    pat(0xfe00_707f, 0x0000_2033, "slt"),
    pat(0xfe00_707f, 0x0000_3033, "sltu"),
    pat(0xfe00_707f, 0x0000_4033, "xor"),
    pat(0xfe00_707f, 0x0000_5033, "srl"),
    pat(0xfe00_707f, 0x4000_5033, "sra"),
    pat(0xfe00_707f, 0x0000_6033, "or"),
    pat(0xfe00_707f, 0x0000_7033, "and"),
    pat(0xfe00_707f, 0x0200_0033, "mul"),
    pat(0x8000_707f, 0x0000_7057, "vsetvli"),
    pat(0x0000_707f, 0x0000_2073, "csrrs"),
    pat(0x0000_707f, 0x0000_6073, "csrrsi"),
    pat(0x0000_707f, 0x0000_1073, "csrrw"),
    pat(0x0000_707f, 0x0000_5073, "csrrwi"),
    pat(0x0000_707f, 0x0000_3073, "csrrc"),
    pat(0x0000_707f, 0x0000_7073, "csrrci"),
    pat(0x0000_707f, 0x0000_2003, "lw"),
    pat(0x0000_707f, 0x0000_305b, "setrpc"),
];

/// Vector writeback instructions: excluded from retire, compared
/// instruction-by-instruction once both sides reported a result.
pub const VREG_INSNS: &[InsnPattern] = &[
    pat(0xfff0_707f, 0x5e00_4057, "vmv.v.x"),
    pat(0xfc00_707f, 0x0000_4057, "vadd.vx"),
    pat(0xfc00_707f, 0x0800_1057, "vfsub.vv"),
    pat(0xfc00_707f, 0x9000_1057, "vfmul.vv"),
    pat(0x8000_707f, 0x0000_202b, "vlw.v"),
    pat(0xfc0f_f07f, 0x4c00_1057, "vfsqrt.v"),
    pat(0xfc00_707f, 0xa000_1057, "vfmadd.vv"),
    pat(0xfc00_707f, 0x8800_6057, "vremu.vx"),
    pat(0xfc00_707f, 0x9400_3057, "vsll.vi"),
    pat(0xfdff_f07f, 0x5008_a057, "vid.v"),
    pat(0x0000_707f, 0x0000_207b, "vlw12.v"),
    pat(0xfc00_707f, 0x1800_1057, "vfmax.vv"),
    pat(0x0000_707f, 0x0000_100b, "vsub12.vi"),
    pat(0xfc00_707f, 0x9400_6057, "vmul.vx"),
    pat(0xfc00_707f, 0x0000_3057, "vadd.vi"),
    pat(0xfc00_707f, 0x0000_1057, "vfadd.vv"),
    pat(0xfc00_707f, 0x0000_0057, "vadd.vv"),
    pat(0x0000_707f, 0x0000_407b, "vlbu12.v"),
    pat(0xfc00_707f, 0xa400_6057, "vmadd.vx"),
    pat(0xfc00_707f, 0x2400_0057, "vand.vv"),
    pat(0xfc00_707f, 0x8000_6057, "vdivu.vx"),
    pat(0xfc00_707f, 0x6c00_4057, "vmslt.vx"),
    pat(0xfc00_707f, 0x6c00_1057, "vmflt.vv"),
    pat(0xfc00_707f, 0x2c00_3057, "vxor.vi"),
    pat(0xfc00_707f, 0x0800_0057, "vsub.vv"),
    pat(0xfc00_707f, 0x6800_4057, "vmsltu.vx"),
    pat(0xfc00_707f, 0xa400_2057, "vmadd.vv"),
    pat(0xfc00_707f, 0xa400_3057, "vsra.vi"),
    pat(0xfc00_707f, 0x7400_3057, "vmsle.vi"),
    pat(0xfc00_707f, 0x0800_4057, "vsub.vx"),
];

/// Workgroup synchronisation instructions. All of them also drive retire.
pub const BARRIER_INSNS: &[InsnPattern] = &[
    pat(0xfe00_707f, 0x0400_400b, "barrier"),
    pat(0xfe00_707f, 0x0600_400b, "barriersub"),
    pat(0xfe00_707f, 0x0000_400b, "endprg"),
];

/// Vector ops whose lanes hold fp32 values; compared with a tolerance.
pub const FP32_VREG_INSNS: &[InsnPattern] = &[
    pat(0xfc00_707f, 0x0800_1057, "vfsub.vv"),
    pat(0xfc00_707f, 0x9000_1057, "vfmul.vv"),
    pat(0xfc0f_f07f, 0x4c00_1057, "vfsqrt.v"),
    pat(0xfc00_707f, 0xa000_1057, "vfmadd.vv"),
    pat(0xfc00_707f, 0x1800_1057, "vfmax.vv"),
    pat(0xfc00_707f, 0x0000_1057, "vfadd.vv"),
];

fn any_match(tables: &[InsnPattern], insn: u32) -> bool {
    tables.iter().any(|p| insn & p.mask == p.value)
}

static DEFAULT_CLASSIFIER: Lazy<Classifier> = Lazy::new(|| {
    Classifier::from_tables(
        XREG_INSNS
            .iter()
            .chain(BARRIER_INSNS)
            .copied()
            .collect(),
        VREG_INSNS.to_vec(),
        FP32_VREG_INSNS.to_vec(),
        BARRIER_INSNS.to_vec(),
    )
    .expect("built-in classifier tables are coherent")
});

/// Pattern-table driven instruction classifier.
#[derive(Debug, Clone)]
pub struct Classifier {
    retire_care: Vec<InsnPattern>,
    single_cmp_care: Vec<InsnPattern>,
    fp32_vreg: Vec<InsnPattern>,
    barrier: Vec<InsnPattern>,
    /// Union of the four tables, used for log-line disassembly.
    disasm: Vec<InsnPattern>,
}

impl Default for Classifier {
    fn default() -> Self {
        DEFAULT_CLASSIFIER.clone()
    }
}

impl Classifier {
    /// Build a classifier from caller-supplied tables, checking coherence:
    /// every barrier pattern must also drive retire, and the retire and
    /// single-compare sets must not overlap (scalar writebacks drive retire,
    /// vector writebacks drive single-instruction compare).
    pub fn from_tables(
        retire_care: Vec<InsnPattern>,
        single_cmp_care: Vec<InsnPattern>,
        fp32_vreg: Vec<InsnPattern>,
        barrier: Vec<InsnPattern>,
    ) -> Result<Self, GvmError> {
        for p in &barrier {
            if !any_match(&retire_care, p.value) {
                return Err(GvmError::ClassifierTableConflict {
                    name: p.name,
                    why: "barrier instruction missing from the retire set",
                });
            }
            if any_match(&single_cmp_care, p.value) {
                return Err(GvmError::ClassifierTableConflict {
                    name: p.name,
                    why: "barrier instruction present in the single-compare set",
                });
            }
        }
        for p in &single_cmp_care {
            if any_match(&retire_care, p.value) {
                return Err(GvmError::ClassifierTableConflict {
                    name: p.name,
                    why: "instruction present in both the retire and single-compare sets",
                });
            }
        }
        for p in &fp32_vreg {
            if !any_match(&single_cmp_care, p.value) {
                return Err(GvmError::ClassifierTableConflict {
                    name: p.name,
                    why: "fp32 instruction missing from the single-compare set",
                });
            }
        }
        let disasm = retire_care
            .iter()
            .chain(&single_cmp_care)
            .chain(&fp32_vreg)
            .chain(&barrier)
            .copied()
            .collect();
        Ok(Self {
            retire_care,
            single_cmp_care,
            fp32_vreg,
            barrier,
            disasm,
        })
    }

    pub fn is_retire_care(&self, insn: u32) -> bool {
        any_match(&self.retire_care, insn)
    }

    pub fn is_single_cmp_care(&self, insn: u32) -> bool {
        any_match(&self.single_cmp_care, insn)
    }

    pub fn is_fp32_vreg(&self, insn: u32) -> bool {
        any_match(&self.fp32_vreg, insn)
    }

    pub fn is_barrier(&self, insn: u32) -> bool {
        any_match(&self.barrier, insn)
    }

    /// Mnemonic for a raw instruction word, or `None` for words outside the
    /// tables. Several patterns may match one word only if they agree on the
    /// mnemonic; disagreement means the tables are broken and is fatal.
    pub fn disasm(&self, insn: u32) -> Result<Option<&'static str>, GvmError> {
        let mut matched: Vec<&'static str> = self
            .disasm
            .iter()
            .filter(|p| insn & p.mask == p.value)
            .map(|p| p.name)
            .collect();
        matched.dedup();
        match matched.as_slice() {
            [] => Ok(None),
            [name] => Ok(Some(*name)),
            names => {
                if names.iter().all_equal() {
                    Ok(Some(names[0]))
                } else {
                    Err(GvmError::AmbiguousDisasm {
                        insn,
                        names: names.iter().join(" "),
                    })
                }
            }
        }
    }
}
