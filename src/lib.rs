//! Online verification engine for a GPGPU RTL co-simulation.
//!
//! The simulated design exposes streaming multiprocessors executing warps
//! of up to 32 threads over a RISC-V-derived scalar+vector ISA. Each clock,
//! the RTL shim pushes observation events (warp dispatch, instruction
//! dispatch, writebacks, barrier completions, register-file samples) into
//! the engine's [`EventIntake`]; the engine reconstructs architectural
//! state from those out-of-order pipelined observations, retires eligible
//! instruction prefixes against a golden [`ReferenceModel`], and reports
//! the first semantic divergence between the two.
//!
//! The engine is single-threaded and cooperative: one call to
//! [`Gvm::cycle`] per clock edge, no suspension points, no locking.

pub mod config;
pub mod error;
pub mod events;
pub mod gvm;
pub mod insn;
pub mod reference;
pub mod stats;
pub mod testing;
pub mod warp;

pub use config::GvmConfig;
pub use error::GvmError;
pub use events::EventIntake;
pub use gvm::{Gvm, RetireItem};
pub use insn::{Classifier, InsnPattern};
pub use reference::{RefResult, RefStepInfo, ReferenceModel};
pub use stats::GvmStats;
pub use warp::{CmpVerdict, InsnResult, LaneMask, WarpKey, MAX_THREADS};
