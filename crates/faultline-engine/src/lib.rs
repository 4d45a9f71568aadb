#![forbid(unsafe_code)]

//! A page-fault weird machine: instruction-less computation on 32-bit x86.
//!
//! The engine compiles `movdbz` programs into page directories, page tables,
//! TSS pages, and IDT task gates such that the CPU's own fault handling
//! executes them: entering an instruction's TSS faults on an unmapped EIP,
//! the fault's task gate switches to the successor, the hardware error-code
//! push decrements the value riding in ESP, and the TSS save/load halves move
//! it between register pages. No guest instruction is ever fetched.
//!
//! [`WeirdMachine`] is the driver: allocate registers and constants, emit
//! instructions, finalise, then launch — and resume after each exit.

pub mod cascade;
pub mod layout;
pub mod machine;
pub mod program;
pub mod programs;
mod regs;
mod synth;

pub use cascade::CascadeFault;
pub use machine::{CascadeConfig, EngineError, MachineState, RunReport, WeirdMachine};
pub use program::{Dst, InstIdx, MovDbz, RegId, Src, Target, MAX_ASM_INSTS, MAX_REGISTERS};
pub use regs::{MAX_DECREMENT_VALUE, MAX_REG_VALUE};
