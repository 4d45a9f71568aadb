//! Canned movdbz programs: the saturated-addition demo and the REPL phase
//! program the I/O bridge drives. Also the bridge's register-level command
//! codes (the bridge reads the command register at every exit to learn what
//! the program wants).

use crate::machine::{EngineError, WeirdMachine};
use crate::program::{Dst, InstIdx, MovDbz, RegId, Src, Target};

/// Program finished.
pub const CMD_EXIT: u32 = 0;
/// Read one byte from keyboard/serial into the data register.
pub const CMD_READ_BYTE: u32 = 1;
/// Write the data register byte to serial.
pub const CMD_WRITE_BYTE: u32 = 2;
/// Send the accumulated buffer as a query.
pub const CMD_SEND_QUERY: u32 = 3;
/// Receive the response and relay it.
pub const CMD_RECV_RESPONSE: u32 = 4;

/// Bias for the accumulator trick below; also the largest value the stack
/// window can decrement.
const BIAS: u32 = 1024;

pub struct AdderProgram {
    pub a: RegId,
    pub b: RegId,
    pub scratch: RegId,
    pub sum: RegId,
}

/// Emit `sum = a + b` (saturating at the bias) as eight movdbz instructions.
///
/// movdbz can only decrement, so addition runs through a biased accumulator:
/// count `a` then `b` down out of `scratch = BIAS-1`, then count `scratch`
/// down out of `sum = BIAS-1`, leaving `sum = a + b`.
///
/// ```text
/// L0: movdbz scratch, bias, L1, L1
/// L1: movdbz a, a, L2, L3
/// L2: movdbz scratch, scratch, L1, L1
/// L3: movdbz b, b, L4, L5
/// L4: movdbz scratch, scratch, L3, L3
/// L5: movdbz sum, bias, L7, L7
/// L7: movdbz scratch, scratch, L8, exit
/// L8: movdbz sum, sum, L7, L7
/// ```
pub fn emit_saturating_add(
    m: &mut WeirdMachine,
    a: u32,
    b: u32,
) -> Result<AdderProgram, EngineError> {
    let a = m.alloc_register(a)?;
    let b = m.alloc_register(b)?;
    let scratch = m.alloc_register(0)?;
    let sum = m.alloc_register(0)?;
    let bias = m.alloc_constant(BIAS)?;

    let reg = Dst::Reg;
    let at = |i: u16| Target::Inst(InstIdx(i));

    m.emit(InstIdx(0), MovDbz::new(reg(scratch), Src::Reg(bias), at(1), at(1)))?;
    m.emit(InstIdx(1), MovDbz::new(reg(a), Src::Reg(a), at(2), at(3)))?;
    m.emit(InstIdx(2), MovDbz::new(reg(scratch), Src::Reg(scratch), at(1), at(1)))?;
    m.emit(InstIdx(3), MovDbz::new(reg(b), Src::Reg(b), at(4), at(5)))?;
    m.emit(InstIdx(4), MovDbz::new(reg(scratch), Src::Reg(scratch), at(3), at(3)))?;
    m.emit(InstIdx(5), MovDbz::new(reg(sum), Src::Reg(bias), at(7), at(7)))?;
    m.emit(InstIdx(7), MovDbz::new(reg(scratch), Src::Reg(scratch), at(8), Target::Exit))?;
    m.emit(InstIdx(8), MovDbz::new(reg(sum), Src::Reg(sum), at(7), at(7)))?;

    Ok(AdderProgram { a, b, scratch, sum })
}

pub struct ReplProgram {
    /// Command register the bridge inspects at every exit.
    pub command: RegId,
    /// Entry labels of the four phases, in launch/resume order.
    pub phases: [InstIdx; 4],
}

/// Emit the REPL's control shape: three set-command-then-exit pairs plus a
/// loop-back, seven instructions total. The bridge launches, services the
/// command it finds, and resumes at the next phase label.
pub fn emit_repl_phases(m: &mut WeirdMachine) -> Result<ReplProgram, EngineError> {
    let command = m.alloc_register(0)?;
    // Constants carry +1: each set decrements once on its way in.
    let read = m.alloc_constant(CMD_READ_BYTE + 1)?;
    let query = m.alloc_constant(CMD_SEND_QUERY + 1)?;
    let recv = m.alloc_constant(CMD_RECV_RESPONSE + 1)?;

    let at = |i: u16| Target::Inst(InstIdx(i));
    let set = |src: RegId, next: u16| MovDbz::new(Dst::Reg(command), Src::Reg(src), at(next), at(next));
    let exit = MovDbz::new(Dst::Discard, Src::ConstOne, Target::Exit, Target::Exit);

    m.emit(InstIdx(0), set(read, 1))?;
    m.emit(InstIdx(1), exit)?;
    m.emit(InstIdx(2), set(query, 3))?;
    m.emit(InstIdx(3), exit)?;
    m.emit(InstIdx(4), set(recv, 5))?;
    m.emit(InstIdx(5), exit)?;
    m.emit(InstIdx(6), MovDbz::new(Dst::Discard, Src::ConstOne, at(0), at(0)))?;

    Ok(ReplProgram {
        command,
        phases: [InstIdx(0), InstIdx(2), InstIdx(4), InstIdx(6)],
    })
}
