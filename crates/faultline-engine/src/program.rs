//! The abstract one-instruction ISA: `movdbz dst, src, nz, z` decrements the
//! value in `src`, stores the result in `dst`, and branches on whether the
//! source was zero before the decrement. `movdbz` alone is Turing-complete;
//! everything else in this crate exists to run it on the MMU.

/// Maximum number of register pages, user registers and constants combined.
pub const MAX_REGISTERS: usize = 64;

/// Maximum number of abstract instruction slots.
pub const MAX_ASM_INSTS: usize = 256;

/// Handle for an allocated register or constant page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegId(pub u16);

/// Abstract instruction slot, `0..MAX_ASM_INSTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstIdx(pub u16);

/// One of the three hardware task switches an abstract instruction compiles
/// into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RealIdx(pub u16);

impl InstIdx {
    /// First real sub-instruction of this slot; where a cascade entering the
    /// slot through its non-zero edge (or launch/resume) lands.
    pub fn entry(self) -> RealIdx {
        RealIdx(self.0 * 3)
    }
}

impl RealIdx {
    /// Rotation slot, and thereby GDT selector, of this real instruction.
    pub fn rotation(self) -> usize {
        (self.0 % 3) as usize
    }
}

/// Destination operand. `Discard` is the write sink; reads from it are
/// undefined by contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dst {
    Reg(RegId),
    Discard,
}

/// Source operand. `ConstOne` always reads 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Src {
    Reg(RegId),
    ConstOne,
}

/// Branch target: another instruction slot, or out of the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Inst(InstIdx),
    Exit,
}

/// `movdbz dst, src, nz, z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovDbz {
    pub dst: Dst,
    pub src: Src,
    /// Taken when the source was non-zero before the decrement.
    pub nz: Target,
    /// Taken when the source was zero.
    pub z: Target,
}

impl MovDbz {
    pub fn new(dst: Dst, src: Src, nz: Target, z: Target) -> Self {
        Self { dst, src, nz, z }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_reals_all_share_rotation_slot_zero() {
        for slot in [0u16, 1, 2, 85, 255] {
            assert_eq!(InstIdx(slot).entry().rotation(), 0);
        }
    }

    #[test]
    fn reals_of_one_slot_cover_all_three_rotations() {
        let entry = InstIdx(7).entry();
        assert_eq!(entry.rotation(), 0);
        assert_eq!(RealIdx(entry.0 + 1).rotation(), 1);
        assert_eq!(RealIdx(entry.0 + 2).rotation(), 2);
    }
}
