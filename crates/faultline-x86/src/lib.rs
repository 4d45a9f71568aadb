#![forbid(unsafe_code)]

//! Byte-exact primitives for the 32-bit x86 system structures the fault
//! cascade is built out of: 8-byte segment/TSS descriptors, IDT task gates,
//! the 104-byte TSS field layout, and legacy page-table entry bits.
//!
//! Everything here is a pure data transformation; nothing touches memory.
//! Encodings follow Intel SDM Vol. 3 §3.4.5 (descriptors), §6.11 (gates) and
//! §8.2 (TSS).

/// 8-byte segment or system descriptor, decomposed.
///
/// `access` is the full access byte (P/DPL/S/type); `granularity_4k` is the G
/// flag. The D/B flag is always encoded set, matching a flat 32-bit segment
/// (it is ignored by the CPU for system descriptors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegDescriptor {
    pub access: u8,
    pub granularity_4k: bool,
    pub base: u32,
    pub limit: u32,
}

/// Access byte of a ring-0 flat code segment.
pub const ACCESS_CODE: u8 = 0x9A;
/// Access byte of a ring-0 flat data segment.
pub const ACCESS_DATA: u8 = 0x92;
/// Access byte of an available 32-bit TSS.
pub const ACCESS_TSS_AVAILABLE: u8 = 0x89;
/// Access byte of a busy 32-bit TSS.
pub const ACCESS_TSS_BUSY: u8 = 0x8B;

/// The busy bit within a TSS descriptor's access byte.
pub const ACCESS_TSS_BUSY_BIT: u8 = 0x02;

/// Limit of every TSS descriptor: the architectural minimum of 104 bytes.
pub const TSS_LIMIT: u32 = 0x67;

impl SegDescriptor {
    /// Ring-0 flat code segment (base 0, 4 GiB, 4 KiB granularity).
    pub fn flat_code() -> Self {
        Self {
            access: ACCESS_CODE,
            granularity_4k: true,
            base: 0,
            limit: 0xF_FFFF,
        }
    }

    /// Ring-0 flat data segment.
    pub fn flat_data() -> Self {
        Self {
            access: ACCESS_DATA,
            granularity_4k: true,
            base: 0,
            limit: 0xF_FFFF,
        }
    }

    /// Available 32-bit TSS at `base`, byte granularity.
    pub fn tss(base: u32) -> Self {
        Self {
            access: ACCESS_TSS_AVAILABLE,
            granularity_4k: false,
            base,
            limit: TSS_LIMIT,
        }
    }

    /// Encode into the in-memory (little-endian) 8-byte form, as a `u64`
    /// whose low dword is the first dword of the descriptor.
    pub fn encode(self) -> u64 {
        let low = ((self.base & 0xFFFF) << 16) | (self.limit & 0xFFFF);
        let high = (self.base & 0xFF00_0000)
            | 0x0040_0000
            | ((self.granularity_4k as u32) << 23)
            | (self.limit & 0x000F_0000)
            | ((self.access as u32) << 8)
            | ((self.base & 0x00FF_0000) >> 16);
        (low as u64) | ((high as u64) << 32)
    }

    /// Decode the 8-byte form produced by [`SegDescriptor::encode`].
    pub fn decode(raw: u64) -> Self {
        let low = raw as u32;
        let high = (raw >> 32) as u32;
        Self {
            access: (high >> 8) as u8,
            granularity_4k: high & (1 << 23) != 0,
            base: (high & 0xFF00_0000) | ((high & 0xFF) << 16) | (low >> 16),
            limit: (high & 0x000F_0000) | (low & 0xFFFF),
        }
    }

    /// Whether this names an available (non-busy) 32-bit TSS.
    pub fn is_available_tss(&self) -> bool {
        self.access == ACCESS_TSS_AVAILABLE
    }

    /// Whether this names a busy 32-bit TSS.
    pub fn is_busy_tss(&self) -> bool {
        self.access == ACCESS_TSS_BUSY
    }
}

/// Type/attribute byte of a present, DPL-3, 32-bit task gate.
const TASK_GATE_TYPE_ATTR: u32 = 0xE5;

/// Encode an IDT task gate for `selector` (offset fields are unused by the
/// CPU for task gates and left zero).
pub fn encode_task_gate(selector: u16) -> u64 {
    ((selector as u64) << 16) | ((TASK_GATE_TYPE_ATTR as u64) << 40)
}

/// Decode an IDT entry, returning the target TSS selector when the entry is
/// a present task gate.
pub fn decode_task_gate(raw: u64) -> Option<u16> {
    let type_attr = ((raw >> 40) & 0xFF) as u32;
    if type_attr != TASK_GATE_TYPE_ATTR {
        return None;
    }
    Some((raw >> 16) as u16)
}

/// Byte offsets of the fields of a 32-bit TSS.
///
/// The engine splits each TSS across a page boundary: `CR3..=ECX` live on the
/// head page, `EDX..=IOMAP` on the tail page, so the tail (which carries ESP)
/// can be remapped per instruction.
pub mod tss {
    pub const BACKLINK: u32 = 0x00;
    pub const CR3: u32 = 0x1C;
    pub const EIP: u32 = 0x20;
    pub const EFLAGS: u32 = 0x24;
    pub const EAX: u32 = 0x28;
    pub const ECX: u32 = 0x2C;
    pub const EDX: u32 = 0x30;
    pub const EBX: u32 = 0x34;
    pub const ESP: u32 = 0x38;
    pub const EBP: u32 = 0x3C;
    pub const ESI: u32 = 0x40;
    pub const EDI: u32 = 0x44;
    pub const ES: u32 = 0x48;
    pub const CS: u32 = 0x4C;
    pub const SS: u32 = 0x50;
    pub const DS: u32 = 0x54;
    pub const FS: u32 = 0x58;
    pub const GS: u32 = 0x5C;
    pub const LDT: u32 = 0x60;
    pub const IOMAP: u32 = 0x64;

    /// Architectural TSS size.
    pub const SIZE: u32 = 0x68;

    /// Offset of the first general-purpose register slot (EAX).
    pub const GPR_BASE: u32 = EAX;
    /// Offset of the first segment-selector slot (ES).
    pub const SEG_BASE: u32 = ES;
}

/// Legacy 32-bit page-table entry bits (shared by PDEs and PTEs).
pub const PTE_P: u32 = 1 << 0;
pub const PTE_RW: u32 = 1 << 1;
pub const PTE_US: u32 = 1 << 2;
pub const PTE_A: u32 = 1 << 5;
pub const PTE_D: u32 = 1 << 6;
pub const PTE_PS: u32 = 1 << 7;
pub const PTE_G: u32 = 1 << 8;

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_PG: u32 = 1 << 31;

pub const CR4_PSE: u32 = 1 << 4;

/// EFLAGS nested-task flag, set by the CPU on every task switch through a
/// gate or CALL.
pub const EFLAGS_NT: u32 = 1 << 14;
/// EFLAGS reserved bit 1, always set.
pub const EFLAGS_RESERVED1: u32 = 1 << 1;

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn flat_code_matches_classic_encoding() {
        assert_eq!(SegDescriptor::flat_code().encode(), 0x00CF_9A00_0000_FFFF);
    }

    #[test]
    fn flat_data_matches_classic_encoding() {
        assert_eq!(SegDescriptor::flat_data().encode(), 0x00CF_9200_0000_FFFF);
    }

    #[test]
    fn tss_descriptor_round_trips() {
        let desc = SegDescriptor::tss(0x0040_FFD0);
        let decoded = SegDescriptor::decode(desc.encode());
        assert_eq!(decoded.access, ACCESS_TSS_AVAILABLE);
        assert!(!decoded.granularity_4k);
        assert_eq!(decoded.base, 0x0040_FFD0);
        assert_eq!(decoded.limit, TSS_LIMIT);
    }

    #[test]
    fn task_gate_round_trips() {
        for selector in [0x18u16, 0x1FF8, 0x2FF8, 0x3FF8] {
            assert_eq!(decode_task_gate(encode_task_gate(selector)), Some(selector));
        }
    }

    #[test]
    fn non_task_gate_is_rejected() {
        // An interrupt gate (type 0xE) must not decode as a task gate.
        assert_eq!(decode_task_gate(0x0000_8E00_0008_0000), None);
        assert_eq!(decode_task_gate(0), None);
    }

    proptest! {
        #[test]
        fn descriptor_encode_decode_round_trips(
            base in any::<u32>(),
            limit in 0u32..=0xF_FFFF,
            access in any::<u8>(),
            g in any::<bool>(),
        ) {
            let desc = SegDescriptor { access, granularity_4k: g, base, limit };
            prop_assert_eq!(SegDescriptor::decode(desc.encode()), desc);
        }
    }
}
