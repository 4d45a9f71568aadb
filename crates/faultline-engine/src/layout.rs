//! The fixed virtual-address map every per-instruction page directory
//! installs, and the page-index arithmetic that assigns frames of the
//! identity-mapped program region to logical roles.
//!
//! Virtual map (identical under every directory the engine builds):
//!
//! | Virtual                   | Role                                    |
//! |---------------------------|-----------------------------------------|
//! | `0x0000_0000`             | stack (one present 4 KiB page)          |
//! | `0x0040_0000`             | instruction window: IDT + TSS mappings  |
//! | `0x00C0_0000`             | host kernel (4 MiB identity)            |
//! | `0x0180_0000`             | GDT window (4 pages)                    |
//! | `0x0800_0000`             | program region (4 MiB identity)         |

use faultline_mmu::PAGE_SIZE;

use crate::program::{Dst, RealIdx, RegId, Src};

pub const STACK_ADDRESS: u32 = 0x0000_0000;
pub const INST_ADDRESS: u32 = 0x0040_0000;
/// The IDT occupies the first page of the instruction window.
pub const IDT_ADDRESS: u32 = INST_ADDRESS;
pub const KERNEL_ADDRESS: u32 = 0x00C0_0000;
pub const GDT_ADDRESS: u32 = 0x0180_0000;
/// Physical home of the host's flat identity page directory.
pub const HOST_PD_ADDRESS: u32 = 0x07C0_0000;
/// Physical base of the program region; every directory identity-maps it.
pub const PROG_BASE_ADDRESS: u32 = 0x0800_0000;

/// The program region is a single 4 MiB mapping.
pub const PROG_REGION_PAGES: u32 = 1024;

/// Physical memory span the machine models.
pub const RAM_SIZE: u32 = PROG_BASE_ADDRESS + (PROG_REGION_PAGES * PAGE_SIZE);

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// The host-return TSS: branching here leaves the cascade.
pub const HOST_TSS_SELECTOR: u16 = 0x18;
/// The three rotating TSS slots, indexed by real-instruction number mod 3.
pub const ROTATION_SELECTORS: [u16; 3] = [0x1FF8, 0x2FF8, 0x3FF8];

/// Host context inside the kernel window (mapped in every directory).
pub const HOST_TSS_ADDRESS: u32 = KERNEL_ADDRESS + 0x1000;
pub const HOST_STACK_TOP: u32 = KERNEL_ADDRESS + 0x8000;
pub const HOST_RESUME_EIP: u32 = KERNEL_ADDRESS + 0x400;

/// EIP loaded by every instruction TSS. No directory maps it, so the first
/// fetch after any task switch faults.
pub const UNMAPPED_EIP: u32 = 0x0FFF_EFFF;

/// Page offset at which a TSS is placed: the head (BACKLINK..=ECX) fills the
/// last 0x30 bytes of one page, the tail (EDX..=IOMAP) spills onto the next.
pub const TSS_PAGE_OFFSET: u32 = 0xFD0;

/// Index of a 4 KiB frame within the program region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageIdx(pub u32);

impl PageIdx {
    pub fn phys_addr(self) -> u32 {
        PROG_BASE_ADDRESS + self.0 * PAGE_SIZE
    }
}

pub const STACK_PAGE: PageIdx = PageIdx(0);
pub const STACK_PT_PAGE: PageIdx = PageIdx(1);
pub const GDT_PT_PAGE: PageIdx = PageIdx(2);
pub const GDT_FIRST_PAGE: PageIdx = PageIdx(3);
pub const GDT_PAGES: u32 = 4;
pub const INIT_PD_PAGE: PageIdx = PageIdx(7);
pub const INIT_PT_PAGE: PageIdx = PageIdx(8);
pub const CONST_ONE_PAGE: PageIdx = PageIdx(9);
pub const DISCARD_PAGE: PageIdx = PageIdx(10);
/// Register and constant pages start here; instruction blocks follow them.
pub const FIRST_REG_PAGE: PageIdx = PageIdx(11);

pub const PAGES_PER_REAL: u32 = 4;
pub const REALS_PER_INST: u32 = 3;
pub const PAGES_PER_INST: u32 = PAGES_PER_REAL * REALS_PER_INST;

/// The 4-page block owned by one real instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub base: PageIdx,
}

impl Block {
    /// Page directory.
    pub fn pd(self) -> PageIdx {
        self.base
    }

    /// Page table backing the instruction window.
    pub fn window_pt(self) -> PageIdx {
        PageIdx(self.base.0 + 1)
    }

    /// TSS head page (CR3, unmapped EIP, EFLAGS, fresh slot descriptor).
    pub fn tss_head(self) -> PageIdx {
        PageIdx(self.base.0 + 2)
    }

    /// IDT page (#PF and #DF task gates).
    pub fn idt(self) -> PageIdx {
        PageIdx(self.base.0 + 3)
    }
}

/// The bootstrap block only uses its directory and page table; the two pages
/// after it are the const-one and discard registers.
pub const INIT_BLOCK: Block = Block { base: INIT_PD_PAGE };

pub fn rotation_selector(slot: usize) -> u16 {
    ROTATION_SELECTORS[slot % 3]
}

/// Fixed virtual address of the TSS entered through a rotation slot: the last
/// page of the slot's 64 KiB band in the instruction window, so the head's
/// EAX/ECX save lands exactly on the slot's descriptor in the GDT page mapped
/// beneath it.
pub fn slot_tss_address(slot: usize) -> u32 {
    INST_ADDRESS + (slot as u32 % 3) * 0x1_0000 + 0xF000 + TSS_PAGE_OFFSET
}

/// Index into the instruction-window page table covering `vaddr`.
pub fn window_pt_index(vaddr: u32) -> u32 {
    (vaddr >> 12) & 0x3FF
}

/// Which GDT page holds the descriptor for `selector`.
pub fn gdt_page_for_selector(selector: u16) -> PageIdx {
    PageIdx(GDT_FIRST_PAGE.0 + (selector >> 12) as u32)
}

/// Frame assignment once the register/constant population is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramLayout {
    pub user_regs: u16,
    pub const_regs: u16,
}

impl ProgramLayout {
    pub fn total_regs(&self) -> u16 {
        self.user_regs + self.const_regs
    }

    pub fn reg_page(&self, id: RegId) -> PageIdx {
        PageIdx(FIRST_REG_PAGE.0 + id.0 as u32)
    }

    pub fn dst_page(&self, dst: Dst) -> PageIdx {
        match dst {
            Dst::Reg(id) => self.reg_page(id),
            Dst::Discard => DISCARD_PAGE,
        }
    }

    pub fn src_page(&self, src: Src) -> PageIdx {
        match src {
            Src::Reg(id) => self.reg_page(id),
            Src::ConstOne => CONST_ONE_PAGE,
        }
    }

    /// First page of the instruction blocks, directly above the registers.
    pub fn first_inst_page(&self) -> PageIdx {
        PageIdx(FIRST_REG_PAGE.0 + self.total_regs() as u32)
    }

    pub fn block(&self, real: RealIdx) -> Block {
        Block {
            base: PageIdx(self.first_inst_page().0 + real.0 as u32 * PAGES_PER_REAL),
        }
    }

    /// Whether `real`'s whole block fits inside the identity-mapped region.
    pub fn block_fits(&self, real: RealIdx) -> bool {
        self.block(real).base.0 + PAGES_PER_REAL <= PROG_REGION_PAGES
    }
}
