//! The instruction synthesiser.
//!
//! Each abstract `movdbz` compiles into three consecutive real instructions:
//! two fault-absorbing no-ops (so both branch entries of a slot land on
//! rotation slots 0 and 1 while the dataflow move holds slot 2) and the move
//! itself. A real instruction is four pages: a page directory, the window
//! page table, a TSS head page, and an IDT page. The CPU computes by being
//! switched into the head's TSS, faulting on the unmapped EIP, and switching
//! out through a task gate; the save/load halves of those switches move the
//! register values.

use faultline_mmu::{MemoryBus, PAGE_SIZE};
use faultline_x86::{tss, SegDescriptor, encode_task_gate, PTE_P, PTE_PS, PTE_RW};

use crate::layout::{
    gdt_page_for_selector, rotation_selector, slot_tss_address, window_pt_index, Block, PageIdx,
    ProgramLayout, GDT_ADDRESS, GDT_FIRST_PAGE, GDT_PAGES, GDT_PT_PAGE, HOST_TSS_SELECTOR,
    INST_ADDRESS, KERNEL_ADDRESS, PROG_BASE_ADDRESS, STACK_ADDRESS, STACK_PAGE, STACK_PT_PAGE,
    TSS_PAGE_OFFSET, UNMAPPED_EIP,
};
use crate::program::{InstIdx, MovDbz, RealIdx, Target};

/// Present + writable 4 KiB entry pointing at a program page.
fn pte(page: PageIdx) -> u32 {
    page.phys_addr() | PTE_P | PTE_RW
}

/// Present + writable 4 MiB identity entry.
fn pde_4m(phys_base: u32) -> u32 {
    phys_base | PTE_P | PTE_RW | PTE_PS
}

/// Lowered branch target of a real instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RealTarget {
    Real(RealIdx),
    Exit,
}

impl RealTarget {
    fn selector(self) -> u16 {
        match self {
            RealTarget::Real(real) => rotation_selector(real.rotation()),
            RealTarget::Exit => HOST_TSS_SELECTOR,
        }
    }
}

/// Write the page directory of `block`, plus the shared stack and GDT page
/// tables it references (idempotent rewrites).
pub(crate) fn write_block_directory(bus: &mut impl MemoryBus, block: Block) {
    let pd = block.pd().phys_addr();
    bus.zero(pd, PAGE_SIZE);

    // Stack: one present page at the bottom of the address space.
    bus.write_u32(STACK_PT_PAGE.phys_addr(), pte(STACK_PAGE));
    bus.write_u32(pd + (STACK_ADDRESS >> 22) * 4, pte(STACK_PT_PAGE));

    // Instruction window; the IDT is its first page.
    let window_pt = block.window_pt().phys_addr();
    bus.zero(window_pt, PAGE_SIZE);
    bus.write_u32(window_pt, pte(block.idt()));
    bus.write_u32(pd + (INST_ADDRESS >> 22) * 4, pte(block.window_pt()));

    // Host kernel, 4 MiB identity.
    bus.write_u32(pd + (KERNEL_ADDRESS >> 22) * 4, pde_4m(KERNEL_ADDRESS));

    // GDT window over the program's four GDT pages.
    for i in 0..GDT_PAGES {
        bus.write_u32(
            GDT_PT_PAGE.phys_addr() + i * 4,
            pte(PageIdx(GDT_FIRST_PAGE.0 + i)),
        );
    }
    bus.write_u32(pd + (GDT_ADDRESS >> 22) * 4, pte(GDT_PT_PAGE));

    // The program region itself, 4 MiB identity.
    bus.write_u32(pd + (PROG_BASE_ADDRESS >> 22) * 4, pde_4m(PROG_BASE_ADDRESS));
}

/// Write `block`'s IDT page: vector 14 (#PF) takes the non-zero edge, vector
/// 8 (#DF, raised when the error-code push crosses off the stack page) takes
/// the zero edge. Both entries are always written, even when they agree.
fn write_idt_page(bus: &mut impl MemoryBus, block: Block, nz_selector: u16, z_selector: u16) {
    let idt = block.idt().phys_addr();
    bus.zero(idt, PAGE_SIZE);
    bus.write_u64(idt + 8 * 8, encode_task_gate(z_selector));
    bus.write_u64(idt + 14 * 8, encode_task_gate(nz_selector));
}

/// Write `block`'s TSS head page: CR3 pointing at this block's directory, the
/// deliberately unmapped EIP, EFLAGS, and — in the EAX/ECX slots — a freshly
/// encoded non-busy descriptor for this instruction's rotation slot.
///
/// The EAX/ECX image is the busy-bit trick: under this block's directory the
/// head's virtual page is the GDT page holding the slot's descriptor, so the
/// save half of the switch that leaves this instruction writes these eight
/// bytes over the descriptor, clearing the busy bit the entry set.
fn write_tss_head_page(bus: &mut impl MemoryBus, block: Block, real: RealIdx, eflags: u32) {
    let page = block.tss_head().phys_addr();
    bus.zero(page, PAGE_SIZE);

    let head = page + TSS_PAGE_OFFSET;
    bus.write_u32(head + tss::CR3, block.pd().phys_addr());
    bus.write_u32(head + tss::EIP, UNMAPPED_EIP);
    bus.write_u32(head + tss::EFLAGS, eflags);

    let slot = real.rotation();
    let fresh = SegDescriptor::tss(slot_tss_address(slot));
    bus.write_u64(head + tss::EAX, fresh.encode());
}

/// Map the TSS this instruction is itself switched into: the GDT page holding
/// its slot's descriptor as the head, and the destination register page as
/// the tail. The save half of the switch that leaves writes the decremented
/// ESP into that tail.
fn map_dest_tss(bus: &mut impl MemoryBus, block: Block, real: RealIdx, dest: PageIdx) {
    let pt = block.window_pt().phys_addr();
    let slot = real.rotation();
    let idx = window_pt_index(slot_tss_address(slot));
    bus.write_u32(
        pt + idx * 4,
        pte(gdt_page_for_selector(rotation_selector(slot))),
    );
    bus.write_u32(pt + (idx + 1) * 4, pte(dest));
}

/// Map a successor's TSS into `window_pt`: the successor's head page, then
/// its source register page as the tail the next switch loads ESP from.
pub(crate) fn map_src_tss(
    bus: &mut impl MemoryBus,
    layout: &ProgramLayout,
    window_pt: PageIdx,
    next: RealIdx,
    src: PageIdx,
) {
    let pt = window_pt.phys_addr();
    let idx = window_pt_index(slot_tss_address(next.rotation()));
    bus.write_u32(pt + idx * 4, pte(layout.block(next).tss_head()));
    bus.write_u32(pt + (idx + 1) * 4, pte(src));
}

/// Materialise one real instruction's 4-page block.
fn synthesise_real(
    bus: &mut impl MemoryBus,
    layout: &ProgramLayout,
    real: RealIdx,
    nz: RealTarget,
    z: RealTarget,
    dest: PageIdx,
    src: PageIdx,
    eflags: u32,
) {
    let block = layout.block(real);
    write_block_directory(bus, block);
    write_idt_page(bus, block, nz.selector(), z.selector());
    write_tss_head_page(bus, block, real, eflags);
    map_dest_tss(bus, block, real, dest);

    for target in [nz, z] {
        if let RealTarget::Real(next) = target {
            // A still-busy TSS cannot be re-entered; the rotation guarantees
            // every edge changes slot.
            debug_assert_ne!(next.rotation(), real.rotation());
            map_src_tss(bus, layout, block.window_pt(), next, src);
        }
    }
}

fn lower(target: Target, zero_edge: bool) -> RealTarget {
    match target {
        // The non-zero edge enters a slot at its first no-op, the zero edge
        // at its second, so the two entries always differ in rotation slot.
        Target::Inst(slot) => RealTarget::Real(RealIdx(slot.0 * 3 + zero_edge as u16)),
        Target::Exit => RealTarget::Exit,
    }
}

/// Materialise all three real instructions of the abstract instruction in
/// `slot`.
pub(crate) fn synthesise_movdbz(
    bus: &mut impl MemoryBus,
    layout: &ProgramLayout,
    slot: InstIdx,
    inst: &MovDbz,
    eflags: u32,
) {
    let dest = layout.dst_page(inst.dst);
    let src = layout.src_page(inst.src);
    let entry = slot.entry();
    let nop0 = entry;
    let nop1 = RealIdx(entry.0 + 1);
    let mover = RealIdx(entry.0 + 2);

    // Both no-ops drop their saved ESP into the discard page and hand the
    // mover the abstract source as its incoming tail.
    let to_mover = RealTarget::Real(mover);
    synthesise_real(
        bus,
        layout,
        nop0,
        to_mover,
        to_mover,
        crate::layout::DISCARD_PAGE,
        src,
        eflags,
    );
    synthesise_real(
        bus,
        layout,
        nop1,
        to_mover,
        to_mover,
        crate::layout::DISCARD_PAGE,
        src,
        eflags,
    );

    // The mover saves the decremented source into the destination and hands
    // each successor the const-one page, which its no-ops burn.
    synthesise_real(
        bus,
        layout,
        mover,
        lower(inst.nz, false),
        lower(inst.z, true),
        dest,
        crate::layout::CONST_ONE_PAGE,
        eflags,
    );
}

/// Write a complete GDT image (null, flat code/data, host-return TSS, and
/// the three rotation slots) at physical `base`. Used both for the host copy
/// the GDTR points at under identity paging and for the program copy the
/// per-instruction directories map at the same linear address.
pub(crate) fn write_gdt_image(bus: &mut impl MemoryBus, base: u32, host_tss_base: u32) {
    bus.zero(base, GDT_PAGES * PAGE_SIZE);
    bus.write_u64(base + 0x08, SegDescriptor::flat_code().encode());
    bus.write_u64(base + 0x10, SegDescriptor::flat_data().encode());
    bus.write_u64(
        base + HOST_TSS_SELECTOR as u32,
        SegDescriptor::tss(host_tss_base).encode(),
    );
    for (slot, &selector) in crate::layout::ROTATION_SELECTORS.iter().enumerate() {
        bus.write_u64(
            base + selector as u32,
            SegDescriptor::tss(slot_tss_address(slot)).encode(),
        );
    }
}
