//! Properties of the synthesiser's data products, checked without ever
//! running the cascade: descriptor well-formedness, window page-table
//! coverage, and slot rotation.

use faultline_engine::layout::{
    gdt_page_for_selector, rotation_selector, slot_tss_address, window_pt_index, GDT_FIRST_PAGE,
    HOST_TSS_ADDRESS, HOST_TSS_SELECTOR, ROTATION_SELECTORS, TSS_PAGE_OFFSET,
};
use faultline_engine::program::RealIdx;
use faultline_engine::{
    CascadeConfig, Dst, InstIdx, MovDbz, Src, Target, WeirdMachine,
};
use faultline_x86::{decode_task_gate, tss, SegDescriptor, ACCESS_TSS_AVAILABLE, TSS_LIMIT};
use pretty_assertions::assert_eq;

/// Two-instruction program exercising both exit and non-exit edges.
fn built_machine() -> (WeirdMachine, Vec<(InstIdx, MovDbz)>) {
    let mut m = WeirdMachine::new(CascadeConfig::default());
    m.setup().unwrap();
    let r0 = m.alloc_register(3).unwrap();
    let r1 = m.alloc_register(0).unwrap();
    let insts = vec![
        (
            InstIdx(0),
            MovDbz::new(
                Dst::Reg(r1),
                Src::Reg(r0),
                Target::Inst(InstIdx(1)),
                Target::Exit,
            ),
        ),
        (
            InstIdx(1),
            MovDbz::new(
                Dst::Discard,
                Src::ConstOne,
                Target::Inst(InstIdx(0)),
                Target::Exit,
            ),
        ),
    ];
    for (slot, inst) in &insts {
        m.emit(*slot, *inst).unwrap();
    }
    m.finalise().unwrap();
    (m, insts)
}

fn reals_of(slot: InstIdx) -> [RealIdx; 3] {
    let entry = slot.entry();
    [entry, RealIdx(entry.0 + 1), RealIdx(entry.0 + 2)]
}

#[test]
fn rotation_slot_descriptors_are_well_formed() {
    let (m, _) = built_machine();
    for (slot, &selector) in ROTATION_SELECTORS.iter().enumerate() {
        let raw = m
            .ram()
            .peek_u64(GDT_FIRST_PAGE.phys_addr() + selector as u32);
        let desc = SegDescriptor::decode(raw);
        assert_eq!(desc.access, ACCESS_TSS_AVAILABLE);
        assert!(!desc.granularity_4k);
        assert_eq!(desc.base, slot_tss_address(slot));
        assert_eq!(desc.limit, TSS_LIMIT);
    }

    let host = SegDescriptor::decode(
        m.ram()
            .peek_u64(GDT_FIRST_PAGE.phys_addr() + HOST_TSS_SELECTOR as u32),
    );
    assert_eq!(host.access, ACCESS_TSS_AVAILABLE);
    assert_eq!(host.base, HOST_TSS_ADDRESS);
}

#[test]
fn every_head_page_carries_a_fresh_descriptor_for_its_own_slot() {
    let (m, insts) = built_machine();
    let layout = m.program_layout();
    for (slot, _) in &insts {
        for real in reals_of(*slot) {
            let head = layout.block(real).tss_head().phys_addr() + TSS_PAGE_OFFSET;
            let desc = SegDescriptor::decode(m.ram().peek_u64(head + tss::EAX));
            assert_eq!(desc.access, ACCESS_TSS_AVAILABLE);
            assert!(!desc.granularity_4k);
            assert_eq!(desc.base, slot_tss_address(real.rotation()));
            assert_eq!(desc.limit, TSS_LIMIT);
        }
    }
}

/// Lowered successor reals of a real instruction, (non-zero edge, zero edge).
fn successors(insts: &[(InstIdx, MovDbz)], real: RealIdx) -> [Option<RealIdx>; 2] {
    let inst = insts
        .iter()
        .find(|(slot, _)| slot.0 == real.0 / 3)
        .map(|(_, inst)| inst)
        .unwrap();
    match real.0 % 3 {
        0 | 1 => {
            let mover = RealIdx(real.0 / 3 * 3 + 2);
            [Some(mover), Some(mover)]
        }
        _ => [
            match inst.nz {
                Target::Inst(t) => Some(t.entry()),
                Target::Exit => None,
            },
            match inst.z {
                Target::Inst(t) => Some(RealIdx(t.0 * 3 + 1)),
                Target::Exit => None,
            },
        ],
    }
}

#[test]
fn window_pt_maps_exactly_the_idt_own_tss_and_successor_tss_ranges() {
    let (m, insts) = built_machine();
    let layout = m.program_layout();

    for (slot, inst) in &insts {
        for real in reals_of(*slot) {
            let block = layout.block(real);
            let pt = block.window_pt().phys_addr();

            let mut expected = vec![(0u32, block.idt())];

            let own = window_pt_index(slot_tss_address(real.rotation()));
            expected.push((own, gdt_page_for_selector(rotation_selector(real.rotation()))));
            let dest = if real.0 % 3 == 2 {
                layout.dst_page(inst.dst)
            } else {
                faultline_engine::layout::DISCARD_PAGE
            };
            expected.push((own + 1, dest));

            let src = if real.0 % 3 == 2 {
                faultline_engine::layout::CONST_ONE_PAGE
            } else {
                layout.src_page(inst.src)
            };
            for next in successors(&insts, real).into_iter().flatten() {
                let idx = window_pt_index(slot_tss_address(next.rotation()));
                expected.push((idx, layout.block(next).tss_head()));
                expected.push((idx + 1, src));
            }
            expected.sort();
            expected.dedup();

            let mut present = Vec::new();
            for idx in 0..1024u32 {
                let entry = m.ram().peek_u32(pt + idx * 4);
                if entry != 0 {
                    present.push((idx, entry & !0xFFF));
                }
            }
            let expected: Vec<(u32, u32)> = expected
                .into_iter()
                .map(|(idx, page)| (idx, page.phys_addr()))
                .collect();
            assert_eq!(present, expected, "real instruction {}", real.0);
        }
    }
}

#[test]
fn every_cascade_edge_changes_rotation_slot() {
    let (m, insts) = built_machine();
    let layout = m.program_layout();

    for (slot, _) in &insts {
        for real in reals_of(*slot) {
            let idt = layout.block(real).idt().phys_addr();
            let own = rotation_selector(real.rotation());
            for vector in [8u32, 14] {
                let gate = decode_task_gate(m.ram().peek_u64(idt + vector * 8))
                    .expect("both fault vectors must be task gates");
                if gate != HOST_TSS_SELECTOR {
                    assert_ne!(gate, own, "real {} vector {}", real.0, vector);
                }
            }
        }
    }
}
