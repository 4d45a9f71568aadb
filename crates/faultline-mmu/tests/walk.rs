use faultline_mmu::{AccessType, MemoryBus, Mmu, PageRam};
use faultline_x86::{CR0_PG, CR4_PSE, PTE_A, PTE_D, PTE_P, PTE_PS, PTE_RW};
use pretty_assertions::assert_eq;

const PD_BASE: u32 = 0x1000;
const PT_BASE: u32 = 0x2000;

fn paging_on() -> Mmu {
    let mut mmu = Mmu::new();
    mmu.set_cr0(CR0_PG);
    mmu.set_cr3(PD_BASE);
    mmu.set_cr4(CR4_PSE);
    mmu
}

#[test]
fn identity_when_paging_disabled() {
    let mut ram = PageRam::new(0x10000);
    let mmu = Mmu::new();
    assert_eq!(
        mmu.translate(&mut ram, 0xDEAD_BEEF, AccessType::Read),
        Ok(0xDEAD_BEEF)
    );
}

#[test]
fn walks_4k_mapping_and_sets_accessed_dirty() {
    let mut ram = PageRam::new(0x10000);
    // PDE[0] -> PT, PT[5] -> phys 0x7000.
    ram.write_u32(PD_BASE, PTE_P | PTE_RW | PT_BASE);
    ram.write_u32(PT_BASE + 5 * 4, PTE_P | PTE_RW | 0x7000);

    let mmu = paging_on();
    assert_eq!(
        mmu.translate(&mut ram, 0x5ABC, AccessType::Write),
        Ok(0x7ABC)
    );

    let pde = ram.peek_u32(PD_BASE);
    let pte = ram.peek_u32(PT_BASE + 5 * 4);
    assert_eq!(pde & PTE_A, PTE_A);
    assert_eq!(pte & (PTE_A | PTE_D), PTE_A | PTE_D);
}

#[test]
fn walks_4m_mapping() {
    let mut ram = PageRam::new(0x10000);
    // PDE[3] is a 4 MiB page at phys 0x00C0_0000.
    ram.write_u32(PD_BASE + 3 * 4, PTE_P | PTE_RW | PTE_PS | 0x00C0_0000);

    let mmu = paging_on();
    assert_eq!(
        mmu.translate(&mut ram, 0x00C1_2345, AccessType::Read),
        Ok(0x00C1_2345)
    );
    assert_eq!(ram.peek_u32(PD_BASE + 3 * 4) & PTE_A, PTE_A);
}

#[test]
fn not_present_pde_faults_with_clean_error_code() {
    let mut ram = PageRam::new(0x10000);
    let mmu = paging_on();
    let fault = mmu
        .translate(&mut ram, 0x0FFF_EFFF, AccessType::Execute)
        .unwrap_err();
    assert_eq!(fault.addr, 0x0FFF_EFFF);
    // Not-present supervisor fetch: P=0, W=0.
    assert_eq!(fault.error_code, 0);
}

#[test]
fn not_present_pte_faults_as_write() {
    let mut ram = PageRam::new(0x10000);
    ram.write_u32(PD_BASE, PTE_P | PTE_RW | PT_BASE);

    let mmu = paging_on();
    let fault = mmu
        .translate(&mut ram, 0xFFC, AccessType::Write)
        .unwrap_err();
    assert_eq!(fault.addr, 0xFFC);
    assert_eq!(fault.error_code, 1 << 1);
}

#[test]
fn ps_without_pse_is_a_reserved_bit_fault() {
    let mut ram = PageRam::new(0x10000);
    ram.write_u32(PD_BASE, PTE_P | PTE_RW | PTE_PS);

    let mut mmu = paging_on();
    mmu.set_cr4(0);
    let fault = mmu.translate(&mut ram, 0x1234, AccessType::Read).unwrap_err();
    // Present + reserved.
    assert_eq!(fault.error_code, (1 << 0) | (1 << 3));
}

#[test]
fn supervisor_write_ignores_read_only_without_wp() {
    let mut ram = PageRam::new(0x10000);
    ram.write_u32(PD_BASE, PTE_P | PT_BASE);
    ram.write_u32(PT_BASE, PTE_P | 0x7000);

    let mmu = paging_on();
    assert_eq!(mmu.translate(&mut ram, 0x10, AccessType::Write), Ok(0x7010));
}

#[test]
fn unbacked_ram_reads_open_bus() {
    let mut ram = PageRam::new(0x1000);
    assert_eq!(ram.read_u32(0x8000), 0xFFFF_FFFF);
    ram.write_u32(0x8000, 42);
    assert_eq!(ram.read_u32(0x8000), 0xFFFF_FFFF);
}
