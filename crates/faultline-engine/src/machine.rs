//! The driver: owns the physical memory image and the hart, assembles the
//! program (registers, constants, instruction blocks), and launches/resumes
//! the cascade.
//!
//! Lifecycle: `Uninit --setup--> Ready --launch/resume--> Running --> Exited`.
//! Allocation order is strict — user registers, then constants, then
//! instruction blocks — because each class's pages sit directly above the
//! previous one.

use thiserror::Error;
use tracing::{debug, warn};

use faultline_mmu::{MemoryBus, PageRam, PAGE_SIZE};
use faultline_x86::{tss, ACCESS_TSS_BUSY, CR0_PE, CR0_PG, CR4_PSE, EFLAGS_RESERVED1, PTE_P, PTE_PS, PTE_RW};

use crate::cascade::{Cascade, CascadeFault, Hart, TableReg, TaskReg, TaskState, GPR_ESP};
use crate::layout::{
    rotation_selector, ProgramLayout, CONST_ONE_PAGE, DISCARD_PAGE, GDT_ADDRESS, GDT_PAGES,
    HOST_PD_ADDRESS, HOST_RESUME_EIP, HOST_STACK_TOP, HOST_TSS_ADDRESS, HOST_TSS_SELECTOR,
    IDT_ADDRESS, INIT_BLOCK, INIT_PD_PAGE, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, RAM_SIZE,
};
use crate::program::{Dst, InstIdx, MovDbz, RegId, Src, Target, MAX_ASM_INSTS, MAX_REGISTERS};
use crate::regs::{read_register_page, write_register_page, MAX_DECREMENT_VALUE, MAX_REG_VALUE};
use crate::synth;

/// Knobs for a cascade run.
#[derive(Debug, Clone, Copy)]
pub struct CascadeConfig {
    /// Task switches before the run is declared runaway. The hardware analog
    /// is the reset button: a cascade has no other way to be stopped.
    pub max_task_switches: u64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            max_task_switches: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Uninit,
    Ready,
    Running,
    Exited,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{op} is not legal while the machine is {state:?}")]
    WrongState {
        op: &'static str,
        state: MachineState,
    },

    #[error("register {0} has not been allocated")]
    BadRegister(u16),

    #[error("instruction slot {0} is out of range")]
    BadSlot(u16),

    #[error("branch target {0} is out of range")]
    BadTarget(u16),

    #[error("slot {0} holds no instruction")]
    EmptySlot(u16),

    #[error("registers and constants must be allocated before the first emit")]
    AllocAfterEmit,

    #[error("user registers must be allocated before constants")]
    RegisterAfterConstant,

    #[error("program is already finalised")]
    AlreadyFinalised,

    #[error("launch requires a finalised program")]
    NotFinalised,

    #[error("register value {0:#x} does not fit the 30-bit ESP encoding")]
    ValueTooLarge(u32),

    #[error("out of {0}")]
    CapacityExceeded(&'static str),

    #[error(transparent)]
    Unrecoverable(#[from] CascadeFault),
}

/// What a completed run looked like from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub task_switches: u64,
}

pub struct WeirdMachine {
    ram: PageRam,
    hart: Hart,
    config: CascadeConfig,
    state: MachineState,
    user_regs: u16,
    const_regs: u16,
    slots: Vec<Option<MovDbz>>,
    emitted: u16,
    finalised: bool,
}

impl WeirdMachine {
    pub fn new(config: CascadeConfig) -> Self {
        Self {
            ram: PageRam::new(RAM_SIZE),
            hart: Hart::default(),
            config,
            state: MachineState::Uninit,
            user_regs: 0,
            const_regs: 0,
            slots: vec![None; MAX_ASM_INSTS],
            emitted: 0,
            finalised: false,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Raw physical memory, for inspection.
    pub fn ram(&self) -> &PageRam {
        &self.ram
    }

    /// Current frame assignment.
    pub fn program_layout(&self) -> ProgramLayout {
        ProgramLayout {
            user_regs: self.user_regs,
            const_regs: self.const_regs,
        }
    }

    /// Bring up paging, the host GDT/TSS, and the table registers.
    pub fn setup(&mut self) -> Result<(), EngineError> {
        self.expect(MachineState::Uninit, "setup")?;

        // Flat identity directory: 4 MiB pages over the low 2 GiB.
        for i in 0..512u32 {
            self.ram.write_u32(
                HOST_PD_ADDRESS + i * 4,
                (i << 22) | PTE_P | PTE_RW | PTE_PS,
            );
        }
        self.hart.mmu.set_cr3(HOST_PD_ADDRESS);
        self.hart.mmu.set_cr4(CR4_PSE);
        self.hart.mmu.set_cr0(CR0_PE | CR0_PG);

        // Host-return TSS. Only CR3 is static; the launch jump saves the
        // live host context into the rest.
        self.ram.zero(HOST_TSS_ADDRESS, tss::SIZE);
        self.ram
            .write_u32(HOST_TSS_ADDRESS + tss::CR3, HOST_PD_ADDRESS);

        // Host GDT at its physical home; per-instruction directories remap
        // the same linear range onto the program's own GDT pages.
        synth::write_gdt_image(&mut self.ram, GDT_ADDRESS, HOST_TSS_ADDRESS);

        self.hart.gdtr = TableReg {
            base: GDT_ADDRESS,
            limit: (GDT_PAGES * PAGE_SIZE - 1) as u16,
        };
        self.hart.idtr = TableReg {
            base: IDT_ADDRESS,
            limit: 0x7FF,
        };

        // Loading TR marks the host descriptor busy.
        self.hart.tr = TaskReg {
            selector: HOST_TSS_SELECTOR,
            base: HOST_TSS_ADDRESS,
        };
        self.ram
            .write_u8(GDT_ADDRESS + HOST_TSS_SELECTOR as u32 + 5, ACCESS_TSS_BUSY);

        self.hart.task = TaskState {
            gpr: {
                let mut gpr = [0u32; 8];
                gpr[GPR_ESP] = HOST_STACK_TOP;
                gpr
            },
            eip: HOST_RESUME_EIP,
            eflags: EFLAGS_RESERVED1,
            segs: [
                KERNEL_DATA_SELECTOR,
                KERNEL_CODE_SELECTOR,
                KERNEL_DATA_SELECTOR,
                KERNEL_DATA_SELECTOR,
                KERNEL_DATA_SELECTOR,
                KERNEL_DATA_SELECTOR,
            ],
            ldt: 0,
        };

        self.state = MachineState::Ready;
        debug!("weird machine ready");
        Ok(())
    }

    /// Allocate the next user register page and initialise it to `value`.
    pub fn alloc_register(&mut self, value: u32) -> Result<RegId, EngineError> {
        self.expect(MachineState::Ready, "alloc_register")?;
        if self.emitted > 0 {
            return Err(EngineError::AllocAfterEmit);
        }
        if self.const_regs > 0 {
            return Err(EngineError::RegisterAfterConstant);
        }
        self.check_value(value)?;
        if self.total_regs() as usize >= MAX_REGISTERS {
            return Err(EngineError::CapacityExceeded("registers"));
        }
        let id = RegId(self.user_regs);
        self.user_regs += 1;
        let page = self.program_layout().reg_page(id);
        write_register_page(&mut self.ram, page, value);
        Ok(id)
    }

    /// Allocate a constant register. Every real instruction decrements its
    /// source once, so pass `k + 1` for consumers to observe `k`.
    pub fn alloc_constant(&mut self, value: u32) -> Result<RegId, EngineError> {
        self.expect(MachineState::Ready, "alloc_constant")?;
        if self.emitted > 0 {
            return Err(EngineError::AllocAfterEmit);
        }
        self.check_value(value)?;
        if self.total_regs() as usize >= MAX_REGISTERS {
            return Err(EngineError::CapacityExceeded("registers"));
        }
        let id = RegId(self.total_regs());
        self.const_regs += 1;
        let page = self.program_layout().reg_page(id);
        write_register_page(&mut self.ram, page, value);
        Ok(id)
    }

    /// Overwrite a register page. Safe only while the cascade is not running.
    pub fn write_register(&mut self, id: RegId, value: u32) -> Result<(), EngineError> {
        self.expect_idle("write_register")?;
        self.check_reg(id)?;
        self.check_value(value)?;
        let page = self.program_layout().reg_page(id);
        write_register_page(&mut self.ram, page, value);
        Ok(())
    }

    pub fn read_register(&self, id: RegId) -> Result<u32, EngineError> {
        if self.state == MachineState::Uninit {
            return Err(EngineError::WrongState {
                op: "read_register",
                state: self.state,
            });
        }
        self.check_reg(id)?;
        Ok(read_register_page(&self.ram, self.program_layout().reg_page(id)))
    }

    /// Record `inst` into `slot` and materialise its three real-instruction
    /// blocks. Freezes register/constant allocation.
    pub fn emit(&mut self, slot: InstIdx, inst: MovDbz) -> Result<(), EngineError> {
        self.expect(MachineState::Ready, "emit")?;
        if self.finalised {
            return Err(EngineError::AlreadyFinalised);
        }
        let layout = self.program_layout();

        if slot.0 as usize >= MAX_ASM_INSTS {
            return Err(EngineError::BadSlot(slot.0));
        }
        if !layout.block_fits(crate::program::RealIdx(slot.0 * 3 + 2)) {
            return Err(EngineError::CapacityExceeded("program region pages"));
        }
        match inst.dst {
            Dst::Reg(id) => self.check_reg(id)?,
            Dst::Discard => {}
        }
        match inst.src {
            Src::Reg(id) => self.check_reg(id)?,
            Src::ConstOne => {}
        }
        for target in [inst.nz, inst.z] {
            if let Target::Inst(t) = target {
                if t.0 as usize >= MAX_ASM_INSTS {
                    return Err(EngineError::BadTarget(t.0));
                }
                if !layout.block_fits(crate::program::RealIdx(t.0 * 3 + 2)) {
                    return Err(EngineError::CapacityExceeded("program region pages"));
                }
            }
        }

        synth::synthesise_movdbz(&mut self.ram, &layout, slot, &inst, self.hart.task.eflags);
        if self.slots[slot.0 as usize].is_none() {
            self.emitted += 1;
        }
        self.slots[slot.0 as usize] = Some(inst);
        Ok(())
    }

    /// Materialise the special registers, the program GDT pages, and the
    /// bootstrap block that lets the first `ljmp` find real instruction 0.
    pub fn finalise(&mut self) -> Result<(), EngineError> {
        self.expect(MachineState::Ready, "finalise")?;
        if self.finalised {
            return Err(EngineError::AlreadyFinalised);
        }
        if self.emitted == 0 || self.slots[0].is_none() {
            return Err(EngineError::EmptySlot(0));
        }

        write_register_page(&mut self.ram, CONST_ONE_PAGE, 1);
        write_register_page(&mut self.ram, DISCARD_PAGE, 0);

        synth::write_gdt_image(
            &mut self.ram,
            crate::layout::GDT_FIRST_PAGE.phys_addr(),
            HOST_TSS_ADDRESS,
        );

        self.write_bootstrap(InstIdx(0));

        self.finalised = true;
        debug!(
            instructions = self.emitted,
            registers = self.user_regs,
            constants = self.const_regs,
            "program finalised"
        );
        Ok(())
    }

    /// Enter the cascade at abstract instruction 0.
    pub fn launch(&mut self) -> Result<RunReport, EngineError> {
        self.expect(MachineState::Ready, "launch")?;
        if !self.finalised {
            return Err(EngineError::NotFinalised);
        }
        debug!("launching cascade");
        self.run(InstIdx(0))
    }

    /// Re-enter the cascade at `slot`'s first real sub-instruction.
    pub fn resume(&mut self, slot: InstIdx) -> Result<RunReport, EngineError> {
        self.expect_idle("resume")?;
        if !self.finalised {
            return Err(EngineError::NotFinalised);
        }
        if slot.0 as usize >= MAX_ASM_INSTS {
            return Err(EngineError::BadSlot(slot.0));
        }
        if self.slots[slot.0 as usize].is_none() {
            return Err(EngineError::EmptySlot(slot.0));
        }
        debug!(slot = slot.0, "resuming cascade");
        self.write_bootstrap(slot);
        self.run(slot)
    }

    /// Rebuild the initial directory so the entry `ljmp` can read the target
    /// instruction's TSS. Every slot's entry real shares rotation slot 0, so
    /// the same two window entries are rewritten each time.
    fn write_bootstrap(&mut self, slot: InstIdx) {
        let layout = self.program_layout();
        synth::write_block_directory(&mut self.ram, INIT_BLOCK);
        synth::map_src_tss(
            &mut self.ram,
            &layout,
            INIT_BLOCK.window_pt(),
            slot.entry(),
            CONST_ONE_PAGE,
        );
    }

    fn run(&mut self, slot: InstIdx) -> Result<RunReport, EngineError> {
        self.state = MachineState::Running;
        self.hart.mmu.set_cr3(INIT_PD_PAGE.phys_addr());

        let entry = rotation_selector(slot.entry().rotation());
        let result = Cascade::new(
            &mut self.hart,
            &mut self.ram,
            HOST_TSS_SELECTOR,
            self.config.max_task_switches,
        )
        .run_from(entry);

        match result {
            Ok(task_switches) => {
                // The faulting entry into the host task left a 4-byte error
                // code on the host stack; pop it, then restore host paging.
                self.hart.task.gpr[GPR_ESP] = self.hart.task.gpr[GPR_ESP].wrapping_add(4);
                self.hart.mmu.set_cr3(HOST_PD_ADDRESS);
                self.state = MachineState::Exited;
                Ok(RunReport { task_switches })
            }
            Err(fault) => {
                self.hart.mmu.set_cr3(HOST_PD_ADDRESS);
                self.state = MachineState::Exited;
                Err(fault.into())
            }
        }
    }

    fn total_regs(&self) -> u16 {
        self.user_regs + self.const_regs
    }

    fn check_reg(&self, id: RegId) -> Result<(), EngineError> {
        if id.0 >= self.total_regs() {
            return Err(EngineError::BadRegister(id.0));
        }
        Ok(())
    }

    fn check_value(&self, value: u32) -> Result<(), EngineError> {
        if value > MAX_REG_VALUE {
            return Err(EngineError::ValueTooLarge(value));
        }
        if value > MAX_DECREMENT_VALUE {
            warn!(
                value,
                "value exceeds the mapped stack window; decrementing it will take the zero edge"
            );
        }
        Ok(())
    }

    fn expect(&self, state: MachineState, op: &'static str) -> Result<(), EngineError> {
        if self.state != state {
            return Err(EngineError::WrongState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    fn expect_idle(&self, op: &'static str) -> Result<(), EngineError> {
        match self.state {
            MachineState::Ready | MachineState::Exited => Ok(()),
            state => Err(EngineError::WrongState { op, state }),
        }
    }
}
