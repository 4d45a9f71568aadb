//! The task-switch executor.
//!
//! Between launch and exit the CPU never retires an instruction: every fetch
//! at the unmapped EIP raises #PF, the IDT routes it through a task gate, and
//! the TSS save/load of the resulting switch is the computation. This module
//! implements exactly the switching semantics the cascade relies on:
//!
//! - the incoming TSS is read through the *outgoing* task's address space
//!   (which is why every directory maps its successors' heads and tails);
//! - a gate switch leaves the old descriptor busy, writes a backlink, and
//!   sets NT; only the direct jump that starts a run clears the old busy bit;
//! - the fault's error code is pushed onto the stack of the task just
//!   entered — the push is the decrement, and a push that strays off the
//!   mapped stack page raises #DF, which routes the zero edge;
//! - a fault while delivering #DF is a triple fault.

use thiserror::Error;
use tracing::{debug, trace};

use faultline_mmu::{AccessType, MemoryBus, Mmu, PageFault};
use faultline_x86::{tss, SegDescriptor, decode_task_gate, ACCESS_TSS_BUSY_BIT, EFLAGS_NT, TSS_LIMIT};

pub const VECTOR_DOUBLE_FAULT: u8 = 8;
pub const VECTOR_PAGE_FAULT: u8 = 14;

/// GDTR/IDTR image.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableReg {
    pub base: u32,
    pub limit: u16,
}

/// Task register: current selector plus its cached base.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskReg {
    pub selector: u16,
    pub base: u32,
}

pub const GPR_ESP: usize = 4;

/// Architecturally visible task state, moved by TSS save/load.
#[derive(Debug, Clone, Default)]
pub struct TaskState {
    /// EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI — TSS save order.
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    /// ES, CS, SS, DS, FS, GS — TSS save order.
    pub segs: [u16; 6],
    pub ldt: u16,
}

/// The register state the cascade mutates.
#[derive(Debug, Default)]
pub struct Hart {
    pub mmu: Mmu,
    pub task: TaskState,
    pub gdtr: TableReg,
    pub idtr: TableReg,
    pub tr: TaskReg,
}

/// Ways a cascade can die. All of these are fatal: on hardware every one of
/// them ends in a reset.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CascadeFault {
    #[error("triple fault after {switches} task switches")]
    TripleFault { switches: u64 },

    #[error("IDT entry for vector {vector} is not a usable task gate")]
    BadGate { vector: u8 },

    #[error("selector {selector:#06x} does not name an available 32-bit TSS")]
    BadTssDescriptor { selector: u16 },

    #[error("target TSS {selector:#06x} is still busy")]
    BusyTarget { selector: u16 },

    #[error("cascade escaped to mapped memory at eip {eip:#010x}")]
    EscapedCascade { eip: u32 },

    #[error("watchdog reset after {limit} task switches")]
    WatchdogReset { limit: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchKind {
    /// Direct `ljmp` to a TSS selector: clears the old descriptor's busy bit.
    Jump,
    /// Through a task gate: old stays busy, backlink + NT are set.
    Gate,
}

enum Flow {
    Continue,
    Exited,
}

pub(crate) struct Cascade<'a, B: MemoryBus> {
    hart: &'a mut Hart,
    bus: &'a mut B,
    exit_selector: u16,
    budget: u64,
    switches: u64,
}

impl<'a, B: MemoryBus> Cascade<'a, B> {
    pub fn new(hart: &'a mut Hart, bus: &'a mut B, exit_selector: u16, budget: u64) -> Self {
        Self {
            hart,
            bus,
            exit_selector,
            budget,
            switches: 0,
        }
    }

    /// Jump into `entry_selector` and run the cascade until a task gate
    /// selects the exit TSS. Returns the number of task switches performed.
    pub fn run_from(mut self, entry_selector: u16) -> Result<u64, CascadeFault> {
        self.switch_tasks(entry_selector, SwitchKind::Jump)?;
        loop {
            if self.switches >= self.budget {
                return Err(CascadeFault::WatchdogReset { limit: self.budget });
            }
            let eip = self.hart.task.eip;
            let fault = match self.hart.mmu.translate(self.bus, eip, AccessType::Execute) {
                // Nothing in a well-formed program maps its EIP; landing on
                // mapped memory means the structures are incoherent.
                Ok(_) => return Err(CascadeFault::EscapedCascade { eip }),
                Err(fault) => fault,
            };
            debug_assert_eq!(fault.addr, eip);
            match self.deliver(VECTOR_PAGE_FAULT, fault.error_code, false)? {
                Flow::Exited => {
                    debug!(switches = self.switches, "cascade reached the exit TSS");
                    return Ok(self.switches);
                }
                Flow::Continue => {}
            }
        }
    }

    /// Deliver a fault through the current IDT. `nested` marks #DF delivery,
    /// where any further fault is terminal.
    fn deliver(&mut self, vector: u8, error_code: u32, nested: bool) -> Result<Flow, CascadeFault> {
        let offset = vector as u32 * 8;
        if offset + 7 > self.hart.idtr.limit as u32 {
            return Err(CascadeFault::BadGate { vector });
        }
        let raw = match self
            .hart
            .mmu
            .read_lin_u64(self.bus, self.hart.idtr.base + offset)
        {
            Ok(raw) => raw,
            Err(_) if nested => return Err(self.triple()),
            Err(_) => return self.deliver(VECTOR_DOUBLE_FAULT, 0, true),
        };
        let selector = decode_task_gate(raw).ok_or(CascadeFault::BadGate { vector })?;

        self.switch_tasks(selector, SwitchKind::Gate)?;
        let exited = selector == self.exit_selector;

        // The error code lands on the stack of the task just entered. This
        // push is the machine's only arithmetic.
        match self.push_error_code(error_code) {
            Ok(()) => Ok(if exited { Flow::Exited } else { Flow::Continue }),
            Err(_) if nested || exited => Err(self.triple()),
            Err(_) => self.deliver(VECTOR_DOUBLE_FAULT, 0, true),
        }
    }

    fn switch_tasks(&mut self, selector: u16, kind: SwitchKind) -> Result<(), CascadeFault> {
        let target = self.read_tss_descriptor(selector)?;

        // Save the outgoing task through its own address space. Under a
        // per-instruction directory the head fields land on the slot's GDT
        // page (EAX/ECX rewrite the descriptor non-busy) and ESP lands in the
        // destination register page.
        self.save_task().map_err(|_| self.triple())?;

        if kind == SwitchKind::Jump {
            self.set_busy(self.hart.tr.selector, false)?;
        }
        self.set_busy(selector, true)?;

        if kind == SwitchKind::Gate {
            // Backlink into the incoming TSS, still through the old address
            // space (under which its head is an ordinary head page).
            let old = self.hart.tr.selector;
            self.hart
                .mmu
                .write_lin_u16(self.bus, target.base + tss::BACKLINK, old)
                .map_err(|_| self.triple())?;
        }

        // The incoming TSS is read through the outgoing task's address space;
        // its tail there is the source register page.
        let (cr3, incoming) = self.load_task(target.base).map_err(|_| self.triple())?;

        self.hart.mmu.set_cr3(cr3);
        self.hart.task = incoming;
        if kind == SwitchKind::Gate {
            self.hart.task.eflags |= EFLAGS_NT;
        }
        self.hart.tr = TaskReg {
            selector,
            base: target.base,
        };
        self.switches += 1;
        trace!(
            selector,
            cr3,
            esp = self.hart.task.gpr[GPR_ESP],
            switches = self.switches,
            "task switch"
        );
        Ok(())
    }

    fn read_tss_descriptor(&mut self, selector: u16) -> Result<SegDescriptor, CascadeFault> {
        let offset = (selector & !0x7) as u32;
        if offset + 7 > self.hart.gdtr.limit as u32 {
            return Err(CascadeFault::BadTssDescriptor { selector });
        }
        let raw = self
            .hart
            .mmu
            .read_lin_u64(self.bus, self.hart.gdtr.base + offset)
            .map_err(|_| self.triple())?;
        let desc = SegDescriptor::decode(raw);
        if desc.is_busy_tss() {
            return Err(CascadeFault::BusyTarget { selector });
        }
        if !desc.is_available_tss() || desc.limit < TSS_LIMIT {
            return Err(CascadeFault::BadTssDescriptor { selector });
        }
        Ok(desc)
    }

    fn set_busy(&mut self, selector: u16, busy: bool) -> Result<(), CascadeFault> {
        let addr = self.hart.gdtr.base + (selector & !0x7) as u32 + 5;
        let access = self
            .hart
            .mmu
            .read_lin_u8(self.bus, addr)
            .map_err(|_| self.triple())?;
        let access = if busy {
            access | ACCESS_TSS_BUSY_BIT
        } else {
            access & !ACCESS_TSS_BUSY_BIT
        };
        self.hart
            .mmu
            .write_lin_u8(self.bus, addr, access)
            .map_err(|_| self.triple())?;
        Ok(())
    }

    fn save_task(&mut self) -> Result<(), PageFault> {
        let base = self.hart.tr.base;
        self.hart
            .mmu
            .write_lin_u32(self.bus, base + tss::EIP, self.hart.task.eip)?;
        self.hart
            .mmu
            .write_lin_u32(self.bus, base + tss::EFLAGS, self.hart.task.eflags)?;
        for i in 0..8 {
            let value = self.hart.task.gpr[i];
            self.hart
                .mmu
                .write_lin_u32(self.bus, base + tss::GPR_BASE + i as u32 * 4, value)?;
        }
        for i in 0..6 {
            let value = self.hart.task.segs[i];
            self.hart
                .mmu
                .write_lin_u16(self.bus, base + tss::SEG_BASE + i as u32 * 4, value)?;
        }
        Ok(())
    }

    fn load_task(&mut self, base: u32) -> Result<(u32, TaskState), PageFault> {
        let cr3 = self.hart.mmu.read_lin_u32(self.bus, base + tss::CR3)?;
        let mut task = TaskState {
            eip: self.hart.mmu.read_lin_u32(self.bus, base + tss::EIP)?,
            eflags: self.hart.mmu.read_lin_u32(self.bus, base + tss::EFLAGS)?,
            ..TaskState::default()
        };
        for i in 0..8 {
            task.gpr[i] = self
                .hart
                .mmu
                .read_lin_u32(self.bus, base + tss::GPR_BASE + i as u32 * 4)?;
        }
        for i in 0..6 {
            task.segs[i] = self
                .hart
                .mmu
                .read_lin_u16(self.bus, base + tss::SEG_BASE + i as u32 * 4)?;
        }
        task.ldt = self.hart.mmu.read_lin_u16(self.bus, base + tss::LDT)?;
        Ok((cr3, task))
    }

    /// Push the 4-byte error code onto the current (flat) stack. ESP only
    /// commits if the write translates; a faulting push leaves it untouched.
    fn push_error_code(&mut self, code: u32) -> Result<(), PageFault> {
        let esp = self.hart.task.gpr[GPR_ESP].wrapping_sub(4);
        self.hart.mmu.write_lin_u32(self.bus, esp, code)?;
        self.hart.task.gpr[GPR_ESP] = esp;
        Ok(())
    }

    fn triple(&self) -> CascadeFault {
        CascadeFault::TripleFault {
            switches: self.switches,
        }
    }
}
