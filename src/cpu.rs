//! CPU emulation core — state management and execution loop.
//!
//! The `Cpu` struct holds all architectural state (registers, FPU, SSE)
//! and implements the fetch-decode-execute cycle. The execution loop
//! catches instruction errors and routes them to the guest's IDT as
//! hardware exceptions.

use crate::decoder::{CpuMode, Decoder};
use crate::error::{Result, VmError};
use crate::fpu_state::FpuState;
use crate::interrupts::InterruptController;
use crate::io::IoDispatch;
use crate::memory::{AccessType, GuestMemory, MemoryBus, Mmu};
use crate::registers::SegmentDescriptor;
use crate::registers::{
    RegisterFile, SegReg, CR0_PE, CR0_PG, EFER_LMA, EFER_LME, MSR_EFER,
};
use crate::sse_state::SseState;

/// CPU execution mode.
///
/// `Compatibility` and `LongMode` are the two IA-32e sub-modes (Intel SDM
/// Vol. 3A §2.2.1): both run with EFER.LMA=1 and a 64-bit IDT/TSS, but
/// `Compatibility` has a 32-bit code segment (CS.L=0) and decodes with
/// legacy 32-bit defaults, while `LongMode` has CS.L=1. Gate format and
/// privilege/segmentation rules track `LongMode`; operand/address-size
/// defaults track `ProtectedMode`. Kept as flat peers rather than nesting
/// `Compatibility` inside `LongMode` since most call sites care about one
/// axis or the other, not both at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 16-bit real mode.
    RealMode,
    /// 32-bit protected mode.
    ProtectedMode,
    /// IA-32e compatibility mode: EFER.LMA=1, CS.L=0.
    Compatibility,
    /// 64-bit long mode: EFER.LMA=1, CS.L=1.
    LongMode,
}

/// Reason the CPU stopped executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// HLT instruction executed.
    Halted,
    /// Unhandled exception (double/triple fault or non-exception error).
    Exception(VmError),
    /// Maximum instruction count reached.
    InstructionLimit,
    /// Breakpoint (INT 3 or hardware debug breakpoint).
    Breakpoint,
    /// External stop request via `request_stop()`.
    StopRequested,
    /// `ZERO_OPCODE_RUNAWAY_LIMIT` consecutive zeroed-out opcodes were
    /// decoded in a row — almost always a sign execution ran off into
    /// unmapped or uninitialized memory rather than legitimate code.
    Runaway,
}

/// The outcome of a single [`Cpu::execute_next`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// An instruction retired normally; keep calling `execute_next`.
    Success,
    /// No instruction retired this step (a fault was injected into the
    /// guest, or an interrupt was delivered) but the CPU is still
    /// runnable; keep calling `execute_next`.
    Continue,
    /// HLT executed; the CPU is idle until the next unmasked interrupt.
    Halt,
    /// The run loop should stop and surface this reason to the host.
    Exit(ExitReason),
}

/// Consecutive all-zero-opcode instructions before `execute_next` reports
/// [`ExitReason::Runaway`].
const ZERO_OPCODE_RUNAWAY_LIMIT: u32 = 255;

/// Virtual x86 CPU.
pub struct Cpu {
    /// CPU registers (GPR, segment, control, MSR, etc.).
    pub regs: RegisterFile,
    /// x87 FPU state.
    pub fpu: FpuState,
    /// SSE register state.
    pub sse: SseState,
    /// Instruction decoder.
    pub decoder: Decoder,
    /// Current CPU mode.
    pub mode: Mode,
    /// Number of instructions executed since last reset.
    pub instruction_count: u64,
    /// If true, stop at the next instruction boundary.
    stop_requested: bool,
    /// A20 gate enabled (address line 20 masking for real-mode compat).
    pub a20_enabled: bool,
    /// RIP at the start of the last successfully decoded instruction.
    pub last_exec_rip: u64,
    /// CS selector at the start of the last decoded instruction.
    pub last_exec_cs: u16,
    /// Opcode of the last decoded instruction (for diagnostics).
    pub last_opcode: u16,
    /// Physical address of the last decoded instruction.
    pub last_fetch_addr: u64,
    /// Count of consecutive all-zero-byte opcodes decoded, for runaway
    /// detection (see [`ExitReason::Runaway`]).
    zero_opcode_run: u32,
    /// Set by a REP-prefixed string handler that processed one element but
    /// left the counter nonzero; RIP is left pointing at the same
    /// instruction so the next `execute_next` call resumes it. Cleared
    /// before every dispatch.
    pub(crate) rep_in_progress: bool,
}

impl Cpu {
    /// Create a new CPU in real mode with power-on reset defaults.
    pub fn new() -> Self {
        Cpu {
            regs: RegisterFile::new(),
            fpu: FpuState::new(),
            sse: SseState::new(),
            decoder: Decoder::new(CpuMode::Real16),
            mode: Mode::RealMode,
            instruction_count: 0,
            stop_requested: false,
            a20_enabled: true,
            last_exec_rip: 0,
            last_exec_cs: 0,
            last_opcode: 0,
            last_fetch_addr: 0,
            zero_opcode_run: 0,
            rep_in_progress: false,
        }
    }

    /// Reset the CPU to power-on state.
    pub fn reset(&mut self) {
        self.regs = RegisterFile::new();
        self.fpu = FpuState::new();
        self.sse = SseState::new();
        self.mode = Mode::RealMode;
        self.decoder.set_mode(CpuMode::Real16);
        self.instruction_count = 0;
        self.stop_requested = false;
        self.last_exec_rip = 0;
        self.last_exec_cs = 0;
        self.last_opcode = 0;
        self.last_fetch_addr = 0;
        self.zero_opcode_run = 0;
        self.rep_in_progress = false;
    }

    /// Request the CPU to stop at the next instruction boundary.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Derive the correct `CpuMode` from current control register state.
    fn compute_mode(&self) -> CpuMode {
        let pe = self.regs.cr0 & CR0_PE != 0;
        let pg = self.regs.cr0 & CR0_PG != 0;
        let efer = self.regs.read_msr(MSR_EFER);
        let lma = efer & EFER_LMA != 0;
        let cs_long = self.regs.seg[SegReg::Cs as usize].long_mode;
        let cs_big = self.regs.seg[SegReg::Cs as usize].big;

        if pe && pg && lma && cs_long {
            CpuMode::Long64
        } else if pe && cs_big {
            // 32-bit protected mode: CS.D=1 → default 32-bit operand/address
            CpuMode::Protected32
        } else if pe {
            // 16-bit protected mode: CS.D=0 → default 16-bit operand/address
            // (e.g., immediately after MOV CR0 enables PE, before far JMP
            // loads a 32-bit CS descriptor)
            CpuMode::Real16
        } else {
            CpuMode::Real16
        }
    }

    /// Update the CPU mode after a control register, EFER, or CS change.
    ///
    /// Also handles the automatic setting of EFER.LMA when CR0.PG is
    /// enabled with EFER.LME set (and vice versa).
    pub fn update_mode(&mut self) {
        // EFER.LMA is automatically set/cleared based on CR0.PG + EFER.LME
        let efer = self.regs.read_msr(MSR_EFER);
        let pg = self.regs.cr0 & CR0_PG != 0;
        let lme = efer & EFER_LME != 0;
        if pg && lme {
            self.regs.write_msr(MSR_EFER, efer | EFER_LMA);
        } else {
            self.regs.write_msr(MSR_EFER, efer & !EFER_LMA);
        }

        let new_mode = self.compute_mode();
        self.decoder.set_mode(new_mode);

        // The CPU mode (for segment lookups, privilege checks, etc.) is
        // determined by CR0.PE and EFER.LMA, independent of the CS.D bit.
        // CS.D only affects the decoder's default operand/address size.
        let pe = self.regs.cr0 & CR0_PE != 0;
        let lma = self.regs.read_msr(MSR_EFER) & EFER_LMA != 0;
        let cs_long = self.regs.seg[SegReg::Cs as usize].long_mode;
        self.mode = if pe && pg && lma && cs_long {
            Mode::LongMode
        } else if pe && pg && lma {
            Mode::Compatibility
        } else if pe {
            Mode::ProtectedMode
        } else {
            Mode::RealMode
        };

        // MMU state is synced by the caller (execute_next updates Mmu from CR0/CR3/EFER)
    }

    /// Read a segment descriptor from the GDT given a selector.
    ///
    /// Performs bounds checking against the GDTR limit and translates
    /// the GDT base address through paging if enabled.
    ///
    /// # Errors
    ///
    /// Returns `VmError::GeneralProtection` if the selector index exceeds
    /// the GDT limit or if the memory read fails.
    pub fn read_gdt_descriptor(
        &self,
        selector: u16,
        memory: &GuestMemory,
        mmu: &Mmu,
    ) -> Result<SegmentDescriptor> {
        let index = (selector & 0xFFF8) as u64;
        if index + 7 > self.regs.gdtr.limit as u64 {
            return Err(VmError::GeneralProtection(selector as u32 & 0xFFFC));
        }
        let addr = self.regs.gdtr.base.wrapping_add(index);
        let phys = mmu.translate_linear(
            addr,
            self.regs.cr3,
            AccessType::Read,
            self.regs.cpl,
            memory,
        )?;
        let raw = memory.read_u64(phys)?;
        Ok(SegmentDescriptor::from_raw(selector, raw))
    }

    /// Load a segment register by reading its descriptor from the GDT.
    ///
    /// For null selectors (index 0), loads a null descriptor. Null selectors
    /// are allowed for DS, ES, FS, GS but not for CS or SS.
    pub fn load_segment_from_gdt(
        &mut self,
        seg: SegReg,
        selector: u16,
        memory: &GuestMemory,
        mmu: &Mmu,
    ) -> Result<()> {
        if (selector & 0xFFFC) == 0 {
            // Null selector — allowed for data segments, not CS/SS.
            if matches!(seg, SegReg::Cs | SegReg::Ss) {
                return Err(VmError::GeneralProtection(0));
            }
            let desc = &mut self.regs.seg[seg as usize];
            desc.selector = selector;
            desc.base = 0;
            desc.limit = 0;
            desc.present = false;
            desc.is_code = false;
            desc.readable = false;
            desc.writable = false;
            return Ok(());
        }
        // LDT selectors (TI=1) not supported — use GDT regardless.
        let desc = self.read_gdt_descriptor(selector, memory, mmu)?;
        self.regs.seg[seg as usize] = desc;
        Ok(())
    }

    /// Get the stack operand size for the current mode.
    pub fn stack_size(&self) -> crate::flags::OperandSize {
        match self.mode {
            Mode::LongMode => crate::flags::OperandSize::Qword,
            Mode::ProtectedMode | Mode::Compatibility => {
                if self.regs.seg[SegReg::Ss as usize].big {
                    crate::flags::OperandSize::Dword
                } else {
                    crate::flags::OperandSize::Word
                }
            }
            Mode::RealMode => crate::flags::OperandSize::Word,
        }
    }

    /// Run one fetch-decode-execute step and report what happened.
    ///
    /// This is the engine's fundamental unit of progress: a host drives
    /// the guest by calling this in a loop and reacting to `Status::Exit`.
    /// Most steps retire exactly one instruction (`Status::Success`), but
    /// a step can also resolve to delivering a pending interrupt or
    /// injecting a fault into the guest IDT without retiring an
    /// instruction at all (`Status::Continue`) — the caller should simply
    /// call again immediately in that case.
    pub fn execute_next(
        &mut self,
        memory: &mut GuestMemory,
        mmu: &mut Mmu,
        interrupts: &mut InterruptController,
        io: &mut IoDispatch,
    ) -> Status {
        if self.stop_requested {
            self.stop_requested = false;
            return Status::Exit(ExitReason::StopRequested);
        }

        // Sync MMU state from control registers
        mmu.update_from_regs(self.regs.cr0, self.regs.cr4, self.regs.read_msr(MSR_EFER));

        // Interrupt sources (PIC/LAPIC) are polled on their own cadence
        // rather than every instruction.
        interrupts.tick();

        // Check pending interrupts (only if IF=1 and no interrupt shadow)
        if let Some(vector) = interrupts.pending_interrupt(self.regs.rflags) {
            interrupts.acknowledge(vector);
            if let Err(e) = self.deliver_interrupt(vector, false, None, memory, mmu, interrupts) {
                return Status::Exit(ExitReason::Exception(e));
            }
            interrupts.interrupt_shadow = false;
            return Status::Continue;
        }

        // Clear interrupt shadow for the next instruction
        interrupts.interrupt_shadow = false;

        // Compute the linear address of the instruction
        let cs = &self.regs.seg[SegReg::Cs as usize];
        let fetch_addr = cs.base.wrapping_add(self.regs.rip);

        // Apply A20 gate masking
        let fetch_addr = if !self.a20_enabled {
            fetch_addr & !0x10_0000 // Clear bit 20
        } else {
            fetch_addr
        };

        // Translate through paging if enabled
        let phys_addr = match mmu.translate_linear(
            fetch_addr,
            self.regs.cr3,
            AccessType::Execute,
            self.regs.cpl,
            &*memory,
        ) {
            Ok(addr) => addr,
            Err(e) => {
                return match self.inject_exception_from_error(&e, memory, mmu, interrupts) {
                    Ok(()) => Status::Continue,
                    Err(e2) => Status::Exit(ExitReason::Exception(e2)),
                };
            }
        };

        // Save trace info for diagnostics before decode/execute.
        self.last_exec_rip = self.regs.rip;
        self.last_exec_cs = self.regs.seg[SegReg::Cs as usize].selector;
        self.last_fetch_addr = phys_addr;

        // Fetch & decode — use physical address for flat memory read.
        // Note: for simplicity, we decode from physical memory directly;
        // page-crossing instruction fetches are not split across pages.
        let inst = match self.decoder.decode(&*memory, phys_addr) {
            Ok(inst) => inst,
            Err(VmError::FetchFault(_addr)) => {
                let pf = VmError::PageFault {
                    address: fetch_addr,
                    error_code: 0x10, // instruction fetch
                };
                return match self.inject_exception_from_error(&pf, memory, mmu, interrupts) {
                    Ok(()) => Status::Continue,
                    Err(e2) => Status::Exit(ExitReason::Exception(e2)),
                };
            }
            Err(ref _decode_err) => {
                use crate::memory::MemoryBus;
                let b0 = memory.read_u8(phys_addr).unwrap_or(0xFF);
                log::warn!(
                    "#UD at {:04X}:{:#x} phys={:#x} byte={:#04x}",
                    self.regs.seg[SegReg::Cs as usize].selector,
                    self.regs.rip,
                    phys_addr,
                    b0,
                );
                let ud = VmError::UndefinedOpcode(b0);
                return match self.inject_exception_from_error(&ud, memory, mmu, interrupts) {
                    Ok(()) => Status::Continue,
                    Err(e2) => Status::Exit(ExitReason::Exception(e2)),
                };
            }
        };

        self.last_opcode = inst.opcode;

        // A run of all-zero-byte opcodes almost always means execution
        // wandered into unmapped or never-initialized memory.
        if inst.opcode == 0x00 {
            self.zero_opcode_run += 1;
            if self.zero_opcode_run >= ZERO_OPCODE_RUNAWAY_LIMIT {
                return Status::Exit(ExitReason::Runaway);
            }
        } else {
            self.zero_opcode_run = 0;
        }

        // Execute the decoded instruction. A REP-prefixed string handler
        // that still has elements left sets `rep_in_progress` and leaves
        // RIP unmoved; the instruction hasn't retired yet, so the step is
        // reported as CONTINUE rather than SUCCESS and the interrupt/
        // stop-request checks above run again before the next element.
        self.rep_in_progress = false;
        match crate::executor::execute(self, &inst, memory, mmu, io, interrupts) {
            Ok(()) if self.rep_in_progress => Status::Continue,
            Ok(()) => {
                self.instruction_count += 1;
                Status::Success
            }
            Err(VmError::Halted) => {
                self.instruction_count += 1;
                Status::Halt
            }
            Err(VmError::Breakpoint) => {
                self.instruction_count += 1;
                Status::Exit(ExitReason::Breakpoint)
            }
            Err(ref e) => {
                log::debug!(
                    "exec error at {:04X}:{:#x} phys={:#x} opcode={:#06x}: {:?}",
                    self.regs.seg[SegReg::Cs as usize].selector,
                    self.last_exec_rip,
                    phys_addr,
                    inst.opcode,
                    e,
                );
                match self.inject_exception_from_error(e, memory, mmu, interrupts) {
                    Ok(()) => Status::Continue,
                    Err(e2) => Status::Exit(ExitReason::Exception(e2)),
                }
            }
        }
    }

    /// Execute instructions until an exit condition is reached.
    ///
    /// Convenience wrapper around [`Cpu::execute_next`] for hosts that
    /// just want to run to completion (or to an instruction limit)
    /// without handling each step themselves.
    ///
    /// # Arguments
    /// * `memory` — Guest physical memory
    /// * `mmu` — Memory management unit (segmentation + paging)
    /// * `interrupts` — Interrupt controller
    /// * `io` — Port I/O dispatcher
    /// * `max_instructions` — Stop after this many instructions (0 = unlimited)
    pub fn run(
        &mut self,
        memory: &mut GuestMemory,
        mmu: &mut Mmu,
        interrupts: &mut InterruptController,
        io: &mut IoDispatch,
        max_instructions: u64,
    ) -> ExitReason {
        loop {
            if max_instructions > 0 && self.instruction_count >= max_instructions {
                return ExitReason::InstructionLimit;
            }
            match self.execute_next(memory, mmu, interrupts, io) {
                Status::Success | Status::Continue => continue,
                Status::Halt => return ExitReason::Halted,
                Status::Exit(reason) => return reason,
            }
        }
    }

    /// Inject an exception derived from a VmError into the guest.
    fn inject_exception_from_error(
        &mut self,
        error: &VmError,
        memory: &mut GuestMemory,
        mmu: &mut Mmu,
        interrupts: &mut InterruptController,
    ) -> Result<()> {
        let (vector, error_code, cr2_val) = match error {
            VmError::DivideByZero => (0, None, None),
            VmError::DebugException => (1, None, None),
            VmError::Breakpoint => (3, None, None),
            VmError::Overflow => (4, None, None),
            VmError::BoundRange => (5, None, None),
            VmError::UndefinedOpcode(_) => (6, None, None),
            VmError::DoubleFault => (8, Some(0u32), None),
            VmError::InvalidTss(ec) => (10, Some(*ec), None),
            VmError::SegmentNotPresent(ec) => (11, Some(*ec), None),
            VmError::StackFault(ec) => (12, Some(*ec), None),
            VmError::GeneralProtection(ec) => (13, Some(*ec), None),
            VmError::PageFault {
                address,
                error_code,
            } => (14, Some(*error_code), Some(*address)),
            VmError::FpuError => (16, None, None),
            VmError::AlignmentCheck => (17, Some(0u32), None),
            VmError::SimdException => (19, None, None),
            // Non-exception errors cannot be injected
            _ => return Err(*error),
        };

        if let Some(addr) = cr2_val {
            self.regs.cr2 = addr;
        }

        // Double fault detection
        if interrupts.handling_exception {
            interrupts.handling_exception = false;
            return Err(VmError::DoubleFault);
        }
        interrupts.handling_exception = true;

        let result = self.deliver_interrupt(
            vector,
            error_code.is_some(),
            error_code,
            memory,
            mmu,
            interrupts,
        );

        interrupts.handling_exception = false;
        result
    }

    /// Deliver an interrupt or exception to the guest CPU.
    ///
    /// Pushes the appropriate stack frame (flags, CS, IP/EIP/RIP, optional
    /// error code) and loads the handler address from the IVT/IDT.
    pub fn deliver_interrupt(
        &mut self,
        vector: u8,
        has_error_code: bool,
        error_code: Option<u32>,
        memory: &mut GuestMemory,
        mmu: &mut Mmu,
        interrupts: &mut InterruptController,
    ) -> Result<()> {
        match self.mode {
            Mode::RealMode => {
                self.deliver_interrupt_real(vector, memory, mmu)
            }
            Mode::ProtectedMode => {
                self.deliver_interrupt_protected(
                    vector,
                    has_error_code,
                    error_code,
                    memory,
                    mmu,
                    interrupts,
                )
            }
            // Compatibility mode still runs under a 64-bit IDT/TSS (Intel
            // SDM Vol. 3A §6.14.1): gate format and privilege handling
            // follow long mode regardless of CS.L in the interrupted code.
            Mode::LongMode | Mode::Compatibility => {
                self.deliver_interrupt_long(
                    vector,
                    has_error_code,
                    error_code,
                    memory,
                    mmu,
                    interrupts,
                )
            }
        }
    }

    /// Real-mode interrupt delivery: push FLAGS, CS, IP; load from IVT.
    fn deliver_interrupt_real(
        &mut self,
        vector: u8,
        memory: &mut GuestMemory,
        _mmu: &mut Mmu,
    ) -> Result<()> {
        use crate::flags::{IF, TF};
        use crate::memory::MemoryBus;

        // Read IVT entry: 4 bytes at vector * 4
        let ivt_addr = (vector as u64) * 4;
        let offset = memory.read_u16(ivt_addr)? as u64;
        let segment = memory.read_u16(ivt_addr + 2)?;

        // Push FLAGS (16-bit)
        let flags16 = (self.regs.rflags & 0xFFFF) as u16;
        let sp = self.regs.sp().wrapping_sub(2) & 0xFFFF;
        self.regs.set_sp(sp);
        let ss_base = self.regs.seg[SegReg::Ss as usize].base;
        memory.write_u16(ss_base + sp, flags16)?;

        // Push CS
        let cs_sel = self.regs.seg[SegReg::Cs as usize].selector;
        let sp = self.regs.sp().wrapping_sub(2) & 0xFFFF;
        self.regs.set_sp(sp);
        memory.write_u16(ss_base + sp, cs_sel)?;

        // Push IP
        let ip = (self.regs.rip & 0xFFFF) as u16;
        let sp = self.regs.sp().wrapping_sub(2) & 0xFFFF;
        self.regs.set_sp(sp);
        memory.write_u16(ss_base + sp, ip)?;

        // Clear IF and TF
        self.regs.rflags &= !(IF | TF);

        // Load new CS:IP
        self.regs.load_segment_real(SegReg::Cs, segment);
        self.regs.rip = offset;

        Ok(())
    }

    /// Protected-mode interrupt delivery via 32-bit IDT gate.
    fn deliver_interrupt_protected(
        &mut self,
        vector: u8,
        has_error_code: bool,
        error_code: Option<u32>,
        memory: &mut GuestMemory,
        mmu: &mut Mmu,
        interrupts: &mut InterruptController,
    ) -> Result<()> {
        use crate::flags::{IF, TF};

        let entry = interrupts.read_idt_entry_protected(
            vector,
            self.regs.idtr.base,
            self.regs.idtr.limit,
            &*memory,
        )?;

        if !entry.present {
            return Err(VmError::GeneralProtection((vector as u32) * 8 + 2));
        }

        // Save old state
        let old_eflags = self.regs.rflags as u32;
        let old_cs = self.regs.seg[SegReg::Cs as usize].selector;
        let old_eip = self.regs.rip as u32;

        // TODO: Privilege level transition (load new SS:ESP from TSS)
        // For now, assume same privilege level

        let ss_base = self.regs.seg[SegReg::Ss as usize].base;

        // Push EFLAGS
        let esp = self.regs.sp().wrapping_sub(4);
        self.regs.set_sp(esp);
        let phys = mmu.translate_linear(ss_base + esp, self.regs.cr3, AccessType::Write, self.regs.cpl, &*memory)?;
        memory.write_u32(phys, old_eflags)?;

        // Push CS
        let esp = self.regs.sp().wrapping_sub(4);
        self.regs.set_sp(esp);
        let phys = mmu.translate_linear(ss_base + esp, self.regs.cr3, AccessType::Write, self.regs.cpl, &*memory)?;
        memory.write_u32(phys, old_cs as u32)?;

        // Push EIP
        let esp = self.regs.sp().wrapping_sub(4);
        self.regs.set_sp(esp);
        let phys = mmu.translate_linear(ss_base + esp, self.regs.cr3, AccessType::Write, self.regs.cpl, &*memory)?;
        memory.write_u32(phys, old_eip)?;

        // Push error code if applicable
        if has_error_code {
            let ec = error_code.unwrap_or(0);
            let esp = self.regs.sp().wrapping_sub(4);
            self.regs.set_sp(esp);
            let phys = mmu.translate_linear(ss_base + esp, self.regs.cr3, AccessType::Write, self.regs.cpl, &*memory)?;
            memory.write_u32(phys, ec)?;
        }

        // Clear IF for interrupt gates (not trap gates)
        match entry.gate_type {
            crate::interrupts::GateType::Interrupt32 | crate::interrupts::GateType::Interrupt16 => {
                self.regs.rflags &= !IF;
            }
            _ => {}
        }
        // Clear TF
        self.regs.rflags &= !TF;

        // Load handler CS from GDT.
        self.load_segment_from_gdt(SegReg::Cs, entry.selector, &*memory, mmu)?;
        self.update_mode();
        self.regs.rip = entry.offset;
        self.regs.cpl = 0; // Handler runs in ring 0

        Ok(())
    }

    /// Long-mode interrupt delivery via 64-bit IDT gate.
    fn deliver_interrupt_long(
        &mut self,
        vector: u8,
        has_error_code: bool,
        error_code: Option<u32>,
        memory: &mut GuestMemory,
        mmu: &mut Mmu,
        interrupts: &mut InterruptController,
    ) -> Result<()> {
        use crate::flags::IF;
        use crate::flags::TF;

        let entry = interrupts.read_idt_entry_long(
            vector,
            self.regs.idtr.base,
            self.regs.idtr.limit,
            &*memory,
        )?;

        if !entry.present {
            return Err(VmError::GeneralProtection((vector as u32) * 16 + 2));
        }

        // Save old state
        let old_rflags = self.regs.rflags;
        let old_cs = self.regs.seg[SegReg::Cs as usize].selector;
        let old_rip = self.regs.rip;
        let old_rsp = self.regs.sp();
        let old_ss = self.regs.seg[SegReg::Ss as usize].selector;

        // In long mode, the stack is always 64-bit
        // TODO: IST stack switching, privilege level transition

        // Push SS
        let rsp = self.regs.sp().wrapping_sub(8);
        self.regs.set_sp(rsp);
        let phys = mmu.translate_linear(rsp, self.regs.cr3, AccessType::Write, self.regs.cpl, &*memory)?;
        memory.write_u64(phys, old_ss as u64)?;

        // Push old RSP
        let rsp = self.regs.sp().wrapping_sub(8);
        self.regs.set_sp(rsp);
        let phys = mmu.translate_linear(rsp, self.regs.cr3, AccessType::Write, self.regs.cpl, &*memory)?;
        memory.write_u64(phys, old_rsp)?;

        // Push RFLAGS
        let rsp = self.regs.sp().wrapping_sub(8);
        self.regs.set_sp(rsp);
        let phys = mmu.translate_linear(rsp, self.regs.cr3, AccessType::Write, self.regs.cpl, &*memory)?;
        memory.write_u64(phys, old_rflags)?;

        // Push CS
        let rsp = self.regs.sp().wrapping_sub(8);
        self.regs.set_sp(rsp);
        let phys = mmu.translate_linear(rsp, self.regs.cr3, AccessType::Write, self.regs.cpl, &*memory)?;
        memory.write_u64(phys, old_cs as u64)?;

        // Push RIP
        let rsp = self.regs.sp().wrapping_sub(8);
        self.regs.set_sp(rsp);
        let phys = mmu.translate_linear(rsp, self.regs.cr3, AccessType::Write, self.regs.cpl, &*memory)?;
        memory.write_u64(phys, old_rip)?;

        // Push error code if applicable
        if has_error_code {
            let ec = error_code.unwrap_or(0);
            let rsp = self.regs.sp().wrapping_sub(8);
            self.regs.set_sp(rsp);
            let phys = mmu.translate_linear(rsp, self.regs.cr3, AccessType::Write, self.regs.cpl, &*memory)?;
            memory.write_u64(phys, ec as u64)?;
        }

        // Clear IF for interrupt gates
        match entry.gate_type {
            crate::interrupts::GateType::Interrupt64 => {
                self.regs.rflags &= !IF;
            }
            _ => {}
        }
        // Clear TF
        self.regs.rflags &= !TF;

        // Load handler CS from GDT.
        self.load_segment_from_gdt(SegReg::Cs, entry.selector, &*memory, mmu)?;
        self.update_mode();
        self.regs.rip = entry.offset;
        self.regs.cpl = 0;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoDispatch;

    fn harness(code: &[u8]) -> (Cpu, GuestMemory, Mmu, InterruptController, IoDispatch) {
        let mut cpu = Cpu::new();
        cpu.regs.load_segment_real(SegReg::Cs, 0);
        cpu.regs.rip = 0;
        let mut memory = GuestMemory::new(0x10000);
        memory.load_at(0, code);
        (cpu, memory, Mmu::new(), InterruptController::new(), IoDispatch::new())
    }

    #[test]
    fn xor_eax_eax_clears_register_and_sets_zf() {
        // 31 C0: XOR EAX, EAX
        let (mut cpu, mut mem, mut mmu, mut irq, mut io) = harness(&[0x31, 0xC0]);
        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Success));
        assert_eq!(cpu.regs.gpr[0], 0);
        assert_ne!(cpu.regs.rflags & crate::flags::ZF, 0);
        assert_eq!(cpu.regs.rflags & crate::flags::CF, 0);
        assert_eq!(cpu.regs.rflags & crate::flags::OF, 0);
    }

    #[test]
    fn hlt_with_interrupts_disabled_returns_halt_status() {
        // F4: HLT
        let (mut cpu, mut mem, mut mmu, mut irq, mut io) = harness(&[0xF4]);
        cpu.regs.rflags &= !crate::flags::IF;
        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Halt));
    }

    #[test]
    fn runaway_zero_opcodes_exit_after_the_documented_limit() {
        let code = [0u8; ZERO_OPCODE_RUNAWAY_LIMIT as usize + 1];
        let (mut cpu, mut mem, mut mmu, mut irq, mut io) = harness(&code);

        let mut last = Status::Continue;
        for _ in 0..ZERO_OPCODE_RUNAWAY_LIMIT - 1 {
            last = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
            assert!(
                !matches!(last, Status::Exit(ExitReason::Runaway)),
                "must not trip before the documented limit"
            );
        }
        last = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(last, Status::Exit(ExitReason::Runaway)));
    }

    #[test]
    fn rex_w_movsxd_sign_extends_32_to_64() {
        // REX.W MOVSXD RAX, EBX with EBX=0x8000_0000: 48 63 C3
        let (mut cpu, mut mem, mut mmu, mut irq, mut io) = harness(&[0x48, 0x63, 0xC3]);
        cpu.mode = Mode::LongMode;
        cpu.decoder.set_mode(CpuMode::Long64);
        cpu.regs.seg[SegReg::Cs as usize].long_mode = true;
        cpu.regs.gpr[3] = 0x8000_0000; // EBX
        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Success));
        assert_eq!(cpu.regs.gpr[0], 0xFFFF_FFFF_8000_0000);
    }

    #[test]
    fn add_with_overflow_sets_of_and_sf() {
        // 04 01: ADD AL, 0x01 with AL=0x7F -> 0x80 (signed overflow)
        let (mut cpu, mut mem, mut mmu, mut irq, mut io) = harness(&[0x04, 0x01]);
        cpu.regs.gpr[0] = 0x7F;
        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Success));
        assert_eq!(cpu.regs.gpr[0] & 0xFF, 0x80);
        assert_ne!(cpu.regs.rflags & crate::flags::OF, 0);
        assert_ne!(cpu.regs.rflags & crate::flags::SF, 0);
        assert_eq!(cpu.regs.rflags & crate::flags::ZF, 0);
    }

    #[test]
    fn sub_producing_a_borrow_sets_cf() {
        // 2C 01: SUB AL, 0x01 with AL=0x00 -> 0xFF (borrow)
        let (mut cpu, mut mem, mut mmu, mut irq, mut io) = harness(&[0x2C, 0x01]);
        cpu.regs.gpr[0] = 0x00;
        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Success));
        assert_eq!(cpu.regs.gpr[0] & 0xFF, 0xFF);
        assert_ne!(cpu.regs.rflags & crate::flags::CF, 0);
    }

    #[test]
    fn push_then_pop_round_trips_through_the_stack() {
        // 50: PUSH AX, 5B: POP BX
        let (mut cpu, mut mem, mut mmu, mut irq, mut io) = harness(&[0x50, 0x5B]);
        cpu.regs.gpr[0] = 0x1234; // AX
        let original_sp = cpu.regs.sp();

        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Success));
        assert_eq!(cpu.regs.sp(), original_sp.wrapping_sub(2));

        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Success));
        assert_eq!(cpu.regs.gpr[3] & 0xFFFF, 0x1234); // BX
        assert_eq!(cpu.regs.sp(), original_sp);
    }

    #[test]
    fn syscall_masks_rflags_with_ia32_fmask_and_jumps_to_lstar() {
        use crate::registers::{GprIndex, EFER_SCE, MSR_LSTAR, MSR_SFMASK, MSR_STAR};

        // 0F 05: SYSCALL
        let (mut cpu, mut mem, mut mmu, mut irq, mut io) = harness(&[0x0F, 0x05]);
        cpu.mode = Mode::LongMode;
        cpu.decoder.set_mode(CpuMode::Long64);
        cpu.regs.seg[SegReg::Cs as usize].long_mode = true;

        cpu.regs.write_msr(crate::registers::MSR_EFER, EFER_SCE);
        cpu.regs.write_msr(MSR_STAR, 0x0008u64 << 32); // target CS selector = 0x08
        cpu.regs.write_msr(MSR_LSTAR, 0x9000);
        cpu.regs.write_msr(MSR_SFMASK, crate::flags::IF); // IA32_FMASK clears IF

        cpu.regs.rflags = crate::flags::RFLAGS_FIXED | crate::flags::IF | crate::flags::CF;
        let saved_rflags = cpu.regs.rflags;

        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Success));
        assert_eq!(cpu.regs.rip, 0x9000);
        assert_eq!(cpu.regs.gpr[GprIndex::Rcx as usize], 2); // return RIP
        assert_eq!(cpu.regs.gpr[GprIndex::R11 as usize], saved_rflags);
        assert_eq!(cpu.regs.rflags & crate::flags::IF, 0, "IF must be masked by SFMASK");
        assert_ne!(cpu.regs.rflags & crate::flags::CF, 0, "bits outside SFMASK survive");
        assert_ne!(cpu.regs.rflags & crate::flags::RFLAGS_FIXED, 0);
        assert_eq!(cpu.regs.segment(SegReg::Cs).selector, 0x08);
        assert_eq!(cpu.regs.cpl, 0);
    }

    #[test]
    fn rep_movsb_advances_one_element_per_execute_next_call() {
        // F3 A4: REP MOVSB
        let (mut cpu, mut mem, mut mmu, mut irq, mut io) = harness(&[0xF3, 0xA4]);
        mem.write_u8(0x200, 0xAA).unwrap();
        mem.write_u8(0x201, 0xBB).unwrap();
        mem.write_u8(0x202, 0xCC).unwrap();
        cpu.regs.gpr[1] = 3; // RCX
        cpu.regs.gpr[6] = 0x200; // RSI
        cpu.regs.gpr[7] = 0x300; // RDI

        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Continue), "first element must not retire the instruction");
        assert_eq!(cpu.regs.rip, 0, "RIP stays on the REP MOVSB until the count is exhausted");
        assert_eq!(cpu.instruction_count, 0);
        assert_eq!(mem.read_u8(0x300).unwrap(), 0xAA);

        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Continue));
        assert_eq!(mem.read_u8(0x301).unwrap(), 0xBB);

        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Success), "final element retires the instruction");
        assert_eq!(mem.read_u8(0x302).unwrap(), 0xCC);
        assert_eq!(cpu.regs.rip, 2);
        assert_eq!(cpu.instruction_count, 1);
    }

    #[test]
    fn request_stop_is_observed_between_rep_movsb_elements() {
        // F3 A4: REP MOVSB with a large count. A stop request must not
        // have to wait for the whole string operation to finish.
        let (mut cpu, mut mem, mut mmu, mut irq, mut io) = harness(&[0xF3, 0xA4]);
        cpu.regs.gpr[1] = 1000; // RCX
        cpu.regs.gpr[6] = 0x200; // RSI
        cpu.regs.gpr[7] = 0x300; // RDI

        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Continue));

        cpu.request_stop();
        let status = cpu.execute_next(&mut mem, &mut mmu, &mut irq, &mut io);
        assert!(matches!(status, Status::Exit(ExitReason::StopRequested)));
        assert_eq!(cpu.regs.gpr[1], 999, "the in-flight element's decrement is not lost");
    }
}
