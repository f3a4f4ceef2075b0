//! A pure-software x86/x86-64 instruction execution engine.
//!
//! Provides a complete software x86 CPU emulator supporting:
//! - **Real Mode** (16-bit) — BIOS, bootloaders
//! - **Protected Mode** (32-bit) — full segmentation, paging, privilege levels
//! - **Compatibility/Long Mode** (64-bit) — 4-level paging, SYSCALL/SYSRET, R8-R15
//!
//! No hardware virtualization extensions (VT-x/AMD-V) are required — all
//! instruction execution is fully emulated in software.
//!
//! # Architecture
//!
//! The library is organized into these layers:
//! - **Decoder** (`decoder.rs`) — variable-length x86 instruction decoding
//! - **Executor** (`executor/`) — instruction execution grouped by category
//! - **Memory** (`memory/`) — guest RAM, segmentation, paging, MMIO, write observers
//! - **Devices** (`devices/`) — interrupt-source hardware (PIC, IOAPIC, LAPIC)
//! - **CPU** (`cpu.rs`) — ties everything together in the fetch-decode-execute loop
//!
//! # Host integration
//!
//! A host embeds the engine as an ordinary Rust library: construct a
//! [`Runtime`], load guest code into it, register any MMIO/port-I/O
//! devices and RAM write observers it needs, then drive execution with
//! [`Runtime::execute_next`] or the [`Runtime::run`] convenience loop.
//! There is no FFI surface — the host links this crate directly.

#![no_std]

extern crate alloc;

pub mod cpu;
pub mod decoder;
pub mod devices;
pub mod error;
pub mod executor;
pub mod flags;
pub mod fpu_state;
pub mod instruction;
pub mod interrupts;
pub mod io;
pub mod memory;
pub mod registers;
pub mod sse_state;

// ── Public re-exports ──

pub use cpu::{Cpu, ExitReason, Mode, Status};
pub use decoder::CpuMode;
pub use error::{Result, VmError};
pub use flags::OperandSize;
pub use interrupts::{InterruptController, InterruptSource};
pub use io::{IoDispatch, IoHandler};
pub use memory::flat::FlatMemory;
pub use memory::mmio::MmioHandler;
pub use memory::{GuestMemory, Mmu};
pub use registers::{RegisterFile, SegReg};

use alloc::boxed::Box;

/// High-level runtime — convenience wrapper combining all engine components.
///
/// For advanced use cases, the individual components (`Cpu`, `GuestMemory`,
/// `Mmu`, `IoDispatch`, `InterruptController`) can be used directly; this
/// struct exists so hosts that don't need that granularity can drive one
/// value instead of five.
pub struct Runtime {
    /// Virtual CPU state and execution engine.
    pub cpu: Cpu,
    /// Guest physical memory (RAM + MMIO regions + write observers).
    pub memory: GuestMemory,
    /// Memory management unit (segmentation + paging translation).
    pub mmu: Mmu,
    /// Interrupt controller (IDT management, pending interrupt tracking).
    pub interrupts: InterruptController,
    /// Port I/O dispatcher (maps port ranges to device handlers).
    pub io: IoDispatch,
}

impl Runtime {
    /// Create a new runtime with the specified guest RAM size in bytes.
    ///
    /// The CPU starts in real mode at the standard reset vector (CS:IP = F000:FFF0).
    pub fn new(ram_size: usize) -> Self {
        Runtime {
            cpu: Cpu::new(),
            memory: GuestMemory::new(ram_size),
            mmu: Mmu::new(),
            interrupts: InterruptController::new(),
            io: IoDispatch::new(),
        }
    }

    /// Load raw binary data at a guest physical address.
    pub fn load_binary(&mut self, addr: usize, data: &[u8]) {
        self.memory.load_at(addr, data);
    }

    /// Set the instruction pointer directly.
    pub fn set_rip(&mut self, rip: u64) {
        self.cpu.regs.rip = rip;
    }

    /// Run a single fetch-decode-execute step.
    ///
    /// See [`Cpu::execute_next`] for the meaning of each [`Status`] value.
    pub fn execute_next(&mut self) -> Status {
        self.cpu
            .execute_next(&mut self.memory, &mut self.mmu, &mut self.interrupts, &mut self.io)
    }

    /// Run the VM for up to `max_instructions` (0 = unlimited).
    ///
    /// Returns the reason the VM stopped executing.
    pub fn run(&mut self, max_instructions: u64) -> ExitReason {
        self.cpu.run(
            &mut self.memory,
            &mut self.mmu,
            &mut self.interrupts,
            &mut self.io,
            max_instructions,
        )
    }

    /// Request the VM to stop at the next instruction boundary.
    ///
    /// This is safe to call from a signal handler or another thread
    /// (the flag is checked at the top of each instruction cycle).
    pub fn request_stop(&mut self) {
        self.cpu.request_stop();
    }

    /// Reset the VM to power-on state.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.mmu = Mmu::new();
        self.interrupts = InterruptController::new();
        // Memory and I/O handlers are preserved across reset
    }

    /// Register a port I/O handler for a range of ports.
    pub fn register_io(&mut self, base: u16, count: u16, handler: Box<dyn IoHandler>) {
        self.io.register(base, count, handler);
    }

    /// Register a memory-mapped I/O handler.
    pub fn register_mmio(&mut self, base: u64, size: u64, handler: Box<dyn MmioHandler>) {
        self.memory.add_mmio(base, size, handler);
    }

    /// Register a callback invoked whenever a guest write lands in
    /// `[base, base + size)` of plain RAM (e.g. a framebuffer). The
    /// callback runs after the write has committed and cannot fault or
    /// mutate CPU/memory state; device-register MMIO writes never reach
    /// observers.
    pub fn register_observer(
        &mut self,
        base: u64,
        size: u64,
        callback: Box<dyn FnMut(u64, u8, u64)>,
    ) {
        self.memory.register_observer(base, size, callback);
    }

    /// Register an external interrupt source (PIC, Local APIC) polled by
    /// the engine's interrupt cadence.
    pub fn register_interrupt_source(&mut self, source: Box<dyn InterruptSource>) {
        self.interrupts.register_source(source);
    }

    /// Raise an interrupt request for the given vector directly, bypassing
    /// any registered interrupt source. Useful for host-injected events
    /// (e.g. a debugger-requested NMI) that don't come from a device model.
    pub fn raise_interrupt(&mut self, vector: u8) {
        self.interrupts.raise_irq(vector);
    }

    /// Read a model-specific register.
    pub fn read_msr(&self, index: u32) -> u64 {
        self.cpu.regs.read_msr(index)
    }

    /// Write a model-specific register.
    pub fn write_msr(&mut self, index: u32, val: u64) {
        self.cpu.regs.write_msr(index, val);
    }

    /// Get the current instruction count.
    pub fn instruction_count(&self) -> u64 {
        self.cpu.instruction_count
    }

    /// Get the current CPU mode.
    pub fn mode(&self) -> Mode {
        self.cpu.mode
    }
}
