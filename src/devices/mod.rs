//! Virtual interrupt-source hardware.
//!
//! Each device implements [`IoHandler`](crate::io::IoHandler) and/or
//! [`MmioHandler`](crate::memory::mmio::MmioHandler) to respond to guest
//! port I/O and memory-mapped I/O accesses, and implements
//! [`InterruptSource`](crate::interrupts::InterruptSource) so the
//! interrupt engine can poll it for a pending vector.
//!
//! Devices emulated:
//! - [`pic`] — Intel 8259A dual PIC (Programmable Interrupt Controller)
//! - [`ioapic`] — I/O APIC interrupt router
//! - [`lapic`] — Local APIC (per-CPU interrupt front-end and timer)

pub mod ioapic;
pub mod lapic;
pub mod pic;
