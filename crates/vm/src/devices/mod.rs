//! Reference MMIO devices.
//!
//! Enough hardware to boot and observe a guest: a 16550A-style UART, a
//! CLINT driving the timer and software interrupts, and a syscon power
//! register. Heavier device models live outside the execution engine.

pub mod clint;
pub mod syscon;
pub mod uart;

pub use clint::Clint;
pub use syscon::Syscon;
pub use uart::Ns16550;
