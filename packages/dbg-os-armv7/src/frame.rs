//! The register state saved when a breakpoint exception is taken.

use arbitrary_int::u5;
use bitbybit::bitfield;

/// The status of an ARMv7 CPU (CPSR/SPSR).
#[bitfield(u32, default = 0, debug)]
pub struct ProgramStatus {
    /// IRQs are masked.
    #[bit(7, rw)]
    pub irq_masked: bool,
    /// FIQs are masked.
    #[bit(6, rw)]
    pub fiq_masked: bool,
    /// The CPU is executing a 16-bit instruction set (Thumb or ThumbEE).
    #[bit(5, rw)]
    pub thumb: bool,
    /// The processor mode.
    #[bits(0..=4, rw)]
    pub mode: u5,
}

/// The saved state of a program from before a breakpoint exception.
///
/// Updating these fields makes the exception return apply the changes to the CPU.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ExceptionFrame {
    /// The saved program status register from before the exception.
    pub spsr: ProgramStatus,
    /// The stack pointer from before the exception.
    pub stack_pointer: usize,
    /// The link register from before the exception.
    pub link_register: usize,
    /// Which vector the exception came through.
    pub exception_kind: u32,
    /// Registers r0 through r12.
    pub registers: [u32; 13],
    /// The address of the instruction that trapped.
    ///
    /// The exception vector has already removed the link register offset, so this is the
    /// address execution resumes at.
    pub program_counter: usize,
}

impl ExceptionFrame {
    /// Returns the resume address, with bit 0 set when it points at Thumb code.
    #[must_use]
    pub fn tagged_program_counter(&self) -> usize {
        self.program_counter | usize::from(self.spsr.thumb())
    }
}
