//! A `critical_section` implementation that masks IRQs.

use core::arch::asm;

use crate::frame::ProgramStatus;

struct IrqMask;
critical_section::set_impl!(IrqMask);

unsafe impl critical_section::Impl for IrqMask {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        let cpsr: u32;
        unsafe {
            asm!("mrs {0}, cpsr", out(reg) cpsr, options(nomem, nostack, preserves_flags));
            asm!("cpsid i", "dsb", "isb", options(nostack));
        }

        ProgramStatus::new_with_raw_value(cpsr).irq_masked()
    }

    unsafe fn release(was_masked: critical_section::RawRestoreState) {
        // Nested sections leave IRQs to the outermost one.
        if !was_masked {
            unsafe {
                asm!("cpsie i", "dsb", "isb", options(nostack));
            }
        }
    }
}
