//! ARMv7-A support for the breakpoint engine.
//!
//! [`Armv7`] patches `bkpt` instructions into a region of code memory, decodes
//! [`ExceptionFrame`]s and edits the interrupt mask they resume with. Thread and context
//! management is kernel specific, so it is delegated to a wrapped [`ExecControl`] implementation.
//!
//! Addresses with bit 0 set refer to Thumb code at the even address below them, the same way
//! interworking branch targets are encoded. Breakpoints in Thumb code must be set on the tagged
//! address.

#![no_std]

use core::ops::Range;

use dbg_os::{
    ExecContext, ExecControl, ExecScope, Instruction, InterruptControl, OpcodeAccess, OsError,
    Successors, ThreadGroup, ThreadId,
};

pub mod cache;
mod decode;
pub mod frame;
#[cfg(all(feature = "critical-section-impl", target_arch = "arm"))]
mod irq;

pub use frame::{ExceptionFrame, ProgramStatus};

use crate::cache::CacheTarget;

/// ARM `bkpt #0`.
pub const ARM_BREAKPOINT: u32 = 0xE120_0070;
/// Thumb `bkpt #0`.
pub const THUMB_BREAKPOINT: u16 = 0xBE00;
/// ARM `nop` (hint form).
pub const ARM_NOP: u32 = 0xE320_F000;
/// Thumb `nop` (hint form).
pub const THUMB_NOP: u16 = 0xBF00;

/// An ARMv7-A processor running a kernel `K`.
#[derive(Debug)]
pub struct Armv7<K> {
    kernel: K,
    code: Range<usize>,
}

impl<K> Armv7<K> {
    /// Creates a platform that may patch instructions inside `code`.
    ///
    /// # Safety
    ///
    /// `code` must be mapped readable and writable for as long as this value exists, and nothing
    /// else may rely on its contents staying unpatched.
    ///
    /// Working out where a return like `pop {pc}` goes reads the trapped thread's stack, so the
    /// stack pointer and base registers of every frame passed to
    /// [`successors`](OpcodeAccess::successors) must point at readable memory.
    pub const unsafe fn new(kernel: K, code: Range<usize>) -> Self {
        Self { kernel, code }
    }

    /// Returns the wrapped kernel.
    pub const fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Returns the wrapped kernel mutably.
    pub const fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    /// Splits a tagged address into a pointer and whether it refers to Thumb code, checking that
    /// the whole instruction lies in patchable memory.
    fn locate(&self, addr: usize) -> Result<(*mut u32, bool), OsError> {
        let thumb = addr & 1 != 0;
        let base = addr & !1;
        let size = if thumb { 2 } else { 4 };

        let aligned = thumb || base % 4 == 0;
        let in_range = base >= self.code.start
            && base
                .checked_add(size)
                .is_some_and(|end| end <= self.code.end);

        if aligned && in_range {
            Ok((base as *mut u32, thumb))
        } else {
            Err(OsError::InvalidAddress { address: addr })
        }
    }
}

impl<K> OpcodeAccess for Armv7<K> {
    type Frame = ExceptionFrame;

    fn read_opcode(&self, addr: usize) -> Result<Instruction, OsError> {
        let (ptr, thumb) = self.locate(addr)?;
        // SAFETY: `locate` only hands out pointers inside the region promised to `new`.
        Ok(unsafe { Instruction::read(ptr, thumb) })
    }

    fn write_opcode(&mut self, addr: usize, opcode: Instruction) -> Result<(), OsError> {
        let (ptr, thumb) = self.locate(addr)?;
        if thumb != opcode.is_thumb() {
            return Err(OsError::InvalidAddress { address: addr });
        }

        // SAFETY: see `read_opcode`.
        unsafe {
            opcode.write_to(ptr);
        }
        cache::sync_instruction(CacheTarget::Address(ptr as usize));

        log::trace!("patched {addr:#x} with {opcode:x?}");
        Ok(())
    }

    fn breakpoint_opcode(&self, addr: usize) -> Result<Instruction, OsError> {
        let (_, thumb) = self.locate(addr)?;
        Ok(if thumb {
            Instruction::Thumb(THUMB_BREAKPOINT)
        } else {
            Instruction::Arm(ARM_BREAKPOINT)
        })
    }

    fn nop_opcode(&self, addr: usize) -> Result<Instruction, OsError> {
        let (_, thumb) = self.locate(addr)?;
        Ok(if thumb {
            Instruction::Thumb(THUMB_NOP)
        } else {
            Instruction::Arm(ARM_NOP)
        })
    }

    fn program_counter(&self, frame: &ExceptionFrame) -> usize {
        frame.tagged_program_counter()
    }

    fn successors(&self, pc: usize, frame: &ExceptionFrame) -> Result<Successors, OsError> {
        let base = pc & !1;
        match self.read_opcode(pc)? {
            Instruction::Arm(opcode) => decode::arm_successors(opcode, base, frame, read_word),
            Instruction::Thumb(first) if decode::is_wide(first) => {
                let Instruction::Thumb(second) = self.read_opcode((base + 2) | 1)? else {
                    return Err(OsError::Failed);
                };
                decode::wide_thumb_successors(first, second, base, frame, read_word)
            }
            Instruction::Thumb(op) => decode::thumb_successors(op, base, frame, read_word),
        }
    }
}

/// Loads a word of data memory on behalf of the decoder.
fn read_word(addr: usize) -> Result<u32, OsError> {
    if addr % 4 != 0 {
        return Err(OsError::InvalidAddress { address: addr });
    }
    // SAFETY: `Armv7::new` requires the memory frames point into to be readable.
    Ok(unsafe { core::ptr::read_volatile(addr as *const u32) })
}

impl<K> InterruptControl for Armv7<K> {
    type InterruptState = bool;

    fn save_interrupts(&self, frame: &ExceptionFrame) -> bool {
        frame.spsr.irq_masked()
    }

    fn disable_interrupts(&mut self, frame: &mut ExceptionFrame) {
        frame.spsr = frame.spsr.with_irq_masked(true);
    }

    fn restore_interrupts(&mut self, frame: &mut ExceptionFrame, masked: bool) {
        frame.spsr = frame.spsr.with_irq_masked(masked);
    }

    fn arm_hardware_step(&mut self, _frame: &mut ExceptionFrame) -> Result<(), OsError> {
        Err(OsError::Unsupported)
    }
}

impl<K: ExecControl<ExceptionFrame>> ExecControl<ExceptionFrame> for Armv7<K> {
    type StackSlot = K::StackSlot;

    fn stop(&mut self, scope: ExecScope) -> Result<(), OsError> {
        self.kernel.stop(scope)
    }

    // Mismatch breakpoints could single-step, but they aren't wired up.
    fn hardware_step_supported(&self) -> bool {
        false
    }

    fn thread_group(&self, thread: ThreadId) -> ThreadGroup {
        self.kernel.thread_group(thread)
    }

    fn current_context(&self) -> Option<ExecContext> {
        self.kernel.current_context()
    }

    fn save_frame(
        &mut self,
        context: ExecContext,
        frame: &mut ExceptionFrame,
    ) -> Result<K::StackSlot, OsError> {
        self.kernel.save_frame(context, frame)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Kernel;

    impl ExecControl<ExceptionFrame> for Kernel {
        type StackSlot = *mut ExceptionFrame;

        fn stop(&mut self, _scope: ExecScope) -> Result<(), OsError> {
            Ok(())
        }

        fn hardware_step_supported(&self) -> bool {
            true
        }

        fn thread_group(&self, _thread: ThreadId) -> ThreadGroup {
            ThreadGroup::Application
        }

        fn current_context(&self) -> Option<ExecContext> {
            Some(ExecContext::Task(ThreadId(1)))
        }

        fn save_frame(
            &mut self,
            _context: ExecContext,
            frame: &mut ExceptionFrame,
        ) -> Result<*mut ExceptionFrame, OsError> {
            Ok(core::ptr::from_mut(frame))
        }
    }

    fn platform(code: &mut [u32]) -> Armv7<Kernel> {
        let range = code.as_mut_ptr_range();
        unsafe { Armv7::new(Kernel, range.start as usize..range.end as usize) }
    }

    #[test]
    fn patches_arm_code_in_place() {
        let mut code = [0xE1A0_0000u32; 4];
        let base = code.as_ptr() as usize;
        let mut armv7 = platform(&mut code);

        let trap = armv7.breakpoint_opcode(base + 4).unwrap();
        assert_eq!(trap, Instruction::Arm(ARM_BREAKPOINT));

        armv7.write_opcode(base + 4, trap).unwrap();
        assert_eq!(armv7.read_opcode(base + 4), Ok(trap));
        assert_eq!(
            armv7.read_opcode(base),
            Ok(Instruction::Arm(0xE1A0_0000))
        );
    }

    #[test]
    fn thumb_addresses_are_tagged() {
        let mut code = [0u32; 2];
        let base = code.as_ptr() as usize;
        let mut armv7 = platform(&mut code);

        assert_eq!(
            armv7.nop_opcode(base + 3),
            Ok(Instruction::Thumb(THUMB_NOP))
        );
        armv7
            .write_opcode(base + 3, Instruction::Thumb(THUMB_BREAKPOINT))
            .unwrap();
        assert_eq!(
            armv7.read_opcode(base + 3),
            Ok(Instruction::Thumb(THUMB_BREAKPOINT))
        );
        assert_eq!(armv7.read_opcode(base + 1), Ok(Instruction::Thumb(0)));

        // An ARM opcode can't go into Thumb code.
        assert!(armv7.write_opcode(base + 1, Instruction::Arm(0)).is_err());
    }

    #[test]
    fn rejects_addresses_outside_the_code_region() {
        let mut code = [0u32; 2];
        let base = code.as_ptr() as usize;
        let armv7 = platform(&mut code);

        assert!(armv7.read_opcode(base + 8).is_err());
        assert!(armv7.read_opcode(base + 2).is_err());
        assert!(armv7.read_opcode(base - 4).is_err());
        assert!(armv7.read_opcode(base + 9).is_err());
    }

    #[test]
    fn successors_follow_branches() {
        // mov r0, r0; b .+8; bne .-8; <thumb: bl .+0x100>
        let mut code = [0xE1A0_0000, 0xEA00_0000, 0x1AFF_FFFC, 0xF87E_F000];
        let base = code.as_ptr() as usize;
        let armv7 = platform(&mut code);
        let frame = ExceptionFrame::default();

        assert_eq!(armv7.successors(base, &frame), Ok([Some(base + 4), None]));
        assert_eq!(armv7.successors(base + 4, &frame), Ok([Some(base + 12), None]));
        assert_eq!(
            armv7.successors(base + 8, &frame),
            Ok([Some(base + 12), Some(base)])
        );
        assert_eq!(
            armv7.successors(base + 13, &frame),
            Ok([Some((base + 12 + 0x100) | 1), None])
        );
    }

    #[test]
    fn successors_read_returns_off_the_stack() {
        // pop {r4, pc}
        let mut code = [0xE8BD_8010u32];
        let base = code.as_ptr() as usize;
        let armv7 = platform(&mut code);

        let stack = [0u32, 0x0380_1235];
        let frame = ExceptionFrame {
            stack_pointer: stack.as_ptr() as usize,
            ..Default::default()
        };
        assert_eq!(
            armv7.successors(base, &frame),
            Ok([Some(0x0380_1235), None])
        );
    }

    #[test]
    fn interrupt_state_lives_in_the_spsr() {
        let mut armv7 = platform(&mut [0u32; 1]);
        let mut frame = ExceptionFrame::default();

        let saved = armv7.save_interrupts(&frame);
        assert!(!saved);

        armv7.disable_interrupts(&mut frame);
        assert!(frame.spsr.irq_masked());

        armv7.restore_interrupts(&mut frame, saved);
        assert!(!frame.spsr.irq_masked());
        assert_eq!(
            armv7.arm_hardware_step(&mut frame),
            Err(OsError::Unsupported)
        );
    }

    #[test]
    fn program_counter_follows_the_thumb_bit() {
        let armv7 = platform(&mut [0u32; 1]);
        let mut frame = ExceptionFrame {
            program_counter: 0x100,
            ..Default::default()
        };
        assert_eq!(armv7.program_counter(&frame), 0x100);

        frame.spsr = frame.spsr.with_thumb(true);
        assert_eq!(armv7.program_counter(&frame), 0x101);
    }

    #[test]
    fn exec_control_is_delegated_except_hardware_step() {
        let mut armv7 = platform(&mut [0u32; 1]);
        assert!(!armv7.hardware_step_supported());
        assert_eq!(
            armv7.current_context(),
            Some(ExecContext::Task(ThreadId(1)))
        );

        let mut frame = ExceptionFrame::default();
        let slot = armv7
            .save_frame(ExecContext::Task(ThreadId(1)), &mut frame)
            .unwrap();
        assert_eq!(slot, &raw mut frame);
    }
}
