//! A simulated target for exercising the breakpoint engine on a host.
//!
//! [`MockPlatform`] keeps a sparse map of instruction memory laid out like an ARMv7 target:
//! addresses with bit 0 set refer to Thumb code at the even address below them. Breakpoint and
//! NOP opcodes match the ARMv7 ones. Everything the engine asks the kernel to do is recorded so
//! tests can assert on it afterwards.

use std::collections::BTreeMap;

use dbg_os::{
    ExecContext, ExecControl, ExecScope, Instruction, InterruptControl, OpcodeAccess, OsError,
    Successors, ThreadGroup, ThreadId,
};

/// ARM `bkpt #0`.
pub const ARM_BREAKPOINT: Instruction = Instruction::Arm(0xE120_0070);
/// Thumb `bkpt #0`.
pub const THUMB_BREAKPOINT: Instruction = Instruction::Thumb(0xBE00);
/// ARM `nop`.
pub const ARM_NOP: Instruction = Instruction::Arm(0xE320_F000);
/// Thumb `nop`.
pub const THUMB_NOP: Instruction = Instruction::Thumb(0xBF00);

/// The registers a simulated exception saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockFrame {
    /// The address execution resumes at.
    pub pc: usize,
    /// Whether interrupts are enabled on resume.
    pub interrupts_enabled: bool,
    /// Whether a hardware single-step trap has been armed.
    pub step_armed: bool,
}

impl MockFrame {
    /// Creates a frame resuming at `pc` with interrupts enabled.
    #[must_use]
    pub const fn at(pc: usize) -> Self {
        Self {
            pc,
            interrupts_enabled: true,
            step_armed: false,
        }
    }
}

/// The result of saving a frame into a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedFrame {
    /// The context whose stack slot was written.
    pub context: ExecContext,
    /// The program counter of the saved frame.
    pub pc: usize,
}

/// A host simulation of every platform contract.
#[derive(Debug, Default)]
pub struct MockPlatform {
    memory: BTreeMap<usize, Instruction>,
    branches: BTreeMap<usize, usize>,
    groups: BTreeMap<ThreadId, ThreadGroup>,
    hardware_step: bool,
    current: Option<ExecContext>,
    stops: Vec<ExecScope>,
    writes: Vec<(usize, Instruction)>,
    saved: Vec<SavedFrame>,
}

impl MockPlatform {
    /// Creates a platform with empty memory and no current context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills `count` consecutive ARM words starting at `base` with distinct instructions.
    #[must_use]
    pub fn with_arm_code(mut self, base: usize, count: usize) -> Self {
        for i in 0..count {
            let addr = base + i * 4;
            self.memory
                .insert(addr, Instruction::Arm(0xE1A0_0000 | (addr as u32 & 0xFFF)));
        }
        self
    }

    /// Fills `count` consecutive Thumb halfwords starting at `base` with distinct instructions.
    #[must_use]
    pub fn with_thumb_code(mut self, base: usize, count: usize) -> Self {
        let base = base & !1;
        for i in 0..count {
            let addr = base + i * 2;
            self.memory
                .insert(addr, Instruction::Thumb(0x4600 | (addr as u16 & 0xFF)));
        }
        self
    }

    /// Places a single instruction in memory.
    #[must_use]
    pub fn with_instruction(mut self, addr: usize, instr: Instruction) -> Self {
        self.memory.insert(addr & !1, instr);
        self
    }

    /// Makes the instruction at `pc` a conditional branch to `target`.
    #[must_use]
    pub fn with_branch(mut self, pc: usize, target: usize) -> Self {
        self.branches.insert(pc, target);
        self
    }

    /// Assigns a thread to a group. Unassigned threads are application threads.
    #[must_use]
    pub fn with_thread_group(mut self, thread: ThreadId, group: ThreadGroup) -> Self {
        self.groups.insert(thread, group);
        self
    }

    /// Enables or disables the simulated hardware single-step trap.
    #[must_use]
    pub fn with_hardware_step(mut self, supported: bool) -> Self {
        self.hardware_step = supported;
        self
    }

    /// Sets the context the next exception will be taken in.
    pub const fn set_current_context(&mut self, context: Option<ExecContext>) {
        self.current = context;
    }

    /// Returns the instruction currently in memory at `addr`.
    #[must_use]
    pub fn instruction_at(&self, addr: usize) -> Option<Instruction> {
        self.memory.get(&(addr & !1)).copied()
    }

    /// Returns whether the instruction at `addr` is a breakpoint.
    #[must_use]
    pub fn is_patched(&self, addr: usize) -> bool {
        matches!(
            self.instruction_at(addr),
            Some(ARM_BREAKPOINT | THUMB_BREAKPOINT)
        )
    }

    /// Returns every stop request made so far.
    #[must_use]
    pub fn stops(&self) -> &[ExecScope] {
        &self.stops
    }

    /// Returns every opcode write made so far.
    #[must_use]
    pub fn writes(&self) -> &[(usize, Instruction)] {
        &self.writes
    }

    /// Returns every frame saved into a stack slot so far.
    #[must_use]
    pub fn saved_frames(&self) -> &[SavedFrame] {
        &self.saved
    }

    /// Forgets recorded stops, writes and saved frames.
    pub fn clear_history(&mut self) {
        self.stops.clear();
        self.writes.clear();
        self.saved.clear();
    }
}

impl OpcodeAccess for MockPlatform {
    type Frame = MockFrame;

    fn read_opcode(&self, addr: usize) -> Result<Instruction, OsError> {
        self.instruction_at(addr)
            .ok_or(OsError::InvalidAddress { address: addr })
    }

    fn write_opcode(&mut self, addr: usize, opcode: Instruction) -> Result<(), OsError> {
        let slot = self
            .memory
            .get_mut(&(addr & !1))
            .ok_or(OsError::InvalidAddress { address: addr })?;
        *slot = opcode;
        self.writes.push((addr, opcode));
        log::trace!("mock write {opcode:x?} at {addr:#x}");
        Ok(())
    }

    fn breakpoint_opcode(&self, addr: usize) -> Result<Instruction, OsError> {
        Ok(match self.read_opcode(addr)? {
            Instruction::Arm(_) => ARM_BREAKPOINT,
            Instruction::Thumb(_) => THUMB_BREAKPOINT,
        })
    }

    fn nop_opcode(&self, addr: usize) -> Result<Instruction, OsError> {
        Ok(match self.read_opcode(addr)? {
            Instruction::Arm(_) => ARM_NOP,
            Instruction::Thumb(_) => THUMB_NOP,
        })
    }

    fn program_counter(&self, frame: &MockFrame) -> usize {
        frame.pc
    }

    fn successors(&self, pc: usize, _frame: &MockFrame) -> Result<Successors, OsError> {
        let size = self.read_opcode(pc)?.size();
        Ok([Some(pc + size), self.branches.get(&pc).copied()])
    }
}

impl InterruptControl for MockPlatform {
    type InterruptState = bool;

    fn save_interrupts(&self, frame: &MockFrame) -> bool {
        frame.interrupts_enabled
    }

    fn disable_interrupts(&mut self, frame: &mut MockFrame) {
        frame.interrupts_enabled = false;
    }

    fn restore_interrupts(&mut self, frame: &mut MockFrame, state: bool) {
        frame.interrupts_enabled = state;
    }

    fn arm_hardware_step(&mut self, frame: &mut MockFrame) -> Result<(), OsError> {
        if !self.hardware_step {
            return Err(OsError::Unsupported);
        }
        frame.step_armed = true;
        Ok(())
    }
}

impl ExecControl<MockFrame> for MockPlatform {
    type StackSlot = SavedFrame;

    fn stop(&mut self, scope: ExecScope) -> Result<(), OsError> {
        if scope == ExecScope::None {
            return Err(OsError::InvalidContext);
        }
        self.stops.push(scope);
        Ok(())
    }

    fn hardware_step_supported(&self) -> bool {
        self.hardware_step
    }

    fn thread_group(&self, thread: ThreadId) -> ThreadGroup {
        self.groups.get(&thread).copied().unwrap_or_default()
    }

    fn current_context(&self) -> Option<ExecContext> {
        self.current
    }

    fn save_frame(
        &mut self,
        context: ExecContext,
        frame: &mut MockFrame,
    ) -> Result<SavedFrame, OsError> {
        if context == ExecContext::Unrecognized {
            return Err(OsError::InvalidContext);
        }
        let saved = SavedFrame {
            context,
            pc: frame.pc,
        };
        self.saved.push(saved);
        Ok(saved)
    }
}
