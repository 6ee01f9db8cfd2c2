//! Contracts between the breakpoint engine and the system it runs on.
//!
//! The engine never touches instruction memory, registers or the scheduler directly. Everything
//! it needs from the outside world goes through three traits:
//!
//! - [`OpcodeAccess`] reads and patches instruction memory and decodes exception frames.
//! - [`InterruptControl`] edits the interrupt state a frame will resume with.
//! - [`ExecControl`] talks to the kernel about threads and execution contexts.
//!
//! Anything implementing all three is a [`Platform`].

#![no_std]

use core::fmt;

use snafu::Snafu;

mod instruction;

pub use instruction::Instruction;

/// An error reported by a platform collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum OsError {
    /// The address does not refer to patchable instruction memory.
    #[snafu(display("no instruction memory at {address:#x}"))]
    InvalidAddress {
        /// The offending address.
        address: usize,
    },
    /// The platform does not support this operation.
    Unsupported,
    /// The execution context is not valid for this operation.
    InvalidContext,
    /// The platform failed to carry out the operation.
    Failed,
}

/// An operating system thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread {}", self.0)
    }
}

/// The set of execution contexts a breakpoint applies to, or that should be stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecScope {
    /// No context at all.
    None,
    /// Whichever context happens to hit.
    Any,
    /// Every context.
    All,
    /// One specific thread.
    Thread(ThreadId),
}

impl ExecScope {
    const NONE_KEY: usize = usize::MAX;
    const ANY_KEY: usize = usize::MAX - 1;
    const ALL_KEY: usize = usize::MAX - 2;

    /// Returns the key this scope is filed under inside a breakpoint set.
    ///
    /// Thread scopes use the thread's id. The reserved scopes take the top of the `usize` range,
    /// which no kernel hands out as a thread id.
    #[must_use]
    pub const fn key(self) -> usize {
        match self {
            Self::None => Self::NONE_KEY,
            Self::Any => Self::ANY_KEY,
            Self::All => Self::ALL_KEY,
            Self::Thread(ThreadId(id)) => id,
        }
    }

    /// Returns the thread this scope names, if it names one.
    #[must_use]
    pub const fn thread(self) -> Option<ThreadId> {
        match self {
            Self::Thread(thread) => Some(thread),
            _ => None,
        }
    }
}

impl From<ThreadId> for ExecScope {
    fn from(thread: ThreadId) -> Self {
        Self::Thread(thread)
    }
}

/// The kind of code the processor was running when an exception was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecContext {
    /// A schedulable task.
    Task(ThreadId),
    /// A high-level interrupt service routine.
    Hisr(ThreadId),
    /// Something the kernel can't classify, e.g. a corrupted control block.
    Unrecognized,
}

impl ExecContext {
    /// Returns the thread backing this context.
    #[must_use]
    pub const fn thread(self) -> Option<ThreadId> {
        match self {
            Self::Task(thread) | Self::Hisr(thread) => Some(thread),
            Self::Unrecognized => None,
        }
    }
}

/// Which part of the system a thread belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadGroup {
    /// Kernel and debug agent threads. These are never suspended by a breakpoint.
    System,
    /// Everything else.
    #[default]
    Application,
}

/// Why a hit callback is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitEvent {
    /// A breakpoint was hit.
    Hit,
    /// A single-step completed.
    Step,
}

/// Called after a breakpoint has stopped execution.
pub type HitFn = fn(thread: ThreadId, event: HitEvent, param: usize);

/// Decides whether a conditional breakpoint should stop execution.
pub type EvalFn = fn(param: usize) -> bool;

/// The addresses execution may continue at after the current instruction.
///
/// The first entry is the fallthrough. The second is only present when the instruction can
/// branch.
pub type Successors = [Option<usize>; 2];

/// Access to instruction memory and to the program counter of an exception frame.
pub trait OpcodeAccess {
    /// The register frame saved on exception entry.
    type Frame;

    /// Reads the instruction at `addr`.
    ///
    /// # Errors
    ///
    /// - [`OsError::InvalidAddress`] if `addr` is not instruction memory.
    fn read_opcode(&self, addr: usize) -> Result<Instruction, OsError>;

    /// Replaces the instruction at `addr`, making the change visible to instruction fetch.
    ///
    /// # Errors
    ///
    /// - [`OsError::InvalidAddress`] if `addr` is not instruction memory.
    fn write_opcode(&mut self, addr: usize, opcode: Instruction) -> Result<(), OsError>;

    /// Returns the trap instruction to patch into `addr`.
    ///
    /// # Errors
    ///
    /// - [`OsError::InvalidAddress`] if `addr` is not instruction memory.
    fn breakpoint_opcode(&self, addr: usize) -> Result<Instruction, OsError>;

    /// Returns an instruction that does nothing, suitable for `addr`.
    ///
    /// # Errors
    ///
    /// - [`OsError::InvalidAddress`] if `addr` is not instruction memory.
    fn nop_opcode(&self, addr: usize) -> Result<Instruction, OsError>;

    /// Returns the address of the instruction the frame will resume at.
    fn program_counter(&self, frame: &Self::Frame) -> usize;

    /// Works out where execution goes after the instruction at `pc`.
    ///
    /// # Errors
    ///
    /// - [`OsError::InvalidAddress`] if the instruction at `pc` can't be decoded.
    fn successors(&self, pc: usize, frame: &Self::Frame) -> Result<Successors, OsError>;
}

/// Control over the interrupt state of an exception frame.
pub trait InterruptControl: OpcodeAccess {
    /// A saved interrupt state.
    type InterruptState: Copy + fmt::Debug;

    /// Returns the interrupt state the frame would resume with.
    fn save_interrupts(&self, frame: &Self::Frame) -> Self::InterruptState;

    /// Makes the frame resume with interrupts disabled.
    fn disable_interrupts(&mut self, frame: &mut Self::Frame);

    /// Makes the frame resume with a previously saved interrupt state.
    fn restore_interrupts(&mut self, frame: &mut Self::Frame, state: Self::InterruptState);

    /// Arms a hardware single-step trap that fires after the frame resumes.
    ///
    /// # Errors
    ///
    /// - [`OsError::Unsupported`] if the processor has no single-step facility.
    fn arm_hardware_step(&mut self, frame: &mut Self::Frame) -> Result<(), OsError>;
}

/// The kernel's side of execution control.
///
/// This is generic over the frame type so architecture support and kernel support can live in
/// different crates.
pub trait ExecControl<F> {
    /// Where a context's saved stack pointer lives.
    type StackSlot;

    /// Stops the given contexts.
    ///
    /// # Errors
    ///
    /// - [`OsError::InvalidContext`] if the scope doesn't name a stoppable context.
    fn stop(&mut self, scope: ExecScope) -> Result<(), OsError>;

    /// Returns whether the processor can trap after a single instruction.
    fn hardware_step_supported(&self) -> bool;

    /// Returns the group a thread belongs to.
    fn thread_group(&self, thread: ThreadId) -> ThreadGroup;

    /// Returns the context the processor was running when the current exception was taken.
    fn current_context(&self) -> Option<ExecContext>;

    /// Records `frame` as the saved stack pointer of `context` and returns where it was stored.
    ///
    /// # Errors
    ///
    /// - [`OsError::InvalidContext`] for [`ExecContext::Unrecognized`].
    fn save_frame(&mut self, context: ExecContext, frame: &mut F)
    -> Result<Self::StackSlot, OsError>;
}

/// Everything the breakpoint engine needs from its host.
pub trait Platform:
    OpcodeAccess + InterruptControl + ExecControl<<Self as OpcodeAccess>::Frame>
{
}

impl<T> Platform for T where
    T: OpcodeAccess + InterruptControl + ExecControl<<T as OpcodeAccess>::Frame>
{
}

/// The stack slot type of a [`Platform`].
pub type StackSlot<P> = <P as ExecControl<<P as OpcodeAccess>::Frame>>::StackSlot;
