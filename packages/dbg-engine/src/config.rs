//! Engine configuration.

use dbg_os::HitFn;

/// The number of breakpoint records reserved when nothing else is configured.
pub const DEFAULT_MAX_BREAKPOINTS: usize = 32;

/// What happens when a thread traps on an address the engine never patched.
///
/// Such a trap is an undefined or breakpoint instruction that was compiled into the program. The
/// engine can overwrite it with a NOP and register a breakpoint in its place, so the thread stops
/// there once and can then carry on.
#[derive(Debug, Clone, Copy)]
pub struct IllegalInstructionPolicy {
    /// Stop only the trapping thread instead of every application thread.
    pub stops_thread: bool,
    /// Replace the instruction with a NOP and register a breakpoint there.
    pub replace: bool,
    /// Called when the replacement breakpoint is hit.
    pub hit: Option<HitFn>,
    /// Passed to [`hit`](Self::hit).
    pub hit_param: usize,
}

impl IllegalInstructionPolicy {
    /// Stops every application thread and replaces the instruction.
    pub const DEFAULT: Self = Self {
        stops_thread: false,
        replace: true,
        hit: None,
        hit_param: 0,
    };
}

impl Default for IllegalInstructionPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Settings fixed when the engine is initialized.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// How many address breakpoints and context breakpoints to reserve.
    pub max_breakpoints: usize,
    /// The initial illegal-instruction policy.
    pub illegal_instruction: IllegalInstructionPolicy,
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_breakpoints: DEFAULT_MAX_BREAKPOINTS,
            illegal_instruction: IllegalInstructionPolicy::DEFAULT,
        }
    }

    /// Sets how many breakpoint records to reserve.
    #[must_use]
    pub const fn with_max_breakpoints(mut self, max_breakpoints: usize) -> Self {
        self.max_breakpoints = max_breakpoints;
        self
    }

    /// Sets the initial illegal-instruction policy.
    #[must_use]
    pub const fn with_illegal_instruction(mut self, policy: IllegalInstructionPolicy) -> Self {
        self.illegal_instruction = policy;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A runtime change to the engine's behavior, applied with
/// [`BreakpointEngine::control`](crate::BreakpointEngine::control).
#[derive(Debug, Clone, Copy)]
pub enum Control {
    /// Does nothing. Rejected as an unknown id.
    None,
    /// Replaces the illegal-instruction policy.
    IllegalInstruction(IllegalInstructionPolicy),
}
