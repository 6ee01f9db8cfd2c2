use dbg_os::OsError;
use dbg_set::SetError;
use snafu::Snafu;

/// An error returned by the breakpoint engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum BreakpointError {
    /// No free breakpoint records are left.
    OutOfMemory,
    /// The engine was configured with too few breakpoint records to work.
    InsufficientResources,
    /// The requested breakpoint does not exist.
    ResourceUnavailable,
    /// A breakpoint already exists at this address for this context.
    AlreadyExists,
    /// The breakpoint is not registered with the engine.
    InvalidBreakpoint,
    /// There is no breakpoint at the current instruction to step past.
    InvalidOperation,
    /// The thread cannot be used as a breakpoint scope.
    InvalidThread,
    /// Breakpoints can't be handled in the current execution context.
    InvalidContext,
    /// The control id is not recognized.
    InvalidId,
    /// The parameters can't describe a valid request.
    InvalidParameters,
    /// The operation failed.
    Failed,
    /// A platform operation failed.
    #[snafu(context(false), display("platform operation failed: {source}"))]
    Os {
        /// The platform's error.
        source: OsError,
    },
}

impl From<SetError> for BreakpointError {
    fn from(err: SetError) -> Self {
        match err {
            SetError::ResourceUnavailable => Self::ResourceUnavailable,
            SetError::Failed => Self::Failed,
        }
    }
}
