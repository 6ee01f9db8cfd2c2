//! Preparing a stopped thread to run again.

use dbg_os::{ExecScope, HitFn, Platform, ThreadId};

use crate::{BreakpointEngine, BreakpointError, SkipStep};

impl<P: Platform> BreakpointEngine<P> {
    /// Steps `thread` off the breakpoint it's stopped on, if any, so it can be resumed.
    ///
    /// # Errors
    ///
    /// Returns the error from setting up the step. Any temporary breakpoints already planted
    /// for `thread` are removed first.
    pub fn prepare_resume(
        &mut self,
        os: &mut P,
        thread: ThreadId,
        frame: &mut P::Frame,
    ) -> Result<(), BreakpointError> {
        critical_section::with(|_| {
            match self.set_skip_step_unlocked(os, frame, SkipStep::skip_over(thread)) {
                Ok(()) | Err(BreakpointError::InvalidOperation) => Ok(()),
                Err(err) => {
                    self.abandon_step(os, thread);
                    Err(err)
                }
            }
        })
    }

    /// Arranges for `thread` to execute one instruction and then stop `stop`.
    ///
    /// Temporary breakpoints left over from earlier steps are discarded first.
    ///
    /// # Errors
    ///
    /// Returns the error from setting up the step, after removing any temporary breakpoints
    /// already planted for `thread`.
    pub fn prepare_step(
        &mut self,
        os: &mut P,
        thread: ThreadId,
        frame: &mut P::Frame,
        stop: ExecScope,
        hit: Option<HitFn>,
        hit_param: usize,
    ) -> Result<(), BreakpointError> {
        critical_section::with(|_| {
            if let Err(err) = self.remove_temporary_unlocked(os, None) {
                log::warn!("stale single-step breakpoints were not all removed: {err}");
            }

            let step = SkipStep::single_step(thread, stop).with_hit(hit, hit_param);
            self.set_skip_step_unlocked(os, frame, step).inspect_err(|_| {
                self.abandon_step(os, thread);
            })
        })
    }

    fn abandon_step(&mut self, os: &mut P, thread: ThreadId) {
        if let Err(err) = self.remove_temporary_unlocked(os, Some(thread)) {
            log::warn!("could not clean up after a failed step of {thread}: {err}");
        }
    }
}
