//! Deciding what a breakpoint trap means.
//!
//! Every handler works out a [`Disposition`] first and then carries it out in a fixed order:
//! step past the trap, update related breakpoints, stop execution, and finally remove the
//! breakpoint that fired.

use bitflags::bitflags;
use dbg_os::{ExecContext, ExecScope, HitEvent, Platform, ThreadGroup, ThreadId};
use dbg_set::Handle;

use crate::{
    BreakpointEngine, BreakpointError, BreakpointParams, BreakpointType, SkipStep,
    context::{Filter, Owner},
};

bitflags! {
    /// What to do about a trap.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Disposition: u8 {
        /// Stop the configured threads and make the hit callback.
        const SUSPEND = 1 << 0;
        /// Step the trapping context past the instruction.
        const SKIP_OVER = 1 << 1;
        /// Delete the breakpoint that fired.
        const REMOVE = 1 << 2;
        /// Re-arm its aux breakpoint, restore interrupts and discard its twin.
        const UPDATE_RELATED = 1 << 3;
        /// The stop completes a pending single step rather than a plain hit.
        const STEP = 1 << 4;
    }
}

impl<P: Platform> BreakpointEngine<P> {
    /// Handles a software breakpoint trap taken in `context`.
    pub(crate) fn handle_software(
        &mut self,
        os: &mut P,
        context: Option<ExecContext>,
        frame: &mut P::Frame,
    ) -> Result<(), BreakpointError> {
        match context {
            Some(ExecContext::Task(thread)) => self.software_thread(os, thread, frame),
            Some(ExecContext::Hisr(_)) => self.software_other(os, frame),
            Some(ExecContext::Unrecognized) | None => Err(BreakpointError::InvalidContext),
        }
    }

    /// Handles a hardware single-step trap taken in `context`.
    pub(crate) fn handle_hardware_step(
        &mut self,
        os: &mut P,
        context: Option<ExecContext>,
        frame: &mut P::Frame,
    ) -> Result<(), BreakpointError> {
        let thread = context
            .and_then(ExecContext::thread)
            .ok_or(BreakpointError::InvalidContext)?;
        self.hardware_singlestep(os, thread, frame)
    }

    fn software_thread(
        &mut self,
        os: &mut P,
        thread: ThreadId,
        frame: &mut P::Frame,
    ) -> Result<(), BreakpointError> {
        let pc = os.program_counter(frame);
        let Some(address) = self.find_address(pc) else {
            return self.illegal_instruction(os, thread, pc);
        };

        let found = self.set_find(
            self.context_set(Owner::Address(address)),
            Filter::thread(Some(thread)),
        );
        let disposition = match found {
            None => Disposition::UPDATE_RELATED | Disposition::SKIP_OVER,
            Some((ctx, _)) => {
                let kind = self.contexts[ctx].kind;
                match (os.thread_group(thread), kind) {
                    (_, BreakpointType::SkipOver) => {
                        Disposition::REMOVE | Disposition::UPDATE_RELATED
                    }
                    // System threads are never stopped, only stepped past the trap.
                    (ThreadGroup::System, _) => {
                        Disposition::UPDATE_RELATED | Disposition::SKIP_OVER
                    }
                    (ThreadGroup::Application, BreakpointType::SingleStep) => {
                        Disposition::REMOVE | Disposition::SUSPEND | Disposition::UPDATE_RELATED
                    }
                    (
                        ThreadGroup::Application,
                        BreakpointType::Active | BreakpointType::ActiveStep | BreakpointType::Hit,
                    ) => self.handle_normal(ctx) | Disposition::UPDATE_RELATED,
                }
            }
        };

        log::trace!("{thread} trapped at {pc:#x}: {disposition:?}");
        self.carry_out(os, frame, Some(thread), address, found, disposition)
    }

    /// Handles a trap outside of any task. Nothing can be stopped from here, so the breakpoint
    /// is only stepped past.
    fn software_other(&mut self, os: &mut P, frame: &mut P::Frame) -> Result<(), BreakpointError> {
        let pc = os.program_counter(frame);
        let Some(address) = self.find_address(pc) else {
            return Ok(());
        };

        let found = self.set_find(self.context_set(Owner::Address(address)), Filter::any());
        let disposition = match found {
            Some((ctx, _)) if self.contexts[ctx].kind == BreakpointType::SkipOver => {
                Disposition::REMOVE | Disposition::UPDATE_RELATED
            }
            _ => Disposition::UPDATE_RELATED | Disposition::SKIP_OVER,
        };

        log::trace!("interrupt handler trapped at {pc:#x}: {disposition:?}");
        self.carry_out(os, frame, None, address, found, disposition)
    }

    fn hardware_singlestep(
        &mut self,
        os: &mut P,
        thread: ThreadId,
        frame: &mut P::Frame,
    ) -> Result<(), BreakpointError> {
        let Some((ctx, index)) =
            self.set_find(self.context_set(Owner::HardwareStep), Filter::thread(Some(thread)))
        else {
            log::debug!("no hardware step pending for {thread}");
            return Ok(());
        };

        let disposition = match self.contexts[ctx].kind {
            BreakpointType::SingleStep => {
                Disposition::UPDATE_RELATED | Disposition::SUSPEND | Disposition::REMOVE
            }
            BreakpointType::SkipOver => Disposition::UPDATE_RELATED | Disposition::REMOVE,
            _ => Disposition::SUSPEND,
        };

        if disposition.contains(Disposition::UPDATE_RELATED) {
            self.update_related(os, ctx, frame)?;
        }
        if disposition.contains(Disposition::SUSPEND) {
            self.suspend_execution(os, ctx, thread, disposition)?;
        }
        if disposition.contains(Disposition::REMOVE) {
            self.unlink_context(Owner::HardwareStep, ctx, index)?;
            self.erase_references(ctx);
            self.context_delete(ctx)?;
        }
        Ok(())
    }

    /// Applies the conditions, pass counts and hit counts of a user breakpoint.
    fn handle_normal(&mut self, ctx: Handle) -> Disposition {
        let bp = &mut self.contexts[ctx];
        let mut disposition = Disposition::empty();

        let func_hit = bp.eval.is_some_and(|eval| eval(bp.eval_param));

        bp.pass_count = bp.pass_count.saturating_sub(1);
        let pass_hit = if bp.pass_count == 0 {
            bp.pass_count = bp.pass_cycle;
            true
        } else if bp.kind == BreakpointType::ActiveStep {
            // A pending step still has to stop here.
            true
        } else {
            disposition |= Disposition::SKIP_OVER;
            false
        };

        if func_hit || pass_hit {
            disposition |= Disposition::SUSPEND;
            if bp.kind == BreakpointType::ActiveStep {
                disposition |= Disposition::STEP;
            }
            match bp.hit_count {
                1 => disposition |= Disposition::REMOVE,
                0 => {}
                _ => bp.hit_count -= 1,
            }
        }

        bp.kind = BreakpointType::Hit;
        disposition
    }

    fn carry_out(
        &mut self,
        os: &mut P,
        frame: &mut P::Frame,
        thread: Option<ThreadId>,
        address: Handle,
        found: Option<(Handle, usize)>,
        disposition: Disposition,
    ) -> Result<(), BreakpointError> {
        if disposition.contains(Disposition::SKIP_OVER) {
            self.set_skip_step_unlocked(
                os,
                frame,
                SkipStep {
                    thread,
                    step: ExecScope::All,
                    stop: ExecScope::None,
                    hit: None,
                    hit_param: 0,
                },
            )?;
        }

        let Some((ctx, index)) = found else {
            return Ok(());
        };

        if disposition.contains(Disposition::UPDATE_RELATED) {
            self.update_related(os, ctx, frame)?;
        }
        if let (true, Some(thread)) = (disposition.contains(Disposition::SUSPEND), thread) {
            self.suspend_execution(os, ctx, thread, disposition)?;
        }
        if disposition.contains(Disposition::REMOVE) {
            // Discarding a twin can shift the index, which `breakpoint_remove` tolerates.
            self.breakpoint_remove(os, address, ctx, index)?;
        }
        Ok(())
    }

    /// Re-arms the aux breakpoint, restores the saved interrupt state and discards the twin.
    fn update_related(
        &mut self,
        os: &mut P,
        ctx: Handle,
        frame: &mut P::Frame,
    ) -> Result<(), BreakpointError> {
        let bp = self.contexts[ctx];

        if let Some(address) = bp.aux.and_then(|aux| self.contexts[aux].address) {
            self.activate(os, address)?;
        }

        if let Some(state) = bp.restore_interrupts {
            os.restore_interrupts(frame, state);
        }

        let Some(twin) = bp.twin else {
            return Ok(());
        };
        let Some(address) = self.contexts[twin].address else {
            return Ok(());
        };
        if let Some((twin, index)) =
            self.set_find(self.context_set(Owner::Address(address)), Filter::handle(twin))
        {
            self.breakpoint_remove(os, address, twin, index)?;
        }
        Ok(())
    }

    /// Stops whatever the breakpoint is configured to stop and makes its hit callback.
    ///
    /// A user breakpoint that doubled as a step target stops what the step asked for instead.
    fn suspend_execution(
        &mut self,
        os: &mut P,
        ctx: Handle,
        thread: ThreadId,
        disposition: Disposition,
    ) -> Result<(), BreakpointError> {
        let bp = self.contexts[ctx];
        let step = disposition.contains(Disposition::STEP);

        let target = if step { bp.step_suspend } else { bp.suspend };
        let target = match target {
            ExecScope::Any => ExecScope::Thread(thread),
            other => other,
        };
        os.stop(target)?;

        if let Some(hit) = bp.hit {
            let event = if step || bp.kind == BreakpointType::SingleStep {
                HitEvent::Step
            } else {
                HitEvent::Hit
            };
            hit(thread, event, bp.hit_param);
        }
        Ok(())
    }

    /// Handles a trap on an address that was never patched: an illegal or compiled-in breakpoint
    /// instruction.
    fn illegal_instruction(
        &mut self,
        os: &mut P,
        thread: ThreadId,
        pc: usize,
    ) -> Result<(), BreakpointError> {
        let policy = self.config.illegal_instruction;
        log::warn!("{thread} hit an unknown trap instruction at {pc:#x}");

        if !policy.replace {
            return Ok(());
        }

        let nop = os.nop_opcode(pc)?;
        os.write_opcode(pc, nop)?;

        let stop = if policy.stops_thread {
            ExecScope::Thread(thread)
        } else {
            ExecScope::All
        };
        let mut params = BreakpointParams::new(pc, ExecScope::All).with_stop(stop);
        if let Some(hit) = policy.hit {
            params = params.with_hit(hit, policy.hit_param);
        }
        self.set_unlocked(os, params)
    }
}
