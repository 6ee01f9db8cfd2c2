//! Stepping off a breakpoint.
//!
//! A thread stopped on a patched instruction can't simply resume: it would trap again straight
//! away. The breakpoint under it is taken out, and temporary breakpoints are planted on every
//! instruction that can run next. Whichever one fires first puts the original breakpoint back and
//! discards the others.
//!
//! When the platform can trap after a single instruction, one hardware step replaces the
//! temporary breakpoints.

use dbg_os::{ExecScope, HitFn, Platform, Successors, ThreadId};
use dbg_set::Handle;

use crate::{
    BreakpointEngine, BreakpointError, BreakpointType, ContextBreakpoint,
    context::{Filter, Owner},
};

/// How to step past the instruction a frame stopped on.
#[derive(Debug, Clone, Copy)]
pub struct SkipStep {
    /// The thread that will run the step, or `None` for an interrupt handler.
    pub thread: Option<ThreadId>,
    /// Which threads the temporary breakpoints trigger for.
    pub step: ExecScope,
    /// What to stop once the step completes. [`ExecScope::None`] resumes without stopping.
    pub stop: ExecScope,
    /// Called after the step has stopped execution.
    pub hit: Option<HitFn>,
    /// Passed to [`hit`](Self::hit).
    pub hit_param: usize,
}

impl SkipStep {
    /// Steps `thread` past a breakpoint and lets it keep running.
    #[must_use]
    pub const fn skip_over(thread: ThreadId) -> Self {
        Self {
            thread: Some(thread),
            step: ExecScope::Thread(thread),
            stop: ExecScope::None,
            hit: None,
            hit_param: 0,
        }
    }

    /// Steps `thread` by one instruction and then stops `stop`.
    #[must_use]
    pub const fn single_step(thread: ThreadId, stop: ExecScope) -> Self {
        Self {
            thread: Some(thread),
            step: ExecScope::Thread(thread),
            stop,
            hit: None,
            hit_param: 0,
        }
    }

    /// Sets the callback made when the step stops execution.
    #[must_use]
    pub const fn with_hit(mut self, hit: Option<HitFn>, param: usize) -> Self {
        self.hit = hit;
        self.hit_param = param;
        self
    }

    const fn kind(&self) -> BreakpointType {
        if matches!(self.stop, ExecScope::None) {
            BreakpointType::SkipOver
        } else {
            BreakpointType::SingleStep
        }
    }
}

/// What [`BreakpointEngine::setup_skipover`] did at one successor address.
#[derive(Debug, Clone, Copy)]
struct Planted<S> {
    /// An existing breakpoint that was adopted, with its state from before.
    twin: Option<(Handle, ContextBreakpoint<S>)>,
    /// A newly created temporary breakpoint.
    created: Option<Handle>,
    /// An address breakpoint created for it, still waiting to be patched.
    address: Option<Handle>,
}

impl<S> Default for Planted<S> {
    fn default() -> Self {
        Self {
            twin: None,
            created: None,
            address: None,
        }
    }
}

impl<P: Platform> BreakpointEngine<P> {
    /// Arranges for the instruction at the frame's program counter to be stepped past.
    ///
    /// On failure everything planted so far is removed again, the breakpoint under the program
    /// counter is re-armed and the frame's interrupt state is put back.
    ///
    /// # Errors
    ///
    /// - [`BreakpointError::InvalidParameters`] if [`SkipStep::step`] is [`ExecScope::None`].
    /// - [`BreakpointError::InvalidOperation`] if there is no breakpoint under the program counter
    ///   and [`SkipStep::stop`] is [`ExecScope::None`], so there is nothing to do.
    /// - [`BreakpointError::InvalidBreakpoint`] if the address breakpoint under the program
    ///   counter has no contexts.
    /// - [`BreakpointError::OutOfMemory`] if the temporary breakpoints don't fit.
    pub fn set_skip_step(
        &mut self,
        os: &mut P,
        frame: &mut P::Frame,
        step: SkipStep,
    ) -> Result<(), BreakpointError> {
        critical_section::with(|_| self.set_skip_step_unlocked(os, frame, step))
    }

    pub(crate) fn set_skip_step_unlocked(
        &mut self,
        os: &mut P,
        frame: &mut P::Frame,
        step: SkipStep,
    ) -> Result<(), BreakpointError> {
        if step.step == ExecScope::None {
            return Err(BreakpointError::InvalidParameters);
        }
        let pc = os.program_counter(frame);

        let under_pc = match self.find_address(pc) {
            None if step.stop == ExecScope::None => return Err(BreakpointError::InvalidOperation),
            None => None,
            Some(address) => {
                let (primary, _) = self
                    .set_find(self.context_set(Owner::Address(address)), Filter::any())
                    .ok_or(BreakpointError::InvalidBreakpoint)?;
                self.deactivate(os, address)?;
                Some((address, primary))
            }
        };
        let primary = under_pc.map(|(_, primary)| primary);

        log::trace!("{:?} from {pc:#x} for {:?}", step.kind(), step.step);

        let interrupts = os.save_interrupts(frame);
        let result = if self.hardware_step {
            self.plant_hardware_step(os, frame, primary, &step)
        } else {
            self.plant_successors(os, frame, pc, primary, interrupts, &step)
        };

        if let Err(err) = result {
            os.restore_interrupts(frame, interrupts);
            if let Some((address, _)) = under_pc {
                if let Err(rearm) = self.activate(os, address) {
                    log::error!("breakpoint at {pc:#x} could not be re-armed: {rearm}");
                }
            }
            log::debug!("could not step past {pc:#x}: {err}");
            return Err(err);
        }
        Ok(())
    }

    fn plant_hardware_step(
        &mut self,
        os: &mut P,
        frame: &mut P::Frame,
        primary: Option<Handle>,
        step: &SkipStep,
    ) -> Result<(), BreakpointError> {
        let ctx = self.context_create(ContextBreakpoint {
            hit: step.hit,
            hit_param: step.hit_param,
            aux: primary,
            ..ContextBreakpoint::new(step.step, step.thread, step.kind(), step.stop)
        })?;

        if let Err(err) = self.link_context(Owner::HardwareStep, step.step, ctx) {
            self.context_delete(ctx)?;
            return Err(err);
        }
        if let Err(err) = os.arm_hardware_step(frame) {
            self.unlink_context(Owner::HardwareStep, ctx, 0)?;
            self.context_delete(ctx)?;
            return Err(err.into());
        }
        Ok(())
    }

    /// Plants temporary breakpoints on every successor of `pc`, undoing all of them if any
    /// can't be planted.
    fn plant_successors(
        &mut self,
        os: &mut P,
        frame: &mut P::Frame,
        pc: usize,
        primary: Option<Handle>,
        interrupts: P::InterruptState,
        step: &SkipStep,
    ) -> Result<(), BreakpointError> {
        let successors = os.successors(pc, frame)?;
        os.disable_interrupts(frame);

        let mut planted = [Planted::default(); 2];
        let result = self.plant_each(os, &mut planted, successors, primary, interrupts, step);
        if result.is_err() {
            self.unplant(os, &planted);
        }
        result
    }

    fn plant_each(
        &mut self,
        os: &mut P,
        planted: &mut [Planted<P::InterruptState>; 2],
        successors: Successors,
        primary: Option<Handle>,
        interrupts: P::InterruptState,
        step: &SkipStep,
    ) -> Result<(), BreakpointError> {
        for (slot, next) in planted.iter_mut().zip(successors) {
            if let Some(next) = next {
                *slot = self.setup_skipover(os, next, primary, interrupts, step)?;
            }
        }

        self.crosslink(planted);

        for address in planted.iter().filter_map(|p| p.address) {
            self.activate(os, address)?;
        }
        Ok(())
    }

    /// Plants (or adopts) the temporary breakpoint at one successor address.
    ///
    /// Nothing is left behind on failure.
    fn setup_skipover(
        &mut self,
        os: &mut P,
        next: usize,
        primary: Option<Handle>,
        interrupts: P::InterruptState,
        step: &SkipStep,
    ) -> Result<Planted<P::InterruptState>, BreakpointError> {
        let kind = step.kind();
        let mut planted = Planted::default();

        let address = match self.find_address(next) {
            Some(address) => {
                let existing = self.set_find(
                    self.context_set(Owner::Address(address)),
                    Filter::thread(step.thread),
                );

                if let Some((twin, _)) = existing {
                    planted.twin = Some((twin, self.contexts[twin]));

                    let bp = &mut self.contexts[twin];
                    bp.restore_interrupts = Some(interrupts);
                    bp.aux = primary;
                    if kind == BreakpointType::SingleStep && bp.kind == BreakpointType::Active {
                        bp.kind = BreakpointType::ActiveStep;
                        bp.step_suspend = step.stop;
                    }
                    return Ok(planted);
                }
                address
            }
            None => {
                let address = self.address_create(os, next)?;
                planted.address = Some(address);
                address
            }
        };

        let created = match self.context_create(ContextBreakpoint {
            hit: step.hit,
            hit_param: step.hit_param,
            aux: primary,
            restore_interrupts: Some(interrupts),
            address: Some(address),
            ..ContextBreakpoint::new(step.step, step.thread, kind, step.stop)
        }) {
            Ok(created) => created,
            Err(err) => {
                if planted.address.is_some() {
                    self.discard_address(address);
                }
                return Err(err);
            }
        };
        if let Err(err) = self.link_context(Owner::Address(address), step.step, created) {
            self.context_delete(created)?;
            if planted.address.is_some() {
                self.discard_address(address);
            }
            return Err(err);
        }

        planted.created = Some(created);
        Ok(planted)
    }

    /// Removes the temporary breakpoints of a step that could not be set up and gives adopted
    /// breakpoints back their previous state.
    fn unplant(&mut self, os: &mut P, planted: &[Planted<P::InterruptState>; 2]) {
        // Both successors can share one address, in which case the second adopted the first.
        for slot in planted.iter().rev() {
            if let Some((twin, before)) = slot.twin {
                self.contexts[twin] = before;
            }

            let Some(created) = slot.created else { continue };
            let Some(address) = self.contexts[created].address else { continue };
            if let Err(err) = self.breakpoint_remove(os, address, created, 0) {
                log::error!("temporary breakpoint {created:?} was not removed: {err}");
            }
        }
    }

    /// Links the breakpoints on both paths of a branch so whichever fires first discards the
    /// other.
    fn crosslink(&mut self, planted: &[Planted<P::InterruptState>; 2]) {
        let [first, second] = *planted;
        let twin = |p: Planted<P::InterruptState>| p.twin.map(|(h, _)| h);

        let pairs = [
            (first.created, [twin(second), second.created]),
            (second.created, [twin(first), first.created]),
        ];
        for (created, others) in pairs {
            let Some(created) = created else { continue };
            // Both paths can land on the same address, which must not link a breakpoint to
            // itself.
            for h in others.into_iter().flatten().filter(|&h| h != created) {
                self.contexts[h].twin = Some(created);
            }
        }
    }
}
