//! Exception entry points.
//!
//! These are called from the platform's breakpoint and single-step exception vectors with the
//! frame the vector saved. They run the matching handler and then hand the frame to the kernel so
//! it can resume (or keep suspended) whatever was interrupted.

use dbg_os::{ExecContext, Platform, StackSlot};

use crate::{BreakpointEngine, BreakpointError};

/// The outcome of a breakpoint exception.
#[derive(Debug)]
pub struct HandlerExit<S> {
    /// Where the kernel parked the frame, or `None` if the context couldn't be recognized.
    pub stack_slot: Option<S>,
    /// Whether handling the trap succeeded.
    pub status: Result<(), BreakpointError>,
}

/// Handles a software breakpoint exception.
///
/// With no engine the trap is passed straight through to the kernel.
pub fn software_breakpoint_entry<P: Platform>(
    engine: Option<&mut BreakpointEngine<P>>,
    os: &mut P,
    frame: &mut P::Frame,
) -> HandlerExit<StackSlot<P>> {
    let context = os.current_context();
    let status = match engine {
        Some(engine) => engine.handle_software(os, context, frame),
        None => Ok(()),
    };
    exit(os, context, frame, status)
}

/// Handles a hardware single-step exception.
pub fn hardware_step_entry<P: Platform>(
    engine: Option<&mut BreakpointEngine<P>>,
    os: &mut P,
    frame: &mut P::Frame,
) -> HandlerExit<StackSlot<P>> {
    let context = os.current_context();
    let status = match engine {
        Some(engine) => engine.handle_hardware_step(os, context, frame),
        None => Ok(()),
    };
    exit(os, context, frame, status)
}

fn exit<P: Platform>(
    os: &mut P,
    context: Option<ExecContext>,
    frame: &mut P::Frame,
    mut status: Result<(), BreakpointError>,
) -> HandlerExit<StackSlot<P>> {
    if let Err(err) = status {
        log::error!("breakpoint handler failed in {context:?}: {err}");
    }

    let stack_slot = match context {
        Some(context @ (ExecContext::Task(_) | ExecContext::Hisr(_))) => {
            match os.save_frame(context, frame) {
                Ok(slot) => Some(slot),
                Err(err) => {
                    log::error!("could not save frame for {context:?}: {err}");
                    None
                }
            }
        }
        Some(ExecContext::Unrecognized) | None => None,
    };

    if stack_slot.is_none() && status.is_ok() {
        log::error!("breakpoint exception taken in an unrecognized context");
        status = Err(BreakpointError::InvalidContext);
    }

    HandlerExit { stack_slot, status }
}

#[cfg(test)]
mod test {
    use dbg_os::{ExecScope, HitEvent, ThreadGroup};
    use dbg_os_mock::{ARM_NOP, MockFrame, MockPlatform, SavedFrame};

    use super::*;
    use crate::{
        BreakpointParams, BreakpointType, ContextBreakpoint, IllegalInstructionPolicy, SkipStep,
        config::EngineConfig,
        context::Owner,
        testing::{CODE, T1, T2, assert_consistent, engine, hits, platform, record_hit, task},
    };

    fn trap(
        engine: &mut BreakpointEngine<MockPlatform>,
        os: &mut MockPlatform,
        frame: &mut MockFrame,
    ) -> HandlerExit<SavedFrame> {
        software_breakpoint_entry(Some(engine), os, frame)
    }

    #[test]
    fn hit_suspends_and_reports() {
        let mut os = platform();
        let mut engine = engine(&os);
        engine
            .set(
                &mut os,
                BreakpointParams::new(CODE, ExecScope::All).with_hit(record_hit, 7),
            )
            .unwrap();

        task(&mut os, T1);
        let mut frame = MockFrame::at(CODE);
        let exit = trap(&mut engine, &mut os, &mut frame);

        assert_eq!(exit.status, Ok(()));
        assert_eq!(
            exit.stack_slot,
            Some(SavedFrame {
                context: ExecContext::Task(T1),
                pc: CODE
            })
        );
        assert_eq!(os.stops(), [ExecScope::All]);
        assert_eq!(hits(), [(T1, HitEvent::Hit, 7)]);

        let found = engine.find(CODE, ExecScope::All).unwrap();
        assert_eq!(
            engine.context(found.context).unwrap().kind(),
            BreakpointType::Hit
        );
        assert!(os.is_patched(CODE));
    }

    #[test]
    fn any_stops_the_hitting_thread() {
        let mut os = platform();
        let mut engine = engine(&os);
        engine
            .set(
                &mut os,
                BreakpointParams::new(CODE, ExecScope::All).with_stop(ExecScope::Any),
            )
            .unwrap();

        task(&mut os, T2);
        trap(&mut engine, &mut os, &mut MockFrame::at(CODE));
        assert_eq!(os.stops(), [ExecScope::Thread(T2)]);
    }

    #[test]
    fn other_threads_step_past() {
        let mut os = platform();
        let mut engine = engine(&os);
        engine
            .set(&mut os, BreakpointParams::new(CODE, ExecScope::Thread(T1)))
            .unwrap();

        task(&mut os, T2);
        let mut frame = MockFrame::at(CODE);
        let exit = trap(&mut engine, &mut os, &mut frame);

        assert_eq!(exit.status, Ok(()));
        assert!(os.stops().is_empty());
        assert!(!os.is_patched(CODE));
        assert!(os.is_patched(CODE + 4));

        // The step lands, re-arms the breakpoint and cleans up after itself.
        let mut frame = MockFrame {
            interrupts_enabled: false,
            ..MockFrame::at(CODE + 4)
        };
        let exit = trap(&mut engine, &mut os, &mut frame);
        assert_eq!(exit.status, Ok(()));
        assert!(os.is_patched(CODE));
        assert!(!os.is_patched(CODE + 4));
        assert!(frame.interrupts_enabled);
        assert!(os.stops().is_empty());
        assert_consistent(&engine, &os);
    }

    #[test]
    fn system_threads_are_never_stopped() {
        let mut os = platform().with_thread_group(T1, ThreadGroup::System);
        let mut engine = engine(&os);
        engine
            .set(&mut os, BreakpointParams::new(CODE, ExecScope::All))
            .unwrap();

        task(&mut os, T1);
        trap(&mut engine, &mut os, &mut MockFrame::at(CODE));
        assert!(os.stops().is_empty());
        assert!(os.is_patched(CODE + 4));

        trap(&mut engine, &mut os, &mut MockFrame::at(CODE + 4));
        assert!(os.is_patched(CODE));
        assert!(!os.is_patched(CODE + 4));
        assert_consistent(&engine, &os);
    }

    #[test]
    fn pass_count_skips_until_it_runs_out() {
        let mut os = platform();
        let mut engine = engine(&os);
        engine
            .set(
                &mut os,
                BreakpointParams::new(CODE, ExecScope::All).with_pass(3, 2),
            )
            .unwrap();
        task(&mut os, T1);

        let mut stops = Vec::new();
        for _ in 0..5 {
            trap(&mut engine, &mut os, &mut MockFrame::at(CODE));
            stops.push(os.stops().len());
            if os.is_patched(CODE + 4) {
                trap(&mut engine, &mut os, &mut MockFrame::at(CODE + 4));
            }
        }

        // The count includes the stopping hit, then the cycle takes over.
        assert_eq!(stops, [0, 0, 1, 1, 2]);
        let found = engine.find(CODE, ExecScope::All).unwrap();
        assert_eq!(engine.context(found.context).unwrap().pass_count(), 2);
        assert_consistent(&engine, &os);
    }

    #[test]
    fn eval_forces_a_stop_during_passes() {
        fn always(_: usize) -> bool {
            true
        }

        let mut os = platform();
        let mut engine = engine(&os);
        engine
            .set(
                &mut os,
                BreakpointParams::new(CODE, ExecScope::All)
                    .with_pass(5, 5)
                    .with_eval(always, 0),
            )
            .unwrap();

        task(&mut os, T1);
        trap(&mut engine, &mut os, &mut MockFrame::at(CODE));
        assert_eq!(os.stops(), [ExecScope::All]);
    }

    #[test]
    fn hit_count_one_removes_after_firing() {
        let mut os = platform();
        let mut engine = engine(&os);
        let original = os.instruction_at(CODE);
        engine
            .set(
                &mut os,
                BreakpointParams::new(CODE, ExecScope::All).with_hit_count(1),
            )
            .unwrap();

        task(&mut os, T1);
        let exit = trap(&mut engine, &mut os, &mut MockFrame::at(CODE));
        assert_eq!(exit.status, Ok(()));
        assert_eq!(os.stops(), [ExecScope::All]);
        assert_eq!(os.instruction_at(CODE), original);
        assert_eq!(
            engine.find(CODE, ExecScope::None),
            Err(BreakpointError::ResourceUnavailable)
        );
        assert_consistent(&engine, &os);
    }

    #[test]
    fn unknown_trap_becomes_a_breakpoint() {
        let mut os = platform();
        let mut engine = engine(&os);

        task(&mut os, T1);
        let exit = trap(&mut engine, &mut os, &mut MockFrame::at(CODE + 8));

        assert_eq!(exit.status, Ok(()));
        assert!(os.stops().is_empty());
        assert_eq!(os.writes()[0], (CODE + 8, ARM_NOP));
        assert!(os.is_patched(CODE + 8));

        let found = engine.find(CODE + 8, ExecScope::All).unwrap();
        let bp = engine.context(found.context).unwrap();
        assert_eq!(bp.suspend_scope(), ExecScope::All);
        assert_eq!(
            engine.address_breakpoint(CODE + 8).unwrap().saved_opcode(),
            Some(ARM_NOP)
        );
    }

    #[test]
    fn unknown_trap_can_be_left_alone() {
        let mut os = platform();
        let mut engine = BreakpointEngine::initialize(
            &os,
            EngineConfig::new().with_illegal_instruction(IllegalInstructionPolicy {
                replace: false,
                ..IllegalInstructionPolicy::DEFAULT
            }),
        )
        .unwrap();

        task(&mut os, T1);
        let exit = trap(&mut engine, &mut os, &mut MockFrame::at(CODE));
        assert_eq!(exit.status, Ok(()));
        assert!(os.writes().is_empty());
    }

    #[test]
    fn interrupt_handlers_only_step_past() {
        let mut os = platform();
        let mut engine = engine(&os);
        engine
            .set(&mut os, BreakpointParams::new(CODE, ExecScope::All))
            .unwrap();

        os.set_current_context(Some(ExecContext::Hisr(T2)));
        let exit = trap(&mut engine, &mut os, &mut MockFrame::at(CODE));
        assert_eq!(exit.status, Ok(()));
        assert!(os.stops().is_empty());
        assert!(os.is_patched(CODE + 4));

        let step = engine.find(CODE + 4, ExecScope::All).unwrap();
        assert_eq!(engine.context(step.context).unwrap().thread(), None);

        trap(&mut engine, &mut os, &mut MockFrame::at(CODE + 4));
        assert!(os.is_patched(CODE));
        assert!(!os.is_patched(CODE + 4));

        // Unpatched addresses are left to the kernel.
        let exit = trap(&mut engine, &mut os, &mut MockFrame::at(CODE + 16));
        assert_eq!(exit.status, Ok(()));
        assert!(!os.is_patched(CODE + 16));
        assert_consistent(&engine, &os);
    }

    #[test]
    fn unrecognized_contexts_are_reported() {
        let mut os = platform();
        let mut engine = engine(&os);

        os.set_current_context(Some(ExecContext::Unrecognized));
        let exit = trap(&mut engine, &mut os, &mut MockFrame::at(CODE));
        assert_eq!(exit.status, Err(BreakpointError::InvalidContext));
        assert_eq!(exit.stack_slot, None);

        os.set_current_context(None);
        let exit = software_breakpoint_entry(None, &mut os, &mut MockFrame::at(CODE));
        assert_eq!(exit.status, Err(BreakpointError::InvalidContext));
        assert!(os.saved_frames().is_empty());
    }

    #[test]
    fn frame_is_saved_even_when_handling_fails() {
        let mut os = platform();
        let mut engine = engine(&os);
        engine
            .set(
                &mut os,
                BreakpointParams::new(CODE, ExecScope::All).with_stop(ExecScope::None),
            )
            .unwrap();

        task(&mut os, T1);
        let exit = trap(&mut engine, &mut os, &mut MockFrame::at(CODE));
        assert!(exit.status.is_err());
        assert!(exit.stack_slot.is_some());
    }

    #[test]
    fn hardware_single_step_completes() {
        let mut os = platform().with_hardware_step(true);
        let mut engine = engine(&os);
        engine
            .set(&mut os, BreakpointParams::new(CODE, ExecScope::All))
            .unwrap();

        let mut frame = MockFrame::at(CODE);
        engine
            .set_skip_step(
                &mut os,
                &mut frame,
                SkipStep::single_step(T1, ExecScope::Thread(T1)).with_hit(Some(record_hit), 3),
            )
            .unwrap();
        assert!(!os.is_patched(CODE));

        task(&mut os, T1);
        let mut frame = MockFrame::at(CODE + 4);
        let exit = hardware_step_entry(Some(&mut engine), &mut os, &mut frame);

        assert_eq!(exit.status, Ok(()));
        assert!(os.is_patched(CODE));
        assert_eq!(os.stops(), [ExecScope::Thread(T1)]);
        assert_eq!(hits(), [(T1, HitEvent::Step, 3)]);
        assert_eq!(engine.hardware_steps().count(), 0);

        // A stray step trap is ignored.
        let exit = hardware_step_entry(Some(&mut engine), &mut os, &mut frame);
        assert_eq!(exit.status, Ok(()));
        assert_consistent(&engine, &os);
    }

    #[test]
    fn taken_branch_discards_the_fallthrough() {
        let mut os = platform().with_branch(CODE, CODE + 0x40);
        let mut engine = engine(&os);
        engine
            .set(&mut os, BreakpointParams::new(CODE, ExecScope::Thread(T2)))
            .unwrap();
        let free = engine.free_address_count();

        task(&mut os, T1);
        let mut frame = MockFrame::at(CODE);
        assert_eq!(trap(&mut engine, &mut os, &mut frame).status, Ok(()));
        assert!(os.is_patched(CODE + 4));
        assert!(os.is_patched(CODE + 0x40));
        assert!(!frame.interrupts_enabled);

        frame.pc = CODE + 0x40;
        assert_eq!(trap(&mut engine, &mut os, &mut frame).status, Ok(()));

        assert!(os.is_patched(CODE));
        assert!(!os.is_patched(CODE + 4));
        assert!(!os.is_patched(CODE + 0x40));
        assert!(engine.address_breakpoint(CODE + 4).is_none());
        assert!(engine.address_breakpoint(CODE + 0x40).is_none());
        assert_eq!(engine.free_address_count(), free);
        assert!(frame.interrupts_enabled);
        assert!(os.stops().is_empty());
        assert_consistent(&engine, &os);
    }

    #[test]
    fn user_breakpoint_completes_a_pending_step() {
        let mut os = platform();
        let mut engine = engine(&os);
        engine
            .set(&mut os, BreakpointParams::new(CODE, ExecScope::All))
            .unwrap();
        engine
            .set(
                &mut os,
                BreakpointParams::new(CODE + 4, ExecScope::All).with_hit(record_hit, 5),
            )
            .unwrap();

        engine
            .prepare_step(
                &mut os,
                T1,
                &mut MockFrame::at(CODE),
                ExecScope::Thread(T1),
                None,
                0,
            )
            .unwrap();

        task(&mut os, T1);
        let mut frame = MockFrame::at(CODE + 4);
        assert_eq!(trap(&mut engine, &mut os, &mut frame).status, Ok(()));
        assert_eq!(os.stops(), [ExecScope::Thread(T1)]);
        assert_eq!(hits(), [(T1, HitEvent::Step, 5)]);
        assert!(os.is_patched(CODE));

        let user = engine.find(CODE + 4, ExecScope::All).unwrap();
        assert_eq!(
            engine.context(user.context).unwrap().kind(),
            BreakpointType::Hit
        );

        // Once the step is done it is an ordinary breakpoint again.
        task(&mut os, T1);
        assert_eq!(trap(&mut engine, &mut os, &mut frame).status, Ok(()));
        assert_eq!(os.stops(), [ExecScope::All]);
        assert_eq!(hits(), [(T1, HitEvent::Hit, 5)]);
        assert_consistent(&engine, &os);
    }

    #[test]
    fn hardware_skip_over_resumes_silently() {
        let mut os = platform().with_hardware_step(true);
        let mut engine = engine(&os);
        engine
            .set(
                &mut os,
                BreakpointParams::new(CODE, ExecScope::All).with_hit(record_hit, 1),
            )
            .unwrap();

        let mut frame = MockFrame::at(CODE);
        engine
            .set_skip_step(&mut os, &mut frame, SkipStep::skip_over(T1))
            .unwrap();
        assert!(!os.is_patched(CODE));

        task(&mut os, T1);
        frame.pc = CODE + 4;
        let exit = hardware_step_entry(Some(&mut engine), &mut os, &mut frame);

        assert_eq!(exit.status, Ok(()));
        assert!(os.is_patched(CODE));
        assert!(os.stops().is_empty());
        assert!(hits().is_empty());
        assert_eq!(engine.hardware_steps().count(), 0);
        assert_consistent(&engine, &os);
    }

    #[test]
    fn unexpected_hardware_step_only_suspends() {
        let mut os = platform().with_hardware_step(true);
        let mut engine = engine(&os);

        let ctx = engine
            .context_create(ContextBreakpoint {
                hit: Some(record_hit),
                hit_param: 9,
                ..ContextBreakpoint::new(
                    ExecScope::Thread(T1),
                    Some(T1),
                    BreakpointType::Hit,
                    ExecScope::All,
                )
            })
            .unwrap();
        engine
            .link_context(Owner::HardwareStep, ExecScope::Thread(T1), ctx)
            .unwrap();

        task(&mut os, T1);
        let exit = hardware_step_entry(Some(&mut engine), &mut os, &mut MockFrame::at(CODE));

        assert_eq!(exit.status, Ok(()));
        assert_eq!(os.stops(), [ExecScope::All]);
        assert_eq!(hits(), [(T1, HitEvent::Hit, 9)]);
        // Nothing removes it, so it stays filed.
        assert_eq!(engine.hardware_steps().count(), 1);
        assert_consistent(&engine, &os);
    }
}
