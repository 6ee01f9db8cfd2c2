//! Breakpoint management for an in-kernel debug agent.
//!
//! A [`BreakpointEngine`] patches trap instructions into a running program and decides what each
//! trap means when it's taken: stop some threads, step quietly past it, or clean up a temporary
//! breakpoint left behind by a single-step.
//!
//! Breakpoints come in two layers. An [`AddressBreakpoint`] owns a patched instruction and the
//! opcode it replaced. Attached to it are one or more [`ContextBreakpoint`]s, each saying which
//! threads the breakpoint applies to and what to do when one of them hits it. The instruction is
//! restored as soon as the last context breakpoint goes away.
//!
//! Everything the engine needs from the processor and the kernel is behind [`dbg_os::Platform`].
//! All records are taken from fixed pools sized by [`EngineConfig::max_breakpoints`], so nothing
//! is allocated once the engine is running.
//!
//! # Example
//!
//! ```ignore
//! let mut engine = BreakpointEngine::initialize(&os, EngineConfig::new())?;
//! engine.set(&mut os, BreakpointParams::new(0x0380_1000, ExecScope::All))?;
//!
//! // From the breakpoint exception vector:
//! let exit = software_breakpoint_entry(Some(&mut engine), &mut os, &mut frame);
//! ```

#![cfg_attr(not(test), no_std)]

use core::{fmt, marker::PhantomData};

use dbg_os::{ExecScope, InterruptControl, Platform};
use dbg_set::{Arena, Behavior, Location, NodeId, Set};

mod address;
mod api;
mod config;
mod context;
mod entry;
mod error;
mod exec;
mod handler;
mod step;

pub use address::{AddressBreakpoint, AddressKind, AddressState};
pub use api::{BreakpointParams, Found};
pub use config::{Control, DEFAULT_MAX_BREAKPOINTS, EngineConfig, IllegalInstructionPolicy};
pub use context::{BreakpointType, ContextBreakpoint};
pub use dbg_set::Handle;
pub use entry::{HandlerExit, hardware_step_entry, software_breakpoint_entry};
pub use error::BreakpointError;
pub use step::SkipStep;

type Context<P> = ContextBreakpoint<<P as InterruptControl>::InterruptState>;

/// The breakpoint registry.
///
/// The engine only holds state. Every operation that touches memory or the kernel borrows the
/// platform for the duration of the call.
pub struct BreakpointEngine<P: Platform> {
    config: EngineConfig,
    hardware_step: bool,
    addresses: Arena<AddressBreakpoint>,
    free_addresses: Set,
    active_addresses: Set,
    contexts: Arena<Context<P>>,
    free_contexts: Set,
    hw_step_contexts: Set,
    _platform: PhantomData<fn() -> P>,
}

impl<P: Platform> fmt::Debug for BreakpointEngine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakpointEngine")
            .field("config", &self.config)
            .field("hardware_step", &self.hardware_step)
            .field("active_addresses", &self.active_addresses.count())
            .field("free_addresses", &self.free_addresses.count())
            .field("free_contexts", &self.free_contexts.count())
            .field("hardware_steps", &self.hw_step_contexts.count())
            .finish_non_exhaustive()
    }
}

impl<P: Platform> BreakpointEngine<P> {
    /// Creates an engine with every breakpoint record free.
    ///
    /// Whether hardware single-stepping is used is decided here, from what `os` supports.
    ///
    /// # Errors
    ///
    /// - [`BreakpointError::InsufficientResources`] if fewer than two breakpoint records are
    ///   configured, since even a single breakpoint needs a spare to be stepped past.
    pub fn initialize(os: &P, config: EngineConfig) -> Result<Self, BreakpointError> {
        if config.max_breakpoints < 2 {
            return Err(BreakpointError::InsufficientResources);
        }

        let mut addresses = Arena::from_fn(config.max_breakpoints, |_| AddressBreakpoint::vacant());
        let mut free_addresses = Set::new(Behavior::Lifo);
        for h in addresses.handles() {
            free_addresses.add(&mut addresses, Location::Tail(NodeId::Any), 0, h)?;
        }

        let mut contexts = Arena::from_fn(config.max_breakpoints, |_| {
            ContextBreakpoint::new(
                ExecScope::None,
                None,
                BreakpointType::Active,
                ExecScope::None,
            )
        });
        let mut free_contexts = Set::new(Behavior::Fifo);
        for h in contexts.handles() {
            free_contexts.add(&mut contexts, Location::Default(NodeId::Any), 0, h)?;
        }

        let hardware_step = os.hardware_step_supported();
        log::info!(
            "breakpoint engine ready with {} records, hardware step {}",
            config.max_breakpoints,
            if hardware_step { "on" } else { "off" }
        );

        Ok(Self {
            config,
            hardware_step,
            addresses,
            free_addresses,
            active_addresses: Set::new(Behavior::Ordered),
            contexts,
            free_contexts,
            hw_step_contexts: Set::new(Behavior::Fifo),
            _platform: PhantomData,
        })
    }

    /// Removes every breakpoint, restoring the program to how it was before the engine touched
    /// it.
    ///
    /// # Errors
    ///
    /// Returns the platform's error if an instruction can't be restored.
    pub fn terminate(&mut self, os: &mut P) -> Result<(), BreakpointError> {
        log::info!("breakpoint engine shutting down");
        self.remove_all(os)
    }

    /// Changes the engine's behavior at runtime.
    ///
    /// # Errors
    ///
    /// - [`BreakpointError::InvalidId`] for [`Control::None`].
    pub fn control(&mut self, control: Control) -> Result<(), BreakpointError> {
        match control {
            Control::None => Err(BreakpointError::InvalidId),
            Control::IllegalInstruction(policy) => {
                critical_section::with(|_| self.config.illegal_instruction = policy);
                Ok(())
            }
        }
    }

    /// The configuration in effect, including runtime changes.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether steps use the platform's hardware single-step instead of temporary breakpoints.
    #[must_use]
    pub const fn hardware_step_enabled(&self) -> bool {
        self.hardware_step
    }

    /// The number of unused address breakpoint records.
    #[must_use]
    pub const fn free_address_count(&self) -> usize {
        self.free_addresses.count()
    }

    /// The number of unused context breakpoint records.
    #[must_use]
    pub const fn free_context_count(&self) -> usize {
        self.free_contexts.count()
    }

    /// Every address breakpoint in use, most recently created first.
    pub fn address_breakpoints(&self) -> impl Iterator<Item = &AddressBreakpoint> + '_ {
        self.active_addresses
            .iter(&self.addresses)
            .map(|h| &self.addresses[h])
    }

    /// The address breakpoint at exactly `addr`.
    #[must_use]
    pub fn address_breakpoint(&self, addr: usize) -> Option<&AddressBreakpoint> {
        self.address_breakpoints().find(|bp| bp.address == addr)
    }

    /// The context breakpoints at exactly `addr`, in match order.
    pub fn contexts_at(&self, addr: usize) -> impl Iterator<Item = (Handle, &Context<P>)> + '_ {
        self.address_breakpoint(addr)
            .into_iter()
            .flat_map(|bp| bp.contexts.iter(&self.contexts))
            .map(|h| (h, &self.contexts[h]))
    }

    /// Pending hardware single-steps.
    pub fn hardware_steps(&self) -> impl Iterator<Item = (Handle, &Context<P>)> + '_ {
        self.hw_step_contexts
            .iter(&self.contexts)
            .map(|h| (h, &self.contexts[h]))
    }

    /// Looks up a context breakpoint that is in use.
    #[must_use]
    pub fn context(&self, handle: Handle) -> Option<&Context<P>> {
        let in_use = self
            .address_breakpoints()
            .any(|bp| bp.contexts.contains(&self.contexts, handle))
            || self.hw_step_contexts.contains(&self.contexts, handle);
        in_use.then(|| &self.contexts[handle])
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;

    use dbg_os::{ExecContext, HitEvent, ThreadId};
    use dbg_os_mock::MockPlatform;

    use super::*;

    pub const CODE: usize = 0x1000;
    pub const T1: ThreadId = ThreadId(1);
    pub const T2: ThreadId = ThreadId(2);

    std::thread_local! {
        static HITS: RefCell<Vec<(ThreadId, HitEvent, usize)>> =
            const { RefCell::new(Vec::new()) };
    }

    pub fn record_hit(thread: ThreadId, event: HitEvent, param: usize) {
        HITS.with_borrow_mut(|hits| hits.push((thread, event, param)));
    }

    /// Takes every hit recorded on this thread so far.
    pub fn hits() -> Vec<(ThreadId, HitEvent, usize)> {
        HITS.with_borrow_mut(core::mem::take)
    }

    pub fn platform() -> MockPlatform {
        hits();
        MockPlatform::new().with_arm_code(CODE, 64)
    }

    pub fn engine(os: &MockPlatform) -> BreakpointEngine<MockPlatform> {
        BreakpointEngine::initialize(os, EngineConfig::new()).unwrap()
    }

    pub fn engine_with(os: &MockPlatform, max: usize) -> BreakpointEngine<MockPlatform> {
        BreakpointEngine::initialize(os, EngineConfig::new().with_max_breakpoints(max)).unwrap()
    }

    pub fn task(os: &mut MockPlatform, thread: ThreadId) {
        os.set_current_context(Some(ExecContext::Task(thread)));
        os.clear_history();
    }

    /// Checks the bookkeeping that must hold between any two engine operations.
    pub fn assert_consistent(engine: &BreakpointEngine<MockPlatform>, os: &MockPlatform) {
        let max = engine.config.max_breakpoints;
        assert_eq!(engine.active_addresses.count() + engine.free_address_count(), max);

        let linked: usize = engine
            .address_breakpoints()
            .map(AddressBreakpoint::context_count)
            .sum::<usize>()
            + engine.hw_step_contexts.count();
        assert_eq!(linked + engine.free_context_count(), max);

        let mut seen = Vec::new();
        for bp in engine.address_breakpoints() {
            assert!(!seen.contains(&(bp.address & !1)), "duplicate {:#x}", bp.address);
            seen.push(bp.address & !1);

            assert!(bp.context_count() > 0, "{:#x} has no contexts", bp.address);
            assert_eq!(
                bp.state == AddressState::Active,
                os.is_patched(bp.address),
                "{:#x} patch state",
                bp.address
            );
        }
    }

    #[test]
    fn fresh_engine_is_empty() {
        let os = platform();
        let engine = engine(&os);
        assert_eq!(engine.free_address_count(), DEFAULT_MAX_BREAKPOINTS);
        assert_eq!(engine.free_context_count(), DEFAULT_MAX_BREAKPOINTS);
        assert!(!engine.hardware_step_enabled());
        assert_eq!(engine.address_breakpoints().count(), 0);
        assert_consistent(&engine, &os);
    }

    #[test]
    fn too_few_records() {
        let os = platform();
        assert_eq!(
            BreakpointEngine::initialize(&os, EngineConfig::new().with_max_breakpoints(1))
                .map(|_| ()),
            Err(BreakpointError::InsufficientResources)
        );
    }

    #[test]
    fn control_updates_the_policy() {
        let os = platform();
        let mut engine = engine(&os);

        assert_eq!(
            engine.control(Control::None),
            Err(BreakpointError::InvalidId)
        );
        engine
            .control(Control::IllegalInstruction(IllegalInstructionPolicy {
                stops_thread: true,
                ..IllegalInstructionPolicy::DEFAULT
            }))
            .unwrap();
        assert!(engine.config().illegal_instruction.stops_thread);
    }

    #[test]
    fn terminate_restores_everything() {
        let mut os = platform();
        let mut engine = engine(&os);
        let original = os.instruction_at(CODE);

        engine
            .set(&mut os, BreakpointParams::new(CODE, ExecScope::All))
            .unwrap();
        assert!(engine.context(engine.find(CODE, ExecScope::All).unwrap().context).is_some());

        engine.terminate(&mut os).unwrap();
        assert_eq!(os.instruction_at(CODE), original);
        assert_consistent(&engine, &os);
    }
}
