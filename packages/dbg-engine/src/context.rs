//! Context breakpoints: who a patched address applies to, and what happens when it's hit.

use dbg_os::{EvalFn, ExecScope, HitFn, Platform, ThreadId};
use dbg_set::{Handle, Location, NodeId, Set};

use crate::{BreakpointEngine, BreakpointError};

/// The role a context breakpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointType {
    /// A user breakpoint that has not been hit yet.
    Active,
    /// A user breakpoint that also completes a pending single-step.
    ActiveStep,
    /// A user breakpoint that has been hit at least once.
    Hit,
    /// A temporary breakpoint that suspends when a single-step lands on it.
    SingleStep,
    /// A temporary breakpoint used to re-arm another breakpoint after stepping off it.
    SkipOver,
}

/// A breakpoint for one execution scope, attached to an address breakpoint.
#[derive(Debug, Clone, Copy)]
pub struct ContextBreakpoint<S> {
    pub(crate) scope: ExecScope,
    pub(crate) thread: Option<ThreadId>,
    pub(crate) suspend: ExecScope,
    pub(crate) step_suspend: ExecScope,
    pub(crate) kind: BreakpointType,
    pub(crate) eval: Option<EvalFn>,
    pub(crate) eval_param: usize,
    pub(crate) hit: Option<HitFn>,
    pub(crate) hit_param: usize,
    pub(crate) pass_count: u32,
    pub(crate) pass_cycle: u32,
    pub(crate) hit_count: u32,
    pub(crate) aux: Option<Handle>,
    pub(crate) twin: Option<Handle>,
    pub(crate) restore_interrupts: Option<S>,
    pub(crate) address: Option<Handle>,
}

impl<S> ContextBreakpoint<S> {
    pub(crate) const fn new(
        scope: ExecScope,
        thread: Option<ThreadId>,
        kind: BreakpointType,
        suspend: ExecScope,
    ) -> Self {
        Self {
            scope,
            thread,
            suspend,
            step_suspend: ExecScope::None,
            kind,
            eval: None,
            eval_param: 0,
            hit: None,
            hit_param: 0,
            pass_count: 0,
            pass_cycle: 0,
            hit_count: 0,
            aux: None,
            twin: None,
            restore_interrupts: None,
            address: None,
        }
    }

    /// The execution scope this breakpoint triggers for.
    #[must_use]
    pub const fn scope(&self) -> ExecScope {
        self.scope
    }

    /// The thread this breakpoint is bound to, if any.
    #[must_use]
    pub const fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    /// What gets stopped when this breakpoint is hit.
    #[must_use]
    pub const fn suspend_scope(&self) -> ExecScope {
        self.suspend
    }

    /// The breakpoint's current role.
    #[must_use]
    pub const fn kind(&self) -> BreakpointType {
        self.kind
    }

    /// Hits left to ignore before this breakpoint stops execution.
    #[must_use]
    pub const fn pass_count(&self) -> u32 {
        self.pass_count
    }

    /// The value [`pass_count`](Self::pass_count) is reset to after stopping.
    #[must_use]
    pub const fn pass_cycle(&self) -> u32 {
        self.pass_cycle
    }

    /// Stops left before the breakpoint removes itself. Zero means never.
    #[must_use]
    pub const fn hit_count(&self) -> u32 {
        self.hit_count
    }

    /// The breakpoint to re-arm when this one fires.
    #[must_use]
    pub const fn aux(&self) -> Option<Handle> {
        self.aux
    }

    /// The breakpoint on the other path of a branch, discarded when this one fires.
    #[must_use]
    pub const fn twin(&self) -> Option<Handle> {
        self.twin
    }

    /// The address breakpoint this belongs to. `None` for hardware single-steps.
    #[must_use]
    pub const fn address(&self) -> Option<Handle> {
        self.address
    }
}

/// The set a context breakpoint is filed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    /// The contexts of an address breakpoint.
    Address(Handle),
    /// Pending hardware single-steps.
    HardwareStep,
}

/// Criteria for [`BreakpointEngine::set_find`]. Unset fields match anything.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Filter {
    pub(crate) thread: Option<ThreadId>,
    pub(crate) kind: Option<BreakpointType>,
    pub(crate) handle: Option<Handle>,
}

impl Filter {
    pub(crate) const fn any() -> Self {
        Self {
            thread: None,
            kind: None,
            handle: None,
        }
    }

    pub(crate) const fn thread(thread: Option<ThreadId>) -> Self {
        Self {
            thread,
            ..Self::any()
        }
    }

    pub(crate) const fn handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
            ..Self::any()
        }
    }

    fn matches<S>(&self, handle: Handle, bp: &ContextBreakpoint<S>) -> bool {
        let thread = match self.thread {
            None => true,
            Some(_) if matches!(bp.scope, ExecScope::All | ExecScope::Any) => true,
            Some(thread) => bp.thread == Some(thread),
        };

        thread
            && self.kind.is_none_or(|kind| kind == bp.kind)
            && self.handle.is_none_or(|h| h == handle)
    }
}

impl<P: Platform> BreakpointEngine<P> {
    /// Finds the first context breakpoint in `set` matching `filter`, with its index.
    pub(crate) fn set_find(&self, set: Set, filter: Filter) -> Option<(Handle, usize)> {
        set.iter(&self.contexts)
            .enumerate()
            .find(|&(_, h)| filter.matches(h, &self.contexts[h]))
            .map(|(index, h)| (h, index))
    }

    /// Takes a context breakpoint record from the free pool and fills it in.
    pub(crate) fn context_create(
        &mut self,
        bp: ContextBreakpoint<P::InterruptState>,
    ) -> Result<Handle, BreakpointError> {
        let handle = self
            .free_contexts
            .remove(&mut self.contexts, Location::Default(NodeId::Any))
            .map_err(|_| BreakpointError::OutOfMemory)?;

        log::trace!("context breakpoint {handle:?} is {:?} for {:?}", bp.kind, bp.scope);
        self.contexts[handle] = bp;
        Ok(handle)
    }

    /// Returns a detached context breakpoint record to the free pool.
    pub(crate) fn context_delete(&mut self, handle: Handle) -> Result<(), BreakpointError> {
        self.free_contexts
            .add(&mut self.contexts, Location::Default(NodeId::Any), 0, handle)?;
        Ok(())
    }

    /// Clears every aux and twin link pointing at `target`.
    ///
    /// Free records are swept as well, which is harmless since they are overwritten before reuse.
    pub(crate) fn erase_references(&mut self, target: Handle) {
        for h in self.contexts.handles() {
            let bp = &mut self.contexts[h];
            if bp.aux == Some(target) {
                bp.aux = None;
            }
            if bp.twin == Some(target) {
                bp.twin = None;
            }
        }
    }

    /// Returns the set an [`Owner`] refers to.
    pub(crate) fn context_set(&self, owner: Owner) -> Set {
        match owner {
            Owner::Address(address) => self.addresses[address].contexts,
            Owner::HardwareStep => self.hw_step_contexts,
        }
    }

    /// Links the context breakpoint `ctx` into `owner`'s set, filed under `scope`.
    pub(crate) fn link_context(
        &mut self,
        owner: Owner,
        scope: ExecScope,
        ctx: Handle,
    ) -> Result<(), BreakpointError> {
        let set = match owner {
            Owner::Address(address) => &mut self.addresses[address].contexts,
            Owner::HardwareStep => &mut self.hw_step_contexts,
        };
        set.add(
            &mut self.contexts,
            Location::Default(NodeId::Any),
            scope.key(),
            ctx,
        )?;
        Ok(())
    }

    /// Unlinks the context breakpoint `ctx` from `owner`'s set, preferring `index` when it's
    /// still accurate.
    pub(crate) fn unlink_context(
        &mut self,
        owner: Owner,
        ctx: Handle,
        index: usize,
    ) -> Result<(), BreakpointError> {
        let set = match owner {
            Owner::Address(address) => &mut self.addresses[address].contexts,
            Owner::HardwareStep => &mut self.hw_step_contexts,
        };

        let index = if set.find(&self.contexts, Location::Index(index)) == Ok(ctx) {
            index
        } else {
            set.iter(&self.contexts)
                .position(|h| h == ctx)
                .ok_or(BreakpointError::InvalidBreakpoint)?
        };

        set.remove(&mut self.contexts, Location::Index(index))?;
        Ok(())
    }
}
