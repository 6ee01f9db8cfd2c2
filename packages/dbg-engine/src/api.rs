//! Setting, finding and clearing breakpoints.

use dbg_os::{EvalFn, ExecScope, HitFn, Platform, ThreadId};
use dbg_set::{Handle, Location, NodeId};

use crate::{
    AddressState, BreakpointEngine, BreakpointError, BreakpointType, ContextBreakpoint,
    context::{Filter, Owner},
};

/// Everything needed to set a breakpoint.
#[derive(Debug, Clone, Copy)]
pub struct BreakpointParams {
    /// The tagged address to trap on.
    pub address: usize,
    /// Which threads trigger the breakpoint. [`ExecScope::None`] is rejected.
    pub hit_scope: ExecScope,
    /// What to stop when the breakpoint triggers.
    pub stop_scope: ExecScope,
    /// Decides whether a hit counts. `None` always counts.
    pub eval: Option<EvalFn>,
    /// Passed to [`eval`](Self::eval).
    pub eval_param: usize,
    /// Called after execution has been stopped.
    pub hit: Option<HitFn>,
    /// Passed to [`hit`](Self::hit).
    pub hit_param: usize,
    /// How many counted hits to ignore before stopping.
    pub pass_count: u32,
    /// What the pass count is reset to after each stop.
    pub pass_cycle: u32,
    /// How many stops before the breakpoint removes itself. Zero means never.
    pub hit_count: u32,
}

impl BreakpointParams {
    /// A breakpoint at `address` that triggers for `scope` and stops the same scope.
    #[must_use]
    pub const fn new(address: usize, scope: ExecScope) -> Self {
        Self {
            address,
            hit_scope: scope,
            stop_scope: scope,
            eval: None,
            eval_param: 0,
            hit: None,
            hit_param: 0,
            pass_count: 0,
            pass_cycle: 0,
            hit_count: 0,
        }
    }

    /// Changes what is stopped when the breakpoint triggers.
    #[must_use]
    pub const fn with_stop(mut self, scope: ExecScope) -> Self {
        self.stop_scope = scope;
        self
    }

    /// Makes the breakpoint conditional.
    #[must_use]
    pub const fn with_eval(mut self, eval: EvalFn, param: usize) -> Self {
        self.eval = Some(eval);
        self.eval_param = param;
        self
    }

    /// Sets the callback made after stopping.
    #[must_use]
    pub const fn with_hit(mut self, hit: HitFn, param: usize) -> Self {
        self.hit = Some(hit);
        self.hit_param = param;
        self
    }

    /// Ignores `count` hits at first, then `cycle` hits after every stop.
    #[must_use]
    pub const fn with_pass(mut self, count: u32, cycle: u32) -> Self {
        self.pass_count = count;
        self.pass_cycle = cycle;
        self
    }

    /// Removes the breakpoint after it has stopped execution `count` times.
    #[must_use]
    pub const fn with_hit_count(mut self, count: u32) -> Self {
        self.hit_count = count;
        self
    }
}

/// A context breakpoint located by [`BreakpointEngine::find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Found {
    /// The address breakpoint.
    pub address: Handle,
    /// The context breakpoint.
    pub context: Handle,
    /// The context breakpoint's position among its address's contexts.
    pub index: usize,
}

impl<P: Platform> BreakpointEngine<P> {
    /// Sets a breakpoint and patches its address.
    ///
    /// # Errors
    ///
    /// - [`BreakpointError::OutOfMemory`] if fewer than two address breakpoints are free, so that
    ///   there is always room to step off an existing breakpoint.
    /// - [`BreakpointError::InvalidThread`] if the hit scope is [`ExecScope::None`].
    /// - [`BreakpointError::AlreadyExists`] if the address already has a breakpoint for the
    ///   same hit scope.
    pub fn set(&mut self, os: &mut P, params: BreakpointParams) -> Result<(), BreakpointError> {
        critical_section::with(|_| self.set_unlocked(os, params))
    }

    pub(crate) fn set_unlocked(
        &mut self,
        os: &mut P,
        params: BreakpointParams,
    ) -> Result<(), BreakpointError> {
        if self.count_free_addresses(2) < 2 {
            return Err(BreakpointError::OutOfMemory);
        }

        let thread = match params.hit_scope {
            ExecScope::None => return Err(BreakpointError::InvalidThread),
            ExecScope::All | ExecScope::Any => None,
            ExecScope::Thread(thread) => Some(thread),
        };

        let bp = ContextBreakpoint {
            eval: params.eval,
            eval_param: params.eval_param,
            hit: params.hit,
            hit_param: params.hit_param,
            pass_count: params.pass_count,
            pass_cycle: params.pass_cycle,
            hit_count: params.hit_count,
            ..ContextBreakpoint::new(
                params.hit_scope,
                thread,
                BreakpointType::Active,
                params.stop_scope,
            )
        };
        let (address, _) = self.breakpoint_create(os, params.address, bp)?;

        if self.addresses[address].state == AddressState::Inactive {
            self.activate(os, address)?;
        }

        log::debug!(
            "set breakpoint at {:#x} for {:?}",
            params.address,
            params.hit_scope
        );
        Ok(())
    }

    /// Finds the breakpoint at exactly `addr` for `scope`. [`ExecScope::None`] matches any
    /// scope.
    ///
    /// # Errors
    ///
    /// - [`BreakpointError::ResourceUnavailable`] if there is no such breakpoint.
    pub fn find(&self, addr: usize, scope: ExecScope) -> Result<Found, BreakpointError> {
        self.active_addresses
            .iter(&self.addresses)
            .filter(|&a| self.addresses[a].address == addr)
            .find_map(|address| {
                self.addresses[address]
                    .contexts
                    .iter(&self.contexts)
                    .enumerate()
                    .find(|&(_, ctx)| {
                        scope == ExecScope::None || self.contexts[ctx].scope == scope
                    })
                    .map(|(index, context)| Found {
                        address,
                        context,
                        index,
                    })
            })
            .ok_or(BreakpointError::ResourceUnavailable)
    }

    /// Removes every breakpoint at `addr` for `scope`. [`ExecScope::None`] removes all of them.
    ///
    /// Clearing an address with no breakpoints succeeds.
    ///
    /// # Errors
    ///
    /// Returns the platform's error if an instruction can't be restored.
    pub fn clear(
        &mut self,
        os: &mut P,
        addr: usize,
        scope: ExecScope,
    ) -> Result<(), BreakpointError> {
        critical_section::with(|_| loop {
            match self.find(addr, scope) {
                Ok(found) => self.breakpoint_remove(os, found.address, found.context, found.index)?,
                Err(BreakpointError::ResourceUnavailable) => return Ok(()),
                Err(err) => return Err(err),
            }
        })
    }

    /// Removes every pending single-step breakpoint for `thread`, or for everyone if `thread`
    /// is `None`.
    ///
    /// # Errors
    ///
    /// Returns the platform's error if an instruction can't be restored.
    pub fn remove_temporary(
        &mut self,
        os: &mut P,
        thread: Option<ThreadId>,
    ) -> Result<(), BreakpointError> {
        critical_section::with(|_| self.remove_temporary_unlocked(os, thread))
    }

    pub(crate) fn remove_temporary_unlocked(
        &mut self,
        os: &mut P,
        thread: Option<ThreadId>,
    ) -> Result<(), BreakpointError> {
        let filter = Filter {
            kind: Some(BreakpointType::SingleStep),
            ..Filter::thread(thread)
        };

        let mut cursor = self.active_addresses.head();
        while let Some(address) = cursor {
            cursor = self
                .active_addresses
                .find(&self.addresses, Location::NextLinear(address))
                .ok();

            let owner = Owner::Address(address);
            self.purge(owner, filter)?;
            if self.addresses[address].contexts.is_empty() {
                self.address_remove(os, address)?;
            }
        }

        self.purge(Owner::HardwareStep, filter)
    }

    /// Removes every breakpoint and restores every patched instruction.
    ///
    /// Calling this with nothing set succeeds.
    ///
    /// # Errors
    ///
    /// Returns the platform's error if an instruction can't be restored.
    pub fn remove_all(&mut self, os: &mut P) -> Result<(), BreakpointError> {
        critical_section::with(|_| {
            while let Some(address) = self.active_addresses.head() {
                self.purge(Owner::Address(address), Filter::any())?;
                self.address_remove(os, address)?;
            }
            self.purge(Owner::HardwareStep, Filter::any())
        })
    }

    /// Deletes every context breakpoint in `owner`'s set that matches `filter`.
    fn purge(&mut self, owner: Owner, filter: Filter) -> Result<(), BreakpointError> {
        while let Some((ctx, index)) = self.set_find(self.context_set(owner), filter) {
            self.unlink_context(owner, ctx, index)?;
            self.erase_references(ctx);
            self.context_delete(ctx)?;
        }
        Ok(())
    }

    /// Attaches a context breakpoint to the address breakpoint for `addr`, creating the address
    /// breakpoint if needed.
    ///
    /// Nothing is left behind on failure.
    pub(crate) fn breakpoint_create(
        &mut self,
        os: &P,
        addr: usize,
        bp: ContextBreakpoint<P::InterruptState>,
    ) -> Result<(Handle, Handle), BreakpointError> {
        let (address, created) = match self.find_address(addr) {
            Some(address) => {
                let key = NodeId::Id(bp.scope.key());
                if self.addresses[address]
                    .contexts
                    .find(&self.contexts, Location::Head(key))
                    .is_ok()
                {
                    return Err(BreakpointError::AlreadyExists);
                }
                (address, false)
            }
            None => (self.address_create(os, addr)?, true),
        };

        let context = match self.context_create(ContextBreakpoint {
            address: Some(address),
            ..bp
        }) {
            Ok(context) => context,
            Err(err) => {
                if created {
                    self.discard_address(address);
                }
                return Err(err);
            }
        };
        self.link_context(Owner::Address(address), bp.scope, context)?;

        Ok((address, context))
    }

    /// Returns a never-activated address breakpoint straight to the free pool.
    pub(crate) fn discard_address(&mut self, address: Handle) {
        let Some(index) = self
            .active_addresses
            .iter(&self.addresses)
            .position(|h| h == address)
        else {
            return;
        };

        if self
            .active_addresses
            .remove(&mut self.addresses, Location::Index(index))
            .is_ok()
            && self
                .free_addresses
                .add(&mut self.addresses, Location::Head(NodeId::Any), 0, address)
                .is_err()
        {
            log::error!("lost address breakpoint {address:?}");
        }
    }

    /// Removes one context breakpoint, and its address breakpoint if it was the last one.
    pub(crate) fn breakpoint_remove(
        &mut self,
        os: &mut P,
        address: Handle,
        context: Handle,
        index: usize,
    ) -> Result<(), BreakpointError> {
        self.unlink_context(Owner::Address(address), context, index)?;
        self.erase_references(context);
        self.context_delete(context)?;

        if self.addresses[address].contexts.is_empty() {
            self.address_remove(os, address)?;
        }
        Ok(())
    }
}
