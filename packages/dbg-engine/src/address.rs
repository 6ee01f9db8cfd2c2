//! Address breakpoints: one per patched instruction.

use dbg_os::{Instruction, Platform};
use dbg_set::{Behavior, Handle, Location, NodeId, Set};

use crate::{BreakpointEngine, BreakpointError};

/// How an address breakpoint stops execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// The instruction is replaced with one that raises the breakpoint exception.
    Isr,
}

/// Whether an address breakpoint's trap instruction is currently in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressState {
    /// Memory holds the program's own instruction.
    Inactive,
    /// Memory holds the trap instruction.
    Active,
}

/// A patched (or patchable) instruction address and the context breakpoints attached to it.
#[derive(Debug, Clone, Copy)]
pub struct AddressBreakpoint {
    pub(crate) address: usize,
    pub(crate) saved: Option<Instruction>,
    pub(crate) kind: AddressKind,
    pub(crate) state: AddressState,
    pub(crate) contexts: Set,
}

impl AddressBreakpoint {
    pub(crate) const fn vacant() -> Self {
        Self {
            address: 0,
            saved: None,
            kind: AddressKind::Isr,
            state: AddressState::Inactive,
            contexts: Set::new(Behavior::Fifo),
        }
    }

    /// The tagged address of the instruction.
    #[must_use]
    pub const fn address(&self) -> usize {
        self.address
    }

    /// The program's instruction, as last read before patching.
    #[must_use]
    pub const fn saved_opcode(&self) -> Option<Instruction> {
        self.saved
    }

    /// How the breakpoint traps.
    #[must_use]
    pub const fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Whether the trap instruction is in memory.
    #[must_use]
    pub const fn state(&self) -> AddressState {
        self.state
    }

    /// The number of context breakpoints attached to this address.
    #[must_use]
    pub const fn context_count(&self) -> usize {
        self.contexts.count()
    }
}

impl<P: Platform> BreakpointEngine<P> {
    /// Finds the active address breakpoint for `addr`, also matching a Thumb-tagged `addr | 1`.
    pub(crate) fn find_address(&self, addr: usize) -> Option<Handle> {
        self.active_addresses
            .iter(&self.addresses)
            .find(|&h| {
                let found = self.addresses[h].address;
                found == addr || found == addr | 1
            })
    }

    /// Counts free address breakpoints, stopping early once `at_least` have been seen.
    ///
    /// `at_least == 0` counts all of them.
    pub(crate) fn count_free_addresses(&self, at_least: usize) -> usize {
        let free = self.free_addresses.iter(&self.addresses);
        if at_least == 0 {
            free.count()
        } else {
            free.take(at_least).count()
        }
    }

    /// Claims a free address breakpoint for `addr` and snapshots the instruction there.
    ///
    /// The new breakpoint starts out inactive with no contexts.
    pub(crate) fn address_create(
        &mut self,
        os: &P,
        addr: usize,
    ) -> Result<Handle, BreakpointError> {
        if self.find_address(addr).is_some() {
            return Err(BreakpointError::AlreadyExists);
        }

        let handle = self
            .free_addresses
            .remove(&mut self.addresses, Location::Head(NodeId::Any))
            .map_err(|_| BreakpointError::OutOfMemory)?;

        let saved = match os.read_opcode(addr) {
            Ok(opcode) => opcode,
            Err(err) => {
                self.free_addresses
                    .add(&mut self.addresses, Location::Head(NodeId::Any), 0, handle)?;
                return Err(err.into());
            }
        };

        self.addresses[handle] = AddressBreakpoint {
            address: addr,
            saved: Some(saved),
            ..AddressBreakpoint::vacant()
        };
        self.active_addresses
            .add(&mut self.addresses, Location::Head(NodeId::Any), addr, handle)?;

        log::debug!("created address breakpoint at {addr:#x}");
        Ok(handle)
    }

    /// Writes the trap instruction over an inactive address breakpoint.
    pub(crate) fn activate(&mut self, os: &mut P, handle: Handle) -> Result<(), BreakpointError> {
        let bp = self.addresses[handle];
        if bp.state == AddressState::Active {
            log::warn!("breakpoint at {:#x} is already active", bp.address);
            return Ok(());
        }

        // The program may have rewritten itself since the last snapshot.
        let saved = os.read_opcode(bp.address)?;
        let trap = os.breakpoint_opcode(bp.address)?;
        os.write_opcode(bp.address, trap)?;

        let bp = &mut self.addresses[handle];
        bp.saved = Some(saved);
        bp.state = AddressState::Active;

        log::debug!("activated breakpoint at {:#x}", bp.address);
        Ok(())
    }

    /// Puts the program's instruction back under an active address breakpoint.
    pub(crate) fn deactivate(
        &mut self,
        os: &mut P,
        handle: Handle,
    ) -> Result<(), BreakpointError> {
        let bp = self.addresses[handle];
        let (AddressState::Active, Some(saved)) = (bp.state, bp.saved) else {
            log::debug!("breakpoint at {:#x} is already inactive", bp.address);
            return Ok(());
        };

        os.write_opcode(bp.address, saved)?;
        self.addresses[handle].state = AddressState::Inactive;

        log::debug!("deactivated breakpoint at {:#x}", bp.address);
        Ok(())
    }

    /// Unpatches an address breakpoint and returns it to the free pool.
    ///
    /// The record is reclaimed even when restoring the instruction fails, in which case the
    /// platform's error is returned afterwards.
    pub(crate) fn address_remove(
        &mut self,
        os: &mut P,
        handle: Handle,
    ) -> Result<(), BreakpointError> {
        let index = self
            .active_addresses
            .iter(&self.addresses)
            .position(|h| h == handle)
            .ok_or(BreakpointError::InvalidBreakpoint)?;
        self.active_addresses
            .remove(&mut self.addresses, Location::Index(index))?;

        let restored = self.deactivate(os, handle);
        if restored.is_err() {
            self.addresses[handle].state = AddressState::Inactive;
        }

        self.free_addresses
            .add(&mut self.addresses, Location::Head(NodeId::Any), 0, handle)?;

        log::debug!(
            "removed address breakpoint at {:#x}",
            self.addresses[handle].address
        );
        restored
    }
}
