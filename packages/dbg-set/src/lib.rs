//! Fixed-capacity ordered sets.
//!
//! A [`Set`] is a doubly-linked ring threaded through the nodes of an [`Arena`]. Several sets can
//! share one arena, which is how records move between a free pool and the sets that use them
//! without ever being copied or allocated. A node belongs to at most one set at a time.
//!
//! Every node's `next`/`prev` links are always valid. A detached node or the only node of a set
//! points at itself, so linking and unlinking never has to special-case a boundary.
//!
//! Sets are addressed with a [`Location`]:
//!
//! - [`Location::Head`] and [`Location::Tail`] scan from either end for a [`NodeId`].
//! - [`Location::Next`] and [`Location::Prev`] step around the ring from a known node.
//! - [`Location::NextLinear`] and [`Location::PrevLinear`] do the same, but stop at the tail and
//!   head respectively.
//! - [`Location::Index`] walks forward from the head.
//! - [`Location::Default`] picks an end according to the set's [`Behavior`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::{
    fmt,
    ops::{Index, IndexMut},
};

use snafu::Snafu;

/// An error returned by a set operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum SetError {
    /// The requested node is not in the set.
    ResourceUnavailable,
    /// The location is not supported by this operation.
    Failed,
}

/// A reference to a node in an [`Arena`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(usize);

impl Handle {
    /// Creates a handle referring to the node at `index`.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the position of the node inside its arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A node identifier used to search a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeId {
    /// Matches the first node scanned.
    Any,
    /// Matches nodes added with this id.
    Id(usize),
}

/// The default ordering of a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    /// First in, first out. Default removals take the head.
    #[default]
    Fifo,
    /// Last in, first out. Default removals take the tail.
    Lifo,
    /// Caller-managed ordering. Default removals take the head.
    Ordered,
}

/// A position inside a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Scan forward from the head for a node.
    Head(NodeId),
    /// Scan backward from the tail for a node.
    Tail(NodeId),
    /// The node following the given node, wrapping around from tail to head.
    Next(Handle),
    /// The node preceding the given node, wrapping around from head to tail.
    Prev(Handle),
    /// The node following the given node. Fails at the tail.
    NextLinear(Handle),
    /// The node preceding the given node. Fails at the head.
    PrevLinear(Handle),
    /// The node this many steps forward from the head.
    Index(usize),
    /// The end chosen by the set's [`Behavior`].
    Default(NodeId),
}

#[derive(Debug, Clone, Copy)]
struct Links {
    next: Handle,
    prev: Handle,
    id: Option<usize>,
}

impl Links {
    const fn detached(node: Handle) -> Self {
        Self {
            next: node,
            prev: node,
            id: None,
        }
    }
}

/// Fixed-capacity storage for the nodes of one or more sets.
pub struct Arena<T> {
    links: Vec<Links>,
    values: Vec<T>,
}

impl<T> Arena<T> {
    /// Creates an arena of `len` detached nodes, building each value with `f`.
    ///
    /// This is the only place an arena allocates.
    pub fn from_fn(len: usize, mut f: impl FnMut(Handle) -> T) -> Self {
        Self {
            links: (0..len).map(|i| Links::detached(Handle(i))).collect(),
            values: (0..len).map(|i| f(Handle(i))).collect(),
        }
    }

    /// Returns the number of nodes in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns whether the arena has no nodes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the value stored in a node, if the handle belongs to this arena.
    #[must_use]
    pub fn get(&self, node: Handle) -> Option<&T> {
        self.values.get(node.0)
    }

    /// Returns the value stored in a node mutably, if the handle belongs to this arena.
    pub fn get_mut(&mut self, node: Handle) -> Option<&mut T> {
        self.values.get_mut(node.0)
    }

    /// Returns the id a node was added to its set with, or `None` if it is detached.
    #[must_use]
    pub fn node_id(&self, node: Handle) -> Option<usize> {
        self.links[node.0].id
    }

    /// Iterates over every handle in the arena, linked or not.
    pub fn handles(&self) -> impl Iterator<Item = Handle> + use<T> {
        (0..self.values.len()).map(Handle)
    }

    fn next(&self, node: Handle) -> Handle {
        self.links[node.0].next
    }

    fn prev(&self, node: Handle) -> Handle {
        self.links[node.0].prev
    }
}

impl<T> Index<Handle> for Arena<T> {
    type Output = T;

    fn index(&self, node: Handle) -> &T {
        &self.values[node.0]
    }
}

impl<T> IndexMut<Handle> for Arena<T> {
    fn index_mut(&mut self, node: Handle) -> &mut T {
        &mut self.values[node.0]
    }
}

impl<T: fmt::Debug> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.handles().map(|h| (h, &self.values[h.0])))
            .finish()
    }
}

/// An ordered set of nodes living in an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Set {
    head: Option<Handle>,
    count: usize,
    behavior: Behavior,
}

impl Default for Set {
    fn default() -> Self {
        Self::new(Behavior::default())
    }
}

impl Set {
    /// Creates an empty set.
    #[must_use]
    pub const fn new(behavior: Behavior) -> Self {
        Self {
            head: None,
            count: 0,
            behavior,
        }
    }

    /// Forgets every node and resets the set's behavior.
    ///
    /// Nodes that were linked keep their stale links, so this is only meant for sets whose
    /// nodes are about to be rebuilt.
    pub const fn initialize(&mut self, behavior: Behavior) {
        *self = Self::new(behavior);
    }

    /// Returns the number of nodes in the set.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Returns whether the set has no nodes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Returns the behavior used to resolve [`Location::Default`].
    #[must_use]
    pub const fn behavior(&self) -> Behavior {
        self.behavior
    }

    /// Returns the first node in the set.
    #[must_use]
    pub const fn head(&self) -> Option<Handle> {
        self.head
    }

    /// Returns the last node in the set.
    #[must_use]
    pub fn tail<T>(&self, arena: &Arena<T>) -> Option<Handle> {
        self.head.map(|head| arena.prev(head))
    }

    /// Iterates over the set's nodes from head to tail.
    pub fn iter<'a, T>(&self, arena: &'a Arena<T>) -> Iter<'a, T> {
        Iter {
            arena,
            next: self.head,
            remaining: self.count,
        }
    }

    /// Returns whether `node` is linked into this set.
    #[must_use]
    pub fn contains<T>(&self, arena: &Arena<T>, node: Handle) -> bool {
        self.iter(arena).any(|h| h == node)
    }

    /// Locates a node.
    ///
    /// # Errors
    ///
    /// - [`SetError::ResourceUnavailable`] if no node exists at the location.
    pub fn find<T>(&self, arena: &Arena<T>, location: Location) -> Result<Handle, SetError> {
        match self.resolve_remove(location) {
            Location::Head(id) => self.find_id(arena, id, true),
            Location::Tail(id) => self.find_id(arena, id, false),
            Location::Next(node) => self.find_adjacent(arena, node, true),
            Location::Prev(node) => self.find_adjacent(arena, node, false),
            Location::NextLinear(node) => {
                if self.tail(arena) == Some(node) {
                    return Err(SetError::ResourceUnavailable);
                }
                self.find_adjacent(arena, node, true)
            }
            Location::PrevLinear(node) => {
                if self.head == Some(node) {
                    return Err(SetError::ResourceUnavailable);
                }
                self.find_adjacent(arena, node, false)
            }
            Location::Index(index) => self.find_index(arena, index),
            Location::Default(_) => Err(SetError::Failed),
        }
    }

    /// Links a detached node into the set and tags it with `id`.
    ///
    /// [`Location::Head`] and [`Location::Tail`] add at that end (their [`NodeId`] is ignored);
    /// [`Location::Default`] always adds at the tail. The adjacent locations insert next to the
    /// given anchor node: inserting after the tail extends the tail, and inserting before the head
    /// becomes the new head.
    ///
    /// # Errors
    ///
    /// - [`SetError::Failed`] for [`Location::Index`].
    /// - [`SetError::ResourceUnavailable`] when inserting next to an anchor in an empty set.
    pub fn add<T>(
        &mut self,
        arena: &mut Arena<T>,
        location: Location,
        id: usize,
        node: Handle,
    ) -> Result<(), SetError> {
        let location = match location {
            Location::Default(_) => Location::Tail(NodeId::Any),
            other => other,
        };

        match location {
            Location::Head(_) => self.add_to_end(arena, node, true),
            Location::Tail(_) => self.add_to_end(arena, node, false),
            Location::Next(anchor) | Location::NextLinear(anchor) => {
                self.add_adjacent(arena, anchor, node, true)?;
            }
            Location::Prev(anchor) | Location::PrevLinear(anchor) => {
                self.add_adjacent(arena, anchor, node, false)?;
            }
            Location::Index(_) | Location::Default(_) => return Err(SetError::Failed),
        }

        arena.links[node.0].id = Some(id);
        self.count += 1;
        log::trace!("set add {node:?} (id {id}), count {}", self.count);

        Ok(())
    }

    /// Unlinks and returns the node at `location`.
    ///
    /// The removed node is left detached with no id.
    ///
    /// # Errors
    ///
    /// - [`SetError::ResourceUnavailable`] if no node exists at the location.
    pub fn remove<T>(
        &mut self,
        arena: &mut Arena<T>,
        location: Location,
    ) -> Result<Handle, SetError> {
        let node = self.find(arena, location)?;
        self.unlink(arena, node);
        log::trace!("set remove {node:?}, count {}", self.count);

        Ok(node)
    }

    const fn resolve_remove(&self, location: Location) -> Location {
        match location {
            Location::Default(id) => match self.behavior {
                Behavior::Lifo => Location::Tail(id),
                Behavior::Fifo | Behavior::Ordered => Location::Head(id),
            },
            other => other,
        }
    }

    fn find_id<T>(
        &self,
        arena: &Arena<T>,
        id: NodeId,
        from_head: bool,
    ) -> Result<Handle, SetError> {
        let Some(head) = self.head else {
            return Err(SetError::ResourceUnavailable);
        };
        let start = if from_head { head } else { arena.prev(head) };

        let NodeId::Id(id) = id else {
            return Ok(start);
        };

        let mut node = start;
        loop {
            if arena.links[node.0].id == Some(id) {
                return Ok(node);
            }

            node = if from_head {
                arena.next(node)
            } else {
                arena.prev(node)
            };

            if node == start {
                return Err(SetError::ResourceUnavailable);
            }
        }
    }

    fn find_adjacent<T>(
        &self,
        arena: &Arena<T>,
        node: Handle,
        forward: bool,
    ) -> Result<Handle, SetError> {
        if self.is_empty() {
            return Err(SetError::ResourceUnavailable);
        }

        Ok(if forward {
            arena.next(node)
        } else {
            arena.prev(node)
        })
    }

    fn find_index<T>(&self, arena: &Arena<T>, index: usize) -> Result<Handle, SetError> {
        if index >= self.count {
            return Err(SetError::ResourceUnavailable);
        }

        self.iter(arena)
            .nth(index)
            .ok_or(SetError::ResourceUnavailable)
    }

    fn add_to_end<T>(&mut self, arena: &mut Arena<T>, node: Handle, at_head: bool) {
        let Some(head) = self.head else {
            arena.links[node.0] = Links::detached(node);
            self.head = Some(node);
            return;
        };
        let tail = arena.prev(head);

        arena.links[node.0].next = head;
        arena.links[node.0].prev = tail;
        arena.links[tail.0].next = node;
        arena.links[head.0].prev = node;

        if at_head {
            self.head = Some(node);
        }
    }

    fn add_adjacent<T>(
        &mut self,
        arena: &mut Arena<T>,
        anchor: Handle,
        node: Handle,
        after: bool,
    ) -> Result<(), SetError> {
        if self.is_empty() {
            return Err(SetError::ResourceUnavailable);
        }

        if after {
            let next = arena.next(anchor);
            arena.links[node.0].prev = anchor;
            arena.links[node.0].next = next;
            arena.links[next.0].prev = node;
            arena.links[anchor.0].next = node;
        } else {
            let prev = arena.prev(anchor);
            arena.links[node.0].prev = prev;
            arena.links[node.0].next = anchor;
            arena.links[prev.0].next = node;
            arena.links[anchor.0].prev = node;

            if self.head == Some(anchor) {
                self.head = Some(node);
            }
        }

        Ok(())
    }

    fn unlink<T>(&mut self, arena: &mut Arena<T>, node: Handle) {
        let Links { next, prev, .. } = arena.links[node.0];

        if next == node {
            self.head = None;
        } else {
            arena.links[prev.0].next = next;
            arena.links[next.0].prev = prev;

            if self.head == Some(node) {
                self.head = Some(next);
            }
        }

        arena.links[node.0] = Links::detached(node);
        self.count = self.count.saturating_sub(1);
    }
}

/// An iterator over the handles of a [`Set`], from head to tail.
pub struct Iter<'a, T> {
    arena: &'a Arena<T>,
    next: Option<Handle>,
    remaining: usize,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = Handle;

    fn next(&mut self) -> Option<Handle> {
        if self.remaining == 0 {
            return None;
        }

        let node = self.next?;
        self.remaining -= 1;
        self.next = Some(self.arena.next(node));

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}
