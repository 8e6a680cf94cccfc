//! Passes: named transformations over the builder's node chain.
//!
//! Passes are registered on a builder in order and executed by
//! [`Builder::run_passes`]. Each run gets a [`ScratchArena`] that is reset
//! before and after the call — nothing allocated from it may outlive
//! `run`, which the `&mut` borrow already guarantees.
//!
//! [`Builder::run_passes`]: crate::Builder::run_passes

use crate::arena::ByteArena;
use crate::builder::Builder;
use crate::error::Error;
use crate::node::NodeId;

/// A named transformation over the node chain.
///
/// A pass may keep state between registration and `run` (the SSE→AVX pass
/// keeps its `translated` flag). It sees the full chain as of `run` entry
/// and may mutate it freely, as long as it does not invalidate its own
/// iteration.
pub trait Pass {
    /// Registry key; used by `pass_by_name` and `delete_pass`.
    fn name(&self) -> &'static str;

    /// Transform the chain. Returning an error aborts the pipeline and
    /// latches the builder.
    fn run(&mut self, cb: &mut Builder, scratch: &mut ScratchArena) -> Result<(), Error>;
}

/// Per-run scratch storage handed to every pass.
///
/// The byte arena and the node stack are reset around each `run`, so a
/// pass can treat them as its own. Per-node scratch (what would be an
/// opaque pointer slot on each node) is a [`NodeMap`] the pass creates
/// inside `run`; dropping it at return reclaims it with everything else.
#[derive(Default)]
pub struct ScratchArena {
    pub bytes: ByteArena,
    /// Reusable work stack for chain walks.
    pub node_stack: Vec<NodeId>,
}

impl ScratchArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.bytes.reset(false);
        self.node_stack.clear();
    }
}

/// Sparse side table keyed by node handle — the per-pass scratch slot.
///
/// The pass that creates it exclusively owns it; it never outlives `run`.
pub struct NodeMap<T> {
    slots: Vec<Option<T>>,
}

impl<T> NodeMap<T> {
    pub fn new() -> Self {
        NodeMap { slots: Vec::new() }
    }

    pub fn insert(&mut self, id: NodeId, value: T) {
        if self.slots.len() <= id.index() {
            self.slots.resize_with(id.index() + 1, || None);
        }
        self.slots[id.index()] = Some(value);
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn take(&mut self, id: NodeId) -> Option<T> {
        self.slots.get_mut(id.index()).and_then(Option::take)
    }
}

impl<T> Default for NodeMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
