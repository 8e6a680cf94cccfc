//! The deferred emitter.
//!
//! `Builder` implements the [`Emitter`] contract without producing a
//! single machine byte: every call is recorded as a node in an ordered,
//! doubly-linked chain. Registered passes may rewrite the chain, and
//! [`serialize`] finally replays it into a real emitter.
//!
//! The chain lives in a node slab, payload bytes in a data arena; both
//! are owned by the builder and reclaimed together. A cursor marks the
//! insertion site: `add_node` inserts after the cursor and advances it,
//! so emission order equals chain order.
//!
//! Errors are sticky. The first failure latches and every later emission
//! entry point returns it unchanged until the builder is rebound to a
//! fresh code-holder via [`attach`].
//!
//! [`serialize`]: Builder::serialize
//! [`attach`]: Builder::attach

use tracing::debug;

use crate::arena::ByteArena;
use crate::code_holder::{CodeHolder, LabelKind};
use crate::const_pool::ConstPool;
use crate::emitter::{AlignMode, EmitOptions, Emitter, InstValidator};
use crate::error::Error;
use crate::inst::{InstDb, InstId};
use crate::node::{
    AlignNode, ConstPoolNode, DataNode, InstNode, LabelNode, Node, NodeArena, NodeFlags, NodeId,
    NodeKind,
};
use crate::operand::{Label, LabelId, Operand};
use crate::pass::{Pass, ScratchArena};

pub struct Builder {
    nodes: NodeArena,
    data: ByteArena,
    scratch: ScratchArena,
    passes: Vec<Box<dyn Pass>>,

    /// Label id → label node, sparse. Entries are `None` for ids the
    /// holder issued to other emitters or that this builder never saw.
    labels: Vec<Option<NodeId>>,

    first: Option<NodeId>,
    last: Option<NodeId>,
    cursor: Option<NodeId>,

    /// OR-ed into the flags of every newly created node.
    node_flags: NodeFlags,

    error: Option<Error>,

    holder: Option<Box<dyn CodeHolder>>,
    validator: Option<Box<dyn InstValidator>>,

    // One-shot state consumed by the next `emit`.
    options: EmitOptions,
    inline_comment: Option<crate::arena::Span>,
    op4: Operand,
    op5: Operand,
    op_extra: Operand,
}

impl Builder {
    /// A detached builder. Most operations need a code-holder; see
    /// [`attach`].
    ///
    /// [`attach`]: Builder::attach
    pub fn new() -> Self {
        Builder {
            nodes: NodeArena::new(),
            data: ByteArena::new(),
            scratch: ScratchArena::new(),
            passes: Vec::new(),
            labels: Vec::new(),
            first: None,
            last: None,
            cursor: None,
            node_flags: NodeFlags::empty(),
            error: None,
            holder: None,
            validator: None,
            options: EmitOptions::empty(),
            inline_comment: None,
            op4: Operand::None,
            op5: Operand::None,
            op_extra: Operand::None,
        }
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Bind to a code-holder. All builder state is reset first — the node
    /// chain, both payload arenas, the label map, registered passes, the
    /// node-flag template, and the error latch.
    pub fn attach(&mut self, holder: Box<dyn CodeHolder>) {
        self.reset_state();
        debug!("builder attached to code holder");
        self.holder = Some(holder);
    }

    /// Unbind, returning the holder. The builder resets to its detached
    /// state.
    pub fn detach(&mut self) -> Option<Box<dyn CodeHolder>> {
        let holder = self.holder.take();
        self.reset_state();
        if holder.is_some() {
            debug!("builder detached from code holder");
        }
        holder
    }

    fn reset_state(&mut self) {
        self.nodes.reset();
        self.data.reset(false);
        self.scratch.reset();
        self.passes.clear();
        self.labels.clear();
        self.first = None;
        self.last = None;
        self.cursor = None;
        self.node_flags = NodeFlags::empty();
        self.error = None;
        self.reset_one_shot();
    }

    /// Install the validator consulted by
    /// [`EmitOptions::STRICT_VALIDATION`] emissions.
    pub fn set_validator(&mut self, validator: Box<dyn InstValidator>) {
        self.validator = Some(validator);
    }

    pub fn code_holder(&self) -> Option<&dyn CodeHolder> {
        self.holder.as_deref()
    }

    // ─── Error latch ────────────────────────────────────────────────────────

    /// The latched error, if any. Once set, every emission entry point
    /// returns it without side effects until [`attach`] rebinds.
    ///
    /// [`attach`]: Builder::attach
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    fn latch(&mut self, err: Error) -> Error {
        if self.error.is_none() {
            self.error = Some(err);
        }
        err
    }

    // ─── Chain accessors ────────────────────────────────────────────────────

    pub fn first_node(&self) -> Option<NodeId> {
        self.first
    }

    pub fn last_node(&self) -> Option<NodeId> {
        self.last
    }

    pub fn cursor(&self) -> Option<NodeId> {
        self.cursor
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(id)
    }

    /// Number of nodes ever allocated (linked or not).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Forward iterator over the chain.
    pub fn iter(&self) -> NodeIter<'_> {
        NodeIter {
            builder: self,
            cur: self.first,
        }
    }

    pub fn labels(&self) -> &[Option<NodeId>] {
        &self.labels
    }

    pub fn data_arena(&self) -> &ByteArena {
        &self.data
    }

    /// Payload bytes of a data node.
    pub fn data_of(&self, id: NodeId) -> Option<&[u8]> {
        match self.nodes.get(id).kind() {
            NodeKind::Data(d) => Some(d.bytes(&self.data)),
            _ => None,
        }
    }

    /// Inline-comment text of a node (also the text of a comment node).
    pub fn inline_comment_of(&self, id: NodeId) -> Option<&str> {
        self.nodes
            .get(id)
            .inline_comment()
            .map(|span| self.data.get_str(span))
    }

    pub fn node_flags(&self) -> NodeFlags {
        self.node_flags
    }

    /// Set the template OR-ed into every newly created node's flags.
    pub fn set_node_flags(&mut self, flags: NodeFlags) {
        self.node_flags = flags;
    }

    // ─── Node management (cursor discipline) ────────────────────────────────

    /// Insert a detached node after the cursor and advance the cursor to
    /// it. With a null cursor the node is prepended (or becomes the sole
    /// element of an empty chain).
    pub fn add_node(&mut self, id: NodeId) -> NodeId {
        debug_assert!(self.nodes.get(id).is_detached());

        match self.cursor {
            None => match self.first {
                None => {
                    self.first = Some(id);
                    self.last = Some(id);
                }
                Some(first) => {
                    self.nodes.get_mut(id).set_next(Some(first));
                    self.nodes.get_mut(first).set_prev(Some(id));
                    self.first = Some(id);
                }
            },
            Some(cursor) => {
                let next = self.nodes.get(cursor).next();
                self.nodes.get_mut(id).set_prev(Some(cursor));
                self.nodes.get_mut(id).set_next(next);
                self.nodes.get_mut(cursor).set_next(Some(id));
                match next {
                    Some(next) => self.nodes.get_mut(next).set_prev(Some(id)),
                    None => self.last = Some(id),
                }
            }
        }

        self.cursor = Some(id);
        id
    }

    /// Insert a detached node right after `anchor`. Does not move the
    /// cursor.
    pub fn add_after(&mut self, id: NodeId, anchor: NodeId) -> NodeId {
        debug_assert!(self.nodes.get(id).is_detached());

        let next = self.nodes.get(anchor).next();
        self.nodes.get_mut(id).set_prev(Some(anchor));
        self.nodes.get_mut(id).set_next(next);
        self.nodes.get_mut(anchor).set_next(Some(id));
        match next {
            Some(next) => self.nodes.get_mut(next).set_prev(Some(id)),
            None => self.last = Some(id),
        }
        id
    }

    /// Insert a detached node right before `anchor`. Does not move the
    /// cursor.
    pub fn add_before(&mut self, id: NodeId, anchor: NodeId) -> NodeId {
        debug_assert!(self.nodes.get(id).is_detached());

        let prev = self.nodes.get(anchor).prev();
        self.nodes.get_mut(id).set_prev(prev);
        self.nodes.get_mut(id).set_next(Some(anchor));
        self.nodes.get_mut(anchor).set_prev(Some(id));
        match prev {
            Some(prev) => self.nodes.get_mut(prev).set_next(Some(id)),
            None => self.first = Some(id),
        }
        id
    }

    /// Unlink a node. Its own links are cleared so it cannot be
    /// double-unlinked; if the cursor pointed at it, the cursor retreats
    /// to the predecessor. Storage is not reclaimed.
    pub fn remove_node(&mut self, id: NodeId) -> NodeId {
        debug_assert!(self.first == Some(id) || !self.nodes.get(id).is_detached());

        let prev = self.nodes.get(id).prev();
        let next = self.nodes.get(id).next();

        match prev {
            Some(prev) => self.nodes.get_mut(prev).set_next(next),
            None => self.first = next,
        }
        match next {
            Some(next) => self.nodes.get_mut(next).set_prev(prev),
            None => self.last = prev,
        }

        let node = self.nodes.get_mut(id);
        node.set_prev(None);
        node.set_next(None);

        if self.cursor == Some(id) {
            self.cursor = prev;
        }
        id
    }

    /// Unlink the contiguous run `[from, to]` in O(1), then clear the
    /// internal links of each removed node. The cursor retreats to the
    /// run's predecessor if it lay inside.
    pub fn remove_range(&mut self, from: NodeId, to: NodeId) {
        if from == to {
            self.remove_node(from);
            return;
        }

        let prev = self.nodes.get(from).prev();
        let next = self.nodes.get(to).next();

        match prev {
            Some(prev) => self.nodes.get_mut(prev).set_next(next),
            None => self.first = next,
        }
        match next {
            Some(next) => self.nodes.get_mut(next).set_prev(prev),
            None => self.last = prev,
        }

        let mut cur = from;
        loop {
            let after = self.nodes.get(cur).next();
            let node = self.nodes.get_mut(cur);
            node.set_prev(None);
            node.set_next(None);

            if self.cursor == Some(cur) {
                self.cursor = prev;
            }
            if cur == to {
                break;
            }
            match after {
                Some(after) => cur = after,
                None => {
                    debug_assert!(false, "remove_range over a non-contiguous run");
                    break;
                }
            }
        }
    }

    /// Move the cursor, returning its previous value.
    pub fn set_cursor(&mut self, node: Option<NodeId>) -> Option<NodeId> {
        let old = self.cursor;
        self.cursor = node;
        old
    }

    // ─── Node factories ─────────────────────────────────────────────────────
    //
    // Factories allocate and return detached nodes. They never touch the
    // error latch; the public emission entry points do.

    pub fn new_inst_node(&mut self, inst_id: InstId, options: EmitOptions) -> NodeId {
        self.nodes.alloc(Node::new(
            NodeKind::Inst(InstNode::new(inst_id, options)),
            self.node_flags,
        ))
    }

    /// A label node registered with the code-holder: a fresh id is issued
    /// and the label map updated.
    pub fn new_label_node(&mut self) -> Result<NodeId, Error> {
        let id = self.nodes.alloc(Node::new(
            NodeKind::Label(LabelNode::new(0)),
            self.node_flags,
        ));
        self.register_label_node(id)?;
        Ok(id)
    }

    pub fn new_align_node(&mut self, mode: AlignMode, alignment: u32) -> NodeId {
        self.nodes.alloc(Node::new(
            NodeKind::Align(AlignNode { mode, alignment }),
            self.node_flags,
        ))
    }

    /// A data node; payloads past the inline threshold are cloned into
    /// the data arena.
    pub fn new_data_node(&mut self, bytes: &[u8]) -> Result<NodeId, Error> {
        let data = DataNode::new(bytes, &mut self.data).ok_or(Error::NoHeapMemory)?;
        Ok(self
            .nodes
            .alloc(Node::new(NodeKind::Data(data), self.node_flags)))
    }

    /// A const-pool node: owns an empty pool and registers a fresh label.
    pub fn new_const_pool_node(&mut self) -> Result<NodeId, Error> {
        let id = self.nodes.alloc(Node::new(
            NodeKind::ConstPool(ConstPoolNode::new(0)),
            self.node_flags,
        ));
        self.register_label_node(id)?;
        Ok(id)
    }

    /// A comment node; the text is interned in the data arena.
    pub fn new_comment_node(&mut self, text: &str) -> Result<NodeId, Error> {
        let span = self.data.intern_str(text).ok_or(Error::NoHeapMemory)?;
        let id = self
            .nodes
            .alloc(Node::new(NodeKind::Comment, self.node_flags));
        self.nodes.get_mut(id).set_inline_comment(Some(span));
        Ok(id)
    }

    pub fn new_sentinel_node(&mut self) -> NodeId {
        self.nodes
            .alloc(Node::new(NodeKind::Sentinel, self.node_flags))
    }

    /// Wrap a user-defined payload in a node. The payload's capability
    /// views must match any `ACTS_AS_INST` / `ACTS_AS_LABEL` flags the
    /// caller adds afterwards.
    pub fn new_user_node(&mut self, payload: Box<dyn crate::node::UserNode>) -> NodeId {
        self.nodes
            .alloc(Node::new(NodeKind::User(payload), self.node_flags))
    }

    /// Issue a fresh label id for `node` (a label or const-pool node) and
    /// record it in the label map. Does not touch the error latch.
    pub fn register_label_node(&mut self, node: NodeId) -> Result<(), Error> {
        let holder = self.holder.as_mut().ok_or(Error::NotInitialized)?;
        let id = holder.new_label_id()?;
        self.store_label_node(id, node)
    }

    fn store_label_node(&mut self, id: LabelId, node: NodeId) -> Result<(), Error> {
        match self.nodes.get_mut(node).kind_mut() {
            NodeKind::Label(l) => l.set_id(id),
            NodeKind::ConstPool(p) => p.set_label_id(id),
            _ => return Err(Error::InvalidArgument),
        }
        if self.labels.len() <= id as usize {
            self.labels.resize(id as usize + 1, None);
        }
        self.labels[id as usize] = Some(node);
        Ok(())
    }

    /// The label node for a holder-issued id, created lazily on first
    /// use. Ids outside the holder's issued range are invalid.
    pub fn label_node_of(&mut self, id: LabelId) -> Result<NodeId, Error> {
        let holder = self.holder.as_ref().ok_or(Error::NotInitialized)?;
        if id == 0 || id as usize >= holder.labels_count() {
            return Err(Error::InvalidLabel);
        }
        if self.labels.len() <= id as usize {
            self.labels.resize(id as usize + 1, None);
        }
        if let Some(node) = self.labels[id as usize] {
            return Ok(node);
        }
        let node = self.nodes.alloc(Node::new(
            NodeKind::Label(LabelNode::new(id)),
            self.node_flags,
        ));
        self.labels[id as usize] = Some(node);
        Ok(node)
    }

    // ─── Emission surface ───────────────────────────────────────────────────

    fn reset_one_shot(&mut self) {
        self.options = EmitOptions::empty();
        self.inline_comment = None;
        self.op4 = Operand::None;
        self.op5 = Operand::None;
        self.op_extra = Operand::None;
    }

    /// Record one instruction. See the [`Emitter`] contract for operand
    /// staging; the one-shot option/comment/operand state is consumed
    /// here whether or not the emission succeeds.
    pub fn emit(
        &mut self,
        inst_id: InstId,
        o0: Operand,
        o1: Operand,
        o2: Operand,
        o3: Operand,
    ) -> Result<(), Error> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let options = self.options;

        // Trailing `None`s do not count.
        let mut op_count = if !o3.is_none() {
            4
        } else if !o2.is_none() {
            3
        } else if !o1.is_none() {
            2
        } else if !o0.is_none() {
            1
        } else {
            0
        };
        if options.contains(EmitOptions::OP4) {
            op_count = 5;
        }
        if options.contains(EmitOptions::OP5) {
            op_count = 6;
        }

        if options.contains(EmitOptions::STRICT_VALIDATION) {
            let staged = [o0, o1, o2, o3, self.op4, self.op5];
            let verdict = match &self.validator {
                Some(v) => v.validate(inst_id, &staged[..op_count.max(4)]),
                None => Ok(()),
            };
            if let Err(err) = verdict {
                self.options = EmitOptions::empty();
                self.inline_comment = None;
                return Err(self.latch(err));
            }
        }

        let mut inst = InstNode::new(inst_id, options & !EmitOptions::TRANSIENT);
        let leading = [o0, o1, o2, o3];
        for i in 0..op_count {
            let op = match i {
                0..=3 => leading[i],
                4 if options.contains(EmitOptions::OP4) => self.op4,
                5 if options.contains(EmitOptions::OP5) => self.op5,
                _ => Operand::None,
            };
            inst.push_op(op);
        }
        if options.contains(EmitOptions::OP_EXTRA) {
            inst.set_op_extra(self.op_extra);
        }

        let comment = self.inline_comment.take();
        self.reset_one_shot();

        let id = self
            .nodes
            .alloc(Node::new(NodeKind::Inst(inst), self.node_flags));
        self.nodes.get_mut(id).set_inline_comment(comment);
        self.add_node(id);
        Ok(())
    }

    /// Allocate a fresh anonymous label. On failure, a label with id 0 is
    /// returned and the error latched.
    pub fn new_label(&mut self) -> Label {
        let mut id = 0;
        if self.error.is_none() {
            match self.new_label_node() {
                Ok(node) => id = self.nodes.get(node).as_label().map_or(0, |l| l.id()),
                Err(err) => {
                    self.latch(err);
                }
            }
        }
        Label::from_id(id)
    }

    /// Allocate a named label through the holder's named allocator.
    pub fn new_named_label(&mut self, name: &str, kind: LabelKind, parent_id: LabelId) -> Label {
        let mut id = 0;
        if self.error.is_none() {
            match self.new_named_label_node(name, kind, parent_id) {
                Ok(node) => id = self.nodes.get(node).as_label().map_or(0, |l| l.id()),
                Err(err) => {
                    self.latch(err);
                }
            }
        }
        Label::from_id(id)
    }

    fn new_named_label_node(
        &mut self,
        name: &str,
        kind: LabelKind,
        parent_id: LabelId,
    ) -> Result<NodeId, Error> {
        let holder = self.holder.as_mut().ok_or(Error::NotInitialized)?;
        let id = holder.new_named_label_id(name, kind, parent_id)?;
        let node = self.nodes.alloc(Node::new(
            NodeKind::Label(LabelNode::new(0)),
            self.node_flags,
        ));
        self.store_label_node(id, node)?;
        Ok(node)
    }

    /// Append the label's node at the cursor, creating it lazily for ids
    /// issued through the holder by other parties.
    pub fn bind(&mut self, label: Label) -> Result<(), Error> {
        if let Some(err) = self.error {
            return Err(err);
        }
        match self.label_node_of(label.id()) {
            Ok(node) => {
                self.add_node(node);
                Ok(())
            }
            Err(err) => Err(self.latch(err)),
        }
    }

    pub fn align(&mut self, mode: AlignMode, alignment: u32) -> Result<(), Error> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let node = self.new_align_node(mode, alignment);
        self.add_node(node);
        Ok(())
    }

    pub fn embed(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if let Some(err) = self.error {
            return Err(err);
        }
        match self.new_data_node(bytes) {
            Ok(node) => {
                self.add_node(node);
                Ok(())
            }
            Err(err) => Err(self.latch(err)),
        }
    }

    pub fn embed_label(&mut self, label: Label) -> Result<(), Error> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let node = self.nodes.alloc(Node::new(
            NodeKind::LabelData(label),
            self.node_flags,
        ));
        self.add_node(node);
        Ok(())
    }

    /// Align to the pool's alignment, bind `label` there, and append the
    /// pool's bytes as data.
    pub fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> Result<(), Error> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let valid = self
            .holder
            .as_ref()
            .is_some_and(|h| h.is_label_valid(label));
        if !valid {
            return Err(self.latch(Error::InvalidLabel));
        }

        self.align(AlignMode::Data, pool.alignment() as u32)?;
        self.bind(label)?;

        let node = match DataNode::zeroed(pool.size(), &mut self.data) {
            Some(data) => self
                .nodes
                .alloc(Node::new(NodeKind::Data(data), self.node_flags)),
            None => return Err(self.latch(Error::NoHeapMemory)),
        };
        let nodes = &mut self.nodes;
        let arena = &mut self.data;
        if let NodeKind::Data(data) = nodes.get_mut(node).kind_mut() {
            pool.fill(data.bytes_mut(arena));
        }
        self.add_node(node);
        Ok(())
    }

    /// Append a standalone comment node.
    pub fn comment(&mut self, text: &str) -> Result<(), Error> {
        if let Some(err) = self.error {
            return Err(err);
        }
        match self.new_comment_node(text) {
            Ok(node) => {
                self.add_node(node);
                Ok(())
            }
            Err(err) => Err(self.latch(err)),
        }
    }

    // ─── Pass registry ──────────────────────────────────────────────────────

    /// Register a pass at the end of the pipeline. Re-adding a name that
    /// is already registered is a no-op (the duplicate is dropped).
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) -> Result<(), Error> {
        if self.pass_by_name(pass.name()).is_some() {
            return Ok(());
        }
        self.passes.push(pass);
        Ok(())
    }

    /// Detach and destroy the named pass.
    pub fn delete_pass(&mut self, name: &str) -> Result<(), Error> {
        match self.passes.iter().position(|p| p.name() == name) {
            Some(index) => {
                self.passes.remove(index);
                Ok(())
            }
            None => Err(Error::InvalidArgument),
        }
    }

    pub fn pass_by_name(&self, name: &str) -> Option<&dyn Pass> {
        self.passes
            .iter()
            .find(|p| p.name() == name)
            .map(|p| &**p)
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Run every registered pass in order. The scratch arena is reset
    /// around each run; the first pass error stops the pipeline and
    /// latches.
    pub fn run_passes(&mut self) -> Result<(), Error> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let mut passes = std::mem::take(&mut self.passes);
        let mut scratch = std::mem::take(&mut self.scratch);

        let mut result = Ok(());
        for pass in passes.iter_mut() {
            scratch.reset();
            debug!(pass = pass.name(), "running builder pass");
            result = pass.run(self, &mut scratch);
            if result.is_err() {
                break;
            }
        }
        scratch.reset();

        // A pass may itself have registered passes; keep them after the
        // original pipeline.
        passes.extend(self.passes.drain(..));
        self.passes = passes;
        self.scratch = scratch;

        if let Err(err) = result {
            self.latch(err);
        }
        result
    }

    // ─── Dump ───────────────────────────────────────────────────────────────

    /// Render the chain as assembler-like text, resolving instruction
    /// names through `db`.
    pub fn dump(&self, db: &InstDb) -> String {
        use core::fmt::Write;

        let mut out = String::new();
        for id in self.iter() {
            let node = self.nodes.get(id);
            match node.kind() {
                NodeKind::Inst(inst) => {
                    let name = db
                        .name(inst.inst_id())
                        .map(str::to_owned)
                        .unwrap_or_else(|| format!("inst#{}", inst.inst_id().0));
                    let _ = write!(out, "  {name}");
                    for (i, op) in inst.ops().iter().enumerate() {
                        let sep = if i == 0 { " " } else { ", " };
                        let _ = write!(out, "{sep}{op}");
                    }
                }
                NodeKind::Data(d) => {
                    let _ = write!(out, "  .embed {}B", d.size());
                }
                NodeKind::Align(a) => {
                    let mode = match a.mode {
                        AlignMode::Code => "code",
                        AlignMode::Data => "data",
                        AlignMode::Zero => "zero",
                    };
                    let _ = write!(out, "  .align {mode} {}", a.alignment);
                }
                NodeKind::Label(l) => {
                    let _ = write!(out, "L{}:", l.id());
                }
                NodeKind::LabelData(l) => {
                    let _ = write!(out, "  .embed-label L{}", l.id());
                }
                NodeKind::ConstPool(p) => {
                    let _ = write!(
                        out,
                        "L{}: .const-pool size={} align={}",
                        p.label().id(),
                        p.pool().size(),
                        p.pool().alignment()
                    );
                }
                NodeKind::Comment => {
                    let text = self.inline_comment_of(id).unwrap_or("");
                    let _ = write!(out, "  ; {text}");
                }
                NodeKind::Sentinel => {
                    let _ = write!(out, "  .sentinel");
                }
                NodeKind::User(u) => {
                    let _ = write!(out, "  .user type={}", u.type_id());
                }
            }
            if !matches!(node.kind(), NodeKind::Comment) {
                if let Some(text) = self.inline_comment_of(id) {
                    let _ = write!(out, " ; {text}");
                }
            }
            out.push('\n');
        }
        out
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward iterator over a builder's chain, yielding node handles.
pub struct NodeIter<'a> {
    builder: &'a Builder,
    cur: Option<NodeId>,
}

impl Iterator for NodeIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cur?;
        self.cur = self.builder.node(id).next();
        Some(id)
    }
}

impl Emitter for Builder {
    fn emit(
        &mut self,
        inst_id: InstId,
        o0: Operand,
        o1: Operand,
        o2: Operand,
        o3: Operand,
    ) -> Result<(), Error> {
        Builder::emit(self, inst_id, o0, o1, o2, o3)
    }

    fn new_label(&mut self) -> Label {
        Builder::new_label(self)
    }

    fn new_named_label(&mut self, name: &str, kind: LabelKind, parent_id: LabelId) -> Label {
        Builder::new_named_label(self, name, kind, parent_id)
    }

    fn bind(&mut self, label: Label) -> Result<(), Error> {
        Builder::bind(self, label)
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> Result<(), Error> {
        Builder::align(self, mode, alignment)
    }

    fn embed(&mut self, bytes: &[u8]) -> Result<(), Error> {
        Builder::embed(self, bytes)
    }

    fn embed_label(&mut self, label: Label) -> Result<(), Error> {
        Builder::embed_label(self, label)
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> Result<(), Error> {
        Builder::embed_const_pool(self, label, pool)
    }

    fn comment(&mut self, text: &str) -> Result<(), Error> {
        Builder::comment(self, text)
    }

    fn set_options(&mut self, options: EmitOptions) {
        self.options = options;
    }

    fn set_inline_comment(&mut self, comment: Option<&str>) {
        self.inline_comment = comment.and_then(|text| self.data.intern_str(text));
    }

    fn set_op4(&mut self, op: Operand) {
        self.op4 = op;
    }

    fn set_op5(&mut self, op: Operand) {
        self.op5 = op;
    }

    fn set_op_extra(&mut self, op: Operand) {
        self.op_extra = op;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_holder::CodeInfo;
    use crate::node::INLINE_BUFFER_SIZE;
    use crate::x86;

    fn builder() -> Builder {
        let mut cb = Builder::new();
        cb.attach(Box::new(CodeInfo::new()));
        cb
    }

    /// Walk the chain both ways and check every link pairing plus the
    /// endpoints.
    fn assert_chain(cb: &Builder, expected: &[NodeId]) {
        let forward: Vec<NodeId> = cb.iter().collect();
        assert_eq!(forward, expected);

        let mut backward = Vec::new();
        let mut cur = cb.last_node();
        while let Some(id) = cur {
            backward.push(id);
            cur = cb.node(id).prev();
        }
        backward.reverse();
        assert_eq!(backward, expected);

        assert_eq!(cb.first_node(), expected.first().copied());
        assert_eq!(cb.last_node(), expected.last().copied());
        for pair in expected.windows(2) {
            assert_eq!(cb.node(pair[0]).next(), Some(pair[1]));
            assert_eq!(cb.node(pair[1]).prev(), Some(pair[0]));
        }
    }

    #[test]
    fn add_on_empty_chain_sets_all_three() {
        let mut cb = builder();
        let n = cb.new_sentinel_node();
        cb.add_node(n);
        assert_eq!(cb.first_node(), Some(n));
        assert_eq!(cb.last_node(), Some(n));
        assert_eq!(cb.cursor(), Some(n));
        assert_chain(&cb, &[n]);
    }

    #[test]
    fn add_with_null_cursor_prepends() {
        let mut cb = builder();
        let a = cb.new_sentinel_node();
        cb.add_node(a);
        cb.set_cursor(None);
        let b = cb.new_sentinel_node();
        cb.add_node(b);
        assert_chain(&cb, &[b, a]);
        assert_eq!(cb.cursor(), Some(b));
    }

    #[test]
    fn add_inserts_after_cursor_and_advances() {
        let mut cb = builder();
        let a = cb.new_sentinel_node();
        let b = cb.new_sentinel_node();
        let c = cb.new_sentinel_node();
        cb.add_node(a);
        cb.add_node(c);
        cb.set_cursor(Some(a));
        cb.add_node(b);
        assert_chain(&cb, &[a, b, c]);
        assert_eq!(cb.cursor(), Some(b));
    }

    #[test]
    fn add_before_and_after_leave_cursor_alone() {
        let mut cb = builder();
        let a = cb.new_sentinel_node();
        let d = cb.new_sentinel_node();
        cb.add_node(a);
        cb.add_node(d);

        let before = cb.new_sentinel_node();
        let after = cb.new_sentinel_node();
        cb.add_before(before, a);
        cb.add_after(after, d);

        assert_chain(&cb, &[before, a, d, after]);
        assert_eq!(cb.cursor(), Some(d));
    }

    #[test]
    fn remove_clears_links_and_retreats_cursor() {
        let mut cb = builder();
        let a = cb.new_sentinel_node();
        let b = cb.new_sentinel_node();
        let c = cb.new_sentinel_node();
        cb.add_node(a);
        cb.add_node(b);
        cb.add_node(c);

        cb.set_cursor(Some(b));
        cb.remove_node(b);

        assert_chain(&cb, &[a, c]);
        assert!(cb.node(b).is_detached());
        assert_eq!(cb.cursor(), Some(a));
    }

    #[test]
    fn remove_sole_node_empties_the_chain() {
        let mut cb = builder();
        let a = cb.new_sentinel_node();
        cb.add_node(a);
        cb.remove_node(a);
        assert_chain(&cb, &[]);
        assert_eq!(cb.cursor(), None);
    }

    #[test]
    fn remove_range_unlinks_the_run() {
        let mut cb = builder();
        let ids: Vec<NodeId> = (0..5)
            .map(|_| {
                let n = cb.new_sentinel_node();
                cb.add_node(n);
                n
            })
            .collect();

        // Cursor sits inside the range and must retreat to its
        // predecessor.
        cb.set_cursor(Some(ids[2]));
        cb.remove_range(ids[1], ids[3]);

        assert_chain(&cb, &[ids[0], ids[4]]);
        for &id in &ids[1..4] {
            assert!(cb.node(id).is_detached());
        }
        assert_eq!(cb.cursor(), Some(ids[0]));
    }

    #[test]
    fn remove_range_at_endpoints() {
        let mut cb = builder();
        let a = cb.new_sentinel_node();
        let b = cb.new_sentinel_node();
        cb.add_node(a);
        cb.add_node(b);
        cb.remove_range(a, b);
        assert_chain(&cb, &[]);
        assert_eq!(cb.cursor(), None);
    }

    #[test]
    fn set_cursor_returns_previous() {
        let mut cb = builder();
        let a = cb.new_sentinel_node();
        cb.add_node(a);
        assert_eq!(cb.set_cursor(None), Some(a));
        assert_eq!(cb.set_cursor(Some(a)), None);
    }

    #[test]
    fn emit_derives_operand_count_from_trailing_nones() {
        let mut cb = builder();
        let r0 = Operand::Reg(x86::gp64(0));
        let r1 = Operand::Reg(x86::gp64(1));

        cb.emit(x86::inst_id::ADD, r0, r1, Operand::None, Operand::None)
            .unwrap();
        // A `None` hole before a set operand still counts up to the last
        // set one.
        cb.emit(x86::inst_id::ADD, r0, Operand::None, r1, Operand::None)
            .unwrap();
        cb.emit(
            x86::inst_id::NOP,
            Operand::None,
            Operand::None,
            Operand::None,
            Operand::None,
        )
        .unwrap();

        let counts: Vec<usize> = cb
            .iter()
            .filter_map(|id| cb.node(id).as_inst().map(|i| i.op_count()))
            .collect();
        assert_eq!(counts, vec![2, 3, 0]);
    }

    #[test]
    fn emit_pulls_in_sidecar_operands() {
        let mut cb = builder();
        let r = |i| Operand::Reg(x86::gp64(i));

        cb.set_op4(r(4));
        cb.set_op5(r(5));
        cb.set_op_extra(Operand::Reg(x86::k(1)));
        cb.set_options(EmitOptions::OP4 | EmitOptions::OP5 | EmitOptions::OP_EXTRA);
        cb.emit(x86::inst_id::ADD, r(0), r(1), r(2), r(3)).unwrap();

        let id = cb.first_node().unwrap();
        let inst = cb.node(id).as_inst().unwrap();
        assert_eq!(inst.op_count(), 6);
        assert_eq!(inst.op(4), r(4));
        assert_eq!(inst.op(5), r(5));
        assert_eq!(inst.op_extra(), Operand::Reg(x86::k(1)));
        assert!(inst.options().contains(EmitOptions::OP4 | EmitOptions::OP5));

        // One-shot state was consumed.
        cb.emit(x86::inst_id::NOP, Operand::None, Operand::None, Operand::None, Operand::None)
            .unwrap();
        let nop = cb.node(cb.cursor().unwrap()).as_inst().unwrap();
        assert_eq!(nop.op_count(), 0);
        assert_eq!(nop.op_extra(), Operand::None);
        assert!(nop.options().is_empty());
    }

    #[test]
    fn emit_strips_transient_option_bits() {
        let mut cb = builder();
        cb.set_options(EmitOptions::MAYBE_FAILURE_CASE | EmitOptions::STRICT_VALIDATION);
        cb.emit(x86::inst_id::NOP, Operand::None, Operand::None, Operand::None, Operand::None)
            .unwrap();
        let inst = cb.node(cb.first_node().unwrap()).as_inst().unwrap();
        assert!(inst.options().is_empty());
    }

    struct RejectAll;

    impl InstValidator for RejectAll {
        fn validate(&self, _inst_id: InstId, _ops: &[Operand]) -> Result<(), Error> {
            Err(Error::InvalidInstruction)
        }
    }

    #[test]
    fn strict_validation_failure_latches_before_allocation() {
        let mut cb = builder();
        cb.set_validator(Box::new(RejectAll));
        let nodes_before = cb.node_count();

        cb.set_options(EmitOptions::STRICT_VALIDATION);
        let err = cb
            .emit(x86::inst_id::NOP, Operand::None, Operand::None, Operand::None, Operand::None)
            .unwrap_err();
        assert_eq!(err, Error::InvalidInstruction);
        assert_eq!(cb.error(), Some(Error::InvalidInstruction));
        assert_eq!(cb.node_count(), nodes_before);
    }

    #[test]
    fn error_latch_is_monotonic() {
        let mut cb = builder();
        cb.emit(x86::inst_id::NOP, Operand::None, Operand::None, Operand::None, Operand::None)
            .unwrap();

        // Binding an id the holder never issued latches InvalidLabel.
        let err = cb.bind(Label::from_id(99)).unwrap_err();
        assert_eq!(err, Error::InvalidLabel);

        let len_before: Vec<NodeId> = cb.iter().collect();
        assert_eq!(
            cb.emit(x86::inst_id::NOP, Operand::None, Operand::None, Operand::None, Operand::None),
            Err(Error::InvalidLabel)
        );
        assert_eq!(cb.align(AlignMode::Code, 8), Err(Error::InvalidLabel));
        assert_eq!(cb.embed(&[1, 2, 3]), Err(Error::InvalidLabel));
        assert_eq!(cb.comment("nope"), Err(Error::InvalidLabel));
        assert!(!cb.new_label().is_valid());
        let after: Vec<NodeId> = cb.iter().collect();
        assert_eq!(len_before, after);
    }

    #[test]
    fn attach_resets_the_latch_and_state() {
        let mut cb = builder();
        cb.emit(x86::inst_id::NOP, Operand::None, Operand::None, Operand::None, Operand::None)
            .unwrap();
        cb.bind(Label::from_id(99)).unwrap_err();
        assert!(cb.error().is_some());

        cb.attach(Box::new(CodeInfo::new()));
        assert_eq!(cb.error(), None);
        assert_eq!(cb.first_node(), None);
        assert_eq!(cb.node_count(), 0);
        assert!(cb.labels().is_empty());
        cb.emit(x86::inst_id::NOP, Operand::None, Operand::None, Operand::None, Operand::None)
            .unwrap();
    }

    #[test]
    fn detached_builder_reports_not_initialized() {
        let mut cb = Builder::new();
        assert!(!cb.new_label().is_valid());
        assert_eq!(cb.error(), Some(Error::NotInitialized));
    }

    #[test]
    fn label_map_is_consistent_after_bind() {
        let mut cb = builder();
        let label = cb.new_label();
        assert!(label.is_valid());

        let node = cb.labels()[label.id() as usize].unwrap();
        assert_eq!(cb.node(node).as_label(), Some(label));
        // Not yet bound: registered but detached.
        assert!(cb.node(node).is_detached());
        assert!(!cb.iter().any(|id| id == node));

        cb.bind(label).unwrap();
        assert!(cb.iter().any(|id| id == node));

        for (id, entry) in cb.labels().iter().enumerate() {
            if let Some(node) = entry {
                assert_eq!(cb.node(*node).as_label().unwrap().id() as usize, id);
            }
        }
    }

    #[test]
    fn named_labels_register_and_latch_duplicates() {
        let mut cb = builder();
        let entry = cb.new_named_label("entry", LabelKind::Global, 0);
        assert!(entry.is_valid());
        cb.bind(entry).unwrap();

        let dup = cb.new_named_label("entry", LabelKind::Global, 0);
        assert!(!dup.is_valid());
        assert_eq!(cb.error(), Some(Error::LabelAlreadyDefined));
    }

    #[test]
    fn embed_data_boundary() {
        let mut cb = builder();
        cb.embed(&[7u8; INLINE_BUFFER_SIZE]).unwrap();
        cb.embed(&[8u8; INLINE_BUFFER_SIZE + 1]).unwrap();

        let ids: Vec<NodeId> = cb.iter().collect();
        match cb.node(ids[0]).kind() {
            NodeKind::Data(d) => assert!(d.is_inline()),
            other => panic!("expected data node, got {other:?}"),
        }
        match cb.node(ids[1]).kind() {
            NodeKind::Data(d) => assert!(!d.is_inline()),
            _ => unreachable!(),
        }
        assert_eq!(cb.data_of(ids[1]).unwrap(), &[8u8; INLINE_BUFFER_SIZE + 1][..]);
    }

    #[test]
    fn inline_comment_attaches_to_next_emit_only() {
        let mut cb = builder();
        cb.set_inline_comment(Some("hot loop"));
        cb.emit(x86::inst_id::NOP, Operand::None, Operand::None, Operand::None, Operand::None)
            .unwrap();
        cb.emit(x86::inst_id::NOP, Operand::None, Operand::None, Operand::None, Operand::None)
            .unwrap();

        let ids: Vec<NodeId> = cb.iter().collect();
        assert_eq!(cb.inline_comment_of(ids[0]), Some("hot loop"));
        assert_eq!(cb.inline_comment_of(ids[1]), None);
    }

    #[test]
    fn embed_const_pool_emits_align_bind_data() {
        let mut cb = builder();
        let label = cb.new_label();
        let mut pool = ConstPool::new();
        pool.add(&1.5f64.to_le_bytes()).unwrap();
        let offset = pool.add(&2.5f64.to_le_bytes()).unwrap();

        cb.embed_const_pool(label, &pool).unwrap();

        let ids: Vec<NodeId> = cb.iter().collect();
        assert_eq!(ids.len(), 3);
        match cb.node(ids[0]).kind() {
            NodeKind::Align(a) => {
                assert_eq!(a.alignment, 8);
                assert_eq!(a.mode, AlignMode::Data);
            }
            _ => panic!("expected align node"),
        }
        assert_eq!(cb.node(ids[1]).as_label(), Some(label));
        let bytes = cb.data_of(ids[2]).unwrap();
        assert_eq!(bytes.len(), pool.size());
        assert_eq!(
            &bytes[offset as usize..offset as usize + 8],
            &2.5f64.to_le_bytes()
        );
    }

    #[test]
    fn embed_const_pool_rejects_foreign_labels() {
        let mut cb = builder();
        let pool = ConstPool::new();
        assert_eq!(
            cb.embed_const_pool(Label::from_id(42), &pool),
            Err(Error::InvalidLabel)
        );
        assert_eq!(cb.error(), Some(Error::InvalidLabel));
    }

    #[test]
    fn const_pool_node_registers_a_label() {
        let mut cb = builder();
        let node = cb.new_const_pool_node().unwrap();
        let label = cb.node(node).as_label().unwrap();
        assert!(label.is_valid());
        assert_eq!(cb.labels()[label.id() as usize], Some(node));

        if let NodeKind::ConstPool(p) = cb.node_mut(node).kind_mut() {
            p.pool_mut().add(&7u32.to_le_bytes()).unwrap();
        }
        cb.add_node(node);
        assert!(cb.node(node).acts_as_label());
    }

    #[test]
    fn data_arena_limit_surfaces_no_heap_memory() {
        let mut cb = Builder::new();
        cb.attach(Box::new(CodeInfo::new()));
        cb.data = ByteArena::with_limit(16);
        assert_eq!(cb.embed(&[0u8; 512]), Err(Error::NoHeapMemory));
        assert_eq!(cb.error(), Some(Error::NoHeapMemory));
    }

    struct CountingPass {
        name: &'static str,
        log: std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>,
        fail: bool,
        expect_clean_scratch: bool,
    }

    impl Pass for CountingPass {
        fn name(&self) -> &'static str {
            self.name
        }

        fn run(&mut self, _cb: &mut Builder, scratch: &mut ScratchArena) -> Result<(), Error> {
            if self.expect_clean_scratch {
                assert!(scratch.node_stack.is_empty());
                assert_eq!(scratch.bytes.used(), 0);
            }
            scratch.node_stack.push(NodeId::new(0));
            let _ = scratch.bytes.dup(b"leftovers", false);
            self.log.borrow_mut().push(self.name);
            if self.fail {
                Err(Error::InvalidState)
            } else {
                Ok(())
            }
        }
    }

    fn counting_pass(
        name: &'static str,
        log: &std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>,
        fail: bool,
    ) -> Box<CountingPass> {
        Box::new(CountingPass {
            name,
            log: log.clone(),
            fail,
            expect_clean_scratch: true,
        })
    }

    #[test]
    fn passes_run_in_registration_order_with_clean_scratch() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut cb = builder();
        cb.add_pass(counting_pass("first", &log, false)).unwrap();
        cb.add_pass(counting_pass("second", &log, false)).unwrap();
        cb.run_passes().unwrap();
        assert_eq!(*log.borrow(), vec!["first", "second"]);
        // Scratch is reset after the pipeline as well.
        assert_eq!(cb.scratch.bytes.used(), 0);
    }

    #[test]
    fn run_passes_stops_and_latches_on_first_error() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut cb = builder();
        cb.add_pass(counting_pass("bad", &log, true)).unwrap();
        cb.add_pass(counting_pass("never", &log, false)).unwrap();

        assert_eq!(cb.run_passes(), Err(Error::InvalidState));
        assert_eq!(*log.borrow(), vec!["bad"]);
        assert_eq!(cb.error(), Some(Error::InvalidState));
        // Latched: a second run refuses outright.
        assert_eq!(cb.run_passes(), Err(Error::InvalidState));
        assert_eq!(*log.borrow(), vec!["bad"]);
    }

    #[test]
    fn pass_registry_readd_is_noop_and_delete_checks_name() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut cb = builder();
        cb.add_pass(counting_pass("only", &log, false)).unwrap();
        cb.add_pass(counting_pass("only", &log, false)).unwrap();
        assert_eq!(cb.pass_count(), 1);
        assert!(cb.pass_by_name("only").is_some());
        assert!(cb.pass_by_name("missing").is_none());

        assert_eq!(cb.delete_pass("missing"), Err(Error::InvalidArgument));
        cb.delete_pass("only").unwrap();
        assert_eq!(cb.pass_count(), 0);
    }

    #[test]
    fn dump_renders_every_variant() {
        let mut cb = builder();
        let label = cb.new_label();
        cb.set_inline_comment(Some("entry"));
        cb.emit(
            x86::inst_id::ADDPS,
            Operand::Reg(x86::xmm(0)),
            Operand::Reg(x86::xmm(1)),
            Operand::None,
            Operand::None,
        )
        .unwrap();
        cb.bind(label).unwrap();
        cb.align(AlignMode::Code, 16).unwrap();
        cb.embed(&[1, 2, 3, 4]).unwrap();
        cb.embed_label(label).unwrap();
        cb.comment("trailer").unwrap();
        let s = cb.new_sentinel_node();
        cb.add_node(s);

        let text = cb.dump(&x86::INST_DB);
        assert!(text.contains("addps xmm0, xmm1 ; entry"));
        assert!(text.contains(&format!("L{}:", label.id())));
        assert!(text.contains(".align code 16"));
        assert!(text.contains(".embed 4B"));
        assert!(text.contains(&format!(".embed-label L{}", label.id())));
        assert!(text.contains("; trailer"));
        assert!(text.contains(".sentinel"));
    }
}
