//! The node model: one tagged variant per emission kind, linked into a
//! doubly-linked chain through arena handles.
//!
//! Nodes are created by the builder's factories, live in the builder's
//! [`NodeArena`], and are addressed by [`NodeId`] everywhere — links,
//! cursor, label map. Removal unlinks a node but never reclaims its slot;
//! storage is reclaimed in bulk when the arena is reset.

use core::fmt;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::arena::{ByteArena, Span};
use crate::emitter::{AlignMode, EmitOptions};
use crate::inst::InstId;
use crate::operand::{Label, LabelId, Operand};
use crate::const_pool::ConstPool;

// ─── Handles and the node slab ──────────────────────────────────────────────

/// Handle to a node inside a [`NodeArena`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn new(index: u32) -> Self {
        NodeId(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Slab of nodes with bulk reclamation.
///
/// This doubles as the "base arena" of the builder: every node is a
/// uniform slot, allocation is a push, and `reset` frees everything at
/// once. Individual slots are never reused while the arena lives, so a
/// `NodeId` stays unambiguous until reset.
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        NodeArena { nodes: Vec::new() }
    }

    pub fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId::new(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop every node at once. All outstanding [`NodeId`]s are
    /// invalidated together.
    pub fn reset(&mut self) {
        self.nodes.clear();
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Flags and type ids ─────────────────────────────────────────────────────

bitflags! {
    /// Cross-cutting node properties. The bit values are stable within a
    /// library version.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        /// Executable code (instruction, label, align, ...).
        const IS_CODE = 0x01;
        /// Non-executable data (embedded bytes, const pool, ...).
        const IS_DATA = 0x02;
        /// Informative only; ignored by encoding.
        const IS_INFORMATIVE = 0x04;
        /// Safe to drop if unreachable.
        const IS_REMOVABLE = 0x08;
        /// Does nothing when executed (label, align, explicit nop).
        const HAS_NO_EFFECT = 0x10;
        /// Serializes as an instruction even if the variant is not `Inst`.
        const ACTS_AS_INST = 0x40;
        /// Serializes as a label even if the variant is not `Label`.
        const ACTS_AS_LABEL = 0x80;
    }
}

/// Stable numeric node type ids. 0 is reserved as "none"; 16..32 is the
/// range for higher-level (compiler-layer) nodes; user-defined nodes
/// start at [`USER_NODE_TYPE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeType {
    None = 0,
    Inst = 1,
    Data = 2,
    Align = 3,
    Label = 4,
    LabelData = 5,
    ConstPool = 6,
    Comment = 7,
    Sentinel = 8,
    Func = 16,
    FuncRet = 17,
    FuncCall = 18,
}

/// First type id available to user-defined nodes.
pub const USER_NODE_TYPE: u32 = 32;

// ─── Instruction payload ────────────────────────────────────────────────────

/// Operands kept inline before the vector spills to the heap. Covers the
/// common 0..4-operand instructions in a single allocation.
pub const BASE_OP_CAPACITY: usize = 4;
/// Hard cap on operands per instruction.
pub const MAX_OP_CAPACITY: usize = 6;

/// Payload of an instruction node: id, the options captured at emit time,
/// the extra operand (mask or rep-register override), and up to six
/// operands.
#[derive(Debug, Clone)]
pub struct InstNode {
    inst_id: InstId,
    options: EmitOptions,
    op_extra: Operand,
    ops: SmallVec<[Operand; BASE_OP_CAPACITY]>,
}

impl InstNode {
    pub fn new(inst_id: InstId, options: EmitOptions) -> Self {
        InstNode {
            inst_id,
            options,
            op_extra: Operand::None,
            ops: SmallVec::new(),
        }
    }

    pub fn inst_id(&self) -> InstId {
        self.inst_id
    }

    /// Passes may repoint an instruction, e.g. the SSE→AVX rewrite.
    pub fn set_inst_id(&mut self, inst_id: InstId) {
        self.inst_id = inst_id;
    }

    pub fn options(&self) -> EmitOptions {
        self.options
    }

    pub fn op_extra(&self) -> Operand {
        self.op_extra
    }

    pub fn set_op_extra(&mut self, op: Operand) {
        self.op_extra = op;
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[Operand] {
        &self.ops
    }

    /// Operand at `index`, `None` past the count (the serializer reads a
    /// fixed four slots).
    pub fn op(&self, index: usize) -> Operand {
        self.ops.get(index).copied().unwrap_or(Operand::None)
    }

    pub fn set_op(&mut self, index: usize, op: Operand) {
        debug_assert!(index < self.ops.len());
        self.ops[index] = op;
    }

    /// Append an operand; the count may never exceed [`MAX_OP_CAPACITY`].
    pub fn push_op(&mut self, op: Operand) {
        debug_assert!(self.ops.len() < MAX_OP_CAPACITY);
        self.ops.push(op);
    }

    /// Insert an operand at `index`, shifting the rest right by one.
    pub fn insert_op(&mut self, index: usize, op: Operand) {
        debug_assert!(self.ops.len() < MAX_OP_CAPACITY);
        self.ops.insert(index, op);
    }

    pub fn has_mem_op(&self) -> bool {
        self.ops.iter().any(|op| op.is_mem())
    }

    pub fn has_reg_op(&self) -> bool {
        self.ops.iter().any(|op| op.is_reg())
    }
}

// ─── Data payload ───────────────────────────────────────────────────────────

/// Payloads at most this large are stored inline in the node; anything
/// larger is cloned into the data arena.
pub const INLINE_BUFFER_SIZE: usize = 56;

#[derive(Debug, Clone)]
enum DataPayload {
    Inline { len: u8, bytes: [u8; INLINE_BUFFER_SIZE] },
    External(Span),
}

/// Raw bytes placed at the node's position. No byte-order conversion is
/// ever applied.
#[derive(Debug, Clone)]
pub struct DataNode {
    payload: DataPayload,
}

impl DataNode {
    /// Copy `bytes` inline, or clone them into `data_arena` past the
    /// inline threshold. `None` if the arena refuses.
    pub fn new(bytes: &[u8], data_arena: &mut ByteArena) -> Option<Self> {
        let payload = if bytes.len() <= INLINE_BUFFER_SIZE {
            let mut buf = [0u8; INLINE_BUFFER_SIZE];
            buf[..bytes.len()].copy_from_slice(bytes);
            DataPayload::Inline {
                len: bytes.len() as u8,
                bytes: buf,
            }
        } else {
            DataPayload::External(data_arena.dup(bytes, false)?)
        };
        Some(DataNode { payload })
    }

    /// Zero-filled payload of `size` bytes, to be filled in place (the
    /// const-pool embedding path).
    pub fn zeroed(size: usize, data_arena: &mut ByteArena) -> Option<Self> {
        let payload = if size <= INLINE_BUFFER_SIZE {
            DataPayload::Inline {
                len: size as u8,
                bytes: [0u8; INLINE_BUFFER_SIZE],
            }
        } else {
            DataPayload::External(data_arena.alloc(size, 1)?)
        };
        Some(DataNode { payload })
    }

    pub fn size(&self) -> usize {
        match &self.payload {
            DataPayload::Inline { len, .. } => *len as usize,
            DataPayload::External(span) => span.len(),
        }
    }

    /// True when the payload lives inline in the node.
    pub fn is_inline(&self) -> bool {
        matches!(self.payload, DataPayload::Inline { .. })
    }

    pub fn bytes<'a>(&'a self, data_arena: &'a ByteArena) -> &'a [u8] {
        match &self.payload {
            DataPayload::Inline { len, bytes } => &bytes[..*len as usize],
            DataPayload::External(span) => data_arena.get(*span),
        }
    }

    pub fn bytes_mut<'a>(&'a mut self, data_arena: &'a mut ByteArena) -> &'a mut [u8] {
        match &mut self.payload {
            DataPayload::Inline { len, bytes } => &mut bytes[..*len as usize],
            DataPayload::External(span) => data_arena.get_mut(*span),
        }
    }
}

// ─── Remaining payloads ─────────────────────────────────────────────────────

/// `.align` directive.
#[derive(Debug, Clone, Copy)]
pub struct AlignNode {
    pub mode: AlignMode,
    pub alignment: u32,
}

/// A bound label position.
#[derive(Debug, Clone, Copy)]
pub struct LabelNode {
    id: LabelId,
}

impl LabelNode {
    pub fn new(id: LabelId) -> Self {
        LabelNode { id }
    }

    pub fn id(&self) -> LabelId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: LabelId) {
        self.id = id;
    }

    pub fn label(&self) -> Label {
        Label::from_id(self.id)
    }
}

/// A constant pool bound at a label.
#[derive(Debug)]
pub struct ConstPoolNode {
    label: LabelNode,
    pool: ConstPool,
}

impl ConstPoolNode {
    pub fn new(id: LabelId) -> Self {
        ConstPoolNode {
            label: LabelNode::new(id),
            pool: ConstPool::new(),
        }
    }

    pub fn label(&self) -> Label {
        self.label.label()
    }

    pub(crate) fn set_label_id(&mut self, id: LabelId) {
        self.label.set_id(id);
    }

    pub fn pool(&self) -> &ConstPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ConstPool {
        &mut self.pool
    }
}

/// Extension point for higher-level layers: a payload outside the eight
/// concrete variants. The `ACTS_AS_INST` / `ACTS_AS_LABEL` flags on the
/// carrying node decide which capability view the serializer asks for.
pub trait UserNode: fmt::Debug {
    /// Stable type id; must be ≥ [`USER_NODE_TYPE`] for user nodes, or in
    /// the 16..32 range for compiler-layer nodes.
    fn type_id(&self) -> u32;

    /// Instruction view, required when the node carries `ACTS_AS_INST`.
    fn inst(&self) -> Option<&InstNode> {
        None
    }

    /// Label view, required when the node carries `ACTS_AS_LABEL`.
    fn label(&self) -> Option<Label> {
        None
    }
}

// ─── Node ───────────────────────────────────────────────────────────────────

/// Variant payload of a node.
#[derive(Debug)]
pub enum NodeKind {
    Inst(InstNode),
    Data(DataNode),
    Align(AlignNode),
    Label(LabelNode),
    /// A label id embedded as addressable data (relocation target).
    LabelData(Label),
    ConstPool(ConstPoolNode),
    /// Text lives in the node's inline-comment slot.
    Comment,
    /// Position marker; never removed by any pass.
    Sentinel,
    User(Box<dyn UserNode>),
}

/// One element of the builder's chain.
pub struct Node {
    prev: Option<NodeId>,
    next: Option<NodeId>,
    flags: NodeFlags,
    /// Reserved for passes; this layer never assigns it.
    position: u32,
    inline_comment: Option<Span>,
    kind: NodeKind,
}

impl Node {
    /// Construct with the variant's default flags OR-ed with `extra`
    /// (the builder's per-node flag template).
    pub fn new(kind: NodeKind, extra: NodeFlags) -> Self {
        let flags = Self::default_flags(&kind) | extra;
        Node {
            prev: None,
            next: None,
            flags,
            position: 0,
            inline_comment: None,
            kind,
        }
    }

    fn default_flags(kind: &NodeKind) -> NodeFlags {
        match kind {
            NodeKind::Inst(_) => {
                NodeFlags::IS_CODE | NodeFlags::IS_REMOVABLE | NodeFlags::ACTS_AS_INST
            }
            NodeKind::Data(_) => NodeFlags::IS_DATA,
            NodeKind::Align(_) => NodeFlags::IS_CODE | NodeFlags::HAS_NO_EFFECT,
            NodeKind::Label(_) => NodeFlags::HAS_NO_EFFECT | NodeFlags::ACTS_AS_LABEL,
            NodeKind::LabelData(_) => NodeFlags::IS_DATA,
            NodeKind::ConstPool(_) => NodeFlags::IS_DATA | NodeFlags::ACTS_AS_LABEL,
            NodeKind::Comment => {
                NodeFlags::IS_INFORMATIVE | NodeFlags::HAS_NO_EFFECT | NodeFlags::IS_REMOVABLE
            }
            NodeKind::Sentinel => NodeFlags::IS_INFORMATIVE | NodeFlags::HAS_NO_EFFECT,
            NodeKind::User(_) => NodeFlags::empty(),
        }
    }

    pub fn prev(&self) -> Option<NodeId> {
        self.prev
    }

    pub fn next(&self) -> Option<NodeId> {
        self.next
    }

    pub(crate) fn set_prev(&mut self, prev: Option<NodeId>) {
        self.prev = prev;
    }

    pub(crate) fn set_next(&mut self, next: Option<NodeId>) {
        self.next = next;
    }

    /// Neither linked nor an endpoint of any list.
    pub fn is_detached(&self) -> bool {
        self.prev.is_none() && self.next.is_none()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }

    /// Stable numeric type id of this node.
    pub fn type_id(&self) -> u32 {
        match &self.kind {
            NodeKind::Inst(_) => NodeType::Inst as u32,
            NodeKind::Data(_) => NodeType::Data as u32,
            NodeKind::Align(_) => NodeType::Align as u32,
            NodeKind::Label(_) => NodeType::Label as u32,
            NodeKind::LabelData(_) => NodeType::LabelData as u32,
            NodeKind::ConstPool(_) => NodeType::ConstPool as u32,
            NodeKind::Comment => NodeType::Comment as u32,
            NodeKind::Sentinel => NodeType::Sentinel as u32,
            NodeKind::User(u) => u.type_id(),
        }
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn has_flag(&self, flag: NodeFlags) -> bool {
        self.flags.intersects(flag)
    }

    pub fn add_flags(&mut self, flags: NodeFlags) {
        self.flags |= flags;
    }

    pub fn clear_flags(&mut self, flags: NodeFlags) {
        self.flags &= !flags;
    }

    pub fn is_code(&self) -> bool {
        self.has_flag(NodeFlags::IS_CODE)
    }

    pub fn is_data(&self) -> bool {
        self.has_flag(NodeFlags::IS_DATA)
    }

    pub fn is_informative(&self) -> bool {
        self.has_flag(NodeFlags::IS_INFORMATIVE)
    }

    pub fn is_removable(&self) -> bool {
        self.has_flag(NodeFlags::IS_REMOVABLE)
    }

    pub fn has_no_effect(&self) -> bool {
        self.has_flag(NodeFlags::HAS_NO_EFFECT)
    }

    pub fn acts_as_inst(&self) -> bool {
        self.has_flag(NodeFlags::ACTS_AS_INST)
    }

    pub fn acts_as_label(&self) -> bool {
        self.has_flag(NodeFlags::ACTS_AS_LABEL)
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn set_position(&mut self, position: u32) {
        self.position = position;
    }

    pub fn inline_comment(&self) -> Option<Span> {
        self.inline_comment
    }

    pub fn set_inline_comment(&mut self, comment: Option<Span>) {
        self.inline_comment = comment;
    }

    /// Instruction view: the `Inst` payload, or a user node's instruction
    /// capability when `ACTS_AS_INST` is set.
    pub fn as_inst(&self) -> Option<&InstNode> {
        match &self.kind {
            NodeKind::Inst(inst) => Some(inst),
            NodeKind::User(u) if self.acts_as_inst() => u.inst(),
            _ => None,
        }
    }

    pub fn as_inst_mut(&mut self) -> Option<&mut InstNode> {
        match &mut self.kind {
            NodeKind::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    /// Label view: `Label`/`ConstPool` payloads, or a user node's label
    /// capability when `ACTS_AS_LABEL` is set.
    pub fn as_label(&self) -> Option<Label> {
        match &self.kind {
            NodeKind::Label(l) => Some(l.label()),
            NodeKind::ConstPool(p) => Some(p.label()),
            NodeKind::User(u) if self.acts_as_label() => u.label(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::InstId;

    #[test]
    fn type_ids_are_stable() {
        assert_eq!(NodeType::Inst as u32, 1);
        assert_eq!(NodeType::Data as u32, 2);
        assert_eq!(NodeType::Align as u32, 3);
        assert_eq!(NodeType::Label as u32, 4);
        assert_eq!(NodeType::LabelData as u32, 5);
        assert_eq!(NodeType::ConstPool as u32, 6);
        assert_eq!(NodeType::Comment as u32, 7);
        assert_eq!(NodeType::Sentinel as u32, 8);
        assert_eq!(NodeType::Func as u32, 16);
        assert_eq!(USER_NODE_TYPE, 32);
    }

    #[test]
    fn flag_bits_are_stable() {
        assert_eq!(NodeFlags::IS_CODE.bits(), 0x01);
        assert_eq!(NodeFlags::IS_DATA.bits(), 0x02);
        assert_eq!(NodeFlags::IS_INFORMATIVE.bits(), 0x04);
        assert_eq!(NodeFlags::IS_REMOVABLE.bits(), 0x08);
        assert_eq!(NodeFlags::HAS_NO_EFFECT.bits(), 0x10);
        assert_eq!(NodeFlags::ACTS_AS_INST.bits(), 0x40);
        assert_eq!(NodeFlags::ACTS_AS_LABEL.bits(), 0x80);
    }

    #[test]
    fn default_flags_per_variant() {
        let inst = Node::new(
            NodeKind::Inst(InstNode::new(InstId(1), EmitOptions::empty())),
            NodeFlags::empty(),
        );
        assert!(inst.is_code() && inst.is_removable() && inst.acts_as_inst());

        let comment = Node::new(NodeKind::Comment, NodeFlags::empty());
        assert!(comment.is_informative() && comment.has_no_effect() && comment.is_removable());

        let sentinel = Node::new(NodeKind::Sentinel, NodeFlags::empty());
        assert!(sentinel.is_informative() && sentinel.has_no_effect());
        assert!(!sentinel.is_removable());

        let label = Node::new(NodeKind::Label(LabelNode::new(1)), NodeFlags::empty());
        assert!(label.has_no_effect() && label.acts_as_label() && !label.is_data());

        let pool = Node::new(NodeKind::ConstPool(ConstPoolNode::new(1)), NodeFlags::empty());
        assert!(pool.is_data() && pool.acts_as_label());
        assert!(!pool.is_code() && !pool.has_no_effect());
    }

    #[test]
    fn node_flags_template_is_merged() {
        let node = Node::new(NodeKind::Sentinel, NodeFlags::IS_REMOVABLE);
        assert!(node.is_removable());
        assert!(node.is_informative());
    }

    #[test]
    fn data_payload_boundary() {
        let mut arena = ByteArena::new();

        let at_limit = DataNode::new(&[0xAB; INLINE_BUFFER_SIZE], &mut arena).unwrap();
        assert!(at_limit.is_inline());
        assert_eq!(at_limit.size(), INLINE_BUFFER_SIZE);

        let past_limit = DataNode::new(&[0xCD; INLINE_BUFFER_SIZE + 1], &mut arena).unwrap();
        assert!(!past_limit.is_inline());
        assert_eq!(past_limit.size(), INLINE_BUFFER_SIZE + 1);
        assert!(past_limit.bytes(&arena).iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn inst_op_access_pads_with_none() {
        let mut inst = InstNode::new(InstId(7), EmitOptions::empty());
        inst.push_op(Operand::Imm(3));
        assert_eq!(inst.op_count(), 1);
        assert_eq!(inst.op(0), Operand::Imm(3));
        assert_eq!(inst.op(3), Operand::None);
    }
}
