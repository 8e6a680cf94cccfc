//! Replay a recorded chain into a downstream emitter.
//!
//! Serialization is a read-only walk: each node turns back into the
//! emitter call that produced it, in chain order. Passes have already
//! run by the time this happens; whatever they left in the chain is what
//! the downstream emitter sees.

use tracing::trace;

use crate::builder::Builder;
use crate::emitter::Emitter;
use crate::error::Error;
use crate::node::{InstNode, NodeKind};

impl Builder {
    /// Replay every node into `dst`, stopping at the first error `dst`
    /// reports. The error is returned as-is; serialization never touches
    /// this builder's own error latch.
    pub fn serialize(&self, dst: &mut dyn Emitter) -> Result<(), Error> {
        trace!(nodes = self.node_count(), "serializing node chain");

        let mut cur = self.first_node();
        while let Some(id) = cur {
            let node = self.node(id);

            // Propagate the inline comment first; it is one-shot on the
            // destination, so nodes without one clear it.
            dst.set_inline_comment(self.inline_comment_of(id));

            match node.kind() {
                NodeKind::Inst(inst) => serialize_inst(inst, dst)?,
                NodeKind::Data(data) => dst.embed(data.bytes(self.data_arena()))?,
                NodeKind::Align(a) => dst.align(a.mode, a.alignment)?,
                NodeKind::Label(l) => dst.bind(l.label())?,
                NodeKind::LabelData(label) => dst.embed_label(*label)?,
                NodeKind::ConstPool(p) => dst.embed_const_pool(p.label(), p.pool())?,
                NodeKind::Comment => dst.comment(self.inline_comment_of(id).unwrap_or(""))?,
                NodeKind::Sentinel => {}
                NodeKind::User(_) => {
                    // Nodes outside the known set serialize through their
                    // capability views, or not at all.
                    if let Some(inst) = node.as_inst() {
                        serialize_inst(inst, dst)?;
                    } else if let Some(label) = node.as_label() {
                        dst.bind(label)?;
                    }
                }
            }

            cur = node.next();
        }
        Ok(())
    }
}

fn serialize_inst(inst: &InstNode, dst: &mut dyn Emitter) -> Result<(), Error> {
    dst.set_options(inst.options());
    dst.set_op_extra(inst.op_extra());

    let op_count = inst.op_count();
    if op_count > 4 {
        dst.set_op4(inst.op(4));
        if op_count == 6 {
            dst.set_op5(inst.op(5));
        }
    }

    dst.emit(
        inst.inst_id(),
        inst.op(0),
        inst.op(1),
        inst.op(2),
        inst.op(3),
    )
}
