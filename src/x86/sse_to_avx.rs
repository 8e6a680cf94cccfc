//! SSE→AVX conversion pass.
//!
//! Rewrites legacy two-operand SIMD instructions in place to their
//! non-destructive AVX forms. Two phases: a probe that collects every
//! convertible instruction (and aborts the whole pass, leaving the chain
//! untouched, the moment anything unconvertible shows up), then a rewrite
//! that reshapes operands and patches instruction ids. All-or-nothing:
//! mixing VEX and legacy SSE encodings would cost transition stalls, so a
//! single stubborn instruction keeps the whole chain legacy.

use tracing::debug;

use crate::builder::Builder;
use crate::error::Error;
use crate::inst::{AvxConvMode, InstDb, InstId};
use crate::node::{InstNode, NodeKind};
use crate::operand::{Operand, RegType};
use crate::pass::{Pass, ScratchArena};
use crate::x86::{xmm, INST_DB};

/// OR of `1 << reg.kind` across the register operands.
fn probe_regs(ops: &[Operand]) -> u32 {
    let mut mask = 0;
    for op in ops {
        if let Some(reg) = op.as_reg() {
            mask |= reg.kind.mask();
        }
    }
    mask
}

pub struct SseToAvxPass {
    db: &'static InstDb,
    translated: bool,
}

impl SseToAvxPass {
    pub fn new() -> Self {
        Self::with_db(&INST_DB)
    }

    pub fn with_db(db: &'static InstDb) -> Self {
        SseToAvxPass {
            db,
            translated: false,
        }
    }

    /// Whether a previous `run` completed the rewrite. Running again
    /// without rebuilding the chain is a misuse; the guard makes it a
    /// no-op instead.
    pub fn translated(&self) -> bool {
        self.translated
    }
}

impl Default for SseToAvxPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for SseToAvxPass {
    fn name(&self) -> &'static str {
        "sse-to-avx"
    }

    fn run(&mut self, cb: &mut Builder, scratch: &mut ScratchArena) -> Result<(), Error> {
        if self.translated {
            return Ok(());
        }

        // Probe: collect every convertible instruction, abort on the
        // first one that cannot be translated.
        let mut cur = cb.first_node();
        while let Some(id) = cur {
            let node = cb.node(id);
            cur = node.next();

            let inst = match node.kind() {
                NodeKind::Inst(inst) => inst,
                _ => continue,
            };

            // Undefined and higher-level ids are not ours to touch.
            if !self.db.is_defined(inst.inst_id()) {
                continue;
            }
            let info = self.db.get(inst.inst_id());
            if !info.is_sse_family() {
                continue;
            }

            let reg_types = probe_regs(inst.ops());
            if reg_types & RegType::Xmm.mask() == 0 {
                continue;
            }
            if reg_types & RegType::Mm.mask() != 0 {
                // An MMX↔XMM conversion; AVX has no instruction that
                // touches MMX registers.
                debug!(inst = info.name, "sse-to-avx: mmx operand, chain left untouched");
                return Ok(());
            }

            let op_count = inst.op_count();
            match info.sse_data().avx_conv_mode {
                AvxConvMode::None => {
                    debug!(inst = info.name, "sse-to-avx: no avx form, chain left untouched");
                    return Ok(());
                }
                AvxConvMode::Move => {}
                AvxConvMode::MoveIfMem | AvxConvMode::Extend => {
                    if !(1..=3).contains(&op_count) {
                        return Ok(());
                    }
                }
                AvxConvMode::Blend => {
                    if !(2..=3).contains(&op_count) {
                        return Ok(());
                    }
                }
            }

            scratch.node_stack.push(id);
        }

        // Rewrite: every collected instruction is known convertible.
        for &id in &scratch.node_stack {
            let inst = match cb.node_mut(id).kind_mut() {
                NodeKind::Inst(inst) => inst,
                _ => continue,
            };

            let sse_data = self.db.get(inst.inst_id()).sse_data();
            match sse_data.avx_conv_mode {
                AvxConvMode::None => {}
                AvxConvMode::Move => {}
                AvxConvMode::MoveIfMem => {
                    if !inst.has_mem_op() {
                        extend(inst);
                    }
                }
                AvxConvMode::Blend => {
                    // [xmmA, xmmB/m128, <xmm0>] becomes explicit before
                    // the extend: [xmmA, xmmA, xmmB/m128, xmm0].
                    if inst.op_count() == 2 {
                        inst.push_op(Operand::Reg(xmm(0)));
                    }
                    extend(inst);
                }
                AvxConvMode::Extend => extend(inst),
            }

            let patched = inst.inst_id().0 as i32 + sse_data.avx_conv_delta as i32;
            inst.set_inst_id(InstId(patched as u16));
        }

        debug!(
            converted = scratch.node_stack.len(),
            "sse-to-avx: chain translated"
        );
        self.translated = true;
        Ok(())
    }
}

/// Shift the operands right by one, duplicating slot 0 as the
/// destination of the three-operand form.
fn extend(inst: &mut InstNode) {
    let dst = inst.op(0);
    inst.insert_op(0, dst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_holder::CodeInfo;
    use crate::x86::inst_id;

    fn builder() -> Builder {
        let mut cb = Builder::new();
        cb.attach(Box::new(CodeInfo::new()));
        cb
    }

    fn run(cb: &mut Builder) -> SseToAvxPass {
        let mut pass = SseToAvxPass::new();
        let mut scratch = ScratchArena::new();
        pass.run(cb, &mut scratch).unwrap();
        pass
    }

    fn first_inst(cb: &Builder) -> (InstId, Vec<Operand>) {
        let id = cb.first_node().unwrap();
        let inst = cb.node(id).as_inst().unwrap();
        (inst.inst_id(), inst.ops().to_vec())
    }

    #[test]
    fn move_mode_keeps_operand_shape() {
        let mut cb = builder();
        cb.emit(
            inst_id::MOVAPS,
            Operand::Reg(xmm(2)),
            Operand::Reg(xmm(3)),
            Operand::None,
            Operand::None,
        )
        .unwrap();

        let pass = run(&mut cb);
        assert!(pass.translated());
        let (id, ops) = first_inst(&cb);
        assert_eq!(id, inst_id::VMOVAPS);
        assert_eq!(ops, vec![Operand::Reg(xmm(2)), Operand::Reg(xmm(3))]);
    }

    #[test]
    fn move_if_mem_with_memory_operand_does_not_reshape() {
        use crate::operand::Mem;
        use crate::x86::gp64;

        let mut cb = builder();
        cb.emit(
            inst_id::MOVSS,
            Operand::Reg(xmm(1)),
            Operand::Mem(Mem::base_disp(gp64(0), 8)),
            Operand::None,
            Operand::None,
        )
        .unwrap();

        run(&mut cb);
        let (id, ops) = first_inst(&cb);
        assert_eq!(id, inst_id::VMOVSS);
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn move_if_mem_register_form_extends() {
        let mut cb = builder();
        cb.emit(
            inst_id::MOVSS,
            Operand::Reg(xmm(1)),
            Operand::Reg(xmm(2)),
            Operand::None,
            Operand::None,
        )
        .unwrap();

        run(&mut cb);
        let (id, ops) = first_inst(&cb);
        assert_eq!(id, inst_id::VMOVSS);
        assert_eq!(
            ops,
            vec![
                Operand::Reg(xmm(1)),
                Operand::Reg(xmm(1)),
                Operand::Reg(xmm(2)),
            ]
        );
    }

    #[test]
    fn non_xmm_sse_id_is_skipped() {
        // An SSE-family id used without XMM registers (e.g. after a
        // higher layer replaced operands) is simply not a candidate.
        let mut cb = builder();
        cb.emit(
            inst_id::ADDPS,
            Operand::Imm(1),
            Operand::Imm(2),
            Operand::None,
            Operand::None,
        )
        .unwrap();

        let pass = run(&mut cb);
        assert!(pass.translated());
        let (id, _) = first_inst(&cb);
        assert_eq!(id, inst_id::ADDPS);
    }

    #[test]
    fn second_run_short_circuits() {
        let mut cb = builder();
        cb.emit(
            inst_id::ADDPS,
            Operand::Reg(xmm(0)),
            Operand::Reg(xmm(1)),
            Operand::None,
            Operand::None,
        )
        .unwrap();

        let mut pass = SseToAvxPass::new();
        let mut scratch = ScratchArena::new();
        pass.run(&mut cb, &mut scratch).unwrap();
        let after_first = first_inst(&cb);

        scratch.reset();
        pass.run(&mut cb, &mut scratch).unwrap();
        assert_eq!(first_inst(&cb), after_first);
    }

    #[test]
    fn probe_mask_covers_all_register_operands() {
        let ops = [
            Operand::Reg(xmm(0)),
            Operand::Mem(crate::operand::Mem::abs(0)),
            Operand::Reg(crate::x86::mm(1)),
            Operand::Imm(3),
        ];
        let mask = probe_regs(&ops);
        assert_eq!(
            mask,
            RegType::Xmm.mask() | RegType::Mm.mask()
        );
    }
}
