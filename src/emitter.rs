//! The emitter contract.
//!
//! [`Emitter`] is the operation set shared by every emission target: the
//! deferred [`Builder`] records each call as a node, a byte-level
//! assembler would encode it immediately, and the serializer replays a
//! recorded sequence into whichever implementation it is given. Clients
//! written against this trait switch targets transparently.
//!
//! [`Builder`]: crate::Builder

use bitflags::bitflags;

use crate::code_holder::LabelKind;
use crate::const_pool::ConstPool;
use crate::error::Error;
use crate::inst::InstId;
use crate::operand::{Label, LabelId, Operand};

bitflags! {
    /// Per-emission options. All are one-shot: set before an `emit` call,
    /// consumed and cleared by it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EmitOptions: u32 {
        /// Reserved. Tested at emit time for contract stability but never
        /// set by any path in this crate; stripped before storage.
        const MAYBE_FAILURE_CASE = 0x0000_0001;
        /// Consult the attached validator before recording the
        /// instruction; stripped before storage.
        const STRICT_VALIDATION = 0x0000_0002;
        /// A fifth operand was staged via `set_op4`.
        const OP4 = 0x0000_0004;
        /// A sixth operand was staged via `set_op5`.
        const OP5 = 0x0000_0008;
        /// An extra operand (mask / rep register) was staged via
        /// `set_op_extra`.
        const OP_EXTRA = 0x0000_0010;
    }
}

impl EmitOptions {
    /// The bits stripped from an instruction before it is stored.
    pub const TRANSIENT: EmitOptions = EmitOptions::MAYBE_FAILURE_CASE
        .union(EmitOptions::STRICT_VALIDATION);
}

/// Alignment interpretation for `align` directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignMode {
    /// Pad with nops (executable filler).
    Code,
    /// Pad with zeros.
    Data,
    /// Pad with zeros, in a code section.
    Zero,
}

/// The operation set implemented by every emission target.
///
/// Errors returned by a deferred implementation latch (the first error is
/// sticky and every later call returns it); see the builder's error
/// policy. Implementations that encode immediately are free to report
/// each error independently.
pub trait Emitter {
    /// Record or encode one instruction with up to four leading operands.
    /// Additional operands and overrides arrive through the one-shot
    /// setters below.
    fn emit(
        &mut self,
        inst_id: InstId,
        o0: Operand,
        o1: Operand,
        o2: Operand,
        o3: Operand,
    ) -> Result<(), Error>;

    /// Allocate a fresh anonymous label. On failure the returned label
    /// has id 0 and the error is observable on the implementation.
    fn new_label(&mut self) -> Label;

    /// Allocate a named label through the code-holder's named allocator.
    fn new_named_label(&mut self, name: &str, kind: LabelKind, parent_id: LabelId) -> Label;

    /// Place `label` at the current position.
    fn bind(&mut self, label: Label) -> Result<(), Error>;

    /// Align the current position to `alignment` bytes.
    fn align(&mut self, mode: AlignMode, alignment: u32) -> Result<(), Error>;

    /// Place raw bytes at the current position.
    fn embed(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Place the address of `label` as data (relocation target).
    fn embed_label(&mut self, label: Label) -> Result<(), Error>;

    /// Align to the pool's alignment, bind `label`, and place the pool's
    /// contents.
    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> Result<(), Error>;

    /// Attach a standalone comment at the current position.
    fn comment(&mut self, text: &str) -> Result<(), Error>;

    // One-shot state, consumed by the next `emit`.

    fn set_options(&mut self, options: EmitOptions);

    fn set_inline_comment(&mut self, comment: Option<&str>);

    /// Stage the fifth operand; pair with [`EmitOptions::OP4`].
    fn set_op4(&mut self, op: Operand);

    /// Stage the sixth operand; pair with [`EmitOptions::OP5`].
    fn set_op5(&mut self, op: Operand);

    /// Stage the extra operand; pair with [`EmitOptions::OP_EXTRA`].
    fn set_op_extra(&mut self, op: Operand);
}

/// Strict instruction validation, consulted by the builder when
/// [`EmitOptions::STRICT_VALIDATION`] is set on an emission.
pub trait InstValidator {
    fn validate(&self, inst_id: InstId, ops: &[Operand]) -> Result<(), Error>;
}
