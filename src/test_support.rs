//! Capturing mock emitter for tests.
//!
//! [`RecordingEmitter`] implements the full [`Emitter`] contract and
//! records every call as an [`EmitterCall`], folding the one-shot setters
//! into the next `emit` the way a real target consumes them. Round-trip
//! tests compare two recordings for equality.

use crate::code_holder::LabelKind;
use crate::const_pool::ConstPool;
use crate::emitter::{AlignMode, EmitOptions, Emitter};
use crate::error::Error;
use crate::inst::InstId;
use crate::operand::{Label, LabelId, Operand};

/// One observed emitter call, with the one-shot state that applied to it.
#[derive(Debug, Clone, PartialEq)]
pub enum EmitterCall {
    Emit {
        inst_id: InstId,
        ops: [Operand; 4],
        options: EmitOptions,
        op4: Operand,
        op5: Operand,
        op_extra: Operand,
        inline_comment: Option<String>,
    },
    NewLabel(Label),
    NewNamedLabel {
        label: Label,
        name: String,
        kind: LabelKind,
        parent_id: LabelId,
    },
    Bind(Label),
    Align(AlignMode, u32),
    Embed(Vec<u8>),
    EmbedLabel(Label),
    EmbedConstPool {
        label: Label,
        bytes: Vec<u8>,
        alignment: usize,
    },
    Comment(String),
}

/// Records calls instead of encoding them.
///
/// Optionally fails a specific call index to exercise error propagation.
#[derive(Default)]
pub struct RecordingEmitter {
    pub calls: Vec<EmitterCall>,
    next_label: LabelId,
    fail_at: Option<usize>,

    options: EmitOptions,
    inline_comment: Option<String>,
    op4: Operand,
    op5: Operand,
    op_extra: Operand,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        RecordingEmitter {
            next_label: 1,
            ..Default::default()
        }
    }

    /// Fail (with `InvalidState`) the call that would land at `index`.
    pub fn fail_at(index: usize) -> Self {
        RecordingEmitter {
            fail_at: Some(index),
            ..Self::new()
        }
    }

    fn record(&mut self, call: EmitterCall) -> Result<(), Error> {
        if self.fail_at == Some(self.calls.len()) {
            return Err(Error::InvalidState);
        }
        self.calls.push(call);
        Ok(())
    }
}

impl Emitter for RecordingEmitter {
    fn emit(
        &mut self,
        inst_id: InstId,
        o0: Operand,
        o1: Operand,
        o2: Operand,
        o3: Operand,
    ) -> Result<(), Error> {
        let call = EmitterCall::Emit {
            inst_id,
            ops: [o0, o1, o2, o3],
            options: self.options,
            op4: self.op4,
            op5: self.op5,
            op_extra: self.op_extra,
            inline_comment: self.inline_comment.take(),
        };
        self.options = EmitOptions::empty();
        self.op4 = Operand::None;
        self.op5 = Operand::None;
        self.op_extra = Operand::None;
        self.record(call)
    }

    fn new_label(&mut self) -> Label {
        let label = Label::from_id(self.next_label);
        self.next_label += 1;
        let _ = self.record(EmitterCall::NewLabel(label));
        label
    }

    fn new_named_label(&mut self, name: &str, kind: LabelKind, parent_id: LabelId) -> Label {
        let label = Label::from_id(self.next_label);
        self.next_label += 1;
        let _ = self.record(EmitterCall::NewNamedLabel {
            label,
            name: name.to_owned(),
            kind,
            parent_id,
        });
        label
    }

    fn bind(&mut self, label: Label) -> Result<(), Error> {
        self.record(EmitterCall::Bind(label))
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> Result<(), Error> {
        self.record(EmitterCall::Align(mode, alignment))
    }

    fn embed(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.record(EmitterCall::Embed(bytes.to_vec()))
    }

    fn embed_label(&mut self, label: Label) -> Result<(), Error> {
        self.record(EmitterCall::EmbedLabel(label))
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> Result<(), Error> {
        let mut bytes = vec![0u8; pool.size()];
        pool.fill(&mut bytes);
        self.record(EmitterCall::EmbedConstPool {
            label,
            bytes,
            alignment: pool.alignment(),
        })
    }

    fn comment(&mut self, text: &str) -> Result<(), Error> {
        self.record(EmitterCall::Comment(text.to_owned()))
    }

    fn set_options(&mut self, options: EmitOptions) {
        self.options = options;
    }

    fn set_inline_comment(&mut self, comment: Option<&str>) {
        self.inline_comment = comment.map(str::to_owned);
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
