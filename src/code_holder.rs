//! The code-holder contract: label-id issuance and bookkeeping.
//!
//! The builder does not own label ids — a code-holder does, so that
//! several emitters attached to the same holder agree on them. Only the
//! operations the builder consumes are specified here; section and
//! relocation bookkeeping belong to the holder's real implementation.

use std::collections::HashMap;

use crate::error::Error;
use crate::operand::{Label, LabelId};

/// Kind of a named label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    /// Unnamed, local to the holder.
    Anonymous,
    /// Named, visible within one compilation unit.
    Local,
    /// Named, externally visible.
    Global,
}

/// Issues label ids and answers validity queries.
///
/// Ids are dense and start at 1; id 0 is the invalid sentinel, so
/// `labels_count` includes the unused slot 0 and a freshly issued id is
/// always `labels_count - 1` after issuance.
pub trait CodeHolder {
    /// Issue a fresh anonymous label id.
    fn new_label_id(&mut self) -> Result<LabelId, Error>;

    /// Issue a fresh id for a named label. Duplicate names fail with
    /// [`Error::LabelAlreadyDefined`]; empty names with
    /// [`Error::InvalidArgument`].
    fn new_named_label_id(
        &mut self,
        name: &str,
        kind: LabelKind,
        parent_id: LabelId,
    ) -> Result<LabelId, Error>;

    /// One past the highest issued id (counting the reserved slot 0).
    fn labels_count(&self) -> usize;

    /// Whether `label` carries an id this holder issued.
    fn is_label_valid(&self, label: Label) -> bool {
        label.is_valid() && (label.id() as usize) < self.labels_count()
    }
}

/// Minimal in-memory code-holder, sufficient for the builder and tests.
#[derive(Debug, Default)]
pub struct CodeInfo {
    next_id: LabelId,
    names: HashMap<String, LabelId>,
}

impl CodeInfo {
    pub fn new() -> Self {
        CodeInfo {
            next_id: 1,
            names: HashMap::new(),
        }
    }

    /// Resolve a previously registered name.
    pub fn label_by_name(&self, name: &str) -> Option<Label> {
        self.names.get(name).copied().map(Label::from_id)
    }
}

impl CodeHolder for CodeInfo {
    fn new_label_id(&mut self) -> Result<LabelId, Error> {
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    fn new_named_label_id(
        &mut self,
        name: &str,
        kind: LabelKind,
        parent_id: LabelId,
    ) -> Result<LabelId, Error> {
        if name.is_empty() || kind == LabelKind::Anonymous {
            return Err(Error::InvalidArgument);
        }
        // Local labels are scoped by their parent; globals ignore it.
        let key = match kind {
            LabelKind::Local => format!("{parent_id}.{name}"),
            _ => name.to_owned(),
        };
        if self.names.contains_key(&key) {
            return Err(Error::LabelAlreadyDefined);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.names.insert(key, id);
        Ok(id)
    }

    fn labels_count(&self) -> usize {
        self.next_id as usize
    }
}
