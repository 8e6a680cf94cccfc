//! Deferred code-emission IR.
//!
//! A [`Builder`] implements the same [`Emitter`] contract as a byte-level
//! assembler, but instead of encoding each call it records a node in an
//! ordered, doubly-linked chain: instructions, labels, embedded data,
//! alignment directives, constant pools, comments, sentinels. Registered
//! [`Pass`]es may rewrite the chain (the [`x86::SseToAvxPass`] is the
//! worked example), and [`Builder::serialize`] finally replays everything
//! into whichever emitter it is given.
//!
//! Nodes live in arena storage owned by the builder and are addressed by
//! [`NodeId`] handles; dropping or rebinding the builder reclaims every
//! node at once. The cursor marks the insertion site, so code can be
//! inserted into the middle of a function long after it was first
//! emitted — the point of deferring emission in the first place.
//!
//! ```
//! use catena::{Builder, CodeInfo, Operand, x86};
//! use catena::test_support::RecordingEmitter;
//!
//! let mut cb = Builder::new();
//! cb.attach(Box::new(CodeInfo::new()));
//!
//! let loop_top = cb.new_label();
//! cb.bind(loop_top)?;
//! cb.emit(
//!     x86::inst_id::ADD,
//!     Operand::Reg(x86::gp64(0)),
//!     Operand::Reg(x86::gp64(1)),
//!     Operand::None,
//!     Operand::None,
//! )?;
//!
//! let mut out = RecordingEmitter::new();
//! cb.serialize(&mut out)?;
//! assert_eq!(out.calls.len(), 2);
//! # Ok::<(), catena::Error>(())
//! ```

pub mod arena;
pub mod builder;
pub mod code_holder;
pub mod const_pool;
pub mod emitter;
pub mod error;
pub mod inst;
pub mod node;
pub mod operand;
pub mod pass;
mod serialize;
pub mod test_support;
pub mod x86;

pub use arena::{ByteArena, Span};
pub use builder::Builder;
pub use code_holder::{CodeHolder, CodeInfo, LabelKind};
pub use const_pool::ConstPool;
pub use emitter::{AlignMode, EmitOptions, Emitter, InstValidator};
pub use error::Error;
pub use inst::{AvxConvMode, InstDb, InstId, InstInfo, SseData};
pub use node::{
    Node, NodeFlags, NodeId, NodeKind, NodeType, UserNode, INLINE_BUFFER_SIZE, USER_NODE_TYPE,
};
pub use operand::{Label, LabelId, Mem, Operand, Reg, RegType};
pub use pass::{NodeMap, Pass, ScratchArena};
