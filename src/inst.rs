//! Instruction-metadata contract.
//!
//! The IR layer never interprets instruction ids; it only records them.
//! The one consumer of metadata in this crate is the SSE→AVX pass, which
//! needs to know whether an id is defined, whether it belongs to the SSE
//! family, and how (if at all) it converts to its AVX form. Architecture
//! modules provide the concrete table (see [`crate::x86`]).

/// An architecture-level instruction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId(pub u16);

impl InstId {
    /// Id 0 is "no instruction".
    pub const NONE: InstId = InstId(0);
}

/// How a legacy SSE instruction rewrites to its AVX equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvxConvMode {
    /// No AVX equivalent exists; the conversion pass must leave the whole
    /// sequence untouched.
    None,
    /// Same operand shape, only the id changes.
    Move,
    /// `Move` when any operand is memory, otherwise `Extend`.
    MoveIfMem,
    /// Non-destructive three-operand form: the destination is duplicated
    /// into the first source slot.
    Extend,
    /// Like `Extend`, but an implicit trailing `xmm0` selector becomes
    /// explicit first.
    Blend,
}

/// SSE-to-AVX conversion record carried by SSE-family instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SseData {
    pub avx_conv_mode: AvxConvMode,
    /// Signed distance from the SSE id to the AVX id.
    pub avx_conv_delta: i16,
}

/// Static metadata for one instruction.
#[derive(Debug, Clone, Copy)]
pub struct InstInfo {
    pub name: &'static str,
    sse_data: Option<SseData>,
}

impl InstInfo {
    pub const fn new(name: &'static str) -> Self {
        InstInfo {
            name,
            sse_data: None,
        }
    }

    pub const fn sse(name: &'static str, mode: AvxConvMode, delta: i16) -> Self {
        InstInfo {
            name,
            sse_data: Some(SseData {
                avx_conv_mode: mode,
                avx_conv_delta: delta,
            }),
        }
    }

    pub fn is_sse_family(&self) -> bool {
        self.sse_data.is_some()
    }

    /// Conversion record; meaningful only when [`is_sse_family`] is true.
    ///
    /// [`is_sse_family`]: InstInfo::is_sse_family
    pub fn sse_data(&self) -> SseData {
        self.sse_data.unwrap_or(SseData {
            avx_conv_mode: AvxConvMode::None,
            avx_conv_delta: 0,
        })
    }
}

/// An instruction-metadata table: id-indexed, with id 0 undefined.
pub struct InstDb {
    table: &'static [InstInfo],
}

impl InstDb {
    pub const fn new(table: &'static [InstInfo]) -> Self {
        InstDb { table }
    }

    /// Whether `id` names an instruction this table knows. Id 0 and
    /// anything past the table are undefined (higher-level node ids fall
    /// in that range).
    pub fn is_defined(&self, id: InstId) -> bool {
        id.0 != 0 && (id.0 as usize) < self.table.len()
    }

    /// Metadata record for a defined id.
    pub fn get(&self, id: InstId) -> &InstInfo {
        debug_assert!(self.is_defined(id));
        &self.table[id.0 as usize]
    }

    /// Name for diagnostics; `"inst#<id>"`-style fallback is the caller's
    /// concern, this returns `None` for undefined ids.
    pub fn name(&self, id: InstId) -> Option<&'static str> {
        self.is_defined(id).then(|| self.table[id.0 as usize].name)
    }
}
