//! Bump-allocated byte arenas.
//!
//! Payload bytes (embedded data, comment strings, label names) live in a
//! [`ByteArena`]: an ordered list of blocks, each filled front to back by a
//! bump offset. Allocation hands out [`Span`] handles instead of pointers;
//! a span stays cheap to copy and can only be resolved through the arena
//! that issued it. The whole arena is reclaimed at once by [`reset`] — no
//! per-allocation bookkeeping exists.
//!
//! [`reset`]: ByteArena::reset

/// Handle to a byte range inside a [`ByteArena`].
///
/// Resolving a span after the arena was reset panics on out-of-range access
/// rather than reading stale bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    block: u32,
    start: u32,
    len: u32,
}

impl Span {
    /// Length of the spanned range in bytes.
    pub fn len(self) -> usize {
        self.len as usize
    }

    pub fn is_empty(self) -> bool {
        self.len == 0
    }
}

/// Default capacity of a freshly grown block.
const BLOCK_SIZE: usize = 16 * 1024;

/// A bump allocator over byte blocks.
pub struct ByteArena {
    blocks: Vec<Vec<u8>>,
    /// Bytes handed out so far, including alignment padding.
    used: usize,
    /// Refuse allocations once `used` would exceed this.
    limit: Option<usize>,
}

impl ByteArena {
    pub fn new() -> Self {
        ByteArena {
            blocks: Vec::new(),
            used: 0,
            limit: None,
        }
    }

    /// An arena that refuses to hand out more than `limit` bytes in total.
    ///
    /// This is how allocation failure stays observable: `alloc` returns
    /// `None` past the limit and callers surface `Error::NoHeapMemory`.
    pub fn with_limit(limit: usize) -> Self {
        ByteArena {
            blocks: Vec::new(),
            used: 0,
            limit: Some(limit),
        }
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Allocate `size` bytes aligned to `align` (a power of two), zeroed.
    ///
    /// Returns `None` if the byte limit would be exceeded.
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<Span> {
        debug_assert!(align.is_power_of_two());

        let block_idx = match self.blocks.last() {
            Some(block) => {
                let start = align_up(block.len(), align);
                if start + size <= block.capacity() {
                    self.blocks.len() - 1
                } else {
                    self.grow(size + align)?;
                    self.blocks.len() - 1
                }
            }
            None => {
                self.grow(size + align)?;
                0
            }
        };

        let block = &mut self.blocks[block_idx];
        let start = align_up(block.len(), align);
        let padding = start - block.len();
        if let Some(limit) = self.limit {
            if self.used + padding + size > limit {
                return None;
            }
        }
        block.resize(start + size, 0);
        self.used += padding + size;

        Some(Span {
            block: block_idx as u32,
            start: start as u32,
            len: size as u32,
        })
    }

    /// Copy `bytes` into the arena. When `nul_terminate` is set, a trailing
    /// zero byte is written past the span (the span itself covers only
    /// `bytes.len()`).
    pub fn dup(&mut self, bytes: &[u8], nul_terminate: bool) -> Option<Span> {
        let extra = usize::from(nul_terminate);
        let span = self.alloc(bytes.len() + extra, 1)?;
        let dst = &mut self.blocks[span.block as usize];
        dst[span.start as usize..span.start as usize + bytes.len()].copy_from_slice(bytes);
        Some(Span {
            len: bytes.len() as u32,
            ..span
        })
    }

    /// Copy a string into the arena; resolve it back with [`get_str`].
    ///
    /// [`get_str`]: ByteArena::get_str
    pub fn intern_str(&mut self, s: &str) -> Option<Span> {
        self.dup(s.as_bytes(), true)
    }

    /// Resolve a span issued by this arena.
    pub fn get(&self, span: Span) -> &[u8] {
        let block = &self.blocks[span.block as usize];
        &block[span.start as usize..span.start as usize + span.len as usize]
    }

    /// Mutable view of a span, for payloads filled after allocation.
    pub fn get_mut(&mut self, span: Span) -> &mut [u8] {
        let block = &mut self.blocks[span.block as usize];
        &mut block[span.start as usize..span.start as usize + span.len as usize]
    }

    /// Resolve a span interned via [`intern_str`].
    ///
    /// [`intern_str`]: ByteArena::intern_str
    pub fn get_str(&self, span: Span) -> &str {
        core::str::from_utf8(self.get(span)).expect("span was interned from &str")
    }

    /// Rewind every block to empty. All previously issued spans become
    /// invalid at once. With `free_blocks` set, all but one retained block
    /// are deallocated.
    pub fn reset(&mut self, free_blocks: bool) {
        if free_blocks {
            self.blocks.truncate(1);
        }
        for block in &mut self.blocks {
            block.clear();
        }
        self.used = 0;
    }

    fn grow(&mut self, at_least: usize) -> Option<()> {
        if let Some(limit) = self.limit {
            if self.used >= limit {
                return None;
            }
        }
        self.blocks.push(Vec::with_capacity(BLOCK_SIZE.max(at_least)));
        Some(())
    }
}

impl Default for ByteArena {
    fn default() -> Self {
        Self::new()
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
