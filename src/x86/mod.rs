//! x86 specifics: register constructors, the instruction-metadata table,
//! and the SSE→AVX conversion pass.

mod inst_db;
mod sse_to_avx;

pub use inst_db::{inst_id, INST_DB};
pub use sse_to_avx::SseToAvxPass;

use crate::operand::{Reg, RegType};

pub fn gp8(index: u8) -> Reg {
    Reg::new(RegType::Gp8, index)
}

pub fn gp16(index: u8) -> Reg {
    Reg::new(RegType::Gp16, index)
}

pub fn gp32(index: u8) -> Reg {
    Reg::new(RegType::Gp32, index)
}

pub fn gp64(index: u8) -> Reg {
    Reg::new(RegType::Gp64, index)
}

/// MMX register `mm<index>`.
pub fn mm(index: u8) -> Reg {
    Reg::new(RegType::Mm, index)
}

/// AVX-512 mask register `k<index>`.
pub fn k(index: u8) -> Reg {
    Reg::new(RegType::K, index)
}

pub fn xmm(index: u8) -> Reg {
    Reg::new(RegType::Xmm, index)
}

pub fn ymm(index: u8) -> Reg {
    Reg::new(RegType::Ymm, index)
}

pub fn zmm(index: u8) -> Reg {
    Reg::new(RegType::Zmm, index)
}
