//! Instruction-metadata table.
//!
//! Only the subset this crate itself exercises is carried: a few plain
//! instructions for chain-shape tests, and the SIMD group the SSE→AVX
//! pass converts. The SSE block and its AVX counterparts are laid out at
//! a uniform distance, so every conversion delta is the same constant.

use crate::inst::{AvxConvMode, InstDb, InstInfo};

/// Distance from each convertible SSE id to its AVX id.
const AVX_DELTA: i16 = 18;

/// Instruction ids, indexes into [`INST_DB`].
pub mod inst_id {
    use crate::inst::InstId;

    pub const NOP: InstId = InstId(1);
    pub const ADD: InstId = InstId(2);
    pub const SUB: InstId = InstId(3);
    pub const MOV: InstId = InstId(4);
    pub const RET: InstId = InstId(5);

    pub const ADDPS: InstId = InstId(6);
    pub const ADDSS: InstId = InstId(7);
    pub const ADDPD: InstId = InstId(8);
    pub const SUBPS: InstId = InstId(9);
    pub const MULPS: InstId = InstId(10);
    pub const ANDPS: InstId = InstId(11);
    pub const XORPS: InstId = InstId(12);
    pub const MOVAPS: InstId = InstId(13);
    pub const MOVUPS: InstId = InstId(14);
    pub const MOVAPD: InstId = InstId(15);
    pub const MOVSS: InstId = InstId(16);
    pub const MOVSD: InstId = InstId(17);
    pub const BLENDVPS: InstId = InstId(18);
    pub const BLENDVPD: InstId = InstId(19);
    pub const PBLENDVB: InstId = InstId(20);
    pub const CVTPI2PS: InstId = InstId(21);
    pub const CVTPS2PI: InstId = InstId(22);
    pub const EXTRQ: InstId = InstId(23);

    pub const VADDPS: InstId = InstId(24);
    pub const VADDSS: InstId = InstId(25);
    pub const VADDPD: InstId = InstId(26);
    pub const VSUBPS: InstId = InstId(27);
    pub const VMULPS: InstId = InstId(28);
    pub const VANDPS: InstId = InstId(29);
    pub const VXORPS: InstId = InstId(30);
    pub const VMOVAPS: InstId = InstId(31);
    pub const VMOVUPS: InstId = InstId(32);
    pub const VMOVAPD: InstId = InstId(33);
    pub const VMOVSS: InstId = InstId(34);
    pub const VMOVSD: InstId = InstId(35);
    pub const VBLENDVPS: InstId = InstId(36);
    pub const VBLENDVPD: InstId = InstId(37);
    pub const VPBLENDVB: InstId = InstId(38);
}

static TABLE: [InstInfo; 39] = [
    InstInfo::new("<none>"),
    InstInfo::new("nop"),
    InstInfo::new("add"),
    InstInfo::new("sub"),
    InstInfo::new("mov"),
    InstInfo::new("ret"),
    // SSE family.
    InstInfo::sse("addps", AvxConvMode::Extend, AVX_DELTA),
    InstInfo::sse("addss", AvxConvMode::Extend, AVX_DELTA),
    InstInfo::sse("addpd", AvxConvMode::Extend, AVX_DELTA),
    InstInfo::sse("subps", AvxConvMode::Extend, AVX_DELTA),
    InstInfo::sse("mulps", AvxConvMode::Extend, AVX_DELTA),
    InstInfo::sse("andps", AvxConvMode::Extend, AVX_DELTA),
    InstInfo::sse("xorps", AvxConvMode::Extend, AVX_DELTA),
    InstInfo::sse("movaps", AvxConvMode::Move, AVX_DELTA),
    InstInfo::sse("movups", AvxConvMode::Move, AVX_DELTA),
    InstInfo::sse("movapd", AvxConvMode::Move, AVX_DELTA),
    InstInfo::sse("movss", AvxConvMode::MoveIfMem, AVX_DELTA),
    InstInfo::sse("movsd", AvxConvMode::MoveIfMem, AVX_DELTA),
    InstInfo::sse("blendvps", AvxConvMode::Blend, AVX_DELTA),
    InstInfo::sse("blendvpd", AvxConvMode::Blend, AVX_DELTA),
    InstInfo::sse("pblendvb", AvxConvMode::Blend, AVX_DELTA),
    // MMX↔XMM conversions and SSE4A have no AVX form.
    InstInfo::sse("cvtpi2ps", AvxConvMode::None, 0),
    InstInfo::sse("cvtps2pi", AvxConvMode::None, 0),
    InstInfo::sse("extrq", AvxConvMode::None, 0),
    // AVX forms.
    InstInfo::new("vaddps"),
    InstInfo::new("vaddss"),
    InstInfo::new("vaddpd"),
    InstInfo::new("vsubps"),
    InstInfo::new("vmulps"),
    InstInfo::new("vandps"),
    InstInfo::new("vxorps"),
    InstInfo::new("vmovaps"),
    InstInfo::new("vmovups"),
    InstInfo::new("vmovapd"),
    InstInfo::new("vmovss"),
    InstInfo::new("vmovsd"),
    InstInfo::new("vblendvps"),
    InstInfo::new("vblendvpd"),
    InstInfo::new("vpblendvb"),
];

/// The x86 metadata table.
pub static INST_DB: InstDb = InstDb::new(&TABLE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_land_on_the_avx_counterpart() {
        for (sse, avx) in [
            (inst_id::ADDPS, inst_id::VADDPS),
            (inst_id::MOVSS, inst_id::VMOVSS),
            (inst_id::BLENDVPS, inst_id::VBLENDVPS),
            (inst_id::PBLENDVB, inst_id::VPBLENDVB),
        ] {
            let data = INST_DB.get(sse).sse_data();
            assert_eq!(sse.0 as i32 + data.avx_conv_delta as i32, avx.0 as i32);

            let sse_name = INST_DB.name(sse).unwrap();
            let avx_name = INST_DB.name(avx).unwrap();
            assert_eq!(format!("v{sse_name}"), avx_name);
        }
    }

    #[test]
    fn defined_range_excludes_zero_and_past_end() {
        use crate::inst::InstId;
        assert!(!INST_DB.is_defined(InstId(0)));
        assert!(INST_DB.is_defined(inst_id::NOP));
        assert!(INST_DB.is_defined(inst_id::VPBLENDVB));
        assert!(!INST_DB.is_defined(InstId(39)));
    }

    #[test]
    fn sse_family_classification() {
        assert!(!INST_DB.get(inst_id::ADD).is_sse_family());
        assert!(INST_DB.get(inst_id::ADDPS).is_sse_family());
        assert!(INST_DB.get(inst_id::EXTRQ).is_sse_family());
        assert!(!INST_DB.get(inst_id::VADDPS).is_sse_family());
    }
}
