//! F and D extensions.
//!
//! FP registers are 64 bits with NaN boxing for single precision: a valid
//! f32 value carries all-ones in the upper half, anything else reads as the
//! canonical quiet NaN. Arithmetic runs on the host FPU in round-to-nearest;
//! conversions honour the encoded rounding mode explicitly. Exception flags
//! are computed from operands and results (invalid, divide-by-zero, and
//! conversion inexact), not from the host fenv.
//!
//! All handlers raise illegal-instruction while mstatus.FS is Off, which is
//! how FS transitions enable and disable FP decoding.

use super::{funct3, funct7, imm_i, imm_s, rd, rs1, rs2, system::illegal};
use crate::hart::HartState;
use crate::machine::MachineInner;

const F32_BOX: u64 = 0xFFFF_FFFF_0000_0000;
const F32_CANON_NAN: u32 = 0x7FC0_0000;
const F64_CANON_NAN: u64 = 0x7FF8_0000_0000_0000;

// fcsr flag bits.
const FF_NX: u32 = 1 << 0;
const FF_DZ: u32 = 1 << 3;
const FF_NV: u32 = 1 << 4;

impl HartState {
    #[inline]
    fn f32_read(&self, r: usize) -> f32 {
        let v = self.fregs[r];
        if v & F32_BOX == F32_BOX {
            f32::from_bits(v as u32)
        } else {
            f32::from_bits(F32_CANON_NAN)
        }
    }

    #[inline]
    fn f32_write(&mut self, r: usize, v: f32) {
        self.fregs[r] = F32_BOX | v.to_bits() as u64;
        self.csr.set_fs_dirty();
    }

    #[inline]
    fn f64_read(&self, r: usize) -> f64 {
        f64::from_bits(self.fregs[r])
    }

    #[inline]
    fn f64_write(&mut self, r: usize, v: f64) {
        self.fregs[r] = v.to_bits();
        self.csr.set_fs_dirty();
    }

    #[inline]
    fn fflags_raise(&mut self, bits: u32) {
        if bits != 0 {
            self.csr.fcsr |= bits & 0x1F;
            self.csr.set_fs_dirty();
        }
    }
}

fn is_snan32(v: f32) -> bool {
    v.is_nan() && v.to_bits() & 0x0040_0000 == 0
}

fn is_snan64(v: f64) -> bool {
    v.is_nan() && v.to_bits() & 0x0008_0000_0000_0000 == 0
}

fn canon32(v: f32) -> f32 {
    if v.is_nan() {
        f32::from_bits(F32_CANON_NAN)
    } else {
        v
    }
}

fn canon64(v: f64) -> f64 {
    if v.is_nan() {
        f64::from_bits(F64_CANON_NAN)
    } else {
        v
    }
}

/// Resolve the rounding mode: the rm field, or frm when dynamic. `None`
/// means a reserved mode and an illegal instruction.
fn rm_resolve(h: &HartState, i: u32) -> Option<u32> {
    let rm = funct3(i);
    let rm = if rm == 7 {
        (h.csr.fcsr >> 5) & 7
    } else {
        rm
    };
    if rm <= 4 {
        Some(rm)
    } else {
        None
    }
}

/// Apply a rounding mode in the f64 domain (exact for f32 sources).
fn round_rm(v: f64, rm: u32) -> f64 {
    match rm {
        0 => v.round_ties_even(), // RNE
        1 => v.trunc(),           // RTZ
        2 => v.floor(),           // RDN
        3 => v.ceil(),            // RUP
        _ => v.round(),           // RMM
    }
}

pub fn flw(h: &mut HartState, m: &MachineInner, i: u32) {
    if !h.csr.fpu_enabled() {
        return illegal(h, m, i);
    }
    let addr = h.addr(h.x(rs1(i)).wrapping_add(imm_i(i)));
    let Some(v) = h.load_u32(m, addr) else { return };
    h.fregs[rd(i)] = F32_BOX | v as u64;
    h.csr.set_fs_dirty();
    h.advance_pc(4);
}

pub fn fld(h: &mut HartState, m: &MachineInner, i: u32) {
    if !h.csr.fpu_enabled() {
        return illegal(h, m, i);
    }
    let addr = h.addr(h.x(rs1(i)).wrapping_add(imm_i(i)));
    let Some(v) = h.load_u64(m, addr) else { return };
    h.fregs[rd(i)] = v;
    h.csr.set_fs_dirty();
    h.advance_pc(4);
}

pub fn fsw(h: &mut HartState, m: &MachineInner, i: u32) {
    if !h.csr.fpu_enabled() {
        return illegal(h, m, i);
    }
    let addr = h.addr(h.x(rs1(i)).wrapping_add(imm_s(i)));
    if h.store_u32(m, addr, h.fregs[rs2(i)] as u32) {
        h.advance_pc(4);
    }
}

pub fn fsd(h: &mut HartState, m: &MachineInner, i: u32) {
    if !h.csr.fpu_enabled() {
        return illegal(h, m, i);
    }
    let addr = h.addr(h.x(rs1(i)).wrapping_add(imm_s(i)));
    if h.store_u64(m, addr, h.fregs[rs2(i)]) {
        h.advance_pc(4);
    }
}

/// All of OP-FP, discriminated on funct7.
pub fn op_fp(h: &mut HartState, m: &MachineInner, i: u32) {
    if !h.csr.fpu_enabled() {
        return illegal(h, m, i);
    }
    let f7 = funct7(i);
    let fmt = f7 & 3;
    if fmt > 1 {
        return illegal(h, m, i);
    }
    let dbl = fmt == 1;
    match f7 >> 2 {
        0x00 | 0x01 | 0x02 | 0x03 => fp_arith(h, m, i, dbl, f7 >> 2),
        0x0B => fp_sqrt(h, m, i, dbl),
        0x04 => fp_sgnj(h, m, i, dbl),
        0x05 => fp_minmax(h, m, i, dbl),
        0x08 => fp_cvt_ff(h, m, i, dbl),
        0x14 => fp_cmp(h, m, i, dbl),
        0x18 => fp_cvt_int_from_f(h, m, i, dbl),
        0x1A => fp_cvt_f_from_int(h, m, i, dbl),
        0x1C => match funct3(i) {
            0 => fp_mv_x(h, m, i, dbl),
            1 => fp_class(h, m, i, dbl),
            _ => illegal(h, m, i),
        },
        0x1E => fp_mv_f(h, m, i, dbl),
        _ => illegal(h, m, i),
    }
}

fn fp_arith(h: &mut HartState, m: &MachineInner, i: u32, dbl: bool, op: u32) {
    if rm_resolve(h, i).is_none() {
        return illegal(h, m, i);
    }
    let mut flags = 0;
    if dbl {
        let (a, b) = (h.f64_read(rs1(i)), h.f64_read(rs2(i)));
        if is_snan64(a) || is_snan64(b) {
            flags |= FF_NV;
        }
        let v = match op {
            0 => a + b,
            1 => a - b,
            2 => a * b,
            _ => {
                if b == 0.0 && a != 0.0 && a.is_finite() {
                    flags |= FF_DZ;
                }
                a / b
            }
        };
        if v.is_nan() && !a.is_nan() && !b.is_nan() {
            flags |= FF_NV; // inf-inf, 0*inf, 0/0, inf/inf
        }
        h.f64_write(rd(i), canon64(v));
    } else {
        let (a, b) = (h.f32_read(rs1(i)), h.f32_read(rs2(i)));
        if is_snan32(a) || is_snan32(b) {
            flags |= FF_NV;
        }
        let v = match op {
            0 => a + b,
            1 => a - b,
            2 => a * b,
            _ => {
                if b == 0.0 && a != 0.0 && a.is_finite() {
                    flags |= FF_DZ;
                }
                a / b
            }
        };
        if v.is_nan() && !a.is_nan() && !b.is_nan() {
            flags |= FF_NV;
        }
        h.f32_write(rd(i), canon32(v));
    }
    h.fflags_raise(flags);
    h.advance_pc(4);
}

fn fp_sqrt(h: &mut HartState, m: &MachineInner, i: u32, dbl: bool) {
    if rs2(i) != 0 || rm_resolve(h, i).is_none() {
        return illegal(h, m, i);
    }
    let mut flags = 0;
    if dbl {
        let a = h.f64_read(rs1(i));
        if is_snan64(a) || (a < 0.0) {
            flags |= FF_NV;
        }
        h.f64_write(rd(i), canon64(a.sqrt()));
    } else {
        let a = h.f32_read(rs1(i));
        if is_snan32(a) || (a < 0.0) {
            flags |= FF_NV;
        }
        h.f32_write(rd(i), canon32(a.sqrt()));
    }
    h.fflags_raise(flags);
    h.advance_pc(4);
}

fn fp_sgnj(h: &mut HartState, m: &MachineInner, i: u32, dbl: bool) {
    let op = funct3(i);
    if op > 2 {
        return illegal(h, m, i);
    }
    if dbl {
        let a = h.f64_read(rs1(i)).to_bits();
        let b = h.f64_read(rs2(i)).to_bits();
        let sign = 1u64 << 63;
        let s = match op {
            0 => b & sign,
            1 => !b & sign,
            _ => (a ^ b) & sign,
        };
        h.f64_write(rd(i), f64::from_bits((a & !sign) | s));
    } else {
        let a = h.f32_read(rs1(i)).to_bits();
        let b = h.f32_read(rs2(i)).to_bits();
        let sign = 1u32 << 31;
        let s = match op {
            0 => b & sign,
            1 => !b & sign,
            _ => (a ^ b) & sign,
        };
        h.f32_write(rd(i), f32::from_bits((a & !sign) | s));
    }
    h.advance_pc(4);
}

fn fp_minmax(h: &mut HartState, m: &MachineInner, i: u32, dbl: bool) {
    let maxop = match funct3(i) {
        0 => false,
        1 => true,
        _ => return illegal(h, m, i),
    };
    let mut flags = 0;
    if dbl {
        let (a, b) = (h.f64_read(rs1(i)), h.f64_read(rs2(i)));
        if is_snan64(a) || is_snan64(b) {
            flags |= FF_NV;
        }
        let v = if a.is_nan() && b.is_nan() {
            f64::from_bits(F64_CANON_NAN)
        } else if a.is_nan() {
            b
        } else if b.is_nan() {
            a
        } else if a == b {
            // Breaks the ±0 tie: min prefers -0, max prefers +0.
            if a.is_sign_negative() == maxop {
                b
            } else {
                a
            }
        } else if (a < b) != maxop {
            a
        } else {
            b
        };
        h.f64_write(rd(i), v);
    } else {
        let (a, b) = (h.f32_read(rs1(i)), h.f32_read(rs2(i)));
        if is_snan32(a) || is_snan32(b) {
            flags |= FF_NV;
        }
        let v = if a.is_nan() && b.is_nan() {
            f32::from_bits(F32_CANON_NAN)
        } else if a.is_nan() {
            b
        } else if b.is_nan() {
            a
        } else if a == b {
            if a.is_sign_negative() == maxop {
                b
            } else {
                a
            }
        } else if (a < b) != maxop {
            a
        } else {
            b
        };
        h.f32_write(rd(i), v);
    }
    h.fflags_raise(flags);
    h.advance_pc(4);
}

/// fcvt.s.d / fcvt.d.s.
fn fp_cvt_ff(h: &mut HartState, m: &MachineInner, i: u32, dbl: bool) {
    if rm_resolve(h, i).is_none() {
        return illegal(h, m, i);
    }
    match (dbl, rs2(i)) {
        (false, 1) => {
            let a = h.f64_read(rs1(i));
            let mut flags = 0;
            if is_snan64(a) {
                flags |= FF_NV;
            }
            let v = a as f32;
            if !a.is_nan() && v as f64 != a {
                flags |= FF_NX;
            }
            h.f32_write(rd(i), canon32(v));
            h.fflags_raise(flags);
        }
        (true, 0) => {
            let a = h.f32_read(rs1(i));
            let mut flags = 0;
            if is_snan32(a) {
                flags |= FF_NV;
            }
            h.f64_write(rd(i), canon64(a as f64));
            h.fflags_raise(flags);
        }
        _ => return illegal(h, m, i),
    }
    h.advance_pc(4);
}

fn fp_cmp(h: &mut HartState, m: &MachineInner, i: u32, dbl: bool) {
    let (a, b, any_nan, snan) = if dbl {
        let (a, b) = (h.f64_read(rs1(i)), h.f64_read(rs2(i)));
        (a, b, a.is_nan() || b.is_nan(), is_snan64(a) || is_snan64(b))
    } else {
        let (a, b) = (h.f32_read(rs1(i)), h.f32_read(rs2(i)));
        (
            a as f64,
            b as f64,
            a.is_nan() || b.is_nan(),
            is_snan32(a) || is_snan32(b),
        )
    };
    let (result, nv) = match funct3(i) {
        2 => ((!any_nan && a == b) as u64, snan), // feq: quiet
        1 => ((!any_nan && a < b) as u64, any_nan), // flt: signaling
        0 => ((!any_nan && a <= b) as u64, any_nan), // fle: signaling
        _ => return illegal(h, m, i),
    };
    if nv {
        h.fflags_raise(FF_NV);
    }
    h.set_x(rd(i), result);
    h.advance_pc(4);
}

/// Float → integer conversions with explicit rounding and saturation.
fn fp_cvt_int_from_f(h: &mut HartState, m: &MachineInner, i: u32, dbl: bool) {
    let Some(rm) = rm_resolve(h, i) else {
        return illegal(h, m, i);
    };
    let wide = match rs2(i) {
        0 | 1 => false,
        2 | 3 if h.rv64 => true,
        _ => return illegal(h, m, i),
    };
    let unsigned = rs2(i) & 1 != 0;
    let a = if dbl {
        h.f64_read(rs1(i))
    } else {
        h.f32_read(rs1(i)) as f64
    };
    let mut flags = 0;
    let rounded = round_rm(a, rm);
    if !a.is_nan() && rounded != a {
        flags |= FF_NX;
    }
    let result = match (wide, unsigned) {
        (false, false) => {
            let v = if a.is_nan() { i32::MAX } else { rounded as i32 };
            if a.is_nan() || rounded < i32::MIN as f64 || rounded > i32::MAX as f64 {
                flags |= FF_NV;
                flags &= !FF_NX;
            }
            v as i64 as u64
        }
        (false, true) => {
            let v = if a.is_nan() { u32::MAX } else { rounded as u32 };
            if a.is_nan() || rounded < 0.0 || rounded > u32::MAX as f64 {
                flags |= FF_NV;
                flags &= !FF_NX;
            }
            v as i32 as i64 as u64
        }
        (true, false) => {
            let v = if a.is_nan() { i64::MAX } else { rounded as i64 };
            if a.is_nan() || rounded < -(2f64.powi(63)) || rounded >= 2f64.powi(63) {
                flags |= FF_NV;
                flags &= !FF_NX;
            }
            v as u64
        }
        (true, true) => {
            let v = if a.is_nan() { u64::MAX } else { rounded as u64 };
            if a.is_nan() || rounded < 0.0 || rounded >= 2f64.powi(64) {
                flags |= FF_NV;
                flags &= !FF_NX;
            }
            v
        }
    };
    h.set_x(rd(i), result);
    h.fflags_raise(flags);
    h.advance_pc(4);
}

/// Integer → float conversions.
fn fp_cvt_f_from_int(h: &mut HartState, m: &MachineInner, i: u32, dbl: bool) {
    if rm_resolve(h, i).is_none() {
        return illegal(h, m, i);
    }
    let x = h.x(rs1(i));
    let v: f64 = match rs2(i) {
        0 => x as i32 as f64,
        1 => x as u32 as f64,
        2 if h.rv64 => x as i64 as f64,
        3 if h.rv64 => x as f64,
        _ => return illegal(h, m, i),
    };
    if dbl {
        h.f64_write(rd(i), v);
    } else {
        h.f32_write(rd(i), v as f32);
    }
    h.advance_pc(4);
}

/// fmv.x.w / fmv.x.d: raw bit move into the integer file.
fn fp_mv_x(h: &mut HartState, m: &MachineInner, i: u32, dbl: bool) {
    if rs2(i) != 0 {
        return illegal(h, m, i);
    }
    if dbl {
        if !h.rv64 {
            return illegal(h, m, i);
        }
        h.set_x(rd(i), h.fregs[rs1(i)]);
    } else {
        h.set_x(rd(i), h.fregs[rs1(i)] as u32 as i32 as i64 as u64);
    }
    h.advance_pc(4);
}

/// fmv.w.x / fmv.d.x.
fn fp_mv_f(h: &mut HartState, m: &MachineInner, i: u32, dbl: bool) {
    if rs2(i) != 0 || funct3(i) != 0 {
        return illegal(h, m, i);
    }
    if dbl {
        if !h.rv64 {
            return illegal(h, m, i);
        }
        h.fregs[rd(i)] = h.x(rs1(i));
    } else {
        h.fregs[rd(i)] = F32_BOX | (h.x(rs1(i)) & 0xFFFF_FFFF);
    }
    h.csr.set_fs_dirty();
    h.advance_pc(4);
}

fn fp_class(h: &mut HartState, m: &MachineInner, i: u32, dbl: bool) {
    if rs2(i) != 0 {
        return illegal(h, m, i);
    }
    let mask = if dbl {
        let v = h.f64_read(rs1(i));
        classify(v.is_nan(), is_snan64(v), v.is_infinite(), v == 0.0,
                 v.is_normal(), v.is_sign_negative())
    } else {
        let v = h.f32_read(rs1(i));
        classify(v.is_nan(), is_snan32(v), v.is_infinite(), v == 0.0,
                 v.is_normal(), v.is_sign_negative())
    };
    h.set_x(rd(i), mask);
    h.advance_pc(4);
}

fn classify(nan: bool, snan: bool, inf: bool, zero: bool, normal: bool, neg: bool) -> u64 {
    if nan {
        return if snan { 1 << 8 } else { 1 << 9 };
    }
    let bit = if inf {
        if neg { 0 } else { 7 }
    } else if zero {
        if neg { 3 } else { 4 }
    } else if normal {
        if neg { 1 } else { 6 }
    } else {
        // Subnormal.
        if neg { 2 } else { 5 }
    };
    1u64 << bit
}

// Fused multiply-add family. rs3 lives in bits 31:27, fmt in bits 26:25.

fn fused(h: &mut HartState, m: &MachineInner, i: u32, neg_prod: bool, neg_c: bool) {
    if !h.csr.fpu_enabled() {
        return illegal(h, m, i);
    }
    let fmt = (i >> 25) & 3;
    if fmt > 1 {
        return illegal(h, m, i);
    }
    if rm_resolve(h, i).is_none() {
        return illegal(h, m, i);
    }
    let rs3 = (i >> 27) as usize;
    let mut flags = 0;
    if fmt == 1 {
        let (a, b, c) = (h.f64_read(rs1(i)), h.f64_read(rs2(i)), h.f64_read(rs3));
        if is_snan64(a) || is_snan64(b) || is_snan64(c) {
            flags |= FF_NV;
        }
        if (a.is_infinite() && b == 0.0) || (a == 0.0 && b.is_infinite()) {
            flags |= FF_NV;
        }
        let mul1 = if neg_prod { -a } else { a };
        let addend = if neg_c { -c } else { c };
        let v = mul1.mul_add(b, addend);
        if v.is_nan() && !a.is_nan() && !b.is_nan() && !c.is_nan() {
            flags |= FF_NV;
        }
        h.f64_write(rd(i), canon64(v));
    } else {
        let (a, b, c) = (h.f32_read(rs1(i)), h.f32_read(rs2(i)), h.f32_read(rs3));
        if is_snan32(a) || is_snan32(b) || is_snan32(c) {
            flags |= FF_NV;
        }
        if (a.is_infinite() && b == 0.0) || (a == 0.0 && b.is_infinite()) {
            flags |= FF_NV;
        }
        let mul1 = if neg_prod { -a } else { a };
        let addend = if neg_c { -c } else { c };
        let v = mul1.mul_add(b, addend);
        if v.is_nan() && !a.is_nan() && !b.is_nan() && !c.is_nan() {
            flags |= FF_NV;
        }
        h.f32_write(rd(i), canon32(v));
    }
    h.fflags_raise(flags);
    h.advance_pc(4);
}

pub fn fmadd(h: &mut HartState, m: &MachineInner, i: u32) {
    fused(h, m, i, false, false);
}

pub fn fmsub(h: &mut HartState, m: &MachineInner, i: u32) {
    fused(h, m, i, false, true);
}

pub fn fnmsub(h: &mut HartState, m: &MachineInner, i: u32) {
    fused(h, m, i, true, false);
}

pub fn fnmadd(h: &mut HartState, m: &MachineInner, i: u32) {
    fused(h, m, i, true, true);
}
