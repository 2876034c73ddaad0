//! Base integer instruction set (I) and the M extension.
//!
//! Handlers advance PC themselves and abandon the instruction without
//! advancing when a memory access traps. On RV32 all register writes go
//! through `set_x`, which keeps values as the sign extension of their low
//! 32 bits; unsigned comparisons remain correct under that representation.

use super::{funct7, imm_b, imm_i, imm_j, imm_s, imm_u, rd, rs1, rs2, system::illegal};
use crate::hart::HartState;
use crate::machine::MachineInner;

pub fn lui(h: &mut HartState, _m: &MachineInner, i: u32) {
    h.set_x(rd(i), imm_u(i));
    h.advance_pc(4);
}

pub fn auipc(h: &mut HartState, _m: &MachineInner, i: u32) {
    h.set_x(rd(i), h.pc.wrapping_add(imm_u(i)));
    h.advance_pc(4);
}

pub fn jal(h: &mut HartState, _m: &MachineInner, i: u32) {
    let link = h.pc.wrapping_add(4);
    h.set_pc(h.pc.wrapping_add(imm_j(i)));
    h.set_x(rd(i), link);
}

pub fn jalr(h: &mut HartState, _m: &MachineInner, i: u32) {
    let link = h.pc.wrapping_add(4);
    let target = h.x(rs1(i)).wrapping_add(imm_i(i)) & !1;
    h.set_pc(target);
    h.set_x(rd(i), link);
}

macro_rules! branch {
    ($name:ident, $a:ty, $cond:expr) => {
        pub fn $name(h: &mut HartState, _m: &MachineInner, i: u32) {
            let a = h.x(rs1(i)) as $a;
            let b = h.x(rs2(i)) as $a;
            let cond: fn($a, $a) -> bool = $cond;
            if cond(a, b) {
                h.set_pc(h.pc.wrapping_add(imm_b(i)));
            } else {
                h.advance_pc(4);
            }
        }
    };
}

branch!(beq, u64, |a, b| a == b);
branch!(bne, u64, |a, b| a != b);
branch!(blt, i64, |a, b| a < b);
branch!(bge, i64, |a, b| a >= b);
branch!(bltu, u64, |a, b| a < b);
branch!(bgeu, u64, |a, b| a >= b);

macro_rules! load {
    ($name:ident, $load:ident, $conv:expr) => {
        pub fn $name(h: &mut HartState, m: &MachineInner, i: u32) {
            let addr = h.addr(h.x(rs1(i)).wrapping_add(imm_i(i)));
            let Some(v) = h.$load(m, addr) else { return };
            h.set_x(rd(i), ($conv)(v));
            h.advance_pc(4);
        }
    };
}

load!(lb, load_u8, |v: u8| v as i8 as i64 as u64);
load!(lh, load_u16, |v: u16| v as i16 as i64 as u64);
load!(lw, load_u32, |v: u32| v as i32 as i64 as u64);
load!(lbu, load_u8, |v: u8| v as u64);
load!(lhu, load_u16, |v: u16| v as u64);
load!(lwu, load_u32, |v: u32| v as u64);
load!(ld, load_u64, |v: u64| v);

macro_rules! store {
    ($name:ident, $store:ident, $ty:ty) => {
        pub fn $name(h: &mut HartState, m: &MachineInner, i: u32) {
            let addr = h.addr(h.x(rs1(i)).wrapping_add(imm_s(i)));
            let v = h.x(rs2(i)) as $ty;
            if !h.$store(m, addr, v) {
                return;
            }
            h.advance_pc(4);
        }
    };
}

store!(sb, store_u8, u8);
store!(sh, store_u16, u16);
store!(sw, store_u32, u32);
store!(sd, store_u64, u64);

pub fn addi(h: &mut HartState, _m: &MachineInner, i: u32) {
    h.set_x(rd(i), h.x(rs1(i)).wrapping_add(imm_i(i)));
    h.advance_pc(4);
}

pub fn slti(h: &mut HartState, _m: &MachineInner, i: u32) {
    h.set_x(rd(i), ((h.x(rs1(i)) as i64) < (imm_i(i) as i64)) as u64);
    h.advance_pc(4);
}

pub fn sltiu(h: &mut HartState, _m: &MachineInner, i: u32) {
    h.set_x(rd(i), (h.x(rs1(i)) < imm_i(i)) as u64);
    h.advance_pc(4);
}

pub fn xori(h: &mut HartState, _m: &MachineInner, i: u32) {
    h.set_x(rd(i), h.x(rs1(i)) ^ imm_i(i));
    h.advance_pc(4);
}

pub fn ori(h: &mut HartState, _m: &MachineInner, i: u32) {
    h.set_x(rd(i), h.x(rs1(i)) | imm_i(i));
    h.advance_pc(4);
}

pub fn andi(h: &mut HartState, _m: &MachineInner, i: u32) {
    h.set_x(rd(i), h.x(rs1(i)) & imm_i(i));
    h.advance_pc(4);
}

/// Immediate shift amount with encoding legality: every funct bit other
/// than the slot's bit 30 must be zero (bit 25 joins the shamt on RV64).
fn shamt_imm(h: &HartState, i: u32) -> Option<u32> {
    if h.rv64 {
        if (i >> 26) & 0x2F != 0 {
            return None;
        }
        Some((i >> 20) & 0x3F)
    } else {
        if (i >> 25) & 0x5F != 0 {
            return None;
        }
        Some((i >> 20) & 0x1F)
    }
}

pub fn slli(h: &mut HartState, m: &MachineInner, i: u32) {
    if i & (1 << 30) != 0 {
        // Both bit-30 slots route here; only the clear form is SLLI.
        return illegal(h, m, i);
    }
    match shamt_imm(h, i) {
        Some(s) => {
            h.set_x(rd(i), h.x(rs1(i)) << s);
            h.advance_pc(4);
        }
        None => illegal(h, m, i),
    }
}

pub fn srli(h: &mut HartState, m: &MachineInner, i: u32) {
    match shamt_imm(h, i) {
        Some(s) => {
            let v = if h.rv64 {
                h.x(rs1(i)) >> s
            } else {
                (h.x(rs1(i)) as u32 >> s) as u64
            };
            h.set_x(rd(i), v);
            h.advance_pc(4);
        }
        None => illegal(h, m, i),
    }
}

pub fn srai(h: &mut HartState, m: &MachineInner, i: u32) {
    match shamt_imm(h, i) {
        Some(s) => {
            // Register values are sign-extended on RV32, so a 64-bit
            // arithmetic shift is correct for both XLENs.
            h.set_x(rd(i), ((h.x(rs1(i)) as i64) >> s) as u64);
            h.advance_pc(4);
        }
        None => illegal(h, m, i),
    }
}

#[inline]
fn shamt_mask(h: &HartState) -> u32 {
    if h.rv64 {
        63
    } else {
        31
    }
}

// R-type arithmetic. funct7 = 1 selects the M extension in the same slot.

pub fn op_add_mul(h: &mut HartState, m: &MachineInner, i: u32) {
    let (a, b) = (h.x(rs1(i)), h.x(rs2(i)));
    let v = match funct7(i) {
        0 => a.wrapping_add(b),
        1 => a.wrapping_mul(b),
        _ => return illegal(h, m, i),
    };
    h.set_x(rd(i), v);
    h.advance_pc(4);
}

pub fn op_sub(h: &mut HartState, m: &MachineInner, i: u32) {
    if funct7(i) != 0x20 {
        return illegal(h, m, i);
    }
    h.set_x(rd(i), h.x(rs1(i)).wrapping_sub(h.x(rs2(i))));
    h.advance_pc(4);
}

pub fn op_sll_mulh(h: &mut HartState, m: &MachineInner, i: u32) {
    let (a, b) = (h.x(rs1(i)), h.x(rs2(i)));
    let v = match funct7(i) {
        0 => a << (b as u32 & shamt_mask(h)),
        1 => {
            if h.rv64 {
                (((a as i64 as i128) * (b as i64 as i128)) >> 64) as u64
            } else {
                (((a as i32 as i64) * (b as i32 as i64)) >> 32) as u64
            }
        }
        _ => return illegal(h, m, i),
    };
    h.set_x(rd(i), v);
    h.advance_pc(4);
}

pub fn op_slt_mulhsu(h: &mut HartState, m: &MachineInner, i: u32) {
    let (a, b) = (h.x(rs1(i)), h.x(rs2(i)));
    let v = match funct7(i) {
        0 => ((a as i64) < (b as i64)) as u64,
        1 => {
            if h.rv64 {
                (((a as i64 as i128) * (b as u128 as i128)) >> 64) as u64
            } else {
                (((a as i32 as i64) * (b as u32 as i64)) >> 32) as u64
            }
        }
        _ => return illegal(h, m, i),
    };
    h.set_x(rd(i), v);
    h.advance_pc(4);
}

pub fn op_sltu_mulhu(h: &mut HartState, m: &MachineInner, i: u32) {
    let (a, b) = (h.x(rs1(i)), h.x(rs2(i)));
    let v = match funct7(i) {
        0 => (a < b) as u64,
        1 => {
            if h.rv64 {
                ((a as u128 * b as u128) >> 64) as u64
            } else {
                ((a as u32 as u64 * b as u32 as u64) >> 32) as u64
            }
        }
        _ => return illegal(h, m, i),
    };
    h.set_x(rd(i), v);
    h.advance_pc(4);
}

fn div_signed(h: &HartState, a: u64, b: u64) -> u64 {
    if h.rv64 {
        let (a, b) = (a as i64, b as i64);
        if b == 0 {
            u64::MAX
        } else if a == i64::MIN && b == -1 {
            a as u64
        } else {
            (a / b) as u64
        }
    } else {
        let (a, b) = (a as i32, b as i32);
        if b == 0 {
            u64::MAX
        } else if a == i32::MIN && b == -1 {
            a as i64 as u64
        } else {
            (a / b) as i64 as u64
        }
    }
}

fn div_unsigned(h: &HartState, a: u64, b: u64) -> u64 {
    if h.rv64 {
        if b == 0 {
            u64::MAX
        } else {
            a / b
        }
    } else {
        let (a, b) = (a as u32, b as u32);
        if b == 0 {
            u64::MAX
        } else {
            (a / b) as u64
        }
    }
}

fn rem_signed(h: &HartState, a: u64, b: u64) -> u64 {
    if h.rv64 {
        let (a, b) = (a as i64, b as i64);
        if b == 0 {
            a as u64
        } else if a == i64::MIN && b == -1 {
            0
        } else {
            (a % b) as u64
        }
    } else {
        let (a, b) = (a as i32, b as i32);
        if b == 0 {
            a as i64 as u64
        } else if a == i32::MIN && b == -1 {
            0
        } else {
            (a % b) as i64 as u64
        }
    }
}

fn rem_unsigned(h: &HartState, a: u64, b: u64) -> u64 {
    if h.rv64 {
        if b == 0 {
            a
        } else {
            a % b
        }
    } else {
        let (a, b) = (a as u32, b as u32);
        if b == 0 {
            a as u64
        } else {
            (a % b) as u64
        }
    }
}

pub fn op_xor_div(h: &mut HartState, m: &MachineInner, i: u32) {
    let (a, b) = (h.x(rs1(i)), h.x(rs2(i)));
    let v = match funct7(i) {
        0 => a ^ b,
        1 => div_signed(h, a, b),
        _ => return illegal(h, m, i),
    };
    h.set_x(rd(i), v);
    h.advance_pc(4);
}

pub fn op_srl_divu(h: &mut HartState, m: &MachineInner, i: u32) {
    let (a, b) = (h.x(rs1(i)), h.x(rs2(i)));
    let v = match funct7(i) {
        0 => {
            if h.rv64 {
                a >> (b as u32 & 63)
            } else {
                (a as u32 >> (b as u32 & 31)) as u64
            }
        }
        1 => div_unsigned(h, a, b),
        _ => return illegal(h, m, i),
    };
    h.set_x(rd(i), v);
    h.advance_pc(4);
}

pub fn op_sra(h: &mut HartState, m: &MachineInner, i: u32) {
    if funct7(i) != 0x20 {
        return illegal(h, m, i);
    }
    let s = h.x(rs2(i)) as u32 & shamt_mask(h);
    h.set_x(rd(i), ((h.x(rs1(i)) as i64) >> s) as u64);
    h.advance_pc(4);
}

pub fn op_or_rem(h: &mut HartState, m: &MachineInner, i: u32) {
    let (a, b) = (h.x(rs1(i)), h.x(rs2(i)));
    let v = match funct7(i) {
        0 => a | b,
        1 => rem_signed(h, a, b),
        _ => return illegal(h, m, i),
    };
    h.set_x(rd(i), v);
    h.advance_pc(4);
}

pub fn op_and_remu(h: &mut HartState, m: &MachineInner, i: u32) {
    let (a, b) = (h.x(rs1(i)), h.x(rs2(i)));
    let v = match funct7(i) {
        0 => a & b,
        1 => rem_unsigned(h, a, b),
        _ => return illegal(h, m, i),
    };
    h.set_x(rd(i), v);
    h.advance_pc(4);
}

// RV64 W-suffixed forms: 32-bit operation, sign-extended result.

pub fn addiw(h: &mut HartState, _m: &MachineInner, i: u32) {
    let v = (h.x(rs1(i)) as u32).wrapping_add(imm_i(i) as u32);
    h.set_x(rd(i), v as i32 as i64 as u64);
    h.advance_pc(4);
}

fn shamt_w(i: u32) -> Option<u32> {
    // 5-bit shamt; every funct bit other than the slot's bit 30 is zero.
    if funct7(i) & 0x5F != 0 {
        return None;
    }
    Some((i >> 20) & 0x1F)
}

pub fn slliw(h: &mut HartState, m: &MachineInner, i: u32) {
    if i & (1 << 30) != 0 {
        return illegal(h, m, i);
    }
    match shamt_w(i) {
        Some(s) => {
            h.set_x(rd(i), ((h.x(rs1(i)) as u32) << s) as i32 as i64 as u64);
            h.advance_pc(4);
        }
        None => illegal(h, m, i),
    }
}

pub fn srliw(h: &mut HartState, m: &MachineInner, i: u32) {
    match shamt_w(i) {
        Some(s) => {
            h.set_x(rd(i), ((h.x(rs1(i)) as u32) >> s) as i32 as i64 as u64);
            h.advance_pc(4);
        }
        None => illegal(h, m, i),
    }
}

pub fn sraiw(h: &mut HartState, m: &MachineInner, i: u32) {
    match shamt_w(i) {
        Some(s) => {
            h.set_x(rd(i), ((h.x(rs1(i)) as i32) >> s) as i64 as u64);
            h.advance_pc(4);
        }
        None => illegal(h, m, i),
    }
}

pub fn op_addw_mulw(h: &mut HartState, m: &MachineInner, i: u32) {
    let (a, b) = (h.x(rs1(i)) as u32, h.x(rs2(i)) as u32);
    let v = match funct7(i) {
        0 => a.wrapping_add(b),
        1 => a.wrapping_mul(b),
        _ => return illegal(h, m, i),
    };
    h.set_x(rd(i), v as i32 as i64 as u64);
    h.advance_pc(4);
}

pub fn op_subw(h: &mut HartState, m: &MachineInner, i: u32) {
    if funct7(i) != 0x20 {
        return illegal(h, m, i);
    }
    let v = (h.x(rs1(i)) as u32).wrapping_sub(h.x(rs2(i)) as u32);
    h.set_x(rd(i), v as i32 as i64 as u64);
    h.advance_pc(4);
}

pub fn op_sllw(h: &mut HartState, m: &MachineInner, i: u32) {
    if funct7(i) != 0 {
        return illegal(h, m, i);
    }
    let v = (h.x(rs1(i)) as u32) << (h.x(rs2(i)) as u32 & 31);
    h.set_x(rd(i), v as i32 as i64 as u64);
    h.advance_pc(4);
}

pub fn op_divw(h: &mut HartState, m: &MachineInner, i: u32) {
    if funct7(i) != 1 {
        return illegal(h, m, i);
    }
    let (a, b) = (h.x(rs1(i)) as i32, h.x(rs2(i)) as i32);
    let v = if b == 0 {
        -1i32
    } else if a == i32::MIN && b == -1 {
        a
    } else {
        a / b
    };
    h.set_x(rd(i), v as i64 as u64);
    h.advance_pc(4);
}

pub fn op_srlw_divuw(h: &mut HartState, m: &MachineInner, i: u32) {
    let (a, b) = (h.x(rs1(i)) as u32, h.x(rs2(i)) as u32);
    let v = match funct7(i) {
        0 => a >> (b & 31),
        1 => {
            if b == 0 {
                u32::MAX
            } else {
                a / b
            }
        }
        _ => return illegal(h, m, i),
    };
    h.set_x(rd(i), v as i32 as i64 as u64);
    h.advance_pc(4);
}

pub fn op_sraw(h: &mut HartState, m: &MachineInner, i: u32) {
    if funct7(i) != 0x20 {
        return illegal(h, m, i);
    }
    let v = (h.x(rs1(i)) as i32) >> (h.x(rs2(i)) as u32 & 31);
    h.set_x(rd(i), v as i64 as u64);
    h.advance_pc(4);
}

pub fn op_remw(h: &mut HartState, m: &MachineInner, i: u32) {
    if funct7(i) != 1 {
        return illegal(h, m, i);
    }
    let (a, b) = (h.x(rs1(i)) as i32, h.x(rs2(i)) as i32);
    let v = if b == 0 {
        a
    } else if a == i32::MIN && b == -1 {
        0
    } else {
        a % b
    };
    h.set_x(rd(i), v as i64 as u64);
    h.advance_pc(4);
}

pub fn op_remuw(h: &mut HartState, m: &MachineInner, i: u32) {
    if funct7(i) != 1 {
        return illegal(h, m, i);
    }
    let (a, b) = (h.x(rs1(i)) as u32, h.x(rs2(i)) as u32);
    let v = if b == 0 { a } else { a % b };
    h.set_x(rd(i), v as i32 as i64 as u64);
    h.advance_pc(4);
}

/// `fence`: the guest's device/memory ordering maps to a full host fence.
pub fn fence(h: &mut HartState, _m: &MachineInner, _i: u32) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    h.advance_pc(4);
}

/// `fence.i`: instruction-fetch coherence. Dropping every cached
/// translation also drops the dispatch loop's code page pointer.
pub fn fence_i(h: &mut HartState, _m: &MachineInner, _i: u32) {
    h.advance_pc(4);
    h.tlb_flush_full();
}
