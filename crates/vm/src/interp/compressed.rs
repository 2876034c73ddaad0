//! C extension: 16-bit compressed instructions.
//!
//! The 32-entry table is indexed by funct3 and the quadrant bits. Encodings
//! whose meaning differs between RV32 and RV64 (c.jal/c.addiw, c.flw/c.ld
//! and friends) get their slot filled per XLEN at table-build time.

use super::{system::illegal, InsnFn};
use crate::hart::HartState;
use crate::machine::MachineInner;

fn c_id(f3: u32, op: u32) -> usize {
    ((f3 << 2) | op) as usize
}

pub fn build_table(rv64: bool) -> [InsnFn; 32] {
    let mut t: [InsnFn; 32] = [illegal; 32];
    // Quadrant 0.
    t[c_id(0, 0)] = c_addi4spn;
    t[c_id(1, 0)] = c_fld;
    t[c_id(2, 0)] = c_lw;
    t[c_id(3, 0)] = if rv64 { c_ld } else { c_flw };
    t[c_id(5, 0)] = c_fsd;
    t[c_id(6, 0)] = c_sw;
    t[c_id(7, 0)] = if rv64 { c_sd } else { c_fsw };
    // Quadrant 1.
    t[c_id(0, 1)] = c_addi;
    t[c_id(1, 1)] = if rv64 { c_addiw } else { c_jal };
    t[c_id(2, 1)] = c_li;
    t[c_id(3, 1)] = c_lui_addi16sp;
    t[c_id(4, 1)] = c_misc_alu;
    t[c_id(5, 1)] = c_j;
    t[c_id(6, 1)] = c_beqz;
    t[c_id(7, 1)] = c_bnez;
    // Quadrant 2.
    t[c_id(0, 2)] = c_slli;
    t[c_id(1, 2)] = c_fldsp;
    t[c_id(2, 2)] = c_lwsp;
    t[c_id(3, 2)] = if rv64 { c_ldsp } else { c_flwsp };
    t[c_id(4, 2)] = c_jr_mv_add;
    t[c_id(5, 2)] = c_fsdsp;
    t[c_id(6, 2)] = c_swsp;
    t[c_id(7, 2)] = if rv64 { c_sdsp } else { c_fswsp };
    t
}

const SP: usize = 2;
const RA: usize = 1;

// Register fields.
#[inline]
fn crd(i: u32) -> usize {
    ((i >> 7) & 0x1F) as usize
}

#[inline]
fn crs2(i: u32) -> usize {
    ((i >> 2) & 0x1F) as usize
}

#[inline]
fn crd_p(i: u32) -> usize {
    (8 + ((i >> 2) & 7)) as usize
}

#[inline]
fn crs1_p(i: u32) -> usize {
    (8 + ((i >> 7) & 7)) as usize
}

// Immediates.
#[inline]
fn imm6(i: u32) -> u64 {
    let v = ((i >> 7) & 0x20) | ((i >> 2) & 0x1F);
    ((v << 26) as i32 >> 26) as i64 as u64
}

#[inline]
fn uimm6(i: u32) -> u32 {
    ((i >> 7) & 0x20) | ((i >> 2) & 0x1F)
}

#[inline]
fn imm_cj(i: u32) -> u64 {
    let v = ((i >> 1) & 0x800)
        | ((i >> 7) & 0x10)
        | ((i >> 1) & 0x300)
        | ((i << 2) & 0x400)
        | ((i >> 1) & 0x40)
        | ((i << 1) & 0x80)
        | ((i >> 2) & 0xE)
        | ((i << 3) & 0x20);
    ((v << 20) as i32 >> 20) as i64 as u64
}

#[inline]
fn imm_cb(i: u32) -> u64 {
    let v = ((i >> 4) & 0x100)
        | ((i >> 7) & 0x18)
        | ((i << 1) & 0xC0)
        | ((i >> 2) & 0x6)
        | ((i << 3) & 0x20);
    ((v << 23) as i32 >> 23) as i64 as u64
}

#[inline]
fn uimm_lw(i: u32) -> u64 {
    (((i >> 7) & 0x38) | ((i >> 4) & 0x4) | ((i << 1) & 0x40)) as u64
}

#[inline]
fn uimm_ld(i: u32) -> u64 {
    (((i >> 7) & 0x38) | ((i << 1) & 0xC0)) as u64
}

#[inline]
fn uimm_lwsp(i: u32) -> u64 {
    (((i >> 7) & 0x20) | ((i >> 2) & 0x1C) | ((i << 4) & 0xC0)) as u64
}

#[inline]
fn uimm_ldsp(i: u32) -> u64 {
    (((i >> 7) & 0x20) | ((i >> 2) & 0x18) | ((i << 4) & 0x1C0)) as u64
}

#[inline]
fn uimm_swsp(i: u32) -> u64 {
    (((i >> 7) & 0x3C) | ((i >> 1) & 0xC0)) as u64
}

#[inline]
fn uimm_sdsp(i: u32) -> u64 {
    (((i >> 7) & 0x38) | ((i >> 1) & 0x1C0)) as u64
}

fn fpu_on(h: &mut HartState, m: &MachineInner, i: u32) -> bool {
    if h.csr.fpu_enabled() {
        true
    } else {
        illegal(h, m, i);
        false
    }
}

// Quadrant 0.

fn c_addi4spn(h: &mut HartState, m: &MachineInner, i: u32) {
    let imm = ((i >> 7) & 0x30) | ((i >> 1) & 0x3C0) | ((i >> 4) & 0x4) | ((i >> 2) & 0x8);
    if imm == 0 {
        // Covers the defined-illegal all-zero instruction.
        return illegal(h, m, i);
    }
    h.set_x(crd_p(i), h.x(SP).wrapping_add(imm as u64));
    h.advance_pc(2);
}

fn c_fld(h: &mut HartState, m: &MachineInner, i: u32) {
    if !fpu_on(h, m, i) {
        return;
    }
    let addr = h.addr(h.x(crs1_p(i)).wrapping_add(uimm_ld(i)));
    let Some(v) = h.load_u64(m, addr) else { return };
    h.fregs[crd_p(i)] = v;
    h.csr.set_fs_dirty();
    h.advance_pc(2);
}

fn c_lw(h: &mut HartState, m: &MachineInner, i: u32) {
    let addr = h.addr(h.x(crs1_p(i)).wrapping_add(uimm_lw(i)));
    let Some(v) = h.load_u32(m, addr) else { return };
    h.set_x(crd_p(i), v as i32 as i64 as u64);
    h.advance_pc(2);
}

fn c_flw(h: &mut HartState, m: &MachineInner, i: u32) {
    if !fpu_on(h, m, i) {
        return;
    }
    let addr = h.addr(h.x(crs1_p(i)).wrapping_add(uimm_lw(i)));
    let Some(v) = h.load_u32(m, addr) else { return };
    h.fregs[crd_p(i)] = 0xFFFF_FFFF_0000_0000 | v as u64;
    h.csr.set_fs_dirty();
    h.advance_pc(2);
}

fn c_ld(h: &mut HartState, m: &MachineInner, i: u32) {
    let addr = h.addr(h.x(crs1_p(i)).wrapping_add(uimm_ld(i)));
    let Some(v) = h.load_u64(m, addr) else { return };
    h.set_x(crd_p(i), v);
    h.advance_pc(2);
}

fn c_fsd(h: &mut HartState, m: &MachineInner, i: u32) {
    if !fpu_on(h, m, i) {
        return;
    }
    let addr = h.addr(h.x(crs1_p(i)).wrapping_add(uimm_ld(i)));
    if h.store_u64(m, addr, h.fregs[crd_p(i)]) {
        h.advance_pc(2);
    }
}

fn c_sw(h: &mut HartState, m: &MachineInner, i: u32) {
    let addr = h.addr(h.x(crs1_p(i)).wrapping_add(uimm_lw(i)));
    if h.store_u32(m, addr, h.x(crd_p(i)) as u32) {
        h.advance_pc(2);
    }
}

fn c_fsw(h: &mut HartState, m: &MachineInner, i: u32) {
    if !fpu_on(h, m, i) {
        return;
    }
    let addr = h.addr(h.x(crs1_p(i)).wrapping_add(uimm_lw(i)));
    if h.store_u32(m, addr, h.fregs[crd_p(i)] as u32) {
        h.advance_pc(2);
    }
}

fn c_sd(h: &mut HartState, m: &MachineInner, i: u32) {
    let addr = h.addr(h.x(crs1_p(i)).wrapping_add(uimm_ld(i)));
    if h.store_u64(m, addr, h.x(crd_p(i))) {
        h.advance_pc(2);
    }
}

// Quadrant 1.

fn c_addi(h: &mut HartState, _m: &MachineInner, i: u32) {
    let r = crd(i);
    h.set_x(r, h.x(r).wrapping_add(imm6(i)));
    h.advance_pc(2);
}

fn c_jal(h: &mut HartState, _m: &MachineInner, i: u32) {
    let link = h.pc.wrapping_add(2);
    h.set_pc(h.pc.wrapping_add(imm_cj(i)));
    h.set_x(RA, link);
}

fn c_addiw(h: &mut HartState, m: &MachineInner, i: u32) {
    let r = crd(i);
    if r == 0 {
        return illegal(h, m, i);
    }
    let v = (h.x(r) as u32).wrapping_add(imm6(i) as u32);
    h.set_x(r, v as i32 as i64 as u64);
    h.advance_pc(2);
}

fn c_li(h: &mut HartState, _m: &MachineInner, i: u32) {
    h.set_x(crd(i), imm6(i));
    h.advance_pc(2);
}

fn c_lui_addi16sp(h: &mut HartState, m: &MachineInner, i: u32) {
    let r = crd(i);
    if r == SP {
        let v = ((i >> 3) & 0x200)
            | ((i >> 2) & 0x10)
            | ((i << 1) & 0x40)
            | ((i << 4) & 0x180)
            | ((i << 3) & 0x20);
        let imm = ((v << 22) as i32 >> 22) as i64 as u64;
        if imm == 0 {
            return illegal(h, m, i);
        }
        h.set_x(SP, h.x(SP).wrapping_add(imm));
    } else {
        let imm = imm6(i) << 12;
        if imm == 0 {
            return illegal(h, m, i);
        }
        if r != 0 {
            h.set_x(r, imm);
        }
    }
    h.advance_pc(2);
}

fn c_misc_alu(h: &mut HartState, m: &MachineInner, i: u32) {
    let r = crs1_p(i);
    match (i >> 10) & 3 {
        0 | 1 => {
            // c.srli / c.srai
            let shamt = uimm6(i);
            if !h.rv64 && shamt >= 32 {
                return illegal(h, m, i);
            }
            let v = if (i >> 10) & 3 == 0 {
                if h.rv64 {
                    h.x(r) >> shamt
                } else {
                    (h.x(r) as u32 >> shamt) as u64
                }
            } else {
                ((h.x(r) as i64) >> shamt) as u64
            };
            h.set_x(r, v);
        }
        2 => h.set_x(r, h.x(r) & imm6(i)),
        _ => {
            let b = h.x(crd_p(i));
            let a = h.x(r);
            if i & (1 << 12) == 0 {
                let v = match (i >> 5) & 3 {
                    0 => a.wrapping_sub(b),
                    1 => a ^ b,
                    2 => a | b,
                    _ => a & b,
                };
                h.set_x(r, v);
            } else {
                if !h.rv64 {
                    return illegal(h, m, i);
                }
                let v = match (i >> 5) & 3 {
                    0 => (a as u32).wrapping_sub(b as u32),
                    1 => (a as u32).wrapping_add(b as u32),
                    _ => return illegal(h, m, i),
                };
                h.set_x(r, v as i32 as i64 as u64);
            }
        }
    }
    h.advance_pc(2);
}

fn c_j(h: &mut HartState, _m: &MachineInner, i: u32) {
    h.set_pc(h.pc.wrapping_add(imm_cj(i)));
}

fn c_beqz(h: &mut HartState, _m: &MachineInner, i: u32) {
    if h.x(crs1_p(i)) == 0 {
        h.set_pc(h.pc.wrapping_add(imm_cb(i)));
    } else {
        h.advance_pc(2);
    }
}

fn c_bnez(h: &mut HartState, _m: &MachineInner, i: u32) {
    if h.x(crs1_p(i)) != 0 {
        h.set_pc(h.pc.wrapping_add(imm_cb(i)));
    } else {
        h.advance_pc(2);
    }
}

// Quadrant 2.

fn c_slli(h: &mut HartState, m: &MachineInner, i: u32) {
    let r = crd(i);
    let shamt = uimm6(i);
    if !h.rv64 && shamt >= 32 {
        return illegal(h, m, i);
    }
    if r != 0 {
        h.set_x(r, h.x(r) << shamt);
    }
    h.advance_pc(2);
}

fn c_fldsp(h: &mut HartState, m: &MachineInner, i: u32) {
    if !fpu_on(h, m, i) {
        return;
    }
    let addr = h.addr(h.x(SP).wrapping_add(uimm_ldsp(i)));
    let Some(v) = h.load_u64(m, addr) else { return };
    h.fregs[crd(i)] = v;
    h.csr.set_fs_dirty();
    h.advance_pc(2);
}

fn c_lwsp(h: &mut HartState, m: &MachineInner, i: u32) {
    let r = crd(i);
    if r == 0 {
        return illegal(h, m, i);
    }
    let addr = h.addr(h.x(SP).wrapping_add(uimm_lwsp(i)));
    let Some(v) = h.load_u32(m, addr) else { return };
    h.set_x(r, v as i32 as i64 as u64);
    h.advance_pc(2);
}

fn c_flwsp(h: &mut HartState, m: &MachineInner, i: u32) {
    if !fpu_on(h, m, i) {
        return;
    }
    let addr = h.addr(h.x(SP).wrapping_add(uimm_lwsp(i)));
    let Some(v) = h.load_u32(m, addr) else { return };
    h.fregs[crd(i)] = 0xFFFF_FFFF_0000_0000 | v as u64;
    h.csr.set_fs_dirty();
    h.advance_pc(2);
}

fn c_ldsp(h: &mut HartState, m: &MachineInner, i: u32) {
    let r = crd(i);
    if r == 0 {
        return illegal(h, m, i);
    }
    let addr = h.addr(h.x(SP).wrapping_add(uimm_ldsp(i)));
    let Some(v) = h.load_u64(m, addr) else { return };
    h.set_x(r, v);
    h.advance_pc(2);
}

fn c_jr_mv_add(h: &mut HartState, m: &MachineInner, i: u32) {
    let r = crd(i);
    let r2 = crs2(i);
    if i & (1 << 12) == 0 {
        if r2 == 0 {
            // c.jr
            if r == 0 {
                return illegal(h, m, i);
            }
            h.set_pc(h.x(r) & !1);
        } else {
            // c.mv
            h.set_x(r, h.x(r2));
            h.advance_pc(2);
        }
    } else if r2 == 0 {
        if r == 0 {
            // c.ebreak
            h.trap(crate::trap::EXC_BREAKPOINT, h.pc);
        } else {
            // c.jalr
            let link = h.pc.wrapping_add(2);
            h.set_pc(h.x(r) & !1);
            h.set_x(RA, link);
        }
    } else {
        // c.add
        h.set_x(r, h.x(r).wrapping_add(h.x(r2)));
        h.advance_pc(2);
    }
}

fn c_fsdsp(h: &mut HartState, m: &MachineInner, i: u32) {
    if !fpu_on(h, m, i) {
        return;
    }
    let addr = h.addr(h.x(SP).wrapping_add(uimm_sdsp(i)));
    if h.store_u64(m, addr, h.fregs[crs2(i)]) {
        h.advance_pc(2);
    }
}

fn c_swsp(h: &mut HartState, m: &MachineInner, i: u32) {
    let addr = h.addr(h.x(SP).wrapping_add(uimm_swsp(i)));
    if h.store_u32(m, addr, h.x(crs2(i)) as u32) {
        h.advance_pc(2);
    }
}

fn c_fswsp(h: &mut HartState, m: &MachineInner, i: u32) {
    if !fpu_on(h, m, i) {
        return;
    }
    let addr = h.addr(h.x(SP).wrapping_add(uimm_swsp(i)));
    if h.store_u32(m, addr, h.fregs[crs2(i)] as u32) {
        h.advance_pc(2);
    }
}

fn c_sdsp(h: &mut HartState, m: &MachineInner, i: u32) {
    let addr = h.addr(h.x(SP).wrapping_add(uimm_sdsp(i)));
    if h.store_u64(m, addr, h.x(crs2(i))) {
        h.advance_pc(2);
    }
}
