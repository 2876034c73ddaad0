//! A extension: LR/SC and AMOs.
//!
//! AMOs run as host atomic operations directly on guest RAM, which gives
//! real cross-hart atomicity. SC is a compare-exchange against the value LR
//! observed, so it fails both on a lost reservation and on an intervening
//! store. AMOs aimed at MMIO raise a store access fault.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use super::{rd, rs1, rs2, system::illegal};
use crate::hart::HartState;
use crate::machine::MachineInner;
use crate::trap::{EXC_LOAD_MISALIGN, EXC_STORE_MISALIGN};

// funct5 values.
const AMO_LR: u32 = 0x02;
const AMO_SC: u32 = 0x03;
const AMO_SWAP: u32 = 0x01;
const AMO_ADD: u32 = 0x00;
const AMO_XOR: u32 = 0x04;
const AMO_AND: u32 = 0x0C;
const AMO_OR: u32 = 0x08;
const AMO_MIN: u32 = 0x10;
const AMO_MAX: u32 = 0x14;
const AMO_MINU: u32 = 0x18;
const AMO_MAXU: u32 = 0x1C;

pub fn amo_w(h: &mut HartState, m: &MachineInner, i: u32) {
    amo(h, m, i, 4)
}

pub fn amo_d(h: &mut HartState, m: &MachineInner, i: u32) {
    amo(h, m, i, 8)
}

fn amo(h: &mut HartState, m: &MachineInner, i: u32, size: u64) {
    let funct5 = i >> 27;
    let addr = h.addr(h.x(rs1(i)));
    if addr & (size - 1) != 0 {
        let cause = if funct5 == AMO_LR {
            EXC_LOAD_MISALIGN
        } else {
            EXC_STORE_MISALIGN
        };
        h.trap(cause, addr);
        return;
    }
    match funct5 {
        AMO_LR => lr(h, m, i, addr, size),
        AMO_SC => sc(h, m, i, addr, size),
        AMO_SWAP | AMO_ADD | AMO_XOR | AMO_AND | AMO_OR | AMO_MIN | AMO_MAX | AMO_MINU
        | AMO_MAXU => amo_op(h, m, i, addr, size, funct5),
        _ => illegal(h, m, i),
    }
}

fn lr(h: &mut HartState, m: &MachineInner, i: u32, addr: u64, size: u64) {
    let val = if size == 8 {
        let Some(v) = h.load_u64(m, addr) else { return };
        v
    } else {
        let Some(v) = h.load_u32(m, addr) else { return };
        v as i32 as i64 as u64
    };
    h.reservation = Some((addr, val));
    h.set_x(rd(i), val);
    h.advance_pc(4);
}

fn sc(h: &mut HartState, m: &MachineInner, i: u32, addr: u64, size: u64) {
    let reservation = h.reservation.take();
    let matched = matches!(reservation, Some((a, _)) if a == addr);
    if !matched {
        h.set_x(rd(i), 1);
        h.advance_pc(4);
        return;
    }
    let (_, old) = reservation.unwrap();
    let Some(p) = h.amo_host_ptr(m, addr, size) else {
        return;
    };
    let newv = h.x(rs2(i));
    let success = if size == 8 {
        // SAFETY: amo_host_ptr returned an aligned, writable RAM pointer.
        let a = unsafe { &*(p as *const AtomicU64) };
        a.compare_exchange(old, newv, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    } else {
        // SAFETY: as above.
        let a = unsafe { &*(p as *const AtomicU32) };
        a.compare_exchange(old as u32, newv as u32, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    };
    h.set_x(rd(i), !success as u64);
    h.advance_pc(4);
}

fn amo_op(h: &mut HartState, m: &MachineInner, i: u32, addr: u64, size: u64, funct5: u32) {
    let Some(p) = h.amo_host_ptr(m, addr, size) else {
        return;
    };
    let src = h.x(rs2(i));
    let old = if size == 8 {
        // SAFETY: amo_host_ptr returned an aligned, writable RAM pointer;
        // signed views alias the same cell.
        unsafe {
            let u = &*(p as *const AtomicU64);
            let s = &*(p as *const AtomicI64);
            match funct5 {
                AMO_SWAP => u.swap(src, Ordering::SeqCst),
                AMO_ADD => u.fetch_add(src, Ordering::SeqCst),
                AMO_XOR => u.fetch_xor(src, Ordering::SeqCst),
                AMO_AND => u.fetch_and(src, Ordering::SeqCst),
                AMO_OR => u.fetch_or(src, Ordering::SeqCst),
                AMO_MIN => s.fetch_min(src as i64, Ordering::SeqCst) as u64,
                AMO_MAX => s.fetch_max(src as i64, Ordering::SeqCst) as u64,
                AMO_MINU => u.fetch_min(src, Ordering::SeqCst),
                _ => u.fetch_max(src, Ordering::SeqCst),
            }
        }
    } else {
        let src = src as u32;
        // SAFETY: as above.
        let old32 = unsafe {
            let u = &*(p as *const AtomicU32);
            let s = &*(p as *const AtomicI32);
            match funct5 {
                AMO_SWAP => u.swap(src, Ordering::SeqCst),
                AMO_ADD => u.fetch_add(src, Ordering::SeqCst),
                AMO_XOR => u.fetch_xor(src, Ordering::SeqCst),
                AMO_AND => u.fetch_and(src, Ordering::SeqCst),
                AMO_OR => u.fetch_or(src, Ordering::SeqCst),
                AMO_MIN => s.fetch_min(src as i32, Ordering::SeqCst) as u32,
                AMO_MAX => s.fetch_max(src as i32, Ordering::SeqCst) as u32,
                AMO_MINU => u.fetch_min(src, Ordering::SeqCst),
                _ => u.fetch_max(src, Ordering::SeqCst),
            }
        };
        old32 as i32 as i64 as u64
    };
    h.set_x(rd(i), old);
    h.advance_pc(4);
}
