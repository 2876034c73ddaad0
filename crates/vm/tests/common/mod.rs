//! Shared harness for driving a machine's harts synchronously on the test
//! thread: build a machine, poke architectural state directly, and run the
//! dispatch loop until a trap unwinds it.
#![allow(dead_code)] // each test binary uses a different helper subset

use std::sync::atomic::Ordering;

use rvbox::hart::WAIT_RUNNING;
use rvbox::machine::Machine;

pub const MEM_BASE: u64 = 0x8000_0000;
pub const MEM_SIZE: u64 = 0x0040_0000;

pub fn machine(rv64: bool, harts: u32) -> Machine {
    let _ = env_logger::builder().is_test(true).try_init();
    Machine::new(MEM_BASE, MEM_SIZE, harts, rv64).expect("machine creation failed")
}

/// Write a program as little-endian 32-bit words at a physical address.
pub fn write_code(m: &Machine, paddr: u64, words: &[u32]) {
    for (i, w) in words.iter().enumerate() {
        assert!(m.write_ram(paddr + i as u64 * 4, &w.to_le_bytes()));
    }
}

/// Drive hart 0's dispatch loop, re-entering after non-trap unwinds
/// (fence.i, satp writes), until a trap is raised. Panics if the guest
/// never traps.
pub fn run_until_trap(m: &Machine) {
    let inner = m.inner().clone();
    let hart = &inner.harts[0];
    let mut st = hart.state.lock().unwrap();
    for _ in 0..10_000 {
        st.shared.wait_event.store(WAIT_RUNNING, Ordering::Release);
        st.dispatch_loop(&inner);
        if st.trap_pending {
            return;
        }
    }
    panic!("guest did not trap");
}

// Tiny assembler helpers for hand-built guests.

pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    ((imm as u32) << 20) | (rs1 << 15) | (rd << 7) | 0x13
}

pub fn lui(rd: u32, imm20: u32) -> u32 {
    (imm20 << 12) | (rd << 7) | 0x37
}

pub fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 5) << 25) | (rs2 << 20) | (rs1 << 15) | (2 << 12) | ((imm & 0x1F) << 7) | 0x23
}

pub fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
    ((imm as u32) << 20) | (rs1 << 15) | (2 << 12) | (rd << 7) | 0x03
}

pub fn jal(rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
        | (rd << 7)
        | 0x6F
}

pub fn csrrs(rd: u32, csr: u32, rs1: u32) -> u32 {
    (csr << 20) | (rs1 << 15) | (2 << 12) | (rd << 7) | 0x73
}

pub fn csrrw(rd: u32, csr: u32, rs1: u32) -> u32 {
    (csr << 20) | (rs1 << 15) | (1 << 12) | (rd << 7) | 0x73
}

pub const ECALL: u32 = 0x0000_0073;
pub const WFI: u32 = 0x1050_0073;
pub const FENCE_I: u32 = 0x0000_100F;
pub const J_SELF: u32 = 0x0000_006F;
