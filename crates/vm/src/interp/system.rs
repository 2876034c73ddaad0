//! SYSTEM opcode: Zicsr, environment calls, privileged returns, WFI,
//! sfence.vma.

use std::sync::atomic::Ordering;

use super::{rd, rs1, rs2};
use crate::csr::{CsrOp, PrivMode, MSTATUS_TVM, MSTATUS_TW};
use crate::hart::{HartState, WAIT_STOPPED};
use crate::machine::MachineInner;
use crate::trap::{EXC_BREAKPOINT, EXC_ECALL_U, EXC_ILLEGAL_INSN};

/// Shared fallback for unpopulated table slots and malformed encodings.
pub fn illegal(h: &mut HartState, _m: &MachineInner, i: u32) {
    h.trap(EXC_ILLEGAL_INSN, i as u64);
}

fn csr_reg(h: &mut HartState, m: &MachineInner, i: u32, op: CsrOp) {
    let write = op == CsrOp::Swap || rs1(i) != 0;
    let mut val = h.x(rs1(i));
    if h.csr_op(m, i >> 20, &mut val, op, write) {
        h.set_x(rd(i), val);
        h.advance_pc(4);
    } else {
        illegal(h, m, i);
    }
}

fn csr_imm(h: &mut HartState, m: &MachineInner, i: u32, op: CsrOp) {
    let uimm = rs1(i) as u64;
    let write = op == CsrOp::Swap || uimm != 0;
    let mut val = uimm;
    if h.csr_op(m, i >> 20, &mut val, op, write) {
        h.set_x(rd(i), val);
        h.advance_pc(4);
    } else {
        illegal(h, m, i);
    }
}

pub fn csrrw(h: &mut HartState, m: &MachineInner, i: u32) {
    csr_reg(h, m, i, CsrOp::Swap);
}

pub fn csrrs(h: &mut HartState, m: &MachineInner, i: u32) {
    csr_reg(h, m, i, CsrOp::SetBits);
}

pub fn csrrc(h: &mut HartState, m: &MachineInner, i: u32) {
    csr_reg(h, m, i, CsrOp::ClearBits);
}

pub fn csrrwi(h: &mut HartState, m: &MachineInner, i: u32) {
    csr_imm(h, m, i, CsrOp::Swap);
}

pub fn csrrsi(h: &mut HartState, m: &MachineInner, i: u32) {
    csr_imm(h, m, i, CsrOp::SetBits);
}

pub fn csrrci(h: &mut HartState, m: &MachineInner, i: u32) {
    csr_imm(h, m, i, CsrOp::ClearBits);
}

/// funct3 = 0: ecall/ebreak/sret/mret/wfi/sfence.vma.
pub fn system_priv(h: &mut HartState, m: &MachineInner, i: u32) {
    match i >> 25 {
        0x00 => match rs2(i) {
            0 => {
                // Cause 8 + privilege: ECALL_U..ECALL_M.
                h.trap(EXC_ECALL_U + h.prv as u64, 0);
            }
            1 => h.trap(EXC_BREAKPOINT, h.pc),
            _ => illegal(h, m, i),
        },
        0x08 => match rs2(i) {
            2 => {
                if !h.sret() {
                    illegal(h, m, i);
                }
            }
            5 => wfi(h, m, i),
            _ => illegal(h, m, i),
        },
        0x18 => match rs2(i) {
            2 => {
                if !h.mret() {
                    illegal(h, m, i);
                }
            }
            _ => illegal(h, m, i),
        },
        0x09 => sfence_vma(h, m, i),
        _ => illegal(h, m, i),
    }
}

/// WFI: stall until an enabled interrupt is pending. mstatus.TW turns it
/// into an illegal instruction below M-mode. xepc for a subsequent
/// interrupt points past the WFI, so PC is advanced before parking.
fn wfi(h: &mut HartState, m: &MachineInner, i: u32) {
    if h.prv < PrivMode::Machine && h.csr.status & MSTATUS_TW != 0 {
        return illegal(h, m, i);
    }
    h.advance_pc(4);
    h.wfi_wait(m);
    // Unwind to the outer loop so the woken interrupt is delivered there.
    h.shared.wait_event.store(WAIT_STOPPED, Ordering::Release);
}

/// sfence.vma: rs1 selects a single-page or full flush. TVM traps it in
/// S-mode.
fn sfence_vma(h: &mut HartState, m: &MachineInner, i: u32) {
    if h.prv < PrivMode::Supervisor {
        return illegal(h, m, i);
    }
    if h.prv == PrivMode::Supervisor && h.csr.status & MSTATUS_TVM != 0 {
        return illegal(h, m, i);
    }
    let page = if rs1(i) != 0 {
        Some(h.addr(h.x(rs1(i))))
    } else {
        None
    };
    h.advance_pc(4);
    match page {
        Some(vaddr) => h.tlb_flush_page(vaddr),
        None => h.tlb_flush_full(),
    }
}
