//! Trap and interrupt delivery.
//!
//! Synchronous traps use a return-value discipline: any helper that can
//! fault calls [`HartState::trap`] and reports failure, the instruction is
//! abandoned, the dispatch loop unwinds, and the outer loop commits the
//! deferred trap PC. Interrupts are resolved in the outer loop after the
//! pending word is drained into `mip`.

use std::sync::atomic::Ordering;

use crate::csr::{
    PrivMode, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP, MSTATUS_MPRV, MSTATUS_SIE, MSTATUS_SPIE,
    MSTATUS_SPP, MSTATUS_TSR,
};
use crate::hart::{HartState, IRQ_MASK, IRQ_PRIORITY, WAIT_STOPPED};
use crate::machine::MachineInner;

// Synchronous exception causes.
pub const EXC_INSN_MISALIGN: u64 = 0;
pub const EXC_INSN_ACCESS: u64 = 1;
pub const EXC_ILLEGAL_INSN: u64 = 2;
pub const EXC_BREAKPOINT: u64 = 3;
pub const EXC_LOAD_MISALIGN: u64 = 4;
pub const EXC_LOAD_ACCESS: u64 = 5;
pub const EXC_STORE_MISALIGN: u64 = 6;
pub const EXC_STORE_ACCESS: u64 = 7;
pub const EXC_ECALL_U: u64 = 8;
pub const EXC_ECALL_S: u64 = 9;
pub const EXC_ECALL_M: u64 = 11;
pub const EXC_INSN_PAGEFAULT: u64 = 12;
pub const EXC_LOAD_PAGEFAULT: u64 = 13;
pub const EXC_STORE_PAGEFAULT: u64 = 15;

const PRV_U: usize = 0;
const PRV_S: usize = 1;
const PRV_M: usize = 3;

impl HartState {
    /// Interrupt-cause MSB for the current XLEN.
    #[inline]
    fn irq_cause_bit(&self) -> u64 {
        if self.rv64 {
            1 << 63
        } else {
            1 << 31
        }
    }

    /// Switch privilege, flushing cached translations when the M/H ↔ S/U
    /// boundary is crossed (access policy depends on the side).
    pub fn set_prv(&mut self, new: PrivMode) {
        let crossed = self.prv.is_machine_side() != new.is_machine_side();
        self.prv = new;
        if crossed {
            self.tlb.flush_full();
            self.shared.wait_event.store(WAIT_STOPPED, Ordering::Release);
        }
    }

    /// Raise a synchronous trap. `tval` is the faulting address or the
    /// offending instruction bits, per cause.
    pub fn trap(&mut self, cause: u64, tval: u64) {
        self.trap_pending = true;
        if self.user_traps {
            // Userland emulation: record in the U slots, do not switch
            // privilege; the frontend reads the cause and resumes.
            self.csr.cause[PRV_U] = cause;
            self.csr.tval[PRV_U] = tval;
            self.csr.epc[PRV_U] = self.pc;
            self.trap_pc = self.pc;
            self.shared.wait_event.store(WAIT_STOPPED, Ordering::Release);
            return;
        }
        let target = if self.prv <= PrivMode::Supervisor
            && cause < 64
            && (self.csr.edeleg[PRV_M] >> cause) & 1 != 0
        {
            PrivMode::Supervisor
        } else {
            PrivMode::Machine
        };
        self.trap_push(target, cause, tval);
        self.trap_pc = self.addr(self.csr.tvec[target as usize] & !3);
        self.shared.wait_event.store(WAIT_STOPPED, Ordering::Release);
    }

    /// Common privilege-stack push for traps and interrupts. Saves the
    /// current PC as xepc and leaves PC routing to the caller.
    fn trap_push(&mut self, target: PrivMode, cause: u64, tval: u64) {
        let t = target as usize;
        self.csr.epc[t] = self.pc;
        self.csr.cause[t] = cause;
        self.csr.tval[t] = tval;
        let status = self.csr.status;
        match target {
            PrivMode::Machine => {
                let mie = status & MSTATUS_MIE != 0;
                let mut s = status & !(MSTATUS_MPIE | MSTATUS_MIE | MSTATUS_MPP);
                if mie {
                    s |= MSTATUS_MPIE;
                }
                s |= (self.prv as u64) << 11;
                self.csr.status = s;
            }
            _ => {
                let sie = status & MSTATUS_SIE != 0;
                let mut s = status & !(MSTATUS_SPIE | MSTATUS_SIE | MSTATUS_SPP);
                if sie {
                    s |= MSTATUS_SPIE;
                }
                if self.prv != PrivMode::User {
                    s |= MSTATUS_SPP;
                }
                self.csr.status = s;
            }
        }
        self.set_prv(target);
    }

    /// Deliver one pending, enabled, undelegated-or-delegated-to-us
    /// interrupt if the privilege rules allow taking it now.
    pub fn check_interrupts(&mut self, m: &MachineInner) {
        let _ = m;
        let pending = self.shared.ip.load(Ordering::Acquire)
            & self.shared.ie.load(Ordering::Acquire)
            & IRQ_MASK;
        if pending == 0 {
            return;
        }
        for &bit in IRQ_PRIORITY.iter() {
            if pending & (1u64 << bit) == 0 {
                continue;
            }
            let target = if (self.csr.ideleg[PRV_M] >> bit) & 1 != 0 {
                PrivMode::Supervisor
            } else {
                PrivMode::Machine
            };
            let enabled = if target > self.prv {
                true
            } else if target == self.prv {
                let xie = match target {
                    PrivMode::Machine => MSTATUS_MIE,
                    _ => MSTATUS_SIE,
                };
                self.csr.status & xie != 0
            } else {
                false
            };
            if !enabled {
                continue;
            }
            self.deliver_irq(bit as u64, target);
            return;
        }
    }

    /// Take an interrupt immediately: xepc is the PC of the next
    /// not-yet-executed instruction (past a completed WFI).
    fn deliver_irq(&mut self, bit: u64, target: PrivMode) {
        let cause = self.irq_cause_bit() | bit;
        self.trap_push(target, cause, 0);
        let tvec = self.csr.tvec[target as usize];
        let mut pc = tvec & !3;
        if tvec & 1 != 0 {
            pc = pc.wrapping_add(bit << 2);
        }
        self.pc = self.addr(pc);
    }

    /// mret. Returns false to raise illegal-instruction.
    pub fn mret(&mut self) -> bool {
        if self.prv != PrivMode::Machine {
            return false;
        }
        let status = self.csr.status;
        let mpp = PrivMode::from_bits((status & MSTATUS_MPP) >> 11);
        let mut s = status & !(MSTATUS_MIE | MSTATUS_MPP);
        if status & MSTATUS_MPIE != 0 {
            s |= MSTATUS_MIE;
        }
        s |= MSTATUS_MPIE;
        if mpp != PrivMode::Machine {
            s &= !MSTATUS_MPRV;
        }
        self.csr.status = s;
        self.pc = self.addr(self.csr.epc[PRV_M]);
        self.set_prv(mpp);
        true
    }

    /// sret. Illegal below S-mode, and from S-mode when mstatus.TSR is set.
    pub fn sret(&mut self) -> bool {
        if self.prv < PrivMode::Supervisor {
            return false;
        }
        if self.prv == PrivMode::Supervisor && self.csr.status & MSTATUS_TSR != 0 {
            return false;
        }
        let status = self.csr.status;
        let spp = if status & MSTATUS_SPP != 0 {
            PrivMode::Supervisor
        } else {
            PrivMode::User
        };
        let mut s = status & !(MSTATUS_SIE | MSTATUS_SPP);
        if status & MSTATUS_SPIE != 0 {
            s |= MSTATUS_SIE;
        }
        s |= MSTATUS_SPIE;
        if spp != PrivMode::Machine {
            s &= !MSTATUS_MPRV;
        }
        self.csr.status = s;
        self.pc = self.addr(self.csr.epc[PRV_S]);
        self.set_prv(spp);
        true
    }
}
