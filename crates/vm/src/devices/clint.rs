//! Core-local interruptor: software IRQs and the machine timer comparators.
//!
//! Layout follows the de-facto SiFive CLINT map: msip words at +0, mtimecmp
//! doublewords at +0x4000, mtime at +0xBFF8. Writes land on the target
//! hart's shared words, so any hart (or the monitor) can interrupt any
//! other.

use log::warn;

use crate::fdt::FdtNode;
use crate::hart::MIP_MSIP;
use crate::mmio::{MmioDevice, MmioZone};

const MSIP_BASE: u64 = 0x0000;
const MTIMECMP_BASE: u64 = 0x4000;
const MTIME: u64 = 0xBFF8;

pub const CLINT_SIZE: u64 = 0x10000;

pub struct Clint;

impl Clint {
    pub fn new() -> Clint {
        Clint
    }
}

impl Default for Clint {
    fn default() -> Clint {
        Clint::new()
    }
}

impl MmioDevice for Clint {
    fn read(&self, zone: &MmioZone, dst: &mut [u8], offset: u64) -> bool {
        let Some(m) = zone.machine.upgrade() else {
            return false;
        };
        let mut value = 0u64;
        if offset >= MTIME {
            value = m.timer.now() >> ((offset - MTIME) * 8);
        } else if offset >= MTIMECMP_BASE {
            let hart = ((offset - MTIMECMP_BASE) / 8) as usize;
            let shift = ((offset - MTIMECMP_BASE) % 8) * 8;
            if let Some(h) = m.harts.get(hart) {
                value = h.shared.mtimecmp.load(std::sync::atomic::Ordering::Relaxed) >> shift;
            }
        } else {
            let hart = ((offset - MSIP_BASE) / 4) as usize;
            if let Some(h) = m.harts.get(hart) {
                let ip = h.shared.ip.load(std::sync::atomic::Ordering::Relaxed);
                value = ((ip & MIP_MSIP) != 0) as u64;
            }
        }
        for (i, b) in dst.iter_mut().enumerate() {
            *b = (value >> (i * 8)) as u8;
        }
        true
    }

    fn write(&self, zone: &MmioZone, src: &[u8], offset: u64) -> bool {
        let Some(m) = zone.machine.upgrade() else {
            return false;
        };
        let mut value = 0u64;
        for (i, b) in src.iter().enumerate() {
            value |= (*b as u64) << (i * 8);
        }
        if offset >= MTIME {
            warn!("clint: guest write to mtime ignored");
        } else if offset >= MTIMECMP_BASE {
            let hart = ((offset - MTIMECMP_BASE) / 8) as usize;
            let shift = ((offset - MTIMECMP_BASE) % 8) * 8;
            let Some(h) = m.harts.get(hart) else {
                return false;
            };
            let old = h.shared.mtimecmp.load(std::sync::atomic::Ordering::Relaxed);
            let mask = if src.len() >= 8 {
                u64::MAX
            } else {
                ((1u64 << (src.len() * 8)) - 1) << shift
            };
            let newv = (old & !mask) | ((value << shift) & mask);
            h.shared
                .mtimecmp
                .store(newv, std::sync::atomic::Ordering::Relaxed);
            // Poke the hart so it re-evaluates MTIP against the new value.
            h.shared.wake();
        } else {
            let hart = ((offset - MSIP_BASE) / 4) as usize;
            let Some(h) = m.harts.get(hart) else {
                return false;
            };
            if value & 1 != 0 {
                h.shared.send_irq(MIP_MSIP);
            } else {
                h.shared.lower_irq(MIP_MSIP);
            }
        }
        true
    }

    fn fdt_node(&self, zone: &MmioZone) -> Option<FdtNode> {
        let Some(m) = zone.machine.upgrade() else {
            return None;
        };
        let mut node = FdtNode::new_reg("clint", zone.base);
        node.prop_str("compatible", "riscv,clint0");
        node.prop_cells(
            "reg",
            &[
                (zone.base >> 32) as u32,
                zone.base as u32,
                (zone.size >> 32) as u32,
                zone.size as u32,
            ],
        );
        let mut ext = Vec::new();
        for &ph in m.intc_phandles() {
            ext.extend_from_slice(&[ph, 3, ph, 7]); // MSIP, MTIP per hart
        }
        node.prop_cells("interrupts-extended", &ext);
        Some(node)
    }
}
