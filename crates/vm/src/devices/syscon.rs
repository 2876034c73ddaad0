//! Syscon power control: the QEMU sifive_test register.
//!
//! A single 32-bit register; magic values request power-off or reboot. The
//! event loop carries out the transition.

use log::info;

use crate::fdt::FdtNode;
use crate::machine::{POWER_OFF, POWER_RESET};
use crate::mmio::{MmioDevice, MmioZone};

const TEST_FAIL: u32 = 0x3333;
const TEST_PASS: u32 = 0x5555;
const TEST_RESET: u32 = 0x7777;

pub struct Syscon;

impl Syscon {
    pub fn new() -> Syscon {
        Syscon
    }
}

impl Default for Syscon {
    fn default() -> Syscon {
        Syscon::new()
    }
}

impl MmioDevice for Syscon {
    fn read(&self, _zone: &MmioZone, dst: &mut [u8], _offset: u64) -> bool {
        dst.fill(0);
        true
    }

    fn write(&self, zone: &MmioZone, src: &[u8], offset: u64) -> bool {
        if offset != 0 {
            return true;
        }
        let mut value = 0u32;
        for (i, b) in src.iter().take(4).enumerate() {
            value |= (*b as u32) << (i * 8);
        }
        let Some(m) = zone.machine.upgrade() else {
            return false;
        };
        match value & 0xFFFF {
            TEST_PASS => {
                info!("syscon: guest requested power-off");
                m.request_power(POWER_OFF);
            }
            TEST_FAIL => {
                info!("syscon: guest reported failure {:#x}", value >> 16);
                m.request_power(POWER_OFF);
            }
            TEST_RESET => {
                info!("syscon: guest requested reset");
                m.request_power(POWER_RESET);
            }
            _ => {}
        }
        true
    }

    fn fdt_node(&self, zone: &MmioZone) -> Option<FdtNode> {
        let mut node = FdtNode::new_reg("test", zone.base);
        node.prop_str("compatible", "sifive,test0");
        node.prop_cells(
            "reg",
            &[
                (zone.base >> 32) as u32,
                zone.base as u32,
                (zone.size >> 32) as u32,
                zone.size as u32,
            ],
        );
        Some(node)
    }
}
