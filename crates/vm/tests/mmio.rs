//! MMIO attach/detach lifecycle and guest-driven device access.

mod common;

use std::sync::{Arc, Mutex, Weak};

use common::*;
use rvbox::mmio::{MmioDevice, MmioZone};

/// Device that records callback shapes and backs them with a byte array.
struct TraceDev {
    log: Mutex<Vec<(bool, u64, usize)>>,
    mem: Mutex<[u8; 256]>,
}

impl TraceDev {
    fn new() -> Arc<TraceDev> {
        Arc::new(TraceDev {
            log: Mutex::new(Vec::new()),
            mem: Mutex::new([0; 256]),
        })
    }
}

impl MmioDevice for TraceDev {
    fn read(&self, _z: &MmioZone, dst: &mut [u8], offset: u64) -> bool {
        self.log.lock().unwrap().push((false, offset, dst.len()));
        let mem = self.mem.lock().unwrap();
        dst.copy_from_slice(&mem[offset as usize..offset as usize + dst.len()]);
        true
    }

    fn write(&self, _z: &MmioZone, src: &[u8], offset: u64) -> bool {
        self.log.lock().unwrap().push((true, offset, src.len()));
        let mut mem = self.mem.lock().unwrap();
        mem[offset as usize..offset as usize + src.len()].copy_from_slice(src);
        true
    }
}

const DEV_BASE: u64 = 0x1000_0000;

#[test]
fn unaligned_guest_store_fans_out_as_rmw() {
    // A 4-byte store at device offset 2 with a 1..4 op window: aligned
    // window RMW for the straddling half, then a direct 2-byte op.
    let m = machine(true, 1);
    let dev = TraceDev::new();
    m.attach_mmio(dev.clone(), DEV_BASE, 0x100, 1, 4, "trace")
        .unwrap();
    m.inner().reset_state().unwrap();

    let inner = m.inner().clone();
    let mut st = inner.harts[0].state.lock().unwrap();
    assert!(st.store_u32(&inner, DEV_BASE + 2, 0x1122_3344));
    drop(st);

    let log = dev.log.lock().unwrap().clone();
    assert_eq!(log[0], (false, 0, 4), "aligned window read");
    assert_eq!(log[1], (true, 0, 4), "merged window write");
    assert_eq!(log[2], (true, 4, 2), "tail writes directly");
    let mem = dev.mem.lock().unwrap();
    assert_eq!(&mem[2..6], &[0x44, 0x33, 0x22, 0x11]);
}

#[test]
fn guest_load_reads_back_device_bytes() {
    let m = machine(true, 1);
    let dev = TraceDev::new();
    dev.mem.lock().unwrap()[8..12].copy_from_slice(&[1, 2, 3, 4]);
    m.attach_mmio(dev, DEV_BASE, 0x100, 1, 4, "trace").unwrap();
    m.inner().reset_state().unwrap();

    let inner = m.inner().clone();
    let mut st = inner.harts[0].state.lock().unwrap();
    assert_eq!(st.load_u32(&inner, DEV_BASE + 8), Some(0x0403_0201));
}

#[test]
fn access_outside_any_region_faults() {
    let m = machine(true, 1);
    m.inner().reset_state().unwrap();
    let inner = m.inner().clone();
    let mut st = inner.harts[0].state.lock().unwrap();
    assert!(!st.store_u32(&inner, 0x4000_0000, 1));
    assert_eq!(
        st.csr.cause[rvbox::csr::PrivMode::Machine as usize],
        7,
        "store access fault"
    );
    assert_eq!(
        st.csr.tval[rvbox::csr::PrivMode::Machine as usize],
        0x4000_0000
    );
}

#[test]
fn overlapping_attach_is_rejected() {
    let m = machine(true, 1);
    let ok = m
        .attach_mmio(TraceDev::new(), DEV_BASE, 0x100, 1, 4, "first")
        .unwrap();
    assert!(m
        .attach_mmio(TraceDev::new(), DEV_BASE + 0x80, 0x100, 1, 4, "second")
        .is_err());
    assert!(m
        .attach_mmio(TraceDev::new(), MEM_BASE, 0x1000, 1, 4, "in-ram")
        .is_err());
    assert_eq!(m.get_mmio(ok), Some((DEV_BASE, 0x100)));
}

#[test]
fn detached_zone_is_reusable_and_handle_stays_valid() {
    let m = machine(true, 1);
    let h = m
        .attach_mmio(TraceDev::new(), DEV_BASE, 0x100, 1, 4, "trace")
        .unwrap();
    assert_eq!(m.mmio_zone_auto(DEV_BASE, 0x100), DEV_BASE + 0x100);

    m.detach_mmio(h);
    // Machine was never powered, so the zone is fully reusable.
    assert_eq!(m.mmio_zone_auto(DEV_BASE, 0x100), DEV_BASE);
    // The stale handle still resolves (to the tombstone).
    assert_eq!(m.get_mmio(h), Some((DEV_BASE, 0)));
}

#[test]
fn detached_region_reads_zero() {
    let m = machine(true, 1);
    let dev = TraceDev::new();
    dev.mem.lock().unwrap()[0] = 0xFF;
    let h = m.attach_mmio(dev, DEV_BASE, 0x100, 1, 4, "trace").unwrap();
    m.inner().reset_state().unwrap();
    // Power the machine notionally on so the tombstone keeps its size.
    m.inner()
        .power
        .store(rvbox::machine::POWER_ON, std::sync::atomic::Ordering::Release);
    m.detach_mmio(h);

    let inner = m.inner().clone();
    let mut st = inner.harts[0].state.lock().unwrap();
    assert_eq!(st.load_u32(&inner, DEV_BASE), Some(0));
    drop(st);
    m.inner()
        .power
        .store(rvbox::machine::POWER_OFF, std::sync::atomic::Ordering::Release);
}

#[test]
fn zone_auto_walks_past_ram_and_regions() {
    let m = machine(true, 1);
    m.attach_mmio(TraceDev::new(), DEV_BASE, 0x1000, 1, 4, "trace")
        .unwrap();
    assert_eq!(m.mmio_zone_auto(DEV_BASE + 0x800, 0x100), DEV_BASE + 0x1000);
    assert_eq!(m.mmio_zone_auto(MEM_BASE + 0x1000, 0x100), MEM_BASE + MEM_SIZE);
}

#[test]
fn uart_transmits_guest_bytes() {
    use rvbox::devices::{uart::UartSink, Ns16550};

    let m = machine(true, 1);
    let uart = Arc::new(Ns16550::new(UartSink::Buffer(Vec::new())));
    m.attach_mmio(uart.clone(), DEV_BASE, 0x100, 1, 1, "uart")
        .unwrap();
    m.inner().reset_state().unwrap();

    let inner = m.inner().clone();
    let mut st = inner.harts[0].state.lock().unwrap();
    for b in b"hi" {
        assert!(st.store_u8(&inner, DEV_BASE, *b));
    }
    drop(st);
    assert_eq!(uart.output(), b"hi");
}

#[test]
fn weak_zone_backref_reaches_the_machine() {
    let m = machine(true, 1);
    struct BackrefDev(Mutex<Option<Weak<rvbox::machine::MachineInner>>>);
    impl MmioDevice for BackrefDev {
        fn read(&self, zone: &MmioZone, dst: &mut [u8], _o: u64) -> bool {
            *self.0.lock().unwrap() = Some(zone.machine.clone());
            dst.fill(0);
            true
        }
        fn write(&self, _z: &MmioZone, _s: &[u8], _o: u64) -> bool {
            true
        }
    }
    let dev = Arc::new(BackrefDev(Mutex::new(None)));
    m.attach_mmio(dev.clone(), DEV_BASE, 0x100, 1, 4, "backref")
        .unwrap();
    m.inner().reset_state().unwrap();

    let inner = m.inner().clone();
    let mut st = inner.harts[0].state.lock().unwrap();
    let _ = st.load_u32(&inner, DEV_BASE);
    drop(st);
    let weak = dev.0.lock().unwrap().clone().unwrap();
    assert!(weak.upgrade().is_some());
}
