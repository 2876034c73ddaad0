//! MMIO regions and device dispatch.
//!
//! A region is a half-open physical range served either by a direct host
//! mapping (framebuffer-style, cacheable in the TLB) or by device callbacks
//! with a declared min/max operation size. The region list is mutated only
//! while the machine is paused; harts take the read lock on the slow path.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::fdt::FdtNode;
use crate::machine::MachineInner;
use crate::mmu::{Access, PAGE_MASK, PAGE_SIZE};

/// Attachment-time failures. The device has already been released via its
/// `remove` callback when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum MmioError {
    #[error("mmio region {0:#x}+{1:#x} overlaps RAM or another region")]
    Overlap(u64, u64),
    #[error("invalid op size window {0}..{1}")]
    OpSize(u32, u32),
}

/// Placement and op-size contract of an attached region.
pub struct MmioZone {
    pub base: u64,
    pub size: u64,
    /// Smallest and largest transfer the device accepts, powers of two.
    pub min_op: u32,
    pub max_op: u32,
    pub name: &'static str,
    /// Back-reference for devices that drive machine state (power, IRQs).
    pub machine: Weak<MachineInner>,
}

/// A memory-mapped device. `read`/`write` see `min_op ≤ size ≤ max_op` with
/// `offset` aligned to `size`; false fails the guest access.
pub trait MmioDevice: Send + Sync {
    fn read(&self, zone: &MmioZone, dst: &mut [u8], offset: u64) -> bool;
    fn write(&self, zone: &MmioZone, src: &[u8], offset: u64) -> bool;
    /// Periodic service from the event loop.
    fn update(&self, _zone: &MmioZone) {}
    /// Machine reset.
    fn reset(&self, _zone: &MmioZone) {}
    /// Detach/teardown; release device-held resources.
    fn remove(&self, _zone: &MmioZone) {}
    /// Device-tree node to graft under /soc on reset.
    fn fdt_node(&self, _zone: &MmioZone) -> Option<FdtNode> {
        None
    }
}

/// Raw host memory backing a direct-mapped region. The optional owner keeps
/// an mmap alive for the life of the slot.
pub struct DirectMapping {
    pub ptr: *mut u8,
    pub owner: Option<crate::vma::VmaRegion>,
}

unsafe impl Send for DirectMapping {}
unsafe impl Sync for DirectMapping {}

/// One entry in the machine's region list. A dead slot is the "leftover
/// placeholder" that keeps externally-held handles valid after detach:
/// reads return zeros, writes vanish.
pub struct MmioSlot {
    pub zone: MmioZone,
    pub dev: Option<Arc<dyn MmioDevice>>,
    pub mapping: Option<DirectMapping>,
    pub dead: bool,
}

impl MmioSlot {
    pub fn contains(&self, paddr: u64) -> bool {
        self.zone.size != 0 && paddr.wrapping_sub(self.zone.base) < self.zone.size
    }

    fn overlaps(&self, base: u64, size: u64) -> bool {
        self.zone.size != 0 && base < self.zone.base + self.zone.size && self.zone.base < base + size
    }
}

/// Result of routing a physical access into the region list.
pub enum MmioOutcome {
    /// Served through device callbacks.
    Done,
    /// Served through a direct mapping; `page_host` is set when the whole
    /// covering guest page lies inside the region and may be TLB-cached.
    Direct { page_host: Option<*mut u8> },
    NoRegion,
    DeviceError,
}

pub enum MmioBuf<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// Route one physical access (already page-bounded by the MMU) to the
/// owning region.
pub fn mmio_access(m: &MachineInner, paddr: u64, buf: MmioBuf, access: Access) -> MmioOutcome {
    let slots = m.mmio.read().unwrap();
    let slot = match slots.iter().find(|s| s.contains(paddr)) {
        Some(s) => s,
        None => return MmioOutcome::NoRegion,
    };
    let offset = paddr - slot.zone.base;
    if slot.dead {
        if let MmioBuf::Read(dst) = buf {
            dst.fill(0);
        }
        return MmioOutcome::Done;
    }
    if let Some(mapping) = &slot.mapping {
        let len = match &buf {
            MmioBuf::Read(d) => d.len() as u64,
            MmioBuf::Write(s) => s.len() as u64,
        };
        if offset + len > slot.zone.size {
            return MmioOutcome::DeviceError;
        }
        // SAFETY: the mapping covers the zone; offset+len checked above.
        unsafe {
            let host = mapping.ptr.add(offset as usize);
            match buf {
                MmioBuf::Read(dst) => crate::mmu::ram_copy_out(host, dst),
                MmioBuf::Write(src) => crate::mmu::ram_copy_in(host, src),
            }
        }
        let page_base = paddr & !PAGE_MASK;
        let cacheable = page_base >= slot.zone.base
            && page_base + PAGE_SIZE <= slot.zone.base + slot.zone.size;
        let page_host = if cacheable {
            // SAFETY: whole page inside the mapping.
            Some(unsafe { mapping.ptr.add((page_base - slot.zone.base) as usize) })
        } else {
            None
        };
        return MmioOutcome::Direct { page_host };
    }
    if access == Access::Exec {
        // Instruction fetch only works from memory-like targets.
        return MmioOutcome::DeviceError;
    }
    let Some(dev) = slot.dev.as_ref() else {
        return MmioOutcome::DeviceError;
    };
    let ok = match buf {
        MmioBuf::Read(dst) => fanout_read(dev.as_ref(), &slot.zone, offset, dst),
        MmioBuf::Write(src) => fanout_write(dev.as_ref(), &slot.zone, offset, src),
    };
    if ok {
        MmioOutcome::Done
    } else {
        MmioOutcome::DeviceError
    }
}

fn floor_pow2(x: u64) -> u64 {
    let n = x.next_power_of_two();
    if n == x {
        x
    } else {
        n >> 1
    }
}

/// Split a read into ops the device accepts. Misaligned or sub-min
/// transfers read an aligned window and extract the overlap.
fn fanout_read(dev: &dyn MmioDevice, zone: &MmioZone, mut offset: u64, dst: &mut [u8]) -> bool {
    let (min, max) = (zone.min_op as u64, zone.max_op as u64);
    let mut i = 0usize;
    while i < dst.len() {
        let remaining = (dst.len() - i) as u64;
        let size = floor_pow2(remaining).clamp(min, max);
        if offset & (size - 1) == 0 && size <= remaining {
            if !dev.read(zone, &mut dst[i..i + size as usize], offset) {
                return false;
            }
            i += size as usize;
            offset += size;
        } else {
            let base = offset & !(size - 1);
            let mut tmp = [0u8; 8];
            let window = &mut tmp[..size as usize];
            if !dev.read(zone, window, base) {
                return false;
            }
            let lo = (offset - base) as usize;
            let n = ((size as usize - lo) as u64).min(remaining) as usize;
            dst[i..i + n].copy_from_slice(&window[lo..lo + n]);
            i += n;
            offset += n as u64;
        }
    }
    true
}

/// Split a write like `fanout_read`; misaligned or sub-min transfers become
/// an aligned read-merge-write of one window.
fn fanout_write(dev: &dyn MmioDevice, zone: &MmioZone, mut offset: u64, src: &[u8]) -> bool {
    let (min, max) = (zone.min_op as u64, zone.max_op as u64);
    let mut i = 0usize;
    while i < src.len() {
        let remaining = (src.len() - i) as u64;
        let size = floor_pow2(remaining).clamp(min, max);
        if offset & (size - 1) == 0 && size <= remaining {
            if !dev.write(zone, &src[i..i + size as usize], offset) {
                return false;
            }
            i += size as usize;
            offset += size;
        } else {
            let base = offset & !(size - 1);
            let mut tmp = [0u8; 8];
            let window = &mut tmp[..size as usize];
            if !dev.read(zone, window, base) {
                return false;
            }
            let lo = (offset - base) as usize;
            let n = ((size as usize - lo) as u64).min(remaining) as usize;
            window[lo..lo + n].copy_from_slice(&src[i..i + n]);
            if !dev.write(zone, window, base) {
                return false;
            }
            i += n;
            offset += n as u64;
        }
    }
    true
}

/// Round an op-size window to powers of two, defaulting to 1..8. Returns
/// `None` for an unusable window.
pub fn normalize_ops(min_op: u32, max_op: u32) -> Option<(u32, u32)> {
    let min = if min_op == 0 { 1 } else { min_op.next_power_of_two() };
    let max = if max_op == 0 { 8 } else { max_op.next_power_of_two() };
    let max = max.min(8);
    if min > max {
        return None;
    }
    Some((min, max))
}

/// True if `[base, base+size)` collides with RAM or any live region.
pub fn zone_collides(slots: &[MmioSlot], ram: (u64, u64), base: u64, size: u64) -> bool {
    let (ram_base, ram_size) = ram;
    if base < ram_base + ram_size && ram_base < base + size {
        return true;
    }
    slots.iter().any(|s| s.overlaps(base, size))
}

/// Zone allocator: return `want` if the range is free, otherwise hop to the
/// end of whatever occupies it, until the position is stable.
pub fn zone_auto(slots: &[MmioSlot], ram: (u64, u64), want: u64, size: u64) -> u64 {
    let (ram_base, ram_size) = ram;
    let mut addr = want;
    loop {
        let mut moved = false;
        if addr < ram_base + ram_size && ram_base < addr + size {
            addr = ram_base + ram_size;
            moved = true;
        }
        for s in slots {
            if s.overlaps(addr, size) {
                addr = s.zone.base + s.zone.size;
                moved = true;
            }
        }
        if !moved {
            return addr;
        }
    }
}

impl MachineInner {
    /// Event-loop pass: give every live device its update tick.
    pub fn mmio_update_all(&self) {
        let slots = self.mmio.read().unwrap();
        for s in slots.iter() {
            if !s.dead {
                if let Some(dev) = &s.dev {
                    dev.update(&s.zone);
                }
            }
        }
    }

    /// Reset pass over devices.
    pub fn mmio_reset_all(&self) {
        let slots = self.mmio.read().unwrap();
        for s in slots.iter() {
            if !s.dead {
                if let Some(dev) = &s.dev {
                    dev.reset(&s.zone);
                }
            }
        }
    }

    /// Ask every hart to drop cached translations (used when a direct
    /// mapping goes away).
    pub fn flush_all_tlbs(&self) {
        for hart in &self.harts {
            if let Ok(mut state) = hart.state.try_lock() {
                state.tlb.flush_full();
            }
            hart.shared
                .wait_event
                .store(crate::hart::WAIT_STOPPED, Ordering::Release);
            hart.shared.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every callback it sees.
    struct TraceDev {
        log: Mutex<Vec<(bool, u64, usize)>>,
        mem: Mutex<[u8; 64]>,
    }

    impl TraceDev {
        fn new() -> TraceDev {
            TraceDev {
                log: Mutex::new(Vec::new()),
                mem: Mutex::new([0; 64]),
            }
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

    fn test_zone(min_op: u32, max_op: u32) -> MmioZone {
        MmioZone {
            base: 0x1000_0000,
            size: 0x100,
            min_op,
            max_op,
            name: "trace",
            machine: Weak::new(),
        }
    }

    #[test]
    fn aligned_write_is_one_op() {
        let dev = TraceDev::new();
        let zone = test_zone(1, 4);
        assert!(fanout_write(&dev, &zone, 8, &[1, 2, 3, 4]));
        assert_eq!(*dev.log.lock().unwrap(), vec![(true, 8, 4)]);
    }

    #[test]
    fn misaligned_write_becomes_rmw() {
        // 4-byte store at offset 2 with ops 1..4: an aligned window RMW for
        // the first two bytes, then a direct 2-byte op.
        let dev = TraceDev::new();
        let zone = test_zone(1, 4);
        assert!(fanout_write(&dev, &zone, 2, &[0x44, 0x33, 0x22, 0x11]));
        let log = dev.log.lock().unwrap().clone();
        assert_eq!(log[0], (false, 0, 4));
        assert_eq!(log[1], (true, 0, 4));
        assert_eq!(log[2], (true, 4, 2));
        let mem = dev.mem.lock().unwrap();
        assert_eq!(&mem[2..6], &[0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn sub_min_write_reads_whole_window() {
        // Byte store into a word-only device.
        let dev = TraceDev::new();
        let zone = test_zone(4, 4);
        assert!(fanout_write(&dev, &zone, 5, &[0xAB]));
        let log = dev.log.lock().unwrap().clone();
        assert_eq!(log[0], (false, 4, 4));
        assert_eq!(log[1], (true, 4, 4));
        assert_eq!(dev.mem.lock().unwrap()[5], 0xAB);
    }

    #[test]
    fn zone_auto_skips_occupied_space() {
        let slots = vec![MmioSlot {
            zone: test_zone(1, 4),
            dev: None,
            mapping: None,
            dead: false,
        }];
        let ram = (0x8000_0000, 0x10_0000);
        assert_eq!(zone_auto(&slots, ram, 0x1000_0000, 0x100), 0x1000_0100);
        assert_eq!(zone_auto(&slots, ram, 0x2000_0000, 0x100), 0x2000_0000);
        assert_eq!(zone_auto(&slots, ram, 0x8000_0000, 0x100), 0x8010_0000);
    }

    #[test]
    fn op_normalisation() {
        assert_eq!(normalize_ops(0, 0), Some((1, 8)));
        assert_eq!(normalize_ops(3, 6), Some((4, 8)));
        assert_eq!(normalize_ops(8, 2), None);
    }
}
