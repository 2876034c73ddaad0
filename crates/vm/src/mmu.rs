//! Soft MMU: TLB, page-table walkers, physical routing.
//!
//! The TLB is a direct-mapped cache from virtual page numbers to host
//! pointers with one tag per access lane (R/W/X). Stored pointers are
//! pre-biased by the page's virtual base so the hot path computes the host
//! address as `bias + vaddr` with one add. Guest RAM is touched through
//! per-address atomics sized to the access so aligned 2/4/8-byte transfers
//! are never torn (RVWMO load/store atomicity); everything else degrades to
//! a bytewise copy.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::hart::{HartState, WAIT_RUNNING, WAIT_STOPPED};
use crate::machine::MachineInner;
use crate::mmio::{self, MmioBuf, MmioOutcome};
use crate::trap::{
    EXC_INSN_ACCESS, EXC_INSN_PAGEFAULT, EXC_LOAD_ACCESS, EXC_LOAD_PAGEFAULT, EXC_STORE_ACCESS,
    EXC_STORE_PAGEFAULT,
};

#[cfg(target_endian = "big")]
compile_error!("guest RAM accessors assume a little-endian host");

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

const TLB_SIZE: usize = 256;
const TLB_MASK: u64 = (TLB_SIZE - 1) as u64;
/// Sentinel tag: never equal to any real VPN, non-zero so address 0 misses.
const TAG_INVALID: u64 = u64::MAX;

// Sv PTE bits.
pub const PTE_V: u64 = 1 << 0;
pub const PTE_R: u64 = 1 << 1;
pub const PTE_W: u64 = 1 << 2;
pub const PTE_X: u64 = 1 << 3;
pub const PTE_U: u64 = 1 << 4;
pub const PTE_A: u64 = 1 << 6;
pub const PTE_D: u64 = 1 << 7;

/// Memory access kinds, which double as TLB lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Exec,
}

impl Access {
    fn page_fault(self) -> u64 {
        match self {
            Access::Read => EXC_LOAD_PAGEFAULT,
            Access::Write => EXC_STORE_PAGEFAULT,
            Access::Exec => EXC_INSN_PAGEFAULT,
        }
    }

    fn access_fault(self) -> u64 {
        match self {
            Access::Read => EXC_LOAD_ACCESS,
            Access::Write => EXC_STORE_ACCESS,
            Access::Exec => EXC_INSN_ACCESS,
        }
    }
}

/// Translation failure kinds; mapped to a trap cause by the access kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuFault {
    Page,
    Access,
}

impl MmuFault {
    pub fn cause(self, access: Access) -> u64 {
        match self {
            MmuFault::Page => access.page_fault(),
            MmuFault::Access => access.access_fault(),
        }
    }
}

#[derive(Clone, Copy)]
pub struct TlbEntry {
    pub tag_r: u64,
    pub tag_w: u64,
    pub tag_x: u64,
    /// Host pointer biased by the page's virtual base: host = ptr + vaddr.
    pub ptr: usize,
}

const TLB_ENTRY_INVALID: TlbEntry = TlbEntry {
    tag_r: TAG_INVALID,
    tag_w: TAG_INVALID,
    tag_x: TAG_INVALID,
    ptr: 0,
};

/// Direct-mapped translation cache with per-lane tags.
pub struct Tlb {
    pub entries: Box<[TlbEntry; TLB_SIZE]>,
}

impl Tlb {
    pub fn new() -> Tlb {
        Tlb {
            entries: Box::new([TLB_ENTRY_INVALID; TLB_SIZE]),
        }
    }

    /// Write sentinel tags into every entry. The sentinel is non-zero, so
    /// the zero page keeps missing afterwards.
    pub fn flush_full(&mut self) {
        for e in self.entries.iter_mut() {
            *e = TLB_ENTRY_INVALID;
        }
    }

    /// Invalidate all three lanes of the single entry indexed by `vaddr`.
    pub fn flush_page(&mut self, vaddr: u64) {
        let vpn = vaddr >> PAGE_SHIFT;
        let e = &mut self.entries[(vpn & TLB_MASK) as usize];
        e.tag_r = TAG_INVALID;
        e.tag_w = TAG_INVALID;
        e.tag_x = TAG_INVALID;
    }

    #[inline(always)]
    pub fn entry(&self, vpn: u64) -> TlbEntry {
        self.entries[(vpn & TLB_MASK) as usize]
    }

    /// Install a mapping for the page containing `vaddr`. `page_host` is the
    /// host address of the page start. Lane policy: reads fill R; writes
    /// fill R+W (a write-legal page walk implies readability); exec fills X
    /// and invalidates W (W^X) with the off-by-one tag so other lanes keep
    /// their meaning.
    pub fn put(&mut self, vaddr: u64, page_host: *mut u8, access: Access) {
        let vpn = vaddr >> PAGE_SHIFT;
        let bias = (page_host as usize).wrapping_sub((vaddr & !PAGE_MASK) as usize);
        let e = &mut self.entries[(vpn & TLB_MASK) as usize];
        let same_page =
            e.ptr == bias && (e.tag_r == vpn || e.tag_w == vpn || e.tag_x == vpn);
        if !same_page {
            *e = TLB_ENTRY_INVALID;
            e.ptr = bias;
        }
        match access {
            Access::Read => e.tag_r = vpn,
            Access::Write => {
                e.tag_r = vpn;
                e.tag_w = vpn;
            }
            Access::Exec => {
                e.tag_x = vpn;
                e.tag_w = vpn.wrapping_sub(1);
            }
        }
    }
}

// Relaxed per-address atomic accessors into guest RAM. Unaligned accesses
// fall back to plain unaligned loads/stores; guest software cannot expect
// atomicity there.
macro_rules! host_atomic {
    ($load:ident, $store:ident, $ty:ty, $atomic:ty, $align:expr) => {
        #[inline(always)]
        pub(crate) unsafe fn $load(p: *const u8) -> $ty {
            if $align == 1 || (p as usize) & ($align - 1) == 0 {
                (*(p as *const $atomic)).load(Ordering::Relaxed)
            } else {
                (p as *const $ty).read_unaligned()
            }
        }

        #[inline(always)]
        pub(crate) unsafe fn $store(p: *mut u8, v: $ty) {
            if $align == 1 || (p as usize) & ($align - 1) == 0 {
                (*(p as *const $atomic)).store(v, Ordering::Relaxed)
            } else {
                (p as *mut $ty).write_unaligned(v)
            }
        }
    };
}

host_atomic!(host_load_u8, host_store_u8, u8, AtomicU8, 1);
host_atomic!(host_load_u16, host_store_u16, u16, AtomicU16, 2);
host_atomic!(host_load_u32, host_store_u32, u32, AtomicU32, 4);
host_atomic!(host_load_u64, host_store_u64, u64, AtomicU64, 8);

/// Copy out of RAM preserving single-copy atomicity for aligned pow2 sizes.
pub(crate) unsafe fn ram_copy_out(host: *const u8, dst: &mut [u8]) {
    match dst.len() {
        1 => dst[0] = host_load_u8(host),
        2 if host as usize & 1 == 0 => dst.copy_from_slice(&host_load_u16(host).to_le_bytes()),
        4 if host as usize & 3 == 0 => dst.copy_from_slice(&host_load_u32(host).to_le_bytes()),
        8 if host as usize & 7 == 0 => dst.copy_from_slice(&host_load_u64(host).to_le_bytes()),
        n => std::ptr::copy_nonoverlapping(host, dst.as_mut_ptr(), n),
    }
}

/// Copy into RAM preserving single-copy atomicity for aligned pow2 sizes.
pub(crate) unsafe fn ram_copy_in(host: *mut u8, src: &[u8]) {
    match src.len() {
        1 => host_store_u8(host, src[0]),
        2 if host as usize & 1 == 0 => {
            host_store_u16(host, u16::from_le_bytes(src.try_into().unwrap()))
        }
        4 if host as usize & 3 == 0 => {
            host_store_u32(host, u32::from_le_bytes(src.try_into().unwrap()))
        }
        8 if host as usize & 7 == 0 => {
            host_store_u64(host, u64::from_le_bytes(src.try_into().unwrap()))
        }
        n => std::ptr::copy_nonoverlapping(src.as_ptr(), host, n),
    }
}

macro_rules! impl_load {
    ($name:ident, $ty:ty, $host_load:ident, $sz:expr) => {
        /// Guest load; `None` means the access trapped and the instruction
        /// must be abandoned.
        #[inline(always)]
        pub fn $name(&mut self, m: &MachineInner, vaddr: u64) -> Option<$ty> {
            let vpn = vaddr >> PAGE_SHIFT;
            let e = self.tlb.entry(vpn);
            if e.tag_r == vpn && (vaddr & PAGE_MASK) <= PAGE_SIZE - $sz {
                // SAFETY: a matching R tag guarantees bias+vaddr points at
                // $sz readable bytes of host memory for this guest page.
                return Some(unsafe { $host_load(e.ptr.wrapping_add(vaddr as usize) as *const u8) });
            }
            let mut buf = [0u8; $sz];
            if !self.mem_read_slow(m, vaddr, &mut buf, Access::Read) {
                return None;
            }
            Some(<$ty>::from_le_bytes(buf))
        }
    };
}

macro_rules! impl_store {
    ($name:ident, $ty:ty, $host_store:ident, $sz:expr) => {
        /// Guest store; false means the access trapped.
        #[inline(always)]
        pub fn $name(&mut self, m: &MachineInner, vaddr: u64, v: $ty) -> bool {
            let vpn = vaddr >> PAGE_SHIFT;
            let e = self.tlb.entry(vpn);
            // The W lane alone is not enough: a cleared R lane marks the
            // entry non-cacheable even when writes were permitted.
            if e.tag_w == vpn && e.tag_r == vpn && (vaddr & PAGE_MASK) <= PAGE_SIZE - $sz {
                // SAFETY: matching W+R tags guarantee a writable host range.
                unsafe { $host_store(e.ptr.wrapping_add(vaddr as usize) as *mut u8, v) };
                return true;
            }
            self.mem_write_slow(m, vaddr, &v.to_le_bytes())
        }
    };
}

impl HartState {
    impl_load!(load_u8, u8, host_load_u8, 1);
    impl_load!(load_u16, u16, host_load_u16, 2);
    impl_load!(load_u32, u32, host_load_u32, 4);
    impl_load!(load_u64, u64, host_load_u64, 8);

    impl_store!(store_u8, u8, host_store_u8, 1);
    impl_store!(store_u16, u16, host_store_u16, 2);
    impl_store!(store_u32, u32, host_store_u32, 4);
    impl_store!(store_u64, u64, host_store_u64, 8);

    /// Full TLB flush; also unwinds the dispatch loop so its cached code
    /// page pointer is dropped.
    pub fn tlb_flush_full(&mut self) {
        self.tlb.flush_full();
        self.shared.wait_event.store(WAIT_STOPPED, Ordering::Release);
    }

    /// Single-page flush. The dispatch loop is unwound as well in case the
    /// flushed page is the one currently executing.
    pub fn tlb_flush_page(&mut self, vaddr: u64) {
        self.tlb.flush_page(vaddr);
        self.shared.wait_event.store(WAIT_STOPPED, Ordering::Release);
    }

    /// Effective privilege for data accesses honours mstatus.MPRV.
    fn effective_prv(&self, access: Access) -> crate::csr::PrivMode {
        use crate::csr::{PrivMode, MSTATUS_MPP, MSTATUS_MPRV};
        if access != Access::Exec && self.csr.status & MSTATUS_MPRV != 0 {
            PrivMode::from_bits((self.csr.status & MSTATUS_MPP) >> 11)
        } else {
            self.prv
        }
    }

    /// Translate a virtual address to a guest physical address.
    pub fn translate(&mut self, vaddr: u64, access: Access) -> Result<u64, MmuFault> {
        let eff = self.effective_prv(access);
        if eff.is_machine_side() {
            return Ok(vaddr);
        }
        let satp = self.csr.satp;
        if self.rv64 {
            match satp >> 60 {
                0 => Ok(vaddr),
                8 => self.walk(vaddr, access, eff, 3, 9, 8, 39, satp),
                9 => self.walk(vaddr, access, eff, 4, 9, 8, 48, satp),
                10 => self.walk(vaddr, access, eff, 5, 9, 8, 57, satp),
                _ => Err(MmuFault::Page),
            }
        } else if satp >> 31 != 0 {
            self.walk(vaddr, access, eff, 2, 10, 4, 32, satp)
        } else {
            Ok(vaddr)
        }
    }

    /// Generic Sv32/Sv39/Sv48/Sv57 walker.
    #[allow(clippy::too_many_arguments)]
    fn walk(
        &mut self,
        vaddr: u64,
        access: Access,
        eff: crate::csr::PrivMode,
        levels: u32,
        vpn_bits: u32,
        pte_size: u64,
        va_bits: u32,
        satp: u64,
    ) -> Result<u64, MmuFault> {
        use crate::csr::{PrivMode, MSTATUS_MXR, MSTATUS_SUM};

        if va_bits < 64 && self.rv64 {
            // Virtual address must be the sign extension of its low bits.
            let shift = 64 - va_bits;
            if ((vaddr as i64) << shift >> shift) as u64 != vaddr {
                return Err(MmuFault::Page);
            }
        }

        let satp_ppn_mask = if self.rv64 { (1u64 << 44) - 1 } else { (1u64 << 22) - 1 };
        let mut table = (satp & satp_ppn_mask) << PAGE_SHIFT;
        let idx_mask = (1u64 << vpn_bits) - 1;

        for lvl in (0..levels).rev() {
            let idx = (vaddr >> (PAGE_SHIFT + lvl * vpn_bits)) & idx_mask;
            let pte_addr = table + idx * pte_size;
            if !self.ram.contains(pte_addr, pte_size) {
                return Err(MmuFault::Access);
            }
            // SAFETY: containment checked just above.
            let pte_host = unsafe { self.ram.ptr.add((pte_addr - self.ram.base) as usize) };
            let pte = if pte_size == 8 {
                // SAFETY: PTEs are naturally aligned in valid page tables;
                // host_load falls back to unaligned reads otherwise.
                unsafe { host_load_u64(pte_host) }
            } else {
                unsafe { host_load_u32(pte_host) as u64 }
            };

            if pte & PTE_V == 0 {
                return Err(MmuFault::Page);
            }
            if pte & (PTE_R | PTE_X) == 0 {
                // Non-leaf pointer; W as a pointer bit is malformed.
                if pte & PTE_W != 0 {
                    return Err(MmuFault::Page);
                }
                table = ((pte >> 10) & satp_ppn_mask) << PAGE_SHIFT;
                continue;
            }

            // Leaf. User-bit policy first.
            let user_page = pte & PTE_U != 0;
            match eff {
                PrivMode::User => {
                    if !user_page {
                        return Err(MmuFault::Page);
                    }
                }
                _ => {
                    if user_page
                        && (access == Access::Exec || self.csr.status & MSTATUS_SUM == 0)
                    {
                        return Err(MmuFault::Page);
                    }
                }
            }
            // Requested access bit; MXR lets loads use execute-only leaves.
            let permitted = match access {
                Access::Read => {
                    pte & PTE_R != 0 || (self.csr.status & MSTATUS_MXR != 0 && pte & PTE_X != 0)
                }
                Access::Write => pte & PTE_W != 0,
                Access::Exec => pte & PTE_X != 0,
            };
            if !permitted {
                return Err(MmuFault::Page);
            }
            // Misaligned superpage: PPN bits below this level must be zero.
            let ppn = (pte >> 10) & satp_ppn_mask;
            if lvl > 0 && ppn & ((1u64 << (lvl * vpn_bits)) - 1) != 0 {
                return Err(MmuFault::Page);
            }

            // A (and D on write) via CAS; losing a race to another walker
            // just means the bits are already set.
            let mut new_pte = pte | PTE_A;
            if access == Access::Write {
                new_pte |= PTE_D;
            }
            if new_pte != pte {
                // SAFETY: same in-RAM PTE slot as the load above.
                unsafe {
                    if pte_size == 8 {
                        let a = &*(pte_host as *const AtomicU64);
                        let _ = a.compare_exchange(
                            pte,
                            new_pte,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        );
                    } else {
                        let a = &*(pte_host as *const AtomicU32);
                        let _ = a.compare_exchange(
                            pte as u32,
                            new_pte as u32,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        );
                    }
                }
            }

            let off_mask = (1u64 << (PAGE_SHIFT + lvl * vpn_bits)) - 1;
            return Ok(((ppn << PAGE_SHIFT) & !off_mask) | (vaddr & off_mask));
        }
        // Ran out of levels with a level-0 pointer entry.
        Err(MmuFault::Page)
    }

    /// Slow-path read (or fetch). Splits page-straddling accesses, walks the
    /// page tables, routes to RAM or MMIO, installs TLB entries for
    /// cacheable targets. Returns false after raising the trap.
    pub fn mem_read_slow(
        &mut self,
        m: &MachineInner,
        vaddr: u64,
        dst: &mut [u8],
        access: Access,
    ) -> bool {
        let off = vaddr & PAGE_MASK;
        let len = dst.len() as u64;
        if off + len > PAGE_SIZE {
            let first = (PAGE_SIZE - off) as usize;
            let (a, b) = dst.split_at_mut(first);
            return self.mem_read_slow(m, vaddr, a, access)
                && self.mem_read_slow(m, vaddr + first as u64, b, access);
        }
        let paddr = match self.translate(vaddr, access) {
            Ok(p) => p,
            Err(f) => {
                self.trap(f.cause(access), vaddr);
                return false;
            }
        };
        if self.ram.contains(paddr, len) {
            // SAFETY: RAM is page-aligned and page-sized, so the page base
            // of an in-RAM address is in RAM too.
            let page_host = unsafe {
                self.ram
                    .ptr
                    .add(((paddr & !PAGE_MASK) - self.ram.base) as usize)
            };
            self.tlb.put(vaddr, page_host, access);
            // SAFETY: containment checked above.
            unsafe { ram_copy_out(page_host.add(off as usize), dst) };
            return true;
        }
        match mmio::mmio_access(m, paddr, MmioBuf::Read(dst), access) {
            MmioOutcome::Done => true,
            MmioOutcome::Direct { page_host } => {
                if let Some(page_host) = page_host {
                    self.tlb.put(vaddr, page_host, access);
                }
                true
            }
            MmioOutcome::NoRegion | MmioOutcome::DeviceError => {
                self.trap(access.access_fault(), vaddr);
                false
            }
        }
    }

    /// Slow-path write; mirrors `mem_read_slow` and dirty-marks written RAM
    /// pages for the instruction-translation coherence seam.
    pub fn mem_write_slow(&mut self, m: &MachineInner, vaddr: u64, src: &[u8]) -> bool {
        let off = vaddr & PAGE_MASK;
        let len = src.len() as u64;
        if off + len > PAGE_SIZE {
            let first = (PAGE_SIZE - off) as usize;
            let (a, b) = src.split_at(first);
            return self.mem_write_slow(m, vaddr, a)
                && self.mem_write_slow(m, vaddr + first as u64, b);
        }
        let paddr = match self.translate(vaddr, Access::Write) {
            Ok(p) => p,
            Err(f) => {
                self.trap(f.cause(Access::Write), vaddr);
                return false;
            }
        };
        if self.ram.contains(paddr, len) {
            // SAFETY: as in mem_read_slow.
            let page_host = unsafe {
                self.ram
                    .ptr
                    .add(((paddr & !PAGE_MASK) - self.ram.base) as usize)
            };
            self.tlb.put(vaddr, page_host, Access::Write);
            m.mark_page_dirty(paddr);
            // SAFETY: containment checked above.
            unsafe { ram_copy_in(page_host.add(off as usize), src) };
            return true;
        }
        match mmio::mmio_access(m, paddr, MmioBuf::Write(src), Access::Write) {
            MmioOutcome::Done => true,
            MmioOutcome::Direct { page_host } => {
                if let Some(page_host) = page_host {
                    self.tlb.put(vaddr, page_host, Access::Write);
                }
                true
            }
            MmioOutcome::NoRegion | MmioOutcome::DeviceError => {
                self.trap(EXC_STORE_ACCESS, vaddr);
                false
            }
        }
    }

    /// Host pointer for an atomic memory operation: aligned, writable,
    /// RAM-backed. AMOs aimed at MMIO raise a store access fault.
    pub fn amo_host_ptr(&mut self, m: &MachineInner, vaddr: u64, size: u64) -> Option<*mut u8> {
        let vpn = vaddr >> PAGE_SHIFT;
        let e = self.tlb.entry(vpn);
        if e.tag_w == vpn && e.tag_r == vpn {
            return Some(e.ptr.wrapping_add(vaddr as usize) as *mut u8);
        }
        let paddr = match self.translate(vaddr, Access::Write) {
            Ok(p) => p,
            Err(f) => {
                self.trap(f.cause(Access::Write), vaddr);
                return None;
            }
        };
        if !self.ram.contains(paddr, size) {
            self.trap(EXC_STORE_ACCESS, vaddr);
            return None;
        }
        // SAFETY: containment checked above.
        let page_host = unsafe {
            self.ram
                .ptr
                .add(((paddr & !PAGE_MASK) - self.ram.base) as usize)
        };
        self.tlb.put(vaddr, page_host, Access::Write);
        m.mark_page_dirty(paddr);
        // SAFETY: in-page offset of an in-RAM page.
        Some(unsafe { page_host.add((vaddr & PAGE_MASK) as usize) })
    }

    /// Instruction fetch for the dispatch loop's refill path. Returns the
    /// instruction word plus, when the code page is cacheable, the biased
    /// host pointer and page base for the loop's fast path.
    pub fn fetch_refill(
        &mut self,
        m: &MachineInner,
        pc: u64,
    ) -> Option<(u32, Option<(usize, u64)>)> {
        if (pc & PAGE_MASK) > PAGE_SIZE - 4 {
            // Potential page straddle: fetch compressed-first.
            let mut half = [0u8; 2];
            if !self.mem_read_slow(m, pc, &mut half, Access::Exec) {
                return None;
            }
            let lo = u16::from_le_bytes(half) as u32;
            if lo & 3 != 3 {
                return Some((lo, self.code_page_cache(pc)));
            }
            let mut hi = [0u8; 2];
            if !self.mem_read_slow(m, pc.wrapping_add(2), &mut hi, Access::Exec) {
                return None;
            }
            return Some((lo | (u16::from_le_bytes(hi) as u32) << 16, None));
        }
        let mut word = [0u8; 4];
        if !self.mem_read_slow(m, pc, &mut word, Access::Exec) {
            return None;
        }
        Some((u32::from_le_bytes(word), self.code_page_cache(pc)))
    }

    /// After a successful fetch, expose the TLB's X-lane mapping (installed
    /// by the fetch's own fill) for the dispatch loop locals.
    fn code_page_cache(&self, pc: u64) -> Option<(usize, u64)> {
        let vpn = pc >> PAGE_SHIFT;
        let e = self.tlb.entry(vpn);
        if e.tag_x == vpn {
            Some((e.ptr, pc & !PAGE_MASK))
        } else {
            None
        }
    }

    /// The dispatch loop: run until `wait_event` goes to stopped. Keeps a
    /// host pointer to the current code page and its virtual base so
    /// straight-line execution fetches with one compare and one load.
    pub fn dispatch_loop(&mut self, m: &MachineInner) {
        let mut code: Option<(usize, u64)> = None;
        while self.shared.wait_event.load(Ordering::Acquire) == WAIT_RUNNING {
            self.regs[0] = 0;
            let pc = self.pc;
            let insn = match code {
                Some((bias, base)) if pc.wrapping_sub(base) <= PAGE_SIZE - 4 => {
                    // SAFETY: the cached pointer is valid for this page until
                    // a flush, and every flush unwinds this loop.
                    unsafe { host_load_u32(bias.wrapping_add(pc as usize) as *const u8) }
                }
                _ => match self.fetch_refill(m, pc) {
                    Some((insn, cache)) => {
                        code = cache;
                        insn
                    }
                    None => break,
                },
            };
            crate::interp::dispatch(self, m, insn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_tag_misses_address_zero() {
        let tlb = Tlb::new();
        let e = tlb.entry(0);
        assert_ne!(e.tag_r, 0);
        assert_ne!(e.tag_w, 0);
        assert_ne!(e.tag_x, 0);
    }

    #[test]
    fn exec_install_clears_write_lane() {
        let mut tlb = Tlb::new();
        let page = Box::leak(Box::new([0u8; PAGE_SIZE as usize]));
        let vaddr = 0x4000_1000u64;
        tlb.put(vaddr, page.as_mut_ptr(), Access::Write);
        let vpn = vaddr >> PAGE_SHIFT;
        assert_eq!(tlb.entry(vpn).tag_w, vpn);
        tlb.put(vaddr, page.as_mut_ptr(), Access::Exec);
        let e = tlb.entry(vpn);
        assert_eq!(e.tag_x, vpn);
        assert_eq!(e.tag_w, vpn.wrapping_sub(1));
        // R stays valid: same page, lane untouched.
        assert_eq!(e.tag_r, vpn);
    }

    #[test]
    fn flush_page_clears_one_entry() {
        let mut tlb = Tlb::new();
        let page = Box::leak(Box::new([0u8; PAGE_SIZE as usize]));
        tlb.put(0x1000, page.as_mut_ptr(), Access::Read);
        tlb.put(0x2000, page.as_mut_ptr(), Access::Read);
        tlb.flush_page(0x1000);
        assert_eq!(tlb.entry(0x1).tag_r, TAG_INVALID);
        assert_eq!(tlb.entry(0x2).tag_r, 0x2);
    }
}
